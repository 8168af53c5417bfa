//! Workspace initialization, repository registration, and requirements.

use std::path::Path;

use anyhow::{Context, Result};

use hive::config::{HiveConfig, WorkspacePaths};
use hive::db::Store;

pub fn cmd_init(workspace: &Path) -> Result<()> {
    let paths = WorkspacePaths::new(workspace);
    std::fs::create_dir_all(&paths.hive_dir).context("Failed to create .hive directory")?;
    std::fs::create_dir_all(paths.prompts_dir()).context("Failed to create prompts directory")?;
    std::fs::create_dir_all(paths.worktrees_dir()).context("Failed to create repos directory")?;

    // Opening creates the schema.
    Store::open(&paths.db_path())?;

    if !paths.config_path().exists() {
        HiveConfig::save_default(&paths)?;
    }

    println!("Initialized hive workspace in {}", paths.hive_dir.display());
    println!("  database: {}", paths.db_path().display());
    println!("  config:   {}", paths.config_path().display());
    Ok(())
}

pub async fn cmd_add_repo(
    workspace: &Path,
    name: &str,
    repo_url: &str,
    repo_path: &str,
) -> Result<()> {
    let ctx = super::CommandContext::load(workspace)?;
    let (name, repo_url, repo_path) = (
        name.to_string(),
        repo_url.to_string(),
        repo_path.to_string(),
    );
    let team = ctx
        .db
        .call(move |store| store.create_team(&name, &repo_url, &repo_path))
        .await?;
    println!(
        "Added team {} ({}) at {}",
        console::style(&team.name).green(),
        team.id,
        team.repo_path
    );
    Ok(())
}

pub async fn cmd_req(
    workspace: &Path,
    text: &str,
    godmode: bool,
    target_branch: &str,
) -> Result<()> {
    let ctx = super::CommandContext::load(workspace)?;

    let teams = ctx.db.call(|store| store.list_teams()).await?;
    if teams.is_empty() {
        anyhow::bail!("No teams configured. Run 'hive add-repo' first.");
    }

    let (title, description) = match text.split_once('\n') {
        Some((title, rest)) => (title.trim().to_string(), rest.trim().to_string()),
        None => (text.trim().to_string(), String::new()),
    };
    let target = target_branch.to_string();
    let requirement = ctx
        .db
        .call(move |store| store.create_requirement(&title, &description, godmode, &target))
        .await?;

    println!(
        "Created requirement #{}: {}{}",
        requirement.id,
        requirement.title,
        if requirement.godmode {
            format!(" {}", console::style("[godmode]").yellow())
        } else {
            String::new()
        }
    );
    println!("The tech lead will plan it into stories.");
    Ok(())
}
