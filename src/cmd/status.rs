//! Workspace status and story listings.

use std::path::Path;

use anyhow::Result;
use serde_json::json;

use hive::db::models::{AgentStatus, StoryStatus};

pub async fn cmd_status(workspace: &Path, as_json: bool) -> Result<()> {
    let ctx = super::CommandContext::load(workspace)?;

    let (teams, stories, agents, requirements) = ctx
        .db
        .call(|store| {
            Ok((
                store.list_teams()?,
                store.list_stories()?,
                store.list_active_agents()?,
                store.list_requirements()?,
            ))
        })
        .await?;

    if as_json {
        let payload = json!({
            "teams": teams,
            "requirements": requirements,
            "stories": stories,
            "agents": agents,
        });
        println!("{}", serde_json::to_string_pretty(&payload)?);
        return Ok(());
    }

    println!();
    println!("Teams: {}", teams.len());
    for team in &teams {
        let team_stories = stories.iter().filter(|s| s.team_id == Some(team.id)).count();
        println!("  {:<20} {} stories", team.name, team_stories);
    }

    println!();
    println!("Stories:");
    for status in [
        StoryStatus::Planned,
        StoryStatus::InProgress,
        StoryStatus::Qa,
        StoryStatus::QaFailed,
        StoryStatus::PrSubmitted,
        StoryStatus::Merged,
    ] {
        let count = stories.iter().filter(|s| s.status == status).count();
        if count > 0 {
            println!("  {:<14} {}", status.as_str(), count);
        }
    }

    println!();
    println!("Agents:");
    for agent in &agents {
        let state = match agent.status {
            AgentStatus::Working => console::style(agent.status.as_str()).green(),
            AgentStatus::Blocked => console::style(agent.status.as_str()).red(),
            _ => console::style(agent.status.as_str()).dim(),
        };
        println!(
            "  {:<12} {:<28} {}",
            agent.agent_type.as_str(),
            agent.session_name.as_deref().unwrap_or("-"),
            state
        );
    }
    println!();
    Ok(())
}

pub async fn cmd_stories(workspace: &Path, status_filter: Option<&str>) -> Result<()> {
    let ctx = super::CommandContext::load(workspace)?;

    let filter = status_filter
        .map(|s| StoryStatus::from_str(s).map_err(|e| anyhow::anyhow!(e)))
        .transpose()?;
    let stories = ctx
        .db
        .call(move |store| match filter {
            Some(status) => store.list_stories_by_status(status),
            None => store.list_stories(),
        })
        .await?;

    if stories.is_empty() {
        println!("No stories.");
        return Ok(());
    }

    println!(
        "{:<6} {:<14} {:<6} {:<10} Title",
        "Id", "Status", "Cx", "Agent"
    );
    for story in stories {
        println!(
            "{:<6} {:<14} {:<6} {:<10} {}",
            story.id,
            story.status.as_str(),
            story
                .complexity_score
                .map(|c| c.to_string())
                .unwrap_or_else(|| "-".to_string()),
            story
                .assigned_agent_id
                .as_deref()
                .map(|id| &id[..id.len().min(8)])
                .unwrap_or("-"),
            story.title
        );
    }
    Ok(())
}
