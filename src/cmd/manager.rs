//! Manager daemon commands: start, check, status, stop, nudge.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;

use hive::cluster::SingleNode;
use hive::connectors::NoopConnector;
use hive::lock::{LockOptions, ManagerLock};
use hive::manager::Manager;
use hive::session::{MANAGER_SESSION, SessionDriver};

use super::super::ManagerCommands;

pub async fn cmd_manager(workspace: &Path, command: &ManagerCommands) -> Result<()> {
    match command {
        ManagerCommands::Start => start(workspace, true).await,
        ManagerCommands::Check => start(workspace, false).await,
        ManagerCommands::Status => status(workspace).await,
        ManagerCommands::Stop => stop(workspace).await,
        ManagerCommands::Nudge { session } => nudge(workspace, session).await,
    }
}

/// Run the supervision loop (`daemon = true`) or a single tick.
/// Either way the singleton lock is required.
async fn start(workspace: &Path, daemon: bool) -> Result<()> {
    let ctx = super::CommandContext::load(workspace)?;

    let options = LockOptions {
        stale_ms: ctx.config.manager.lock_stale_ms,
        ..LockOptions::default()
    };
    let lock = ManagerLock::acquire(&ctx.paths.lock_path(), &options)?;

    let mut manager = Manager::new(
        ctx.db.clone(),
        ctx.driver.clone(),
        Arc::new(SingleNode),
        Arc::new(NoopConnector),
        ctx.config.clone(),
        ctx.paths.clone(),
    );

    if daemon {
        manager.run(lock).await
    } else {
        let summary = manager.tick().await;
        println!("{}", summary);
        lock.release();
        Ok(())
    }
}

async fn status(workspace: &Path) -> Result<()> {
    let ctx = super::CommandContext::load(workspace)?;

    let lock_path = ctx.paths.lock_path();
    let session_running = ctx.driver.is_running(MANAGER_SESSION).await;

    match (lock_path.exists(), session_running) {
        (true, true) => println!("{} manager running", console::style("ok").green()),
        (true, false) => println!(
            "{} lock file present but no manager session; remove {} if no manager is running",
            console::style("warning").yellow(),
            lock_path.display()
        ),
        (false, true) => println!(
            "{} manager session is up without a lock; it may be shutting down",
            console::style("warning").yellow()
        ),
        (false, false) => println!("manager not running"),
    }
    Ok(())
}

async fn stop(workspace: &Path) -> Result<()> {
    let ctx = super::CommandContext::load(workspace)?;

    if ctx.driver.is_running(MANAGER_SESSION).await {
        ctx.driver.kill(MANAGER_SESSION).await?;
        println!("Stopped manager session.");
    } else {
        println!("No manager session running.");
    }

    // A clean shutdown removes the lock itself; give it a moment before
    // clearing a leftover.
    let lock_path = ctx.paths.lock_path();
    if lock_path.exists() {
        tokio::time::sleep(Duration::from_millis(500)).await;
        if lock_path.exists() {
            std::fs::remove_file(&lock_path)?;
            println!("Removed stale lock at {}", lock_path.display());
        }
    }
    Ok(())
}

async fn nudge(workspace: &Path, session: &str) -> Result<()> {
    let ctx = super::CommandContext::load(workspace)?;

    if !ctx.driver.is_running(session).await {
        anyhow::bail!("Session {} is not running", session);
    }
    ctx.driver
        .send(session, "Please continue with your current task.")
        .await?;
    ctx.driver.send_enter(session).await?;
    println!("Nudged {}", session);
    Ok(())
}
