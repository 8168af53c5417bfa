//! One-shot assignment pass, triggered by `hive assign` (or whatever
//! cron/CI wrapper an operator puts around it). The manager's tick does not
//! assign; it supervises what this pass has already placed.

use std::path::Path;

use anyhow::Result;

use hive::scheduler::Scheduler;

pub async fn cmd_assign(workspace: &Path) -> Result<()> {
    let ctx = super::CommandContext::load(workspace)?;
    let scheduler = Scheduler::new(
        ctx.db.clone(),
        ctx.driver.clone(),
        ctx.config.clone(),
        ctx.paths.clone(),
    );

    let seniors = scheduler.ensure_senior_capacity().await?;
    if seniors > 0 {
        println!("Spawned {} senior(s) to cover open story points", seniors);
    }

    let report = scheduler.assign_stories().await?;

    println!(
        "Assigned {} stories ({} waiting on dependencies, {} duplicates prevented)",
        console::style(report.assigned.len()).green(),
        report.skipped_dependencies.len(),
        report.prevented_duplicates
    );
    for err in &report.errors {
        println!("  {} {}", console::style("warning:").yellow(), err);
    }
    Ok(())
}
