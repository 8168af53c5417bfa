//! Agent sessions: the tmux driver, the pane-buffer classifier, and the
//! CLI runtime command builder.

pub mod classifier;
pub mod driver;
#[cfg(test)]
pub mod fake;

use std::time::Duration;

pub use classifier::{AgentState, Classification, classify};
pub use driver::{SessionDriver, SpawnSpec, TmuxDriver};

use crate::config::{ModelTierConfig, SafetyMode};

/// Every session the orchestrator owns carries this prefix.
pub const SESSION_PREFIX: &str = "hive-";
/// The manager daemon's own session; excluded from supervision.
pub const MANAGER_SESSION: &str = "hive-manager";

const BYPASS_RETRIES: u32 = 3;
const BYPASS_SETTLE: Duration = Duration::from_millis(300);
/// tmux name for shift+tab, which cycles the CLI's permission mode.
const MODE_CYCLE_KEY: &str = "BTab";
const BYPASS_MARKER: &str = "bypass permissions";

/// Build the argv for an agent CLI from its tier config.
pub fn build_spawn_command(tier: &ModelTierConfig, model_override: Option<&str>) -> Vec<String> {
    let model = model_override.unwrap_or(&tier.model);
    let mut argv = vec![
        tier.cli_tool.clone(),
        "--model".to_string(),
        model.to_string(),
    ];
    if tier.safety_mode == SafetyMode::Bypass {
        argv.push("--dangerously-skip-permissions".to_string());
    }
    argv
}

/// Cycle the session's CLI into bypass-permissions mode, confirming from the
/// pane buffer. Bounded retries; returns whether the mode was confirmed.
pub async fn force_bypass_mode(driver: &dyn SessionDriver, session: &str) -> bool {
    for attempt in 0..BYPASS_RETRIES {
        if driver.send_key(session, MODE_CYCLE_KEY).await.is_err() {
            return false;
        }
        tokio::time::sleep(BYPASS_SETTLE).await;
        match driver.capture(session, 50).await {
            Ok(buffer) if buffer.to_lowercase().contains(BYPASS_MARKER) => return true,
            Ok(_) => {
                tracing::debug!(session, attempt, "bypass mode not confirmed, retrying");
            }
            Err(_) => return false,
        }
    }
    false
}

/// Markers meaning the session left bypass mode and needs it re-enforced.
pub fn needs_bypass_enforcement(buffer: &str) -> bool {
    let lower = buffer.to_lowercase();
    lower.contains("plan mode on")
        || lower.contains("safe mode on")
        || classifier::classify(buffer).state == AgentState::PermissionRequired
}
