//! CLI command implementations.
//!
//! Each submodule owns one or more related `Commands` variants:
//!
//! | Module    | Commands handled                          |
//! |-----------|-------------------------------------------|
//! | `project` | `Init`, `AddRepo`, `Req`                  |
//! | `status`  | `Status`, `Stories`                       |
//! | `assign`  | `Assign`                                  |
//! | `msg`     | `Msg`, `Escalations`                      |
//! | `manager` | `Manager`                                 |

pub mod assign;
pub mod manager;
pub mod msg;
pub mod project;
pub mod status;

pub use assign::cmd_assign;
pub use manager::cmd_manager;
pub use msg::{cmd_escalations, cmd_msg};
pub use project::{cmd_add_repo, cmd_init, cmd_req};
pub use status::{cmd_status, cmd_stories};

use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};

use hive::config::{HiveConfig, WorkspacePaths};
use hive::db::{DbHandle, Store};
use hive::session::TmuxDriver;

/// Shared context for commands operating on an initialized workspace.
pub struct CommandContext {
    pub paths: WorkspacePaths,
    pub config: HiveConfig,
    pub db: DbHandle,
    pub driver: Arc<TmuxDriver>,
}

impl CommandContext {
    pub fn load(workspace: &Path) -> Result<Self> {
        let paths = WorkspacePaths::new(workspace);
        if !paths.hive_dir.exists() {
            anyhow::bail!(
                "No workspace found at {}. Run 'hive init' first.",
                paths.hive_dir.display()
            );
        }
        let config = HiveConfig::load(&paths)?;
        let store = Store::open_with_retry(&paths.db_path())
            .context("Failed to open the hive database")?;
        let driver = Arc::new(TmuxDriver::new(&paths.prompts_dir()));
        Ok(Self {
            paths,
            config,
            db: DbHandle::new(store),
            driver,
        })
    }
}
