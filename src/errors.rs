//! Typed error hierarchy for the Hive orchestrator.
//!
//! Three top-level enums cover the three subsystems:
//! - `StoreError` — persistence failures, including corruption detection
//! - `SchedulerError` — assignment invariant violations
//! - `SessionError` — terminal-multiplexer driver failures

use std::path::PathBuf;

use thiserror::Error;

/// Errors from the persistence layer.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error(
        "Database at {0} looks corrupted (non-trivial file with no recorded migrations and \
         empty core tables); a backup may exist at {0}.bak", .path.display()
    )]
    DatabaseCorruption { path: PathBuf },

    #[error("Failed to open database at {}: {source}", .path.display())]
    OpenFailed {
        path: PathBuf,
        #[source]
        source: rusqlite::Error,
    },

    #[error("Migration {name} failed: {source}")]
    MigrationFailed {
        name: String,
        #[source]
        source: rusqlite::Error,
    },

    #[error("Database lock poisoned")]
    LockPoisoned,

    #[error(transparent)]
    Sqlite(#[from] rusqlite::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Errors from the manager singleton lock.
#[derive(Debug, Error)]
pub enum LockError {
    #[error(
        "Another manager holds the lock at {}; if no manager is running, remove the file \
         and retry", .path.display()
    )]
    Contended { path: PathBuf },

    #[error("Failed to create lock file at {}: {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Errors from the scheduler subsystem.
#[derive(Debug, Error)]
pub enum SchedulerError {
    #[error("Circular dependency among stories {remaining:?}")]
    CircularDependency { remaining: Vec<i64> },

    #[error("Team {team_id} has no repository path configured")]
    TeamNotConfigured { team_id: i64 },

    #[error("Failed to spawn {agent_type} agent for team {team_id}: {message}")]
    SpawnFailed {
        agent_type: String,
        team_id: i64,
        message: String,
    },

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Errors from the terminal-multiplexer session driver.
#[derive(Debug, Error)]
pub enum SessionError {
    #[error("Failed to run tmux: {0}")]
    SpawnFailed(#[source] std::io::Error),

    #[error("Session not found: {0}")]
    NotFound(String),

    #[error("Session {session} did not become ready within {timeout_ms}ms")]
    NotReady { session: String, timeout_ms: u64 },

    #[error("tmux {command} exited with an error: {stderr}")]
    CommandFailed { command: String, stderr: String },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn store_error_corruption_mentions_backup() {
        let err = StoreError::DatabaseCorruption {
            path: PathBuf::from("/work/.hive/hive.db"),
        };
        let msg = err.to_string();
        assert!(msg.contains("hive.db.bak"));
        assert!(msg.contains("corrupted"));
    }

    #[test]
    fn lock_error_contended_tells_operator_what_to_remove() {
        let err = LockError::Contended {
            path: PathBuf::from("/work/.hive/manager.lock"),
        };
        assert!(err.to_string().contains("manager.lock"));
        assert!(err.to_string().contains("remove"));
    }

    #[test]
    fn scheduler_error_cycle_carries_story_ids() {
        let err = SchedulerError::CircularDependency {
            remaining: vec![3, 7],
        };
        match &err {
            SchedulerError::CircularDependency { remaining } => {
                assert_eq!(remaining, &vec![3, 7]);
            }
            _ => panic!("Expected CircularDependency"),
        }
    }

    #[test]
    fn session_error_not_ready_carries_timeout() {
        let err = SessionError::NotReady {
            session: "hive-junior-acme-1".to_string(),
            timeout_ms: 30_000,
        };
        assert!(err.to_string().contains("30000ms"));
    }
}
