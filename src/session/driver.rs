//! Terminal-multiplexer session driver.
//!
//! `SessionDriver` abstracts over tmux so the scheduler and manager can be
//! tested against a scripted double. The driver is a pure wrapper: it knows
//! sessions, not agents.

use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use tokio::process::Command;

use crate::errors::SessionError;
use crate::util::shell_join;

/// Output markers indicating the CLI inside a session finished initializing.
const READY_MARKERS: &[&str] = &["? for shortcuts", "bypass permissions", "\u{256d}"];

const CONFIRM_RETRIES: u32 = 3;
const CONFIRM_POLL: Duration = Duration::from_millis(500);
const READY_POLL: Duration = Duration::from_millis(500);

pub struct SpawnSpec<'a> {
    pub name: &'a str,
    pub work_dir: &'a Path,
    pub argv: Vec<String>,
    /// Delivered as a file-backed positional so multi-line content is not
    /// truncated by keystroke injection.
    pub initial_prompt: Option<&'a str>,
}

#[async_trait]
pub trait SessionDriver: Send + Sync {
    async fn spawn(&self, spec: SpawnSpec<'_>) -> Result<(), SessionError>;

    /// Paste text into the session without a trailing Enter.
    async fn send(&self, name: &str, text: &str) -> Result<(), SessionError>;

    /// Deliver one Enter keypress.
    async fn send_enter(&self, name: &str) -> Result<(), SessionError>;

    /// Send a named key (tmux key syntax, e.g. `BTab`).
    async fn send_key(&self, name: &str, key: &str) -> Result<(), SessionError>;

    /// Like `send`, but poll the pane until the pasted text shows up.
    /// Returns whether the paste was confirmed within the retry budget.
    async fn send_with_confirmation(&self, name: &str, text: &str) -> Result<bool, SessionError>;

    /// Last `lines` rows of the pane buffer as a single string.
    async fn capture(&self, name: &str, lines: u32) -> Result<String, SessionError>;

    async fn kill(&self, name: &str) -> Result<(), SessionError>;

    async fn is_running(&self, name: &str) -> bool;

    async fn list(&self, prefix: &str) -> Result<Vec<String>, SessionError>;

    /// Block until the CLI inside reports it has initialized.
    async fn wait_ready(&self, name: &str, timeout: Duration) -> Result<(), SessionError>;
}

/// Production driver shelling out to tmux.
pub struct TmuxDriver {
    /// Directory for file-backed initial prompts.
    prompts_dir: PathBuf,
}

impl TmuxDriver {
    pub fn new(prompts_dir: &Path) -> Self {
        Self {
            prompts_dir: prompts_dir.to_path_buf(),
        }
    }

    async fn tmux(&self, args: &[&str]) -> Result<std::process::Output, SessionError> {
        Command::new("tmux")
            .args(args)
            .output()
            .await
            .map_err(SessionError::SpawnFailed)
    }

    /// Run tmux and fail on non-zero exit.
    async fn tmux_ok(&self, args: &[&str]) -> Result<(), SessionError> {
        let output = self.tmux(args).await?;
        if !output.status.success() {
            return Err(SessionError::CommandFailed {
                command: args.first().unwrap_or(&"tmux").to_string(),
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }
        Ok(())
    }
}

#[async_trait]
impl SessionDriver for TmuxDriver {
    async fn spawn(&self, spec: SpawnSpec<'_>) -> Result<(), SessionError> {
        let mut command_line = shell_join(&spec.argv);

        if let Some(prompt) = spec.initial_prompt {
            std::fs::create_dir_all(&self.prompts_dir)
                .map_err(SessionError::SpawnFailed)?;
            let prompt_file = self.prompts_dir.join(format!("{}.prompt.md", spec.name));
            std::fs::write(&prompt_file, prompt).map_err(SessionError::SpawnFailed)?;
            command_line.push_str(&format!(" \"$(cat '{}')\"", prompt_file.display()));
        }

        let work_dir = spec.work_dir.to_string_lossy();
        self.tmux_ok(&[
            "new-session",
            "-d",
            "-s",
            spec.name,
            "-c",
            &work_dir,
            &command_line,
        ])
        .await
    }

    async fn send(&self, name: &str, text: &str) -> Result<(), SessionError> {
        self.tmux_ok(&["send-keys", "-t", name, "-l", "--", text]).await
    }

    async fn send_enter(&self, name: &str) -> Result<(), SessionError> {
        self.tmux_ok(&["send-keys", "-t", name, "Enter"]).await
    }

    async fn send_key(&self, name: &str, key: &str) -> Result<(), SessionError> {
        self.tmux_ok(&["send-keys", "-t", name, key]).await
    }

    async fn send_with_confirmation(&self, name: &str, text: &str) -> Result<bool, SessionError> {
        // The sentinel is the head of the pasted text as it will appear in
        // the pane; a short window is enough to confirm delivery.
        let sentinel: String = text.lines().next().unwrap_or("").chars().take(40).collect();

        for _ in 0..CONFIRM_RETRIES {
            self.send(name, text).await?;
            tokio::time::sleep(CONFIRM_POLL).await;
            let buffer = self.capture(name, 50).await?;
            if sentinel.is_empty() || buffer.contains(&sentinel) {
                return Ok(true);
            }
        }
        Ok(false)
    }

    async fn capture(&self, name: &str, lines: u32) -> Result<String, SessionError> {
        let start = format!("-{}", lines);
        let output = self
            .tmux(&["capture-pane", "-t", name, "-p", "-S", &start])
            .await?;
        if !output.status.success() {
            return Err(SessionError::NotFound(name.to_string()));
        }
        Ok(String::from_utf8_lossy(&output.stdout).to_string())
    }

    async fn kill(&self, name: &str) -> Result<(), SessionError> {
        self.tmux_ok(&["kill-session", "-t", name]).await
    }

    async fn is_running(&self, name: &str) -> bool {
        self.tmux(&["has-session", "-t", name])
            .await
            .map(|output| output.status.success())
            .unwrap_or(false)
    }

    async fn list(&self, prefix: &str) -> Result<Vec<String>, SessionError> {
        let output = self
            .tmux(&["list-sessions", "-F", "#{session_name}"])
            .await?;
        // No tmux server means no sessions, not an error.
        if !output.status.success() {
            return Ok(Vec::new());
        }
        Ok(String::from_utf8_lossy(&output.stdout)
            .lines()
            .filter(|line| line.starts_with(prefix))
            .map(str::to_string)
            .collect())
    }

    async fn wait_ready(&self, name: &str, timeout: Duration) -> Result<(), SessionError> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            if let Ok(buffer) = self.capture(name, 50).await
                && READY_MARKERS.iter().any(|m| buffer.contains(m))
            {
                return Ok(());
            }
            if tokio::time::Instant::now() >= deadline {
                return Err(SessionError::NotReady {
                    session: name.to_string(),
                    timeout_ms: timeout.as_millis() as u64,
                });
            }
            tokio::time::sleep(READY_POLL).await;
        }
    }
}
