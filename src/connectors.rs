//! Issue-tracker connector surface consumed by the core.
//!
//! Concrete connectors (Jira and friends) live outside this crate; the core
//! only needs epic resolution when requirements arrive and fire-and-forget
//! status pushes when stories move.

use async_trait::async_trait;

use anyhow::Result;

use crate::db::models::{Story, StoryStatus};

#[derive(Debug, Clone)]
pub struct Epic {
    pub key: String,
    pub id: String,
    pub title: String,
    pub description: String,
}

#[async_trait]
pub trait ProjectManagementConnector: Send + Sync {
    fn is_epic_url(&self, url: &str) -> bool;

    /// Extract the epic key from a tracker URL, when this connector owns it.
    fn parse_epic_url(&self, url: &str) -> Option<String>;

    async fn fetch_epic(&self, url: &str) -> Result<Epic>;

    /// Push a story transition to the tracker. Callers treat this as
    /// fire-and-forget; failures are logged, never propagated.
    async fn push_story_status(&self, story: &Story, status: StoryStatus) -> Result<()>;
}

/// Connector used when no tracker is configured.
#[derive(Default)]
pub struct NoopConnector;

#[async_trait]
impl ProjectManagementConnector for NoopConnector {
    fn is_epic_url(&self, _url: &str) -> bool {
        false
    }

    fn parse_epic_url(&self, _url: &str) -> Option<String> {
        None
    }

    async fn fetch_epic(&self, url: &str) -> Result<Epic> {
        anyhow::bail!("no issue-tracker connector configured for {}", url)
    }

    async fn push_story_status(&self, _story: &Story, _status: StoryStatus) -> Result<()> {
        Ok(())
    }
}
