//! Optional leader/follower gating for multi-node deployments.
//!
//! The manager only consumes the gate: a follower node skips its tick and
//! kills any local tech-lead session so two nodes never plan at once. Leader
//! election and cross-node event shipping live behind this trait.

use async_trait::async_trait;

use anyhow::Result;

use crate::db::DbHandle;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SyncCounters {
    pub local_events_emitted: u64,
    pub imported_events_applied: u64,
    pub merged_duplicate_stories: u64,
}

#[async_trait]
pub trait ClusterSync: Send + Sync {
    fn is_enabled(&self) -> bool;
    fn is_leader(&self) -> bool;
    async fn sync(&self, db: &DbHandle) -> Result<SyncCounters>;
}

/// The shipped default: cluster mode off, this node always leads, sync is
/// a no-op.
#[derive(Default)]
pub struct SingleNode;

#[async_trait]
impl ClusterSync for SingleNode {
    fn is_enabled(&self) -> bool {
        false
    }

    fn is_leader(&self) -> bool {
        true
    }

    async fn sync(&self, _db: &DbHandle) -> Result<SyncCounters> {
        Ok(SyncCounters::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::Store;

    #[tokio::test]
    async fn test_single_node_is_disabled_leader() -> Result<()> {
        let node = SingleNode;
        assert!(!node.is_enabled());
        assert!(node.is_leader());

        let db = DbHandle::new(Store::open_in_memory()?);
        assert_eq!(node.sync(&db).await?, SyncCounters::default());
        Ok(())
    }
}
