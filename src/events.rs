//! Event types recorded in the append-only audit log.
//!
//! Every state-changing action of the scheduler or manager emits exactly one
//! of these through `Store::create_log`. Rows are never mutated after insert;
//! the log is the ground truth for audit and replay-based debugging.

pub const STORY_ASSIGNED: &str = "STORY_ASSIGNED";
pub const STORY_MERGED: &str = "STORY_MERGED";
pub const STORY_QA_FAILED: &str = "STORY_QA_FAILED";
pub const DUPLICATE_ASSIGNMENT_PREVENTED: &str = "DUPLICATE_ASSIGNMENT_PREVENTED";
pub const AGENT_SPAWNED: &str = "AGENT_SPAWNED";
pub const AGENT_REAPED: &str = "AGENT_REAPED";
pub const AGENT_SPUN_DOWN: &str = "AGENT_SPUN_DOWN";
pub const TEAM_SCALED_DOWN: &str = "TEAM_SCALED_DOWN";
pub const WORKTREE_REMOVAL_FAILED: &str = "WORKTREE_REMOVAL_FAILED";
pub const ESCALATION: &str = "ESCALATION";
pub const ESCALATION_RESOLVED: &str = "ESCALATION_RESOLVED";
pub const PR_SYNC_SKIPPED: &str = "PR_SYNC_SKIPPED";
pub const PR_MERGED: &str = "PR_MERGED";
pub const NUDGE_SENT: &str = "NUDGE_SENT";
