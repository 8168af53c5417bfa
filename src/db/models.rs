use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Team {
    pub id: i64,
    pub name: String,
    pub repo_url: String,
    /// Repository checkout relative to the workspace root.
    pub repo_path: String,
    pub created_at: String,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum RequirementStatus {
    Pending,
    Planning,
    Planned,
    InProgress,
    Completed,
    SignOff,
    SignOffFailed,
    SignOffPassed,
}

impl RequirementStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Planning => "planning",
            Self::Planned => "planned",
            Self::InProgress => "in_progress",
            Self::Completed => "completed",
            Self::SignOff => "sign_off",
            Self::SignOffFailed => "sign_off_failed",
            Self::SignOffPassed => "sign_off_passed",
        }
    }

    pub fn from_str(s: &str) -> Result<Self, String> {
        match s {
            "pending" => Ok(Self::Pending),
            "planning" => Ok(Self::Planning),
            "planned" => Ok(Self::Planned),
            "in_progress" => Ok(Self::InProgress),
            "completed" => Ok(Self::Completed),
            "sign_off" => Ok(Self::SignOff),
            "sign_off_failed" => Ok(Self::SignOffFailed),
            "sign_off_passed" => Ok(Self::SignOffPassed),
            _ => Err(format!("Invalid requirement status: {}", s)),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Requirement {
    pub id: i64,
    pub title: String,
    pub description: String,
    pub status: RequirementStatus,
    /// Force the most capable model on every agent derived from this requirement.
    pub godmode: bool,
    pub target_branch: String,
    pub feature_branch: Option<String>,
    pub external_epic_key: Option<String>,
    pub external_epic_id: Option<String>,
    pub external_epic_provider: Option<String>,
    pub created_at: String,
    pub updated_at: String,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum StoryStatus {
    Draft,
    Estimated,
    Planned,
    InProgress,
    Review,
    Qa,
    QaFailed,
    PrSubmitted,
    Merged,
}

impl StoryStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Draft => "draft",
            Self::Estimated => "estimated",
            Self::Planned => "planned",
            Self::InProgress => "in_progress",
            Self::Review => "review",
            Self::Qa => "qa",
            Self::QaFailed => "qa_failed",
            Self::PrSubmitted => "pr_submitted",
            Self::Merged => "merged",
        }
    }

    pub fn from_str(s: &str) -> Result<Self, String> {
        match s {
            "draft" => Ok(Self::Draft),
            "estimated" => Ok(Self::Estimated),
            "planned" => Ok(Self::Planned),
            "in_progress" => Ok(Self::InProgress),
            "review" => Ok(Self::Review),
            "qa" => Ok(Self::Qa),
            "qa_failed" => Ok(Self::QaFailed),
            "pr_submitted" => Ok(Self::PrSubmitted),
            "merged" => Ok(Self::Merged),
            _ => Err(format!("Invalid story status: {}", s)),
        }
    }

    /// A prerequisite in one of these states satisfies a dependency edge.
    /// In-flight work counts: dependents may start once prerequisites are underway.
    pub fn satisfies_dependency(&self) -> bool {
        matches!(
            self,
            Self::InProgress
                | Self::Review
                | Self::Qa
                | Self::QaFailed
                | Self::PrSubmitted
                | Self::Merged
        )
    }

    /// States that count against an agent's queue depth during assignment.
    pub fn counts_toward_queue(&self) -> bool {
        matches!(self, Self::InProgress | Self::Review | Self::Qa | Self::QaFailed)
    }

    /// States that keep the pipeline alive; when no story is in any of these,
    /// the manager spins down non-tech-lead agents.
    pub fn is_active_workflow(&self) -> bool {
        matches!(
            self,
            Self::Planned | Self::InProgress | Self::Review | Self::Qa | Self::QaFailed | Self::PrSubmitted
        )
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Story {
    pub id: i64,
    pub requirement_id: Option<i64>,
    pub team_id: Option<i64>,
    pub title: String,
    pub description: String,
    pub acceptance_criteria: Vec<String>,
    /// Fibonacci-style complexity in [1, 13].
    pub complexity_score: Option<i64>,
    pub story_points: Option<i64>,
    pub status: StoryStatus,
    pub assigned_agent_id: Option<String>,
    pub branch_name: Option<String>,
    pub pr_url: Option<String>,
    pub external_issue_key: Option<String>,
    pub external_issue_id: Option<String>,
    pub external_issue_provider: Option<String>,
    pub created_at: String,
    pub updated_at: String,
}

/// One dependency edge: `story_id` cannot start until `depends_on_story_id`
/// is at least in progress.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct StoryDependency {
    pub story_id: i64,
    pub depends_on_story_id: i64,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum AgentType {
    TechLead,
    Senior,
    Intermediate,
    Junior,
    Qa,
    FeatureTest,
}

impl AgentType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::TechLead => "tech_lead",
            Self::Senior => "senior",
            Self::Intermediate => "intermediate",
            Self::Junior => "junior",
            Self::Qa => "qa",
            Self::FeatureTest => "feature_test",
        }
    }

    pub fn from_str(s: &str) -> Result<Self, String> {
        match s {
            "tech_lead" => Ok(Self::TechLead),
            "senior" => Ok(Self::Senior),
            "intermediate" => Ok(Self::Intermediate),
            "junior" => Ok(Self::Junior),
            "qa" => Ok(Self::Qa),
            "feature_test" => Ok(Self::FeatureTest),
            _ => Err(format!("Invalid agent type: {}", s)),
        }
    }

    /// Session name segment. Same as `as_str` but with dashes, so session
    /// names stay shell-friendly: `hive-tech-lead-acme`.
    pub fn slug(&self) -> &'static str {
        match self {
            Self::TechLead => "tech-lead",
            Self::FeatureTest => "feature-test",
            other => other.as_str(),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum AgentStatus {
    Idle,
    Working,
    Blocked,
    Terminated,
}

impl AgentStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Working => "working",
            Self::Blocked => "blocked",
            Self::Terminated => "terminated",
        }
    }

    pub fn from_str(s: &str) -> Result<Self, String> {
        match s {
            "idle" => Ok(Self::Idle),
            "working" => Ok(Self::Working),
            "blocked" => Ok(Self::Blocked),
            "terminated" => Ok(Self::Terminated),
            _ => Err(format!("Invalid agent status: {}", s)),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Agent {
    /// UUID, assigned at spawn time.
    pub id: String,
    pub agent_type: AgentType,
    pub team_id: Option<i64>,
    pub session_name: Option<String>,
    pub model: String,
    pub status: AgentStatus,
    pub current_story_id: Option<i64>,
    pub worktree_path: Option<String>,
    pub cli_tool: String,
    pub created_at: String,
    pub updated_at: String,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum PrStatus {
    Queued,
    Reviewing,
    Approved,
    Merged,
    Rejected,
    Closed,
}

impl PrStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Queued => "queued",
            Self::Reviewing => "reviewing",
            Self::Approved => "approved",
            Self::Merged => "merged",
            Self::Rejected => "rejected",
            Self::Closed => "closed",
        }
    }

    pub fn from_str(s: &str) -> Result<Self, String> {
        match s {
            "queued" => Ok(Self::Queued),
            "reviewing" => Ok(Self::Reviewing),
            "approved" => Ok(Self::Approved),
            "merged" => Ok(Self::Merged),
            "rejected" => Ok(Self::Rejected),
            "closed" => Ok(Self::Closed),
            _ => Err(format!("Invalid PR status: {}", s)),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PullRequest {
    pub id: i64,
    pub story_id: Option<i64>,
    pub team_id: Option<i64>,
    pub branch_name: String,
    pub pr_number: Option<i64>,
    pub pr_url: Option<String>,
    /// Session name of the submitting agent.
    pub submitted_by: String,
    pub reviewed_by: Option<String>,
    pub status: PrStatus,
    pub review_notes: Option<String>,
    pub created_at: String,
    pub updated_at: String,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum EscalationStatus {
    Pending,
    Acknowledged,
    Resolved,
}

impl EscalationStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Acknowledged => "acknowledged",
            Self::Resolved => "resolved",
        }
    }

    pub fn from_str(s: &str) -> Result<Self, String> {
        match s {
            "pending" => Ok(Self::Pending),
            "acknowledged" => Ok(Self::Acknowledged),
            "resolved" => Ok(Self::Resolved),
            _ => Err(format!("Invalid escalation status: {}", s)),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Escalation {
    pub id: i64,
    pub story_id: Option<i64>,
    pub from_agent_id: Option<String>,
    /// NULL means the escalation targets a human operator.
    pub to_agent_id: Option<String>,
    pub reason: String,
    pub status: EscalationStatus,
    pub resolution: Option<String>,
    pub created_at: String,
    pub updated_at: String,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum MessageStatus {
    Pending,
    Read,
    Replied,
}

impl MessageStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Read => "read",
            Self::Replied => "replied",
        }
    }

    pub fn from_str(s: &str) -> Result<Self, String> {
        match s {
            "pending" => Ok(Self::Pending),
            "read" => Ok(Self::Read),
            "replied" => Ok(Self::Replied),
            _ => Err(format!("Invalid message status: {}", s)),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    pub id: i64,
    pub from_session: String,
    pub to_session: String,
    pub subject: Option<String>,
    pub body: String,
    pub reply: Option<String>,
    pub status: MessageStatus,
    pub created_at: String,
    pub updated_at: String,
}

/// Append-only audit record; one per state-changing action.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventLogEntry {
    pub id: i64,
    pub agent_id: String,
    pub story_id: Option<i64>,
    pub event_type: String,
    pub status: Option<String>,
    pub message: Option<String>,
    pub metadata: Option<serde_json::Value>,
    pub created_at: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn story_status_round_trips() {
        for status in [
            StoryStatus::Draft,
            StoryStatus::Estimated,
            StoryStatus::Planned,
            StoryStatus::InProgress,
            StoryStatus::Review,
            StoryStatus::Qa,
            StoryStatus::QaFailed,
            StoryStatus::PrSubmitted,
            StoryStatus::Merged,
        ] {
            assert_eq!(StoryStatus::from_str(status.as_str()), Ok(status));
        }
        assert!(StoryStatus::from_str("bogus").is_err());
    }

    #[test]
    fn dependency_satisfaction_counts_in_flight_work() {
        assert!(StoryStatus::InProgress.satisfies_dependency());
        assert!(StoryStatus::QaFailed.satisfies_dependency());
        assert!(StoryStatus::Merged.satisfies_dependency());
        assert!(!StoryStatus::Planned.satisfies_dependency());
        assert!(!StoryStatus::Draft.satisfies_dependency());
    }

    #[test]
    fn merged_does_not_count_toward_queue_depth() {
        assert!(StoryStatus::InProgress.counts_toward_queue());
        assert!(StoryStatus::QaFailed.counts_toward_queue());
        assert!(!StoryStatus::Merged.counts_toward_queue());
        assert!(!StoryStatus::PrSubmitted.counts_toward_queue());
    }

    #[test]
    fn agent_type_slug_is_shell_friendly() {
        assert_eq!(AgentType::TechLead.slug(), "tech-lead");
        assert_eq!(AgentType::Junior.slug(), "junior");
        assert_eq!(AgentType::TechLead.as_str(), "tech_lead");
    }
}
