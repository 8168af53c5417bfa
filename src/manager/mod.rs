//! The manager daemon: a singleton supervision loop over all agent sessions.
//!
//! Each tick runs the steps below in order; every step is individually
//! error-wrapped so one failure never aborts the tick, and the next tick
//! retries.
//!
//! | # | Step                                                        |
//! |---|-------------------------------------------------------------|
//! | 1 | Cluster gate (followers skip supervision)                   |
//! | 2 | Backfill PR numbers from stored URLs                        |
//! | 3 | Health check + orphan recovery                              |
//! | 4 | QA scaling to pending review load                           |
//! | 5 | Auto-merge approved PRs                                     |
//! | 6 | Sync merged PRs from the code host                          |
//! | 7 | Sync open code-host PRs into the local queue                |
//! | 8 | Per-session: forward messages, classify, enforce bypass,    |
//! |   | auto-approve, escalate, auto-resolve, nudge                 |
//! | 9 | Notify QA sessions of waiting reviews                       |
//! |10 | Fan out PR rejections to stories and submitters             |
//! |11 | Remind developers of QA-failed rework                       |
//! |12 | Spin down agents whose stories merged                       |
//! |13 | Spin down everything when the pipeline is empty             |
//! |14 | Remind assignees of stuck stories                           |
//! |15 | Tell seniors about unassigned planned stories               |
//! |16 | Emit a one-line counter summary                             |

pub mod session_state;

use std::collections::HashSet;
use std::sync::Arc;
use std::sync::LazyLock;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use regex::Regex;

use crate::cluster::ClusterSync;
use crate::codehost::{CodeHostGateway, MergeStrategy};
use crate::config::{HiveConfig, WorkspacePaths};
use crate::connectors::ProjectManagementConnector;
use crate::db::DbHandle;
use crate::db::models::*;
use crate::events;
use crate::lock::ManagerLock;
use crate::messaging::MessageService;
use crate::scheduler::Scheduler;
use crate::session::{
    AgentState, MANAGER_SESSION, SESSION_PREFIX, SessionDriver, classify, force_bypass_mode,
    needs_bypass_enforcement,
};

use session_state::SessionTracker;

/// Window in which a session is not re-escalated.
const ESCALATION_WINDOW_MINUTES: i64 = 30;
/// Age after which an `in_progress` story earns a reminder.
const STUCK_STORY_MINUTES: i64 = 30;
const CAPTURE_LINES: u32 = 50;
const MERGED_PR_SYNC_LIMIT: u32 = 50;

static STORY_BRANCH: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"(?i)story-(\d+)").unwrap());

/// Story id referenced by a branch name, e.g. `feature/STORY-12-login`.
pub fn story_id_from_branch(branch: &str) -> Option<i64> {
    STORY_BRANCH
        .captures(branch)
        .and_then(|caps| caps.get(1))
        .and_then(|m| m.as_str().parse().ok())
}

#[derive(Debug, Default)]
pub struct TickSummary {
    pub follower: bool,
    pub backfilled: usize,
    pub reaped: usize,
    pub revived: usize,
    pub orphaned_recovered: usize,
    pub qa_spawned: u32,
    pub qa_terminated: u32,
    pub prs_merged: u32,
    pub stories_merged: u32,
    pub prs_synced: u32,
    pub messages_forwarded: u32,
    pub auto_approved: u32,
    pub escalations: u32,
    pub auto_resolved: u32,
    pub nudges: u32,
    pub rejections: u32,
    pub spun_down: u32,
    pub errors: Vec<String>,
}

impl std::fmt::Display for TickSummary {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.follower {
            return write!(f, "follower node, supervision skipped");
        }
        write!(
            f,
            "reaped={} revived={} orphaned={} qa=+{}/-{} merged={} synced={} fwd={} \
             approved={} escalated={} resolved={} nudges={} rejections={} spun_down={} errors={}",
            self.reaped,
            self.revived,
            self.orphaned_recovered,
            self.qa_spawned,
            self.qa_terminated,
            self.stories_merged,
            self.prs_synced,
            self.messages_forwarded,
            self.auto_approved,
            self.escalations,
            self.auto_resolved,
            self.nudges,
            self.rejections,
            self.spun_down,
            self.errors.len(),
        )
    }
}

fn nudge_text(agent_type: Option<AgentType>) -> &'static str {
    match agent_type {
        Some(AgentType::Junior) => {
            "You appear idle. Continue your assigned story; if you are blocked, message \
             your senior with a specific question instead of waiting."
        }
        Some(AgentType::Intermediate) | Some(AgentType::Senior) => {
            "You appear idle. Continue your assigned story or pick up the next acceptance \
             criterion; open the PR when the story is done."
        }
        Some(AgentType::Qa) => {
            "You appear idle. Check the review queue and continue reviewing pending pull requests."
        }
        Some(AgentType::TechLead) => {
            "You appear idle. Check for requirements awaiting planning and break them into stories."
        }
        Some(AgentType::FeatureTest) => {
            "You appear idle. Continue exercising the merged features and report regressions."
        }
        None => "You appear idle. Continue your current task.",
    }
}

pub struct Manager {
    db: DbHandle,
    driver: Arc<dyn SessionDriver>,
    scheduler: Scheduler,
    gateway: CodeHostGateway,
    cluster: Arc<dyn ClusterSync>,
    connector: Arc<dyn ProjectManagementConnector>,
    messages: MessageService,
    config: HiveConfig,
    paths: WorkspacePaths,
    tracker: SessionTracker,
}

impl Manager {
    pub fn new(
        db: DbHandle,
        driver: Arc<dyn SessionDriver>,
        cluster: Arc<dyn ClusterSync>,
        connector: Arc<dyn ProjectManagementConnector>,
        config: HiveConfig,
        paths: WorkspacePaths,
    ) -> Self {
        let scheduler = Scheduler::new(db.clone(), driver.clone(), config.clone(), paths.clone());
        let messages = MessageService::new(db.clone());
        Self {
            db,
            driver,
            scheduler,
            gateway: CodeHostGateway::new(),
            cluster,
            connector,
            messages,
            config,
            paths,
            tracker: SessionTracker::new(),
        }
    }

    /// Run the supervision loop until SIGINT/SIGTERM, then release the lock.
    pub async fn run(mut self, lock: ManagerLock) -> Result<()> {
        let period = Duration::from_millis(self.config.manager.slow_poll_interval_ms.max(1000));
        let mut interval = tokio::time::interval(period);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        let mut sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .context("Failed to install SIGTERM handler")?;
        let mut sigint = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::interrupt())
            .context("Failed to install SIGINT handler")?;

        tracing::info!(period_ms = period.as_millis() as u64, "manager started");
        loop {
            tokio::select! {
                _ = interval.tick() => {
                    let summary = self.tick().await;
                    tracing::info!(%summary, "tick complete");
                }
                _ = sigterm.recv() => break,
                _ = sigint.recv() => break,
            }
        }

        tracing::info!("manager shutting down");
        lock.release();
        Ok(())
    }

    /// One supervision pass. Never fails; step errors are collected into
    /// the summary.
    pub async fn tick(&mut self) -> TickSummary {
        let mut summary = TickSummary::default();

        // 1. Cluster gate.
        if self.cluster.is_enabled() {
            if let Err(err) = self.cluster.sync(&self.db).await {
                note(&mut summary, "cluster_sync", &err);
            }
            if !self.cluster.is_leader() {
                tracing::info!("not the cluster leader; standing by");
                self.kill_local_tech_leads().await;
                summary.follower = true;
                return summary;
            }
        }

        // 2. PR number backfill (idempotent).
        match self.db.call(|store| store.backfill_pr_numbers()).await {
            Ok(count) => summary.backfilled = count,
            Err(err) => note(&mut summary, "backfill_pr_numbers", &err),
        }

        // 3. Health check and orphan recovery.
        match self.scheduler.health_check().await {
            Ok(report) => {
                if !report.reaped.is_empty() || !report.orphaned_recovered.is_empty() {
                    tracing::info!(
                        reaped = report.reaped.len(),
                        revived = report.revived.len(),
                        orphaned = report.orphaned_recovered.len(),
                        "health check reconciled agents"
                    );
                }
                summary.reaped = report.reaped.len();
                summary.revived = report.revived.len();
                summary.orphaned_recovered = report.orphaned_recovered.len();
            }
            Err(err) => note(&mut summary, "health_check", &err),
        }

        // 4. QA scaling.
        match self.scheduler.check_merge_queue().await {
            Ok(report) => {
                summary.qa_spawned = report.spawned;
                summary.qa_terminated = report.terminated;
            }
            Err(err) => note(&mut summary, "check_merge_queue", &err),
        }

        // 5. Auto-merge approved PRs.
        if let Err(err) = self.auto_merge_approved(&mut summary).await {
            note(&mut summary, "auto_merge_approved", &err);
        }

        // 6. Merged PRs on the code host drive stories to merged.
        if let Err(err) = self.sync_merged_prs(&mut summary).await {
            note(&mut summary, "sync_merged_prs", &err);
        }

        // 7. Open PRs on the code host enter the local queue.
        if let Err(err) = self.sync_open_prs(&mut summary).await {
            note(&mut summary, "sync_open_prs", &err);
        }

        // 8. Per-session supervision.
        if let Err(err) = self.scan_sessions(&mut summary).await {
            note(&mut summary, "scan_sessions", &err);
        }

        // 9. QA notification.
        if let Err(err) = self.notify_qa_of_queue().await {
            note(&mut summary, "notify_qa", &err);
        }

        // 10. Rejected PRs.
        if let Err(err) = self.process_rejections(&mut summary).await {
            note(&mut summary, "process_rejections", &err);
        }

        // 11. QA-failed rework reminders.
        if let Err(err) = self.remind_qa_failed().await {
            note(&mut summary, "remind_qa_failed", &err);
        }

        // 12. Spin down agents whose stories merged.
        if let Err(err) = self.spin_down_merged(&mut summary).await {
            note(&mut summary, "spin_down_merged", &err);
        }

        // 13. Pipeline-empty spin-down.
        if let Err(err) = self.spin_down_idle_pipeline(&mut summary).await {
            note(&mut summary, "spin_down_idle_pipeline", &err);
        }

        // 14. Stuck stories.
        if let Err(err) = self.remind_stuck_stories().await {
            note(&mut summary, "remind_stuck_stories", &err);
        }

        // 15. Unassigned planned stories.
        if let Err(err) = self.notify_seniors_of_backlog().await {
            note(&mut summary, "notify_seniors", &err);
        }

        summary
    }

    async fn kill_local_tech_leads(&self) {
        let sessions = self
            .driver
            .list(&format!("{}tech-lead", SESSION_PREFIX))
            .await
            .unwrap_or_default();
        for session in sessions {
            tracing::info!(%session, "follower node killing local tech lead");
            let _ = self.driver.kill(&session).await;
        }
    }

    // ── PR reconciliation ─────────────────────────────────────────────

    async fn auto_merge_approved(&self, summary: &mut TickSummary) -> Result<()> {
        let approved = self
            .db
            .call(|store| store.list_pull_requests_by_status(PrStatus::Approved))
            .await?;

        for pr in approved {
            let Some(number) = pr.pr_number else {
                tracing::debug!(pr = pr.id, "approved PR has no number yet; skipping merge");
                continue;
            };
            let Some(repo_dir) = self.team_repo_dir(pr.team_id).await? else {
                continue;
            };

            if self
                .gateway
                .merge_pr(&repo_dir, number, MergeStrategy::Squash)
                .await
            {
                let pr_id = pr.id;
                let submitted_by = pr.submitted_by.clone();
                let story_id = pr.story_id;
                self.db
                    .call(move |store| {
                        store.with_transaction(|s| {
                            s.update_pull_request_status(pr_id, PrStatus::Merged)?;
                            s.create_log(
                                &submitted_by,
                                story_id,
                                events::PR_MERGED,
                                Some(PrStatus::Merged.as_str()),
                                Some(&format!("auto-merged PR #{}", number)),
                                None,
                            )?;
                            Ok(())
                        })
                    })
                    .await?;
                summary.prs_merged += 1;
            }
        }
        Ok(())
    }

    async fn sync_merged_prs(&self, summary: &mut TickSummary) -> Result<()> {
        let teams = self.db.call(|store| store.list_teams()).await?;
        for team in teams {
            let repo_dir = self.paths.root.join(&team.repo_path);
            let merged = self
                .gateway
                .list_merged_prs(&repo_dir, None, MERGED_PR_SYNC_LIMIT)
                .await;

            for pr in merged {
                let story_id = match self.resolve_story_for_branch(&pr.head_ref_name).await? {
                    Some(id) => id,
                    None => continue,
                };
                let story = self
                    .db
                    .call(move |store| store.get_story(story_id))
                    .await?;
                let Some(story) = story else { continue };
                if story.status == StoryStatus::Merged {
                    continue;
                }

                let agent_id = story.assigned_agent_id.clone().unwrap_or_else(|| "codehost".into());
                self.db
                    .call(move |store| {
                        store.with_transaction(|s| {
                            s.update_story_status(story_id, StoryStatus::Merged)?;
                            s.clear_story_assignment(story_id, StoryStatus::Merged)?;
                            s.create_log(
                                &agent_id,
                                Some(story_id),
                                events::STORY_MERGED,
                                Some(StoryStatus::Merged.as_str()),
                                None,
                                None,
                            )?;
                            Ok(())
                        })
                    })
                    .await?;
                summary.stories_merged += 1;

                self.complete_requirement_if_done(&story).await?;

                // Fire-and-forget tracker push.
                let connector = Arc::clone(&self.connector);
                tokio::spawn(async move {
                    if let Err(err) = connector.push_story_status(&story, StoryStatus::Merged).await
                    {
                        tracing::debug!(%err, "issue tracker push failed");
                    }
                });
            }
        }
        Ok(())
    }

    /// Requirements complete when every derived story has merged.
    async fn complete_requirement_if_done(&self, story: &Story) -> Result<()> {
        let Some(requirement_id) = story.requirement_id else {
            return Ok(());
        };
        self.db
            .call(move |store| {
                let stories = store.list_stories_by_requirement(requirement_id)?;
                let all_merged =
                    !stories.is_empty() && stories.iter().all(|s| s.status == StoryStatus::Merged);
                if all_merged {
                    store.update_requirement_status(requirement_id, RequirementStatus::Completed)?;
                }
                Ok(())
            })
            .await
    }

    async fn sync_open_prs(&self, summary: &mut TickSummary) -> Result<()> {
        let teams = self.db.call(|store| store.list_teams()).await?;
        for team in teams {
            let repo_dir = self.paths.root.join(&team.repo_path);
            let team_id = team.id;
            let open = self.gateway.list_open_prs(&repo_dir, None).await;

            for pr in open {
                if let Some(max_age_days) = self.config.manager.pr_max_age_days
                    && pr_age_days(&pr.created_at).map(|d| d > max_age_days).unwrap_or(false)
                {
                    tracing::debug!(number = pr.number, "skipping PR older than max age");
                    continue;
                }

                let branch = pr.head_ref_name.clone();
                let existing = self
                    .db
                    .call(move |store| store.find_pull_request_by_branch(&branch))
                    .await?;
                if existing.is_some() {
                    continue;
                }

                let story_id = self.resolve_story_for_branch(&pr.head_ref_name).await?;
                let story = match story_id {
                    Some(id) => self.db.call(move |store| store.get_story(id)).await?,
                    None => None,
                };
                let skip_reason = match &story {
                    None => Some("branch references no known story"),
                    Some(story) if story.status == StoryStatus::Merged => {
                        Some("story already merged")
                    }
                    Some(_) => None,
                };
                if let Some(reason) = skip_reason {
                    let branch = pr.head_ref_name.clone();
                    let reason = reason.to_string();
                    self.db
                        .call(move |store| {
                            store.create_log(
                                "manager",
                                story_id,
                                events::PR_SYNC_SKIPPED,
                                None,
                                Some(&reason),
                                Some(&serde_json::json!({ "branch": branch })),
                            )
                        })
                        .await?;
                    continue;
                }

                let head_ref = pr.head_ref_name.clone();
                let url = pr.url.clone();
                let number = pr.number;
                self.db
                    .call(move |store| {
                        store.create_pull_request(
                            story_id,
                            Some(team_id),
                            &head_ref,
                            "codehost",
                            Some(number),
                            Some(&url),
                        )
                    })
                    .await?;
                if let Some(id) = story_id {
                    self.db
                        .call(move |store| store.update_story_status(id, StoryStatus::Qa))
                        .await?;
                }
                summary.prs_synced += 1;
            }
        }
        Ok(())
    }

    /// Story referenced by a branch: the canonical `STORY-n` marker first,
    /// then the local PR queue.
    async fn resolve_story_for_branch(&self, branch: &str) -> Result<Option<i64>> {
        if let Some(id) = story_id_from_branch(branch) {
            return Ok(Some(id));
        }
        let branch = branch.to_string();
        let pr = self
            .db
            .call(move |store| store.find_pull_request_by_branch(&branch))
            .await?;
        Ok(pr.and_then(|p| p.story_id))
    }

    // ── Session supervision ───────────────────────────────────────────

    async fn scan_sessions(&mut self, summary: &mut TickSummary) -> Result<()> {
        let sessions = self.driver.list(SESSION_PREFIX).await.unwrap_or_default();
        let live: HashSet<String> = sessions.iter().cloned().collect();
        self.tracker.retain_sessions(&live);

        for session in sessions {
            if session == MANAGER_SESSION {
                continue;
            }
            if let Err(err) = self.supervise_session(&session, summary).await {
                tracing::warn!(%session, err = %format!("{err:#}"), "session supervision failed");
            }
        }
        Ok(())
    }

    async fn supervise_session(&mut self, session: &str, summary: &mut TickSummary) -> Result<()> {
        summary.messages_forwarded += self.forward_messages(session).await?;

        let buffer = match self.driver.capture(session, CAPTURE_LINES).await {
            Ok(buffer) => buffer,
            // Died between list and capture; the next health check reaps it.
            Err(_) => return Ok(()),
        };
        let classification = classify(&buffer);
        let now = Instant::now();
        self.tracker.observe(session, classification.state, now);

        let session_owner = session.to_string();
        let agent = self
            .db
            .call(move |store| store.find_agent_by_session(&session_owner))
            .await?;

        if needs_bypass_enforcement(&buffer) || classification.state == AgentState::PlanApproval {
            force_bypass_mode(self.driver.as_ref(), session).await;
        }

        if classification.state == AgentState::PermissionRequired {
            // The highlighted default on permission prompts is "yes".
            self.driver.send_enter(session).await?;
            summary.auto_approved += 1;
        }

        if classification.needs_human {
            summary.escalations += self.maybe_escalate(session, agent.as_ref()).await?;
        }

        if !classification.is_waiting
            && let Some(agent) = agent.as_ref()
        {
            summary.auto_resolved += self.auto_resolve(agent).await?;
        }

        let waiting = classification.is_waiting && classification.state != AgentState::Thinking;
        if waiting
            && self.tracker.should_nudge(
                session,
                now,
                Duration::from_millis(self.config.manager.stuck_threshold_ms),
                Duration::from_millis(self.config.manager.nudge_cooldown_ms),
            )
        {
            // Re-capture before nudging: the agent may have resumed since
            // the scan started, and interrupting active work is worse than
            // a missed nudge.
            let fresh = self.driver.capture(session, CAPTURE_LINES).await?;
            let fresh_class = classify(&fresh);
            if fresh_class.is_waiting && fresh_class.state != AgentState::Thinking {
                let text = nudge_text(agent.as_ref().map(|a| a.agent_type));
                self.driver.send(session, text).await?;
                self.driver.send_enter(session).await?;
                self.tracker.record_nudge(session, now);
                summary.nudges += 1;

                let agent_id = agent
                    .as_ref()
                    .map(|a| a.id.clone())
                    .unwrap_or_else(|| session.to_string());
                let state = fresh_class.state.as_str();
                let story_id = agent.as_ref().and_then(|a| a.current_story_id);
                self.db
                    .call(move |store| {
                        store.create_log(
                            &agent_id,
                            story_id,
                            events::NUDGE_SENT,
                            Some(state),
                            None,
                            None,
                        )
                    })
                    .await?;
            }
        }

        Ok(())
    }

    /// Deliver pending messages into the recipient session; mark read in a
    /// second batch only after confirmed delivery.
    async fn forward_messages(&self, session: &str) -> Result<u32> {
        let pending = self.messages.inbox(session, false).await?;
        if pending.is_empty() {
            return Ok(0);
        }

        let mut delivered_ids = Vec::new();
        for message in &pending {
            let rendered = match &message.subject {
                Some(subject) => format!(
                    "Message from {} [{}]: {}",
                    message.from_session, subject, message.body
                ),
                None => format!("Message from {}: {}", message.from_session, message.body),
            };
            match self.driver.send_with_confirmation(session, &rendered).await {
                Ok(true) => {
                    let _ = self.driver.send_enter(session).await;
                    delivered_ids.push(message.id);
                }
                Ok(false) => {
                    tracing::warn!(session, message = message.id, "message delivery unconfirmed");
                }
                Err(err) => {
                    tracing::warn!(session, message = message.id, %err, "message delivery failed");
                    break;
                }
            }
        }

        let count = delivered_ids.len() as u32;
        self.db
            .call(move |store| {
                for id in delivered_ids {
                    store.mark_message_read(id)?;
                }
                Ok(())
            })
            .await?;
        Ok(count)
    }

    /// Escalate to a human unless this session escalated recently.
    async fn maybe_escalate(&self, session: &str, agent: Option<&Agent>) -> Result<u32> {
        let agent_key = agent
            .map(|a| a.id.clone())
            .unwrap_or_else(|| session.to_string());

        let key = agent_key.clone();
        let recent = self
            .db
            .call(move |store| store.has_recent_escalation_from(&key, ESCALATION_WINDOW_MINUTES))
            .await?;
        if recent {
            return Ok(0);
        }

        self.messages
            .escalate(
                agent.and_then(|a| a.current_story_id),
                Some(&agent_key),
                None,
                &format!("session {} is waiting for human input", session),
            )
            .await?;

        let reminder = "A human has been notified of your question. While you wait, continue \
                        any part of your story that is not blocked on the answer.";
        if self.driver.send_with_confirmation(session, reminder).await? {
            let _ = self.driver.send_enter(session).await;
        }
        Ok(1)
    }

    /// Resolve this agent's open escalations once it is no longer waiting.
    async fn auto_resolve(&self, agent: &Agent) -> Result<u32> {
        let agent_id = agent.id.clone();
        let open = self
            .db
            .call(move |store| store.pending_escalations_from(&agent_id))
            .await?;
        let mut resolved = 0;
        for escalation in open {
            self.messages
                .resolve(escalation.id, "agent left the waiting state")
                .await?;
            resolved += 1;
        }
        Ok(resolved)
    }

    // ── Queue fan-out ─────────────────────────────────────────────────

    async fn notify_qa_of_queue(&self) -> Result<()> {
        let waiting = self
            .db
            .call(|store| {
                let queued = store.list_pull_requests_by_status(PrStatus::Queued)?.len();
                let reviewing = store.list_pull_requests_by_status(PrStatus::Reviewing)?.len();
                Ok(queued + reviewing)
            })
            .await?;
        if waiting == 0 {
            return Ok(());
        }

        let qa_sessions: Vec<String> = self
            .db
            .call(|store| store.list_active_agents())
            .await?
            .into_iter()
            .filter(|a| a.agent_type == AgentType::Qa)
            .filter_map(|a| a.session_name)
            .collect();

        for session in qa_sessions {
            if !self.driver.is_running(&session).await {
                continue;
            }
            let text = format!("{} pull requests are waiting for review.", waiting);
            if self.driver.send_with_confirmation(&session, &text).await? {
                let _ = self.driver.send_enter(&session).await;
            }
        }
        Ok(())
    }

    /// Rejected PRs: story to `qa_failed`, submitter notified, PR closed so
    /// the same rejection is announced exactly once.
    async fn process_rejections(&self, summary: &mut TickSummary) -> Result<()> {
        let rejected = self
            .db
            .call(|store| store.list_pull_requests_by_status(PrStatus::Rejected))
            .await?;

        for pr in rejected {
            let pr_id = pr.id;
            let story_id = pr.story_id;
            let submitted_by = pr.submitted_by.clone();
            self.db
                .call(move |store| {
                    store.with_transaction(|s| {
                        if let Some(story_id) = story_id {
                            s.update_story_status(story_id, StoryStatus::QaFailed)?;
                            s.create_log(
                                &submitted_by,
                                Some(story_id),
                                events::STORY_QA_FAILED,
                                Some(StoryStatus::QaFailed.as_str()),
                                None,
                                None,
                            )?;
                        }
                        s.update_pull_request_status(pr_id, PrStatus::Closed)?;
                        Ok(())
                    })
                })
                .await?;
            summary.rejections += 1;

            if self.driver.is_running(&pr.submitted_by).await {
                let notes = pr.review_notes.as_deref().unwrap_or("no notes provided");
                let text = format!(
                    "Your PR for branch {} was rejected in review: {}. Rework the story and resubmit.",
                    pr.branch_name, notes
                );
                if self
                    .driver
                    .send_with_confirmation(&pr.submitted_by, &text)
                    .await?
                {
                    let _ = self.driver.send_enter(&pr.submitted_by).await;
                }
            }
        }
        Ok(())
    }

    /// Remind developers of outstanding rework, but never interrupt one
    /// mid-thought.
    async fn remind_qa_failed(&self) -> Result<()> {
        let failed = self
            .db
            .call(|store| store.list_stories_by_status(StoryStatus::QaFailed))
            .await?;

        for story in failed {
            let Some(agent_id) = story.assigned_agent_id.clone() else {
                continue;
            };
            let agent = self.db.call(move |store| store.get_agent(&agent_id)).await?;
            let Some(session) = agent.and_then(|a| a.session_name) else {
                continue;
            };
            let Ok(buffer) = self.driver.capture(&session, CAPTURE_LINES).await else {
                continue;
            };
            let classification = classify(&buffer);
            if !classification.is_waiting || classification.state == AgentState::Thinking {
                continue;
            }

            let text = format!(
                "Story #{} ({}) failed QA and is waiting for rework.",
                story.id, story.title
            );
            if self.driver.send_with_confirmation(&session, &text).await? {
                let _ = self.driver.send_enter(&session).await;
            }
        }
        Ok(())
    }

    // ── Spin-down ─────────────────────────────────────────────────────

    async fn spin_down_merged(&self, summary: &mut TickSummary) -> Result<()> {
        let finished: Vec<Story> = self
            .db
            .call(|store| store.list_stories_by_status(StoryStatus::Merged))
            .await?
            .into_iter()
            .filter(|s| s.assigned_agent_id.is_some())
            .collect();

        for story in finished {
            let agent_id = story.assigned_agent_id.clone().unwrap_or_default();
            let lookup = agent_id.clone();
            let agent = self.db.call(move |store| store.get_agent(&lookup)).await?;

            if let Some(agent) = agent {
                if let Some(session) = &agent.session_name
                    && self.driver.is_running(session).await
                {
                    let text = format!(
                        "Story #{} ({}) has merged. Great work; this session is being retired.",
                        story.id, story.title
                    );
                    let _ = self.driver.send_with_confirmation(session, &text).await;
                    let _ = self.driver.send_enter(session).await;
                }
                self.scheduler.terminate_agent(&agent).await?;
                summary.spun_down += 1;
            }

            let story_id = story.id;
            self.db
                .call(move |store| {
                    store.clear_story_assignment(story_id, StoryStatus::Merged)
                })
                .await?;
        }
        Ok(())
    }

    /// With nothing left in the workflow, only the tech lead stays up.
    async fn spin_down_idle_pipeline(&self, summary: &mut TickSummary) -> Result<()> {
        let active = self
            .db
            .call(|store| store.count_active_workflow_stories())
            .await?;
        if active > 0 {
            return Ok(());
        }

        let agents = self.db.call(|store| store.list_active_agents()).await?;
        for agent in agents {
            if agent.agent_type == AgentType::TechLead || agent.status != AgentStatus::Working {
                continue;
            }
            self.scheduler.terminate_agent(&agent).await?;
            summary.spun_down += 1;
        }
        Ok(())
    }

    // ── Reminders ─────────────────────────────────────────────────────

    async fn remind_stuck_stories(&self) -> Result<()> {
        let stale = self
            .db
            .call(|store| store.list_stale_in_progress(STUCK_STORY_MINUTES))
            .await?;

        for story in stale {
            let Some(agent_id) = story.assigned_agent_id.clone() else {
                continue;
            };
            let agent = self.db.call(move |store| store.get_agent(&agent_id)).await?;
            let Some(session) = agent.and_then(|a| a.session_name) else {
                continue;
            };
            if !self.driver.is_running(&session).await {
                continue;
            }
            let text = format!(
                "Story #{} ({}) has been in progress for a while. Post a status update, or \
                 escalate if you are blocked.",
                story.id, story.title
            );
            if self.driver.send_with_confirmation(&session, &text).await? {
                let _ = self.driver.send_enter(&session).await;
            }
        }
        Ok(())
    }

    async fn notify_seniors_of_backlog(&self) -> Result<()> {
        let unassigned = self
            .db
            .call(|store| store.list_stories_by_status(StoryStatus::Planned))
            .await?
            .into_iter()
            .filter(|s| s.assigned_agent_id.is_none())
            .count();
        if unassigned == 0 {
            return Ok(());
        }

        let senior_sessions: Vec<String> = self
            .db
            .call(|store| store.list_active_agents())
            .await?
            .into_iter()
            .filter(|a| a.agent_type == AgentType::Senior)
            .filter_map(|a| a.session_name)
            .collect();

        for session in senior_sessions {
            let Ok(buffer) = self.driver.capture(&session, CAPTURE_LINES).await else {
                continue;
            };
            let classification = classify(&buffer);
            if !classification.is_waiting || classification.state == AgentState::Thinking {
                continue;
            }
            let text = format!("{} planned stories are waiting for assignment.", unassigned);
            if self.driver.send_with_confirmation(&session, &text).await? {
                let _ = self.driver.send_enter(&session).await;
            }
        }
        Ok(())
    }

    async fn team_repo_dir(&self, team_id: Option<i64>) -> Result<Option<std::path::PathBuf>> {
        let Some(team_id) = team_id else {
            return Ok(None);
        };
        let team = self.db.call(move |store| store.get_team(team_id)).await?;
        Ok(team.map(|t| self.paths.root.join(t.repo_path)))
    }
}

fn note(summary: &mut TickSummary, step: &str, err: &anyhow::Error) {
    tracing::warn!(step, err = %format!("{err:#}"), "tick step failed");
    summary.errors.push(step.to_string());
}

fn pr_age_days(created_at: &str) -> Option<i64> {
    let created = chrono::DateTime::parse_from_rfc3339(created_at).ok()?;
    Some((chrono::Utc::now() - created.with_timezone(&chrono::Utc)).num_days())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::{SingleNode, SyncCounters};
    use crate::connectors::NoopConnector;
    use crate::db::{NewStory, Store};
    use crate::session::fake::FakeDriver;
    use async_trait::async_trait;

    struct FollowerNode;

    #[async_trait]
    impl ClusterSync for FollowerNode {
        fn is_enabled(&self) -> bool {
            true
        }
        fn is_leader(&self) -> bool {
            false
        }
        async fn sync(&self, _db: &DbHandle) -> Result<SyncCounters> {
            Ok(SyncCounters::default())
        }
    }

    fn manager_with(
        cluster: Arc<dyn ClusterSync>,
        config: HiveConfig,
    ) -> (Manager, DbHandle, Arc<FakeDriver>, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let db = DbHandle::new(Store::open_in_memory().unwrap());
        let driver = Arc::new(FakeDriver::new());
        let manager = Manager::new(
            db.clone(),
            driver.clone(),
            cluster,
            Arc::new(NoopConnector),
            config,
            WorkspacePaths::new(dir.path()),
        );
        (manager, db, driver, dir)
    }

    fn quick_nudge_config() -> HiveConfig {
        let mut config = HiveConfig::default();
        config.manager.stuck_threshold_ms = 0;
        config.manager.nudge_cooldown_ms = 60 * 60 * 1000;
        config
    }

    async fn seed_agent(
        db: &DbHandle,
        driver: &FakeDriver,
        id: &str,
        agent_type: AgentType,
        session: &str,
        buffer: &str,
    ) {
        let agent = Agent {
            id: id.to_string(),
            agent_type,
            team_id: None,
            session_name: Some(session.to_string()),
            model: "sonnet".to_string(),
            status: AgentStatus::Working,
            current_story_id: None,
            worktree_path: None,
            cli_tool: "claude".to_string(),
            created_at: String::new(),
            updated_at: String::new(),
        };
        db.call(move |store| store.insert_agent(&agent)).await.unwrap();
        driver.add_session(session, buffer);
    }

    /// Keeps the pipeline non-empty so step 13 does not spin agents down
    /// underneath supervision-focused tests.
    async fn seed_open_story(db: &DbHandle) {
        db.call(|store| {
            store.create_story(&NewStory {
                title: "Keepalive".to_string(),
                status: Some(StoryStatus::Planned),
                ..Default::default()
            })?;
            Ok(())
        })
        .await
        .unwrap();
    }

    #[test]
    fn test_story_id_from_branch() {
        assert_eq!(story_id_from_branch("feature/STORY-12-login"), Some(12));
        assert_eq!(story_id_from_branch("story-7"), Some(7));
        assert_eq!(story_id_from_branch("agent/3f9a"), None);
    }

    #[tokio::test]
    async fn test_follower_skips_tick_and_kills_tech_lead() {
        let (mut manager, _db, driver, _dir) =
            manager_with(Arc::new(FollowerNode), HiveConfig::default());
        driver.add_session("hive-tech-lead-acme", "> ");
        driver.add_session("hive-junior-acme-1", "> waiting");

        let summary = manager.tick().await;
        assert!(summary.follower);
        assert_eq!(summary.nudges, 0);
        assert_eq!(driver.killed_sessions(), vec!["hive-tech-lead-acme".to_string()]);
    }

    #[tokio::test]
    async fn test_nudge_once_per_tick_and_cooldown() {
        let (mut manager, db, driver, _dir) =
            manager_with(Arc::new(SingleNode), quick_nudge_config());
        seed_open_story(&db).await;
        seed_agent(
            &db,
            &driver,
            "jr",
            AgentType::Junior,
            "hive-junior-acme-1",
            "done for now\n> continue when ready",
        )
        .await;

        let summary = manager.tick().await;
        assert_eq!(summary.nudges, 1);
        let sent = driver.sent_to("hive-junior-acme-1");
        assert_eq!(
            sent.iter().filter(|t| t.contains("You appear idle")).count(),
            1
        );
        assert!(driver.enters_sent("hive-junior-acme-1") >= 1);

        // Second tick inside the cooldown: no second nudge.
        let summary = manager.tick().await;
        assert_eq!(summary.nudges, 0);
    }

    #[tokio::test]
    async fn test_thinking_session_is_never_nudged() {
        let (mut manager, db, driver, _dir) =
            manager_with(Arc::new(SingleNode), quick_nudge_config());
        seed_open_story(&db).await;
        seed_agent(
            &db,
            &driver,
            "jr",
            AgentType::Junior,
            "hive-junior-acme-1",
            "✻ Working… (esc to interrupt)",
        )
        .await;

        let summary = manager.tick().await;
        assert_eq!(summary.nudges, 0);
        assert!(driver.sent_to("hive-junior-acme-1").is_empty());
    }

    #[tokio::test]
    async fn test_rejection_cycle_notifies_once() {
        let (mut manager, db, driver, _dir) =
            manager_with(Arc::new(SingleNode), HiveConfig::default());
        driver.add_session("hive-senior-acme", "$ cargo test\nrunning");

        let (story_id, _pr_id) = db
            .call(|store| {
                let team = store.create_team("acme", "url", "repos/app")?;
                let story = store.create_story(&NewStory {
                    team_id: Some(team.id),
                    title: "Login".to_string(),
                    complexity_score: Some(5),
                    status: Some(StoryStatus::PrSubmitted),
                    ..Default::default()
                })?;
                let pr = store.create_pull_request(
                    Some(story.id),
                    Some(team.id),
                    "story-1-login",
                    "hive-senior-acme",
                    Some(7),
                    None,
                )?;
                store.update_pull_request_status(pr.id, PrStatus::Rejected)?;
                Ok((story.id, pr.id))
            })
            .await
            .unwrap();

        let summary = manager.tick().await;
        assert_eq!(summary.rejections, 1);

        let story = db
            .call(move |store| store.get_story(story_id))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(story.status, StoryStatus::QaFailed);

        let rejected_notes: Vec<String> = driver
            .sent_to("hive-senior-acme")
            .into_iter()
            .filter(|t| t.contains("rejected"))
            .collect();
        assert_eq!(rejected_notes.len(), 1);

        let events_list = db.call(|store| store.list_events(30)).await.unwrap();
        assert!(events_list.iter().any(|e| e.event_type == events::STORY_QA_FAILED));

        // Second tick: the PR is closed, nothing new is announced.
        let summary = manager.tick().await;
        assert_eq!(summary.rejections, 0);
        let rejected_notes: Vec<String> = driver
            .sent_to("hive-senior-acme")
            .into_iter()
            .filter(|t| t.contains("rejected"))
            .collect();
        assert_eq!(rejected_notes.len(), 1);
    }

    #[tokio::test]
    async fn test_needs_human_escalates_once_per_window() {
        let (mut manager, db, driver, _dir) =
            manager_with(Arc::new(SingleNode), HiveConfig::default());
        seed_open_story(&db).await;
        seed_agent(
            &db,
            &driver,
            "sr",
            AgentType::Senior,
            "hive-senior-acme",
            "Could you clarify which auth provider to use?",
        )
        .await;

        let summary = manager.tick().await;
        assert_eq!(summary.escalations, 1);

        let pending = db
            .call(|store| store.list_escalations_by_status(EscalationStatus::Pending))
            .await
            .unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].from_agent_id.as_deref(), Some("sr"));
        assert!(pending[0].to_agent_id.is_none());

        // Still waiting next tick: gated by the recency window.
        let summary = manager.tick().await;
        assert_eq!(summary.escalations, 0);
    }

    #[tokio::test]
    async fn test_escalation_auto_resolves_when_agent_resumes() {
        let (mut manager, db, driver, _dir) =
            manager_with(Arc::new(SingleNode), HiveConfig::default());
        seed_open_story(&db).await;
        seed_agent(
            &db,
            &driver,
            "sr",
            AgentType::Senior,
            "hive-senior-acme",
            "running tests...",
        )
        .await;
        db.call(|store| {
            store.create_escalation(None, Some("sr"), None, "was waiting on input")?;
            Ok(())
        })
        .await
        .unwrap();

        let summary = manager.tick().await;
        assert_eq!(summary.auto_resolved, 1);
        let pending = db
            .call(|store| store.list_escalations_by_status(EscalationStatus::Pending))
            .await
            .unwrap();
        assert!(pending.is_empty());
    }

    #[tokio::test]
    async fn test_message_forwarding_marks_read() {
        let (mut manager, db, driver, _dir) =
            manager_with(Arc::new(SingleNode), HiveConfig::default());
        seed_open_story(&db).await;
        seed_agent(
            &db,
            &driver,
            "jr",
            AgentType::Junior,
            "hive-junior-acme-1",
            "$ building...",
        )
        .await;
        db.call(|store| {
            store.send_message("hive-senior-acme", "hive-junior-acme-1", None, "use the v2 API")?;
            Ok(())
        })
        .await
        .unwrap();

        let summary = manager.tick().await;
        assert_eq!(summary.messages_forwarded, 1);
        let sent = driver.sent_to("hive-junior-acme-1");
        assert!(sent.iter().any(|t| t.contains("use the v2 API")));

        // Redelivery does not happen once read.
        let summary = manager.tick().await;
        assert_eq!(summary.messages_forwarded, 0);
    }

    #[tokio::test]
    async fn test_spin_down_on_merge() {
        let (mut manager, db, driver, _dir) =
            manager_with(Arc::new(SingleNode), HiveConfig::default());
        seed_agent(
            &db,
            &driver,
            "jr",
            AgentType::Junior,
            "hive-junior-acme-1",
            "$ idle",
        )
        .await;
        let story_id = db
            .call(|store| {
                let story = store.create_story(&NewStory {
                    title: "Shipped".to_string(),
                    status: Some(StoryStatus::Planned),
                    ..Default::default()
                })?;
                store.assign_story(story.id, "jr")?;
                store.set_agent_story("jr", Some(story.id))?;
                store.update_story_status(story.id, StoryStatus::Merged)?;
                Ok(story.id)
            })
            .await
            .unwrap();

        let summary = manager.tick().await;
        assert!(summary.spun_down >= 1);

        assert!(driver.killed_sessions().contains(&"hive-junior-acme-1".to_string()));
        let sent = driver.sent_to("hive-junior-acme-1");
        assert!(sent.iter().any(|t| t.contains("merged")));

        let story = db
            .call(move |store| store.get_story(story_id))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(story.status, StoryStatus::Merged);
        assert!(story.assigned_agent_id.is_none());

        let agent = db
            .call(|store| store.get_agent("jr"))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(agent.status, AgentStatus::Terminated);
        assert!(agent.current_story_id.is_none());
    }

    #[tokio::test]
    async fn test_pipeline_empty_spins_down_all_but_tech_lead() {
        let (mut manager, db, driver, _dir) =
            manager_with(Arc::new(SingleNode), HiveConfig::default());
        seed_agent(&db, &driver, "tl", AgentType::TechLead, "hive-tech-lead-acme", "$ planning").await;
        seed_agent(&db, &driver, "jr", AgentType::Junior, "hive-junior-acme-1", "$ idle").await;

        let summary = manager.tick().await;
        assert_eq!(summary.spun_down, 1);

        let agents = db.call(|store| store.list_active_agents()).await.unwrap();
        let ids: Vec<&str> = agents.iter().map(|a| a.id.as_str()).collect();
        assert_eq!(ids, vec!["tl"]);
    }

    #[tokio::test]
    async fn test_merged_story_stays_merged_across_ticks() {
        let (mut manager, db, _driver, _dir) =
            manager_with(Arc::new(SingleNode), HiveConfig::default());
        let story_id = db
            .call(|store| {
                let story = store.create_story(&NewStory {
                    title: "Done".to_string(),
                    status: Some(StoryStatus::Merged),
                    ..Default::default()
                })?;
                Ok(story.id)
            })
            .await
            .unwrap();

        manager.tick().await;
        manager.tick().await;

        let story = db
            .call(move |store| store.get_story(story_id))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(story.status, StoryStatus::Merged);
    }
}
