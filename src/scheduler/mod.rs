//! Story assignment, agent spawning, capacity scaling, and orphan recovery.
//!
//! The scheduler owns the write paths that pair stories with agents:
//!
//! - `assign_stories` — dependency-ordered assignment by complexity tier
//! - `spawn_agent` — session + worktree + DB row for a new agent
//! - `check_merge_queue` — QA workers scaled to pending review load
//! - `ensure_senior_capacity` — seniors scaled to team story points
//! - `health_check` — reconcile DB agents against live sessions
//!
//! It is invoked by the manager every tick and directly by the CLI on
//! new-requirement and assignment events.

pub mod capacity;
pub mod topo;

use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use futures::future::join_all;
use uuid::Uuid;

use crate::config::{HiveConfig, ScalingConfig, WorkspacePaths};
use crate::db::models::*;
use crate::db::DbHandle;
use crate::errors::SchedulerError;
use crate::events;
use crate::session::{
    MANAGER_SESSION, SESSION_PREFIX, SessionDriver, SpawnSpec, build_spawn_command,
    force_bypass_mode,
};
use crate::util::slugify;
use crate::worktree::WorktreeManager;

const READY_TIMEOUT: std::time::Duration = std::time::Duration::from_secs(60);
/// Upper bound on concurrent agent spawns in one scaling pass.
const SPAWN_CONCURRENCY: usize = 8;

#[derive(Debug, Default)]
pub struct AssignmentReport {
    pub assigned: Vec<i64>,
    pub skipped_dependencies: Vec<i64>,
    pub prevented_duplicates: u32,
    pub errors: Vec<String>,
}

#[derive(Debug, Default)]
pub struct HealthReport {
    /// Agents reaped because their session disappeared.
    pub reaped: Vec<String>,
    /// Stories returned to `planned` when their agent was reaped.
    pub revived: Vec<i64>,
    /// Stories recovered from assignments pointing at terminated agents.
    pub orphaned_recovered: Vec<i64>,
}

#[derive(Debug, Default)]
pub struct QaScalingReport {
    pub spawned: u32,
    pub terminated: u32,
}

pub struct Scheduler {
    db: DbHandle,
    driver: Arc<dyn SessionDriver>,
    worktrees: WorktreeManager,
    config: HiveConfig,
    paths: WorkspacePaths,
}

/// Complexity tier for a story: junior, intermediate, or senior.
pub fn tier_for_complexity(complexity: i64, scaling: &ScalingConfig) -> AgentType {
    if complexity <= scaling.junior_max_complexity {
        AgentType::Junior
    } else if complexity <= scaling.intermediate_max_complexity {
        AgentType::Intermediate
    } else {
        AgentType::Senior
    }
}

/// QA workers needed for a pending-review count.
pub fn needed_qa_agents(pending: usize, qa: &crate::config::QaConfig) -> usize {
    if pending == 0 {
        return 0;
    }
    let per_agent = qa.stories_per_agent.max(0.1);
    let needed = (pending as f64 / per_agent).ceil() as usize;
    needed.clamp(1, qa.max_agents.max(1))
}

fn next_tier_up(tier: AgentType) -> Option<AgentType> {
    match tier {
        AgentType::Junior => Some(AgentType::Intermediate),
        AgentType::Intermediate => Some(AgentType::Senior),
        _ => None,
    }
}

/// Trailing `-<n>` index of a session name, used to scale down
/// highest-indexed QA workers first.
fn session_index(session_name: &str) -> u32 {
    session_name
        .rsplit('-')
        .next()
        .and_then(|tail| tail.parse().ok())
        .unwrap_or(0)
}

fn initial_prompt(agent_type: AgentType, team_name: &str) -> String {
    let role = match agent_type {
        AgentType::TechLead => {
            "You are the tech lead. Break requirements into stories with acceptance \
             criteria and complexity scores, then mark them planned."
        }
        AgentType::Senior => {
            "You are a senior developer. Pick up your assigned story, implement it on \
             your branch, and open a PR when the acceptance criteria pass."
        }
        AgentType::Intermediate => {
            "You are a developer. Implement your assigned story on your branch and \
             open a PR when the acceptance criteria pass."
        }
        AgentType::Junior => {
            "You are a junior developer. Implement your assigned story on your branch; \
             ask for help via a message rather than guessing."
        }
        AgentType::Qa => {
            "You are a QA reviewer. Review queued pull requests against their story's \
             acceptance criteria; approve or reject with notes."
        }
        AgentType::FeatureTest => {
            "You are a feature tester. Exercise the merged feature end to end and \
             report regressions as new stories."
        }
    };
    format!("Team: {}. {} Check your inbox for messages each time you finish a step.", team_name, role)
}

impl Scheduler {
    pub fn new(
        db: DbHandle,
        driver: Arc<dyn SessionDriver>,
        config: HiveConfig,
        paths: WorkspacePaths,
    ) -> Self {
        let worktrees = WorktreeManager::new(&paths.worktrees_dir());
        Self {
            db,
            driver,
            worktrees,
            config,
            paths,
        }
    }

    pub fn session_name(&self, agent_type: AgentType, team_name: &str, index: Option<u32>) -> String {
        let slug = slugify(team_name, 20);
        match index {
            Some(i) => format!("{}{}-{}-{}", SESSION_PREFIX, agent_type.slug(), slug, i),
            None => format!("{}{}-{}", SESSION_PREFIX, agent_type.slug(), slug),
        }
    }

    // ── Assignment ────────────────────────────────────────────────────

    /// Assign every assignable `planned` story to an idle agent of the
    /// right tier, spawning agents as needed. Unsatisfied dependencies are
    /// skipped and retried on the next pass.
    pub async fn assign_stories(&self) -> Result<AssignmentReport> {
        let mut report = AssignmentReport::default();

        let refactor_policy = self.config.scaling.refactor.clone();
        let (planned, dependencies, all_stories) = self
            .db
            .call(move |store| {
                let planned = store.list_stories_by_status(StoryStatus::Planned)?;
                let planned = capacity::select_stories_for_capacity(planned, &refactor_policy);
                let dependencies = store.list_story_dependencies()?;
                let all: HashMap<i64, Story> = store
                    .list_stories()?
                    .into_iter()
                    .map(|s| (s.id, s))
                    .collect();
                Ok((planned, dependencies, all))
            })
            .await?;

        let sorted = match topo::topological_sort(planned, &dependencies) {
            Ok(sorted) => sorted,
            Err(err) => {
                report.errors.push(err.to_string());
                return Ok(report);
            }
        };

        let mut by_team: Vec<(i64, Vec<Story>)> = Vec::new();
        for story in sorted {
            let Some(team_id) = story.team_id else {
                report
                    .errors
                    .push(format!("story {} has no team and cannot be assigned", story.id));
                continue;
            };
            match by_team.iter_mut().find(|(id, _)| *id == team_id) {
                Some((_, stories)) => stories.push(story),
                None => by_team.push((team_id, vec![story])),
            }
        }

        for (team_id, stories) in by_team {
            if let Err(err) = self
                .assign_team_stories(team_id, stories, &dependencies, &all_stories, &mut report)
                .await
            {
                report
                    .errors
                    .push(format!("team {}: {:#}", team_id, err));
            }
        }

        Ok(report)
    }

    async fn assign_team_stories(
        &self,
        team_id: i64,
        stories: Vec<Story>,
        dependencies: &[StoryDependency],
        all_stories: &HashMap<i64, Story>,
        report: &mut AssignmentReport,
    ) -> Result<()> {
        let team = self
            .db
            .call(move |store| store.get_team(team_id))
            .await?
            .with_context(|| format!("team {} not found", team_id))?;

        let agents = self
            .db
            .call(move |store| store.list_active_agents_by_team(team_id))
            .await?;

        // Developers only: QA reviews, the tech lead plans.
        let mut idle: Vec<Agent> = agents
            .iter()
            .filter(|a| {
                a.status == AgentStatus::Idle
                    && !matches!(a.agent_type, AgentType::Qa | AgentType::TechLead)
            })
            .cloned()
            .collect();

        let has_senior = agents.iter().any(|a| a.agent_type == AgentType::Senior);
        if !has_senior {
            match self.spawn_agent(AgentType::Senior, &team, None, None).await {
                Ok(agent) => tracing::info!(team = %team.name, agent = %agent.id, "spawned senior"),
                Err(err) => report.errors.push(format!(
                    "failed to ensure senior for team {}: {}",
                    team.name, err
                )),
            }
        }

        for story in stories {
            if story.assigned_agent_id.is_some() {
                report.prevented_duplicates += 1;
                let story_id = story.id;
                let agent_id = story.assigned_agent_id.clone().unwrap_or_default();
                self.db
                    .call(move |store| {
                        store.create_log(
                            &agent_id,
                            Some(story_id),
                            events::DUPLICATE_ASSIGNMENT_PREVENTED,
                            None,
                            Some("story already assigned; skipping"),
                            None,
                        )
                    })
                    .await?;
                continue;
            }

            if !topo::dependencies_satisfied(story.id, dependencies, all_stories) {
                report.skipped_dependencies.push(story.id);
                continue;
            }

            let complexity = story.complexity_score.unwrap_or(5);
            let tier = tier_for_complexity(complexity, &self.config.scaling);
            let model_override = self.godmode_override(&story).await?;

            let agent = match self
                .pick_or_spawn(&team, &mut idle, tier, model_override)
                .await
            {
                Ok(agent) => agent,
                Err(err) => {
                    report
                        .errors
                        .push(format!("story {}: {}", story.id, err));
                    continue;
                }
            };

            let agent_id = agent.id.clone();
            let story_id = story.id;
            let tier_name = tier.as_str();
            self.db
                .call(move |store| {
                    store.with_transaction(|s| {
                        s.assign_story(story_id, &agent_id)?;
                        s.set_agent_story(&agent_id, Some(story_id))?;
                        s.create_log(
                            &agent_id,
                            Some(story_id),
                            events::STORY_ASSIGNED,
                            Some(StoryStatus::InProgress.as_str()),
                            None,
                            Some(&serde_json::json!({
                                "tier": tier_name,
                                "complexity": complexity,
                            })),
                        )?;
                        Ok(())
                    })
                })
                .await?;
            report.assigned.push(story.id);

            if let Some(session) = &agent.session_name {
                let note = format!(
                    "You have been assigned story #{}: {}. Acceptance criteria: {}",
                    story.id,
                    story.title,
                    story.acceptance_criteria.join("; ")
                );
                if let Err(err) = self.driver.send_with_confirmation(session, &note).await {
                    tracing::warn!(%session, %err, "failed to deliver assignment note");
                } else {
                    let _ = self.driver.send_enter(session).await;
                }
            }
        }

        Ok(())
    }

    /// Model override for godmode requirements.
    async fn godmode_override(&self, story: &Story) -> Result<Option<String>> {
        let Some(requirement_id) = story.requirement_id else {
            return Ok(None);
        };
        let requirement = self
            .db
            .call(move |store| store.get_requirement(requirement_id))
            .await?;
        Ok(requirement
            .filter(|r| r.godmode)
            .map(|_| self.config.models.godmode_model.clone()))
    }

    /// Choose the idle candidate with the smallest queue depth, or spawn a
    /// fresh agent at the tier (falling back one tier up on spawn failure).
    async fn pick_or_spawn(
        &self,
        team: &Team,
        idle: &mut Vec<Agent>,
        tier: AgentType,
        model_override: Option<String>,
    ) -> Result<Agent, SchedulerError> {
        let candidate_ids: Vec<String> = idle
            .iter()
            .filter(|a| a.agent_type == tier)
            .map(|a| a.id.clone())
            .collect();

        if !candidate_ids.is_empty() {
            let ids = candidate_ids.clone();
            let depths: HashMap<String, i64> = self
                .db
                .call(move |store| {
                    let mut depths = HashMap::new();
                    for id in &ids {
                        depths.insert(id.clone(), store.queue_depth(id)?);
                    }
                    Ok(depths)
                })
                .await?;

            // Ties break by creation order, which `idle` already preserves.
            let best = candidate_ids
                .iter()
                .min_by_key(|id| depths.get(*id).copied().unwrap_or(0))
                .cloned();
            if let Some(best_id) = best {
                let position = idle.iter().position(|a| a.id == best_id);
                if let Some(position) = position {
                    return Ok(idle.remove(position));
                }
            }
        }

        let mut attempt_tier = tier;
        loop {
            match self
                .spawn_agent(attempt_tier, team, None, model_override.clone())
                .await
            {
                Ok(agent) => return Ok(agent),
                Err(err) => {
                    tracing::warn!(tier = attempt_tier.as_str(), %err, "spawn failed");
                    match next_tier_up(attempt_tier) {
                        Some(higher) => attempt_tier = higher,
                        None => return Err(err),
                    }
                }
            }
        }
    }

    // ── Spawning ──────────────────────────────────────────────────────

    /// Spawn an agent: worktree, tmux session, bypass mode, DB row.
    /// Idempotent per session name: a live existing agent is returned as-is.
    pub async fn spawn_agent(
        &self,
        agent_type: AgentType,
        team: &Team,
        index: Option<u32>,
        model_override: Option<String>,
    ) -> Result<Agent, SchedulerError> {
        let session_name = self.session_name(agent_type, &team.name, index);

        let existing_session = session_name.clone();
        let existing = self
            .db
            .call(move |store| store.find_agent_by_session(&existing_session))
            .await?;
        if let Some(agent) = existing
            && self.driver.is_running(&session_name).await
        {
            return Ok(agent);
        }

        let agent_id = Uuid::new_v4().to_string();
        let repo_path = self.paths.root.join(&team.repo_path);
        let worktree_path = self
            .worktrees
            .create(&agent_id, team.id, &repo_path)
            .await
            .map_err(|err| SchedulerError::SpawnFailed {
                agent_type: agent_type.as_str().to_string(),
                team_id: team.id,
                message: format!("{:#}", err),
            })?;

        let tier_config = self.config.models.for_tier(agent_type);
        let argv = build_spawn_command(tier_config, model_override.as_deref());
        let model = model_override.unwrap_or_else(|| tier_config.model.clone());
        let prompt = initial_prompt(agent_type, &team.name);

        let spawn_result = self
            .driver
            .spawn(SpawnSpec {
                name: &session_name,
                work_dir: &worktree_path,
                argv,
                initial_prompt: Some(&prompt),
            })
            .await;
        if let Err(err) = spawn_result {
            self.worktrees.remove(&self.db, &agent_id, &worktree_path).await;
            return Err(SchedulerError::SpawnFailed {
                agent_type: agent_type.as_str().to_string(),
                team_id: team.id,
                message: err.to_string(),
            });
        }

        if let Err(err) = self.driver.wait_ready(&session_name, READY_TIMEOUT).await {
            tracing::warn!(session = %session_name, %err, "agent CLI slow to initialize");
        }
        if !force_bypass_mode(self.driver.as_ref(), &session_name).await {
            tracing::warn!(session = %session_name, "could not confirm bypass mode");
        }

        let agent = Agent {
            id: agent_id,
            agent_type,
            team_id: Some(team.id),
            session_name: Some(session_name.clone()),
            model,
            status: AgentStatus::Working,
            current_story_id: None,
            worktree_path: Some(worktree_path.display().to_string()),
            cli_tool: tier_config.cli_tool.clone(),
            created_at: String::new(),
            updated_at: String::new(),
        };

        let row = agent.clone();
        self.db
            .call(move |store| {
                store.with_transaction(|s| {
                    s.insert_agent(&row)?;
                    s.create_log(
                        &row.id,
                        None,
                        events::AGENT_SPAWNED,
                        Some(row.status.as_str()),
                        row.session_name.as_deref(),
                        None,
                    )?;
                    Ok(())
                })
            })
            .await?;

        self.ensure_manager_running().await;

        Ok(agent)
    }

    /// Make sure the manager daemon session exists; agents depend on its
    /// supervision to stay unstuck.
    pub async fn ensure_manager_running(&self) {
        if self.driver.is_running(MANAGER_SESSION).await {
            return;
        }
        let exe = std::env::current_exe()
            .map(|p| p.display().to_string())
            .unwrap_or_else(|_| "hive".to_string());
        let result = self
            .driver
            .spawn(SpawnSpec {
                name: MANAGER_SESSION,
                work_dir: &self.paths.root,
                argv: vec![exe, "manager".to_string(), "start".to_string()],
                initial_prompt: None,
            })
            .await;
        if let Err(err) = result {
            tracing::warn!(%err, "failed to start manager session");
        }
    }

    // ── Scaling ───────────────────────────────────────────────────────

    /// Scale QA workers per team to the pending `{qa, pr_submitted}` load.
    pub async fn check_merge_queue(&self) -> Result<QaScalingReport> {
        let mut report = QaScalingReport::default();

        let teams = self.db.call(|store| store.list_teams()).await?;
        for team in teams {
            let team_id = team.id;
            let (pending, qa_agents) = self
                .db
                .call(move |store| {
                    let mut pending = 0usize;
                    for status in [StoryStatus::Qa, StoryStatus::PrSubmitted] {
                        pending += store
                            .list_stories_by_status(status)?
                            .into_iter()
                            .filter(|s| s.team_id == Some(team_id))
                            .count();
                    }
                    let qa_agents: Vec<Agent> = store
                        .list_active_agents_by_team(team_id)?
                        .into_iter()
                        .filter(|a| a.agent_type == AgentType::Qa)
                        .collect();
                    Ok((pending, qa_agents))
                })
                .await?;

            let needed = needed_qa_agents(pending, &self.config.qa);
            let current = qa_agents.len();

            if needed > current {
                report.spawned += self.spawn_qa_deficit(&team, &qa_agents, needed).await;
            } else if needed < current {
                report.terminated += self
                    .terminate_qa_excess(&team, qa_agents, needed)
                    .await?;
            }
        }

        Ok(report)
    }

    async fn spawn_qa_deficit(&self, team: &Team, existing: &[Agent], needed: usize) -> u32 {
        let taken: HashSet<u32> = existing
            .iter()
            .filter_map(|a| a.session_name.as_deref().map(session_index))
            .collect();
        let mut indexes: Vec<u32> = (1..=needed as u32).filter(|i| !taken.contains(i)).collect();
        indexes.truncate(needed - existing.len());

        let mut spawned = 0;
        for chunk in indexes.chunks(SPAWN_CONCURRENCY) {
            let spawns = chunk
                .iter()
                .map(|&index| self.spawn_agent(AgentType::Qa, team, Some(index), None));
            for result in join_all(spawns).await {
                match result {
                    Ok(_) => spawned += 1,
                    Err(err) => tracing::warn!(team = %team.name, %err, "QA spawn failed"),
                }
            }
        }
        spawned
    }

    async fn terminate_qa_excess(
        &self,
        team: &Team,
        mut qa_agents: Vec<Agent>,
        needed: usize,
    ) -> Result<u32> {
        let previous = qa_agents.len();
        // Highest-indexed first.
        qa_agents.sort_by_key(|a| {
            std::cmp::Reverse(a.session_name.as_deref().map(session_index).unwrap_or(0))
        });

        let mut terminated = 0;
        for agent in qa_agents.into_iter().take(previous - needed) {
            self.terminate_agent(&agent).await?;
            terminated += 1;
        }

        let team_id = team.id;
        self.db
            .call(move |store| {
                store.create_log(
                    "scheduler",
                    None,
                    events::TEAM_SCALED_DOWN,
                    None,
                    Some("scaled down QA workers"),
                    Some(&serde_json::json!({
                        "teamId": team_id,
                        "previousCount": previous,
                        "newCount": needed,
                    })),
                )
            })
            .await?;

        Ok(terminated)
    }

    /// Kill the session, remove the worktree, and mark the row terminated.
    /// Any current story goes back to `planned`.
    pub async fn terminate_agent(&self, agent: &Agent) -> Result<()> {
        if let Some(session) = &agent.session_name
            && self.driver.is_running(session).await
        {
            let _ = self.driver.kill(session).await;
        }
        if let Some(worktree) = &agent.worktree_path {
            self.worktrees
                .remove(&self.db, &agent.id, &PathBuf::from(worktree))
                .await;
        }

        let agent_id = agent.id.clone();
        let story_id = agent.current_story_id;
        self.db
            .call(move |store| {
                store.with_transaction(|s| {
                    s.terminate_agent(&agent_id)?;
                    if let Some(story_id) = story_id
                        && let Some(story) = s.get_story(story_id)?
                        && story.status != StoryStatus::Merged
                    {
                        s.clear_story_assignment(story_id, StoryStatus::Planned)?;
                    }
                    s.create_log(
                        &agent_id,
                        story_id,
                        events::AGENT_SPUN_DOWN,
                        Some(AgentStatus::Terminated.as_str()),
                        None,
                        None,
                    )?;
                    Ok(())
                })
            })
            .await?;
        Ok(())
    }

    /// Spawn seniors until each team can carry its open story points.
    /// Seniors are never scaled down.
    pub async fn ensure_senior_capacity(&self) -> Result<u32> {
        let mut spawned = 0;
        let teams = self.db.call(|store| store.list_teams()).await?;
        for team in teams {
            let team_id = team.id;
            let (points, seniors) = self
                .db
                .call(move |store| {
                    let points = store.team_story_points(team_id)?;
                    let seniors = store
                        .list_active_agents_by_team(team_id)?
                        .into_iter()
                        .filter(|a| a.agent_type == AgentType::Senior)
                        .count();
                    Ok((points, seniors))
                })
                .await?;

            let capacity = self.config.scaling.senior_capacity.max(1);
            let needed = (points + capacity - 1) / capacity;
            for _ in seniors..needed as usize {
                match self.spawn_agent(AgentType::Senior, &team, None, None).await {
                    Ok(_) => spawned += 1,
                    Err(err) => {
                        tracing::warn!(team = %team.name, %err, "senior spawn failed");
                        break;
                    }
                }
            }
        }
        Ok(spawned)
    }

    // ── Health ────────────────────────────────────────────────────────

    /// Reconcile agent rows against live sessions. The live set from the
    /// driver is the single source of truth; DB rows are adjusted to match.
    pub async fn health_check(&self) -> Result<HealthReport> {
        let mut report = HealthReport::default();

        let live: HashSet<String> = self
            .driver
            .list(SESSION_PREFIX)
            .await
            .unwrap_or_default()
            .into_iter()
            .collect();

        let agents = self.db.call(|store| store.list_active_agents()).await?;
        for agent in agents {
            let session_alive = agent
                .session_name
                .as_ref()
                .map(|s| live.contains(s))
                .unwrap_or(false);
            if session_alive {
                continue;
            }

            if let Some(worktree) = &agent.worktree_path {
                self.worktrees
                    .remove(&self.db, &agent.id, &PathBuf::from(worktree))
                    .await;
            }

            let agent_id = agent.id.clone();
            let story_id = agent.current_story_id;
            let revived = self
                .db
                .call(move |store| {
                    store.with_transaction(|s| {
                        s.terminate_agent(&agent_id)?;
                        let mut revived = None;
                        if let Some(story_id) = story_id
                            && let Some(story) = s.get_story(story_id)?
                            && story.status != StoryStatus::Merged
                        {
                            s.clear_story_assignment(story_id, StoryStatus::Planned)?;
                            revived = Some(story_id);
                        }
                        s.create_log(
                            &agent_id,
                            story_id,
                            events::AGENT_REAPED,
                            Some(AgentStatus::Terminated.as_str()),
                            Some("session not found during health check"),
                            None,
                        )?;
                        Ok(revived)
                    })
                })
                .await?;

            report.reaped.push(agent.id);
            if let Some(story_id) = revived {
                report.revived.push(story_id);
            }
        }

        // Assignments pointing at agents that were already terminated.
        let orphaned = self
            .db
            .call(|store| store.list_stories_with_terminated_assignee())
            .await?;
        for story in orphaned {
            let story_id = story.id;
            self.db
                .call(move |store| {
                    store.clear_story_assignment(story_id, StoryStatus::Planned)
                })
                .await?;
            report.orphaned_recovered.push(story.id);
        }

        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::QaConfig;
    use crate::db::{NewStory, Store};
    use crate::session::fake::FakeDriver;

    fn test_setup() -> (Scheduler, DbHandle, Arc<FakeDriver>, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let db = DbHandle::new(Store::open_in_memory().unwrap());
        let driver = Arc::new(FakeDriver::new());
        let scheduler = Scheduler::new(
            db.clone(),
            driver.clone(),
            HiveConfig::default(),
            WorkspacePaths::new(dir.path()),
        );
        (scheduler, db, driver, dir)
    }

    async fn seed_team(db: &DbHandle) -> Team {
        db.call(|store| store.create_team("acme", "git@example.com:acme/app.git", "repos/app"))
            .await
            .unwrap()
    }

    async fn seed_agent(
        db: &DbHandle,
        driver: &FakeDriver,
        id: &str,
        agent_type: AgentType,
        team_id: i64,
        session: &str,
        status: AgentStatus,
    ) -> Agent {
        let agent = Agent {
            id: id.to_string(),
            agent_type,
            team_id: Some(team_id),
            session_name: Some(session.to_string()),
            model: "sonnet".to_string(),
            status,
            current_story_id: None,
            worktree_path: None,
            cli_tool: "claude".to_string(),
            created_at: String::new(),
            updated_at: String::new(),
        };
        let row = agent.clone();
        db.call(move |store| store.insert_agent(&row)).await.unwrap();
        driver.add_session(session, "? for shortcuts\n> ");
        agent
    }

    async fn seed_planned_story(db: &DbHandle, team_id: i64, title: &str, complexity: i64) -> Story {
        let title = title.to_string();
        db.call(move |store| {
            store.create_story(&NewStory {
                team_id: Some(team_id),
                title,
                complexity_score: Some(complexity),
                status: Some(StoryStatus::Planned),
                ..Default::default()
            })
        })
        .await
        .unwrap()
    }

    #[test]
    fn test_tier_for_complexity_boundaries() {
        let scaling = ScalingConfig::default();
        assert_eq!(tier_for_complexity(1, &scaling), AgentType::Junior);
        assert_eq!(tier_for_complexity(3, &scaling), AgentType::Junior);
        assert_eq!(tier_for_complexity(4, &scaling), AgentType::Intermediate);
        assert_eq!(tier_for_complexity(7, &scaling), AgentType::Intermediate);
        assert_eq!(tier_for_complexity(8, &scaling), AgentType::Senior);
        assert_eq!(tier_for_complexity(13, &scaling), AgentType::Senior);
    }

    #[test]
    fn test_needed_qa_agents_scaling() {
        let qa = QaConfig::default();
        assert_eq!(needed_qa_agents(0, &qa), 0);
        assert_eq!(needed_qa_agents(1, &qa), 1);
        assert_eq!(needed_qa_agents(2, &qa), 1);
        assert_eq!(needed_qa_agents(3, &qa), 2);
        assert_eq!(needed_qa_agents(5, &qa), 2);
        assert_eq!(needed_qa_agents(6, &qa), 3);
        assert_eq!(needed_qa_agents(100, &qa), 5);
    }

    #[test]
    fn test_session_index_parsing() {
        assert_eq!(session_index("hive-qa-acme-3"), 3);
        assert_eq!(session_index("hive-senior-acme"), 0);
    }

    #[tokio::test]
    async fn test_complexity_routes_to_junior() {
        let (scheduler, db, driver, _dir) = test_setup();
        let team = seed_team(&db).await;
        seed_agent(&db, &driver, "jr", AgentType::Junior, team.id, "hive-junior-acme", AgentStatus::Idle).await;
        seed_agent(&db, &driver, "int", AgentType::Intermediate, team.id, "hive-intermediate-acme", AgentStatus::Idle).await;
        seed_agent(&db, &driver, "sr", AgentType::Senior, team.id, "hive-senior-acme", AgentStatus::Idle).await;
        let story = seed_planned_story(&db, team.id, "Small fix", 2).await;

        let report = scheduler.assign_stories().await.unwrap();
        assert_eq!(report.assigned, vec![story.id]);
        assert!(report.errors.is_empty());

        let fetched = db
            .call(move |store| store.get_story(story.id))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(fetched.status, StoryStatus::InProgress);
        assert_eq!(fetched.assigned_agent_id.as_deref(), Some("jr"));

        let events = db.call(|store| store.list_events(20)).await.unwrap();
        let assigned: Vec<_> = events
            .iter()
            .filter(|e| e.event_type == events::STORY_ASSIGNED)
            .collect();
        assert_eq!(assigned.len(), 1);
    }

    #[tokio::test]
    async fn test_dependency_gating_across_passes() {
        let (scheduler, db, driver, _dir) = test_setup();
        let team = seed_team(&db).await;
        seed_agent(&db, &driver, "sr", AgentType::Senior, team.id, "hive-senior-acme", AgentStatus::Idle).await;

        let a = seed_planned_story(&db, team.id, "Schema", 9).await;
        let b = seed_planned_story(&db, team.id, "API on top", 9).await;
        db.call(move |store| store.add_story_dependency(b.id, a.id))
            .await
            .unwrap();

        let report = scheduler.assign_stories().await.unwrap();
        assert_eq!(report.assigned, vec![a.id]);
        assert_eq!(report.skipped_dependencies, vec![b.id]);

        // A is now in progress, so B's dependency is satisfied; give the
        // senior another free slot by marking it idle again.
        db.call(|store| store.update_agent_status("sr", AgentStatus::Idle))
            .await
            .unwrap();
        let report = scheduler.assign_stories().await.unwrap();
        assert_eq!(report.assigned, vec![b.id]);
    }

    #[tokio::test]
    async fn test_duplicate_assignment_prevented() {
        let (scheduler, db, driver, _dir) = test_setup();
        let team = seed_team(&db).await;
        seed_agent(&db, &driver, "sr", AgentType::Senior, team.id, "hive-senior-acme", AgentStatus::Idle).await;
        seed_agent(&db, &driver, "jr", AgentType::Junior, team.id, "hive-junior-acme", AgentStatus::Idle).await;

        let story = seed_planned_story(&db, team.id, "Claimed", 2).await;
        // Simulate a racing assignment: agent set, but the story re-entered
        // the planned list.
        db.call(move |store| {
            store.assign_story(story.id, "sr")?;
            store.update_story_status(story.id, StoryStatus::Planned)
        })
        .await
        .unwrap();

        let report = scheduler.assign_stories().await.unwrap();
        assert_eq!(report.prevented_duplicates, 1);
        assert!(report.assigned.is_empty());

        let fetched = db
            .call(move |store| store.get_story(story.id))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(fetched.status, StoryStatus::Planned);
        assert_eq!(fetched.assigned_agent_id.as_deref(), Some("sr"));

        let events = db.call(|store| store.list_events(20)).await.unwrap();
        assert!(
            events
                .iter()
                .any(|e| e.event_type == events::DUPLICATE_ASSIGNMENT_PREVENTED)
        );
    }

    #[tokio::test]
    async fn test_queue_depth_picks_least_loaded() {
        let (scheduler, db, driver, _dir) = test_setup();
        let team = seed_team(&db).await;
        seed_agent(&db, &driver, "sr", AgentType::Senior, team.id, "hive-senior-acme", AgentStatus::Idle).await;
        seed_agent(&db, &driver, "jr1", AgentType::Junior, team.id, "hive-junior-acme-1", AgentStatus::Idle).await;
        seed_agent(&db, &driver, "jr2", AgentType::Junior, team.id, "hive-junior-acme-2", AgentStatus::Idle).await;

        // jr1 already carries rework.
        let rework = seed_planned_story(&db, team.id, "Rework", 2).await;
        db.call(move |store| {
            store.assign_story(rework.id, "jr1")?;
            store.update_story_status(rework.id, StoryStatus::QaFailed)
        })
        .await
        .unwrap();

        let story = seed_planned_story(&db, team.id, "Fresh work", 2).await;
        let report = scheduler.assign_stories().await.unwrap();
        assert!(report.assigned.contains(&story.id));

        let fetched = db
            .call(move |store| store.get_story(story.id))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(fetched.assigned_agent_id.as_deref(), Some("jr2"));
    }

    #[tokio::test]
    async fn test_health_check_revives_stories_of_dead_sessions() {
        let (scheduler, db, driver, _dir) = test_setup();
        let team = seed_team(&db).await;
        let agent = seed_agent(&db, &driver, "gone", AgentType::Junior, team.id, "hive-junior-acme-9", AgentStatus::Working).await;
        let story = seed_planned_story(&db, team.id, "Interrupted", 2).await;
        db.call(move |store| {
            store.assign_story(story.id, "gone")?;
            store.set_agent_story("gone", Some(story.id))
        })
        .await
        .unwrap();

        // The session vanishes out from under the agent.
        driver.remove_session(agent.session_name.as_deref().unwrap());

        let report = scheduler.health_check().await.unwrap();
        assert_eq!(report.reaped, vec!["gone".to_string()]);
        assert_eq!(report.revived, vec![story.id]);

        let fetched = db
            .call(move |store| store.get_story(story.id))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(fetched.status, StoryStatus::Planned);
        assert!(fetched.assigned_agent_id.is_none());
    }

    #[tokio::test]
    async fn test_health_check_recovers_orphaned_assignments() {
        let (scheduler, db, driver, _dir) = test_setup();
        let team = seed_team(&db).await;
        seed_agent(&db, &driver, "dead", AgentType::Junior, team.id, "hive-junior-acme-1", AgentStatus::Working).await;
        let story = seed_planned_story(&db, team.id, "Orphaned", 2).await;
        db.call(move |store| {
            store.assign_story(story.id, "dead")?;
            store.terminate_agent("dead")
        })
        .await
        .unwrap();
        driver.remove_session("hive-junior-acme-1");

        let report = scheduler.health_check().await.unwrap();
        assert_eq!(report.orphaned_recovered, vec![story.id]);

        let fetched = db
            .call(move |store| store.get_story(story.id))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(fetched.status, StoryStatus::Planned);
        assert!(fetched.assigned_agent_id.is_none());
    }

    #[tokio::test]
    async fn test_qa_scale_down_terminates_highest_index_first() {
        let (scheduler, db, driver, _dir) = test_setup();
        let team = seed_team(&db).await;
        for i in 1..=5u32 {
            let id = format!("qa{}", i);
            let session = format!("hive-qa-acme-{}", i);
            seed_agent(&db, &driver, &id, AgentType::Qa, team.id, &session, AgentStatus::Working).await;
        }
        // Two pending reviews → one QA needed.
        for title in ["PR one", "PR two"] {
            let story = seed_planned_story(&db, team.id, title, 2).await;
            db.call(move |store| store.update_story_status(story.id, StoryStatus::PrSubmitted))
                .await
                .unwrap();
        }

        let report = scheduler.check_merge_queue().await.unwrap();
        assert_eq!(report.terminated, 4);
        assert_eq!(report.spawned, 0);

        let remaining: Vec<String> = db
            .call(move |store| store.list_active_agents_by_team(team.id))
            .await
            .unwrap()
            .into_iter()
            .filter(|a| a.agent_type == AgentType::Qa)
            .filter_map(|a| a.session_name)
            .collect();
        assert_eq!(remaining, vec!["hive-qa-acme-1".to_string()]);

        let killed = driver.killed_sessions();
        assert_eq!(
            killed,
            vec![
                "hive-qa-acme-5".to_string(),
                "hive-qa-acme-4".to_string(),
                "hive-qa-acme-3".to_string(),
                "hive-qa-acme-2".to_string(),
            ]
        );

        let events = db.call(|store| store.list_events(30)).await.unwrap();
        let scaled: Vec<_> = events
            .iter()
            .filter(|e| e.event_type == events::TEAM_SCALED_DOWN)
            .collect();
        assert_eq!(scaled.len(), 1);
        let metadata = scaled[0].metadata.as_ref().unwrap();
        assert_eq!(metadata["previousCount"], 5);
        assert_eq!(metadata["newCount"], 1);
    }

    #[tokio::test]
    async fn test_qa_queue_empty_scales_to_zero() {
        let (scheduler, db, driver, _dir) = test_setup();
        let team = seed_team(&db).await;
        seed_agent(&db, &driver, "qa1", AgentType::Qa, team.id, "hive-qa-acme-1", AgentStatus::Working).await;

        let report = scheduler.check_merge_queue().await.unwrap();
        assert_eq!(report.terminated, 1);

        let remaining = db
            .call(move |store| store.list_active_agents_by_team(team.id))
            .await
            .unwrap();
        assert!(remaining.iter().all(|a| a.agent_type != AgentType::Qa));
    }
}
