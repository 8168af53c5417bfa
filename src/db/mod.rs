//! Embedded SQLite store — the single source of truth for all durable state.
//!
//! | Piece        | Role                                                  |
//! |--------------|-------------------------------------------------------|
//! | `Store`      | One writer connection, typed CRUD per entity          |
//! | `DbHandle`   | Thin `Arc<Mutex<Store>>` for async callers            |
//! | `migrations` | Ordered, recorded schema migrations                   |
//! | `models`     | Entity structs and status enums                       |
//!
//! Terminal sessions are ephemeral and the code host is eventually
//! consistent; everything durable lives here.

pub mod migrations;
pub mod models;

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use rusqlite::{Connection, OptionalExtension, params};

use crate::errors::StoreError;
use models::*;

/// File size below which a database is too small to be worth a corruption probe.
const CORRUPTION_PROBE_MIN_BYTES: u64 = 50 * 1024;
const OPEN_RETRIES: u32 = 3;
const OPEN_RETRY_DELAY: Duration = Duration::from_millis(100);

pub struct Store {
    conn: Connection,
    /// When set, `snapshot_to_disk` persists the in-memory image here.
    /// File-backed (WAL) stores leave this unset and persist nothing.
    snapshot_path: Option<PathBuf>,
}

/// Fields for a new story; most callers only set a few.
#[derive(Debug, Clone, Default)]
pub struct NewStory {
    pub requirement_id: Option<i64>,
    pub team_id: Option<i64>,
    pub title: String,
    pub description: String,
    pub acceptance_criteria: Vec<String>,
    pub complexity_score: Option<i64>,
    pub story_points: Option<i64>,
    pub status: Option<StoryStatus>,
}

impl Store {
    /// Open (or create) the database at the given path and run migrations.
    pub fn open(path: &Path) -> Result<Self, StoreError> {
        let size = std::fs::metadata(path).map(|m| m.len()).unwrap_or(0);
        let conn = Connection::open(path).map_err(|source| StoreError::OpenFailed {
            path: path.to_path_buf(),
            source,
        })?;
        if let Err(source) = conn.execute_batch(
            "PRAGMA journal_mode = WAL;
             PRAGMA foreign_keys = ON;
             PRAGMA busy_timeout = 5000;",
        ) {
            // A non-trivial file SQLite refuses to read is a corrupt database,
            // not an open failure.
            if size >= CORRUPTION_PROBE_MIN_BYTES {
                return Err(StoreError::DatabaseCorruption {
                    path: path.to_path_buf(),
                });
            }
            return Err(StoreError::OpenFailed {
                path: path.to_path_buf(),
                source,
            });
        }

        probe_corruption(&conn, path, size)?;
        migrations::run_migrations(&conn)?;

        Ok(Self {
            conn,
            snapshot_path: None,
        })
    }

    /// Like `open`, but retries corruption failures to tolerate a concurrent
    /// atomic rename of the live file.
    pub fn open_with_retry(path: &Path) -> Result<Self, StoreError> {
        let mut attempt = 0;
        loop {
            match Self::open(path) {
                Err(StoreError::DatabaseCorruption { .. }) if attempt + 1 < OPEN_RETRIES => {
                    attempt += 1;
                    std::thread::sleep(OPEN_RETRY_DELAY);
                }
                other => return other,
            }
        }
    }

    /// In-memory database for tests and the snapshot engine.
    pub fn open_in_memory() -> Result<Self, StoreError> {
        let conn = Connection::open_in_memory()?;
        conn.execute_batch("PRAGMA foreign_keys = ON;")?;
        migrations::run_migrations(&conn)?;
        Ok(Self {
            conn,
            snapshot_path: None,
        })
    }

    /// In-memory database persisted on demand via `snapshot_to_disk`.
    pub fn open_snapshot_engine(snapshot_path: &Path) -> Result<Self, StoreError> {
        let mut store = Self::open_in_memory()?;
        store.snapshot_path = Some(snapshot_path.to_path_buf());
        Ok(store)
    }

    /// Run `f` inside a `BEGIN IMMEDIATE` transaction. On success the commit
    /// is followed by a persist (a no-op for WAL stores); on failure the
    /// rollback error, if any, is swallowed.
    pub fn with_transaction<T>(&self, f: impl FnOnce(&Store) -> Result<T>) -> Result<T> {
        self.conn
            .execute_batch("BEGIN IMMEDIATE")
            .context("Failed to begin transaction")?;
        match f(self) {
            Ok(value) => {
                self.conn
                    .execute_batch("COMMIT")
                    .context("Failed to commit transaction")?;
                self.snapshot_to_disk()?;
                Ok(value)
            }
            Err(err) => {
                let _ = self.conn.execute_batch("ROLLBACK");
                Err(err)
            }
        }
    }

    /// Persist the in-memory image: write a sibling temp file, keep a `.bak`
    /// of the previous live file, then atomically rename over it. Returns
    /// `false` without touching disk for WAL (file-backed) stores.
    pub fn snapshot_to_disk(&self) -> Result<bool> {
        let Some(target) = &self.snapshot_path else {
            return Ok(false);
        };

        let tmp = sibling(target, "tmp");
        let bak = sibling(target, "bak");
        if tmp.exists() {
            std::fs::remove_file(&tmp).context("Failed to clear stale snapshot temp file")?;
        }
        let tmp_str = tmp
            .to_str()
            .context("Snapshot temp path contains invalid UTF-8")?;
        self.conn
            .execute("VACUUM INTO ?1", [tmp_str])
            .context("Failed to write snapshot")?;
        if target.exists() {
            std::fs::copy(target, &bak).context("Failed to write snapshot backup")?;
        }
        std::fs::rename(&tmp, target).context("Failed to move snapshot into place")?;
        Ok(true)
    }

    pub fn applied_migrations(&self) -> Result<Vec<String>, StoreError> {
        migrations::applied_migrations(&self.conn)
    }

    // ── Teams ─────────────────────────────────────────────────────────

    pub fn create_team(&self, name: &str, repo_url: &str, repo_path: &str) -> Result<Team> {
        self.conn
            .execute(
                "INSERT INTO teams (name, repo_url, repo_path) VALUES (?1, ?2, ?3)",
                params![name, repo_url, repo_path],
            )
            .context("Failed to insert team")?;
        let id = self.conn.last_insert_rowid();
        self.get_team(id)?.context("Team not found after insert")
    }

    pub fn get_team(&self, id: i64) -> Result<Option<Team>> {
        self.conn
            .query_row(
                "SELECT id, name, repo_url, repo_path, created_at FROM teams WHERE id = ?1",
                params![id],
                team_from_row,
            )
            .optional()
            .context("Failed to query team")
    }

    pub fn list_teams(&self) -> Result<Vec<Team>> {
        let mut stmt = self
            .conn
            .prepare("SELECT id, name, repo_url, repo_path, created_at FROM teams ORDER BY id")
            .context("Failed to prepare list_teams")?;
        let rows = stmt
            .query_map([], team_from_row)
            .context("Failed to query teams")?;
        collect_rows(rows)
    }

    // ── Requirements ──────────────────────────────────────────────────

    pub fn create_requirement(
        &self,
        title: &str,
        description: &str,
        godmode: bool,
        target_branch: &str,
    ) -> Result<Requirement> {
        self.conn
            .execute(
                "INSERT INTO requirements (title, description, godmode, target_branch)
                 VALUES (?1, ?2, ?3, ?4)",
                params![title, description, godmode as i64, target_branch],
            )
            .context("Failed to insert requirement")?;
        let id = self.conn.last_insert_rowid();
        self.get_requirement(id)?
            .context("Requirement not found after insert")
    }

    pub fn get_requirement(&self, id: i64) -> Result<Option<Requirement>> {
        self.conn
            .query_row(
                &format!("{REQUIREMENT_COLUMNS} WHERE id = ?1"),
                params![id],
                requirement_from_row,
            )
            .optional()
            .context("Failed to query requirement")
    }

    pub fn list_requirements(&self) -> Result<Vec<Requirement>> {
        let mut stmt = self
            .conn
            .prepare(&format!("{REQUIREMENT_COLUMNS} ORDER BY id"))
            .context("Failed to prepare list_requirements")?;
        let rows = stmt
            .query_map([], requirement_from_row)
            .context("Failed to query requirements")?;
        collect_rows(rows)
    }

    pub fn update_requirement_status(&self, id: i64, status: RequirementStatus) -> Result<()> {
        self.conn
            .execute(
                "UPDATE requirements SET status = ?1, updated_at = datetime('now') WHERE id = ?2",
                params![status.as_str(), id],
            )
            .context("Failed to update requirement status")?;
        Ok(())
    }

    // ── Stories ───────────────────────────────────────────────────────

    pub fn create_story(&self, new: &NewStory) -> Result<Story> {
        let criteria = serde_json::to_string(&new.acceptance_criteria)
            .context("Failed to serialize acceptance criteria")?;
        let status = new.status.unwrap_or(StoryStatus::Draft);
        self.conn
            .execute(
                "INSERT INTO stories
                   (requirement_id, team_id, title, description, acceptance_criteria,
                    complexity_score, story_points, status)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
                params![
                    new.requirement_id,
                    new.team_id,
                    new.title,
                    new.description,
                    criteria,
                    new.complexity_score,
                    new.story_points,
                    status.as_str(),
                ],
            )
            .context("Failed to insert story")?;
        let id = self.conn.last_insert_rowid();
        self.get_story(id)?.context("Story not found after insert")
    }

    pub fn get_story(&self, id: i64) -> Result<Option<Story>> {
        let row = self
            .conn
            .query_row(
                &format!("{STORY_COLUMNS} WHERE id = ?1"),
                params![id],
                story_row_from_row,
            )
            .optional()
            .context("Failed to query story")?;
        row.map(StoryRow::into_story).transpose()
    }

    pub fn list_stories(&self) -> Result<Vec<Story>> {
        self.query_stories(&format!("{STORY_COLUMNS} ORDER BY id"), params![])
    }

    pub fn list_stories_by_status(&self, status: StoryStatus) -> Result<Vec<Story>> {
        self.query_stories(
            &format!("{STORY_COLUMNS} WHERE status = ?1 ORDER BY id"),
            params![status.as_str()],
        )
    }

    pub fn list_stories_by_requirement(&self, requirement_id: i64) -> Result<Vec<Story>> {
        self.query_stories(
            &format!("{STORY_COLUMNS} WHERE requirement_id = ?1 ORDER BY id"),
            params![requirement_id],
        )
    }

    pub fn list_stories_assigned_to(&self, agent_id: &str) -> Result<Vec<Story>> {
        self.query_stories(
            &format!("{STORY_COLUMNS} WHERE assigned_agent_id = ?1 ORDER BY id"),
            params![agent_id],
        )
    }

    /// Stories still holding an assignment to an already-terminated agent.
    pub fn list_stories_with_terminated_assignee(&self) -> Result<Vec<Story>> {
        self.query_stories(
            &format!(
                "{STORY_COLUMNS} WHERE assigned_agent_id IS NOT NULL
                 AND assigned_agent_id IN (SELECT id FROM agents WHERE status = 'terminated')
                 AND status != 'merged'
                 ORDER BY id"
            ),
            params![],
        )
    }

    /// `in_progress` stories untouched for at least `minutes`.
    pub fn list_stale_in_progress(&self, minutes: i64) -> Result<Vec<Story>> {
        self.query_stories(
            &format!(
                "{STORY_COLUMNS} WHERE status = 'in_progress'
                 AND updated_at <= datetime('now', ?1) ORDER BY id"
            ),
            params![format!("-{} minutes", minutes)],
        )
    }

    fn query_stories(&self, sql: &str, params: &[&dyn rusqlite::ToSql]) -> Result<Vec<Story>> {
        let mut stmt = self.conn.prepare(sql).context("Failed to prepare story query")?;
        let rows = stmt
            .query_map(params, story_row_from_row)
            .context("Failed to query stories")?;
        let mut stories = Vec::new();
        for row in rows {
            stories.push(row.context("Failed to read story row")?.into_story()?);
        }
        Ok(stories)
    }

    pub fn update_story_status(&self, id: i64, status: StoryStatus) -> Result<()> {
        self.conn
            .execute(
                "UPDATE stories SET status = ?1, updated_at = datetime('now') WHERE id = ?2",
                params![status.as_str(), id],
            )
            .context("Failed to update story status")?;
        Ok(())
    }

    /// Bind a story to an agent and move it to `in_progress`.
    pub fn assign_story(&self, story_id: i64, agent_id: &str) -> Result<()> {
        self.conn
            .execute(
                "UPDATE stories SET assigned_agent_id = ?1, status = 'in_progress',
                 updated_at = datetime('now') WHERE id = ?2",
                params![agent_id, story_id],
            )
            .context("Failed to assign story")?;
        Ok(())
    }

    /// Clear the assignment and reset the story to the given status.
    pub fn clear_story_assignment(&self, story_id: i64, status: StoryStatus) -> Result<()> {
        self.conn
            .execute(
                "UPDATE stories SET assigned_agent_id = NULL, status = ?1,
                 updated_at = datetime('now') WHERE id = ?2",
                params![status.as_str(), story_id],
            )
            .context("Failed to clear story assignment")?;
        Ok(())
    }

    /// Count of assigned stories in queue-depth states for one agent.
    pub fn queue_depth(&self, agent_id: &str) -> Result<i64> {
        self.conn
            .query_row(
                "SELECT COUNT(*) FROM stories WHERE assigned_agent_id = ?1
                 AND status IN ('in_progress', 'review', 'qa', 'qa_failed')",
                params![agent_id],
                |row| row.get(0),
            )
            .context("Failed to count queue depth")
    }

    pub fn count_active_workflow_stories(&self) -> Result<i64> {
        self.conn
            .query_row(
                "SELECT COUNT(*) FROM stories WHERE status IN
                 ('planned', 'in_progress', 'review', 'qa', 'qa_failed', 'pr_submitted')",
                [],
                |row| row.get(0),
            )
            .context("Failed to count active stories")
    }

    /// Remaining story points for one team, counting planned and in-flight work.
    pub fn team_story_points(&self, team_id: i64) -> Result<i64> {
        self.conn
            .query_row(
                "SELECT COALESCE(SUM(COALESCE(story_points, complexity_score, 1)), 0)
                 FROM stories WHERE team_id = ?1 AND status IN
                 ('planned', 'in_progress', 'review', 'qa', 'qa_failed', 'pr_submitted')",
                params![team_id],
                |row| row.get(0),
            )
            .context("Failed to sum team story points")
    }

    pub fn add_story_dependency(&self, story_id: i64, depends_on_story_id: i64) -> Result<()> {
        self.conn
            .execute(
                "INSERT OR IGNORE INTO story_dependencies (story_id, depends_on_story_id)
                 VALUES (?1, ?2)",
                params![story_id, depends_on_story_id],
            )
            .context("Failed to insert story dependency")?;
        Ok(())
    }

    pub fn list_story_dependencies(&self) -> Result<Vec<StoryDependency>> {
        let mut stmt = self
            .conn
            .prepare(
                "SELECT story_id, depends_on_story_id FROM story_dependencies
                 ORDER BY story_id, depends_on_story_id",
            )
            .context("Failed to prepare list_story_dependencies")?;
        let rows = stmt
            .query_map([], |row| {
                Ok(StoryDependency {
                    story_id: row.get(0)?,
                    depends_on_story_id: row.get(1)?,
                })
            })
            .context("Failed to query story dependencies")?;
        collect_rows(rows)
    }

    // ── Agents ────────────────────────────────────────────────────────

    pub fn insert_agent(&self, agent: &Agent) -> Result<()> {
        self.conn
            .execute(
                "INSERT INTO agents
                   (id, agent_type, team_id, session_name, model, status,
                    current_story_id, worktree_path, cli_tool)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
                params![
                    agent.id,
                    agent.agent_type.as_str(),
                    agent.team_id,
                    agent.session_name,
                    agent.model,
                    agent.status.as_str(),
                    agent.current_story_id,
                    agent.worktree_path,
                    agent.cli_tool,
                ],
            )
            .context("Failed to insert agent")?;
        Ok(())
    }

    pub fn get_agent(&self, id: &str) -> Result<Option<Agent>> {
        let row = self
            .conn
            .query_row(
                &format!("{AGENT_COLUMNS} WHERE id = ?1"),
                params![id],
                agent_row_from_row,
            )
            .optional()
            .context("Failed to query agent")?;
        row.map(AgentRow::into_agent).transpose()
    }

    pub fn find_agent_by_session(&self, session_name: &str) -> Result<Option<Agent>> {
        let row = self
            .conn
            .query_row(
                &format!("{AGENT_COLUMNS} WHERE session_name = ?1 AND status != 'terminated'"),
                params![session_name],
                agent_row_from_row,
            )
            .optional()
            .context("Failed to query agent by session")?;
        row.map(AgentRow::into_agent).transpose()
    }

    pub fn list_active_agents(&self) -> Result<Vec<Agent>> {
        self.query_agents(
            &format!("{AGENT_COLUMNS} WHERE status != 'terminated' ORDER BY created_at, id"),
            params![],
        )
    }

    pub fn list_active_agents_by_team(&self, team_id: i64) -> Result<Vec<Agent>> {
        self.query_agents(
            &format!(
                "{AGENT_COLUMNS} WHERE team_id = ?1 AND status != 'terminated'
                 ORDER BY created_at, id"
            ),
            params![team_id],
        )
    }

    fn query_agents(&self, sql: &str, params: &[&dyn rusqlite::ToSql]) -> Result<Vec<Agent>> {
        let mut stmt = self.conn.prepare(sql).context("Failed to prepare agent query")?;
        let rows = stmt
            .query_map(params, agent_row_from_row)
            .context("Failed to query agents")?;
        let mut agents = Vec::new();
        for row in rows {
            agents.push(row.context("Failed to read agent row")?.into_agent()?);
        }
        Ok(agents)
    }

    pub fn update_agent_status(&self, id: &str, status: AgentStatus) -> Result<()> {
        self.conn
            .execute(
                "UPDATE agents SET status = ?1, updated_at = datetime('now') WHERE id = ?2",
                params![status.as_str(), id],
            )
            .context("Failed to update agent status")?;
        Ok(())
    }

    /// Point an agent at a story (or clear it) and flip it to `working`.
    pub fn set_agent_story(&self, id: &str, story_id: Option<i64>) -> Result<()> {
        self.conn
            .execute(
                "UPDATE agents SET current_story_id = ?1, status = 'working',
                 updated_at = datetime('now') WHERE id = ?2",
                params![story_id, id],
            )
            .context("Failed to set agent story")?;
        Ok(())
    }

    /// Terminate: clears the current story and worktree columns in one step.
    pub fn terminate_agent(&self, id: &str) -> Result<()> {
        self.conn
            .execute(
                "UPDATE agents SET status = 'terminated', current_story_id = NULL,
                 worktree_path = NULL, updated_at = datetime('now') WHERE id = ?1",
                params![id],
            )
            .context("Failed to terminate agent")?;
        Ok(())
    }

    // ── Pull requests ─────────────────────────────────────────────────

    #[allow(clippy::too_many_arguments)]
    pub fn create_pull_request(
        &self,
        story_id: Option<i64>,
        team_id: Option<i64>,
        branch_name: &str,
        submitted_by: &str,
        pr_number: Option<i64>,
        pr_url: Option<&str>,
    ) -> Result<PullRequest> {
        self.conn
            .execute(
                "INSERT INTO pull_requests
                   (story_id, team_id, branch_name, submitted_by, pr_number, pr_url)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                params![story_id, team_id, branch_name, submitted_by, pr_number, pr_url],
            )
            .context("Failed to insert pull request")?;
        let id = self.conn.last_insert_rowid();
        self.get_pull_request(id)?
            .context("Pull request not found after insert")
    }

    pub fn get_pull_request(&self, id: i64) -> Result<Option<PullRequest>> {
        self.conn
            .query_row(
                &format!("{PR_COLUMNS} WHERE id = ?1"),
                params![id],
                pr_from_row,
            )
            .optional()
            .context("Failed to query pull request")
    }

    pub fn find_pull_request_by_branch(&self, branch_name: &str) -> Result<Option<PullRequest>> {
        self.conn
            .query_row(
                &format!("{PR_COLUMNS} WHERE branch_name = ?1 AND status != 'closed' ORDER BY id DESC"),
                params![branch_name],
                pr_from_row,
            )
            .optional()
            .context("Failed to query pull request by branch")
    }

    pub fn list_pull_requests_by_status(&self, status: PrStatus) -> Result<Vec<PullRequest>> {
        let mut stmt = self
            .conn
            .prepare(&format!("{PR_COLUMNS} WHERE status = ?1 ORDER BY id"))
            .context("Failed to prepare list_pull_requests_by_status")?;
        let rows = stmt
            .query_map(params![status.as_str()], pr_from_row)
            .context("Failed to query pull requests")?;
        collect_rows(rows)
    }

    pub fn update_pull_request_status(&self, id: i64, status: PrStatus) -> Result<()> {
        self.conn
            .execute(
                "UPDATE pull_requests SET status = ?1, updated_at = datetime('now') WHERE id = ?2",
                params![status.as_str(), id],
            )
            .context("Failed to update pull request status")?;
        Ok(())
    }

    pub fn set_pull_request_number(&self, id: i64, pr_number: i64) -> Result<()> {
        self.conn
            .execute(
                "UPDATE pull_requests SET pr_number = ?1, updated_at = datetime('now')
                 WHERE id = ?2",
                params![pr_number, id],
            )
            .context("Failed to set pull request number")?;
        Ok(())
    }

    /// Extract PR numbers from stored URLs into the `pr_number` column.
    /// Idempotent: rows with a number already set are untouched.
    pub fn backfill_pr_numbers(&self) -> Result<usize> {
        let mut stmt = self
            .conn
            .prepare(
                "SELECT id, pr_url FROM pull_requests
                 WHERE pr_number IS NULL AND pr_url IS NOT NULL",
            )
            .context("Failed to prepare backfill query")?;
        let rows = stmt
            .query_map([], |row| Ok((row.get::<_, i64>(0)?, row.get::<_, String>(1)?)))
            .context("Failed to query pull requests for backfill")?;

        let mut updated = 0;
        for row in rows {
            let (id, url) = row.context("Failed to read backfill row")?;
            if let Some(number) = pr_number_from_url(&url) {
                self.set_pull_request_number(id, number)?;
                updated += 1;
            }
        }
        Ok(updated)
    }

    // ── Messages ──────────────────────────────────────────────────────

    pub fn send_message(
        &self,
        from_session: &str,
        to_session: &str,
        subject: Option<&str>,
        body: &str,
    ) -> Result<Message> {
        self.conn
            .execute(
                "INSERT INTO messages (from_session, to_session, subject, body)
                 VALUES (?1, ?2, ?3, ?4)",
                params![from_session, to_session, subject, body],
            )
            .context("Failed to insert message")?;
        let id = self.conn.last_insert_rowid();
        self.get_message(id)?.context("Message not found after insert")
    }

    pub fn get_message(&self, id: i64) -> Result<Option<Message>> {
        self.conn
            .query_row(
                &format!("{MESSAGE_COLUMNS} WHERE id = ?1"),
                params![id],
                message_from_row,
            )
            .optional()
            .context("Failed to query message")
    }

    pub fn inbox(&self, to_session: &str, include_read: bool) -> Result<Vec<Message>> {
        let sql = if include_read {
            format!("{MESSAGE_COLUMNS} WHERE to_session = ?1 ORDER BY id")
        } else {
            format!("{MESSAGE_COLUMNS} WHERE to_session = ?1 AND status = 'pending' ORDER BY id")
        };
        let mut stmt = self.conn.prepare(&sql).context("Failed to prepare inbox")?;
        let rows = stmt
            .query_map(params![to_session], message_from_row)
            .context("Failed to query inbox")?;
        collect_rows(rows)
    }

    /// Flip `pending → read`. Reading an already-read message is a no-op;
    /// returns whether this call performed the flip.
    pub fn mark_message_read(&self, id: i64) -> Result<bool> {
        let changed = self
            .conn
            .execute(
                "UPDATE messages SET status = 'read', updated_at = datetime('now')
                 WHERE id = ?1 AND status = 'pending'",
                params![id],
            )
            .context("Failed to mark message read")?;
        Ok(changed > 0)
    }

    /// Set the reply and flip to `replied`; a second reply is a no-op.
    pub fn reply_message(&self, id: i64, reply: &str) -> Result<bool> {
        let changed = self
            .conn
            .execute(
                "UPDATE messages SET reply = ?1, status = 'replied', updated_at = datetime('now')
                 WHERE id = ?2 AND status != 'replied'",
                params![reply, id],
            )
            .context("Failed to reply to message")?;
        Ok(changed > 0)
    }

    // ── Escalations ───────────────────────────────────────────────────

    pub fn create_escalation(
        &self,
        story_id: Option<i64>,
        from_agent_id: Option<&str>,
        to_agent_id: Option<&str>,
        reason: &str,
    ) -> Result<Escalation> {
        self.conn
            .execute(
                "INSERT INTO escalations (story_id, from_agent_id, to_agent_id, reason)
                 VALUES (?1, ?2, ?3, ?4)",
                params![story_id, from_agent_id, to_agent_id, reason],
            )
            .context("Failed to insert escalation")?;
        let id = self.conn.last_insert_rowid();
        self.get_escalation(id)?
            .context("Escalation not found after insert")
    }

    pub fn get_escalation(&self, id: i64) -> Result<Option<Escalation>> {
        self.conn
            .query_row(
                &format!("{ESCALATION_COLUMNS} WHERE id = ?1"),
                params![id],
                escalation_from_row,
            )
            .optional()
            .context("Failed to query escalation")
    }

    pub fn list_escalations_by_status(&self, status: EscalationStatus) -> Result<Vec<Escalation>> {
        let mut stmt = self
            .conn
            .prepare(&format!("{ESCALATION_COLUMNS} WHERE status = ?1 ORDER BY id"))
            .context("Failed to prepare list_escalations_by_status")?;
        let rows = stmt
            .query_map(params![status.as_str()], escalation_from_row)
            .context("Failed to query escalations")?;
        collect_rows(rows)
    }

    pub fn pending_escalations_from(&self, from_agent_id: &str) -> Result<Vec<Escalation>> {
        let mut stmt = self
            .conn
            .prepare(&format!(
                "{ESCALATION_COLUMNS} WHERE from_agent_id = ?1 AND status != 'resolved' ORDER BY id"
            ))
            .context("Failed to prepare pending_escalations_from")?;
        let rows = stmt
            .query_map(params![from_agent_id], escalation_from_row)
            .context("Failed to query escalations")?;
        collect_rows(rows)
    }

    /// True when an unresolved escalation exists for the agent, or one was
    /// raised within the last `minutes`. Gates duplicate escalation noise.
    pub fn has_recent_escalation_from(&self, from_agent_id: &str, minutes: i64) -> Result<bool> {
        let count: i64 = self
            .conn
            .query_row(
                "SELECT COUNT(*) FROM escalations WHERE from_agent_id = ?1
                 AND (status != 'resolved' OR created_at >= datetime('now', ?2))",
                params![from_agent_id, format!("-{} minutes", minutes)],
                |row| row.get(0),
            )
            .context("Failed to count recent escalations")?;
        Ok(count > 0)
    }

    pub fn resolve_escalation(&self, id: i64, resolution: &str) -> Result<()> {
        self.conn
            .execute(
                "UPDATE escalations SET status = 'resolved', resolution = ?1,
                 updated_at = datetime('now') WHERE id = ?2",
                params![resolution, id],
            )
            .context("Failed to resolve escalation")?;
        Ok(())
    }

    // ── Event log ─────────────────────────────────────────────────────

    /// Append one audit event. The log is never mutated after insert.
    pub fn create_log(
        &self,
        agent_id: &str,
        story_id: Option<i64>,
        event_type: &str,
        status: Option<&str>,
        message: Option<&str>,
        metadata: Option<&serde_json::Value>,
    ) -> Result<()> {
        let metadata = metadata
            .map(serde_json::to_string)
            .transpose()
            .context("Failed to serialize event metadata")?;
        self.conn
            .execute(
                "INSERT INTO event_log (agent_id, story_id, event_type, status, message, metadata)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                params![agent_id, story_id, event_type, status, message, metadata],
            )
            .context("Failed to insert event log row")?;
        Ok(())
    }

    pub fn list_events(&self, limit: i64) -> Result<Vec<EventLogEntry>> {
        let mut stmt = self
            .conn
            .prepare(
                "SELECT id, agent_id, story_id, event_type, status, message, metadata, created_at
                 FROM event_log ORDER BY id DESC LIMIT ?1",
            )
            .context("Failed to prepare list_events")?;
        let rows = stmt
            .query_map(params![limit], |row| {
                Ok(EventRow {
                    id: row.get(0)?,
                    agent_id: row.get(1)?,
                    story_id: row.get(2)?,
                    event_type: row.get(3)?,
                    status: row.get(4)?,
                    message: row.get(5)?,
                    metadata: row.get(6)?,
                    created_at: row.get(7)?,
                })
            })
            .context("Failed to query events")?;
        let mut events = Vec::new();
        for row in rows {
            events.push(row.context("Failed to read event row")?.into_entry()?);
        }
        Ok(events)
    }
}

/// Shared handle for async callers; the mutex serializes access to the one
/// writer connection. Closures must stay short-lived.
#[derive(Clone)]
pub struct DbHandle {
    inner: Arc<Mutex<Store>>,
}

impl DbHandle {
    pub fn new(store: Store) -> Self {
        Self {
            inner: Arc::new(Mutex::new(store)),
        }
    }

    pub async fn call<F, T>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&Store) -> Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let inner = Arc::clone(&self.inner);
        tokio::task::spawn_blocking(move || {
            let store = inner.lock().map_err(|_| anyhow!(StoreError::LockPoisoned))?;
            f(&store)
        })
        .await
        .context("Database task panicked")?
    }
}

/// Fail fast when a non-trivial database file has neither recorded
/// migrations nor any core-table rows: that shape only occurs when a file
/// was truncated or half-written. A concurrent atomic rename can produce a
/// transient false positive, which `open_with_retry` absorbs.
fn probe_corruption(conn: &Connection, path: &Path, size: u64) -> Result<(), StoreError> {
    if size < CORRUPTION_PROBE_MIN_BYTES {
        return Ok(());
    }

    let corruption = || StoreError::DatabaseCorruption {
        path: path.to_path_buf(),
    };

    let count_or_zero = |sql: &str| -> Result<i64, StoreError> {
        match conn.query_row(sql, [], |row| row.get::<_, i64>(0)) {
            Ok(n) => Ok(n),
            // Missing table reads as zero rows; any other failure on a
            // file this large is itself corruption.
            Err(rusqlite::Error::SqliteFailure(_, Some(msg))) if msg.contains("no such table") => {
                Ok(0)
            }
            Err(_) => Err(corruption()),
        }
    };

    let migrations = count_or_zero("SELECT COUNT(*) FROM migrations")?;
    if migrations > 0 {
        return Ok(());
    }
    let core_rows = count_or_zero("SELECT COUNT(*) FROM teams")?
        + count_or_zero("SELECT COUNT(*) FROM agents")?
        + count_or_zero("SELECT COUNT(*) FROM stories")?;
    if core_rows == 0 {
        return Err(corruption());
    }
    Ok(())
}

fn sibling(path: &Path, ext: &str) -> PathBuf {
    PathBuf::from(format!("{}.{}", path.display(), ext))
}

fn pr_number_from_url(url: &str) -> Option<i64> {
    url.rsplit('/').next().and_then(|tail| tail.parse().ok())
}

fn collect_rows<T>(rows: impl Iterator<Item = rusqlite::Result<T>>) -> Result<Vec<T>> {
    let mut out = Vec::new();
    for row in rows {
        out.push(row.context("Failed to read row")?);
    }
    Ok(out)
}

// ── Row mapping ───────────────────────────────────────────────────────

const REQUIREMENT_COLUMNS: &str = "SELECT id, title, description, status, godmode, target_branch,
    feature_branch, external_epic_key, external_epic_id, external_epic_provider,
    created_at, updated_at FROM requirements";

const STORY_COLUMNS: &str = "SELECT id, requirement_id, team_id, title, description,
    acceptance_criteria, complexity_score, story_points, status, assigned_agent_id,
    branch_name, pr_url, external_issue_key, external_issue_id, external_issue_provider,
    created_at, updated_at FROM stories";

const AGENT_COLUMNS: &str = "SELECT id, agent_type, team_id, session_name, model, status,
    current_story_id, worktree_path, cli_tool, created_at, updated_at FROM agents";

const PR_COLUMNS: &str = "SELECT id, story_id, team_id, branch_name, pr_number, pr_url,
    submitted_by, reviewed_by, status, review_notes, created_at, updated_at FROM pull_requests";

const MESSAGE_COLUMNS: &str = "SELECT id, from_session, to_session, subject, body, reply,
    status, created_at, updated_at FROM messages";

const ESCALATION_COLUMNS: &str = "SELECT id, story_id, from_agent_id, to_agent_id, reason,
    status, resolution, created_at, updated_at FROM escalations";

fn team_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Team> {
    Ok(Team {
        id: row.get(0)?,
        name: row.get(1)?,
        repo_url: row.get(2)?,
        repo_path: row.get(3)?,
        created_at: row.get(4)?,
    })
}

fn requirement_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Requirement> {
    let status: String = row.get(3)?;
    Ok(Requirement {
        id: row.get(0)?,
        title: row.get(1)?,
        description: row.get(2)?,
        status: RequirementStatus::from_str(&status).unwrap_or(RequirementStatus::Pending),
        godmode: row.get::<_, i64>(4)? != 0,
        target_branch: row.get(5)?,
        feature_branch: row.get(6)?,
        external_epic_key: row.get(7)?,
        external_epic_id: row.get(8)?,
        external_epic_provider: row.get(9)?,
        created_at: row.get(10)?,
        updated_at: row.get(11)?,
    })
}

/// Intermediate row struct for reading stories before converting the
/// status string and acceptance-criteria JSON into typed values.
struct StoryRow {
    id: i64,
    requirement_id: Option<i64>,
    team_id: Option<i64>,
    title: String,
    description: String,
    acceptance_criteria: String,
    complexity_score: Option<i64>,
    story_points: Option<i64>,
    status: String,
    assigned_agent_id: Option<String>,
    branch_name: Option<String>,
    pr_url: Option<String>,
    external_issue_key: Option<String>,
    external_issue_id: Option<String>,
    external_issue_provider: Option<String>,
    created_at: String,
    updated_at: String,
}

impl StoryRow {
    fn into_story(self) -> Result<Story> {
        let status = StoryStatus::from_str(&self.status)
            .map_err(|e| anyhow!(e))
            .context("Failed to parse story status")?;
        let acceptance_criteria: Vec<String> = serde_json::from_str(&self.acceptance_criteria)
            .context("Failed to parse acceptance criteria JSON")?;
        Ok(Story {
            id: self.id,
            requirement_id: self.requirement_id,
            team_id: self.team_id,
            title: self.title,
            description: self.description,
            acceptance_criteria,
            complexity_score: self.complexity_score,
            story_points: self.story_points,
            status,
            assigned_agent_id: self.assigned_agent_id,
            branch_name: self.branch_name,
            pr_url: self.pr_url,
            external_issue_key: self.external_issue_key,
            external_issue_id: self.external_issue_id,
            external_issue_provider: self.external_issue_provider,
            created_at: self.created_at,
            updated_at: self.updated_at,
        })
    }
}

fn story_row_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<StoryRow> {
    Ok(StoryRow {
        id: row.get(0)?,
        requirement_id: row.get(1)?,
        team_id: row.get(2)?,
        title: row.get(3)?,
        description: row.get(4)?,
        acceptance_criteria: row.get(5)?,
        complexity_score: row.get(6)?,
        story_points: row.get(7)?,
        status: row.get(8)?,
        assigned_agent_id: row.get(9)?,
        branch_name: row.get(10)?,
        pr_url: row.get(11)?,
        external_issue_key: row.get(12)?,
        external_issue_id: row.get(13)?,
        external_issue_provider: row.get(14)?,
        created_at: row.get(15)?,
        updated_at: row.get(16)?,
    })
}

struct AgentRow {
    id: String,
    agent_type: String,
    team_id: Option<i64>,
    session_name: Option<String>,
    model: String,
    status: String,
    current_story_id: Option<i64>,
    worktree_path: Option<String>,
    cli_tool: String,
    created_at: String,
    updated_at: String,
}

impl AgentRow {
    fn into_agent(self) -> Result<Agent> {
        let agent_type = AgentType::from_str(&self.agent_type)
            .map_err(|e| anyhow!(e))
            .context("Failed to parse agent type")?;
        let status = AgentStatus::from_str(&self.status)
            .map_err(|e| anyhow!(e))
            .context("Failed to parse agent status")?;
        Ok(Agent {
            id: self.id,
            agent_type,
            team_id: self.team_id,
            session_name: self.session_name,
            model: self.model,
            status,
            current_story_id: self.current_story_id,
            worktree_path: self.worktree_path,
            cli_tool: self.cli_tool,
            created_at: self.created_at,
            updated_at: self.updated_at,
        })
    }
}

fn agent_row_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<AgentRow> {
    Ok(AgentRow {
        id: row.get(0)?,
        agent_type: row.get(1)?,
        team_id: row.get(2)?,
        session_name: row.get(3)?,
        model: row.get(4)?,
        status: row.get(5)?,
        current_story_id: row.get(6)?,
        worktree_path: row.get(7)?,
        cli_tool: row.get(8)?,
        created_at: row.get(9)?,
        updated_at: row.get(10)?,
    })
}

fn pr_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<PullRequest> {
    let status: String = row.get(8)?;
    Ok(PullRequest {
        id: row.get(0)?,
        story_id: row.get(1)?,
        team_id: row.get(2)?,
        branch_name: row.get(3)?,
        pr_number: row.get(4)?,
        pr_url: row.get(5)?,
        submitted_by: row.get(6)?,
        reviewed_by: row.get(7)?,
        status: PrStatus::from_str(&status).unwrap_or(PrStatus::Queued),
        review_notes: row.get(9)?,
        created_at: row.get(10)?,
        updated_at: row.get(11)?,
    })
}

fn message_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Message> {
    let status: String = row.get(6)?;
    Ok(Message {
        id: row.get(0)?,
        from_session: row.get(1)?,
        to_session: row.get(2)?,
        subject: row.get(3)?,
        body: row.get(4)?,
        reply: row.get(5)?,
        status: MessageStatus::from_str(&status).unwrap_or(MessageStatus::Pending),
        created_at: row.get(7)?,
        updated_at: row.get(8)?,
    })
}

fn escalation_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Escalation> {
    let status: String = row.get(5)?;
    Ok(Escalation {
        id: row.get(0)?,
        story_id: row.get(1)?,
        from_agent_id: row.get(2)?,
        to_agent_id: row.get(3)?,
        reason: row.get(4)?,
        status: EscalationStatus::from_str(&status).unwrap_or(EscalationStatus::Pending),
        resolution: row.get(6)?,
        created_at: row.get(7)?,
        updated_at: row.get(8)?,
    })
}

struct EventRow {
    id: i64,
    agent_id: String,
    story_id: Option<i64>,
    event_type: String,
    status: Option<String>,
    message: Option<String>,
    metadata: Option<String>,
    created_at: String,
}

impl EventRow {
    fn into_entry(self) -> Result<EventLogEntry> {
        let metadata = self
            .metadata
            .as_deref()
            .map(serde_json::from_str)
            .transpose()
            .context("Failed to parse event metadata JSON")?;
        Ok(EventLogEntry {
            id: self.id,
            agent_id: self.agent_id,
            story_id: self.story_id,
            event_type: self.event_type,
            status: self.status,
            message: self.message,
            metadata,
            created_at: self.created_at,
        })
    }
}

// ── Tests ─────────────────────────────────────────────────────────────
