//! Ordered, recorded schema migrations.
//!
//! Each migration is a named SQL batch recorded in the `migrations` table.
//! A fresh database applies the whole list; an existing database applies only
//! entries whose name is not yet recorded. The applied order below is
//! load-bearing for databases created by earlier releases: `006-integrations`
//! and `007-backfill-story-points` run after the `010`–`012` entries, and the
//! list must never be reordered.

use rusqlite::Connection;

use crate::errors::StoreError;

pub struct Migration {
    pub name: &'static str,
    pub sql: &'static str,
}

pub const MIGRATIONS: &[Migration] = &[
    Migration {
        name: "001-initial-schema",
        sql: "
            CREATE TABLE IF NOT EXISTS teams (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                name TEXT NOT NULL UNIQUE,
                repo_url TEXT NOT NULL,
                repo_path TEXT NOT NULL,
                created_at TEXT NOT NULL DEFAULT (datetime('now'))
            );

            CREATE TABLE IF NOT EXISTS agents (
                id TEXT PRIMARY KEY,
                agent_type TEXT NOT NULL CHECK (agent_type IN
                    ('tech_lead', 'senior', 'intermediate', 'junior', 'qa', 'feature_test')),
                team_id INTEGER REFERENCES teams(id),
                session_name TEXT,
                model TEXT NOT NULL,
                status TEXT NOT NULL DEFAULT 'idle' CHECK (status IN
                    ('idle', 'working', 'blocked', 'terminated')),
                current_story_id INTEGER,
                created_at TEXT NOT NULL DEFAULT (datetime('now')),
                updated_at TEXT NOT NULL DEFAULT (datetime('now'))
            );

            CREATE TABLE IF NOT EXISTS stories (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                requirement_id INTEGER,
                team_id INTEGER REFERENCES teams(id),
                title TEXT NOT NULL,
                description TEXT NOT NULL DEFAULT '',
                acceptance_criteria TEXT NOT NULL DEFAULT '[]',
                complexity_score INTEGER CHECK (complexity_score BETWEEN 1 AND 13),
                status TEXT NOT NULL DEFAULT 'draft' CHECK (status IN
                    ('draft', 'estimated', 'planned', 'in_progress', 'review',
                     'qa', 'qa_failed', 'pr_submitted', 'merged')),
                assigned_agent_id TEXT REFERENCES agents(id),
                branch_name TEXT,
                pr_url TEXT,
                created_at TEXT NOT NULL DEFAULT (datetime('now')),
                updated_at TEXT NOT NULL DEFAULT (datetime('now'))
            );

            CREATE INDEX IF NOT EXISTS idx_stories_status ON stories(status);
            CREATE INDEX IF NOT EXISTS idx_stories_team ON stories(team_id);
            CREATE INDEX IF NOT EXISTS idx_stories_assigned ON stories(assigned_agent_id);
            CREATE INDEX IF NOT EXISTS idx_agents_team ON agents(team_id);
            CREATE INDEX IF NOT EXISTS idx_agents_status ON agents(status);
            ",
    },
    Migration {
        name: "002-requirements",
        sql: "
            CREATE TABLE IF NOT EXISTS requirements (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                title TEXT NOT NULL,
                description TEXT NOT NULL DEFAULT '',
                status TEXT NOT NULL DEFAULT 'pending' CHECK (status IN
                    ('pending', 'planning', 'planned', 'in_progress', 'completed')),
                godmode INTEGER NOT NULL DEFAULT 0,
                target_branch TEXT NOT NULL DEFAULT 'main',
                feature_branch TEXT,
                created_at TEXT NOT NULL DEFAULT (datetime('now')),
                updated_at TEXT NOT NULL DEFAULT (datetime('now'))
            );

            CREATE INDEX IF NOT EXISTS idx_requirements_status ON requirements(status);
            CREATE INDEX IF NOT EXISTS idx_stories_requirement ON stories(requirement_id);
            ",
    },
    Migration {
        name: "003-agent-worktrees",
        sql: "ALTER TABLE agents ADD COLUMN worktree_path TEXT;",
    },
    Migration {
        name: "004-pull-requests",
        sql: "
            CREATE TABLE IF NOT EXISTS pull_requests (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                story_id INTEGER REFERENCES stories(id),
                team_id INTEGER REFERENCES teams(id),
                branch_name TEXT NOT NULL,
                pr_url TEXT,
                submitted_by TEXT NOT NULL,
                reviewed_by TEXT,
                status TEXT NOT NULL DEFAULT 'queued' CHECK (status IN
                    ('queued', 'reviewing', 'approved', 'merged', 'rejected', 'closed')),
                review_notes TEXT,
                created_at TEXT NOT NULL DEFAULT (datetime('now')),
                updated_at TEXT NOT NULL DEFAULT (datetime('now'))
            );

            CREATE INDEX IF NOT EXISTS idx_prs_team_status ON pull_requests(team_id, status);
            CREATE INDEX IF NOT EXISTS idx_prs_story ON pull_requests(story_id);
            ",
    },
    Migration {
        name: "005-escalations",
        sql: "
            CREATE TABLE IF NOT EXISTS escalations (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                story_id INTEGER REFERENCES stories(id),
                from_agent_id TEXT REFERENCES agents(id),
                to_agent_id TEXT REFERENCES agents(id),
                reason TEXT NOT NULL,
                status TEXT NOT NULL DEFAULT 'pending' CHECK (status IN
                    ('pending', 'acknowledged', 'resolved')),
                resolution TEXT,
                created_at TEXT NOT NULL DEFAULT (datetime('now')),
                updated_at TEXT NOT NULL DEFAULT (datetime('now'))
            );

            CREATE INDEX IF NOT EXISTS idx_escalations_status ON escalations(status);
            ",
    },
    Migration {
        name: "008-messages",
        sql: "
            CREATE TABLE IF NOT EXISTS messages (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                from_session TEXT NOT NULL,
                to_session TEXT NOT NULL,
                subject TEXT,
                body TEXT NOT NULL,
                reply TEXT,
                status TEXT NOT NULL DEFAULT 'pending' CHECK (status IN
                    ('pending', 'read', 'replied')),
                created_at TEXT NOT NULL DEFAULT (datetime('now')),
                updated_at TEXT NOT NULL DEFAULT (datetime('now'))
            );

            CREATE INDEX IF NOT EXISTS idx_messages_to ON messages(to_session);
            ",
    },
    Migration {
        name: "009-event-log",
        sql: "
            CREATE TABLE IF NOT EXISTS event_log (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                agent_id TEXT NOT NULL,
                story_id INTEGER,
                event_type TEXT NOT NULL,
                status TEXT,
                message TEXT,
                metadata TEXT,
                created_at TEXT NOT NULL DEFAULT (datetime('now'))
            );

            CREATE INDEX IF NOT EXISTS idx_event_log_agent ON event_log(agent_id);
            CREATE INDEX IF NOT EXISTS idx_event_log_story ON event_log(story_id);
            ",
    },
    Migration {
        name: "010-story-dependencies",
        sql: "
            CREATE TABLE IF NOT EXISTS story_dependencies (
                story_id INTEGER NOT NULL REFERENCES stories(id),
                depends_on_story_id INTEGER NOT NULL REFERENCES stories(id),
                PRIMARY KEY (story_id, depends_on_story_id)
            );
            ",
    },
    Migration {
        name: "011-pr-numbers",
        sql: "ALTER TABLE pull_requests ADD COLUMN pr_number INTEGER;",
    },
    Migration {
        // Rebuild requirements to widen the status CHECK with the sign-off
        // branch. SQLite cannot alter a CHECK constraint in place.
        name: "012-requirement-signoff",
        sql: "
            CREATE TABLE requirements_new (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                title TEXT NOT NULL,
                description TEXT NOT NULL DEFAULT '',
                status TEXT NOT NULL DEFAULT 'pending' CHECK (status IN
                    ('pending', 'planning', 'planned', 'in_progress', 'completed',
                     'sign_off', 'sign_off_failed', 'sign_off_passed')),
                godmode INTEGER NOT NULL DEFAULT 0,
                target_branch TEXT NOT NULL DEFAULT 'main',
                feature_branch TEXT,
                created_at TEXT NOT NULL DEFAULT (datetime('now')),
                updated_at TEXT NOT NULL DEFAULT (datetime('now'))
            );

            INSERT INTO requirements_new
                (id, title, description, status, godmode, target_branch,
                 feature_branch, created_at, updated_at)
            SELECT id, title, description, status, godmode, target_branch,
                   feature_branch, created_at, updated_at
            FROM requirements;

            DROP TABLE requirements;
            ALTER TABLE requirements_new RENAME TO requirements;
            CREATE INDEX IF NOT EXISTS idx_requirements_status ON requirements(status);
            ",
    },
    // 006 and 007 were shipped out of sequence and recorded after 012 in
    // every deployed database; keep that applied order.
    Migration {
        name: "006-integrations",
        sql: "
            ALTER TABLE requirements ADD COLUMN external_epic_key TEXT;
            ALTER TABLE requirements ADD COLUMN external_epic_id TEXT;
            ALTER TABLE requirements ADD COLUMN external_epic_provider TEXT;
            ALTER TABLE stories ADD COLUMN external_issue_key TEXT;
            ALTER TABLE stories ADD COLUMN external_issue_id TEXT;
            ALTER TABLE stories ADD COLUMN external_issue_provider TEXT;
            ",
    },
    Migration {
        name: "007-backfill-story-points",
        sql: "
            ALTER TABLE stories ADD COLUMN story_points INTEGER;
            UPDATE stories SET story_points = complexity_score
            WHERE story_points IS NULL AND complexity_score IS NOT NULL;
            ",
    },
    Migration {
        name: "013-agent-cli-tool",
        sql: "ALTER TABLE agents ADD COLUMN cli_tool TEXT NOT NULL DEFAULT 'claude';",
    },
];

/// Apply every migration whose name is not yet recorded, in declared order.
/// Each batch runs inside its own transaction together with the bookkeeping
/// insert, so a crash mid-migration leaves the name unrecorded and the batch
/// re-runs on next open.
pub fn run_migrations(conn: &Connection) -> Result<(), StoreError> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS migrations (
            name TEXT PRIMARY KEY,
            applied_at TEXT NOT NULL DEFAULT (datetime('now'))
        );",
    )?;

    for migration in MIGRATIONS {
        let applied: bool = conn
            .query_row(
                "SELECT COUNT(*) FROM migrations WHERE name = ?1",
                [migration.name],
                |row| row.get::<_, i64>(0),
            )
            .map(|n| n > 0)?;
        if applied {
            continue;
        }

        let run = || -> Result<(), rusqlite::Error> {
            conn.execute_batch("BEGIN IMMEDIATE")?;
            conn.execute_batch(migration.sql)?;
            conn.execute("INSERT INTO migrations (name) VALUES (?1)", [migration.name])?;
            conn.execute_batch("COMMIT")?;
            Ok(())
        };

        if let Err(source) = run() {
            let _ = conn.execute_batch("ROLLBACK");
            return Err(StoreError::MigrationFailed {
                name: migration.name.to_string(),
                source,
            });
        }
        tracing::debug!(migration = migration.name, "applied migration");
    }

    Ok(())
}

/// Names already recorded in the `migrations` table, in applied order.
pub fn applied_migrations(conn: &Connection) -> Result<Vec<String>, StoreError> {
    let mut stmt = conn.prepare("SELECT name FROM migrations ORDER BY rowid")?;
    let rows = stmt.query_map([], |row| row.get::<_, String>(0))?;
    let mut names = Vec::new();
    for row in rows {
        names.push(row?);
    }
    Ok(names)
}
