use rusqlite::Connection;

use crate::error::Result;

/// Initialise the lifecycle schema in `conn`.
///
/// Every table is created idempotently, and every due-time column carries an
/// index so the poll queries stay range scans as the tables grow.
pub fn init_db(conn: &Connection) -> Result<()> {
    create_effects_table(conn)?;
    create_privileges_table(conn)?;
    create_contest_tables(conn)?;
    create_offers_table(conn)?;
    create_heists_table(conn)?;
    create_awards_table(conn)?;
    Ok(())
}

fn create_effects_table(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "
        CREATE TABLE IF NOT EXISTS scheduled_effects (
            id          TEXT    NOT NULL PRIMARY KEY,
            subject_id  TEXT    NOT NULL,
            context_id  TEXT    NOT NULL,
            kind        TEXT    NOT NULL,   -- privilege_grant | nickname_override | numeric_boost | one_shot_flag
            payload     TEXT    NOT NULL,
            restore     TEXT,               -- value needed to undo, if any
            expires_at  TEXT,               -- NULL: one-shot, no auto-expiry
            active      INTEGER NOT NULL DEFAULT 1,
            created_at  TEXT    NOT NULL,
            resolved_at TEXT
        ) STRICT;

        -- Poll: SELECT … WHERE active = 1 AND expires_at <= ?
        CREATE INDEX IF NOT EXISTS idx_effects_due
            ON scheduled_effects (active, expires_at);
        CREATE INDEX IF NOT EXISTS idx_effects_subject
            ON scheduled_effects (subject_id, kind, active);
        ",
    )?;
    Ok(())
}

fn create_privileges_table(conn: &Connection) -> Result<()> {
    // One row per (subject, privilege): re-granting replaces the expiry.
    conn.execute_batch(
        "
        CREATE TABLE IF NOT EXISTS privilege_expirations (
            subject_id   TEXT NOT NULL,
            privilege_id TEXT NOT NULL,
            context_id   TEXT,              -- originating context, if known
            expires_at   TEXT NOT NULL,
            created_at   TEXT NOT NULL,
            PRIMARY KEY (subject_id, privilege_id)
        ) STRICT;

        CREATE INDEX IF NOT EXISTS idx_privileges_expires
            ON privilege_expirations (expires_at);
        ",
    )?;
    Ok(())
}

fn create_contest_tables(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "
        CREATE TABLE IF NOT EXISTS contests (
            id           TEXT    NOT NULL PRIMARY KEY,
            context_id   TEXT    NOT NULL,
            channel_id   TEXT    NOT NULL,
            title        TEXT    NOT NULL,
            reward       TEXT    NOT NULL,   -- JSON-encoded Reward
            ends_at      TEXT    NOT NULL,
            winner_count INTEGER NOT NULL,
            status       TEXT    NOT NULL DEFAULT 'active',
            notice       TEXT,               -- JSON-encoded NoticeRef
            host_id      TEXT,
            created_at   TEXT    NOT NULL,
            ended_at     TEXT
        ) STRICT;

        CREATE INDEX IF NOT EXISTS idx_contests_due
            ON contests (status, ends_at);

        -- Append-only participant set.
        CREATE TABLE IF NOT EXISTS contest_participants (
            contest_id  TEXT NOT NULL REFERENCES contests(id),
            subject_id  TEXT NOT NULL,
            joined_at   TEXT NOT NULL,
            PRIMARY KEY (contest_id, subject_id)
        ) STRICT;

        -- Every draw, initial and re-draws.
        CREATE TABLE IF NOT EXISTS contest_draws (
            contest_id  TEXT    NOT NULL REFERENCES contests(id),
            draw_no     INTEGER NOT NULL,
            winners     TEXT    NOT NULL,   -- JSON array of subject ids
            drawn_at    TEXT    NOT NULL,
            PRIMARY KEY (contest_id, draw_no)
        ) STRICT;
        ",
    )?;
    Ok(())
}

fn create_offers_table(conn: &Connection) -> Result<()> {
    // Deferred Choice rewards waiting for the recipient to pick.
    conn.execute_batch(
        "
        CREATE TABLE IF NOT EXISTS reward_offers (
            id           TEXT NOT NULL PRIMARY KEY,
            contest_id   TEXT,
            subject_id   TEXT NOT NULL,
            context_id   TEXT NOT NULL,
            guaranteed   TEXT NOT NULL,     -- JSON Reward
            alternatives TEXT NOT NULL,     -- JSON [WeightedReward]
            status       TEXT NOT NULL DEFAULT 'pending',
            chosen       TEXT,              -- JSON Reward once claimed
            created_at   TEXT NOT NULL,
            claimed_at   TEXT
        ) STRICT;

        CREATE INDEX IF NOT EXISTS idx_offers_subject
            ON reward_offers (subject_id, status);
        ",
    )?;
    Ok(())
}

fn create_heists_table(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "
        CREATE TABLE IF NOT EXISTS heists (
            id           TEXT    NOT NULL PRIMARY KEY,
            context_id   TEXT    NOT NULL,
            channel_id   TEXT    NOT NULL,
            code         TEXT    NOT NULL,
            payload      TEXT    NOT NULL,
            status       TEXT    NOT NULL,   -- pending | active | closed
            attempts     INTEGER NOT NULL DEFAULT 0,
            winner_id    TEXT,
            close_reason TEXT,
            created_at   TEXT    NOT NULL,
            opened_at    TEXT,
            closed_at    TEXT
        ) STRICT;

        CREATE INDEX IF NOT EXISTS idx_heists_status
            ON heists (status, created_at);
        ",
    )?;
    Ok(())
}

fn create_awards_table(conn: &Connection) -> Result<()> {
    // Rewards owed by a contest draw or heist win, settled after the fact.
    conn.execute_batch(
        "
        CREATE TABLE IF NOT EXISTS awards (
            id          TEXT    NOT NULL PRIMARY KEY,
            source      TEXT    NOT NULL,   -- ledger reason
            contest_id  TEXT,
            heist_id    TEXT,
            subject_id  TEXT    NOT NULL,
            context_id  TEXT    NOT NULL,
            reward      TEXT    NOT NULL,   -- JSON Reward
            status      TEXT    NOT NULL DEFAULT 'pending',  -- pending | settling | done | unreachable
            attempts    INTEGER NOT NULL DEFAULT 0,
            created_at  TEXT    NOT NULL,
            claimed_at  TEXT,               -- start of the current settling lease
            settled_at  TEXT
        ) STRICT;

        -- Poll: SELECT … WHERE status = 'pending' OR (status = 'settling' AND claimed_at <= ?)
        CREATE INDEX IF NOT EXISTS idx_awards_due
            ON awards (status, claimed_at);
        CREATE INDEX IF NOT EXISTS idx_awards_contest
            ON awards (contest_id);
        ",
    )?;
    Ok(())
}
