use rusqlite::{Connection, Result};

/// Initialise ledger tables. Safe to call on every startup (idempotent).
pub fn init_db(conn: &Connection) -> Result<()> {
    create_accounts_table(conn)?;
    create_transactions_table(conn)?;
    Ok(())
}

fn create_accounts_table(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS accounts (
            subject_id  TEXT PRIMARY KEY NOT NULL,
            balance     TEXT NOT NULL,              -- decimal big integer
            draws       INTEGER NOT NULL DEFAULT 0,
            daily_at    TEXT,                       -- last daily claim
            work_at     TEXT,                       -- last work claim
            created_at  TEXT NOT NULL,
            updated_at  TEXT NOT NULL
        );",
    )
}

fn create_transactions_table(conn: &Connection) -> Result<()> {
    // Append-only. Used for history/reporting, never replayed.
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS ledger_transactions (
            id          INTEGER PRIMARY KEY AUTOINCREMENT,
            subject_id  TEXT NOT NULL,
            currency    TEXT NOT NULL,              -- 'balance' | 'draws'
            delta       TEXT NOT NULL,
            balance     TEXT NOT NULL,              -- value after the change
            reason      TEXT NOT NULL,
            created_at  TEXT NOT NULL
        );
        CREATE INDEX IF NOT EXISTS idx_ledger_tx_subject
            ON ledger_transactions (subject_id, id);",
    )
}
