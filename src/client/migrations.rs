use anyhow::{bail, Context, Result};
use rusqlite::{params, Connection, OptionalExtension};

const VERSION_KEY: &str = "schema_version";

/// Ordered schema steps; step `i` upgrades the store to version `i + 1`.
const STEPS: &[&str] = &[r#"
    CREATE TABLE IF NOT EXISTS client_state (
        key TEXT PRIMARY KEY,
        value TEXT NOT NULL,
        updated_at TEXT NOT NULL DEFAULT (strftime('%Y-%m-%dT%H:%M:%SZ', 'now'))
    );
"#];

fn latest_version() -> u32 {
    STEPS.len() as u32
}

pub fn migrate(conn: &mut Connection) -> Result<()> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS client_meta (key TEXT PRIMARY KEY, value TEXT NOT NULL);",
    )
    .context("create client_meta table")?;

    let current = stored_version(conn)?;
    if current > latest_version() {
        bail!(
            "client store schema version {current} is newer than supported version {}",
            latest_version()
        );
    }

    let tx = conn.transaction().context("begin client store migration")?;
    for (index, step) in STEPS.iter().enumerate().skip(current as usize) {
        let version = index as u32 + 1;
        tx.execute_batch(step)
            .with_context(|| format!("apply client store migration v{version}"))?;
        tx.execute(
            "INSERT INTO client_meta (key, value) VALUES (?1, ?2)
             ON CONFLICT(key) DO UPDATE SET value = excluded.value",
            params![VERSION_KEY, version.to_string()],
        )
        .with_context(|| format!("record client store schema v{version}"))?;
    }
    tx.commit().context("commit client store migration")?;
    Ok(())
}

fn stored_version(conn: &Connection) -> Result<u32> {
    let raw: Option<String> = conn
        .query_row(
            "SELECT value FROM client_meta WHERE key = ?1",
            params![VERSION_KEY],
            |row| row.get(0),
        )
        .optional()
        .context("read client store schema version")?;

    raw.map_or(Ok(0), |value| {
        value
            .parse::<u32>()
            .with_context(|| format!("invalid client store schema version: {value}"))
    })
}
