//! Structured diagnostics written to the `event_log` table.

use r2d2_sqlite::rusqlite::{params, Connection};
use serde_json::Value;
use time::OffsetDateTime;
use uuid::Uuid;

use crate::db::DbPool;

pub fn log_event(
    conn: &Connection,
    level: &str,
    code: Option<&str>,
    module: &str,
    message: &str,
    explain: Option<&str>,
    data: Option<Value>,
) -> rusqlite::Result<()> {
    let id = Uuid::new_v4().to_string();
    let ts = OffsetDateTime::now_utc().unix_timestamp();
    let data_str = data.map(|v| v.to_string());
    conn.execute(
        "INSERT INTO event_log (id, ts, level, code, module, message, explain, data) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
        params![id, ts, level, code, module, message, explain, data_str],
    )?;
    Ok(())
}

/// Fire-and-forget variant used from async code paths. Failures to write the
/// audit row are reported through the `log` facade only.
pub fn log_event_detached(
    pool: &DbPool,
    level: &'static str,
    code: &'static str,
    module: &'static str,
    message: &'static str,
    data: Value,
) {
    let pool = pool.clone();
    tokio::task::spawn_blocking(move || match pool.get() {
        Ok(conn) => {
            if let Err(err) = log_event(&conn, level, Some(code), module, message, None, Some(data))
            {
                log::warn!("failed to write event log row {code}: {err}");
            }
        }
        Err(err) => log::warn!("event log unavailable: {err}"),
    });
}
