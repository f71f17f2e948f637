use anyhow::{Context, Result};
use directories::ProjectDirs;
use r2d2::Pool;
use r2d2_sqlite::SqliteConnectionManager;
use rusqlite::Connection;
use std::path::PathBuf;

use crate::modes;

pub type DbPool = Pool<SqliteConnectionManager>;

/// Platform data directory for the application, with a temp-dir fallback.
pub fn default_workspace_dir() -> PathBuf {
    if let Some(proj) = ProjectDirs::from("com", "TaskNote", "TaskNote") {
        proj.data_dir().to_path_buf()
    } else {
        std::env::temp_dir().join("TaskNote")
    }
}

pub fn init_db(workspace_dir: PathBuf) -> Result<DbPool> {
    std::fs::create_dir_all(&workspace_dir)?;
    let db_path = workspace_dir.join("tasknote.db");
    let mgr = SqliteConnectionManager::file(&db_path);
    let pool = Pool::new(mgr)?;
    prepare(&pool)?;
    Ok(pool)
}

/// Single-connection in-memory database. Every pooled connection to
/// `:memory:` is its own database, so the pool is capped at one.
pub fn memory_pool() -> Result<DbPool> {
    let pool = Pool::builder()
        .max_size(1)
        .build(SqliteConnectionManager::memory())?;
    prepare(&pool)?;
    Ok(pool)
}

fn prepare(pool: &DbPool) -> Result<()> {
    let conn = pool.get()?;
    apply_migrations(&conn)?;
    modes::seed_builtin_modes(&conn)?;
    Ok(())
}

fn apply_migrations(conn: &Connection) -> Result<()> {
    let migrations: &[(&str, &str)] = &[
        (
            "0001_init.sql",
            include_str!(concat!(
                env!("CARGO_MANIFEST_DIR"),
                "/../migrations/0001_init.sql"
            )),
        ),
        (
            "0002_enhancement.sql",
            include_str!(concat!(
                env!("CARGO_MANIFEST_DIR"),
                "/../migrations/0002_enhancement.sql"
            )),
        ),
    ];

    for (name, sql) in migrations {
        conn.execute_batch(sql)
            .with_context(|| format!("failed to apply migration {name}"))?;
    }
    Ok(())
}
