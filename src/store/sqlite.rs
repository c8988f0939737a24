//! SQLite-backed metering store.
//!
//! Tables:
//! - `users`: email, tier
//! - `user_credits`: user_email, balance, last_refill_day
//! - `user_settings`: user_email, ai_target, ai_api_key, ai_model, ai_base_url
//! - `system_settings`: key, value

use super::{AiSettingsRow, CreditRow, MeteringStore};
use anyhow::{Context, Result};
use parking_lot::Mutex;
use rusqlite::{params, Connection};
use std::path::Path;

const SCHEMA: &str = "CREATE TABLE IF NOT EXISTS users (
        email TEXT PRIMARY KEY,
        tier TEXT NOT NULL DEFAULT 'byok',
        created_at TEXT NOT NULL,
        updated_at TEXT NOT NULL
    );

    CREATE TABLE IF NOT EXISTS user_credits (
        user_email TEXT PRIMARY KEY,
        balance INTEGER NOT NULL,
        last_refill_day TEXT NOT NULL,
        created_at TEXT NOT NULL,
        updated_at TEXT NOT NULL
    );

    CREATE TABLE IF NOT EXISTS user_settings (
        user_email TEXT PRIMARY KEY,
        ai_target TEXT NOT NULL DEFAULT 'gemini',
        ai_api_key TEXT NOT NULL DEFAULT '',
        ai_model TEXT NOT NULL DEFAULT '',
        ai_base_url TEXT NOT NULL DEFAULT '',
        created_at TEXT NOT NULL,
        updated_at TEXT NOT NULL
    );
    CREATE INDEX IF NOT EXISTS idx_user_settings_target ON user_settings(ai_target);

    CREATE TABLE IF NOT EXISTS system_settings (
        key TEXT PRIMARY KEY,
        value TEXT NOT NULL,
        updated_at TEXT NOT NULL
    );";

fn now_rfc3339() -> String {
    chrono::Utc::now().to_rfc3339()
}

pub struct SqliteStore {
    conn: Mutex<Connection>,
}

impl SqliteStore {
    /// Open (or create) the database at `db_path`, creating parent directories.
    pub fn new(db_path: &Path) -> Result<Self> {
        if let Some(parent) = db_path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create {}", parent.display()))?;
        }
        let conn = Connection::open(db_path)
            .with_context(|| format!("Failed to open {}", db_path.display()))?;

        // WAL mode for concurrent reads + crash safety
        conn.execute_batch(
            "PRAGMA journal_mode = WAL;
             PRAGMA synchronous = NORMAL;",
        )?;
        Self::init(conn)
    }

    #[cfg(test)]
    pub(crate) fn in_memory() -> Result<Self> {
        Self::init(Connection::open_in_memory()?)
    }

    fn init(conn: Connection) -> Result<Self> {
        conn.execute_batch(SCHEMA)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }
}

impl MeteringStore for SqliteStore {
    fn user_tier(&self, email: &str) -> Result<Option<String>> {
        let conn = self.conn.lock();
        let row = conn.query_row(
            "SELECT tier FROM users WHERE email = ?1",
            params![email],
            |row| row.get::<_, String>(0),
        );
        match row {
            Ok(tier) => Ok(Some(tier)),
            Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    fn upsert_user(&self, email: &str, tier: &str) -> Result<()> {
        let now = now_rfc3339();
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO users (email, tier, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?3)
             ON CONFLICT(email) DO UPDATE SET tier = excluded.tier, updated_at = excluded.updated_at",
            params![email, tier, now],
        )?;
        Ok(())
    }

    fn set_user_tier(&self, email: &str, tier: &str) -> Result<bool> {
        let conn = self.conn.lock();
        let changed = conn.execute(
            "UPDATE users SET tier = ?2, updated_at = ?3 WHERE email = ?1",
            params![email, tier, now_rfc3339()],
        )?;
        Ok(changed > 0)
    }

    fn credit_row(&self, email: &str) -> Result<Option<CreditRow>> {
        let conn = self.conn.lock();
        let row = conn.query_row(
            "SELECT balance, last_refill_day FROM user_credits WHERE user_email = ?1",
            params![email],
            |row| {
                Ok(CreditRow {
                    balance: row.get(0)?,
                    last_refill_day: row.get(1)?,
                })
            },
        );
        match row {
            Ok(row) => Ok(Some(row)),
            Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    fn insert_credit_row_if_absent(&self, email: &str, balance: i64, day: &str) -> Result<bool> {
        let now = now_rfc3339();
        let conn = self.conn.lock();
        let inserted = conn.execute(
            "INSERT INTO user_credits (user_email, balance, last_refill_day, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?4)
             ON CONFLICT(user_email) DO NOTHING",
            params![email, balance, day, now],
        )?;
        Ok(inserted > 0)
    }

    fn update_credit_row(&self, email: &str, balance: i64, day: Option<&str>) -> Result<()> {
        let now = now_rfc3339();
        let conn = self.conn.lock();
        match day {
            Some(day) => conn.execute(
                "UPDATE user_credits SET balance = ?2, last_refill_day = ?3, updated_at = ?4
                 WHERE user_email = ?1",
                params![email, balance, day, now],
            )?,
            None => conn.execute(
                "UPDATE user_credits SET balance = ?2, updated_at = ?3 WHERE user_email = ?1",
                params![email, balance, now],
            )?,
        };
        Ok(())
    }

    fn ai_settings_row(&self, email: &str) -> Result<Option<AiSettingsRow>> {
        let conn = self.conn.lock();
        let row = conn.query_row(
            "SELECT ai_target, ai_api_key, ai_model, ai_base_url
             FROM user_settings WHERE user_email = ?1",
            params![email],
            |row| {
                Ok(AiSettingsRow {
                    target: row.get(0)?,
                    api_key: row.get(1)?,
                    model: row.get(2)?,
                    base_url: row.get(3)?,
                })
            },
        );
        match row {
            Ok(row) => Ok(Some(row)),
            Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    fn upsert_ai_settings_row(&self, email: &str, row: &AiSettingsRow) -> Result<()> {
        let now = now_rfc3339();
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO user_settings
                (user_email, ai_target, ai_api_key, ai_model, ai_base_url, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?6)
             ON CONFLICT(user_email) DO UPDATE SET
                ai_target = excluded.ai_target,
                ai_api_key = excluded.ai_api_key,
                ai_model = excluded.ai_model,
                ai_base_url = excluded.ai_base_url,
                updated_at = excluded.updated_at",
            params![email, row.target, row.api_key, row.model, row.base_url, now],
        )?;
        Ok(())
    }

    fn retarget_ai_settings(&self, user: Option<&str>, from: &str, to: &str) -> Result<usize> {
        let now = now_rfc3339();
        let conn = self.conn.lock();
        let changed = match user {
            Some(email) => conn.execute(
                "UPDATE user_settings SET ai_target = ?3, updated_at = ?4
                 WHERE user_email = ?1 AND ai_target = ?2",
                params![email, from, to, now],
            )?,
            None => conn.execute(
                "UPDATE user_settings SET ai_target = ?2, updated_at = ?3 WHERE ai_target = ?1",
                params![from, to, now],
            )?,
        };
        Ok(changed)
    }

    fn system_setting(&self, key: &str) -> Result<Option<String>> {
        let conn = self.conn.lock();
        let row = conn.query_row(
            "SELECT value FROM system_settings WHERE key = ?1",
            params![key],
            |row| row.get::<_, String>(0),
        );
        match row {
            Ok(value) => Ok(Some(value)),
            Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    fn put_system_setting(&self, key: &str, value: &str) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO system_settings (key, value, updated_at) VALUES (?1, ?2, ?3)
             ON CONFLICT(key) DO UPDATE SET value = excluded.value, updated_at = excluded.updated_at",
            params![key, value, now_rfc3339()],
        )?;
        Ok(())
    }
}
