//! Relaydl Storage
//!
//! SQLite quota store: one row per user with a lazily reset daily counter
//! and an optional VIP expiry date.

use anyhow::{anyhow, Result};
use chrono::{Duration, NaiveDate};
use relaydl_config::VipMode;
use rusqlite::OptionalExtension;
use serde::Serialize;
use std::path::Path;

const DATE_FORMAT: &str = "%Y-%m-%d";

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct UserRecord {
    pub user_id: i64,
    pub downloads_today: u32,
    pub vip_until: Option<NaiveDate>,
    /// `None` only for rows written by older versions that never reset.
    pub last_reset_date: Option<NaiveDate>,
    pub downloads_total: u64,
    /// Registration day; `None` for rows that predate the column.
    pub created_on: Option<NaiveDate>,
}

impl UserRecord {
    pub fn is_vip(&self, today: NaiveDate) -> bool {
        self.vip_until.is_some_and(|until| until >= today)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct UsageStats {
    pub users: u64,
    pub downloads_today: u64,
    pub downloads_total: u64,
    pub active_vips: u64,
}

pub struct Storage {
    conn: rusqlite::Connection,
}

impl Storage {
    pub fn new<P: AsRef<Path>>(db_path: P) -> Result<Self> {
        let conn = rusqlite::Connection::open(db_path.as_ref())?;
        Self::init(conn)
    }

    pub fn open_in_memory() -> Result<Self> {
        Self::init(rusqlite::Connection::open_in_memory()?)
    }

    fn init(conn: rusqlite::Connection) -> Result<Self> {
        conn.execute_batch(
            "
            CREATE TABLE IF NOT EXISTS users (
                user_id INTEGER PRIMARY KEY,
                downloads INTEGER NOT NULL DEFAULT 0,
                vip_until TEXT DEFAULT NULL,
                last_reset TEXT
            );
            ",
        )?;

        Self::ensure_users_schema(&conn)?;

        Ok(Self { conn })
    }

    /// Creates the row with a zero counter if it does not exist yet.
    /// Returns `true` when a row was inserted.
    pub fn ensure_user(&self, user_id: i64, today: NaiveDate) -> Result<bool> {
        let inserted = self.conn.execute(
            "INSERT OR IGNORE INTO users (user_id, downloads, last_reset, created_at)
             VALUES (?1, 0, ?2, ?2)",
            (user_id, format_date(today)),
        )?;
        Ok(inserted > 0)
    }

    pub fn get_user(&self, user_id: i64) -> Result<Option<UserRecord>> {
        let mut stmt = self.conn.prepare(
            "SELECT user_id, downloads, vip_until, last_reset, downloads_total, created_at
             FROM users WHERE user_id = ?1",
        )?;
        let row = stmt
            .query_row([user_id], |row| {
                Ok((
                    row.get::<_, i64>(0)?,
                    row.get::<_, i64>(1)?,
                    row.get::<_, Option<String>>(2)?,
                    row.get::<_, Option<String>>(3)?,
                    row.get::<_, i64>(4)?,
                    row.get::<_, Option<String>>(5)?,
                ))
            })
            .optional()?;

        Ok(row.map(
            |(user_id, downloads, vip_until, last_reset, total, created_at)| UserRecord {
                user_id,
                downloads_today: u32::try_from(downloads.max(0)).unwrap_or(u32::MAX),
                vip_until: vip_until.as_deref().and_then(parse_date),
                last_reset_date: last_reset.as_deref().and_then(parse_date),
                downloads_total: u64::try_from(total.max(0)).unwrap_or_default(),
                created_on: created_at.as_deref().and_then(parse_date),
            },
        ))
    }

    /// Single-statement increment. Returns `false` when the user is unknown.
    pub fn increment(&self, user_id: i64) -> Result<bool> {
        let changed = self.conn.execute(
            "UPDATE users
             SET downloads = downloads + 1, downloads_total = downloads_total + 1
             WHERE user_id = ?1",
            [user_id],
        )?;
        Ok(changed > 0)
    }

    /// Zeroes the counter the first time a user is seen on a new calendar day.
    /// Returns `true` when a reset happened.
    pub fn reset_if_new_day(&self, user_id: i64, today: NaiveDate) -> Result<bool> {
        let changed = self.conn.execute(
            "UPDATE users SET downloads = 0, last_reset = ?2
             WHERE user_id = ?1 AND (last_reset IS NULL OR last_reset <> ?2)",
            (user_id, format_date(today)),
        )?;
        Ok(changed > 0)
    }

    /// Grants VIP for `days` days. Returns the new expiry, or `None` when the
    /// user is unknown.
    pub fn activate_vip(
        &self,
        user_id: i64,
        days: u32,
        today: NaiveDate,
        mode: VipMode,
    ) -> Result<Option<NaiveDate>> {
        let tx = self.conn.unchecked_transaction()?;

        let current: Option<Option<String>> = tx
            .query_row(
                "SELECT vip_until FROM users WHERE user_id = ?1",
                [user_id],
                |row| row.get(0),
            )
            .optional()?;
        let Some(current) = current else {
            return Ok(None);
        };

        let base = match mode {
            VipMode::Overwrite => today,
            VipMode::Extend => current
                .as_deref()
                .and_then(parse_date)
                .filter(|until| *until >= today)
                .unwrap_or(today),
        };
        let until = base
            .checked_add_signed(Duration::days(i64::from(days)))
            .ok_or_else(|| anyhow!("VIP expiry out of range ({} + {} days)", base, days))?;

        tx.execute(
            "UPDATE users SET vip_until = ?1 WHERE user_id = ?2",
            (format_date(until), user_id),
        )?;
        tx.commit()?;

        Ok(Some(until))
    }

    pub fn list_user_ids(&self) -> Result<Vec<i64>> {
        let mut stmt = self
            .conn
            .prepare("SELECT user_id FROM users ORDER BY user_id")?;
        let ids = stmt.query_map([], |row| row.get(0))?;

        let mut result = Vec::new();
        for id in ids {
            result.push(id?);
        }
        Ok(result)
    }

    pub fn list_users(&self) -> Result<Vec<UserRecord>> {
        let mut result = Vec::new();
        for user_id in self.list_user_ids()? {
            if let Some(record) = self.get_user(user_id)? {
                result.push(record);
            }
        }
        Ok(result)
    }

    /// `downloads_today` only counts rows already reset today; stale counters
    /// from previous days are excluded.
    pub fn stats(&self, today: NaiveDate) -> Result<UsageStats> {
        let today = format_date(today);
        let (users, downloads_today, downloads_total, active_vips) = self.conn.query_row(
            "SELECT
                COUNT(*),
                COALESCE(SUM(CASE WHEN last_reset = ?1 THEN downloads ELSE 0 END), 0),
                COALESCE(SUM(downloads_total), 0),
                COALESCE(SUM(CASE WHEN vip_until >= ?1 THEN 1 ELSE 0 END), 0)
             FROM users",
            [&today],
            |row| {
                Ok((
                    row.get::<_, i64>(0)?,
                    row.get::<_, i64>(1)?,
                    row.get::<_, i64>(2)?,
                    row.get::<_, i64>(3)?,
                ))
            },
        )?;

        Ok(UsageStats {
            users: users.max(0) as u64,
            downloads_today: downloads_today.max(0) as u64,
            downloads_total: downloads_total.max(0) as u64,
            active_vips: active_vips.max(0) as u64,
        })
    }

    fn ensure_users_schema(conn: &rusqlite::Connection) -> Result<()> {
        let mut has_total = false;
        let mut has_created_at = false;
        let mut stmt = conn.prepare("PRAGMA table_info(users)")?;
        let columns = stmt.query_map([], |row| row.get::<_, String>(1))?;
        for col in columns {
            let col = col?;
            if col.eq_ignore_ascii_case("downloads_total") {
                has_total = true;
            } else if col.eq_ignore_ascii_case("created_at") {
                has_created_at = true;
            }
        }

        if !has_total {
            conn.execute(
                "ALTER TABLE users ADD COLUMN downloads_total INTEGER NOT NULL DEFAULT 0",
                [],
            )?;
            conn.execute(
                "UPDATE users SET downloads_total = downloads WHERE downloads_total = 0",
                [],
            )?;
        }

        if !has_created_at {
            // ALTER TABLE cannot add a column with a non-constant default.
            conn.execute("ALTER TABLE users ADD COLUMN created_at TEXT", [])?;
        }

        conn.execute(
            "CREATE INDEX IF NOT EXISTS idx_users_vip_until ON users(vip_until)",
            [],
        )?;

        Ok(())
    }
}

fn format_date(date: NaiveDate) -> String {
    date.format(DATE_FORMAT).to_string()
}

fn parse_date(value: &str) -> Option<NaiveDate> {
    NaiveDate::parse_from_str(value.trim(), DATE_FORMAT).ok()
}
