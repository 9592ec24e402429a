use anyhow::{Context, Result, anyhow};
use chrono::Local;
use rusqlite::{Connection, params, params_from_iter, types::Value};
use std::path::PathBuf;
use tracing::info;

use crate::models::{JobListing, StoredJob};

/// Attempt count meaning "permanently closed, never retry".
pub const CLOSED_SENTINEL: i64 = 99;

pub struct Database {
    conn: Connection,
    path: PathBuf,
}

impl Database {
    pub fn open(path: Option<PathBuf>) -> Result<Self> {
        let path = match path {
            Some(p) => p,
            None => Self::default_path()?,
        };
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(&path)
            .with_context(|| format!("Failed to open database at {}", path.display()))?;
        Ok(Self { conn, path })
    }

    #[cfg(test)]
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        Ok(Self {
            conn,
            path: PathBuf::from(":memory:"),
        })
    }

    pub fn path(&self) -> &PathBuf {
        &self.path
    }

    fn default_path() -> Result<PathBuf> {
        if let Some(proj_dirs) = directories::ProjectDirs::from("", "", "harrier") {
            Ok(proj_dirs.data_dir().join("harrier.db"))
        } else {
            Ok(PathBuf::from("harrier.db"))
        }
    }

    pub fn init(&self) -> Result<()> {
        self.conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS job_listings (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                logged_timestamp TEXT NOT NULL,
                title TEXT NOT NULL,
                company TEXT,
                location TEXT,
                salary TEXT,
                source_email TEXT NOT NULL,
                source_name TEXT NOT NULL,
                link TEXT NOT NULL,
                description TEXT,
                easy_apply INTEGER NOT NULL DEFAULT 0,
                applied_timestamp TEXT,
                apply_attempts INTEGER NOT NULL DEFAULT 0,
                cover_letter TEXT,
                UNIQUE(source_name, link)
            );

            CREATE INDEX IF NOT EXISTS idx_listings_pending
                ON job_listings(applied_timestamp, apply_attempts);
            "#,
        )?;
        Ok(())
    }

    pub fn ensure_initialized(&self) -> Result<()> {
        let tables: i64 = self.conn.query_row(
            "SELECT COUNT(*) FROM sqlite_master WHERE type='table' AND name='job_listings'",
            [],
            |row| row.get(0),
        )?;
        if tables == 0 {
            return Err(anyhow!("Database not initialized. Run 'harrier init' first."));
        }
        Ok(())
    }

    /// Millisecond-resolution insertion timestamp, "YYYY-MM-DD HH:MM:SS,mmm".
    fn timestamp() -> String {
        let now = Local::now();
        format!(
            "{},{:03}",
            now.format("%Y-%m-%d %H:%M:%S"),
            now.timestamp_subsec_millis()
        )
    }

    /// Insert listings one by one; a natural-key conflict skips the row.
    /// Returns how many rows were actually inserted. Not atomic as a batch:
    /// a crash mid-way leaves the inserted prefix durable.
    pub fn save_listings(&self, listings: &[JobListing]) -> Result<usize> {
        let mut inserted = 0;
        for listing in listings {
            let changed = self.conn.execute(
                "INSERT OR IGNORE INTO job_listings
                 (logged_timestamp, title, company, location, salary,
                  source_email, source_name, link, description, easy_apply)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
                params![
                    Self::timestamp(),
                    listing.title,
                    listing.company,
                    listing.location,
                    listing.salary,
                    listing.source_email,
                    listing.source_name,
                    listing.link,
                    listing.description,
                    listing.easy_apply,
                ],
            )?;
            inserted += changed;
        }
        info!(rows = inserted, "rows added");
        Ok(inserted)
    }

    /// Rows still eligible for an application attempt: never applied, attempt
    /// budget not exhausted, and sourced from one of the given alert addresses.
    pub fn fetch_unapplied(&self, emails: &[&str], max_retries: i64) -> Result<Vec<StoredJob>> {
        if emails.is_empty() {
            return Ok(Vec::new());
        }
        let placeholders = (0..emails.len())
            .map(|i| format!("?{}", i + 2))
            .collect::<Vec<_>>()
            .join(", ");
        let sql = format!(
            "SELECT id, logged_timestamp, title, company, location, salary,
                    source_email, source_name, link, description, easy_apply,
                    applied_timestamp, apply_attempts, cover_letter
             FROM job_listings
             WHERE applied_timestamp IS NULL
               AND apply_attempts < ?1
               AND source_email IN ({placeholders})
             ORDER BY id"
        );
        let mut values = vec![Value::Integer(max_retries)];
        values.extend(emails.iter().map(|e| Value::Text((*e).to_string())));

        let mut stmt = self.conn.prepare(&sql)?;
        let rows = stmt.query_map(params_from_iter(values), Self::row_to_job)?;
        rows.collect::<Result<Vec<_>, _>>()
            .context("Failed to fetch unapplied listings")
    }

    pub fn list_jobs(&self) -> Result<Vec<StoredJob>> {
        let mut stmt = self.conn.prepare(
            "SELECT id, logged_timestamp, title, company, location, salary,
                    source_email, source_name, link, description, easy_apply,
                    applied_timestamp, apply_attempts, cover_letter
             FROM job_listings
             ORDER BY id DESC",
        )?;
        let rows = stmt.query_map([], Self::row_to_job)?;
        rows.collect::<Result<Vec<_>, _>>()
            .context("Failed to list jobs")
    }

    /// Record a successful application. Overwrites the timestamp if called
    /// twice, which keeps the call idempotent in effect.
    pub fn mark_applied(&self, id: i64) -> Result<()> {
        self.conn.execute(
            "UPDATE job_listings SET applied_timestamp = ?1 WHERE id = ?2",
            params![Self::timestamp(), id],
        )?;
        Ok(())
    }

    /// Pin the attempt counter to the sentinel so the row never resurfaces.
    pub fn mark_closed(&self, id: i64) -> Result<()> {
        self.conn.execute(
            "UPDATE job_listings SET apply_attempts = ?1 WHERE id = ?2",
            params![CLOSED_SENTINEL, id],
        )?;
        Ok(())
    }

    /// Write back an attempt count tracked by the apply driver's run ledger.
    pub fn set_attempts(&self, id: i64, attempts: i64) -> Result<()> {
        self.conn.execute(
            "UPDATE job_listings SET apply_attempts = ?1 WHERE id = ?2",
            params![attempts, id],
        )?;
        Ok(())
    }

    fn row_to_job(row: &rusqlite::Row) -> rusqlite::Result<StoredJob> {
        Ok(StoredJob {
            id: row.get(0)?,
            logged_timestamp: row.get(1)?,
            title: row.get(2)?,
            company: row.get(3)?,
            location: row.get(4)?,
            salary: row.get(5)?,
            source_email: row.get(6)?,
            source_name: row.get(7)?,
            link: row.get(8)?,
            description: row.get(9)?,
            easy_apply: row.get(10)?,
            applied_timestamp: row.get(11)?,
            apply_attempts: row.get(12)?,
            cover_letter: row.get(13)?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use regex::Regex;

    fn listing(title: &str, link: &str) -> JobListing {
        JobListing {
            row_id: None,
            title: title.to_string(),
            company: Some("Acme Corp".to_string()),
            location: Some("London".to_string()),
            salary: None,
            source_email: "jobs-listings@linkedin.com".to_string(),
            source_name: "LinkedIn".to_string(),
            link: link.to_string(),
            description: None,
            easy_apply: true,
        }
    }

    fn db() -> Database {
        let db = Database::open_in_memory().unwrap();
        db.init().unwrap();
        db
    }

    #[test]
    fn duplicate_natural_key_inserted_once() {
        let db = db();
        let pair = vec![
            listing("Python Developer", "https://example.com/1"),
            listing("Python Developer", "https://example.com/1"),
        ];
        assert_eq!(db.save_listings(&pair).unwrap(), 1);
        // A second pass over the same listings adds nothing.
        assert_eq!(db.save_listings(&pair).unwrap(), 0);
        assert_eq!(db.list_jobs().unwrap().len(), 1);
    }

    #[test]
    fn same_link_from_different_site_is_distinct() {
        let db = db();
        let mut other = listing("Python Developer", "https://example.com/1");
        other.source_name = "CV-Library".to_string();
        let rows = vec![listing("Python Developer", "https://example.com/1"), other];
        assert_eq!(db.save_listings(&rows).unwrap(), 2);
    }

    #[test]
    fn attempt_budget_bounds_eligibility() {
        let db = db();
        db.save_listings(&[listing("a", "https://example.com/1")])
            .unwrap();
        let max_retries = 3;

        db.set_attempts(1, max_retries - 1).unwrap();
        let rows = db
            .fetch_unapplied(&["jobs-listings@linkedin.com"], max_retries)
            .unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].apply_attempts, max_retries - 1);

        db.set_attempts(1, max_retries).unwrap();
        let rows = db
            .fetch_unapplied(&["jobs-listings@linkedin.com"], max_retries)
            .unwrap();
        assert!(rows.is_empty());
    }

    #[test]
    fn applied_rows_leave_the_queue() {
        let db = db();
        db.save_listings(&[
            listing("a", "https://example.com/1"),
            listing("b", "https://example.com/2"),
        ])
        .unwrap();
        db.mark_applied(1).unwrap();
        let rows = db
            .fetch_unapplied(&["jobs-listings@linkedin.com"], 3)
            .unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].id, 2);
        // Second call just refreshes the timestamp.
        db.mark_applied(1).unwrap();
    }

    #[test]
    fn closed_rows_never_resurface() {
        let db = db();
        db.save_listings(&[listing("a", "https://example.com/1")])
            .unwrap();
        db.mark_closed(1).unwrap();
        for max_retries in [3, 10, CLOSED_SENTINEL] {
            let rows = db
                .fetch_unapplied(&["jobs-listings@linkedin.com"], max_retries)
                .unwrap();
            assert!(rows.is_empty());
        }
    }

    #[test]
    fn fetch_is_scoped_to_requested_sources() {
        let db = db();
        let mut cv = listing("b", "https://example.com/2");
        cv.source_email = "admin@jobs.cv-library.co.uk".to_string();
        cv.source_name = "CV-Library".to_string();
        db.save_listings(&[listing("a", "https://example.com/1"), cv])
            .unwrap();
        let rows = db
            .fetch_unapplied(&["admin@jobs.cv-library.co.uk"], 3)
            .unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].source_name, "CV-Library");
        assert!(db.fetch_unapplied(&[], 3).unwrap().is_empty());
    }

    #[test]
    fn timestamp_uses_comma_separated_milliseconds() {
        let db = db();
        db.save_listings(&[listing("a", "https://example.com/1")])
            .unwrap();
        let rows = db.list_jobs().unwrap();
        let re = Regex::new(r"^\d{4}-\d{2}-\d{2} \d{2}:\d{2}:\d{2},\d{3}$").unwrap();
        assert!(re.is_match(&rows[0].logged_timestamp));
    }
}
