//! SQLite-backed store.

use std::path::Path;
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use chrono::{DateTime, NaiveDateTime, SecondsFormat, Utc};
use rusqlite::types::Type;
use rusqlite::{Connection, ErrorCode, OptionalExtension, Row, params, params_from_iter};
use tracing::{debug, info, warn};

use crate::{
    JobFilter, JobId, JobStatus, JobType, NewJob, NewProfile, NextRun, ProfileId, ScrapeJob, Store,
    StoreError, TrackedProfile, TrackingFrequency,
};

const PROFILE_COLUMNS: &str = "id, profile_url, display_name, is_active, priority, \
     tracking_frequency, created_at, last_scraped_at, next_run_at";

const JOB_COLUMNS: &str = "id, profile_id, job_type, status, created_at, scheduled_at, \
     started_at, completed_at, items_scraped, new_items_found, changes_detected, \
     error_message, retry_count, max_retries, owner";

/// Tie-break order shared by every due-set query.
///
/// `last_scraped_at` is written by the workflow in SQLite's own datetime
/// format, so it is compared by instant rather than by text.
const DUE_ORDER: &str = "priority DESC, last_scraped_at IS NOT NULL, \
     julianday(last_scraped_at) ASC, id ASC";

/// How long a writer waits on another process's lock before failing.
const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

/// SQLite-backed store for profiles and jobs.
pub struct SqliteStore {
    conn: Mutex<Connection>,
}

impl SqliteStore {
    /// Open or create the database at `path`.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let path = path.as_ref();
        let conn = Connection::open(path)?;
        conn.busy_timeout(BUSY_TIMEOUT)?;

        // Enable WAL mode for concurrent reads
        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA synchronous=NORMAL;")?;

        let store = Self::init(conn)?;
        info!(path = %path.display(), "scout database initialized");
        Ok(store)
    }

    /// Open a private in-memory database.
    pub fn open_in_memory() -> Result<Self, StoreError> {
        Self::init(Connection::open_in_memory()?)
    }

    fn init(conn: Connection) -> Result<Self, StoreError> {
        conn.execute_batch(
            "
            PRAGMA foreign_keys = ON;

            CREATE TABLE IF NOT EXISTS tracked_profiles (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                profile_url TEXT NOT NULL UNIQUE,
                display_name TEXT NOT NULL,
                is_active INTEGER NOT NULL DEFAULT 1,
                priority INTEGER NOT NULL DEFAULT 5,
                tracking_frequency TEXT NOT NULL DEFAULT 'daily',
                created_at TEXT NOT NULL,
                last_scraped_at TEXT,
                next_run_at TEXT
            );
            CREATE INDEX IF NOT EXISTS idx_profiles_due ON tracked_profiles(is_active, next_run_at);

            CREATE TABLE IF NOT EXISTS scrape_jobs (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                profile_id INTEGER REFERENCES tracked_profiles(id) ON DELETE SET NULL,
                job_type TEXT NOT NULL,
                status TEXT NOT NULL DEFAULT 'pending',
                created_at TEXT NOT NULL,
                scheduled_at TEXT,
                started_at TEXT,
                completed_at TEXT,
                items_scraped INTEGER NOT NULL DEFAULT 0,
                new_items_found INTEGER NOT NULL DEFAULT 0,
                changes_detected INTEGER NOT NULL DEFAULT 0,
                error_message TEXT,
                retry_count INTEGER NOT NULL DEFAULT 0,
                max_retries INTEGER NOT NULL DEFAULT 3,
                owner TEXT
            );
            CREATE INDEX IF NOT EXISTS idx_jobs_status ON scrape_jobs(status);
            CREATE INDEX IF NOT EXISTS idx_jobs_profile ON scrape_jobs(profile_id);

            CREATE TABLE IF NOT EXISTS profile_claims (
                profile_id INTEGER PRIMARY KEY,
                owner TEXT NOT NULL,
                claimed_at TEXT NOT NULL
            );
            ",
        )?;

        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn conn(&self) -> Result<MutexGuard<'_, Connection>, StoreError> {
        self.conn.lock().map_err(|_| StoreError::LockPoisoned)
    }

    /// Record when the collection workflow last ran for a profile.
    pub fn set_last_run(
        &self,
        id: ProfileId,
        last_run_at: Option<DateTime<Utc>>,
    ) -> Result<(), StoreError> {
        let conn = self.conn()?;
        let changed = conn.execute(
            "UPDATE tracked_profiles SET last_scraped_at = ?1 WHERE id = ?2",
            params![last_run_at.map(format_ts), id],
        )?;
        ensure_found(changed, "profile", id)
    }

    /// Overwrite a profile's next-due time.
    pub fn set_next_run(
        &self,
        id: ProfileId,
        next_run_at: Option<DateTime<Utc>>,
    ) -> Result<(), StoreError> {
        let conn = self.conn()?;
        let changed = conn.execute(
            "UPDATE tracked_profiles SET next_run_at = ?1 WHERE id = ?2",
            params![next_run_at.map(format_ts), id],
        )?;
        ensure_found(changed, "profile", id)
    }
}

impl Store for SqliteStore {
    fn due_profiles(
        &self,
        now: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<TrackedProfile>, StoreError> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {PROFILE_COLUMNS} FROM tracked_profiles
             WHERE is_active = 1
               AND (next_run_at IS NULL OR next_run_at <= ?1)
             ORDER BY {DUE_ORDER}
             LIMIT ?2"
        ))?;
        let profiles = stmt
            .query_map(params![format_ts(now), limit as i64], profile_from_row)?
            .collect::<Result<Vec<_>, _>>()?;

        debug!(count = profiles.len(), limit, "selected due profiles");
        Ok(profiles)
    }

    fn active_profiles_by_ids(&self, ids: &[ProfileId]) -> Result<Vec<TrackedProfile>, StoreError> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }

        let placeholders = vec!["?"; ids.len()].join(", ");
        let conn = self.conn()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {PROFILE_COLUMNS} FROM tracked_profiles
             WHERE is_active = 1 AND id IN ({placeholders})
             ORDER BY {DUE_ORDER}"
        ))?;
        let profiles = stmt
            .query_map(params_from_iter(ids.iter()), profile_from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(profiles)
    }

    fn get_profile(&self, id: ProfileId) -> Result<Option<TrackedProfile>, StoreError> {
        let conn = self.conn()?;
        let profile = conn
            .query_row(
                &format!("SELECT {PROFILE_COLUMNS} FROM tracked_profiles WHERE id = ?1"),
                params![id],
                profile_from_row,
            )
            .optional()?;
        Ok(profile)
    }

    fn insert_profile(
        &self,
        profile: &NewProfile,
        now: DateTime<Utc>,
    ) -> Result<TrackedProfile, StoreError> {
        profile.validate()?;

        let conn = self.conn()?;
        let inserted = conn.execute(
            "INSERT INTO tracked_profiles
             (profile_url, display_name, is_active, priority, tracking_frequency, created_at)
             VALUES (?1, ?2, 1, ?3, ?4, ?5)",
            params![
                profile.profile_url.trim(),
                profile.display_name.trim(),
                profile.priority,
                profile.tracking_frequency.as_str(),
                format_ts(now),
            ],
        );

        match inserted {
            Ok(_) => {}
            Err(rusqlite::Error::SqliteFailure(e, _)) if e.code == ErrorCode::ConstraintViolation => {
                return Err(StoreError::DuplicateProfile(profile.profile_url.clone()));
            }
            Err(e) => return Err(e.into()),
        }

        let id = conn.last_insert_rowid();
        info!(profile_id = id, name = %profile.display_name, "registered profile");

        Ok(TrackedProfile {
            id,
            profile_url: profile.profile_url.trim().to_string(),
            display_name: profile.display_name.trim().to_string(),
            active: true,
            priority: profile.priority,
            tracking_frequency: profile.tracking_frequency,
            created_at: now,
            last_run_at: None,
            next_run_at: None,
        })
    }

    fn list_profiles(&self, active_only: bool) -> Result<Vec<TrackedProfile>, StoreError> {
        let conn = self.conn()?;
        let filter = if active_only { "WHERE is_active = 1" } else { "" };
        let mut stmt = conn.prepare(&format!(
            "SELECT {PROFILE_COLUMNS} FROM tracked_profiles {filter}
             ORDER BY priority DESC, julianday(last_scraped_at) DESC, id ASC"
        ))?;
        let profiles = stmt
            .query_map([], profile_from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(profiles)
    }

    fn set_profile_active(&self, id: ProfileId, active: bool) -> Result<(), StoreError> {
        let conn = self.conn()?;
        let changed = conn.execute(
            "UPDATE tracked_profiles SET is_active = ?1 WHERE id = ?2",
            params![active, id],
        )?;
        ensure_found(changed, "profile", id)
    }

    fn insert_job(&self, job: &NewJob) -> Result<ScrapeJob, StoreError> {
        let conn = self.conn()?;
        conn.execute(
            "INSERT INTO scrape_jobs
             (profile_id, job_type, status, created_at, scheduled_at, max_retries, owner)
             VALUES (?1, ?2, 'pending', ?3, ?4, ?5, ?6)",
            params![
                job.profile_id,
                job.job_type.as_str(),
                format_ts(job.created_at),
                job.scheduled_at.map(format_ts),
                job.max_retries,
                job.owner,
            ],
        )?;

        Ok(ScrapeJob {
            id: conn.last_insert_rowid(),
            profile_id: job.profile_id,
            job_type: job.job_type,
            status: JobStatus::Pending,
            created_at: job.created_at,
            scheduled_at: job.scheduled_at,
            started_at: None,
            completed_at: None,
            items_scraped: 0,
            new_items_found: 0,
            changes_detected: 0,
            error_message: None,
            retry_count: 0,
            max_retries: job.max_retries,
            owner: job.owner.clone(),
        })
    }

    fn update_job(&self, job: &ScrapeJob) -> Result<(), StoreError> {
        let conn = self.conn()?;
        write_job(&conn, job)
    }

    fn get_job(&self, id: JobId) -> Result<Option<ScrapeJob>, StoreError> {
        let conn = self.conn()?;
        let job = conn
            .query_row(
                &format!("SELECT {JOB_COLUMNS} FROM scrape_jobs WHERE id = ?1"),
                params![id],
                job_from_row,
            )
            .optional()?;
        Ok(job)
    }

    fn list_jobs(&self, filter: &JobFilter) -> Result<Vec<ScrapeJob>, StoreError> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {JOB_COLUMNS} FROM scrape_jobs
             WHERE (?1 IS NULL OR status = ?1)
               AND (?2 IS NULL OR profile_id = ?2)
             ORDER BY created_at DESC, id DESC
             LIMIT ?3"
        ))?;
        let jobs = stmt
            .query_map(
                params![
                    filter.status.map(|s| s.as_str()),
                    filter.profile_id,
                    filter.limit as i64,
                ],
                job_from_row,
            )?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(jobs)
    }

    fn commit_dispatch(&self, job: &ScrapeJob, next_runs: &[NextRun]) -> Result<(), StoreError> {
        let mut conn = self.conn()?;
        let tx = conn.transaction()?;

        write_job(&tx, job)?;
        for next in next_runs {
            let changed = tx.execute(
                "UPDATE tracked_profiles SET next_run_at = ?1 WHERE id = ?2",
                params![format_ts(next.next_run_at), next.profile_id],
            )?;
            ensure_found(changed, "profile", next.profile_id)?;
        }

        tx.commit()?;
        debug!(job_id = job.id, profiles = next_runs.len(), "committed dispatch");
        Ok(())
    }

    fn claim_profiles(
        &self,
        ids: &[ProfileId],
        owner: &str,
        now: DateTime<Utc>,
        stale_before: DateTime<Utc>,
    ) -> Result<Vec<ProfileId>, StoreError> {
        let mut conn = self.conn()?;
        let tx = conn.transaction()?;
        let mut won = Vec::with_capacity(ids.len());
        {
            let mut stmt = tx.prepare(
                "INSERT INTO profile_claims (profile_id, owner, claimed_at)
                 VALUES (?1, ?2, ?3)
                 ON CONFLICT(profile_id) DO UPDATE
                 SET owner = excluded.owner, claimed_at = excluded.claimed_at
                 WHERE profile_claims.claimed_at < ?4",
            )?;
            let claimed_at = format_ts(now);
            let stale_before = format_ts(stale_before);
            for &id in ids {
                if stmt.execute(params![id, owner, claimed_at, stale_before])? > 0 {
                    won.push(id);
                }
            }
        }
        tx.commit()?;

        debug!(owner, requested = ids.len(), claimed = won.len(), "claimed profiles");
        Ok(won)
    }

    fn release_profiles(&self, ids: &[ProfileId], owner: &str) -> Result<(), StoreError> {
        if ids.is_empty() {
            return Ok(());
        }

        let placeholders = vec!["?"; ids.len()].join(", ");
        let conn = self.conn()?;
        let mut args: Vec<rusqlite::types::Value> = Vec::with_capacity(ids.len() + 1);
        args.push(owner.to_string().into());
        args.extend(ids.iter().map(|&id| id.into()));
        conn.execute(
            &format!("DELETE FROM profile_claims WHERE owner = ? AND profile_id IN ({placeholders})"),
            params_from_iter(args),
        )?;
        Ok(())
    }

    fn claimed_profiles(&self) -> Result<Vec<ProfileId>, StoreError> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare("SELECT profile_id FROM profile_claims ORDER BY profile_id")?;
        let ids = stmt
            .query_map([], |row| row.get(0))?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(ids)
    }

    fn fail_unfinished_jobs(
        &self,
        owner: &str,
        now: DateTime<Utc>,
        stale_before: DateTime<Utc>,
        message: &str,
    ) -> Result<usize, StoreError> {
        let mut conn = self.conn()?;
        let tx = conn.transaction()?;
        let stale_before = format_ts(stale_before);

        let changed = tx.execute(
            "UPDATE scrape_jobs
             SET status = 'failed', completed_at = ?1, error_message = ?2
             WHERE status IN ('pending', 'running')
               AND (owner IS NULL
                    OR owner = ?3
                    OR COALESCE(started_at, scheduled_at, created_at) < ?4)",
            params![format_ts(now), message, owner, stale_before],
        )?;
        let released = tx.execute(
            "DELETE FROM profile_claims WHERE owner = ?1 OR claimed_at < ?2",
            params![owner, stale_before],
        )?;
        tx.commit()?;

        if changed > 0 || released > 0 {
            warn!(owner, jobs = changed, claims = released, "cleared work left by an earlier run");
        }
        Ok(changed)
    }
}

fn write_job(conn: &Connection, job: &ScrapeJob) -> Result<(), StoreError> {
    let changed = conn.execute(
        "UPDATE scrape_jobs SET
            status = ?1, scheduled_at = ?2, started_at = ?3, completed_at = ?4,
            items_scraped = ?5, new_items_found = ?6, changes_detected = ?7,
            error_message = ?8, retry_count = ?9, max_retries = ?10, owner = ?11
         WHERE id = ?12",
        params![
            job.status.as_str(),
            job.scheduled_at.map(format_ts),
            job.started_at.map(format_ts),
            job.completed_at.map(format_ts),
            job.items_scraped,
            job.new_items_found,
            job.changes_detected,
            job.error_message,
            job.retry_count,
            job.max_retries,
            job.owner,
            job.id,
        ],
    )?;
    ensure_found(changed, "job", job.id)
}

fn ensure_found(changed: usize, entity: &'static str, id: i64) -> Result<(), StoreError> {
    if changed == 0 {
        return Err(StoreError::NotFound { entity, id });
    }
    Ok(())
}

/// Fixed-width UTC timestamps so that text comparison matches time order.
fn format_ts(ts: DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Micros, true)
}

/// Accepts our own RFC 3339 stamps and SQLite's `datetime('now')` text,
/// which is UTC without an offset.
fn parse_ts(idx: usize, raw: &str) -> rusqlite::Result<DateTime<Utc>> {
    match DateTime::parse_from_rfc3339(raw) {
        Ok(ts) => Ok(ts.with_timezone(&Utc)),
        Err(rfc3339) => NaiveDateTime::parse_from_str(raw, "%Y-%m-%d %H:%M:%S%.f")
            .map(|naive| naive.and_utc())
            .map_err(|_| {
                rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(rfc3339))
            }),
    }
}

fn parse_opt_ts(row: &Row<'_>, idx: usize) -> rusqlite::Result<Option<DateTime<Utc>>> {
    row.get::<_, Option<String>>(idx)?
        .map(|raw| parse_ts(idx, &raw))
        .transpose()
}

fn parse_label<T>(idx: usize, raw: &str) -> rusqlite::Result<T>
where
    T: std::str::FromStr<Err = StoreError>,
{
    raw.parse()
        .map_err(|e: StoreError| rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(e)))
}

fn profile_from_row(row: &Row<'_>) -> rusqlite::Result<TrackedProfile> {
    let id: ProfileId = row.get(0)?;
    let frequency: String = row.get(5)?;
    let tracking_frequency = TrackingFrequency::from_label(&frequency).unwrap_or_else(|| {
        warn!(profile_id = id, frequency = %frequency, "unrecognized tracking frequency, using daily");
        TrackingFrequency::Daily
    });
    let created_at: String = row.get(6)?;

    Ok(TrackedProfile {
        id,
        profile_url: row.get(1)?,
        display_name: row.get(2)?,
        active: row.get(3)?,
        priority: row.get(4)?,
        tracking_frequency,
        created_at: parse_ts(6, &created_at)?,
        last_run_at: parse_opt_ts(row, 7)?,
        next_run_at: parse_opt_ts(row, 8)?,
    })
}

fn job_from_row(row: &Row<'_>) -> rusqlite::Result<ScrapeJob> {
    let job_type: String = row.get(2)?;
    let status: String = row.get(3)?;
    let created_at: String = row.get(4)?;

    Ok(ScrapeJob {
        id: row.get(0)?,
        profile_id: row.get(1)?,
        job_type: parse_label::<JobType>(2, &job_type)?,
        status: parse_label::<JobStatus>(3, &status)?,
        created_at: parse_ts(4, &created_at)?,
        scheduled_at: parse_opt_ts(row, 5)?,
        started_at: parse_opt_ts(row, 6)?,
        completed_at: parse_opt_ts(row, 7)?,
        items_scraped: row.get(8)?,
        new_items_found: row.get(9)?,
        changes_detected: row.get(10)?,
        error_message: row.get(11)?,
        retry_count: row.get(12)?,
        max_retries: row.get(13)?,
        owner: row.get(14)?,
    })
}
