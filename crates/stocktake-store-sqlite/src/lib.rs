use std::path::Path;
use std::str::FromStr;

use anyhow::{anyhow, Context};
use rusqlite::{params, params_from_iter, Connection};
use stocktake_core::{SubmissionId, SubmissionRecord, SubmissionStatus, UserRecord};
use time::format_description::well_known::Rfc3339;
use time::OffsetDateTime;
use ulid::Ulid;

const LATEST_SCHEMA_VERSION: i64 = 1;

const CREATE_SCHEMA_MIGRATIONS_SQL: &str = r"
CREATE TABLE IF NOT EXISTS schema_migrations (
  version INTEGER PRIMARY KEY,
  applied_at TEXT NOT NULL
);
";

const MIGRATION_001_SQL: &str = r"
CREATE TABLE IF NOT EXISTS submissions (
  submission_id TEXT NOT NULL,
  version INTEGER NOT NULL CHECK (version >= 1),
  status TEXT NOT NULL CHECK (status IN ('active','superseded','archived')),
  user_id TEXT NOT NULL,
  modified_by TEXT NOT NULL,
  created_at TEXT NOT NULL,
  updated_at TEXT NOT NULL,
  payload_json TEXT NOT NULL,
  PRIMARY KEY (submission_id, version)
);

CREATE TABLE IF NOT EXISTS users (
  user_id TEXT PRIMARY KEY,
  email TEXT NOT NULL,
  name TEXT NOT NULL,
  created_at TEXT NOT NULL,
  updated_at TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_submissions_user_status ON submissions(user_id, status);
CREATE INDEX IF NOT EXISTS idx_submissions_status ON submissions(status);
";

const SELECT_RECORD_COLUMNS: &str =
    "submission_id, version, status, user_id, modified_by, created_at, updated_at, payload_json";

/// Closed persistence error set. Callers match on the kind, never on error
/// message text.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("conflict: {0}")]
    Conflict(String),
    #[error("not found: {0}")]
    NotFound(String),
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

pub struct SqliteStore {
    conn: Connection,
}

impl SqliteStore {
    /// Open a SQLite-backed submission store and configure runtime pragmas.
    ///
    /// # Errors
    /// Returns an error when the database cannot be opened or pragmas cannot
    /// be applied.
    pub fn open(path: &Path) -> Result<Self, StoreError> {
        let conn = Connection::open(path)
            .with_context(|| format!("failed to open sqlite database at {}", path.display()))?;
        configure(&conn)?;
        Ok(Self { conn })
    }

    /// Open a transient in-memory store, used by tests and local tooling.
    ///
    /// # Errors
    /// Returns an error when the in-memory database cannot be created.
    pub fn open_in_memory() -> Result<Self, StoreError> {
        let conn =
            Connection::open_in_memory().context("failed to open in-memory sqlite database")?;
        configure(&conn)?;
        Ok(Self { conn })
    }

    /// Apply all forward migrations up to the latest supported schema version.
    ///
    /// # Errors
    /// Returns an error when migration bootstrapping or any migration step
    /// fails.
    pub fn migrate(&mut self) -> Result<(), StoreError> {
        self.conn
            .execute_batch(CREATE_SCHEMA_MIGRATIONS_SQL)
            .context("failed to apply schema_migrations table")?;

        let mut version = current_schema_version(&self.conn)?;

        if version == 0 {
            apply_migration_1(&self.conn)?;
            version = current_schema_version(&self.conn)?;
        }

        if version != LATEST_SCHEMA_VERSION {
            return Err(StoreError::Other(anyhow!(
                "unsupported schema version {version}; expected {LATEST_SCHEMA_VERSION}"
            )));
        }

        Ok(())
    }

    /// Insert one submission version row.
    ///
    /// # Errors
    /// Returns [`StoreError::Conflict`] when the `(submission_id, version)`
    /// pair already exists, which is how a racing writer loses.
    pub fn insert_version(&mut self, record: &SubmissionRecord) -> Result<(), StoreError> {
        let tx = self.conn.transaction().context("failed to start insert transaction")?;
        insert_version_row(&tx, record)?;
        tx.commit().context("failed to commit insert transaction")?;
        Ok(())
    }

    /// Newest version with `status = active`, or `None`.
    ///
    /// # Errors
    /// Returns an error when rows cannot be read or decoded.
    pub fn latest_active(
        &self,
        submission_id: SubmissionId,
    ) -> Result<Option<SubmissionRecord>, StoreError> {
        self.latest_with_status(submission_id, SubmissionStatus::Active)
    }

    /// Newest version with `status = archived`, or `None`.
    ///
    /// # Errors
    /// Returns an error when rows cannot be read or decoded.
    pub fn latest_archived(
        &self,
        submission_id: SubmissionId,
    ) -> Result<Option<SubmissionRecord>, StoreError> {
        self.latest_with_status(submission_id, SubmissionStatus::Archived)
    }

    fn latest_with_status(
        &self,
        submission_id: SubmissionId,
        status: SubmissionStatus,
    ) -> Result<Option<SubmissionRecord>, StoreError> {
        let mut stmt = self
            .conn
            .prepare(&format!(
                "SELECT {SELECT_RECORD_COLUMNS}
                 FROM submissions
                 WHERE submission_id = ?1 AND status = ?2
                 ORDER BY version DESC
                 LIMIT 1"
            ))
            .context("failed to prepare latest-version query")?;

        let mut rows = stmt
            .query(params![submission_id.to_string(), status.as_str()])
            .context("failed to query latest version")?;

        match rows.next().context("failed to read latest version row")? {
            Some(row) => Ok(Some(decode_record(row)?)),
            None => Ok(None),
        }
    }

    /// Version 1 of a submission, regardless of its current status. Its
    /// creation date anchors the attachment prefix for every later version.
    ///
    /// # Errors
    /// Returns an error when rows cannot be read or decoded.
    pub fn first_version(
        &self,
        submission_id: SubmissionId,
    ) -> Result<Option<SubmissionRecord>, StoreError> {
        let mut stmt = self
            .conn
            .prepare(&format!(
                "SELECT {SELECT_RECORD_COLUMNS}
                 FROM submissions
                 WHERE submission_id = ?1 AND version = 1"
            ))
            .context("failed to prepare first-version query")?;

        let mut rows = stmt
            .query(params![submission_id.to_string()])
            .context("failed to query first version")?;

        match rows.next().context("failed to read first version row")? {
            Some(row) => Ok(Some(decode_record(row)?)),
            None => Ok(None),
        }
    }

    /// All versions of one submission, newest version first.
    ///
    /// # Errors
    /// Returns an error when rows cannot be read or decoded.
    pub fn version_history(
        &self,
        submission_id: SubmissionId,
    ) -> Result<Vec<SubmissionRecord>, StoreError> {
        let mut stmt = self
            .conn
            .prepare(&format!(
                "SELECT {SELECT_RECORD_COLUMNS}
                 FROM submissions
                 WHERE submission_id = ?1
                 ORDER BY version DESC"
            ))
            .context("failed to prepare history query")?;

        let mut rows =
            stmt.query(params![submission_id.to_string()]).context("failed to query history")?;
        collect_records(&mut rows)
    }

    /// One owner's submission versions in a given status, newest update first.
    ///
    /// # Errors
    /// Returns an error when rows cannot be read or decoded.
    pub fn list_by_user(
        &self,
        user_id: &str,
        status: SubmissionStatus,
    ) -> Result<Vec<SubmissionRecord>, StoreError> {
        let mut stmt = self
            .conn
            .prepare(&format!(
                "SELECT {SELECT_RECORD_COLUMNS}
                 FROM submissions
                 WHERE user_id = ?1 AND status = ?2
                 ORDER BY updated_at DESC, submission_id ASC"
            ))
            .context("failed to prepare owner listing query")?;

        let mut rows = stmt
            .query(params![user_id, status.as_str()])
            .context("failed to query owner listing")?;
        collect_records(&mut rows)
    }

    /// Every submission version in a given status, newest update first.
    ///
    /// # Errors
    /// Returns an error when rows cannot be read or decoded.
    pub fn list_by_status(
        &self,
        status: SubmissionStatus,
    ) -> Result<Vec<SubmissionRecord>, StoreError> {
        let mut stmt = self
            .conn
            .prepare(&format!(
                "SELECT {SELECT_RECORD_COLUMNS}
                 FROM submissions
                 WHERE status = ?1
                 ORDER BY updated_at DESC, submission_id ASC"
            ))
            .context("failed to prepare status listing query")?;

        let mut rows =
            stmt.query(params![status.as_str()]).context("failed to query status listing")?;
        collect_records(&mut rows)
    }

    /// Mark the current active version superseded and insert its successor as
    /// one atomic unit.
    ///
    /// # Errors
    /// Returns [`StoreError::Conflict`] when the observed current version is
    /// no longer active, or when the successor's version number was already
    /// taken by a racing writer.
    pub fn supersede_and_insert(
        &mut self,
        current: &SubmissionRecord,
        next: &SubmissionRecord,
        now: OffsetDateTime,
    ) -> Result<(), StoreError> {
        let tx = self.conn.transaction().context("failed to start update transaction")?;

        let changed = tx
            .execute(
                "UPDATE submissions
                 SET status = 'superseded', updated_at = ?1
                 WHERE submission_id = ?2 AND version = ?3 AND status = 'active'",
                params![rfc3339(now)?, current.submission_id.to_string(), current.version],
            )
            .context("failed to supersede current version")?;
        if changed == 0 {
            return Err(StoreError::Conflict(format!(
                "submission {} version {} is no longer active",
                current.submission_id, current.version
            )));
        }

        insert_version_row(&tx, next)?;
        tx.commit().context("failed to commit update transaction")?;
        Ok(())
    }

    /// Flip one version's status in place, conditionally on the previously
    /// observed status.
    ///
    /// # Errors
    /// Returns [`StoreError::Conflict`] when the row is no longer in the
    /// expected status.
    pub fn set_status_checked(
        &mut self,
        submission_id: SubmissionId,
        version: u32,
        expected: SubmissionStatus,
        new_status: SubmissionStatus,
        now: OffsetDateTime,
    ) -> Result<(), StoreError> {
        let changed = self
            .conn
            .execute(
                "UPDATE submissions
                 SET status = ?1, updated_at = ?2
                 WHERE submission_id = ?3 AND version = ?4 AND status = ?5",
                params![
                    new_status.as_str(),
                    rfc3339(now)?,
                    submission_id.to_string(),
                    version,
                    expected.as_str()
                ],
            )
            .context("failed to update submission status")?;
        if changed == 0 {
            return Err(StoreError::Conflict(format!(
                "submission {submission_id} version {version} is not {}",
                expected.as_str()
            )));
        }
        Ok(())
    }

    /// Reactivate an archived version, refusing while any other version of
    /// the same submission is active.
    ///
    /// # Errors
    /// Returns [`StoreError::Conflict`] when the version is not archived or
    /// an active version already exists.
    pub fn activate_archived(
        &mut self,
        submission_id: SubmissionId,
        version: u32,
        now: OffsetDateTime,
    ) -> Result<(), StoreError> {
        let id = submission_id.to_string();
        let changed = self
            .conn
            .execute(
                "UPDATE submissions
                 SET status = 'active', updated_at = ?1
                 WHERE submission_id = ?2 AND version = ?3 AND status = 'archived'
                   AND NOT EXISTS (
                     SELECT 1 FROM submissions
                     WHERE submission_id = ?2 AND status = 'active'
                   )",
                params![rfc3339(now)?, id, version],
            )
            .context("failed to reactivate archived version")?;
        if changed == 0 {
            return Err(StoreError::Conflict(format!(
                "submission {submission_id} version {version} cannot be restored"
            )));
        }
        Ok(())
    }

    /// Create a user record unless one already exists (first-write-wins).
    /// Returns whether a row was written.
    ///
    /// # Errors
    /// Returns an error when the write fails.
    pub fn create_user_if_absent(&mut self, user: &UserRecord) -> Result<bool, StoreError> {
        let changed = self
            .conn
            .execute(
                "INSERT OR IGNORE INTO users(user_id, email, name, created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                params![
                    user.user_id,
                    user.email,
                    user.name,
                    rfc3339(user.created_at)?,
                    rfc3339(user.updated_at)?
                ],
            )
            .context("failed to insert user record")?;
        Ok(changed > 0)
    }

    /// Fetch the user records for the given ids; unknown ids are absent from
    /// the result.
    ///
    /// # Errors
    /// Returns an error when rows cannot be read or decoded.
    pub fn get_users(&self, user_ids: &[String]) -> Result<Vec<UserRecord>, StoreError> {
        if user_ids.is_empty() {
            return Ok(Vec::new());
        }

        let placeholders =
            (1..=user_ids.len()).map(|index| format!("?{index}")).collect::<Vec<_>>().join(", ");
        let mut stmt = self
            .conn
            .prepare(&format!(
                "SELECT user_id, email, name, created_at, updated_at
                 FROM users
                 WHERE user_id IN ({placeholders})
                 ORDER BY user_id ASC"
            ))
            .context("failed to prepare user lookup query")?;

        let mut rows =
            stmt.query(params_from_iter(user_ids.iter())).context("failed to query users")?;
        let mut users = Vec::new();
        while let Some(row) = rows.next().context("failed to read user row")? {
            let created_at_raw: String = row.get(3).context("failed to read created_at")?;
            let updated_at_raw: String = row.get(4).context("failed to read updated_at")?;
            users.push(UserRecord {
                user_id: row.get(0).context("failed to read user_id")?,
                email: row.get(1).context("failed to read email")?,
                name: row.get(2).context("failed to read name")?,
                created_at: parse_rfc3339(&created_at_raw)?,
                updated_at: parse_rfc3339(&updated_at_raw)?,
            });
        }
        Ok(users)
    }
}

fn configure(conn: &Connection) -> Result<(), StoreError> {
    conn.execute_batch(
        "PRAGMA journal_mode = WAL;
         PRAGMA foreign_keys = ON;
         PRAGMA busy_timeout = 5000;",
    )
    .context("failed to configure sqlite pragmas")?;
    Ok(())
}

fn current_schema_version(conn: &Connection) -> Result<i64, StoreError> {
    let version: Option<i64> = conn
        .query_row("SELECT MAX(version) FROM schema_migrations", [], |row| row.get(0))
        .context("failed to read schema version")?;
    Ok(version.unwrap_or(0))
}

fn apply_migration_1(conn: &Connection) -> Result<(), StoreError> {
    conn.execute_batch(MIGRATION_001_SQL).context("failed to apply migration v1")?;
    conn.execute(
        "INSERT OR IGNORE INTO schema_migrations(version, applied_at) VALUES (?1, ?2)",
        params![1_i64, rfc3339(OffsetDateTime::now_utc())?],
    )
    .context("failed to record migration version 1")?;
    Ok(())
}

fn insert_version_row(conn: &Connection, record: &SubmissionRecord) -> Result<(), StoreError> {
    let payload_json = serde_json::to_string(&record.payload)
        .context("failed to serialize submission payload")?;

    let inserted = conn.execute(
        "INSERT INTO submissions(
            submission_id, version, status, user_id, modified_by,
            created_at, updated_at, payload_json
        ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
        params![
            record.submission_id.to_string(),
            record.version,
            record.status.as_str(),
            record.user_id,
            record.modified_by,
            rfc3339(record.created_at)?,
            rfc3339(record.updated_at)?,
            payload_json,
        ],
    );

    match inserted {
        Ok(_) => Ok(()),
        Err(err) if is_constraint_violation(&err) => Err(StoreError::Conflict(format!(
            "submission {} version {} already exists",
            record.submission_id, record.version
        ))),
        Err(err) => Err(StoreError::Other(
            anyhow::Error::new(err).context("failed to insert submission version"),
        )),
    }
}

fn is_constraint_violation(err: &rusqlite::Error) -> bool {
    matches!(
        err,
        rusqlite::Error::SqliteFailure(failure, _)
            if failure.code == rusqlite::ErrorCode::ConstraintViolation
    )
}

fn collect_records(rows: &mut rusqlite::Rows<'_>) -> Result<Vec<SubmissionRecord>, StoreError> {
    let mut records = Vec::new();
    while let Some(row) = rows.next().context("failed to read submission row")? {
        records.push(decode_record(row)?);
    }
    Ok(records)
}

fn decode_record(row: &rusqlite::Row<'_>) -> Result<SubmissionRecord, StoreError> {
    let submission_id_raw: String = row.get(0).context("failed to read submission_id")?;
    let status_raw: String = row.get(2).context("failed to read status")?;
    let created_at_raw: String = row.get(5).context("failed to read created_at")?;
    let updated_at_raw: String = row.get(6).context("failed to read updated_at")?;
    let payload_json: String = row.get(7).context("failed to read payload_json")?;

    Ok(SubmissionRecord {
        submission_id: parse_submission_id(&submission_id_raw)?,
        version: row.get(1).context("failed to read version")?,
        status: SubmissionStatus::parse(&status_raw)
            .ok_or_else(|| anyhow!("unknown submission status: {status_raw}"))?,
        user_id: row.get(3).context("failed to read user_id")?,
        modified_by: row.get(4).context("failed to read modified_by")?,
        created_at: parse_rfc3339(&created_at_raw)?,
        updated_at: parse_rfc3339(&updated_at_raw)?,
        payload: serde_json::from_str(&payload_json)
            .context("failed to deserialize submission payload")?,
    })
}

fn parse_submission_id(raw: &str) -> Result<SubmissionId, StoreError> {
    let ulid =
        Ulid::from_str(raw).with_context(|| format!("invalid submission id: {raw}"))?;
    Ok(SubmissionId(ulid))
}

fn rfc3339(value: OffsetDateTime) -> Result<String, StoreError> {
    Ok(value.format(&Rfc3339).context("failed to format timestamp")?)
}

fn parse_rfc3339(raw: &str) -> Result<OffsetDateTime, StoreError> {
    Ok(OffsetDateTime::parse(raw, &Rfc3339)
        .with_context(|| format!("invalid timestamp: {raw}"))?)
}
