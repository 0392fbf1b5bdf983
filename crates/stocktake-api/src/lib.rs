use std::collections::{BTreeMap, BTreeSet};
use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use stocktake_core::{
    attachment_prefix, email_domain_allowed, resolve_identity, validate_submission, Claims,
    DeployEnv, FieldError, Identity, StocktakeError, SubmissionId, SubmissionRecord,
    SubmissionStatus, UserRecord,
};
use stocktake_files::{AttachmentCoordinator, AttachmentEntry, FilesError, ObjectStore, UploadGrant};
use stocktake_store_sqlite::{SqliteStore, StoreError};
use time::OffsetDateTime;

pub const MAX_LOOKUP_USER_IDS: usize = 25;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct WriteReceipt {
    pub submission_id: SubmissionId,
    pub version: u32,
    pub message: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct SubmissionList {
    pub submissions: Vec<SubmissionRecord>,
    pub count: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct SubmissionHistory {
    pub submission_id: SubmissionId,
    pub versions: Vec<SubmissionRecord>,
    pub count: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct UserLookup {
    pub users: BTreeMap<String, UserRecord>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct AttachmentList {
    pub files: Vec<AttachmentEntry>,
}

/// Signup trigger kinds forwarded by the upstream authenticator. Only
/// confirmed sign-ups create a user record; everything else passes through.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq)]
#[serde(rename_all = "snake_case")]
pub enum SignupEventKind {
    ConfirmSignup,
    ForgotPassword,
    Other,
}

/// The versioning and lifecycle controller. Owns the version allocation
/// rules; the store only enforces them mechanically.
pub struct StocktakeApi<S: ObjectStore> {
    db_path: PathBuf,
    env: DeployEnv,
    allowed_domains: Vec<String>,
    attachments: AttachmentCoordinator<S>,
}

impl<S: ObjectStore> StocktakeApi<S> {
    #[must_use]
    pub fn new(
        db_path: PathBuf,
        env: DeployEnv,
        allowed_domains: Vec<String>,
        attachments: AttachmentCoordinator<S>,
    ) -> Self {
        Self { db_path, env, allowed_domains, attachments }
    }

    fn open_store(&self) -> Result<SqliteStore, StocktakeError> {
        let mut store = SqliteStore::open(&self.db_path).map_err(map_store_err)?;
        store.migrate().map_err(map_store_err)?;
        Ok(store)
    }

    fn identity(&self, claims: Option<&Claims>) -> Result<Identity, StocktakeError> {
        resolve_identity(claims, self.env)
    }

    /// Validate a payload and persist it as version 1 of a new submission.
    ///
    /// Nothing is persisted when validation fails.
    ///
    /// # Errors
    /// Returns `Validation` with the full field-error list, `AuthRequired`,
    /// or an `Upstream` persistence failure.
    pub fn create(
        &self,
        claims: Option<&Claims>,
        body: &Map<String, Value>,
    ) -> Result<WriteReceipt, StocktakeError> {
        let identity = self.identity(claims)?;
        let payload = validate_submission(body).map_err(StocktakeError::Validation)?;

        let record =
            SubmissionRecord::first_version(payload, &identity.user_id, OffsetDateTime::now_utc());
        let mut store = self.open_store()?;
        store.insert_version(&record).map_err(map_store_err)?;

        tracing::info!(
            submission_id = %record.submission_id,
            user_id = %identity.user_id,
            "submission created"
        );
        Ok(WriteReceipt {
            submission_id: record.submission_id,
            version: record.version,
            message: "Submission created successfully".to_string(),
        })
    }

    /// Current active version of one submission.
    ///
    /// # Errors
    /// Returns `NotFound` when no active version exists.
    pub fn get_current(
        &self,
        claims: Option<&Claims>,
        submission_id: SubmissionId,
    ) -> Result<SubmissionRecord, StocktakeError> {
        self.identity(claims)?;
        let store = self.open_store()?;
        store.latest_active(submission_id).map_err(map_store_err)?.ok_or_else(|| {
            StocktakeError::NotFound(format!(
                "No active submission found with id {submission_id}"
            ))
        })
    }

    /// Replace the active version with a validated successor. The racing
    /// loser of two concurrent updates receives `Conflict`.
    ///
    /// # Errors
    /// Returns `Validation`, `NotFound` when no active version exists, or
    /// `Conflict` when another writer got there first.
    pub fn update(
        &self,
        claims: Option<&Claims>,
        submission_id: SubmissionId,
        body: &Map<String, Value>,
    ) -> Result<WriteReceipt, StocktakeError> {
        let identity = self.identity(claims)?;
        let payload = validate_submission(body).map_err(StocktakeError::Validation)?;

        let mut store = self.open_store()?;
        let current = store.latest_active(submission_id).map_err(map_store_err)?.ok_or_else(
            || {
                StocktakeError::NotFound(format!(
                    "No active submission found with id {submission_id}"
                ))
            },
        )?;

        let now = OffsetDateTime::now_utc();
        let next = current.next_version(payload, &identity.user_id, now);
        store.supersede_and_insert(&current, &next, now).map_err(map_store_err)?;

        tracing::info!(
            submission_id = %submission_id,
            version = next.version,
            user_id = %identity.user_id,
            "submission updated"
        );
        Ok(WriteReceipt {
            submission_id,
            version: next.version,
            message: "Submission updated successfully".to_string(),
        })
    }

    /// Archive the active version in place. The version number does not
    /// change; the row flips to `archived` conditionally on still being
    /// active.
    ///
    /// # Errors
    /// Returns `NotFound` when no active version exists, or `Conflict` when
    /// a concurrent writer archived or superseded it first.
    pub fn archive(
        &self,
        claims: Option<&Claims>,
        submission_id: SubmissionId,
    ) -> Result<WriteReceipt, StocktakeError> {
        let identity = self.identity(claims)?;
        let mut store = self.open_store()?;
        let current = store.latest_active(submission_id).map_err(map_store_err)?.ok_or_else(
            || {
                StocktakeError::NotFound(format!(
                    "No active submission found with id {submission_id}"
                ))
            },
        )?;

        store
            .set_status_checked(
                submission_id,
                current.version,
                SubmissionStatus::Active,
                SubmissionStatus::Archived,
                OffsetDateTime::now_utc(),
            )
            .map_err(map_store_err)?;

        tracing::info!(
            submission_id = %submission_id,
            version = current.version,
            user_id = %identity.user_id,
            "submission archived"
        );
        Ok(WriteReceipt {
            submission_id,
            version: current.version,
            message: "Submission archived successfully".to_string(),
        })
    }

    /// Reactivate the most recently archived version. Superseded versions
    /// never come back, and restoring refuses while another version is
    /// active.
    ///
    /// # Errors
    /// Returns `NotFound` when no archived version exists, or `Conflict`
    /// when the restore condition fails.
    pub fn restore(
        &self,
        claims: Option<&Claims>,
        submission_id: SubmissionId,
    ) -> Result<WriteReceipt, StocktakeError> {
        let identity = self.identity(claims)?;
        let mut store = self.open_store()?;
        let archived = store.latest_archived(submission_id).map_err(map_store_err)?.ok_or_else(
            || {
                StocktakeError::NotFound(format!(
                    "No archived submission found with id {submission_id}"
                ))
            },
        )?;

        store
            .activate_archived(submission_id, archived.version, OffsetDateTime::now_utc())
            .map_err(map_store_err)?;

        tracing::info!(
            submission_id = %submission_id,
            version = archived.version,
            user_id = %identity.user_id,
            "submission restored"
        );
        Ok(WriteReceipt {
            submission_id,
            version: archived.version,
            message: "Submission restored successfully".to_string(),
        })
    }

    /// Full version history of one submission, newest first. Audit view;
    /// includes superseded and archived versions.
    ///
    /// # Errors
    /// Returns `NotFound` when the submission id has no versions at all.
    pub fn history(
        &self,
        claims: Option<&Claims>,
        submission_id: SubmissionId,
    ) -> Result<SubmissionHistory, StocktakeError> {
        self.identity(claims)?;
        let store = self.open_store()?;
        let versions = store.version_history(submission_id).map_err(map_store_err)?;
        if versions.is_empty() {
            return Err(StocktakeError::NotFound(format!(
                "No submission found with id {submission_id}"
            )));
        }
        let count = versions.len();
        Ok(SubmissionHistory { submission_id, versions, count })
    }

    /// The caller's own submissions in the requested status (default
    /// `active`).
    ///
    /// # Errors
    /// Returns `Validation` for an unknown status filter.
    pub fn list_mine(
        &self,
        claims: Option<&Claims>,
        status: Option<&str>,
    ) -> Result<SubmissionList, StocktakeError> {
        let identity = self.identity(claims)?;
        let status = parse_status_filter(status)?;
        let store = self.open_store()?;
        let submissions =
            store.list_by_user(&identity.user_id, status).map_err(map_store_err)?;
        let count = submissions.len();
        Ok(SubmissionList { submissions, count })
    }

    /// Every user's submissions in the requested status (default `active`).
    ///
    /// # Errors
    /// Returns `Validation` for an unknown status filter.
    pub fn list_all(
        &self,
        claims: Option<&Claims>,
        status: Option<&str>,
    ) -> Result<SubmissionList, StocktakeError> {
        self.identity(claims)?;
        let status = parse_status_filter(status)?;
        let store = self.open_store()?;
        let submissions = store.list_by_status(status).map_err(map_store_err)?;
        let count = submissions.len();
        Ok(SubmissionList { submissions, count })
    }

    /// Batch collaborator lookup: at most 25 ids, deduplicated; unknown ids
    /// are absent from the result map.
    ///
    /// # Errors
    /// Returns `Validation` when the id list is empty or too long.
    pub fn lookup_users(
        &self,
        claims: Option<&Claims>,
        user_ids: &[String],
    ) -> Result<UserLookup, StocktakeError> {
        self.identity(claims)?;
        if user_ids.is_empty() {
            return Err(StocktakeError::Validation(vec![FieldError::new(
                "userIds",
                "userIds must be a non-empty list",
            )]));
        }
        if user_ids.len() > MAX_LOOKUP_USER_IDS {
            return Err(StocktakeError::Validation(vec![FieldError::new(
                "userIds",
                format!("Maximum {MAX_LOOKUP_USER_IDS} user IDs per request"),
            )]));
        }

        let unique: Vec<String> =
            user_ids.iter().cloned().collect::<BTreeSet<_>>().into_iter().collect();
        let store = self.open_store()?;
        let found = store.get_users(&unique).map_err(map_store_err)?;
        let users = found.into_iter().map(|user| (user.user_id.clone(), user)).collect();
        Ok(UserLookup { users })
    }

    /// Issue a short-lived upload grant for a new attachment on the active
    /// submission.
    ///
    /// # Errors
    /// Returns `NotFound` when no active version exists, or `Validation`
    /// when the filename or content type is rejected.
    pub fn grant_upload(
        &self,
        claims: Option<&Claims>,
        submission_id: SubmissionId,
        filename: &str,
        content_type: &str,
    ) -> Result<UploadGrant, StocktakeError> {
        self.identity(claims)?;
        let prefix = self.prefix_for(submission_id)?;
        self.attachments
            .grant_upload(&prefix, filename, content_type, OffsetDateTime::now_utc())
            .map_err(map_files_err)
    }

    /// List the active submission's attachments with signed download URLs.
    ///
    /// # Errors
    /// Returns `NotFound` when no active version exists.
    pub fn list_files(
        &self,
        claims: Option<&Claims>,
        submission_id: SubmissionId,
    ) -> Result<AttachmentList, StocktakeError> {
        self.identity(claims)?;
        let prefix = self.prefix_for(submission_id)?;
        let files = self
            .attachments
            .list_for(&prefix, OffsetDateTime::now_utc())
            .map_err(map_files_err)?;
        Ok(AttachmentList { files })
    }

    /// Delete one attachment addressed by display name.
    ///
    /// # Errors
    /// Returns `NotFound` when the submission or the named file does not
    /// exist.
    pub fn delete_file(
        &self,
        claims: Option<&Claims>,
        submission_id: SubmissionId,
        filename: &str,
    ) -> Result<String, StocktakeError> {
        self.identity(claims)?;
        let prefix = self.prefix_for(submission_id)?;
        self.attachments.delete_by_display_name(&prefix, filename).map_err(map_files_err)?;
        tracing::info!(submission_id = %submission_id, filename, "attachment deleted");
        Ok(format!("File deleted: {filename}"))
    }

    /// Pre-signup gate: reject emails from domains outside the allow-list.
    /// An empty allow-list admits everyone.
    ///
    /// # Errors
    /// Returns `Validation` naming the rejected domain.
    pub fn check_pre_signup(&self, email: &str) -> Result<(), StocktakeError> {
        if email_domain_allowed(email, &self.allowed_domains) {
            return Ok(());
        }
        let domain = email.rsplit_once('@').map_or("", |(_, domain)| domain).to_lowercase();
        tracing::warn!(domain = %domain, "signup rejected by domain allow-list");
        Err(StocktakeError::Validation(vec![FieldError::new(
            "email",
            format!(
                "Email domain '{domain}' is not allowed. Please use an email from: {}",
                self.allowed_domains.join(", ")
            ),
        )]))
    }

    /// Post-confirmation adapter: create the user record once, on the
    /// signup-confirmation event only. Returns whether a record was written.
    ///
    /// # Errors
    /// Returns an `Upstream` error when persistence fails.
    pub fn handle_post_confirmation(
        &self,
        kind: SignupEventKind,
        sub: &str,
        email: &str,
        name: &str,
    ) -> Result<bool, StocktakeError> {
        if kind != SignupEventKind::ConfirmSignup {
            tracing::info!(?kind, "skipping non-signup confirmation event");
            return Ok(false);
        }

        let now = OffsetDateTime::now_utc();
        let user = UserRecord {
            user_id: sub.to_string(),
            email: email.to_string(),
            name: name.to_string(),
            created_at: now,
            updated_at: now,
        };
        let mut store = self.open_store()?;
        let created = store.create_user_if_absent(&user).map_err(map_store_err)?;
        if created {
            tracing::info!(user_id = %sub, "user record created");
        } else {
            tracing::info!(user_id = %sub, "user record already exists, skipping");
        }
        Ok(created)
    }

    fn prefix_for(&self, submission_id: SubmissionId) -> Result<String, StocktakeError> {
        let store = self.open_store()?;
        store.latest_active(submission_id).map_err(map_store_err)?.ok_or_else(|| {
            StocktakeError::NotFound("Submission not found".to_string())
        })?;
        // All versions share one prefix, anchored to version 1's creation
        // date; the active version's timestamps move on every update.
        let first = store.first_version(submission_id).map_err(map_store_err)?.ok_or_else(
            || StocktakeError::NotFound("Submission not found".to_string()),
        )?;
        Ok(attachment_prefix(first.created_at, submission_id))
    }
}

fn parse_status_filter(status: Option<&str>) -> Result<SubmissionStatus, StocktakeError> {
    match status {
        None => Ok(SubmissionStatus::Active),
        Some(raw) => SubmissionStatus::parse(raw).ok_or_else(|| {
            StocktakeError::Validation(vec![FieldError::new(
                "status",
                "status must be one of: active, archived, superseded",
            )])
        }),
    }
}

fn map_store_err(err: StoreError) -> StocktakeError {
    match err {
        StoreError::Conflict(message) => StocktakeError::Conflict(message),
        StoreError::NotFound(message) => StocktakeError::NotFound(message),
        StoreError::Other(err) => {
            tracing::error!(error = %format!("{err:#}"), "store failure");
            StocktakeError::Upstream(format!("{err:#}"))
        }
    }
}

fn map_files_err(err: FilesError) -> StocktakeError {
    match err {
        FilesError::Invalid(field_error) => StocktakeError::Validation(vec![field_error]),
        FilesError::NotFound(message) => StocktakeError::NotFound(message),
        FilesError::Other(err) => {
            tracing::error!(error = %format!("{err:#}"), "attachment store failure");
            StocktakeError::Upstream(format!("{err:#}"))
        }
    }
}
