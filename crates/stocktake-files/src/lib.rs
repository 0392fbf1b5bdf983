use std::fs;
use std::path::PathBuf;

use anyhow::{anyhow, Context};
use hmac::{Hmac, Mac};
use rand::RngCore;
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use stocktake_core::{attachment_key, display_name_from_key, FieldError};
use time::{Duration, OffsetDateTime};

type HmacSha256 = Hmac<Sha256>;

pub const UPLOAD_GRANT_TTL: Duration = Duration::seconds(300);
pub const DOWNLOAD_GRANT_TTL: Duration = Duration::seconds(3600);
pub const MAX_UPLOAD_BYTES: u64 = 10 * 1024 * 1024;

/// Sorted so rejection messages are stable.
pub const ALLOWED_CONTENT_TYPES: &[&str] = &[
    "application/pdf",
    "application/vnd.ms-excel",
    "application/vnd.openxmlformats-officedocument.spreadsheetml.sheet",
    "image/gif",
    "image/jpeg",
    "image/png",
    "text/csv",
];

#[derive(Debug, thiserror::Error)]
pub enum FilesError {
    #[error("invalid attachment request: {}: {}", .0.field, .0.message)]
    Invalid(FieldError),
    #[error("not found: {0}")]
    NotFound(String),
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Minimal object listing view; the coordinator never reads object bytes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredObject {
    pub key: String,
    pub size: u64,
}

pub trait ObjectStore: Send + Sync {
    /// List objects whose keys start with `prefix`, in key order.
    ///
    /// # Errors
    /// Returns an error when the underlying store cannot be read.
    fn list(&self, prefix: &str) -> Result<Vec<StoredObject>, FilesError>;

    /// Remove one object by exact key.
    ///
    /// # Errors
    /// Returns [`FilesError::NotFound`] when no such object exists.
    fn delete(&self, key: &str) -> Result<(), FilesError>;
}

/// Filesystem-backed object store. Keys map directly to paths below the
/// root; sanitized key material never contains `..` segments.
pub struct LocalObjectStore {
    root: PathBuf,
}

impl LocalObjectStore {
    #[must_use]
    pub fn new(root: PathBuf) -> Self {
        Self { root }
    }
}

impl ObjectStore for LocalObjectStore {
    fn list(&self, prefix: &str) -> Result<Vec<StoredObject>, FilesError> {
        let dir = self.root.join(prefix);
        if !dir.is_dir() {
            return Ok(Vec::new());
        }

        let entries = fs::read_dir(&dir)
            .with_context(|| format!("failed to list objects under {}", dir.display()))?;
        let mut objects = Vec::new();
        for entry in entries {
            let entry = entry.context("failed to read directory entry")?;
            let metadata = entry.metadata().context("failed to read object metadata")?;
            if !metadata.is_file() {
                continue;
            }
            let name = entry.file_name().to_string_lossy().into_owned();
            objects.push(StoredObject { key: format!("{prefix}{name}"), size: metadata.len() });
        }
        objects.sort_by(|a, b| a.key.cmp(&b.key));
        Ok(objects)
    }

    fn delete(&self, key: &str) -> Result<(), FilesError> {
        let path = self.root.join(key);
        if !path.is_file() {
            return Err(FilesError::NotFound(format!("no object with key {key}")));
        }
        fs::remove_file(&path)
            .with_context(|| format!("failed to delete object {}", path.display()))?;
        Ok(())
    }
}

/// Signs time-limited upload and download grants with HMAC-SHA256. The key
/// is held in memory only; rotation means restarting with a new key.
pub struct GrantSigner {
    key: [u8; 32],
}

impl GrantSigner {
    #[must_use]
    pub fn random() -> Self {
        let mut key = [0_u8; 32];
        rand::rngs::OsRng.fill_bytes(&mut key);
        Self { key }
    }

    /// Load a signing key from its 64-character hex form.
    ///
    /// # Errors
    /// Returns an error when the value is not valid hex or not 32 bytes.
    pub fn from_hex(raw: &str) -> Result<Self, FilesError> {
        let bytes = hex::decode(raw.trim()).context("grant signing key is not valid hex")?;
        if bytes.len() != 32 {
            return Err(FilesError::Other(anyhow!(
                "grant signing key must be 32 bytes, got {}",
                bytes.len()
            )));
        }
        let mut key = [0_u8; 32];
        key.copy_from_slice(&bytes);
        Ok(Self { key })
    }

    /// Hex signature over one grant's verb, object key, and expiry instant.
    ///
    /// # Errors
    /// Returns an error when the MAC cannot be initialized.
    pub fn sign(&self, verb: &str, key: &str, expires_unix: i64) -> Result<String, FilesError> {
        let mut mac = <HmacSha256 as Mac>::new_from_slice(&self.key)
            .map_err(|err| anyhow!("failed to initialize grant signing key: {err}"))?;
        mac.update(grant_message(verb, key, expires_unix).as_bytes());
        Ok(hex::encode(mac.finalize().into_bytes()))
    }

    /// Check a presented signature against the grant parameters.
    ///
    /// This service only mints grants; the object transport endpoint that
    /// serves and accepts bytes calls this to admit a presented grant.
    ///
    /// # Errors
    /// Returns an error when the MAC cannot be initialized or the presented
    /// signature is not valid hex.
    pub fn verify(
        &self,
        verb: &str,
        key: &str,
        expires_unix: i64,
        signature_hex: &str,
    ) -> Result<bool, FilesError> {
        let signature =
            hex::decode(signature_hex.trim()).context("grant signature is not valid hex")?;
        let mut mac = <HmacSha256 as Mac>::new_from_slice(&self.key)
            .map_err(|err| anyhow!("failed to initialize grant verification key: {err}"))?;
        mac.update(grant_message(verb, key, expires_unix).as_bytes());
        Ok(mac.verify_slice(&signature).is_ok())
    }
}

fn grant_message(verb: &str, key: &str, expires_unix: i64) -> String {
    format!("{verb}\n{key}\n{expires_unix}")
}

/// Whether a grant's expiry instant has passed.
///
/// Paired with [`GrantSigner::verify`] on the object transport side; the
/// grant-minting routes never consult it.
#[must_use]
pub fn grant_expired(expires_unix: i64, now: OffsetDateTime) -> bool {
    expires_unix < now.unix_timestamp()
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct UploadGrant {
    pub upload_url: String,
    pub key: String,
    pub filename: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct AttachmentEntry {
    pub key: String,
    pub filename: String,
    pub size: u64,
    pub download_url: String,
}

/// Issues grants and resolves display names over one submission's storage
/// prefix. The prefix itself is derived by the caller from the submission's
/// first-version creation date.
pub struct AttachmentCoordinator<S: ObjectStore> {
    store: S,
    signer: GrantSigner,
    base_url: String,
}

impl<S: ObjectStore> AttachmentCoordinator<S> {
    #[must_use]
    pub fn new(store: S, signer: GrantSigner, base_url: String) -> Self {
        Self { store, signer, base_url }
    }

    /// Issue a short-lived upload grant for a new attachment.
    ///
    /// # Errors
    /// Returns [`FilesError::Invalid`] when the filename is empty or the
    /// content type is missing or not on the allow-list.
    pub fn grant_upload(
        &self,
        prefix: &str,
        filename: &str,
        content_type: &str,
        now: OffsetDateTime,
    ) -> Result<UploadGrant, FilesError> {
        let filename = filename.trim();
        if filename.is_empty() {
            return Err(FilesError::Invalid(FieldError::new(
                "filename",
                "filename is required",
            )));
        }
        let content_type = content_type.trim();
        if content_type.is_empty() {
            return Err(FilesError::Invalid(FieldError::new(
                "contentType",
                "contentType is required",
            )));
        }
        if !ALLOWED_CONTENT_TYPES.contains(&content_type) {
            return Err(FilesError::Invalid(FieldError::new(
                "contentType",
                format!(
                    "Content type not allowed: {content_type}. Allowed: {}",
                    ALLOWED_CONTENT_TYPES.join(", ")
                ),
            )));
        }

        let token = random_token();
        let key = attachment_key(prefix, &token, filename);
        let expires = (now + UPLOAD_GRANT_TTL).unix_timestamp();
        let signature = self.signer.sign("put", &key, expires)?;

        Ok(UploadGrant {
            upload_url: self.grant_url("put", &key, expires, &signature),
            key: key.clone(),
            filename: stocktake_core::sanitize_file_name(filename),
        })
    }

    /// List one submission's attachments with signed download URLs.
    ///
    /// # Errors
    /// Returns an error when the object store cannot be read or signing
    /// fails.
    pub fn list_for(
        &self,
        prefix: &str,
        now: OffsetDateTime,
    ) -> Result<Vec<AttachmentEntry>, FilesError> {
        let expires = (now + DOWNLOAD_GRANT_TTL).unix_timestamp();
        let mut entries = Vec::new();
        for object in self.store.list(prefix)? {
            let Some(display_name) = display_name_from_key(&object.key, prefix) else {
                continue;
            };
            let signature = self.signer.sign("get", &object.key, expires)?;
            entries.push(AttachmentEntry {
                filename: display_name.to_string(),
                size: object.size,
                download_url: self.grant_url("get", &object.key, expires, &signature),
                key: object.key,
            });
        }
        Ok(entries)
    }

    /// Delete one attachment addressed by its display name.
    ///
    /// # Errors
    /// Returns [`FilesError::NotFound`] when no attachment under the prefix
    /// carries that display name.
    pub fn delete_by_display_name(
        &self,
        prefix: &str,
        filename: &str,
    ) -> Result<(), FilesError> {
        let target = self
            .store
            .list(prefix)?
            .into_iter()
            .find(|object| display_name_from_key(&object.key, prefix) == Some(filename));
        match target {
            Some(object) => self.store.delete(&object.key),
            None => Err(FilesError::NotFound(format!("File not found: {filename}"))),
        }
    }

    fn grant_url(&self, verb: &str, key: &str, expires: i64, signature: &str) -> String {
        format!(
            "{}/objects/{key}?verb={verb}&expires={expires}&signature={signature}",
            self.base_url
        )
    }
}

fn random_token() -> String {
    let mut bytes = [0_u8; stocktake_core::ATTACHMENT_TOKEN_LEN / 2];
    rand::rngs::OsRng.fill_bytes(&mut bytes);
    hex::encode(bytes)
}

#[cfg(test)]
mod tests {
    use ulid::Ulid;

    use super::*;

    fn fixture_time() -> OffsetDateTime {
        OffsetDateTime::UNIX_EPOCH + Duration::seconds(1_700_000_000)
    }

    fn scratch_coordinator() -> (AttachmentCoordinator<LocalObjectStore>, PathBuf) {
        let root = std::env::temp_dir().join(format!("stocktake-files-{}", Ulid::new()));
        if let Err(err) = fs::create_dir_all(&root) {
            panic!("scratch root should be creatable: {err}");
        }
        let coordinator = AttachmentCoordinator::new(
            LocalObjectStore::new(root.clone()),
            GrantSigner::random(),
            "http://localhost:8080".to_string(),
        );
        (coordinator, root)
    }

    fn write_object(root: &PathBuf, key: &str) {
        let path = root.join(key);
        if let Some(parent) = path.parent() {
            if let Err(err) = fs::create_dir_all(parent) {
                panic!("object parent dir should be creatable: {err}");
            }
        }
        if let Err(err) = fs::write(&path, b"content") {
            panic!("object should be writable: {err}");
        }
    }

    #[test]
    fn upload_grant_carries_key_and_sanitized_name() {
        let (coordinator, root) = scratch_coordinator();
        let grant = match coordinator.grant_upload(
            "2024-01-15_abc/files/",
            "annual/report.pdf",
            "application/pdf",
            fixture_time(),
        ) {
            Ok(grant) => grant,
            Err(err) => panic!("grant should be issued: {err}"),
        };
        assert_eq!(grant.filename, "annual_report.pdf");
        assert!(grant.key.starts_with("2024-01-15_abc/files/"));
        assert!(grant.key.ends_with("_annual_report.pdf"));
        assert!(grant.upload_url.contains("verb=put"));
        assert!(grant.upload_url.contains(&grant.key));
        let _ = fs::remove_dir_all(root);
    }

    #[test]
    fn upload_grant_rejects_disallowed_content_type() {
        let (coordinator, root) = scratch_coordinator();
        match coordinator.grant_upload(
            "p/files/",
            "script.sh",
            "application/x-sh",
            fixture_time(),
        ) {
            Err(FilesError::Invalid(error)) => {
                assert_eq!(error.field, "contentType");
                assert!(error.message.starts_with("Content type not allowed: application/x-sh"));
            }
            other => panic!("disallowed content type should be rejected, got {other:?}"),
        }
        match coordinator.grant_upload("p/files/", "  ", "application/pdf", fixture_time()) {
            Err(FilesError::Invalid(error)) => assert_eq!(error.field, "filename"),
            other => panic!("blank filename should be rejected, got {other:?}"),
        }
        let _ = fs::remove_dir_all(root);
    }

    #[test]
    fn listing_recovers_display_names_and_signs_downloads() {
        let (coordinator, root) = scratch_coordinator();
        let prefix = "2024-01-15_abc/files/";
        write_object(&root, &format!("{prefix}a1b2c3d4_report.pdf"));
        write_object(&root, &format!("{prefix}deadbeef_data.csv"));

        let entries = match coordinator.list_for(prefix, fixture_time()) {
            Ok(entries) => entries,
            Err(err) => panic!("listing should succeed: {err}"),
        };
        assert_eq!(entries.len(), 2);
        let names: Vec<&str> = entries.iter().map(|entry| entry.filename.as_str()).collect();
        assert_eq!(names, vec!["report.pdf", "data.csv"]);
        for entry in &entries {
            assert_eq!(entry.size, 7);
            assert!(entry.download_url.contains("verb=get"));
        }
        let _ = fs::remove_dir_all(root);
    }

    #[test]
    fn delete_matches_on_display_name() {
        let (coordinator, root) = scratch_coordinator();
        let prefix = "2024-01-15_abc/files/";
        write_object(&root, &format!("{prefix}a1b2c3d4_report.pdf"));

        if let Err(err) = coordinator.delete_by_display_name(prefix, "report.pdf") {
            panic!("delete should succeed: {err}");
        }
        match coordinator.delete_by_display_name(prefix, "report.pdf") {
            Err(FilesError::NotFound(message)) => {
                assert_eq!(message, "File not found: report.pdf");
            }
            other => panic!("second delete should miss, got {other:?}"),
        }
        let _ = fs::remove_dir_all(root);
    }

    #[test]
    fn signatures_verify_and_reject_tampering() {
        let signer = GrantSigner::random();
        let signature = match signer.sign("get", "p/files/x_y.pdf", 1_700_000_300) {
            Ok(signature) => signature,
            Err(err) => panic!("signing should succeed: {err}"),
        };
        match signer.verify("get", "p/files/x_y.pdf", 1_700_000_300, &signature) {
            Ok(true) => {}
            other => panic!("valid signature should verify, got {other:?}"),
        }
        match signer.verify("get", "p/files/x_y.pdf", 1_700_009_999, &signature) {
            Ok(false) => {}
            other => panic!("tampered expiry should fail, got {other:?}"),
        }
        match signer.verify("put", "p/files/x_y.pdf", 1_700_000_300, &signature) {
            Ok(false) => {}
            other => panic!("verb substitution should fail, got {other:?}"),
        }
    }

    #[test]
    fn expiry_check_uses_the_grant_instant() {
        let now = fixture_time();
        assert!(!grant_expired((now + UPLOAD_GRANT_TTL).unix_timestamp(), now));
        assert!(grant_expired((now - Duration::seconds(1)).unix_timestamp(), now));
    }

    #[test]
    fn signer_round_trips_through_hex() {
        let raw = "a".repeat(64);
        let signer = match GrantSigner::from_hex(&raw) {
            Ok(signer) => signer,
            Err(err) => panic!("hex key should load: {err}"),
        };
        let signature = match signer.sign("get", "k", 1) {
            Ok(signature) => signature,
            Err(err) => panic!("signing should succeed: {err}"),
        };
        match signer.verify("get", "k", 1, &signature) {
            Ok(true) => {}
            other => panic!("signature should verify, got {other:?}"),
        }
        match GrantSigner::from_hex("abcd") {
            Err(FilesError::Other(_)) => {}
            other => panic!("short key should be rejected, got {:?}", other.map(|_| ())),
        }
    }
}
