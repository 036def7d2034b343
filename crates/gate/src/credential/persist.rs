// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Credential document persistence: resolve the source, load, and save
//! with atomic writes.

use std::path::{Path, PathBuf};

use crate::credential::CredentialRecord;

/// Where the initial credential list came from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CredentialSource {
    /// JSON passed directly through configuration.
    Inline,
    /// A document on disk.
    File(PathBuf),
    /// Nothing configured; the pool starts empty.
    Empty,
}

/// Result of resolving the configured credential source.
#[derive(Debug, Clone)]
pub struct LoadedCredentials {
    pub records: Vec<CredentialRecord>,
    pub source: CredentialSource,
    /// File that mutations are written back to.
    pub persist_path: PathBuf,
}

/// Resolve the credential document.
///
/// Precedence: `configured` as inline JSON, then `configured` as an existing
/// file, then `default_path` if it exists, then an empty list. A `configured`
/// value that is neither is logged and skipped. The persist path is the
/// file that was read, falling back to `default_path`.
pub fn resolve(configured: Option<&str>, default_path: &Path) -> anyhow::Result<LoadedCredentials> {
    if let Some(configured) = configured.map(str::trim).filter(|s| !s.is_empty()) {
        if configured.starts_with('[') || configured.starts_with('{') {
            let records = sanitize(parse_document(configured)?);
            tracing::info!(count = records.len(), "loaded inline credentials");
            return Ok(LoadedCredentials {
                records,
                source: CredentialSource::Inline,
                persist_path: default_path.to_path_buf(),
            });
        }
        let path = PathBuf::from(configured);
        if path.is_file() {
            let records = load(&path)?;
            tracing::info!(path = %path.display(), count = records.len(), "loaded credential file");
            return Ok(LoadedCredentials {
                records,
                source: CredentialSource::File(path.clone()),
                persist_path: path,
            });
        }
        tracing::warn!(
            path = %path.display(),
            fallback = %default_path.display(),
            "configured credentials are neither JSON nor a file, trying the default file"
        );
    }

    if default_path.is_file() {
        let records = load(default_path)?;
        tracing::info!(path = %default_path.display(), count = records.len(), "loaded default credential file");
        return Ok(LoadedCredentials {
            records,
            source: CredentialSource::File(default_path.to_path_buf()),
            persist_path: default_path.to_path_buf(),
        });
    }

    tracing::info!(
        persist_path = %default_path.display(),
        "no credentials configured, starting with an empty pool"
    );
    Ok(LoadedCredentials {
        records: vec![],
        source: CredentialSource::Empty,
        persist_path: default_path.to_path_buf(),
    })
}

/// Parse a credential document: a JSON array of records or a single record.
pub fn parse_document(json: &str) -> anyhow::Result<Vec<CredentialRecord>> {
    if let Ok(records) = serde_json::from_str::<Vec<CredentialRecord>>(json) {
        return Ok(records);
    }
    let single: CredentialRecord = serde_json::from_str(json).map_err(|e| {
        anyhow::anyhow!(
            "invalid credential document: {e} (expected e.g. [{{\"auth\":\"Social\",\"refreshToken\":\"...\"}}])"
        )
    })?;
    Ok(vec![single])
}

/// Load and validate records from a JSON file.
pub fn load(path: &Path) -> anyhow::Result<Vec<CredentialRecord>> {
    let contents = std::fs::read_to_string(path)?;
    if contents.trim().is_empty() {
        return Ok(vec![]);
    }
    Ok(sanitize(parse_document(&contents)?))
}

/// Save records to a JSON file atomically (write tmp + rename).
///
/// Uses a unique temp filename (PID + counter) so concurrent saves never
/// share a `.tmp` file. The parent directory must already exist.
pub fn save(path: &Path, records: &[CredentialRecord]) -> anyhow::Result<()> {
    use std::sync::atomic::{AtomicU32, Ordering};
    static COUNTER: AtomicU32 = AtomicU32::new(0);

    let json = serde_json::to_string_pretty(records)?;
    let seq = COUNTER.fetch_add(1, Ordering::Relaxed);
    let tmp_name = format!(
        "{}.{}.{}.tmp",
        path.file_name().unwrap_or_default().to_string_lossy(),
        std::process::id(),
        seq,
    );
    let tmp_path = path.with_file_name(tmp_name);
    std::fs::write(&tmp_path, json)?;
    if let Err(e) = owner_only(&tmp_path).and_then(|()| std::fs::rename(&tmp_path, path)) {
        let _ = std::fs::remove_file(&tmp_path);
        return Err(e.into());
    }
    tracing::debug!(path = %path.display(), count = records.len(), "credentials saved");
    Ok(())
}

/// The document holds refresh tokens; keep it readable by the owner only.
#[cfg(unix)]
fn owner_only(path: &Path) -> std::io::Result<()> {
    use std::os::unix::fs::PermissionsExt;
    std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600))
}

#[cfg(not(unix))]
fn owner_only(_path: &Path) -> std::io::Result<()> {
    Ok(())
}

/// Drop records that fail validation; disabled records are kept.
fn sanitize(records: Vec<CredentialRecord>) -> Vec<CredentialRecord> {
    let total = records.len();
    let valid: Vec<CredentialRecord> = records
        .into_iter()
        .enumerate()
        .filter_map(|(i, record)| match record.validated() {
            Ok(r) => Some(r),
            Err(e) => {
                tracing::warn!(position = i, err = %e, "skipping invalid credential");
                None
            }
        })
        .collect();
    if valid.len() != total {
        tracing::warn!(total, valid = valid.len(), "some credentials were dropped at load");
    }
    valid
}

#[cfg(test)]
#[path = "persist_tests.rs"]
mod tests;
