// SPDX-License-Identifier: MIT
//! Secure credential store collaborator.
//!
//! The coordinator reads and clears the identity credential through this
//! trait; encryption-at-rest is the store's own concern and opaque here.
//! [`FileCredentialStore`] is the default implementation (single JSON
//! document, owner-only permissions); [`MemoryCredentialStore`] backs tests.

use anyhow::{Context as _, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use tokio::sync::RwLock;
use tracing::debug;

const CREDENTIALS_FILE: &str = "credentials.json";

/// Fields held by the secure store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CredentialField {
    IdentityToken,
    TenantCode,
}

impl CredentialField {
    fn key(&self) -> &'static str {
        match self {
            CredentialField::IdentityToken => "identity_token",
            CredentialField::TenantCode => "tenant_code",
        }
    }
}

/// Per-field get/set/clear over the secure store.
#[async_trait]
pub trait CredentialStore: Send + Sync {
    async fn get(&self, field: CredentialField) -> Result<Option<String>>;
    async fn set(&self, field: CredentialField, value: &str) -> Result<()>;
    async fn clear(&self, field: CredentialField) -> Result<()>;
    async fn clear_all(&self) -> Result<()>;

    /// True when no credential fields remain.
    async fn is_empty(&self) -> Result<bool> {
        Ok(self.get(CredentialField::IdentityToken).await?.is_none()
            && self.get(CredentialField::TenantCode).await?.is_none())
    }
}

// ─── File-backed store ───────────────────────────────────────────────────────

/// JSON-document store at `{data_dir}/credentials.json`, mode 0600.
pub struct FileCredentialStore {
    path: PathBuf,
    // Serializes read-modify-write cycles on the document.
    lock: RwLock<()>,
}

impl FileCredentialStore {
    pub fn new(data_dir: &Path) -> Self {
        Self {
            path: data_dir.join(CREDENTIALS_FILE),
            lock: RwLock::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    async fn read_document(&self) -> Result<HashMap<String, String>> {
        match tokio::fs::read_to_string(&self.path).await {
            Ok(contents) => {
                serde_json::from_str(&contents).context("credentials file is not valid JSON")
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(HashMap::new()),
            Err(e) => Err(e).context("failed to read credentials file"),
        }
    }

    async fn write_document(&self, doc: &HashMap<String, String>) -> Result<()> {
        if let Some(dir) = self.path.parent() {
            tokio::fs::create_dir_all(dir).await?;
        }
        let contents = serde_json::to_string_pretty(doc)?;
        tokio::fs::write(&self.path, contents)
            .await
            .context("failed to write credentials file")?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let perms = std::fs::Permissions::from_mode(0o600);
            tokio::fs::set_permissions(&self.path, perms).await?;
        }
        Ok(())
    }
}

#[async_trait]
impl CredentialStore for FileCredentialStore {
    async fn get(&self, field: CredentialField) -> Result<Option<String>> {
        let _guard = self.lock.read().await;
        Ok(self.read_document().await?.get(field.key()).cloned())
    }

    async fn set(&self, field: CredentialField, value: &str) -> Result<()> {
        let _guard = self.lock.write().await;
        let mut doc = self.read_document().await?;
        doc.insert(field.key().to_string(), value.to_string());
        self.write_document(&doc).await
    }

    async fn clear(&self, field: CredentialField) -> Result<()> {
        let _guard = self.lock.write().await;
        let mut doc = self.read_document().await?;
        if doc.remove(field.key()).is_some() {
            self.write_document(&doc).await?;
        }
        Ok(())
    }

    async fn clear_all(&self) -> Result<()> {
        let _guard = self.lock.write().await;
        match tokio::fs::remove_file(&self.path).await {
            Ok(()) => {
                debug!(path = %self.path.display(), "credentials file removed");
                Ok(())
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e).context("failed to remove credentials file"),
        }
    }
}

// ─── In-memory store ─────────────────────────────────────────────────────────

/// Volatile store for tests and ephemeral deployments.
#[derive(Default)]
pub struct MemoryCredentialStore {
    fields: RwLock<HashMap<CredentialField, String>>,
}

impl MemoryCredentialStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Convenience constructor pre-populated with an identity.
    pub fn with_identity(identity_token: &str, tenant_code: &str) -> Self {
        let mut fields = HashMap::new();
        fields.insert(CredentialField::IdentityToken, identity_token.to_string());
        fields.insert(CredentialField::TenantCode, tenant_code.to_string());
        Self {
            fields: RwLock::new(fields),
        }
    }
}

#[async_trait]
impl CredentialStore for MemoryCredentialStore {
    async fn get(&self, field: CredentialField) -> Result<Option<String>> {
        Ok(self.fields.read().await.get(&field).cloned())
    }

    async fn set(&self, field: CredentialField, value: &str) -> Result<()> {
        self.fields.write().await.insert(field, value.to_string());
        Ok(())
    }

    async fn clear(&self, field: CredentialField) -> Result<()> {
        self.fields.write().await.remove(&field);
        Ok(())
    }

    async fn clear_all(&self) -> Result<()> {
        self.fields.write().await.clear();
        Ok(())
    }
}

/// Read both identity fields at once. `None` when either is missing.
pub async fn load_identity(store: &dyn CredentialStore) -> Result<Option<(String, String)>> {
    let token = store.get(CredentialField::IdentityToken).await?;
    let tenant = store.get(CredentialField::TenantCode).await?;
    Ok(match (token, tenant) {
        (Some(t), Some(c)) => Some((t, c)),
        _ => None,
    })
}
