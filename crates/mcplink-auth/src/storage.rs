//! Key/value storage for authorization state.
//!
//! Entries are plain strings addressed by key, the same model as browser
//! local storage. Providers namespace their keys with a configurable prefix
//! so that everything belonging to one server can be removed in one sweep.

use crate::error::{AuthError, AuthResult};
use std::collections::BTreeMap;
use std::path::PathBuf;
use tokio::sync::RwLock;
use tracing::{debug, warn};

/// String key/value store, optionally persisted to a JSON file.
///
/// File-backed stores are created with restrictive permissions (0600 on Unix)
/// and read lazily on first access.
pub struct AuthStorage {
    /// Path to the backing file, `None` for in-memory storage.
    path: Option<PathBuf>,
    /// In-memory copy of the data. Always populated for in-memory storage.
    cache: RwLock<Option<BTreeMap<String, String>>>,
}

impl AuthStorage {
    /// Create file-backed storage at the default location.
    ///
    /// # Errors
    ///
    /// Returns an error if the data directory cannot be determined.
    pub fn new() -> AuthResult<Self> {
        let path = crate::default_storage_path().ok_or(AuthError::NoDataDir)?;
        Ok(Self::with_path(path))
    }

    /// Create file-backed storage with a custom path.
    pub fn with_path(path: PathBuf) -> Self {
        Self {
            path: Some(path),
            cache: RwLock::new(None),
        }
    }

    /// Create storage that lives only as long as this value.
    pub fn memory() -> Self {
        Self {
            path: None,
            cache: RwLock::new(Some(BTreeMap::new())),
        }
    }

    /// Path to the backing file, if any.
    pub fn path(&self) -> Option<&PathBuf> {
        self.path.as_ref()
    }

    /// Get the value stored under `key`.
    pub async fn get(&self, key: &str) -> AuthResult<Option<String>> {
        let all = self.all().await?;
        Ok(all.get(key).cloned())
    }

    /// Store `value` under `key`.
    pub async fn set(&self, key: &str, value: impl Into<String>) -> AuthResult<()> {
        debug!(key = %key, "Storing auth entry");
        let mut all = self.all().await?;
        all.insert(key.to_string(), value.into());
        self.write_all(all).await
    }

    /// Remove `key`. Returns `true` if it existed.
    pub async fn remove(&self, key: &str) -> AuthResult<bool> {
        let mut all = self.all().await?;
        let existed = all.remove(key).is_some();
        if existed {
            debug!(key = %key, "Removed auth entry");
            self.write_all(all).await?;
        }
        Ok(existed)
    }

    /// Remove every key starting with `prefix`. Returns how many were removed.
    pub async fn remove_prefix(&self, prefix: &str) -> AuthResult<usize> {
        self.remove_where(|key, _| key.starts_with(prefix)).await
    }

    /// Remove every entry matching `predicate`. Returns how many were removed.
    pub async fn remove_where<F>(&self, predicate: F) -> AuthResult<usize>
    where
        F: Fn(&str, &str) -> bool,
    {
        let mut all = self.all().await?;
        let before = all.len();
        all.retain(|key, value| !predicate(key.as_str(), value.as_str()));
        let removed = before - all.len();
        if removed > 0 {
            self.write_all(all).await?;
        }
        Ok(removed)
    }

    /// All keys currently stored.
    pub async fn keys(&self) -> AuthResult<Vec<String>> {
        Ok(self.all().await?.into_keys().collect())
    }

    /// Read a JSON value stored under `key`.
    ///
    /// Entries that no longer parse are treated as absent.
    pub async fn get_json<T: serde::de::DeserializeOwned>(&self, key: &str) -> AuthResult<Option<T>> {
        let Some(raw) = self.get(key).await? else {
            return Ok(None);
        };
        match serde_json::from_str(&raw) {
            Ok(value) => Ok(Some(value)),
            Err(e) => {
                warn!(key = %key, error = %e, "Ignoring unreadable auth entry");
                Ok(None)
            }
        }
    }

    /// Store `value` as JSON under `key`.
    pub async fn set_json<T: serde::Serialize>(&self, key: &str, value: &T) -> AuthResult<()> {
        let raw = serde_json::to_string(value)?;
        self.set(key, raw).await
    }

    async fn all(&self) -> AuthResult<BTreeMap<String, String>> {
        {
            let cache = self.cache.read().await;
            if let Some(data) = &*cache {
                return Ok(data.clone());
            }
        }

        let data = self.read_file().await?;
        *self.cache.write().await = Some(data.clone());
        Ok(data)
    }

    async fn read_file(&self) -> AuthResult<BTreeMap<String, String>> {
        let Some(path) = &self.path else {
            return Ok(BTreeMap::new());
        };
        if !path.exists() {
            return Ok(BTreeMap::new());
        }

        let content = tokio::fs::read_to_string(path).await?;
        if content.trim().is_empty() {
            return Ok(BTreeMap::new());
        }

        Ok(serde_json::from_str(&content)?)
    }

    async fn write_all(&self, data: BTreeMap<String, String>) -> AuthResult<()> {
        if let Some(path) = &self.path {
            if let Some(parent) = path.parent() {
                tokio::fs::create_dir_all(parent).await?;
            }

            let content = serde_json::to_string_pretty(&data)?;
            tokio::fs::write(path, &content).await?;

            #[cfg(unix)]
            {
                use std::os::unix::fs::PermissionsExt;
                let perms = std::fs::Permissions::from_mode(0o600);
                tokio::fs::set_permissions(path, perms).await.map_err(|e| {
                    AuthError::Permissions(format!(
                        "Failed to set permissions on {:?}: {}",
                        path, e
                    ))
                })?;
            }

            debug!(path = ?path, "Wrote auth storage file");
        }

        *self.cache.write().await = Some(data);
        Ok(())
    }
}

impl std::fmt::Debug for AuthStorage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AuthStorage")
            .field("path", &self.path)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn file_storage() -> (AuthStorage, TempDir) {
        let dir = TempDir::new().unwrap();
        let storage = AuthStorage::with_path(dir.path().join("auth.json"));
        (storage, dir)
    }

    #[tokio::test]
    async fn test_memory_set_get_remove() {
        let storage = AuthStorage::memory();
        storage.set("mcp:auth_abc_tokens", "{}").await.unwrap();

        assert_eq!(
            storage.get("mcp:auth_abc_tokens").await.unwrap(),
            Some("{}".to_string())
        );
        assert!(storage.remove("mcp:auth_abc_tokens").await.unwrap());
        assert!(!storage.remove("mcp:auth_abc_tokens").await.unwrap());
        assert!(storage.path().is_none());
    }

    #[tokio::test]
    async fn test_remove_prefix_counts() {
        let storage = AuthStorage::memory();
        storage.set("mcp:auth_abc_tokens", "t").await.unwrap();
        storage.set("mcp:auth_abc_client_info", "c").await.unwrap();
        storage.set("mcp:auth_xyz_tokens", "other").await.unwrap();

        let removed = storage.remove_prefix("mcp:auth_abc_").await.unwrap();
        assert_eq!(removed, 2);
        assert_eq!(storage.keys().await.unwrap(), vec!["mcp:auth_xyz_tokens"]);
    }

    #[tokio::test]
    async fn test_json_helpers_skip_garbage() {
        let storage = AuthStorage::memory();
        storage.set("broken", "{not json").await.unwrap();
        let value: Option<serde_json::Value> = storage.get_json("broken").await.unwrap();
        assert!(value.is_none());

        storage
            .set_json("good", &serde_json::json!({"a": 1}))
            .await
            .unwrap();
        let value: Option<serde_json::Value> = storage.get_json("good").await.unwrap();
        assert_eq!(value, Some(serde_json::json!({"a": 1})));
    }

    #[tokio::test]
    async fn test_persistence() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("auth.json");

        {
            let storage = AuthStorage::with_path(path.clone());
            storage.set("key", "value").await.unwrap();
        }

        {
            let storage = AuthStorage::with_path(path);
            assert_eq!(storage.get("key").await.unwrap(), Some("value".to_string()));
        }
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_file_permissions() {
        use std::os::unix::fs::PermissionsExt;

        let (storage, _dir) = file_storage();
        storage.set("key", "value").await.unwrap();

        let metadata = std::fs::metadata(storage.path().unwrap()).unwrap();
        assert_eq!(metadata.permissions().mode() & 0o777, 0o600);
    }

    #[tokio::test]
    async fn test_missing_file_is_empty() {
        let (storage, _dir) = file_storage();
        assert!(storage.keys().await.unwrap().is_empty());
        assert_eq!(storage.remove_prefix("mcp:auth").await.unwrap(), 0);
    }
}
