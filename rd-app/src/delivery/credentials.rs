use super::DeliveryError;
use crate::conversation::now_millis;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::RwLock;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Credential {
    pub api_url: String,
    pub api_key: String,
    pub timestamp: i64,
}

impl Credential {
    pub fn new(api_url: &str, api_key: &str) -> Result<Self, DeliveryError> {
        let api_url = api_url.trim().trim_end_matches('/');
        let parsed = reqwest::Url::parse(api_url)
            .map_err(|e| DeliveryError::InvalidCredential(format!("apiUrl: {e}")))?;
        if !matches!(parsed.scheme(), "http" | "https") {
            return Err(DeliveryError::InvalidCredential(format!(
                "apiUrl scheme must be http or https, got {}",
                parsed.scheme()
            )));
        }
        let api_key = api_key.trim();
        if api_key.is_empty() {
            return Err(DeliveryError::InvalidCredential(
                "apiKey is required".to_string(),
            ));
        }
        Ok(Self {
            api_url: api_url.to_string(),
            api_key: api_key.to_string(),
            timestamp: now_millis(),
        })
    }

    pub fn endpoint(&self, path: &str) -> String {
        format!("{}{}", self.api_url, path)
    }
}

/// One canonical credential per client session. The in-memory slot is
/// authoritative while set; the file outlives it. Later saves overwrite
/// earlier ones without conflict resolution.
#[derive(Debug, Default)]
pub struct CredentialStore {
    memory: RwLock<Option<Credential>>,
    file: Option<PathBuf>,
}

impl CredentialStore {
    pub fn in_memory() -> Self {
        Self::default()
    }

    pub fn with_file(path: impl Into<PathBuf>) -> Self {
        Self {
            memory: RwLock::new(None),
            file: Some(path.into()),
        }
    }

    pub async fn save(&self, credential: Credential) -> Result<(), DeliveryError> {
        if let Some(path) = &self.file {
            write_file(path, &credential).await?;
        }
        self.set_memory(Some(credential));
        Ok(())
    }

    /// Memory first, then the file; a file hit re-hydrates memory.
    pub async fn load(&self) -> Result<Option<Credential>, DeliveryError> {
        if let Some(credential) = self.memory() {
            return Ok(Some(credential));
        }
        let persisted = self.load_persisted().await?;
        if let Some(credential) = &persisted {
            self.set_memory(Some(credential.clone()));
        }
        Ok(persisted)
    }

    /// Ignores the in-memory slot entirely.
    pub async fn load_persisted(&self) -> Result<Option<Credential>, DeliveryError> {
        let Some(path) = &self.file else {
            return Ok(self.memory());
        };
        let raw = match tokio::fs::read_to_string(path).await {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => {
                return Err(DeliveryError::CredentialStore(format!(
                    "read {}: {e}",
                    path.display()
                )));
            }
        };
        serde_json::from_str(&raw).map(Some).map_err(|e| {
            DeliveryError::CredentialStore(format!("parse {}: {e}", path.display()))
        })
    }

    /// Drops the in-memory copy; the file is kept.
    pub fn forget(&self) {
        self.set_memory(None);
    }

    fn memory(&self) -> Option<Credential> {
        self.memory.read().ok().and_then(|slot| slot.clone())
    }

    fn set_memory(&self, credential: Option<Credential>) {
        if let Ok(mut slot) = self.memory.write() {
            *slot = credential;
        }
    }
}

async fn write_file(path: &Path, credential: &Credential) -> Result<(), DeliveryError> {
    let io_err = |e: std::io::Error| {
        DeliveryError::CredentialStore(format!("write {}: {e}", path.display()))
    };
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            tokio::fs::create_dir_all(parent).await.map_err(io_err)?;
        }
    }
    let raw = serde_json::to_string_pretty(credential)
        .map_err(|e| DeliveryError::CredentialStore(e.to_string()))?;
    let tmp = path.with_extension("json.tmp");
    tokio::fs::write(&tmp, raw).await.map_err(io_err)?;
    tokio::fs::rename(&tmp, path).await.map_err(io_err)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn credential_validates_url_and_key() {
        let credential = Credential::new(" https://desk.example.com/ ", " k ").expect("valid");
        assert_eq!(credential.api_url, "https://desk.example.com");
        assert_eq!(credential.api_key, "k");
        assert_eq!(
            credential.endpoint("/api/notifications/pending"),
            "https://desk.example.com/api/notifications/pending"
        );
        assert!(Credential::new("ftp://desk.example.com", "k").is_err());
        assert!(Credential::new("https://desk.example.com", "  ").is_err());
        assert!(Credential::new("not a url", "k").is_err());
    }

    #[tokio::test]
    async fn load_falls_back_to_file_and_rehydrates_memory() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("nested").join("credentials.json");
        let store = CredentialStore::with_file(&path);
        let credential = Credential::new("http://localhost:8080", "secret").expect("valid");
        store.save(credential.clone()).await.expect("save");

        store.forget();
        assert!(store.memory().is_none());
        assert_eq!(store.load().await.expect("load"), Some(credential.clone()));
        assert_eq!(store.memory(), Some(credential));
    }

    #[tokio::test]
    async fn later_save_wins_across_reopen() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("credentials.json");
        let store = CredentialStore::with_file(&path);
        store
            .save(Credential::new("http://a.example.com", "one").expect("valid"))
            .await
            .expect("save");
        store
            .save(Credential::new("http://b.example.com", "two").expect("valid"))
            .await
            .expect("save");

        let reopened = CredentialStore::with_file(&path);
        let loaded = reopened.load().await.expect("load").expect("present");
        assert_eq!(loaded.api_key, "two");
        assert_eq!(loaded.api_url, "http://b.example.com");
    }

    #[tokio::test]
    async fn memory_only_store_forgets_for_good() {
        let store = CredentialStore::in_memory();
        store
            .save(Credential::new("http://localhost", "k").expect("valid"))
            .await
            .expect("save");
        assert!(store.load().await.expect("load").is_some());
        store.forget();
        assert!(store.load().await.expect("load").is_none());
    }
}
