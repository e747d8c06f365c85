use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use snafu::{OptionExt, ResultExt, Snafu};

/// Environment fallback consulted when the secret file has no key.
pub const API_KEY_ENV_VAR: &str = "GEMINI_API_KEY";

const SECRET_DIR: &str = "mindcoach";
const SECRET_FILE: &str = "secret.json";

#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum CredentialError {
    #[snafu(display("could not determine the user config directory"))]
    ConfigDirUnavailable { stage: &'static str },
    #[snafu(display("failed to read secret file at {path}"))]
    ReadSecretFile {
        stage: &'static str,
        path: String,
        source: std::io::Error,
    },
    #[snafu(display("failed to parse secret file at {path}"))]
    ParseSecretFile {
        stage: &'static str,
        path: String,
        source: serde_json::Error,
    },
    #[snafu(display("failed to create secret directory at {path}"))]
    CreateSecretDirectory {
        stage: &'static str,
        path: String,
        source: std::io::Error,
    },
    #[snafu(display("failed to write secret file at {path}"))]
    WriteSecretFile {
        stage: &'static str,
        path: String,
        source: std::io::Error,
    },
    #[snafu(display("failed to serialize secret file payload"))]
    SerializeSecretFile {
        stage: &'static str,
        source: serde_json::Error,
    },
}

pub type CredentialResult<T> = Result<T, CredentialError>;

#[derive(Debug, Serialize, Deserialize)]
struct SecretFile {
    api_key: String,
}

/// Local credential store: a JSON secret file under the user config dir,
/// with the process environment as a one-way fallback. A key found in the
/// environment is persisted back into the file so later runs no longer
/// depend on the environment being set.
#[derive(Debug, Clone)]
pub struct CredentialStore {
    path: PathBuf,
}

impl CredentialStore {
    pub fn new() -> CredentialResult<Self> {
        let config_dir = dirs::config_dir().context(ConfigDirUnavailableSnafu {
            stage: "credential-store-new",
        })?;

        Ok(Self {
            path: config_dir.join(SECRET_DIR).join(SECRET_FILE),
        })
    }

    pub fn with_path(path: PathBuf) -> Self {
        Self { path }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn load(&self) -> CredentialResult<Option<String>> {
        if !self.path.exists() {
            return Ok(None);
        }

        let raw = std::fs::read_to_string(&self.path).context(ReadSecretFileSnafu {
            stage: "credential-load-read",
            path: display_path(&self.path),
        })?;
        let parsed: SecretFile = serde_json::from_str(&raw).context(ParseSecretFileSnafu {
            stage: "credential-load-parse",
            path: display_path(&self.path),
        })?;

        let api_key = parsed.api_key.trim().to_string();
        Ok((!api_key.is_empty()).then_some(api_key))
    }

    pub fn save(&self, api_key: &str) -> CredentialResult<()> {
        if let Some(parent) = self.path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent).context(CreateSecretDirectorySnafu {
                stage: "credential-save-create-directory",
                path: parent.display().to_string(),
            })?;
        }

        let serialized = serde_json::to_string_pretty(&SecretFile {
            api_key: api_key.trim().to_string(),
        })
        .context(SerializeSecretFileSnafu {
            stage: "credential-save-serialize",
        })?;

        std::fs::write(&self.path, serialized).context(WriteSecretFileSnafu {
            stage: "credential-save-write",
            path: display_path(&self.path),
        })
    }

    /// Resolves the API key: secret file first, then the environment.
    pub fn resolve(&self) -> CredentialResult<Option<String>> {
        let env_key = std::env::var(API_KEY_ENV_VAR).ok();
        self.resolve_with_env(env_key.as_deref())
    }

    fn resolve_with_env(&self, env_key: Option<&str>) -> CredentialResult<Option<String>> {
        if let Some(stored) = self.load()? {
            return Ok(Some(stored));
        }

        let Some(env_key) = env_key.map(str::trim).filter(|key| !key.is_empty()) else {
            return Ok(None);
        };

        // Persisting the environment key is best-effort plumbing; a failed
        // write must not block this run from using the key.
        if let Err(error) = self.save(env_key) {
            tracing::warn!(
                path = %display_path(&self.path),
                error = %error,
                "failed to persist environment API key into the secret store"
            );
        }

        Ok(Some(env_key.to_string()))
    }
}

fn display_path(path: &Path) -> String {
    path.display().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store_in(dir: &tempfile::TempDir) -> CredentialStore {
        CredentialStore::with_path(dir.path().join("nested").join(SECRET_FILE))
    }

    #[test]
    fn save_then_load_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let store = store_in(&dir);

        assert_eq!(store.load().unwrap(), None);
        store.save("  abc123  ").unwrap();
        assert_eq!(store.load().unwrap(), Some("abc123".to_string()));
    }

    #[test]
    fn resolve_prefers_stored_key_over_environment() {
        let dir = tempfile::tempdir().unwrap();
        let store = store_in(&dir);
        store.save("stored-key").unwrap();

        let resolved = store.resolve_with_env(Some("env-key")).unwrap();
        assert_eq!(resolved, Some("stored-key".to_string()));
    }

    #[test]
    fn environment_key_is_persisted_back_into_the_file() {
        let dir = tempfile::tempdir().unwrap();
        let store = store_in(&dir);

        let resolved = store.resolve_with_env(Some("env-key")).unwrap();
        assert_eq!(resolved, Some("env-key".to_string()));
        assert_eq!(store.load().unwrap(), Some("env-key".to_string()));
    }

    #[test]
    fn blank_environment_key_resolves_to_none() {
        let dir = tempfile::tempdir().unwrap();
        let store = store_in(&dir);

        assert_eq!(store.resolve_with_env(Some("   ")).unwrap(), None);
        assert_eq!(store.resolve_with_env(None).unwrap(), None);
    }

    #[test]
    fn malformed_secret_file_surfaces_a_parse_error() {
        let dir = tempfile::tempdir().unwrap();
        let store = CredentialStore::with_path(dir.path().join(SECRET_FILE));
        std::fs::write(store.path(), "not json").unwrap();

        assert!(matches!(
            store.load(),
            Err(CredentialError::ParseSecretFile { .. })
        ));
    }
}
