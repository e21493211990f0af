use std::path::{Path, PathBuf};
use std::sync::Arc;

use arc_swap::ArcSwap;
use figment::{
    Figment,
    providers::{Format, Json, Serialized},
};
use psup_chat::{ChatConfig, DEFAULT_SYSTEM_PROMPT};
use psup_llm::{DEFAULT_MAX_OUTPUT_TOKENS, DEFAULT_MODEL, DEFAULT_TEMPERATURE, ProviderConfig};
use serde::{Deserialize, Serialize};
use snafu::{ResultExt, Snafu};

pub const DEFAULT_PROVIDER_ID: &str = "openai";
pub const SETTINGS_DIRECTORY_NAME: &str = "psup";
pub const SETTINGS_FILE_NAME: &str = "settings.json";
pub const DATABASE_FILE_NAME: &str = "psup.db";

/// User-editable settings, stored as JSON next to the database.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TutorSettings {
    #[serde(default)]
    pub api_key: String,
    #[serde(default = "default_model")]
    pub model: String,
    /// Replaces the built-in tutoring prompt when non-empty.
    #[serde(default)]
    pub custom_prompt: String,
    #[serde(default = "default_provider_id")]
    pub provider_id: String,
    /// Empty means the provider's public endpoint.
    #[serde(default)]
    pub endpoint: String,
    #[serde(default)]
    pub database_path: String,
    #[serde(default = "default_max_tokens")]
    pub max_tokens: u64,
}

impl Default for TutorSettings {
    fn default() -> Self {
        Self {
            api_key: String::new(),
            model: default_model(),
            custom_prompt: String::new(),
            provider_id: default_provider_id(),
            endpoint: String::new(),
            database_path: String::new(),
            max_tokens: default_max_tokens(),
        }
    }
}

impl std::fmt::Debug for TutorSettings {
    fn fmt(&self, formatter: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        formatter
            .debug_struct("TutorSettings")
            .field("api_key", &if self.has_api_key() { "<set>" } else { "<empty>" })
            .field("model", &self.model)
            .field("custom_prompt", &!self.custom_prompt.is_empty())
            .field("provider_id", &self.provider_id)
            .field("endpoint", &self.endpoint)
            .field("database_path", &self.database_path)
            .field("max_tokens", &self.max_tokens)
            .finish()
    }
}

impl TutorSettings {
    pub fn has_api_key(&self) -> bool {
        !self.api_key.trim().is_empty()
    }

    pub fn system_prompt(&self) -> &str {
        if self.custom_prompt.trim().is_empty() {
            DEFAULT_SYSTEM_PROMPT
        } else {
            &self.custom_prompt
        }
    }

    pub fn to_chat_config(&self) -> ChatConfig {
        ChatConfig {
            api_key: self.api_key.clone(),
            model_id: self.model.clone(),
            system_prompt: self.system_prompt().to_string(),
            temperature: DEFAULT_TEMPERATURE,
            max_tokens: self.max_tokens,
        }
    }

    pub fn to_provider_config(&self) -> ProviderConfig {
        ProviderConfig::new(&self.provider_id, &self.endpoint)
    }

    /// Database location, falling back to the settings directory.
    pub fn database_location(&self, config_dir: &Path) -> PathBuf {
        if self.database_path.trim().is_empty() {
            config_dir.join(DATABASE_FILE_NAME)
        } else {
            PathBuf::from(self.database_path.trim())
        }
    }

    pub fn normalized(mut self) -> Self {
        self.api_key = self.api_key.trim().to_string();
        self.model = if self.model.trim().is_empty() {
            default_model()
        } else {
            self.model.trim().to_string()
        };
        self.custom_prompt = self.custom_prompt.trim().to_string();
        self.provider_id = if self.provider_id.trim().is_empty() {
            default_provider_id()
        } else {
            self.provider_id.trim().to_string()
        };
        self.endpoint = self.endpoint.trim().to_string();
        self.database_path = self.database_path.trim().to_string();
        if self.max_tokens == 0 {
            self.max_tokens = default_max_tokens();
        }
        self
    }
}

pub struct SettingsStore {
    settings: Arc<ArcSwap<TutorSettings>>,
    config_path: PathBuf,
}

impl SettingsStore {
    pub fn default_config_dir() -> PathBuf {
        dirs::config_dir()
            .map(|path| path.join(SETTINGS_DIRECTORY_NAME))
            .unwrap_or_else(|| PathBuf::from(".psup"))
    }

    pub fn default_config_path() -> PathBuf {
        Self::default_config_dir().join(SETTINGS_FILE_NAME)
    }

    pub fn new(config_path: PathBuf) -> Self {
        let settings = Self::load_from_disk(&config_path);
        Self {
            settings: Arc::new(ArcSwap::from_pointee(settings)),
            config_path,
        }
    }

    pub fn load() -> Self {
        Self::new(Self::default_config_path())
    }

    pub fn config_dir(&self) -> PathBuf {
        self.config_path
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_else(Self::default_config_dir)
    }

    pub fn settings(&self) -> Arc<TutorSettings> {
        self.settings.load_full()
    }

    pub fn update(&self, settings: TutorSettings) -> Result<Arc<TutorSettings>, SettingsError> {
        let normalized_settings = Arc::new(settings.normalized());
        self.persist(&normalized_settings)?;
        self.settings.store(Arc::clone(&normalized_settings));
        Ok(normalized_settings)
    }

    /// Applies `change` to a copy of the current settings and persists the result.
    pub fn modify(
        &self,
        change: impl FnOnce(&mut TutorSettings),
    ) -> Result<Arc<TutorSettings>, SettingsError> {
        let mut settings = TutorSettings::clone(&self.settings());
        change(&mut settings);
        self.update(settings)
    }

    /// Resets to defaults and removes the settings file.
    pub fn clear(&self) -> Result<Arc<TutorSettings>, SettingsError> {
        match std::fs::remove_file(&self.config_path) {
            Ok(()) => {}
            Err(error) if error.kind() == std::io::ErrorKind::NotFound => {}
            Err(source) => {
                return Err(source).context(RemoveFileSnafu {
                    stage: "remove-settings-file",
                    path: self.config_path.clone(),
                });
            }
        }

        let defaults = Arc::new(TutorSettings::default());
        self.settings.store(Arc::clone(&defaults));
        tracing::info!(path = ?self.config_path, "reset settings to defaults");
        Ok(defaults)
    }

    fn load_from_disk(path: &Path) -> TutorSettings {
        if !path.exists() {
            tracing::info!(path = ?path, "settings file not found, using defaults");
            return TutorSettings::default();
        }

        let figment = Figment::from(Serialized::defaults(TutorSettings::default()))
            .merge(Json::file(path));

        match figment.extract::<TutorSettings>() {
            Ok(settings) => settings.normalized(),
            Err(error) => {
                tracing::warn!(path = ?path, error = %error, "failed to parse settings, using defaults");
                TutorSettings::default()
            }
        }
    }

    fn persist(&self, settings: &TutorSettings) -> Result<(), SettingsError> {
        if let Some(parent) = self.config_path.parent() {
            std::fs::create_dir_all(parent).context(CreateDirSnafu {
                stage: "create-settings-directory",
                path: parent.to_path_buf(),
            })?;
        }

        let content = serde_json::to_string_pretty(settings).context(SerializeConfigSnafu {
            stage: "serialize-settings-json",
        })?;

        let temp_path = self.config_path.with_extension("json.tmp");
        std::fs::write(&temp_path, content).context(WriteFileSnafu {
            stage: "write-temporary-settings-file",
            path: temp_path.clone(),
        })?;

        std::fs::rename(&temp_path, &self.config_path).context(RenameTempFileSnafu {
            stage: "rename-temporary-settings-file",
            from: temp_path,
            to: self.config_path.clone(),
        })?;

        tracing::info!(path = ?self.config_path, "saved settings");
        Ok(())
    }
}

#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum SettingsError {
    #[snafu(display("failed to create settings directory at {path:?} on `{stage}`: {source}"))]
    CreateDir {
        stage: &'static str,
        path: PathBuf,
        source: std::io::Error,
    },
    #[snafu(display("failed to serialize settings on `{stage}`: {source}"))]
    SerializeConfig {
        stage: &'static str,
        source: serde_json::Error,
    },
    #[snafu(display("failed to write settings file at {path:?} on `{stage}`: {source}"))]
    WriteFile {
        stage: &'static str,
        path: PathBuf,
        source: std::io::Error,
    },
    #[snafu(display(
        "failed to replace settings file from {from:?} to {to:?} on `{stage}`: {source}"
    ))]
    RenameTempFile {
        stage: &'static str,
        from: PathBuf,
        to: PathBuf,
        source: std::io::Error,
    },
    #[snafu(display("failed to remove settings file at {path:?} on `{stage}`: {source}"))]
    RemoveFile {
        stage: &'static str,
        path: PathBuf,
        source: std::io::Error,
    },
}

fn default_model() -> String {
    DEFAULT_MODEL.to_string()
}

fn default_provider_id() -> String {
    DEFAULT_PROVIDER_ID.to_string()
}

fn default_max_tokens() -> u64 {
    DEFAULT_MAX_OUTPUT_TOKENS
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store_in(dir: &tempfile::TempDir) -> SettingsStore {
        SettingsStore::new(dir.path().join("nested").join(SETTINGS_FILE_NAME))
    }

    #[test]
    fn missing_file_yields_defaults() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = store_in(&dir);

        let settings = store.settings();
        assert_eq!(*settings, TutorSettings::default());
        assert_eq!(settings.system_prompt(), DEFAULT_SYSTEM_PROMPT);
        assert!(!settings.has_api_key());
    }

    #[test]
    fn update_persists_normalized_values() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = store_in(&dir);

        store
            .modify(|settings| {
                settings.api_key = "  sk-test  ".to_string();
                settings.model = " ".to_string();
                settings.custom_prompt = "Answer in Korean.".to_string();
            })
            .expect("modify");

        let reloaded = store_in(&dir).settings();
        assert_eq!(reloaded.api_key, "sk-test");
        assert_eq!(reloaded.model, DEFAULT_MODEL);
        assert_eq!(reloaded.system_prompt(), "Answer in Korean.");
        assert!(!dir.path().join("nested").join("settings.json.tmp").exists());
    }

    #[test]
    fn partial_file_is_merged_over_defaults() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join(SETTINGS_FILE_NAME);
        std::fs::write(&path, r#"{ "api_key": "sk-file", "max_tokens": 1024 }"#).expect("write");

        let settings = SettingsStore::new(path).settings();

        assert_eq!(settings.api_key, "sk-file");
        assert_eq!(settings.max_tokens, 1024);
        assert_eq!(settings.provider_id, DEFAULT_PROVIDER_ID);
    }

    #[test]
    fn malformed_file_falls_back_to_defaults() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join(SETTINGS_FILE_NAME);
        std::fs::write(&path, "{ not json").expect("write");

        assert_eq!(*SettingsStore::new(path).settings(), TutorSettings::default());
    }

    #[test]
    fn clear_removes_file_and_resets() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = store_in(&dir);
        store
            .modify(|settings| settings.api_key = "sk-test".to_string())
            .expect("modify");

        let cleared = store.clear().expect("clear");

        assert!(!cleared.has_api_key());
        assert!(!dir.path().join("nested").join(SETTINGS_FILE_NAME).exists());
        assert!(store.clear().is_ok());
    }

    #[test]
    fn chat_config_carries_credential_and_prompt() {
        let settings = TutorSettings {
            api_key: "sk-test".to_string(),
            model: "gpt-4o".to_string(),
            ..TutorSettings::default()
        };

        let config = settings.to_chat_config();

        assert!(config.has_credential());
        assert_eq!(config.model_id, "gpt-4o");
        assert_eq!(config.system_prompt, DEFAULT_SYSTEM_PROMPT);
        assert_eq!(config.max_tokens, DEFAULT_MAX_OUTPUT_TOKENS);
    }

    #[test]
    fn database_defaults_into_config_dir() {
        let settings = TutorSettings::default();
        assert_eq!(
            settings.database_location(Path::new("/tmp/psup")),
            PathBuf::from("/tmp/psup/psup.db")
        );
    }
}
