use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use arc_swap::ArcSwap;
use figment::{
    Figment,
    providers::{Env, Format, Json, Serialized},
};
use runsync_transport::{DEFAULT_BACKEND_URL, TransportConfig};
use serde::{Deserialize, Serialize};
use snafu::{ResultExt, Snafu};

use super::selection::TrainingLoadPolicy;

pub const SETTINGS_DIRECTORY_NAME: &str = "runsync";
pub const SETTINGS_FILE_NAME: &str = "settings.json";
pub const ENV_PREFIX: &str = "RUNSYNC_";
pub const DEFAULT_REQUEST_TIMEOUT_SECS: u64 = 120;
pub const DEFAULT_LOG_FILTER: &str = "info";
const STAGED_EXTENSION: &str = "json.staged";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CoachSettings {
    #[serde(default = "default_backend_url")]
    pub backend_url: String,
    #[serde(default)]
    pub api_token: String,
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
    #[serde(default = "default_streaming")]
    pub streaming: bool,
    #[serde(default)]
    pub include_commute_in_training_load: bool,
    #[serde(default = "default_log_filter")]
    pub log_filter: String,
}

impl Default for CoachSettings {
    fn default() -> Self {
        Self {
            backend_url: default_backend_url(),
            api_token: String::new(),
            request_timeout_secs: default_request_timeout_secs(),
            streaming: default_streaming(),
            include_commute_in_training_load: false,
            log_filter: default_log_filter(),
        }
    }
}

impl CoachSettings {
    pub fn normalized(mut self) -> Self {
        self.backend_url = if self.backend_url.trim().is_empty() {
            default_backend_url()
        } else {
            self.backend_url.trim().trim_end_matches('/').to_string()
        };
        self.api_token = self.api_token.trim().to_string();
        if self.request_timeout_secs == 0 {
            self.request_timeout_secs = default_request_timeout_secs();
        }
        self.log_filter = if self.log_filter.trim().is_empty() {
            default_log_filter()
        } else {
            self.log_filter.trim().to_string()
        };
        self
    }

    pub fn to_transport_config(&self) -> TransportConfig {
        TransportConfig::new(&self.backend_url)
            .with_token(&self.api_token)
            .with_request_timeout(Duration::from_secs(self.request_timeout_secs))
            .with_streaming(self.streaming)
    }

    pub fn training_load_policy(&self) -> TrainingLoadPolicy {
        TrainingLoadPolicy {
            include_commute: self.include_commute_in_training_load,
        }
    }
}

pub struct SettingsStore {
    settings: Arc<ArcSwap<CoachSettings>>,
    config_path: PathBuf,
}

impl SettingsStore {
    pub fn default_config_dir() -> PathBuf {
        dirs::config_dir()
            .map(|path| path.join(SETTINGS_DIRECTORY_NAME))
            .unwrap_or_else(|| PathBuf::from(".runsync"))
    }

    pub fn default_config_path() -> PathBuf {
        Self::default_config_dir().join(SETTINGS_FILE_NAME)
    }

    pub fn new(config_path: PathBuf) -> Self {
        let settings = Self::load_from(&config_path, Env::prefixed(ENV_PREFIX));
        Self {
            settings: Arc::new(ArcSwap::from_pointee(settings)),
            config_path,
        }
    }

    pub fn load() -> Self {
        Self::new(Self::default_config_path())
    }

    pub fn config_path(&self) -> &Path {
        &self.config_path
    }

    pub fn settings(&self) -> Arc<CoachSettings> {
        self.settings.load_full()
    }

    pub fn update(&self, settings: CoachSettings) -> SettingsResult<()> {
        let settings = settings.normalized();
        self.persist(&settings)?;
        tracing::info!(
            path = ?self.config_path,
            backend_url = %settings.backend_url,
            streaming = settings.streaming,
            "coach settings updated"
        );
        self.settings.store(Arc::new(settings));
        Ok(())
    }

    fn load_from(path: &Path, env: Env) -> CoachSettings {
        if !path.exists() {
            tracing::info!(path = ?path, "no coach settings file yet, starting from defaults");
        }

        let figment = Figment::from(Serialized::defaults(CoachSettings::default()))
            .merge(Json::file(path))
            .merge(env);

        match figment.extract::<CoachSettings>() {
            Ok(settings) => settings.normalized(),
            Err(error) => {
                tracing::warn!(path = ?path, error = %error, "ignoring unreadable coach settings");
                CoachSettings::default()
            }
        }
    }

    fn persist(&self, settings: &CoachSettings) -> SettingsResult<()> {
        let mut encoded = serde_json::to_vec_pretty(settings).context(EncodeSettingsSnafu {
            stage: "encode-coach-settings",
        })?;
        encoded.push(b'\n');

        write_replacing(&self.config_path, &encoded)?;
        tracing::debug!(path = ?self.config_path, bytes = encoded.len(), "coach settings written");
        Ok(())
    }
}

/// Replaces `path` with `contents` through a sibling staging file, so readers never see
/// a half-written settings file.
fn write_replacing(path: &Path, contents: &[u8]) -> SettingsResult<()> {
    if let Some(directory) = path.parent().filter(|dir| !dir.as_os_str().is_empty()) {
        std::fs::create_dir_all(directory).context(PrepareDirectorySnafu {
            stage: "prepare-settings-directory",
            directory: directory.to_path_buf(),
        })?;
    }

    let staged = path.with_extension(STAGED_EXTENSION);
    std::fs::write(&staged, contents).context(StageFileSnafu {
        stage: "stage-settings-file",
        staged: staged.clone(),
    })?;
    std::fs::rename(&staged, path).context(CommitFileSnafu {
        stage: "commit-settings-file",
        staged,
        target: path.to_path_buf(),
    })
}

#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum SettingsError {
    #[snafu(display("cannot prepare settings directory {directory:?} on `{stage}`: {source}"))]
    PrepareDirectory {
        stage: &'static str,
        directory: PathBuf,
        source: std::io::Error,
    },
    #[snafu(display("cannot encode coach settings on `{stage}`: {source}"))]
    EncodeSettings {
        stage: &'static str,
        source: serde_json::Error,
    },
    /// The staging file could not be written; the previous settings file is untouched.
    #[snafu(display("cannot stage settings at {staged:?} on `{stage}`: {source}"))]
    StageFile {
        stage: &'static str,
        staged: PathBuf,
        source: std::io::Error,
    },
    #[snafu(display("cannot move {staged:?} over {target:?} on `{stage}`: {source}"))]
    CommitFile {
        stage: &'static str,
        staged: PathBuf,
        target: PathBuf,
        source: std::io::Error,
    },
}

pub type SettingsResult<T> = Result<T, SettingsError>;

fn default_backend_url() -> String {
    DEFAULT_BACKEND_URL.to_string()
}

fn default_request_timeout_secs() -> u64 {
    DEFAULT_REQUEST_TIMEOUT_SECS
}

fn default_streaming() -> bool {
    true
}

fn default_log_filter() -> String {
    DEFAULT_LOG_FILTER.to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    // A prefix no test environment sets, so ambient RUNSYNC_* variables stay out.
    fn isolated_env() -> Env {
        Env::prefixed("RUNSYNC_SETTINGS_TEST_UNSET_")
    }

    #[test]
    fn missing_file_yields_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let settings = SettingsStore::load_from(&dir.path().join("settings.json"), isolated_env());
        assert_eq!(settings, CoachSettings::default());
    }

    #[test]
    fn file_values_override_defaults_and_are_normalized() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("settings.json");
        std::fs::write(
            &path,
            r#"{"backend_url": " http://coach.local/api/v1/ ", "streaming": false, "request_timeout_secs": 0}"#,
        )
        .unwrap();

        let settings = SettingsStore::load_from(&path, isolated_env());
        assert_eq!(settings.backend_url, "http://coach.local/api/v1");
        assert!(!settings.streaming);
        assert_eq!(settings.request_timeout_secs, DEFAULT_REQUEST_TIMEOUT_SECS);
        assert_eq!(settings.log_filter, DEFAULT_LOG_FILTER);
    }

    #[test]
    fn invalid_file_falls_back_to_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("settings.json");
        std::fs::write(&path, "{ not json").unwrap();

        assert_eq!(
            SettingsStore::load_from(&path, isolated_env()),
            CoachSettings::default()
        );
    }

    #[test]
    fn update_persists_and_swaps() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("settings.json");
        let store = SettingsStore::new(path.clone());

        store
            .update(CoachSettings {
                api_token: "  secret ".to_string(),
                include_commute_in_training_load: true,
                ..CoachSettings::default()
            })
            .unwrap();

        assert_eq!(store.settings().api_token, "secret");
        assert!(store.settings().training_load_policy().include_commute);
        assert!(!path.with_extension(STAGED_EXTENSION).exists());
        assert!(std::fs::read_to_string(&path).unwrap().ends_with('\n'));

        let reloaded = SettingsStore::load_from(&path, isolated_env());
        assert_eq!(reloaded, *store.settings());
    }

    #[test]
    fn transport_config_carries_token_and_timeout() {
        let settings = CoachSettings {
            api_token: "abc".to_string(),
            ..CoachSettings::default()
        };
        let config = settings.to_transport_config();
        assert_eq!(config.token.as_deref(), Some("abc"));
        assert_eq!(
            config.request_timeout,
            Some(Duration::from_secs(DEFAULT_REQUEST_TIMEOUT_SECS))
        );
    }
}
