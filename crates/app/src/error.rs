use std::path::PathBuf;

use psup_chat::CoordinatorError;
use psup_llm::ProviderError;
use psup_storage::StorageError;
use snafu::Snafu;

use crate::settings::SettingsError;

pub type AppResult<T> = Result<T, AppError>;

#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum AppError {
    #[snafu(display("storage failed on `{stage}`: {source}"))]
    Storage {
        stage: &'static str,
        source: StorageError,
    },
    #[snafu(display("storage task failed on `{stage}`: {source}"))]
    StorageTask {
        stage: &'static str,
        source: tokio::task::JoinError,
    },
    #[snafu(display("failed to create provider on `{stage}`: {source}"))]
    CreateProvider {
        stage: &'static str,
        source: ProviderError,
    },
    #[snafu(display("settings failed on `{stage}`: {source}"))]
    Settings {
        stage: &'static str,
        source: SettingsError,
    },
    #[snafu(display("chat coordinator unavailable on `{stage}`: {source}"))]
    Coordinator {
        stage: &'static str,
        source: CoordinatorError,
    },
    #[snafu(display("failed to read {path:?} on `{stage}`: {source}"))]
    ReadFile {
        stage: &'static str,
        path: PathBuf,
        source: std::io::Error,
    },
    #[snafu(display("{path:?} is not a problem statement on `{stage}`: {source}"))]
    ParseProblem {
        stage: &'static str,
        path: PathBuf,
        source: serde_json::Error,
    },
    #[snafu(display("failed to read terminal input on `{stage}`: {source}"))]
    ReadInput {
        stage: &'static str,
        source: std::io::Error,
    },
    #[snafu(display("no problem is open on `{stage}`"))]
    NoActiveProblem { stage: &'static str },
}
