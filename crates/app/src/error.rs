use std::path::PathBuf;

use docchat_client::ClientError;
use docchat_storage::StorageError;
use snafu::Snafu;

#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum AppError {
    #[snafu(display("failed to open local storage at {path:?} on `{stage}`: {source}"))]
    OpenStorage {
        stage: &'static str,
        path: PathBuf,
        source: StorageError,
    },
    #[snafu(display("failed to set up the backend client on `{stage}`: {source}"))]
    Client {
        stage: &'static str,
        source: ClientError,
    },
    #[snafu(display("failed to read terminal input on `{stage}`: {source}"))]
    ReadInput {
        stage: &'static str,
        source: std::io::Error,
    },
}

pub type AppResult<T> = Result<T, AppError>;
