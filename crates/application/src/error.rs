use domain::{DomainError, RepositoryError};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ApplicationError {
    #[error("domain error: {0}")]
    Domain(#[from] DomainError),
    #[error("repository error: {0}")]
    Repository(RepositoryError),
    #[error("frame error: {0}")]
    Frame(#[from] crate::protocol::FrameError),
    #[error("relay error: {0}")]
    Relay(#[from] crate::relay::RelayError),
    /// 调度器已停止，命令队列关闭
    #[error("dispatcher unavailable")]
    DispatcherUnavailable,
}

impl From<RepositoryError> for ApplicationError {
    fn from(value: RepositoryError) -> Self {
        ApplicationError::Repository(value)
    }
}
