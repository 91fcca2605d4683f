use codebox_common::{pgqueue, store};
use thiserror::Error;

/// Errors raised while setting up or supervising a container run. Anything
/// the container itself does wrong is reported through `ExecutionReport`,
/// not through this enum.
#[derive(Error, Debug)]
pub enum ExecutorError {
    #[error("failed to prepare workspace: {0}")]
    WorkspaceSetup(std::io::Error),
    #[error("failed to stage source files: {0}")]
    SourceWrite(std::io::Error),
    #[error("failed to spawn container runtime: {0}")]
    Spawn(std::io::Error),
    #[error("failed while waiting for the container: {0}")]
    Wait(std::io::Error),
}

/// Errors related to initialization and consumption of queue jobs.
#[derive(Error, Debug)]
pub enum WorkerError {
    #[error("a database error occurred when consuming the queue")]
    QueueError(#[from] pgqueue::QueueError),
    #[error("a database error occurred when persisting job state")]
    StoreError(#[from] store::StoreError),
}
