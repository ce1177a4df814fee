/*
    errors.rs - Error type of the reactor facade
*/

use thiserror::Error;

use crate::config::ConfigError;
use crate::core_model::ModelError;
use crate::core_queue::JobError;
use crate::core_store::StoreError;
use crate::core_sync::SyncError;

#[derive(Debug, Error)]
pub enum ReactorError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Model(#[from] ModelError),

    #[error(transparent)]
    Job(#[from] JobError),

    #[error(transparent)]
    Sync(#[from] SyncError),

    #[error("Sync is not enabled for this reactor")]
    SyncDisabled,

    #[error("Reactor has been killed")]
    Killed,
}

pub type ReactorResult<T> = Result<T, ReactorError>;
