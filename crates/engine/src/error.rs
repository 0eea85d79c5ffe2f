//! Engine error types

use thiserror::Error;

use emberlm_core::CoreError;
use emberlm_model::ModelError;

#[derive(Error, Debug)]
pub enum EngineError {
    #[error(transparent)]
    Model(#[from] ModelError),

    #[error(transparent)]
    Core(#[from] CoreError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("invalid request: {0}")]
    Config(String),

    #[error("resource exhausted: {0}")]
    Exhausted(String),

    #[error("no such session")]
    UnknownSession,
}

pub type Result<T> = std::result::Result<T, EngineError>;
