//! Model loading error types

use thiserror::Error;

use emberlm_core::CoreError;

#[derive(Error, Debug)]
pub enum ModelError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("malformed checkpoint or tokenizer: {0}")]
    Format(String),

    #[error("model config error: {0}")]
    Config(String),

    #[error(transparent)]
    Core(#[from] CoreError),

    #[error("resource exhausted: {0}")]
    Exhausted(String),
}

pub type Result<T> = std::result::Result<T, ModelError>;
