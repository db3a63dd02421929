//! CLI-level error type — wraps every collaborator crate's error so
//! `main` has one thing to `eprintln!`/`process::exit(1)` on.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum CliError {
    #[error("cannot read flow file {path}: {source}")]
    ReadFile { path: String, source: std::io::Error },

    #[error("invalid flow file JSON: {0}")]
    InvalidJson(#[from] serde_json::Error),

    #[error("flow file failed structural validation:\n{0}")]
    Structural(String),

    #[error("config error: {0}")]
    Config(#[from] fdr::ConfigError),

    #[error("dispatcher error: {0}")]
    Dispatcher(#[from] dispatch::DispatcherError),

    #[error("store error: {0}")]
    Store(#[from] store::StoreError),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}
