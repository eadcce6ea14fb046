//! Domain error types.

/// Rejection reasons for operator-supplied symbols.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum SymbolError {
    #[error("empty symbol")]
    Empty,

    #[error("symbol too long ({0} chars, max 20)")]
    TooLong(usize),

    #[error("invalid character {0:?} in symbol")]
    InvalidChar(char),
}

/// Top-level error type for posrecon.
#[derive(Debug, thiserror::Error)]
pub enum ReconError {
    #[error("database error: {reason}")]
    Database { reason: String },

    #[error("database query error: {reason}")]
    DatabaseQuery { reason: String },

    #[error("config parse error in {file}: {reason}")]
    ConfigParse { file: String, reason: String },

    #[error("missing config key [{section}] {key}")]
    ConfigMissing { section: String, key: String },

    #[error("invalid config value [{section}] {key}: {reason}")]
    ConfigInvalid {
        section: String,
        key: String,
        reason: String,
    },

    #[error("malformed payload: {reason}")]
    Payload { reason: String },

    #[error(transparent)]
    Symbol(#[from] SymbolError),

    #[error("wallet {0} has no ledger history")]
    WalletNotFound(i64),

    #[error(transparent)]
    Json(#[from] serde_json::Error),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl ReconError {
    pub(crate) fn db(e: impl std::fmt::Display) -> Self {
        ReconError::Database {
            reason: e.to_string(),
        }
    }

    pub(crate) fn query(e: impl std::fmt::Display) -> Self {
        ReconError::DatabaseQuery {
            reason: e.to_string(),
        }
    }
}

impl From<&ReconError> for std::process::ExitCode {
    fn from(err: &ReconError) -> Self {
        let code: u8 = match err {
            ReconError::Io(_) => 1,
            ReconError::ConfigParse { .. }
            | ReconError::ConfigMissing { .. }
            | ReconError::ConfigInvalid { .. } => 2,
            ReconError::Database { .. } | ReconError::DatabaseQuery { .. } => 3,
            ReconError::Payload { .. } | ReconError::Json(_) | ReconError::Symbol(_) => 4,
            ReconError::WalletNotFound(_) => 5,
        };
        std::process::ExitCode::from(code)
    }
}
