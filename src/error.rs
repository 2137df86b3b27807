use std::path::PathBuf;

use thiserror::Error;

/// Coarse classification used in logs and poll statistics.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Config,
    Transport,
    Decode,
    Unsupported,
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ErrorKind::Config => write!(f, "config"),
            ErrorKind::Transport => write!(f, "transport"),
            ErrorKind::Decode => write!(f, "decode"),
            ErrorKind::Unsupported => write!(f, "unsupported"),
        }
    }
}

#[derive(Debug, Error)]
pub enum BotError {
    #[error("configuration error: {0}")]
    Config(String),

    /// The request never produced a response. The URL is stripped from
    /// `source` because it carries the bot token.
    #[error("{method} request failed: {source}")]
    Http {
        method: &'static str,
        #[source]
        source: reqwest::Error,
    },

    #[error("{method} returned HTTP {status}")]
    Status {
        method: &'static str,
        status: reqwest::StatusCode,
    },

    #[error("{method} rejected by API: {description}")]
    Api {
        method: &'static str,
        description: String,
    },

    #[error("{method} response was not valid JSON: {source}")]
    Decode {
        method: &'static str,
        #[source]
        source: serde_json::Error,
    },

    #[error("{method}: missing '{field}'")]
    MissingField {
        method: &'static str,
        field: &'static str,
    },

    #[error("file error at {}: {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("{0} is not supported yet")]
    Unsupported(&'static str),
}

impl BotError {
    pub fn http(method: &'static str, source: reqwest::Error) -> Self {
        BotError::Http {
            method,
            source: source.without_url(),
        }
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            BotError::Config(_) => ErrorKind::Config,
            BotError::Http { .. }
            | BotError::Status { .. }
            | BotError::Api { .. }
            | BotError::Io { .. } => ErrorKind::Transport,
            BotError::Decode { .. } | BotError::MissingField { .. } => ErrorKind::Decode,
            BotError::Unsupported(_) => ErrorKind::Unsupported,
        }
    }
}
