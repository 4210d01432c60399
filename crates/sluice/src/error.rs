//! Error types for Sluice.
//!
//! Extension points (plugins, destinations, persistors, consent managers)
//! return `anyhow::Result`. The pipeline wraps those failures into
//! [`SluiceError`] before handing them to the client's error reporter, so a
//! host only ever sees one error type.

use thiserror::Error;

/// Coarse classification of a [`SluiceError`], handed to error handlers that
/// only care about the category of a failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    PluginError,
    DestinationError,
    PersistenceError,
    JsonError,
    ConsentError,
    InitializationError,
    FlushError,
    ResetError,
    Unknown,
}

/// Errors reported by the pipeline.
#[derive(Error, Debug)]
pub enum SluiceError {
    #[error("plugin {plugin} failed: {source}")]
    Plugin {
        plugin: String,
        source: anyhow::Error,
    },

    #[error("destination {key} failed: {source}")]
    Destination { key: String, source: anyhow::Error },

    #[error("persistence failed for store {store_id}: {source}")]
    Persistence {
        store_id: String,
        source: anyhow::Error,
    },

    #[error("json error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("consent error: {0}")]
    Consent(String),

    #[error("initialization error: {0}")]
    Initialization(String),

    #[error("flush error: {0}")]
    Flush(String),

    #[error("reset error: {0}")]
    Reset(String),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl SluiceError {
    pub fn plugin(plugin: impl Into<String>, source: anyhow::Error) -> Self {
        Self::Plugin {
            plugin: plugin.into(),
            source,
        }
    }

    pub fn destination(key: impl Into<String>, source: anyhow::Error) -> Self {
        Self::Destination {
            key: key.into(),
            source,
        }
    }

    pub fn persistence(store_id: impl Into<String>, source: anyhow::Error) -> Self {
        Self::Persistence {
            store_id: store_id.into(),
            source,
        }
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Plugin { .. } => ErrorKind::PluginError,
            Self::Destination { .. } => ErrorKind::DestinationError,
            Self::Persistence { .. } => ErrorKind::PersistenceError,
            Self::Serialization(_) => ErrorKind::JsonError,
            Self::Consent(_) => ErrorKind::ConsentError,
            Self::Initialization(_) => ErrorKind::InitializationError,
            Self::Flush(_) => ErrorKind::FlushError,
            Self::Reset(_) => ErrorKind::ResetError,
            Self::Other(_) => ErrorKind::Unknown,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kind_follows_variant() {
        let err = SluiceError::destination("Mixpanel", anyhow::anyhow!("boom"));
        assert_eq!(err.kind(), ErrorKind::DestinationError);
        assert_eq!(err.to_string(), "destination Mixpanel failed: boom");

        let err: SluiceError = serde_json::from_str::<u8>("nope").unwrap_err().into();
        assert_eq!(err.kind(), ErrorKind::JsonError);
    }
}
