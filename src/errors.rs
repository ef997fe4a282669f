use serde::Deserialize;
use serde::Serialize;
use thiserror::Error;

/// Represents all possible errors in the filelist crate.
#[derive(Error, Debug, Clone, Serialize, Deserialize, PartialEq, Hash, Eq)]
pub enum Error {
    /// Error indicating a failure to read listing data.
    #[error("Failed to read {what}: {how}")]
    Read {
        /// The item that failed to be read.
        what: String,
        /// The reason for the failure.
        how: String,
    },

    /// Error indicating an invalid argument was provided.
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    /// Structural error in the listing document. Aborts the current load
    /// only; whatever was merged before the error stays in the tree.
    #[error("Failed to parse {what}: {how}")]
    Parse {
        /// The item that failed to be parse.
        what: String,
        /// The reason for the failure.
        how: String,
    },

    /// The requested directory is not part of the tree.
    #[error("Directory not found: {0}")]
    NotFound(String),

    /// The listing was closed while the operation was running.
    #[error("Operation aborted")]
    Aborted,

    /// The tree could not be materialized because memory ran out.
    #[error("Out of memory")]
    OutOfMemory,

    /// The download queue rejected a request.
    #[error("Queueing failed: {0}")]
    Queue(String),

    /// The peer could not be asked to search. Returned by
    /// [`crate::PeerClient`] implementations.
    #[error("Search failed: {0}")]
    Search(String),

    /// The background worker of a listing could not be started.
    #[error("Failed to start worker: {0}")]
    Spawn(String),
}

impl Error {
    /// Shorthand for a [`Error::Parse`] raised by the listing loader.
    pub(crate) fn parse(how: impl Into<String>) -> Self {
        Error::Parse {
            what: "file list".into(),
            how: how.into(),
        }
    }
}

impl From<quick_xml::Error> for Error {
    fn from(e: quick_xml::Error) -> Self {
        Error::parse(e.to_string())
    }
}

impl From<quick_xml::events::attributes::AttrError> for Error {
    fn from(e: quick_xml::events::attributes::AttrError) -> Self {
        Error::parse(e.to_string())
    }
}

impl From<std::collections::TryReserveError> for Error {
    fn from(_: std::collections::TryReserveError) -> Self {
        Error::OutOfMemory
    }
}
