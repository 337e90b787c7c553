use std::fmt;
use std::time::Duration;

use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Boundary {
    Beginning,
    End,
}

impl fmt::Display for Boundary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Boundary::Beginning => f.write_str("beginning"),
            Boundary::End => f.write_str("end"),
        }
    }
}

/// Failures a reading session can report to its caller.
///
/// Renderer and timer problems are normally absorbed at the adapter boundary
/// (see [`NavFailure`]); only the variants below ever reach the reader.
#[derive(Debug, Error)]
pub enum ReaderError {
    /// Neither the override, the declared hint nor the content sniff
    /// produced a usable format. Terminal: no renderer is mounted.
    #[error("this document's format could not be recognised")]
    FormatUnresolved,

    #[error("the renderer did not respond within {0:?}")]
    RendererStalled(Duration),

    #[error("already at the {0} of the document")]
    NavigationBoundary(Boundary),

    #[error("saving failed after {attempts} attempts: {message}")]
    SaveFailed { attempts: u32, message: String },

    /// Highlight or lookup invoked without an active selection.
    #[error("nothing is selected")]
    SelectionEmpty,

    #[error("no renderer is mounted")]
    NotMounted,

    #[error("no record with id {0}")]
    UnknownRecord(String),

    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

pub type ReaderResult<T> = std::result::Result<T, ReaderError>;

/// Outcome of a failed adapter navigation call.
#[derive(Debug, Clone, PartialEq)]
pub enum NavFailure {
    Boundary(Boundary),
    /// The engine exceeded its timeout and no fallback could recover.
    Stalled,
    /// A newer render replaced this one before it finished.
    Superseded,
    Engine(String),
}

impl fmt::Display for NavFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NavFailure::Boundary(boundary) => write!(f, "already at the {boundary}"),
            NavFailure::Stalled => f.write_str("the page is taking too long to load"),
            NavFailure::Superseded => f.write_str("superseded by a newer request"),
            NavFailure::Engine(message) => f.write_str(message),
        }
    }
}
