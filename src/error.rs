//! Error types for model loading, navigation, and reconciliation.

use std::path::PathBuf;

use thiserror::Error;

/// Result alias used throughout the crate.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur while loading, mutating, or saving a model.
///
/// Every variant carries enough context (fragment path, selector text,
/// instruction index) to report a precise location to the user. None of
/// these are retried internally; they abort the encompassing operation
/// (load, reconciliation batch, or serialize) entirely.
#[derive(Debug, Error)]
pub enum Error {
    /// A fragment file is structurally corrupt and cannot be loaded.
    #[error("malformed fragment {}: {message}", fragment.display())]
    MalformedFragment { fragment: PathBuf, message: String },

    /// Two live elements claim the same identifier.
    #[error("duplicate identifier: {id}")]
    DuplicateIdentifier { id: String },

    /// A stored link points at an element that does not exist.
    #[error("unresolved reference: {link}")]
    UnresolvedReference { link: String },

    /// A parent selector matched no element.
    #[error("instruction {instruction}: no element matches selector {selector}")]
    ParentNotFound {
        selector: String,
        instruction: usize,
    },

    /// A predicate selector matched more than one element.
    #[error(
        "instruction {instruction}: selector {selector} is ambiguous ({matches} matches)"
    )]
    AmbiguousSelector {
        selector: String,
        instruction: usize,
        matches: usize,
    },

    /// An attribute assignment violates the attribute's declared kind.
    #[error(
        "instruction {instruction}: attribute {attribute:?} expects {expected}, got {value:?}"
    )]
    TypeMismatch {
        attribute: String,
        expected: &'static str,
        value: String,
        instruction: usize,
    },

    /// One or more promises were referenced but never fulfilled.
    #[error("unfulfilled promises: {}", tokens.join(", "))]
    UnresolvedPromise { tokens: Vec<String> },

    /// The instruction document's metadata does not match the loaded model.
    #[error("metadata mismatch: {field} is {actual:?}, document expects {expected:?}")]
    MetadataMismatch {
        field: &'static str,
        expected: String,
        actual: String,
    },

    /// Writing a fragment back to storage failed; the previously persisted
    /// state is untouched.
    #[error("cannot serialize {}: {message}", fragment.display())]
    SerializationFailure { fragment: PathBuf, message: String },

    /// An instruction document is syntactically or structurally invalid.
    #[error("instruction {instruction}: {message}")]
    InvalidInstruction { instruction: usize, message: String },

    /// The instruction stream itself could not be parsed.
    #[error("invalid instruction document: {0}")]
    InvalidDocument(String),

    /// IO error outside of the serializer's staged-commit path.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Create a [`Error::MalformedFragment`].
    pub fn malformed(fragment: impl Into<PathBuf>, message: impl Into<String>) -> Self {
        Self::MalformedFragment {
            fragment: fragment.into(),
            message: message.into(),
        }
    }

    /// Create a [`Error::SerializationFailure`].
    pub fn serialization(fragment: impl Into<PathBuf>, message: impl Into<String>) -> Self {
        Self::SerializationFailure {
            fragment: fragment.into(),
            message: message.into(),
        }
    }

    /// Create a [`Error::InvalidDocument`].
    pub fn document(message: impl Into<String>) -> Self {
        Self::InvalidDocument(message.into())
    }

    /// Create a [`Error::InvalidInstruction`].
    pub fn instruction(instruction: usize, message: impl Into<String>) -> Self {
        Self::InvalidInstruction {
            instruction,
            message: message.into(),
        }
    }
}
