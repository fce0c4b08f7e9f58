//! Error types for the cilproto-core library.
//!
//! Every fatal condition the decompiler can hit maps to one variant here.
//! Recoverable conditions (skipped properties, pruned oneof members, duplicate
//! client overloads) are not errors; they are reported as
//! [`Diagnostic`](crate::decompiler::Diagnostic) values instead.

use std::path::PathBuf;
use thiserror::Error;

/// Result type alias for cilproto operations
pub type Result<T> = std::result::Result<T, Error>;

/// Error type for all cilproto operations
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum Error {
    /// Failed to read input file
    #[error("failed to read file '{path}': {source}")]
    FileRead {
        /// Path to the file that failed to read
        path: PathBuf,
        /// Underlying I/O error
        #[source]
        source: std::io::Error,
    },

    /// Failed to write output file
    #[error("failed to write file '{path}': {source}")]
    FileWrite {
        /// Path to the file that failed to write
        path: PathBuf,
        /// Underlying I/O error
        #[source]
        source: std::io::Error,
    },

    /// Failed to create output directory
    #[error("failed to create directory '{path}': {source}")]
    DirectoryCreate {
        /// Path to the directory that failed to create
        path: PathBuf,
        /// Underlying I/O error
        #[source]
        source: std::io::Error,
    },

    /// A custom attribute blob is truncated or structurally invalid
    #[error("malformed attribute blob at offset {offset}: {details}")]
    MalformedAttributeBlob {
        /// Byte offset into the blob where decoding failed
        offset: usize,
        /// Detailed description of the issue
        details: String,
    },

    /// A constructor argument uses a value tag the decoder cannot represent
    #[error("unsupported attribute value tag 0x{tag:02x} at offset {offset}")]
    UnsupportedAttributeValue {
        /// The raw type tag byte
        tag: u8,
        /// Byte offset of the tag
        offset: usize,
    },

    /// Constructor arguments were requested from metadata that does not store them
    #[error(
        "attribute constructor arguments are only available on il2cpp metadata version 29 or greater (found {version})"
    )]
    AttributeArgumentsUnavailable {
        /// The metadata version in use
        version: f32,
    },

    /// A type did not have the shape the reconstruction step requires
    #[error("type '{type_name}' violates a structural assumption: {details}")]
    Precondition {
        /// Full name of the offending type
        type_name: String,
        /// Which assumption failed
        details: String,
    },

    /// A well-known protobuf/gRPC support type is absent from the loaded metadata
    #[error("well-known type '{full_name}' not found in loaded metadata or assembly '{assembly}'")]
    MissingWellKnownType {
        /// Full name of the support type
        full_name: String,
        /// Simple name of the assembly that should define it
        assembly: String,
    },

    /// Cross-table references in a metadata dump are inconsistent
    #[error("invalid metadata: {0}")]
    InvalidMetadata(String),

    /// Failed to deserialize a metadata dump or name map
    #[error("failed to parse metadata dump: {0}")]
    DumpParse(#[from] serde_json::Error),
}

impl Error {
    /// Creates a new file read error
    pub fn file_read(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::FileRead {
            path: path.into(),
            source,
        }
    }

    /// Creates a new file write error
    pub fn file_write(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::FileWrite {
            path: path.into(),
            source,
        }
    }

    /// Creates a new directory creation error
    pub fn directory_create(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::DirectoryCreate {
            path: path.into(),
            source,
        }
    }

    /// Creates a new malformed blob error
    pub fn malformed_blob(offset: usize, details: impl Into<String>) -> Self {
        Self::MalformedAttributeBlob {
            offset,
            details: details.into(),
        }
    }

    /// Creates a new precondition error for the given type
    pub fn precondition(type_name: impl Into<String>, details: impl Into<String>) -> Self {
        Self::Precondition {
            type_name: type_name.into(),
            details: details.into(),
        }
    }

    /// Creates a new missing well-known type error
    pub fn missing_well_known(full_name: impl Into<String>, assembly: impl Into<String>) -> Self {
        Self::MissingWellKnownType {
            full_name: full_name.into(),
            assembly: assembly.into(),
        }
    }

    /// Creates a new invalid metadata error
    pub fn invalid_metadata(msg: impl Into<String>) -> Self {
        Self::InvalidMetadata(msg.into())
    }

    /// Returns true if the error came from decoding attribute data
    pub fn is_attribute_error(&self) -> bool {
        matches!(
            self,
            Self::MalformedAttributeBlob { .. }
                | Self::UnsupportedAttributeValue { .. }
                | Self::AttributeArgumentsUnavailable { .. }
        )
    }
}
