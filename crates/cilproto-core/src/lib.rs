//! # cilproto-core
//!
//! A library for recovering Protocol Buffer schemas from compiled .NET code.
//!
//! protoc's C# generator and the gRPC C# plugin leave the shape of every
//! message, enum and service in the types they emit. This crate reads those
//! types back, either from managed assembly metadata or from Unity IL2CPP
//! metadata, and rebuilds the `.proto` declarations they came from.
//!
//! ## Architecture
//!
//! The library is organized into several modules:
//!
//! - [`attribute`]: IL2CPP custom attribute blob decoding
//! - [`metadata`]: backend-neutral type metadata traits and both backends
//! - [`naming`]: recovery of proto identifiers from generated C# names
//! - [`decompiler`]: the reconstruction engine
//! - [`proto`]: the schema model, `.proto` text writer and descriptor export
//! - [`error`]: Error types and handling
//!
//! ## Example
//!
//! ```no_run
//! use cilproto_core::metadata::clr::ClrLoader;
//! use cilproto_core::metadata::{CilAssemblyLoader, MetadataDump};
//! use cilproto_core::{Decompiler, ParseOptions};
//!
//! let MetadataDump::Clr(dump) = MetadataDump::from_path("app.json")? else {
//!     return Ok(());
//! };
//! let loader = ClrLoader::new(dump.assemblies, dump.references)?;
//!
//! let mut decompiler = Decompiler::new();
//! for ty in loader.message_types()? {
//!     decompiler.parse_message(&ty, ParseOptions::new())?;
//! }
//!
//! print!("{}", decompiler.schema().render_all());
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! ```
//!
//! ## Extensibility
//!
//! The library provides several traits for customization:
//!
//! - [`CilType`](metadata::CilType) and friends: plug in another metadata source
//! - [`NameLookup`]: supply de-obfuscated names
//! - [`ProtoWriter`]: walk the reconstructed schema for alternative outputs
//!

#![deny(unsafe_code)]
#![warn(missing_docs, rust_2018_idioms, unreachable_pub)]

pub mod attribute;
pub mod decompiler;
pub mod error;
pub mod metadata;
pub mod naming;
pub mod proto;

// Re-export primary types for convenience
pub use decompiler::{Decompiler, Diagnostic, DiagnosticKind, ParseOptions};
pub use error::{Error, Result};
pub use naming::{NameLookup, NameMap};
pub use proto::{ProtoWriter, Schema, StatsWriter, WriterConfig};

/// Crate version for programmatic access
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
