//! JSON metadata dumps produced by an external assembly reader.

use super::clr::ClrAssembly;
use super::il2cpp::Il2CppMetadata;
use crate::error::{Error, Result};
use serde::Deserialize;
use std::fs;
use std::path::Path;

/// A metadata dump, tagged by backend:
///
/// ```json
/// { "backend": "clr", "assemblies": [ ... ], "references": [ ... ] }
/// { "backend": "il2cpp", "version": 29, "type_defs": [ ... ], ... }
/// ```
#[derive(Debug, Deserialize)]
#[serde(tag = "backend", rename_all = "lowercase")]
pub enum MetadataDump {
    /// Reflection-style assembly records
    Clr(ClrDump),
    /// IL2CPP metadata tables
    Il2Cpp(Il2CppMetadata),
}

/// Target assemblies plus the support assemblies they reference
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct ClrDump {
    /// Assemblies whose types are decompiled
    pub assemblies: Vec<ClrAssembly>,
    /// Assemblies consulted only for type resolution
    pub references: Vec<ClrAssembly>,
}

impl MetadataDump {
    /// Reads and parses a dump file
    pub fn from_path(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let data = fs::read(path).map_err(|e| Error::file_read(path, e))?;
        Self::from_slice(&data)
    }

    /// Parses a dump from JSON bytes
    pub fn from_slice(data: &[u8]) -> Result<Self> {
        Ok(serde_json::from_slice(data)?)
    }

    /// Backend name as it appears in the `backend` tag
    pub fn backend(&self) -> &'static str {
        match self {
            Self::Clr(_) => "clr",
            Self::Il2Cpp(_) => "il2cpp",
        }
    }
}
