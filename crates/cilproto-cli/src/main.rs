//! cilproto - Decompile Protocol Buffer schemas from .NET metadata
//!
//! This tool reads metadata dumps of managed assemblies or IL2CPP builds,
//! finds the classes protoc and the gRPC plugin generated, and writes the
//! `.proto` files they were generated from.

use anyhow::{bail, Context, Result};
use cilproto_core::metadata::clr::{ClrAssembly, ClrLoader};
use cilproto_core::metadata::il2cpp::Il2CppLoader;
use cilproto_core::metadata::{CilAssemblyLoader, CilType, MetadataDump};
use cilproto_core::{Decompiler, NameMap, ParseOptions, Schema, StatsWriter, WriterConfig};
use clap::{Args, Parser, Subcommand};
use prost::Message;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, info, trace, warn, Level};
use tracing_subscriber::EnvFilter;
use walkdir::WalkDir;

/// Decompile Protocol Buffer schemas from .NET assemblies and IL2CPP metadata
#[derive(Parser, Debug)]
#[command(name = "cilproto")]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
struct Cli {
    #[command(subcommand)]
    backend: Backend,

    /// Verbosity level (-v, -vv, -vvv)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,
}

#[derive(Subcommand, Debug)]
enum Backend {
    /// Decompile from reflection-style assembly dumps
    Clr(ClrArgs),
    /// Decompile from an IL2CPP metadata dump
    Il2cpp(Il2CppArgs),
}

#[derive(Args, Debug)]
struct ClrArgs {
    /// A dump file, or a directory searched for *.json dumps
    target: PathBuf,

    /// Existing directory for one file per unit; otherwise a single combined file
    out: PathBuf,

    #[command(flatten)]
    shared: SharedOptions,
}

#[derive(Args, Debug)]
struct Il2CppArgs {
    /// IL2CPP metadata dump
    metadata: PathBuf,

    /// Existing directory for one file per unit; otherwise a single combined file
    out: PathBuf,

    /// Metadata version to assume instead of the one recorded in the dump
    #[arg(long)]
    metadata_version: Option<f32>,

    #[command(flatten)]
    shared: SharedOptions,
}

#[derive(Args, Debug, Clone, Default)]
struct SharedOptions {
    /// Render enum fields as int32 instead of reconstructing the enums
    #[arg(long)]
    skip_enums: bool,

    /// Also consider properties without DebuggerNonUserCodeAttribute
    #[arg(long)]
    include_properties_without_non_user_code_attribute: bool,

    /// Also consider service methods without the gRPC GeneratedCodeAttribute
    #[arg(long)]
    include_service_methods_without_generated_code_attribute: bool,

    /// Reconstruct services from their server base classes
    #[arg(long)]
    parse_service_servers: bool,

    /// Reconstruct services from their client classes
    #[arg(long)]
    parse_service_clients: bool,

    /// JSON object mapping obfuscated identifiers to original names
    #[arg(long, value_name = "FILE")]
    name_map: Option<PathBuf>,

    /// Also write the schema as an encoded FileDescriptorSet
    #[arg(long, value_name = "FILE")]
    descriptor_set: Option<PathBuf>,
}

impl SharedOptions {
    fn parse_options(&self) -> ParseOptions {
        ParseOptions::new()
            .skip_enums(self.skip_enums)
            .include_properties_without_non_user_code_attribute(
                self.include_properties_without_non_user_code_attribute,
            )
            .include_service_methods_without_generated_code_attribute(
                self.include_service_methods_without_generated_code_attribute,
            )
    }
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    // Initialize tracing
    let level = match cli.verbose {
        0 => Level::WARN,
        1 => Level::INFO,
        2 => Level::DEBUG,
        _ => Level::TRACE,
    };

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive(level.into()))
        .with_target(false)
        .init();

    match &cli.backend {
        Backend::Clr(args) => run_clr(args),
        Backend::Il2cpp(args) => run_il2cpp(args),
    }
}

fn run_clr(args: &ClrArgs) -> Result<()> {
    let (assemblies, references) = read_clr_dumps(&args.target)?;
    if assemblies.is_empty() {
        bail!("No assemblies found in {}", args.target.display());
    }

    let loader = ClrLoader::new(assemblies, references)
        .with_context(|| format!("Failed to load assemblies from {}", args.target.display()))?;
    let decompiler = decompile(&loader, &args.shared)?;
    finish(decompiler, &args.out, &args.shared)
}

fn run_il2cpp(args: &Il2CppArgs) -> Result<()> {
    let dump = MetadataDump::from_path(&args.metadata)
        .with_context(|| format!("Failed to read metadata dump: {}", args.metadata.display()))?;
    let MetadataDump::Il2Cpp(mut metadata) = dump else {
        bail!(
            "{} is a {} dump, expected il2cpp",
            args.metadata.display(),
            dump.backend()
        );
    };

    if let Some(version) = args.metadata_version {
        debug!("Overriding metadata version {} with {}", metadata.version, version);
        metadata.version = version;
    }

    let loader = Il2CppLoader::new(metadata)
        .with_context(|| format!("Invalid metadata dump: {}", args.metadata.display()))?;
    let decompiler = decompile(&loader, &args.shared)?;
    finish(decompiler, &args.out, &args.shared)
}

/// Collects target and reference assemblies from one dump or a directory of dumps
fn read_clr_dumps(target: &Path) -> Result<(Vec<ClrAssembly>, Vec<ClrAssembly>)> {
    if !target.exists() {
        bail!("Target does not exist: {}", target.display());
    }

    let paths: Vec<PathBuf> = if target.is_dir() {
        info!("Scanning directory: {}", target.display());
        WalkDir::new(target)
            .follow_links(false)
            .sort_by_file_name()
            .into_iter()
            .filter_map(|e| e.ok())
            .map(|e| e.into_path())
            .filter(|path| is_dump_file(path))
            .collect()
    } else {
        vec![target.to_path_buf()]
    };

    let mut assemblies = Vec::new();
    let mut references = Vec::new();
    for path in &paths {
        trace!("Reading {}", path.display());
        let dump = MetadataDump::from_path(path)
            .with_context(|| format!("Failed to read metadata dump: {}", path.display()))?;
        match dump {
            MetadataDump::Clr(clr) => {
                debug!(
                    "Loaded {} assemblies and {} references from {}",
                    clr.assemblies.len(),
                    clr.references.len(),
                    path.display()
                );
                assemblies.extend(clr.assemblies);
                references.extend(clr.references);
            }
            other => bail!(
                "{} is a {} dump, expected clr",
                path.display(),
                other.backend()
            ),
        }
    }

    info!("Read {} dump file(s)", paths.len());
    Ok((assemblies, references))
}

/// Visible `*.json` files
fn is_dump_file(path: &Path) -> bool {
    if !path.is_file() {
        return false;
    }

    // Skip hidden files
    if path
        .file_name()
        .and_then(|n| n.to_str())
        .map(|n| n.starts_with('.'))
        .unwrap_or(false)
    {
        return false;
    }

    path.extension()
        .and_then(|e| e.to_str())
        .is_some_and(|e| e.eq_ignore_ascii_case("json"))
}

/// Runs the engine over every candidate type the loader offers
fn decompile<L: CilAssemblyLoader>(loader: &L, shared: &SharedOptions) -> Result<Decompiler> {
    let options = shared.parse_options();
    let mut decompiler = Decompiler::new();
    if let Some(path) = &shared.name_map {
        let names = NameMap::from_path(path)
            .with_context(|| format!("Failed to read name map: {}", path.display()))?;
        info!("Loaded {} name translations", names.len());
        decompiler = decompiler.with_name_lookup(names);
    }

    let messages = loader.message_types().context("Failed to list message types")?;
    info!("Found {} message types", messages.len());
    for ty in &messages {
        decompiler
            .parse_message(ty, options)
            .with_context(|| format!("Failed to decompile message {}", ty.full_name()))?;
    }

    if shared.parse_service_servers {
        for ty in loader.service_server_types().context("Failed to list service servers")? {
            decompiler
                .parse_service(&ty, options)
                .with_context(|| format!("Failed to decompile service {}", ty.full_name()))?;
        }
    }

    if shared.parse_service_clients {
        for ty in loader.service_client_types().context("Failed to list service clients")? {
            decompiler
                .parse_service(&ty, options)
                .with_context(|| format!("Failed to decompile service {}", ty.full_name()))?;
        }
    }

    Ok(decompiler)
}

fn finish(decompiler: Decompiler, out: &Path, shared: &SharedOptions) -> Result<()> {
    let diagnostics = decompiler.diagnostics().len();
    let schema = decompiler.into_schema();

    write_output(&schema, out)?;

    if let Some(path) = &shared.descriptor_set {
        let encoded = schema.to_file_descriptor_set().encode_to_vec();
        fs::write(path, encoded)
            .with_context(|| format!("Failed to write descriptor set: {}", path.display()))?;
        println!("Wrote {}", path.display());
    }

    let mut stats = StatsWriter::default();
    schema.visit(&mut stats)?;
    info!(
        "Summary: {} files, {} messages, {} fields, {} enums, {} services, {} methods",
        stats.file_count,
        stats.message_count,
        stats.field_count,
        stats.enum_count,
        stats.service_count,
        stats.method_count
    );
    if diagnostics > 0 {
        warn!("{} recoverable issue(s) reported while decompiling", diagnostics);
    }

    Ok(())
}

/// One file per unit into an existing directory, otherwise one combined file
fn write_output(schema: &Schema, out: &Path) -> Result<()> {
    let config = WriterConfig::default();

    if out.is_dir() {
        let written = schema
            .write_files(out, &config)
            .with_context(|| format!("Failed to write output to {}", out.display()))?;
        for path in written {
            println!("Wrote {}", path.display());
        }
    } else {
        schema
            .write_combined(out, &config)
            .with_context(|| format!("Failed to write output to {}", out.display()))?;
        println!("Wrote {}", out.display());
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use cilproto_core::proto::{Message as ProtoMessage, ProtoFile, TopLevelKind};
    use pretty_assertions::assert_eq;
    use tempfile::TempDir;

    fn schema_with(names: &[&str]) -> Schema {
        let mut schema = Schema::new();
        for name in names {
            let file = schema.add_file(ProtoFile::default());
            let id = schema.add_top_level(*name, false, TopLevelKind::Message(ProtoMessage::default()));
            schema.attach(id, file);
        }
        schema
    }

    #[test]
    fn test_write_output_directory() {
        let temp_dir = TempDir::new().unwrap();
        write_output(&schema_with(&["Foo", "Foo", "Bar"]), temp_dir.path()).unwrap();

        let mut written: Vec<_> = fs::read_dir(temp_dir.path())
            .unwrap()
            .map(|e| e.unwrap().file_name().into_string().unwrap())
            .collect();
        written.sort();
        assert_eq!(written, vec!["Bar.proto", "Foo.proto", "_Foo.proto"]);

        let foo = fs::read_to_string(temp_dir.path().join("Foo.proto")).unwrap();
        assert!(foo.ends_with("message Foo {\n}\n"));
    }

    #[test]
    fn test_write_output_combined() {
        let temp_dir = TempDir::new().unwrap();
        let out = temp_dir.path().join("nested").join("all.proto");
        write_output(&schema_with(&["A", "B"]), &out).unwrap();

        let content = fs::read_to_string(&out).unwrap();
        assert_eq!(content.matches("// Decompiled with cilproto").count(), 1);
        assert_eq!(content.matches("syntax = ").count(), 1);
        assert!(content.ends_with("message A {\n}\n\nmessage B {\n}\n"));
    }

    #[test]
    fn test_read_clr_dumps_directory() {
        let temp_dir = TempDir::new().unwrap();
        fs::write(
            temp_dir.path().join("app.json"),
            r#"{"backend":"clr","assemblies":[{"name":"App"}],"references":[{"name":"Google.Protobuf"}]}"#,
        )
        .unwrap();
        fs::write(
            temp_dir.path().join("more.json"),
            r#"{"backend":"clr","assemblies":[{"name":"App.Extra"}]}"#,
        )
        .unwrap();
        fs::write(temp_dir.path().join(".hidden.json"), "not json").unwrap();
        fs::write(temp_dir.path().join("notes.txt"), "ignored").unwrap();

        let (assemblies, references) = read_clr_dumps(temp_dir.path()).unwrap();
        let names: Vec<_> = assemblies.iter().map(|a| a.name.as_str()).collect();
        assert_eq!(names, vec!["App", "App.Extra"]);
        assert_eq!(references.len(), 1);
    }

    #[test]
    fn test_read_clr_dumps_rejects_il2cpp() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("meta.json");
        fs::write(&path, r#"{"backend":"il2cpp","version":29}"#).unwrap();
        let err = read_clr_dumps(&path).unwrap_err();
        assert!(err.to_string().contains("expected clr"));
    }

    #[test]
    fn test_parse_options_mapping() {
        let shared = SharedOptions {
            skip_enums: true,
            include_service_methods_without_generated_code_attribute: true,
            ..Default::default()
        };
        let options = shared.parse_options();
        assert!(options.skip_enums);
        assert!(!options.include_properties_without_non_user_code_attribute);
        assert!(options.include_service_methods_without_generated_code_attribute);
    }

    #[test]
    fn verify_cli() {
        use clap::CommandFactory;
        Cli::command().debug_assert();
    }
}
