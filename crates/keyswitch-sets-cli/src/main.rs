use std::fs;
use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::{Context, Result};
use clap::Parser;
use keyswitch_sets_core::Vocabulary;
use keyswitch_sets_logic::{
    collect_from_inputs_file, collect_from_root, sort_sets, CollectError, SetCollection,
};
use serde::Serialize;

#[derive(Debug, Parser)]
#[command(name = "kss")]
#[command(about = "Convert Logic Pro articulation sets into Keyswitch Creator set entries")]
struct Cli {
    /// Directory scanned recursively for .plist articulation sets.
    root: Option<PathBuf>,

    /// File listing additional inputs: files, directories, or glob patterns,
    /// one per line.
    #[arg(long)]
    inputs_file: Option<PathBuf>,

    /// Output file for the rendered set entries.
    #[arg(long, default_value = "Keyswitch Sets.json")]
    out: PathBuf,

    /// Sort sets by name (case-insensitive) instead of discovery order.
    #[arg(long)]
    sort_sets: bool,

    /// Emit a complete JSON object instead of paste-ready entries.
    #[arg(long)]
    wrap: bool,

    /// Increase log verbosity (repeatable).
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,
}

#[derive(Debug, thiserror::Error)]
enum RunError {
    #[error("provide a root directory or --inputs-file (or both)")]
    NoInputSource,
    #[error("no sets built (no valid articulations with Output.MB1 found)")]
    NoSetsBuilt,
    #[error(transparent)]
    Collect(#[from] CollectError),
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl RunError {
    fn exit_code(&self) -> u8 {
        match self {
            Self::NoSetsBuilt => 2,
            Self::Collect(CollectError::DuplicateNames { .. }) => 3,
            Self::Collect(CollectError::InputsFileNotFound(_)) => 4,
            Self::NoInputSource
            | Self::Collect(CollectError::InputsFileRead { .. })
            | Self::Other(_) => 1,
        }
    }
}

fn init_tracing(verbose: u8) {
    use tracing_subscriber::{fmt, EnvFilter};

    let default_filter = match verbose {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    };
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter));

    fmt()
        .with_env_filter(env_filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();
}

/// Pretty-print with four-space indentation, the shape Keyswitch Creator
/// documents use.
fn to_pretty_json<T: Serialize>(value: &T) -> Result<String> {
    let formatter = serde_json::ser::PrettyFormatter::with_indent(b"    ");
    let mut buf = Vec::new();
    let mut serializer = serde_json::Serializer::with_formatter(&mut buf, formatter);
    value.serialize(&mut serializer)?;
    Ok(String::from_utf8(buf)?)
}

/// Render entries ready to paste inside an existing registry document: each
/// `"Name": { ... }` block indented one level, entries separated by a comma
/// on the closing brace, no enclosing object.
fn render_bare(collection: &SetCollection) -> Result<String> {
    let mut out = String::new();
    let last_index = collection.len().saturating_sub(1);
    for (index, (set_name, entry)) in collection.iter().enumerate() {
        let body = to_pretty_json(entry)?;
        let mut lines = body.lines();
        let Some(first_line) = lines.next() else {
            continue;
        };
        out.push_str("    ");
        out.push_str(&serde_json::to_string(set_name)?);
        out.push_str(": ");
        out.push_str(first_line);
        out.push('\n');
        let rest: Vec<&str> = lines.collect();
        let rest_last = rest.len().saturating_sub(1);
        for (line_index, line) in rest.iter().enumerate() {
            out.push_str("    ");
            out.push_str(line);
            if line_index == rest_last && index != last_index {
                out.push(',');
            }
            out.push('\n');
        }
    }
    Ok(out)
}

fn render_wrapped(collection: &SetCollection) -> Result<String> {
    let mut body = to_pretty_json(collection)?;
    body.push('\n');
    Ok(body)
}

fn run(cli: &Cli) -> Result<(), RunError> {
    if cli.root.is_none() && cli.inputs_file.is_none() {
        return Err(RunError::NoInputSource);
    }

    let vocabulary = Vocabulary::default();
    let mut collection = SetCollection::new();
    if let Some(root) = &cli.root {
        collection.extend(collect_from_root(root, &vocabulary)?);
    }
    if let Some(inputs_file) = &cli.inputs_file {
        collection.extend(collect_from_inputs_file(inputs_file, &vocabulary)?);
    }

    if collection.is_empty() {
        return Err(RunError::NoSetsBuilt);
    }
    if cli.sort_sets {
        sort_sets(&mut collection);
    }

    let rendered = if cli.wrap { render_wrapped(&collection)? } else { render_bare(&collection)? };
    fs::write(&cli.out, rendered)
        .with_context(|| format!("failed to write {}", cli.out.display()))?;

    println!("Wrote {} set entry/entries to {}", collection.len(), cli.out.display());
    Ok(())
}

fn report(err: &RunError) {
    match err {
        RunError::Collect(CollectError::DuplicateNames { path, names }) => {
            eprintln!("Error: duplicate articulation names in {}:", path.display());
            for name in names {
                eprintln!("  - {name}");
            }
        }
        RunError::Other(inner) => eprintln!("Error: {inner:#}"),
        other => eprintln!("Error: {other}"),
    }
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    init_tracing(cli.verbose);
    match run(&cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            report(&err);
            ExitCode::from(err.exit_code())
        }
    }
}
