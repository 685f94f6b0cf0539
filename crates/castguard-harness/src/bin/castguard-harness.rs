//! CLI entrypoint for castguard tooling.

use std::path::PathBuf;

use castguard_harness::{LayoutReport, hash_names, load_manifest_file, summarize_log_file};
use clap::{Parser, Subcommand};

/// Inspection tooling for castguard.
#[derive(Debug, Parser)]
#[command(name = "castguard-harness")]
#[command(about = "Type hashes, descriptor dumps and report validation for castguard")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Print canonical names and type hashes.
    Hash {
        /// Raw type names (e.g. "class.Foo*").
        #[arg(required = true)]
        names: Vec<String>,
    },
    /// Print descriptors and the registration table for a layout manifest.
    Layout {
        /// Layout manifest JSON path.
        #[arg(long)]
        manifest: PathBuf,
        /// Only print the named type.
        #[arg(long)]
        type_name: Option<String>,
        /// Output JSON path (if omitted, prints to stdout).
        #[arg(long)]
        output: Option<PathBuf>,
    },
    /// Validate a JSONL diagnostic log and summarize rejected casts.
    CheckLog {
        /// Diagnostic JSONL path.
        #[arg(long)]
        log: PathBuf,
        /// Output summary JSON path (if omitted, prints to stdout).
        #[arg(long)]
        output: Option<PathBuf>,
    },
}

fn write_or_print(body: &str, output: Option<PathBuf>) -> std::io::Result<()> {
    match output {
        Some(path) => {
            std::fs::write(&path, body)?;
            eprintln!("Wrote {}", path.display());
        }
        None => println!("{body}"),
    }
    Ok(())
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    match cli.command {
        Command::Hash { names } => {
            let body = serde_json::to_string_pretty(&hash_names(&names))?;
            println!("{body}");
        }
        Command::Layout {
            manifest,
            type_name,
            output,
        } => {
            let loaded = load_manifest_file(&manifest)?;
            let report = LayoutReport::build(&loaded);
            let body = match type_name {
                Some(name) => {
                    let Some(found) = report.find(&name) else {
                        return Err(format!("no type named '{name}' in {}", manifest.display()).into());
                    };
                    serde_json::to_string_pretty(found)?
                }
                None => serde_json::to_string_pretty(&report)?,
            };
            write_or_print(&body, output)?;
        }
        Command::CheckLog { log, output } => {
            let summary = summarize_log_file(&log)?;
            for err in &summary.errors {
                eprintln!("{err}");
            }
            eprintln!(
                "{} lines, {} bad casts, {} missing-metadata reports, {} errors",
                summary.lines,
                summary.bad_casts,
                summary.missing_metadata,
                summary.errors.len()
            );
            write_or_print(&serde_json::to_string_pretty(&summary)?, output)?;
            if !summary.is_valid() {
                std::process::exit(1);
            }
        }
    }

    Ok(())
}
