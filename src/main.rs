use std::path::{Path, PathBuf};

use anyhow::{Context as _, bail};
use clap::{Parser, Subcommand};
use serde::Serialize;
use sqlreplay::{
    config::Config,
    logging,
    store::{self, RecordingStore},
};

#[derive(Debug, Parser)]
#[command(name = "sqlreplay", about = "Inspect and maintain sqlreplay recording files")]
struct Cli {
    /// Optional path to config TOML. If omitted, default discovery is used.
    #[arg(long, global = true)]
    config: Option<PathBuf>,
    /// Override log level (trace, debug, info, warn, error, off).
    #[arg(long, global = true)]
    log_level: Option<String>,
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand, Clone, PartialEq, Eq)]
enum Command {
    /// List recordings with their record counts.
    List {
        /// Recording file; defaults to `recording.path` from config.
        file: Option<PathBuf>,
        /// Print JSON instead of text.
        #[arg(long)]
        json: bool,
    },
    /// Print the records of one recording.
    Show {
        file: PathBuf,
        name: String,
    },
    /// Delete a recording and drop records nothing else uses.
    Remove {
        file: PathBuf,
        name: String,
    },
    /// Rewrite a recording file with shared, compactly numbered records.
    Compact {
        file: Option<PathBuf>,
    },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
struct RecordingSummary {
    name: String,
    records: usize,
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum CommandOutcome {
    Listed {
        recordings: Vec<RecordingSummary>,
        json: bool,
    },
    Shown {
        lines: Vec<String>,
    },
    Removed {
        name: String,
        file: PathBuf,
    },
    Compacted {
        file: PathBuf,
        records_before: usize,
        records_after: usize,
    },
}

fn resolve_file(config: &Config, file: Option<PathBuf>) -> PathBuf {
    file.unwrap_or_else(|| config.recording.path.clone())
}

fn load_store(config: &Config, file: &Path) -> anyhow::Result<RecordingStore> {
    let mut store =
        RecordingStore::open(file).with_max_size(config.recording.max_recording_size);
    store
        .parse()
        .with_context(|| format!("parse recording file {}", file.display()))?;
    Ok(store)
}

fn run_command(config: &Config, command: Command) -> anyhow::Result<CommandOutcome> {
    match command {
        Command::List { file, json } => {
            let file = resolve_file(config, file);
            let mut store = load_store(config, &file)?;
            let mut recordings = Vec::new();
            for name in store.recording_names() {
                let records = store
                    .recording(&name)
                    .with_context(|| format!("decode recording `{name}`"))?
                    .map_or(0, |recording| recording.len());
                recordings.push(RecordingSummary { name, records });
            }
            Ok(CommandOutcome::Listed { recordings, json })
        }
        Command::Show { file, name } => {
            let mut store = load_store(config, &file)?;
            let Some(recording) = store
                .recording(&name)
                .with_context(|| format!("decode recording `{name}`"))?
            else {
                bail!("recording `{name}` was not found in {}", file.display());
            };
            let lines = recording
                .iter()
                .enumerate()
                .map(|(index, record)| {
                    store::format_record_decl(record)
                        .map(|decl| format!("{}\t{decl}", index + 1))
                        .with_context(|| format!("format record {}", index + 1))
                })
                .collect::<anyhow::Result<Vec<_>>>()?;
            Ok(CommandOutcome::Shown { lines })
        }
        Command::Remove { file, name } => {
            let mut store = load_store(config, &file)?;
            if !store.remove_recording(&name) {
                bail!("recording `{name}` was not found in {}", file.display());
            }
            store
                .write()
                .with_context(|| format!("write recording file {}", file.display()))?;
            Ok(CommandOutcome::Removed { name, file })
        }
        Command::Compact { file } => {
            let file = resolve_file(config, file);
            let mut store = load_store(config, &file)?;
            let records_before = store.record_count();
            store
                .write()
                .with_context(|| format!("write recording file {}", file.display()))?;
            Ok(CommandOutcome::Compacted {
                file,
                records_before,
                records_after: store.record_count(),
            })
        }
    }
}

fn print_command_outcome(outcome: CommandOutcome) -> anyhow::Result<()> {
    match outcome {
        CommandOutcome::Listed { recordings, json } => {
            if json {
                println!(
                    "{}",
                    serde_json::to_string_pretty(&recordings).context("serialize recordings")?
                );
            } else {
                for recording in recordings {
                    println!("{}\t{}", recording.name, recording.records);
                }
            }
        }
        CommandOutcome::Shown { lines } => {
            for line in lines {
                println!("{line}");
            }
        }
        CommandOutcome::Removed { name, file } => {
            println!("removed recording `{name}` from {}", file.display());
        }
        CommandOutcome::Compacted {
            file,
            records_before,
            records_after,
        } => {
            println!(
                "compacted {}: {records_before} -> {records_after} records",
                file.display()
            );
        }
    }
    Ok(())
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let config = Config::load(cli.config.as_deref())?;
    config.apply()?;
    logging::init(&config, cli.log_level.as_deref())?;

    let outcome = run_command(&config, cli.command)?;
    print_command_outcome(outcome)
}
