//! CLI tool for inspecting and maintaining driftwood tables.

mod error;

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use clap::{Parser, Subcommand, ValueEnum};
use driftwood_core::config::WriteConfig;
use driftwood_core::records::parse_records;
use driftwood_core::{
    InstantTime, TableLocation, TableProperties, TableType, WriteClient, WriteOperationType,
};
use log::debug;
use snafu::ResultExt;
use tracing_subscriber::EnvFilter;

use crate::error::{
    CliResult, CreateTableSnafu, IngestSnafu, InvalidRangeSnafu, LoadConfigSnafu,
    OpenTableSnafu, ParseInputSnafu, ReadInputSnafu, ReadTableSnafu, TableServiceSnafu,
};

#[derive(Debug, Clone, Copy, ValueEnum)]
enum TableTypeArg {
    /// Copy-on-write: every write produces base files
    Cow,
    /// Merge-on-read: updates land in log files until compacted
    Mor,
}

impl From<TableTypeArg> for TableType {
    fn from(v: TableTypeArg) -> Self {
        match v {
            TableTypeArg::Cow => TableType::CopyOnWrite,
            TableTypeArg::Mor => TableType::MergeOnRead,
        }
    }
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum OperationArg {
    Insert,
    Upsert,
}

impl From<OperationArg> for WriteOperationType {
    fn from(v: OperationArg) -> Self {
        match v {
            OperationArg::Insert => WriteOperationType::Insert,
            OperationArg::Upsert => WriteOperationType::Upsert,
        }
    }
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Create an empty table
    Init {
        #[arg(long)]
        table: PathBuf,

        /// Table name (default: directory name)
        #[arg(long)]
        name: Option<String>,

        #[arg(long = "type", value_enum, default_value_t = TableTypeArg::Cow)]
        table_type: TableTypeArg,
    },

    /// Write a JSON-lines file of records as one commit
    Ingest {
        #[arg(long)]
        table: PathBuf,

        /// One `{"key", "partition", "value"}` object per line
        #[arg(long)]
        input: PathBuf,

        #[arg(long, value_enum, default_value_t = OperationArg::Upsert)]
        operation: OperationArg,

        /// Streaming writer identifier; records the batch as its checkpoint
        #[arg(long, requires = "batch")]
        writer: Option<String>,

        /// Batch id for --writer; already committed batches are skipped
        #[arg(long, requires = "writer")]
        batch: Option<String>,
    },

    /// List instants of the active timeline
    Timeline {
        #[arg(long)]
        table: PathBuf,

        /// Completed instants in <BEGIN>..<END> (begin exclusive, end
        /// inclusive; BEGIN may be empty)
        #[arg(long)]
        range: Option<String>,
    },

    /// Show the latest file slice of every file group in a partition
    Slices {
        #[arg(long)]
        table: PathBuf,

        /// Partition path (empty for the root partition)
        #[arg(long, default_value = "")]
        partition: String,
    },

    /// Print the last committed batch of a streaming writer
    Checkpoint {
        #[arg(long)]
        table: PathBuf,

        #[arg(long)]
        writer: String,
    },

    /// Compact log files into base files (merge-on-read tables)
    Compact {
        #[arg(long)]
        table: PathBuf,

        /// Only compact after this many delta commits since the last compaction
        #[arg(long, default_value_t = 1)]
        max_delta_commits: usize,
    },

    /// Rewrite the file groups of each partition into fewer, sorted groups
    Cluster {
        #[arg(long)]
        table: PathBuf,

        /// Only cluster after this many commits since the last clustering
        #[arg(long, default_value_t = 1)]
        max_commits: usize,

        #[arg(long, default_value_t = 100_000)]
        max_records_per_group: usize,
    },

    /// Move old completed instants to the archive
    Archive {
        #[arg(long)]
        table: PathBuf,

        #[arg(long, default_value_t = 20)]
        min_to_keep: usize,

        #[arg(long, default_value_t = 30)]
        max_to_keep: usize,
    },
}

#[derive(Debug, Parser)]
#[command(name = "driftwood", version)]
struct Cli {
    /// Writer config (JSON); fields not given keep their defaults
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// More logging (-v info, -vv debug); RUST_LOG applies otherwise
    #[arg(short, long, global = true, action = clap::ArgAction::Count)]
    verbose: u8,

    #[command(subcommand)]
    cmd: Command,
}

fn init_logging(verbose: u8) {
    let filter = match verbose {
        0 => EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")),
        1 => EnvFilter::new("info"),
        _ => EnvFilter::new("debug"),
    };
    // `init` also installs the bridge that forwards `log` records.
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

async fn load_config(path: Option<&Path>) -> CliResult<WriteConfig> {
    match path {
        Some(p) => WriteConfig::from_json_file(p).await.context(LoadConfigSnafu {
            path: p.display().to_string(),
        }),
        None => Ok(WriteConfig::default()),
    }
}

async fn open_table(table: &Path, config: WriteConfig) -> CliResult<WriteClient> {
    WriteClient::open(TableLocation::local(table), config)
        .await
        .context(OpenTableSnafu {
            table: table.display().to_string(),
        })
}

fn parse_range(range: &str) -> CliResult<(Option<InstantTime>, InstantTime)> {
    let invalid = || InvalidRangeSnafu {
        range: range.to_string(),
    };
    let (begin, end) = range.split_once("..").ok_or_else(|| invalid().build())?;
    let begin = match begin {
        "" => None,
        b => Some(InstantTime::parse(b).ok_or_else(|| invalid().build())?),
    };
    let end = InstantTime::parse(end).ok_or_else(|| invalid().build())?;
    Ok((begin, end))
}

async fn cmd_init(
    table: &Path,
    name: Option<String>,
    table_type: TableTypeArg,
    config: WriteConfig,
) -> CliResult<()> {
    let name = name.unwrap_or_else(|| {
        table
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "table".to_string())
    });
    let properties = TableProperties::new(name, table_type.into());
    WriteClient::init_table(TableLocation::local(table), properties, config)
        .await
        .context(CreateTableSnafu {
            table: table.display().to_string(),
        })?;

    println!("Created table at {}", table.display());
    Ok(())
}

async fn cmd_ingest(
    table: &Path,
    input: &Path,
    operation: OperationArg,
    checkpoint: Option<(String, String)>,
    config: WriteConfig,
) -> CliResult<()> {
    let input_name = input.display().to_string();
    let text = tokio::fs::read_to_string(input).await.context(ReadInputSnafu {
        path: input_name.clone(),
    })?;
    let records = parse_records(&input_name, &text).context(ParseInputSnafu { path: input_name })?;
    let count = records.len();
    debug!("parsed input file (records={count}, input={})", input.display());

    let mut client = open_table(table, config).await?;
    let ingest = IngestSnafu {
        table: table.display().to_string(),
    };
    let committed = match checkpoint {
        Some((writer, batch)) => client
            .write_streaming_batch(records, &writer, &batch)
            .await
            .context(ingest)?,
        None => Some(
            client
                .write_batch(records, operation.into(), BTreeMap::new())
                .await
                .context(ingest)?,
        ),
    };

    match committed {
        Some(instant) => println!("Committed instant {} ({count} records)", instant.timestamp()),
        None => println!("Batch already committed, skipped"),
    }
    Ok(())
}

async fn cmd_timeline(table: &Path, range: Option<String>, config: WriteConfig) -> CliResult<()> {
    let mut client = open_table(table, config).await?;
    let read = ReadTableSnafu {
        table: table.display().to_string(),
    };
    let timeline = match range {
        Some(range) => {
            let (begin, end) = parse_range(&range)?;
            client
                .get_instants_in_range(begin.as_ref(), &end)
                .await
                .context(read)?
        }
        None => client.reload().await.context(read)?.clone(),
    };

    for instant in &timeline {
        println!(
            "{}\t{}\t{}",
            instant.timestamp(),
            instant.action(),
            instant.state()
        );
    }
    Ok(())
}

async fn cmd_slices(table: &Path, partition: &str, config: WriteConfig) -> CliResult<()> {
    let mut client = open_table(table, config).await?;
    let slices = client
        .get_latest_file_slices(partition)
        .await
        .context(ReadTableSnafu {
            table: table.display().to_string(),
        })?;

    for slice in &slices {
        let base = slice
            .base_file
            .as_ref()
            .map_or("-", |b| b.path.as_str());
        println!(
            "{}\t{}\t{}\tlogs={}",
            slice.group.file_id,
            slice.base_instant,
            base,
            slice.log_files.len()
        );
    }
    if slices.is_empty() {
        eprintln!("No file groups in partition '{partition}'");
    }
    Ok(())
}

async fn cmd_checkpoint(table: &Path, writer: &str, config: WriteConfig) -> CliResult<()> {
    let mut client = open_table(table, config).await?;
    let checkpoint = client
        .latest_checkpoint(writer)
        .await
        .context(ReadTableSnafu {
            table: table.display().to_string(),
        })?;
    match checkpoint {
        Some(batch) => println!("{batch}"),
        None => println!("No checkpoint for writer '{writer}'"),
    }
    Ok(())
}

async fn cmd_compact(table: &Path, max_delta_commits: usize, config: WriteConfig) -> CliResult<()> {
    let mut client = open_table(table, config).await?;
    let service = || TableServiceSnafu {
        service: "Compaction",
        table: table.display().to_string(),
    };
    // Finish interrupted runs before planning a new one.
    let mut done = client
        .resume_pending_table_services()
        .await
        .context(service())?;
    done.extend(client.compact(max_delta_commits).await.context(service())?);
    print_service_result("compaction", &done);
    Ok(())
}

async fn cmd_cluster(
    table: &Path,
    max_commits: usize,
    max_records_per_group: usize,
    config: WriteConfig,
) -> CliResult<()> {
    let mut client = open_table(table, config).await?;
    let done = client
        .cluster(max_commits, max_records_per_group)
        .await
        .context(TableServiceSnafu {
            service: "Clustering",
            table: table.display().to_string(),
        })?;
    print_service_result("clustering", done.as_slice());
    Ok(())
}

async fn cmd_archive(
    table: &Path,
    min_to_keep: usize,
    max_to_keep: usize,
    config: WriteConfig,
) -> CliResult<()> {
    let config = config.with_archival(min_to_keep, max_to_keep);
    let mut client = open_table(table, config).await?;
    let archived = client.archive().await.context(TableServiceSnafu {
        service: "Archival",
        table: table.display().to_string(),
    })?;
    println!("Archived {} instants", archived.len());
    Ok(())
}

fn print_service_result(service: &str, completed: &[driftwood_core::Instant]) {
    if completed.is_empty() {
        println!("No {service} needed");
    }
    for instant in completed {
        println!("Completed {} {}", instant.action(), instant.timestamp());
    }
}

async fn run() -> CliResult<()> {
    let cli = Cli::parse();
    init_logging(cli.verbose);
    let config = load_config(cli.config.as_deref()).await?;

    match cli.cmd {
        Command::Init {
            table,
            name,
            table_type,
        } => cmd_init(&table, name, table_type, config).await,

        Command::Ingest {
            table,
            input,
            operation,
            writer,
            batch,
        } => {
            let checkpoint = writer.zip(batch);
            cmd_ingest(&table, &input, operation, checkpoint, config).await
        }

        Command::Timeline { table, range } => cmd_timeline(&table, range, config).await,

        Command::Slices { table, partition } => cmd_slices(&table, &partition, config).await,

        Command::Checkpoint { table, writer } => cmd_checkpoint(&table, &writer, config).await,

        Command::Compact {
            table,
            max_delta_commits,
        } => cmd_compact(&table, max_delta_commits, config).await,

        Command::Cluster {
            table,
            max_commits,
            max_records_per_group,
        } => cmd_cluster(&table, max_commits, max_records_per_group, config).await,

        Command::Archive {
            table,
            min_to_keep,
            max_to_keep,
        } => cmd_archive(&table, min_to_keep, max_to_keep, config).await,
    }
}

#[tokio::main]
async fn main() {
    if let Err(e) = run().await {
        eprintln!("{e}");
        std::process::exit(1);
    }
}
