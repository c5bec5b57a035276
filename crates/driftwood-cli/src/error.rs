use driftwood_core::TableError;
use driftwood_core::config::ConfigError;
use driftwood_core::records::RecordError;

use snafu::Snafu;

pub type CliResult<T> = std::result::Result<T, CliError>;

#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum CliError {
    #[snafu(display("Failed to load writer config from {path}: {source}"))]
    LoadConfig { path: String, source: ConfigError },

    #[snafu(display("Input file not found or not readable: {path}"))]
    ReadInput {
        path: String,
        source: std::io::Error,
    },

    #[snafu(display("Input file {path} is not valid JSON lines: {source}"))]
    ParseInput { path: String, source: RecordError },

    #[snafu(display(
        "Invalid --range '{range}': expected <BEGIN>..<END> with 17-digit instant times"
    ))]
    InvalidRange { range: String },

    #[snafu(display(
        "Failed to create table at {table}. \
         Ensure the directory is writable and holds no table yet."
    ))]
    CreateTable {
        table: String,
        #[snafu(source(from(TableError, Box::new)))]
        source: Box<TableError>,
    },

    #[snafu(display(
        "Failed to open table at {table}. \
         Ensure it was created with `driftwood init`."
    ))]
    OpenTable {
        table: String,
        #[snafu(source(from(TableError, Box::new)))]
        source: Box<TableError>,
    },

    #[snafu(display("Write to table {table} failed: {source}"))]
    Ingest {
        table: String,
        #[snafu(source(from(TableError, Box::new)))]
        source: Box<TableError>,
    },

    #[snafu(display("Reading table {table} failed: {source}"))]
    ReadTable {
        table: String,
        #[snafu(source(from(TableError, Box::new)))]
        source: Box<TableError>,
    },

    #[snafu(display("{service} on table {table} failed: {source}"))]
    TableService {
        service: &'static str,
        table: String,
        #[snafu(source(from(TableError, Box::new)))]
        source: Box<TableError>,
    },
}
