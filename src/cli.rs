use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};

#[derive(Debug, Parser)]
#[command(author, version, about = "Import and export Data Desktop datasets as CSV", long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Debug, Subcommand)]
pub enum Commands {
    /// Write a blank CSV template for a dataset schema
    Template(TemplateArgs),
    /// Check that a CSV file has a column for every schema field
    Validate(ValidateArgs),
    /// Parse a CSV file into typed records, resolving relation fields
    Import(ImportArgs),
    /// Export stored records (a JSON array) as CSV
    Export(ExportArgs),
}

#[derive(Debug, Args)]
pub struct TemplateArgs {
    /// Dataset schema (YAML)
    #[arg(short, long)]
    pub schema: PathBuf,
    /// Output file or directory (stdout if omitted)
    #[arg(short = 'o', long = "output")]
    pub output: Option<PathBuf>,
}

#[derive(Debug, Args)]
pub struct ValidateArgs {
    /// Dataset schema (YAML)
    #[arg(short, long)]
    pub schema: PathBuf,
    /// CSV file to check (`-` for stdin)
    #[arg(short = 'i', long = "input")]
    pub input: PathBuf,
    /// Data rows to read while checking headers
    #[arg(long, default_value_t = crate::import::DEFAULT_PREVIEW_ROWS)]
    pub preview_rows: usize,
    /// Character encoding of the input file (defaults to utf-8)
    #[arg(long = "input-encoding")]
    pub input_encoding: Option<String>,
}

#[derive(Debug, Args)]
pub struct ImportArgs {
    /// Dataset schema (YAML)
    #[arg(short, long)]
    pub schema: PathBuf,
    /// CSV file to import (`-` for stdin)
    #[arg(short = 'i', long = "input")]
    pub input: PathBuf,
    /// Directory holding `<dataset>.json` files for relation fields
    #[arg(long = "related-dir")]
    pub related_dir: Option<PathBuf>,
    /// JSON-lines file receiving the processed rows (stdout if omitted)
    #[arg(short = 'o', long = "output")]
    pub output: Option<PathBuf>,
    /// Write the import issues as JSON to this file
    #[arg(long)]
    pub report: Option<PathBuf>,
    /// Rows submitted per chunk
    #[arg(long, default_value_t = crate::submit::DEFAULT_CHUNK_SIZE)]
    pub chunk_size: usize,
    /// Pause between chunks in milliseconds
    #[arg(long = "chunk-delay-ms", default_value_t = 10)]
    pub chunk_delay_ms: u64,
    /// Skip header validation before parsing
    #[arg(long)]
    pub skip_validation: bool,
    /// Character encoding of the input file (defaults to utf-8)
    #[arg(long = "input-encoding")]
    pub input_encoding: Option<String>,
}

#[derive(Debug, Args)]
pub struct ExportArgs {
    /// Dataset schema (YAML)
    #[arg(short, long)]
    pub schema: PathBuf,
    /// JSON array of stored records
    #[arg(short = 'i', long = "input")]
    pub input: PathBuf,
    /// Output CSV file (stdout if omitted)
    #[arg(short = 'o', long = "output")]
    pub output: Option<PathBuf>,
    /// Restrict output to this comma-separated list of field keys
    #[arg(short = 'C', long = "columns", value_delimiter = ',')]
    pub columns: Vec<String>,
}
