pub mod cli;
pub mod coerce;
pub mod error;
pub mod export;
pub mod import;
pub mod io_utils;
pub mod relation;
pub mod schema;
pub mod source;
pub mod submit;
pub mod value;

use std::{
    env,
    fs::File,
    io::{BufWriter, Write},
    sync::OnceLock,
    time::Duration,
};

use anyhow::{Context, Result, bail};
use clap::Parser;
use log::{LevelFilter, debug, info, warn};

use crate::{
    cli::{Cli, Commands},
    import::ImportOptions,
    schema::DatasetSchema,
    source::{InMemorySource, JsonDirectorySource, RecordSource},
    submit::{JsonLinesSink, SubmitOptions},
};

static LOGGER: OnceLock<()> = OnceLock::new();

fn init_logging() {
    LOGGER.get_or_init(|| {
        let mut builder = env_logger::Builder::from_env(env_logger::Env::default());
        if env::var("RUST_LOG").is_err() {
            builder.filter_module("data_desktop_import", LevelFilter::Info);
        }
        let _ = builder.format_timestamp_millis().try_init();
    });
}

pub fn run() -> Result<()> {
    init_logging();
    let cli = Cli::parse();
    match cli.command {
        Commands::Template(args) => handle_template(&args),
        Commands::Validate(args) => handle_validate(&args),
        Commands::Import(args) => handle_import(&args),
        Commands::Export(args) => handle_export(&args),
    }
}

fn load_schema(path: &std::path::Path) -> Result<DatasetSchema> {
    DatasetSchema::load(path).with_context(|| format!("Loading schema from {path:?}"))
}

fn handle_template(args: &cli::TemplateArgs) -> Result<()> {
    let schema = load_schema(&args.schema)?;
    let template = import::create_csv_template(&schema.fields)
        .with_context(|| format!("Building template for '{}'", schema.id))?;
    let destination = args.output.as_ref().map(|path| {
        if path.is_dir() {
            path.join(import::template_file_name(&schema.id))
        } else {
            path.clone()
        }
    });
    io_utils::write_output(destination.as_deref(), &template)?;
    info!(
        "Template for '{}' with {} field(s) written to {}",
        schema.id,
        schema.fields.len(),
        destination
            .map(|path| format!("{path:?}"))
            .unwrap_or_else(|| "stdout".to_string())
    );
    Ok(())
}

fn handle_validate(args: &cli::ValidateArgs) -> Result<()> {
    let schema = load_schema(&args.schema)?;
    let options = ImportOptions {
        preview_rows: args.preview_rows,
        encoding: io_utils::resolve_encoding(args.input_encoding.as_deref())?,
        ..ImportOptions::default()
    };
    let bytes = io_utils::read_input(&args.input)?;
    let result = import::validate_csv(&bytes, &schema.field_keys(), &options)
        .with_context(|| format!("Validating {:?}", args.input))?;
    if !result.is_valid {
        bail!(
            "Missing required columns: {}",
            result.missing_fields.join(", ")
        );
    }
    info!("✓ {:?} has every column of '{}'", args.input, schema.id);
    Ok(())
}

fn handle_import(args: &cli::ImportArgs) -> Result<()> {
    let schema = load_schema(&args.schema)?;
    let options = ImportOptions {
        encoding: io_utils::resolve_encoding(args.input_encoding.as_deref())?,
        ..ImportOptions::default()
    };
    let bytes = io_utils::read_input(&args.input)?;

    if args.skip_validation {
        debug!("Header validation skipped");
    } else {
        let validation = import::validate_csv(&bytes, &schema.field_keys(), &options)
            .with_context(|| format!("Validating {:?}", args.input))?;
        if !validation.is_valid {
            bail!(
                "CSV validation failed. Missing required columns: {}",
                validation.missing_fields.join(", ")
            );
        }
    }

    let source: Box<dyn RecordSource> = match &args.related_dir {
        Some(dir) => Box::new(JsonDirectorySource::new(dir)),
        None => {
            if !schema.relation_fields().is_empty() {
                warn!("No --related-dir given; relation fields will keep their raw values");
            }
            Box::new(InMemorySource::new())
        }
    };
    let report = import::parse_csv(&bytes, &schema.fields, source.as_ref(), &options)
        .with_context(|| format!("Parsing {:?}", args.input))?;

    if let Some(path) = &args.report {
        let file =
            File::create(path).with_context(|| format!("Creating report file {path:?}"))?;
        let mut writer = BufWriter::new(file);
        serde_json::to_writer_pretty(&mut writer, &report.issues)
            .context("Writing import report JSON")?;
        writer.flush().context("Flushing import report")?;
    }

    let writer: Box<dyn Write> = match &args.output {
        Some(path) if !io_utils::is_dash(path) => Box::new(BufWriter::new(
            File::create(path).with_context(|| format!("Creating output file {path:?}"))?,
        )),
        _ => Box::new(std::io::stdout()),
    };
    let mut sink = JsonLinesSink::new(writer);
    let submit_options = SubmitOptions {
        chunk_size: args.chunk_size,
        chunk_delay: Duration::from_millis(args.chunk_delay_ms),
    };
    let stats = submit::submit_in_chunks(
        &mut sink,
        &schema.id,
        &report.rows,
        submit_options,
        |progress| debug!("Import progress: {}%", progress.percent_complete()),
    );

    info!(
        "Imported {} of {} record(s) into '{}' with {} issue(s)",
        stats.succeeded,
        stats.total,
        schema.id,
        report.issues.len()
    );
    if stats.failed > 0 {
        bail!(
            "{} record(s) failed to import: {}",
            stats.failed,
            stats.errors.join("; ")
        );
    }
    Ok(())
}

fn handle_export(args: &cli::ExportArgs) -> Result<()> {
    let schema = load_schema(&args.schema)?;
    let records = source::load_records(&args.input)?;
    let visible = (!args.columns.is_empty()).then_some(args.columns.as_slice());
    let csv = export::export_csv(&records, &schema.fields, visible)
        .with_context(|| format!("Exporting {:?}", args.input))?;
    io_utils::write_output(args.output.as_deref(), &csv)?;
    info!(
        "Exported {} record(s) of '{}' to {}",
        records.len(),
        schema.id,
        args.output
            .as_ref()
            .map(|path| format!("{path:?}"))
            .unwrap_or_else(|| "stdout".to_string())
    );
    Ok(())
}
