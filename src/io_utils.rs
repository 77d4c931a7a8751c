//! I/O utilities for CSV reading, writing, and encoding.
//!
//! All CSV tokenization in the crate flows through this module:
//!
//! - **Encoding**: input decoding via `encoding_rs`, defaulting to UTF-8, with
//!   any byte-order mark removed.
//! - **Reader/writer construction**: `open_csv_reader` tolerates ragged rows;
//!   writers quote only when needed unless asked otherwise.
//! - **Headers**: header cells are normalized (trimmed, lower-cased) before any
//!   comparison against field keys.
//! - **stdin/stdout**: the `-` path convention routes through standard streams.

use std::{
    fs::File,
    io::{BufWriter, Read, Write},
    path::Path,
};

use anyhow::{Context, anyhow};
use csv::QuoteStyle;
use encoding_rs::{Encoding, UTF_8};

use crate::error::{ImportError, Result};

pub fn is_dash(path: &Path) -> bool {
    path == Path::new("-")
}

pub fn resolve_encoding(label: Option<&str>) -> anyhow::Result<&'static Encoding> {
    if let Some(value) = label {
        Encoding::for_label(value.trim().as_bytes())
            .ok_or_else(|| anyhow!("Unknown encoding '{value}'"))
    } else {
        Ok(UTF_8)
    }
}

pub fn read_input(path: &Path) -> anyhow::Result<Vec<u8>> {
    let mut buf = Vec::new();
    if is_dash(path) {
        std::io::stdin()
            .lock()
            .read_to_end(&mut buf)
            .context("Reading CSV from stdin")?;
    } else {
        File::open(path)
            .with_context(|| format!("Opening input file {path:?}"))?
            .read_to_end(&mut buf)
            .with_context(|| format!("Reading input file {path:?}"))?;
    }
    Ok(buf)
}

pub fn write_output(path: Option<&Path>, contents: &str) -> anyhow::Result<()> {
    let mut writer: Box<dyn Write> = match path {
        Some(p) if !is_dash(p) => Box::new(BufWriter::new(
            File::create(p).with_context(|| format!("Creating output file {p:?}"))?,
        )),
        _ => Box::new(std::io::stdout()),
    };
    writer
        .write_all(contents.as_bytes())
        .context("Writing output")?;
    writer.flush().context("Flushing output")
}

/// Decodes raw file bytes into text, dropping a leading byte-order mark.
pub fn decode_input(bytes: &[u8], encoding: &'static Encoding) -> Result<String> {
    let (text, _, had_errors) = encoding.decode(bytes);
    if had_errors {
        return Err(ImportError::Decode {
            encoding: encoding.name(),
        });
    }
    Ok(text.trim_start_matches('\u{feff}').to_string())
}

pub fn open_csv_reader<R>(reader: R, has_headers: bool) -> csv::Reader<R>
where
    R: Read,
{
    let mut builder = csv::ReaderBuilder::new();
    builder
        .has_headers(has_headers)
        .double_quote(true)
        .flexible(true);
    builder.from_reader(reader)
}

pub fn csv_writer(quote_style: QuoteStyle) -> csv::Writer<Vec<u8>> {
    let mut builder = csv::WriterBuilder::new();
    builder.quote_style(quote_style).double_quote(true);
    builder.from_writer(Vec::new())
}

pub fn finish_writer(writer: csv::Writer<Vec<u8>>) -> Result<String> {
    let bytes = writer
        .into_inner()
        .map_err(|err| ImportError::Io(err.into_error()))?;
    String::from_utf8(bytes).map_err(|_| ImportError::Decode {
        encoding: UTF_8.name(),
    })
}

pub fn normalize_header(header: &str) -> String {
    header.trim().to_lowercase()
}

pub fn reader_headers<R>(reader: &mut csv::Reader<R>) -> Result<Vec<String>>
where
    R: Read,
{
    Ok(reader.headers()?.iter().map(normalize_header).collect())
}

/// Returns the 1-based line on which a quoted field is opened but never
/// closed, if any. The CSV reader silently swallows the rest of the file in
/// that situation, so the check runs on the decoded text up front.
pub fn find_unclosed_quote(text: &str) -> Option<usize> {
    let mut line = 1usize;
    let mut in_quotes = false;
    let mut opened_at = 0usize;
    let mut at_field_start = true;
    let mut chars = text.chars().peekable();
    while let Some(c) = chars.next() {
        if in_quotes {
            match c {
                '"' if chars.peek() == Some(&'"') => {
                    chars.next();
                }
                '"' => in_quotes = false,
                '\n' => line += 1,
                _ => {}
            }
            continue;
        }
        match c {
            '"' if at_field_start => {
                in_quotes = true;
                opened_at = line;
                at_field_start = false;
            }
            ',' => at_field_start = true,
            '\n' => {
                line += 1;
                at_field_start = true;
            }
            '\r' => {}
            _ => at_field_start = false,
        }
    }
    in_quotes.then_some(opened_at)
}
