use crate::error::{MultipartError, Result};
use crate::multipart::{Boundary, encoding_for_label};
use clap::Parser;
use log::warn;
use std::path::PathBuf;

// Every option is optional so configuration loading can tell an explicit flag
// from a default and let the INI file fill the gaps.
#[derive(Parser, Clone, Debug)]
#[command(
    version,
    about = "Split a multipart/form-data body into text fields and files on disk.",
    long_about = "Reads a multipart/form-data request body from a file or standard input and splits it into parts.\n Text fields are printed as name=value lines, file parts are streamed to the output directory without buffering the whole body.\n The boundary is taken from --boundary, from a Content-Type value given with --content-type, or detected from the first line of the body.\n Parts with a filename, or whose media type matches --binary-mime-types, are treated as files."
)]
pub struct Cli {
    /// Body to read; standard input when omitted
    #[arg(short, long)]
    pub input: Option<PathBuf>,

    /// Directory that receives file parts
    #[arg(short, long)]
    pub output_dir: Option<PathBuf>,

    /// Multipart boundary, without the leading dashes
    #[arg(short, long, value_parser = validate_boundary)]
    pub boundary: Option<String>,

    /// Full Content-Type header value, e.g. "multipart/form-data; boundary=XYZ"
    #[arg(long)]
    pub content_type: Option<String>,

    /// Bytes requested from the input per read
    #[arg(short, long, value_parser = validate_chunk_size)]
    pub chunk_size: Option<usize>,

    /// Encoding of part headers and text fields (utf-8, latin1, windows-1252, ...)
    #[arg(short, long, value_parser = validate_encoding)]
    pub encoding: Option<String>,

    /// Media types treated as files without a filename (comma-separated, supports wildcards like image/*)
    #[arg(long)]
    pub binary_mime_types: Option<String>,

    /// Skip parts with malformed headers instead of stopping
    #[arg(long)]
    pub ignore_invalid_parts: Option<bool>,

    /// Replace existing files in the output directory instead of renaming
    #[arg(long)]
    pub overwrite: Option<bool>,

    /// Enable verbose logging (log level: debug)
    #[arg(short, long)]
    pub verbose: Option<bool>,

    /// Enable more detailed logging (log level: info if verbose=false)
    #[arg(long)]
    pub detailed_logging: Option<bool>,

    /// Configuration file path (INI format). If not provided, looks for formsplit.ini in the current directory or ~/.config/formsplit/config.ini
    #[arg(long, value_parser = validate_config_file)]
    pub config_file: Option<String>,
}

fn validate_boundary(s: &str) -> std::result::Result<String, String> {
    Boundary::new(s).map_err(|e| e.to_string())?;
    Ok(s.to_string())
}

/// Chunk sizes below 64 bytes cannot hold a delimiter line of any useful boundary
fn validate_chunk_size(s: &str) -> std::result::Result<usize, String> {
    let size: usize = s
        .parse()
        .map_err(|_| "Chunk size must be a positive number".to_string())?;

    if size < 64 {
        return Err("Chunk size must be at least 64 bytes".to_string());
    }

    if size > 16 * 1024 * 1024 {
        return Err("Chunk size must not exceed 16 MB".to_string());
    }

    Ok(size)
}

fn validate_encoding(s: &str) -> std::result::Result<String, String> {
    let encoding = encoding_for_label(s).map_err(|e| e.to_string())?;
    if !encoding.is_ascii_compatible() {
        return Err(format!("Encoding {} is not ASCII-compatible", encoding.name()));
    }
    Ok(s.to_string())
}

/// Validate config file path exists and is readable
fn validate_config_file(s: &str) -> std::result::Result<String, String> {
    if s.is_empty() {
        return Err("Config file path cannot be empty".to_string());
    }

    let path = PathBuf::from(s);

    if !path.exists() {
        return Err(format!("Config file does not exist: {s}"));
    }

    if !path.is_file() {
        return Err(format!("Config path is not a file: {s}"));
    }

    match std::fs::File::open(&path) {
        Ok(_) => Ok(s.to_string()),
        Err(e) => Err(format!("Cannot read config file {s}: {e}")),
    }
}

impl Cli {
    /// Validate the CLI arguments for consistency
    pub fn validate(&self) -> Result<()> {
        if let Some(ref input) = self.input {
            if !input.is_file() {
                return Err(MultipartError::invalid_configuration(format!(
                    "Input is not a readable file: {}",
                    input.display()
                )));
            }
        }

        if let Some(ref content_type) = self.content_type {
            let from_header = Boundary::from_content_type(content_type)?;
            if let Some(ref boundary) = self.boundary {
                if boundary != from_header.as_str() {
                    warn!(
                        "--boundary {boundary} overrides the boundary {from_header} from --content-type"
                    );
                }
            }
        }

        if let Some(ref output_dir) = self.output_dir {
            if output_dir.exists() && !output_dir.is_dir() {
                return Err(MultipartError::invalid_configuration(format!(
                    "Output path is not a directory: {}",
                    output_dir.display()
                )));
            }
        }

        Ok(())
    }
}
