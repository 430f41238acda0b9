//! Configuration management for formsplit
//! Supports INI files with CLI argument overrides

pub mod ini_parser;

use crate::cli::Cli;
use crate::error::{MultipartError, Result};
use crate::multipart::{
    Boundary, DEFAULT_BINARY_MIME_TYPE, DEFAULT_MAX_FIELD_SIZE, DEFAULT_MAX_HEADERS_SIZE,
    DEFAULT_MAX_PARTS, ParserOptions, encoding_for_label,
};
use crate::reader::DEFAULT_CHUNK_SIZE;
use crate::upload::format_bytes;
use ini_parser::IniConfig;
use std::path::{Path, PathBuf};

pub const DEFAULT_OUTPUT_DIR: &str = "formsplit-out";
pub const DEFAULT_ENCODING: &str = "utf-8";

#[derive(Debug, Clone, PartialEq)]
pub struct Config {
    // Input
    pub input: Option<PathBuf>,
    pub boundary: Option<String>,
    pub content_type: Option<String>,

    // Decoder settings
    pub chunk_size: usize,
    pub encoding: String,
    pub binary_mime_types: Vec<String>,
    pub ignore_invalid_parts: bool,
    pub max_parts: usize,
    pub max_field_size: u64,
    pub max_headers_size: usize,

    // Output settings
    pub output_dir: PathBuf,
    pub overwrite: bool,

    // Logging settings
    pub verbose: bool,
    pub detailed_logging: bool,
}

impl Config {
    /// Load configuration with precedence: CLI args > INI file > Defaults
    pub fn load(cli: &Cli) -> Result<Self> {
        let ini = match Self::find_config_file(cli)? {
            Some(path) => {
                log::info!("Loading configuration from: {}", path.display());
                IniConfig::load_file(&path)?
            }
            None => {
                log::info!("No configuration file found, using defaults and CLI overrides");
                IniConfig::new()
            }
        };
        Ok(Self::from_sources(cli, &ini))
    }

    /// Merges CLI arguments over an already parsed INI file
    pub fn from_sources(cli: &Cli, ini: &IniConfig) -> Self {
        Self {
            input: cli.input.clone(),
            boundary: cli
                .boundary
                .clone()
                .or_else(|| ini.get_string("decoder", "boundary")),
            content_type: cli.content_type.clone(),

            chunk_size: cli
                .chunk_size
                .or_else(|| ini.get_usize("decoder", "chunk_size"))
                .unwrap_or(DEFAULT_CHUNK_SIZE),
            encoding: cli
                .encoding
                .clone()
                .or_else(|| ini.get_string("decoder", "encoding"))
                .unwrap_or_else(|| DEFAULT_ENCODING.to_string()),
            binary_mime_types: Self::get_binary_mime_types(ini, cli),
            ignore_invalid_parts: cli
                .ignore_invalid_parts
                .or_else(|| ini.get_bool("decoder", "ignore_invalid_parts"))
                .unwrap_or(false),
            max_parts: ini
                .get_usize("decoder", "max_parts")
                .unwrap_or(DEFAULT_MAX_PARTS),
            max_field_size: ini
                .get_size("decoder", "max_field_size")
                .unwrap_or(DEFAULT_MAX_FIELD_SIZE),
            max_headers_size: ini
                .get_size("decoder", "max_headers_size")
                .and_then(|size| usize::try_from(size).ok())
                .unwrap_or(DEFAULT_MAX_HEADERS_SIZE),

            output_dir: cli
                .output_dir
                .clone()
                .or_else(|| ini.get_string("output", "directory").map(PathBuf::from))
                .unwrap_or_else(|| PathBuf::from(DEFAULT_OUTPUT_DIR)),
            overwrite: cli
                .overwrite
                .or_else(|| ini.get_bool("output", "overwrite"))
                .unwrap_or(false),

            verbose: cli
                .verbose
                .or_else(|| ini.get_bool("logging", "verbose"))
                .unwrap_or(false),
            detailed_logging: cli
                .detailed_logging
                .or_else(|| ini.get_bool("logging", "detailed"))
                .unwrap_or(false),
        }
    }

    /// Find configuration file in order of preference
    fn find_config_file(cli: &Cli) -> Result<Option<PathBuf>> {
        // 1. Explicit --config-file
        if let Some(ref config_path) = cli.config_file {
            let path = PathBuf::from(config_path);
            if path.exists() {
                return Ok(Some(path));
            }
            return Err(MultipartError::invalid_configuration(format!(
                "Config file specified but not found: {config_path}"
            )));
        }

        // 2. Current directory
        let current_config = PathBuf::from("formsplit.ini");
        if current_config.exists() {
            return Ok(Some(current_config));
        }

        // 3. User config directory (~/.config/formsplit/config.ini)
        if let Some(home_dir) = std::env::var_os("HOME") {
            let user_config = Path::new(&home_dir)
                .join(".config")
                .join("formsplit")
                .join("config.ini");
            if user_config.exists() {
                return Ok(Some(user_config));
            }
        }

        // 4. System config (Unix-like systems)
        #[cfg(unix)]
        {
            let system_config = PathBuf::from("/etc/formsplit/config.ini");
            if system_config.exists() {
                return Ok(Some(system_config));
            }
        }

        Ok(None)
    }

    fn get_binary_mime_types(ini: &IniConfig, cli: &Cli) -> Vec<String> {
        if let Some(ref types) = cli.binary_mime_types {
            return types
                .split(',')
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty())
                .collect();
        }

        let ini_types = ini.get_list("decoder", "binary_mime_types");
        if !ini_types.is_empty() {
            return ini_types;
        }

        vec![DEFAULT_BINARY_MIME_TYPE.to_string()]
    }

    /// Boundary from `boundary`, else from `content_type`, else left to detection
    pub fn resolve_boundary(&self) -> Result<Option<Boundary>> {
        if let Some(ref boundary) = self.boundary {
            return Boundary::new(boundary).map(Some);
        }
        match self.content_type {
            Some(ref content_type) => Boundary::from_content_type(content_type).map(Some),
            None => Ok(None),
        }
    }

    /// Builds and validates decoder options
    pub fn to_parser_options(&self) -> Result<ParserOptions> {
        let options = ParserOptions {
            boundary: self.resolve_boundary()?,
            encoding: encoding_for_label(&self.encoding)?,
            chunk_size: self.chunk_size,
            binary_mime_types: self.binary_mime_types.clone(),
            ignore_invalid_parts: self.ignore_invalid_parts,
            max_parts: self.max_parts,
            max_field_size: self.max_field_size,
            max_headers_size: self.max_headers_size,
        };
        options.validate()?;
        Ok(options)
    }

    /// Print configuration summary
    pub fn print_summary(&self) {
        log::info!("Configuration Summary:");
        match self.input {
            Some(ref input) => log::info!("  Input: {}", input.display()),
            None => log::info!("  Input: <stdin>"),
        }
        match (&self.boundary, &self.content_type) {
            (Some(boundary), _) => log::info!("  Boundary: {boundary}"),
            (None, Some(content_type)) => log::info!("  Content-Type: {content_type}"),
            (None, None) => log::info!("  Boundary: detected from body"),
        }
        log::info!("  Chunk Size: {} bytes", self.chunk_size);
        log::info!("  Encoding: {}", self.encoding);
        log::info!("  Binary MIME Types: {:?}", self.binary_mime_types);
        log::info!("  Ignore Invalid Parts: {}", self.ignore_invalid_parts);
        log::info!("  Max Parts: {}", self.max_parts);
        log::info!("  Max Field Size: {}", format_bytes(self.max_field_size));
        log::info!(
            "  Max Headers Size: {}",
            format_bytes(self.max_headers_size as u64)
        );
        log::info!("  Output Directory: {}", self.output_dir.display());
        log::info!("  Overwrite: {}", self.overwrite);
        log::info!("  Verbose Logging: {}", self.verbose);
        log::info!("  Detailed Logging: {}", self.detailed_logging);
    }
}
