use formsplit::cli::Cli;
use formsplit::config::{Config, ini_parser::IniConfig};
use std::fs;
use std::path::PathBuf;
use tempfile::TempDir;

fn bare_cli() -> Cli {
    Cli {
        input: None,
        output_dir: None,
        boundary: None,
        content_type: None,
        chunk_size: None,
        encoding: None,
        binary_mime_types: None,
        ignore_invalid_parts: None,
        overwrite: None,
        verbose: None,
        detailed_logging: None,
        config_file: None,
    }
}

#[test]
fn test_ini_parser_comments_and_whitespace() {
    let ini_content = r#"
; leading comment
   [decoder]
   chunk_size   =   1024   # trailing comment
encoding=latin1;another comment

# blank lines and comments between sections

[logging]
verbose=on
"#;

    let ini = IniConfig::parse(ini_content).expect("Failed to parse INI");
    assert_eq!(ini.get_usize("decoder", "chunk_size"), Some(1024));
    assert_eq!(ini.get_string("decoder", "encoding"), Some("latin1".to_string()));
    assert_eq!(ini.get_bool("logging", "verbose"), Some(true));
}

#[test]
fn test_ini_parser_sizes() {
    let ini = IniConfig::parse(
        "[decoder]\nmax_field_size = 2MB\nmax_headers_size = 512\nbroken = 12 parsecs\n",
    )
    .unwrap();
    assert_eq!(ini.get_size("decoder", "max_field_size"), Some(2 * 1024 * 1024));
    assert_eq!(ini.get_size("decoder", "max_headers_size"), Some(512));
    assert_eq!(ini.get_size("decoder", "broken"), None);
    assert_eq!(ini.get_u64("decoder", "max_headers_size"), Some(512));
}

#[test]
fn test_config_precedence_cli_highest() {
    let temp_dir = TempDir::new().unwrap();
    let config_file = temp_dir.path().join("formsplit.ini");
    fs::write(
        &config_file,
        "[decoder]\nchunk_size = 2048\nencoding = latin1\n[output]\ndirectory = from-ini\noverwrite = true\n",
    )
    .unwrap();

    let mut cli = bare_cli();
    cli.config_file = Some(config_file.to_string_lossy().to_string());
    cli.chunk_size = Some(512);
    cli.output_dir = Some(temp_dir.path().join("from-cli"));

    let config = Config::load(&cli).unwrap();
    assert_eq!(config.chunk_size, 512);
    assert_eq!(config.output_dir, temp_dir.path().join("from-cli"));
    // Values the CLI left alone come from the file
    assert_eq!(config.encoding, "latin1");
    assert!(config.overwrite);
}

#[test]
fn test_config_defaults() {
    let config = Config::from_sources(&bare_cli(), &IniConfig::new());
    assert_eq!(config.output_dir, PathBuf::from("formsplit-out"));
    assert_eq!(config.chunk_size, 4096);
    assert_eq!(config.binary_mime_types, vec!["application/octet-stream"]);

    let options = config.to_parser_options().unwrap();
    assert_eq!(options.chunk_size, 4096);
    assert_eq!(options.max_parts, 1000);
    assert!(!options.ignore_invalid_parts);
}

#[test]
fn test_config_file_load_error() {
    let temp_dir = TempDir::new().unwrap();
    let config_file = temp_dir.path().join("broken.ini");
    fs::write(&config_file, "[decoder\nchunk_size = 1\n").unwrap();

    let mut cli = bare_cli();
    cli.config_file = Some(config_file.to_string_lossy().to_string());
    let err = Config::load(&cli).unwrap_err();
    assert!(err.to_string().contains("line 1"));
}

#[test]
fn test_content_type_flag_supplies_boundary() {
    let mut cli = bare_cli();
    cli.content_type = Some("multipart/form-data; boundary=----abc".to_string());
    let config = Config::from_sources(&cli, &IniConfig::new());

    let options = config.to_parser_options().unwrap();
    assert_eq!(options.boundary.unwrap().as_str(), "----abc");
}
