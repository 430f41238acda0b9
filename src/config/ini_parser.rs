//! Minimal INI reader for formsplit configuration files
//! Sections, `key = value` pairs, `#`/`;` comments, quoted values

use crate::error::{MultipartError, Result};
use std::collections::HashMap;
use std::fs;
use std::path::Path;

#[derive(Debug, Clone, Default)]
pub struct IniConfig {
    sections: HashMap<String, HashMap<String, String>>,
}

impl IniConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Load configuration from file
    pub fn load_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let content = fs::read_to_string(path).map_err(|e| {
            MultipartError::invalid_configuration(format!(
                "Failed to read config file {}: {e}",
                path.display()
            ))
        })?;
        Self::parse(&content)
    }

    /// Parse INI content from string. Keys before the first section land in
    /// the unnamed section `""`.
    pub fn parse(content: &str) -> Result<Self> {
        let mut config = Self::new();
        let mut current_section = String::new();

        for (index, raw) in content.lines().enumerate() {
            let line = raw.trim();
            let line_number = index + 1;

            if line.is_empty() || line.starts_with('#') || line.starts_with(';') {
                continue;
            }

            if let Some(rest) = line.strip_prefix('[') {
                let Some(name) = rest.strip_suffix(']') else {
                    return Err(syntax_error(line_number, "unterminated section header"));
                };
                let name = name.trim();
                if name.is_empty() {
                    return Err(syntax_error(line_number, "empty section name"));
                }
                current_section = name.to_ascii_lowercase();
                config.sections.entry(current_section.clone()).or_default();
                continue;
            }

            let Some((key, value)) = line.split_once('=') else {
                return Err(syntax_error(line_number, "expected key = value"));
            };
            let key = key.trim();
            if key.is_empty() {
                return Err(syntax_error(line_number, "empty key"));
            }

            config
                .sections
                .entry(current_section.clone())
                .or_default()
                .insert(key.to_ascii_lowercase(), clean_value(value));
        }

        Ok(config)
    }

    pub fn get_string(&self, section: &str, key: &str) -> Option<String> {
        self.sections
            .get(&section.to_ascii_lowercase())?
            .get(&key.to_ascii_lowercase())
            .cloned()
    }

    pub fn get_u64(&self, section: &str, key: &str) -> Option<u64> {
        self.get_string(section, key)?.parse().ok()
    }

    pub fn get_usize(&self, section: &str, key: &str) -> Option<usize> {
        self.get_string(section, key)?.parse().ok()
    }

    pub fn get_bool(&self, section: &str, key: &str) -> Option<bool> {
        match self.get_string(section, key)?.to_lowercase().as_str() {
            "true" | "yes" | "1" | "on" => Some(true),
            "false" | "no" | "0" | "off" => Some(false),
            _ => None,
        }
    }

    /// Get comma-separated list
    pub fn get_list(&self, section: &str, key: &str) -> Vec<String> {
        self.get_string(section, key)
            .map(|s| {
                s.split(',')
                    .map(|item| item.trim().to_string())
                    .filter(|item| !item.is_empty())
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Byte size with optional KB, MB or GB suffix
    pub fn get_size(&self, section: &str, key: &str) -> Option<u64> {
        parse_size(&self.get_string(section, key)?)
    }

    pub fn has_section(&self, section: &str) -> bool {
        self.sections.contains_key(&section.to_ascii_lowercase())
    }
}

fn syntax_error(line_number: usize, reason: &str) -> MultipartError {
    MultipartError::invalid_configuration(format!(
        "Config syntax error at line {line_number}: {reason}"
    ))
}

/// Strips an inline comment, then one pair of surrounding quotes.
/// Quoted values keep `#` and `;` literally.
fn clean_value(raw: &str) -> String {
    let value = raw.trim();
    for quote in ['"', '\''] {
        if let Some(inner) = value.strip_prefix(quote) {
            if let Some(end) = inner.find(quote) {
                return inner[..end].to_string();
            }
        }
    }
    let end = value.find(['#', ';']).unwrap_or(value.len());
    value[..end].trim().to_string()
}

/// Parses sizes like "8KB", "1.5MB" or "4096"
pub fn parse_size(value: &str) -> Option<u64> {
    let value = value.trim().to_uppercase();

    if let Ok(num) = value.parse::<u64>() {
        return Some(num);
    }

    let (num_part, multiplier) = if let Some(n) = value.strip_suffix("GB") {
        (n, 1024u64 * 1024 * 1024)
    } else if let Some(n) = value.strip_suffix("MB") {
        (n, 1024 * 1024)
    } else if let Some(n) = value.strip_suffix("KB") {
        (n, 1024)
    } else if let Some(n) = value.strip_suffix('B') {
        (n, 1)
    } else {
        return None;
    };

    let num_str = num_part.trim();
    if let Ok(num) = num_str.parse::<u64>() {
        return num.checked_mul(multiplier);
    }

    match num_str.parse::<f64>() {
        Ok(num) if num.is_finite() && num >= 0.0 => Some((num * multiplier as f64) as u64),
        _ => None,
    }
}
