//! Disk sink for decoded file parts
//!
//! [`DiskSink`] is a [`PartHandler`] that streams every file part into a
//! temporary file inside the target directory and renames it into place once
//! the part is complete, so readers of the directory never observe a partial
//! upload. Name clashes are resolved as `name_1.ext`, `name_2.ext`, ... unless
//! overwriting is enabled. Text fields are kept in memory.
//!
//! # Example Usage
//! ```rust,no_run
//! use formsplit::multipart::{ParserOptions, PartClassifier};
//! use formsplit::reader::ReadSource;
//! use formsplit::upload::DiskSink;
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let sink = DiskSink::new("/tmp/uploads", false)?;
//! let body = std::fs::File::open("request.body")?;
//! let mut classifier = PartClassifier::new(ReadSource::new(body), sink, ParserOptions::default())?;
//! classifier.run_blocking()?;
//! for file in classifier.handler().saved_files() {
//!     println!("{} -> {:?}", file.original_name, file.saved_path);
//! }
//! # Ok(())
//! # }
//! ```

use crate::error::{MultipartError, Result};
use crate::multipart::{PartHandler, sanitize_filename};
use crate::part::{FieldPart, FileInfo};
use log::{debug, error, info};
use std::fs::{self, File};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

/// Temporary file prefix for atomic operations
const TEMP_FILE_PREFIX: &str = ".formsplit_temp_";
const FALLBACK_FILE_NAME: &str = "upload";
const MAX_RENAME_ATTEMPTS: usize = 9999;

static TEMP_COUNTER: AtomicU64 = AtomicU64::new(0);

/// Information about a file written to disk
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SavedFile {
    /// Form field the file was submitted under
    pub field_name: String,
    /// Sanitized filename from the client, empty when none was sent
    pub original_name: String,
    /// Final filename on disk (may differ due to conflicts)
    pub saved_name: String,
    pub saved_path: PathBuf,
    pub size: u64,
    pub content_type: String,
    /// Whether the filename was changed to resolve a conflict
    pub renamed: bool,
}

/// File currently being streamed
#[derive(Debug)]
struct PendingFile {
    info: FileInfo,
    temp_path: PathBuf,
    file: File,
    size: u64,
}

#[derive(Debug)]
pub struct DiskSink {
    target_dir: PathBuf,
    overwrite: bool,
    pending: Option<PendingFile>,
    saved: Vec<SavedFile>,
    fields: Vec<FieldPart>,
}

impl DiskSink {
    /// Creates a sink writing into `target_dir`, creating it if needed
    pub fn new(target_dir: impl Into<PathBuf>, overwrite: bool) -> Result<Self> {
        let target_dir = target_dir.into();
        Self::ensure_directory_exists(&target_dir)?;
        debug!("Disk sink ready in {target_dir:?} (overwrite: {overwrite})");

        Ok(Self {
            target_dir,
            overwrite,
            pending: None,
            saved: Vec::new(),
            fields: Vec::new(),
        })
    }

    pub fn target_dir(&self) -> &Path {
        &self.target_dir
    }

    pub fn saved_files(&self) -> &[SavedFile] {
        &self.saved
    }

    pub fn fields(&self) -> &[FieldPart] {
        &self.fields
    }

    /// Total bytes written across all saved files
    pub fn total_bytes(&self) -> u64 {
        self.saved.iter().map(|f| f.size).sum()
    }

    /// Ensure the target directory exists, create if necessary
    fn ensure_directory_exists(dir: &Path) -> Result<()> {
        if !dir.exists() {
            info!("Creating output directory: {dir:?}");
            fs::create_dir_all(dir).map_err(|e| {
                error!("Failed to create output directory {dir:?}: {e}");
                MultipartError::from(e)
            })?;
        } else if !dir.is_dir() {
            return Err(MultipartError::invalid_configuration(format!(
                "Output path {dir:?} exists but is not a directory"
            )));
        }
        Ok(())
    }

    /// Name to store a file under before conflict resolution
    fn disk_name(info: &FileInfo) -> String {
        let base = if info.file_name.is_empty() {
            sanitize_filename(&info.name)
        } else {
            info.file_name.clone()
        };

        if base.is_empty() {
            FALLBACK_FILE_NAME.to_string()
        } else if base.starts_with('.') {
            // Never create hidden files
            format!("file{base}")
        } else {
            base
        }
    }

    /// Generate a unique filename to avoid conflicts
    fn generate_unique_filename(&self, original: &str) -> Result<(String, bool)> {
        if self.overwrite || !self.target_dir.join(original).exists() {
            return Ok((original.to_string(), false));
        }

        let path = Path::new(original);
        let stem = path.file_stem().and_then(|s| s.to_str()).unwrap_or("file");
        let extension = path
            .extension()
            .and_then(|ext| ext.to_str())
            .map(|ext| format!(".{ext}"))
            .unwrap_or_default();

        for i in 1..=MAX_RENAME_ATTEMPTS {
            let new_filename = format!("{stem}_{i}{extension}");
            if !self.target_dir.join(&new_filename).exists() {
                return Ok((new_filename, true));
            }
        }

        Err(MultipartError::Io(io::Error::new(
            io::ErrorKind::AlreadyExists,
            format!("Unable to generate unique filename after {MAX_RENAME_ATTEMPTS} attempts"),
        )))
    }

    fn temp_path(&self) -> PathBuf {
        let nanos = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap_or_default()
            .as_nanos();
        let sequence = TEMP_COUNTER.fetch_add(1, Ordering::Relaxed);
        self.target_dir.join(format!(
            "{TEMP_FILE_PREFIX}{}_{nanos}_{sequence}.tmp",
            std::process::id()
        ))
    }

    fn start_file(&mut self, info: &FileInfo) -> Result<()> {
        self.finish_pending()?;

        let temp_path = self.temp_path();
        let file = File::create(&temp_path).map_err(|e| {
            error!("Failed to create temporary file {temp_path:?}: {e}");
            MultipartError::from(e)
        })?;
        debug!("Streaming {:?} into {temp_path:?}", info.name);

        self.pending = Some(PendingFile {
            info: info.clone(),
            temp_path,
            file,
            size: 0,
        });
        Ok(())
    }

    fn write_fragment(&mut self, bytes: &[u8]) -> Result<()> {
        let Some(pending) = self.pending.as_mut() else {
            return Err(MultipartError::invalid_configuration(
                "File fragment received before the start of a file",
            ));
        };
        pending.file.write_all(bytes).map_err(|e| {
            error!("Failed to write to temporary file {:?}: {e}", pending.temp_path);
            MultipartError::from(e)
        })?;
        pending.size += bytes.len() as u64;
        Ok(())
    }

    /// Syncs the file being streamed and renames it into place
    fn finish_pending(&mut self) -> Result<()> {
        let Some(PendingFile {
            info,
            temp_path,
            file,
            size,
        }) = self.pending.take()
        else {
            return Ok(());
        };

        let synced = file.sync_all();
        drop(file);
        let placed = synced
            .map_err(MultipartError::from)
            .and_then(|()| self.move_into_place(&info, &temp_path));

        let (saved_name, saved_path, renamed) = match placed {
            Ok(placed) => placed,
            Err(e) => {
                let _ = fs::remove_file(&temp_path); // Cleanup on error
                return Err(e);
            }
        };

        info!("Saved {saved_path:?} ({})", format_bytes(size));
        self.saved.push(SavedFile {
            field_name: info.name,
            original_name: info.file_name,
            saved_name,
            saved_path,
            size,
            content_type: info.content_type,
            renamed,
        });
        Ok(())
    }

    fn move_into_place(&self, info: &FileInfo, temp_path: &Path) -> Result<(String, PathBuf, bool)> {
        let (saved_name, renamed) = self.generate_unique_filename(&Self::disk_name(info))?;
        let saved_path = self.target_dir.join(&saved_name);
        fs::rename(temp_path, &saved_path).map_err(|e| {
            error!("Failed to rename {temp_path:?} to {saved_path:?}: {e}");
            MultipartError::from(e)
        })?;
        if renamed {
            debug!("Renamed {:?} to {saved_name:?} to avoid a conflict", info.file_name);
        }
        Ok((saved_name, saved_path, renamed))
    }
}

impl PartHandler for DiskSink {
    fn on_field(&mut self, field: FieldPart) -> Result<()> {
        self.finish_pending()?;
        self.fields.push(field);
        Ok(())
    }

    fn on_file_fragment(&mut self, info: &FileInfo, bytes: &[u8], part_number: usize) -> Result<()> {
        if part_number == 0 {
            self.start_file(info)?;
        }
        self.write_fragment(bytes)
    }

    fn on_stream_closed(&mut self) -> Result<()> {
        self.finish_pending()
    }
}

impl Drop for DiskSink {
    fn drop(&mut self) {
        // A file still pending here belongs to a failed parse
        if let Some(pending) = self.pending.take() {
            drop(pending.file);
            let _ = fs::remove_file(&pending.temp_path);
        }
    }
}

/// Format bytes into human-readable format
pub fn format_bytes(bytes: u64) -> String {
    const UNITS: &[&str] = &["B", "KB", "MB", "GB", "TB"];
    let mut size = bytes as f64;
    let mut unit_index = 0;

    while size >= 1024.0 && unit_index < UNITS.len() - 1 {
        size /= 1024.0;
        unit_index += 1;
    }

    if unit_index == 0 {
        format!("{} {}", bytes, UNITS[unit_index])
    } else {
        format!("{:.1} {}", size, UNITS[unit_index])
    }
}
