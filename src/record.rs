//! Run record: the audit artifact of a batch.
//!
//! Opening the record, adding a directory and closing it rewrite the whole file through a
//! temporary sibling and a rename. Integrated images are appended one line at a time to the
//! trailing images section and synced, so the file on disk always lists every completed image.
//! The header lines are `#` comments followed by the rendered parameter set, which keeps the
//! record loadable as a `.int` file.
//!
//! ```text
//! # GuidedIntegration run record
//! # Started: 2024-05-02T14:03:11+02:00
//! # Status: completed
//! #
//! # Scanned directories:
//! #   /data/run7
//! #
//! ####...
//! Data from NSLS-II, APS, or SSRL: APS_single
//! ...
//! # Integrated images:
//! #   /data/run7/frame_0001.tif
//! ```

use crate::error::FatalError;
use crate::model::RunStatus;
use crate::params::{self, ParameterSet};
use anyhow::{anyhow, Context};
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use time::format_description::well_known::Rfc3339;
use time::macros::format_description;
use time::OffsetDateTime;
use tracing::trace;

pub const RECORD_EXTENSION: &str = "rec";
const TITLE: &str = "# GuidedIntegration run record";
const STARTED: &str = "# Started: ";
const STATUS: &str = "# Status: ";
const DIRECTORIES: &str = "# Scanned directories:";
const IMAGES: &str = "# Integrated images:";
const ENTRY: &str = "#   ";

fn now() -> OffsetDateTime {
    OffsetDateTime::now_local().unwrap_or_else(|_| OffsetDateTime::now_utc())
}

/// `GuidedIntegration_<ddMonYYYY_HH-MM-SS>.<extension>` for the current local time.
pub fn default_file_name(extension: &str) -> String {
    let stamp = now()
        .format(format_description!(
            "[day][month repr:short][year]_[hour]-[minute]-[second]"
        ))
        .unwrap_or_default();
    format!("GuidedIntegration_{stamp}.{extension}")
}

/// Incrementally maintained run record.
#[derive(Debug)]
pub struct RunRecordWriter {
    path: PathBuf,
    started: String,
    params_text: String,
    directories: Vec<PathBuf>,
    images: Vec<PathBuf>,
    status: RunStatus,
    /// Open for appending image lines; reopened after every full rewrite.
    journal: Option<File>,
}

impl RunRecordWriter {
    /// Create the record with the parameter snapshot and status `in-progress`.
    pub fn open(path: impl Into<PathBuf>, params: &ParameterSet) -> Result<Self, FatalError> {
        let mut writer = Self {
            path: path.into(),
            started: now().format(&Rfc3339).unwrap_or_default(),
            params_text: params::render(params),
            directories: Vec::new(),
            images: Vec::new(),
            status: RunStatus::InProgress,
            journal: None,
        };
        writer.flush()?;
        Ok(writer)
    }

    pub fn record_directory(&mut self, dir: &Path) -> Result<(), FatalError> {
        self.directories.push(dir.to_path_buf());
        self.flush()
    }

    /// Append one integrated image. Only the new line is written.
    pub fn record_image(&mut self, image: &Path) -> Result<(), FatalError> {
        let line = format!("{ENTRY}{}\n", image.display());
        let journal = match self.journal.as_mut() {
            Some(file) => file,
            None => return Err(self.io_error(std::io::ErrorKind::NotFound.into())),
        };
        let appended = journal
            .write_all(line.as_bytes())
            .and_then(|()| journal.sync_data());
        if let Err(source) = appended {
            return Err(self.io_error(source));
        }
        trace!(
            path = %self.path.display(),
            images = self.images.len() + 1,
            "image appended to run record"
        );
        self.images.push(image.to_path_buf());
        Ok(())
    }

    /// Write the final status. Consumes the writer; the record is complete afterwards.
    pub fn close(mut self, status: RunStatus) -> Result<PathBuf, FatalError> {
        self.status = status;
        self.flush()?;
        Ok(self.path)
    }

    fn render(&self) -> String {
        let mut out = String::new();
        out.push_str(TITLE);
        out.push('\n');
        out.push_str(&format!("{STARTED}{}\n", self.started));
        out.push_str(&format!("{STATUS}{}\n#\n", self.status));
        out.push_str(DIRECTORIES);
        out.push('\n');
        for dir in &self.directories {
            out.push_str(&format!("{ENTRY}{}\n", dir.display()));
        }
        out.push_str("#\n");
        out.push_str(&self.params_text);
        out.push('\n');
        out.push_str(IMAGES);
        out.push('\n');
        for image in &self.images {
            out.push_str(&format!("{ENTRY}{}\n", image.display()));
        }
        out
    }

    /// Rewrite the whole record atomically and reopen it for appending.
    fn flush(&mut self) -> Result<(), FatalError> {
        trace!(path = %self.path.display(), images = self.images.len(), "rewriting run record");
        self.journal = None;
        params::write_atomic(&self.path, self.render().as_bytes())
            .map_err(|source| self.io_error(source))?;
        let journal = OpenOptions::new()
            .append(true)
            .open(&self.path)
            .map_err(|source| self.io_error(source))?;
        self.journal = Some(journal);
        Ok(())
    }

    fn io_error(&self, source: std::io::Error) -> FatalError {
        FatalError::Record {
            path: self.path.clone(),
            source,
        }
    }
}

/// Contents of a run record read back from disk.
#[derive(Debug, Clone, PartialEq)]
pub struct LoadedRecord {
    pub started: String,
    pub status: RunStatus,
    pub directories: Vec<PathBuf>,
    pub images: Vec<PathBuf>,
    pub params: ParameterSet,
}

/// Read a record written by [`RunRecordWriter`]. The embedded parameters are validated, so
/// the calibration and mask must still exist.
pub fn load(path: &Path) -> anyhow::Result<LoadedRecord> {
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read run record {}", path.display()))?;

    // The writer always puts the images section last, so the final marker is its own even
    // when the notes happen to contain the same line.
    let marker = format!("\n{IMAGES}\n");
    let (head, tail) = match text.rfind(&marker) {
        Some(i) => (&text[..i], &text[i + marker.len()..]),
        None => (text.as_str(), ""),
    };

    let mut in_directories = false;
    let mut started = None;
    let mut status = None;
    let mut directories = Vec::new();

    for line in head.lines() {
        if !line.starts_with('#') {
            break;
        }
        if let Some(v) = line.strip_prefix(STARTED) {
            started = Some(v.trim().to_string());
        } else if let Some(v) = line.strip_prefix(STATUS) {
            status = RunStatus::from_token(v);
        } else if line == DIRECTORIES {
            in_directories = true;
        } else if let Some(entry) = line.strip_prefix(ENTRY).filter(|_| in_directories) {
            directories.push(PathBuf::from(entry));
        } else {
            in_directories = false;
        }
    }

    let images = tail
        .lines()
        .filter_map(|line| line.strip_prefix(ENTRY))
        .map(PathBuf::from)
        .collect();

    let status = status.ok_or_else(|| anyhow!("{} has no status line", path.display()))?;
    let params = params::parse(head)
        .with_context(|| format!("invalid parameters in run record {}", path.display()))?;

    Ok(LoadedRecord {
        started: started.unwrap_or_default(),
        status,
        directories,
        images,
        params,
    })
}
