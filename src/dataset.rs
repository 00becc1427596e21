//! Append-only feature log for classifier retraining.
//!
//! One CSV row per classified person:
//! `timestamp,person_id,body_height,shoulder_body_ratio,role`.
//! The header is written only when the file is created.

use anyhow::{Context, Result};
use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

use crate::detect::BodyFeatures;
use crate::{Role, TrackId};

pub const DATASET_HEADER: &str = "timestamp,person_id,body_height,shoulder_body_ratio,role";

pub struct DatasetLogger {
    path: PathBuf,
    writer: BufWriter<File>,
    rows: u64,
}

impl DatasetLogger {
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("create dataset directory {}", parent.display()))?;
        }
        let is_new = !path.exists();
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .with_context(|| format!("open dataset log {}", path.display()))?;
        let mut writer = BufWriter::new(file);
        if is_new {
            writeln!(writer, "{}", DATASET_HEADER).context("write dataset header")?;
            writer.flush().context("flush dataset header")?;
        }
        log::info!("DatasetLogger: appending to {}", path.display());
        Ok(Self {
            path: path.to_path_buf(),
            writer,
            rows: 0,
        })
    }

    pub fn log(&mut self, person: TrackId, features: &BodyFeatures, role: Role) -> Result<()> {
        let timestamp = crate::unix_millis() as f64 / 1000.0;
        writeln!(
            self.writer,
            "{:.3},{},{},{},{}",
            timestamp,
            person,
            features.body_height,
            features.shoulder_body_ratio,
            role
        )
        .and_then(|_| self.writer.flush())
        .with_context(|| format!("append to dataset log {}", self.path.display()))?;
        self.rows += 1;
        Ok(())
    }

    /// Rows written by this logger (not counting earlier sessions).
    pub fn rows(&self) -> u64 {
        self.rows
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}
