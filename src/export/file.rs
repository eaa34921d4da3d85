/// Columnar file store.
///
/// A directory holding one CSV section per extracted variable
/// (`var_<code>.csv`) plus a `store.toml` manifest. Sections are only ever
/// appended to. The manifest records, per section, the site column width
/// fixed on first write and the code column name; a later batch that does
/// not fit either is rejected rather than truncated.

use std::collections::BTreeMap;
use std::fs::{self, OpenOptions};
use std::path::{Path, PathBuf};

use chrono::NaiveDateTime;
use serde::{Deserialize, Serialize};

use crate::export::{section_name, ExportSink};
use crate::logging::{self, Channel};
use crate::model::{Batch, HydstraError, Period, Record};

pub const MANIFEST_FILE: &str = "store.toml";
const TIME_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SectionMeta {
    pub site_width: usize,
    pub code_column: String,
    pub rows: u64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct Manifest {
    #[serde(default)]
    sections: BTreeMap<String, SectionMeta>,
}

fn export_err(context: &str, err: impl std::fmt::Display) -> HydstraError {
    HydstraError::Export(format!("{}: {}", context, err))
}

pub struct FileSink {
    root: PathBuf,
    manifest: Manifest,
    /// Width given to sections created from now on.
    site_width: usize,
    open: bool,
}

impl FileSink {
    /// Opens (creating if needed) the store at `root`.
    pub fn open(root: &Path) -> Result<Self, HydstraError> {
        fs::create_dir_all(root).map_err(|e| export_err(&root.display().to_string(), e))?;
        let manifest_path = root.join(MANIFEST_FILE);
        let manifest = if manifest_path.exists() {
            let text = fs::read_to_string(&manifest_path)
                .map_err(|e| export_err(MANIFEST_FILE, e))?;
            toml::from_str(&text).map_err(|e| export_err(MANIFEST_FILE, e))?
        } else {
            Manifest::default()
        };
        Ok(Self {
            root: root.to_path_buf(),
            manifest,
            site_width: 0,
            open: true,
        })
    }

    pub fn section(&self, name: &str) -> Option<&SectionMeta> {
        self.manifest.sections.get(name)
    }

    fn section_path(&self, name: &str) -> PathBuf {
        self.root.join(format!("{}.csv", name))
    }

    /// Appends `batch` to section `name`.
    pub fn append(&mut self, name: &str, batch: &Batch) -> Result<(), HydstraError> {
        if !self.open {
            return Err(HydstraError::Export("store is closed".to_string()));
        }
        if batch.is_empty() {
            return Ok(());
        }
        let longest = batch.records.iter().map(|r| r.site.len()).max().unwrap_or(0);
        let code_column = batch.code_column.name();
        let width = self.site_width.max(longest);

        let meta = self
            .manifest
            .sections
            .entry(name.to_string())
            .or_insert_with(|| SectionMeta {
                site_width: width,
                code_column: code_column.to_string(),
                rows: 0,
            });
        if longest > meta.site_width {
            return Err(HydstraError::Export(format!(
                "site id of {} characters does not fit section {} (width {})",
                longest, name, meta.site_width
            )));
        }
        if meta.code_column != code_column {
            return Err(HydstraError::Export(format!(
                "section {} stores {}, batch has {}",
                name, meta.code_column, code_column
            )));
        }

        let path = self.root.join(format!("{}.csv", name));
        let is_new = !path.exists();
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .map_err(|e| export_err(&path.display().to_string(), e))?;
        let mut writer = csv::WriterBuilder::new().has_headers(false).from_writer(file);
        if is_new {
            writer.write_record(["Site", "Time", "Value", "QualityCode", code_column])?;
        }
        for record in &batch.records {
            writer.write_record([
                record.site.clone(),
                record.time.format(TIME_FORMAT).to_string(),
                record.value.map(|v| v.to_string()).unwrap_or_default(),
                record.quality_code.to_string(),
                record.code.to_string(),
            ])?;
        }
        writer.flush().map_err(|e| export_err(name, e))?;
        meta.rows += batch.len() as u64;
        Ok(())
    }

    /// Writes the manifest. A no-op once closed.
    pub fn close(&mut self) -> Result<(), HydstraError> {
        if !self.open {
            return Ok(());
        }
        self.open = false;
        let text = toml::to_string(&self.manifest).map_err(|e| export_err(MANIFEST_FILE, e))?;
        fs::write(self.root.join(MANIFEST_FILE), text).map_err(|e| export_err(MANIFEST_FILE, e))
    }

    /// Reads a section back.
    pub fn read_section(&self, name: &str) -> Result<Vec<Record>, HydstraError> {
        let mut reader = csv::Reader::from_path(self.section_path(name))?;
        let mut records = Vec::new();
        for row in reader.records() {
            let row = row?;
            let field = |i: usize| row.get(i).unwrap_or("");
            let parse_int = |i: usize| {
                field(i)
                    .parse::<i32>()
                    .map_err(|e| export_err(&format!("{} column {}", name, i), e))
            };
            let time = NaiveDateTime::parse_from_str(field(1), TIME_FORMAT)
                .map_err(|e| export_err(name, e))?;
            let value = match field(2) {
                "" => None,
                v => Some(v.parse::<f64>().map_err(|e| export_err(name, e))?),
            };
            records.push(Record {
                site: field(0).to_string(),
                time,
                value,
                quality_code: parse_int(3)?,
                code: parse_int(4)?,
            });
        }
        Ok(records)
    }
}

impl ExportSink for FileSink {
    /// Sizes new sections to the longest site id about to be written.
    fn prepare(&mut self, periods: &[Period]) -> Result<(), HydstraError> {
        let longest = periods.iter().map(|p| p.site.len()).max().unwrap_or(0);
        self.site_width = self.site_width.max(longest);
        Ok(())
    }

    fn write_batch(&mut self, batch: &Batch) -> Result<(), HydstraError> {
        let name = section_name(batch.source_varto);
        if let Err(e) = self.append(&name, batch) {
            logging::error(Channel::Export, None, &format!("{}: {}", name, e));
            if let Err(close_err) = self.close() {
                logging::warn(Channel::Export, None, &format!("closing store: {}", close_err));
            }
            return Err(e);
        }
        Ok(())
    }

    fn finish(&mut self) -> Result<(), HydstraError> {
        self.close()
    }
}

impl Drop for FileSink {
    fn drop(&mut self) {
        if let Err(e) = self.close() {
            logging::warn(Channel::Export, None, &format!("closing store on drop: {}", e));
        }
    }
}
