/// Export sinks for transformed batches.
///
/// Submodules:
/// - `file`  — append-only columnar store on disk, one section per variable.
/// - `table` — relational destination with delete-then-insert per batch.
///
/// A sink is opened once per export run: `prepare` sees every period
/// before the first batch, `write_batch` is called per extracted trace,
/// and `finish` closes the sink. `finish` must be safe to call twice.

pub mod file;
pub mod table;

use crate::model::{Batch, HydstraError, Period, VariableCode};

pub trait ExportSink {
    /// Called once with every period about to be extracted.
    fn prepare(&mut self, _periods: &[Period]) -> Result<(), HydstraError> {
        Ok(())
    }

    fn write_batch(&mut self, batch: &Batch) -> Result<(), HydstraError>;

    fn finish(&mut self) -> Result<(), HydstraError> {
        Ok(())
    }
}

/// Section name for batches extracted under `varto`.
pub fn section_name(varto: VariableCode) -> String {
    format!("var_{}", varto)
}

/// Keeps batches in memory.
#[derive(Debug, Default)]
pub struct Collector {
    pub batches: Vec<Batch>,
    pub finished: bool,
}

impl ExportSink for Collector {
    fn write_batch(&mut self, batch: &Batch) -> Result<(), HydstraError> {
        self.batches.push(batch.clone());
        Ok(())
    }

    fn finish(&mut self) -> Result<(), HydstraError> {
        self.finished = true;
        Ok(())
    }
}

/// Discards everything; for runs that only want the returned data.
#[derive(Debug, Default)]
pub struct NoExport;

impl ExportSink for NoExport {
    fn write_batch(&mut self, _batch: &Batch) -> Result<(), HydstraError> {
        Ok(())
    }
}
