/// Period, RatingChange, ModificationWindow, Trace, Batch, HydstraError
/// core data structures and error handling
///
/// Core data types for the Hydstra extraction pipeline.
///
/// This module defines the shared domain model imported by all other modules.
/// It contains no I/O — only types, the small amount of interval arithmetic
/// that belongs to them, and the crate-wide error type.

use chrono::NaiveDateTime;

// ---------------------------------------------------------------------------
// Variable codes
// ---------------------------------------------------------------------------

/// Hydstra variable code. Codes arrive from the server as decimal strings
/// ("140.00"); only integral codes are meaningful to the pipeline.
pub type VariableCode = i32;

/// Hydstra variable code for water level (stage).
pub const VAR_WATER_LEVEL: VariableCode = 100;

/// Hydstra variable code for flow. Usually derived from water level through
/// a rating table (varfrom = 100, varto = 140).
pub const VAR_FLOW: VariableCode = 140;

/// Flow recorded under a separate code at a different unit scale.
pub const VAR_DERIVED_FLOW: VariableCode = 143;

/// Groundwater well level.
pub const VAR_WELL_LEVEL: VariableCode = 110;

/// Rainfall.
pub const VAR_RAINFALL: VariableCode = 10;

/// Hydstra quality code attached to every observation.
pub type QualityCode = i32;

/// Normalizes a site identifier as it comes out of Hydstra's fixed-width
/// STATION columns and JSON payloads.
pub fn normalize_site(raw: &str) -> String {
    raw.trim().to_string()
}

// ---------------------------------------------------------------------------
// Period types
// ---------------------------------------------------------------------------

/// A half-open interval `[from_date, to_date)` over which one
/// (site, varfrom, varto) conversion has recorded data.
///
/// Periods are never edited in place; narrowing produces a new value.
#[derive(Debug, Clone, PartialEq)]
pub struct Period {
    pub site: String,
    pub varfrom: VariableCode,
    pub varto: VariableCode,
    pub from_date: NaiveDateTime,
    pub to_date: NaiveDateTime,
}

impl Period {
    /// Builds a period, rejecting an inverted interval.
    pub fn new(
        site: &str,
        varfrom: VariableCode,
        varto: VariableCode,
        from_date: NaiveDateTime,
        to_date: NaiveDateTime,
    ) -> Result<Period, HydstraError> {
        if from_date > to_date {
            return Err(HydstraError::Validation(format!(
                "period for site {} ({} -> {}) starts {} after it ends {}",
                site, varfrom, varto, from_date, to_date
            )));
        }
        Ok(Period {
            site: normalize_site(site),
            varfrom,
            varto,
            from_date,
            to_date,
        })
    }

    /// True when the target is computed from a different source variable
    /// (e.g. flow from water level through a rating table).
    pub fn is_converted(&self) -> bool {
        self.varfrom != self.varto
    }

    /// Restricts the period to start no earlier than `start`.
    /// Returns `None` when `start` is at or beyond the end of the period.
    pub fn starting_from(&self, start: NaiveDateTime) -> Option<Period> {
        if self.to_date <= start {
            return None;
        }
        Some(Period {
            from_date: self.from_date.max(start),
            ..self.clone()
        })
    }

    /// The part of the period a change mark invalidates.
    ///
    /// A mark whose modification window ended before the period starts
    /// touches none of it, so the period is dropped rather than clamped.
    /// Marks without an end (rating changes) hold from `mod_date` on.
    pub fn narrowed_by(&self, mark: &ChangeMark) -> Option<Period> {
        if mark.to_mod_date.is_some_and(|end| end < self.from_date) {
            return None;
        }
        self.starting_from(mark.mod_date)
    }

    /// Intersects the period with an optional caller window.
    /// Returns `None` when nothing of the period remains.
    pub fn clamp_to(
        &self,
        from: Option<NaiveDateTime>,
        to: Option<NaiveDateTime>,
    ) -> Option<Period> {
        let mut from_date = self.from_date;
        let mut to_date = self.to_date;
        if let Some(from) = from {
            if to_date <= from {
                return None;
            }
            from_date = from_date.max(from);
        }
        if let Some(to) = to {
            if from_date >= to {
                return None;
            }
            to_date = to_date.min(to);
        }
        Some(Period {
            from_date,
            to_date,
            ..self.clone()
        })
    }
}

/// A rating table taking effect at a site. Only level → flow conversions
/// carry ratings, so `varfrom`/`varto` are 100/140 in practice.
#[derive(Debug, Clone, PartialEq)]
pub struct RatingChange {
    pub site: String,
    pub varfrom: VariableCode,
    pub varto: VariableCode,
    pub effective_date: NaiveDateTime,
}

/// The span over which stored values of one site/variable were altered.
#[derive(Debug, Clone, PartialEq)]
pub struct ModificationWindow {
    pub site: String,
    pub varto: VariableCode,
    pub from_mod_date: NaiveDateTime,
    pub to_mod_date: NaiveDateTime,
}

/// The earliest point from which a (site, varfrom, varto) must be
/// re-extracted. Produced by the change detector from either source.
#[derive(Debug, Clone, PartialEq)]
pub struct ChangeMark {
    pub site: String,
    pub varfrom: VariableCode,
    pub varto: VariableCode,
    pub mod_date: NaiveDateTime,
    /// End of the modification window; `None` when the change holds
    /// indefinitely.
    pub to_mod_date: Option<NaiveDateTime>,
}

// ---------------------------------------------------------------------------
// Trace types
// ---------------------------------------------------------------------------

/// One observation of a trace. `value` is `None` when the server sent
/// something that is not a number.
#[derive(Debug, Clone, PartialEq)]
pub struct TracePoint {
    pub time: NaiveDateTime,
    pub value: Option<f64>,
    pub quality: QualityCode,
}

/// Time-ordered observations for one site/variable pair, as extracted.
#[derive(Debug, Clone, PartialEq)]
pub struct Trace {
    pub site: String,
    pub varfrom: VariableCode,
    pub varto: VariableCode,
    pub points: Vec<TracePoint>,
}

impl Trace {
    pub fn is_empty(&self) -> bool {
        self.points.is_empty()
    }
}

// ---------------------------------------------------------------------------
// Output table types
// ---------------------------------------------------------------------------

/// Name of the column carrying the variable code in the output table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CodeColumn {
    /// Hydstra's own variable code.
    HydstraCode,
    /// A caller-supplied feature/measurement-type identifier.
    FeatureMtypeSourceId,
}

impl CodeColumn {
    pub fn name(&self) -> &'static str {
        match self {
            CodeColumn::HydstraCode => "HydstraCode",
            CodeColumn::FeatureMtypeSourceId => "FeatureMtypeSourceID",
        }
    }
}

/// One row of the tidy output table: {Site, Time, Value, QualityCode, code}.
#[derive(Debug, Clone, PartialEq)]
pub struct Record {
    pub site: String,
    pub time: NaiveDateTime,
    pub value: Option<f64>,
    pub quality_code: QualityCode,
    pub code: i32,
}

/// A transformed trace, ready for export. (site, time) is unique within
/// a batch.
#[derive(Debug, Clone, PartialEq)]
pub struct Batch {
    /// The varto the trace was extracted under, before any relabeling.
    pub source_varto: VariableCode,
    pub code_column: CodeColumn,
    pub records: Vec<Record>,
}

impl Batch {
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    /// Earliest and latest timestamps in the batch.
    pub fn time_span(&self) -> Option<(NaiveDateTime, NaiveDateTime)> {
        let min = self.records.iter().map(|r| r.time).min()?;
        let max = self.records.iter().map(|r| r.time).max()?;
        Some((min, max))
    }

    /// Distinct sites in order of first appearance.
    pub fn sites(&self) -> Vec<&str> {
        let mut sites: Vec<&str> = Vec::new();
        for record in &self.records {
            if !sites.contains(&record.site.as_str()) {
                sites.push(&record.site);
            }
        }
        sites
    }
}

// ---------------------------------------------------------------------------
// Error types
// ---------------------------------------------------------------------------

/// Errors that can arise anywhere in the extraction pipeline.
#[derive(Debug, Clone, PartialEq)]
pub enum HydstraError {
    /// Non-zero `error_num` from the server (other than buffer resize).
    Protocol { code: i64, message: String },
    /// StartUpEx/ShutDown failed.
    Login(String),
    /// The response did not match the shape expected for the call.
    Decode(String),
    /// Bad caller input, detected before any I/O.
    Validation(String),
    /// The transport itself failed (HTTP, library load, ...).
    Transport(String),
    /// Metadata store or relational export failure.
    Database(String),
    /// File export failure.
    Export(String),
    /// Configuration could not be loaded.
    Config(String),
    /// Filesystem failure outside the export sink.
    Io(String),
}

impl std::fmt::Display for HydstraError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            HydstraError::Protocol { code, message } => {
                write!(f, "Hydstra error num:{}, {}", code, message)
            }
            HydstraError::Login(msg) => write!(f, "Login error: {}", msg),
            HydstraError::Decode(msg) => write!(f, "Decode error: {}", msg),
            HydstraError::Validation(msg) => write!(f, "Validation error: {}", msg),
            HydstraError::Transport(msg) => write!(f, "Transport error: {}", msg),
            HydstraError::Database(msg) => write!(f, "Database error: {}", msg),
            HydstraError::Export(msg) => write!(f, "Export error: {}", msg),
            HydstraError::Config(msg) => write!(f, "Config error: {}", msg),
            HydstraError::Io(msg) => write!(f, "I/O error: {}", msg),
        }
    }
}

impl std::error::Error for HydstraError {}

impl From<serde_json::Error> for HydstraError {
    fn from(err: serde_json::Error) -> Self {
        HydstraError::Decode(err.to_string())
    }
}

impl From<postgres::Error> for HydstraError {
    fn from(err: postgres::Error) -> Self {
        HydstraError::Database(err.to_string())
    }
}

impl From<std::io::Error> for HydstraError {
    fn from(err: std::io::Error) -> Self {
        HydstraError::Io(err.to_string())
    }
}

impl From<csv::Error> for HydstraError {
    fn from(err: csv::Error) -> Self {
        HydstraError::Export(err.to_string())
    }
}

impl From<toml::de::Error> for HydstraError {
    fn from(err: toml::de::Error) -> Self {
        HydstraError::Config(err.to_string())
    }
}

impl From<reqwest::Error> for HydstraError {
    fn from(err: reqwest::Error) -> Self {
        HydstraError::Transport(err.to_string())
    }
}

/// A multi-step operation that failed part way. `partial` holds everything
/// completed before `error`; treat it as possibly incomplete.
#[derive(Debug)]
pub struct Incomplete<T> {
    pub partial: T,
    pub error: HydstraError,
}

impl<T> Incomplete<T> {
    pub fn new(partial: T, error: HydstraError) -> Self {
        Incomplete { partial, error }
    }
}

impl<T> std::fmt::Display for Incomplete<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "incomplete result: {}", self.error)
    }
}

impl<T: std::fmt::Debug> std::error::Error for Incomplete<T> {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        Some(&self.error)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
