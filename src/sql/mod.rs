/// Relational access: Hydstra's metadata tables and the export destination.
///
/// Submodules:
/// - `pg`      — PostgreSQL implementation of both capabilities.
/// - `memory`  — in-memory tables with the same query semantics, for dry
///               runs and tests.
/// - `hydstra` — typed queries over PERIOD, RATEHED and RATEPER.
///
/// Queries are described by `TableQuery` rather than SQL text so the same
/// request runs against any store.

pub mod hydstra;
pub mod memory;
pub mod pg;

use chrono::NaiveDateTime;
use std::collections::BTreeMap;

use crate::model::{CodeColumn, HydstraError, Record};

// ---------------------------------------------------------------------------
// Values and rows
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq)]
pub enum SqlValue {
    Null,
    Int(i64),
    Float(f64),
    Text(String),
    Timestamp(NaiveDateTime),
}

/// One result row, keyed by output (renamed) column name.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Row {
    values: BTreeMap<String, SqlValue>,
}

impl Row {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, column: &str, value: SqlValue) -> Self {
        self.values.insert(column.to_string(), value);
        self
    }

    pub fn insert(&mut self, column: &str, value: SqlValue) {
        self.values.insert(column.to_string(), value);
    }

    pub fn get(&self, column: &str) -> Option<&SqlValue> {
        self.values.get(column)
    }

    fn required(&self, column: &str) -> Result<&SqlValue, HydstraError> {
        self.values
            .get(column)
            .ok_or_else(|| HydstraError::Decode(format!("row has no column '{}'", column)))
    }

    /// Text value with fixed-width padding trimmed.
    pub fn text(&self, column: &str) -> Result<String, HydstraError> {
        match self.required(column)? {
            SqlValue::Text(s) => Ok(s.trim().to_string()),
            SqlValue::Int(n) => Ok(n.to_string()),
            other => Err(HydstraError::Decode(format!(
                "column '{}' is not text: {:?}",
                column, other
            ))),
        }
    }

    pub fn number(&self, column: &str) -> Result<f64, HydstraError> {
        match self.required(column)? {
            SqlValue::Int(n) => Ok(*n as f64),
            SqlValue::Float(n) => Ok(*n),
            SqlValue::Text(s) => s.trim().parse::<f64>().map_err(|_| {
                HydstraError::Decode(format!("column '{}' is not numeric: '{}'", column, s))
            }),
            other => Err(HydstraError::Decode(format!(
                "column '{}' is not numeric: {:?}",
                column, other
            ))),
        }
    }

    pub fn timestamp(&self, column: &str) -> Result<NaiveDateTime, HydstraError> {
        match self.required(column)? {
            SqlValue::Timestamp(t) => Ok(*t),
            other => Err(HydstraError::Decode(format!(
                "column '{}' is not a timestamp: {:?}",
                column, other
            ))),
        }
    }
}

// ---------------------------------------------------------------------------
// Queries
// ---------------------------------------------------------------------------

/// Membership values for one column.
#[derive(Debug, Clone, PartialEq)]
pub enum FilterValues {
    /// Compared after trimming, as Hydstra pads its CHAR columns.
    Text(Vec<String>),
    Number(Vec<f64>),
}

impl FilterValues {
    pub fn is_empty(&self) -> bool {
        match self {
            FilterValues::Text(v) => v.is_empty(),
            FilterValues::Number(v) => v.is_empty(),
        }
    }
}

/// `column IN (values)`.
#[derive(Debug, Clone, PartialEq)]
pub struct ColumnFilter {
    pub column: String,
    pub values: FilterValues,
}

/// How several column filters combine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FilterOp {
    #[default]
    And,
    /// A row matches if any one column filter matches.
    Or,
}

/// Inclusive bounds on a timestamp column. Always ANDed with the filters.
#[derive(Debug, Clone, PartialEq)]
pub struct DateRange {
    pub column: String,
    pub from: Option<NaiveDateTime>,
    pub to: Option<NaiveDateTime>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct TableQuery {
    pub table: String,
    /// (source column, output name)
    pub columns: Vec<(String, String)>,
    pub filters: Vec<ColumnFilter>,
    pub filter_op: FilterOp,
    pub date_range: Option<DateRange>,
}

impl TableQuery {
    pub fn new(table: &str) -> Self {
        Self {
            table: table.to_string(),
            columns: Vec::new(),
            filters: Vec::new(),
            filter_op: FilterOp::And,
            date_range: None,
        }
    }

    pub fn column(mut self, source: &str, name: &str) -> Self {
        self.columns.push((source.to_string(), name.to_string()));
        self
    }

    pub fn filter_text(mut self, column: &str, values: &[String]) -> Self {
        self.filters.push(ColumnFilter {
            column: column.to_string(),
            values: FilterValues::Text(values.to_vec()),
        });
        self
    }

    pub fn filter_number(mut self, column: &str, values: &[f64]) -> Self {
        self.filters.push(ColumnFilter {
            column: column.to_string(),
            values: FilterValues::Number(values.to_vec()),
        });
        self
    }

    pub fn any_filter(mut self) -> Self {
        self.filter_op = FilterOp::Or;
        self
    }

    pub fn dates(
        mut self,
        column: &str,
        from: Option<NaiveDateTime>,
        to: Option<NaiveDateTime>,
    ) -> Self {
        self.date_range = Some(DateRange {
            column: column.to_string(),
            from,
            to,
        });
        self
    }
}

/// Read-only tabular access to the Hydstra metadata tables.
pub trait MetadataStore {
    fn query(&mut self, query: &TableQuery) -> Result<Vec<Row>, HydstraError>;
}

// ---------------------------------------------------------------------------
// Export destination
// ---------------------------------------------------------------------------

/// Rows to remove before re-inserting a batch: every filter must match and
/// the timestamp must fall inside `date_range`.
#[derive(Debug, Clone, PartialEq)]
pub struct DeleteScope {
    pub filters: Vec<ColumnFilter>,
    pub date_range: DateRange,
}

/// Write access to the relational export table.
pub trait TableWriter {
    fn delete_rows(&mut self, table: &str, scope: &DeleteScope) -> Result<u64, HydstraError>;

    fn insert_records(
        &mut self,
        table: &str,
        code_column: CodeColumn,
        records: &[Record],
    ) -> Result<u64, HydstraError>;
}

/// Output column names of the export table, in insert order.
pub fn export_columns(code_column: CodeColumn) -> [&'static str; 5] {
    ["Site", "Time", "Value", "QualityCode", code_column.name()]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_row_accessors_trim_and_coerce() {
        let row = Row::new()
            .with("site", SqlValue::Text("70105   ".to_string()))
            .with("varto", SqlValue::Text("140.00".to_string()))
            .with("stime", SqlValue::Int(930));
        assert_eq!(row.text("site").unwrap(), "70105");
        assert_eq!(row.number("varto").unwrap(), 140.0);
        assert_eq!(row.number("stime").unwrap(), 930.0);
        assert!(matches!(row.timestamp("site"), Err(HydstraError::Decode(_))));
        assert!(matches!(row.text("missing"), Err(HydstraError::Decode(_))));
    }

    #[test]
    fn test_builder_collects_parts() {
        let query = TableQuery::new("RATEPER")
            .column("STATION", "site")
            .filter_text("STATION", &["70105".to_string()])
            .any_filter()
            .dates("SDATE", None, None);
        assert_eq!(query.columns, vec![("STATION".to_string(), "site".to_string())]);
        assert_eq!(query.filter_op, FilterOp::Or);
        assert!(query.date_range.is_some());
    }

    #[test]
    fn test_export_columns_follow_code_column() {
        assert_eq!(export_columns(CodeColumn::HydstraCode)[4], "HydstraCode");
        assert_eq!(
            export_columns(CodeColumn::FeatureMtypeSourceId)[4],
            "FeatureMtypeSourceID"
        );
    }
}
