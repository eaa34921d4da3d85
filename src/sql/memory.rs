/// In-memory tables.
///
/// Evaluates `TableQuery` and `DeleteScope` with the same rules as the
/// PostgreSQL store: text compared trimmed, numbers compared as floats,
/// date bounds inclusive. Used for dry runs against exported metadata and
/// by the test suites.

use std::collections::HashMap;

use chrono::NaiveDateTime;

use crate::model::{CodeColumn, HydstraError, Record};
use crate::sql::{
    export_columns, ColumnFilter, DateRange, DeleteScope, FilterOp, FilterValues, MetadataStore,
    Row, SqlValue, TableQuery, TableWriter,
};

#[derive(Debug, Default)]
pub struct MemoryStore {
    /// Rows keyed by source column name.
    tables: HashMap<String, Vec<Row>>,
    queries: usize,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends a row to `table`, creating the table if needed.
    pub fn insert_row(&mut self, table: &str, row: Row) {
        self.tables.entry(table.to_string()).or_default().push(row);
    }

    pub fn rows(&self, table: &str) -> &[Row] {
        self.tables.get(table).map(Vec::as_slice).unwrap_or(&[])
    }

    /// Number of `query` calls served so far.
    pub fn query_count(&self) -> usize {
        self.queries
    }
}

fn filter_matches(row: &Row, filter: &ColumnFilter) -> bool {
    let Some(value) = row.get(&filter.column) else {
        return false;
    };
    match (&filter.values, value) {
        (FilterValues::Text(wanted), SqlValue::Text(s)) => {
            wanted.iter().any(|w| w.trim() == s.trim())
        }
        (FilterValues::Text(wanted), SqlValue::Int(n)) => {
            wanted.iter().any(|w| w.trim() == n.to_string())
        }
        (FilterValues::Number(wanted), SqlValue::Int(n)) => wanted.contains(&(*n as f64)),
        (FilterValues::Number(wanted), SqlValue::Float(n)) => wanted.contains(n),
        (FilterValues::Number(wanted), SqlValue::Text(s)) => s
            .trim()
            .parse::<f64>()
            .map(|n| wanted.contains(&n))
            .unwrap_or(false),
        _ => false,
    }
}

fn in_range(row: &Row, range: &DateRange) -> bool {
    let t: NaiveDateTime = match row.get(&range.column) {
        Some(SqlValue::Timestamp(t)) => *t,
        _ => return false,
    };
    range.from.is_none_or(|from| t >= from) && range.to.is_none_or(|to| t <= to)
}

fn row_matches(row: &Row, filters: &[ColumnFilter], op: FilterOp, range: Option<&DateRange>) -> bool {
    let filtered = if filters.is_empty() {
        true
    } else {
        match op {
            FilterOp::And => filters.iter().all(|f| filter_matches(row, f)),
            FilterOp::Or => filters.iter().any(|f| filter_matches(row, f)),
        }
    };
    filtered && range.is_none_or(|r| in_range(row, r))
}

impl MetadataStore for MemoryStore {
    fn query(&mut self, query: &TableQuery) -> Result<Vec<Row>, HydstraError> {
        self.queries += 1;
        let rows = self
            .tables
            .get(&query.table)
            .ok_or_else(|| HydstraError::Database(format!("no such table: {}", query.table)))?;

        let mut out = Vec::new();
        for row in rows {
            if !row_matches(row, &query.filters, query.filter_op, query.date_range.as_ref()) {
                continue;
            }
            let mut projected = Row::new();
            for (source, name) in &query.columns {
                let value = row.get(source).cloned().ok_or_else(|| {
                    HydstraError::Database(format!("{} has no column {}", query.table, source))
                })?;
                projected.insert(name, value);
            }
            out.push(projected);
        }
        Ok(out)
    }
}

impl TableWriter for MemoryStore {
    fn delete_rows(&mut self, table: &str, scope: &DeleteScope) -> Result<u64, HydstraError> {
        let Some(rows) = self.tables.get_mut(table) else {
            return Ok(0);
        };
        let before = rows.len();
        rows.retain(|row| !row_matches(row, &scope.filters, FilterOp::And, Some(&scope.date_range)));
        Ok((before - rows.len()) as u64)
    }

    fn insert_records(
        &mut self,
        table: &str,
        code_column: CodeColumn,
        records: &[Record],
    ) -> Result<u64, HydstraError> {
        let [site, time, value, quality, code] = export_columns(code_column);
        let rows = self.tables.entry(table.to_string()).or_default();
        for record in records {
            rows.push(
                Row::new()
                    .with(site, SqlValue::Text(record.site.clone()))
                    .with(time, SqlValue::Timestamp(record.time))
                    .with(value, record.value.map_or(SqlValue::Null, SqlValue::Float))
                    .with(quality, SqlValue::Int(record.quality_code as i64))
                    .with(code, SqlValue::Int(record.code as i64)),
            );
        }
        Ok(records.len() as u64)
    }
}
