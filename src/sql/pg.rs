/// PostgreSQL store.
///
/// Serves `TableQuery` against a mirror of the Hydstra tables and writes
/// export batches. Statements are built from quoted identifiers with every
/// value bound as a parameter; list filters use `= ANY($n)`.

use chrono::{DateTime, NaiveDate, NaiveDateTime, NaiveTime, Utc};
use postgres::types::{ToSql, Type};
use postgres::{Client, NoTls};

use crate::logging::{self, Channel};
use crate::model::{CodeColumn, HydstraError, Record};
use crate::sql::{
    export_columns, ColumnFilter, DateRange, DeleteScope, FilterOp, FilterValues, MetadataStore,
    Row, SqlValue, TableQuery, TableWriter,
};

pub struct PgStore {
    client: Client,
}

impl PgStore {
    pub fn connect(database_url: &str) -> Result<Self, HydstraError> {
        let client = Client::connect(database_url, NoTls)?;
        Ok(Self { client })
    }

    pub fn from_client(client: Client) -> Self {
        Self { client }
    }
}

// ---------------------------------------------------------------------------
// Statement building
// ---------------------------------------------------------------------------

type Param = Box<dyn ToSql + Sync>;

/// Quotes a possibly schema-qualified identifier. Only ASCII letters,
/// digits and underscores are accepted in each part.
pub fn quote_ident(name: &str) -> Result<String, HydstraError> {
    let mut parts = Vec::new();
    for part in name.split('.') {
        let valid = !part.is_empty()
            && part.chars().all(|c| c.is_ascii_alphanumeric() || c == '_');
        if !valid {
            return Err(HydstraError::Validation(format!("invalid identifier: '{}'", name)));
        }
        parts.push(format!("\"{}\"", part));
    }
    Ok(parts.join("."))
}

fn filter_clause(filter: &ColumnFilter, params: &mut Vec<Param>) -> Result<String, HydstraError> {
    let column = quote_ident(&filter.column)?;
    match &filter.values {
        FilterValues::Text(values) => {
            let trimmed: Vec<String> = values.iter().map(|v| v.trim().to_string()).collect();
            params.push(Box::new(trimmed));
            Ok(format!("trim({}::text) = ANY(${})", column, params.len()))
        }
        FilterValues::Number(values) => {
            params.push(Box::new(values.clone()));
            Ok(format!("{}::float8 = ANY(${})", column, params.len()))
        }
    }
}

fn range_clauses(range: &DateRange, params: &mut Vec<Param>) -> Result<Vec<String>, HydstraError> {
    let column = quote_ident(&range.column)?;
    let mut clauses = Vec::new();
    if let Some(from) = range.from {
        params.push(Box::new(from));
        clauses.push(format!("{} >= ${}", column, params.len()));
    }
    if let Some(to) = range.to {
        params.push(Box::new(to));
        clauses.push(format!("{} <= ${}", column, params.len()));
    }
    Ok(clauses)
}

fn where_clause(
    filters: &[ColumnFilter],
    op: FilterOp,
    range: Option<&DateRange>,
    params: &mut Vec<Param>,
) -> Result<String, HydstraError> {
    let mut clauses = Vec::new();
    if !filters.is_empty() {
        let parts = filters
            .iter()
            .map(|f| filter_clause(f, params))
            .collect::<Result<Vec<_>, _>>()?;
        let joiner = match op {
            FilterOp::And => " AND ",
            FilterOp::Or => " OR ",
        };
        clauses.push(format!("({})", parts.join(joiner)));
    }
    if let Some(range) = range {
        clauses.extend(range_clauses(range, params)?);
    }
    if clauses.is_empty() {
        return Ok(String::new());
    }
    Ok(format!(" WHERE {}", clauses.join(" AND ")))
}

/// Builds the SELECT for `query` and its bound parameters.
pub fn build_select(query: &TableQuery) -> Result<(String, Vec<Param>), HydstraError> {
    if query.columns.is_empty() {
        return Err(HydstraError::Validation(format!(
            "query on {} selects no columns",
            query.table
        )));
    }
    let columns = query
        .columns
        .iter()
        .map(|(source, name)| Ok(format!("{} AS {}", quote_ident(source)?, quote_ident(name)?)))
        .collect::<Result<Vec<_>, HydstraError>>()?;

    let mut params = Vec::new();
    let filter = where_clause(
        &query.filters,
        query.filter_op,
        query.date_range.as_ref(),
        &mut params,
    )?;
    let sql = format!(
        "SELECT {} FROM {}{}",
        columns.join(", "),
        quote_ident(&query.table)?,
        filter
    );
    Ok((sql, params))
}

pub fn build_delete(table: &str, scope: &DeleteScope) -> Result<(String, Vec<Param>), HydstraError> {
    let mut params = Vec::new();
    let filter = where_clause(&scope.filters, FilterOp::And, Some(&scope.date_range), &mut params)?;
    Ok((format!("DELETE FROM {}{}", quote_ident(table)?, filter), params))
}

pub fn build_insert(table: &str, code_column: CodeColumn) -> Result<String, HydstraError> {
    let columns = export_columns(code_column)
        .iter()
        .map(|c| quote_ident(c))
        .collect::<Result<Vec<_>, _>>()?;
    Ok(format!(
        "INSERT INTO {} ({}) VALUES ($1, $2, $3, $4, $5)",
        quote_ident(table)?,
        columns.join(", ")
    ))
}

// ---------------------------------------------------------------------------
// Row decoding
// ---------------------------------------------------------------------------

fn decode_value(row: &postgres::Row, idx: usize) -> Result<SqlValue, HydstraError> {
    let column = &row.columns()[idx];
    let ty = column.type_();
    let value = if [Type::TEXT, Type::VARCHAR, Type::BPCHAR, Type::NAME].contains(ty) {
        row.try_get::<_, Option<String>>(idx)?.map(SqlValue::Text)
    } else if *ty == Type::INT2 {
        row.try_get::<_, Option<i16>>(idx)?.map(|n| SqlValue::Int(n as i64))
    } else if *ty == Type::INT4 {
        row.try_get::<_, Option<i32>>(idx)?.map(|n| SqlValue::Int(n as i64))
    } else if *ty == Type::INT8 {
        row.try_get::<_, Option<i64>>(idx)?.map(SqlValue::Int)
    } else if *ty == Type::FLOAT4 {
        row.try_get::<_, Option<f32>>(idx)?.map(|n| SqlValue::Float(n as f64))
    } else if *ty == Type::FLOAT8 {
        row.try_get::<_, Option<f64>>(idx)?.map(SqlValue::Float)
    } else if *ty == Type::TIMESTAMP {
        row.try_get::<_, Option<NaiveDateTime>>(idx)?.map(SqlValue::Timestamp)
    } else if *ty == Type::TIMESTAMPTZ {
        row.try_get::<_, Option<DateTime<Utc>>>(idx)?
            .map(|t| SqlValue::Timestamp(t.naive_utc()))
    } else if *ty == Type::DATE {
        row.try_get::<_, Option<NaiveDate>>(idx)?
            .map(|d| SqlValue::Timestamp(d.and_time(NaiveTime::MIN)))
    } else {
        return Err(HydstraError::Decode(format!(
            "column {} has unsupported type {}",
            column.name(),
            ty
        )));
    };
    Ok(value.unwrap_or(SqlValue::Null))
}

fn param_refs(params: &[Param]) -> Vec<&(dyn ToSql + Sync)> {
    params.iter().map(|p| p.as_ref()).collect()
}

impl MetadataStore for PgStore {
    fn query(&mut self, query: &TableQuery) -> Result<Vec<Row>, HydstraError> {
        let (sql, params) = build_select(query)?;
        logging::debug(Channel::Sql, None, &sql);

        let rows = self.client.query(sql.as_str(), &param_refs(&params))?;

        let mut out = Vec::with_capacity(rows.len());
        for row in &rows {
            let mut decoded = Row::new();
            for (idx, (_, name)) in query.columns.iter().enumerate() {
                decoded.insert(name, decode_value(row, idx)?);
            }
            out.push(decoded);
        }
        Ok(out)
    }
}

impl TableWriter for PgStore {
    fn delete_rows(&mut self, table: &str, scope: &DeleteScope) -> Result<u64, HydstraError> {
        let (sql, params) = build_delete(table, scope)?;
        logging::debug(Channel::Sql, None, &sql);
        Ok(self.client.execute(sql.as_str(), &param_refs(&params))?)
    }

    fn insert_records(
        &mut self,
        table: &str,
        code_column: CodeColumn,
        records: &[Record],
    ) -> Result<u64, HydstraError> {
        if records.is_empty() {
            return Ok(0);
        }
        let sql = build_insert(table, code_column)?;
        let mut tx = self.client.transaction()?;
        let statement = tx.prepare(&sql)?;
        for record in records {
            tx.execute(
                &statement,
                &[
                    &record.site,
                    &record.time,
                    &record.value,
                    &record.quality_code,
                    &record.code,
                ],
            )?;
        }
        tx.commit()?;
        Ok(records.len() as u64)
    }
}
