/// JSON call protocol spoken by hydllp and the Hydstra web service.
///
/// Every call is a `{function, version, params}` object; every answer is an
/// envelope `{error_num, error_msg?, buff_required?, return?}`. Requests are
/// modelled as one enum variant per function, and each variant has its own
/// decoder for the `return` payload, so a payload of the wrong shape surfaces
/// as `HydstraError::Decode` instead of a missing field further down.

use chrono::{Datelike, NaiveDate, NaiveDateTime, Timelike};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::model::{normalize_site, HydstraError, QualityCode, VariableCode};
use crate::variables::Aggregation;

/// `error_num` meaning the response buffer was too small; the envelope
/// then carries the size needed in `buff_required`.
pub const BUFFER_TOO_SMALL: i64 = 200;

/// Timestamp layout used in both directions.
pub const RPC_TIME_FORMAT: &str = "%Y%m%d%H%M%S";

// ============================================================================
// Time encoding
// ============================================================================

/// Resampling interval for `get_ts_traces`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Interval {
    Year,
    Month,
    #[default]
    Day,
    Hour,
    Minute,
    Second,
    Period,
}

impl Interval {
    pub fn as_str(&self) -> &'static str {
        match self {
            Interval::Year => "year",
            Interval::Month => "month",
            Interval::Day => "day",
            Interval::Hour => "hour",
            Interval::Minute => "minute",
            Interval::Second => "second",
            Interval::Period => "period",
        }
    }
}

fn epoch_1900() -> NaiveDateTime {
    NaiveDate::from_ymd_opt(1900, 1, 1)
        .and_then(|d| d.and_hms_opt(0, 0, 0))
        .unwrap_or_default()
}

/// Encodes a timestamp for a request.
///
/// From 1900-01-01 on, the standard `YYYYMMDDhhmmss` layout is used. Earlier
/// timestamps are written field by field with no separators, and carry a
/// `.ffffff` fraction when they have sub-second precision.
pub fn encode_rpc_time(t: NaiveDateTime) -> String {
    if t >= epoch_1900() {
        return t.format(RPC_TIME_FORMAT).to_string();
    }
    let mut compact = format!(
        "{:04}{:02}{:02}{:02}{:02}{:02}",
        t.year(),
        t.month(),
        t.day(),
        t.hour(),
        t.minute(),
        t.second()
    );
    let micros = t.nanosecond() / 1_000;
    if micros != 0 {
        compact.push_str(&format!(".{:06}", micros));
    }
    compact
}

/// Parses a `YYYYMMDDhhmmss` timestamp from a response.
pub fn parse_rpc_time(text: &str) -> Result<NaiveDateTime, HydstraError> {
    NaiveDateTime::parse_from_str(text.trim(), RPC_TIME_FORMAT)
        .map_err(|e| HydstraError::Decode(format!("bad timestamp '{}': {}", text, e)))
}

/// Start or end of a trace request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimeBound {
    /// All recorded data on that side (sent as `0`).
    All,
    At(NaiveDateTime),
}

impl TimeBound {
    fn to_json(self) -> Value {
        match self {
            TimeBound::All => json!(0),
            TimeBound::At(t) => json!(encode_rpc_time(t)),
        }
    }
}

// ============================================================================
// Best-effort coercion
// ============================================================================

/// Reads a number the server may have sent as a JSON number or a string.
/// Anything else, including NaN, becomes `None` (the missing-value marker).
pub fn coerce_number(value: &Value) -> Option<f64> {
    let n = match value {
        Value::Number(n) => n.as_f64()?,
        Value::String(s) => s.trim().parse::<f64>().ok()?,
        _ => return None,
    };
    if n.is_nan() { None } else { Some(n) }
}

/// Reads an integral code (quality or variable). Non-integral numbers are
/// treated as missing.
pub fn coerce_code(value: &Value) -> Option<i32> {
    let n = coerce_number(value)?;
    if n.fract() != 0.0 || n < i32::MIN as f64 || n > i32::MAX as f64 {
        return None;
    }
    Some(n as i32)
}

fn coerce_site(value: &Value) -> Result<String, HydstraError> {
    match value {
        Value::String(s) => Ok(normalize_site(s)),
        Value::Number(n) => Ok(n.to_string()),
        other => Err(HydstraError::Decode(format!("site is not a string: {}", other))),
    }
}

// ============================================================================
// Requests
// ============================================================================

/// Parameters for `get_ts_blockinfo`.
#[derive(Debug, Clone, PartialEq)]
pub struct BlockInfoParams {
    pub sites: Vec<String>,
    pub data_sources: Vec<String>,
    pub variables: Vec<VariableCode>,
    pub start: NaiveDateTime,
    pub end: NaiveDateTime,
    pub start_modified: NaiveDateTime,
    pub end_modified: NaiveDateTime,
}

impl BlockInfoParams {
    /// Block info over the whole archive for `sites`, with the stock
    /// variable list and data source `A`.
    pub fn new(sites: Vec<String>) -> Self {
        let open_start = epoch_1900();
        let open_end = NaiveDate::from_ymd_opt(2100, 1, 1)
            .and_then(|d| d.and_hms_opt(0, 0, 0))
            .unwrap_or_default();
        Self {
            sites,
            data_sources: vec!["A".to_string()],
            variables: crate::variables::default_blockinfo_variables(),
            start: open_start,
            end: open_end,
            start_modified: open_start,
            end_modified: open_end,
        }
    }
}

/// Parameters for `get_ts_traces`.
#[derive(Debug, Clone, PartialEq)]
pub struct TraceParams {
    pub sites: Vec<String>,
    pub start: TimeBound,
    pub end: TimeBound,
    pub varfrom: VariableCode,
    pub varto: VariableCode,
    pub interval: Interval,
    pub multiplier: u32,
    pub data_source: String,
    pub data_type: Aggregation,
    pub report_time: Option<String>,
}

/// One call to the server.
#[derive(Debug, Clone, PartialEq)]
pub enum RpcRequest {
    /// Expand a site list expression (e.g. `"TSFILES(DSOURCES(A))"`).
    SiteList { expression: String },
    VariableList { sites: Vec<String>, data_source: String },
    SitesByDatasource { data_sources: Vec<String> },
    TsBlockinfo(BlockInfoParams),
    TsTraces(TraceParams),
}

#[derive(Serialize)]
struct RequestEnvelope<'a> {
    function: &'a str,
    version: u32,
    params: Value,
}

fn join_sites(sites: &[String]) -> String {
    sites.join(",")
}

impl RpcRequest {
    pub fn function(&self) -> &'static str {
        match self {
            RpcRequest::SiteList { .. } => "get_site_list",
            RpcRequest::VariableList { .. } => "get_variable_list",
            RpcRequest::SitesByDatasource { .. } => "get_sites_by_datasource",
            RpcRequest::TsBlockinfo(_) => "get_ts_blockinfo",
            RpcRequest::TsTraces(_) => "get_ts_traces",
        }
    }

    pub fn version(&self) -> u32 {
        match self {
            RpcRequest::TsBlockinfo(_) | RpcRequest::TsTraces(_) => 2,
            _ => 1,
        }
    }

    pub fn params(&self) -> Value {
        match self {
            RpcRequest::SiteList { expression } => json!({ "site_list": expression }),
            RpcRequest::VariableList { sites, data_source } => json!({
                "site_list": join_sites(sites),
                "datasource": data_source,
            }),
            RpcRequest::SitesByDatasource { data_sources } => {
                json!({ "datasources": data_sources })
            }
            RpcRequest::TsBlockinfo(p) => json!({
                "site_list": join_sites(&p.sites),
                "datasources": p.data_sources,
                "variables": p.variables.iter().map(|v| v.to_string()).collect::<Vec<_>>(),
                "starttime": encode_rpc_time(p.start),
                "endtime": encode_rpc_time(p.end),
                "start_modified": encode_rpc_time(p.start_modified),
                "end_modified": encode_rpc_time(p.end_modified),
            }),
            RpcRequest::TsTraces(p) => json!({
                "site_list": join_sites(&p.sites),
                "start_time": p.start.to_json(),
                "end_time": p.end.to_json(),
                "varfrom": p.varfrom,
                "varto": p.varto,
                "interval": p.interval.as_str(),
                "datasource": p.data_source,
                "data_type": p.data_type.as_data_type(),
                "multiplier": p.multiplier,
                "report_time": p.report_time,
            }),
        }
    }

    /// Serializes the request as sent over the wire.
    pub fn to_json(&self) -> Result<String, HydstraError> {
        let envelope = RequestEnvelope {
            function: self.function(),
            version: self.version(),
            params: self.params(),
        };
        Ok(serde_json::to_string(&envelope)?)
    }
}

// ============================================================================
// Response envelope
// ============================================================================

/// Outer shape of every answer.
#[derive(Debug, Deserialize)]
pub struct ResponseEnvelope {
    pub error_num: i64,
    #[serde(default)]
    pub error_msg: Option<String>,
    #[serde(default)]
    pub buff_required: Option<usize>,
    #[serde(rename = "return", default)]
    pub payload: Option<Value>,
}

impl ResponseEnvelope {
    pub fn parse(text: &str) -> Result<ResponseEnvelope, HydstraError> {
        // The library pads its fixed buffer with NULs.
        let trimmed = text.trim_end_matches('\0').trim();
        Ok(serde_json::from_str(trimmed)?)
    }

    /// Buffer size requested by a `BUFFER_TOO_SMALL` answer, wherever the
    /// server put it.
    pub fn buffer_required(&self) -> Option<usize> {
        self.buff_required.or_else(|| {
            self.payload
                .as_ref()
                .and_then(|p| p.get("buff_required"))
                .and_then(|v| v.as_u64())
                .map(|n| n as usize)
        })
    }

    /// Converts a non-zero status into a protocol error and hands back the
    /// `return` payload otherwise.
    pub fn into_payload(self) -> Result<Value, HydstraError> {
        if self.error_num != 0 {
            return Err(HydstraError::Protocol {
                code: self.error_num,
                message: self.error_msg.unwrap_or_default(),
            });
        }
        self.payload.ok_or_else(|| HydstraError::Protocol {
            code: 0,
            message: "error_num is 0, however no 'return' was found".to_string(),
        })
    }
}

// ============================================================================
// Decoded returns
// ============================================================================

/// Availability of one variable at one site, from `get_variable_list`.
#[derive(Debug, Clone, PartialEq)]
pub struct VariablePeriod {
    pub site: String,
    pub varto: VariableCode,
    pub var_name: String,
    pub units: String,
    pub from_date: NaiveDateTime,
    pub to_date: NaiveDateTime,
}

/// Sites carrying a data source, from `get_sites_by_datasource`.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct DatasourceSites {
    pub datasource: String,
    #[serde(default)]
    pub sites: Vec<String>,
}

/// One archive block touched within the modification range.
#[derive(Debug, Clone, PartialEq)]
pub struct BlockInfo {
    pub site: String,
    pub data_source: String,
    pub varto: VariableCode,
    pub from_mod_date: NaiveDateTime,
    pub to_mod_date: NaiveDateTime,
}

/// A trace as sent by the server, before quality filtering.
#[derive(Debug, Clone, PartialEq)]
pub struct RawTrace {
    pub site: String,
    pub points: Vec<RawPoint>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct RawPoint {
    pub time: NaiveDateTime,
    pub value: Option<f64>,
    pub quality: Option<QualityCode>,
}

/// Decoded `return` payload, one variant per request variant.
#[derive(Debug, Clone, PartialEq)]
pub enum RpcReturn {
    SiteList(Vec<String>),
    VariableList(Vec<VariablePeriod>),
    SitesByDatasource(Vec<DatasourceSites>),
    TsBlockinfo(Vec<BlockInfo>),
    TsTraces(Vec<RawTrace>),
}

#[derive(Deserialize)]
struct SiteListWire {
    sites: Vec<Value>,
}

#[derive(Deserialize)]
struct VariableListWire {
    sites: Vec<SiteVariablesWire>,
}

#[derive(Deserialize)]
struct SiteVariablesWire {
    site: Value,
    #[serde(default)]
    variables: Vec<VariableWire>,
}

#[derive(Deserialize)]
struct VariableWire {
    variable: Value,
    #[serde(default)]
    name: String,
    #[serde(default)]
    units: String,
    period_start: String,
    period_end: String,
}

#[derive(Deserialize)]
struct SitesByDatasourceWire {
    datasources: Vec<DatasourceSites>,
}

#[derive(Deserialize)]
struct BlockInfoWire {
    #[serde(default)]
    blocks: Vec<BlockWire>,
}

#[derive(Deserialize)]
struct BlockWire {
    site: Value,
    #[serde(default)]
    datasource: String,
    variable: Value,
    starttime: String,
    endtime: String,
}

#[derive(Deserialize)]
struct TracesWire {
    #[serde(default)]
    traces: Vec<SiteTraceWire>,
}

#[derive(Deserialize)]
struct SiteTraceWire {
    site: Value,
    #[serde(default)]
    trace: Vec<PointWire>,
}

#[derive(Deserialize)]
struct PointWire {
    t: String,
    #[serde(default)]
    v: Value,
    #[serde(default)]
    q: Value,
}

fn decode_wire<T: serde::de::DeserializeOwned>(
    function: &str,
    payload: Value,
) -> Result<T, HydstraError> {
    serde_json::from_value(payload)
        .map_err(|e| HydstraError::Decode(format!("{} return: {}", function, e)))
}

impl RpcReturn {
    /// Name of the function this return answers.
    pub fn function(&self) -> &'static str {
        match self {
            RpcReturn::SiteList(_) => "get_site_list",
            RpcReturn::VariableList(_) => "get_variable_list",
            RpcReturn::SitesByDatasource(_) => "get_sites_by_datasource",
            RpcReturn::TsBlockinfo(_) => "get_ts_blockinfo",
            RpcReturn::TsTraces(_) => "get_ts_traces",
        }
    }

    /// Decodes the `return` payload of `request`.
    pub fn decode(request: &RpcRequest, payload: Value) -> Result<RpcReturn, HydstraError> {
        let function = request.function();
        match request {
            RpcRequest::SiteList { .. } => {
                let wire: SiteListWire = decode_wire(function, payload)?;
                let sites = wire
                    .sites
                    .iter()
                    .map(coerce_site)
                    .collect::<Result<Vec<_>, _>>()?;
                Ok(RpcReturn::SiteList(sites))
            }
            RpcRequest::VariableList { .. } => {
                let wire: VariableListWire = decode_wire(function, payload)?;
                Ok(RpcReturn::VariableList(decode_variable_list(wire)?))
            }
            RpcRequest::SitesByDatasource { .. } => {
                let wire: SitesByDatasourceWire = decode_wire(function, payload)?;
                Ok(RpcReturn::SitesByDatasource(wire.datasources))
            }
            RpcRequest::TsBlockinfo(_) => {
                let wire: BlockInfoWire = decode_wire(function, payload)?;
                Ok(RpcReturn::TsBlockinfo(decode_blocks(wire)?))
            }
            RpcRequest::TsTraces(_) => {
                let wire: TracesWire = decode_wire(function, payload)?;
                Ok(RpcReturn::TsTraces(decode_traces(wire)?))
            }
        }
    }
}

fn decode_variable_list(wire: VariableListWire) -> Result<Vec<VariablePeriod>, HydstraError> {
    let mut periods: Vec<VariablePeriod> = Vec::new();
    for site_vars in wire.sites {
        let site = coerce_site(&site_vars.site)?;
        for var in site_vars.variables {
            // Sub-variables such as 100.01 are not extractable targets.
            let Some(varto) = coerce_code(&var.variable) else {
                continue;
            };
            let period = VariablePeriod {
                site: site.clone(),
                varto,
                var_name: var.name,
                units: var.units,
                from_date: parse_rpc_time(&var.period_start)?,
                to_date: parse_rpc_time(&var.period_end)?,
            };
            if !periods.contains(&period) {
                periods.push(period);
            }
        }
    }
    Ok(periods)
}

fn decode_blocks(wire: BlockInfoWire) -> Result<Vec<BlockInfo>, HydstraError> {
    let mut blocks = Vec::with_capacity(wire.blocks.len());
    for block in wire.blocks {
        let Some(varto) = coerce_code(&block.variable) else {
            continue;
        };
        blocks.push(BlockInfo {
            site: coerce_site(&block.site)?,
            data_source: block.datasource,
            varto,
            from_mod_date: parse_rpc_time(&block.starttime)?,
            to_mod_date: parse_rpc_time(&block.endtime)?,
        });
    }
    blocks.sort_by(|a, b| {
        (a.site.as_str(), a.varto, a.from_mod_date).cmp(&(b.site.as_str(), b.varto, b.from_mod_date))
    });
    Ok(blocks)
}

fn decode_traces(wire: TracesWire) -> Result<Vec<RawTrace>, HydstraError> {
    let mut traces = Vec::with_capacity(wire.traces.len());
    for site_trace in wire.traces {
        let site = coerce_site(&site_trace.site)?;
        let mut points = Vec::with_capacity(site_trace.trace.len());
        for point in site_trace.trace {
            points.push(RawPoint {
                time: parse_rpc_time(&point.t)?,
                value: coerce_number(&point.v),
                quality: coerce_code(&point.q),
            });
        }
        traces.push(RawTrace { site, points });
    }
    Ok(traces)
}

// ============================================================================
// Tests
// ============================================================================
