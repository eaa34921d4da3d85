/// Trace extraction.
///
/// Pulls time series from the server in site chunks so a single
/// `get_ts_traces` answer stays within what the transport can carry. Within
/// a chunk, sites sharing the same (varfrom, varto, from, to) go in one
/// call; differing combinations are never batched together.
///
/// Points whose quality code is outside the accepted set are dropped here,
/// and each trace comes out sorted by time with duplicate timestamps
/// removed.

use chrono::NaiveDateTime;

use crate::config::ExtractConfig;
use crate::logging::{self, Channel};
use crate::model::{HydstraError, Incomplete, Period, QualityCode, Trace, TracePoint, VariableCode};
use crate::rpc::protocol::{RawTrace, TimeBound, TraceParams};
use crate::rpc::{RpcClient, Session, SessionScope};
use crate::variables::{aggregation_for, Aggregation};

/// Splits `sites` into `ceil(len / chunk)` nearly equal consecutive groups,
/// none larger than `chunk`.
pub fn chunk_sites(sites: &[String], chunk: usize) -> Vec<&[String]> {
    if sites.is_empty() {
        return Vec::new();
    }
    let chunk = chunk.max(1);
    let groups = sites.len().div_ceil(chunk);
    let base = sites.len() / groups;
    let extra = sites.len() % groups;

    let mut out = Vec::with_capacity(groups);
    let mut start = 0;
    for i in 0..groups {
        let len = base + usize::from(i < extra);
        out.push(&sites[start..start + len]);
        start += len;
    }
    out
}

/// Keeps accepted points, sorted by time, first point per timestamp.
pub fn accept_points(
    raw: RawTrace,
    accepted: &[QualityCode],
    varfrom: VariableCode,
    varto: VariableCode,
) -> Trace {
    let mut points: Vec<TracePoint> = raw
        .points
        .into_iter()
        .filter_map(|p| {
            let quality = p.quality?;
            accepted.contains(&quality).then_some(TracePoint {
                time: p.time,
                value: p.value,
                quality,
            })
        })
        .collect();
    points.sort_by_key(|p| p.time);
    points.dedup_by_key(|p| p.time);
    Trace {
        site: raw.site,
        varfrom,
        varto,
        points,
    }
}

/// Aggregation for `varto`, or a validation error for codes the registry
/// does not know.
pub fn aggregation(varto: VariableCode) -> Result<Aggregation, HydstraError> {
    aggregation_for(varto).ok_or_else(|| {
        HydstraError::Validation(format!("no aggregation kind known for variable {}", varto))
    })
}

/// One call's worth of work: a set of sites sharing a variable pair and
/// window.
#[derive(Debug, Clone, PartialEq)]
struct Combination {
    varfrom: VariableCode,
    varto: VariableCode,
    from_date: NaiveDateTime,
    to_date: NaiveDateTime,
    sites: Vec<String>,
}

fn combinations(chunk: &[String], periods: &[Period]) -> Vec<Combination> {
    let mut combos: Vec<Combination> = Vec::new();
    for period in periods.iter().filter(|p| chunk.contains(&p.site)) {
        let existing = combos.iter_mut().find(|c| {
            c.varfrom == period.varfrom
                && c.varto == period.varto
                && c.from_date == period.from_date
                && c.to_date == period.to_date
        });
        match existing {
            Some(combo) => {
                if !combo.sites.contains(&period.site) {
                    combo.sites.push(period.site.clone());
                }
            }
            None => combos.push(Combination {
                varfrom: period.varfrom,
                varto: period.varto,
                from_date: period.from_date,
                to_date: period.to_date,
                sites: vec![period.site.clone()],
            }),
        }
    }
    combos
}

pub struct TraceExtractor {
    config: ExtractConfig,
}

impl TraceExtractor {
    pub fn new(config: ExtractConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &ExtractConfig {
        &self.config
    }

    /// Checks every period's target variable before anything is sent.
    pub fn validate(&self, periods: &[Period]) -> Result<(), HydstraError> {
        for period in periods {
            aggregation(period.varto)?;
        }
        Ok(())
    }

    fn params(
        &self,
        sites: Vec<String>,
        varfrom: VariableCode,
        varto: VariableCode,
        start: TimeBound,
        end: TimeBound,
    ) -> Result<TraceParams, HydstraError> {
        Ok(TraceParams {
            sites,
            start,
            end,
            varfrom,
            varto,
            interval: self.config.interval,
            multiplier: self.config.multiplier,
            data_source: self.config.data_source.clone(),
            data_type: aggregation(varto)?,
            report_time: self.config.report_time.clone(),
        })
    }

    /// One `get_ts_traces` call for `sites`, quality-filtered.
    pub fn fetch<R: RpcClient + ?Sized>(
        &self,
        rpc: &mut R,
        sites: &[String],
        varfrom: VariableCode,
        varto: VariableCode,
        start: TimeBound,
        end: TimeBound,
    ) -> Result<Vec<Trace>, HydstraError> {
        let params = self.params(sites.to_vec(), varfrom, varto, start, end)?;
        let raw = rpc.get_ts_traces(params)?;
        Ok(raw
            .into_iter()
            .map(|r| accept_points(r, &self.config.qual_codes, varfrom, varto))
            .collect())
    }

    /// Extracts one variable pair for an arbitrary site list, opening a
    /// fresh session for each chunk.
    pub fn get_ts_data<S: SessionScope + ?Sized>(
        &self,
        client: &mut S,
        sites: &[String],
        varfrom: VariableCode,
        varto: VariableCode,
        start: TimeBound,
        end: TimeBound,
    ) -> Result<Vec<Trace>, Incomplete<Vec<Trace>>> {
        let mut traces = Vec::new();
        if let Err(e) = aggregation(varto) {
            return Err(Incomplete::new(traces, e));
        }
        let mut unique: Vec<String> = Vec::new();
        for site in sites {
            if !unique.contains(site) {
                unique.push(site.clone());
            }
        }

        for chunk in chunk_sites(&unique, self.config.sites_chunk) {
            let result = Session::open(&mut *client).and_then(|mut session| {
                let fetched = self.fetch(&mut *session, chunk, varfrom, varto, start, end)?;
                session.close()?;
                Ok(fetched)
            });
            match result {
                Ok(fetched) => traces.extend(fetched),
                Err(e) => {
                    logging::log_rpc_failure(
                        Channel::Pipeline,
                        chunk.first().map(String::as_str),
                        "get_ts_traces",
                        &e,
                    );
                    return Err(Incomplete::new(traces, e));
                }
            }
        }
        Ok(traces)
    }

    /// Extracts every period within an open session, handing each
    /// non-empty trace to `visit` as soon as it arrives. Returns the number
    /// of traces visited.
    pub fn for_each_trace<R, F>(
        &self,
        rpc: &mut R,
        periods: &[Period],
        mut visit: F,
    ) -> Result<usize, HydstraError>
    where
        R: RpcClient + ?Sized,
        F: FnMut(Trace) -> Result<(), HydstraError>,
    {
        self.validate(periods)?;

        let mut sites: Vec<String> = Vec::new();
        for period in periods {
            if !sites.contains(&period.site) {
                sites.push(period.site.clone());
            }
        }

        let mut visited = 0;
        for chunk in chunk_sites(&sites, self.config.sites_chunk) {
            for combo in combinations(chunk, periods) {
                for site in &combo.sites {
                    logging::info(Channel::Pipeline, Some(site), "Processing site");
                }
                let traces = self
                    .fetch(
                        rpc,
                        &combo.sites,
                        combo.varfrom,
                        combo.varto,
                        TimeBound::At(combo.from_date),
                        TimeBound::At(combo.to_date),
                    )
                    .inspect_err(|e| {
                        logging::log_rpc_failure(
                            Channel::Pipeline,
                            combo.sites.first().map(String::as_str),
                            "get_ts_traces",
                            e,
                        )
                    })?;
                for trace in traces {
                    if trace.is_empty() {
                        logging::debug(Channel::Pipeline, Some(&trace.site), "no accepted points");
                        continue;
                    }
                    visit(trace)?;
                    visited += 1;
                }
            }
        }
        Ok(visited)
    }

    /// Extracts every period within an open session, grouped by site. On
    /// failure the traces extracted so far come back with the error.
    pub fn extract_periods<R: RpcClient + ?Sized>(
        &self,
        rpc: &mut R,
        periods: &[Period],
    ) -> Result<Vec<Trace>, Incomplete<Vec<Trace>>> {
        let mut traces = Vec::new();
        let result = self.for_each_trace(rpc, periods, |trace| {
            traces.push(trace);
            Ok(())
        });
        // calls batch sites per combination; regroup so each site is contiguous
        traces.sort_by(|a, b| a.site.cmp(&b.site));
        match result {
            Ok(_) => Ok(traces),
            Err(e) => Err(Incomplete::new(traces, e)),
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
