/// Typed queries over the Hydstra metadata tables.
///
/// PERIOD    — which (site, varfrom, varto) conversions exist per data source.
/// RATEHED   — rating table headers, with their release date.
/// RATEPER   — rating periods: when each rating table takes effect.

use std::collections::BTreeMap;

use chrono::{Duration, NaiveDateTime};

use crate::config::ResolverConfig;
use crate::logging::{self, Channel};
use crate::model::{
    normalize_site, HydstraError, RatingChange, VariableCode, VAR_FLOW, VAR_WATER_LEVEL,
};
use crate::sql::{MetadataStore, Row, TableQuery};

/// A conversion recorded in PERIOD.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub struct SiteVariable {
    pub site: String,
    pub varfrom: VariableCode,
    pub varto: VariableCode,
}

fn integral_code(value: f64) -> Option<VariableCode> {
    if value.is_finite() && value.fract() == 0.0 {
        Some(value as VariableCode)
    } else {
        None
    }
}

fn code_column(row: &Row, column: &str) -> Option<VariableCode> {
    row.number(column).ok().and_then(integral_code)
}

/// Sites and conversions available in `data_source`, optionally limited to
/// the given target variables.
///
/// Non-integral codes, the unused variable and configured exclusions are
/// dropped. One row per (site, varfrom, varto), sorted.
pub fn sites_var<M: MetadataStore + ?Sized>(
    store: &mut M,
    data_source: &str,
    varto: Option<&[VariableCode]>,
    resolver: &ResolverConfig,
) -> Result<Vec<SiteVariable>, HydstraError> {
    let mut query = TableQuery::new("PERIOD")
        .column("STATION", "site")
        .column("VARFROM", "varfrom")
        .column("VARIABLE", "varto")
        .filter_text("DATASOURCE", &[data_source.to_string()]);
    if let Some(codes) = varto {
        let codes: Vec<f64> = codes.iter().map(|&c| c as f64).collect();
        query = query.filter_number("VARIABLE", &codes);
    }

    let mut found = Vec::new();
    for row in store.query(&query)? {
        let site = normalize_site(&row.text("site")?);
        let (Some(varfrom), Some(varto)) = (code_column(&row, "varfrom"), code_column(&row, "varto"))
        else {
            logging::debug(Channel::Sql, Some(&site), "skipping non-integral variable in PERIOD");
            continue;
        };
        if varto == resolver.unused_variable {
            continue;
        }
        let excluded = resolver
            .exclusions
            .iter()
            .any(|e| e.site == site && e.varfrom == varfrom && e.varto == varto);
        if excluded {
            continue;
        }
        found.push(SiteVariable {
            site,
            varfrom,
            varto,
        });
    }
    found.sort();
    found.dedup();
    Ok(found)
}

// ---------------------------------------------------------------------------
// Ratings
// ---------------------------------------------------------------------------

/// One RATEPER row with its start time resolved.
#[derive(Debug, Clone, PartialEq)]
struct RatingPeriod {
    site: String,
    reftab: f64,
    start: NaiveDateTime,
}

/// Adds an HHMM start time (e.g. 930 = 09:30) to a start date.
pub fn apply_hhmm(date: NaiveDateTime, hhmm: i64) -> NaiveDateTime {
    date + Duration::hours(hhmm / 100) + Duration::minutes(hhmm % 100)
}

fn rating_periods<M: MetadataStore + ?Sized>(
    store: &mut M,
    sites: &[String],
) -> Result<Vec<RatingPeriod>, HydstraError> {
    if sites.is_empty() {
        return Ok(Vec::new());
    }
    let query = TableQuery::new("RATEPER")
        .column("STATION", "site")
        .column("SDATE", "sdate")
        .column("STIME", "stime")
        .column("REFTAB", "reftab")
        .filter_text("STATION", sites)
        .any_filter();

    let mut periods = Vec::new();
    for row in store.query(&query)? {
        let hhmm = row.number("stime").unwrap_or(0.0) as i64;
        periods.push(RatingPeriod {
            site: normalize_site(&row.text("site")?),
            reftab: row.number("reftab")?,
            start: apply_hhmm(row.timestamp("sdate")?, hhmm),
        });
    }
    Ok(periods)
}

fn earliest_per_site<'a>(
    periods: impl Iterator<Item = &'a RatingPeriod>,
) -> Vec<RatingChange> {
    let mut earliest: BTreeMap<&str, NaiveDateTime> = BTreeMap::new();
    for period in periods {
        earliest
            .entry(period.site.as_str())
            .and_modify(|t| *t = (*t).min(period.start))
            .or_insert(period.start);
    }
    earliest
        .into_iter()
        .map(|(site, effective_date)| RatingChange {
            site: site.to_string(),
            varfrom: VAR_WATER_LEVEL,
            varto: VAR_FLOW,
            effective_date,
        })
        .collect()
}

/// First rating start per site, whenever it was released.
pub fn rating_starts<M: MetadataStore + ?Sized>(
    store: &mut M,
    sites: &[String],
) -> Result<Vec<RatingChange>, HydstraError> {
    let periods = rating_periods(store, sites)?;
    Ok(earliest_per_site(periods.iter()))
}

/// Ratings released within `from_mod..=to_mod`, reduced to the earliest
/// time at which any of them takes effect per site.
///
/// Release dates come from RATEHED; the effective time is the RATEPER
/// start of the same (site, table).
pub fn rating_changes<M: MetadataStore + ?Sized>(
    store: &mut M,
    sites: Option<&[String]>,
    from_mod: NaiveDateTime,
    to_mod: Option<NaiveDateTime>,
) -> Result<Vec<RatingChange>, HydstraError> {
    let mut query = TableQuery::new("RATEHED")
        .column("STATION", "site")
        .column("TABLE", "reftab")
        .column("RELDATE", "released")
        .dates("RELDATE", Some(from_mod), to_mod);
    if let Some(sites) = sites {
        if sites.is_empty() {
            return Ok(Vec::new());
        }
        query = query.filter_text("STATION", sites);
    }

    let mut released: Vec<(String, f64)> = Vec::new();
    for row in store.query(&query)? {
        released.push((normalize_site(&row.text("site")?), row.number("reftab")?));
    }
    if released.is_empty() {
        return Ok(Vec::new());
    }

    let mut rated_sites: Vec<String> = released.iter().map(|(site, _)| site.clone()).collect();
    rated_sites.sort();
    rated_sites.dedup();

    let periods = rating_periods(store, &rated_sites)?;
    let matched = periods
        .iter()
        .filter(|p| released.iter().any(|(site, reftab)| *site == p.site && *reftab == p.reftab));
    let changes = earliest_per_site(matched);

    logging::debug(
        Channel::Sql,
        None,
        &format!("{} site(s) with new ratings", changes.len()),
    );
    Ok(changes)
}
