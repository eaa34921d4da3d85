/// Variable period resolution.
///
/// Answers "which (site, varfrom, varto) conversions exist, and over what
/// window?" by combining PERIOD (what conversions are configured) with the
/// server's variable list (what each site has actually recorded). Flow
/// derived from level borrows the level window, starting no earlier than the
/// site's first rating.

use std::collections::{BTreeSet, HashMap};

use chrono::NaiveDateTime;

use crate::config::ResolverConfig;
use crate::logging::{self, Channel};
use crate::model::{HydstraError, Period, VariableCode, VAR_FLOW, VAR_WATER_LEVEL};
use crate::rpc::protocol::VariablePeriod;
use crate::rpc::RpcClient;
use crate::sql::hydstra::{self, SiteVariable};
use crate::sql::MetadataStore;

/// Which sites and variables to resolve.
#[derive(Debug, Clone, PartialEq)]
pub struct PeriodRequest {
    /// Target variable codes; `None` for all.
    pub varto: Option<Vec<VariableCode>>,
    /// Site ids; `None` for every site in the data source.
    pub sites: Option<Vec<String>>,
    pub data_source: String,
}

impl PeriodRequest {
    pub fn new(data_source: &str) -> Self {
        Self {
            varto: None,
            sites: None,
            data_source: data_source.to_string(),
        }
    }

    pub fn varto(mut self, codes: &[VariableCode]) -> Self {
        self.varto = Some(codes.to_vec());
        self
    }

    pub fn sites(mut self, sites: &[&str]) -> Self {
        self.sites = Some(sites.iter().map(|s| s.to_string()).collect());
        self
    }
}

/// Site ids in requests may use either separator for well numbers.
fn site_key(site: &str) -> String {
    site.trim().replace('/', "_")
}

pub struct VariablePeriodResolver {
    config: ResolverConfig,
}

impl VariablePeriodResolver {
    pub fn new(config: ResolverConfig) -> Self {
        Self { config }
    }

    /// One period per valid (site, varfrom, varto), sorted by site, then
    /// varto, then varfrom.
    pub fn resolve<R, M>(
        &self,
        rpc: &mut R,
        store: &mut M,
        request: &PeriodRequest,
    ) -> Result<Vec<Period>, HydstraError>
    where
        R: RpcClient + ?Sized,
        M: MetadataStore + ?Sized,
    {
        let mut site_vars = hydstra::sites_var(
            store,
            &request.data_source,
            request.varto.as_deref(),
            &self.config,
        )?;

        if let Some(sites) = &request.sites {
            let wanted: BTreeSet<String> = sites.iter().map(|s| site_key(s)).collect();
            site_vars.retain(|sv| wanted.contains(&site_key(&sv.site)));
        }
        if site_vars.is_empty() {
            logging::info(Channel::Pipeline, None, "no matching site/variable combinations");
            return Ok(Vec::new());
        }

        let sites: Vec<String> = site_vars
            .iter()
            .map(|sv| sv.site.clone())
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect();

        let recorded = rpc.get_variable_list(&sites, &request.data_source)?;
        let windows: HashMap<(&str, VariableCode), &VariablePeriod> = recorded
            .iter()
            .map(|vp| ((vp.site.as_str(), vp.varto), vp))
            .collect();

        let mut periods = Vec::new();

        // Directly recorded variables: their own window.
        for sv in site_vars.iter().filter(|sv| sv.varfrom == sv.varto) {
            if let Some(window) = windows.get(&(sv.site.as_str(), sv.varto)) {
                push_period(&mut periods, sv, window.from_date, window.to_date);
            }
        }

        // Flow derived from level: the level window, clamped to ratings.
        let derived: Vec<&SiteVariable> = site_vars
            .iter()
            .filter(|sv| sv.varfrom == VAR_WATER_LEVEL && sv.varto == VAR_FLOW)
            .collect();
        if !derived.is_empty() {
            let derived_sites: Vec<String> = derived.iter().map(|sv| sv.site.clone()).collect();
            let first_ratings: HashMap<String, NaiveDateTime> =
                hydstra::rating_starts(store, &derived_sites)?
                    .into_iter()
                    .map(|r| (r.site, r.effective_date))
                    .collect();

            for sv in derived {
                let Some(level) = windows.get(&(sv.site.as_str(), VAR_WATER_LEVEL)) else {
                    continue;
                };
                let mut from_date = level.from_date;
                if let Some(&first) = first_ratings.get(&sv.site) {
                    if first >= level.to_date {
                        logging::debug(
                            Channel::Pipeline,
                            Some(&sv.site),
                            "first rating starts after the level record ends",
                        );
                        continue;
                    }
                    from_date = from_date.max(first);
                }
                push_period(&mut periods, sv, from_date, level.to_date);
            }
        }

        periods.sort_by(|a, b| {
            (&a.site, a.varto, a.varfrom).cmp(&(&b.site, b.varto, b.varfrom))
        });
        Ok(periods)
    }
}

fn push_period(
    periods: &mut Vec<Period>,
    sv: &SiteVariable,
    from_date: NaiveDateTime,
    to_date: NaiveDateTime,
) {
    match Period::new(&sv.site, sv.varfrom, sv.varto, from_date, to_date) {
        Ok(period) => periods.push(period),
        Err(e) => logging::warn(Channel::Pipeline, Some(&sv.site), &e.to_string()),
    }
}

/// Intersects every period with the caller's date window, dropping those
/// left empty.
pub fn restrict_to_dates(
    periods: Vec<Period>,
    from_date: Option<NaiveDateTime>,
    to_date: Option<NaiveDateTime>,
) -> Vec<Period> {
    if from_date.is_none() && to_date.is_none() {
        return periods;
    }
    periods
        .iter()
        .filter_map(|p| p.clamp_to(from_date, to_date))
        .collect()
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rpc::protocol::{RpcRequest, RpcReturn};
    use crate::sql::memory::MemoryStore;
    use crate::sql::{Row, SqlValue};
    use chrono::NaiveDate;

    fn day(y: i32, m: u32, d: u32) -> NaiveDateTime {
        NaiveDate::from_ymd_opt(y, m, d)
            .unwrap()
            .and_hms_opt(0, 0, 0)
            .unwrap()
    }

    /// Answers get_variable_list from a fixed table, limited to the
    /// requested sites.
    struct VariableListServer {
        recorded: Vec<VariablePeriod>,
        calls: usize,
    }

    impl RpcClient for VariableListServer {
        fn call(&mut self, request: &RpcRequest) -> Result<RpcReturn, HydstraError> {
            self.calls += 1;
            match request {
                RpcRequest::VariableList { sites, .. } => Ok(RpcReturn::VariableList(
                    self.recorded
                        .iter()
                        .filter(|vp| sites.contains(&vp.site))
                        .cloned()
                        .collect(),
                )),
                other => Err(HydstraError::Decode(format!("unexpected {}", other.function()))),
            }
        }
    }

    fn recorded(site: &str, varto: VariableCode, from: NaiveDateTime, to: NaiveDateTime) -> VariablePeriod {
        VariablePeriod {
            site: site.to_string(),
            varto,
            var_name: String::new(),
            units: String::new(),
            from_date: from,
            to_date: to,
        }
    }

    fn period_row(site: &str, varfrom: i64, varto: i64) -> Row {
        Row::new()
            .with("STATION", SqlValue::Text(site.to_string()))
            .with("VARFROM", SqlValue::Int(varfrom))
            .with("VARIABLE", SqlValue::Int(varto))
            .with("DATASOURCE", SqlValue::Text("A".to_string()))
    }

    fn rateper_row(site: &str, sdate: NaiveDateTime) -> Row {
        Row::new()
            .with("STATION", SqlValue::Text(site.to_string()))
            .with("SDATE", SqlValue::Timestamp(sdate))
            .with("STIME", SqlValue::Int(0))
            .with("REFTAB", SqlValue::Int(1))
    }

    fn two_gauge_store() -> MemoryStore {
        let mut store = MemoryStore::new();
        for row in [
            period_row("70105", 100, 100),
            period_row("70105", 100, 140),
            period_row("69607", 100, 100),
            period_row("69607", 100, 140),
        ] {
            store.insert_row("PERIOD", row);
        }
        store.insert_row("RATEPER", rateper_row("70105", day(1995, 1, 1)));
        store.insert_row("RATEPER", rateper_row("69607", day(1980, 1, 1)));
        store
    }

    fn two_gauge_server() -> VariableListServer {
        VariableListServer {
            recorded: vec![
                recorded("70105", 100, day(1990, 1, 1), day(2018, 1, 1)),
                recorded("69607", 100, day(1985, 1, 1), day(2018, 1, 1)),
            ],
            calls: 0,
        }
    }

    #[test]
    fn test_flow_request_yields_one_derived_row_per_site() {
        let resolver = VariablePeriodResolver::new(ResolverConfig::default());
        let mut server = two_gauge_server();
        let mut store = two_gauge_store();
        let request = PeriodRequest::new("A").varto(&[140]).sites(&["70105", "69607"]);

        let periods = resolver.resolve(&mut server, &mut store, &request).unwrap();

        assert_eq!(periods.len(), 2);
        assert!(periods.iter().all(|p| p.varfrom == 100 && p.varto == 140));
        assert_eq!(periods[0].site, "69607");
        assert_eq!(periods[0].from_date, day(1985, 1, 1));
        assert_eq!(periods[1].site, "70105");
        // level record begins before the first rating
        assert_eq!(periods[1].from_date, day(1995, 1, 1));
        assert_eq!(server.calls, 1);
    }

    #[test]
    fn test_all_variables_include_direct_and_derived() {
        let resolver = VariablePeriodResolver::new(ResolverConfig::default());
        let mut server = two_gauge_server();
        let mut store = two_gauge_store();
        let periods = resolver
            .resolve(&mut server, &mut store, &PeriodRequest::new("A").sites(&["70105"]))
            .unwrap();
        let triples: Vec<_> = periods.iter().map(|p| (p.varfrom, p.varto)).collect();
        assert_eq!(triples, vec![(100, 100), (100, 140)]);
    }

    #[test]
    fn test_rating_after_level_record_drops_derived_period() {
        let mut store = two_gauge_store();
        store.insert_row("RATEPER", rateper_row("11111", day(2019, 1, 1)));
        store.insert_row("PERIOD", period_row("11111", 100, 140));
        let mut server = VariableListServer {
            recorded: vec![recorded("11111", 100, day(2000, 1, 1), day(2018, 1, 1))],
            calls: 0,
        };
        let resolver = VariablePeriodResolver::new(ResolverConfig::default());
        let request = PeriodRequest::new("A").varto(&[140]).sites(&["11111"]);
        assert!(resolver.resolve(&mut server, &mut store, &request).unwrap().is_empty());
    }

    #[test]
    fn test_no_matching_sites_makes_no_server_call() {
        let resolver = VariablePeriodResolver::new(ResolverConfig::default());
        let mut server = two_gauge_server();
        let mut store = two_gauge_store();
        let request = PeriodRequest::new("A").sites(&["99999"]);
        assert!(resolver.resolve(&mut server, &mut store, &request).unwrap().is_empty());
        assert_eq!(server.calls, 0);
    }

    #[test]
    fn test_restrict_to_dates_clamps_and_drops() {
        let periods = vec![
            Period::new("70105", 100, 100, day(1990, 1, 1), day(2018, 1, 1)).unwrap(),
            Period::new("69607", 100, 100, day(1985, 1, 1), day(1986, 1, 1)).unwrap(),
        ];
        let restricted = restrict_to_dates(periods, Some(day(2000, 1, 1)), None);
        assert_eq!(restricted.len(), 1);
        assert_eq!(restricted[0].from_date, day(2000, 1, 1));
    }
}
