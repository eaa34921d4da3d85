/// Change detection for incremental extraction.
///
/// Two sources say that stored values moved since the last export:
/// - archive blocks rewritten within the modification window (direct
///   variables), collapsed to one window per (site, varto);
/// - ratings released within the window (flow derived from level), which
///   invalidate everything from the rating's effective time on.
///
/// Each becomes a `ChangeMark`, and `narrow` cuts resolved periods down to
/// start at their mark.

use std::collections::BTreeMap;

use chrono::{Local, NaiveDateTime, NaiveTime};

use crate::logging::{self, Channel};
use crate::model::{
    ChangeMark, HydstraError, ModificationWindow, Period, VariableCode, VAR_FLOW,
};
use crate::rpc::protocol::BlockInfoParams;
use crate::rpc::RpcClient;
use crate::sql::hydstra;
use crate::sql::MetadataStore;

/// Result of looking for changes.
#[derive(Debug, Clone, PartialEq)]
pub enum Changes {
    /// Neither source reported anything in the window.
    Unchanged,
    Changed(Vec<ChangeMark>),
}

pub struct ChangeDetector {
    today: NaiveDateTime,
}

impl Default for ChangeDetector {
    fn default() -> Self {
        Self::new()
    }
}

impl ChangeDetector {
    /// Open-ended windows end at local midnight today.
    pub fn new() -> Self {
        Self::at(Local::now().date_naive().and_time(NaiveTime::MIN))
    }

    /// Detector with a fixed "today", for replays and tests.
    pub fn at(today: NaiveDateTime) -> Self {
        Self { today }
    }

    /// Archive modifications per (site, varto) within `from_mod..to_mod`.
    ///
    /// Block spans are collapsed to the earliest start and latest end.
    pub fn block_changes<R: RpcClient + ?Sized>(
        &self,
        rpc: &mut R,
        sites: &[String],
        varto: &[VariableCode],
        data_source: &str,
        from_mod: NaiveDateTime,
        to_mod: Option<NaiveDateTime>,
    ) -> Result<Vec<ModificationWindow>, HydstraError> {
        if sites.is_empty() || varto.is_empty() {
            return Ok(Vec::new());
        }
        let mut params = BlockInfoParams::new(sites.to_vec());
        params.data_sources = vec![data_source.to_string()];
        params.variables = varto.to_vec();
        params.start_modified = from_mod;
        params.end_modified = to_mod.unwrap_or(self.today);

        let blocks = rpc.get_ts_blockinfo(params)?;

        let mut collapsed: BTreeMap<(String, VariableCode), (NaiveDateTime, NaiveDateTime)> =
            BTreeMap::new();
        for block in blocks {
            collapsed
                .entry((block.site, block.varto))
                .and_modify(|(from, to)| {
                    *from = (*from).min(block.from_mod_date);
                    *to = (*to).max(block.to_mod_date);
                })
                .or_insert((block.from_mod_date, block.to_mod_date));
        }

        Ok(collapsed
            .into_iter()
            .map(|((site, varto), (from_mod_date, to_mod_date))| ModificationWindow {
                site,
                varto,
                from_mod_date,
                to_mod_date,
            })
            .collect())
    }

    /// Looks for changes affecting `periods` within the modification window.
    pub fn detect<R, M>(
        &self,
        rpc: &mut R,
        store: &mut M,
        periods: &[Period],
        data_source: &str,
        from_mod: NaiveDateTime,
        to_mod: Option<NaiveDateTime>,
    ) -> Result<Changes, HydstraError>
    where
        R: RpcClient + ?Sized,
        M: MetadataStore + ?Sized,
    {
        let mut marks = Vec::new();

        let direct: Vec<&Period> = periods.iter().filter(|p| !p.is_converted()).collect();
        let direct_sites = unique(direct.iter().map(|p| p.site.clone()));
        let direct_vars = unique(direct.iter().map(|p| p.varto));
        for window in
            self.block_changes(rpc, &direct_sites, &direct_vars, data_source, from_mod, to_mod)?
        {
            marks.push(ChangeMark {
                site: window.site,
                varfrom: window.varto,
                varto: window.varto,
                mod_date: window.from_mod_date,
                to_mod_date: Some(window.to_mod_date),
            });
        }

        let flow_sites = unique(
            periods
                .iter()
                .filter(|p| p.is_converted() && p.varto == VAR_FLOW)
                .map(|p| p.site.clone()),
        );
        if !flow_sites.is_empty() {
            for change in hydstra::rating_changes(store, Some(&flow_sites), from_mod, to_mod)? {
                marks.push(ChangeMark {
                    site: change.site,
                    varfrom: change.varfrom,
                    varto: change.varto,
                    mod_date: change.effective_date,
                    to_mod_date: None,
                });
            }
        }

        if marks.is_empty() {
            let until = to_mod.unwrap_or(self.today);
            logging::info(
                Channel::Pipeline,
                None,
                &format!("no data changed between {} and {}", from_mod, until),
            );
            return Ok(Changes::Unchanged);
        }
        Ok(Changes::Changed(marks))
    }
}

fn unique<T: Ord>(items: impl Iterator<Item = T>) -> Vec<T> {
    let mut items: Vec<T> = items.collect();
    items.sort();
    items.dedup();
    items
}

/// Keeps the periods that have a change mark, each starting no earlier than
/// its earliest mark. Periods ending at or before their mark, or whose
/// marks all ended before the period starts, are dropped.
pub fn narrow(periods: &[Period], marks: &[ChangeMark]) -> Vec<Period> {
    let mut narrowed = Vec::new();
    for period in periods {
        let earliest = marks
            .iter()
            .filter(|m| {
                m.site == period.site && m.varfrom == period.varfrom && m.varto == period.varto
            })
            .filter_map(|m| period.narrowed_by(m))
            .min_by_key(|p| p.from_date);
        if let Some(p) = earliest {
            narrowed.push(p);
        }
    }
    narrowed
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rpc::protocol::{BlockInfo, RpcRequest, RpcReturn};
    use crate::sql::memory::MemoryStore;
    use crate::sql::{Row, SqlValue};
    use chrono::NaiveDate;

    fn day(y: i32, m: u32, d: u32) -> NaiveDateTime {
        NaiveDate::from_ymd_opt(y, m, d)
            .unwrap()
            .and_hms_opt(0, 0, 0)
            .unwrap()
    }

    /// Answers get_ts_blockinfo with fixed blocks and records the params.
    #[derive(Default)]
    struct BlockServer {
        blocks: Vec<BlockInfo>,
        seen: Vec<BlockInfoParams>,
    }

    impl RpcClient for BlockServer {
        fn call(&mut self, request: &RpcRequest) -> Result<RpcReturn, HydstraError> {
            match request {
                RpcRequest::TsBlockinfo(params) => {
                    self.seen.push(params.clone());
                    Ok(RpcReturn::TsBlockinfo(self.blocks.clone()))
                }
                other => Err(HydstraError::Decode(format!("unexpected {}", other.function()))),
            }
        }
    }

    fn block(site: &str, varto: VariableCode, from: NaiveDateTime, to: NaiveDateTime) -> BlockInfo {
        BlockInfo {
            site: site.to_string(),
            data_source: "A".to_string(),
            varto,
            from_mod_date: from,
            to_mod_date: to,
        }
    }

    fn empty_rating_store() -> MemoryStore {
        let mut store = MemoryStore::new();
        store.insert_row(
            "RATEHED",
            Row::new()
                .with("STATION", SqlValue::Text("70105".into()))
                .with("TABLE", SqlValue::Int(1))
                .with("RELDATE", SqlValue::Timestamp(day(2001, 1, 1))),
        );
        store
    }

    fn level(site: &str) -> Period {
        Period::new(site, 100, 100, day(1990, 1, 1), day(2018, 6, 1)).unwrap()
    }

    #[test]
    fn test_nothing_modified_is_unchanged() {
        let detector = ChangeDetector::at(day(2018, 8, 1));
        let mut server = BlockServer::default();
        let mut store = MemoryStore::new();
        let changes = detector
            .detect(
                &mut server,
                &mut store,
                &[level("70105")],
                "A",
                day(2018, 1, 1),
                Some(day(2018, 7, 26)),
            )
            .unwrap();
        assert_eq!(changes, Changes::Unchanged);
        assert_eq!(server.seen[0].variables, vec![100]);
        assert_eq!(server.seen[0].end_modified, day(2018, 7, 26));
    }

    #[test]
    fn test_open_window_ends_today() {
        let detector = ChangeDetector::at(day(2018, 8, 1));
        let mut server = BlockServer::default();
        detector
            .block_changes(&mut server, &["70105".to_string()], &[100], "A", day(2018, 1, 1), None)
            .unwrap();
        assert_eq!(server.seen[0].end_modified, day(2018, 8, 1));
        assert_eq!(server.seen[0].start_modified, day(2018, 1, 1));
    }

    #[test]
    fn test_blocks_collapse_per_site_and_variable() {
        let detector = ChangeDetector::at(day(2018, 8, 1));
        let mut server = BlockServer {
            blocks: vec![
                block("70105", 100, day(2017, 3, 1), day(2017, 4, 1)),
                block("70105", 100, day(2016, 1, 1), day(2016, 2, 1)),
                block("70105", 10, day(2017, 5, 1), day(2017, 6, 1)),
            ],
            ..Default::default()
        };
        let windows = detector
            .block_changes(&mut server, &["70105".to_string()], &[10, 100], "A", day(2018, 1, 1), None)
            .unwrap();
        assert_eq!(windows.len(), 2);
        assert_eq!(windows[1].varto, 100);
        assert_eq!(windows[1].from_mod_date, day(2016, 1, 1));
        assert_eq!(windows[1].to_mod_date, day(2017, 4, 1));
    }

    #[test]
    fn test_rating_release_marks_derived_flow() {
        let detector = ChangeDetector::at(day(2018, 8, 1));
        let mut server = BlockServer::default();
        let mut store = empty_rating_store();
        store.insert_row(
            "RATEHED",
            Row::new()
                .with("STATION", SqlValue::Text("70105".into()))
                .with("TABLE", SqlValue::Int(2))
                .with("RELDATE", SqlValue::Timestamp(day(2018, 3, 1))),
        );
        store.insert_row(
            "RATEPER",
            Row::new()
                .with("STATION", SqlValue::Text("70105".into()))
                .with("SDATE", SqlValue::Timestamp(day(2017, 10, 1)))
                .with("STIME", SqlValue::Int(0))
                .with("REFTAB", SqlValue::Int(2)),
        );
        let flow = Period::new("70105", 100, 140, day(1990, 1, 1), day(2018, 6, 1)).unwrap();

        let changes = detector
            .detect(&mut server, &mut store, &[flow.clone()], "A", day(2018, 1, 1), None)
            .unwrap();
        let Changes::Changed(marks) = changes else {
            panic!("expected a rating change");
        };
        assert!(server.seen.is_empty(), "no direct periods, no blockinfo call");

        let narrowed = narrow(&[flow], &marks);
        assert_eq!(narrowed.len(), 1);
        assert_eq!(narrowed[0].from_date, day(2017, 10, 1));
    }

    #[test]
    fn test_narrow_drops_unmarked_and_expired_periods() {
        let marks = vec![
            ChangeMark {
                site: "70105".into(),
                varfrom: 100,
                varto: 100,
                mod_date: day(2018, 7, 1),
                to_mod_date: Some(day(2018, 7, 2)),
            },
            ChangeMark {
                site: "69607".into(),
                varfrom: 100,
                varto: 100,
                mod_date: day(2000, 1, 1),
                to_mod_date: None,
            },
        ];
        let periods = vec![level("70105"), level("69607"), level("12345")];
        let narrowed = narrow(&periods, &marks);
        assert_eq!(narrowed.len(), 1);
        assert_eq!(narrowed[0].site, "69607");
        assert_eq!(narrowed[0].from_date, day(2000, 1, 1));
        assert_eq!(narrow(&narrowed, &marks), narrowed);
    }

    #[test]
    fn test_blocks_entirely_before_period_start_drop_it() {
        let detector = ChangeDetector::at(day(2018, 8, 1));
        let mut server = BlockServer {
            blocks: vec![block("70105", 100, day(2005, 1, 1), day(2006, 1, 1))],
            ..Default::default()
        };
        let mut store = MemoryStore::new();
        let period = Period::new("70105", 100, 100, day(2010, 1, 1), day(2018, 6, 1)).unwrap();

        let changes = detector
            .detect(&mut server, &mut store, &[period.clone()], "A", day(2018, 1, 1), None)
            .unwrap();
        let Changes::Changed(marks) = changes else {
            panic!("the block is a change");
        };
        assert_eq!(marks[0].to_mod_date, Some(day(2006, 1, 1)));
        assert!(narrow(&[period], &marks).is_empty());
    }
}
