/// Top-level client.
///
/// Holds the server connection, the metadata store and one instance of each
/// pipeline component, all injected at construction. Two extraction paths:
/// - `get_ts_data`: one variable pair for a site list, a session per chunk;
/// - `get_ts_data_bulk`: resolve periods, optionally keep only what
///   changed, then extract, transform and export everything over a single
///   session.

use chrono::NaiveDateTime;

use crate::changes::{narrow, ChangeDetector, Changes};
use crate::config::Config;
use crate::export::ExportSink;
use crate::extract::TraceExtractor;
use crate::logging::{self, Channel};
use crate::model::{
    Batch, HydstraError, Incomplete, ModificationWindow, Period, Trace, VariableCode,
};
use crate::resolve::{restrict_to_dates, PeriodRequest, VariablePeriodResolver};
use crate::rpc::protocol::TimeBound;
use crate::rpc::{Session, SessionScope};
use crate::sql::MetadataStore;
use crate::transform::{TransformOptions, TransformPipeline};

/// Everything `get_ts_data_bulk` needs to know about one export run.
#[derive(Debug, Clone, Default)]
pub struct BulkRequest {
    pub varto: Option<Vec<VariableCode>>,
    pub sites: Option<Vec<String>>,
    /// Caller date window; periods are clipped to it.
    pub from_date: Option<NaiveDateTime>,
    pub to_date: Option<NaiveDateTime>,
    /// Only extract what changed since this time.
    pub from_mod_date: Option<NaiveDateTime>,
    /// End of the modification window; defaults to today.
    pub to_mod_date: Option<NaiveDateTime>,
    pub transform: TransformOptions,
    /// Also return the exported batches to the caller.
    pub concat_data: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub enum BulkOutcome {
    /// Change detection found nothing to re-extract.
    Unchanged,
    Completed {
        periods: usize,
        batches: usize,
        records: usize,
        /// Filled only when `concat_data` was requested.
        data: Vec<Batch>,
    },
}

/// Stable sort of concatenated batches so each site's rows are contiguous.
fn order_by_site(batches: &mut [Batch]) {
    batches.sort_by(|a, b| a.sites().first().cmp(&b.sites().first()));
}

pub struct HydstraClient<C: SessionScope, M: MetadataStore> {
    rpc: C,
    store: M,
    data_source: String,
    resolver: VariablePeriodResolver,
    detector: ChangeDetector,
    extractor: TraceExtractor,
}

impl<C: SessionScope, M: MetadataStore> HydstraClient<C, M> {
    pub fn new(
        rpc: C,
        store: M,
        resolver: VariablePeriodResolver,
        detector: ChangeDetector,
        extractor: TraceExtractor,
    ) -> Self {
        let data_source = extractor.config().data_source.clone();
        Self {
            rpc,
            store,
            data_source,
            resolver,
            detector,
            extractor,
        }
    }

    /// Builds every component from its configuration section.
    pub fn from_config(rpc: C, store: M, config: &Config) -> Self {
        Self::new(
            rpc,
            store,
            VariablePeriodResolver::new(config.resolver.clone()),
            ChangeDetector::new(),
            TraceExtractor::new(config.extract.clone()),
        )
    }

    pub fn rpc(&self) -> &C {
        &self.rpc
    }

    pub fn store(&self) -> &M {
        &self.store
    }

    pub fn store_mut(&mut self) -> &mut M {
        &mut self.store
    }

    fn period_request(&self, varto: Option<&[VariableCode]>, sites: Option<&[String]>) -> PeriodRequest {
        PeriodRequest {
            varto: varto.map(<[_]>::to_vec),
            sites: sites.map(<[_]>::to_vec),
            data_source: self.data_source.clone(),
        }
    }

    /// Resolved periods for the given variables and sites.
    pub fn sites_var_periods(
        &mut self,
        varto: Option<&[VariableCode]>,
        sites: Option<&[String]>,
    ) -> Result<Vec<Period>, HydstraError> {
        let request = self.period_request(varto, sites);
        let mut session = Session::open(&mut self.rpc)?;
        let periods = self.resolver.resolve(&mut *session, &mut self.store, &request)?;
        session.close()?;
        Ok(periods)
    }

    /// Archive modifications per (site, varto) since `from_mod`.
    pub fn ts_data_changes(
        &mut self,
        varto: &[VariableCode],
        sites: &[String],
        from_mod: NaiveDateTime,
        to_mod: Option<NaiveDateTime>,
    ) -> Result<Vec<ModificationWindow>, HydstraError> {
        let mut session = Session::open(&mut self.rpc)?;
        let windows = self.detector.block_changes(
            &mut *session,
            sites,
            varto,
            &self.data_source,
            from_mod,
            to_mod,
        )?;
        session.close()?;
        Ok(windows)
    }

    /// One variable pair for `sites` over `start..end`.
    pub fn get_ts_data(
        &mut self,
        sites: &[String],
        varfrom: VariableCode,
        varto: VariableCode,
        start: TimeBound,
        end: TimeBound,
    ) -> Result<Vec<Trace>, Incomplete<Vec<Trace>>> {
        self.extractor
            .get_ts_data(&mut self.rpc, sites, varfrom, varto, start, end)
    }

    /// Resolves, filters, extracts, transforms and exports.
    ///
    /// On failure the sink is closed and the batches produced so far come
    /// back with the error (only when `concat_data` was requested).
    pub fn get_ts_data_bulk(
        &mut self,
        request: &BulkRequest,
        sink: &mut dyn ExportSink,
    ) -> Result<BulkOutcome, Incomplete<Vec<Batch>>> {
        let mut data = Vec::new();
        match self.run_bulk(request, sink, &mut data) {
            Ok(outcome) => Ok(outcome),
            Err(e) => {
                order_by_site(&mut data);
                logging::error(Channel::Pipeline, None, &format!("bulk export failed: {}", e));
                if let Err(close_err) = sink.finish() {
                    logging::warn(Channel::Export, None, &format!("closing sink: {}", close_err));
                }
                Err(Incomplete::new(data, e))
            }
        }
    }

    fn run_bulk(
        &mut self,
        request: &BulkRequest,
        sink: &mut dyn ExportSink,
        data: &mut Vec<Batch>,
    ) -> Result<BulkOutcome, HydstraError> {
        let period_request = self.period_request(request.varto.as_deref(), request.sites.as_deref());
        let mut session = Session::open(&mut self.rpc)?;

        let periods = self
            .resolver
            .resolve(&mut *session, &mut self.store, &period_request)?;
        let mut periods = restrict_to_dates(periods, request.from_date, request.to_date);

        if let Some(from_mod) = request.from_mod_date {
            let changes = self.detector.detect(
                &mut *session,
                &mut self.store,
                &periods,
                &self.data_source,
                from_mod,
                request.to_mod_date,
            )?;
            match changes {
                Changes::Unchanged => {
                    session.close()?;
                    return Ok(BulkOutcome::Unchanged);
                }
                Changes::Changed(marks) => periods = narrow(&periods, &marks),
            }
        }

        self.extractor.validate(&periods)?;
        sink.prepare(&periods)?;

        let pipeline = TransformPipeline::new(request.transform.clone());
        let mut batches = 0;
        let mut records = 0;
        self.extractor.for_each_trace(&mut *session, &periods, |trace| {
            let batch = pipeline.apply(trace);
            sink.write_batch(&batch)?;
            batches += 1;
            records += batch.len();
            if request.concat_data {
                data.push(batch);
            }
            Ok(())
        })?;

        sink.finish()?;
        session.close()?;
        logging::log_export_summary(
            Channel::Pipeline,
            periods.len(),
            batches,
            periods.len().saturating_sub(batches),
        );

        order_by_site(data);
        Ok(BulkOutcome::Completed {
            periods: periods.len(),
            batches,
            records,
            data: std::mem::take(data),
        })
    }
}
