/// Trace → output table.
///
/// Applied in order: registry relabel and scaling, site-key form, caller
/// code remap, caller quality remap.

use std::collections::HashMap;

use crate::model::{Batch, CodeColumn, QualityCode, Record, Trace};
use crate::variables::{find_variable, SiteKey};

/// Caller-supplied remaps. Codes missing from a map pass through unchanged.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TransformOptions {
    /// Hydstra code → caller's feature/measurement-type id. When set, the
    /// code column is renamed to `FeatureMtypeSourceID`.
    pub code_convert: Option<HashMap<i32, i32>>,
    pub qual_code_convert: Option<HashMap<QualityCode, QualityCode>>,
}

#[derive(Debug, Clone, Default)]
pub struct TransformPipeline {
    options: TransformOptions,
}

impl TransformPipeline {
    pub fn new(options: TransformOptions) -> Self {
        Self { options }
    }

    pub fn apply(&self, trace: Trace) -> Batch {
        let variable = find_variable(trace.varto);
        let (code, scale) = variable
            .and_then(|v| v.relabel)
            .unwrap_or((trace.varto, 1.0));
        let site = match variable.map(|v| v.site_key) {
            Some(SiteKey::SlashDelimited) => trace.site.replace('_', "/"),
            _ => trace.site.clone(),
        };

        let (code, code_column) = match &self.options.code_convert {
            Some(map) => (
                map.get(&code).copied().unwrap_or(code),
                CodeColumn::FeatureMtypeSourceId,
            ),
            None => (code, CodeColumn::HydstraCode),
        };

        let records = trace
            .points
            .into_iter()
            .map(|p| Record {
                site: site.clone(),
                time: p.time,
                value: p.value.map(|v| v * scale),
                quality_code: self
                    .options
                    .qual_code_convert
                    .as_ref()
                    .and_then(|m| m.get(&p.quality).copied())
                    .unwrap_or(p.quality),
                code,
            })
            .collect();

        Batch {
            source_varto: trace.varto,
            code_column,
            records,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::TracePoint;
    use chrono::{NaiveDate, NaiveDateTime};

    fn day(d: u32) -> NaiveDateTime {
        NaiveDate::from_ymd_opt(2018, 1, d)
            .unwrap()
            .and_hms_opt(0, 0, 0)
            .unwrap()
    }

    fn trace(site: &str, varfrom: i32, varto: i32, values: &[(u32, Option<f64>, i32)]) -> Trace {
        Trace {
            site: site.to_string(),
            varfrom,
            varto,
            points: values
                .iter()
                .map(|&(d, value, quality)| TracePoint {
                    time: day(d),
                    value,
                    quality,
                })
                .collect(),
        }
    }

    #[test]
    fn test_derived_flow_is_scaled_and_relabeled() {
        let batch = TransformPipeline::default().apply(trace("70105", 143, 143, &[(1, Some(1000.0), 10)]));
        assert_eq!(batch.records[0].value, Some(1.0));
        assert_eq!(batch.records[0].code, 140);
        assert_eq!(batch.source_varto, 143);
        assert_eq!(batch.code_column, CodeColumn::HydstraCode);
    }

    #[test]
    fn test_missing_value_stays_missing() {
        let batch = TransformPipeline::default().apply(trace("70105", 143, 143, &[(1, None, 10)]));
        assert_eq!(batch.records[0].value, None);
    }

    #[test]
    fn test_well_sites_become_slash_delimited() {
        let batch = TransformPipeline::default().apply(trace("M35_0312", 110, 110, &[(1, Some(4.2), 10)]));
        assert_eq!(batch.records[0].site, "M35/0312");

        let level = TransformPipeline::default().apply(trace("M35_0312", 100, 100, &[(1, Some(4.2), 10)]));
        assert_eq!(level.records[0].site, "M35_0312");
    }

    #[test]
    fn test_code_and_quality_remaps() {
        let options = TransformOptions {
            code_convert: Some(HashMap::from([(140, 5)])),
            qual_code_convert: Some(HashMap::from([(10, 600)])),
        };
        let pipeline = TransformPipeline::new(options);

        let flow = pipeline.apply(trace("70105", 100, 140, &[(1, Some(3.0), 10), (2, Some(4.0), 30)]));
        assert_eq!(flow.code_column, CodeColumn::FeatureMtypeSourceId);
        assert_eq!(flow.records[0].code, 5);
        assert_eq!(flow.records[0].quality_code, 600);
        assert_eq!(flow.records[1].quality_code, 30);

        // unmapped codes pass through, but the column is still renamed
        let rain = pipeline.apply(trace("70105", 10, 10, &[(1, Some(0.2), 10)]));
        assert_eq!(rain.records[0].code, 10);
        assert_eq!(rain.code_column, CodeColumn::FeatureMtypeSourceId);
    }
}
