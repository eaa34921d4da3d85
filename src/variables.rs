/// Variable registry for the Hydstra extraction pipeline.
///
/// Defines the variable codes this service knows how to extract, along with
/// the aggregation Hydstra should apply when resampling them and any
/// relabeling applied on the way out. This is the single source of truth for
/// per-variable data corrections; the transform and extract modules look
/// variables up here rather than hardcoding codes.

use serde::{Deserialize, Serialize};

use crate::model::{
    VariableCode, VAR_DERIVED_FLOW, VAR_FLOW, VAR_RAINFALL, VAR_WATER_LEVEL, VAR_WELL_LEVEL,
};

// ---------------------------------------------------------------------------
// Aggregation kinds
// ---------------------------------------------------------------------------

/// How `get_ts_traces` aggregates raw points into each output interval.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Aggregation {
    Mean,
    Total,
}

impl Aggregation {
    /// The `data_type` string expected by `get_ts_traces`.
    pub fn as_data_type(&self) -> &'static str {
        match self {
            Aggregation::Mean => "mean",
            Aggregation::Total => "tot",
        }
    }
}

/// Which form the site id takes in the output table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SiteKey {
    /// As extracted.
    Raw,
    /// Underscores rewritten to slashes (well numbers such as "M35/0312"
    /// are stored as "M35_0312").
    SlashDelimited,
}

// ---------------------------------------------------------------------------
// Variable metadata
// ---------------------------------------------------------------------------

/// Metadata for a single Hydstra variable code.
pub struct Variable {
    pub code: VariableCode,
    pub name: &'static str,
    pub aggregation: Aggregation,
    /// Code and scale factor the values are relabeled to on output, if the
    /// variable is recorded under a non-canonical code.
    pub relabel: Option<(VariableCode, f64)>,
    pub site_key: SiteKey,
}

/// All variables the pipeline can extract.
pub static VARIABLE_REGISTRY: &[Variable] = &[
    Variable {
        code: VAR_WATER_LEVEL,
        name: "Water level",
        aggregation: Aggregation::Mean,
        relabel: None,
        site_key: SiteKey::Raw,
    },
    Variable {
        code: VAR_FLOW,
        name: "Flow",
        aggregation: Aggregation::Mean,
        relabel: None,
        site_key: SiteKey::Raw,
    },
    Variable {
        code: VAR_DERIVED_FLOW,
        name: "Flow (derived, l/s)",
        aggregation: Aggregation::Mean,
        relabel: Some((VAR_FLOW, 0.001)),
        site_key: SiteKey::Raw,
    },
    Variable {
        code: 450,
        name: "Water temperature",
        aggregation: Aggregation::Mean,
        relabel: None,
        site_key: SiteKey::Raw,
    },
    Variable {
        code: VAR_WELL_LEVEL,
        name: "Well level",
        aggregation: Aggregation::Mean,
        relabel: None,
        site_key: SiteKey::SlashDelimited,
    },
    Variable {
        code: 130,
        name: "Groundwater level",
        aggregation: Aggregation::Mean,
        relabel: None,
        site_key: SiteKey::Raw,
    },
    Variable {
        code: VAR_RAINFALL,
        name: "Rainfall",
        aggregation: Aggregation::Total,
        relabel: None,
        site_key: SiteKey::Raw,
    },
];

/// Looks up a variable by code. Returns `None` if not registered.
pub fn find_variable(code: VariableCode) -> Option<&'static Variable> {
    VARIABLE_REGISTRY.iter().find(|v| v.code == code)
}

/// Aggregation to request for `code`, if it is registered.
pub fn aggregation_for(code: VariableCode) -> Option<Aggregation> {
    find_variable(code).map(|v| v.aggregation)
}

/// Codes queried for block info when the caller does not narrow them.
pub fn default_blockinfo_variables() -> Vec<VariableCode> {
    vec![100, 10, 110, 140, 130, 143, 450]
}

// ---------------------------------------------------------------------------
// Resolver exclusions
// ---------------------------------------------------------------------------

/// A (site, varfrom, varto) combination known to hold bad period records.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Exclusion {
    pub site: String,
    pub varfrom: VariableCode,
    pub varto: VariableCode,
}

/// Sites whose direct 140 → 140 period rows must be ignored.
pub const EXCLUDED_DIRECT_FLOW_SITES: &[&str] = &["165131", "69302", "71106", "366425"];

/// Placeholder code present in PERIOD that never carries data.
pub const UNUSED_VARIABLE: VariableCode = 101;

/// The stock exclusion list, used when configuration does not override it.
pub fn default_exclusions() -> Vec<Exclusion> {
    EXCLUDED_DIRECT_FLOW_SITES
        .iter()
        .map(|site| Exclusion {
            site: site.to_string(),
            varfrom: VAR_FLOW,
            varto: VAR_FLOW,
        })
        .collect()
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_no_duplicate_variable_codes() {
        let mut seen = std::collections::HashSet::new();
        for variable in VARIABLE_REGISTRY {
            assert!(
                seen.insert(variable.code),
                "duplicate variable code {} in VARIABLE_REGISTRY",
                variable.code
            );
        }
    }

    #[test]
    fn test_every_blockinfo_default_is_registered() {
        for code in default_blockinfo_variables() {
            assert!(
                find_variable(code).is_some(),
                "blockinfo default {} missing from registry",
                code
            );
        }
    }

    #[test]
    fn test_rainfall_is_totalled_everything_else_averaged() {
        assert_eq!(aggregation_for(VAR_RAINFALL), Some(Aggregation::Total));
        assert_eq!(aggregation_for(VAR_FLOW), Some(Aggregation::Mean));
        assert_eq!(aggregation_for(VAR_WELL_LEVEL).unwrap().as_data_type(), "mean");
        assert_eq!(Aggregation::Total.as_data_type(), "tot");
    }

    #[test]
    fn test_unknown_code_has_no_aggregation() {
        assert!(aggregation_for(999).is_none());
    }

    #[test]
    fn test_relabel_targets_are_registered_and_not_chained() {
        // A relabel pointing at another relabeled code would need two passes.
        for variable in VARIABLE_REGISTRY {
            if let Some((target, _)) = variable.relabel {
                let target_var = find_variable(target).expect("relabel target registered");
                assert!(target_var.relabel.is_none(), "chained relabel for {}", variable.code);
            }
        }
    }

    #[test]
    fn test_derived_flow_relabels_to_flow_in_cubic_metres() {
        let derived = find_variable(VAR_DERIVED_FLOW).unwrap();
        assert_eq!(derived.relabel, Some((VAR_FLOW, 0.001)));
    }

    #[test]
    fn test_default_exclusions_cover_direct_flow_only() {
        let exclusions = default_exclusions();
        assert_eq!(exclusions.len(), 4);
        assert!(exclusions.iter().all(|e| e.varfrom == 140 && e.varto == 140));
        assert!(exclusions.iter().any(|e| e.site == "69302"));
    }
}
