// ============================================================
// Layer 3 — Metric Reports
// ============================================================
// Metrics close into an ordered map of named values. Some values
// are scalars (perplexity, bleu) and some are per-example token
// lists (post / resp / gen) used only for the result file.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum MetricValue {
    Float(f64),
    Int(i64),
    Text(String),
    Tokens(Vec<Vec<String>>),
}

impl MetricValue {
    pub fn is_scalar(&self) -> bool {
        !matches!(self, MetricValue::Tokens(_))
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            MetricValue::Float(v) => Some(*v),
            MetricValue::Int(v)   => Some(*v as f64),
            _ => None,
        }
    }
}

/// Ordered so the result file and logs are stable across runs.
pub type MetricReport = BTreeMap<String, MetricValue>;

/// The scalar-typed subset of a report, suitable for comparing runs.
pub fn scalars(report: &MetricReport) -> MetricReport {
    report
        .iter()
        .filter(|(_, v)| v.is_scalar())
        .map(|(k, v)| (k.clone(), v.clone()))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_scalars_drop_token_lists() {
        let mut report = MetricReport::new();
        report.insert("perplexity".into(), MetricValue::Float(12.5));
        report.insert("count".into(), MetricValue::Int(3));
        report.insert("name".into(), MetricValue::Text("run".into()));
        report.insert("gen".into(), MetricValue::Tokens(vec![vec!["hi".into()]]));

        let s = scalars(&report);
        assert_eq!(s.len(), 3);
        assert!(!s.contains_key("gen"));
        assert_eq!(s["count"].as_f64(), Some(3.0));
    }
}
