//! Finding classification and confidence scoring
//!
//! Every enumerated path becomes a finding with a vulnerability name, a
//! severity and a confidence score. Confidence starts at certainty and
//! pays a fixed penalty for each precision-losing circumstance the path
//! crossed; findings under the configured threshold are reported
//! separately as low-confidence.

use serde::{Deserialize, Serialize};

use crate::catalog::VulnCategory;
use crate::config::EngineConfig;
use crate::paths::TaintPath;

/// Taint passed a sanitizer of a different category.
pub const PENALTY_SANITIZER_BYPASS: f32 = 0.10;
/// The flow spans more than one file.
pub const PENALTY_FILE_CROSSING: f32 = 0.15;
/// The flow crossed a call the resolver could not follow.
pub const PENALTY_UNRESOLVED_BOUNDARY: f32 = 0.30;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Critical,
    High,
    Medium,
    Low,
}

impl Severity {
    pub fn as_str(&self) -> &'static str {
        match self {
            Severity::Critical => "critical",
            Severity::High => "high",
            Severity::Medium => "medium",
            Severity::Low => "low",
        }
    }

    /// Code-execution categories at high confidence are critical;
    /// everything else steps down with confidence.
    fn assess(category: VulnCategory, confidence: f32) -> Self {
        let executes_code = matches!(
            category,
            VulnCategory::Sql | VulnCategory::Command | VulnCategory::Deserialization
        );
        if confidence >= 0.8 {
            if executes_code {
                Severity::Critical
            } else {
                Severity::High
            }
        } else if confidence >= 0.5 {
            Severity::Medium
        } else {
            Severity::Low
        }
    }
}

/// A classified taint path, ready for reporting and persistence.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Finding {
    pub vulnerability: String,
    pub category: VulnCategory,
    pub severity: Severity,
    pub confidence: f32,
    pub path: TaintPath,
}

pub struct Classifier<'a> {
    config: &'a EngineConfig,
}

impl<'a> Classifier<'a> {
    pub fn new(config: &'a EngineConfig) -> Self {
        Self { config }
    }

    pub fn score(&self, path: &TaintPath) -> f32 {
        let mut confidence = 1.0f32;
        if path.sanitizer_bypassed {
            confidence -= PENALTY_SANITIZER_BYPASS;
        }
        if path.crosses_files {
            confidence -= PENALTY_FILE_CROSSING;
        }
        if path.crosses_unresolved {
            confidence -= PENALTY_UNRESOLVED_BOUNDARY;
        }
        confidence.max(0.0)
    }

    pub fn classify(&self, path: TaintPath) -> Finding {
        let confidence = self.score(&path);
        let category = path.sink.category;
        Finding {
            vulnerability: category.vulnerability_name().to_string(),
            category,
            severity: Severity::assess(category, confidence),
            confidence,
            path,
        }
    }

    /// True when the finding clears the reporting threshold.
    pub fn is_primary(&self, finding: &Finding) -> bool {
        finding.confidence >= self.config.confidence_threshold
    }
}

/// Drop repeated `(source, sink, category)` findings, keeping the shortest
/// path (ties: highest confidence). Input order is irrelevant; output is
/// sorted and stable.
pub fn deduplicate(mut findings: Vec<Finding>) -> Vec<Finding> {
    findings.sort_by(|a, b| {
        let ka = (
            a.path.source.call_site,
            a.path.sink.call_site,
            a.category,
            a.path.steps.len(),
        );
        let kb = (
            b.path.source.call_site,
            b.path.sink.call_site,
            b.category,
            b.path.steps.len(),
        );
        ka.cmp(&kb)
            .then(b.confidence.partial_cmp(&a.confidence).unwrap_or(std::cmp::Ordering::Equal))
    });
    findings.dedup_by(|next, kept| {
        kept.path.source.call_site == next.path.source.call_site
            && kept.path.sink.call_site == next.path.sink.call_site
            && kept.category == next.category
    });
    findings
}
