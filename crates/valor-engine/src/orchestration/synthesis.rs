//! Aggregation of per-capability results into a [`ValidationResult`].
//!
//! Everything here is a pure function of its inputs: the same results map
//! always yields the same scores and the same recommendation order.

use std::collections::BTreeMap;

use crate::workflow::types::clamp_unit;
use crate::workflow::{AgentResult, Capability, QualityFlag, ValidationResult};

/// Spread between the most and least confident agents that warrants a flag.
const DIVERGENCE_THRESHOLD: f64 = 0.5;

/// Confidence below which the recommendations call for more data.
const LOW_CONFIDENCE: f64 = 0.5;

/// Fixed share of each capability in the overall score. Sums to 1.
pub const fn base_weight(capability: Capability) -> f64 {
    match capability {
        Capability::RegulatoryCompliance | Capability::RiskAssessment => 0.20,
        Capability::MarketAnalysis
        | Capability::CustomerIntelligence
        | Capability::FraudDetection
        | Capability::KycVerification => 0.15,
    }
}

/// Weights of `succeeded`, rescaled to sum to 1.
pub fn renormalized_weights(
    succeeded: impl IntoIterator<Item = Capability>,
) -> BTreeMap<Capability, f64> {
    let raw: BTreeMap<Capability, f64> = succeeded
        .into_iter()
        .map(|c| (c, base_weight(c)))
        .collect();
    let total: f64 = raw.values().sum();
    if total <= 0.0 {
        return BTreeMap::new();
    }
    raw.into_iter().map(|(c, w)| (c, w / total)).collect()
}

/// Combine every terminal agent result of a workflow.
///
/// `results` holds one entry per dispatched capability, failed ones
/// included. `skipped` lists requested capabilities that were never
/// dispatched: they count towards the requested total but carry no weight.
pub fn synthesize(
    results: &BTreeMap<Capability, AgentResult>,
    skipped: &[Capability],
) -> ValidationResult {
    let mut skipped: Vec<Capability> = skipped
        .iter()
        .copied()
        .filter(|c| !results.contains_key(c))
        .collect();
    skipped.sort_unstable();
    skipped.dedup();

    let requested = results.len() + skipped.len();
    let succeeded: Vec<&AgentResult> = results.values().filter(|r| r.success).collect();
    let successful = succeeded.len();

    #[allow(clippy::cast_precision_loss)]
    let completeness = if requested == 0 {
        0.0
    } else {
        successful as f64 / requested as f64
    };

    let weights = renormalized_weights(succeeded.iter().map(|r| r.capability));
    let weight_of = |r: &AgentResult| weights.get(&r.capability).copied().unwrap_or(0.0);

    let overall_score = succeeded
        .iter()
        .map(|r| weight_of(*r) * r.normalized_score())
        .sum::<f64>()
        .clamp(0.0, 100.0);

    let weighted_confidence: f64 = succeeded
        .iter()
        .map(|r| weight_of(*r) * r.confidence_score)
        .sum();
    let confidence_level = clamp_unit(weighted_confidence * completeness);

    let confidences: Vec<f64> = succeeded.iter().map(|r| r.confidence_score).collect();
    let data_quality_score = data_quality(&confidences);

    let recommendations = recommend(
        results,
        &succeeded,
        &skipped,
        overall_score,
        confidence_level,
    );

    ValidationResult {
        overall_score,
        confidence_level,
        capability_results: results.clone(),
        recommendations,
        data_quality_score,
        analysis_completeness: completeness,
        requested_count: requested,
        successful_count: successful,
        skipped,
        quality_flags: Vec::new(),
    }
}

/// Mean confidence penalised by its spread: consistent agents score higher.
fn data_quality(confidences: &[f64]) -> f64 {
    if confidences.is_empty() {
        return 0.0;
    }
    #[allow(clippy::cast_precision_loss)]
    let n = confidences.len() as f64;
    let mean = confidences.iter().sum::<f64>() / n;
    let variance = confidences.iter().map(|c| (c - mean).powi(2)).sum::<f64>() / n;
    clamp_unit(mean - variance.sqrt())
}

fn recommend(
    results: &BTreeMap<Capability, AgentResult>,
    succeeded: &[&AgentResult],
    skipped: &[Capability],
    overall_score: f64,
    confidence_level: f64,
) -> Vec<String> {
    let mut out: Vec<String> = Vec::new();
    let mut push = |text: String| {
        if !out.contains(&text) {
            out.push(text);
        }
    };

    if results.is_empty() && skipped.is_empty() {
        push("No capabilities were analysed; widen the analysis scope".to_string());
        return out;
    }
    if succeeded.is_empty() {
        push("No analysis succeeded; the validation cannot support a decision".to_string());
    } else if overall_score < 40.0 {
        push("Overall outlook is weak; revisit the concept before investing further".to_string());
    } else if overall_score < 70.0 {
        push("Proceed with caution and address the highest-risk findings first".to_string());
    } else {
        push("Outlook is favourable; proceed to a limited pilot".to_string());
    }

    for result in succeeded {
        for text in result.payload_recommendations() {
            push(text.to_string());
        }
    }

    for result in results.values().filter(|r| !r.success) {
        let kind = result
            .error_kind()
            .map_or_else(|| "unknown error".to_string(), |k| k.to_string());
        push(format!(
            "Re-run {} analysis ({kind}) before relying on this validation",
            result.capability
        ));
    }

    for capability in skipped {
        push(format!(
            "No {capability} analysis is available; configure it or treat that area as unassessed"
        ));
    }

    if !succeeded.is_empty() && confidence_level < LOW_CONFIDENCE {
        push("Confidence is low; gather more data before deciding".to_string());
    }
    out
}

/// Quality findings for a synthesized result.
pub fn quality_flags(result: &ValidationResult, min_completeness: f64) -> Vec<QualityFlag> {
    let mut flags = Vec::new();
    if result.requested_count == 0 {
        flags.push(QualityFlag::EmptyScope);
        return flags;
    }
    if result.analysis_completeness < min_completeness {
        flags.push(QualityFlag::InsufficientCoverage {
            completeness: result.analysis_completeness,
            minimum: min_completeness,
        });
    }
    let confidences = result
        .capability_results
        .values()
        .filter(|r| r.success)
        .map(|r| r.confidence_score);
    let (lo, hi) = confidences.fold((f64::INFINITY, f64::NEG_INFINITY), |(lo, hi), c| {
        (lo.min(c), hi.max(c))
    });
    if hi.is_finite() && hi - lo >= DIVERGENCE_THRESHOLD {
        flags.push(QualityFlag::DivergentConfidence { spread: hi - lo });
    }
    flags
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::float_cmp)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::workflow::AgentErrorKind;

    fn ok(capability: Capability, score: f64, confidence: f64) -> AgentResult {
        AgentResult::succeeded(capability, json!({ "score": score }), confidence)
    }

    fn failed(capability: Capability) -> AgentResult {
        AgentResult::failed(capability, AgentErrorKind::AgentTimeout, "too slow")
    }

    fn map(results: Vec<AgentResult>) -> BTreeMap<Capability, AgentResult> {
        results.into_iter().map(|r| (r.capability, r)).collect()
    }

    #[test]
    fn base_weights_sum_to_one() {
        let total: f64 = Capability::ALL.iter().map(|c| base_weight(*c)).sum();
        assert!((total - 1.0).abs() < 1e-12);
    }

    #[test]
    fn renormalized_weights_sum_to_one_for_any_subset() {
        let subsets: [&[Capability]; 3] = [
            &[Capability::MarketAnalysis],
            &[Capability::RiskAssessment, Capability::KycVerification],
            &Capability::ALL,
        ];
        for subset in subsets {
            let weights = renormalized_weights(subset.iter().copied());
            let total: f64 = weights.values().sum();
            assert!((total - 1.0).abs() < 1e-12);
        }
        assert!(renormalized_weights(std::iter::empty()).is_empty());
    }

    #[test]
    fn all_succeed_is_complete() {
        let results = map(Capability::ALL.iter().map(|c| ok(*c, 80.0, 0.8)).collect());
        let result = synthesize(&results, &[]);
        assert_eq!(result.requested_count, 6);
        assert_eq!(result.successful_count, 6);
        assert_eq!(result.analysis_completeness, 1.0);
        assert!((result.overall_score - 80.0).abs() < 1e-9);
        assert!(result.confidence_level <= 0.8 + 1e-9);
        assert!((result.confidence_level - 0.8).abs() < 1e-9);
        assert!((result.data_quality_score - 0.8).abs() < 1e-9);
    }

    #[test]
    fn failures_lower_completeness_and_confidence() {
        let results = map(vec![
            ok(Capability::MarketAnalysis, 70.0, 0.9),
            ok(Capability::RiskAssessment, 50.0, 0.9),
            failed(Capability::FraudDetection),
            failed(Capability::KycVerification),
        ]);
        let result = synthesize(&results, &[]);
        assert_eq!(result.requested_count, 4);
        assert_eq!(result.successful_count, 2);
        assert_eq!(result.analysis_completeness, 0.5);
        // market 0.15, risk 0.20 renormalized over 0.35
        let expected = (0.15 * 70.0 + 0.20 * 50.0) / 0.35;
        assert!((result.overall_score - expected).abs() < 1e-9);
        assert!((result.confidence_level - 0.45).abs() < 1e-9);
        assert!(
            result
                .recommendations
                .iter()
                .any(|r| r.contains("fraud_detection") && r.contains("agent_timeout"))
        );
    }

    #[test]
    fn nothing_succeeded_scores_zero() {
        let results = map(vec![failed(Capability::MarketAnalysis)]);
        let result = synthesize(&results, &[]);
        assert_eq!(result.overall_score, 0.0);
        assert_eq!(result.confidence_level, 0.0);
        assert_eq!(result.data_quality_score, 0.0);
        assert_eq!(result.analysis_completeness, 0.0);
    }

    #[test]
    fn empty_map_has_no_nan() {
        let result = synthesize(&BTreeMap::new(), &[]);
        assert_eq!(result.requested_count, 0);
        assert_eq!(result.analysis_completeness, 0.0);
        assert_eq!(result.overall_score, 0.0);
        assert!(!result.confidence_level.is_nan());
        assert_eq!(quality_flags(&result, 0.5), vec![QualityFlag::EmptyScope]);
    }

    #[test]
    fn synthesis_is_deterministic() {
        let results = map(vec![
            AgentResult::succeeded(
                Capability::CustomerIntelligence,
                json!({"score": 66, "recommendations": ["Interview 20 customers"]}),
                0.7,
            ),
            AgentResult::succeeded(
                Capability::MarketAnalysis,
                json!({"score": 81, "recommendations": ["Size the SAM"]}),
                0.6,
            ),
            failed(Capability::RegulatoryCompliance),
        ]);
        let first = synthesize(&results, &[]);
        let second = synthesize(&results, &[]);
        assert_eq!(first, second);
        // capability order: regulatory < market < customer
        let market = first
            .recommendations
            .iter()
            .position(|r| r == "Size the SAM")
            .unwrap();
        let customer = first
            .recommendations
            .iter()
            .position(|r| r == "Interview 20 customers")
            .unwrap();
        assert!(market < customer);
    }

    #[test]
    fn skipped_capabilities_count_as_requested() {
        let results = map(vec![ok(Capability::MarketAnalysis, 80.0, 0.8)]);
        let skipped = [
            Capability::RiskAssessment,
            Capability::KycVerification,
            Capability::MarketAnalysis,
        ];
        let result = synthesize(&results, &skipped);
        assert_eq!(result.requested_count, 3);
        assert_eq!(result.successful_count, 1);
        assert!((result.analysis_completeness - 1.0 / 3.0).abs() < 1e-12);
        // weighting still only covers what ran
        assert!((result.overall_score - 80.0).abs() < 1e-9);
        assert!(result.confidence_level < 0.8 / 2.0);
        assert_eq!(
            result.skipped,
            vec![Capability::RiskAssessment, Capability::KycVerification]
        );
        assert!(
            result
                .recommendations
                .iter()
                .any(|r| r.contains("kyc_verification"))
        );
    }

    #[test]
    fn only_skipped_is_not_an_empty_scope() {
        let result = synthesize(&BTreeMap::new(), &[Capability::FraudDetection]);
        assert_eq!(result.requested_count, 1);
        assert_eq!(result.analysis_completeness, 0.0);
        let flags = quality_flags(&result, 0.5);
        assert!(matches!(flags[0], QualityFlag::InsufficientCoverage { .. }));
    }

    #[test]
    fn spread_lowers_data_quality() {
        let even = data_quality(&[0.6, 0.6]);
        let spread = data_quality(&[0.9, 0.3]);
        assert!(spread < even);
        assert!((spread - 0.3).abs() < 1e-9);
    }

    #[test]
    fn low_coverage_is_flagged() {
        let results = map(vec![
            ok(Capability::MarketAnalysis, 70.0, 0.9),
            failed(Capability::RiskAssessment),
            failed(Capability::FraudDetection),
        ]);
        let result = synthesize(&results, &[]);
        let flags = quality_flags(&result, 0.5);
        assert!(matches!(
            flags[0],
            QualityFlag::InsufficientCoverage { minimum, .. } if minimum == 0.5
        ));
    }

    #[test]
    fn divergent_confidence_is_flagged() {
        let results = map(vec![
            ok(Capability::MarketAnalysis, 70.0, 0.95),
            ok(Capability::RiskAssessment, 70.0, 0.3),
        ]);
        let flags = quality_flags(&synthesize(&results, &[]), 0.5);
        assert_eq!(flags.len(), 1);
        assert!(matches!(flags[0], QualityFlag::DivergentConfidence { .. }));
    }
}
