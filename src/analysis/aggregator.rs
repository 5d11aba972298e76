//! Bucket roll-ups and summary statistics.
//!
//! This module turns a store snapshot into the tables shown in reports.
//! Every table is sorted by volume (descending, ties by name) and truncated
//! to `top_n` rows.

use crate::models::{AggregateBucket, BucketCounts, TrendBucket};
use crate::recoverability::{self, Recoverability};
use serde::Serialize;
use std::collections::BTreeMap;

/// Approval statistics for one payer.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PayerPerformance {
    pub payer: String,
    pub counts: BucketCounts,
    pub approval_rate: f64,
    pub denial_rate: f64,
    pub partial_rate: f64,
    /// Most frequent reason on denied or partial lines.
    pub top_denial_reason: Option<String>,
}

/// Approval statistics for one procedure code.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CptApproval {
    pub cpt_code: String,
    pub counts: BucketCounts,
    pub approval_rate: f64,
    pub denial_rate: f64,
}

/// How often a denial reason occurs, and what can be done about it.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DenialPattern {
    pub reason: String,
    /// Denied plus partially paid lines carrying this reason.
    pub occurrences: u64,
    /// Distinct payers reporting it.
    pub payers: usize,
    pub recoverability: Recoverability,
    pub action: String,
}

/// Volume and denial rate for one state.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StateSummary {
    pub state: String,
    pub counts: BucketCounts,
    pub denial_rate: f64,
}

/// One month of one state's volume.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TrendPoint {
    pub state: String,
    pub service_month: String,
    pub counts: BucketCounts,
    pub denial_rate: f64,
}

/// Lines per recoverability category.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RecoveryLine {
    pub category: Recoverability,
    pub lines: u64,
    pub recoverable: bool,
    pub action: String,
}

/// Everything a report shows.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Statistics {
    pub totals: BucketCounts,
    pub bucket_count: usize,
    pub payer_count: usize,
    pub payers: Vec<PayerPerformance>,
    pub cpt_codes: Vec<CptApproval>,
    pub denial_patterns: Vec<DenialPattern>,
    pub states: Vec<StateSummary>,
    pub trends: Vec<TrendPoint>,
    pub recovery: Vec<RecoveryLine>,
    /// Share of denied/partial lines whose reason is recoverable.
    pub recoverable_share: f64,
}

fn ratio(part: u64, total: u64) -> f64 {
    if total == 0 {
        0.0
    } else {
        part as f64 / total as f64
    }
}

fn adverse(counts: &BucketCounts) -> u64 {
    counts.denied + counts.partial
}

/// Sort by total descending, ties by name ascending, then truncate.
fn rank<T>(rows: &mut Vec<T>, top_n: usize, volume: impl Fn(&T) -> u64, name: impl Fn(&T) -> &str) {
    rows.sort_by(|a, b| volume(b).cmp(&volume(a)).then_with(|| name(a).cmp(name(b))));
    rows.truncate(top_n);
}

/// Total of every bucket.
pub fn overall_totals(buckets: &[AggregateBucket]) -> BucketCounts {
    let mut totals = BucketCounts::default();
    for bucket in buckets {
        totals.merge(&bucket.counts);
    }
    totals
}

/// Per-payer approval statistics.
pub fn payer_performance(buckets: &[AggregateBucket], top_n: usize) -> Vec<PayerPerformance> {
    let mut by_payer: BTreeMap<&str, (BucketCounts, BTreeMap<&str, u64>)> = BTreeMap::new();

    for bucket in buckets {
        let entry = by_payer.entry(bucket.key.payer.as_str()).or_default();
        entry.0.merge(&bucket.counts);
        if let Some(reason) = bucket.key.denial_reason.as_deref() {
            let hits = adverse(&bucket.counts);
            if hits > 0 {
                *entry.1.entry(reason).or_default() += hits;
            }
        }
    }

    let mut rows: Vec<PayerPerformance> = by_payer
        .into_iter()
        .map(|(payer, (counts, reasons))| {
            // BTreeMap iterates by name, so ties keep the first reason
            let top_denial_reason = reasons
                .iter()
                .fold(None::<(&str, u64)>, |best, (reason, hits)| match best {
                    Some((_, best_hits)) if best_hits >= *hits => best,
                    _ => Some((*reason, *hits)),
                })
                .map(|(reason, _)| reason.to_string());

            PayerPerformance {
                payer: payer.to_string(),
                approval_rate: counts.approval_rate(),
                denial_rate: counts.denial_rate(),
                partial_rate: counts.partial_rate(),
                counts,
                top_denial_reason,
            }
        })
        .collect();

    rank(&mut rows, top_n, |r| r.counts.total, |r| r.payer.as_str());
    rows
}

/// Per-procedure approval rates.
pub fn cpt_approval_rates(buckets: &[AggregateBucket], top_n: usize) -> Vec<CptApproval> {
    let mut by_code: BTreeMap<&str, BucketCounts> = BTreeMap::new();
    for bucket in buckets {
        by_code
            .entry(bucket.key.cpt_code.as_str())
            .or_default()
            .merge(&bucket.counts);
    }

    let mut rows: Vec<CptApproval> = by_code
        .into_iter()
        .map(|(code, counts)| CptApproval {
            cpt_code: code.to_string(),
            approval_rate: counts.approval_rate(),
            denial_rate: counts.denial_rate(),
            counts,
        })
        .collect();

    rank(&mut rows, top_n, |r| r.counts.total, |r| r.cpt_code.as_str());
    rows
}

/// Denial reasons by frequency, with their recoverability.
pub fn denial_patterns(buckets: &[AggregateBucket], top_n: usize) -> Vec<DenialPattern> {
    let mut by_reason: BTreeMap<&str, (u64, Vec<&str>)> = BTreeMap::new();

    for bucket in buckets {
        let Some(reason) = bucket.key.denial_reason.as_deref() else {
            continue;
        };
        let hits = adverse(&bucket.counts);
        if hits == 0 {
            continue;
        }
        let entry = by_reason.entry(reason).or_default();
        entry.0 += hits;
        if !entry.1.contains(&bucket.key.payer.as_str()) {
            entry.1.push(bucket.key.payer.as_str());
        }
    }

    let mut rows: Vec<DenialPattern> = by_reason
        .into_iter()
        .map(|(reason, (occurrences, payers))| {
            let category = recoverability::classify(reason);
            DenialPattern {
                reason: reason.to_string(),
                occurrences,
                payers: payers.len(),
                recoverability: category,
                action: category.action().to_string(),
            }
        })
        .collect();

    rank(&mut rows, top_n, |r| r.occurrences, |r| r.reason.as_str());
    rows
}

/// Per-state volume.
pub fn state_summary(buckets: &[AggregateBucket], top_n: usize) -> Vec<StateSummary> {
    let mut by_state: BTreeMap<&str, BucketCounts> = BTreeMap::new();
    for bucket in buckets {
        by_state
            .entry(bucket.key.state.as_str())
            .or_default()
            .merge(&bucket.counts);
    }

    let mut rows: Vec<StateSummary> = by_state
        .into_iter()
        .map(|(state, counts)| StateSummary {
            state: state.to_string(),
            denial_rate: counts.denial_rate(),
            counts,
        })
        .collect();

    rank(&mut rows, top_n, |r| r.counts.total, |r| r.state.as_str());
    rows
}

/// Monthly series per state, ordered by state then month.
pub fn monthly_trends(trends: &[TrendBucket]) -> Vec<TrendPoint> {
    let mut points: Vec<TrendPoint> = trends
        .iter()
        .filter(|t| !t.counts.is_empty())
        .map(|t| TrendPoint {
            state: t.key.state.clone(),
            service_month: t.key.service_month.clone(),
            counts: t.counts,
            denial_rate: t.counts.denial_rate(),
        })
        .collect();
    points.sort_by(|a, b| {
        a.state
            .cmp(&b.state)
            .then_with(|| a.service_month.cmp(&b.service_month))
    });
    points
}

/// Denied and partial lines grouped by recoverability category.
pub fn recovery_summary(buckets: &[AggregateBucket]) -> Vec<RecoveryLine> {
    let mut by_category: BTreeMap<Recoverability, u64> = BTreeMap::new();
    for bucket in buckets {
        if let Some(reason) = bucket.key.denial_reason.as_deref() {
            let hits = adverse(&bucket.counts);
            if hits > 0 {
                *by_category.entry(recoverability::classify(reason)).or_default() += hits;
            }
        }
    }

    Recoverability::ALL
        .iter()
        .filter_map(|category| {
            by_category.get(category).map(|lines| RecoveryLine {
                category: *category,
                lines: *lines,
                recoverable: category.is_recoverable(),
                action: category.action().to_string(),
            })
        })
        .collect()
}

/// Compute every report table from a store snapshot.
pub fn compute_statistics(
    buckets: &[AggregateBucket],
    trends: &[TrendBucket],
    top_n: usize,
) -> Statistics {
    let recovery = recovery_summary(buckets);
    let adverse_lines: u64 = recovery.iter().map(|r| r.lines).sum();
    let recoverable_lines: u64 = recovery
        .iter()
        .filter(|r| r.recoverable)
        .map(|r| r.lines)
        .sum();

    let payer_count = {
        let mut payers: Vec<&str> = buckets.iter().map(|b| b.key.payer.as_str()).collect();
        payers.sort_unstable();
        payers.dedup();
        payers.len()
    };

    Statistics {
        totals: overall_totals(buckets),
        bucket_count: buckets.len(),
        payer_count,
        payers: payer_performance(buckets, top_n),
        cpt_codes: cpt_approval_rates(buckets, top_n),
        denial_patterns: denial_patterns(buckets, top_n),
        states: state_summary(buckets, top_n),
        trends: monthly_trends(trends),
        recovery,
        recoverable_share: ratio(recoverable_lines, adverse_lines),
    }
}

/// Generate a short text summary for the console.
pub fn generate_summary_text(stats: &Statistics) -> String {
    let mut lines = Vec::new();

    lines.push(format!("Total Lines: {}", stats.totals.total));
    lines.push(format!(
        "- Approved: {} ({:.1}%)",
        stats.totals.approved,
        stats.totals.approval_rate() * 100.0
    ));
    lines.push(format!(
        "- Denied: {} ({:.1}%)",
        stats.totals.denied,
        stats.totals.denial_rate() * 100.0
    ));
    lines.push(format!(
        "- Partial: {} ({:.1}%)",
        stats.totals.partial,
        stats.totals.partial_rate() * 100.0
    ));
    lines.push(format!(
        "Payers: {}, Buckets: {}",
        stats.payer_count, stats.bucket_count
    ));

    if let Some(top) = stats.denial_patterns.first() {
        lines.push(format!(
            "Top denial reason: {} ({} lines, {})",
            top.reason, top.occurrences, top.recoverability
        ));
    }

    lines.join("\n")
}
