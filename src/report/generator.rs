//! Statistics report generation.
//!
//! Reports are built from a store snapshot only, so everything in them is
//! already aggregated and de-identified.

use crate::analysis::{
    CptApproval, DenialPattern, PayerPerformance, RecoveryLine, StateSummary, Statistics,
    TrendPoint,
};
use crate::cli::OutputFormat;
use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::io::Write;
use std::path::Path;

/// Run information shown at the top of a report.
#[derive(Debug, Clone, Serialize)]
pub struct ReportMetadata {
    pub generated_at: DateTime<Utc>,
    /// Store location, or `memory`.
    pub store: String,
    pub uploads_in_store: u64,
    pub uploads_this_run: usize,
    pub uploads_rejected: usize,
    pub lines_processed: u64,
    pub lines_skipped: u64,
    pub duration_seconds: f64,
}

/// A complete statistics report.
#[derive(Debug, Clone, Serialize)]
pub struct StatsReport {
    pub metadata: ReportMetadata,
    pub statistics: Statistics,
}

fn pct(rate: f64) -> String {
    format!("{:.1}%", rate * 100.0)
}

/// Generate a complete Markdown report.
pub fn generate_markdown_report(report: &StatsReport, include_trends: bool) -> String {
    let stats = &report.statistics;
    let show_trends = include_trends && !stats.trends.is_empty();
    let mut output = String::new();

    output.push_str("# RemitLens Payer Statistics\n\n");
    output.push_str(&generate_metadata_section(&report.metadata));
    output.push_str(&generate_table_of_contents(show_trends));
    output.push_str(&generate_overview_section(stats));
    output.push_str(&generate_payer_section(&stats.payers));
    output.push_str(&generate_cpt_section(&stats.cpt_codes));
    output.push_str(&generate_denial_section(&stats.denial_patterns));
    output.push_str(&generate_recovery_section(&stats.recovery, stats.recoverable_share));
    output.push_str(&generate_state_section(&stats.states));
    if show_trends {
        output.push_str(&generate_trend_section(&stats.trends));
    }
    output.push_str(&generate_footer());

    output
}

/// Generate the metadata section.
fn generate_metadata_section(metadata: &ReportMetadata) -> String {
    let mut section = String::new();

    section.push_str("## Metadata\n\n");
    section.push_str(&format!(
        "- **Generated:** {}\n",
        metadata.generated_at.format("%Y-%m-%d %H:%M:%S UTC")
    ));
    section.push_str(&format!("- **Store:** `{}`\n", metadata.store));
    section.push_str(&format!(
        "- **Uploads in Store:** {}\n",
        metadata.uploads_in_store
    ));
    if metadata.uploads_this_run > 0 {
        section.push_str(&format!(
            "- **Uploads This Run:** {}\n",
            metadata.uploads_this_run
        ));
        section.push_str(&format!(
            "- **Lines Processed / Skipped:** {} / {}\n",
            metadata.lines_processed, metadata.lines_skipped
        ));
    }
    if metadata.uploads_rejected > 0 {
        section.push_str(&format!(
            "- **Uploads Rejected:** {}\n",
            metadata.uploads_rejected
        ));
    }
    section.push_str(&format!(
        "- **Run Duration:** {:.1}s\n",
        metadata.duration_seconds
    ));
    section.push('\n');

    section
}

/// Generate the table of contents.
fn generate_table_of_contents(show_trends: bool) -> String {
    let mut toc = String::new();

    toc.push_str("## Table of Contents\n\n");
    toc.push_str("- [Metadata](#metadata)\n");
    toc.push_str("- [Overview](#overview)\n");
    toc.push_str("- [Payer Performance](#payer-performance)\n");
    toc.push_str("- [CPT Approval Rates](#cpt-approval-rates)\n");
    toc.push_str("- [Denial Patterns](#denial-patterns)\n");
    toc.push_str("- [Recovery Summary](#recovery-summary)\n");
    toc.push_str("- [State Summary](#state-summary)\n");
    if show_trends {
        toc.push_str("- [Monthly Trends](#monthly-trends)\n");
    }
    toc.push('\n');

    toc
}

fn generate_overview_section(stats: &Statistics) -> String {
    let totals = &stats.totals;
    let mut section = String::new();

    section.push_str("## Overview\n\n");
    section.push_str("| Lines | Approved | Denied | Partial | Payers | Buckets |\n");
    section.push_str("|:---:|:---:|:---:|:---:|:---:|:---:|\n");
    section.push_str(&format!(
        "| **{}** | {} ({}) | {} ({}) | {} ({}) | {} | {} |\n\n",
        totals.total,
        totals.approved,
        pct(totals.approval_rate()),
        totals.denied,
        pct(totals.denial_rate()),
        totals.partial,
        pct(totals.partial_rate()),
        stats.payer_count,
        stats.bucket_count,
    ));

    if totals.total == 0 {
        section.push_str("No remittance lines have been aggregated yet.\n\n");
    }

    section
}

fn generate_payer_section(payers: &[PayerPerformance]) -> String {
    let mut section = String::new();

    section.push_str("## Payer Performance\n\n");
    if payers.is_empty() {
        section.push_str("No payer data.\n\n");
        return section;
    }

    section.push_str("| Payer | Lines | Approval | Denial | Partial | Top Denial Reason |\n");
    section.push_str("|:---|:---:|:---:|:---:|:---:|:---|\n");
    for row in payers {
        section.push_str(&format!(
            "| {} | {} | {} | {} | {} | {} |\n",
            row.payer,
            row.counts.total,
            pct(row.approval_rate),
            pct(row.denial_rate),
            pct(row.partial_rate),
            row.top_denial_reason.as_deref().unwrap_or("-"),
        ));
    }
    section.push('\n');

    section
}

fn generate_cpt_section(codes: &[CptApproval]) -> String {
    let mut section = String::new();

    section.push_str("## CPT Approval Rates\n\n");
    if codes.is_empty() {
        section.push_str("No procedure data.\n\n");
        return section;
    }

    section.push_str("| CPT | Lines | Approved | Approval | Denial |\n");
    section.push_str("|:---|:---:|:---:|:---:|:---:|\n");
    for row in codes {
        section.push_str(&format!(
            "| `{}` | {} | {} | {} | {} |\n",
            row.cpt_code,
            row.counts.total,
            row.counts.approved,
            pct(row.approval_rate),
            pct(row.denial_rate),
        ));
    }
    section.push('\n');

    section
}

fn generate_denial_section(patterns: &[DenialPattern]) -> String {
    let mut section = String::new();

    section.push_str("## Denial Patterns\n\n");
    if patterns.is_empty() {
        section.push_str("No denials recorded.\n\n");
        return section;
    }

    section.push_str("| Reason | Lines | Payers | Recoverability | Next Step |\n");
    section.push_str("|:---|:---:|:---:|:---|:---|\n");
    for row in patterns {
        section.push_str(&format!(
            "| {} | {} | {} | {} | {} |\n",
            row.reason, row.occurrences, row.payers, row.recoverability, row.action,
        ));
    }
    section.push('\n');

    section
}

fn generate_recovery_section(recovery: &[RecoveryLine], recoverable_share: f64) -> String {
    let mut section = String::new();

    section.push_str("## Recovery Summary\n\n");
    if recovery.is_empty() {
        section.push_str("Nothing to recover.\n\n");
        return section;
    }

    section.push_str(&format!(
        "**{}** of denied and partially paid lines carry a recoverable reason.\n\n",
        pct(recoverable_share)
    ));
    section.push_str("| Category | Lines | Recoverable | Action |\n");
    section.push_str("|:---|:---:|:---:|:---|\n");
    for row in recovery {
        section.push_str(&format!(
            "| {} | {} | {} | {} |\n",
            row.category,
            row.lines,
            if row.recoverable { "yes" } else { "no" },
            row.action,
        ));
    }
    section.push('\n');

    section
}

fn generate_state_section(states: &[StateSummary]) -> String {
    let mut section = String::new();

    section.push_str("## State Summary\n\n");
    if states.is_empty() {
        section.push_str("No state data.\n\n");
        return section;
    }

    section.push_str("| State | Lines | Denied | Denial Rate |\n");
    section.push_str("|:---|:---:|:---:|:---:|\n");
    for row in states {
        section.push_str(&format!(
            "| {} | {} | {} | {} |\n",
            row.state,
            row.counts.total,
            row.counts.denied,
            pct(row.denial_rate),
        ));
    }
    section.push('\n');

    section
}

fn generate_trend_section(trends: &[TrendPoint]) -> String {
    let mut section = String::new();

    section.push_str("## Monthly Trends\n\n");
    section.push_str("| State | Month | Lines | Denied | Partial | Denial Rate |\n");
    section.push_str("|:---|:---|:---:|:---:|:---:|:---:|\n");
    for row in trends {
        section.push_str(&format!(
            "| {} | {} | {} | {} | {} | {} |\n",
            row.state,
            row.service_month,
            row.counts.total,
            row.counts.denied,
            row.counts.partial,
            pct(row.denial_rate),
        ));
    }
    section.push('\n');

    section
}

/// Generate the report footer.
fn generate_footer() -> String {
    let mut footer = String::new();

    footer.push_str("---\n\n");
    footer.push_str(
        "*Generated by RemitLens. Counts are aggregated by payer, state, CPT code and \
         denial reason; no patient-level data is stored.*\n",
    );

    footer
}

/// Generate a JSON report.
pub fn generate_json_report(report: &StatsReport) -> Result<String> {
    serde_json::to_string_pretty(report).map_err(Into::into)
}

/// Render a report in the requested format.
pub fn render_report(report: &StatsReport, format: OutputFormat, include_trends: bool) -> Result<String> {
    match format {
        OutputFormat::Markdown => Ok(generate_markdown_report(report, include_trends)),
        OutputFormat::Json => generate_json_report(report),
    }
}

/// Write the rendered report to a file.
pub fn write_report(
    report: &StatsReport,
    path: &Path,
    format: OutputFormat,
    include_trends: bool,
) -> Result<()> {
    let content = render_report(report, format, include_trends)?;

    let mut file = std::fs::File::create(path)
        .with_context(|| format!("Failed to create report file: {}", path.display()))?;
    file.write_all(content.as_bytes())?;

    Ok(())
}
