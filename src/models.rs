//! Data models for remittance aggregation.
//!
//! Records are ephemeral and only live while one upload is parsed. Buckets
//! are the only thing that reaches the store, and they carry counts only.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

/// Region code used when a file carries no usable state.
pub const UNKNOWN_STATE: &str = "XX";

/// Adjudication outcome of a single service line.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ClaimStatus {
    /// Paid as billed (contractual reductions aside).
    Approved,
    /// Nothing paid.
    Denied,
    /// Paid, but with a denial-bearing adjustment.
    Partial,
}

impl fmt::Display for ClaimStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ClaimStatus::Approved => write!(f, "Approved"),
            ClaimStatus::Denied => write!(f, "Denied"),
            ClaimStatus::Partial => write!(f, "Partial"),
        }
    }
}

impl FromStr for ClaimStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "approved" | "paid" | "accepted" | "allowed" => Ok(ClaimStatus::Approved),
            "denied" | "rejected" | "denial" => Ok(ClaimStatus::Denied),
            "partial" | "partially paid" | "partially_paid" | "partial pay" => {
                Ok(ClaimStatus::Partial)
            }
            other => Err(format!("unknown claim status '{}'", other)),
        }
    }
}

/// A CARC adjustment reason together with its group code, e.g. `CO-16`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct DenialReason {
    /// Adjustment group (CO, OA, PI, CR, PR).
    pub group: String,
    /// Claim adjustment reason code.
    pub code: String,
}

impl DenialReason {
    pub fn new(group: &str, code: &str) -> Self {
        Self {
            group: group.trim().to_uppercase(),
            code: code.trim().to_uppercase(),
        }
    }

    /// Patient responsibility adjustments are not payer denials on their own.
    pub fn is_patient_responsibility(&self) -> bool {
        self.group == "PR"
    }
}

impl fmt::Display for DenialReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.group, self.code)
    }
}

impl FromStr for DenialReason {
    type Err = String;

    /// Parses `CO-16`, `CO16` or a bare `16` (group defaults to CO).
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let trimmed = s.trim().to_uppercase();
        let (group, code) = match trimmed.split_once('-') {
            Some((group, code)) => (group.trim().to_string(), code.trim().to_string()),
            None => {
                let group: String = trimmed
                    .chars()
                    .take_while(|c| c.is_ascii_alphabetic())
                    .collect();
                let code = trimmed[group.len()..].to_string();
                let group = if group.is_empty() {
                    "CO".to_string()
                } else {
                    group
                };
                (group, code)
            }
        };

        let code: String = code.chars().filter(|c| c.is_ascii_alphanumeric()).collect();
        if code.is_empty() {
            return Err("empty reason code".to_string());
        }
        if group.len() != 2 || !group.chars().all(|c| c.is_ascii_alphabetic()) {
            return Err(format!("invalid adjustment group '{}'", group));
        }

        Ok(Self { group, code })
    }
}

/// One adjudicated service line, already stripped of identifying fields.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemittanceRecord {
    pub payer: String,
    pub cpt_code: String,
    pub status: ClaimStatus,
    pub denial_reason: Option<DenialReason>,
    pub state: String,
    /// `YYYY-MM`; the day is never kept.
    pub service_month: Option<String>,
}

impl RemittanceRecord {
    pub fn bucket_key(&self) -> BucketKey {
        let reason = self.denial_reason.as_ref().map(ToString::to_string);
        BucketKey::new(&self.payer, &self.state, &self.cpt_code, reason.as_deref())
    }

    pub fn trend_key(&self) -> Option<TrendKey> {
        self.service_month.as_ref().map(|month| TrendKey {
            state: self.state.clone(),
            service_month: month.clone(),
        })
    }
}

/// Dimensions of an aggregate bucket.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct BucketKey {
    pub payer: String,
    pub state: String,
    pub cpt_code: String,
    /// `GROUP-CODE`, or `None` for lines without a denial reason.
    pub denial_reason: Option<String>,
}

impl BucketKey {
    pub fn new(payer: &str, state: &str, cpt_code: &str, denial_reason: Option<&str>) -> Self {
        Self {
            payer: payer.to_string(),
            state: state.to_string(),
            cpt_code: cpt_code.to_string(),
            denial_reason: denial_reason.map(String::from),
        }
    }
}

impl fmt::Display for BucketKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} / {} / {} / {}",
            self.payer,
            self.state,
            self.cpt_code,
            self.denial_reason.as_deref().unwrap_or("none")
        )
    }
}

/// Per-status tallies. `total` is always the sum of the other three.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BucketCounts {
    pub total: u64,
    pub approved: u64,
    pub denied: u64,
    pub partial: u64,
}

impl BucketCounts {
    /// Counts for a single line with the given status.
    #[cfg(test)]
    pub fn of(status: ClaimStatus) -> Self {
        let mut counts = Self::default();
        counts.record(status);
        counts
    }

    pub fn record(&mut self, status: ClaimStatus) {
        self.total += 1;
        match status {
            ClaimStatus::Approved => self.approved += 1,
            ClaimStatus::Denied => self.denied += 1,
            ClaimStatus::Partial => self.partial += 1,
        }
    }

    pub fn merge(&mut self, other: &BucketCounts) {
        self.total += other.total;
        self.approved += other.approved;
        self.denied += other.denied;
        self.partial += other.partial;
    }

    pub fn is_empty(&self) -> bool {
        self.total == 0
    }

    pub fn approval_rate(&self) -> f64 {
        ratio(self.approved, self.total)
    }

    pub fn denial_rate(&self) -> f64 {
        ratio(self.denied, self.total)
    }

    pub fn partial_rate(&self) -> f64 {
        ratio(self.partial, self.total)
    }
}

fn ratio(part: u64, total: u64) -> f64 {
    if total == 0 {
        0.0
    } else {
        part as f64 / total as f64
    }
}

/// A persisted aggregate counter.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AggregateBucket {
    pub key: BucketKey,
    pub counts: BucketCounts,
}

/// Dimensions of a monthly state trend counter.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TrendKey {
    pub state: String,
    pub service_month: String,
}

/// A persisted monthly trend counter.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrendBucket {
    pub key: TrendKey,
    pub counts: BucketCounts,
}

/// Which parser handled an upload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UploadFormat {
    X12,
    Csv,
}

impl fmt::Display for UploadFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            UploadFormat::X12 => write!(f, "x12-835"),
            UploadFormat::Csv => write!(f, "csv"),
        }
    }
}

/// A line that could not be turned into a record.
///
/// Holds a position and a reason only; element values are never copied here.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SkippedLine {
    /// Segment index (X12) or data row number (CSV), 1-based.
    pub position: usize,
    pub reason: String,
}

/// Non-fatal conditions reported alongside a parse.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum IngestWarning {
    /// No line could be parsed.
    EmptyFile,
    /// A CSV export lacks the columns needed for aggregation.
    MissingColumns(Vec<String>),
    /// More lines were skipped than diagnostics kept.
    SkipDiagnosticsTruncated { kept: usize },
}

impl fmt::Display for IngestWarning {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            IngestWarning::EmptyFile => write!(f, "no data found in upload"),
            IngestWarning::MissingColumns(cols) => {
                write!(f, "missing required columns: {}", cols.join(", "))
            }
            IngestWarning::SkipDiagnosticsTruncated { kept } => {
                write!(f, "only the first {} skipped lines are listed", kept)
            }
        }
    }
}

/// Everything one upload contributes, ready to be applied to a store.
///
/// Not `Clone`: applying consumes it.
#[derive(Debug, Serialize)]
pub struct AggregationResult {
    /// SHA-256 of the raw upload.
    pub fingerprint: String,
    pub format: UploadFormat,
    pub bucket_deltas: Vec<(BucketKey, BucketCounts)>,
    pub trend_deltas: Vec<(TrendKey, BucketCounts)>,
    pub lines_processed: u64,
    pub lines_skipped: u64,
    pub skipped: Vec<SkippedLine>,
    pub warnings: Vec<IngestWarning>,
}

impl AggregationResult {
    pub fn is_empty(&self) -> bool {
        self.lines_processed == 0
    }

    /// Sum of all bucket deltas.
    pub fn totals(&self) -> BucketCounts {
        let mut totals = BucketCounts::default();
        for (_, counts) in &self.bucket_deltas {
            totals.merge(counts);
        }
        totals
    }

    /// Delta for one key, if the upload touched it.
    #[cfg(test)]
    pub fn delta_for(&self, key: &BucketKey) -> Option<&BucketCounts> {
        self.bucket_deltas
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, counts)| counts)
    }
}

/// Folds records into per-key deltas. Ordered maps keep output deterministic.
#[derive(Debug, Default)]
pub struct DeltaAccumulator {
    buckets: BTreeMap<BucketKey, BucketCounts>,
    trends: BTreeMap<TrendKey, BucketCounts>,
    processed: u64,
}

impl DeltaAccumulator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Consumes the record; only its key and status survive.
    pub fn fold(&mut self, record: RemittanceRecord) {
        self.buckets
            .entry(record.bucket_key())
            .or_default()
            .record(record.status);
        if let Some(trend) = record.trend_key() {
            self.trends.entry(trend).or_default().record(record.status);
        }
        self.processed += 1;
    }

    pub fn processed(&self) -> u64 {
        self.processed
    }

    pub fn into_deltas(
        self,
    ) -> (
        Vec<(BucketKey, BucketCounts)>,
        Vec<(TrendKey, BucketCounts)>,
    ) {
        (
            self.buckets.into_iter().collect(),
            self.trends.into_iter().collect(),
        )
    }
}
