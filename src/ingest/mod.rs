//! Upload parsing and aggregation.
//!
//! `parse_and_aggregate` is pure: it turns raw upload bytes into bucket
//! deltas and never touches a store. Identifying fields are dropped by the
//! format parsers before a record is built.

pub mod delimited;
pub mod x12;

use crate::config::IngestConfig;
use crate::deid;
use crate::error::{IngestError, ACCEPTED_EXTENSIONS};
use crate::models::{
    AggregationResult, ClaimStatus, DeltaAccumulator, DenialReason, IngestWarning,
    RemittanceRecord, SkippedLine, UploadFormat,
};
use std::path::Path;
use tracing::{debug, warn};

/// Tuning for a single parse.
#[derive(Debug, Clone)]
pub struct IngestOptions {
    /// Uploads above this size are rejected before parsing.
    pub max_upload_bytes: u64,
    /// CARC codes treated as expected contractual reductions, not denials.
    pub contractual_codes: Vec<String>,
    /// Cap on skipped-line diagnostics kept in the result.
    pub max_recorded_skips: usize,
}

impl Default for IngestOptions {
    fn default() -> Self {
        Self {
            max_upload_bytes: 10 * 1024 * 1024,
            contractual_codes: vec!["45".to_string(), "97".to_string(), "59".to_string()],
            max_recorded_skips: 50,
        }
    }
}

impl From<&IngestConfig> for IngestOptions {
    fn from(config: &IngestConfig) -> Self {
        Self {
            max_upload_bytes: config.max_upload_bytes,
            contractual_codes: config.contractual_codes.clone(),
            max_recorded_skips: config.max_recorded_skips,
        }
    }
}

impl IngestOptions {
    fn is_contractual(&self, reason: &DenialReason) -> bool {
        self.contractual_codes.iter().any(|c| c == &reason.code)
    }
}

/// Map an extension (with or without the leading dot) to a parser.
pub fn detect_format(extension: &str) -> Result<UploadFormat, IngestError> {
    let ext = extension.trim().trim_start_matches('.').to_lowercase();

    match ext.as_str() {
        "835" | "dat" | "edi" => Ok(UploadFormat::X12),
        "csv" => Ok(UploadFormat::Csv),
        _ => Err(IngestError::UnsupportedFormat { extension: ext }),
    }
}

/// Extension of an upload's file name, lowercased, without the dot.
pub fn extension_of(path: &Path) -> String {
    path.extension()
        .and_then(|e| e.to_str())
        .unwrap_or("")
        .to_lowercase()
}

/// Whether an extension is on the upload allow-list.
pub fn is_accepted_extension(extension: &str) -> bool {
    let ext = extension.trim_start_matches('.').to_lowercase();
    ACCEPTED_EXTENSIONS.contains(&ext.as_str())
}

/// Parse an upload with default options.
pub fn parse_and_aggregate(
    raw_file_bytes: &[u8],
    file_extension: &str,
) -> Result<AggregationResult, IngestError> {
    parse_and_aggregate_with(raw_file_bytes, file_extension, &IngestOptions::default())
}

/// Parse an upload into bucket deltas.
///
/// Fails only for whole-upload problems (format, size). Malformed lines are
/// counted in `lines_skipped`; an upload with no usable line carries an
/// [`IngestWarning::EmptyFile`] warning.
pub fn parse_and_aggregate_with(
    raw_file_bytes: &[u8],
    file_extension: &str,
    options: &IngestOptions,
) -> Result<AggregationResult, IngestError> {
    let format = detect_format(file_extension)?;

    let size = raw_file_bytes.len() as u64;
    if size > options.max_upload_bytes {
        return Err(IngestError::UploadTooLarge {
            size,
            limit: options.max_upload_bytes,
        });
    }

    let mut sink = LineSink::new(options.max_recorded_skips);
    let warnings = match format {
        UploadFormat::X12 => {
            let text = String::from_utf8_lossy(raw_file_bytes);
            x12::parse(&text, options, &mut sink);
            Vec::new()
        }
        UploadFormat::Csv => delimited::parse(raw_file_bytes, options, &mut sink),
    };

    let result = sink.finish(deid::fingerprint(raw_file_bytes), format, warnings);
    debug!(
        format = %result.format,
        processed = result.lines_processed,
        skipped = result.lines_skipped,
        buckets = result.bucket_deltas.len(),
        "Parsed upload"
    );
    Ok(result)
}

/// Collects parsed lines for one upload.
pub(crate) struct LineSink {
    acc: DeltaAccumulator,
    skipped_count: u64,
    skipped: Vec<SkippedLine>,
    max_recorded: usize,
}

impl LineSink {
    pub(crate) fn new(max_recorded: usize) -> Self {
        Self {
            acc: DeltaAccumulator::new(),
            skipped_count: 0,
            skipped: Vec::new(),
            max_recorded,
        }
    }

    pub(crate) fn accept(&mut self, line: Result<RemittanceRecord, IngestError>) {
        match line {
            Ok(record) => self.acc.fold(record),
            Err(IngestError::MalformedRecord { position, reason }) => {
                self.skip(position, reason);
            }
            Err(other) => {
                warn!("Unexpected per-line error: {}", other);
                self.skip(0, other.to_string());
            }
        }
    }

    pub(crate) fn skip(&mut self, position: usize, reason: impl Into<String>) {
        self.skipped_count += 1;
        if self.skipped.len() < self.max_recorded {
            self.skipped.push(SkippedLine {
                position,
                reason: reason.into(),
            });
        }
    }

    fn finish(
        self,
        fingerprint: String,
        format: UploadFormat,
        mut warnings: Vec<IngestWarning>,
    ) -> AggregationResult {
        let lines_processed = self.acc.processed();
        if lines_processed == 0 {
            warnings.insert(0, IngestWarning::EmptyFile);
        }
        if self.skipped_count > self.skipped.len() as u64 {
            warnings.push(IngestWarning::SkipDiagnosticsTruncated {
                kept: self.skipped.len(),
            });
        }

        let (bucket_deltas, trend_deltas) = self.acc.into_deltas();
        AggregationResult {
            fingerprint,
            format,
            bucket_deltas,
            trend_deltas,
            lines_processed,
            lines_skipped: self.skipped_count,
            skipped: self.skipped,
            warnings,
        }
    }
}

/// Validate and normalize a procedure code.
///
/// Accepts CPT Category I (`99213`), Category II/III (`0001F`, `0042T`) and
/// HCPCS Level II (`J1100`).
pub fn normalize_cpt(raw: &str) -> Option<String> {
    let code = raw.trim().to_uppercase();
    if code.len() != 5 || !code.is_ascii() {
        return None;
    }

    let bytes = code.as_bytes();
    let all_digits = bytes.iter().all(u8::is_ascii_digit);
    let category_ii_iii =
        bytes[..4].iter().all(u8::is_ascii_digit) && matches!(bytes[4], b'F' | b'T');
    let hcpcs = bytes[0].is_ascii_alphabetic() && bytes[1..].iter().all(u8::is_ascii_digit);

    if all_digits || category_ii_iii || hcpcs {
        Some(code)
    } else {
        None
    }
}

/// Amounts reported for a line, when the format carries them.
#[derive(Debug, Clone, Copy, Default)]
pub(crate) struct LineAmounts {
    pub charge: Option<f64>,
    pub paid: Option<f64>,
}

/// Decide a line's status and denial reason.
///
/// `explicit` is a status stated by the file itself (claim status code 4,
/// CSV status column). `adjustments` are in precedence order.
pub(crate) fn resolve_outcome(
    explicit: Option<ClaimStatus>,
    amounts: LineAmounts,
    adjustments: &[DenialReason],
    options: &IngestOptions,
) -> (ClaimStatus, Option<DenialReason>) {
    let candidates: Vec<&DenialReason> = adjustments
        .iter()
        .filter(|r| !options.is_contractual(r))
        .collect();
    let payer_reason = candidates
        .iter()
        .find(|r| !r.is_patient_responsibility())
        .copied();
    let reason = payer_reason.or_else(|| candidates.first().copied()).cloned();

    let status = match explicit {
        Some(status) => status,
        None => match (amounts.charge, amounts.paid) {
            (Some(charge), Some(paid)) if paid <= 0.0 && charge > 0.0 => {
                if payer_reason.is_none() && reason.is_some() {
                    // paid nothing, but only because of patient responsibility
                    ClaimStatus::Approved
                } else {
                    ClaimStatus::Denied
                }
            }
            (_, Some(paid)) if paid > 0.0 => {
                if payer_reason.is_some() {
                    ClaimStatus::Partial
                } else {
                    ClaimStatus::Approved
                }
            }
            (_, None) if payer_reason.is_some() => ClaimStatus::Denied,
            _ => ClaimStatus::Approved,
        },
    };

    let reason = match status {
        ClaimStatus::Approved => None,
        ClaimStatus::Denied | ClaimStatus::Partial => reason,
    };

    (status, reason)
}

#[cfg(test)]
mod tests {
    use super::*;

    const FIXTURE_835: &str = include_str!("../../fixtures/sample.835");
    const FIXTURE_CSV: &str = include_str!("../../fixtures/denials.csv");

    fn reasons(codes: &[&str]) -> Vec<DenialReason> {
        codes.iter().map(|c| c.parse().unwrap()).collect()
    }

    #[test]
    fn test_detect_format() {
        assert_eq!(detect_format("835"), Ok(UploadFormat::X12));
        assert_eq!(detect_format(".EDI"), Ok(UploadFormat::X12));
        assert_eq!(detect_format("dat"), Ok(UploadFormat::X12));
        assert_eq!(detect_format("csv"), Ok(UploadFormat::Csv));
        assert_eq!(
            detect_format(".pdf"),
            Err(IngestError::UnsupportedFormat {
                extension: "pdf".to_string()
            })
        );
        assert!(detect_format("txt").is_err());
    }

    #[test]
    fn test_extension_helpers() {
        assert_eq!(extension_of(Path::new("uploads/ERA_JAN.835")), "835");
        assert_eq!(extension_of(Path::new("export.CSV")), "csv");
        assert_eq!(extension_of(Path::new("README")), "");
        assert!(is_accepted_extension(".dat"));
        assert!(!is_accepted_extension("pdf"));
    }

    #[test]
    fn test_unsupported_extension_is_rejected() {
        let err = parse_and_aggregate(FIXTURE_835.as_bytes(), "pdf").unwrap_err();
        assert!(matches!(err, IngestError::UnsupportedFormat { .. }));
    }

    #[test]
    fn test_oversized_upload_is_rejected() {
        let options = IngestOptions {
            max_upload_bytes: 16,
            ..IngestOptions::default()
        };
        let err = parse_and_aggregate_with(FIXTURE_835.as_bytes(), "835", &options).unwrap_err();
        assert!(matches!(err, IngestError::UploadTooLarge { limit: 16, .. }));
    }

    #[test]
    fn test_empty_upload_warns() {
        let result = parse_and_aggregate(b"", "835").unwrap();
        assert!(result.is_empty());
        assert_eq!(result.warnings, vec![IngestWarning::EmptyFile]);
        assert!(result.bucket_deltas.is_empty());
    }

    #[test]
    fn test_normalize_cpt() {
        assert_eq!(normalize_cpt("90837"), Some("90837".to_string()));
        assert_eq!(normalize_cpt(" 0001f "), Some("0001F".to_string()));
        assert_eq!(normalize_cpt("J1100"), Some("J1100".to_string()));
        assert_eq!(normalize_cpt("9083"), None);
        assert_eq!(normalize_cpt("ABCDE"), None);
        assert_eq!(normalize_cpt("0001X"), None);
    }

    #[test]
    fn test_resolve_outcome_explicit_denial() {
        let options = IngestOptions::default();
        let (status, reason) = resolve_outcome(
            Some(ClaimStatus::Denied),
            LineAmounts::default(),
            &reasons(&["CO-45", "CO-16"]),
            &options,
        );
        assert_eq!(status, ClaimStatus::Denied);
        assert_eq!(reason.unwrap().to_string(), "CO-16");
    }

    #[test]
    fn test_resolve_outcome_from_amounts() {
        let options = IngestOptions::default();
        let paid_in_full = LineAmounts {
            charge: Some(100.0),
            paid: Some(100.0),
        };
        let partially_paid = LineAmounts {
            charge: Some(100.0),
            paid: Some(40.0),
        };
        let unpaid = LineAmounts {
            charge: Some(100.0),
            paid: Some(0.0),
        };

        assert_eq!(
            resolve_outcome(None, paid_in_full, &reasons(&["CO-45"]), &options),
            (ClaimStatus::Approved, None)
        );
        let (status, reason) = resolve_outcome(None, partially_paid, &reasons(&["CO-4"]), &options);
        assert_eq!(status, ClaimStatus::Partial);
        assert_eq!(reason.unwrap().to_string(), "CO-4");

        let (status, reason) = resolve_outcome(None, unpaid, &reasons(&["CO-97", "OA-18"]), &options);
        assert_eq!(status, ClaimStatus::Denied);
        assert_eq!(reason.unwrap().to_string(), "OA-18");
    }

    #[test]
    fn test_resolve_outcome_patient_responsibility_is_not_denial() {
        let options = IngestOptions::default();
        let unpaid = LineAmounts {
            charge: Some(100.0),
            paid: Some(0.0),
        };
        let partially_paid = LineAmounts {
            charge: Some(100.0),
            paid: Some(80.0),
        };

        assert_eq!(
            resolve_outcome(None, unpaid, &reasons(&["PR-1"]), &options),
            (ClaimStatus::Approved, None)
        );
        assert_eq!(
            resolve_outcome(None, partially_paid, &reasons(&["PR-2"]), &options),
            (ClaimStatus::Approved, None)
        );
        // payer reason wins over patient responsibility
        let (_, reason) = resolve_outcome(
            Some(ClaimStatus::Denied),
            unpaid,
            &reasons(&["PR-1", "CO-29"]),
            &options,
        );
        assert_eq!(reason.unwrap().to_string(), "CO-29");
    }

    #[test]
    fn test_fixtures_parse_into_matching_shapes() {
        let era = parse_and_aggregate(FIXTURE_835.as_bytes(), "835").unwrap();
        let csv = parse_and_aggregate(FIXTURE_CSV.as_bytes(), "csv").unwrap();

        assert_eq!(era.format, UploadFormat::X12);
        assert_eq!(csv.format, UploadFormat::Csv);
        assert!(era.lines_processed > 0);
        assert!(csv.lines_processed > 0);
        assert_eq!(era.totals().total, era.lines_processed);
        assert_eq!(csv.totals().total, csv.lines_processed);
        assert_ne!(era.fingerprint, csv.fingerprint);
    }
}
