//! X12 835 (Electronic Remittance Advice) parsing.
//!
//! Walks the segment stream once, keeping only the context aggregation
//! needs: payer name, payer/payee state, claim status, adjustment reasons and
//! service months. Patient (`NM1*QC`), insured (`NM1*IL`) and provider
//! (`NM1*82`) segments are skipped without reading their elements, and claim
//! identifiers (CLP01, CLP07) are never read.

use super::{normalize_cpt, resolve_outcome, IngestOptions, LineAmounts, LineSink};
use crate::deid;
use crate::error::IngestError;
use crate::models::{ClaimStatus, DenialReason, RemittanceRecord, UNKNOWN_STATE};

/// Adjustment groups that can carry a denial reason.
const ADJUSTMENT_GROUPS: [&str; 5] = ["CO", "PR", "OA", "PI", "CR"];

/// Separator characters of an interchange.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Delimiters {
    pub element: char,
    pub component: char,
    pub segment: char,
}

impl Default for Delimiters {
    fn default() -> Self {
        Self {
            element: '*',
            component: ':',
            segment: '~',
        }
    }
}

impl Delimiters {
    /// Read delimiters from the fixed-width ISA header, if there is one.
    pub fn detect(text: &str) -> Self {
        let bytes = text.as_bytes();
        if bytes.len() < 106 || !text.starts_with("ISA") {
            return Self::default();
        }

        let element = bytes[3] as char;
        let component = bytes[104] as char;
        let segment = bytes[105] as char;
        let usable = |c: char| c.is_ascii() && !c.is_ascii_alphanumeric() && c != ' ';

        if usable(element) && usable(component) && (usable(segment) || segment == '\n') {
            Self {
                element,
                component,
                segment,
            }
        } else {
            Self::default()
        }
    }
}

/// Split an interchange into `(position, segment)` pairs, 1-based.
///
/// Line breaks also end segments, so newline-delimited files parse too.
pub fn segments(text: &str, delimiters: Delimiters) -> impl Iterator<Item = (usize, &str)> {
    text.split(move |c: char| c == delimiters.segment || c == '\n' || c == '\r')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .enumerate()
        .map(|(i, s)| (i + 1, s))
}

/// Which N1 party loop is open, for attributing N4 states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Party {
    Payer,
    Payee,
    Other,
}

/// Claim status as far as aggregation cares.
#[derive(Debug, Clone)]
enum ClaimDisposition {
    Processed,
    Denied,
    Unsupported(String),
}

impl ClaimDisposition {
    fn from_code(code: &str) -> Self {
        match code.trim() {
            "1" | "2" | "3" | "19" | "20" | "21" => ClaimDisposition::Processed,
            "4" => ClaimDisposition::Denied,
            "22" => ClaimDisposition::Unsupported("reversal claims are not aggregated".to_string()),
            "" => ClaimDisposition::Unsupported("missing claim status code".to_string()),
            _ => ClaimDisposition::Unsupported("unknown claim status code".to_string()),
        }
    }
}

#[derive(Debug)]
struct ServiceLine {
    position: usize,
    procedure: Result<String, String>,
    charge: Result<f64, String>,
    paid: Result<f64, String>,
    adjustments: Vec<DenialReason>,
    month: Option<String>,
}

#[derive(Debug)]
struct Claim {
    position: usize,
    disposition: ClaimDisposition,
    adjustments: Vec<DenialReason>,
    month: Option<String>,
    line: Option<ServiceLine>,
    lines_seen: usize,
}

/// Parser state for one interchange.
struct Parser<'a> {
    delimiters: Delimiters,
    options: &'a IngestOptions,
    payer: Option<String>,
    payer_state: Option<String>,
    payee_state: Option<String>,
    party: Party,
    claim: Option<Claim>,
}

/// Parse an 835 interchange into the sink.
pub(crate) fn parse(text: &str, options: &IngestOptions, sink: &mut LineSink) {
    let text = text.trim_start_matches('\u{feff}').trim_start();
    let delimiters = Delimiters::detect(text);
    let mut parser = Parser {
        delimiters,
        options,
        payer: None,
        payer_state: None,
        payee_state: None,
        party: Party::Other,
        claim: None,
    };

    for (position, segment) in segments(text, delimiters) {
        parser.segment(position, segment, sink);
    }
    parser.close_claim(sink);
}

impl<'a> Parser<'a> {
    fn segment(&mut self, position: usize, segment: &str, sink: &mut LineSink) {
        let elements: Vec<&str> = segment.split(self.delimiters.element).collect();
        let id = elements[0].trim();
        let element = |i: usize| elements.get(i).map(|e| e.trim()).unwrap_or("");

        match id {
            "ST" => {
                self.close_claim(sink);
                self.payer = None;
                self.payer_state = None;
                self.payee_state = None;
                self.party = Party::Other;
            }
            "N1" => {
                self.party = match element(1) {
                    "PR" => {
                        let name = element(2);
                        let fallback = element(4);
                        self.payer = deid::guard_dimension(name)
                            .or_else(|| deid::guard_dimension(fallback));
                        Party::Payer
                    }
                    "PE" => Party::Payee,
                    _ => Party::Other,
                };
            }
            "N4" => {
                let state = element(2);
                if !state.is_empty() {
                    match self.party {
                        Party::Payer => self.payer_state = Some(deid::normalize_state(state)),
                        Party::Payee => self.payee_state = Some(deid::normalize_state(state)),
                        Party::Other => {}
                    }
                }
            }
            "CLP" => {
                self.close_claim(sink);
                self.party = Party::Other;
                self.claim = Some(Claim {
                    position,
                    disposition: ClaimDisposition::from_code(element(2)),
                    adjustments: Vec::new(),
                    month: None,
                    line: None,
                    lines_seen: 0,
                });
            }
            "SVC" => {
                let line = ServiceLine {
                    position,
                    procedure: self.procedure_code(element(1)),
                    charge: parse_amount(element(2), "charge"),
                    paid: parse_amount(element(3), "paid amount"),
                    adjustments: Vec::new(),
                    month: None,
                };
                if self.claim.is_none() {
                    sink.skip(position, "service line outside a claim");
                    return;
                }
                self.close_line(sink);
                if let Some(claim) = self.claim.as_mut() {
                    claim.line = Some(line);
                    claim.lines_seen += 1;
                }
            }
            "CAS" => {
                let reasons = adjustment_reasons(&elements);
                if let Some(claim) = self.claim.as_mut() {
                    match claim.line.as_mut() {
                        Some(line) => line.adjustments.extend(reasons),
                        None => claim.adjustments.extend(reasons),
                    }
                }
            }
            "DTM" => {
                let qualifier = element(1);
                if let Some(claim) = self.claim.as_mut() {
                    match qualifier {
                        // service date / service period start
                        "472" | "150" => {
                            let month = deid::service_month(element(2));
                            match claim.line.as_mut() {
                                Some(line) => line.month = month.or(line.month.take()),
                                None => claim.month = month.or(claim.month.take()),
                            }
                        }
                        // claim statement period start
                        "232" => {
                            if let Some(month) = deid::service_month(element(2)) {
                                claim.month = Some(month);
                            }
                        }
                        _ => {}
                    }
                }
            }
            "SE" | "GE" | "IEA" => self.close_claim(sink),
            _ => {}
        }
    }

    fn procedure_code(&self, composite: &str) -> Result<String, String> {
        let parts: Vec<&str> = composite.split(self.delimiters.component).collect();
        let code = match parts.as_slice() {
            [] | [""] => return Err("missing procedure code".to_string()),
            [single] => *single,
            [_qualifier, code, ..] => *code,
        };
        normalize_cpt(code).ok_or_else(|| "invalid procedure code".to_string())
    }

    fn close_line(&mut self, sink: &mut LineSink) {
        let Some(claim) = self.claim.as_mut() else {
            return;
        };
        let Some(line) = claim.line.take() else {
            return;
        };

        let record = build_record(
            line,
            claim,
            self.payer.as_deref(),
            self.payee_state.as_deref().or(self.payer_state.as_deref()),
            self.options,
        );
        sink.accept(record);
    }

    fn close_claim(&mut self, sink: &mut LineSink) {
        self.close_line(sink);
        if let Some(claim) = self.claim.take() {
            if claim.lines_seen == 0 {
                sink.skip(claim.position, "claim without service lines");
            }
        }
    }
}

fn build_record(
    line: ServiceLine,
    claim: &Claim,
    payer: Option<&str>,
    state: Option<&str>,
    options: &IngestOptions,
) -> Result<RemittanceRecord, IngestError> {
    let position = line.position;
    let malformed = |reason: String| IngestError::malformed(position, reason);

    let explicit = match &claim.disposition {
        ClaimDisposition::Processed => None,
        ClaimDisposition::Denied => Some(ClaimStatus::Denied),
        ClaimDisposition::Unsupported(reason) => return Err(malformed(reason.clone())),
    };
    let payer = payer
        .map(String::from)
        .ok_or_else(|| malformed("no payer identification before claim".to_string()))?;
    let cpt_code = line.procedure.map_err(malformed)?;
    let charge = line.charge.map_err(malformed)?;
    let paid = line.paid.map_err(malformed)?;

    let mut adjustments = line.adjustments;
    adjustments.extend(claim.adjustments.iter().cloned());

    let (status, denial_reason) = resolve_outcome(
        explicit,
        LineAmounts {
            charge: Some(charge),
            paid: Some(paid),
        },
        &adjustments,
        options,
    );

    Ok(RemittanceRecord {
        payer,
        cpt_code,
        status,
        denial_reason,
        state: state.unwrap_or(UNKNOWN_STATE).to_string(),
        service_month: line.month.or_else(|| claim.month.clone()),
    })
}

fn parse_amount(raw: &str, what: &str) -> Result<f64, String> {
    let cleaned = raw.replace(['$', ','], "");
    if cleaned.trim().is_empty() {
        return Err(format!("missing {}", what));
    }
    cleaned
        .trim()
        .parse::<f64>()
        .map_err(|_| format!("non-numeric {}", what))
}

/// Reason codes of a CAS segment: group, then up to six
/// (reason, amount, quantity) triples.
fn adjustment_reasons(elements: &[&str]) -> Vec<DenialReason> {
    let group = elements.get(1).map(|g| g.trim()).unwrap_or("");
    if !ADJUSTMENT_GROUPS.contains(&group) {
        return Vec::new();
    }

    elements
        .iter()
        .skip(2)
        .step_by(3)
        .take(6)
        .map(|code| code.trim())
        .filter(|code| !code.is_empty())
        .map(|code| DenialReason::new(group, code))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ingest::parse_and_aggregate;
    use crate::models::BucketKey;

    const FIXTURE_835: &str = include_str!("../../fixtures/sample.835");
    const FIXTURE_MIXED: &str = include_str!("../../fixtures/mixed_quality.835");

    #[test]
    fn test_detect_delimiters_from_isa() {
        let delimiters = Delimiters::detect(FIXTURE_835);
        assert_eq!(delimiters, Delimiters::default());

        let custom = FIXTURE_835.replacen('*', "|", 16).replacen(":~", "^!", 1);
        let detected = Delimiters::detect(&custom);
        assert_eq!(detected.element, '|');
        assert_eq!(detected.component, '^');
        assert_eq!(detected.segment, '!');
    }

    #[test]
    fn test_detect_delimiters_without_isa() {
        assert_eq!(Delimiters::detect("ST*835*0001~"), Delimiters::default());
    }

    #[test]
    fn test_segments_accept_newline_terminators() {
        let text = "ST*835*0001\nBPR*I*0*C\r\nSE*3*0001~";
        let ids: Vec<_> = segments(text, Delimiters::default())
            .map(|(pos, s)| (pos, s.split('*').next().unwrap()))
            .collect();
        assert_eq!(ids, vec![(1, "ST"), (2, "BPR"), (3, "SE")]);
    }

    #[test]
    fn test_adjustment_reasons_reads_triples() {
        let elements: Vec<&str> = "CAS*CO*16*125.00*1*45*20.00**97*5.00"
            .split('*')
            .collect();
        let reasons: Vec<String> = adjustment_reasons(&elements)
            .iter()
            .map(ToString::to_string)
            .collect();
        assert_eq!(reasons, vec!["CO-16", "CO-45", "CO-97"]);

        let unknown: Vec<&str> = "CAS*ZZ*16*1".split('*').collect();
        assert!(adjustment_reasons(&unknown).is_empty());
    }

    #[test]
    fn test_parse_sample_interchange() {
        let result = parse_and_aggregate(FIXTURE_835.as_bytes(), "835").unwrap();

        assert_eq!(result.lines_processed, 5);
        assert_eq!(result.lines_skipped, 0);
        assert!(result.warnings.is_empty());

        let timely = BucketKey::new("BLUE CROSS BLUE SHIELD OF IL", "IL", "90837", Some("CO-29"));
        assert_eq!(result.delta_for(&timely).map(|c| c.denied), Some(1));

        let approved = BucketKey::new("BLUE CROSS BLUE SHIELD OF IL", "IL", "90834", None);
        assert_eq!(result.delta_for(&approved).map(|c| c.approved), Some(1));

        let partial = BucketKey::new("BLUE CROSS BLUE SHIELD OF IL", "IL", "90791", Some("CO-4"));
        assert_eq!(result.delta_for(&partial).map(|c| c.partial), Some(1));

        let totals = result.totals();
        assert_eq!(totals.total, 5);
        assert_eq!(totals.approved + totals.denied + totals.partial, 5);
    }

    #[test]
    fn test_parse_sample_trends_by_month() {
        let result = parse_and_aggregate(FIXTURE_835.as_bytes(), "835").unwrap();
        let months: Vec<&str> = result
            .trend_deltas
            .iter()
            .map(|(k, _)| k.service_month.as_str())
            .collect();
        assert_eq!(months, vec!["2024-01", "2024-02"]);
        assert!(result.trend_deltas.iter().all(|(k, _)| k.state == "IL"));
    }

    #[test]
    fn test_parse_keeps_no_identifiers() {
        let result = parse_and_aggregate(FIXTURE_835.as_bytes(), "835").unwrap();
        let identifiers = [
            "SMITH", "JAMES", "GARCIA", "MARIA", "JOHNSON", "SARAH", "123456789", "987654321",
            "1234567890", "2345678901", "1122334455", "CLM100000001", "CLM100000002",
            "20240115", "20240203", "20240210",
        ];

        let rendered = serde_json::to_string(&result).unwrap();
        for id in identifiers {
            assert!(!rendered.contains(id), "identifier {} leaked", id);
        }
    }

    #[test]
    fn test_malformed_lines_are_counted_not_fatal() {
        let result = parse_and_aggregate(FIXTURE_MIXED.as_bytes(), "edi").unwrap();

        assert_eq!(result.lines_processed, 10);
        assert_eq!(result.lines_skipped, 2);
        assert_eq!(result.skipped.len(), 2);
        assert_eq!(result.totals().total, 10);
        assert_eq!(result.bucket_deltas.len(), 9);

        let reasons: Vec<&str> = result.skipped.iter().map(|s| s.reason.as_str()).collect();
        assert!(reasons.contains(&"invalid procedure code"));
        assert!(reasons.contains(&"non-numeric paid amount"));
    }

    #[test]
    fn test_missing_payer_skips_lines() {
        let text = "ST*835*0001~CLP*A1*1*100*100~SVC*HC:99213*100*100~SE*4*0001~";
        let result = parse_and_aggregate(text.as_bytes(), "835").unwrap();
        assert_eq!(result.lines_processed, 0);
        assert_eq!(result.lines_skipped, 1);
        assert_eq!(
            result.skipped[0].reason,
            "no payer identification before claim"
        );
    }

    #[test]
    fn test_claim_without_service_lines_is_skipped() {
        let text = "ST*835*0001~N1*PR*HUMANA~CLP*A1*4*100*0~CAS*CO*16*100~SE*5*0001~";
        let result = parse_and_aggregate(text.as_bytes(), "835").unwrap();
        assert_eq!(result.lines_skipped, 1);
        assert_eq!(result.skipped[0].reason, "claim without service lines");
        assert_eq!(result.warnings[0], crate::models::IngestWarning::EmptyFile);
    }

    #[test]
    fn test_reversal_claims_are_skipped() {
        let text = "ST*835*0001~N1*PR*HUMANA~CLP*A1*22*-100*-100~SVC*HC:99213*-100*-100~SE*5*0001~";
        let result = parse_and_aggregate(text.as_bytes(), "835").unwrap();
        assert_eq!(result.lines_processed, 0);
        assert_eq!(result.lines_skipped, 1);
    }

    #[test]
    fn test_state_falls_back_to_payer_then_unknown() {
        let with_payer_state =
            "ST*835*1~N1*PR*HUMANA~N4*LOUISVILLE*KY*40202~CLP*A*1*10*10~SVC*HC:99213*10*10~SE*6*1~";
        let result = parse_and_aggregate(with_payer_state.as_bytes(), "835").unwrap();
        assert_eq!(result.bucket_deltas[0].0.state, "KY");

        let no_state = "ST*835*1~N1*PR*HUMANA~CLP*A*1*10*10~SVC*HC:99213*10*10~SE*5*1~";
        let result = parse_and_aggregate(no_state.as_bytes(), "835").unwrap();
        assert_eq!(result.bucket_deltas[0].0.state, UNKNOWN_STATE);
    }

    #[test]
    fn test_identifier_shaped_payer_name_falls_back_to_id() {
        let text = "ST*835*1~N1*PR*123456789012*XV*00621~CLP*A*1*10*10~SVC*HC:99213*10*10~SE*5*1~";
        let result = parse_and_aggregate(text.as_bytes(), "835").unwrap();
        assert_eq!(result.bucket_deltas[0].0.payer, "00621");
    }
}
