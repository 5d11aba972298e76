//! CSV denial export parsing.
//!
//! Exports from different billing systems name their columns differently,
//! so columns are matched by keyword. Columns that name a person, a member,
//! a provider or a claim are never mapped and their cells are never read.

use super::{normalize_cpt, resolve_outcome, IngestOptions, LineAmounts, LineSink};
use crate::deid;
use crate::error::IngestError;
use crate::models::{ClaimStatus, DenialReason, IngestWarning, RemittanceRecord, UNKNOWN_STATE};
use csv::{ReaderBuilder, StringRecord, Trim};
use tracing::debug;

/// Header keywords marking identifying columns.
const IDENTIFYING_KEYWORDS: [&str; 11] = [
    "patient",
    "member",
    "subscriber",
    "insured",
    "npi",
    "ssn",
    "birth",
    "dob",
    "mrn",
    "account",
    "name",
];

/// Words that make any column an identifier: `claim status` is fine,
/// `claim id`, `insurance id` and `policy #` are not.
const ID_TOKENS: [&str; 10] = [
    "id", "number", "num", "no", "#", "policy", "control", "icn", "ref", "reference",
];

/// Payer identifiers name the payer, not a person.
const PAYER_ID_HEADERS: [&str; 2] = ["payerid", "payorid"];

/// Column positions used for aggregation.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ColumnMap {
    pub payer: Option<usize>,
    pub cpt: Option<usize>,
    pub status: Option<usize>,
    pub reason: Option<usize>,
    pub group: Option<usize>,
    pub state: Option<usize>,
    pub date: Option<usize>,
    pub paid: Option<usize>,
    pub charge: Option<usize>,
}

impl ColumnMap {
    /// Match headers to fields by keyword. The first matching column wins.
    pub fn from_headers(headers: &StringRecord) -> Self {
        let mut map = ColumnMap::default();

        for (idx, header) in headers.iter().enumerate() {
            let h = header.trim().to_lowercase();
            if is_identifying(&h) {
                continue;
            }

            let slot = if h.contains("status") {
                &mut map.status
            } else if ["cpt", "procedure", "hcpcs", "service_code", "proc code"]
                .iter()
                .any(|k| h.contains(k))
            {
                &mut map.cpt
            } else if h.contains("group") || h.contains("grp") {
                &mut map.group
            } else if ["carc", "reason", "denial", "adj"].iter().any(|k| h.contains(k)) {
                &mut map.reason
            } else if h.contains("state") {
                &mut map.state
            } else if h.contains("date") || h == "dos" {
                &mut map.date
            } else if h.contains("paid") || h.contains("payment") {
                &mut map.paid
            } else if h.contains("charge") || h.contains("billed") {
                &mut map.charge
            } else if PAYER_KEYWORDS.iter().any(|k| h.contains(k)) {
                &mut map.payer
            } else {
                continue;
            };

            if slot.is_none() {
                *slot = Some(idx);
            }
        }

        map
    }

    /// Names of required fields with no column.
    pub fn missing_required(&self) -> Vec<String> {
        let mut missing = Vec::new();
        if self.payer.is_none() {
            missing.push("payer".to_string());
        }
        if self.cpt.is_none() {
            missing.push("cpt".to_string());
        }
        missing
    }
}

const PAYER_KEYWORDS: [&str; 5] = ["payer", "payor", "insurance", "carrier", "plan"];

fn is_identifying(header: &str) -> bool {
    let compact: String = header.chars().filter(|c| c.is_alphanumeric()).collect();
    if PAYER_ID_HEADERS.contains(&compact.as_str()) {
        return false;
    }

    let spaced = header.replace('#', " # ");
    let words: Vec<&str> = spaced
        .split(|c: char| !c.is_alphanumeric() && c != '#')
        .filter(|w| !w.is_empty())
        .collect();
    let has_id_token = words.iter().any(|w| is_id_word(w));

    // "payer name" is a dimension, "patient name" is not
    if !has_id_token
        && header.contains("name")
        && PAYER_KEYWORDS.iter().any(|k| header.contains(k))
    {
        return false;
    }

    has_id_token || IDENTIFYING_KEYWORDS.iter().any(|k| header.contains(k))
}

/// `id`, `policy`, or a run-together form like `memberid` / `policyno`.
fn is_id_word(word: &str) -> bool {
    if ID_TOKENS.contains(&word) {
        return true;
    }
    ["id", "no", "num", "number"].iter().any(|suffix| {
        word.strip_suffix(suffix).is_some_and(|stem| {
            IDENTIFYING_KEYWORDS
                .iter()
                .chain(PAYER_KEYWORDS.iter())
                .chain(["policy", "claim", "group", "plan"].iter())
                .any(|k| stem == *k)
        })
    })
}

/// Parse a CSV export into the sink, returning file-level warnings.
pub(crate) fn parse(bytes: &[u8], options: &IngestOptions, sink: &mut LineSink) -> Vec<IngestWarning> {
    if bytes.iter().all(u8::is_ascii_whitespace) {
        return Vec::new();
    }

    let mut reader = ReaderBuilder::new()
        .has_headers(true)
        .flexible(true)
        .trim(Trim::All)
        .from_reader(bytes);

    let columns = match reader.headers() {
        Ok(headers) => ColumnMap::from_headers(headers),
        Err(_) => {
            debug!("Unreadable CSV header row");
            return vec![IngestWarning::MissingColumns(vec![
                "payer".to_string(),
                "cpt".to_string(),
            ])];
        }
    };

    let missing = columns.missing_required();
    if !missing.is_empty() {
        return vec![IngestWarning::MissingColumns(missing)];
    }

    for (idx, row) in reader.records().enumerate() {
        let position = idx + 1;
        match row {
            Ok(record) => sink.accept(build_record(&record, &columns, position, options)),
            Err(_) => sink.skip(position, "unreadable row"),
        }
    }

    Vec::new()
}

fn build_record(
    row: &StringRecord,
    columns: &ColumnMap,
    position: usize,
    options: &IngestOptions,
) -> Result<RemittanceRecord, IngestError> {
    let cell = |col: Option<usize>| col.and_then(|i| row.get(i)).unwrap_or("").trim();
    let malformed = |reason: &str| IngestError::malformed(position, reason);

    let payer = match cell(columns.payer) {
        "" => return Err(malformed("missing payer")),
        raw => deid::guard_dimension(raw).ok_or_else(|| malformed("payer looks like an identifier"))?,
    };
    let cpt_code = match cell(columns.cpt) {
        "" => return Err(malformed("missing procedure code")),
        raw => normalize_cpt(raw).ok_or_else(|| malformed("invalid procedure code"))?,
    };

    let explicit = match cell(columns.status) {
        "" => None,
        raw => Some(
            raw.parse::<ClaimStatus>()
                .map_err(|_| malformed("unrecognized status"))?,
        ),
    };

    let mut adjustments = Vec::new();
    let reason_cell = cell(columns.reason);
    if !reason_cell.is_empty() {
        let mut reason: DenialReason = reason_cell
            .parse()
            .map_err(|_| malformed("invalid denial reason"))?;
        let group = cell(columns.group);
        if !reason_cell.contains('-') && group.len() == 2 {
            reason.group = group.to_uppercase();
        }
        adjustments.push(reason);
    }

    let amounts = LineAmounts {
        charge: parse_optional_amount(cell(columns.charge))
            .map_err(|_| malformed("non-numeric charge"))?,
        paid: parse_optional_amount(cell(columns.paid))
            .map_err(|_| malformed("non-numeric paid amount"))?,
    };

    let (status, denial_reason) = resolve_outcome(explicit, amounts, &adjustments, options);

    let state = match cell(columns.state) {
        "" => UNKNOWN_STATE.to_string(),
        raw => deid::normalize_state(raw),
    };

    Ok(RemittanceRecord {
        payer,
        cpt_code,
        status,
        denial_reason,
        state,
        service_month: deid::service_month(cell(columns.date)),
    })
}

fn parse_optional_amount(raw: &str) -> Result<Option<f64>, std::num::ParseFloatError> {
    let cleaned = raw.replace(['$', ','], "");
    let cleaned = cleaned.trim();
    if cleaned.is_empty() {
        return Ok(None);
    }
    cleaned.parse::<f64>().map(Some)
}
