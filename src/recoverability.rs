//! Recoverability classification of claim adjustment reason codes.
//!
//! Maps a CARC code to how much revenue can realistically be recovered from
//! a denial carrying it. Unknown codes need manual review.

use serde::{Deserialize, Serialize};
use std::fmt;

/// How a denial reason can be worked.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Recoverability {
    /// Billing or coding error: correct and resubmit.
    Correctable,
    /// Timely filing: appeal with proof of retroactive eligibility.
    TimelyFilingAppeal,
    /// Depends on eligibility or coordination of benefits.
    Conditional,
    /// Authorization failures: only prevention helps.
    PreventionRequired,
    /// Policy limits, duplicates, coverage gaps.
    Unrecoverable,
    /// Deductible, coinsurance, copay.
    PatientResponsibility,
    /// Expected contractual reductions.
    Contractual,
    /// Not in the table.
    ReviewRequired,
}

impl Recoverability {
    pub const ALL: [Recoverability; 8] = [
        Recoverability::Correctable,
        Recoverability::TimelyFilingAppeal,
        Recoverability::Conditional,
        Recoverability::PreventionRequired,
        Recoverability::Unrecoverable,
        Recoverability::PatientResponsibility,
        Recoverability::Contractual,
        Recoverability::ReviewRequired,
    ];

    /// Suggested next step for this category.
    pub fn action(&self) -> &'static str {
        match self {
            Recoverability::Correctable => "Correct the claim and resubmit",
            Recoverability::TimelyFilingAppeal => "Appeal with proof of timely filing",
            Recoverability::Conditional => "Verify eligibility or coordination of benefits",
            Recoverability::PreventionRequired => "Fix the authorization workflow",
            Recoverability::Unrecoverable => "Write off; no recovery path",
            Recoverability::PatientResponsibility => "Bill the patient balance",
            Recoverability::Contractual => "Contractual write-off",
            Recoverability::ReviewRequired => "Manual review required",
        }
    }

    /// Whether working the denial can bring money back from the payer.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            Recoverability::Correctable
                | Recoverability::TimelyFilingAppeal
                | Recoverability::Conditional
        )
    }
}

impl fmt::Display for Recoverability {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Recoverability::Correctable => write!(f, "Correctable"),
            Recoverability::TimelyFilingAppeal => write!(f, "Timely Filing Appeal"),
            Recoverability::Conditional => write!(f, "Conditional"),
            Recoverability::PreventionRequired => write!(f, "Prevention Required"),
            Recoverability::Unrecoverable => write!(f, "Unrecoverable"),
            Recoverability::PatientResponsibility => write!(f, "Patient Responsibility"),
            Recoverability::Contractual => write!(f, "Contractual"),
            Recoverability::ReviewRequired => write!(f, "Review Required"),
        }
    }
}

/// Classify a CARC code (`16`) or a grouped reason (`CO-16`).
pub fn classify(reason: &str) -> Recoverability {
    let code = reason.rsplit('-').next().unwrap_or(reason).trim();

    match code {
        "1" | "2" | "3" | "66" => Recoverability::PatientResponsibility,

        "4" | "5" | "6" | "7" | "8" | "9" | "10" | "11" | "12" | "15" | "16" | "96" | "109"
        | "140" | "146" | "167" | "170" | "171" | "172" | "173" | "181" | "182" | "183"
        | "184" | "185" | "199" | "206" | "207" | "208" | "226" | "227" | "252" | "282" => {
            Recoverability::Correctable
        }

        "22" | "31" => Recoverability::Conditional,

        "44" | "45" | "59" | "97" => Recoverability::Contractual,

        "29" => Recoverability::TimelyFilingAppeal,

        "39" | "197" | "198" => Recoverability::PreventionRequired,

        "18" | "26" | "27" | "35" | "50" | "55" | "119" | "149" | "204" => {
            Recoverability::Unrecoverable
        }

        _ => Recoverability::ReviewRequired,
    }
}
