//! Types that describe one synchronization run: its scope, the progress events it emits and its
//! terminal result.

use crate::model::Amount;
use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use std::fmt::{Display, Formatter};
use uuid::Uuid;

/// Identifies one run of the tracker. Events carrying any other id belong to an abandoned run.
#[derive(Debug, Clone, Copy, Eq, PartialEq, Hash, Serialize, Deserialize)]
pub struct RunId(Uuid);

impl RunId {
    pub(crate) fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Display for RunId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        Display::fmt(&self.0, f)
    }
}

/// Which accounts a run covers.
#[derive(Debug, Clone, Default, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncScope {
    /// Every connected account.
    #[default]
    All,
    /// Every account of the bank with this routing code.
    Bank(String),
    /// Only these IBANs.
    Accounts(Vec<String>),
}

impl SyncScope {
    /// Whether the account `iban` at the bank `routing_code` is covered by this scope.
    pub fn includes(&self, routing_code: &str, iban: &str) -> bool {
        match self {
            SyncScope::All => true,
            SyncScope::Bank(code) => code == routing_code,
            SyncScope::Accounts(ibans) => ibans.iter().any(|i| i == iban),
        }
    }
}

/// The stages of a run, in the only order they may occur.
#[derive(
    Debug, Default, Clone, Copy, Eq, PartialEq, Ord, PartialOrd, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum SyncPhase {
    /// Talking to the bank. TAN approval can only happen here and may take minutes.
    #[default]
    Connecting,
    /// Talking to the bank, downloading transactions.
    Fetching,
    Classifying,
    Complete,
}

serde_plain::derive_display_from_serialize!(SyncPhase);

/// The status of one step in a reduced two-step view ("fetch from bank", "classify").
#[derive(Debug, Clone, Copy, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    Pending,
    Active,
    Complete,
}

/// A snapshot of an in-flight run.
#[derive(Debug, Clone, Default, Eq, PartialEq, Serialize, Deserialize)]
pub struct SyncProgress {
    pub phase: SyncPhase,
    /// Zero-based index of the account being processed.
    #[serde(default)]
    pub account_index: u32,
    #[serde(default)]
    pub account_count: u32,
    #[serde(default)]
    pub iban: Option<String>,
    #[serde(default)]
    pub account_name: Option<String>,
    #[serde(default)]
    pub transactions_current: u64,
    /// `None` until the number of transactions to classify is known.
    #[serde(default)]
    pub transactions_total: Option<u64>,
    #[serde(default)]
    pub message: String,
    /// Description of the transaction that was classified last.
    #[serde(default)]
    pub last_transaction: Option<String>,
    /// The category (account) the last transaction was classified against.
    #[serde(default)]
    pub last_classified_as: Option<String>,
}

impl SyncProgress {
    /// The snapshot shown before the first event of a run arrives.
    pub fn starting() -> Self {
        Self {
            message: "Connecting to bank".to_string(),
            ..Default::default()
        }
    }

    /// True when the transaction total is known and is zero, i.e. nothing new was fetched.
    pub fn nothing_to_classify(&self) -> bool {
        self.transactions_total == Some(0)
    }

    /// The "fetch from bank" step, which collapses `connecting` and `fetching`.
    pub fn bank_step(&self) -> StepStatus {
        match self.phase {
            SyncPhase::Connecting | SyncPhase::Fetching => StepStatus::Active,
            SyncPhase::Classifying | SyncPhase::Complete => StepStatus::Complete,
        }
    }

    /// The "classify" step. When nothing was fetched it is complete as soon as that is known.
    pub fn classify_step(&self) -> StepStatus {
        match self.phase {
            SyncPhase::Complete => StepStatus::Complete,
            SyncPhase::Fetching | SyncPhase::Classifying if self.nothing_to_classify() => {
                StepStatus::Complete
            }
            SyncPhase::Classifying => StepStatus::Active,
            SyncPhase::Connecting | SyncPhase::Fetching => StepStatus::Pending,
        }
    }

    /// Classification progress as a fraction, when it can be computed.
    pub fn fraction(&self) -> Option<f64> {
        match self.transactions_total {
            Some(0) => Some(1.0),
            Some(total) => Some(self.transactions_current as f64 / total as f64),
            None => None,
        }
    }
}

/// Per-account numbers of a finished run.
#[derive(Debug, Clone, Default, Eq, PartialEq, Serialize, Deserialize)]
pub struct AccountSyncStats {
    pub iban: String,
    pub account_name: String,
    pub imported: u64,
    pub skipped: u64,
    pub failed: u64,
}

/// A correction made to an account's opening balance so that the imported history adds up to the
/// balance reported by the bank.
#[derive(Debug, Clone, Eq, PartialEq, Serialize, Deserialize)]
pub struct OpeningBalanceAdjustment {
    pub iban: String,
    pub account_name: String,
    pub amount: Amount,
    pub date: NaiveDate,
}

/// A structured, non-fatal problem reported in a run result.
#[derive(Debug, Clone, Eq, PartialEq, Serialize, Deserialize)]
pub struct SyncIssue {
    #[serde(default)]
    pub iban: Option<String>,
    pub message: String,
}

/// The terminal summary of a completed run.
#[derive(Debug, Clone, Default, Eq, PartialEq, Serialize, Deserialize)]
pub struct SyncRunResult {
    pub total_imported: u64,
    pub total_skipped: u64,
    pub total_failed: u64,
    pub accounts_synced: u32,
    #[serde(default)]
    pub account_stats: Vec<AccountSyncStats>,
    #[serde(default)]
    pub opening_balance_adjustments: Vec<OpeningBalanceAdjustment>,
    #[serde(default)]
    pub errors: Vec<SyncIssue>,
    #[serde(default)]
    pub opening_balance_account_missing: bool,
    /// Set when the run completed but its result never arrived.
    #[serde(default)]
    pub totals_unknown: bool,
}

impl SyncRunResult {
    /// The result recorded when `complete` was seen but the final payload did not arrive in time.
    pub fn unknown_totals() -> Self {
        Self {
            totals_unknown: true,
            ..Default::default()
        }
    }
}

/// What the streaming-progress collaborator sends for one run. Zero or more `Progress` events are
/// followed by exactly one `Finished` or `Failed`.
#[derive(Debug, Clone, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncEvent {
    Progress(SyncProgress),
    Finished(SyncRunResult),
    Failed(String),
}

/// How a tracker run ended successfully.
#[derive(Debug, Clone, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncOutcome {
    /// The run happened. It may have imported zero transactions.
    Completed(SyncRunResult),
    /// The user skipped the first-sync prompt; no run happened.
    Skipped,
}

impl SyncOutcome {
    pub fn result(&self) -> Option<&SyncRunResult> {
        match self {
            SyncOutcome::Completed(result) => Some(result),
            SyncOutcome::Skipped => None,
        }
    }
}
