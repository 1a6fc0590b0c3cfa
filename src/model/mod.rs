//! Types that represent the data model of a bank connection and of a synchronization run.
mod amount;
mod bank;
mod sync;

pub use amount::{Amount, AmountError};
pub use bank::{
    AccountNameOverrides, BankCredentialDraft, BankLookupResult, ConnectionResult,
    DiscoveredAccount, ImportedAccount, TanMethod, TanMethods,
};
pub use sync::{
    AccountSyncStats, OpeningBalanceAdjustment, RunId, StepStatus, SyncEvent, SyncIssue,
    SyncOutcome, SyncPhase, SyncProgress, SyncRunResult, SyncScope,
};
