//! The collaborators this crate orchestrates but does not implement: the Bank API, which answers
//! request/response calls while linking a bank, and the streaming-progress service, which runs
//! synchronization jobs and reports on them.
//!
//! Both are traits so that the wizard and tracker can be driven by any backend. The `demo` module
//! provides in-memory implementations that are compiled even in the "production" version of this
//! app so that the whole flow can run top-to-bottom without a server.

mod demo;

use crate::model::{
    AccountNameOverrides, BankCredentialDraft, BankLookupResult, ConnectionResult,
    DiscoveredAccount, SyncEvent, SyncScope, TanMethods,
};
use tokio::sync::mpsc;

pub(crate) use demo::ledger_path;
pub use demo::{Demo, DemoBank, DemoSync, REJECTED_SECRET};

/// The receiving end of one run's events. Dropping it unsubscribes from the run; it does not
/// necessarily stop the server-side job.
pub type SyncStream = mpsc::Receiver<SyncEvent>;

/// Network operations used while linking a bank. Every call may fail; the error's message is
/// surfaced to the user verbatim.
#[async_trait::async_trait]
pub trait BankApi: Send {
    /// Resolves a routing code (BLZ) to a bank.
    async fn lookup_bank(&mut self, routing_code: &str) -> anyhow::Result<BankLookupResult>;

    /// Logs in with `login` and `secret` and returns the TAN methods the bank supports.
    async fn query_tan_methods(
        &mut self,
        routing_code: &str,
        login: &str,
        secret: &str,
    ) -> anyhow::Result<TanMethods>;

    /// Stores the credentials so that later calls do not need the secret again.
    async fn store_credentials(&mut self, draft: &BankCredentialDraft) -> anyhow::Result<()>;

    /// Lists the accounts available at the bank using the stored credentials.
    async fn discover_accounts(
        &mut self,
        routing_code: &str,
    ) -> anyhow::Result<Vec<DiscoveredAccount>>;

    /// Imports the accounts named in `names` (IBAN -> display name).
    async fn import_accounts(
        &mut self,
        routing_code: &str,
        names: &AccountNameOverrides,
    ) -> anyhow::Result<ConnectionResult>;
}

/// Runs "fetch transactions, then classify them" jobs and streams their progress.
#[async_trait::async_trait]
pub trait SyncApi: Send {
    /// Whether nothing in `scope` has ever been synchronized.
    async fn check_first_sync(&mut self, scope: &SyncScope) -> anyhow::Result<bool>;

    /// Starts a run over `scope`. `days` is the historical window; `None` lets the service decide
    /// (usually "since the last sync").
    async fn start_sync(&mut self, scope: &SyncScope, days: Option<u32>)
        -> anyhow::Result<SyncStream>;
}
