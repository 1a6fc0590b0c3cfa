//! The connection wizard links a bank in a fixed sequence of steps and optionally runs the first
//! sync.
//!
//! ```text
//! find_bank -> credentials -> tan_discovery -> review_accounts -> connecting -> initial_sync
//!                                                                                  |
//!                                                            syncing <-------------+
//!                                                               |                  |
//!                                                   success <---+------------------+
//!                                                   error   <---+ (from discovery, import, sync)
//! ```
//!
//! Every operation checks its preconditions before calling the Bank API. Bad input is reported as
//! a `Validation` error and the wizard stays on its step. A failing lookup or TAN-method query
//! also keeps the step so the user can correct the input. A failing account discovery, import or
//! sync moves the wizard to `error` and records a retry target for `retry()`.
//!
//! All mutation goes through the methods of `ConnectionWizard`. The wizard owns its
//! `SyncTracker` and delegates the initial sync to it.

use crate::api::BankApi;
use crate::config::{DEFAULT_SYNC_DAYS, MAX_SYNC_DAYS, ROUTING_CODE_LENGTH};
use crate::model::{
    AccountNameOverrides, BankCredentialDraft, BankLookupResult, ConnectionResult,
    DiscoveredAccount, SyncScope, TanMethod, TanMethods,
};
use crate::tracker::{self, SyncTracker, TrackerState};
use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tracing::{debug, warn};

/// Tunables of a `ConnectionWizard`.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub struct WizardSettings {
    pub routing_code_length: usize,
    pub default_sync_days: u32,
    pub max_sync_days: u32,
}

impl Default for WizardSettings {
    fn default() -> Self {
        Self {
            routing_code_length: ROUTING_CODE_LENGTH,
            default_sync_days: DEFAULT_SYNC_DAYS,
            max_sync_days: MAX_SYNC_DAYS,
        }
    }
}

#[derive(Debug, Default, Clone, Copy, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WizardStep {
    #[default]
    FindBank,
    Credentials,
    TanDiscovery,
    ReviewAccounts,
    /// The import request is in flight.
    Connecting,
    InitialSync,
    /// The tracker is running the initial sync.
    Syncing,
    Success,
    Error,
}

serde_plain::derive_display_from_serialize!(WizardStep);

impl WizardStep {
    /// Transient and terminal steps are only entered by the operations themselves.
    pub fn is_manually_settable(&self) -> bool {
        matches!(
            self,
            WizardStep::FindBank
                | WizardStep::Credentials
                | WizardStep::TanDiscovery
                | WizardStep::ReviewAccounts
                | WizardStep::InitialSync
        )
    }
}

/// The operation `retry()` re-attempts after the wizard landed in `error`.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum RetryTarget {
    DiscoverAccounts,
    Connect,
    InitialSync { days: u32 },
}

type SuccessCallback = Box<dyn FnMut(Option<&ConnectionResult>) + Send>;

/// Links one bank. See the module documentation.
pub struct ConnectionWizard {
    bank: Box<dyn BankApi>,
    tracker: SyncTracker,
    settings: WizardSettings,
    step: WizardStep,
    draft: BankCredentialDraft,
    lookup: Option<BankLookupResult>,
    tan_methods: Option<TanMethods>,
    credentials_stored: bool,
    accounts: Option<Vec<DiscoveredAccount>>,
    names: AccountNameOverrides,
    connection: Option<ConnectionResult>,
    sync_days: u32,
    validation_error: Option<String>,
    lookup_error: Option<String>,
    error: Option<String>,
    retry_target: Option<RetryTarget>,
    on_success: Option<SuccessCallback>,
    watch: watch::Sender<WizardStep>,
}

impl ConnectionWizard {
    pub fn new(bank: Box<dyn BankApi>, tracker: SyncTracker, settings: WizardSettings) -> Self {
        let (watch, _) = watch::channel(WizardStep::FindBank);
        Self {
            bank,
            tracker,
            settings,
            step: WizardStep::FindBank,
            draft: BankCredentialDraft::default(),
            lookup: None,
            tan_methods: None,
            credentials_stored: false,
            accounts: None,
            names: AccountNameOverrides::new(),
            connection: None,
            sync_days: settings.default_sync_days,
            validation_error: None,
            lookup_error: None,
            error: None,
            retry_target: None,
            on_success: None,
            watch,
        }
    }

    /// Registers a callback that runs whenever the wizard enters `success`, including when the
    /// initial sync was skipped. It receives the import result, if there was an import.
    pub fn on_success(&mut self, callback: impl FnMut(Option<&ConnectionResult>) + Send + 'static) {
        self.on_success = Some(Box::new(callback));
    }

    pub fn step(&self) -> WizardStep {
        self.step
    }

    /// A receiver that sees every step change, including the transient `connecting` and `syncing`
    /// steps while an operation is awaiting.
    pub fn subscribe(&self) -> watch::Receiver<WizardStep> {
        self.watch.subscribe()
    }

    pub fn settings(&self) -> &WizardSettings {
        &self.settings
    }

    pub fn draft(&self) -> &BankCredentialDraft {
        &self.draft
    }

    pub fn lookup(&self) -> Option<&BankLookupResult> {
        self.lookup.as_ref()
    }

    pub fn tan_methods(&self) -> Option<&TanMethods> {
        self.tan_methods.as_ref()
    }

    pub fn selected_tan_method(&self) -> Option<&TanMethod> {
        let code = self.draft.tan_method.as_deref()?;
        self.tan_methods.as_ref()?.find(code)
    }

    /// Whether the Bank API holds the current credentials, so the secret is no longer needed.
    pub fn credentials_stored(&self) -> bool {
        self.credentials_stored
    }

    pub fn accounts(&self) -> Option<&[DiscoveredAccount]> {
        self.accounts.as_deref()
    }

    pub fn account_names(&self) -> &AccountNameOverrides {
        &self.names
    }

    pub fn connection(&self) -> Option<&ConnectionResult> {
        self.connection.as_ref()
    }

    pub fn sync_days(&self) -> u32 {
        self.sync_days
    }

    pub fn validation_error(&self) -> Option<&str> {
        self.validation_error.as_deref()
    }

    pub fn lookup_error(&self) -> Option<&str> {
        self.lookup_error.as_deref()
    }

    /// The error of the last failed step other than the lookup.
    pub fn error(&self) -> Option<&str> {
        self.error.as_deref()
    }

    pub fn retry_target(&self) -> Option<RetryTarget> {
        self.retry_target
    }

    pub fn tracker(&self) -> &SyncTracker {
        &self.tracker
    }

    /// The one message to render. A sync error wins because it comes from the most recent
    /// operation, then the step error, the lookup error and finally input validation.
    pub fn display_error(&self) -> Option<&str> {
        self.tracker
            .error()
            .or(self.error.as_deref())
            .or(self.lookup_error.as_deref())
            .or(self.validation_error.as_deref())
    }

    pub fn set_routing_code(&mut self, routing_code: impl AsRef<str>) {
        self.draft.routing_code = routing_code.as_ref().trim().to_string();
        self.validation_error = None;
    }

    pub fn set_login(&mut self, login: impl Into<String>) {
        self.draft.login = login.into();
        self.credentials_changed();
    }

    pub fn set_secret(&mut self, secret: impl Into<String>) {
        self.draft.wipe_secret();
        self.draft.secret = secret.into();
        self.credentials_changed();
    }

    /// Selects one of the discovered TAN methods. A decoupled method pre-selects the first medium
    /// the bank offers; any other method clears the medium.
    pub fn select_tan_method(&mut self, code: &str) -> Result<()> {
        let Some(method) = self.tan_methods.as_ref().and_then(|m| m.find(code)) else {
            return Err(self.invalid(format!("Unknown TAN method '{code}'")));
        };
        self.draft.tan_medium = if method.is_decoupled {
            method.tan_media.first().cloned()
        } else {
            None
        };
        self.draft.tan_method = Some(method.code.clone());
        self.credentials_changed();
        Ok(())
    }

    /// Names the device that receives TAN requests for the selected decoupled method.
    pub fn set_tan_medium(&mut self, medium: impl AsRef<str>) -> Result<()> {
        let medium = medium.as_ref().trim();
        let Some(method) = self.selected_tan_method() else {
            return Err(self.invalid("Choose a TAN method first"));
        };
        if !method.is_decoupled {
            let message = format!("The TAN method '{}' does not use a device", method.name);
            return Err(self.invalid(message));
        }
        if medium.is_empty()
            || (!method.tan_media.is_empty() && !method.tan_media.iter().any(|m| m == medium))
        {
            let message = format!("Unknown TAN device '{medium}'");
            return Err(self.invalid(message));
        }
        self.draft.tan_medium = Some(medium.to_string());
        self.credentials_changed();
        Ok(())
    }

    /// Overrides the display name of a discovered account. An empty name restores the name the
    /// bank suggested.
    pub fn set_account_name(&mut self, iban: &str, name: impl AsRef<str>) -> Result<()> {
        let Some(account) = self.accounts().and_then(|a| a.iter().find(|a| a.iban == iban)) else {
            return Err(self.invalid(format!("Unknown account {iban}")));
        };
        let name = match name.as_ref().trim() {
            "" => account.default_name.clone(),
            name => name.to_string(),
        };
        self.names.insert(iban.to_string(), name);
        self.validation_error = None;
        Ok(())
    }

    pub fn set_sync_days(&mut self, days: u32) -> Result<()> {
        if let Err(e) = tracker::validate_days(days, self.settings.max_sync_days) {
            self.validation_error = Some(e.message());
            return Err(e);
        }
        self.sync_days = days;
        self.validation_error = None;
        Ok(())
    }

    /// Moves back (or forward) to a step whose data is already present. Nothing fetched for the
    /// target step is cleared, so going from `find_bank` to `credentials` re-uses the cached lookup
    /// without calling the Bank API.
    pub fn set_step(&mut self, step: WizardStep) -> Result<()> {
        if !step.is_manually_settable() {
            return Err(Error::internal(format!("The step {step} cannot be entered directly")));
        }
        let ready = match step {
            WizardStep::Credentials => self.lookup.is_some(),
            WizardStep::TanDiscovery => self.lookup.is_some() && self.tan_methods.is_some(),
            WizardStep::ReviewAccounts => self.lookup.is_some() && self.accounts.is_some(),
            WizardStep::InitialSync => self.connection.is_some(),
            _ => true,
        };
        if !ready {
            return Err(Error::internal(format!(
                "The step {step} cannot be entered before its data has been loaded"
            )));
        }
        self.error = None;
        self.validation_error = None;
        self.retry_target = None;
        if self.tracker.state().is_terminal() {
            self.tracker.reset();
        }
        self.enter(step);
        Ok(())
    }

    /// Resolves the routing code to a bank and moves to `credentials`.
    ///
    /// # Errors
    /// - `Validation` if the routing code does not have the expected length. The Bank API is not
    ///   called.
    /// - `Collaborator` if the lookup fails. The wizard stays on its step and the message is
    ///   available from `lookup_error()`.
    pub async fn lookup_bank(&mut self) -> Result<()> {
        let routing_code = self.draft.routing_code.clone();
        let expected = self.settings.routing_code_length;
        if routing_code.chars().count() != expected {
            return Err(self.invalid(format!("Enter the {expected}-digit bank code")));
        }
        self.validation_error = None;
        self.lookup_error = None;
        match self.bank.lookup_bank(&routing_code).await {
            Ok(lookup) => {
                let same_bank = self
                    .lookup
                    .as_ref()
                    .is_some_and(|l| l.routing_code == lookup.routing_code);
                if !same_bank {
                    self.clear_bank_data();
                }
                debug!("Found {} for {}", lookup.name, routing_code);
                self.lookup = Some(lookup);
                self.enter(WizardStep::Credentials);
                Ok(())
            }
            Err(e) => {
                let message = e.to_string();
                warn!("Bank lookup for {routing_code} failed: {message}");
                self.lookup_error = Some(message.clone());
                Err(Error::collaborator(message))
            }
        }
    }

    /// Logs in with the entered login and secret to learn the bank's TAN methods, pre-selects the
    /// default method and moves to `tan_discovery`.
    ///
    /// # Errors
    /// - `Validation` if login or secret is empty.
    /// - `Collaborator` if the query fails. The wizard stays on its step.
    pub async fn discover_tan_methods(&mut self) -> Result<()> {
        let routing_code = self.require_lookup()?;
        if self.draft.login.trim().is_empty() || self.draft.secret.is_empty() {
            return Err(self.invalid("Enter username and PIN"));
        }
        self.validation_error = None;
        self.error = None;
        let result = self
            .bank
            .query_tan_methods(&routing_code, self.draft.login.trim(), &self.draft.secret)
            .await;
        match result {
            Ok(methods) if methods.is_empty() => {
                let message = "The bank did not offer any TAN method".to_string();
                warn!("{message}");
                self.error = Some(message.clone());
                Err(Error::collaborator(message))
            }
            Ok(methods) => {
                let default = methods.default_method().cloned();
                self.tan_methods = Some(methods);
                self.draft.tan_method = None;
                self.draft.tan_medium = None;
                if let Some(method) = default {
                    self.select_tan_method(&method.code)?;
                }
                self.credentials_stored = false;
                self.enter(WizardStep::TanDiscovery);
                Ok(())
            }
            Err(e) => {
                let message = e.to_string();
                warn!("TAN method query failed: {message}");
                self.error = Some(message.clone());
                Err(Error::collaborator(message))
            }
        }
    }

    /// Stores the credentials, unless they already are, then lists the bank's accounts and moves
    /// to `review_accounts` with every account named as the bank suggests.
    ///
    /// # Errors
    /// - `Validation` if no TAN method (or device, for a decoupled method) is chosen, or if the
    ///   secret is needed again and missing.
    /// - `Collaborator` if storing or discovery fails. The wizard moves to `error`.
    pub async fn discover_accounts(&mut self) -> Result<()> {
        let routing_code = self.require_lookup()?;
        let Some(method) = self.selected_tan_method() else {
            return Err(self.invalid("Choose a TAN method"));
        };
        if method.is_decoupled && self.draft.tan_medium.is_none() {
            return Err(self.invalid("Choose the device that receives TAN requests"));
        }
        if !self.credentials_stored && self.draft.secret.is_empty() {
            return Err(self.invalid("Enter your PIN again"));
        }
        self.validation_error = None;
        self.error = None;

        if !self.credentials_stored {
            let mut draft = BankCredentialDraft {
                routing_code: routing_code.clone(),
                login: self.draft.login.trim().to_string(),
                ..self.draft.clone()
            };
            let stored = self.bank.store_credentials(&draft).await;
            draft.wipe_secret();
            if let Err(e) = stored {
                return Err(self.fail(e.to_string(), RetryTarget::DiscoverAccounts));
            }
            debug!("Credentials for {routing_code} stored");
            self.credentials_stored = true;
            self.draft.wipe_secret();
        }

        match self.bank.discover_accounts(&routing_code).await {
            Ok(accounts) => {
                debug!("Discovered {} account(s)", accounts.len());
                self.names = accounts
                    .iter()
                    .map(|a| (a.iban.clone(), a.default_name.clone()))
                    .collect();
                self.accounts = Some(accounts);
                self.enter(WizardStep::ReviewAccounts);
                Ok(())
            }
            Err(e) => Err(self.fail(e.to_string(), RetryTarget::DiscoverAccounts)),
        }
    }

    /// Imports the discovered accounts under their chosen names and moves through `connecting` to
    /// `initial_sync`. The credential draft is discarded once the import succeeded.
    ///
    /// # Errors
    /// - `Validation` if no accounts were discovered.
    /// - `Collaborator` if the import fails. The wizard moves to `error`.
    pub async fn connect(&mut self) -> Result<()> {
        let routing_code = self.require_lookup()?;
        if self.accounts.is_none() {
            return Err(self.invalid("Discover the accounts first"));
        }
        if self.names.is_empty() {
            return Err(self.invalid("The bank did not report any account to import"));
        }
        self.validation_error = None;
        self.error = None;
        self.enter(WizardStep::Connecting);
        match self.bank.import_accounts(&routing_code, &self.names).await {
            Ok(connection) => {
                debug!("{}", connection.message);
                self.connection = Some(connection);
                self.retry_target = None;
                self.draft.discard();
                self.enter(WizardStep::InitialSync);
                Ok(())
            }
            Err(e) => Err(self.fail(e.to_string(), RetryTarget::Connect)),
        }
    }

    /// Runs the first sync of the new bank over the last `days` days and moves to `success` or
    /// `error`. Progress is observable through `tracker().subscribe()`.
    pub async fn start_initial_sync(&mut self, days: u32) -> Result<()> {
        if self.step != WizardStep::InitialSync {
            return Err(Error::internal(format!(
                "The initial sync cannot start from step {}",
                self.step
            )));
        }
        self.set_sync_days(days)?;
        let routing_code = self.require_lookup()?;
        self.error = None;
        self.enter(WizardStep::Syncing);

        let scope = SyncScope::Bank(routing_code);
        let state = match self.tracker.sync(scope, Some(days)).await {
            Ok(()) => self.tracker.run().await,
            Err(_) => self.tracker.state(),
        };
        if state == TrackerState::Success {
            self.succeed();
            return Ok(());
        }
        let message = self
            .tracker
            .error()
            .unwrap_or("The initial sync did not finish")
            .to_string();
        Err(self.fail(message, RetryTarget::InitialSync { days }))
    }

    /// Finishes without syncing, either after the import or instead of the whole flow.
    pub fn skip_initial_sync(&mut self) -> Result<()> {
        if !matches!(self.step, WizardStep::InitialSync | WizardStep::FindBank) {
            return Err(Error::internal(format!(
                "The initial sync cannot be skipped from step {}",
                self.step
            )));
        }
        debug!("Initial sync skipped");
        self.succeed();
        Ok(())
    }

    /// Re-attempts the step that failed. Without a recorded target this is `reset()`.
    pub async fn retry(&mut self) -> Result<()> {
        let Some(target) = self.retry_target.take() else {
            self.reset();
            return Ok(());
        };
        debug!("Retrying {target:?}");
        self.error = None;
        self.tracker.reset();
        match target {
            RetryTarget::DiscoverAccounts => {
                self.enter(WizardStep::TanDiscovery);
                self.discover_accounts().await
            }
            RetryTarget::Connect => {
                self.enter(WizardStep::ReviewAccounts);
                self.connect().await
            }
            RetryTarget::InitialSync { days } => {
                self.enter(WizardStep::InitialSync);
                self.start_initial_sync(days).await
            }
        }
    }

    /// Returns every field to its initial value and the wizard to `find_bank`. Used after an error
    /// and to add another bank after a success.
    pub fn reset(&mut self) {
        self.draft.discard();
        self.lookup = None;
        self.clear_bank_data();
        self.connection = None;
        self.sync_days = self.settings.default_sync_days;
        self.validation_error = None;
        self.lookup_error = None;
        self.error = None;
        self.retry_target = None;
        self.tracker.reset();
        self.enter(WizardStep::FindBank);
    }

    fn succeed(&mut self) {
        self.retry_target = None;
        self.enter(WizardStep::Success);
        if let Some(callback) = self.on_success.as_mut() {
            callback(self.connection.as_ref());
        }
    }

    /// Records a collaborator failure, moves to `error` and returns the public error.
    fn fail(&mut self, message: String, target: RetryTarget) -> Error {
        warn!("Step {} failed: {message}", self.step);
        self.error = Some(message.clone());
        self.retry_target = Some(target);
        self.enter(WizardStep::Error);
        Error::collaborator(message)
    }

    /// Records bad input. The step does not change.
    fn invalid(&mut self, message: impl Into<String>) -> Error {
        let message = message.into();
        debug!("Invalid input on step {}: {message}", self.step);
        self.validation_error = Some(message.clone());
        Error::validation(message)
    }

    fn require_lookup(&mut self) -> Result<String> {
        match self.lookup.as_ref() {
            Some(lookup) => Ok(lookup.routing_code.clone()),
            None => Err(self.invalid("Look up the bank first")),
        }
    }

    fn credentials_changed(&mut self) {
        self.credentials_stored = false;
        self.validation_error = None;
    }

    /// Drops everything fetched after the lookup.
    fn clear_bank_data(&mut self) {
        self.tan_methods = None;
        self.credentials_stored = false;
        self.accounts = None;
        self.names.clear();
    }

    fn enter(&mut self, step: WizardStep) {
        if self.step != step {
            debug!("Wizard {} -> {}", self.step, step);
        }
        self.step = step;
        self.watch.send_replace(step);
    }
}
