//! Implements the `BankApi` and `SyncApi` traits using in-memory data seeded from this module.
//!
//! Note: this is compiled even in the "production" version of this app so that we can run the whole
//! flow, top-to-bottom, without a banking backend. What the demo backend has imported and synced
//! can optionally be persisted to a JSON file so that separate CLI invocations see the same state.

use crate::api::{BankApi, SyncApi, SyncStream};
use crate::model::{
    AccountNameOverrides, AccountSyncStats, Amount, BankCredentialDraft, BankLookupResult,
    ConnectionResult, DiscoveredAccount, ImportedAccount, OpeningBalanceAdjustment, SyncEvent,
    SyncPhase, SyncProgress, SyncRunResult, SyncScope, TanMethod, TanMethods,
};
use crate::utils;
use anyhow::{bail, Context};
use chrono::{Days, Local, NaiveDate};
use rust_decimal::Decimal;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::io::Cursor;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Mutex};
use tracing::{debug, trace};

/// A secret the demo bank always rejects, for trying out the error paths.
pub const REJECTED_SECRET: &str = "0000";

const EVENT_BUFFER: usize = 64;
const UNCATEGORIZED: &str = "Uncategorized";

/// Shared state behind a `DemoBank` and a `DemoSync`. Clone it to hand out more handles.
#[derive(Clone)]
pub struct Demo {
    state: Arc<Mutex<DemoState>>,
}

/// The `BankApi` half of the demo backend.
pub struct DemoBank {
    demo: Demo,
}

/// The `SyncApi` half of the demo backend.
pub struct DemoSync {
    demo: Demo,
}

struct DemoState {
    seed: Seed,
    ledger: Ledger,
    ledger_path: Option<PathBuf>,
    step_delay: Duration,
    tan_delay: Duration,
}

struct Seed {
    banks: Vec<SeedBank>,
    accounts: Vec<SeedAccount>,
    transactions: Vec<SeedTransaction>,
}

#[derive(Debug, Clone, Deserialize)]
struct SeedBank {
    routing_code: String,
    name: String,
    endpoint: String,
}

#[derive(Debug, Clone, Deserialize)]
struct SeedAccount {
    routing_code: String,
    iban: String,
    name: String,
    balance: String,
    currency: String,
}

#[derive(Debug, Clone, Deserialize)]
struct SeedTransaction {
    id: String,
    iban: String,
    days_ago: u64,
    description: String,
    amount: String,
}

/// What the demo backend remembers between runs.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct Ledger {
    #[serde(default)]
    logins: BTreeMap<String, StoredLogin>,
    #[serde(default)]
    imported: BTreeMap<String, ImportedEntry>,
    #[serde(default)]
    synced: BTreeSet<String>,
}

/// Stored credentials. The secret itself never leaves memory.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct StoredLogin {
    login: String,
    tan_method: Option<String>,
    tan_medium: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct ImportedEntry {
    routing_code: String,
    name: String,
}

/// One account's share of a planned run.
struct PlannedAccount {
    iban: String,
    name: String,
    balance: Amount,
    new: Vec<SeedTransaction>,
    skipped: u64,
    first_sync: bool,
}

impl Demo {
    /// Creates a demo backend with seed data and an empty, in-memory ledger.
    pub fn new() -> anyhow::Result<Self> {
        Ok(Self::from_state(DemoState {
            seed: Seed::load()?,
            ledger: Ledger::default(),
            ledger_path: None,
            step_delay: Duration::ZERO,
            tan_delay: Duration::ZERO,
        }))
    }

    /// Creates a demo backend whose ledger is read from, and written back to, `path`.
    pub async fn open(path: impl Into<PathBuf>) -> anyhow::Result<Self> {
        let path = path.into();
        let ledger = if path.is_file() {
            utils::deserialize(&path).await?
        } else {
            Ledger::default()
        };
        Ok(Self::from_state(DemoState {
            seed: Seed::load()?,
            ledger,
            ledger_path: Some(path),
            step_delay: Duration::ZERO,
            tan_delay: Duration::ZERO,
        }))
    }

    fn from_state(state: DemoState) -> Self {
        Self {
            state: Arc::new(Mutex::new(state)),
        }
    }

    /// Sets the pause between progress events and the simulated wait for a decoupled TAN approval.
    pub async fn set_delays(&self, step: Duration, tan: Duration) {
        let mut state = self.state.lock().await;
        state.step_delay = step;
        state.tan_delay = tan;
    }

    pub fn bank(&self) -> DemoBank {
        DemoBank { demo: self.clone() }
    }

    pub fn sync(&self) -> DemoSync {
        DemoSync { demo: self.clone() }
    }

    /// Number of transactions the backend has synced so far.
    pub async fn synced_count(&self) -> usize {
        self.state.lock().await.ledger.synced.len()
    }
}

impl DemoState {
    fn bank(&self, routing_code: &str) -> anyhow::Result<&SeedBank> {
        self.seed
            .banks
            .iter()
            .find(|b| b.routing_code == routing_code)
            .with_context(|| format!("No bank found for routing code {routing_code}"))
    }

    async fn persist(&self) -> anyhow::Result<()> {
        let Some(path) = &self.ledger_path else {
            return Ok(());
        };
        let json = serde_json::to_string_pretty(&self.ledger)
            .context("Failed to serialize the demo ledger")?;
        utils::write(path, json).await
    }

    /// Imported accounts covered by `scope`, in seed order.
    fn accounts_in_scope(&self, scope: &SyncScope) -> Vec<&SeedAccount> {
        self.seed
            .accounts
            .iter()
            .filter(|a| {
                self.ledger.imported.contains_key(&a.iban)
                    && scope.includes(&a.routing_code, &a.iban)
            })
            .collect()
    }

    fn plan(
        &self,
        scope: &SyncScope,
        since: Option<NaiveDate>,
    ) -> anyhow::Result<Vec<PlannedAccount>> {
        let today = Local::now().date_naive();
        let mut plan = Vec::new();
        for account in self.accounts_in_scope(scope) {
            let mut new = Vec::new();
            let mut skipped = 0;
            let mut first_sync = true;
            let transactions = self.seed.transactions.iter();
            for tx in transactions.filter(|t| t.iban == account.iban) {
                if self.ledger.synced.contains(&tx.id) {
                    first_sync = false;
                }
                if let Some(since) = since {
                    if tx.date(today) < since {
                        continue;
                    }
                }
                if self.ledger.synced.contains(&tx.id) {
                    skipped += 1;
                } else {
                    new.push(tx.clone());
                }
            }
            let name = self
                .ledger
                .imported
                .get(&account.iban)
                .map(|e| e.name.clone())
                .unwrap_or_else(|| account.name.clone());
            plan.push(PlannedAccount {
                iban: account.iban.clone(),
                name,
                balance: parse_amount(&account.balance)?,
                new,
                skipped,
                first_sync,
            });
        }
        Ok(plan)
    }
}

#[async_trait::async_trait]
impl BankApi for DemoBank {
    async fn lookup_bank(&mut self, routing_code: &str) -> anyhow::Result<BankLookupResult> {
        let state = self.demo.state.lock().await;
        let bank = state.bank(routing_code)?;
        Ok(BankLookupResult {
            name: bank.name.clone(),
            routing_code: bank.routing_code.clone(),
            endpoint: bank.endpoint.clone(),
        })
    }

    async fn query_tan_methods(
        &mut self,
        routing_code: &str,
        login: &str,
        secret: &str,
    ) -> anyhow::Result<TanMethods> {
        let state = self.demo.state.lock().await;
        let bank = state.bank(routing_code)?;
        if login.trim().is_empty() || secret == REJECTED_SECRET {
            bail!("Login failed: {} rejected the user ID or PIN", bank.name);
        }
        Ok(TanMethods {
            methods: vec![
                TanMethod {
                    code: "900".to_string(),
                    name: "photoTAN".to_string(),
                    is_decoupled: false,
                    tan_media: Vec::new(),
                },
                TanMethod {
                    code: "920".to_string(),
                    name: "pushTAN 2.0".to_string(),
                    is_decoupled: true,
                    tan_media: vec!["Phone".to_string(), "Tablet".to_string()],
                },
            ],
            default_method_code: Some("920".to_string()),
        })
    }

    async fn store_credentials(&mut self, draft: &BankCredentialDraft) -> anyhow::Result<()> {
        let mut state = self.demo.state.lock().await;
        state.bank(&draft.routing_code)?;
        if draft.secret.is_empty() {
            bail!("Cannot store credentials without a PIN");
        }
        state.ledger.logins.insert(
            draft.routing_code.clone(),
            StoredLogin {
                login: draft.login.clone(),
                tan_method: draft.tan_method.clone(),
                tan_medium: draft.tan_medium.clone(),
            },
        );
        state.persist().await
    }

    async fn discover_accounts(
        &mut self,
        routing_code: &str,
    ) -> anyhow::Result<Vec<DiscoveredAccount>> {
        let state = self.demo.state.lock().await;
        state.bank(routing_code)?;
        if !state.ledger.logins.contains_key(routing_code) {
            bail!("No credentials stored for routing code {routing_code}");
        }
        state
            .seed
            .accounts
            .iter()
            .filter(|a| a.routing_code == routing_code)
            .map(|a| {
                Ok(DiscoveredAccount {
                    iban: a.iban.clone(),
                    default_name: a.name.clone(),
                    balance: parse_amount(&a.balance)?,
                    currency: a.currency.clone(),
                })
            })
            .collect()
    }

    async fn import_accounts(
        &mut self,
        routing_code: &str,
        names: &AccountNameOverrides,
    ) -> anyhow::Result<ConnectionResult> {
        let mut state = self.demo.state.lock().await;
        let bank_name = state.bank(routing_code)?.name.clone();
        let mut imported = Vec::new();
        for (iban, name) in names {
            let known = state
                .seed
                .accounts
                .iter()
                .any(|a| a.routing_code == routing_code && &a.iban == iban);
            if !known {
                bail!("Account {iban} does not belong to {bank_name}");
            }
            state.ledger.imported.insert(
                iban.clone(),
                ImportedEntry {
                    routing_code: routing_code.to_string(),
                    name: name.clone(),
                },
            );
            imported.push(ImportedAccount {
                iban: iban.clone(),
                account_name: name.clone(),
            });
        }
        state.persist().await?;
        let count = imported.len();
        Ok(ConnectionResult {
            message: format!(
                "Imported {count} account{} from {bank_name}",
                if count == 1 { "" } else { "s" }
            ),
            accounts_imported: imported,
        })
    }
}

#[async_trait::async_trait]
impl SyncApi for DemoSync {
    async fn check_first_sync(&mut self, scope: &SyncScope) -> anyhow::Result<bool> {
        let state = self.demo.state.lock().await;
        let ibans: BTreeSet<&str> = state
            .accounts_in_scope(scope)
            .iter()
            .map(|a| a.iban.as_str())
            .collect();
        let any_synced = state
            .seed
            .transactions
            .iter()
            .any(|t| ibans.contains(t.iban.as_str()) && state.ledger.synced.contains(&t.id));
        Ok(!any_synced)
    }

    async fn start_sync(
        &mut self,
        scope: &SyncScope,
        days: Option<u32>,
    ) -> anyhow::Result<SyncStream> {
        let mut state = self.demo.state.lock().await;
        let since = days.and_then(|d| {
            Local::now()
                .date_naive()
                .checked_sub_days(Days::new(u64::from(d)))
        });
        let plan = state.plan(scope, since)?;
        if plan.is_empty() {
            bail!("There are no connected accounts to synchronize");
        }

        // The job runs "server-side": its effects are recorded now, whether or not anybody keeps
        // listening to the events.
        for account in &plan {
            for tx in &account.new {
                state.ledger.synced.insert(tx.id.clone());
            }
        }
        state.persist().await?;

        let decoupled = scope_uses_decoupled_tan(&state, &plan);
        let step_delay = state.step_delay;
        let tan_delay = if decoupled { state.tan_delay } else { Duration::ZERO };
        drop(state);

        debug!("Demo sync starting for {} account(s)", plan.len());
        let (tx, rx) = mpsc::channel(EVENT_BUFFER);
        tokio::spawn(async move {
            if emit_run(&tx, plan, step_delay, tan_delay).await.is_err() {
                trace!("Demo sync listener went away, the job finished without it");
            }
        });
        Ok(rx)
    }
}

fn scope_uses_decoupled_tan(state: &DemoState, plan: &[PlannedAccount]) -> bool {
    plan.iter().any(|p| {
        state
            .ledger
            .imported
            .get(&p.iban)
            .and_then(|e| state.ledger.logins.get(&e.routing_code))
            .map(|l| l.tan_medium.is_some())
            .unwrap_or(false)
    })
}

/// Emits the events of one run. Returns an error as soon as the receiver is gone.
async fn emit_run(
    tx: &mpsc::Sender<SyncEvent>,
    plan: Vec<PlannedAccount>,
    step_delay: Duration,
    tan_delay: Duration,
) -> Result<(), mpsc::error::SendError<SyncEvent>> {
    let account_count = plan.len() as u32;
    let total: u64 = plan.iter().map(|p| p.new.len() as u64).sum();

    let connecting = SyncProgress {
        account_count,
        message: if tan_delay.is_zero() {
            "Connecting to bank".to_string()
        } else {
            "Waiting for approval in your banking app".to_string()
        },
        ..Default::default()
    };
    tx.send(SyncEvent::Progress(connecting)).await?;
    tokio::time::sleep(tan_delay).await;

    for (ix, account) in plan.iter().enumerate() {
        let last = ix + 1 == plan.len();
        let fetching = SyncProgress {
            phase: SyncPhase::Fetching,
            account_index: ix as u32,
            account_count,
            iban: Some(account.iban.clone()),
            account_name: Some(account.name.clone()),
            transactions_total: last.then_some(total),
            message: format!("Fetching transactions for {}", account.name),
            ..Default::default()
        };
        tx.send(SyncEvent::Progress(fetching)).await?;
        tokio::time::sleep(step_delay).await;
    }

    let mut result = SyncRunResult {
        accounts_synced: account_count,
        ..Default::default()
    };
    let mut current = 0;
    for (ix, account) in plan.iter().enumerate() {
        for seed_tx in &account.new {
            current += 1;
            let category = classify(&seed_tx.description);
            let classifying = SyncProgress {
                phase: SyncPhase::Classifying,
                account_index: ix as u32,
                account_count,
                iban: Some(account.iban.clone()),
                account_name: Some(account.name.clone()),
                transactions_current: current,
                transactions_total: Some(total),
                message: format!("Classifying transaction {current} of {total}"),
                last_transaction: Some(seed_tx.description.clone()),
                last_classified_as: Some(category.to_string()),
            };
            tx.send(SyncEvent::Progress(classifying)).await?;
            tokio::time::sleep(step_delay).await;
        }
        result.account_stats.push(AccountSyncStats {
            iban: account.iban.clone(),
            account_name: account.name.clone(),
            imported: account.new.len() as u64,
            skipped: account.skipped,
            failed: 0,
        });
        result.total_imported += account.new.len() as u64;
        result.total_skipped += account.skipped;
        if let Some(adjustment) = opening_balance(account) {
            result.opening_balance_adjustments.push(adjustment);
        }
    }

    let complete = SyncProgress {
        phase: SyncPhase::Complete,
        account_index: account_count.saturating_sub(1),
        account_count,
        transactions_current: total,
        transactions_total: Some(total),
        message: "Synchronization complete".to_string(),
        ..Default::default()
    };
    tx.send(SyncEvent::Progress(complete)).await?;
    tx.send(SyncEvent::Finished(result)).await
}

/// On an account's first sync, the opening balance is whatever the imported history does not
/// explain of the current balance.
fn opening_balance(account: &PlannedAccount) -> Option<OpeningBalanceAdjustment> {
    if !account.first_sync || account.new.is_empty() {
        return None;
    }
    let today = Local::now().date_naive();
    let sum = account
        .new
        .iter()
        .filter_map(|t| parse_amount(&t.amount).ok())
        .map(|a| a.value())
        .sum::<Decimal>();
    let earliest = account.new.iter().map(|t| t.date(today)).min()?;
    Some(OpeningBalanceAdjustment {
        iban: account.iban.clone(),
        account_name: account.name.clone(),
        amount: Amount::new(account.balance.value() - sum),
        date: earliest.pred_opt().unwrap_or(earliest),
    })
}

/// Keyword classification, standing in for the real classifier.
fn classify(description: &str) -> &'static str {
    const RULES: &[(&str, &str)] = &[
        ("rewe", "Groceries"),
        ("edeka", "Groceries"),
        ("aldi", "Groceries"),
        ("miete", "Rent"),
        ("gehalt", "Salary"),
        ("stadtwerke", "Utilities"),
        ("telekom", "Utilities"),
        ("amazon", "Shopping"),
        ("db vertrieb", "Travel"),
        ("zinsen", "Interest"),
    ];
    let lower = description.to_lowercase();
    RULES
        .iter()
        .find(|(keyword, _)| lower.contains(keyword))
        .map(|(_, category)| *category)
        .unwrap_or(UNCATEGORIZED)
}

fn parse_amount(s: &str) -> anyhow::Result<Amount> {
    Amount::from_str(s).with_context(|| format!("Invalid amount '{s}' in demo data"))
}

impl SeedTransaction {
    fn date(&self, today: NaiveDate) -> NaiveDate {
        today
            .checked_sub_days(Days::new(self.days_ago))
            .unwrap_or(today)
    }
}

impl Seed {
    fn load() -> anyhow::Result<Self> {
        Ok(Self {
            banks: load_csv(BANK_DATA).context("Unable to load demo banks")?,
            accounts: load_csv(ACCOUNT_DATA).context("Unable to load demo accounts")?,
            transactions: load_csv(TRANSACTION_DATA).context("Unable to load demo transactions")?,
        })
    }
}

/// Loads records from a CSV-formatted string with a header row.
fn load_csv<T>(csv_data: &str) -> anyhow::Result<Vec<T>>
where
    T: DeserializeOwned,
{
    let mut rdr = csv::ReaderBuilder::new()
        .has_headers(true)
        .trim(csv::Trim::All)
        .from_reader(Cursor::new(csv_data.as_bytes()));
    let mut rows = Vec::new();
    for result in rdr.deserialize() {
        rows.push(result?);
    }
    Ok(rows)
}

/// The default location of the demo ledger inside the home directory.
pub(crate) fn ledger_path(home: &Path) -> PathBuf {
    home.join("demo-ledger.json")
}

/// Seed bank data.
const BANK_DATA: &str = r##"routing_code,name,endpoint
12345678,Test Bank,https://fints.test-bank.example/fints
10050000,Berliner Sparkasse,https://banking-be3.s-fints-pt-be.de/fints30
50010517,ING-DiBa,https://fints.ing.de/fints/
"##;

/// Seed account data.
const ACCOUNT_DATA: &str = r##"routing_code,iban,name,balance,currency
12345678,DE89370400440532013000,Girokonto,2450.17,EUR
12345678,DE89370400440532013001,Sparkonto,10200.00,EUR
10050000,DE12100500000123456789,Girokonto,815.42,EUR
50010517,DE44500105175407324931,Extra-Konto,5000.00,EUR
50010517,DE02500105170137075030,Girokonto,1312.88,EUR
"##;

/// Seed transaction data. Dates are relative to today.
const TRANSACTION_DATA: &str = r##"id,iban,days_ago,description,amount
t001,DE89370400440532013000,2,REWE Markt Berlin,-54.23
t002,DE89370400440532013000,5,Telekom Deutschland GmbH,-39.95
t003,DE89370400440532013000,12,Gehalt Oktober ACME GmbH,3250.00
t004,DE89370400440532013000,14,Miete Wohnung,-1100.00
t005,DE89370400440532013000,30,AMAZON EU S.A R.L.,-23.99
t006,DE89370400440532013000,45,Stadtwerke Berlin Abschlag,-85.00
t007,DE89370400440532013000,120,DB Vertrieb GmbH,-79.90
t008,DE89370400440532013000,200,EDEKA Center,-61.12
t009,DE89370400440532013001,60,Zinsen,12.40
t010,DE89370400440532013001,300,Zinsen,11.85
t011,DE12100500000123456789,3,ALDI SUED,-18.70
t012,DE12100500000123456789,40,Gehalt,2100.00
t013,DE02500105170137075030,9,Miete,-750.00
"##;
