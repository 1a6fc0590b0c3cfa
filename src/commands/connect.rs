use crate::args::ConnectArgs;
use crate::commands::sync::{log_progress, open_demo, outcome_message};
use crate::commands::Out;
use crate::error::{ErrorType, IntoResult};
use crate::model::{ConnectionResult, SyncOutcome};
use crate::tracker::SyncTracker;
use crate::wizard::ConnectionWizard;
use crate::{Config, Result};
use anyhow::Context;
use serde::Serialize;
use tracing::{debug, info};

/// The structured output of `banklink connect`.
#[derive(Debug, Clone, Serialize)]
pub struct ConnectSummary {
    pub bank: String,
    pub connection: Option<ConnectionResult>,
    pub sync: Option<SyncOutcome>,
}

/// Runs the connection wizard from start to finish: look up the bank, log in, choose the TAN
/// method, import the accounts and either run the first sync or skip it.
///
/// The secret is read from the terminal when `args.secret()` is not given.
///
/// # Errors
/// - Returns the first error of any wizard step. The data imported by earlier steps stays
///   imported.
pub async fn connect(config: Config, args: ConnectArgs) -> Result<Out<ConnectSummary>> {
    let demo = open_demo(&config, args.delay_ms()).await?;
    let tracker = SyncTracker::new(Box::new(demo.sync()), config.tracker_settings());
    let mut wizard =
        ConnectionWizard::new(Box::new(demo.bank()), tracker, config.wizard_settings());

    wizard.set_routing_code(args.routing_code());
    wizard.lookup_bank().await?;
    let bank = wizard.lookup().map(|l| l.name.clone()).unwrap_or_default();
    info!("Found {bank}");

    wizard.set_login(args.login());
    match args.secret() {
        Some(secret) => wizard.set_secret(secret),
        None => wizard.set_secret(prompt_secret(&bank)?),
    }
    wizard.discover_tan_methods().await?;
    if let Some(code) = args.tan_method() {
        wizard.select_tan_method(code)?;
    }
    if let Some(medium) = args.tan_medium() {
        wizard.set_tan_medium(medium)?;
    }
    if let Some(method) = wizard.selected_tan_method() {
        match wizard.draft().tan_medium.as_deref() {
            Some(medium) => info!("Using {} on {medium}", method.name),
            None => info!("Using {}", method.name),
        }
    }

    wizard.discover_accounts().await?;
    for name in args.names() {
        wizard.set_account_name(&name.iban, &name.name)?;
    }
    for (iban, name) in wizard.account_names() {
        debug!("Importing {iban} as {name}");
    }
    wizard.connect().await?;
    if let Some(connection) = wizard.connection() {
        info!("{}", connection.message);
    }

    if args.skip_sync() {
        wizard.skip_initial_sync()?;
    } else {
        let days = args.days().unwrap_or(config.default_sync_days());
        info!("Downloading the last {days} days of transactions");
        let watcher = tokio::spawn(log_progress(wizard.tracker().subscribe()));
        let synced = wizard.start_initial_sync(days).await;
        watcher.abort();
        synced?;
    }

    let summary = ConnectSummary {
        bank: bank.clone(),
        connection: wizard.connection().cloned(),
        sync: wizard.tracker().outcome().cloned(),
    };
    let message = match &summary.sync {
        Some(outcome) => format!("Connected {bank}. {}", outcome_message(outcome)),
        None => format!("Connected {bank}, the first sync was skipped"),
    };
    Ok(Out::new(message, summary))
}

fn prompt_secret(bank: &str) -> Result<String> {
    rpassword::prompt_password(format!("PIN for {bank}: "))
        .context("Failed to read the PIN")
        .pub_result(ErrorType::Io)
}
