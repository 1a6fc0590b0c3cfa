use crate::api::{self, Demo};
use crate::args::SyncArgs;
use crate::commands::Out;
use crate::error::{ErrorType, IntoResult};
use crate::model::{SyncOutcome, SyncPhase, SyncProgress, SyncScope};
use crate::tracker::{SyncTracker, TrackerSnapshot, TrackerState};
use crate::{Config, Error, Result};
use anyhow::Context;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, info, warn};

/// Synchronizes the connected accounts, or only those of `args.routing_code()`.
///
/// If nothing in scope was ever synced, the first sync downloads `args.days()` days of history
/// (default: `default_sync_days`), or is skipped entirely with `args.skip()`.
///
/// # Errors
/// - Returns an error if the demo ledger cannot be opened, if the first-sync window is invalid or
///   if the sync fails.
pub async fn sync(config: Config, args: SyncArgs) -> Result<Out<SyncOutcome>> {
    let demo = open_demo(&config, args.delay_ms()).await?;
    let mut tracker = SyncTracker::new(Box::new(demo.sync()), config.tracker_settings());
    let scope = match args.routing_code() {
        Some(code) => SyncScope::Bank(code.to_string()),
        None => SyncScope::All,
    };

    let watcher = tokio::spawn(log_progress(tracker.subscribe()));
    let outcome = run(&mut tracker, scope, &args).await;
    watcher.abort();
    let outcome = outcome?;
    Ok(Out::new(outcome_message(&outcome), outcome))
}

async fn run(tracker: &mut SyncTracker, scope: SyncScope, args: &SyncArgs) -> Result<SyncOutcome> {
    tracker.check_and_sync(scope).await?;
    if tracker.state() == TrackerState::FirstSyncPrompt {
        if args.skip() {
            tracker.skip()?;
        } else {
            if let Some(days) = args.days() {
                tracker.set_first_sync_days(days)?;
            }
            info!(
                "This is the first sync, downloading the last {} days",
                tracker.first_sync_days()
            );
            tracker.confirm_first_sync().await?;
        }
    }
    match tracker.run().await {
        TrackerState::Success => tracker
            .outcome()
            .cloned()
            .ok_or_else(|| Error::internal("The sync finished without an outcome")),
        _ => Err(Error::collaborator(
            tracker.error().unwrap_or("The sync did not finish"),
        )),
    }
}

/// Opens the demo backend whose ledger lives in the home directory.
pub(super) async fn open_demo(config: &Config, delay_ms: u64) -> Result<Demo> {
    let demo = Demo::open(api::ledger_path(config.root()))
        .await
        .context("Unable to open the demo bank")
        .pub_result(ErrorType::Io)?;
    let step = Duration::from_millis(delay_ms);
    // A decoupled TAN approval takes a while longer than anything else.
    demo.set_delays(step, step * 20).await;
    Ok(demo)
}

/// Logs the tracker's progress until the tracker is dropped or the task is aborted. A new phase or
/// account is logged at `info!`, everything else at `debug!`.
pub(super) async fn log_progress(mut snapshots: watch::Receiver<TrackerSnapshot>) {
    let mut last: Option<(SyncPhase, u32)> = None;
    while snapshots.changed().await.is_ok() {
        let snapshot = snapshots.borrow_and_update().clone();
        if snapshot.state != TrackerState::Syncing {
            continue;
        }
        let Some(progress) = snapshot.progress else {
            continue;
        };
        let key = (progress.phase, progress.account_index);
        if last == Some(key) {
            debug!("{}", describe(&progress));
        } else {
            info!("{}", describe(&progress));
            last = Some(key);
        }
        if let (Some(tx), Some(category)) =
            (&progress.last_transaction, &progress.last_classified_as)
        {
            debug!("'{tx}' classified as {category}");
        }
    }
}

fn describe(progress: &SyncProgress) -> String {
    let mut line = match &progress.account_name {
        Some(name) if progress.account_count > 0 => format!(
            "[{}/{}] {name}: ",
            progress.account_index + 1,
            progress.account_count
        ),
        _ => String::new(),
    };
    line.push_str(&progress.message);
    if let Some(fraction) = progress.fraction() {
        if progress.phase == SyncPhase::Classifying {
            line.push_str(&format!(" ({:.0}%)", fraction * 100.0));
        }
    }
    line
}

pub(super) fn outcome_message(outcome: &SyncOutcome) -> String {
    let result = match outcome {
        SyncOutcome::Skipped => return "The first sync was skipped, nothing was downloaded".into(),
        SyncOutcome::Completed(result) => result,
    };
    if result.totals_unknown {
        return "The sync completed but its totals are not available".into();
    }
    for adjustment in &result.opening_balance_adjustments {
        info!(
            "Opening balance of {} set to {} as of {}",
            adjustment.account_name, adjustment.amount, adjustment.date
        );
    }
    if result.opening_balance_account_missing {
        warn!("There is no opening balance account, opening balances were not recorded");
    }
    for issue in &result.errors {
        match &issue.iban {
            Some(iban) => warn!("{iban}: {}", issue.message),
            None => warn!("{}", issue.message),
        }
    }
    format!(
        "Sync completed: {} imported, {} skipped, {} failed in {} account(s)",
        result.total_imported, result.total_skipped, result.total_failed, result.accounts_synced
    )
}
