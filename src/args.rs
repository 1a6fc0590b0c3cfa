//! These structs provide the CLI interface for the banklink CLI.

use clap::{Parser, Subcommand};
use std::convert::Infallible;
use std::fmt::{Display, Formatter};
use std::ops::Deref;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use tracing::error;
use tracing_subscriber::filter::LevelFilter;

/// banklink: link a bank account and synchronize its transactions.
///
/// The program walks through the steps needed to connect a bank: find the bank by its routing code
/// (BLZ), log in, choose how to approve logins (TAN method), review the accounts the bank reports
/// and import them. Afterwards it can run the first synchronization, which downloads the
/// transactions and classifies them.
///
/// This build talks to a built-in demo bank. Try routing code 12345678 with any login and any PIN
/// except 0000.
#[derive(Debug, Parser, Clone)]
pub struct Args {
    #[clap(flatten)]
    common: Common,

    #[command(subcommand)]
    command: Command,
}

impl Args {
    pub fn new(common: Common, command: Command) -> Self {
        Self { common, command }
    }

    pub fn common(&self) -> &Common {
        &self.common
    }

    pub fn command(&self) -> &Command {
        &self.command
    }
}

#[derive(Subcommand, Debug, Clone)]
pub enum Command {
    /// Create the data directory and the configuration file.
    ///
    /// This is the first command you should run. By default the data directory is
    /// $HOME/banklink; pass --home (or set BANKLINK_HOME) to put it somewhere else.
    Init,
    /// Connect a bank: look it up, log in, pick a TAN method, import its accounts and optionally
    /// run the first sync.
    Connect(ConnectArgs),
    /// Synchronize the transactions of connected accounts.
    Sync(SyncArgs),
}

/// Arguments common to all subcommands.
#[derive(Debug, Parser, Clone)]
pub struct Common {
    /// The logging verbosity. One of, from least to most verbose:
    /// off, error, warn, info, debug, trace
    ///
    /// This can be overridden by RUST_LOG.
    #[arg(long, default_value_t = LevelFilter::INFO)]
    log_level: LevelFilter,

    /// The directory where banklink data and configuration is held. Defaults to ~/banklink
    #[arg(long, env = "BANKLINK_HOME", default_value_t = default_home())]
    home: DisplayPath,
}

impl Common {
    pub fn new(log_level: LevelFilter, home: PathBuf) -> Self {
        Self {
            log_level,
            home: home.into(),
        }
    }

    pub fn log_level(&self) -> LevelFilter {
        self.log_level
    }

    pub fn home(&self) -> &DisplayPath {
        &self.home
    }
}

/// (Not shown): Args for the `banklink connect` command.
#[derive(Debug, Parser, Clone)]
pub struct ConnectArgs {
    /// The bank's routing code (BLZ), e.g. 12345678.
    #[arg(long)]
    routing_code: String,

    /// Your online-banking login.
    #[arg(long)]
    login: String,

    /// Your online-banking PIN. You will be prompted for it if it is not given.
    #[arg(long, env = "BANKLINK_SECRET", hide_env_values = true)]
    secret: Option<String>,

    /// The code of the TAN method to use. Defaults to the method the bank suggests.
    #[arg(long)]
    tan_method: Option<String>,

    /// The device that receives TAN requests, for methods like pushTAN.
    #[arg(long)]
    tan_medium: Option<String>,

    /// A display name for an account, as IBAN=NAME. Can be given more than once.
    #[arg(long = "name")]
    names: Vec<AccountName>,

    /// How many days of history the first sync downloads. Defaults to the configured
    /// default_sync_days.
    #[arg(long, conflicts_with = "skip_sync")]
    days: Option<u32>,

    /// Import the accounts without running the first sync.
    #[arg(long)]
    skip_sync: bool,

    /// Pause, in milliseconds, between the demo bank's progress events.
    #[arg(long, default_value_t = 0)]
    delay_ms: u64,
}

impl ConnectArgs {
    pub fn new(routing_code: impl Into<String>, login: impl Into<String>) -> Self {
        Self {
            routing_code: routing_code.into(),
            login: login.into(),
            secret: None,
            tan_method: None,
            tan_medium: None,
            names: Vec::new(),
            days: None,
            skip_sync: false,
            delay_ms: 0,
        }
    }

    pub fn with_secret(mut self, secret: impl Into<String>) -> Self {
        self.secret = Some(secret.into());
        self
    }

    pub fn with_tan_method(mut self, code: impl Into<String>) -> Self {
        self.tan_method = Some(code.into());
        self
    }

    pub fn with_name(mut self, iban: impl Into<String>, name: impl Into<String>) -> Self {
        self.names.push(AccountName {
            iban: iban.into(),
            name: name.into(),
        });
        self
    }

    pub fn with_days(mut self, days: u32) -> Self {
        self.days = Some(days);
        self
    }

    pub fn with_skip_sync(mut self) -> Self {
        self.skip_sync = true;
        self
    }

    pub fn routing_code(&self) -> &str {
        &self.routing_code
    }

    pub fn login(&self) -> &str {
        &self.login
    }

    pub fn secret(&self) -> Option<&str> {
        self.secret.as_deref()
    }

    pub fn tan_method(&self) -> Option<&str> {
        self.tan_method.as_deref()
    }

    pub fn tan_medium(&self) -> Option<&str> {
        self.tan_medium.as_deref()
    }

    pub fn names(&self) -> &[AccountName] {
        &self.names
    }

    pub fn days(&self) -> Option<u32> {
        self.days
    }

    pub fn skip_sync(&self) -> bool {
        self.skip_sync
    }

    pub fn delay_ms(&self) -> u64 {
        self.delay_ms
    }
}

/// (Not shown): Args for the `banklink sync` command.
#[derive(Debug, Parser, Clone)]
pub struct SyncArgs {
    /// Only synchronize the accounts of the bank with this routing code.
    #[arg(long)]
    routing_code: Option<String>,

    /// How many days of history a first sync downloads. Defaults to the configured
    /// default_sync_days. Later syncs continue from where the previous one stopped.
    #[arg(long, conflicts_with = "skip")]
    days: Option<u32>,

    /// If this is the first sync, skip it instead of downloading history.
    #[arg(long)]
    skip: bool,

    /// Pause, in milliseconds, between the demo bank's progress events.
    #[arg(long, default_value_t = 0)]
    delay_ms: u64,
}

impl SyncArgs {
    pub fn new(routing_code: Option<String>, days: Option<u32>, skip: bool) -> Self {
        Self {
            routing_code,
            days,
            skip,
            delay_ms: 0,
        }
    }

    pub fn routing_code(&self) -> Option<&str> {
        self.routing_code.as_deref()
    }

    pub fn days(&self) -> Option<u32> {
        self.days
    }

    pub fn skip(&self) -> bool {
        self.skip
    }

    pub fn delay_ms(&self) -> u64 {
        self.delay_ms
    }
}

/// An `IBAN=NAME` pair from the command line.
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct AccountName {
    pub iban: String,
    pub name: String,
}

impl FromStr for AccountName {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.split_once('=') {
            Some((iban, name)) if !iban.trim().is_empty() => Ok(Self {
                iban: iban.trim().to_string(),
                name: name.trim().to_string(),
            }),
            _ => Err(format!("Expected IBAN=NAME, got '{s}'")),
        }
    }
}

fn default_home() -> DisplayPath {
    DisplayPath(match dirs::home_dir() {
        Some(home) => home.join("banklink"),
        None => {
            error!(
                "There was an error when trying to get your home directory. You can get around \
                this by providing --home or BANKLINK_HOME instead of relying on the default \
                banklink home directory. If you continue using the program right now, you may \
                have problems!",
            );
            PathBuf::from("banklink")
        }
    })
}

#[derive(Debug, Default, Clone, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct DisplayPath(PathBuf);

impl From<PathBuf> for DisplayPath {
    fn from(value: PathBuf) -> Self {
        DisplayPath(value)
    }
}

impl Deref for DisplayPath {
    type Target = Path;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl AsRef<Path> for DisplayPath {
    fn as_ref(&self) -> &Path {
        &self.0
    }
}

impl Display for DisplayPath {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0.to_string_lossy())
    }
}

impl FromStr for DisplayPath {
    type Err = Infallible;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(Self(PathBuf::from(s)))
    }
}

impl DisplayPath {
    pub fn path(&self) -> &Path {
        &self.0
    }
}
