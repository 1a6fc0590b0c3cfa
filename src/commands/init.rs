use crate::commands::Out;
use crate::{Config, Result};
use std::path::Path;

/// Creates the data directory and an initial `config.json` with default settings. Running it
/// again keeps an existing `config.json`.
///
/// # Arguments
/// - `home` - The directory that will be the root of the data directory, e.g. `$HOME/banklink`
///
/// # Errors
/// - Returns an error if any file operations fail or an existing config file is invalid.
pub async fn init(home: &Path) -> Result<Out<()>> {
    let config = Config::create(home).await?;
    Ok(format!(
        "Successfully created the banklink directory at {}",
        config.root().display()
    )
    .into())
}
