//! Error handling and display for the CLI.

use std::path::PathBuf;

use colored::Colorize;
use hwmgr::store::StoreError;
use hwmgr::HwMgrError;
use thiserror::Error;

/// CLI-specific errors.
#[derive(Debug, Error)]
pub enum CliError {
    #[error("Resource not found: {0}")]
    NotFound(String),

    #[error("Cannot read {path}: {source}")]
    ReadFile {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Invalid manifest {path}: {source}")]
    Manifest {
        path: PathBuf,
        #[source]
        source: serde_yaml::Error,
    },

    #[error("State store error: {0}")]
    Store(#[from] StoreError),

    #[error(transparent)]
    HwMgr(#[from] HwMgrError),
}

/// Print an error in a user-friendly format.
pub fn print_error(err: &anyhow::Error) {
    eprintln!("{} {}", "Error:".red().bold(), err);

    let Some(cli_err) = err.downcast_ref::<CliError>() else {
        return;
    };
    match cli_err {
        CliError::NotFound(_) => {
            eprintln!("\n{}", "Hint: Run `hwctl pools list` to see existing pools.".yellow());
        }
        CliError::HwMgr(HwMgrError::NotFound(_)) => {
            eprintln!(
                "\n{}",
                "Hint: Load a hardware inventory first with `hwctl inventory load <file>`.".yellow()
            );
        }
        CliError::Store(_) | CliError::HwMgr(HwMgrError::StoreUnavailable(_)) => {
            eprintln!(
                "\n{}",
                "Hint: Check --state-path and that the database is readable.".yellow()
            );
        }
        _ => {}
    }
}
