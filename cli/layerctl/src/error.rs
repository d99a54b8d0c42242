//! Error handling and display for the CLI.

use colored::Colorize;
use plfm_layer_arena::{CleanupError, FetchError, ProxyError};
use thiserror::Error;

/// CLI-specific errors.
#[derive(Debug, Error)]
pub enum CliError {
    #[error("invalid layer `{0}`: expected DIGEST=URI")]
    InvalidLayer(String),

    #[error("invalid header `{0}`: expected NAME:VALUE")]
    InvalidHeader(String),

    #[error("fetch interrupted")]
    Interrupted,
}

/// Print an error in a user-friendly format.
pub fn print_error(err: &anyhow::Error) {
    eprintln!("{} {}", "Error:".red().bold(), err);

    // Library errors already embed their source in the message.
    let mut shown = err.to_string();
    for cause in err.chain().skip(1) {
        let cause = cause.to_string();
        if !shown.contains(&cause) {
            eprintln!("  {} {}", "Caused by:".dimmed(), cause);
        }
        shown = cause;
    }

    if let Some(hint) = hint_for(err) {
        eprintln!("\n{}", format!("Hint: {hint}").yellow());
    }
}

fn hint_for(err: &anyhow::Error) -> Option<&'static str> {
    if let Some(proxy_err) = err.downcast_ref::<ProxyError>() {
        return match proxy_err.fetch_error()? {
            FetchError::UnexpectedStatus { status, .. }
                if status.as_u16() == 401 || status.as_u16() == 403 =>
            {
                Some("The registry refused the request. Pass credentials with --header 'Authorization: Bearer <token>'.")
            }
            FetchError::VerificationFailed { .. } => {
                Some("The served blob does not match its digest. Check the digest and URI pair.")
            }
            FetchError::UnknownContentType(_) => {
                Some("The URI may not point at a layer blob.")
            }
            FetchError::CreateFile { .. } => {
                Some("Another process may be using the same arena root. Use a different --root.")
            }
            FetchError::Request(_) => Some("Check your network connection and the layer URI."),
            _ => None,
        };
    }
    if err.downcast_ref::<CleanupError>().is_some() {
        return Some("Some cached files could not be removed. Inspect the arena root manually.");
    }
    match err.downcast_ref::<CliError>()? {
        CliError::InvalidLayer(_) => {
            Some("Layers look like sha256:<hex>=https://registry/v2/<name>/blobs/sha256:<hex>.")
        }
        _ => None,
    }
}
