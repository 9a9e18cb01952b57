//! Depot.
//!
//! Depot is a standalone web service that serves files of remote origins and resized variants of
//! local images. Both are cached on disk and only fetched or derived again once they become
//! stale.

#![warn(missing_debug_implementations, clippy::all)]

mod cli;
mod endpoints;
mod logging;
mod server;

fn main() {
    match cli::execute() {
        Ok(()) => std::process::exit(0),
        Err(error) => {
            logging::ensure_log_error(&error);
            std::process::exit(1);
        }
    }
}
