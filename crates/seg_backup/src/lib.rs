//! Single-data-file backup and restore for sharded segment stores.
//!
//! During backup every table export on a segment is relayed into one shared
//! data file and its byte extent recorded in the segment ledger. During
//! restore a resident agent per segment serves those extents, in order, to
//! per-table named pipes read by the engine's import commands, while the
//! scheduler drives the imports over a pool of connections.

pub mod agents;
pub mod config;
pub mod copy;
pub mod error;
pub mod extent;
pub mod ledger;
pub mod pipes;
pub mod progress;
pub mod relay;
pub mod scheduler;
pub mod streamer;
pub mod task;

pub use error::{LedgerError, RestoreError, StreamError};
pub use extent::{Extent, ServePlan, TableId};
pub use ledger::Ledger;

use std::fs::File;
use std::io::IsTerminal;
use std::os::unix::io::AsFd;

/// Install the `tracing` subscriber for a helper process.
///
/// Output goes to stderr because stdout may carry table data.
pub fn init_logging(default_filter: &str) {
    // Enable ANSI colors only when stderr is a terminal and NO_COLOR is unset.
    let ansi = std::io::stderr().is_terminal() && std::env::var_os("NO_COLOR").is_none();
    let _ = tracing_subscriber::fmt()
        .with_ansi(ansi)
        .with_writer(std::io::stderr)
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_filter)),
        )
        .try_init();
}

/// Owned handles on this process's stdin and stdout.
///
/// Reads and writes through these are unbuffered, so nothing is pulled from
/// an inherited stream beyond what the caller asks for.
pub fn stdio_files() -> std::io::Result<(File, File)> {
    let stdin = File::from(std::io::stdin().as_fd().try_clone_to_owned()?);
    let stdout = File::from(std::io::stdout().as_fd().try_clone_to_owned()?);
    Ok((stdin, stdout))
}
