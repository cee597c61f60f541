//! Backup relay invoked by the engine's export command for one table.
//!
//! Reads the table's exported bytes on stdin, passes them unmodified to
//! stdout (the segment data file) and records the extent in the ledger.

use std::path::PathBuf;

use anyhow::Context;
use clap::Parser;
use seg_backup::config::{RelayConfig, UNKNOWN_CONTENT};
use seg_backup::ledger::SyncMode;
use seg_backup::relay::relay_table;
use seg_backup::TableId;

#[derive(Parser, Debug)]
#[command(name = "relay")]
#[command(about = "Relay one table export into the segment data file", long_about = None)]
struct Args {
    /// Id of the table being exported.
    #[arg(long = "table-id", env = "SEG_TABLE_ID")]
    table_id: TableId,

    /// Path of the segment ledger (table of contents).
    #[arg(long = "toc", env = "SEG_TOC_FILE")]
    toc: PathBuf,

    /// Content id of the segment running this relay.
    #[arg(
        long,
        env = "SEG_CONTENT_ID",
        default_value_t = UNKNOWN_CONTENT,
        allow_hyphen_values = true
    )]
    content: i32,

    /// Ledger durability: `none`, `sync_data` or `sync_all`.
    #[arg(long = "ledger-sync", env = "SEG_LEDGER_SYNC", default_value = "sync_all")]
    ledger_sync: String,
}

fn main() -> anyhow::Result<()> {
    seg_backup::init_logging("info");
    let args = Args::parse();
    let config = RelayConfig {
        content_id: args.content,
        table_id: args.table_id,
        toc_path: args.toc,
        sync_mode: SyncMode::parse(&args.ledger_sync),
    };

    let (mut input, mut output) = seg_backup::stdio_files().context("open stdio")?;
    relay_table(&config, &mut input, &mut output).with_context(|| {
        format!(
            "segment {}: relay table {}",
            config.content_id, config.table_id
        )
    })?;
    Ok(())
}
