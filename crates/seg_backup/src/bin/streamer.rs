//! Restore streamer for one segment.
//!
//! `--restore` serves a single table's extent from stdin to stdout and exits.
//! `--restore --agent` stays resident and serves every extent of the data
//! file to per-table named pipes. `--describe` prints the ledger as JSON.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Context};
use clap::Parser;
use seg_backup::config::{parse_table_ids, AgentConfig, SingleShotConfig, UNKNOWN_CONTENT};
use seg_backup::copy::{BlockCopyCommand, DiscardAndCopy, InProcessCopier};
use seg_backup::pipes::ReaderWait;
use seg_backup::streamer::{serve_single_table, ResidentAgent};
use seg_backup::{Ledger, TableId};

#[derive(Parser, Debug)]
#[command(name = "streamer")]
#[command(about = "Serve table extents out of a segment data file", long_about = None)]
struct Args {
    /// Read table data back out according to the ledger.
    #[arg(long)]
    restore: bool,

    /// Stay resident and serve every extent to per-table pipes.
    #[arg(long, requires = "restore")]
    agent: bool,

    /// Print the ledger as JSON and exit.
    #[arg(long, conflicts_with = "restore")]
    describe: bool,

    /// Path of the segment ledger (table of contents).
    #[arg(long = "toc", env = "SEG_TOC_FILE")]
    toc: PathBuf,

    /// Table to serve (single-shot mode).
    #[arg(long = "table-id")]
    table_id: Option<TableId>,

    /// Table served by the previous invocation on the same stream; 0 for none.
    #[arg(long = "previous-table-id", default_value_t = 0)]
    previous_table_id: TableId,

    /// Segment data file (agent mode).
    #[arg(long = "data-file")]
    data_file: Option<PathBuf>,

    /// Directory holding the per-table pipes (agent mode).
    #[arg(long = "pipe-dir")]
    pipe_dir: Option<PathBuf>,

    /// Comma-separated tables to serve; every ledger extent when absent.
    #[arg(long = "include-table-ids")]
    include_table_ids: Option<String>,

    #[arg(
        long,
        env = "SEG_CONTENT_ID",
        default_value_t = UNKNOWN_CONTENT,
        allow_hyphen_values = true
    )]
    content: i32,

    /// Pause after closing one table's pipe before opening the next.
    #[arg(long = "reopen-delay-ms", env = "SEG_PIPE_REOPEN_DELAY_MS", default_value_t = 100)]
    reopen_delay_ms: u64,

    /// How often to retry opening a pipe that has no reader yet.
    #[arg(long = "poll-interval-ms", env = "SEG_PIPE_POLL_INTERVAL_MS", default_value_t = 5)]
    poll_interval_ms: u64,

    /// Give up on a pipe with no reader after this long; 0 waits forever.
    #[arg(long = "open-timeout-ms", env = "SEG_PIPE_OPEN_TIMEOUT_MS", default_value_t = 0)]
    open_timeout_ms: u64,

    /// External block-copy program used for single-shot serving instead of
    /// the in-process copier. It must accept `skip=N count=M bs=1`.
    #[arg(long = "block-copy-program", env = "SEG_BLOCK_COPY_PROGRAM")]
    block_copy_program: Option<PathBuf>,
}

fn main() -> anyhow::Result<()> {
    seg_backup::init_logging("info");
    let args = Args::parse();
    if args.describe {
        return describe(&args);
    }
    if !args.restore {
        return Err(anyhow!(
            "nothing to do: pass --restore (backups are written by `relay`)"
        ));
    }
    if args.agent {
        run_agent(args)
    } else {
        run_single_shot(args)
    }
}

fn describe(args: &Args) -> anyhow::Result<()> {
    let ledger = Ledger::load(&args.toc)
        .with_context(|| format!("segment {}: load ledger", args.content))?;
    println!("{}", serde_json::to_string_pretty(&ledger.describe())?);
    Ok(())
}

fn run_single_shot(args: Args) -> anyhow::Result<()> {
    let table_id = args
        .table_id
        .ok_or_else(|| anyhow!("--table-id is required with --restore"))?;
    let copier: Arc<dyn DiscardAndCopy> = match &args.block_copy_program {
        Some(program) => Arc::new(BlockCopyCommand::new(program)),
        None => Arc::new(InProcessCopier),
    };
    let config = SingleShotConfig {
        content_id: args.content,
        toc_path: args.toc,
        table_id,
        previous_table_id: (args.previous_table_id != 0).then_some(args.previous_table_id),
        copier,
    };

    let (mut input, mut output) = seg_backup::stdio_files().context("open stdio")?;
    serve_single_table(&config, &mut input, &mut output).with_context(|| {
        format!(
            "segment {}: error copying table with id {}",
            config.content_id, config.table_id
        )
    })?;
    Ok(())
}

fn run_agent(args: Args) -> anyhow::Result<()> {
    let data_file = args
        .data_file
        .ok_or_else(|| anyhow!("--data-file is required with --agent"))?;
    let pipe_dir = args
        .pipe_dir
        .ok_or_else(|| anyhow!("--pipe-dir is required with --agent"))?;

    let mut config = AgentConfig::new(args.content, args.toc, data_file, pipe_dir);
    config.include_tables = args
        .include_table_ids
        .as_deref()
        .map(parse_table_ids)
        .transpose()?;
    config.reopen_delay = Duration::from_millis(args.reopen_delay_ms);
    config.reader_wait = ReaderWait {
        poll_interval: Duration::from_millis(args.poll_interval_ms.max(1)),
        timeout: (args.open_timeout_ms > 0).then(|| Duration::from_millis(args.open_timeout_ms)),
    };

    let content = config.content_id;
    let agent = ResidentAgent::open(config)
        .with_context(|| format!("segment {content}: start agent"))?;
    agent
        .prepare_pipes()
        .with_context(|| format!("segment {content}: create table pipes"))?;
    tracing::info!(
        content,
        tables = agent.planned_extents().len(),
        "agent ready"
    );
    agent
        .run()
        .with_context(|| format!("segment {content}: agent aborted"))?;
    Ok(())
}
