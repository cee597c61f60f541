//! Named-pipe rendezvous between a resident agent and the engine's import.
//!
//! Every table has its own FIFO under the segment's pipe directory, so an
//! import that starts early simply waits on its own path until the agent
//! reaches that extent.

use std::ffi::CString;
use std::fs::{File, OpenOptions};
use std::io::ErrorKind;
use std::os::unix::ffi::OsStrExt;
use std::os::unix::fs::{FileTypeExt, OpenOptionsExt};
use std::os::unix::io::AsRawFd;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use crate::error::StreamError;
use crate::extent::TableId;

/// File name of the FIFO carrying one table's bytes.
pub fn pipe_file_name(table_id: TableId) -> String {
    format!("table_{table_id}.pipe")
}

pub fn pipe_path(pipe_dir: &Path, table_id: TableId) -> PathBuf {
    pipe_dir.join(pipe_file_name(table_id))
}

/// Marker asking the agent to drop a table's extent instead of serving it.
pub fn skip_marker_path(pipe_dir: &Path, table_id: TableId) -> PathBuf {
    pipe_dir.join(format!("table_{table_id}.skip"))
}

/// Ask the agent owning `pipe_dir` to skip `table_id` if it is still waiting for it.
pub fn mark_skipped(pipe_dir: &Path, table_id: TableId) -> std::io::Result<()> {
    File::create(skip_marker_path(pipe_dir, table_id)).map(drop)
}

pub fn is_fifo(path: &Path) -> bool {
    std::fs::metadata(path)
        .map(|meta| meta.file_type().is_fifo())
        .unwrap_or(false)
}

/// Create a FIFO at `path`. An existing FIFO is left alone.
pub fn create_fifo(path: &Path) -> std::io::Result<()> {
    let c_path = CString::new(path.as_os_str().as_bytes())
        .map_err(|err| std::io::Error::new(ErrorKind::InvalidInput, err))?;
    // SAFETY: `c_path` is a valid NUL-terminated string for the duration of the call.
    let rc = unsafe { libc::mkfifo(c_path.as_ptr(), 0o600) };
    if rc == 0 {
        return Ok(());
    }
    let err = std::io::Error::last_os_error();
    if err.kind() == ErrorKind::AlreadyExists && is_fifo(path) {
        return Ok(());
    }
    Err(err)
}

/// Create the FIFOs for every table in `tables` under `pipe_dir`, dropping
/// any skip markers left behind by an earlier run.
pub fn create_table_pipes(pipe_dir: &Path, tables: &[TableId]) -> std::io::Result<()> {
    std::fs::create_dir_all(pipe_dir)?;
    for table_id in tables {
        create_fifo(&pipe_path(pipe_dir, *table_id))?;
        remove_if_present(&skip_marker_path(pipe_dir, *table_id))?;
    }
    Ok(())
}

/// Written by an agent once its pipes are in place.
pub fn ready_marker_path(pipe_dir: &Path) -> PathBuf {
    pipe_dir.join("agent.ready")
}

pub fn mark_ready(pipe_dir: &Path) -> std::io::Result<()> {
    File::create(ready_marker_path(pipe_dir)).map(drop)
}

pub fn clear_ready(pipe_dir: &Path) -> std::io::Result<()> {
    remove_if_present(&ready_marker_path(pipe_dir))
}

fn remove_if_present(path: &Path) -> std::io::Result<()> {
    match std::fs::remove_file(path) {
        Err(err) if err.kind() != ErrorKind::NotFound => Err(err),
        _ => Ok(()),
    }
}

/// Remove FIFOs and skip markers created for `tables`.
pub fn remove_table_pipes(pipe_dir: &Path, tables: &[TableId]) {
    for table_id in tables {
        for path in [
            pipe_path(pipe_dir, *table_id),
            skip_marker_path(pipe_dir, *table_id),
        ] {
            if let Err(err) = std::fs::remove_file(&path) {
                if err.kind() != ErrorKind::NotFound {
                    tracing::warn!(path = %path.display(), error = %err, "remove pipe failed");
                }
            }
        }
    }
}

/// Policy for waiting on a reader to attach.
#[derive(Debug, Clone, Copy)]
pub struct ReaderWait {
    pub poll_interval: Duration,
    /// `None` waits for as long as it takes.
    pub timeout: Option<Duration>,
}

impl Default for ReaderWait {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_millis(5),
            timeout: None,
        }
    }
}

/// Result of waiting for a table's reader.
#[derive(Debug)]
pub enum WriterOpen {
    /// A reader is attached; the handle performs blocking writes.
    Attached(File),
    /// The table was marked skipped before any reader arrived.
    Skipped,
}

/// Open `path` for writing once a reader attaches, or give up when the skip
/// marker shows up first.
pub fn open_writer(
    path: &Path,
    skip_marker: &Path,
    wait: ReaderWait,
) -> Result<WriterOpen, StreamError> {
    let started = Instant::now();
    loop {
        match OpenOptions::new()
            .write(true)
            .custom_flags(libc::O_NONBLOCK)
            .open(path)
        {
            Ok(file) => {
                set_blocking(&file)?;
                return Ok(WriterOpen::Attached(file));
            }
            // ENXIO: the FIFO has no reader yet.
            Err(err) if err.raw_os_error() == Some(libc::ENXIO) => {}
            Err(err) if err.kind() == ErrorKind::Interrupted => continue,
            Err(err) => return Err(StreamError::Io(err)),
        }

        if skip_marker.exists() {
            if let Err(err) = std::fs::remove_file(skip_marker) {
                tracing::debug!(path = %skip_marker.display(), error = %err, "remove skip marker");
            }
            return Ok(WriterOpen::Skipped);
        }
        if let Some(timeout) = wait.timeout {
            if started.elapsed() >= timeout {
                return Err(StreamError::ReaderTimeout {
                    path: path.to_path_buf(),
                    waited_ms: timeout.as_millis().min(u128::from(u64::MAX)) as u64,
                });
            }
        }
        std::thread::sleep(wait.poll_interval);
    }
}

fn set_blocking(file: &File) -> std::io::Result<()> {
    let fd = file.as_raw_fd();
    // SAFETY: `fd` is owned by `file`, which outlives both calls.
    let flags = unsafe { libc::fcntl(fd, libc::F_GETFL) };
    if flags < 0 {
        return Err(std::io::Error::last_os_error());
    }
    if unsafe { libc::fcntl(fd, libc::F_SETFL, flags & !libc::O_NONBLOCK) } < 0 {
        return Err(std::io::Error::last_os_error());
    }
    Ok(())
}
