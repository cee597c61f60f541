//! Shared helpers for helper-process integration tests.
#![allow(dead_code)]

use std::fs::{File, OpenOptions};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::process::{Child, Command, Output, Stdio};
use std::sync::mpsc;
use std::time::Duration;

/// Upper bound for any single pipe read or process wait.
pub const IO_TIMEOUT: Duration = Duration::from_secs(30);

pub fn relay_bin() -> &'static str {
    env!("CARGO_BIN_EXE_relay")
}

pub fn streamer_bin() -> &'static str {
    env!("CARGO_BIN_EXE_streamer")
}

/// Deterministic table contents, distinct per table.
pub fn table_bytes(table_id: u32, len: usize) -> Vec<u8> {
    (0..len)
        .map(|i| (i as u32).wrapping_mul(31).wrapping_add(table_id * 7) as u8)
        .collect()
}

/// One segment's on-disk backup files.
pub struct Segment {
    pub dir: tempfile::TempDir,
    pub content_id: i32,
}

impl Segment {
    pub fn new(content_id: i32) -> Self {
        Self {
            dir: tempfile::tempdir().expect("create segment dir"),
            content_id,
        }
    }

    pub fn toc(&self) -> PathBuf {
        self.dir.path().join("toc")
    }

    pub fn data(&self) -> PathBuf {
        self.dir.path().join("data")
    }

    pub fn pipe_dir(&self) -> PathBuf {
        self.dir.path().join("pipes")
    }

    pub fn pipe(&self, table_id: u32) -> PathBuf {
        seg_backup::pipes::pipe_path(&self.pipe_dir(), table_id)
    }

    /// Run the relay binary once per table, appending to the data file.
    pub fn back_up(&self, tables: &[(u32, Vec<u8>)]) {
        for (table_id, bytes) in tables {
            let output = run_relay(self, *table_id, bytes);
            assert!(
                output.status.success(),
                "relay for table {table_id} failed: {}",
                String::from_utf8_lossy(&output.stderr)
            );
        }
    }

    /// Spawn a resident agent for this segment.
    pub fn spawn_agent(&self, extra: &[&str]) -> Child {
        Command::new(streamer_bin())
            .arg("--restore")
            .arg("--agent")
            .arg(format!("--content={}", self.content_id))
            .arg(format!("--toc={}", self.toc().display()))
            .arg(format!("--data-file={}", self.data().display()))
            .arg(format!("--pipe-dir={}", self.pipe_dir().display()))
            .arg("--reopen-delay-ms=1")
            .args(extra)
            .env("RUST_LOG", "info")
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .spawn()
            .expect("spawn streamer agent")
    }
}

pub fn run_relay(segment: &Segment, table_id: u32, bytes: &[u8]) -> Output {
    let data = OpenOptions::new()
        .create(true)
        .append(true)
        .open(segment.data())
        .expect("open data file");
    let mut child = Command::new(relay_bin())
        .arg(format!("--table-id={table_id}"))
        .arg(format!("--toc={}", segment.toc().display()))
        .arg(format!("--content={}", segment.content_id))
        .stdin(Stdio::piped())
        .stdout(Stdio::from(data))
        .stderr(Stdio::piped())
        .spawn()
        .expect("spawn relay");
    let mut stdin = child.stdin.take().expect("relay stdin");
    let payload = bytes.to_vec();
    let writer = std::thread::spawn(move || {
        stdin.write_all(&payload).expect("feed relay");
    });
    let output = child.wait_with_output().expect("wait relay");
    writer.join().expect("relay feeder");
    output
}

/// Wait until the FIFO shows up; the agent creates it at start-up.
pub fn wait_for_fifo(path: &Path) {
    let deadline = std::time::Instant::now() + IO_TIMEOUT;
    while !seg_backup::pipes::is_fifo(path) {
        assert!(
            std::time::Instant::now() < deadline,
            "pipe {} never appeared",
            path.display()
        );
        std::thread::sleep(Duration::from_millis(5));
    }
}

/// Read a table pipe to end of stream, failing the test on timeout.
pub fn read_pipe(path: &Path) -> Vec<u8> {
    wait_for_fifo(path);
    let (tx, rx) = mpsc::channel();
    let path = path.to_path_buf();
    std::thread::spawn(move || {
        let mut buf = Vec::new();
        let res = File::open(&path).and_then(|mut f| f.read_to_end(&mut buf));
        let _ = tx.send(res.map(|_| buf));
    });
    rx.recv_timeout(IO_TIMEOUT)
        .expect("pipe read timed out")
        .expect("pipe read failed")
}

/// Wait for a child process, killing it if it overstays `IO_TIMEOUT`.
pub fn wait_child(child: &mut Child) -> std::process::ExitStatus {
    let deadline = std::time::Instant::now() + IO_TIMEOUT;
    loop {
        if let Some(status) = child.try_wait().expect("poll child") {
            return status;
        }
        if std::time::Instant::now() >= deadline {
            let _ = child.kill();
            panic!("child process did not exit in time");
        }
        std::thread::sleep(Duration::from_millis(10));
    }
}

pub fn child_stderr(child: &mut Child) -> String {
    let mut out = String::new();
    if let Some(mut stderr) = child.stderr.take() {
        let _ = stderr.read_to_string(&mut out);
    }
    out
}
