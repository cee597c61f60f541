//! Discard-then-copy over sources that cannot seek.
//!
//! Two implementations share the `DiscardAndCopy` seam: an in-process loop
//! that never reads past the bytes it was asked for, and one that hands the
//! raw descriptors to an external block-copy program taking `skip=N count=M
//! bs=1` arguments.

use std::fs::File;
use std::io::{ErrorKind, Read, Write};
use std::path::PathBuf;
use std::process::{Command, Stdio};

use crate::error::StreamError;

/// Read buffer size for the in-process copier.
pub const COPY_BUFFER_LEN: usize = 64 * 1024;

/// Bytes dropped and bytes delivered by one discard-then-copy.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CopyReport {
    pub discarded: u64,
    pub copied: u64,
}

impl CopyReport {
    pub fn consumed(&self) -> u64 {
        self.discarded + self.copied
    }
}

/// Drop `discard` bytes from `source`, then copy exactly `copy` bytes to `dest`.
///
/// Every read is bounded by what is still owed, so a source shared with a
/// later reader (a pipe inherited by the next process) is left positioned at
/// the first byte after the copied range.
pub fn discard_then_copy<R, W>(
    source: &mut R,
    discard: u64,
    copy: u64,
    dest: &mut W,
) -> Result<CopyReport, StreamError>
where
    R: Read + ?Sized,
    W: Write + ?Sized,
{
    let expected = discard + copy;
    let buf_len = expected.clamp(1, COPY_BUFFER_LEN as u64) as usize;
    let mut buf = vec![0u8; buf_len];
    let mut report = CopyReport::default();

    while report.discarded < discard {
        let want = (discard - report.discarded).min(buf_len as u64) as usize;
        let n = read_some(source, &mut buf[..want])?;
        if n == 0 {
            return Err(StreamError::ShortRead {
                expected,
                actual: report.consumed(),
            });
        }
        report.discarded += n as u64;
    }

    while report.copied < copy {
        let want = (copy - report.copied).min(buf_len as u64) as usize;
        let n = read_some(source, &mut buf[..want])?;
        if n == 0 {
            return Err(StreamError::ShortRead {
                expected,
                actual: report.consumed(),
            });
        }
        report.copied += n as u64;
        dest.write_all(&buf[..n])
            .map_err(|err| write_error(err, report.consumed()))?;
    }
    dest.flush()
        .map_err(|err| write_error(err, report.consumed()))?;
    Ok(report)
}

fn read_some<R: Read + ?Sized>(source: &mut R, buf: &mut [u8]) -> Result<usize, StreamError> {
    loop {
        match source.read(buf) {
            Ok(n) => return Ok(n),
            Err(err) if err.kind() == ErrorKind::Interrupted => continue,
            Err(err) => return Err(StreamError::Io(err)),
        }
    }
}

fn write_error(err: std::io::Error, consumed: u64) -> StreamError {
    if err.kind() == ErrorKind::BrokenPipe {
        StreamError::BrokenPipe { consumed }
    } else {
        StreamError::Io(err)
    }
}

/// Strategy for serving a byte range between two open descriptors.
pub trait DiscardAndCopy: Send + Sync {
    fn discard_and_copy(
        &self,
        source: &mut File,
        discard: u64,
        copy: u64,
        dest: &mut File,
    ) -> Result<CopyReport, StreamError>;
}

/// Bounded in-process copy loop.
#[derive(Debug, Clone, Copy, Default)]
pub struct InProcessCopier;

impl DiscardAndCopy for InProcessCopier {
    fn discard_and_copy(
        &self,
        source: &mut File,
        discard: u64,
        copy: u64,
        dest: &mut File,
    ) -> Result<CopyReport, StreamError> {
        discard_then_copy(source, discard, copy, dest)
    }
}

/// Delegates the copy to an external byte-accurate block copy program.
#[derive(Debug, Clone)]
pub struct BlockCopyCommand {
    program: PathBuf,
    extra_args: Vec<String>,
}

impl BlockCopyCommand {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            extra_args: Vec::new(),
        }
    }

    pub fn with_args(mut self, args: impl IntoIterator<Item = String>) -> Self {
        self.extra_args.extend(args);
        self
    }

    fn args(&self, discard: u64, copy: u64) -> Vec<String> {
        let mut args = vec![
            format!("skip={discard}"),
            format!("count={copy}"),
            "bs=1".to_string(),
        ];
        args.extend(self.extra_args.iter().cloned());
        args
    }
}

impl DiscardAndCopy for BlockCopyCommand {
    /// The program's output is relayed to `dest` through a counting loop,
    /// since block-copy tools exit successfully when their input ends early.
    fn discard_and_copy(
        &self,
        source: &mut File,
        discard: u64,
        copy: u64,
        dest: &mut File,
    ) -> Result<CopyReport, StreamError> {
        let program = self.program.display().to_string();
        let subprocess = |detail: String| StreamError::Subprocess {
            program: program.clone(),
            detail,
        };
        let mut child = Command::new(&self.program)
            .args(self.args(discard, copy))
            .stdin(Stdio::from(source.try_clone()?))
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|err| subprocess(err.to_string()))?;

        let relayed = match child.stdout.take() {
            Some(mut stdout) => relay_output(&mut stdout, dest, discard),
            None => Err(subprocess("stdout not captured".to_string())),
        };
        // Reap the child even when relaying failed.
        let output = child
            .wait_with_output()
            .map_err(|err| subprocess(err.to_string()))?;
        let copied = relayed?;
        if !output.status.success() {
            return Err(subprocess(format!(
                "{}: {}",
                output.status,
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }
        if copied < copy {
            return Err(StreamError::ShortRead {
                expected: discard + copy,
                actual: discard + copied,
            });
        }
        Ok(CopyReport {
            discarded: discard,
            copied,
        })
    }
}

/// Copy a child's stdout to `dest`, returning the byte count.
fn relay_output<R: Read>(
    stdout: &mut R,
    dest: &mut File,
    discard: u64,
) -> Result<u64, StreamError> {
    let mut buf = vec![0u8; COPY_BUFFER_LEN];
    let mut copied = 0u64;
    loop {
        let n = read_some(stdout, &mut buf)?;
        if n == 0 {
            break;
        }
        dest.write_all(&buf[..n])
            .map_err(|err| write_error(err, discard + copied))?;
        copied += n as u64;
    }
    dest.flush()
        .map_err(|err| write_error(err, discard + copied))?;
    Ok(copied)
}
