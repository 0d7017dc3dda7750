//! Implements the database dump and restore using the native PostgreSQL tools.

use std::fs::File;
use std::io::{self, BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};
use std::process::{Child, ChildStdin, ChildStdout, Command, ExitStatus, Stdio};
use std::sync::mpsc::{self, TryRecvError};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use derive_more::{Display, Error};
use flate2::read::MultiGzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;

use crate::config::{BackupConfig, DatabaseConfig};

const POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Errors of the native dump and restore processes.
#[derive(Debug, Display, Error)]
pub enum DumpError {
    /// The tool could not be started, e.g. because it is not installed.
    #[display("Failed to start {}: {source}", program.display())]
    Spawn {
        program: PathBuf,
        source: io::Error,
    },
    /// Waiting for the tool failed.
    #[display("Failed to wait for {}: {source}", program.display())]
    Wait {
        program: PathBuf,
        source: io::Error,
    },
    /// The tool exited unsuccessfully.
    #[display("{} failed ({status}): {}", program.display(), stderr.trim())]
    Exited {
        #[error(ignore)]
        program: PathBuf,
        #[error(ignore)]
        status: ExitStatus,
        #[error(ignore)]
        stderr: String,
    },
    /// Moving data between the tool and the file system failed.
    #[display("Streaming data of {} failed: {source}", program.display())]
    Stream {
        program: PathBuf,
        source: io::Error,
    },
    /// The tool was killed after exceeding its time budget.
    #[display("{} killed after {}s", program.display(), after.as_secs())]
    TimedOut {
        #[error(ignore)]
        program: PathBuf,
        #[error(ignore)]
        after: Duration,
    },
}

/// Result of a finished dump.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DumpOutput {
    /// Bytes written to the destination file.
    pub bytes_written: u64,
    /// Diagnostics the tool printed while succeeding.
    pub stderr: String,
}

/// Creates and restores database dumps.
pub trait Dumper: Send + Sync {
    /// Streams a dump into `output`, gzip compressed if `compress` is set.
    ///
    /// The dump is never held in memory as a whole. On error the content of
    /// `output` is undefined and must not be treated as a backup.
    fn dump(&self, output: &Path, compress: bool) -> Result<DumpOutput, DumpError>;

    /// Restores the database from a dump created by [Dumper::dump].
    fn restore(&self, input: &Path) -> Result<(), DumpError>;
}

/// [Dumper] running `pg_dump` in the self-describing custom format
/// and `pg_restore` to read it back.
#[derive(Debug, Clone)]
pub struct PgDump {
    database: DatabaseConfig,
    pg_dump: PathBuf,
    pg_restore: PathBuf,
    timeout: Option<Duration>,
}

impl PgDump {
    pub fn new(database: DatabaseConfig, pg_dump: PathBuf, pg_restore: PathBuf) -> Self {
        Self {
            database,
            pg_dump,
            pg_restore,
            timeout: None,
        }
    }

    /// Kill the tool once it runs longer than `timeout`.
    pub fn with_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn from_config(cfg: &BackupConfig) -> Self {
        Self::new(
            cfg.database.clone(),
            cfg.pg_dump.clone(),
            cfg.pg_restore.clone(),
        )
        .with_timeout(cfg.dump_timeout())
    }

    fn command(&self, program: &Path) -> Command {
        let mut command = Command::new(program);
        command.envs(self.database.env());
        command
    }
}

impl Dumper for PgDump {
    fn dump(&self, output: &Path, compress: bool) -> Result<DumpOutput, DumpError> {
        let program = self.pg_dump.clone();
        log::info!(target: "backup::dump", "Create dump of database '{}' on {}:{}", self.database.name, self.database.host, self.database.port);
        log::debug!(target: "backup::dump", "Save dump at: {}", output.display());

        let stream_err = |source| DumpError::Stream {
            program: program.clone(),
            source,
        };
        let file = File::create_new(output).map_err(stream_err)?;

        let mut dump_process = self
            .command(&program)
            .arg("--format=custom")
            .arg("--no-password")
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|source| DumpError::Spawn {
                program: program.clone(),
                source,
            })?;
        log::trace!(target: "backup::dump", "Started {} process.", program.display());

        let stderr = capture_stderr(&mut dump_process);
        let stdout = dump_process
            .stdout
            .take()
            .ok_or_else(|| stream_err(io::Error::other("stdout of dump process not captured")))?;

        // compress and capture stdout of pg_dump on a helper thread
        let (done_tx, done_rx) = mpsc::channel();
        thread::spawn(move || {
            let _ = done_tx.send(write_dump(stdout, file, compress));
        });

        let deadline = self.timeout.map(|timeout| Instant::now() + timeout);
        let mut written = None;
        let status = loop {
            if written.is_none() {
                match done_rx.try_recv() {
                    Ok(Ok(bytes)) => written = Some(bytes),
                    Ok(Err(e)) => {
                        kill(&mut dump_process);
                        return Err(stream_err(e));
                    }
                    Err(TryRecvError::Disconnected) => {
                        kill(&mut dump_process);
                        return Err(stream_err(io::Error::other("dump writer terminated")));
                    }
                    Err(TryRecvError::Empty) => {}
                }
            }

            if let Some(status) = dump_process.try_wait().map_err(|source| DumpError::Wait {
                program: program.clone(),
                source,
            })? {
                break status;
            }

            if let (Some(deadline), Some(timeout)) = (deadline, self.timeout) {
                if Instant::now() >= deadline {
                    kill(&mut dump_process);
                    log::error!(target: "backup::dump", "{} exceeded {}s, killed", program.display(), timeout.as_secs());
                    return Err(DumpError::TimedOut {
                        program,
                        after: timeout,
                    });
                }
            }

            thread::sleep(POLL_INTERVAL);
        };

        let stderr = stderr.join().unwrap_or_default();
        if !status.success() {
            return Err(DumpError::Exited {
                program,
                status,
                stderr,
            });
        }

        // stdout is closed now, the writer finishes on its own
        let bytes_written = match written {
            Some(bytes) => bytes,
            None => done_rx
                .recv()
                .map_err(|_| stream_err(io::Error::other("dump writer terminated")))?
                .map_err(stream_err)?,
        };

        if !stderr.is_empty() {
            log::warn!(target: "backup::dump", "{}", stderr.trim_end());
        }
        log::info!(target: "backup::dump", "Finished database dump ({bytes_written} bytes).");

        Ok(DumpOutput {
            bytes_written,
            stderr,
        })
    }

    fn restore(&self, input: &Path) -> Result<(), DumpError> {
        let program = self.pg_restore.clone();
        log::info!(target: "backup::dump", "Restore database '{}' from: {}", self.database.name, input.display());

        let stream_err = |source| DumpError::Stream {
            program: program.clone(),
            source,
        };
        let file = File::open(input).map_err(stream_err)?;
        let compressed = super::record::is_compressed(input);

        let mut restore_process = self
            .command(&program)
            .arg("--clean")
            .arg("--if-exists")
            .arg("--no-owner")
            .arg("--no-password")
            .arg(format!("--dbname={}", self.database.name))
            .stdin(Stdio::piped())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|source| DumpError::Spawn {
                program: program.clone(),
                source,
            })?;

        let stderr = capture_stderr(&mut restore_process);
        let stdin = restore_process
            .stdin
            .take()
            .ok_or_else(|| stream_err(io::Error::other("stdin of restore process not captured")))?;
        let feeder = thread::spawn(move || feed_restore(file, stdin, compressed));

        let status = wait_until(&mut restore_process, self.timeout).map_err(|e| match e {
            WaitError::Io(source) => DumpError::Wait {
                program: program.clone(),
                source,
            },
            WaitError::TimedOut(after) => DumpError::TimedOut {
                program: program.clone(),
                after,
            },
        })?;
        let stderr = stderr.join().unwrap_or_default();
        if !status.success() {
            return Err(DumpError::Exited {
                program,
                status,
                stderr,
            });
        }

        feeder
            .join()
            .map_err(|_| stream_err(io::Error::other("restore feeder terminated")))?
            .map_err(stream_err)?;

        log::info!(target: "backup::dump", "Finished restore of database '{}'.", self.database.name);
        Ok(())
    }
}

fn write_dump(stdout: ChildStdout, file: File, compress: bool) -> io::Result<u64> {
    let mut reader = BufReader::new(stdout);
    let file = if compress {
        let mut encoder = GzEncoder::new(file, Compression::default());
        io::copy(&mut reader, &mut encoder)?;
        encoder.finish()?
    } else {
        let mut writer = BufWriter::new(file);
        io::copy(&mut reader, &mut writer)?;
        writer.into_inner().map_err(|e| e.into_error())?
    };
    file.sync_all()?;

    file.metadata().map(|meta| meta.len())
}

fn feed_restore(file: File, mut stdin: ChildStdin, compressed: bool) -> io::Result<u64> {
    let reader = BufReader::new(file);
    let mut reader: Box<dyn Read> = if compressed {
        Box::new(MultiGzDecoder::new(reader))
    } else {
        Box::new(reader)
    };

    let copied = io::copy(&mut reader, &mut stdin)?;
    stdin.flush()?;
    Ok(copied)
}

fn capture_stderr(child: &mut Child) -> JoinHandle<String> {
    let stderr = child.stderr.take();
    thread::spawn(move || {
        let mut captured = String::new();
        if let Some(mut stderr) = stderr {
            let _ = stderr.read_to_string(&mut captured);
        }
        captured
    })
}

fn kill(child: &mut Child) {
    let _ = child.kill();
    let _ = child.wait();
}

enum WaitError {
    Io(io::Error),
    TimedOut(Duration),
}

fn wait_until(child: &mut Child, timeout: Option<Duration>) -> Result<ExitStatus, WaitError> {
    let deadline = timeout.map(|timeout| Instant::now() + timeout);
    loop {
        if let Some(status) = child.try_wait().map_err(WaitError::Io)? {
            return Ok(status);
        }
        if let (Some(deadline), Some(timeout)) = (deadline, timeout) {
            if Instant::now() >= deadline {
                kill(child);
                return Err(WaitError::TimedOut(timeout));
            }
        }
        thread::sleep(POLL_INTERVAL);
    }
}
