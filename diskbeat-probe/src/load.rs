//! Disk load generation
//!
//! - [`LoadGenerator`]: one sequential file write, returning a throughput sample
//! - [`FileWriter`]: writes `'1'` bytes chunk by chunk through a file handle
//! - [`DdWriter`]: delegates the write to `dd if=/dev/zero`
//! - [`LoadWorker`]: runs a generator in a blocking worker until shutdown, then
//!   removes the generated files

use diskbeat_protocol::Sample;
use std::fs::File;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::process::Command;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::config::{LoadConf, LoadMode};
use crate::shutdown::ShutdownSignal;

#[derive(Debug, thiserror::Error)]
pub enum LoadError {
    #[error("failed to prepare working directory {path}: {source}")]
    WorkDir {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("write to {path} failed: {source}")]
    Write {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("failed to run dd: {0}")]
    Spawn(#[source] io::Error),
    #[error("dd exited with {status}: {stderr}")]
    DdFailed { status: String, stderr: String },
    #[error("unrecognised dd summary: {0}")]
    DdOutput(String),
    #[error("load generator did not finish within {0:?}")]
    Stalled(Duration),
    #[error("load generator panicked")]
    Panicked,
    #[error("gave up after {count} consecutive failures, last: {last}")]
    TooManyFailures {
        count: u32,
        #[source]
        last: Box<LoadError>,
    },
}

impl LoadError {
    /// Errors after which no further sample can be produced
    pub fn is_permanent(&self) -> bool {
        match self {
            LoadError::WorkDir { .. }
            | LoadError::Stalled(_)
            | LoadError::Panicked
            | LoadError::TooManyFailures { .. } => true,
            LoadError::Spawn(e) => matches!(
                e.kind(),
                io::ErrorKind::NotFound | io::ErrorKind::PermissionDenied
            ),
            _ => false,
        }
    }
}

/// Produces one sample by writing one file at `target`
pub trait LoadGenerator: Send + 'static {
    fn write_file(&mut self, target: &Path) -> Result<Sample, LoadError>;
}

impl LoadGenerator for Box<dyn LoadGenerator> {
    fn write_file(&mut self, target: &Path) -> Result<Sample, LoadError> {
        (**self).write_file(target)
    }
}

pub fn build_generator(conf: &LoadConf) -> Box<dyn LoadGenerator> {
    match conf.mode {
        LoadMode::FileIo => Box::new(FileWriter::new(conf.chunk_size, conf.block_count())),
        LoadMode::Dd => Box::new(DdWriter::new(conf.chunk_size, conf.block_count())),
    }
}

fn write_speed(bytes: u64, elapsed: Duration) -> String {
    let secs = elapsed.as_secs_f64().max(f64::EPSILON);
    format!("{:.0}bytes/sec", bytes as f64 / secs)
}

pub struct FileWriter {
    chunk: Vec<u8>,
    block_count: u64,
}

impl FileWriter {
    pub fn new(chunk_size: u64, block_count: u64) -> Self {
        Self {
            chunk: vec![b'1'; chunk_size as usize],
            block_count,
        }
    }
}

impl LoadGenerator for FileWriter {
    fn write_file(&mut self, target: &Path) -> Result<Sample, LoadError> {
        let wrap = |source| LoadError::Write {
            path: target.to_path_buf(),
            source,
        };
        let mut file = File::create(target).map_err(wrap)?;
        let started = Instant::now();
        for _ in 0..self.block_count {
            file.write_all(&self.chunk).map_err(wrap)?;
        }
        file.flush().map_err(wrap)?;
        let elapsed = started.elapsed();

        let chunk_size = self.chunk.len() as u64;
        let written = chunk_size * self.block_count;
        Ok(Sample {
            operation_time: elapsed.as_secs_f64(),
            file_size: written,
            chunk_size,
            write_speed: write_speed(written, elapsed),
        })
    }
}

pub struct DdWriter {
    chunk_size: u64,
    block_count: u64,
}

impl DdWriter {
    pub fn new(chunk_size: u64, block_count: u64) -> Self {
        Self {
            chunk_size,
            block_count,
        }
    }
}

impl LoadGenerator for DdWriter {
    fn write_file(&mut self, target: &Path) -> Result<Sample, LoadError> {
        let output = Command::new("dd")
            .arg("if=/dev/zero")
            .arg(format!("of={}", target.display()))
            .arg(format!("bs={}", self.chunk_size))
            .arg(format!("count={}", self.block_count))
            .output()
            .map_err(LoadError::Spawn)?;

        // dd reports on stderr
        let report = String::from_utf8_lossy(&output.stderr);
        if !output.status.success() {
            return Err(LoadError::DdFailed {
                status: output.status.to_string(),
                stderr: report.trim().to_string(),
            });
        }
        debug!("dd: {}", report.trim());

        let (operation_time, file_size, write_speed) = parse_dd_summary(&report)
            .ok_or_else(|| LoadError::DdOutput(report.trim().to_string()))?;
        Ok(Sample {
            operation_time,
            file_size,
            chunk_size: self.chunk_size,
            write_speed,
        })
    }
}

/// Extracts `(seconds, bytes, speed)` from the summary line of GNU or BSD dd
fn parse_dd_summary(report: &str) -> Option<(f64, u64, String)> {
    let line = report
        .lines()
        .rev()
        .find(|l| l.contains("bytes") && (l.contains("copied") || l.contains("transferred")))?;
    let tokens: Vec<&str> = line.split_whitespace().collect();
    let bytes: u64 = tokens.first()?.parse().ok()?;

    if line.contains("transferred") {
        // BSD: "<n> bytes transferred in <secs> secs (<rate> bytes/sec)"
        let at = tokens.iter().position(|t| *t == "in")?;
        let secs: f64 = tokens.get(at + 1)?.parse().ok()?;
        let open = line.rfind('(')?;
        let close = line.rfind(')')?;
        let speed = line.get(open + 1..close)?.replace(' ', "");
        Some((secs, bytes, speed))
    } else {
        // GNU: "<n> bytes (...) copied, <secs> s, <rate> <unit>"
        let mut parts = line.rsplitn(3, ',');
        let speed = parts.next()?.trim().replace(' ', "");
        let secs: f64 = parts
            .next()?
            .trim()
            .trim_end_matches('s')
            .trim()
            .parse()
            .ok()?;
        Some((secs, bytes, speed))
    }
}

/// Runs a [`LoadGenerator`] off the async runtime until the shutdown latch is set
pub struct LoadWorker<G> {
    generator: G,
    conf: LoadConf,
    chunk_dir: PathBuf,
    samples: mpsc::UnboundedSender<Sample>,
    shutdown: ShutdownSignal,
}

impl<G: LoadGenerator> LoadWorker<G> {
    pub fn new(
        generator: G,
        conf: LoadConf,
        chunk_dir: PathBuf,
        samples: mpsc::UnboundedSender<Sample>,
        shutdown: ShutdownSignal,
    ) -> Self {
        Self {
            generator,
            conf,
            chunk_dir,
            samples,
            shutdown,
        }
    }

    /// Returns the number of samples produced, or the error that stopped production.
    /// Generated files are removed in both cases.
    pub async fn run(self) -> Result<u64, LoadError> {
        let LoadWorker {
            generator,
            conf,
            chunk_dir,
            samples,
            shutdown,
        } = self;

        if let Err(source) = tokio::fs::create_dir_all(&chunk_dir).await {
            return Err(LoadError::WorkDir {
                path: chunk_dir,
                source,
            });
        }
        info!("load worker writing to {}", chunk_dir.display());

        let outcome = produce(generator, &conf, &chunk_dir, &samples, &shutdown).await;
        // Closing the channel tells the reporting loop nothing else is coming
        drop(samples);

        if !conf.cleanup_grace().is_zero() {
            tokio::time::sleep(conf.cleanup_grace()).await;
        }
        match tokio::fs::remove_dir_all(&chunk_dir).await {
            Ok(()) => info!("deleted test files in {}", chunk_dir.display()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => warn!("failed to delete {}: {}", chunk_dir.display(), e),
        }
        outcome
    }
}

async fn produce<G: LoadGenerator>(
    generator: G,
    conf: &LoadConf,
    chunk_dir: &Path,
    samples: &mpsc::UnboundedSender<Sample>,
    shutdown: &ShutdownSignal,
) -> Result<u64, LoadError> {
    let timeout = conf.iteration_timeout();
    let mut generator = Some(generator);
    let mut counter: u64 = 0;
    let mut produced: u64 = 0;
    let mut failures: u32 = 0;

    while !shutdown.is_set() {
        // Only lost when a previous iteration stalled or panicked, both of which return
        let Some(mut current) = generator.take() else {
            return Err(LoadError::Panicked);
        };
        counter += 1;
        let target = chunk_dir.join(counter.to_string());
        let task = tokio::task::spawn_blocking(move || {
            let result = current.write_file(&target);
            (current, result)
        });

        let result = match tokio::time::timeout(timeout, task).await {
            Err(_) => return Err(LoadError::Stalled(timeout)),
            Ok(Err(_)) => return Err(LoadError::Panicked),
            Ok(Ok((current, result))) => {
                generator = Some(current);
                result
            }
        };

        match result {
            Ok(sample) => {
                failures = 0;
                produced += 1;
                debug!(
                    "sample {}: {} bytes in {:.3}s",
                    counter, sample.file_size, sample.operation_time
                );
                if samples.send(sample).is_err() {
                    debug!("sample channel closed, stopping load worker");
                    break;
                }
            }
            Err(e) if e.is_permanent() => return Err(e),
            Err(e) => {
                failures += 1;
                warn!("load iteration {} failed ({}/{}): {}", counter, failures, conf.max_consecutive_failures, e);
                if failures >= conf.max_consecutive_failures {
                    return Err(LoadError::TooManyFailures {
                        count: failures,
                        last: Box::new(e),
                    });
                }
            }
        }

        tokio::select! {
            _ = tokio::time::sleep(conf.pause()) => {}
            _ = shutdown.wait() => {}
        }
    }
    Ok(produced)
}
