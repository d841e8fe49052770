/**
 * PROBE STORE - durable, append-only telemetry records per probe identity
 *
 * ROLE: one record sequence per probe, created lazily on the first event and
 * never rewritten. Only the aggregator appends.
 *
 * LAYOUT: `<dir>/<escaped probe id>.jsonl`, one `StoredEvent` per line, plus a
 * `collector.lock` file holding the owning PID. Each append is a single write
 * of a complete line followed by a data sync, so a crash leaves at most one
 * truncated trailing line, which readers skip.
 */

use diskbeat_protocol::Payload;
use serde::{Deserialize, Serialize};
use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::fs::{self, File, OpenOptions};
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use sysinfo::{Pid, System};
use time::OffsetDateTime;
use tracing::{debug, info, warn};

const RECORD_EXTENSION: &str = "jsonl";
const LOCK_FILE: &str = "collector.lock";

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("store {path} is already locked by running process {pid}")]
    Locked { path: PathBuf, pid: u32 },
    #[error("store I/O error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("failed to encode record: {0}")]
    Encode(#[from] serde_json::Error),
}

impl StoreError {
    fn io(path: &Path, source: io::Error) -> Self {
        StoreError::Io {
            path: path.to_path_buf(),
            source,
        }
    }
}

/// One entry of a probe record
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoredEvent {
    #[serde(with = "time::serde::rfc3339")]
    pub received_at: OffsetDateTime,
    pub payload: Payload,
}

/// Durable storage for probe records, owned by a single writer
pub trait ProbeStore: Send + 'static {
    /// Appends one payload to the record of `probe_id`. Either the whole entry
    /// is persisted or the call fails.
    fn append(&mut self, probe_id: &str, payload: &Payload) -> Result<(), StoreError>;

    /// Identities with at least one stored entry
    fn probe_ids(&self) -> Result<Vec<String>, StoreError>;

    /// Entries of one record in append order; empty for an unknown identity
    fn records(&self, probe_id: &str) -> Result<Vec<StoredEvent>, StoreError>;
}

/// Line-per-event files in one directory, guarded by a PID lock
pub struct JsonlStore {
    dir: PathBuf,
    files: HashMap<String, File>,
    _lock: StoreLock,
}

impl JsonlStore {
    /// Opens (creating if needed) the store directory and takes its lock
    pub fn open<P: Into<PathBuf>>(dir: P) -> Result<Self, StoreError> {
        let dir = dir.into();
        fs::create_dir_all(&dir).map_err(|e| StoreError::io(&dir, e))?;
        let lock = StoreLock::acquire(&dir)?;
        info!("probe store opened at {}", dir.display());
        Ok(Self {
            dir,
            files: HashMap::new(),
            _lock: lock,
        })
    }

    fn record_path(&self, probe_id: &str) -> PathBuf {
        record_path(&self.dir, probe_id)
    }
}

impl ProbeStore for JsonlStore {
    fn append(&mut self, probe_id: &str, payload: &Payload) -> Result<(), StoreError> {
        let entry = StoredEvent {
            received_at: OffsetDateTime::now_utc(),
            payload: payload.clone(),
        };
        let mut line = serde_json::to_vec(&entry)?;
        line.push(b'\n');

        let path = self.record_path(probe_id);
        let file = match self.files.entry(probe_id.to_string()) {
            Entry::Occupied(entry) => entry.into_mut(),
            Entry::Vacant(entry) => entry.insert(open_record(&path)?),
        };
        file.write_all(&line).map_err(|e| StoreError::io(&path, e))?;
        file.sync_data().map_err(|e| StoreError::io(&path, e))?;
        Ok(())
    }

    fn probe_ids(&self) -> Result<Vec<String>, StoreError> {
        list_probe_ids(&self.dir)
    }

    fn records(&self, probe_id: &str) -> Result<Vec<StoredEvent>, StoreError> {
        read_record(&self.record_path(probe_id))
    }
}

/// Opens a record for appending. A torn last line from an earlier crash is
/// terminated first so the next entry starts on a line of its own.
fn open_record(path: &Path) -> Result<File, StoreError> {
    let mut file = OpenOptions::new()
        .create(true)
        .read(true)
        .append(true)
        .open(path)
        .map_err(|e| StoreError::io(path, e))?;
    let len = file.metadata().map_err(|e| StoreError::io(path, e))?.len();
    if len > 0 {
        let mut last = [0u8; 1];
        file.seek(SeekFrom::End(-1))
            .and_then(|_| file.read_exact(&mut last))
            .map_err(|e| StoreError::io(path, e))?;
        if last[0] != b'\n' {
            warn!("{}: terminating incomplete trailing entry", path.display());
            file.write_all(b"\n").map_err(|e| StoreError::io(path, e))?;
        }
    } else {
        debug!("created record file {}", path.display());
    }
    Ok(file)
}

/// Identities stored under `dir`, readable without taking the lock
pub fn list_probe_ids(dir: &Path) -> Result<Vec<String>, StoreError> {
    let mut ids = Vec::new();
    let entries = fs::read_dir(dir).map_err(|e| StoreError::io(dir, e))?;
    for entry in entries {
        let path = entry.map_err(|e| StoreError::io(dir, e))?.path();
        if path.extension().and_then(|e| e.to_str()) != Some(RECORD_EXTENSION) {
            continue;
        }
        let Some(stem) = path.file_stem().and_then(|s| s.to_str()) else {
            continue;
        };
        match unescape_id(stem) {
            Some(id) => ids.push(id),
            None => warn!("ignoring unrecognised record file {}", path.display()),
        }
    }
    ids.sort();
    Ok(ids)
}

/// Reads one record file, skipping a truncated trailing line
pub fn read_record(path: &Path) -> Result<Vec<StoredEvent>, StoreError> {
    let bytes = match fs::read(path) {
        Ok(bytes) => bytes,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(StoreError::io(path, e)),
    };

    let complete = match bytes.iter().rposition(|b| *b == b'\n') {
        Some(last) => &bytes[..=last],
        None => &bytes[..0],
    };
    if complete.len() < bytes.len() {
        warn!(
            "{}: dropping {} bytes of incomplete trailing entry",
            path.display(),
            bytes.len() - complete.len()
        );
    }

    let mut events = Vec::new();
    for (index, line) in complete.split(|b| *b == b'\n').enumerate() {
        if line.is_empty() {
            continue;
        }
        match serde_json::from_slice::<StoredEvent>(line) {
            Ok(event) => events.push(event),
            Err(e) => warn!("{}: skipping unreadable entry {}: {}", path.display(), index + 1, e),
        }
    }
    Ok(events)
}

pub fn record_path(dir: &Path, probe_id: &str) -> PathBuf {
    dir.join(format!("{}.{}", escape_id(probe_id), RECORD_EXTENSION))
}

/// Keeps `[A-Za-z0-9_-]` and non-leading dots, `%XX` for every other byte
fn escape_id(probe_id: &str) -> String {
    let mut out = String::with_capacity(probe_id.len());
    for (i, byte) in probe_id.bytes().enumerate() {
        let keep = byte.is_ascii_alphanumeric() || byte == b'_' || byte == b'-' || (byte == b'.' && i > 0);
        if keep {
            out.push(byte as char);
        } else {
            out.push_str(&format!("%{:02X}", byte));
        }
    }
    out
}

fn unescape_id(stem: &str) -> Option<String> {
    let bytes = stem.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'%' {
            let hex = stem.get(i + 1..i + 3)?;
            out.push(u8::from_str_radix(hex, 16).ok()?);
            i += 3;
        } else {
            out.push(bytes[i]);
            i += 1;
        }
    }
    String::from_utf8(out).ok()
}

/// PID lock file; a lock left by a dead process is reclaimed
struct StoreLock {
    path: PathBuf,
}

impl StoreLock {
    fn acquire(dir: &Path) -> Result<Self, StoreError> {
        let path = dir.join(LOCK_FILE);

        if let Ok(contents) = fs::read_to_string(&path) {
            if let Ok(pid) = contents.trim().parse::<u32>() {
                if is_process_running(pid) {
                    return Err(StoreError::Locked { path, pid });
                }
            }
            warn!("reclaiming stale store lock {}", path.display());
            let _ = fs::remove_file(&path);
        }

        // create_new so two collectors racing past the check cannot both win
        let mut file = OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&path)
            .map_err(|e| match e.kind() {
                io::ErrorKind::AlreadyExists => StoreError::Locked {
                    path: path.clone(),
                    pid: 0,
                },
                _ => StoreError::io(&path, e),
            })?;
        write!(file, "{}", std::process::id()).map_err(|e| StoreError::io(&path, e))?;
        Ok(Self { path })
    }
}

impl Drop for StoreLock {
    fn drop(&mut self) {
        let _ = fs::remove_file(&self.path);
    }
}

fn is_process_running(pid: u32) -> bool {
    let mut system = System::new();
    system.refresh_process(Pid::from_u32(pid))
}

#[cfg(test)]
mod tests {
    use super::*;
    use diskbeat_protocol::{Resource, Sample};

    fn sample(operation_time: f64) -> Payload {
        Payload::Sample(Sample {
            operation_time,
            file_size: 20_000_000,
            chunk_size: 10_000_000,
            write_speed: "8000000bytes/sec".to_string(),
        })
    }

    #[test]
    fn test_append_and_read_back_in_order() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = JsonlStore::open(dir.path()).unwrap();

        store.append("probe-1", &sample(1.0)).unwrap();
        store
            .append(
                "probe-1",
                &Payload::Resource(Resource {
                    cpu: "3.0".into(),
                    mem: "0.5".into(),
                }),
            )
            .unwrap();
        store.append("probe-1", &sample(2.0)).unwrap();
        store.append("probe-2", &sample(9.0)).unwrap();

        let records = store.records("probe-1").unwrap();
        assert_eq!(records.len(), 3);
        assert_eq!(records[0].payload, sample(1.0));
        assert!(matches!(records[1].payload, Payload::Resource(_)));
        assert_eq!(records[2].payload, sample(2.0));
        assert_eq!(store.probe_ids().unwrap(), vec!["probe-1", "probe-2"]);
        assert!(store.records("nobody").unwrap().is_empty());
    }

    #[test]
    fn test_second_open_is_locked_until_release() {
        let dir = tempfile::tempdir().unwrap();
        let store = JsonlStore::open(dir.path()).unwrap();
        assert!(matches!(
            JsonlStore::open(dir.path()),
            Err(StoreError::Locked { pid, .. }) if pid == std::process::id()
        ));
        drop(store);
        assert!(JsonlStore::open(dir.path()).is_ok());
    }

    #[test]
    fn test_stale_lock_is_reclaimed() {
        let dir = tempfile::tempdir().unwrap();
        // Far above any default pid_max
        fs::write(dir.path().join(LOCK_FILE), "4000000000").unwrap();
        assert!(JsonlStore::open(dir.path()).is_ok());
    }

    #[test]
    fn test_reopen_appends_and_skips_truncated_tail() {
        let dir = tempfile::tempdir().unwrap();
        {
            let mut store = JsonlStore::open(dir.path()).unwrap();
            store.append("probe-1", &sample(1.0)).unwrap();
        }
        let path = record_path(dir.path(), "probe-1");
        let mut file = OpenOptions::new().append(true).open(&path).unwrap();
        file.write_all(b"{\"received_at\":\"2024-01-").unwrap();
        drop(file);

        let records = read_record(&path).unwrap();
        assert_eq!(records.len(), 1);

        // A torn line followed by newer entries is skipped, not fatal
        let mut store = JsonlStore::open(dir.path()).unwrap();
        store.append("probe-1", &sample(2.0)).unwrap();
        let records = store.records("probe-1").unwrap();
        assert_eq!(records.len(), 2);
        assert_eq!(records[1].payload, sample(2.0));
    }

    #[test]
    fn test_identity_escaping_round_trips() {
        for id in ["probe-1", "../etc/passwd", "a b/c%d", ".hidden", "ünï"] {
            let escaped = escape_id(id);
            assert!(!escaped.contains('/'));
            assert!(!escaped.starts_with('.'));
            assert_eq!(unescape_id(&escaped).as_deref(), Some(id));
        }
    }
}
