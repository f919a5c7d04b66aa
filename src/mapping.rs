//! The native port mapping table and the watcher that keeps it current.
//!
//! In native mode services are local processes listening on ports assigned
//! by whatever launched them. That launcher publishes the assignment in a
//! YAML file:
//!
//! ```yaml
//! ports:
//!   echo:
//!     items: [50051, 50052]
//!   thumbnail:
//!     items: [50060]
//! ```
//!
//! [`ServiceMapping`] holds the parsed table, hands out ports round robin
//! and reloads the table whenever the file changes. A reload that fails
//! leaves the previous table in place.

use notify::event::{AccessKind, AccessMode, ModifyKind};
use notify::{Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use serde::Deserialize;
use std::collections::HashMap;
use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use thiserror::Error;

use crate::port::{EmptyPortList, PortCursor};

#[derive(Debug, Default, Deserialize)]
struct MappingDocument {
    #[serde(default)]
    ports: HashMap<String, PortsEntry>,
}

#[derive(Debug, Default, Deserialize)]
struct PortsEntry {
    #[serde(default)]
    items: Vec<u16>,
}

/// Errors from loading, watching or querying a [`ServiceMapping`].
#[derive(Debug, Error)]
pub enum MappingError {
    /// The mapping file does not exist.
    #[error("ports mapping file ({}) doesn't exist", .0.display())]
    FileNotFound(PathBuf),
    /// The mapping file exists but could not be read.
    #[error("reading ports mapping file {}: {}", .0.display(), .1)]
    Io(PathBuf, #[source] std::io::Error),
    /// The mapping file is empty or is not a valid mapping document.
    #[error("parsing ports mapping file {}: {}", .0.display(), .1)]
    Parse(PathBuf, String),
    /// The filesystem watch could not be set up.
    #[error("watching ports mapping file {}: {}", .0.display(), .1)]
    Watch(PathBuf, #[source] notify::Error),
    /// The service has no entry in the mapping.
    #[error("service ({0}) not found in ports mapping file")]
    ServiceNotFound(String),
    /// The service has an entry with no ports.
    #[error(transparent)]
    EmptyPortList(#[from] EmptyPortList),
}

/// Service name to port rotation table, backed by a watched file.
#[derive(Debug)]
pub struct ServiceMapping {
    path: PathBuf,
    table: RwLock<HashMap<String, PortCursor>>,
    watcher: Mutex<Option<RecommendedWatcher>>,
    watching: AtomicBool,
    // Bumped whenever the watcher is replaced or closed. Only the reload
    // task of the current generation may report the watch as lost.
    generation: AtomicU64,
}

impl ServiceMapping {
    /// Create a mapping for `path` and load it. Fails if the initial load
    /// fails. No watch is set up; see [`ServiceMapping::watch_file`].
    pub fn new(path: impl Into<PathBuf>) -> Result<Arc<Self>, MappingError> {
        let mapping = Arc::new(Self {
            path: path.into(),
            table: RwLock::new(HashMap::new()),
            watcher: Mutex::new(None),
            watching: AtomicBool::new(false),
            generation: AtomicU64::new(0),
        });
        mapping.load()?;
        Ok(mapping)
    }

    /// The path of the mapping file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Read and parse the mapping file, then replace the table with its
    /// contents. On any error the table is left as it was.
    pub fn load(&self) -> Result<(), MappingError> {
        let data = std::fs::read_to_string(&self.path).map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                MappingError::FileNotFound(self.path.clone())
            } else {
                MappingError::Io(self.path.clone(), e)
            }
        })?;
        // A file being rewritten in place is briefly empty.
        if data.trim().is_empty() {
            return Err(MappingError::Parse(self.path.clone(), "empty file".into()));
        }
        let doc: MappingDocument = serde_yaml::from_str(&data)
            .map_err(|e| MappingError::Parse(self.path.clone(), e.to_string()))?;
        let table = doc
            .ports
            .into_iter()
            .map(|(name, entry)| (name, PortCursor::new(entry.items)))
            .collect::<HashMap<_, _>>();
        log::debug!(
            "{}: loaded ports for {} services",
            self.path.display(),
            table.len()
        );
        *self.table.write().unwrap_or_else(PoisonError::into_inner) = table;
        Ok(())
    }

    /// Return the next port for `service` in its rotation.
    ///
    /// Lookup and advance happen under one exclusive lock, so concurrent
    /// callers never see the same position twice.
    pub fn get_service_next_port(&self, service: &str) -> Result<u16, MappingError> {
        let mut table = self.table.write().unwrap_or_else(PoisonError::into_inner);
        let cursor = table
            .get_mut(service)
            .ok_or_else(|| MappingError::ServiceNotFound(service.to_owned()))?;
        Ok(cursor.next()?)
    }

    /// The ports currently listed for `service`.
    pub fn ports(&self, service: &str) -> Option<Vec<u16>> {
        self.table
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(service)
            .map(|c| c.ports().to_vec())
    }

    fn watch_dir(&self) -> &Path {
        match self.path.parent() {
            Some(p) if !p.as_os_str().is_empty() => p,
            _ => Path::new("."),
        }
    }

    fn is_relevant(event: &Event, file_name: &Option<OsString>) -> bool {
        let kind_matches = match event.kind {
            EventKind::Create(_) => true,
            EventKind::Modify(ModifyKind::Metadata(_)) => false,
            EventKind::Modify(_) => true,
            EventKind::Access(AccessKind::Close(AccessMode::Write)) => true,
            _ => false,
        };
        kind_matches
            && event
                .paths
                .iter()
                .any(|p| p.file_name().map(ToOwned::to_owned) == *file_name)
    }

    /// Start following changes to the mapping file.
    ///
    /// The directory containing the file is watched so that the file being
    /// replaced by rename is noticed too. Every write or create event for the
    /// file triggers [`ServiceMapping::load`] on a background task. Reload
    /// errors are logged and otherwise ignored.
    ///
    /// Must be called from within a tokio runtime.
    pub fn watch_file(self: &Arc<Self>) -> Result<(), MappingError> {
        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
        let mut watcher = notify::recommended_watcher(move |res: notify::Result<Event>| {
            let _ = tx.send(res);
        })
        .map_err(|e| MappingError::Watch(self.path.clone(), e))?;
        watcher
            .watch(self.watch_dir(), RecursiveMode::NonRecursive)
            .map_err(|e| MappingError::Watch(self.path.clone(), e))?;

        let mut slot = self.watcher.lock().unwrap_or_else(PoisonError::into_inner);
        let generation = self.generation.fetch_add(1, Ordering::AcqRel) + 1;
        if let Some(mut old) = slot.replace(watcher) {
            let _ = old.unwatch(self.watch_dir());
        }
        self.watching.store(true, Ordering::Release);
        drop(slot);

        let file_name = self.path.file_name().map(ToOwned::to_owned);
        let weak = Arc::downgrade(self);
        tokio::task::spawn(async move {
            while let Some(res) = rx.recv().await {
                let Some(mapping) = weak.upgrade() else {
                    return;
                };
                match res {
                    Ok(event) if Self::is_relevant(&event, &file_name) => {
                        log::debug!(
                            "{}: file event {:?}, reloading",
                            mapping.path.display(),
                            event.kind
                        );
                        if let Err(e) = mapping.load() {
                            log::warn!("{}: reload failed: {}", mapping.path.display(), e);
                        }
                    }
                    Ok(_) => (),
                    Err(e) => {
                        log::warn!("{}: watch error: {}", mapping.path.display(), e);
                    }
                }
            }
            if let Some(mapping) = weak.upgrade() {
                let _slot = mapping
                    .watcher
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner);
                if mapping.generation.load(Ordering::Acquire) == generation
                    && mapping.watching.swap(false, Ordering::AcqRel)
                {
                    log::warn!(
                        "{}: watcher stopped, mapping will no longer be reloaded",
                        mapping.path.display()
                    );
                }
            }
        });
        Ok(())
    }

    /// Whether changes to the file are currently being followed.
    pub fn is_watching(&self) -> bool {
        self.watching.load(Ordering::Acquire)
    }

    /// Stop following changes to the file. Failures are logged.
    pub fn close(&self) {
        let watcher = {
            let mut slot = self.watcher.lock().unwrap_or_else(PoisonError::into_inner);
            self.generation.fetch_add(1, Ordering::AcqRel);
            self.watching.store(false, Ordering::Release);
            slot.take()
        };
        if let Some(mut watcher) = watcher {
            if let Err(e) = watcher.unwatch(self.watch_dir()) {
                log::warn!("{}: failed to stop watching: {}", self.path.display(), e);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::testutil::write_mapping;

    #[test]
    fn load_and_rotate() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_mapping(dir.path(), &[("echo", &[5001, 5002]), ("solo", &[7000])]);
        let m = ServiceMapping::new(&path).unwrap();
        assert_eq!(m.get_service_next_port("echo").unwrap(), 5001);
        assert_eq!(m.get_service_next_port("echo").unwrap(), 5002);
        assert_eq!(m.get_service_next_port("solo").unwrap(), 7000);
        assert_eq!(m.get_service_next_port("echo").unwrap(), 5001);
    }

    #[test]
    fn missing_file() {
        let dir = tempfile::tempdir().unwrap();
        assert_matches!(
            ServiceMapping::new(dir.path().join("services.yml")),
            Err(MappingError::FileNotFound(_))
        );
    }

    #[test]
    fn unknown_service_and_empty_ports() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_mapping(dir.path(), &[("empty", &[])]);
        let m = ServiceMapping::new(&path).unwrap();
        assert_matches!(
            m.get_service_next_port("other"),
            Err(MappingError::ServiceNotFound(s)) if s == "other"
        );
        assert_matches!(
            m.get_service_next_port("empty"),
            Err(MappingError::EmptyPortList(_))
        );
    }

    #[test]
    fn failed_reload_keeps_table() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_mapping(dir.path(), &[("echo", &[1, 2, 3])]);
        let m = ServiceMapping::new(&path).unwrap();
        assert_eq!(m.get_service_next_port("echo").unwrap(), 1);

        std::fs::write(&path, "ports: [unterminated").unwrap();
        let e = m.load().unwrap_err();
        assert_matches!(e, MappingError::Parse(..));
        assert!(
            e.to_string()
                .starts_with(&format!("parsing ports mapping file {}: ", path.display())),
            "{}",
            e
        );
        assert_eq!(m.get_service_next_port("echo").unwrap(), 2);

        std::fs::write(&path, "").unwrap();
        assert_matches!(m.load(), Err(MappingError::Parse(..)));
        assert_eq!(m.ports("echo"), Some(vec![1, 2, 3]));

        std::fs::remove_file(&path).unwrap();
        assert_matches!(m.load(), Err(MappingError::FileNotFound(_)));
        assert_eq!(m.ports("echo"), Some(vec![1, 2, 3]));

        write_mapping(dir.path(), &[("echo", &[9])]);
        m.load().unwrap();
        assert_eq!(m.get_service_next_port("echo").unwrap(), 9);
        assert_eq!(m.get_service_next_port("echo").unwrap(), 9);
    }

    #[test]
    fn concurrent_rotation_is_fair() {
        const THREADS: usize = 8;
        const CALLS: usize = 300;
        let dir = tempfile::tempdir().unwrap();
        let path = write_mapping(dir.path(), &[("echo", &[1, 2, 3])]);
        let m = ServiceMapping::new(&path).unwrap();
        let mut counts = HashMap::new();
        std::thread::scope(|s| {
            let handles = (0..THREADS)
                .map(|_| {
                    s.spawn(|| {
                        (0..CALLS)
                            .map(|_| m.get_service_next_port("echo").unwrap())
                            .collect::<Vec<_>>()
                    })
                })
                .collect::<Vec<_>>();
            for h in handles {
                for port in h.join().unwrap() {
                    *counts.entry(port).or_insert(0usize) += 1;
                }
            }
        });
        let each = THREADS * CALLS / 3;
        assert_eq!(counts, HashMap::from([(1, each), (2, each), (3, each)]));
    }

    #[tokio::test]
    async fn watcher_follows_changes() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_mapping(dir.path(), &[("echo", &[1])]);
        let m = ServiceMapping::new(&path).unwrap();
        m.watch_file().unwrap();
        assert!(m.is_watching());

        write_mapping(dir.path(), &[("echo", &[2, 3])]);
        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        while m.ports("echo") != Some(vec![2, 3]) {
            assert!(
                tokio::time::Instant::now() < deadline,
                "mapping was not reloaded"
            );
            tokio::time::sleep(Duration::from_millis(20)).await;
        }

        // Unrelated files in the same directory are ignored.
        std::fs::write(dir.path().join("other.yml"), "garbage: [").unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(m.ports("echo"), Some(vec![2, 3]));

        m.close();
        assert!(!m.is_watching());
    }

    #[tokio::test]
    async fn rewatching_keeps_health_signal() {
        testing_logger::setup();
        let dir = tempfile::tempdir().unwrap();
        let path = write_mapping(dir.path(), &[("echo", &[1])]);
        let m = ServiceMapping::new(&path).unwrap();
        m.watch_file().unwrap();
        m.watch_file().unwrap();
        // Let the replaced watcher's task observe its channel closing.
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert!(m.is_watching());

        write_mapping(dir.path(), &[("echo", &[2])]);
        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        while m.ports("echo") != Some(vec![2]) {
            assert!(
                tokio::time::Instant::now() < deadline,
                "mapping was not reloaded"
            );
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert!(m.is_watching());

        m.close();
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(!m.is_watching());
        testing_logger::validate(|captured_logs| {
            assert!(
                !captured_logs
                    .iter()
                    .any(|l| l.body.contains("watcher stopped"))
            );
        });
    }
}
