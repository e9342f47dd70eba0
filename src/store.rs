//! The storage engine: a bounded in-memory table with LRU eviction into a
//! flat on-disk log, on-demand restore, and a periodic background flush.
//!
//! One readers/writer lock guards all shared state. `GET` probes under the
//! read lock and re-acquires in write mode to touch the recency order;
//! `SET`/`DEL` hold write mode for the whole operation including eviction.
//! The flush worker snapshots under the write lock and performs file I/O
//! with no lock held.

use std::collections::{HashMap, HashSet};
use std::io;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use bytes::Bytes;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, warn};

use crate::lru::LruList;
use crate::persist::PersistLog;

pub struct StoreOptions {
    /// Maximum number of resident keys before the LRU tail spills to disk.
    pub capacity: usize,
    /// How often the background worker flushes dirty state to the file.
    pub flush_interval: Duration,
    /// Path of the persistence file.
    pub persist_path: PathBuf,
}

impl Default for StoreOptions {
    fn default() -> StoreOptions {
        StoreOptions {
            capacity: 10_000,
            flush_interval: Duration::from_secs(10),
            persist_path: PathBuf::from("flush_data.txt"),
        }
    }
}

/// Cheaply cloneable handle to the shared engine state. All clones observe
/// the same data; the background flush worker holds one internally.
#[derive(Clone)]
pub struct Store {
    shared: Arc<Shared>,
}

struct Shared {
    state: RwLock<State>,
    log: PersistLog,
    capacity: usize,
    shutdown: watch::Sender<bool>,
    flusher: Mutex<Option<JoinHandle<()>>>,
}

struct State {
    resident: HashMap<String, Bytes>,
    lru: LruList,
    evicted: HashMap<String, Spill>,
    dirty: bool,
}

/// Where an evicted record's bytes currently live.
enum Spill {
    /// Evicted but not yet flushed; the value is held until it reaches disk.
    Pending(Bytes),
    /// A past flush wrote the record; the file is the only copy.
    OnDisk,
}

impl Store {
    /// Opens the engine: loads any existing persistence file (respecting the
    /// capacity bound) and starts the background flush worker. Must be
    /// called from within a tokio runtime.
    pub fn open(options: StoreOptions) -> crate::Result<Store> {
        let capacity = options.capacity.max(1);
        let log = PersistLog::new(options.persist_path);

        let mut state = State {
            resident: HashMap::new(),
            lru: LruList::new(),
            evicted: HashMap::new(),
            dirty: false,
        };

        for record in log.scan()? {
            match record {
                Ok((key, value)) => state.insert(key, value, capacity),
                Err(err) => warn!(error = %err, "skipping unreadable persistence record"),
            }
        }
        // Every loaded record, including any that overflowed straight into
        // the marker set, is already present in the file.
        for spill in state.evicted.values_mut() {
            *spill = Spill::OnDisk;
        }
        state.dirty = false;

        let (shutdown, shutdown_rx) = watch::channel(false);
        let shared = Arc::new(Shared {
            state: RwLock::new(state),
            log,
            capacity,
            shutdown,
            flusher: Mutex::new(None),
        });

        let worker = tokio::spawn(run_flusher(
            Arc::clone(&shared),
            options.flush_interval,
            shutdown_rx,
        ));
        *shared.flusher.lock().unwrap() = Some(worker);

        Ok(Store { shared })
    }

    /// Inserts or replaces a record. Never fails; capacity pressure evicts
    /// the least-recently-used key into the marker set.
    pub fn set(&self, key: String, value: Bytes) {
        let mut state = self.shared.state.write().unwrap();
        state.insert(key, value, self.shared.capacity);
        state.dirty = true;
    }

    /// Looks a key up, touching the recency order on a hit and restoring
    /// evicted records on demand.
    pub fn get(&self, key: &str) -> Option<Bytes> {
        {
            let state = self.shared.state.read().unwrap();
            if !state.resident.contains_key(key) && !state.evicted.contains_key(key) {
                return None;
            }
        }

        // Re-acquire in write mode for the LRU touch. A SET or DEL may slip
        // in between the two sections; either is an acceptable predecessor,
        // so the re-check below simply observes whichever state won.
        let mut state = self.shared.state.write().unwrap();

        if let Some(value) = state.resident.get(key).cloned() {
            state.lru.touch(key);
            return Some(value);
        }

        let spilled = match state.evicted.get(key) {
            Some(Spill::Pending(value)) => Some(value.clone()),
            Some(Spill::OnDisk) => None,
            None => return None,
        };

        match spilled {
            // The record never reached the file; promote straight from
            // memory.
            Some(value) => {
                state.insert(key.to_string(), value.clone(), self.shared.capacity);
                Some(value)
            }
            None => match self.shared.log.lookup(key) {
                Ok(Some(value)) => {
                    debug!(key, "restored record from disk");
                    state.insert(key.to_string(), value.clone(), self.shared.capacity);
                    Some(value)
                }
                Ok(None) => {
                    // Stale marker; nothing on disk to restore.
                    state.evicted.remove(key);
                    None
                }
                Err(err) => {
                    // Keep the marker so a later read can retry the restore.
                    warn!(key, error = %err, "disk restore failed");
                    None
                }
            },
        }
    }

    /// Removes a key from the resident set, the recency order and the
    /// eviction markers. Returns whether the key existed anywhere, so a
    /// deleted key can never resurrect from a stale log record.
    pub fn del(&self, key: &str) -> bool {
        let mut state = self.shared.state.write().unwrap();

        let was_resident = state.resident.remove(key).is_some();
        if was_resident {
            state.lru.remove(key);
        }
        let was_marked = state.evicted.remove(key).is_some();

        if was_resident || was_marked {
            state.dirty = true;
            true
        } else {
            false
        }
    }

    /// Writes dirty state to the persistence file. A clean engine is a
    /// no-op, which also makes back-to-back flushes byte-identical.
    pub fn flush(&self) -> io::Result<()> {
        self.shared.flush()
    }

    /// Deletes the persistence file.
    pub fn clear_persistence(&self) -> io::Result<()> {
        self.shared.log.remove()
    }

    /// Stops the background worker, which performs one final flush before
    /// exiting, and waits for it to finish.
    pub async fn shutdown(&self) {
        let _ = self.shared.shutdown.send(true);
        let worker = self.shared.flusher.lock().unwrap().take();
        if let Some(worker) = worker {
            let _ = worker.await;
        }
    }

    pub fn resident_len(&self) -> usize {
        self.shared.state.read().unwrap().resident.len()
    }

    pub fn is_resident(&self, key: &str) -> bool {
        self.shared.state.read().unwrap().resident.contains_key(key)
    }

    pub fn is_evicted(&self, key: &str) -> bool {
        self.shared.state.read().unwrap().evicted.contains_key(key)
    }
}

impl State {
    /// Puts a record into the resident set at the front of the recency
    /// order, scrubbing any eviction marker for the key and spilling the
    /// LRU tail if the capacity bound is exceeded.
    fn insert(&mut self, key: String, value: Bytes, capacity: usize) {
        self.evicted.remove(&key);
        self.lru.touch(&key);
        self.resident.insert(key, value);

        if self.lru.len() > capacity {
            if let Some(victim) = self.lru.pop_back() {
                if let Some(value) = self.resident.remove(&victim) {
                    self.evicted.insert(victim, Spill::Pending(value));
                }
                self.dirty = true;
            }
        }
    }
}

impl Shared {
    /// Snapshot-and-clear under the write lock, then write the file with no
    /// lock held. The snapshot is the resident set plus every evicted
    /// record, so a marked key is always findable in the file after a
    /// flush; records already on disk are carried over from the previous
    /// file image.
    fn flush(&self) -> io::Result<()> {
        let (mut records, pending, carry) = {
            let mut state = self.state.write().unwrap();
            if !state.dirty {
                return Ok(());
            }
            state.dirty = false;

            let records: Vec<(String, Bytes)> = state
                .resident
                .iter()
                .map(|(key, value)| (key.clone(), value.clone()))
                .collect();

            let mut pending = Vec::new();
            let mut carry = HashSet::new();
            for (key, spill) in &state.evicted {
                match spill {
                    Spill::Pending(value) => pending.push((key.clone(), value.clone())),
                    Spill::OnDisk => {
                        carry.insert(key.clone());
                    }
                }
            }
            (records, pending, carry)
        };

        let result = (|| {
            records.extend(pending.iter().cloned());
            if !carry.is_empty() {
                for record in self.log.scan()? {
                    match record {
                        Ok((key, value)) if carry.contains(&key) => records.push((key, value)),
                        Ok(_) => {}
                        Err(err) => warn!(error = %err, "dropping unreadable record at flush"),
                    }
                }
            }
            // Sorted output keeps the file deterministic across flushes.
            records.sort_by(|a, b| a.0.cmp(&b.0));
            self.log.rewrite(&records)
        })();

        match result {
            Ok(()) => {
                let mut state = self.state.write().unwrap();
                for (key, value) in pending {
                    if let Some(spill) = state.evicted.get_mut(&key) {
                        // Only promote if the record we wrote is still the
                        // current one; a re-eviction during the write holds
                        // a newer value that the next flush must persist.
                        if matches!(spill, Spill::Pending(current) if *current == value) {
                            *spill = Spill::OnDisk;
                        }
                    }
                }
                Ok(())
            }
            Err(err) => {
                self.state.write().unwrap().dirty = true;
                Err(err)
            }
        }
    }
}

impl Drop for Shared {
    fn drop(&mut self) {
        // Best-effort durability if the engine is dropped without shutdown.
        let dirty = self.state.read().map(|state| state.dirty).unwrap_or(false);
        if dirty {
            if let Err(err) = self.flush() {
                error!(error = %err, "final flush on drop failed");
            }
        }
    }
}

async fn run_flusher(
    shared: Arc<Shared>,
    interval: Duration,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    // The first tick completes immediately; nothing is dirty yet.
    ticker.tick().await;

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                if let Err(err) = shared.flush() {
                    warn!(error = %err, "periodic flush failed; retrying at next tick");
                }
            }
            _ = shutdown.changed() => break,
        }
    }

    if let Err(err) = shared.flush() {
        error!(error = %err, "final flush failed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn open_store(dir: &TempDir, capacity: usize) -> Store {
        Store::open(StoreOptions {
            capacity,
            // Long enough that tests control every flush themselves.
            flush_interval: Duration::from_secs(3600),
            persist_path: dir.path().join("flush_data.txt"),
        })
        .unwrap()
    }

    fn bytes(value: &str) -> Bytes {
        Bytes::copy_from_slice(value.as_bytes())
    }

    #[tokio::test]
    async fn set_then_get_returns_value() {
        let dir = TempDir::new().unwrap();
        let store = open_store(&dir, 10);

        store.set("foo".to_string(), bytes("bar"));

        assert_eq!(store.get("foo"), Some(bytes("bar")));
        assert_eq!(store.get("missing"), None);
    }

    #[tokio::test]
    async fn set_replaces_existing_value() {
        let dir = TempDir::new().unwrap();
        let store = open_store(&dir, 10);

        store.set("foo".to_string(), bytes("old"));
        store.set("foo".to_string(), bytes("new"));

        assert_eq!(store.get("foo"), Some(bytes("new")));
        assert_eq!(store.resident_len(), 1);
    }

    #[tokio::test]
    async fn empty_values_are_storable() {
        let dir = TempDir::new().unwrap();
        let store = open_store(&dir, 10);

        store.set("foo".to_string(), Bytes::new());

        assert_eq!(store.get("foo"), Some(Bytes::new()));
    }

    #[tokio::test]
    async fn del_reports_presence() {
        let dir = TempDir::new().unwrap();
        let store = open_store(&dir, 10);

        store.set("foo".to_string(), bytes("bar"));

        assert!(store.del("foo"));
        assert!(!store.del("foo"));
        assert_eq!(store.get("foo"), None);
    }

    #[tokio::test]
    async fn overflow_evicts_least_recently_used_key() {
        let dir = TempDir::new().unwrap();
        let store = open_store(&dir, 3);

        store.set("a".to_string(), bytes("1"));
        store.set("b".to_string(), bytes("2"));
        store.set("c".to_string(), bytes("3"));
        store.set("d".to_string(), bytes("4"));

        assert_eq!(store.resident_len(), 3);
        assert!(!store.is_resident("a"));
        assert!(store.is_evicted("a"));
        assert!(store.is_resident("d"));
    }

    #[tokio::test]
    async fn get_refreshes_recency_so_another_key_is_evicted() {
        let dir = TempDir::new().unwrap();
        let store = open_store(&dir, 3);

        store.set("a".to_string(), bytes("1"));
        store.set("b".to_string(), bytes("2"));
        store.set("c".to_string(), bytes("3"));

        // Order is now c, b, a; reads reshuffle it to b, a, c.
        store.get("a");
        store.get("a");
        store.get("b");

        store.set("d".to_string(), bytes("4"));
        assert!(store.is_evicted("c"));

        store.set("e".to_string(), bytes("5"));
        assert!(store.is_evicted("a"));
    }

    #[tokio::test]
    async fn evicted_key_is_restored_after_flush() {
        let dir = TempDir::new().unwrap();
        let store = open_store(&dir, 3);

        store.set("a".to_string(), bytes("1"));
        store.set("b".to_string(), bytes("2"));
        store.set("c".to_string(), bytes("3"));
        store.set("d".to_string(), bytes("4"));
        store.flush().unwrap();

        assert_eq!(store.get("a"), Some(bytes("1")));
        assert!(store.is_resident("a"));
        assert!(!store.is_evicted("a"));
        // Restoring into a full table pushed out the current tail.
        assert_eq!(store.resident_len(), 3);
        assert!(store.is_evicted("b"));
    }

    #[tokio::test]
    async fn evicted_key_is_readable_before_any_flush() {
        let dir = TempDir::new().unwrap();
        let store = open_store(&dir, 2);

        store.set("a".to_string(), bytes("1"));
        store.set("b".to_string(), bytes("2"));
        store.set("c".to_string(), bytes("3"));

        assert!(store.is_evicted("a"));
        assert_eq!(store.get("a"), Some(bytes("1")));
    }

    #[tokio::test]
    async fn del_scrubs_eviction_marker() {
        let dir = TempDir::new().unwrap();
        let store = open_store(&dir, 3);

        store.set("a".to_string(), bytes("1"));
        store.set("b".to_string(), bytes("2"));
        store.set("c".to_string(), bytes("3"));
        store.set("d".to_string(), bytes("4"));
        store.flush().unwrap();

        assert!(store.is_evicted("a"));
        assert!(store.del("a"));

        // The log still holds a record for `a` until the next flush, but the
        // key must stay dead.
        assert_eq!(store.get("a"), None);
        assert!(!store.is_evicted("a"));
    }

    #[tokio::test]
    async fn set_scrubs_eviction_marker() {
        let dir = TempDir::new().unwrap();
        let store = open_store(&dir, 2);

        store.set("a".to_string(), bytes("1"));
        store.set("b".to_string(), bytes("2"));
        store.set("c".to_string(), bytes("3"));
        assert!(store.is_evicted("a"));

        store.set("a".to_string(), bytes("fresh"));

        assert!(store.is_resident("a"));
        assert!(!store.is_evicted("a"));
        assert_eq!(store.get("a"), Some(bytes("fresh")));
    }

    #[tokio::test]
    async fn stale_marker_is_dropped_when_log_lacks_the_key() {
        let dir = TempDir::new().unwrap();
        let store = open_store(&dir, 2);

        store.set("a".to_string(), bytes("1"));
        store.set("b".to_string(), bytes("2"));
        store.set("c".to_string(), bytes("3"));
        store.flush().unwrap();

        // The flush moved the marker for `a` to the disk tier; blow the
        // file away behind the engine's back.
        assert!(store.is_evicted("a"));
        store.clear_persistence().unwrap();

        assert_eq!(store.get("a"), None);
        assert!(!store.is_evicted("a"));
    }

    #[tokio::test]
    async fn flush_is_idempotent() {
        let dir = TempDir::new().unwrap();
        let store = open_store(&dir, 10);

        store.set("foo".to_string(), bytes("bar"));
        store.set("baz".to_string(), bytes("qux"));

        store.flush().unwrap();
        let first = std::fs::read(dir.path().join("flush_data.txt")).unwrap();

        store.flush().unwrap();
        let second = std::fs::read(dir.path().join("flush_data.txt")).unwrap();

        assert_eq!(first, second);
    }

    #[tokio::test]
    async fn flush_preserves_evicted_records_across_rewrites() {
        let dir = TempDir::new().unwrap();
        let store = open_store(&dir, 2);

        store.set("a".to_string(), bytes("1"));
        store.set("b".to_string(), bytes("2"));
        store.set("c".to_string(), bytes("3"));
        store.flush().unwrap();

        // A later mutation triggers a second rewrite; the record for the
        // still-evicted key must be carried over, not dropped.
        store.set("d".to_string(), bytes("4"));
        store.flush().unwrap();

        assert!(store.is_evicted("a"));
        assert_eq!(store.get("a"), Some(bytes("1")));
    }

    #[tokio::test]
    async fn reopen_recovers_flushed_records() {
        let dir = TempDir::new().unwrap();
        {
            let store = open_store(&dir, 10);
            store.set("foo".to_string(), bytes("bar"));
            store.set("gone".to_string(), bytes("soon"));
            store.flush().unwrap();
            store.del("gone");
            store.flush().unwrap();
            store.shutdown().await;
        }

        let store = open_store(&dir, 10);
        assert_eq!(store.get("foo"), Some(bytes("bar")));
        assert_eq!(store.get("gone"), None);
    }

    #[tokio::test]
    async fn shutdown_performs_final_flush() {
        let dir = TempDir::new().unwrap();
        {
            let store = open_store(&dir, 10);
            store.set("foo".to_string(), bytes("bar"));
            store.shutdown().await;
        }

        let store = open_store(&dir, 10);
        assert_eq!(store.get("foo"), Some(bytes("bar")));
    }

    #[tokio::test]
    async fn reopen_respects_capacity_bound() {
        let dir = TempDir::new().unwrap();
        {
            let store = open_store(&dir, 10);
            for i in 0..10 {
                store.set(format!("key{i}"), bytes("value"));
            }
            store.shutdown().await;
        }

        let store = open_store(&dir, 3);
        assert_eq!(store.resident_len(), 3);
        // Overflow at load time becomes disk-backed markers, so every
        // record is still reachable.
        for i in 0..10 {
            assert_eq!(store.get(&format!("key{i}")), Some(bytes("value")));
        }
    }

    #[tokio::test]
    async fn periodic_flush_fires_without_explicit_flush() {
        let dir = TempDir::new().unwrap();
        let store = Store::open(StoreOptions {
            capacity: 10,
            flush_interval: Duration::from_millis(50),
            persist_path: dir.path().join("flush_data.txt"),
        })
        .unwrap();

        store.set("foo".to_string(), bytes("bar"));
        tokio::time::sleep(Duration::from_millis(200)).await;

        let raw = std::fs::read(dir.path().join("flush_data.txt")).unwrap();
        assert_eq!(raw, b"foo\tbar\n");
        store.shutdown().await;
    }
}
