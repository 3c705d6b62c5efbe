//! The process-wide mock registry.
//!
//! Holds the current record set as an immutable snapshot. Requests clone the
//! snapshot; reloads and control updates publish a new one.

use crate::cache::{merge, MockCache};
use crate::config::MockManagerConfig;
use crate::control::{control_records, RecordUpdate};
use crate::editor::{CommandEditor, EditorLauncher, SourceLocation};
use crate::error::{CacheError, LoadError};
use crate::loader::MockLoader;
use crate::matcher::Matcher;
use crate::record::{MockRecord, RecordSet};
use chrono::Utc;
use parking_lot::RwLock;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

/// Capacity of the event channel; slow subscribers miss older events.
const EVENT_CAPACITY: usize = 256;

/// Notifications published by the registry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MockEvent {
    /// A request was served by a record
    Matched { id: String, control: bool },
    /// A reload published a new record set
    Reloaded { records: usize },
}

/// Counts produced by one reload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReloadSummary {
    pub records: usize,
    pub added: usize,
    pub removed: usize,
}

/// One consistent view of records and their compiled routes.
#[derive(Clone)]
pub(crate) struct RegistryState {
    pub(crate) records: Arc<RecordSet>,
    pub(crate) matcher: Arc<Matcher>,
    pub(crate) update_time: Option<i64>,
}

/// Owns the record set and everything that mutates it.
pub struct MockRegistry {
    config: MockManagerConfig,
    cwd: PathBuf,
    loader: MockLoader,
    cache: MockCache,
    control: Vec<MockRecord>,
    state: RwLock<Arc<RegistryState>>,
    /// Serializes reloads
    reload_lock: tokio::sync::Mutex<()>,
    /// Serializes cache writes
    persist_lock: tokio::sync::Mutex<()>,
    events: broadcast::Sender<MockEvent>,
    editor: Arc<dyn EditorLauncher>,
    /// Total requests dispatched.
    requests_total: AtomicU64,
    /// Total requests served by a record.
    requests_matched: AtomicU64,
}

impl MockRegistry {
    /// Create a registry seeded from the cache file.
    ///
    /// Restored records only carry metadata; nothing is routable until the
    /// first [`reload`](Self::reload).
    pub fn new(cwd: &Path, config: MockManagerConfig) -> Self {
        let cache = MockCache::new(&config.cache_dir(cwd));
        let (records, update_time) = match cache.load() {
            Ok(restored) => restored,
            Err(e) => {
                warn!(error = %e, "Ignoring unreadable mock cache");
                (RecordSet::new(), None)
            }
        };
        let control = control_records(&config.control_base());
        let matcher = Matcher::new(&records, &control, &config.prefix);
        let (events, _) = broadcast::channel(EVENT_CAPACITY);

        info!(
            cached = records.len(),
            prefix = %config.prefix,
            control = %config.control_base(),
            "Mock registry initialized"
        );
        if config.auto_disable_umi_mock {
            info!("autoDisableUmiMock is set, the host's own mock middleware should be disabled");
        }

        Self {
            loader: MockLoader::new(cwd, &config),
            editor: Arc::new(CommandEditor::new(config.editor.clone(), cwd)),
            cwd: cwd.to_path_buf(),
            cache,
            control,
            state: RwLock::new(Arc::new(RegistryState {
                records: Arc::new(records),
                matcher: Arc::new(matcher),
                update_time,
            })),
            reload_lock: tokio::sync::Mutex::new(()),
            persist_lock: tokio::sync::Mutex::new(()),
            events,
            config,
            requests_total: AtomicU64::new(0),
            requests_matched: AtomicU64::new(0),
        }
    }

    /// Use a different editor launcher.
    pub fn with_editor(mut self, editor: Arc<dyn EditorLauncher>) -> Self {
        self.editor = editor;
        self
    }

    /// Use a different loader, for example one with a custom evaluator.
    pub fn with_loader(mut self, loader: MockLoader) -> Self {
        self.loader = loader;
        self
    }

    pub fn config(&self) -> &MockManagerConfig {
        &self.config
    }

    pub fn cwd(&self) -> &Path {
        &self.cwd
    }

    pub fn loader(&self) -> &MockLoader {
        &self.loader
    }

    /// Built-in control records.
    pub fn control(&self) -> &[MockRecord] {
        &self.control
    }

    /// Current user records.
    pub fn records(&self) -> Arc<RecordSet> {
        self.state.read().records.clone()
    }

    /// Time of the last control update, in milliseconds since the epoch.
    pub fn last_update(&self) -> Option<i64> {
        self.state.read().update_time
    }

    pub fn subscribe(&self) -> broadcast::Receiver<MockEvent> {
        self.events.subscribe()
    }

    /// Get total requests dispatched.
    pub fn total_requests(&self) -> u64 {
        self.requests_total.load(Ordering::Relaxed)
    }

    /// Get total requests served by a record.
    pub fn total_matched(&self) -> u64 {
        self.requests_matched.load(Ordering::Relaxed)
    }

    pub(crate) fn snapshot(&self) -> Arc<RegistryState> {
        self.state.read().clone()
    }

    pub(crate) fn record_request(&self, matched: Option<(&str, bool)>) {
        self.requests_total.fetch_add(1, Ordering::Relaxed);
        if let Some((id, control)) = matched {
            self.requests_matched.fetch_add(1, Ordering::Relaxed);
            self.publish(MockEvent::Matched {
                id: id.to_string(),
                control,
            });
        }
    }

    fn publish(&self, event: MockEvent) {
        // No subscribers is fine
        let _ = self.events.send(event);
    }

    /// Reload every mock file, merge with the current set and persist.
    ///
    /// A load failure leaves the current set untouched. Reloads never run
    /// concurrently; the merge happens against the set that is current when
    /// loading finishes, so toggles made meanwhile are kept.
    pub async fn reload(&self) -> Result<ReloadSummary, LoadError> {
        let _guard = self.reload_lock.lock().await;

        let loader = self.loader.clone();
        let fresh = tokio::task::spawn_blocking(move || loader.load())
            .await
            .map_err(|e| LoadError::Join(e.to_string()))??;

        let summary = {
            let mut state = self.state.write();
            let added = fresh.ids().filter(|id| !state.records.contains(id)).count();
            let removed = state.records.ids().filter(|id| !fresh.contains(id)).count();
            let records = merge(&state.records, fresh);
            let matcher = Matcher::new(&records, &self.control, &self.config.prefix);
            let summary = ReloadSummary {
                records: records.len(),
                added,
                removed,
            };
            *state = Arc::new(RegistryState {
                records: Arc::new(records),
                matcher: Arc::new(matcher),
                update_time: state.update_time,
            });
            summary
        };

        if let Err(e) = self.persist().await {
            warn!(error = %e, "Failed to persist mock cache");
        }
        info!(
            records = summary.records,
            added = summary.added,
            removed = summary.removed,
            "Mock files reloaded"
        );
        self.publish(MockEvent::Reloaded {
            records: summary.records,
        });
        Ok(summary)
    }

    /// Apply enable flags in order, stamp the update time and persist.
    ///
    /// Unknown ids are ignored. Returns how many records were updated.
    pub async fn update(&self, updates: &[RecordUpdate]) -> Result<usize, CacheError> {
        let applied = {
            let mut guard = self.state.write();
            let state = Arc::make_mut(&mut *guard);
            let records = Arc::make_mut(&mut state.records);
            let mut applied = 0;
            for update in updates {
                match records.get_mut(&update.id) {
                    Some(record) => {
                        record.enable = update.enable;
                        applied += 1;
                    }
                    None => debug!(id = %update.id, "Ignoring update for unknown mock"),
                }
            }
            state.update_time = Some(Utc::now().timestamp_millis());
            applied
        };
        info!(requested = updates.len(), applied, "Mock records updated");
        self.persist().await?;
        Ok(applied)
    }

    /// Write the current set to the cache file on the blocking pool.
    ///
    /// Writers are serialized and each one snapshots the state after taking
    /// the lock, so the file always ends up with the latest set.
    pub async fn persist(&self) -> Result<(), CacheError> {
        let _guard = self.persist_lock.lock().await;
        let state = self.snapshot();
        let cache = self.cache.clone();
        tokio::task::spawn_blocking(move || cache.persist(&state.records, state.update_time))
            .await
            .map_err(|e| CacheError::Join(e.to_string()))?
    }

    pub fn open_in_editor(&self, location: &SourceLocation) {
        self.editor.open(location);
    }
}
