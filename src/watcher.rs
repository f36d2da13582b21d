//! Filesystem watcher for the vault's `Insights/` folder.
//!
//! Pipeline: a `notify` watcher thread forwards raw events over a bounded
//! channel to a single coordination task, which debounces them per path
//! and dispatches index mutations:
//!
//! ```text
//! notify thread → mpsc channel → coordination task → apply_mutation
//!                                 (debounce arena,
//!                                  single-flight per path)
//! ```
//!
//! Rapid saves of the same note coalesce into one mutation. A path whose
//! previous mutation is still running is re-armed instead of dispatched
//! again, so at most one mutation per path is in flight at a time.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use notify::event::{ModifyKind, RenameMode};
use notify::{EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::note::{is_insight_note, INSIGHTS_FOLDER};
use crate::store::InsightStore;
use crate::sync::{apply_mutation, Mutation};

const EVENT_CHANNEL_CAPACITY: usize = 512;

/// One classified filesystem change, pre-debounce.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FsChange {
    pub path: PathBuf,
    pub mutation: Mutation,
}

/// Map a raw `notify` event to index mutations.
///
/// Creates and modifications become upserts, removals become deletes, and
/// a rename decomposes into a delete of the source plus an upsert of the
/// destination. Events for paths outside `Insights/` (or non-markdown
/// files) are dropped here.
fn classify_event(event: &notify::Event, vault: &Path) -> Vec<FsChange> {
    let mut changes = Vec::new();
    let mut push = |path: &PathBuf, mutation: Mutation| {
        if is_insight_note(path, vault) {
            changes.push(FsChange {
                path: path.clone(),
                mutation,
            });
        }
    };

    match &event.kind {
        EventKind::Create(_) => {
            for path in &event.paths {
                push(path, Mutation::Upsert);
            }
        }
        EventKind::Remove(_) => {
            for path in &event.paths {
                push(path, Mutation::Delete);
            }
        }
        EventKind::Modify(ModifyKind::Name(mode)) => match mode {
            RenameMode::From => {
                for path in &event.paths {
                    push(path, Mutation::Delete);
                }
            }
            RenameMode::To => {
                for path in &event.paths {
                    push(path, Mutation::Upsert);
                }
            }
            // Both carries [source, dest]; platform-dependent Any may
            // report either end of the rename alone, so a lone path is
            // disambiguated by whether it still exists on disk
            _ => {
                if event.paths.len() == 2 {
                    push(&event.paths[0], Mutation::Delete);
                    push(&event.paths[1], Mutation::Upsert);
                } else {
                    for path in &event.paths {
                        let mutation = if path.exists() {
                            Mutation::Upsert
                        } else {
                            Mutation::Delete
                        };
                        push(path, mutation);
                    }
                }
            }
        },
        EventKind::Modify(_) => {
            for path in &event.paths {
                push(path, Mutation::Upsert);
            }
        }
        _ => {}
    }

    changes
}

/// Per-path debounce state. Arming a path replaces any pending entry, so
/// only the latest mutation within the quiet period survives.
pub struct DebounceArena {
    debounce: Duration,
    pending: HashMap<PathBuf, (Mutation, Instant)>,
}

impl DebounceArena {
    pub fn new(debounce: Duration) -> Self {
        Self {
            debounce,
            pending: HashMap::new(),
        }
    }

    /// Schedule (or reschedule) a mutation for `path`, due after the
    /// quiet period from `now`.
    pub fn arm(&mut self, path: PathBuf, mutation: Mutation, now: Instant) {
        self.pending.insert(path, (mutation, now + self.debounce));
    }

    /// Remove and return every entry whose quiet period has elapsed.
    pub fn take_due(&mut self, now: Instant) -> Vec<(PathBuf, Mutation)> {
        let due: Vec<PathBuf> = self
            .pending
            .iter()
            .filter(|(_, (_, deadline))| *deadline <= now)
            .map(|(path, _)| path.clone())
            .collect();

        due.into_iter()
            .map(|path| {
                let (mutation, _) = self.pending.remove(&path).unwrap();
                (path, mutation)
            })
            .collect()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }
}

struct WatcherHandle {
    // Held to keep the notify thread alive; dropping it stops the watch.
    _watcher: RecommendedWatcher,
    coordinator: JoinHandle<()>,
}

/// Watches a vault and keeps the index synchronized with its `Insights/`
/// folder.
///
/// `start`/`stop`/`restart` drive the lifecycle; the server's config
/// endpoint uses `restart` to repoint the watcher at a new vault without
/// restarting the process.
pub struct VaultWatcher {
    store: Arc<InsightStore>,
    vault: PathBuf,
    debounce: Duration,
    handle: Option<WatcherHandle>,
}

impl VaultWatcher {
    pub fn new(store: Arc<InsightStore>, vault: PathBuf, debounce: Duration) -> Self {
        Self {
            store,
            vault,
            debounce,
            handle: None,
        }
    }

    pub fn vault_path(&self) -> &Path {
        &self.vault
    }

    pub fn is_running(&self) -> bool {
        self.handle.is_some()
    }

    /// Begin watching. Creates the `Insights/` folder if absent. Calling
    /// `start` while already running is a no-op.
    pub fn start(&mut self) -> Result<()> {
        if self.handle.is_some() {
            return Ok(());
        }

        let insights_dir = self.vault.join(INSIGHTS_FOLDER);
        std::fs::create_dir_all(&insights_dir).with_context(|| {
            format!("Failed to create Insights folder: {}", insights_dir.display())
        })?;

        let (tx, rx) = mpsc::channel::<FsChange>(EVENT_CHANNEL_CAPACITY);
        let vault = self.vault.clone();

        // The notify callback runs on the watcher's own thread, hence
        // blocking_send into the async side.
        let mut watcher = notify::recommended_watcher(move |result: notify::Result<notify::Event>| {
            match result {
                Ok(event) => {
                    for change in classify_event(&event, &vault) {
                        if tx.blocking_send(change).is_err() {
                            return;
                        }
                    }
                }
                Err(e) => warn!("watch error: {}", e),
            }
        })?;

        watcher
            .watch(&self.vault, RecursiveMode::Recursive)
            .with_context(|| format!("Failed to watch vault: {}", self.vault.display()))?;

        let coordinator = tokio::spawn(coordinate(
            rx,
            self.store.clone(),
            self.vault.clone(),
            self.debounce,
        ));

        info!(vault = %self.vault.display(), "vault watcher started");
        self.handle = Some(WatcherHandle {
            _watcher: watcher,
            coordinator,
        });
        Ok(())
    }

    /// Stop watching. Pending debounced mutations are discarded;
    /// mutations already dispatched run to completion.
    pub fn stop(&mut self) {
        if let Some(handle) = self.handle.take() {
            handle.coordinator.abort();
            info!(vault = %self.vault.display(), "vault watcher stopped");
        }
    }

    /// Stop, repoint at `new_vault`, and start again.
    pub fn restart(&mut self, new_vault: PathBuf) -> Result<()> {
        self.stop();
        self.vault = new_vault;
        self.start()
    }
}

impl Drop for VaultWatcher {
    fn drop(&mut self) {
        self.stop();
    }
}

/// The single coordination task: drains the event channel into the
/// debounce arena and dispatches due mutations, one in flight per path.
async fn coordinate(
    mut rx: mpsc::Receiver<FsChange>,
    store: Arc<InsightStore>,
    vault: PathBuf,
    debounce: Duration,
) {
    let mut arena = DebounceArena::new(debounce);
    let mut in_flight: HashMap<PathBuf, JoinHandle<()>> = HashMap::new();
    let tick = debounce.min(Duration::from_millis(100)).max(Duration::from_millis(10));
    let mut interval = tokio::time::interval(tick);
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            change = rx.recv() => {
                let Some(change) = change else { break };
                debug!(path = %change.path.display(), mutation = ?change.mutation, "change armed");
                arena.arm(change.path, change.mutation, Instant::now());
            }
            _ = interval.tick() => {
                in_flight.retain(|_, handle| !handle.is_finished());

                let now = Instant::now();
                for (path, mutation) in arena.take_due(now) {
                    if in_flight.contains_key(&path) {
                        // Previous mutation still running: re-arm so it
                        // lands after the current one completes.
                        arena.arm(path, mutation, now);
                        continue;
                    }

                    let store = store.clone();
                    let vault = vault.clone();
                    let task_path = path.clone();
                    let handle = tokio::spawn(async move {
                        apply_mutation(&store, &vault, &task_path, mutation).await;
                    });
                    in_flight.insert(path, handle);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::test_support::StubEmbedder;
    use crate::vector::MemoryIndex;
    use notify::event::CreateKind;

    fn change_paths(changes: &[FsChange]) -> Vec<&Path> {
        changes.iter().map(|c| c.path.as_path()).collect()
    }

    #[test]
    fn classify_create_and_modify_as_upsert() {
        let vault = PathBuf::from("/vault");
        let event = notify::Event::new(EventKind::Create(CreateKind::File))
            .add_path(vault.join("Insights/a.md"));
        let changes = classify_event(&event, &vault);
        assert_eq!(changes.len(), 1);
        assert_eq!(changes[0].mutation, Mutation::Upsert);

        let event = notify::Event::new(EventKind::Modify(ModifyKind::Data(
            notify::event::DataChange::Content,
        )))
        .add_path(vault.join("Insights/a.md"));
        assert_eq!(classify_event(&event, &vault)[0].mutation, Mutation::Upsert);
    }

    #[test]
    fn classify_ignores_non_insights() {
        let vault = PathBuf::from("/vault");
        let event = notify::Event::new(EventKind::Create(CreateKind::File))
            .add_path(vault.join("Questions/why.md"))
            .add_path(vault.join("Insights/pic.png"));
        assert!(classify_event(&event, &vault).is_empty());
    }

    #[test]
    fn classify_rename_decomposes() {
        let vault = PathBuf::from("/vault");
        let event = notify::Event::new(EventKind::Modify(ModifyKind::Name(RenameMode::Both)))
            .add_path(vault.join("Insights/old.md"))
            .add_path(vault.join("Insights/new.md"));

        let changes = classify_event(&event, &vault);
        assert_eq!(
            change_paths(&changes),
            vec![
                vault.join("Insights/old.md").as_path(),
                vault.join("Insights/new.md").as_path()
            ]
        );
        assert_eq!(changes[0].mutation, Mutation::Delete);
        assert_eq!(changes[1].mutation, Mutation::Upsert);
    }

    #[test]
    fn classify_rename_out_of_insights_is_delete_only() {
        let vault = PathBuf::from("/vault");
        let event = notify::Event::new(EventKind::Modify(ModifyKind::Name(RenameMode::Both)))
            .add_path(vault.join("Insights/keep.md"))
            .add_path(vault.join("Archive/keep.md"));

        let changes = classify_event(&event, &vault);
        assert_eq!(changes.len(), 1);
        assert_eq!(changes[0].mutation, Mutation::Delete);
    }

    #[test]
    fn classify_lone_rename_by_presence_on_disk() {
        let tmp = tempfile::TempDir::new().unwrap();
        let vault = tmp.path().to_path_buf();
        std::fs::create_dir_all(vault.join(INSIGHTS_FOLDER)).unwrap();

        let present = vault.join("Insights/arrived.md");
        std::fs::write(&present, "renamed into place\n").unwrap();
        let event = notify::Event::new(EventKind::Modify(ModifyKind::Name(RenameMode::Any)))
            .add_path(present);
        assert_eq!(classify_event(&event, &vault)[0].mutation, Mutation::Upsert);

        // The rename source no longer exists: must become a delete, not
        // a dropped upsert that leaves a stale record behind
        let event = notify::Event::new(EventKind::Modify(ModifyKind::Name(RenameMode::Any)))
            .add_path(vault.join("Insights/departed.md"));
        assert_eq!(classify_event(&event, &vault)[0].mutation, Mutation::Delete);
    }

    #[test]
    fn arena_coalesces_rapid_events() {
        let mut arena = DebounceArena::new(Duration::from_millis(300));
        let t0 = Instant::now();
        let path = PathBuf::from("/vault/Insights/a.md");

        arena.arm(path.clone(), Mutation::Upsert, t0);
        arena.arm(path.clone(), Mutation::Upsert, t0 + Duration::from_millis(100));

        // First deadline passed, but the re-arm postponed it
        assert!(arena.take_due(t0 + Duration::from_millis(350)).is_empty());

        let due = arena.take_due(t0 + Duration::from_millis(450));
        assert_eq!(due, vec![(path, Mutation::Upsert)]);
        assert!(arena.is_empty());
    }

    #[test]
    fn arena_latest_mutation_wins() {
        let mut arena = DebounceArena::new(Duration::from_millis(300));
        let t0 = Instant::now();
        let path = PathBuf::from("/vault/Insights/a.md");

        arena.arm(path.clone(), Mutation::Upsert, t0);
        arena.arm(path.clone(), Mutation::Delete, t0);

        let due = arena.take_due(t0 + Duration::from_millis(300));
        assert_eq!(due, vec![(path, Mutation::Delete)]);
    }

    #[test]
    fn arena_tracks_paths_independently() {
        let mut arena = DebounceArena::new(Duration::from_millis(300));
        let t0 = Instant::now();
        let a = PathBuf::from("/vault/Insights/a.md");
        let b = PathBuf::from("/vault/Insights/b.md");

        arena.arm(a.clone(), Mutation::Upsert, t0);
        arena.arm(b.clone(), Mutation::Delete, t0 + Duration::from_millis(200));

        let due = arena.take_due(t0 + Duration::from_millis(350));
        assert_eq!(due, vec![(a, Mutation::Upsert)]);
        assert!(!arena.is_empty());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn watcher_indexes_created_note() {
        let tmp = tempfile::TempDir::new().unwrap();
        let vault = tmp.path().to_path_buf();
        let store = Arc::new(InsightStore::new(
            Arc::new(StubEmbedder::new()),
            Arc::new(MemoryIndex::new()),
        ));

        let mut watcher = VaultWatcher::new(store.clone(), vault.clone(), Duration::from_millis(50));
        watcher.start().unwrap();
        assert!(watcher.is_running());
        assert!(vault.join(INSIGHTS_FOLDER).is_dir());

        std::fs::write(
            vault.join("Insights/fresh.md"),
            "A note that should get indexed.\n",
        )
        .unwrap();

        // Generous deadline: debounce + dispatch + embed
        let deadline = Instant::now() + Duration::from_secs(5);
        loop {
            if store.count().await.unwrap() == 1 {
                break;
            }
            assert!(Instant::now() < deadline, "note was never indexed");
            tokio::time::sleep(Duration::from_millis(50)).await;
        }

        watcher.stop();
        assert!(!watcher.is_running());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn watcher_removes_deleted_note() {
        let tmp = tempfile::TempDir::new().unwrap();
        let vault = tmp.path().to_path_buf();
        let store = Arc::new(InsightStore::new(
            Arc::new(StubEmbedder::new()),
            Arc::new(MemoryIndex::new()),
        ));

        let note_path = vault.join("Insights/doomed.md");
        std::fs::create_dir_all(vault.join(INSIGHTS_FOLDER)).unwrap();
        std::fs::write(&note_path, "Soon gone.\n").unwrap();
        let note = crate::note::parse_note(&note_path).unwrap();
        store.upsert("Insights/doomed.md", &note).await.unwrap();

        let mut watcher = VaultWatcher::new(store.clone(), vault.clone(), Duration::from_millis(50));
        watcher.start().unwrap();

        std::fs::remove_file(&note_path).unwrap();

        let deadline = Instant::now() + Duration::from_secs(5);
        loop {
            if store.count().await.unwrap() == 0 {
                break;
            }
            assert!(Instant::now() < deadline, "note was never removed");
            tokio::time::sleep(Duration::from_millis(50)).await;
        }

        watcher.stop();
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn stop_discards_pending_mutations() {
        let tmp = tempfile::TempDir::new().unwrap();
        let vault = tmp.path().to_path_buf();
        let store = Arc::new(InsightStore::new(
            Arc::new(StubEmbedder::new()),
            Arc::new(MemoryIndex::new()),
        ));

        let mut watcher =
            VaultWatcher::new(store.clone(), vault.clone(), Duration::from_millis(500));
        watcher.start().unwrap();

        std::fs::write(
            vault.join("Insights/pending.md"),
            "Armed but never settled.\n",
        )
        .unwrap();

        // Stop inside the quiet period: the pending mutation must be
        // cancelled, not dispatched late
        tokio::time::sleep(Duration::from_millis(150)).await;
        watcher.stop();

        tokio::time::sleep(Duration::from_millis(800)).await;
        assert_eq!(store.count().await.unwrap(), 0);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn restart_repoints_vault() {
        let tmp_a = tempfile::TempDir::new().unwrap();
        let tmp_b = tempfile::TempDir::new().unwrap();
        let store = Arc::new(InsightStore::new(
            Arc::new(StubEmbedder::new()),
            Arc::new(MemoryIndex::new()),
        ));

        let mut watcher = VaultWatcher::new(
            store.clone(),
            tmp_a.path().to_path_buf(),
            Duration::from_millis(50),
        );
        watcher.start().unwrap();
        watcher.restart(tmp_b.path().to_path_buf()).unwrap();
        assert!(watcher.is_running());
        assert_eq!(watcher.vault_path(), tmp_b.path());
        assert!(tmp_b.path().join(INSIGHTS_FOLDER).is_dir());
        watcher.stop();
    }
}
