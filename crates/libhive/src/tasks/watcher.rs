use hive_protocol::TaskSnapshot;
use notify::{RecommendedWatcher, RecursiveMode, Watcher};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, SystemTime};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::parser;
use crate::error::Result;

pub const DEFAULT_TASK_FILE_NAME: &str = "task.md";
pub const DEFAULT_DEBOUNCE: Duration = Duration::from_millis(100);

/// Where the task document comes from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskSource {
    /// Explicitly synced document; wins over searching when set.
    pub explicit: Option<PathBuf>,
    pub search_root: PathBuf,
    pub file_name: String,
}

impl TaskSource {
    pub fn explicit(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let file_name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| DEFAULT_TASK_FILE_NAME.to_string());
        let search_root = path
            .parent()
            .filter(|dir| !dir.as_os_str().is_empty())
            .map(Path::to_path_buf)
            .unwrap_or_else(|| PathBuf::from("."));
        Self {
            explicit: Some(path),
            search_root,
            file_name,
        }
    }

    pub fn search(root: impl Into<PathBuf>, file_name: impl Into<String>) -> Self {
        Self {
            explicit: None,
            search_root: root.into(),
            file_name: file_name.into(),
        }
    }

    /// The document to read: the explicit path, else the most recently
    /// modified `file_name` anywhere under the search root.
    pub fn resolve(&self) -> Option<PathBuf> {
        if let Some(path) = &self.explicit {
            return Some(path.clone());
        }
        newest_match(&self.search_root, &self.file_name)
    }

    fn watch_target(&self) -> (PathBuf, RecursiveMode) {
        match &self.explicit {
            Some(_) => (self.search_root.clone(), RecursiveMode::NonRecursive),
            None => (self.search_root.clone(), RecursiveMode::Recursive),
        }
    }

    fn concerns(&self, path: &Path) -> bool {
        match &self.explicit {
            Some(explicit) => path == explicit || path.file_name() == explicit.file_name(),
            None => path
                .file_name()
                .is_some_and(|name| name.to_string_lossy() == self.file_name),
        }
    }
}

fn newest_match(root: &Path, file_name: &str) -> Option<PathBuf> {
    let pattern = format!(
        "{}/**/{}",
        glob::Pattern::escape(&root.to_string_lossy()),
        glob::Pattern::escape(file_name)
    );
    let paths = match glob::glob(&pattern) {
        Ok(paths) => paths,
        Err(err) => {
            warn!(%pattern, error = %err, "bad task search pattern");
            return None;
        }
    };
    paths
        .filter_map(|entry| entry.ok())
        .filter_map(|path| {
            let modified = std::fs::metadata(&path).and_then(|m| m.modified()).ok()?;
            Some((modified, path))
        })
        .max_by_key(|(modified, _): &(SystemTime, PathBuf)| *modified)
        .map(|(_, path)| path)
}

/// Read and parse whatever the source currently resolves to. `None` when
/// there is no document or it could not be read.
pub async fn load_snapshot(source: &TaskSource) -> Option<TaskSnapshot> {
    let lookup = source.clone();
    let path = tokio::task::spawn_blocking(move || lookup.resolve())
        .await
        .ok()
        .flatten()?;
    match tokio::fs::read_to_string(&path).await {
        Ok(text) => Some(parser::snapshot(Some(path), &text)),
        Err(err) => {
            warn!(path = %path.display(), error = %err, "task document unreadable; keeping last snapshot");
            None
        }
    }
}

/// Watches the task document and publishes a fresh [`TaskSnapshot`] after
/// every (debounced) change.
///
/// Observers hold a `watch` receiver, so a new observer immediately sees the
/// latest snapshot and identical re-parses are never re-announced.
pub struct TaskWatcher {
    snapshots: watch::Receiver<Arc<TaskSnapshot>>,
    cancel: CancellationToken,
    task: Option<JoinHandle<()>>,
}

impl TaskWatcher {
    pub async fn start(source: TaskSource, debounce: Duration) -> Result<Self> {
        let initial = load_snapshot(&source).await.unwrap_or_default();
        info!(
            source = ?initial.source,
            tasks = initial.stats.total,
            "task watcher loaded initial snapshot"
        );
        let (tx, snapshots) = watch::channel(Arc::new(initial));

        let (event_tx, event_rx) = mpsc::unbounded_channel::<()>();
        let (target, mode) = source.watch_target();
        let filter = source.clone();
        let mut watcher = notify::recommended_watcher(move |res: notify::Result<notify::Event>| {
            match res {
                Ok(event) if event.paths.iter().any(|p| filter.concerns(p)) => {
                    let _ = event_tx.send(());
                }
                Ok(_) => {}
                Err(err) => warn!(error = %err, "task watch event error"),
            }
        })?;

        let watcher = if target.is_dir() {
            watcher.watch(&target, mode)?;
            debug!(path = %target.display(), ?mode, "watching task documents");
            Some(watcher)
        } else {
            warn!(path = %target.display(), "task directory missing; serving a static snapshot");
            None
        };

        let cancel = CancellationToken::new();
        let task = tokio::spawn(watch_loop(
            source,
            debounce,
            watcher,
            event_rx,
            tx,
            cancel.clone(),
        ));

        Ok(Self {
            snapshots,
            cancel,
            task: Some(task),
        })
    }

    /// Latest snapshot.
    pub fn snapshot(&self) -> Arc<TaskSnapshot> {
        Arc::clone(&self.snapshots.borrow())
    }

    pub fn subscribe(&self) -> watch::Receiver<Arc<TaskSnapshot>> {
        self.snapshots.clone()
    }

    pub async fn shutdown(mut self) {
        self.cancel.cancel();
        if let Some(task) = self.task.take() {
            let _ = task.await;
        }
    }
}

impl Drop for TaskWatcher {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

async fn watch_loop(
    source: TaskSource,
    debounce: Duration,
    // Held so the OS watch lives exactly as long as the loop.
    _watcher: Option<RecommendedWatcher>,
    mut events: mpsc::UnboundedReceiver<()>,
    tx: watch::Sender<Arc<TaskSnapshot>>,
    cancel: CancellationToken,
) {
    let mut pending = false;
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            event = events.recv() => match event {
                Some(()) => pending = true,
                None => break,
            },
            _ = tokio::time::sleep(debounce), if pending => {
                pending = false;
                reload(&source, &tx).await;
            }
        }
    }
    debug!("task watcher stopped");
}

async fn reload(source: &TaskSource, tx: &watch::Sender<Arc<TaskSnapshot>>) {
    let Some(next) = load_snapshot(source).await else {
        return;
    };
    let changed = tx.send_if_modified(|current| {
        if **current == next {
            false
        } else {
            *current = Arc::new(next);
            true
        }
    });
    if changed {
        let stats = tx.borrow().stats;
        info!(
            total = stats.total,
            completed = stats.completed,
            in_progress = stats.in_progress,
            "task snapshot updated"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs::File;

    const DOC: &str = "- [ ] Phase 1: Setup\n- [ ] Install deps\n";

    async fn next_change(rx: &mut watch::Receiver<Arc<TaskSnapshot>>) -> Arc<TaskSnapshot> {
        tokio::time::timeout(Duration::from_secs(5), rx.changed())
            .await
            .expect("no snapshot change within 5s")
            .unwrap();
        Arc::clone(&rx.borrow_and_update())
    }

    #[tokio::test]
    async fn new_observer_gets_current_snapshot() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("task.md");
        std::fs::write(&path, DOC).unwrap();

        let watcher = TaskWatcher::start(TaskSource::explicit(&path), DEFAULT_DEBOUNCE)
            .await
            .unwrap();
        let rx = watcher.subscribe();
        assert_eq!(rx.borrow().stats.total, 1);
        assert_eq!(rx.borrow().source.as_deref(), Some(path.as_path()));
        assert_eq!(watcher.snapshot().phases[0].name, "Setup");
    }

    #[tokio::test]
    async fn edits_are_reparsed_and_broadcast() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("task.md");
        std::fs::write(&path, DOC).unwrap();

        let watcher = TaskWatcher::start(TaskSource::explicit(&path), Duration::from_millis(50))
            .await
            .unwrap();
        let mut rx = watcher.subscribe();
        rx.borrow_and_update();

        // A burst of writes settles into one consistent snapshot.
        for n in 0..3 {
            std::fs::write(&path, format!("{DOC}- [x] Step {n}\n")).unwrap();
        }
        let mut snap = next_change(&mut rx).await;
        while snap.stats.total != 2 || snap.tasks[1].content != "Step 2" {
            snap = next_change(&mut rx).await;
        }
        assert_eq!(snap.stats.completed, 1);
        watcher.shutdown().await;
    }

    #[tokio::test]
    async fn write_burst_coalesces_into_one_broadcast() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("task.md");
        std::fs::write(&path, DOC).unwrap();

        let watcher = TaskWatcher::start(TaskSource::explicit(&path), Duration::from_millis(200))
            .await
            .unwrap();
        let mut rx = watcher.subscribe();
        rx.borrow_and_update();

        for n in 0..5 {
            std::fs::write(&path, format!("{DOC}- [ ] Step {n}\n")).unwrap();
        }
        let snap = next_change(&mut rx).await;
        assert_eq!(snap.tasks[1].content, "Step 4");

        tokio::time::sleep(Duration::from_millis(600)).await;
        assert!(!rx.has_changed().unwrap(), "burst produced more than one broadcast");
        watcher.shutdown().await;
    }

    #[tokio::test]
    async fn identical_content_is_not_rebroadcast() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("task.md");
        std::fs::write(&path, DOC).unwrap();

        let watcher = TaskWatcher::start(TaskSource::explicit(&path), Duration::from_millis(20))
            .await
            .unwrap();
        let mut rx = watcher.subscribe();
        rx.borrow_and_update();

        std::fs::write(&path, DOC).unwrap();
        tokio::time::sleep(Duration::from_millis(400)).await;
        assert!(!rx.has_changed().unwrap());
    }

    #[tokio::test]
    async fn missing_document_yields_empty_snapshot() {
        let dir = tempfile::tempdir().unwrap();
        let watcher = TaskWatcher::start(
            TaskSource::search(dir.path(), DEFAULT_TASK_FILE_NAME),
            DEFAULT_DEBOUNCE,
        )
        .await
        .unwrap();
        assert_eq!(*watcher.snapshot(), TaskSnapshot::default());
    }

    #[test]
    fn search_picks_newest_document() {
        let dir = tempfile::tempdir().unwrap();
        let older = dir.path().join("a").join("task.md");
        let newer = dir.path().join("b").join("nested").join("task.md");
        for path in [&older, &newer] {
            std::fs::create_dir_all(path.parent().unwrap()).unwrap();
            std::fs::write(path, DOC).unwrap();
        }
        std::fs::write(dir.path().join("b").join("notes.md"), DOC).unwrap();

        let now = SystemTime::now();
        let set_mtime = |path: &Path, at: SystemTime| {
            File::options()
                .write(true)
                .open(path)
                .unwrap()
                .set_modified(at)
                .unwrap();
        };
        set_mtime(&older, now - Duration::from_secs(600));
        set_mtime(&newer, now - Duration::from_secs(60));

        let source = TaskSource::search(dir.path(), "task.md");
        assert_eq!(source.resolve(), Some(newer.clone()));

        set_mtime(&older, now);
        assert_eq!(source.resolve(), Some(older));
    }

    #[test]
    fn explicit_path_wins_over_search() {
        let source = TaskSource::explicit("/srv/sync/plan.md");
        assert_eq!(source.resolve(), Some(PathBuf::from("/srv/sync/plan.md")));
        assert!(source.concerns(Path::new("/srv/sync/plan.md")));
        assert!(!source.concerns(Path::new("/srv/sync/other.md")));
    }
}
