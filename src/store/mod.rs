//! Durable, single-writer state store for the PRD document.
//!
//! The [`StateStore`] owns `.ralph/prd.json` exclusively. Every mutation
//! rewrites the whole document through a temporary file and an atomic
//! rename, so a crash leaves either the previous or the new snapshot on
//! disk, never a mix of both.

mod document;
mod status;

use std::collections::HashMap;
use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use tokio::sync::watch;
use tracing::{debug, warn};
use uuid::Uuid;

pub use document::{PrdDocument, ProjectMeta};
pub use status::{ItemSummary, StatusReader, StatusSnapshot};

use crate::error::{HarnessError, Result};
use crate::state_machine::{RunSession, SessionOutcome, Status, StatusCounts, WorkItem};

pub const RALPH_DIR: &str = ".ralph";
pub const PRD_FILE: &str = "prd.json";

/// `<repo>/.ralph/prd.json`
pub fn prd_path(repo_root: &Path) -> PathBuf {
    repo_root.join(RALPH_DIR).join(PRD_FILE)
}

pub struct StateStore {
    path: PathBuf,
    doc: PrdDocument,
    index: HashMap<String, usize>,
    status_tx: watch::Sender<StatusSnapshot>,
}

impl StateStore {
    /// Load and validate the document at `path`.
    ///
    /// A temporary snapshot left behind by an interrupted write is discarded:
    /// the rename never happened, so the previous snapshot is authoritative.
    pub fn load(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();

        let tmp = tmp_path(&path);
        if tmp.exists() {
            debug!(path = %tmp.display(), "removing interrupted write");
            if let Err(e) = fs::remove_file(&tmp) {
                warn!(error = %e, path = %tmp.display(), "failed to remove stale snapshot");
            }
        }

        if !path.exists() {
            return Err(HarnessError::NotFound(path));
        }

        // Bytes, not a String: invalid UTF-8 is a corrupt document, not an I/O error.
        let contents = fs::read(&path)?;
        let doc: PrdDocument = serde_json::from_slice(&contents)
            .map_err(|e| HarnessError::corrupt(&path, e.to_string()))?;
        doc.validate().map_err(|reason| HarnessError::corrupt(&path, reason))?;

        debug!(path = %path.display(), items = doc.items.len(), "loaded PRD");
        Ok(Self::from_document(path, doc))
    }

    /// Write `doc` to `path` and open a store over it.
    pub fn create(path: impl Into<PathBuf>, doc: PrdDocument) -> Result<Self> {
        let path = path.into();
        doc.validate().map_err(|reason| HarnessError::corrupt(&path, reason))?;
        if let Some(dir) = path.parent() {
            fs::create_dir_all(dir)?;
        }
        write_atomic(&path, &doc)?;
        Ok(Self::from_document(path, doc))
    }

    fn from_document(path: PathBuf, doc: PrdDocument) -> Self {
        let index = doc
            .items
            .iter()
            .enumerate()
            .map(|(i, item)| (item.id.clone(), i))
            .collect();
        let (status_tx, _) = watch::channel(StatusSnapshot::from_items(&doc.items));
        Self {
            path,
            doc,
            index,
            status_tx,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn document(&self) -> &PrdDocument {
        &self.doc
    }

    pub fn items(&self) -> &[WorkItem] {
        &self.doc.items
    }

    pub fn get(&self, id: &str) -> Option<&WorkItem> {
        self.index.get(id).map(|&i| &self.doc.items[i])
    }

    pub fn counts(&self) -> StatusCounts {
        StatusCounts::tally(&self.doc.items)
    }

    /// Verification commands for `item`: its own, else the global ones.
    pub fn verify_commands(&self, item: &WorkItem) -> Vec<String> {
        item.verify
            .clone()
            .unwrap_or_else(|| self.doc.global.verify.clone())
    }

    pub fn unmet_dependencies(&self, item: &WorkItem) -> Vec<String> {
        self.doc.unmet_dependencies(item)
    }

    /// Items that may be attempted at `now`, in document order.
    ///
    /// Recomputed on every call: Pending items (and Blocked items whose
    /// dependencies have since completed) with every dependency `Done` and
    /// an elapsed backoff window.
    pub fn list_eligible(&self, now: DateTime<Utc>) -> impl Iterator<Item = &WorkItem> + '_ {
        self.doc.items.iter().filter(move |item| {
            matches!(item.state(), Status::Pending | Status::Blocked)
                && item.ready_at(now)
                && self.dependencies_done(item)
        })
    }

    fn dependencies_done(&self, item: &WorkItem) -> bool {
        item.depends_on.iter().all(|dep| {
            self.get(dep)
                .is_some_and(|d| d.state() == Status::Done)
        })
    }

    /// Durably replace the stored copy of `item`.
    ///
    /// The in-memory document only changes once the new snapshot is on disk.
    pub fn commit(&mut self, item: WorkItem) -> Result<()> {
        let Some(&i) = self.index.get(&item.id) else {
            return Err(HarnessError::ItemNotFound(item.id));
        };
        debug_assert!(
            item.history.starts_with(&self.doc.items[i].history),
            "history of {} was rewritten",
            item.id
        );
        debug_assert!(item.status.attempts >= self.doc.items[i].status.attempts);

        let mut next = self.doc.clone();
        next.items[i] = item;
        self.persist(next)
    }

    /// Record the start of a harness run.
    pub fn open_session(&mut self, now: DateTime<Utc>) -> Result<Uuid> {
        let mut next = self.doc.clone();
        for stale in next.sessions.iter_mut().filter(|s| s.is_open()) {
            // A previous run died without closing its session.
            warn!(session = %stale.session_id, "closing session left open by a crashed run");
            stale.close(SessionOutcome::Interrupted, now);
        }
        let session = RunSession::start(now);
        let id = session.session_id;
        next.sessions.push(session);
        self.persist(next)?;
        Ok(id)
    }

    /// Close the session `id`. Returns `false` if it was already closed.
    pub fn close_session(
        &mut self,
        id: Uuid,
        outcome: SessionOutcome,
        now: DateTime<Utc>,
    ) -> Result<bool> {
        let mut next = self.doc.clone();
        let Some(session) = next.sessions.iter_mut().find(|s| s.session_id == id) else {
            return Ok(false);
        };
        if !session.close(outcome, now) {
            return Ok(false);
        }
        self.persist(next)?;
        Ok(true)
    }

    /// Reader over the latest committed status snapshot.
    pub fn subscribe(&self) -> StatusReader {
        self.status_tx.subscribe()
    }

    fn persist(&mut self, next: PrdDocument) -> Result<()> {
        write_atomic(&self.path, &next)?;
        self.doc = next;
        self.status_tx
            .send_replace(StatusSnapshot::from_items(&self.doc.items));
        Ok(())
    }
}

fn tmp_path(path: &Path) -> PathBuf {
    path.with_extension("json.tmp")
}

fn write_atomic(path: &Path, doc: &PrdDocument) -> Result<()> {
    let tmp = tmp_path(path);
    let contents = serde_json::to_vec_pretty(doc)?;

    {
        let mut file = File::create(&tmp)?;
        file.write_all(&contents)?;
        file.write_all(b"\n")?;
        file.sync_all()?;
    }

    fs::rename(&tmp, path)?;

    // Persist the rename itself.
    if let Some(dir) = path.parent()
        && let Ok(handle) = File::open(dir)
        && let Err(e) = handle.sync_all()
    {
        debug!(error = %e, "directory sync not supported");
    }

    debug!(path = %path.display(), "snapshot committed");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state_machine::{Event, RetryPolicy, StateMachine};
    use tempfile::TempDir;

    fn setup(items: Vec<WorkItem>) -> (TempDir, StateStore) {
        let tmp = TempDir::new().unwrap();
        let path = prd_path(tmp.path());
        let store = StateStore::create(&path, PrdDocument::new("demo", items)).unwrap();
        (tmp, store)
    }

    fn started(store: &StateStore, id: &str) -> WorkItem {
        let mut item = store.get(id).unwrap().clone();
        StateMachine::apply(
            &mut item,
            Event::Select {
                dependencies_met: true,
            },
            &RetryPolicy::default(),
            Utc::now(),
        )
        .unwrap();
        item
    }

    #[test]
    fn load_missing_document_is_not_found() {
        let tmp = TempDir::new().unwrap();
        let err = StateStore::load(prd_path(tmp.path())).err().unwrap();
        assert!(matches!(err, HarnessError::NotFound(_)));
    }

    #[test]
    fn load_invalid_json_is_corrupt() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("prd.json");
        fs::write(&path, "{ not json").unwrap();
        let err = StateStore::load(&path).err().unwrap();
        assert!(matches!(err, HarnessError::CorruptState { .. }));
    }

    #[test]
    fn load_non_utf8_document_is_corrupt() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("prd.json");
        fs::write(&path, [0xff, 0xfe, b'{', b'}']).unwrap();
        let err = StateStore::load(&path).err().unwrap();
        assert!(matches!(err, HarnessError::CorruptState { .. }), "got {err:?}");
    }

    #[test]
    fn load_cyclic_document_is_corrupt() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("prd.json");
        let doc = PrdDocument::new(
            "demo",
            vec![
                WorkItem::new("a", "x").depending_on(&["b"]),
                WorkItem::new("b", "y").depending_on(&["a"]),
            ],
        );
        fs::write(&path, serde_json::to_string(&doc).unwrap()).unwrap();

        let err = StateStore::load(&path).err().unwrap();
        match err {
            HarnessError::CorruptState { reason, .. } => assert!(reason.contains("cycle")),
            other => panic!("expected CorruptState, got {other:?}"),
        }
    }

    #[test]
    fn commit_survives_reload() {
        let (_tmp, mut store) = setup(vec![WorkItem::new("001", "Task")]);
        let item = started(&store, "001");
        store.commit(item.clone()).unwrap();

        let reloaded = StateStore::load(store.path()).unwrap();
        assert_eq!(reloaded.get("001"), Some(&item));
        assert_eq!(reloaded.get("001").unwrap().state(), Status::InProgress);
    }

    #[test]
    fn commit_unknown_item_fails_without_writing() {
        let (_tmp, mut store) = setup(vec![WorkItem::new("001", "Task")]);
        let before = fs::read_to_string(store.path()).unwrap();

        let err = store.commit(WorkItem::new("999", "ghost")).unwrap_err();
        assert!(matches!(err, HarnessError::ItemNotFound(_)));
        assert_eq!(fs::read_to_string(store.path()).unwrap(), before);
    }

    #[test]
    fn stale_temporary_snapshot_is_discarded() {
        let (_tmp, store) = setup(vec![WorkItem::new("001", "Task")]);
        let tmp = tmp_path(store.path());
        fs::write(&tmp, "{ torn").unwrap();

        let reloaded = StateStore::load(store.path()).unwrap();
        assert_eq!(reloaded.items().len(), 1);
        assert!(!tmp.exists());
    }

    #[test]
    fn failed_write_keeps_previous_state() {
        let (tmp, mut store) = setup(vec![WorkItem::new("001", "Task")]);
        let item = started(&store, "001");

        // Make the temporary path a directory so the write fails.
        fs::create_dir(tmp_path(store.path())).unwrap();
        assert!(store.commit(item).is_err());
        assert_eq!(store.get("001").unwrap().state(), Status::Pending);

        fs::remove_dir(tmp_path(store.path())).unwrap();
        let on_disk = StateStore::load(prd_path(tmp.path())).unwrap();
        assert_eq!(on_disk.get("001").unwrap().state(), Status::Pending);
    }

    #[test]
    fn list_eligible_respects_dependencies_backoff_and_order() {
        let now = Utc::now();
        let mut waiting = WorkItem::new("c", "backing off");
        waiting.status.not_before = Some(now + chrono::Duration::seconds(30));
        let (_tmp, mut store) = setup(vec![
            WorkItem::new("a", "first"),
            WorkItem::new("b", "needs a").depending_on(&["a"]),
            waiting,
            WorkItem::new("d", "free"),
        ]);

        let ids: Vec<_> = store.list_eligible(now).map(|i| i.id.as_str()).collect();
        assert_eq!(ids, vec!["a", "d"]);

        let mut a = store.get("a").unwrap().clone();
        a.status.state = Status::Done;
        store.commit(a).unwrap();

        let later = now + chrono::Duration::seconds(31);
        let ids: Vec<_> = store.list_eligible(later).map(|i| i.id.as_str()).collect();
        assert_eq!(ids, vec!["b", "c", "d"]);
    }

    #[test]
    fn blocked_item_becomes_eligible_once_dependency_is_done() {
        let mut blocked = WorkItem::new("b", "needs a").depending_on(&["a"]);
        blocked.status.state = Status::Blocked;
        let mut a = WorkItem::new("a", "first");
        a.status.state = Status::Done;
        let (_tmp, store) = setup(vec![a, blocked]);

        let ids: Vec<_> = store.list_eligible(Utc::now()).map(|i| i.id.as_str()).collect();
        assert_eq!(ids, vec!["b"]);
    }

    #[test]
    fn sessions_are_opened_and_closed_once() {
        let (_tmp, mut store) = setup(vec![WorkItem::new("001", "Task")]);
        let now = Utc::now();
        let id = store.open_session(now).unwrap();
        assert!(store.close_session(id, SessionOutcome::CompletedAll, now).unwrap());
        assert!(!store.close_session(id, SessionOutcome::Interrupted, now).unwrap());

        let reloaded = StateStore::load(store.path()).unwrap();
        let session = &reloaded.document().sessions[0];
        assert_eq!(session.outcome, Some(SessionOutcome::CompletedAll));
    }

    #[test]
    fn open_session_closes_crashed_predecessor() {
        let (_tmp, mut store) = setup(vec![WorkItem::new("001", "Task")]);
        let first = store.open_session(Utc::now()).unwrap();
        let second = store.open_session(Utc::now()).unwrap();

        let sessions = &store.document().sessions;
        assert_eq!(sessions.len(), 2);
        assert_eq!(sessions[0].session_id, first);
        assert_eq!(sessions[0].outcome, Some(SessionOutcome::Interrupted));
        assert_eq!(sessions[1].session_id, second);
        assert!(sessions[1].is_open());
    }

    #[test]
    fn subscribers_see_committed_snapshots() {
        let (_tmp, mut store) = setup(vec![WorkItem::new("001", "Task")]);
        let reader = store.subscribe();
        assert_eq!(reader.borrow().counts.pending, 1);

        let item = started(&store, "001");
        store.commit(item).unwrap();
        let snap = reader.borrow();
        assert_eq!(snap.counts.in_progress, 1);
        assert_eq!(snap.items[0].attempts, 1);
    }

    #[test]
    fn verify_commands_fall_back_to_global() {
        let mut own = WorkItem::new("a", "x");
        own.verify = Some(vec!["cargo test".into()]);
        let mut doc = PrdDocument::new("demo", vec![own, WorkItem::new("b", "y")]);
        doc.global.verify = vec!["make check".into()];
        let tmp = TempDir::new().unwrap();
        let store = StateStore::create(prd_path(tmp.path()), doc).unwrap();

        assert_eq!(store.verify_commands(store.get("a").unwrap()), vec!["cargo test"]);
        assert_eq!(store.verify_commands(store.get("b").unwrap()), vec!["make check"]);
    }
}
