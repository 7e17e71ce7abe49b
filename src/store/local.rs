//! In-process document store with live fan-out and optional JSON persistence.

use std::path::PathBuf;
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use chrono::Utc;

use super::{
    snapshot_channel, DocumentStore, SnapshotSender, StoreError, StoreResult, Subscription,
};
use crate::models::{
    CollectionData, CollectionsFile, Document, DocumentId, Fields, Snapshot, Timestamp,
};
use crate::storage::{Storage, StorageError, SCHEMA_VERSION};

#[derive(Clone)]
pub struct LocalStore {
    inner: Arc<Mutex<LocalData>>,
}

struct LocalData {
    collections: Vec<CollectionData>,
    subscribers: Vec<(String, SnapshotSender)>,
    storage: Option<Storage>,
    /// Set while the file on disk is still the one found at open.
    backup_pending: bool,
    fail_next: Option<StoreError>,
}

impl LocalStore {
    /// Store that lives only as long as the process.
    pub fn in_memory() -> Self {
        Self::with_state(Vec::new(), None)
    }

    /// Store persisted under `root`. An existing collections file is backed up before the
    /// first write that replaces it.
    pub fn open(root: PathBuf) -> Result<Self, StorageError> {
        let storage = Storage::new(root);
        storage.ensure_dirs()?;
        let existing = storage.has_collections();
        let collections = if existing {
            storage.load_collections()?.collections
        } else {
            Vec::new()
        };
        log::info!(
            "local store: opened root={} collections={}",
            storage.root().display(),
            collections.len()
        );
        let store = Self::with_state(collections, Some(storage));
        store.lock().backup_pending = existing;
        Ok(store)
    }

    fn with_state(collections: Vec<CollectionData>, storage: Option<Storage>) -> Self {
        Self {
            inner: Arc::new(Mutex::new(LocalData {
                collections,
                subscribers: Vec::new(),
                storage,
                backup_pending: false,
                fail_next: None,
            })),
        }
    }

    /// Makes the next create, update or delete fail with `error` without touching state.
    pub fn fail_next(&self, error: StoreError) {
        self.lock().fail_next = Some(error);
    }

    /// Current contents of `collection`, in delivery order.
    pub fn snapshot(&self, collection: &str) -> Snapshot {
        self.lock().snapshot(collection)
    }

    pub fn subscriber_count(&self) -> usize {
        let mut guard = self.lock();
        guard.subscribers.retain(|(_, tx)| !tx.is_closed());
        guard.subscribers.len()
    }

    fn lock(&self) -> MutexGuard<'_, LocalData> {
        self.inner
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Runs `mutate` against the collection, persists, then publishes. A failed mutation or
    /// failed persistence leaves the collections exactly as they were.
    fn mutate<T>(
        &self,
        collection: &str,
        mutate: impl FnOnce(&mut Vec<Document>) -> StoreResult<T>,
    ) -> StoreResult<T> {
        let mut guard = self.lock();
        if let Some(error) = guard.fail_next.take() {
            return Err(error);
        }
        let (index, added) = guard.collection_index(collection);
        let previous = guard.collections[index].documents.clone();
        let previous_updated_at = guard.collections[index].updated_at;
        let value = match mutate(&mut guard.collections[index].documents) {
            Ok(value) => value,
            Err(err) => {
                guard.rollback(index, added, previous, previous_updated_at);
                return Err(err);
            }
        };
        guard.collections[index].updated_at = Some(Utc::now().timestamp());
        if let Err(err) = guard.persist() {
            log::error!("local store: persist failed collection={collection} err={err}");
            guard.rollback(index, added, previous, previous_updated_at);
            return Err(StoreError::Persistence(err.to_string()));
        }
        guard.publish(collection);
        Ok(value)
    }
}

impl LocalData {
    /// Index of the named collection, adding an empty one when missing. The flag tells
    /// whether it was added.
    fn collection_index(&mut self, name: &str) -> (usize, bool) {
        if let Some(index) = self.collections.iter().position(|c| c.name == name) {
            return (index, false);
        }
        self.collections.push(CollectionData {
            name: name.to_string(),
            documents: Vec::new(),
            updated_at: None,
        });
        (self.collections.len() - 1, true)
    }

    fn rollback(
        &mut self,
        index: usize,
        added: bool,
        documents: Vec<Document>,
        updated_at: Option<Timestamp>,
    ) {
        if added {
            self.collections.remove(index);
        } else {
            self.collections[index].documents = documents;
            self.collections[index].updated_at = updated_at;
        }
    }

    fn snapshot(&self, name: &str) -> Snapshot {
        self.collections
            .iter()
            .find(|c| c.name == name)
            .map(|c| c.documents.clone())
            .unwrap_or_default()
    }

    fn persist(&mut self) -> Result<(), StorageError> {
        let Some(storage) = &self.storage else {
            return Ok(());
        };
        if self.backup_pending && storage.has_collections() {
            storage.create_backup()?;
            self.backup_pending = false;
        }
        storage.save_collections(&CollectionsFile {
            schema_version: SCHEMA_VERSION,
            collections: self.collections.clone(),
        })
    }

    fn publish(&mut self, name: &str) {
        self.subscribers.retain(|(_, tx)| !tx.is_closed());
        let snapshot = self.snapshot(name);
        for (_, tx) in self.subscribers.iter().filter(|(c, _)| c == name) {
            tx.send_replace(Some(Ok(snapshot.clone())));
        }
    }
}

fn validate(fields: &Fields) -> StoreResult<()> {
    if fields.is_empty() {
        return Err(StoreError::InvalidFields("no fields given".to_string()));
    }
    if let Some(key) = fields.keys().find(|key| key.trim().is_empty()) {
        return Err(StoreError::InvalidFields(format!("empty field name {key:?}")));
    }
    Ok(())
}

#[async_trait]
impl DocumentStore for LocalStore {
    async fn subscribe(&self, collection: &str) -> StoreResult<Subscription> {
        let mut guard = self.lock();
        let (tx, rx) = snapshot_channel();
        tx.send_replace(Some(Ok(guard.snapshot(collection))));
        guard.subscribers.push((collection.to_string(), tx));
        log::debug!("local store: subscribed collection={collection}");
        Ok(Subscription::new(rx))
    }

    async fn create(&self, collection: &str, fields: Fields) -> StoreResult<DocumentId> {
        validate(&fields)?;
        let id = uuid::Uuid::new_v4().simple().to_string();
        self.mutate(collection, |documents| {
            documents.push(Document {
                id: id.clone(),
                fields,
            });
            Ok(())
        })?;
        log::debug!("local store: created collection={collection} id={id}");
        Ok(id)
    }

    async fn update(&self, collection: &str, id: &str, fields: Fields) -> StoreResult<()> {
        validate(&fields)?;
        self.mutate(collection, |documents| {
            let doc = documents
                .iter_mut()
                .find(|d| d.id == id)
                .ok_or_else(|| StoreError::not_found(collection, id))?;
            doc.fields.extend(fields);
            Ok(())
        })
    }

    async fn delete(&self, collection: &str, id: &str) -> StoreResult<()> {
        self.mutate(collection, |documents| {
            let before = documents.len();
            documents.retain(|d| d.id != id);
            if documents.len() == before {
                return Err(StoreError::not_found(collection, id));
            }
            Ok(())
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{status_patch, Status, TaskFields};

    fn ids(snapshot: &Snapshot) -> Vec<String> {
        snapshot.iter().map(|d| d.id.clone()).collect()
    }

    #[tokio::test]
    async fn subscribe_delivers_current_state_first() {
        let store = LocalStore::in_memory();
        let id = store
            .create("tasks", TaskFields::new("a").into_fields())
            .await
            .unwrap();
        let mut sub = store.subscribe("tasks").await.unwrap();
        let snapshot = sub.next().await.unwrap().unwrap();
        assert_eq!(ids(&snapshot), vec![id]);
    }

    #[tokio::test]
    async fn mutations_publish_full_snapshots_in_insertion_order() {
        let store = LocalStore::in_memory();
        let mut sub = store.subscribe("tasks").await.unwrap();
        assert!(sub.next().await.unwrap().unwrap().is_empty());

        let a = store
            .create("tasks", TaskFields::new("a").into_fields())
            .await
            .unwrap();
        assert_eq!(ids(&sub.next().await.unwrap().unwrap()), vec![a.clone()]);

        let b = store
            .create("tasks", TaskFields::new("b").into_fields())
            .await
            .unwrap();
        assert_eq!(
            ids(&sub.next().await.unwrap().unwrap()),
            vec![a.clone(), b.clone()]
        );

        store
            .update("tasks", &a, status_patch(&Status::Late))
            .await
            .unwrap();
        let snapshot = sub.next().await.unwrap().unwrap();
        assert_eq!(snapshot[0].fields["status"], "late");
        assert_eq!(snapshot[0].fields["task"], "a");

        store.delete("tasks", &a).await.unwrap();
        assert_eq!(ids(&sub.next().await.unwrap().unwrap()), vec![b]);
    }

    #[tokio::test]
    async fn other_collections_do_not_notify() {
        let store = LocalStore::in_memory();
        let mut sub = store.subscribe("tasks").await.unwrap();
        sub.next().await.unwrap().unwrap();
        store
            .create("other", TaskFields::new("x").into_fields())
            .await
            .unwrap();
        let pending = tokio::time::timeout(std::time::Duration::from_millis(50), sub.next()).await;
        assert!(pending.is_err());
        assert!(store.snapshot("tasks").is_empty());
    }

    #[tokio::test]
    async fn missing_documents_and_empty_fields_are_rejected() {
        let store = LocalStore::in_memory();
        assert_eq!(
            store.delete("tasks", "nope").await,
            Err(StoreError::not_found("tasks", "nope"))
        );
        assert_eq!(
            store
                .update("tasks", "nope", status_patch(&Status::Done))
                .await,
            Err(StoreError::not_found("tasks", "nope"))
        );
        assert!(matches!(
            store.create("tasks", Fields::new()).await,
            Err(StoreError::InvalidFields(_))
        ));
    }

    #[tokio::test]
    async fn fail_next_applies_once_and_leaves_state_alone() {
        let store = LocalStore::in_memory();
        store.fail_next(StoreError::Transport("offline".into()));
        assert_eq!(
            store
                .create("tasks", TaskFields::new("a").into_fields())
                .await,
            Err(StoreError::Transport("offline".into()))
        );
        assert!(store.snapshot("tasks").is_empty());
        store
            .create("tasks", TaskFields::new("a").into_fields())
            .await
            .unwrap();
        assert_eq!(store.snapshot("tasks").len(), 1);
    }

    #[tokio::test]
    async fn dropped_subscriptions_are_released() {
        let store = LocalStore::in_memory();
        let first = store.subscribe("tasks").await.unwrap();
        let second = store.subscribe("tasks").await.unwrap();
        assert_eq!(store.subscriber_count(), 2);
        first.unsubscribe();
        assert_eq!(store.subscriber_count(), 1);
        drop(second);
        store
            .create("tasks", TaskFields::new("a").into_fields())
            .await
            .unwrap();
        assert_eq!(store.subscriber_count(), 0);
    }

    fn backup_contents(dir: &std::path::Path) -> Vec<String> {
        Storage::new(dir.to_path_buf())
            .list_backups()
            .unwrap()
            .iter()
            .map(|b| std::fs::read_to_string(dir.join("backups").join(&b.name)).unwrap())
            .collect()
    }

    #[tokio::test]
    async fn persisted_store_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let store = LocalStore::open(dir.path().to_path_buf()).unwrap();
        let id = store
            .create("tasks", TaskFields::new("persist me").into_fields())
            .await
            .unwrap();
        drop(store);

        let reopened = LocalStore::open(dir.path().to_path_buf()).unwrap();
        let snapshot = reopened.snapshot("tasks");
        assert_eq!(ids(&snapshot), vec![id]);
        assert_eq!(snapshot[0].fields["task"], "persist me");
        assert!(backup_contents(dir.path()).is_empty());
    }

    #[tokio::test]
    async fn backup_is_taken_once_before_first_write_after_open() {
        let dir = tempfile::tempdir().unwrap();
        let store = LocalStore::open(dir.path().to_path_buf()).unwrap();
        let id = store
            .create("tasks", TaskFields::new("v1").into_fields())
            .await
            .unwrap();
        drop(store);

        let store = LocalStore::open(dir.path().to_path_buf()).unwrap();
        store.delete("tasks", &id).await.unwrap();
        store
            .create("tasks", TaskFields::new("v2").into_fields())
            .await
            .unwrap();
        drop(store);
        let backups = backup_contents(dir.path());
        assert_eq!(backups.len(), 1);
        assert!(backups[0].contains("v1"));

        for _ in 0..6 {
            let store = LocalStore::open(dir.path().to_path_buf()).unwrap();
            assert_eq!(store.snapshot("tasks").len(), 1);
        }
        let backups = backup_contents(dir.path());
        assert_eq!(backups.len(), 1);
        assert!(backups[0].contains("v1"));
    }

    #[tokio::test]
    async fn rejected_mutation_leaves_no_empty_collection_behind() {
        let dir = tempfile::tempdir().unwrap();
        let store = LocalStore::open(dir.path().to_path_buf()).unwrap();
        assert_eq!(
            store.delete("ghost", "nope").await,
            Err(StoreError::not_found("ghost", "nope"))
        );
        store
            .create("tasks", TaskFields::new("real").into_fields())
            .await
            .unwrap();
        let file = Storage::new(dir.path().to_path_buf())
            .load_collections()
            .unwrap();
        let names: Vec<&str> = file.collections.iter().map(|c| c.name.as_str()).collect();
        assert_eq!(names, vec!["tasks"]);
    }

    #[tokio::test]
    async fn failed_persistence_rolls_back() {
        let dir = tempfile::tempdir().unwrap();
        let store = LocalStore::open(dir.path().to_path_buf()).unwrap();
        store
            .create("tasks", TaskFields::new("kept").into_fields())
            .await
            .unwrap();
        // A directory where the temp file should go makes the atomic write fail.
        std::fs::create_dir(dir.path().join("collections.tmp")).unwrap();
        let result = store
            .create("tasks", TaskFields::new("lost").into_fields())
            .await;
        assert!(matches!(result, Err(StoreError::Persistence(_))));
        assert_eq!(store.snapshot("tasks").len(), 1);
    }

    #[tokio::test]
    async fn failed_persistence_does_not_keep_new_collection() {
        let dir = tempfile::tempdir().unwrap();
        let store = LocalStore::open(dir.path().to_path_buf()).unwrap();
        std::fs::create_dir(dir.path().join("collections.tmp")).unwrap();
        let result = store
            .create("fresh", TaskFields::new("lost").into_fields())
            .await;
        assert!(matches!(result, Err(StoreError::Persistence(_))));
        std::fs::remove_dir(dir.path().join("collections.tmp")).unwrap();

        store
            .create("tasks", TaskFields::new("kept").into_fields())
            .await
            .unwrap();
        let file = Storage::new(dir.path().to_path_buf())
            .load_collections()
            .unwrap();
        let names: Vec<&str> = file.collections.iter().map(|c| c.name.as_str()).collect();
        assert_eq!(names, vec!["tasks"]);
    }
}
