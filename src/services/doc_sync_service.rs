use chrono::Utc;
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{mpsc, OwnedMutexGuard};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::config::Config;
use crate::metrics::Metrics;
use crate::models::lorodoc::{CrdtDoc, CrdtError};
use crate::models::{CollaboratorPermission, DocumentMetadata, MetadataEnvelope, RelayMessage, UpdateEnvelope};
use crate::pubsub::{doc_topic, PubSubBridge};
use crate::store::{self, CacheStore, StoreError};

#[derive(Debug, Error)]
pub enum SyncError {
    #[error("Document '{0}' not found")]
    NotFound(String),
    #[error("Access denied to document '{0}'")]
    AccessDenied(String),
    #[error("Invalid update data: {0}")]
    InvalidUpdate(String),
    #[error(transparent)]
    Crdt(#[from] CrdtError),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("Stored metadata for '{0}' is corrupt: {1}")]
    CorruptMetadata(String, String),
}

#[derive(Debug, Clone)]
pub struct SyncConfig {
    pub inactivity: Duration,
    pub sweep_interval: Duration,
    pub snapshot_ttl: Option<Duration>,
    pub store_timeout: Duration,
}

impl SyncConfig {
    pub fn from_config(config: &Config) -> Self {
        Self {
            inactivity: config.doc_inactivity(),
            sweep_interval: config.doc_sweep_interval(),
            snapshot_ttl: config.snapshot_ttl(),
            store_timeout: config.downstream_timeout(),
        }
    }
}

/// What a user may do with one document
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DocumentAccess {
    pub read: bool,
    pub write: bool,
}

/// Called with every applied update the broker could not carry
pub type LocalBroadcast = Arc<dyn Fn(&UpdateEnvelope) + Send + Sync>;

struct DocState {
    crdt: CrdtDoc,
    meta: DocumentMetadata,
    /// Bumped on every in-memory mutation, CRDT or metadata
    revision: u64,
    last_timestamp: i64,
}

struct DocEntry {
    state: tokio::sync::Mutex<DocState>,
    /// Highest revision written to the store
    persisted: tokio::sync::Mutex<u64>,
    touched: Mutex<Instant>,
    dirty: AtomicBool,
    /// Set under the state lock; nothing is written for the entry afterwards
    deleted: AtomicBool,
}

impl DocEntry {
    fn new(crdt: CrdtDoc, meta: DocumentMetadata) -> Self {
        Self {
            state: tokio::sync::Mutex::new(DocState {
                crdt,
                meta,
                revision: 0,
                last_timestamp: 0,
            }),
            persisted: tokio::sync::Mutex::new(0),
            touched: Mutex::new(Instant::now()),
            dirty: AtomicBool::new(false),
            deleted: AtomicBool::new(false),
        }
    }

    fn touch(&self) {
        *self.touched.lock() = Instant::now();
    }

    fn is_deleted(&self) -> bool {
        self.deleted.load(Ordering::SeqCst)
    }
}

/// Serializes listener registration for one document. The flag marks a slot that has
/// been retired; waiters that see it take a fresh slot.
type RelaySlot = Arc<tokio::sync::Mutex<bool>>;

#[derive(Default)]
struct DocListeners {
    senders: HashMap<u64, mpsc::UnboundedSender<UpdateEnvelope>>,
    relay: Option<JoinHandle<()>>,
}

/// Returned by [`DocSyncService::on_update`]; dropping it does not unsubscribe.
#[derive(Debug)]
pub struct ListenerHandle {
    engine: Weak<DocSyncService>,
    doc_id: String,
    id: u64,
}

impl ListenerHandle {
    pub fn doc_id(&self) -> &str {
        &self.doc_id
    }

    pub async fn unsubscribe(self) {
        if let Some(engine) = self.engine.upgrade() {
            engine.remove_listener(&self.doc_id, self.id).await;
        }
    }
}

/// Owner of in-memory CRDT state for every open document.
///
/// Each document is its own lock domain. The document map is only locked for lookup and
/// insertion, never across I/O. Persistence and broker publishes run after the per-document
/// lock is released; a revision guard keeps a slow older write from replacing a newer one.
pub struct DocSyncService {
    store: Arc<dyn CacheStore>,
    bridge: Arc<PubSubBridge>,
    metrics: Arc<Metrics>,
    config: SyncConfig,
    instance_id: String,
    docs: RwLock<HashMap<String, Arc<DocEntry>>>,
    listeners: Mutex<HashMap<String, DocListeners>>,
    next_listener_id: AtomicU64,
    relay_slots: Mutex<HashMap<String, RelaySlot>>,
    local_broadcast: RwLock<Option<LocalBroadcast>>,
}

impl DocSyncService {
    pub fn new(
        store: Arc<dyn CacheStore>,
        bridge: Arc<PubSubBridge>,
        metrics: Arc<Metrics>,
        config: SyncConfig,
    ) -> Arc<Self> {
        let instance_id = Uuid::new_v4().to_string();
        info!("Document sync service started as instance {}", instance_id);
        Arc::new(Self {
            store,
            bridge,
            metrics,
            config,
            instance_id,
            docs: RwLock::new(HashMap::new()),
            listeners: Mutex::new(HashMap::new()),
            next_listener_id: AtomicU64::new(1),
            relay_slots: Mutex::new(HashMap::new()),
            local_broadcast: RwLock::new(None),
        })
    }

    pub fn instance_id(&self) -> &str {
        &self.instance_id
    }

    /// Register the callback invoked for updates applied while the broker is in fallback
    pub fn set_local_broadcast(&self, callback: LocalBroadcast) {
        *self.local_broadcast.write() = Some(callback);
    }

    pub async fn create_document(&self, owner_id: &str, title: &str, is_public: bool) -> Result<DocumentMetadata, SyncError> {
        let doc_id = Uuid::new_v4().to_string();
        let crdt = CrdtDoc::new();
        let snapshot = crdt.encode_state()?;
        let meta = DocumentMetadata::new(doc_id.clone(), owner_id, title.to_string(), is_public);

        let entry = Arc::new(DocEntry::new(crdt, meta.clone()));
        {
            let mut state = entry.state.lock().await;
            state.revision = 1;
        }
        self.docs.write().insert(doc_id.clone(), entry.clone());
        self.persist(&doc_id, &entry, 1, Some(snapshot), &meta).await;

        self.metrics.document_op("create");
        info!("Document {} created by {} (public: {})", doc_id, owner_id, is_public);
        Ok(meta)
    }

    pub async fn get_snapshot(&self, doc_id: &str) -> Result<Vec<u8>, SyncError> {
        let entry = self.require_entry(doc_id).await?;
        let state = entry.state.lock().await;
        Ok(state.crdt.encode_state()?)
    }

    pub async fn get_metadata(&self, doc_id: &str) -> Result<DocumentMetadata, SyncError> {
        let entry = self.require_entry(doc_id).await?;
        let state = entry.state.lock().await;
        Ok(state.meta.clone())
    }

    /// Snapshot and metadata taken under one lock, so they describe the same version
    pub async fn get_document(&self, doc_id: &str) -> Result<(Vec<u8>, DocumentMetadata), SyncError> {
        let entry = self.require_entry(doc_id).await?;
        let state = entry.state.lock().await;
        Ok((state.crdt.encode_state()?, state.meta.clone()))
    }

    pub async fn access(&self, doc_id: &str, user_id: &str) -> Result<DocumentAccess, SyncError> {
        let meta = self.get_metadata(doc_id).await?;
        Ok(DocumentAccess {
            read: meta.can_read(user_id),
            write: meta.can_write(user_id),
        })
    }

    pub async fn has_read_access(&self, doc_id: &str, user_id: &str) -> bool {
        self.access(doc_id, user_id).await.is_ok_and(|a| a.read)
    }

    pub async fn has_write_access(&self, doc_id: &str, user_id: &str) -> bool {
        self.access(doc_id, user_id).await.is_ok_and(|a| a.write)
    }

    /// Merge `update` into the document on behalf of `user_id`.
    ///
    /// Write access is checked again here regardless of what the caller checked. Local
    /// listeners are notified before the document lock is released; persistence and the
    /// broker publish follow. A failed persist or an unreachable broker does not fail the
    /// call once the merge succeeded.
    pub async fn apply_update(
        &self,
        doc_id: &str,
        user_id: &str,
        update: &[u8],
        origin_connection: Option<&str>,
    ) -> Result<UpdateEnvelope, SyncError> {
        if update.is_empty() {
            return Err(SyncError::InvalidUpdate("empty update".to_string()));
        }
        let entry = self.require_entry(doc_id).await?;

        let (envelope, revision, snapshot, meta) = {
            let mut state = entry.state.lock().await;
            if entry.is_deleted() {
                return Err(SyncError::NotFound(doc_id.to_string()));
            }
            if !state.meta.can_write(user_id) {
                return Err(SyncError::AccessDenied(doc_id.to_string()));
            }
            state
                .crdt
                .apply_update(update)
                .map_err(|e| SyncError::InvalidUpdate(e.to_string()))?;

            let timestamp = Utc::now().timestamp_millis().max(state.last_timestamp + 1);
            state.last_timestamp = timestamp;
            state.meta.version += 1;
            state.meta.last_activity = Utc::now();
            state.revision += 1;
            entry.touch();

            let envelope = UpdateEnvelope {
                document_id: doc_id.to_string(),
                update: update.to_vec(),
                user_id: user_id.to_string(),
                timestamp,
                origin_connection: origin_connection.map(str::to_string),
                origin_instance: self.instance_id.clone(),
            };
            self.notify_listeners(&envelope);

            (envelope, state.revision, state.crdt.encode_state()?, state.meta.clone())
        };

        self.persist(doc_id, &entry, revision, Some(snapshot), &meta).await;
        self.metrics.document_op("update");

        if self.relay(doc_id, &RelayMessage::Update(envelope.clone())).await {
            let callback = self.local_broadcast.read().clone();
            if let Some(callback) = callback {
                callback(&envelope);
            }
        }

        debug!("Applied update to {} (version {}) from {}", doc_id, meta.version, user_id);
        Ok(envelope)
    }

    pub async fn add_collaborator(&self, doc_id: &str, user_id: &str, permission: CollaboratorPermission) -> Result<DocumentMetadata, SyncError> {
        let entry = self.require_entry(doc_id).await?;
        let (revision, meta) = {
            let mut state = entry.state.lock().await;
            if entry.is_deleted() {
                return Err(SyncError::NotFound(doc_id.to_string()));
            }
            state.meta.collaborators.insert(user_id.to_string(), permission);
            state.revision += 1;
            (state.revision, state.meta.clone())
        };
        self.persist(doc_id, &entry, revision, None, &meta).await;
        self.relay_metadata(doc_id, Some(meta.clone())).await;
        self.metrics.collaborator_changed();
        info!("Collaborator {} set to {} on {}", user_id, permission, doc_id);
        Ok(meta)
    }

    /// Returns whether the user was a collaborator
    pub async fn remove_collaborator(&self, doc_id: &str, user_id: &str) -> Result<bool, SyncError> {
        let entry = self.require_entry(doc_id).await?;
        let (removed, revision, meta) = {
            let mut state = entry.state.lock().await;
            if entry.is_deleted() {
                return Err(SyncError::NotFound(doc_id.to_string()));
            }
            let removed = state.meta.collaborators.remove(user_id).is_some();
            if removed {
                state.revision += 1;
            }
            (removed, state.revision, state.meta.clone())
        };
        if removed {
            self.persist(doc_id, &entry, revision, None, &meta).await;
            self.relay_metadata(doc_id, Some(meta)).await;
            self.metrics.collaborator_changed();
            info!("Collaborator {} removed from {}", user_id, doc_id);
        }
        Ok(removed)
    }

    /// Change title and visibility. Owner only.
    pub async fn update_metadata(
        &self,
        doc_id: &str,
        requester_id: &str,
        title: Option<String>,
        is_public: Option<bool>,
    ) -> Result<DocumentMetadata, SyncError> {
        let entry = self.require_entry(doc_id).await?;
        let (revision, meta) = {
            let mut state = entry.state.lock().await;
            if entry.is_deleted() {
                return Err(SyncError::NotFound(doc_id.to_string()));
            }
            if state.meta.owner_id != requester_id {
                return Err(SyncError::AccessDenied(doc_id.to_string()));
            }
            if let Some(title) = title {
                state.meta.title = title;
            }
            if let Some(is_public) = is_public {
                state.meta.is_public = is_public;
            }
            state.revision += 1;
            (state.revision, state.meta.clone())
        };
        self.persist(doc_id, &entry, revision, None, &meta).await;
        self.relay_metadata(doc_id, Some(meta.clone())).await;
        Ok(meta)
    }

    /// Delete a document from memory and the store. Only the owner may do this. Other
    /// instances holding the document drop it when the deletion reaches them.
    pub async fn delete_document(&self, doc_id: &str, requester_id: &str) -> bool {
        let entry = match self.require_entry(doc_id).await {
            Ok(entry) => entry,
            Err(e) => {
                debug!("Delete of {} refused: {}", doc_id, e);
                return false;
            }
        };
        {
            let state = entry.state.lock().await;
            if entry.is_deleted() {
                return false;
            }
            if state.meta.owner_id != requester_id {
                warn!("User {} attempted to delete document {} owned by {}", requester_id, doc_id, state.meta.owner_id);
                return false;
            }
            entry.deleted.store(true, Ordering::SeqCst);
        }

        self.purge(doc_id, &entry).await;
        self.relay_metadata(doc_id, None).await;
        self.metrics.document_op("delete");
        info!("Document {} deleted by {}", doc_id, requester_id);
        true
    }

    /// Remove a deleted entry from memory and its keys from the store. The persist lock is
    /// held throughout, so a write of the entry already in flight lands before the keys go.
    async fn purge(&self, doc_id: &str, entry: &Arc<DocEntry>) {
        let _persisted = entry.persisted.lock().await;
        {
            let mut docs = self.docs.write();
            if docs.get(doc_id).is_some_and(|current| Arc::ptr_eq(current, entry)) {
                docs.remove(doc_id);
            }
        }
        for key in [store::state_key(doc_id), store::meta_key(doc_id)] {
            if let Err(e) = store::with_timeout(self.config.store_timeout, self.store.delete(&key)).await {
                error!("Failed to delete '{}' from store: {}", key, e);
                self.metrics.persistence_failure();
            }
        }
    }

    /// Publish on the document topic. Returns whether the bridge was in fallback.
    async fn relay(&self, doc_id: &str, message: &RelayMessage) -> bool {
        match serde_json::to_vec(message) {
            Ok(payload) => self.bridge.publish(&doc_topic(doc_id), payload).await.fallback,
            Err(e) => {
                error!("Failed to encode relay message for {}: {}", doc_id, e);
                false
            }
        }
    }

    async fn relay_metadata(&self, doc_id: &str, metadata: Option<DocumentMetadata>) {
        let change = MetadataEnvelope {
            document_id: doc_id.to_string(),
            metadata,
            origin_instance: self.instance_id.clone(),
        };
        self.relay(doc_id, &RelayMessage::Metadata(change)).await;
    }

    /// Register a local listener for `doc_id`. The first listener of a document also
    /// subscribes this process to the document's broker topic; the last one to leave
    /// drops that subscription.
    pub async fn on_update(self: &Arc<Self>, doc_id: &str) -> (ListenerHandle, mpsc::UnboundedReceiver<UpdateEnvelope>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let id = self.next_listener_id.fetch_add(1, Ordering::Relaxed);

        let (_slot, _guard) = self.relay_slot(doc_id).await;
        let needs_relay = {
            let mut listeners = self.listeners.lock();
            let entry = listeners.entry(doc_id.to_string()).or_default();
            entry.senders.insert(id, tx);
            entry.relay.is_none()
        };
        if needs_relay {
            let relay = self.start_relay(doc_id).await;
            match self.listeners.lock().get_mut(doc_id) {
                Some(entry) => entry.relay = Some(relay),
                None => relay.abort(),
            }
        }

        let handle = ListenerHandle {
            engine: Arc::downgrade(self),
            doc_id: doc_id.to_string(),
            id,
        };
        (handle, rx)
    }

    async fn remove_listener(&self, doc_id: &str, id: u64) {
        let (slot, mut retired) = self.relay_slot(doc_id).await;
        let (now_empty, relay) = {
            let mut listeners = self.listeners.lock();
            let now_empty = match listeners.get_mut(doc_id) {
                Some(entry) => {
                    entry.senders.remove(&id);
                    entry.senders.is_empty()
                }
                None => true,
            };
            let relay = if now_empty {
                listeners.remove(doc_id).and_then(|entry| entry.relay)
            } else {
                None
            };
            (now_empty, relay)
        };
        if let Some(relay) = relay {
            relay.abort();
            self.bridge.unsubscribe(&doc_topic(doc_id)).await;
            debug!("Broker subscription for {} released", doc_id);
        }
        if now_empty {
            *retired = true;
            let mut slots = self.relay_slots.lock();
            if slots.get(doc_id).is_some_and(|current| Arc::ptr_eq(current, &slot)) {
                slots.remove(doc_id);
            }
        }
    }

    /// Lock the registration slot of one document. Other documents are not held up while
    /// a broker subscribe for this one is in flight.
    async fn relay_slot(&self, doc_id: &str) -> (RelaySlot, OwnedMutexGuard<bool>) {
        loop {
            let slot = self.relay_slots.lock().entry(doc_id.to_string()).or_default().clone();
            let guard = slot.clone().lock_owned().await;
            if !*guard {
                return (slot, guard);
            }
        }
    }

    pub fn listener_count(&self, doc_id: &str) -> usize {
        self.listeners
            .lock()
            .get(doc_id)
            .map_or(0, |entry| entry.senders.len())
    }

    fn has_relay(&self, doc_id: &str) -> bool {
        self.listeners
            .lock()
            .get(doc_id)
            .is_some_and(|entry| entry.relay.is_some())
    }

    async fn start_relay(self: &Arc<Self>, doc_id: &str) -> JoinHandle<()> {
        let (outcome, mut rx) = self.bridge.subscribe(&doc_topic(doc_id)).await;
        if outcome.fallback {
            debug!("Broker subscription for {} pending until the broker is back", doc_id);
        }
        let engine = Arc::downgrade(self);
        tokio::spawn(async move {
            while let Some(payload) = rx.recv().await {
                let Some(engine) = engine.upgrade() else {
                    return;
                };
                match serde_json::from_slice::<RelayMessage>(&payload) {
                    Ok(message) => engine.ingest_remote(message).await,
                    Err(e) => warn!("Dropping malformed broker message: {}", e),
                }
            }
        })
    }

    /// Fold in a message relayed by the broker. Messages this instance published took
    /// effect locally when they were made and are skipped.
    async fn ingest_remote(&self, message: RelayMessage) {
        if message.origin_instance() == self.instance_id {
            return;
        }
        match message {
            RelayMessage::Update(envelope) => self.ingest_update(envelope).await,
            RelayMessage::Metadata(change) => self.ingest_metadata(change).await,
        }
    }

    /// Merge a remote update, fan it out to local listeners and write the merged state
    /// back, so the store holds the union of what every instance applied.
    async fn ingest_update(&self, envelope: UpdateEnvelope) {
        let doc_id = envelope.document_id.clone();
        let entry = match self.load_entry(&doc_id).await {
            Ok(Some(entry)) => entry,
            Ok(None) => {
                debug!("Dropping relayed update for unknown document {}", doc_id);
                return;
            }
            Err(e) => {
                warn!("Could not load {} for a relayed update: {}", doc_id, e);
                self.notify_listeners(&envelope);
                return;
            }
        };

        let (revision, snapshot, meta) = {
            let mut state = entry.state.lock().await;
            if entry.is_deleted() {
                return;
            }
            if let Err(e) = state.crdt.apply_update(&envelope.update) {
                warn!("Dropping relayed update for {} that does not merge: {}", doc_id, e);
                return;
            }
            state.meta.version += 1;
            state.meta.last_activity = Utc::now();
            state.last_timestamp = state.last_timestamp.max(envelope.timestamp);
            state.revision += 1;
            entry.touch();
            self.notify_listeners(&envelope);

            match state.crdt.encode_state() {
                Ok(snapshot) => (state.revision, snapshot, state.meta.clone()),
                Err(e) => {
                    error!("Failed to encode {} after a relayed update: {}", doc_id, e);
                    entry.dirty.store(true, Ordering::SeqCst);
                    return;
                }
            }
        };
        self.persist(&doc_id, &entry, revision, Some(snapshot), &meta).await;
    }

    async fn ingest_metadata(&self, change: MetadataEnvelope) {
        let doc_id = change.document_id;
        let loaded = self.docs.read().get(&doc_id).cloned();
        let Some(entry) = loaded else {
            return;
        };

        match change.metadata {
            Some(remote) => {
                let (revision, meta) = {
                    let mut state = entry.state.lock().await;
                    if entry.is_deleted() {
                        return;
                    }
                    let version = state.meta.version.max(remote.version);
                    state.meta = DocumentMetadata { version, ..remote };
                    state.revision += 1;
                    (state.revision, state.meta.clone())
                };
                self.persist(&doc_id, &entry, revision, None, &meta).await;
                debug!("Metadata of {} changed on instance {}", doc_id, change.origin_instance);
            }
            None => {
                {
                    let _state = entry.state.lock().await;
                    entry.deleted.store(true, Ordering::SeqCst);
                }
                self.purge(&doc_id, &entry).await;
                info!("Document {} deleted on instance {}", doc_id, change.origin_instance);
            }
        }
    }

    fn notify_listeners(&self, envelope: &UpdateEnvelope) {
        let listeners = self.listeners.lock();
        if let Some(entry) = listeners.get(&envelope.document_id) {
            for sender in entry.senders.values() {
                let _ = sender.send(envelope.clone());
            }
        }
    }

    /// Number of documents currently held in memory
    pub fn loaded_count(&self) -> usize {
        self.docs.read().len()
    }

    pub fn is_loaded(&self, doc_id: &str) -> bool {
        self.docs.read().contains_key(doc_id)
    }

    /// Evict documents idle for longer than the inactivity window. Entries in use, or
    /// whose last write did not reach the store, stay. Listener registrations are not
    /// touched; the next access reloads from the store.
    pub fn sweep_inactive(&self) -> usize {
        let now = Instant::now();
        let inactivity = self.config.inactivity;
        let mut docs = self.docs.write();
        let before = docs.len();
        docs.retain(|doc_id, entry| {
            let idle = now.saturating_duration_since(*entry.touched.lock());
            let keep = idle < inactivity || Arc::strong_count(entry) > 1 || entry.dirty.load(Ordering::SeqCst);
            if !keep {
                debug!("Evicting idle document {}", doc_id);
            }
            keep
        });
        let evicted = before - docs.len();
        if evicted > 0 {
            info!("Evicted {} idle documents from memory", evicted);
        }
        evicted
    }

    pub fn spawn_inactivity_sweep(self: &Arc<Self>, cancel: CancellationToken) -> JoinHandle<()> {
        let engine = Arc::downgrade(self);
        let period = self.config.sweep_interval;
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            interval.tick().await;
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => return,
                    _ = interval.tick() => {}
                }
                match engine.upgrade() {
                    Some(engine) => {
                        engine.sweep_inactive();
                    }
                    None => return,
                }
            }
        })
    }

    async fn require_entry(&self, doc_id: &str) -> Result<Arc<DocEntry>, SyncError> {
        self.load_entry(doc_id)
            .await?
            .ok_or_else(|| SyncError::NotFound(doc_id.to_string()))
    }

    /// Memory first, then the store. A cold load runs without any map lock held; if two
    /// loads race, the first insert wins and the other adopts it. A cached entry without a
    /// broker relay is caught up with the store first, since nothing else keeps it current.
    async fn load_entry(&self, doc_id: &str) -> Result<Option<Arc<DocEntry>>, SyncError> {
        let cached = self.docs.read().get(doc_id).cloned();
        if let Some(entry) = cached {
            entry.touch();
            if self.has_relay(doc_id) {
                return Ok(Some(entry));
            }
            return Ok(self.refresh(doc_id, entry).await);
        }

        let timeout = self.config.store_timeout;
        let Some(meta_bytes) = store::with_timeout(timeout, self.store.get(&store::meta_key(doc_id))).await? else {
            return Ok(None);
        };
        let meta: DocumentMetadata = serde_json::from_slice(&meta_bytes)
            .map_err(|e| SyncError::CorruptMetadata(doc_id.to_string(), e.to_string()))?;
        let state_bytes = store::with_timeout(timeout, self.store.get(&store::state_key(doc_id)))
            .await?
            .unwrap_or_default();
        let crdt = CrdtDoc::from_snapshot(&state_bytes)?;

        debug!("Loaded document {} from store (version {})", doc_id, meta.version);
        let entry = Arc::new(DocEntry::new(crdt, meta));
        let mut docs = self.docs.write();
        Ok(Some(docs.entry(doc_id.to_string()).or_insert(entry).clone()))
    }

    /// Merge the stored state of `doc_id` into a cached entry whose every revision has been
    /// written. Entries with unwritten changes are served as they are. Store errors leave the
    /// cached copy in place.
    async fn refresh(&self, doc_id: &str, entry: Arc<DocEntry>) -> Option<Arc<DocEntry>> {
        if entry.dirty.load(Ordering::SeqCst) {
            return Some(entry);
        }
        let persisted = entry.persisted.lock().await;
        let timeout = self.config.store_timeout;
        let stored = async {
            let meta = store::with_timeout(timeout, self.store.get(&store::meta_key(doc_id))).await?;
            let state = store::with_timeout(timeout, self.store.get(&store::state_key(doc_id))).await?;
            Ok::<_, StoreError>((meta, state))
        };
        let (meta_bytes, state_bytes) = match stored.await {
            Ok(stored) => stored,
            Err(e) => {
                warn!("Serving cached copy of {}, store read failed: {}", doc_id, e);
                return Some(entry.clone());
            }
        };

        let mut state = entry.state.lock().await;
        if entry.is_deleted() {
            return None;
        }
        if state.revision != *persisted {
            return Some(entry.clone());
        }
        let Some(meta_bytes) = meta_bytes else {
            debug!("Document {} is gone from the store, dropping cached copy", doc_id);
            entry.deleted.store(true, Ordering::SeqCst);
            drop(state);
            drop(persisted);
            let mut docs = self.docs.write();
            if docs.get(doc_id).is_some_and(|current| Arc::ptr_eq(current, &entry)) {
                docs.remove(doc_id);
            }
            return None;
        };

        match serde_json::from_slice::<DocumentMetadata>(&meta_bytes) {
            Ok(stored) => {
                let version = state.meta.version.max(stored.version);
                state.meta = DocumentMetadata { version, ..stored };
            }
            Err(e) => warn!("Ignoring corrupt stored metadata for {}: {}", doc_id, e),
        }
        if let Some(bytes) = state_bytes {
            if let Err(e) = state.crdt.apply_update(&bytes) {
                warn!("Failed to merge stored state of {}: {}", doc_id, e);
            }
        }
        drop(state);
        drop(persisted);
        Some(entry)
    }

    async fn persist(&self, doc_id: &str, entry: &DocEntry, revision: u64, snapshot: Option<Vec<u8>>, meta: &DocumentMetadata) {
        let mut persisted = entry.persisted.lock().await;
        if entry.is_deleted() {
            debug!("Skipping persist of deleted document {}", doc_id);
            return;
        }
        if revision <= *persisted {
            debug!("Skipping stale persist of {} (revision {} <= {})", doc_id, revision, *persisted);
            return;
        }

        let meta_bytes = match serde_json::to_vec(meta) {
            Ok(bytes) => bytes,
            Err(e) => {
                error!("Failed to encode metadata for {}: {}", doc_id, e);
                return;
            }
        };

        let timeout = self.config.store_timeout;
        let ttl = self.config.snapshot_ttl;
        let mut result = Ok(());
        if let Some(snapshot) = snapshot {
            result = store::with_timeout(timeout, self.store.set(&store::state_key(doc_id), snapshot, ttl)).await;
        }
        if result.is_ok() {
            result = store::with_timeout(timeout, self.store.set(&store::meta_key(doc_id), meta_bytes, ttl)).await;
        }

        match result {
            Ok(()) => {
                *persisted = revision;
                entry.dirty.store(false, Ordering::SeqCst);
            }
            Err(e) => {
                error!("Failed to persist document {}: {}", doc_id, e);
                entry.dirty.store(true, Ordering::SeqCst);
                self.metrics.persistence_failure();
            }
        }
    }
}
