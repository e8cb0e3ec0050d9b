//! Sync engine: revalidating cache over the local mirror and the remote store.
//!
//! Reads are stale-while-revalidate. A cached page is returned immediately and
//! a background fetch refreshes it; a miss waits for the fetch. Identical
//! descriptors share one in-flight fetch. When the remote is unreachable the
//! page is derived from the [`LocalMirror`] instead.
//!
//! Writes are optimistic: the cache and the mirror change before the remote
//! call, then the outcome is reconciled. Every write walks the same state
//! machine ([`WriteState`]):
//!
//! ```text
//! issued -> applied_locally -> remote_confirmed -> reconciled
//!                           \-> remote_failed   -> reconciled_pending (create)
//!                                               -> rolled_back       (update, remove)
//! ```
//!
//! Creates that fail remotely stay visible as pending envelopes and are
//! retried at the start of the next query-driven revalidation.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use futures_util::future::{BoxFuture, FutureExt, Shared};
use indexmap::IndexMap;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

use crate::error::SyncError;
use crate::query::{PaginatedResult, QueryDescriptor};
use crate::remote::{ItemsPage, RemoteClient, RemoteError};
use crate::store::LocalMirror;
use crate::types::{CreateItemInput, Item, UpdateItemInput, is_provisional_id};

type SharedFetch = Shared<BoxFuture<'static, PaginatedResult>>;

/// Capacity of the change-notification channel.
const EVENT_CAPACITY: usize = 64;

// ============================================================================
// Write Types
// ============================================================================

/// Steps of a single optimistic write.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteState {
    Issued,
    AppliedLocally,
    RemoteConfirmed,
    RemoteFailed,
    /// Local state now matches the server.
    Reconciled,
    /// The server never confirmed; the optimistic record stays and is retried.
    ReconciledPending,
    /// The optimistic change was discarded in favour of authoritative state.
    RolledBack,
}

/// Lifecycle of an optimistic envelope.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    Pending,
    Confirmed,
    RolledBack,
}

/// A created item the server has not confirmed yet.
#[derive(Debug, Clone)]
pub struct Optimistic {
    pub item: Item,
    pub disposition: Disposition,
    /// Remote create attempts so far.
    pub attempts: u32,
    in_flight: bool,
}

impl Optimistic {
    fn new(item: Item) -> Self {
        Self {
            item,
            disposition: Disposition::Pending,
            attempts: 0,
            in_flight: false,
        }
    }
}

/// Result of an engine write.
#[derive(Debug, Clone)]
pub struct WriteOutcome {
    pub success: bool,
    /// Best-known version of the written item.
    pub item: Option<Item>,
    pub state: WriteState,
    pub error: Option<SyncError>,
}

impl WriteOutcome {
    fn done(item: Option<Item>, state: WriteState) -> Self {
        Self {
            success: true,
            item,
            state,
            error: None,
        }
    }

    fn failed(state: WriteState, error: SyncError) -> Self {
        Self {
            success: false,
            item: None,
            state,
            error: Some(error),
        }
    }
}

fn advance(op: &str, id: &str, state: WriteState) -> WriteState {
    debug!(op, id, ?state, "write state");
    state
}

/// Pre-update records, kept until the remote confirms or rejects an update.
struct UpdateUndo {
    /// The mirror's record, when the mirror held the item.
    mirror: Option<Item>,
    /// Each cached page that held the item, with its record before the patch.
    pages: Vec<(QueryDescriptor, Item)>,
}

/// What must still be sent after a create is confirmed.
enum Followup {
    None,
    /// The item was removed locally while its create was in flight.
    Delete,
    /// The item was edited locally while its create was in flight.
    Update(UpdateItemInput),
}

// ============================================================================
// Cache State
// ============================================================================

/// Identifies one fetch. A fetch may write the cache only while both its
/// generation (per key) and epoch (global) are still current.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Ticket {
    generation: u64,
    epoch: u64,
}

struct InFlight {
    generation: u64,
    fetch: SharedFetch,
}

#[derive(Default)]
struct CacheState {
    entries: HashMap<QueryDescriptor, PaginatedResult>,
    generations: HashMap<QueryDescriptor, u64>,
    inflight: HashMap<QueryDescriptor, InFlight>,
    /// Newest first.
    pending: IndexMap<String, Optimistic>,
    active: Option<QueryDescriptor>,
    clock: u64,
    epoch: u64,
}

impl CacheState {
    fn issue(&mut self, desc: &QueryDescriptor) -> Ticket {
        self.clock += 1;
        self.generations.insert(desc.clone(), self.clock);
        Ticket {
            generation: self.clock,
            epoch: self.epoch,
        }
    }

    fn is_current(&self, desc: &QueryDescriptor, ticket: Ticket) -> bool {
        self.epoch == ticket.epoch && self.generations.get(desc) == Some(&ticket.generation)
    }

    /// A local mutation happened: fetches already in flight must not land.
    fn invalidate(&mut self) {
        self.epoch += 1;
        self.inflight.clear();
    }

    /// Apply `f` to every cached page containing `id`; returns their keys.
    fn patch_entries(
        &mut self,
        id: &str,
        mut f: impl FnMut(&mut PaginatedResult),
    ) -> Vec<QueryDescriptor> {
        let mut touched = Vec::new();
        for (desc, entry) in self.entries.iter_mut() {
            if entry.contains(id) {
                f(entry);
                touched.push(desc.clone());
            }
        }
        touched
    }
}

// ============================================================================
// SyncEngine
// ============================================================================

struct Inner {
    remote: Arc<dyn RemoteClient>,
    mirror: LocalMirror,
    state: Mutex<CacheState>,
    events: broadcast::Sender<QueryDescriptor>,
    auth_required: AtomicBool,
}

/// Orchestrates reads and writes between the cache, the mirror and the remote.
///
/// Cloning yields another handle to the same engine.
#[derive(Clone)]
pub struct SyncEngine {
    inner: Arc<Inner>,
}

impl SyncEngine {
    /// Build an engine over an injected remote client and mirror.
    ///
    /// Records in the mirror that still carry a provisional id are restored as
    /// pending creates.
    pub fn new(remote: Arc<dyn RemoteClient>, mirror: LocalMirror) -> Self {
        let mut state = CacheState::default();
        for item in mirror.load().into_iter().filter(Item::is_provisional) {
            state.pending.insert(item.id.clone(), Optimistic::new(item));
        }
        if !state.pending.is_empty() {
            info!(count = state.pending.len(), "recovered unsynced items");
        }

        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            inner: Arc::new(Inner {
                remote,
                mirror,
                state: Mutex::new(state),
                events,
                auth_required: AtomicBool::new(false),
            }),
        }
    }

    pub fn mirror(&self) -> &LocalMirror {
        &self.inner.mirror
    }

    /// Receive the descriptor of every cache entry that changes.
    pub fn subscribe(&self) -> broadcast::Receiver<QueryDescriptor> {
        self.inner.events.subscribe()
    }

    /// True once after a remote call was rejected with 401.
    pub fn take_auth_required(&self) -> bool {
        self.inner.auth_required.swap(false, Ordering::SeqCst)
    }

    /// Creates the server has not confirmed yet, newest first.
    pub fn pending(&self) -> Vec<Optimistic> {
        self.state().pending.values().cloned().collect()
    }

    /// Peek at the cache without any I/O.
    pub fn cached(&self, desc: &QueryDescriptor) -> Option<PaginatedResult> {
        self.state().entries.get(desc).cloned()
    }

    // ------------------------------------------------------------------------
    // Reads
    // ------------------------------------------------------------------------

    /// Resolve a page and make `desc` the active view.
    ///
    /// A cached page is returned at once while a background fetch refreshes it.
    /// A miss waits for the fetch.
    pub async fn query(&self, desc: &QueryDescriptor) -> PaginatedResult {
        let cached = {
            let mut state = self.state();
            state.active = Some(desc.clone());
            state.entries.get(desc).cloned()
        };

        match cached {
            Some(result) => {
                drop(self.start_fetch(desc, false));
                result
            }
            None => self.start_fetch(desc, false).await,
        }
    }

    /// Fetch `desc`, joining a fetch already in flight for it.
    pub async fn revalidate(&self, desc: &QueryDescriptor) -> PaginatedResult {
        self.start_fetch(desc, false).await
    }

    /// Fetch `desc` anew, superseding any fetch in flight for it.
    pub async fn force_revalidate(&self, desc: &QueryDescriptor) -> PaginatedResult {
        self.start_fetch(desc, true).await
    }

    /// Look up one item: remote first, then the mirror and pending creates.
    pub async fn get(&self, id: &str) -> Option<Item> {
        if !is_provisional_id(id) {
            match self.inner.remote.get_item(id).await.into_result() {
                Ok(item) => return Some(item),
                Err(e) => self.note_remote_error("get", &e),
            }
        }
        self.inner
            .mirror
            .get(id)
            .or_else(|| self.state().pending.get(id).map(|e| e.item.clone()))
    }

    fn start_fetch(&self, desc: &QueryDescriptor, force: bool) -> SharedFetch {
        let mut state = self.state();
        if !force {
            if let Some(inflight) = state.inflight.get(desc) {
                debug!(?desc, "joining in-flight fetch");
                return inflight.fetch.clone();
            }
        }

        let ticket = state.issue(desc);
        let engine = self.clone();
        let key = desc.clone();
        let fetch = async move { engine.run_fetch(key, ticket, !force).await }
            .boxed()
            .shared();
        state.inflight.insert(
            desc.clone(),
            InFlight {
                generation: ticket.generation,
                fetch: fetch.clone(),
            },
        );
        drop(state);

        // Runs to completion even if every caller stops waiting.
        tokio::spawn(fetch.clone());
        fetch
    }

    async fn run_fetch(
        self,
        desc: QueryDescriptor,
        ticket: Ticket,
        retry_pending: bool,
    ) -> PaginatedResult {
        if retry_pending {
            self.sync_pending().await;
        }

        let remote = &self.inner.remote;
        let response = match desc.query.as_deref() {
            Some(q) if desc.uses_ai_search() => {
                remote.search_ai(q, desc.page, desc.page_size).await
            }
            query => remote.list_items(desc.page, desc.page_size, query).await,
        };

        match response.into_result() {
            Ok(page) => {
                let (result, snapshot) = self.accept_remote(&desc, page);
                self.store_result(&desc, ticket, result, snapshot)
            }
            Err(e) => {
                self.note_remote_error("fetch", &e);
                let result = self.inner.mirror.query(&desc);
                debug!(?desc, total = result.pagination.total_items, "served from local mirror");
                self.store_result(&desc, ticket, result, None)
            }
        }
    }

    /// Normalize a remote page and overlay unconfirmed creates.
    ///
    /// Also returns the server items when they are the complete collection, so
    /// the mirror can be reconciled against them.
    fn accept_remote(
        &self,
        desc: &QueryDescriptor,
        page: ItemsPage,
    ) -> (PaginatedResult, Option<Vec<Item>>) {
        if let Some(meta) = &page.ai_metadata {
            debug!(query = %meta.original_query, terms = ?meta.extracted_terms, "ai search");
        }

        let mut result = PaginatedResult::new(
            page.data,
            desc.page,
            desc.page_size,
            page.pagination.total_items,
        );

        let complete = desc.query.is_none()
            && desc.page == 1
            && result.items.len() as u64 == result.pagination.total_items;
        let snapshot = complete.then(|| result.items.clone());

        let pending: Vec<Item> = self
            .state()
            .pending
            .values()
            .map(|e| e.item.clone())
            .collect();
        overlay_pending(desc, &mut result, &pending);

        (result, snapshot)
    }

    fn store_result(
        &self,
        desc: &QueryDescriptor,
        ticket: Ticket,
        result: PaginatedResult,
        snapshot: Option<Vec<Item>>,
    ) -> PaginatedResult {
        let mut state = self.state();
        if state
            .inflight
            .get(desc)
            .is_some_and(|f| f.generation == ticket.generation)
        {
            state.inflight.remove(desc);
        }

        if !state.is_current(desc, ticket) {
            debug!(?desc, "discarding superseded fetch");
            return state.entries.get(desc).cloned().unwrap_or(result);
        }

        if let Some(items) = snapshot {
            if let Err(e) = self.inner.mirror.reconcile(&items) {
                warn!(error = %e, "failed to reconcile local mirror");
            }
        }
        state.entries.insert(desc.clone(), result.clone());
        drop(state);

        self.notify([desc.clone()]);
        result
    }

    // ------------------------------------------------------------------------
    // Writes
    // ------------------------------------------------------------------------

    /// Create an item optimistically.
    ///
    /// The item is visible in the active page before the remote call. A remote
    /// failure still reports success with the provisional item; it is retried on
    /// a later revalidation. Only invalid input fails.
    pub async fn create(&self, input: &CreateItemInput) -> WriteOutcome {
        let input = match input.validated() {
            Ok(input) => input,
            Err(e) => return WriteOutcome::failed(WriteState::Issued, e),
        };

        let item = Item::provisional(&input);
        advance("create", &item.id, WriteState::Issued);
        self.apply_create(&item);
        advance("create", &item.id, WriteState::AppliedLocally);

        let response = self.inner.remote.create_item(&input).await;
        let outcome = match response.into_result() {
            Ok(server_item) => {
                advance("create", &server_item.id, WriteState::RemoteConfirmed);
                let confirmed = self.reconcile_create(&item.id, server_item, true).await;
                let state = advance("create", &confirmed.id, WriteState::Reconciled);
                WriteOutcome::done(Some(confirmed), state)
            }
            Err(e) => {
                advance("create", &item.id, WriteState::RemoteFailed);
                self.note_remote_error("create", &e);
                let current = self.release_envelope(&item.id).unwrap_or(item);
                let state = advance("create", &current.id, WriteState::ReconciledPending);
                WriteOutcome {
                    success: true,
                    item: Some(current),
                    state,
                    error: Some(e.into()),
                }
            }
        };

        self.revalidate_active().await;
        outcome
    }

    /// Update an item optimistically; a remote failure rolls the change back.
    pub async fn update(&self, id: &str, input: &UpdateItemInput) -> WriteOutcome {
        let input = match input.validated() {
            Ok(input) => input,
            Err(e) => return WriteOutcome::failed(WriteState::Issued, e),
        };

        advance("update", id, WriteState::Issued);
        let undo = self.apply_update(id, &input);
        advance("update", id, WriteState::AppliedLocally);

        if is_provisional_id(id) {
            // Not on the server yet: the pending create carries the new values.
            let patched = {
                let mut state = self.state();
                state.pending.get_mut(id).map(|envelope| {
                    envelope.item.apply(&input);
                    envelope.item.clone()
                })
            };
            return match patched {
                Some(item) => WriteOutcome::done(
                    Some(item),
                    advance("update", id, WriteState::ReconciledPending),
                ),
                None => WriteOutcome::failed(
                    advance("update", id, WriteState::RolledBack),
                    SyncError::NotFound(id.to_string()),
                ),
            };
        }

        let response = self.inner.remote.update_item(id, &input).await;
        let outcome = match response.into_result() {
            Ok(server_item) => {
                advance("update", id, WriteState::RemoteConfirmed);
                if undo.mirror.is_some() {
                    if let Err(e) = self.inner.mirror.upsert(server_item.clone()) {
                        warn!(error = %e, id, "failed to persist updated item");
                    }
                }
                WriteOutcome::done(
                    Some(server_item),
                    advance("update", id, WriteState::Reconciled),
                )
            }
            Err(e) => {
                advance("update", id, WriteState::RemoteFailed);
                self.note_remote_error("update", &e);
                let unknown = undo.pages.is_empty() && undo.mirror.is_none();
                self.roll_back_update(id, undo);
                let error = match e {
                    RemoteError::Status { status: 404, .. } if unknown => {
                        SyncError::NotFound(id.to_string())
                    }
                    e => e.into(),
                };
                WriteOutcome::failed(advance("update", id, WriteState::RolledBack), error)
            }
        };

        self.revalidate_active().await;
        outcome
    }

    /// Remove an item optimistically, then revalidate whatever the outcome.
    pub async fn remove(&self, id: &str) -> WriteOutcome {
        advance("remove", id, WriteState::Issued);
        let removed = self.apply_remove(id);
        advance("remove", id, WriteState::AppliedLocally);

        if is_provisional_id(id) {
            let envelope = self.state().pending.shift_remove(id);
            if let Some(mut envelope) = envelope {
                envelope.disposition = Disposition::RolledBack;
                debug!(id, attempts = envelope.attempts, disposition = ?envelope.disposition, "dropped unsynced create");
            }
            return WriteOutcome::done(removed, advance("remove", id, WriteState::Reconciled));
        }

        let response = self.inner.remote.delete_item(id).await;
        let outcome = match response.into_result() {
            Ok(_) => {
                advance("remove", id, WriteState::RemoteConfirmed);
                WriteOutcome::done(removed, advance("remove", id, WriteState::Reconciled))
            }
            Err(e) => {
                // Still a success for the caller; revalidation restores the item.
                advance("remove", id, WriteState::RemoteFailed);
                self.note_remote_error("remove", &e);
                WriteOutcome {
                    success: true,
                    item: removed,
                    state: advance("remove", id, WriteState::RolledBack),
                    error: Some(e.into()),
                }
            }
        };

        self.revalidate_active().await;
        outcome
    }

    /// Retry every pending create that is not already being sent.
    ///
    /// Returns how many were confirmed. Stops early once the remote is
    /// unreachable.
    pub async fn sync_pending(&self) -> usize {
        let batch: Vec<Item> = {
            let mut state = self.state();
            state
                .pending
                .values_mut()
                .filter(|e| !e.in_flight)
                .map(|e| {
                    e.in_flight = true;
                    e.item.clone()
                })
                .collect()
        };
        if batch.is_empty() {
            return 0;
        }

        let mut confirmed = 0;
        let mut offline = false;
        for item in batch {
            if offline {
                self.release_envelope(&item.id);
                continue;
            }
            let input = CreateItemInput::new(item.name.clone(), item.location.clone());
            match self.inner.remote.create_item(&input).await.into_result() {
                Ok(server_item) => {
                    self.reconcile_create(&item.id, server_item, false).await;
                    confirmed += 1;
                }
                Err(e) => {
                    self.note_remote_error("retry create", &e);
                    offline = e.is_network();
                    self.release_envelope(&item.id);
                }
            }
        }

        if confirmed > 0 {
            info!(confirmed, "synced pending items");
        }
        confirmed
    }

    // ------------------------------------------------------------------------
    // Optimistic application
    // ------------------------------------------------------------------------

    fn apply_create(&self, item: &Item) {
        if let Err(e) = self.inner.mirror.append(item.clone()) {
            warn!(error = %e, id = %item.id, "failed to persist new item locally");
        }

        let touched = {
            let mut state = self.state();
            let mut envelope = Optimistic::new(item.clone());
            envelope.in_flight = true;
            state.pending.shift_insert(0, item.id.clone(), envelope);
            state.invalidate();

            match state.active.clone() {
                Some(active) => match state.entries.get_mut(&active) {
                    Some(entry) => {
                        entry.items.insert(0, item.clone());
                        entry.pagination.total_items += 1;
                        entry.renormalize();
                        Some(active)
                    }
                    None => None,
                },
                None => None,
            }
        };
        self.notify(touched);
    }

    fn apply_update(&self, id: &str, input: &UpdateItemInput) -> UpdateUndo {
        let mirror = self.inner.mirror.patch(id, input).unwrap_or_else(|e| {
            warn!(error = %e, id, "failed to patch item locally");
            None
        });

        let pages = {
            let mut state = self.state();
            let mut pages = Vec::new();
            for (desc, entry) in state.entries.iter_mut() {
                if let Some(item) = entry.items.iter_mut().find(|i| i.id == id) {
                    pages.push((desc.clone(), item.clone()));
                    item.apply(input);
                }
            }
            state.invalidate();
            pages
        };
        self.notify(pages.iter().map(|(desc, _)| desc.clone()));
        UpdateUndo { mirror, pages }
    }

    /// Put back the pre-update record in the mirror and in every cached page
    /// the update touched.
    fn roll_back_update(&self, id: &str, undo: UpdateUndo) {
        if let Some(previous) = undo.mirror {
            if let Err(e) = self.inner.mirror.upsert(previous) {
                warn!(error = %e, id, "failed to restore item after rejected update");
            }
        }

        let restored = {
            let mut state = self.state();
            let mut restored = Vec::new();
            for (desc, previous) in undo.pages {
                let slot = state
                    .entries
                    .get_mut(&desc)
                    .and_then(|entry| entry.items.iter_mut().find(|i| i.id == id));
                if let Some(slot) = slot {
                    *slot = previous;
                    restored.push(desc);
                }
            }
            state.invalidate();
            restored
        };
        debug!(id, pages = restored.len(), "rolled back rejected update");
        self.notify(restored);
    }

    /// Returns the removed record, from the mirror or the cache.
    fn apply_remove(&self, id: &str) -> Option<Item> {
        let mut removed = self.inner.mirror.get(id);
        if let Err(e) = self.inner.mirror.remove(id) {
            warn!(error = %e, id, "failed to remove item locally");
        }

        let touched = {
            let mut state = self.state();
            let touched = state.patch_entries(id, |entry| {
                if let Some(pos) = entry.items.iter().position(|i| i.id == id) {
                    let item = entry.items.remove(pos);
                    removed.get_or_insert(item);
                }
                entry.pagination.total_items = entry.pagination.total_items.saturating_sub(1);
                entry.renormalize();
            });
            state.invalidate();
            touched
        };
        self.notify(touched);
        removed
    }

    // ------------------------------------------------------------------------
    // Reconciliation
    // ------------------------------------------------------------------------

    /// Swap a provisional record for the server's, then send any edit or
    /// removal that happened while the create was in flight.
    async fn reconcile_create(&self, provisional_id: &str, server_item: Item, invalidate: bool) -> Item {
        let (confirmed, followup) = self.confirm_create(provisional_id, server_item, invalidate);
        match followup {
            Followup::None => {}
            Followup::Update(input) => {
                let response = self.inner.remote.update_item(&confirmed.id, &input).await;
                if let Err(e) = response.into_result() {
                    self.note_remote_error("update after create", &e);
                }
            }
            Followup::Delete => {
                let response = self.inner.remote.delete_item(&confirmed.id).await;
                if let Err(e) = response.into_result() {
                    self.note_remote_error("delete after create", &e);
                }
            }
        }
        confirmed
    }

    fn confirm_create(
        &self,
        provisional_id: &str,
        server_item: Item,
        invalidate: bool,
    ) -> (Item, Followup) {
        let (confirmed, followup, touched) = {
            let mut state = self.state();
            let Some(mut envelope) = state.pending.shift_remove(provisional_id) else {
                debug!(provisional_id, server_id = %server_item.id, "create confirmed after local removal");
                return (server_item, Followup::Delete);
            };
            envelope.disposition = Disposition::Confirmed;
            debug!(provisional_id, attempts = envelope.attempts, disposition = ?envelope.disposition, "pending create resolved");

            let mut confirmed = server_item;
            let mut followup = Followup::None;
            if envelope.item.name != confirmed.name || envelope.item.location != confirmed.location
            {
                let edit = UpdateItemInput {
                    name: Some(envelope.item.name.clone()),
                    location: Some(envelope.item.location.clone()),
                };
                confirmed.apply(&edit);
                followup = Followup::Update(edit);
            }

            let touched = state.patch_entries(provisional_id, |entry| {
                for item in entry.items.iter_mut().filter(|i| i.id == provisional_id) {
                    *item = confirmed.clone();
                }
            });
            if invalidate {
                state.invalidate();
            }
            (confirmed, followup, touched)
        };

        if let Err(e) = self.inner.mirror.replace(provisional_id, confirmed.clone()) {
            warn!(error = %e, id = %confirmed.id, "failed to persist confirmed item");
        }
        debug!(provisional_id, server_id = %confirmed.id, "create reconciled");
        self.notify(touched);
        (confirmed, followup)
    }

    /// Mark a pending create as retryable again; returns its current item.
    fn release_envelope(&self, id: &str) -> Option<Item> {
        let mut state = self.state();
        let envelope = state.pending.get_mut(id)?;
        envelope.in_flight = false;
        envelope.attempts += 1;
        Some(envelope.item.clone())
    }

    async fn revalidate_active(&self) {
        let active = self.state().active.clone();
        if let Some(desc) = active {
            self.force_revalidate(&desc).await;
        }
    }

    // ------------------------------------------------------------------------
    // Helpers
    // ------------------------------------------------------------------------

    fn note_remote_error(&self, op: &str, error: &RemoteError) {
        if matches!(error, RemoteError::Unauthorized) {
            self.inner.auth_required.store(true, Ordering::SeqCst);
        }
        warn!(op, %error, "remote call failed");
    }

    fn notify(&self, descs: impl IntoIterator<Item = QueryDescriptor>) {
        for desc in descs {
            // No subscribers is fine.
            let _ = self.inner.events.send(desc);
        }
    }

    fn state(&self) -> MutexGuard<'_, CacheState> {
        self.inner.state.lock().unwrap_or_else(|e| e.into_inner())
    }
}

/// Add pending creates missing from a server page: counted on every page,
/// listed at the head of page 1.
fn overlay_pending(desc: &QueryDescriptor, result: &mut PaginatedResult, pending: &[Item]) {
    let extra: Vec<Item> = pending
        .iter()
        .filter(|item| !result.contains(&item.id))
        .filter(|item| desc.query.as_deref().is_none_or(|q| item.matches(q)))
        .cloned()
        .collect();
    if extra.is_empty() {
        return;
    }

    result.pagination.total_items += extra.len() as u64;
    if desc.page == 1 {
        result.items.splice(0..0, extra);
    }
    result.renormalize();
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::query::SearchMode;
    use crate::remote::MockRemote;
    use crate::store::MemoryStore;

    fn engine_with(mock: Arc<MockRemote>) -> SyncEngine {
        SyncEngine::new(mock, LocalMirror::new(Arc::new(MemoryStore::new())))
    }

    fn names(result: &PaginatedResult) -> Vec<&str> {
        result.items.iter().map(|i| i.name.as_str()).collect()
    }

    fn relocate(location: &str) -> UpdateItemInput {
        UpdateItemInput {
            location: Some(location.to_string()),
            ..Default::default()
        }
    }

    // --- Reads ---

    #[tokio::test]
    async fn test_query_miss_fetches_remote() {
        let mock = Arc::new(MockRemote::new());
        mock.seed("Keys", "Drawer");
        let engine = engine_with(mock.clone());

        let page = engine.query(&QueryDescriptor::first_page()).await;
        assert_eq!(names(&page), vec!["Keys"]);
        assert_eq!(page.pagination.total_items, 1);
        assert_eq!(mock.count("list"), 1);
    }

    #[tokio::test]
    async fn test_identical_concurrent_queries_share_one_fetch() {
        let mock = Arc::new(MockRemote::new());
        let engine = engine_with(mock.clone());
        let desc = QueryDescriptor::new(1, 10, Some("keys"));

        let (a, b) = tokio::join!(engine.query(&desc), engine.query(&desc));
        assert_eq!(a, b);
        assert_eq!(mock.count("list"), 1);
    }

    #[tokio::test]
    async fn test_mode_switch_is_cache_miss() {
        let mock = Arc::new(MockRemote::new());
        mock.seed("Keys", "Drawer");
        let engine = engine_with(mock.clone());

        let keyword = QueryDescriptor::new(1, 10, Some("keys"));
        let natural = keyword.clone().with_mode(SearchMode::NaturalLanguage);
        engine.query(&keyword).await;
        engine.query(&natural).await;

        assert_eq!(mock.count("list"), 1);
        assert_eq!(mock.count("search_ai"), 1);
    }

    #[tokio::test]
    async fn test_natural_language_query_uses_ai_search() {
        let mock = Arc::new(MockRemote::new());
        mock.seed("Keys", "Drawer");
        mock.seed("Wallet", "Shelf");
        let engine = engine_with(mock.clone());

        let page = engine
            .query(&QueryDescriptor::new(1, 10, Some("where is my wallet")))
            .await;
        assert_eq!(names(&page), vec!["Wallet"]);
        assert_eq!(mock.count("search_ai"), 1);
        assert_eq!(mock.count("list"), 0);
    }

    #[tokio::test]
    async fn test_cached_query_returns_stale_then_revalidates() {
        let mock = Arc::new(MockRemote::new());
        mock.seed("Keys", "Drawer");
        let engine = engine_with(mock.clone());
        let desc = QueryDescriptor::first_page();
        engine.query(&desc).await;

        mock.seed("Wallet", "Shelf");
        let mut events = engine.subscribe();
        let stale = engine.query(&desc).await;
        assert_eq!(names(&stale), vec!["Keys"]);

        assert_eq!(events.recv().await.unwrap(), desc);
        assert_eq!(names(&engine.cached(&desc).unwrap()), vec!["Wallet", "Keys"]);
    }

    #[tokio::test]
    async fn test_offline_query_falls_back_to_mirror() {
        let mock = Arc::new(MockRemote::new());
        mock.set_online(false);
        let engine = engine_with(mock.clone());
        let mirror = engine.mirror().clone();
        for (name, location) in [("Keys", "Drawer"), ("Wallet", "Shelf"), ("Key card", "Bag")] {
            mirror
                .append(Item::provisional(&CreateItemInput::new(name, location)))
                .unwrap();
        }

        let page = engine
            .query(&QueryDescriptor::new(1, 1, Some("KEY")))
            .await;
        assert_eq!(names(&page), vec!["Key card"]);
        assert_eq!(page.pagination.total_items, 2);
        assert!(page.pagination.has_next_page);
    }

    #[tokio::test]
    async fn test_complete_listing_reconciles_mirror() {
        let mock = Arc::new(MockRemote::new());
        let keys = mock.seed("Keys", "Drawer");
        let engine = engine_with(mock.clone());
        let ghost = Item {
            id: "srv-gone".to_string(),
            ..keys.clone()
        };
        engine.mirror().append(ghost).unwrap();

        engine.query(&QueryDescriptor::first_page()).await;
        let ids: Vec<String> = engine.mirror().load().into_iter().map(|i| i.id).collect();
        assert_eq!(ids, vec![keys.id]);
    }

    #[tokio::test]
    async fn test_superseded_fetch_does_not_overwrite() {
        let engine = engine_with(Arc::new(MockRemote::new()));
        let desc = QueryDescriptor::first_page();
        let make = |name: &str| {
            PaginatedResult::new(
                vec![Item::provisional(&CreateItemInput::new(name, "x"))],
                1,
                10,
                1,
            )
        };

        let (stale, fresh) = {
            let mut state = engine.state();
            (state.issue(&desc), state.issue(&desc))
        };
        engine.store_result(&desc, fresh, make("fresh"), None);
        let returned = engine.store_result(&desc, stale, make("stale"), None);

        assert_eq!(names(&returned), vec!["fresh"]);
        assert_eq!(names(&engine.cached(&desc).unwrap()), vec!["fresh"]);
    }

    #[tokio::test]
    async fn test_unauthorized_is_reported_once() {
        let mock = Arc::new(MockRemote::new());
        mock.unauthorized.store(true, Ordering::SeqCst);
        let engine = engine_with(mock);

        let page = engine.query(&QueryDescriptor::first_page()).await;
        assert!(page.items.is_empty());
        assert!(engine.take_auth_required());
        assert!(!engine.take_auth_required());
    }

    // --- Create ---

    #[tokio::test]
    async fn test_create_visible_before_remote_responds() {
        let (mock, gate) = MockRemote::new().with_create_gate();
        let mock = Arc::new(mock);
        let engine = engine_with(mock.clone());
        let desc = QueryDescriptor::first_page();
        engine.query(&desc).await;

        let task = tokio::spawn({
            let engine = engine.clone();
            async move { engine.create(&CreateItemInput::new("Keys", "Drawer")).await }
        });
        mock.create_started.notified().await;

        let page = engine.query(&desc).await;
        assert_eq!(names(&page), vec!["Keys"]);
        assert_eq!(page.pagination.total_items, 1);
        assert_eq!(mock.count("create"), 0);

        gate.notify_one();
        let outcome = task.await.unwrap();
        assert!(outcome.success);
        assert_eq!(outcome.state, WriteState::Reconciled);
        let item = outcome.item.unwrap();
        assert!(!item.is_provisional());
        assert!(engine.pending().is_empty());

        let cached = engine.cached(&desc).unwrap();
        assert_eq!(cached.items.len(), 1);
        assert_eq!(cached.items[0].id, item.id);
        assert_eq!(engine.mirror().get(&item.id).unwrap().name, "Keys");
    }

    #[tokio::test]
    async fn test_create_trims_and_rejects_blank_input() {
        let engine = engine_with(Arc::new(MockRemote::new()));

        let outcome = engine.create(&CreateItemInput::new("  ", "Drawer")).await;
        assert!(!outcome.success);
        assert!(matches!(outcome.error, Some(SyncError::InvalidInput(_))));

        let outcome = engine.create(&CreateItemInput::new(" Keys ", " Drawer ")).await;
        let item = outcome.item.unwrap();
        assert_eq!((item.name.as_str(), item.location.as_str()), ("Keys", "Drawer"));
    }

    #[tokio::test]
    async fn test_failed_create_stays_visible_and_retries() {
        let mock = Arc::new(MockRemote::new());
        let engine = engine_with(mock.clone());
        let desc = QueryDescriptor::first_page();
        engine.query(&desc).await;

        mock.set_reject_writes(true);
        let outcome = engine.create(&CreateItemInput::new("Keys", "Drawer")).await;
        assert!(outcome.success);
        assert_eq!(outcome.state, WriteState::ReconciledPending);
        let provisional = outcome.item.unwrap();
        assert!(provisional.is_provisional());

        // The forced revalidation saw an empty server list but kept the item.
        let cached = engine.cached(&desc).unwrap();
        assert_eq!(names(&cached), vec!["Keys"]);
        assert_eq!(cached.pagination.total_items, 1);
        assert_eq!(engine.pending().len(), 1);
        assert_eq!(engine.pending()[0].attempts, 1);

        mock.set_reject_writes(false);
        let page = engine.revalidate(&desc).await;
        assert!(engine.pending().is_empty());
        assert_eq!(page.items.len(), 1);
        assert!(!page.items[0].is_provisional());
        assert!(engine.mirror().get(&provisional.id).is_none());
        assert_eq!(mock.items.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_offline_create_survives_restart() {
        let mock = Arc::new(MockRemote::new());
        mock.set_online(false);
        let store = Arc::new(MemoryStore::new());
        let engine = SyncEngine::new(mock.clone(), LocalMirror::new(store.clone()));
        engine.create(&CreateItemInput::new("Keys", "Drawer")).await;

        let restarted = SyncEngine::new(mock.clone(), LocalMirror::new(store));
        assert_eq!(restarted.pending().len(), 1);

        mock.set_online(true);
        assert_eq!(restarted.sync_pending().await, 1);
        assert!(restarted.pending().is_empty());
        assert_eq!(mock.count("create"), 2);
    }

    #[tokio::test]
    async fn test_remove_during_create_deletes_on_server() {
        let (mock, gate) = MockRemote::new().with_create_gate();
        let mock = Arc::new(mock);
        let engine = engine_with(mock.clone());

        let task = tokio::spawn({
            let engine = engine.clone();
            async move { engine.create(&CreateItemInput::new("Keys", "Drawer")).await }
        });
        mock.create_started.notified().await;
        let provisional = engine.pending()[0].item.id.clone();

        let removed = engine.remove(&provisional).await;
        assert!(removed.success);
        assert_eq!(mock.count("delete"), 0);

        gate.notify_one();
        task.await.unwrap();
        assert_eq!(mock.count("delete"), 1);
        assert!(mock.items.lock().unwrap().is_empty());
    }

    // --- Update ---

    #[tokio::test]
    async fn test_update_applies_and_confirms() {
        let mock = Arc::new(MockRemote::new());
        let keys = mock.seed("Keys", "Drawer");
        let engine = engine_with(mock.clone());
        let desc = QueryDescriptor::first_page();
        engine.query(&desc).await;

        let outcome = engine.update(&keys.id, &relocate("Hook")).await;
        assert!(outcome.success);
        assert_eq!(outcome.state, WriteState::Reconciled);
        assert_eq!(engine.cached(&desc).unwrap().items[0].location, "Hook");
        assert_eq!(mock.server_item(&keys.id).unwrap().location, "Hook");
        assert_eq!(engine.mirror().get(&keys.id).unwrap().location, "Hook");
    }

    #[tokio::test]
    async fn test_rejected_update_rolls_back() {
        let mock = Arc::new(MockRemote::new());
        let keys = mock.seed("Keys", "Drawer");
        let engine = engine_with(mock.clone());
        let desc = QueryDescriptor::first_page();
        engine.query(&desc).await;

        mock.set_reject_writes(true);
        let outcome = engine.update(&keys.id, &relocate("Garage")).await;
        assert!(!outcome.success);
        assert_eq!(outcome.state, WriteState::RolledBack);
        assert_eq!(engine.cached(&desc).unwrap().items[0].location, "Drawer");
        assert_eq!(engine.mirror().get(&keys.id).unwrap().location, "Drawer");
    }

    #[tokio::test]
    async fn test_rejected_update_restores_every_cached_page() {
        let mock = Arc::new(MockRemote::new());
        let keys = mock.seed("Keys", "Drawer");
        let engine = engine_with(mock.clone());
        let search = QueryDescriptor::new(1, 10, Some("keys"));
        let listing = QueryDescriptor::first_page();
        engine.query(&search).await;
        engine.query(&listing).await;

        mock.set_reject_writes(true);
        let outcome = engine.update(&keys.id, &relocate("Garage")).await;
        assert_eq!(outcome.state, WriteState::RolledBack);
        assert_eq!(engine.cached(&listing).unwrap().items[0].location, "Drawer");
        assert_eq!(engine.cached(&search).unwrap().items[0].location, "Drawer");

        // Served from cache before any refresh.
        let page = engine.query(&search).await;
        assert_eq!(page.items[0].location, "Drawer");
    }

    #[tokio::test]
    async fn test_offline_update_rolls_back_from_mirror() {
        let mock = Arc::new(MockRemote::new());
        let keys = mock.seed("Keys", "Drawer");
        let engine = engine_with(mock.clone());
        let desc = QueryDescriptor::first_page();
        engine.query(&desc).await;

        mock.set_online(false);
        let outcome = engine.update(&keys.id, &relocate("Garage")).await;
        assert_eq!(outcome.state, WriteState::RolledBack);
        assert_eq!(engine.cached(&desc).unwrap().items[0].location, "Drawer");
    }

    #[tokio::test]
    async fn test_update_pending_item_patches_envelope() {
        let mock = Arc::new(MockRemote::new());
        mock.set_online(false);
        let engine = engine_with(mock.clone());
        let created = engine.create(&CreateItemInput::new("Keys", "Drawer")).await;
        let id = created.item.unwrap().id;

        let outcome = engine.update(&id, &relocate("Hook")).await;
        assert!(outcome.success);
        assert_eq!(outcome.state, WriteState::ReconciledPending);
        assert_eq!(engine.pending()[0].item.location, "Hook");
        assert_eq!(mock.count("update"), 0);

        mock.set_online(true);
        engine.sync_pending().await;
        let server = mock.items.lock().unwrap()[0].clone();
        assert_eq!(server.location, "Hook");
    }

    #[tokio::test]
    async fn test_update_rejects_empty_change() {
        let engine = engine_with(Arc::new(MockRemote::new()));
        let outcome = engine.update("srv-1", &UpdateItemInput::default()).await;
        assert_eq!(outcome.state, WriteState::Issued);
        assert!(matches!(outcome.error, Some(SyncError::InvalidInput(_))));
    }

    // --- Remove ---

    #[tokio::test]
    async fn test_remove_applies_and_confirms() {
        let mock = Arc::new(MockRemote::new());
        let keys = mock.seed("Keys", "Drawer");
        mock.seed("Wallet", "Shelf");
        let engine = engine_with(mock.clone());
        let desc = QueryDescriptor::first_page();
        engine.query(&desc).await;

        let outcome = engine.remove(&keys.id).await;
        assert!(outcome.success);
        assert_eq!(outcome.item.unwrap().name, "Keys");
        let cached = engine.cached(&desc).unwrap();
        assert_eq!(names(&cached), vec!["Wallet"]);
        assert_eq!(cached.pagination.total_items, 1);
        assert!(mock.server_item(&keys.id).is_none());
    }

    #[tokio::test]
    async fn test_remove_twice_leaves_mirror_unchanged() {
        let mock = Arc::new(MockRemote::new());
        let keys = mock.seed("Keys", "Drawer");
        mock.seed("Wallet", "Shelf");
        let engine = engine_with(mock.clone());
        engine.query(&QueryDescriptor::first_page()).await;

        engine.remove(&keys.id).await;
        let once = engine.mirror().load();
        engine.remove(&keys.id).await;
        assert_eq!(engine.mirror().load(), once);
    }

    #[tokio::test]
    async fn test_failed_remove_heals_on_revalidation() {
        let mock = Arc::new(MockRemote::new());
        let keys = mock.seed("Keys", "Drawer");
        let engine = engine_with(mock.clone());
        let desc = QueryDescriptor::first_page();
        engine.query(&desc).await;

        mock.set_reject_writes(true);
        let outcome = engine.remove(&keys.id).await;
        assert!(outcome.success);
        assert_eq!(outcome.state, WriteState::RolledBack);
        assert!(matches!(outcome.error, Some(SyncError::Remote(_))));
        assert_eq!(names(&engine.cached(&desc).unwrap()), vec!["Keys"]);
    }

    #[tokio::test]
    async fn test_offline_remove_still_succeeds() {
        let mock = Arc::new(MockRemote::new());
        let keys = mock.seed("Keys", "Drawer");
        let engine = engine_with(mock.clone());
        engine.query(&QueryDescriptor::first_page()).await;

        mock.set_online(false);
        let outcome = engine.remove(&keys.id).await;
        assert!(outcome.success);
        assert_eq!(outcome.item.unwrap().id, keys.id);
        assert!(outcome.error.unwrap().to_string().contains("Network error"));
    }

    // --- Get ---

    #[tokio::test]
    async fn test_get_falls_back_to_mirror() {
        let mock = Arc::new(MockRemote::new());
        let keys = mock.seed("Keys", "Drawer");
        let engine = engine_with(mock.clone());
        engine.query(&QueryDescriptor::first_page()).await;

        mock.set_online(false);
        assert_eq!(engine.get(&keys.id).await.unwrap().name, "Keys");
        assert!(engine.get("srv-missing").await.is_none());
    }

    // --- Overlay ---

    #[test]
    fn test_overlay_respects_query_and_page() {
        let pending = vec![
            Item::provisional(&CreateItemInput::new("Keys", "Drawer")),
            Item::provisional(&CreateItemInput::new("Wallet", "Shelf")),
        ];

        let desc = QueryDescriptor::new(1, 10, Some("keys"));
        let mut first = PaginatedResult::empty(&desc);
        overlay_pending(&desc, &mut first, &pending);
        assert_eq!(names(&first), vec!["Keys"]);
        assert_eq!(first.pagination.total_items, 1);

        let desc = QueryDescriptor::new(2, 10, None);
        let mut second = PaginatedResult::new(Vec::new(), 2, 10, 12);
        overlay_pending(&desc, &mut second, &pending);
        assert!(second.items.is_empty());
        assert_eq!(second.pagination.total_items, 14);
    }
}
