//! Keeps a local view of one room in step with the backend.
//!
//! Two sources feed the view: a poll ticker that re-reads the newest
//! messages, the member list and the room row, and a push subscription on
//! message inserts. Both go through [`MessageLog::ingest`], which drops
//! anything already seen, so a row observed twice is shown once.
//!
//! Every room switch or stop bumps a generation counter. Results carry the
//! generation they were requested under and are discarded when it no
//! longer matches.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use talkroom_api::{ChangeEvent, ChatRoom, ChatRoomMember, Message, MESSAGES_TABLE};
use time::OffsetDateTime;
use tokio::sync::broadcast;
use tokio::time::MissedTickBehavior;
use tokio_stream::wrappers::BroadcastStream;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::auth;
use crate::backend::{Backend, ChangeFeed, ChangeFilter, Credential};
use crate::codec::MessageCodec;
use crate::config::ChatConfig;
use crate::error::{ChatError, Result};
use crate::session::Session;
use crate::{messages, rooms};

/// Distance from the bottom, in pixels, still counted as "at the bottom".
pub const NEAR_BOTTOM_PX: f64 = 100.0;

/// Messages keyed by id, iterated in `(created_at, id)` order.
#[derive(Debug, Clone, Default)]
pub struct MessageLog {
    entries: BTreeMap<(OffsetDateTime, Uuid), Message>,
    index: HashMap<Uuid, OffsetDateTime>,
}

impl MessageLog {
    /// Merge messages into the log and return how many were new.
    pub fn ingest<I: IntoIterator<Item = Message>>(&mut self, messages: I) -> usize {
        let mut added = 0;
        for message in messages {
            if let Some(at) = self.index.get(&message.id) {
                // a push fetch may race a profile change; keep whichever has one
                if let Some(existing) = self.entries.get_mut(&(*at, message.id)) {
                    if existing.user.is_none() {
                        existing.user = message.user;
                    }
                }
                continue;
            }
            self.index.insert(message.id, message.created_at);
            self.entries
                .insert((message.created_at, message.id), message);
            added += 1;
        }
        added
    }

    pub fn contains(&self, id: Uuid) -> bool {
        self.index.contains_key(&id)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Message> {
        self.entries.values()
    }

    pub fn last(&self) -> Option<&Message> {
        self.entries.values().next_back()
    }
}

/// Scroll position as reported by whatever renders the list.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ScrollMetrics {
    pub scroll_top: f64,
    pub scroll_height: f64,
    pub client_height: f64,
}

impl ScrollMetrics {
    pub fn distance_from_bottom(&self) -> f64 {
        (self.scroll_height - self.scroll_top - self.client_height).max(0.0)
    }
}

/// What the list should do about newly arrived messages.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScrollAction {
    ScrollToBottom,
    Unread(u32),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Viewport {
    near_bottom: bool,
    unread: u32,
}

impl Default for Viewport {
    fn default() -> Self {
        Self {
            near_bottom: true,
            unread: 0,
        }
    }
}

impl Viewport {
    pub fn near_bottom(&self) -> bool {
        self.near_bottom
    }

    pub fn unread(&self) -> u32 {
        self.unread
    }

    /// Record a scroll. Returns true when this cleared the unread counter.
    pub fn on_scroll(&mut self, metrics: ScrollMetrics) -> bool {
        self.near_bottom = metrics.distance_from_bottom() < NEAR_BOTTOM_PX;
        if self.near_bottom && self.unread > 0 {
            self.unread = 0;
            return true;
        }
        false
    }

    pub fn on_new_messages(&mut self, count: usize) -> ScrollAction {
        if self.near_bottom {
            ScrollAction::ScrollToBottom
        } else {
            let count = u32::try_from(count).unwrap_or(u32::MAX);
            self.unread = self.unread.saturating_add(count);
            ScrollAction::Unread(self.unread)
        }
    }

    /// Resume auto-scroll. Returns true when unread messages were cleared.
    pub fn stick_to_bottom(&mut self) -> bool {
        self.near_bottom = true;
        std::mem::take(&mut self.unread) > 0
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ViewState {
    #[default]
    Idle,
    Loading,
    Ready,
    Stopped,
}

/// Local state of the room being viewed.
#[derive(Debug, Clone, Default)]
pub struct RoomView {
    pub state: ViewState,
    pub room_id: Option<Uuid>,
    pub room: Option<ChatRoom>,
    pub members: Vec<ChatRoomMember>,
    pub messages: MessageLog,
    pub viewport: Viewport,
    pub draft: String,
}

/// Notifications for whatever renders the view.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncEvent {
    Loaded,
    MessagesAdded { count: usize },
    MembersChanged,
    RoomChanged,
    ScrollToBottom,
    UnreadChanged(u32),
}

struct Inner {
    backend: Arc<dyn Backend>,
    session: Mutex<Session>,
    config: ChatConfig,
    codec: MessageCodec,
    view: Mutex<RoomView>,
    generation: AtomicU64,
    cancel: Mutex<CancellationToken>,
    events: broadcast::Sender<SyncEvent>,
}

impl Inner {
    fn is_current(&self, generation: u64) -> bool {
        self.generation.load(Ordering::SeqCst) == generation
    }

    fn emit_all(&self, events: Vec<SyncEvent>) {
        for ev in events {
            // nobody listening is fine
            let _ = self.events.send(ev);
        }
    }

    async fn session(&self) -> Session {
        let current = self.session.lock().clone();
        match auth::ensure_fresh(self.backend.as_ref(), &current).await {
            Ok(fresh) => {
                if fresh.access_token != current.access_token {
                    *self.session.lock() = fresh.clone();
                }
                fresh
            }
            Err(e) => {
                tracing::warn!(error = %e, "could not refresh session");
                current
            }
        }
    }

    fn apply_room(&self, generation: u64, room: ChatRoom) -> bool {
        let mut events = Vec::new();
        {
            let mut view = self.view.lock();
            if !self.is_current(generation) {
                return false;
            }
            if view.room.as_ref() != Some(&room) {
                view.room = Some(room);
                events.push(SyncEvent::RoomChanged);
            }
        }
        self.emit_all(events);
        true
    }

    fn apply_members(&self, generation: u64, members: Vec<ChatRoomMember>) -> bool {
        let mut events = Vec::new();
        {
            let mut view = self.view.lock();
            if !self.is_current(generation) {
                return false;
            }
            if view.members != members {
                view.members = members;
                events.push(SyncEvent::MembersChanged);
            }
        }
        self.emit_all(events);
        true
    }

    /// Single entry point for messages from polling, push and local sends.
    fn apply_messages(&self, generation: u64, messages: Vec<Message>) -> bool {
        let mut events = Vec::new();
        {
            let mut view = self.view.lock();
            if !self.is_current(generation) {
                return false;
            }
            let added = view.messages.ingest(messages);
            if view.state == ViewState::Loading {
                view.state = ViewState::Ready;
                events.push(SyncEvent::Loaded);
                events.push(SyncEvent::ScrollToBottom);
            } else if added > 0 {
                events.push(SyncEvent::MessagesAdded { count: added });
                events.push(match view.viewport.on_new_messages(added) {
                    ScrollAction::ScrollToBottom => SyncEvent::ScrollToBottom,
                    ScrollAction::Unread(n) => SyncEvent::UnreadChanged(n),
                });
            }
        }
        self.emit_all(events);
        true
    }

    /// Re-read room, members and recent messages. Failures keep the
    /// previous state.
    async fn refresh(&self, generation: u64, room_id: Uuid) {
        let session = self.session().await;
        let cred = Credential::User(&session);
        let backend = self.backend.as_ref();

        match rooms::get(backend, cred, room_id).await {
            Ok(room) => {
                self.apply_room(generation, room);
            }
            Err(e) => tracing::warn!(room = %room_id, error = %e, "room refresh failed"),
        }
        match rooms::members(backend, cred, room_id).await {
            Ok(members) => {
                self.apply_members(generation, members);
            }
            Err(e) => tracing::warn!(room = %room_id, error = %e, "member refresh failed"),
        }
        match messages::recent(backend, cred, room_id, self.config.history_limit).await {
            Ok(batch) => {
                if !self.apply_messages(generation, batch) {
                    tracing::debug!(room = %room_id, "discarding stale poll result");
                }
            }
            Err(e) => tracing::warn!(room = %room_id, error = %e, "message refresh failed"),
        }
    }

    async fn on_insert(&self, generation: u64, event: ChangeEvent) {
        let Some(id) = event.row_id() else {
            tracing::debug!("insert event without id");
            return;
        };
        if self.view.lock().messages.contains(id) {
            return;
        }
        let session = self.session().await;
        match messages::fetch(self.backend.as_ref(), Credential::User(&session), id).await {
            Ok(Some(message)) => {
                self.apply_messages(generation, vec![message]);
            }
            Ok(None) => tracing::debug!(message = %id, "pushed message not visible"),
            Err(e) => tracing::warn!(message = %id, error = %e, "fetching pushed message failed"),
        }
    }
}

async fn poll_loop(inner: Arc<Inner>, generation: u64, room_id: Uuid, cancel: CancellationToken) {
    let mut ticker = tokio::time::interval(inner.config.poll_interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    // the first tick completes immediately and the initial load already ran
    ticker.tick().await;
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = ticker.tick() => inner.refresh(generation, room_id).await,
        }
    }
    tracing::debug!(room = %room_id, "poll loop stopped");
}

async fn push_loop(inner: Arc<Inner>, generation: u64, mut feed: ChangeFeed, cancel: CancellationToken) {
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            ev = feed.recv() => match ev {
                Some(ev) => inner.on_insert(generation, ev).await,
                None => {
                    tracing::warn!("change feed closed, continuing with polling only");
                    break;
                }
            },
        }
    }
}

/// Drives a [`RoomView`] for one room at a time.
pub struct RoomSynchronizer {
    inner: Arc<Inner>,
}

impl RoomSynchronizer {
    pub fn new(backend: Arc<dyn Backend>, session: Session, config: ChatConfig) -> Self {
        let (events, _rx) = broadcast::channel(256);
        let codec = MessageCodec::from_flag(config.obfuscate);
        Self {
            inner: Arc::new(Inner {
                backend,
                session: Mutex::new(session),
                config,
                codec,
                view: Mutex::new(RoomView::default()),
                generation: AtomicU64::new(0),
                cancel: Mutex::new(CancellationToken::new()),
                events,
            }),
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SyncEvent> {
        self.inner.events.subscribe()
    }

    /// Events as a stream, for UIs that consume them with `StreamExt`.
    pub fn events(&self) -> BroadcastStream<SyncEvent> {
        BroadcastStream::new(self.subscribe())
    }

    pub fn view(&self) -> RoomView {
        self.inner.view.lock().clone()
    }

    /// The session in use, which may have been refreshed since creation.
    pub fn session(&self) -> Session {
        self.inner.session.lock().clone()
    }

    /// Load `room_id` and keep it synchronized until the next switch or stop.
    pub async fn switch_room(&self, room_id: Uuid) {
        let generation = self.inner.generation.fetch_add(1, Ordering::SeqCst) + 1;
        let cancel = CancellationToken::new();
        {
            let mut slot = self.inner.cancel.lock();
            slot.cancel();
            *slot = cancel.clone();
        }
        *self.inner.view.lock() = RoomView {
            state: ViewState::Loading,
            room_id: Some(room_id),
            ..Default::default()
        };
        tracing::info!(room = %room_id, "loading room");

        // subscribe before the first read so inserts in between are not missed
        let session = self.inner.session().await;
        let filter = ChangeFilter::inserts(MESSAGES_TABLE).where_eq("room_id", room_id);
        let feed = match self
            .inner
            .backend
            .subscribe(Credential::User(&session), filter)
            .await
        {
            Ok(feed) => Some(feed),
            Err(e) => {
                tracing::warn!(room = %room_id, error = %e, "realtime subscription failed");
                None
            }
        };

        self.inner.refresh(generation, room_id).await;

        if let Some(feed) = feed {
            tokio::spawn(push_loop(
                self.inner.clone(),
                generation,
                feed,
                cancel.clone(),
            ));
        }
        tokio::spawn(poll_loop(self.inner.clone(), generation, room_id, cancel));
    }

    /// Cancel timers and the subscription. Late results are dropped.
    pub fn stop(&self) {
        self.inner.generation.fetch_add(1, Ordering::SeqCst);
        self.inner.cancel.lock().cancel();
        self.inner.view.lock().state = ViewState::Stopped;
    }

    pub fn on_scroll(&self, metrics: ScrollMetrics) {
        let cleared = self.inner.view.lock().viewport.on_scroll(metrics);
        if cleared {
            self.inner.emit_all(vec![SyncEvent::UnreadChanged(0)]);
        }
    }

    pub fn set_draft(&self, text: &str) {
        self.inner.view.lock().draft = text.to_string();
    }

    /// Send `text` to the current room. Blank text is ignored without any
    /// remote call; returns whether a message was sent.
    pub async fn send(&self, text: &str) -> Result<bool> {
        let text = text.trim();
        if text.is_empty() {
            return Ok(false);
        }
        let (room_id, generation) = {
            let view = self.inner.view.lock();
            let room_id = view.room_id.ok_or(ChatError::NotFound)?;
            (room_id, self.inner.generation.load(Ordering::SeqCst))
        };
        let session = self.inner.session().await;
        let sent = messages::send(
            self.inner.backend.as_ref(),
            &session,
            room_id,
            text,
            self.inner.codec,
        )
        .await?;
        let Some(mut message) = sent else {
            return Ok(false);
        };

        let cleared = {
            let mut view = self.inner.view.lock();
            view.draft.clear();
            message.user = view
                .members
                .iter()
                .find(|m| m.user_id == message.user_id)
                .and_then(|m| m.user.clone());
            view.viewport.stick_to_bottom()
        };
        if cleared {
            self.inner.emit_all(vec![SyncEvent::UnreadChanged(0)]);
        }
        self.inner.apply_messages(generation, vec![message]);
        Ok(true)
    }

    pub async fn send_draft(&self) -> Result<bool> {
        let draft = self.inner.view.lock().draft.clone();
        self.send(&draft).await
    }
}

impl Drop for RoomSynchronizer {
    fn drop(&mut self) {
        self.inner.cancel.lock().cancel();
    }
}
