use std::{collections::HashMap, sync::Arc, time::Duration};

use anyhow::{anyhow, Result};
use futures::{SinkExt, StreamExt};
use shared::{
    domain::{ClientNonce, RoomId, UserId, UserRole, UserSummary},
    protocol::{
        ClientFrame, CreatePrivateRoomRequest, MessageBody, RoomSummary, SendMessageRequest,
        ServerEvent,
    },
};
use tokio::{
    sync::{broadcast, mpsc, Mutex},
    task::JoinHandle,
};
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::{info, warn};

pub mod session;
pub mod transport;
pub mod unread;

use session::{MessageSession, MessageView, SessionState};
use transport::{HttpRoomApi, RoomApi};
use unread::UnreadTracker;

const INITIAL_PAGE_SIZE: u32 = 50;
const OLDER_PAGE_SIZE: u32 = 50;
const RECOVERY_PAGE_SIZE: u32 = 50;
const WS_RECONNECT_DELAY: Duration = Duration::from_secs(2);

#[derive(Debug, Clone)]
pub enum ClientEvent {
    Server(ServerEvent),
    SessionStateChanged {
        room_id: RoomId,
        state: SessionState,
    },
    MessagesUpdated {
        room_id: RoomId,
    },
    UnreadChanged {
        room_id: RoomId,
        unread_count: u32,
    },
    SendFailed {
        room_id: RoomId,
        nonce: ClientNonce,
    },
    Error(String),
}

struct ChatClientState {
    server_url: Option<String>,
    profile: Option<UserSummary>,
    rooms: HashMap<RoomId, RoomSummary>,
    sessions: HashMap<RoomId, MessageSession>,
    unread: Option<UnreadTracker>,
    frames_tx: Option<mpsc::UnboundedSender<ClientFrame>>,
    deliveries: HashMap<RoomId, mpsc::UnboundedSender<DeliveryJob>>,
}

struct DeliveryJob {
    user_id: UserId,
    body: MessageBody,
    nonce: ClientNonce,
}

/// Room messaging client. Holds one message session per open room, the
/// unread counters for the room list, and the websocket event pump. All
/// server access goes through the injected [`RoomApi`].
pub struct ChatClient {
    api: Arc<dyn RoomApi>,
    inner: Mutex<ChatClientState>,
    ws_task: Mutex<Option<JoinHandle<()>>>,
    events: broadcast::Sender<ClientEvent>,
}

impl ChatClient {
    pub fn new(server_url: impl Into<String>) -> Arc<Self> {
        let server_url = server_url.into();
        Self::new_with_api(Arc::new(HttpRoomApi::new(server_url.clone())), server_url)
    }

    pub fn new_with_api(api: Arc<dyn RoomApi>, server_url: impl Into<String>) -> Arc<Self> {
        let (events, _) = broadcast::channel(1024);
        Arc::new(Self {
            api,
            inner: Mutex::new(ChatClientState {
                server_url: Some(server_url.into().trim_end_matches('/').to_string()),
                profile: None,
                rooms: HashMap::new(),
                sessions: HashMap::new(),
                unread: None,
                frames_tx: None,
                deliveries: HashMap::new(),
            }),
            ws_task: Mutex::new(None),
            events,
        })
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<ClientEvent> {
        self.events.subscribe()
    }

    /// Registers the user and primes the client. The event stream is started
    /// separately with [`ChatClient::start_event_stream`].
    pub async fn connect(&self, display_name: &str, role: UserRole) -> Result<UserSummary> {
        let profile = self.api.register_user(display_name, None, role).await?;
        let mut guard = self.inner.lock().await;
        guard.unread = Some(UnreadTracker::new(profile.user_id));
        guard.profile = Some(profile.clone());
        Ok(profile)
    }

    pub async fn profile(&self) -> Option<UserSummary> {
        self.inner.lock().await.profile.clone()
    }

    /// Fetches the authoritative room list and reseeds the unread counters.
    pub async fn refresh_rooms(&self) -> Result<Vec<RoomSummary>> {
        let user_id = self.require_user().await?;
        let rooms = self.api.list_rooms(user_id).await?;
        let mut guard = self.inner.lock().await;
        for room in &rooms {
            guard.rooms.insert(room.room_id, room.clone());
            if let Some(unread) = guard.unread.as_mut() {
                unread.set_count(room.room_id, room.unread_count);
            }
        }
        Ok(rooms)
    }

    pub async fn rooms_snapshot(&self) -> Vec<RoomSummary> {
        let guard = self.inner.lock().await;
        let mut rooms: Vec<_> = guard.rooms.values().cloned().collect();
        rooms.sort_by(|a, b| b.updated_at.cmp(&a.updated_at));
        rooms
    }

    /// Opens (or silently rejoins) the single private room with another user.
    pub async fn open_private_room(
        &self,
        participant_id: UserId,
        context_ref: Option<&str>,
    ) -> Result<RoomSummary> {
        let user_id = self.require_user().await?;
        let room = self
            .api
            .create_private_room(&CreatePrivateRoomRequest {
                user_id,
                participant_id,
                context_ref: context_ref.map(str::to_string),
            })
            .await?;
        let mut guard = self.inner.lock().await;
        guard.rooms.insert(room.room_id, room.clone());
        if let Some(unread) = guard.unread.as_mut() {
            unread.set_count(room.room_id, room.unread_count);
        }
        Ok(room)
    }

    pub async fn private_room_with(
        &self,
        other_id: UserId,
        context_ref: Option<&str>,
    ) -> Result<Option<RoomSummary>> {
        let user_id = self.require_user().await?;
        self.api
            .private_room_with(user_id, other_id, context_ref)
            .await
    }

    /// Opens a room session: subscribes its event feed, loads the initial
    /// history page, and clears the unread counter. Every open marks the room
    /// read on the server, which also covers messages that arrived while the
    /// room was already on screen; the server treats the call as idempotent.
    pub async fn open_room(self: &Arc<Self>, room_id: RoomId) -> Result<()> {
        let user_id = self.require_user().await?;
        {
            let mut guard = self.inner.lock().await;
            let session = guard
                .sessions
                .entry(room_id)
                .or_insert_with(|| MessageSession::new(room_id));
            session.begin_loading();
        }
        self.emit(ClientEvent::SessionStateChanged {
            room_id,
            state: SessionState::Loading,
        });
        self.send_frame(ClientFrame::SubscribeRoom { room_id }).await;

        let page = self
            .api
            .list_messages(user_id, room_id, INITIAL_PAGE_SIZE, None)
            .await?;
        {
            let mut guard = self.inner.lock().await;
            if let Some(session) = guard.sessions.get_mut(&room_id) {
                session.apply_initial_page(page);
            }
            if let Some(unread) = guard.unread.as_mut() {
                unread.open_room(room_id);
            }
        }
        self.emit(ClientEvent::SessionStateChanged {
            room_id,
            state: SessionState::Live,
        });
        self.emit(ClientEvent::MessagesUpdated { room_id });
        self.emit(ClientEvent::UnreadChanged {
            room_id,
            unread_count: 0,
        });
        self.api.mark_room_read(user_id, room_id).await?;
        Ok(())
    }

    pub async fn close_room(&self, room_id: RoomId) {
        let mut guard = self.inner.lock().await;
        if let Some(session) = guard.sessions.get_mut(&room_id) {
            session.close();
        }
        if let Some(unread) = guard.unread.as_mut() {
            unread.close_room(room_id);
        }
        drop(guard);
        self.send_frame(ClientFrame::UnsubscribeRoom { room_id })
            .await;
        self.emit(ClientEvent::SessionStateChanged {
            room_id,
            state: SessionState::Closed,
        });
    }

    pub async fn leave_room(&self, room_id: RoomId) -> Result<()> {
        let user_id = self.require_user().await?;
        self.api.leave_room(user_id, room_id).await?;
        let mut guard = self.inner.lock().await;
        guard.rooms.remove(&room_id);
        if let Some(session) = guard.sessions.get_mut(&room_id) {
            session.close();
        }
        drop(guard);
        self.send_frame(ClientFrame::UnsubscribeRoom { room_id })
            .await;
        Ok(())
    }

    /// Loads one more page of history before the oldest loaded message.
    /// Returns false once the top of the room is reached.
    pub async fn load_older_messages(&self, room_id: RoomId) -> Result<bool> {
        let user_id = self.require_user().await?;
        let before = {
            let guard = self.inner.lock().await;
            guard
                .sessions
                .get(&room_id)
                .and_then(MessageSession::oldest_loaded_id)
        };
        let page = self
            .api
            .list_messages(user_id, room_id, OLDER_PAGE_SIZE, before.map(|id| id.0))
            .await?;
        if page.is_empty() {
            return Ok(false);
        }
        let changed = {
            let mut guard = self.inner.lock().await;
            match guard.sessions.get_mut(&room_id) {
                Some(session) => session.prepend_older_page(page),
                None => false,
            }
        };
        if changed {
            self.emit(ClientEvent::MessagesUpdated { room_id });
        }
        Ok(changed)
    }

    /// Queues a message: the timeline shows it immediately as pending, and a
    /// background task delivers it. The returned nonce identifies the
    /// placeholder until the server echo confirms it.
    pub async fn send_message(
        self: &Arc<Self>,
        room_id: RoomId,
        body: MessageBody,
    ) -> Result<ClientNonce> {
        let user_id = self.require_user().await?;
        let nonce = {
            let mut guard = self.inner.lock().await;
            let session = guard
                .sessions
                .get_mut(&room_id)
                .ok_or_else(|| anyhow!("room {} is not open", room_id.0))?;
            session.local_send(body.clone())
        };
        self.emit(ClientEvent::MessagesUpdated { room_id });
        self.queue_delivery(room_id, user_id, body, nonce).await;
        Ok(nonce)
    }

    pub async fn send_text(self: &Arc<Self>, room_id: RoomId, text: &str) -> Result<ClientNonce> {
        self.send_message(room_id, MessageBody::text(text)).await
    }

    /// Retries a failed send under its original nonce, so a late echo of the
    /// first attempt and the retry reconcile to the same message.
    pub async fn retry_send(self: &Arc<Self>, room_id: RoomId, nonce: ClientNonce) -> Result<()> {
        let user_id = self.require_user().await?;
        let body = {
            let mut guard = self.inner.lock().await;
            guard
                .sessions
                .get_mut(&room_id)
                .and_then(|session| session.retry(nonce))
        }
        .ok_or_else(|| anyhow!("no failed send to retry in room {}", room_id.0))?;
        self.emit(ClientEvent::MessagesUpdated { room_id });
        self.queue_delivery(room_id, user_id, body, nonce).await;
        Ok(())
    }

    pub async fn mark_room_read(&self, room_id: RoomId) -> Result<()> {
        let user_id = self.require_user().await?;
        self.api.mark_room_read(user_id, room_id).await
    }

    pub async fn session_state(&self, room_id: RoomId) -> Option<SessionState> {
        self.inner
            .lock()
            .await
            .sessions
            .get(&room_id)
            .map(MessageSession::state)
    }

    pub async fn messages_snapshot(&self, room_id: RoomId) -> Vec<MessageView> {
        self.inner
            .lock()
            .await
            .sessions
            .get(&room_id)
            .map(|session| session.messages().to_vec())
            .unwrap_or_default()
    }

    pub async fn unread_count(&self, room_id: RoomId) -> u32 {
        self.inner
            .lock()
            .await
            .unread
            .as_ref()
            .map(|unread| unread.count(room_id))
            .unwrap_or(0)
    }

    /// Applies one server event to the client's state. This is the single
    /// ingestion point for every delivery channel, so replays and duplicates
    /// are absorbed here.
    pub async fn handle_server_event(&self, event: ServerEvent) {
        match &event {
            ServerEvent::MessageReceived { message } => {
                let room_id = message.room_id;
                let (unread_changed, view_changed) = {
                    let mut guard = self.inner.lock().await;
                    let unread_changed = guard
                        .unread
                        .as_mut()
                        .and_then(|unread| unread.on_message_received(message));
                    let view_changed = guard
                        .sessions
                        .get_mut(&room_id)
                        .map(|session| session.apply_event(&event))
                        .unwrap_or(false);
                    (unread_changed, view_changed)
                };
                if let Some(unread_count) = unread_changed {
                    self.emit(ClientEvent::UnreadChanged {
                        room_id,
                        unread_count,
                    });
                }
                if view_changed {
                    self.emit(ClientEvent::MessagesUpdated { room_id });
                }
            }
            ServerEvent::MessageStatusUpdated { room_id, .. } => {
                let room_id = *room_id;
                let view_changed = {
                    let mut guard = self.inner.lock().await;
                    guard
                        .sessions
                        .get_mut(&room_id)
                        .map(|session| session.apply_event(&event))
                        .unwrap_or(false)
                };
                if view_changed {
                    self.emit(ClientEvent::MessagesUpdated { room_id });
                }
            }
            ServerEvent::RoomUpdated { room } => {
                let room_id = room.room_id;
                let unread_count = {
                    let mut guard = self.inner.lock().await;
                    guard.rooms.insert(room_id, room.clone());
                    match guard.unread.as_mut() {
                        Some(unread) => {
                            unread.set_count(room_id, room.unread_count);
                            unread.count(room_id)
                        }
                        None => room.unread_count,
                    }
                };
                self.emit(ClientEvent::UnreadChanged {
                    room_id,
                    unread_count,
                });
            }
            ServerEvent::Error(err) => {
                self.emit(ClientEvent::Error(err.message.clone()));
            }
        }
        self.emit(ClientEvent::Server(event));
    }

    /// Starts (or restarts) the websocket pump. The pump reconnects on its
    /// own and replays missed history into any session that was live when
    /// the channel dropped.
    pub async fn start_event_stream(self: &Arc<Self>) -> Result<()> {
        let (server_url, user_id) = {
            let guard = self.inner.lock().await;
            match (guard.server_url.clone(), guard.profile.as_ref()) {
                (Some(url), Some(profile)) => (url, profile.user_id),
                _ => return Err(anyhow!("connect before starting the event stream")),
            }
        };
        let ws_url = HttpRoomApi::ws_url(&server_url, user_id)?;
        let client = Arc::clone(self);
        let task = tokio::spawn(async move { client.run_event_stream(ws_url, user_id).await });
        let mut guard = self.ws_task.lock().await;
        if let Some(previous) = guard.replace(task) {
            previous.abort();
        }
        Ok(())
    }

    pub async fn stop_event_stream(&self) {
        let mut guard = self.ws_task.lock().await;
        if let Some(task) = guard.take() {
            task.abort();
        }
        self.inner.lock().await.frames_tx = None;
    }

    fn emit(&self, event: ClientEvent) {
        let _ = self.events.send(event);
    }

    async fn require_user(&self) -> Result<UserId> {
        self.inner
            .lock()
            .await
            .profile
            .as_ref()
            .map(|profile| profile.user_id)
            .ok_or_else(|| anyhow!("not connected"))
    }

    async fn send_frame(&self, frame: ClientFrame) {
        let guard = self.inner.lock().await;
        if let Some(tx) = &guard.frames_tx {
            let _ = tx.send(frame);
        }
    }

    /// Enqueues a delivery on the room's send lane. One drain task per room
    /// performs the requests strictly one at a time, so two in-flight sends
    /// from this client always reach the server in submission order.
    async fn queue_delivery(
        self: &Arc<Self>,
        room_id: RoomId,
        user_id: UserId,
        body: MessageBody,
        nonce: ClientNonce,
    ) {
        let mut guard = self.inner.lock().await;
        let tx = guard.deliveries.entry(room_id).or_insert_with(|| {
            let (tx, mut rx) = mpsc::unbounded_channel::<DeliveryJob>();
            let client = Arc::downgrade(self);
            tokio::spawn(async move {
                while let Some(job) = rx.recv().await {
                    let Some(client) = client.upgrade() else { break };
                    client.deliver(room_id, job).await;
                }
            });
            tx
        });
        let _ = tx.send(DeliveryJob {
            user_id,
            body,
            nonce,
        });
    }

    async fn deliver(&self, room_id: RoomId, job: DeliveryJob) {
        let nonce = job.nonce;
        let request = SendMessageRequest {
            user_id: job.user_id,
            room_id,
            body: job.body,
            client_nonce: Some(nonce),
        };
        match self.api.send_message(&request).await {
            Ok(message) => {
                let changed = {
                    let mut guard = self.inner.lock().await;
                    guard
                        .sessions
                        .get_mut(&room_id)
                        .map(|session| {
                            session.apply_event(&ServerEvent::MessageReceived { message })
                        })
                        .unwrap_or(false)
                };
                if changed {
                    self.emit(ClientEvent::MessagesUpdated { room_id });
                }
            }
            Err(err) => {
                let marked = {
                    let mut guard = self.inner.lock().await;
                    guard
                        .sessions
                        .get_mut(&room_id)
                        .map(|session| session.mark_failed(nonce))
                        .unwrap_or(false)
                };
                if marked {
                    self.emit(ClientEvent::SendFailed { room_id, nonce });
                    self.emit(ClientEvent::MessagesUpdated { room_id });
                }
                self.emit(ClientEvent::Error(format!(
                    "send failed for room {}: {err}",
                    room_id.0
                )));
            }
        }
    }

    async fn run_event_stream(self: Arc<Self>, ws_url: String, user_id: UserId) {
        loop {
            match connect_async(&ws_url).await {
                Ok((stream, _)) => {
                    info!(%ws_url, "event stream connected");
                    let (mut ws_writer, mut ws_reader) = stream.split();
                    let (frames_tx, mut frames_rx) = mpsc::unbounded_channel();

                    let open_rooms: Vec<RoomId> = {
                        let mut guard = self.inner.lock().await;
                        guard.frames_tx = Some(frames_tx);
                        guard
                            .sessions
                            .iter()
                            .filter(|(_, session)| {
                                !matches!(
                                    session.state(),
                                    SessionState::Idle | SessionState::Closed
                                )
                            })
                            .map(|(room_id, _)| *room_id)
                            .collect()
                    };
                    let mut writer_alive = true;
                    for room_id in open_rooms {
                        let frame = ClientFrame::SubscribeRoom { room_id };
                        let Ok(text) = serde_json::to_string(&frame) else {
                            continue;
                        };
                        if ws_writer.send(Message::Text(text)).await.is_err() {
                            writer_alive = false;
                            break;
                        }
                    }

                    if writer_alive {
                        self.recover_sessions(user_id).await;
                        loop {
                            tokio::select! {
                                frame = frames_rx.recv() => {
                                    let Some(frame) = frame else { break };
                                    let Ok(text) = serde_json::to_string(&frame) else { continue };
                                    if ws_writer.send(Message::Text(text)).await.is_err() {
                                        break;
                                    }
                                }
                                incoming = ws_reader.next() => {
                                    match incoming {
                                        Some(Ok(Message::Text(text))) => {
                                            match serde_json::from_str::<ServerEvent>(&text) {
                                                Ok(event) => self.handle_server_event(event).await,
                                                Err(err) => {
                                                    warn!(%err, "dropping malformed event frame");
                                                }
                                            }
                                        }
                                        Some(Ok(_)) => {}
                                        Some(Err(_)) | None => break,
                                    }
                                }
                            }
                        }
                    }
                }
                Err(err) => {
                    self.emit(ClientEvent::Error(format!(
                        "event stream connect failed: {err}"
                    )));
                }
            }

            self.on_channel_lost().await;
            tokio::time::sleep(WS_RECONNECT_DELAY).await;
        }
    }

    async fn on_channel_lost(&self) {
        let lost: Vec<RoomId> = {
            let mut guard = self.inner.lock().await;
            guard.frames_tx = None;
            guard
                .sessions
                .iter_mut()
                .filter(|(_, session)| session.state() == SessionState::Live)
                .map(|(room_id, session)| {
                    session.channel_lost();
                    *room_id
                })
                .collect()
        };
        for room_id in lost {
            self.emit(ClientEvent::SessionStateChanged {
                room_id,
                state: SessionState::Reconnecting,
            });
        }
    }

    /// Re-fetches the newest history for every session that missed events
    /// while disconnected. The push stream is not trusted across a gap.
    async fn recover_sessions(&self, user_id: UserId) {
        let reconnecting: Vec<RoomId> = {
            let guard = self.inner.lock().await;
            guard
                .sessions
                .iter()
                .filter(|(_, session)| session.state() == SessionState::Reconnecting)
                .map(|(room_id, _)| *room_id)
                .collect()
        };
        for room_id in reconnecting {
            match self
                .api
                .list_messages(user_id, room_id, RECOVERY_PAGE_SIZE, None)
                .await
            {
                Ok(page) => {
                    let changed = {
                        let mut guard = self.inner.lock().await;
                        guard
                            .sessions
                            .get_mut(&room_id)
                            .map(|session| session.recovered(page))
                            .unwrap_or(false)
                    };
                    self.emit(ClientEvent::SessionStateChanged {
                        room_id,
                        state: SessionState::Live,
                    });
                    if changed {
                        self.emit(ClientEvent::MessagesUpdated { room_id });
                    }
                }
                Err(err) => {
                    self.emit(ClientEvent::Error(format!(
                        "history recovery failed for room {}: {err}",
                        room_id.0
                    )));
                }
            }
        }
    }
}

#[cfg(test)]
#[path = "tests/lib_tests.rs"]
mod tests;
