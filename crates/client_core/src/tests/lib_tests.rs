use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};

use async_trait::async_trait;
use chrono::Utc;
use shared::{
    domain::{MessageId, RoomKind},
    protocol::MessagePayload,
};

use super::*;

struct TestRoomApi {
    rooms: std::sync::Mutex<Vec<RoomSummary>>,
    pages: std::sync::Mutex<Vec<Vec<MessagePayload>>>,
    fail_sends: AtomicBool,
    // One-shot delay applied to the next send, in milliseconds.
    next_send_delay_ms: AtomicI64,
    next_message_id: AtomicI64,
    sent: std::sync::Mutex<Vec<SendMessageRequest>>,
    mark_read_calls: std::sync::Mutex<Vec<(UserId, RoomId)>>,
}

impl TestRoomApi {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            rooms: std::sync::Mutex::new(Vec::new()),
            pages: std::sync::Mutex::new(Vec::new()),
            fail_sends: AtomicBool::new(false),
            next_send_delay_ms: AtomicI64::new(0),
            next_message_id: AtomicI64::new(100),
            sent: std::sync::Mutex::new(Vec::new()),
            mark_read_calls: std::sync::Mutex::new(Vec::new()),
        })
    }

    fn queue_page(&self, page: Vec<MessagePayload>) {
        self.pages.lock().expect("lock").push(page);
    }

    fn queue_room(&self, room: RoomSummary) {
        self.rooms.lock().expect("lock").push(room);
    }

    fn sent_requests(&self) -> Vec<SendMessageRequest> {
        self.sent.lock().expect("lock").clone()
    }

    fn mark_read_count(&self) -> usize {
        self.mark_read_calls.lock().expect("lock").len()
    }
}

#[async_trait]
impl RoomApi for TestRoomApi {
    async fn register_user(
        &self,
        display_name: &str,
        avatar_ref: Option<&str>,
        role: UserRole,
    ) -> anyhow::Result<UserSummary> {
        Ok(UserSummary {
            user_id: UserId(1),
            display_name: display_name.to_string(),
            avatar_ref: avatar_ref.map(str::to_string),
            role,
        })
    }

    async fn list_rooms(&self, _user_id: UserId) -> anyhow::Result<Vec<RoomSummary>> {
        Ok(self.rooms.lock().expect("lock").clone())
    }

    async fn create_private_room(
        &self,
        request: &CreatePrivateRoomRequest,
    ) -> anyhow::Result<RoomSummary> {
        Ok(room_summary(
            RoomId(77),
            vec![request.user_id, request.participant_id],
            0,
        ))
    }

    async fn private_room_with(
        &self,
        _user_id: UserId,
        _other_id: UserId,
        _context_ref: Option<&str>,
    ) -> anyhow::Result<Option<RoomSummary>> {
        Ok(None)
    }

    async fn list_messages(
        &self,
        _user_id: UserId,
        _room_id: RoomId,
        _limit: u32,
        _before: Option<i64>,
    ) -> anyhow::Result<Vec<MessagePayload>> {
        let mut pages = self.pages.lock().expect("lock");
        if pages.is_empty() {
            Ok(Vec::new())
        } else {
            Ok(pages.remove(0))
        }
    }

    async fn send_message(&self, request: &SendMessageRequest) -> anyhow::Result<MessagePayload> {
        if self.fail_sends.load(Ordering::SeqCst) {
            anyhow::bail!("server unavailable");
        }
        let delay = self.next_send_delay_ms.swap(0, Ordering::SeqCst);
        if delay > 0 {
            tokio::time::sleep(Duration::from_millis(delay as u64)).await;
        }
        self.sent.lock().expect("lock").push(request.clone());
        let message_id = MessageId(self.next_message_id.fetch_add(1, Ordering::SeqCst));
        Ok(MessagePayload {
            message_id,
            room_id: request.room_id,
            sender_id: request.user_id,
            sender_name: Some("alice".to_string()),
            body: request.body.clone(),
            client_nonce: request.client_nonce,
            read_by: Vec::new(),
            sent_at: Utc::now(),
        })
    }

    async fn mark_room_read(&self, user_id: UserId, room_id: RoomId) -> anyhow::Result<()> {
        self.mark_read_calls
            .lock()
            .expect("lock")
            .push((user_id, room_id));
        Ok(())
    }

    async fn leave_room(&self, _user_id: UserId, _room_id: RoomId) -> anyhow::Result<()> {
        Ok(())
    }
}

fn room_summary(room_id: RoomId, participant_ids: Vec<UserId>, unread_count: u32) -> RoomSummary {
    RoomSummary {
        room_id,
        kind: RoomKind::Private,
        creator_id: participant_ids[0],
        context_ref: None,
        participant_count: participant_ids.len() as u32,
        participant_ids,
        unread_count,
        last_message: None,
        created_at: Utc::now(),
        updated_at: Utc::now(),
    }
}

fn payload(
    id: i64,
    room_id: RoomId,
    sender_id: UserId,
    text: &str,
    nonce: Option<ClientNonce>,
) -> MessagePayload {
    MessagePayload {
        message_id: MessageId(id),
        room_id,
        sender_id,
        sender_name: None,
        body: MessageBody::text(text),
        client_nonce: nonce,
        read_by: Vec::new(),
        sent_at: Utc::now(),
    }
}

async fn connected_client(api: Arc<TestRoomApi>) -> Arc<ChatClient> {
    let client = ChatClient::new_with_api(api, "http://localhost:0");
    client
        .connect("alice", UserRole::Customer)
        .await
        .expect("connect");
    client
}

async fn wait_for(
    rx: &mut broadcast::Receiver<ClientEvent>,
    pred: impl Fn(&ClientEvent) -> bool,
) -> ClientEvent {
    tokio::time::timeout(Duration::from_secs(2), async {
        loop {
            let event = rx.recv().await.expect("event stream closed");
            if pred(&event) {
                return event;
            }
        }
    })
    .await
    .expect("timed out waiting for event")
}

/// Polls until the timeline settles into the expected shape, since delivery
/// runs on a background task.
async fn settle(client: &Arc<ChatClient>, room_id: RoomId, confirmed: usize, pending: usize) {
    tokio::time::timeout(Duration::from_secs(2), async {
        loop {
            let views = client.messages_snapshot(room_id).await;
            if confirmed_ids(&views).len() == confirmed && pending_count(&views) == pending {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("timeline did not settle")
}

fn confirmed_ids(views: &[MessageView]) -> Vec<i64> {
    views
        .iter()
        .filter_map(|view| match view {
            MessageView::Confirmed(payload) => Some(payload.message_id.0),
            MessageView::Optimistic { .. } => None,
        })
        .collect()
}

fn pending_count(views: &[MessageView]) -> usize {
    views.iter().filter(|view| view.is_pending()).count()
}

#[tokio::test]
async fn open_room_loads_history_and_marks_read() {
    let api = TestRoomApi::new();
    let room_id = RoomId(5);
    api.queue_room(room_summary(room_id, vec![UserId(1), UserId(2)], 3));
    api.queue_page(vec![
        payload(10, room_id, UserId(2), "hi", None),
        payload(11, room_id, UserId(2), "anyone there?", None),
    ]);

    let client = connected_client(Arc::clone(&api)).await;
    client.refresh_rooms().await.expect("rooms");
    assert_eq!(client.unread_count(room_id).await, 3);

    client.open_room(room_id).await.expect("open");
    assert_eq!(client.session_state(room_id).await, Some(SessionState::Live));
    assert_eq!(client.unread_count(room_id).await, 0);
    assert_eq!(api.mark_read_count(), 1);

    let views = client.messages_snapshot(room_id).await;
    assert_eq!(confirmed_ids(&views), vec![10, 11]);
}

#[tokio::test]
async fn messages_seen_while_open_are_marked_read_on_reopen() {
    let api = TestRoomApi::new();
    let room_id = RoomId(5);
    let client = connected_client(Arc::clone(&api)).await;
    client.open_room(room_id).await.expect("open");
    assert_eq!(api.mark_read_count(), 1);

    // A message lands while the room is on screen. The local counter stays
    // at zero, but the server still has it unread for this user.
    client
        .handle_server_event(ServerEvent::MessageReceived {
            message: payload(20, room_id, UserId(2), "while open", None),
        })
        .await;
    assert_eq!(client.unread_count(room_id).await, 0);

    client.close_room(room_id).await;
    client.open_room(room_id).await.expect("re-open");
    assert_eq!(api.mark_read_count(), 2);
}

#[tokio::test]
async fn optimistic_send_confirms_without_duplicate() {
    let api = TestRoomApi::new();
    let room_id = RoomId(5);
    let client = connected_client(Arc::clone(&api)).await;
    client.open_room(room_id).await.expect("open");

    let nonce = client.send_text(room_id, "hello").await.expect("send");
    settle(&client, room_id, 1, 0).await;

    // The websocket echo of the same message arrives afterwards; the nonce
    // and id both already match, so the timeline must not grow.
    let echoed = payload(100, room_id, UserId(1), "hello", Some(nonce));
    client
        .handle_server_event(ServerEvent::MessageReceived { message: echoed })
        .await;
    let views = client.messages_snapshot(room_id).await;
    assert_eq!(confirmed_ids(&views).len(), 1);
    assert_eq!(pending_count(&views), 0);
}

#[tokio::test]
async fn failed_send_is_retried_under_the_same_nonce() {
    let api = TestRoomApi::new();
    let room_id = RoomId(5);
    let client = connected_client(Arc::clone(&api)).await;
    client.open_room(room_id).await.expect("open");

    api.fail_sends.store(true, Ordering::SeqCst);
    let mut rx = client.subscribe_events();
    let nonce = client.send_text(room_id, "hello").await.expect("send");
    wait_for(&mut rx, |e| matches!(e, ClientEvent::SendFailed { .. })).await;

    let views = client.messages_snapshot(room_id).await;
    assert_eq!(pending_count(&views), 1);
    assert!(views.iter().any(|view| matches!(
        view,
        MessageView::Optimistic {
            status: session::PendingStatus::Failed,
            ..
        }
    )));

    api.fail_sends.store(false, Ordering::SeqCst);
    client.retry_send(room_id, nonce).await.expect("retry");
    settle(&client, room_id, 1, 0).await;

    let sent = api.sent_requests();
    assert_eq!(sent.len(), 1, "only the retry reached the server");
    assert_eq!(sent[0].client_nonce, Some(nonce));
}

#[tokio::test]
async fn concurrent_sends_reach_the_server_in_submission_order() {
    let api = TestRoomApi::new();
    let room_id = RoomId(5);
    let client = connected_client(Arc::clone(&api)).await;
    client.open_room(room_id).await.expect("open");

    // The first delivery stalls on the wire; the second must still queue up
    // behind it instead of overtaking.
    api.next_send_delay_ms.store(200, Ordering::SeqCst);
    client.send_text(room_id, "first").await.expect("first");
    client.send_text(room_id, "second").await.expect("second");
    settle(&client, room_id, 2, 0).await;

    let observed: Vec<String> = api
        .sent_requests()
        .iter()
        .filter_map(|request| match &request.body {
            MessageBody::Text { text } => Some(text.clone()),
            _ => None,
        })
        .collect();
    assert_eq!(observed, vec!["first", "second"]);
}

#[tokio::test]
async fn background_rooms_accumulate_unread() {
    let api = TestRoomApi::new();
    let open_room = RoomId(5);
    let background = RoomId(6);
    let client = connected_client(Arc::clone(&api)).await;
    client.open_room(open_room).await.expect("open");

    // Messages in the open room never count as unread.
    client
        .handle_server_event(ServerEvent::MessageReceived {
            message: payload(20, open_room, UserId(2), "here", None),
        })
        .await;
    assert_eq!(client.unread_count(open_room).await, 0);

    // A background room counts, except for our own messages.
    client
        .handle_server_event(ServerEvent::MessageReceived {
            message: payload(21, background, UserId(2), "elsewhere", None),
        })
        .await;
    client
        .handle_server_event(ServerEvent::MessageReceived {
            message: payload(22, background, UserId(1), "me, from another device", None),
        })
        .await;
    assert_eq!(client.unread_count(background).await, 1);

    // A room summary push reseeds the counter with the server's number.
    client
        .handle_server_event(ServerEvent::RoomUpdated {
            room: room_summary(background, vec![UserId(1), UserId(2)], 4),
        })
        .await;
    assert_eq!(client.unread_count(background).await, 4);
}

#[tokio::test]
async fn read_receipts_rewrite_read_by_in_place() {
    let api = TestRoomApi::new();
    let room_id = RoomId(5);
    api.queue_page(vec![payload(10, room_id, UserId(1), "sent earlier", None)]);
    let client = connected_client(Arc::clone(&api)).await;
    client.open_room(room_id).await.expect("open");

    client
        .handle_server_event(ServerEvent::MessageStatusUpdated {
            room_id,
            message_id: MessageId(10),
            read_by: vec![UserId(2)],
        })
        .await;

    let views = client.messages_snapshot(room_id).await;
    let MessageView::Confirmed(message) = &views[0] else {
        panic!("expected confirmed message");
    };
    assert_eq!(message.read_by, vec![UserId(2)]);
}

#[tokio::test]
async fn session_recovers_missed_messages_after_gap() {
    let room_id = RoomId(5);
    let mut session = MessageSession::new(room_id);
    session.begin_loading();
    session.apply_initial_page(vec![payload(10, room_id, UserId(2), "before", None)]);
    assert_eq!(session.state(), SessionState::Live);

    session.channel_lost();
    assert_eq!(session.state(), SessionState::Reconnecting);

    // Three messages landed while the channel was down; the recovery page
    // overlaps with what was already loaded.
    let changed = session.recovered(vec![
        payload(10, room_id, UserId(2), "before", None),
        payload(11, room_id, UserId(2), "missed 1", None),
        payload(12, room_id, UserId(2), "missed 2", None),
        payload(13, room_id, UserId(2), "missed 3", None),
    ]);
    assert!(changed);
    assert_eq!(session.state(), SessionState::Live);
    assert_eq!(confirmed_ids(session.messages()), vec![10, 11, 12, 13]);
}

#[tokio::test]
async fn older_pages_merge_without_duplicates() {
    let room_id = RoomId(5);
    let mut session = MessageSession::new(room_id);
    session.apply_initial_page(vec![
        payload(13, room_id, UserId(2), "m3", None),
        payload(14, room_id, UserId(2), "m4", None),
    ]);
    assert_eq!(session.oldest_loaded_id(), Some(MessageId(13)));

    let changed = session.prepend_older_page(vec![
        payload(12, room_id, UserId(2), "m2", None),
        payload(13, room_id, UserId(2), "m3", None),
    ]);
    assert!(changed);
    assert_eq!(confirmed_ids(session.messages()), vec![12, 13, 14]);

    // The exact same page again is a no-op.
    let changed = session.prepend_older_page(vec![
        payload(12, room_id, UserId(2), "m2", None),
        payload(13, room_id, UserId(2), "m3", None),
    ]);
    assert!(!changed);
    assert_eq!(confirmed_ids(session.messages()), vec![12, 13, 14]);
}

#[tokio::test]
async fn foreign_nonce_does_not_reconcile_local_placeholders() {
    let room_id = RoomId(5);
    let mut session = MessageSession::new(room_id);
    session.apply_initial_page(Vec::new());
    let local_nonce = session.local_send(MessageBody::text("mine"));

    // Another device of the same user sent its own message with a nonce this
    // session never issued; it lands as a regular confirmed message.
    let foreign = payload(30, room_id, UserId(1), "other device", Some(ClientNonce::generate()));
    assert!(session.apply_event(&ServerEvent::MessageReceived { message: foreign }));
    assert_eq!(pending_count(session.messages()), 1);
    assert_eq!(confirmed_ids(session.messages()), vec![30]);

    // Our own echo still reconciles the placeholder.
    let echo = payload(31, room_id, UserId(1), "mine", Some(local_nonce));
    assert!(session.apply_event(&ServerEvent::MessageReceived { message: echo }));
    assert_eq!(pending_count(session.messages()), 0);
    assert_eq!(confirmed_ids(session.messages()), vec![30, 31]);
}

#[tokio::test]
async fn events_for_other_rooms_are_ignored() {
    let room_id = RoomId(5);
    let mut session = MessageSession::new(room_id);
    session.apply_initial_page(Vec::new());

    let other = payload(40, RoomId(9), UserId(2), "wrong room", None);
    assert!(!session.apply_event(&ServerEvent::MessageReceived { message: other }));
    assert!(session.messages().is_empty());
}
