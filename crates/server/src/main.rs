use std::{collections::HashMap, net::SocketAddr, sync::Arc};

use axum::{
    extract::{Path, Query, State, WebSocketUpgrade},
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use serde::Deserialize;
use server_api::ApiContext;
use shared::{
    domain::{RoomId, UserId, UserSummary},
    error::{ApiError, ErrorCode},
    protocol::{
        AddParticipantsRequest, ClientFrame, CreatePrivateRoomRequest, MessagePayload,
        RegisterUserRequest, RoomSummary, SendMessageRequest, ServerEvent,
    },
};
use storage::Storage;
use tokio::sync::{broadcast, mpsc, Notify};
use tracing::{error, info, warn};

mod config;
mod fanout;

use config::{load_settings, prepare_database_url};
use fanout::EventBus;

#[derive(Clone)]
struct AppState {
    api: ApiContext,
    bus: Arc<EventBus>,
}

#[derive(Debug, Deserialize)]
struct UserQuery {
    user_id: i64,
}

#[derive(Debug, Deserialize)]
struct WsQuery {
    user_id: i64,
}

#[derive(Debug, Deserialize)]
struct PrivateRoomLookupQuery {
    user_id: i64,
    context_ref: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ListMessagesQuery {
    user_id: i64,
    limit: Option<u32>,
    before: Option<i64>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt().with_env_filter("info").init();

    let settings = load_settings();
    let database_url = prepare_database_url(&settings.database_url)?;
    let storage = Storage::new(&database_url).await.map_err(|error| {
        error!(
            %database_url,
            %error,
            "failed to open SQLite database; verify parent directory exists and permissions are correct"
        );
        error
    })?;

    let state = AppState {
        api: ApiContext { storage },
        bus: Arc::new(EventBus::new()),
    };
    let app = build_router(Arc::new(state));

    let addr: SocketAddr = settings.server_bind.parse()?;
    info!(%addr, "server listening");
    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;
    Ok(())
}

fn build_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/users", post(http_register_user))
        .route("/rooms", get(http_list_rooms))
        .route("/rooms/private", post(http_create_private_room))
        .route("/rooms/private/with/:user_id", get(http_private_room_with))
        .route("/rooms/:room_id/messages", get(http_list_messages))
        .route("/rooms/:room_id/read", post(http_mark_room_read))
        .route("/rooms/:room_id/leave", post(http_leave_room))
        .route("/rooms/:room_id/participants", post(http_add_participants))
        .route("/messages", post(http_send_message))
        .route("/ws", get(ws_handler))
        .with_state(state)
}

async fn healthz(State(state): State<Arc<AppState>>) -> (StatusCode, &'static str) {
    match state.api.storage.health_check().await {
        Ok(()) => (StatusCode::OK, "ok"),
        Err(_) => (StatusCode::SERVICE_UNAVAILABLE, "db unavailable"),
    }
}

fn reject(err: ApiError) -> (StatusCode, Json<ApiError>) {
    let status = match err.code {
        ErrorCode::InvalidParticipant | ErrorCode::Validation => StatusCode::BAD_REQUEST,
        ErrorCode::Forbidden => StatusCode::FORBIDDEN,
        ErrorCode::NotFound => StatusCode::NOT_FOUND,
        ErrorCode::Internal => StatusCode::INTERNAL_SERVER_ERROR,
    };
    (status, Json(err))
}

async fn http_register_user(
    State(state): State<Arc<AppState>>,
    Json(req): Json<RegisterUserRequest>,
) -> Result<Json<UserSummary>, (StatusCode, Json<ApiError>)> {
    let user = server_api::register_user(
        &state.api,
        &req.display_name,
        req.avatar_ref.as_deref(),
        req.role,
    )
    .await
    .map_err(reject)?;
    Ok(Json(user))
}

async fn http_list_rooms(
    State(state): State<Arc<AppState>>,
    Query(q): Query<UserQuery>,
) -> Result<Json<Vec<RoomSummary>>, (StatusCode, Json<ApiError>)> {
    let rooms = server_api::list_rooms(&state.api, UserId(q.user_id))
        .await
        .map_err(reject)?;
    Ok(Json(rooms))
}

async fn http_create_private_room(
    State(state): State<Arc<AppState>>,
    Json(req): Json<CreatePrivateRoomRequest>,
) -> Result<(StatusCode, Json<RoomSummary>), (StatusCode, Json<ApiError>)> {
    let (room, created) = server_api::find_or_create_private_room(
        &state.api,
        req.user_id,
        req.participant_id,
        req.context_ref.as_deref(),
    )
    .await
    .map_err(reject)?;

    if created {
        push_room_update(&state, room.room_id, &room.participant_ids).await;
    }

    let status = if created {
        StatusCode::CREATED
    } else {
        StatusCode::OK
    };
    Ok((status, Json(room)))
}

async fn http_private_room_with(
    State(state): State<Arc<AppState>>,
    Path(other_id): Path<i64>,
    Query(q): Query<PrivateRoomLookupQuery>,
) -> Result<Json<Option<RoomSummary>>, (StatusCode, Json<ApiError>)> {
    let room = server_api::private_room_with_user(
        &state.api,
        UserId(q.user_id),
        UserId(other_id),
        q.context_ref.as_deref(),
    )
    .await
    .map_err(reject)?;
    Ok(Json(room))
}

async fn http_list_messages(
    State(state): State<Arc<AppState>>,
    Path(room_id): Path<i64>,
    Query(q): Query<ListMessagesQuery>,
) -> Result<Json<Vec<MessagePayload>>, (StatusCode, Json<ApiError>)> {
    let limit = q.limit.unwrap_or(50).clamp(1, 100);
    let messages = server_api::list_messages(
        &state.api,
        UserId(q.user_id),
        RoomId(room_id),
        limit,
        q.before,
    )
    .await
    .map_err(reject)?;
    Ok(Json(messages))
}

async fn http_send_message(
    State(state): State<Arc<AppState>>,
    Json(req): Json<SendMessageRequest>,
) -> Result<Json<MessagePayload>, (StatusCode, Json<ApiError>)> {
    let event = server_api::send_message(
        &state.api,
        req.user_id,
        req.room_id,
        &req.body,
        req.client_nonce,
    )
    .await
    .map_err(reject)?;

    let ServerEvent::MessageReceived { message } = event else {
        return Err(reject(ApiError::new(
            ErrorCode::Internal,
            "unexpected event from send path",
        )));
    };

    state
        .bus
        .publish_to_room(
            req.room_id,
            ServerEvent::MessageReceived {
                message: message.clone(),
            },
        )
        .await;

    // Room lists show the new last message and unread counts; those views are
    // per user, so each participant gets their own summary.
    match state.api.storage.participants_for_room(req.room_id).await {
        Ok(participant_ids) => push_room_update(&state, req.room_id, &participant_ids).await,
        Err(error) => warn!(room_id = req.room_id.0, %error, "room update fan-out skipped"),
    }

    Ok(Json(message))
}

async fn http_mark_room_read(
    State(state): State<Arc<AppState>>,
    Path(room_id): Path<i64>,
    Query(q): Query<UserQuery>,
) -> Result<StatusCode, (StatusCode, Json<ApiError>)> {
    let events = server_api::mark_room_read(&state.api, UserId(q.user_id), RoomId(room_id))
        .await
        .map_err(reject)?;
    for event in events {
        state.bus.publish_to_room(RoomId(room_id), event).await;
    }
    Ok(StatusCode::NO_CONTENT)
}

async fn http_leave_room(
    State(state): State<Arc<AppState>>,
    Path(room_id): Path<i64>,
    Query(q): Query<UserQuery>,
) -> Result<StatusCode, (StatusCode, Json<ApiError>)> {
    let room_id = RoomId(room_id);
    server_api::leave_room(&state.api, UserId(q.user_id), room_id)
        .await
        .map_err(reject)?;

    match state.api.storage.participants_for_room(room_id).await {
        Ok(remaining) => push_room_update(&state, room_id, &remaining).await,
        Err(error) => warn!(room_id = room_id.0, %error, "room update fan-out skipped"),
    }
    Ok(StatusCode::NO_CONTENT)
}

async fn http_add_participants(
    State(state): State<Arc<AppState>>,
    Path(room_id): Path<i64>,
    Json(req): Json<AddParticipantsRequest>,
) -> Result<Json<RoomSummary>, (StatusCode, Json<ApiError>)> {
    let room_id = RoomId(room_id);
    let room = server_api::add_participants(&state.api, req.user_id, room_id, &req.participant_ids)
        .await
        .map_err(reject)?;
    push_room_update(&state, room_id, &room.participant_ids).await;
    Ok(Json(room))
}

/// Sends each listed participant a `RoomUpdated` event on their user channel
/// with their own unread count baked in.
async fn push_room_update(state: &AppState, room_id: RoomId, participant_ids: &[UserId]) {
    for participant_id in participant_ids {
        match server_api::room_summary_by_id(&state.api, *participant_id, room_id).await {
            Ok(room) => {
                state
                    .bus
                    .publish_to_user(*participant_id, ServerEvent::RoomUpdated { room })
                    .await;
            }
            Err(error) => warn!(
                room_id = room_id.0,
                user_id = participant_id.0,
                error = %error.message,
                "room update fan-out skipped"
            ),
        }
    }
}

async fn ws_handler(
    ws: WebSocketUpgrade,
    State(state): State<Arc<AppState>>,
    Query(q): Query<WsQuery>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| ws_connection(state, socket, UserId(q.user_id)))
}

/// Pumps one broadcast feed into a connection's writer queue. A receiver that
/// lags has already lost events, so the connection is flagged for shutdown;
/// the client reconnects and re-fetches history instead of trusting the
/// stream across the gap.
async fn forward_events(
    mut rx: broadcast::Receiver<ServerEvent>,
    out: mpsc::Sender<ServerEvent>,
    lagged: Arc<Notify>,
) {
    use tokio::sync::broadcast::error::RecvError;

    loop {
        match rx.recv().await {
            Ok(event) => {
                if out.send(event).await.is_err() {
                    break;
                }
            }
            Err(RecvError::Lagged(_)) => {
                lagged.notify_one();
                break;
            }
            Err(RecvError::Closed) => break,
        }
    }
}

async fn ws_connection(
    state: Arc<AppState>,
    socket: axum::extract::ws::WebSocket,
    user_id: UserId,
) {
    use axum::extract::ws::Message;
    use futures::{SinkExt, StreamExt};

    let (mut sink, mut receiver) = socket.split();

    // All outbound traffic funnels through one writer task so room forwarders
    // never contend for the socket.
    let (out_tx, mut out_rx) = mpsc::channel::<ServerEvent>(64);
    let writer_task = tokio::spawn(async move {
        while let Some(event) = out_rx.recv().await {
            let text = match serde_json::to_string(&event) {
                Ok(v) => v,
                Err(_) => continue,
            };
            if sink.send(Message::Text(text)).await.is_err() {
                break;
            }
        }
    });

    let lagged = Arc::new(Notify::new());
    let user_rx = state.bus.subscribe_user(user_id).await;
    let user_task = tokio::spawn(forward_events(
        user_rx,
        out_tx.clone(),
        Arc::clone(&lagged),
    ));

    let mut room_tasks: HashMap<RoomId, tokio::task::JoinHandle<()>> = HashMap::new();

    loop {
        let message = tokio::select! {
            _ = lagged.notified() => break,
            incoming = receiver.next() => match incoming {
                Some(Ok(message)) => message,
                _ => break,
            },
        };
        let Message::Text(text) = message else {
            continue;
        };
        let frame = match serde_json::from_str::<ClientFrame>(&text) {
            Ok(frame) => frame,
            Err(_) => {
                let _ = out_tx
                    .send(ServerEvent::Error(ApiError::new(
                        ErrorCode::Validation,
                        "unrecognized frame",
                    )))
                    .await;
                continue;
            }
        };

        match frame {
            ClientFrame::SubscribeRoom { room_id } => {
                if room_tasks.contains_key(&room_id) {
                    continue;
                }
                let allowed = state
                    .api
                    .storage
                    .is_participant(room_id, user_id)
                    .await
                    .unwrap_or(false);
                if !allowed {
                    let _ = out_tx
                        .send(ServerEvent::Error(ApiError::new(
                            ErrorCode::Forbidden,
                            "user is not a participant of this room",
                        )))
                        .await;
                    continue;
                }
                let room_rx = state.bus.subscribe_room(room_id).await;
                room_tasks.insert(
                    room_id,
                    tokio::spawn(forward_events(
                        room_rx,
                        out_tx.clone(),
                        Arc::clone(&lagged),
                    )),
                );
            }
            ClientFrame::UnsubscribeRoom { room_id } => {
                if let Some(task) = room_tasks.remove(&room_id) {
                    task.abort();
                }
            }
        }
    }

    for task in room_tasks.into_values() {
        task.abort();
    }
    user_task.abort();
    writer_task.abort();
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::{body::Body, http::Request};
    use shared::domain::UserRole;
    use shared::protocol::MessageBody;
    use tower::ServiceExt;

    async fn test_app() -> (Router, i64, i64) {
        let storage = Storage::new("sqlite::memory:").await.expect("db");
        let alice = storage
            .create_user("alice", None, UserRole::Customer)
            .await
            .expect("alice");
        let bob = storage
            .create_user("bob", None, UserRole::Owner)
            .await
            .expect("bob");
        let state = AppState {
            api: ApiContext { storage },
            bus: Arc::new(EventBus::new()),
        };
        (build_router(Arc::new(state)), alice.0, bob.0)
    }

    async fn body_json(response: axum::response::Response) -> serde_json::Value {
        let bytes = axum::body::to_bytes(response.into_body(), 64 * 1024)
            .await
            .expect("body");
        serde_json::from_slice(&bytes).expect("json")
    }

    fn create_room_request(user_id: i64, participant_id: i64) -> Request<Body> {
        Request::post("/rooms/private")
            .header("content-type", "application/json")
            .body(Body::from(
                serde_json::json!({
                    "user_id": user_id,
                    "participant_id": participant_id,
                })
                .to_string(),
            ))
            .expect("request")
    }

    #[tokio::test]
    async fn lagged_event_feed_flags_the_connection_for_shutdown() {
        let (tx, rx) = broadcast::channel(2);
        for n in 0..5 {
            tx.send(ServerEvent::MessageStatusUpdated {
                room_id: RoomId(1),
                message_id: shared::domain::MessageId(n),
                read_by: vec![UserId(1)],
            })
            .expect("send");
        }

        let (out_tx, mut out_rx) = tokio::sync::mpsc::channel(16);
        let lagged = Arc::new(Notify::new());
        forward_events(rx, out_tx, Arc::clone(&lagged)).await;

        tokio::time::timeout(std::time::Duration::from_secs(1), lagged.notified())
            .await
            .expect("lag must flag the connection");
        assert!(out_rx.try_recv().is_err(), "nothing forwarded past the gap");
    }

    #[tokio::test]
    async fn healthz_reports_ok() {
        let (app, _, _) = test_app().await;
        let response = app
            .oneshot(
                Request::get("/healthz")
                    .body(Body::empty())
                    .expect("request"),
            )
            .await
            .expect("response");
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn private_room_create_is_idempotent_over_http() {
        let (app, alice, bob) = test_app().await;

        let first = app
            .clone()
            .oneshot(create_room_request(alice, bob))
            .await
            .expect("first response");
        assert_eq!(first.status(), StatusCode::CREATED);
        let first = body_json(first).await;

        let second = app
            .oneshot(create_room_request(bob, alice))
            .await
            .expect("second response");
        assert_eq!(second.status(), StatusCode::OK);
        let second = body_json(second).await;

        assert_eq!(first["room_id"], second["room_id"]);
    }

    #[tokio::test]
    async fn self_chat_is_a_bad_request() {
        let (app, alice, _) = test_app().await;
        let response = app
            .oneshot(create_room_request(alice, alice))
            .await
            .expect("response");
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        let body = body_json(response).await;
        assert_eq!(body["code"], "invalid_participant");
    }

    #[tokio::test]
    async fn message_history_requires_participation() {
        let (app, alice, bob) = test_app().await;
        let created = app
            .clone()
            .oneshot(create_room_request(alice, bob))
            .await
            .expect("response");
        let room_id = body_json(created).await["room_id"].as_i64().expect("id");

        let response = app
            .oneshot(
                Request::get(format!("/rooms/{room_id}/messages?user_id=999"))
                    .body(Body::empty())
                    .expect("request"),
            )
            .await
            .expect("response");
        // Unknown users are simply not participants.
        assert_eq!(response.status(), StatusCode::FORBIDDEN);
    }

    #[tokio::test]
    async fn send_and_list_round_trip() {
        let (app, alice, bob) = test_app().await;
        let created = app
            .clone()
            .oneshot(create_room_request(alice, bob))
            .await
            .expect("response");
        let room_id = body_json(created).await["room_id"].as_i64().expect("id");

        let send = Request::post("/messages")
            .header("content-type", "application/json")
            .body(Body::from(
                serde_json::to_string(&SendMessageRequest {
                    user_id: UserId(alice),
                    room_id: RoomId(room_id),
                    body: MessageBody::text("is the spot still free?"),
                    client_nonce: None,
                })
                .expect("encode"),
            ))
            .expect("request");
        let response = app.clone().oneshot(send).await.expect("send response");
        assert_eq!(response.status(), StatusCode::OK);
        let sent = body_json(response).await;
        assert_eq!(sent["sender_id"], alice);

        let listed = app
            .oneshot(
                Request::get(format!("/rooms/{room_id}/messages?user_id={bob}"))
                    .body(Body::empty())
                    .expect("request"),
            )
            .await
            .expect("list response");
        assert_eq!(listed.status(), StatusCode::OK);
        let messages = body_json(listed).await;
        assert_eq!(messages.as_array().expect("array").len(), 1);
        assert_eq!(
            messages[0]["body"]["payload"]["text"],
            "is the spot still free?"
        );
    }

    #[tokio::test]
    async fn mark_read_returns_no_content() {
        let (app, alice, bob) = test_app().await;
        let created = app
            .clone()
            .oneshot(create_room_request(alice, bob))
            .await
            .expect("response");
        let room_id = body_json(created).await["room_id"].as_i64().expect("id");

        let response = app
            .oneshot(
                Request::post(format!("/rooms/{room_id}/read?user_id={bob}"))
                    .body(Body::empty())
                    .expect("request"),
            )
            .await
            .expect("response");
        assert_eq!(response.status(), StatusCode::NO_CONTENT);
    }
}
