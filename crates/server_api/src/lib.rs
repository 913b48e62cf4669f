use std::collections::HashMap;

use shared::{
    domain::{ClientNonce, RoomId, RoomKind, UserId, UserRole, UserSummary},
    error::{ApiError, ErrorCode},
    protocol::{MessageBody, MessagePayload, RoomSummary, ServerEvent},
};
use storage::{Storage, StoredMessage, StoredRoom};
use tracing::info;

#[derive(Clone)]
pub struct ApiContext {
    pub storage: Storage,
}

pub async fn register_user(
    ctx: &ApiContext,
    display_name: &str,
    avatar_ref: Option<&str>,
    role: UserRole,
) -> Result<UserSummary, ApiError> {
    let display_name = display_name.trim();
    if display_name.is_empty() {
        return Err(ApiError::new(
            ErrorCode::Validation,
            "display_name cannot be empty",
        ));
    }
    let user_id = ctx
        .storage
        .create_user(display_name, avatar_ref, role)
        .await
        .map_err(internal)?;
    Ok(UserSummary {
        user_id,
        display_name: display_name.to_string(),
        avatar_ref: avatar_ref.map(str::to_string),
        role,
    })
}

/// Room Coordinator: find-or-create for private rooms. Exactly one room can
/// exist per unordered pair and context, even when both sides race; the
/// loser of the race receives the winner's room.
pub async fn find_or_create_private_room(
    ctx: &ApiContext,
    requester_id: UserId,
    participant_id: UserId,
    context_ref: Option<&str>,
) -> Result<(RoomSummary, bool), ApiError> {
    if requester_id == participant_id {
        return Err(ApiError::new(
            ErrorCode::InvalidParticipant,
            "cannot open a private room with yourself",
        ));
    }
    ctx.storage
        .user(participant_id)
        .await
        .map_err(internal)?
        .ok_or_else(|| ApiError::new(ErrorCode::NotFound, "participant not found"))?;

    let (room, created) = ctx
        .storage
        .find_or_create_private_room(requester_id, participant_id, context_ref)
        .await
        .map_err(internal)?;
    if created {
        info!(
            room_id = room.room_id.0,
            requester_id = requester_id.0,
            participant_id = participant_id.0,
            "private room created"
        );
    }

    let summary = room_summary(ctx, requester_id, &room).await?;
    Ok((summary, created))
}

pub async fn private_room_with_user(
    ctx: &ApiContext,
    requester_id: UserId,
    other_id: UserId,
    context_ref: Option<&str>,
) -> Result<Option<RoomSummary>, ApiError> {
    if requester_id == other_id {
        return Err(ApiError::new(
            ErrorCode::InvalidParticipant,
            "cannot look up a private room with yourself",
        ));
    }
    let Some(room) = ctx
        .storage
        .private_room_for_pair(requester_id, other_id, context_ref)
        .await
        .map_err(internal)?
    else {
        return Ok(None);
    };
    Ok(Some(room_summary(ctx, requester_id, &room).await?))
}

pub async fn list_rooms(ctx: &ApiContext, user_id: UserId) -> Result<Vec<RoomSummary>, ApiError> {
    let rooms = ctx
        .storage
        .list_rooms_for_user(user_id)
        .await
        .map_err(internal)?;

    let mut name_cache: HashMap<UserId, Option<String>> = HashMap::new();
    let mut summaries = Vec::with_capacity(rooms.len());
    for room in rooms {
        summaries.push(room_summary_cached(ctx, user_id, &room, &mut name_cache).await?);
    }
    Ok(summaries)
}

pub async fn list_messages(
    ctx: &ApiContext,
    user_id: UserId,
    room_id: RoomId,
    limit: u32,
    before: Option<i64>,
) -> Result<Vec<MessagePayload>, ApiError> {
    ensure_participant(ctx, room_id, user_id).await?;

    let messages = ctx
        .storage
        .list_room_messages(room_id, limit, before)
        .await
        .map_err(internal)?;

    let mut name_cache: HashMap<UserId, Option<String>> = HashMap::new();
    let mut payloads = Vec::with_capacity(messages.len());
    for message in messages {
        let read_by = ctx
            .storage
            .read_by_for_message(message.message_id)
            .await
            .map_err(internal)?;
        payloads.push(payload_for(ctx, message, read_by, &mut name_cache).await?);
    }
    Ok(payloads)
}

/// Send path: append to the room's log and return the `MessageReceived`
/// event the caller fans out. The server assigns id and timestamp; the
/// client nonce is echoed back untouched so the originating session can
/// reconcile its optimistic placeholder.
pub async fn send_message(
    ctx: &ApiContext,
    user_id: UserId,
    room_id: RoomId,
    body: &MessageBody,
    client_nonce: Option<ClientNonce>,
) -> Result<ServerEvent, ApiError> {
    ensure_participant(ctx, room_id, user_id).await?;
    validate_body(body)?;

    let message = ctx
        .storage
        .append_message(room_id, user_id, body, client_nonce)
        .await
        .map_err(internal)?;

    let mut name_cache = HashMap::new();
    let payload = payload_for(ctx, message, Vec::new(), &mut name_cache).await?;
    Ok(ServerEvent::MessageReceived { message: payload })
}

/// Stamps the caller on all unread messages, returning one
/// `MessageStatusUpdated` per newly stamped message so original senders can
/// observe the read receipts. Re-marking an already-read room yields no
/// events.
pub async fn mark_room_read(
    ctx: &ApiContext,
    user_id: UserId,
    room_id: RoomId,
) -> Result<Vec<ServerEvent>, ApiError> {
    ensure_participant(ctx, room_id, user_id).await?;

    let stamped = ctx
        .storage
        .mark_room_read(room_id, user_id)
        .await
        .map_err(internal)?;

    let mut events = Vec::with_capacity(stamped.len());
    for message_id in stamped {
        let read_by = ctx
            .storage
            .read_by_for_message(message_id)
            .await
            .map_err(internal)?;
        events.push(ServerEvent::MessageStatusUpdated {
            room_id,
            message_id,
            read_by,
        });
    }
    Ok(events)
}

pub async fn leave_room(
    ctx: &ApiContext,
    user_id: UserId,
    room_id: RoomId,
) -> Result<(), ApiError> {
    ensure_participant(ctx, room_id, user_id).await?;
    ctx.storage
        .remove_participant(room_id, user_id)
        .await
        .map_err(internal)?;
    info!(room_id = room_id.0, user_id = user_id.0, "participant left room");
    Ok(())
}

pub async fn add_participants(
    ctx: &ApiContext,
    user_id: UserId,
    room_id: RoomId,
    participant_ids: &[UserId],
) -> Result<RoomSummary, ApiError> {
    let room = ensure_participant(ctx, room_id, user_id).await?;
    if room.kind == RoomKind::Private {
        return Err(ApiError::new(
            ErrorCode::Validation,
            "cannot add participants to a private room",
        ));
    }
    for participant_id in participant_ids {
        ctx.storage
            .user(*participant_id)
            .await
            .map_err(internal)?
            .ok_or_else(|| ApiError::new(ErrorCode::NotFound, "participant not found"))?;
    }
    ctx.storage
        .add_participants(room_id, participant_ids)
        .await
        .map_err(internal)?;
    room_summary(ctx, user_id, &room).await
}

/// Denormalized per-user view of a room for list display and `roomUpdated`
/// fan-out. The unread count is specific to `user_id`.
pub async fn room_summary_by_id(
    ctx: &ApiContext,
    user_id: UserId,
    room_id: RoomId,
) -> Result<RoomSummary, ApiError> {
    let room = ctx
        .storage
        .room(room_id)
        .await
        .map_err(internal)?
        .ok_or_else(|| ApiError::new(ErrorCode::NotFound, "room not found"))?;
    room_summary(ctx, user_id, &room).await
}

async fn room_summary(
    ctx: &ApiContext,
    user_id: UserId,
    room: &StoredRoom,
) -> Result<RoomSummary, ApiError> {
    let mut name_cache = HashMap::new();
    room_summary_cached(ctx, user_id, room, &mut name_cache).await
}

async fn room_summary_cached(
    ctx: &ApiContext,
    user_id: UserId,
    room: &StoredRoom,
    name_cache: &mut HashMap<UserId, Option<String>>,
) -> Result<RoomSummary, ApiError> {
    let participant_ids = ctx
        .storage
        .participants_for_room(room.room_id)
        .await
        .map_err(internal)?;
    let unread = ctx
        .storage
        .unread_count(room.room_id, user_id)
        .await
        .map_err(internal)?;

    let last_message = match room.last_message_id {
        Some(message_id) => {
            let stored = ctx.storage.message(message_id).await.map_err(internal)?;
            match stored {
                Some(stored) => {
                    let read_by = ctx
                        .storage
                        .read_by_for_message(message_id)
                        .await
                        .map_err(internal)?;
                    Some(payload_for(ctx, stored, read_by, name_cache).await?)
                }
                None => None,
            }
        }
        None => None,
    };

    Ok(RoomSummary {
        room_id: room.room_id,
        kind: room.kind,
        creator_id: room.creator_id,
        context_ref: room.context_ref.clone(),
        participant_count: participant_ids.len() as u32,
        participant_ids,
        unread_count: unread.max(0) as u32,
        last_message,
        created_at: room.created_at,
        updated_at: room.updated_at,
    })
}

async fn payload_for(
    ctx: &ApiContext,
    message: StoredMessage,
    read_by: Vec<UserId>,
    name_cache: &mut HashMap<UserId, Option<String>>,
) -> Result<MessagePayload, ApiError> {
    let sender_name = if let Some(cached) = name_cache.get(&message.sender_id) {
        cached.clone()
    } else {
        let resolved = ctx
            .storage
            .user(message.sender_id)
            .await
            .map_err(internal)?
            .map(|user| user.display_name);
        name_cache.insert(message.sender_id, resolved.clone());
        resolved
    };

    Ok(MessagePayload {
        message_id: message.message_id,
        room_id: message.room_id,
        sender_id: message.sender_id,
        sender_name,
        body: message.body,
        client_nonce: message.client_nonce,
        read_by,
        sent_at: message.created_at,
    })
}

async fn ensure_participant(
    ctx: &ApiContext,
    room_id: RoomId,
    user_id: UserId,
) -> Result<StoredRoom, ApiError> {
    let room = ctx
        .storage
        .room(room_id)
        .await
        .map_err(internal)?
        .ok_or_else(|| ApiError::new(ErrorCode::NotFound, "room not found"))?;
    let is_participant = ctx
        .storage
        .is_participant(room_id, user_id)
        .await
        .map_err(internal)?;
    if !is_participant {
        return Err(ApiError::new(
            ErrorCode::Forbidden,
            "user is not a participant of this room",
        ));
    }
    Ok(room)
}

fn validate_body(body: &MessageBody) -> Result<(), ApiError> {
    let empty = match body {
        MessageBody::Text { text } | MessageBody::System { text } => text.trim().is_empty(),
        MessageBody::Image { url, .. } | MessageBody::File { url, .. } => url.trim().is_empty(),
    };
    if empty {
        return Err(ApiError::new(
            ErrorCode::Validation,
            "message body cannot be empty",
        ));
    }
    Ok(())
}

fn internal(err: anyhow::Error) -> ApiError {
    ApiError::new(ErrorCode::Internal, err.to_string())
}
