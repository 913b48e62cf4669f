use std::collections::HashMap;

use shared::{
    domain::{RoomId, UserId},
    protocol::ServerEvent,
};
use tokio::sync::{broadcast, Mutex};

const ROOM_CHANNEL_CAPACITY: usize = 256;
const USER_CHANNEL_CAPACITY: usize = 64;

/// Delivery channel: one broadcast sender per room, plus one per user for
/// room-list refresh events. Each room fans out on its own channel, so a
/// lagging subscriber in one room never delays delivery in another.
///
/// The push channel is a liveliness optimization only; subscribers that
/// reconnect after a gap must re-fetch from the store rather than trust the
/// stream.
#[derive(Default)]
pub struct EventBus {
    rooms: Mutex<HashMap<RoomId, broadcast::Sender<ServerEvent>>>,
    users: Mutex<HashMap<UserId, broadcast::Sender<ServerEvent>>>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn subscribe_room(&self, room_id: RoomId) -> broadcast::Receiver<ServerEvent> {
        self.rooms
            .lock()
            .await
            .entry(room_id)
            .or_insert_with(|| broadcast::channel(ROOM_CHANNEL_CAPACITY).0)
            .subscribe()
    }

    pub async fn subscribe_user(&self, user_id: UserId) -> broadcast::Receiver<ServerEvent> {
        self.users
            .lock()
            .await
            .entry(user_id)
            .or_insert_with(|| broadcast::channel(USER_CHANNEL_CAPACITY).0)
            .subscribe()
    }

    /// Delivers an event to the room's current subscribers. Events produced
    /// for the same room are observed in publish order by every subscriber.
    /// A channel whose last subscriber is gone is removed, so the maps do not
    /// accumulate entries for rooms nobody watches anymore.
    pub async fn publish_to_room(&self, room_id: RoomId, event: ServerEvent) {
        let mut rooms = self.rooms.lock().await;
        if let Some(sender) = rooms.get(&room_id) {
            if sender.send(event).is_err() {
                rooms.remove(&room_id);
            }
        }
    }

    pub async fn publish_to_user(&self, user_id: UserId, event: ServerEvent) {
        let mut users = self.users.lock().await;
        if let Some(sender) = users.get(&user_id) {
            if sender.send(event).is_err() {
                users.remove(&user_id);
            }
        }
    }
}
