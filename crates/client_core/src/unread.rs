use std::collections::HashMap;

use shared::{
    domain::{RoomId, UserId},
    protocol::MessagePayload,
};

/// Per-room unread counters for the room list. The currently open room never
/// accumulates unread; entering a room zeroes its counter.
pub struct UnreadTracker {
    self_id: UserId,
    open_room: Option<RoomId>,
    counts: HashMap<RoomId, u32>,
}

impl UnreadTracker {
    pub fn new(self_id: UserId) -> Self {
        Self {
            self_id,
            open_room: None,
            counts: HashMap::new(),
        }
    }

    /// Seeds a counter from a server-side summary, the authoritative value.
    pub fn set_count(&mut self, room_id: RoomId, count: u32) {
        if self.open_room == Some(room_id) {
            self.counts.insert(room_id, 0);
        } else {
            self.counts.insert(room_id, count);
        }
    }

    pub fn count(&self, room_id: RoomId) -> u32 {
        self.counts.get(&room_id).copied().unwrap_or(0)
    }

    pub fn total(&self) -> u32 {
        self.counts.values().sum()
    }

    /// Counts an incoming message. Own messages and messages in the open
    /// room do not raise the counter. Returns the new count when it changed.
    pub fn on_message_received(&mut self, message: &MessagePayload) -> Option<u32> {
        if message.sender_id == self.self_id || self.open_room == Some(message.room_id) {
            return None;
        }
        let count = self.counts.entry(message.room_id).or_insert(0);
        *count += 1;
        Some(*count)
    }

    /// Marks a room as the open one and zeroes its counter.
    pub fn open_room(&mut self, room_id: RoomId) {
        self.open_room = Some(room_id);
        self.counts.insert(room_id, 0);
    }

    pub fn close_room(&mut self, room_id: RoomId) {
        if self.open_room == Some(room_id) {
            self.open_room = None;
        }
    }
}
