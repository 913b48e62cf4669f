use shared::{
    domain::{ClientNonce, MessageId, RoomId, UserId},
    protocol::{MessageBody, MessagePayload, ServerEvent},
};

/// Lifecycle of one open conversation view.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Idle,
    Loading,
    Live,
    Reconnecting,
    Closed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PendingStatus {
    Sending,
    Failed,
}

/// A row in the conversation: either server-confirmed, or a local optimistic
/// placeholder still waiting for its echo.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MessageView {
    Confirmed(MessagePayload),
    Optimistic {
        nonce: ClientNonce,
        body: MessageBody,
        status: PendingStatus,
    },
}

impl MessageView {
    pub fn is_pending(&self) -> bool {
        matches!(self, Self::Optimistic { .. })
    }
}

/// Per-room message timeline. Confirmed messages stay in ascending id order
/// with optimistic placeholders at the tail; every mutation is deterministic
/// so replayed or duplicated events cannot fork the view.
pub struct MessageSession {
    room_id: RoomId,
    state: SessionState,
    messages: Vec<MessageView>,
}

impl MessageSession {
    pub fn new(room_id: RoomId) -> Self {
        Self {
            room_id,
            state: SessionState::Idle,
            messages: Vec::new(),
        }
    }

    pub fn room_id(&self) -> RoomId {
        self.room_id
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn messages(&self) -> &[MessageView] {
        &self.messages
    }

    pub fn begin_loading(&mut self) {
        self.state = SessionState::Loading;
    }

    pub fn close(&mut self) {
        self.state = SessionState::Closed;
    }

    pub fn channel_lost(&mut self) {
        if self.state == SessionState::Live {
            self.state = SessionState::Reconnecting;
        }
    }

    /// Oldest confirmed id currently loaded, the `before` cursor for the next
    /// backward page.
    pub fn oldest_loaded_id(&self) -> Option<MessageId> {
        self.messages.iter().find_map(|view| match view {
            MessageView::Confirmed(payload) => Some(payload.message_id),
            MessageView::Optimistic { .. } => None,
        })
    }

    /// Installs the initial history page and goes live. Optimistic
    /// placeholders survive; any that the page already confirms are
    /// reconciled instead of duplicated.
    pub fn apply_initial_page(&mut self, page: Vec<MessagePayload>) {
        self.messages.retain(MessageView::is_pending);
        for payload in page {
            self.absorb_confirmed(payload);
        }
        self.state = SessionState::Live;
    }

    /// Merges an older page below what is already loaded. Overlapping ids are
    /// dropped, so a page that partially repeats is harmless.
    pub fn prepend_older_page(&mut self, page: Vec<MessagePayload>) -> bool {
        let mut changed = false;
        for payload in page {
            changed |= self.insert_confirmed(payload);
        }
        changed
    }

    /// Appends an optimistic placeholder for a locally composed message and
    /// returns the nonce that will reconcile it.
    pub fn local_send(&mut self, body: MessageBody) -> ClientNonce {
        let nonce = ClientNonce::generate();
        self.messages.push(MessageView::Optimistic {
            nonce,
            body,
            status: PendingStatus::Sending,
        });
        nonce
    }

    pub fn mark_failed(&mut self, nonce: ClientNonce) -> bool {
        self.set_pending_status(nonce, PendingStatus::Failed)
    }

    /// Re-arms a failed placeholder for another delivery attempt. The nonce
    /// is reused so a late echo of the first attempt still reconciles.
    pub fn retry(&mut self, nonce: ClientNonce) -> Option<MessageBody> {
        for view in &mut self.messages {
            if let MessageView::Optimistic {
                nonce: pending,
                body,
                status,
            } = view
            {
                if *pending == nonce && *status == PendingStatus::Failed {
                    *status = PendingStatus::Sending;
                    return Some(body.clone());
                }
            }
        }
        None
    }

    /// Applies a room event to the timeline. Returns true when the visible
    /// view changed.
    pub fn apply_event(&mut self, event: &ServerEvent) -> bool {
        match event {
            ServerEvent::MessageReceived { message } => {
                if message.room_id != self.room_id {
                    return false;
                }
                self.absorb_confirmed(message.clone())
            }
            ServerEvent::MessageStatusUpdated {
                room_id,
                message_id,
                read_by,
            } => {
                if *room_id != self.room_id {
                    return false;
                }
                self.update_read_by(*message_id, read_by)
            }
            ServerEvent::RoomUpdated { .. } | ServerEvent::Error(_) => false,
        }
    }

    /// Replays the newest history after a reconnect, reconciling anything the
    /// session missed while the channel was down, then goes live again.
    pub fn recovered(&mut self, latest_page: Vec<MessagePayload>) -> bool {
        let mut changed = false;
        for payload in latest_page {
            changed |= self.absorb_confirmed(payload);
        }
        if self.state == SessionState::Reconnecting {
            self.state = SessionState::Live;
            changed = true;
        }
        changed
    }

    /// Confirmed-message intake used by live events, echoes, and recovery.
    /// A payload carrying a nonce we are still waiting on replaces that
    /// placeholder; otherwise it is inserted by id, duplicates dropped.
    fn absorb_confirmed(&mut self, payload: MessagePayload) -> bool {
        if let Some(nonce) = payload.client_nonce {
            let matched = self.messages.iter().position(|view| {
                matches!(view, MessageView::Optimistic { nonce: pending, .. } if *pending == nonce)
            });
            if let Some(index) = matched {
                self.messages.remove(index);
                self.insert_confirmed(payload);
                return true;
            }
        }
        self.insert_confirmed(payload)
    }

    fn insert_confirmed(&mut self, payload: MessagePayload) -> bool {
        if self.messages.iter().any(|view| {
            matches!(view, MessageView::Confirmed(existing) if existing.message_id == payload.message_id)
        }) {
            return false;
        }
        let position = self
            .messages
            .iter()
            .position(|view| match view {
                MessageView::Confirmed(existing) => existing.message_id.0 > payload.message_id.0,
                MessageView::Optimistic { .. } => true,
            })
            .unwrap_or(self.messages.len());
        self.messages.insert(position, MessageView::Confirmed(payload));
        true
    }

    fn update_read_by(&mut self, message_id: MessageId, read_by: &[UserId]) -> bool {
        for view in &mut self.messages {
            if let MessageView::Confirmed(payload) = view {
                if payload.message_id == message_id {
                    if payload.read_by == read_by {
                        return false;
                    }
                    payload.read_by = read_by.to_vec();
                    return true;
                }
            }
        }
        false
    }

    fn set_pending_status(&mut self, nonce: ClientNonce, status: PendingStatus) -> bool {
        for view in &mut self.messages {
            if let MessageView::Optimistic {
                nonce: pending,
                status: current,
                ..
            } = view
            {
                if *pending == nonce && *current != status {
                    *current = status;
                    return true;
                }
            }
        }
        false
    }
}
