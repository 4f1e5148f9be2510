//! Domain event model shared by the router, dispatcher, and contract parsers.
//!
//! The rest of the crate deliberately does not pass raw `matrix-sdk`/`ruma` event
//! types past the router: everything downstream works against [`Event`], so
//! handlers and parsers stay agnostic of which sync path (live or backfill)
//! produced the event.

use crate::prelude::*;

use matrix_sdk::ruma::events::room::message::{
    MessageType, OriginalSyncRoomMessageEvent, Relation as RumaRelation,
};
use matrix_sdk::ruma::events::room::{encrypted::OriginalSyncRoomEncryptedEvent, member::SyncRoomMemberEvent};
use matrix_sdk::ruma::{MilliSecondsSinceUnixEpoch, OwnedEventId, OwnedRoomId, OwnedUserId};
use serde_json::{Map, Value};

/// Broad classification of an [`Event`], used by the router and dispatcher
/// to decide which path an event takes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventKind {
    /// Plaintext `m.room.message`.
    RoomMessage,
    /// `m.room.encrypted`, not yet decrypted.
    Encrypted,
    /// `m.room.member` state event.
    StateMember,
    /// `m.room_key` to-device event.
    ToDeviceKey,
    /// `m.room_key_request` to-device event.
    ToDeviceKeyRequest,
    /// `m.forwarded_room_key` to-device event.
    ToDeviceForwardedKey,
}

impl EventKind {
    /// Whether this kind is handled purely by the crypto engine's to-device
    /// path, never reaching the dispatcher.
    #[must_use]
    pub const fn is_to_device(self) -> bool {
        matches!(
            self,
            Self::ToDeviceKey | Self::ToDeviceKeyRequest | Self::ToDeviceForwardedKey
        )
    }
}

/// Semantic sub-type of a message body, independent of the wire `msgtype`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageKind {
    /// Plain or formatted text.
    Text,
    /// `m.audio`.
    Audio,
    /// `m.image`.
    Image,
    /// `m.video`.
    Video,
    /// `m.file`.
    File,
    /// Anything else `matrix-sdk` knows about (notice, emote, location, ...).
    Other,
}

impl From<&MessageType> for MessageKind {
    fn from(mt: &MessageType) -> Self {
        match mt {
            MessageType::Text(_) | MessageType::Notice(_) | MessageType::Emote(_) => Self::Text,
            MessageType::Audio(_) => Self::Audio,
            MessageType::Image(_) => Self::Image,
            MessageType::Video(_) => Self::Video,
            MessageType::File(_) => Self::File,
            _ => Self::Other,
        }
    }
}

/// Thread/reply relation carried by a message event, if any.
#[derive(Debug, Clone, Default)]
pub struct Relation {
    /// Root event of the thread this message belongs to.
    pub thread_root: Option<OwnedEventId>,
    /// Event this message is a direct reply to.
    pub in_reply_to: Option<OwnedEventId>,
}

/// Parsed content of an [`Event`].
#[derive(Debug, Clone, Default)]
pub struct EventContent {
    /// Message body, or an empty string for non-message events.
    pub body: String,
    /// Semantic message sub-type.
    pub msgtype: Option<MessageKind>,
    /// Thread/reply relation, if any.
    pub relation: Option<Relation>,
    /// Raw key/value bag from the original event content, kept around so
    /// contract parsers can look for well-known extension keys without the
    /// router needing to know about them.
    pub raw: Map<String, Value>,
}

/// A chat event, normalized from whichever transport produced it (live sync
/// or backfill), immutable for the duration of its trip through the pipeline.
#[derive(Debug, Clone)]
pub struct Event {
    /// Opaque event identifier, unique within its room.
    pub event_id: OwnedEventId,
    /// Room the event belongs to. `None` for to-device events.
    pub room_id: Option<OwnedRoomId>,
    /// Sending user.
    pub sender: OwnedUserId,
    /// Server-assigned timestamp.
    pub origin_server_ts: MilliSecondsSinceUnixEpoch,
    /// Broad classification used for routing.
    pub kind: EventKind,
    /// Parsed content.
    pub content: EventContent,
}

impl Event {
    /// Milliseconds since the Unix epoch, for comparisons against
    /// `patchStart`/join-timestamp floors.
    #[must_use]
    pub fn timestamp_millis(&self) -> i64 {
        self.origin_server_ts.get().into()
    }
}

impl TryFrom<(OriginalSyncRoomMessageEvent, OwnedRoomId)> for Event {
    type Error = anyhow::Error;

    fn try_from(
        (ev, room_id): (OriginalSyncRoomMessageEvent, OwnedRoomId),
    ) -> Result<Self, Self::Error> {
        let msgtype = MessageKind::from(&ev.content.msgtype);
        let body = ev.content.body().to_owned();

        let relation = ev.content.relates_to.as_ref().map(|rel| match rel {
            RumaRelation::Reply { in_reply_to } => Relation {
                thread_root: None,
                in_reply_to: Some(in_reply_to.event_id.clone()),
            },
            RumaRelation::Thread(thread) => Relation {
                thread_root: Some(thread.event_id.clone()),
                in_reply_to: thread.in_reply_to.as_ref().map(|r| r.event_id.clone()),
            },
            _ => Relation::default(),
        });

        let raw = serde_json::to_value(&ev.content)
            .ok()
            .and_then(|v| v.as_object().cloned())
            .unwrap_or_default();

        Ok(Self {
            event_id: ev.event_id.clone(),
            room_id: Some(room_id),
            sender: ev.sender.clone(),
            origin_server_ts: ev.origin_server_ts,
            kind: EventKind::RoomMessage,
            content: EventContent {
                body,
                msgtype: Some(msgtype),
                relation,
                raw,
            },
        })
    }
}

impl TryFrom<(OriginalSyncRoomEncryptedEvent, OwnedRoomId)> for Event {
    type Error = anyhow::Error;

    fn try_from(
        (ev, room_id): (OriginalSyncRoomEncryptedEvent, OwnedRoomId),
    ) -> Result<Self, Self::Error> {
        Ok(Self {
            event_id: ev.event_id.clone(),
            room_id: Some(room_id),
            sender: ev.sender.clone(),
            origin_server_ts: ev.origin_server_ts,
            kind: EventKind::Encrypted,
            content: EventContent::default(),
        })
    }
}

impl TryFrom<(SyncRoomMemberEvent, OwnedRoomId)> for Event {
    type Error = anyhow::Error;

    fn try_from((ev, room_id): (SyncRoomMemberEvent, OwnedRoomId)) -> Result<Self, Self::Error> {
        Ok(Self {
            event_id: ev.event_id().to_owned(),
            room_id: Some(room_id),
            sender: ev.sender().to_owned(),
            origin_server_ts: ev.origin_server_ts(),
            kind: EventKind::StateMember,
            content: EventContent::default(),
        })
    }
}
