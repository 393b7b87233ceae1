//! Binary wire protocol between participants and the server.
//!
//! Every WebSocket binary message carries one bincode-encoded [`Frame`]:
//! ```text
//! ┌──────────┬─────────────┬──────────────────────────────┐
//! │ actor    │ correlation │ body                         │
//! │ string   │ varint u64  │ Request(..) | Event(..)      │
//! └──────────┴─────────────┴──────────────────────────────┘
//! ```
//!
//! Clients send `Body::Request`; the `actor` they put in the frame is ignored
//! and replaced by the identity assigned at connection time. The server sends
//! `Body::Event` with `actor` set to the participant that caused it and
//! `correlation` echoing the request it answers (0 when unsolicited).

use std::time::Duration;

use apiary_core::{
    ActorId, Bundle, Collection, CollectionRequest, ExportedBundle, FieldMap,
    HistoryEntry, LockDenied, LockGrant, Millis, MergedRecord, Operation, OperationKind,
    ResponseEnvelope, StoredRequest,
};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

use crate::roster::OnlineUser;

/// Inbound calls a participant can make.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Request {
    SetUserName { name: String },
    GetOnlineUsers,
    Ping,

    SubmitOperation { kind: OperationKind },
    ProposeOperation { kind: OperationKind },
    SubmitProposed { id: Uuid },
    Acknowledge,
    RecentOperations { limit: u32 },

    /// `ttl_ms` of `None` uses the server default.
    AcquireLock { resource: String, ttl_ms: Option<u64> },
    ReleaseLock { resource: String },

    MergeVersions { base: FieldMap, incoming: FieldMap },

    /// Result of a request the participant executed itself.
    RecordExecution {
        request: StoredRequest,
        response: ResponseEnvelope,
        extra: Option<FieldMap>,
    },
    UserHistory { limit: u32 },
    AllHistory { limit: u32 },
    Replay { history_id: Uuid },

    CreateBundle {
        name: String,
        history_ids: Vec<Uuid>,
        description: Option<String>,
    },
    ExportBundle { bundle_id: Uuid },
    ImportBundle { payload: String },

    CreateCollection { name: String, description: String },
    JoinCollection { collection_id: Uuid },
    AddRequestToCollection {
        collection_id: Uuid,
        request: StoredRequest,
    },
    GetCollections,
}

impl Request {
    /// Short name for logging.
    pub fn name(&self) -> &'static str {
        match self {
            Request::SetUserName { .. } => "set_user_name",
            Request::GetOnlineUsers => "get_online_users",
            Request::Ping => "ping",
            Request::SubmitOperation { .. } => "submit_operation",
            Request::ProposeOperation { .. } => "propose_operation",
            Request::SubmitProposed { .. } => "submit_proposed",
            Request::Acknowledge => "acknowledge",
            Request::RecentOperations { .. } => "recent_operations",
            Request::AcquireLock { .. } => "acquire_lock",
            Request::ReleaseLock { .. } => "release_lock",
            Request::MergeVersions { .. } => "merge_versions",
            Request::RecordExecution { .. } => "record_execution",
            Request::UserHistory { .. } => "user_history",
            Request::AllHistory { .. } => "all_history",
            Request::Replay { .. } => "replay",
            Request::CreateBundle { .. } => "create_bundle",
            Request::ExportBundle { .. } => "export_bundle",
            Request::ImportBundle { .. } => "import_bundle",
            Request::CreateCollection { .. } => "create_collection",
            Request::JoinCollection { .. } => "join_collection",
            Request::AddRequestToCollection { .. } => "add_request_to_collection",
            Request::GetCollections => "get_collections",
        }
    }

    pub fn acquire_lock(resource: impl Into<String>, ttl: Option<Duration>) -> Self {
        Request::AcquireLock {
            resource: resource.into(),
            ttl_ms: ttl.map(|d| d.as_millis() as u64),
        }
    }
}

/// Broadcast-safe summary of an executed request (no response body).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionSummary {
    pub history_id: Uuid,
    pub method: String,
    pub url: String,
    pub status: u16,
    pub user_name: String,
    pub timestamp: Millis,
}

/// Broadcast-safe summary of a new collection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CollectionSummary {
    pub id: Uuid,
    pub name: String,
    pub description: String,
    pub created_by: String,
    pub created_at: Millis,
}

/// Server-originated notifications and replies.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Event {
    Welcome {
        actor: ActorId,
        online: Vec<OnlineUser>,
    },
    UserJoined {
        user: OnlineUser,
        online: Vec<OnlineUser>,
    },
    UserLeft {
        user: OnlineUser,
        online: Vec<OnlineUser>,
    },
    UserNameChanged {
        actor: ActorId,
        old_name: String,
        new_name: String,
        online: Vec<OnlineUser>,
    },
    OnlineUsers { users: Vec<OnlineUser> },
    Pong { timestamp: Millis },

    OperationCommitted { operation: Operation },
    OperationProposed { operation: Operation },
    Acknowledged { dropped: u64 },
    RecentOperations { operations: Vec<Operation> },

    LockGranted { grant: LockGrant },
    LockDenied { denied: LockDenied },
    LockReleased { resource: String, holder: ActorId },
    LockNotHeld { resource: String },

    Merged { record: MergedRecord },

    HistorySaved { entry: HistoryEntry },
    RequestExecuted { summary: ExecutionSummary },
    History { entries: Vec<HistoryEntry> },
    ReplayReady { history_id: Uuid, request: StoredRequest },

    BundleCreated { bundle: Bundle },
    BundleExported { exported: ExportedBundle },
    BundleImported { bundle: Bundle },

    CollectionCreated { collection: Collection },
    NewCollectionAvailable { summary: CollectionSummary },
    CollectionJoined { collection: Collection },
    CollaboratorJoined {
        collection_id: Uuid,
        actor: ActorId,
        name: String,
    },
    RequestAddedToCollection {
        collection_id: Uuid,
        entry: CollectionRequest,
        added_by: String,
    },
    Collections { collections: Vec<Collection> },

    Error { message: String },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Body {
    Request(Request),
    Event(Event),
}

/// Top-level wire message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Frame {
    pub actor: ActorId,
    /// Chosen by the client; echoed on replies.
    pub correlation: u64,
    pub body: Body,
}

impl Frame {
    pub fn request(correlation: u64, request: Request) -> Self {
        Self {
            actor: ActorId::new(),
            correlation,
            body: Body::Request(request),
        }
    }

    pub fn event(actor: impl Into<ActorId>, correlation: u64, event: Event) -> Self {
        Self {
            actor: actor.into(),
            correlation,
            body: Body::Event(event),
        }
    }

    /// Serialize to binary wire format.
    pub fn encode(&self) -> Result<Vec<u8>, ProtocolError> {
        bincode::serde::encode_to_vec(self, bincode::config::standard())
            .map_err(|e| ProtocolError::Serialization(e.to_string()))
    }

    /// Deserialize from binary wire format.
    pub fn decode(bytes: &[u8]) -> Result<Self, ProtocolError> {
        let (frame, _) = bincode::serde::decode_from_slice(bytes, bincode::config::standard())
            .map_err(|e| ProtocolError::Deserialization(e.to_string()))?;
        Ok(frame)
    }

    pub fn into_request(self) -> Result<Request, ProtocolError> {
        match self.body {
            Body::Request(request) => Ok(request),
            Body::Event(_) => Err(ProtocolError::UnexpectedBody("event")),
        }
    }

    pub fn into_event(self) -> Result<Event, ProtocolError> {
        match self.body {
            Body::Event(event) => Ok(event),
            Body::Request(_) => Err(ProtocolError::UnexpectedBody("request")),
        }
    }

    pub fn as_event(&self) -> Option<&Event> {
        match &self.body {
            Body::Event(event) => Some(event),
            Body::Request(_) => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Error)]
pub enum ProtocolError {
    #[error("serialization error: {0}")]
    Serialization(String),
    #[error("deserialization error: {0}")]
    Deserialization(String),
    #[error("unexpected {0} frame")]
    UnexpectedBody(&'static str),
}

#[cfg(test)]
mod tests {
    use super::*;
    use apiary_core::{field_map, FieldMap, FieldValue};
    use pretty_assertions::assert_eq;

    #[test]
    fn test_request_frame_roundtrip() {
        let frame = Frame::request(
            7,
            Request::SubmitOperation {
                kind: OperationKind::edit("url", 15, Some("ALEX")),
            },
        );
        let decoded = Frame::decode(&frame.encode().unwrap()).unwrap();
        assert_eq!(decoded, frame);
        assert_eq!(decoded.correlation, 7);
        assert_eq!(decoded.into_request().unwrap().name(), "submit_operation");
    }

    #[test]
    fn test_event_with_nested_values_roundtrip() {
        let request = StoredRequest::new("POST", "https://httpbin.org/post")
            .with_header("Content-Type", "application/json")
            .with_body(FieldValue::Map(field_map([
                ("name", FieldValue::from("apiary")),
                ("tags", FieldValue::List(vec![FieldValue::from(1), FieldValue::Null])),
            ])));
        let frame = Frame::event(
            "alice",
            3,
            Event::ReplayReady {
                history_id: Uuid::new_v4(),
                request,
            },
        );
        let decoded = Frame::decode(&frame.encode().unwrap()).unwrap();
        assert_eq!(decoded, frame);
    }

    #[test]
    fn test_lock_denied_event_roundtrip() {
        let denied = LockDenied {
            resource: "req-1".into(),
            holder: "alice".into(),
            remaining: Duration::from_millis(19_500),
        };
        let frame = Frame::event("bob", 1, Event::LockDenied { denied: denied.clone() });
        match Frame::decode(&frame.encode().unwrap()).unwrap().into_event().unwrap() {
            Event::LockDenied { denied: got } => {
                assert_eq!(got, denied);
                assert_eq!(got.wait_secs(), 20);
            }
            other => panic!("unexpected event {other:?}"),
        }
    }

    #[test]
    fn test_wrong_body_kind() {
        let frame = Frame::event("server", 0, Event::Pong { timestamp: 1 });
        assert_eq!(
            frame.clone().into_request(),
            Err(ProtocolError::UnexpectedBody("event"))
        );
        assert!(frame.as_event().is_some());
    }

    #[test]
    fn test_decode_invalid_bytes() {
        let garbage = vec![0xFF, 0xFE, 0xFD];
        assert!(matches!(
            Frame::decode(&garbage),
            Err(ProtocolError::Deserialization(_))
        ));
    }

    #[test]
    fn test_acquire_lock_helper() {
        assert_eq!(
            Request::acquire_lock("r", Some(Duration::from_secs(5))),
            Request::AcquireLock {
                resource: "r".into(),
                ttl_ms: Some(5000)
            }
        );
    }

    /// A `MergeVersions` frame whose `base["x"]` is `depth` nested lists.
    ///
    /// Built from raw bytes: list variant (4) and length (1) per level.
    fn nested_merge_frame(depth: usize) -> Vec<u8> {
        let frame = Frame::request(
            1,
            Request::MergeVersions {
                base: field_map([("x", FieldValue::Null)]),
                incoming: FieldMap::new(),
            },
        );
        let mut bytes = frame.encode().unwrap();
        // trailing bytes: Null variant of base["x"], then the empty incoming map
        let null_at = bytes.len() - 2;
        assert_eq!(&bytes[null_at..], &[0, 0]);
        let levels = [4u8, 1].repeat(depth);
        bytes.splice(null_at..null_at, levels);
        bytes
    }

    #[test]
    fn test_decode_shallow_nesting() {
        let frame = Frame::decode(&nested_merge_frame(100)).unwrap();
        match frame.into_request().unwrap() {
            Request::MergeVersions { base, .. } => {
                assert!(matches!(base["x"], FieldValue::List(_)))
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_decode_rejects_deep_nesting() {
        let bytes = nested_merge_frame(200_000);
        assert!(bytes.len() > 400_000);
        assert!(matches!(
            Frame::decode(&bytes),
            Err(ProtocolError::Deserialization(_))
        ));

        // the depth count is released after a failure
        assert!(Frame::decode(&nested_merge_frame(100)).is_ok());
    }
}
