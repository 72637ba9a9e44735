use bytes::Bytes;
use datagrid_common::{GridError, Member, Result, View, ViewId};
use serde::{Deserialize, Serialize};

/// Every message exchanged between members and locators.
///
/// Each request gets exactly one reply; `Ok` is the reply when nothing more
/// specific applies.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Message {
    /// Member → locator: who coordinates the group?
    FindCoordinator { member: Member },

    /// Locator → member
    FindCoordinatorResponse {
        view: Option<View>,
        coordinator: Option<Member>,
        /// Member hosted by the answering locator, if any
        hosted: Option<Member>,
        /// True when the requester may form a new group itself
        may_initiate: bool,
    },

    /// Locator ↔ locator view exchange; answered with the receiver's view
    LocatorSync { view: Option<View> },

    /// Coordinator → locator after a view is installed
    ViewAnnouncement { view: View },

    /// Joining member → coordinator
    JoinRequest { member: Member, known_view_id: ViewId },

    JoinResponse { view: View },

    JoinRejected { reason: String },

    /// Reply from a member that does not coordinate the group
    NotCoordinator { coordinator: Option<Member> },

    /// Coordinator → members: install this view
    ViewMessage { view: View },

    /// Member → coordinator acknowledgement of a view
    Ack { member: Member, view_id: ViewId },

    /// Ask a member for its latest view; answered with `ViewMessage`
    ViewRequest { known_view_id: ViewId },

    /// Voluntary departure
    LeaveRequest { member: Member, reason: String },

    /// Ask the coordinator to exclude a member
    RemoveMemberRequest {
        target: Member,
        requester: Member,
        reason: String,
    },

    /// Coordinator → member it has just removed
    Removed { member: Member, reason: String },

    /// A member stopped answering heartbeats
    SuspectNotice {
        suspect: Member,
        reporter: Member,
        reason: String,
        crashed: bool,
    },

    /// Coordinator on the losing side of a partition → its remaining members
    QuorumLostNotice {
        failed: Vec<Member>,
        remaining: Vec<Member>,
    },

    Heartbeat { member: Member, view_id: ViewId },

    HeartbeatAck { member: Member, view_id: ViewId },

    Ok,

    Error { reason: String },
}

impl Message {
    /// Short name for logging
    pub fn kind(&self) -> &'static str {
        match self {
            Message::FindCoordinator { .. } => "FindCoordinator",
            Message::FindCoordinatorResponse { .. } => "FindCoordinatorResponse",
            Message::LocatorSync { .. } => "LocatorSync",
            Message::ViewAnnouncement { .. } => "ViewAnnouncement",
            Message::JoinRequest { .. } => "JoinRequest",
            Message::JoinResponse { .. } => "JoinResponse",
            Message::JoinRejected { .. } => "JoinRejected",
            Message::NotCoordinator { .. } => "NotCoordinator",
            Message::ViewMessage { .. } => "ViewMessage",
            Message::Ack { .. } => "Ack",
            Message::ViewRequest { .. } => "ViewRequest",
            Message::LeaveRequest { .. } => "LeaveRequest",
            Message::RemoveMemberRequest { .. } => "RemoveMemberRequest",
            Message::Removed { .. } => "Removed",
            Message::SuspectNotice { .. } => "SuspectNotice",
            Message::QuorumLostNotice { .. } => "QuorumLostNotice",
            Message::Heartbeat { .. } => "Heartbeat",
            Message::HeartbeatAck { .. } => "HeartbeatAck",
            Message::Ok => "Ok",
            Message::Error { .. } => "Error",
        }
    }

    pub fn error(reason: impl Into<String>) -> Self {
        Message::Error {
            reason: reason.into(),
        }
    }
}

/// Encode a message as a frame payload
pub fn encode(message: &Message) -> Result<Bytes> {
    bincode::serialize(message)
        .map(Bytes::from)
        .map_err(|e| GridError::Serialization(e.to_string()))
}

/// Decode a frame payload
pub fn decode(frame: &[u8]) -> Result<Message> {
    bincode::deserialize(frame)
        .map_err(|e| GridError::Protocol(format!("undecodable frame: {}", e)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use datagrid_common::MemberKind;

    #[test]
    fn test_view_message_survives_encoding() {
        let coord = Member::with_timestamp(
            "127.0.0.1:4000".parse().unwrap(),
            MemberKind::Locator,
            7,
        );
        let peer = Member::with_timestamp(
            "127.0.0.1:4001".parse().unwrap(),
            MemberKind::Normal,
            9,
        );
        let view = View::new(4, coord.clone(), vec![coord, peer.clone()], vec![]);

        let bytes = encode(&Message::ViewMessage { view: view.clone() }).unwrap();
        match decode(&bytes).unwrap() {
            Message::ViewMessage { view: decoded } => {
                assert_eq!(decoded, view);
                assert_eq!(decoded.members()[1], peer);
            }
            other => panic!("unexpected {}", other.kind()),
        }
    }

    #[test]
    fn test_garbage_is_a_protocol_error() {
        let err = decode(&[0xff, 0xff, 0xff, 0xff, 0xff]).unwrap_err();
        assert!(matches!(err, GridError::Protocol(_)));
    }
}
