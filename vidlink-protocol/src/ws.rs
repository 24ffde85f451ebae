use serde::{Deserialize, Serialize};
use std::fmt::{Display, Formatter};

/// Represents a message exchanged between two parties via the signaling channel.
///
/// Messages never travel on their own, they are always wrapped in an [`Envelope`] carrying
/// the sender and recipient party IDs.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum SignalingMessage {
    /// Sent by the caller to ring the recipient.
    ///
    /// The recipient will in turn prompt the user to accept or reject the call, replying with either
    /// [`SignalingMessage::CallAccepted`] or [`SignalingMessage::CallRejected`].
    CallInitiated,
    /// Sent by the callee after the user accepted an incoming call.
    ///
    /// After receiving this message, the caller acquires its local media, creates its peer connection
    /// and transmits a [`SignalingMessage::Offer`].
    CallAccepted,
    /// Sent by the callee after the user rejected an incoming call. No media is ever acquired.
    CallRejected,
    /// Sent by either party to indicate the graceful end of an established call.
    EndCall,
    /// SDP offer created by the caller.
    Offer {
        /// Serialized session description containing the offer.
        sdp: String,
    },
    /// SDP answer created by the callee in response to a previously received [`SignalingMessage::Offer`].
    Answer {
        /// Serialized session description containing the answer.
        sdp: String,
    },
    /// ICE candidate trickled to the other party during call setup.
    IceCandidate {
        /// Serialized ICE candidate.
        candidate: String,
    },
}

/// Discriminant of a [`SignalingMessage`], matching the `type` tag used on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageKind {
    CallInitiated,
    CallAccepted,
    CallRejected,
    EndCall,
    Offer,
    Answer,
    IceCandidate,
}

impl MessageKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            MessageKind::CallInitiated => "call-initiated",
            MessageKind::CallAccepted => "call-accepted",
            MessageKind::CallRejected => "call-rejected",
            MessageKind::EndCall => "end-call",
            MessageKind::Offer => "offer",
            MessageKind::Answer => "answer",
            MessageKind::IceCandidate => "ice-candidate",
        }
    }

    /// Returns whether messages of this kind belong to an already established session and should
    /// only ever be accepted from the session's remote party.
    pub fn is_session_scoped(&self) -> bool {
        !matches!(self, MessageKind::CallInitiated)
    }
}

impl Display for MessageKind {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl SignalingMessage {
    pub fn kind(&self) -> MessageKind {
        match self {
            SignalingMessage::CallInitiated => MessageKind::CallInitiated,
            SignalingMessage::CallAccepted => MessageKind::CallAccepted,
            SignalingMessage::CallRejected => MessageKind::CallRejected,
            SignalingMessage::EndCall => MessageKind::EndCall,
            SignalingMessage::Offer { .. } => MessageKind::Offer,
            SignalingMessage::Answer { .. } => MessageKind::Answer,
            SignalingMessage::IceCandidate { .. } => MessageKind::IceCandidate,
        }
    }
}

/// Addressed wrapper around a [`SignalingMessage`].
///
/// The signaling server forwards each envelope to the party identified by [`Envelope::to`], leaving
/// [`Envelope::from`] untouched so the recipient can match it against its current session.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct Envelope {
    /// ID of the recipient party.
    pub to: String,
    /// ID of the sending party.
    pub from: String,
    #[serde(flatten)]
    pub message: SignalingMessage,
}

impl Envelope {
    pub fn new(from: impl Into<String>, to: impl Into<String>, message: SignalingMessage) -> Self {
        Self {
            to: to.into(),
            from: from.into(),
            message,
        }
    }

    pub fn kind(&self) -> MessageKind {
        self.message.kind()
    }

    /// Serializes an [`Envelope`] into a JSON string.
    pub fn serialize(envelope: &Self) -> serde_json::error::Result<String> {
        serde_json::to_string(envelope)
    }

    /// Deserializes a JSON string into an [`Envelope`].
    pub fn deserialize(envelope: &str) -> serde_json::error::Result<Self> {
        serde_json::from_str(envelope)
    }
}
