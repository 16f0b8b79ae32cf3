//! MQTT control packet definitions.
//!
//! `Packet` is the decoded protocol surface handed to the dispatcher: one
//! variant per MQTT 3.1.1 control packet this core understands, as a closed
//! sum type so the dispatch table stays exhaustive at compile time. The wire
//! codec collaborator (serde_json over the websocket transport) produces and
//! consumes these directly.

use serde::{Deserialize, Serialize};

/// MQTT delivery guarantee level.
///
/// Ordered so that `min` picks the weaker of a publish's QoS and a
/// subscription's requested QoS.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "u8", into = "u8")]
pub enum Qos {
    AtMostOnce,
    AtLeastOnce,
    ExactlyOnce,
}

impl Qos {
    pub fn min(self, other: Qos) -> Qos {
        if self <= other { self } else { other }
    }
}

impl From<Qos> for u8 {
    fn from(qos: Qos) -> u8 {
        match qos {
            Qos::AtMostOnce => 0,
            Qos::AtLeastOnce => 1,
            Qos::ExactlyOnce => 2,
        }
    }
}

impl TryFrom<u8> for Qos {
    type Error = String;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(Qos::AtMostOnce),
            1 => Ok(Qos::AtLeastOnce),
            2 => Ok(Qos::ExactlyOnce),
            other => Err(format!("invalid QoS level: {other}")),
        }
    }
}

/// CONNACK result, the subset of MQTT 3.1.1 return codes this core emits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectReturnCode {
    Accepted,
    IdentifierRejected,
    NotAuthorized,
}

/// One topic filter requested in a SUBSCRIBE packet.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubscribeTopic {
    pub filter: String,
    pub qos: Qos,
}

/// Decoded MQTT control packet.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Packet {
    Connect {
        client_id: String,
        clean_session: bool,
    },
    ConnAck {
        session_present: bool,
        return_code: ConnectReturnCode,
    },
    Subscribe {
        message_id: u16,
        topics: Vec<SubscribeTopic>,
    },
    SubAck {
        message_id: u16,
        granted: Vec<Qos>,
    },
    Unsubscribe {
        message_id: u16,
        topics: Vec<String>,
    },
    UnsubAck {
        message_id: u16,
    },
    Publish {
        topic: String,
        payload: Vec<u8>,
        qos: Qos,
        retain: bool,
        message_id: Option<u16>,
        #[serde(default)]
        dup: bool,
    },
    PubAck {
        message_id: u16,
    },
    PubRec {
        message_id: u16,
    },
    PubRel {
        message_id: u16,
    },
    PubComp {
        message_id: u16,
    },
    PingReq,
    PingResp,
    Disconnect,
}

impl Packet {
    /// Control packet name, used at logging observation points.
    pub fn kind(&self) -> &'static str {
        match self {
            Packet::Connect { .. } => "CONNECT",
            Packet::ConnAck { .. } => "CONNACK",
            Packet::Subscribe { .. } => "SUBSCRIBE",
            Packet::SubAck { .. } => "SUBACK",
            Packet::Unsubscribe { .. } => "UNSUBSCRIBE",
            Packet::UnsubAck { .. } => "UNSUBACK",
            Packet::Publish { .. } => "PUBLISH",
            Packet::PubAck { .. } => "PUBACK",
            Packet::PubRec { .. } => "PUBREC",
            Packet::PubRel { .. } => "PUBREL",
            Packet::PubComp { .. } => "PUBCOMP",
            Packet::PingReq => "PINGREQ",
            Packet::PingResp => "PINGRESP",
            Packet::Disconnect => "DISCONNECT",
        }
    }
}
