//! Wire types for the upstream subprotocol.
//!
//! The same subprotocol is consumed from upstream sources and served to
//! downstream clients. Control operations travel as JSON text frames tagged
//! with an `op` field; message payloads travel as binary frames.

use bytes::{BufMut, Bytes, BytesMut};
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::model::{ChannelId, ChannelInfo, SubscriptionId};

/// Subprotocol token offered on dial and expected from clients.
pub const SUBPROTOCOL: &str = "foxglove.websocket.v1";

/// Opcode of a binary message-data frame.
pub const MESSAGE_DATA_OPCODE: u8 = 0x01;

/// Operations originating from the serving side of a session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "camelCase")]
pub enum ServerMessage {
    ServerInfo {
        name: String,
        capabilities: Vec<String>,
    },
    Advertise {
        channels: Vec<ChannelInfo>,
    },
    #[serde(rename_all = "camelCase")]
    Unadvertise {
        channel_ids: Vec<ChannelId>,
    },
}

/// Operations originating from the consuming side of a session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "camelCase")]
pub enum ClientMessage {
    Subscribe {
        subscriptions: Vec<Subscription>,
    },
    #[serde(rename_all = "camelCase")]
    Unsubscribe {
        subscription_ids: Vec<SubscriptionId>,
    },
}

/// One subscription request: the subscriber picks `id`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Subscription {
    pub id: SubscriptionId,
    pub channel_id: ChannelId,
}

/// A decoded binary message-data frame.
#[derive(Debug, Clone, PartialEq)]
pub struct MessageData {
    pub subscription_id: SubscriptionId,
    pub log_time_ns: u64,
    pub payload: Bytes,
}

/// Parses a text frame from an upstream server.
///
/// Unknown `op` values yield `Ok(None)`: the subprotocol grows operations
/// the bridge does not consume.
pub fn parse_server_message(text: &str) -> Result<Option<ServerMessage>> {
    parse_known(text)
}

/// Parses a text frame from a downstream client.
pub fn parse_client_message(text: &str) -> Result<Option<ClientMessage>> {
    parse_known(text)
}

fn parse_known<T: serde::de::DeserializeOwned + 'static>(text: &str) -> Result<Option<T>> {
    let value: serde_json::Value = serde_json::from_str(text)?;
    let op = value
        .get("op")
        .and_then(|op| op.as_str())
        .ok_or_else(|| Error::Protocol("text frame without op field".to_string()))?
        .to_string();
    match serde_json::from_value(value) {
        Ok(message) => Ok(Some(message)),
        Err(err) => {
            // Distinguish an op we don't model from a malformed known op.
            if is_known_op::<T>(&op) {
                Err(Error::Json(err))
            } else {
                tracing::debug!(op, "ignoring unknown subprotocol operation");
                Ok(None)
            }
        }
    }
}

fn is_known_op<T: 'static>(op: &str) -> bool {
    use std::any::TypeId;
    if TypeId::of::<T>() == TypeId::of::<ServerMessage>() {
        matches!(op, "serverInfo" | "advertise" | "unadvertise")
    } else {
        matches!(op, "subscribe" | "unsubscribe")
    }
}

/// Encodes a binary message-data frame.
///
/// Layout: opcode byte, `u32` LE subscription id, `u64` LE timestamp in
/// nanoseconds, then the opaque payload.
pub fn encode_message_data(
    subscription_id: SubscriptionId,
    log_time_ns: u64,
    payload: &[u8],
) -> Bytes {
    let mut frame = BytesMut::with_capacity(1 + 4 + 8 + payload.len());
    frame.put_u8(MESSAGE_DATA_OPCODE);
    frame.put_u32_le(subscription_id);
    frame.put_u64_le(log_time_ns);
    frame.put_slice(payload);
    frame.freeze()
}

/// Decodes a binary frame; the payload is a zero-copy slice of `frame`.
pub fn decode_message_data(frame: &Bytes) -> Result<MessageData> {
    if frame.len() < 13 {
        return Err(Error::Protocol(format!(
            "binary frame too short: {} bytes",
            frame.len()
        )));
    }
    if frame[0] != MESSAGE_DATA_OPCODE {
        return Err(Error::Protocol(format!(
            "unexpected binary opcode {:#04x}",
            frame[0]
        )));
    }
    let subscription_id = u32::from_le_bytes(frame[1..5].try_into().unwrap());
    let log_time_ns = u64::from_le_bytes(frame[5..13].try_into().unwrap());
    Ok(MessageData {
        subscription_id,
        log_time_ns,
        payload: frame.slice(13..),
    })
}

/// Subprotocol negotiation: the first offered protocol we speak, if any.
pub fn choose_protocol<'a, I>(offered: I) -> Option<&'static str>
where
    I: IntoIterator<Item = &'a str>,
{
    offered
        .into_iter()
        .any(|p| p.trim() == SUBPROTOCOL)
        .then_some(SUBPROTOCOL)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn should_parse_advertise() {
        // given
        let text = r#"{"op":"advertise","channels":[
            {"id":7,"topic":"/a","encoding":"json","schemaName":"X","schema":"{}"}
        ]}"#;

        // when
        let message = parse_server_message(text).unwrap().unwrap();

        // then
        let ServerMessage::Advertise { channels } = message else {
            panic!("expected advertise");
        };
        assert_eq!(channels.len(), 1);
        assert_eq!(channels[0].id, 7);
        assert_eq!(channels[0].topic, "/a");
    }

    #[test]
    fn should_parse_unadvertise() {
        // given
        let text = r#"{"op":"unadvertise","channelIds":[7,8]}"#;

        // when
        let message = parse_server_message(text).unwrap().unwrap();

        // then
        assert_eq!(
            message,
            ServerMessage::Unadvertise {
                channel_ids: vec![7, 8]
            }
        );
    }

    #[test]
    fn should_ignore_unknown_ops() {
        // given an operation the bridge does not consume
        let text = r#"{"op":"parameterValues","parameters":[]}"#;

        // then
        assert!(parse_server_message(text).unwrap().is_none());
        assert!(parse_client_message(text).unwrap().is_none());
    }

    #[test]
    fn should_reject_malformed_known_op() {
        // given a subscribe with the wrong shape
        let text = r#"{"op":"subscribe","subscriptions":"nope"}"#;

        // then
        assert!(parse_client_message(text).is_err());
    }

    #[test]
    fn should_reject_frames_without_op() {
        assert!(parse_server_message(r#"{"channels":[]}"#).is_err());
    }

    #[test]
    fn should_serialise_subscribe_in_wire_form() {
        // given
        let message = ClientMessage::Subscribe {
            subscriptions: vec![Subscription {
                id: 1,
                channel_id: 7,
            }],
        };

        // when
        let json = serde_json::to_value(&message).unwrap();

        // then
        assert_eq!(json["op"], "subscribe");
        assert_eq!(json["subscriptions"][0]["channelId"], 7);
    }

    #[test]
    fn should_round_trip_message_data() {
        // given
        let frame = encode_message_data(3, 1_000, b"m1");

        // when
        let decoded = decode_message_data(&frame).unwrap();

        // then
        assert_eq!(decoded.subscription_id, 3);
        assert_eq!(decoded.log_time_ns, 1_000);
        assert_eq!(&decoded.payload[..], b"m1");
    }

    #[test]
    fn should_reject_short_or_mistagged_binary_frames() {
        assert!(decode_message_data(&Bytes::from_static(&[1, 2, 3])).is_err());

        let mut bad = encode_message_data(1, 1, b"x").to_vec();
        bad[0] = 0x7f;
        assert!(decode_message_data(&Bytes::from(bad)).is_err());
    }

    #[test]
    fn should_negotiate_subprotocol() {
        assert_eq!(
            choose_protocol(["foxglove.websocket.v1"]),
            Some(SUBPROTOCOL)
        );
        assert_eq!(
            choose_protocol(["other", " foxglove.websocket.v1 "]),
            Some(SUBPROTOCOL)
        );
        assert_eq!(choose_protocol(["graphql-ws"]), None);
        assert_eq!(choose_protocol(std::iter::empty()), None);
    }
}
