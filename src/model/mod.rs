//! Message types spoken over the voice gateway websocket.
//!
//! Every message is a JSON object `{"op": <int>, "d": <payload>}`; the
//! numeric opcodes are dictated by the platform's published voice gateway
//! protocol and must match it exactly.

mod close_code;
pub mod payload;
mod speaking;

pub use self::{close_code::CloseCode, speaking::SpeakingMode};

pub(crate) use self::close_code::allows_reconnect;

use payload::*;
use serde::{
    de::{Deserializer, Error as DeError},
    ser::{SerializeStruct, Serializer},
    Deserialize,
    Serialize,
};
use serde_json::Value;

/// Voice gateway opcodes used by this library.
#[allow(missing_docs)]
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
#[non_exhaustive]
#[repr(u8)]
pub enum OpCode {
    Identify = 0,
    SelectProtocol = 1,
    Ready = 2,
    Heartbeat = 3,
    SessionDescription = 4,
    Speaking = 5,
    HeartbeatAck = 6,
    Resume = 7,
    Hello = 8,
    Resumed = 9,
    ClientDisconnect = 13,
}

impl OpCode {
    /// Parses a wire opcode value.
    pub fn from_u8(value: u8) -> Option<Self> {
        use OpCode::*;
        Some(match value {
            0 => Identify,
            1 => SelectProtocol,
            2 => Ready,
            3 => Heartbeat,
            4 => SessionDescription,
            5 => Speaking,
            6 => HeartbeatAck,
            7 => Resume,
            8 => Hello,
            9 => Resumed,
            13 => ClientDisconnect,
            _ => return None,
        })
    }
}

/// One complete voice gateway message, inbound or outbound.
#[allow(missing_docs)]
#[derive(Clone, Debug, PartialEq)]
#[non_exhaustive]
pub enum Event {
    Identify(Identify),
    SelectProtocol(SelectProtocol),
    Ready(Ready),
    Heartbeat(Heartbeat),
    SessionDescription(SessionDescription),
    Speaking(Speaking),
    HeartbeatAck(HeartbeatAck),
    Resume(Resume),
    Hello(Hello),
    Resumed,
    ClientDisconnect(ClientDisconnect),
}

impl Event {
    /// Returns the opcode this message carries on the wire.
    pub fn kind(&self) -> OpCode {
        match self {
            Event::Identify(_) => OpCode::Identify,
            Event::SelectProtocol(_) => OpCode::SelectProtocol,
            Event::Ready(_) => OpCode::Ready,
            Event::Heartbeat(_) => OpCode::Heartbeat,
            Event::SessionDescription(_) => OpCode::SessionDescription,
            Event::Speaking(_) => OpCode::Speaking,
            Event::HeartbeatAck(_) => OpCode::HeartbeatAck,
            Event::Resume(_) => OpCode::Resume,
            Event::Hello(_) => OpCode::Hello,
            Event::Resumed => OpCode::Resumed,
            Event::ClientDisconnect(_) => OpCode::ClientDisconnect,
        }
    }
}

macro_rules! impl_from_payload {
    ($variant:ident, $payload:ty) => {
        impl From<$payload> for Event {
            fn from(payload: $payload) -> Self {
                Event::$variant(payload)
            }
        }
    };
}

impl_from_payload!(Identify, Identify);
impl_from_payload!(SelectProtocol, SelectProtocol);
impl_from_payload!(Ready, Ready);
impl_from_payload!(Heartbeat, Heartbeat);
impl_from_payload!(SessionDescription, SessionDescription);
impl_from_payload!(Speaking, Speaking);
impl_from_payload!(HeartbeatAck, HeartbeatAck);
impl_from_payload!(Resume, Resume);
impl_from_payload!(Hello, Hello);
impl_from_payload!(ClientDisconnect, ClientDisconnect);

impl Serialize for Event {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut s = serializer.serialize_struct("Event", 2)?;

        s.serialize_field("op", &(self.kind() as u8))?;

        match self {
            Event::Identify(d) => s.serialize_field("d", d)?,
            Event::SelectProtocol(d) => s.serialize_field("d", d)?,
            Event::Ready(d) => s.serialize_field("d", d)?,
            Event::Heartbeat(d) => s.serialize_field("d", d)?,
            Event::SessionDescription(d) => s.serialize_field("d", d)?,
            Event::Speaking(d) => s.serialize_field("d", d)?,
            Event::HeartbeatAck(d) => s.serialize_field("d", d)?,
            Event::Resume(d) => s.serialize_field("d", d)?,
            Event::Hello(d) => s.serialize_field("d", d)?,
            Event::Resumed => s.serialize_field("d", &Value::Null)?,
            Event::ClientDisconnect(d) => s.serialize_field("d", d)?,
        }

        s.end()
    }
}

#[derive(Deserialize)]
struct RawEvent {
    op: u8,
    #[serde(default)]
    d: Value,
}

impl<'de> Deserialize<'de> for Event {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = RawEvent::deserialize(deserializer)?;
        let op = OpCode::from_u8(raw.op)
            .ok_or_else(|| DeError::custom(format!("invalid voice opcode: {}", raw.op)))?;

        fn parse<T, E>(d: Value) -> Result<T, E>
        where
            T: serde::de::DeserializeOwned,
            E: DeError,
        {
            serde_json::from_value(d).map_err(E::custom)
        }

        Ok(match op {
            OpCode::Identify => Event::Identify(parse(raw.d)?),
            OpCode::SelectProtocol => Event::SelectProtocol(parse(raw.d)?),
            OpCode::Ready => Event::Ready(parse(raw.d)?),
            OpCode::Heartbeat => Event::Heartbeat(parse(raw.d)?),
            OpCode::SessionDescription => Event::SessionDescription(parse(raw.d)?),
            OpCode::Speaking => Event::Speaking(parse(raw.d)?),
            OpCode::HeartbeatAck => Event::HeartbeatAck(parse(raw.d)?),
            OpCode::Resume => Event::Resume(parse(raw.d)?),
            OpCode::Hello => Event::Hello(parse(raw.d)?),
            OpCode::Resumed => Event::Resumed,
            OpCode::ClientDisconnect => Event::ClientDisconnect(parse(raw.d)?),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn identify_serializes_with_op_and_d() {
        let evt = Event::from(Identify {
            server_id: "41771983423143937".into(),
            session_id: "my_session_id".into(),
            token: "my_token".into(),
            user_id: "104694319306248192".into(),
        });

        let value = serde_json::to_value(&evt).unwrap();
        assert_eq!(
            value,
            json!({
                "op": 0,
                "d": {
                    "server_id": "41771983423143937",
                    "session_id": "my_session_id",
                    "token": "my_token",
                    "user_id": "104694319306248192",
                }
            })
        );
    }

    #[test]
    fn ready_deserializes() {
        let raw = json!({
            "op": 2,
            "d": {
                "ssrc": 1,
                "ip": "127.0.0.1",
                "port": 1234,
                "modes": ["xsalsa20_poly1305", "xsalsa20_poly1305_suffix"],
                "heartbeat_interval": 1,
            }
        });

        match serde_json::from_value::<Event>(raw).unwrap() {
            Event::Ready(r) => {
                assert_eq!(r.ssrc, 1);
                assert_eq!(r.port, 1234);
                assert_eq!(r.modes.len(), 2);
            },
            other => panic!("expected ready, got {:?}", other),
        }
    }

    #[test]
    fn heartbeat_nonce_is_bare_integer() {
        let evt = Event::from(Heartbeat { nonce: 1501184119561 });
        let value = serde_json::to_value(&evt).unwrap();
        assert_eq!(value, json!({"op": 3, "d": 1501184119561u64}));

        match serde_json::from_value::<Event>(json!({"op": 6, "d": 1501184119561u64})).unwrap() {
            Event::HeartbeatAck(a) => assert_eq!(a.nonce, 1501184119561),
            other => panic!("expected heartbeat ack, got {:?}", other),
        }
    }

    #[test]
    fn resumed_has_null_payload() {
        let value = serde_json::to_value(&Event::Resumed).unwrap();
        assert_eq!(value, json!({"op": 9, "d": null}));

        assert_eq!(
            serde_json::from_value::<Event>(json!({"op": 9, "d": null})).unwrap(),
            Event::Resumed,
        );
    }

    #[test]
    fn unknown_opcode_is_an_error() {
        assert!(serde_json::from_value::<Event>(json!({"op": 200, "d": {}})).is_err());
    }
}
