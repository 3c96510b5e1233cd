//! Wire codec: 4-byte little-endian length, 1-byte message type, UTF-8 JSON
//! body. Only JSON objects appear at the top level of a body; unknown body
//! fields are ignored on decode.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::io::AsyncReadExt;

use crate::Error;

#[derive(Debug, Clone, Copy, Eq, PartialEq)]
#[repr(u8)]
pub enum MsgType {
    // client -> broker
    Register = 0x00,
    Call = 0x01,
    Reply = 0x02,
    Subscribe = 0x03,
    Publish = 0x04,
    // broker -> client
    RegisterAck = 0xf0,
    CallResult = 0xf1,
    Invoke = 0xf2,
    SubscribeAck = 0xf3,
    Event = 0xf4,
}

impl TryFrom<u8> for MsgType {
    type Error = Error;
    fn try_from(v: u8) -> Result<Self, Error> {
        match v {
            0x00 => Ok(MsgType::Register),
            0x01 => Ok(MsgType::Call),
            0x02 => Ok(MsgType::Reply),
            0x03 => Ok(MsgType::Subscribe),
            0x04 => Ok(MsgType::Publish),
            0xf0 => Ok(MsgType::RegisterAck),
            0xf1 => Ok(MsgType::CallResult),
            0xf2 => Ok(MsgType::Invoke),
            0xf3 => Ok(MsgType::SubscribeAck),
            0xf4 => Ok(MsgType::Event),
            _ => Err(Error::data(format!("unknown message type {:#04x}", v))),
        }
    }
}

/// A frame as pulled off the stream, before the tag and body are checked.
#[derive(Debug)]
pub struct RawFrame {
    pub tag: u8,
    pub body: Vec<u8>,
}

impl RawFrame {
    /// Tag and JSON errors here are per-frame: the frame has already been
    /// fully consumed from the stream, so the connection stays usable.
    pub fn decode(self) -> Result<Frame, Error> {
        let kind = MsgType::try_from(self.tag)?;
        let body: Value = serde_json::from_slice(&self.body)?;
        if !body.is_object() {
            return Err(Error::data("frame body is not an object"));
        }
        Ok(Frame { kind, body })
    }
}

#[derive(Debug)]
pub struct Frame {
    pub kind: MsgType,
    pub body: Value,
}

impl Frame {
    pub fn parse<T: DeserializeOwned>(self) -> Result<T, Error> {
        serde_json::from_value(self.body).map_err(Into::into)
    }
}

pub fn encode<T: Serialize>(kind: MsgType, body: &T) -> Result<Vec<u8>, Error> {
    let json = serde_json::to_vec(body)?;
    #[allow(clippy::cast_possible_truncation)]
    let len = (json.len() + 1) as u32;
    let mut buf = Vec::with_capacity(json.len() + 5);
    buf.extend_from_slice(&len.to_le_bytes());
    buf.push(kind as u8);
    buf.extend_from_slice(&json);
    Ok(buf)
}

/// Reads one frame, blocking until all its bytes have arrived. Returns
/// `Ok(None)` on a clean zero-byte read at the length phase (orderly peer
/// close); a stream that ends anywhere else is a truncation error.
pub async fn read_raw_frame<R>(reader: &mut R) -> Result<Option<RawFrame>, Error>
where
    R: AsyncReadExt + Unpin,
{
    let mut len_buf = [0u8; 4];
    let n = reader.read(&mut len_buf).await?;
    if n == 0 {
        return Ok(None);
    }
    if n < 4 {
        reader.read_exact(&mut len_buf[n..]).await?;
    }
    let len = u32::from_le_bytes(len_buf) as usize;
    if len == 0 {
        return Err(Error::data("zero-length frame"));
    }
    let mut buf = vec![0u8; len];
    reader.read_exact(&mut buf).await?;
    let body = buf.split_off(1);
    Ok(Some(RawFrame { tag: buf[0], body }))
}

// Message bodies. Wire field names `_id` and `_cs` are kept as in the
// protocol; `_cs` is the calling connection's broker-side handle and must
// be echoed back unchanged in a Reply.

#[derive(Debug, Serialize, Deserialize)]
pub struct Register {
    #[serde(rename = "_id")]
    pub id: String,
    pub object: String,
    pub funcs: Vec<String>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct Call {
    #[serde(rename = "_id")]
    pub id: String,
    pub object: String,
    pub func: String,
    #[serde(default)]
    pub data: Value,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct Reply {
    #[serde(rename = "_id")]
    pub id: String,
    #[serde(rename = "_cs")]
    pub cs: u64,
    #[serde(default)]
    pub data: Value,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct Subscribe {
    #[serde(rename = "_id")]
    pub id: String,
    pub event: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct Publish {
    pub event: String,
    #[serde(default)]
    pub data: Value,
}

/// Body of `RegisterAck` and `SubscribeAck`.
#[derive(Debug, Serialize, Deserialize)]
pub struct Ack {
    #[serde(rename = "_id")]
    pub id: String,
    pub ret: u8,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct CallResult {
    #[serde(rename = "_id")]
    pub id: String,
    pub ret: u8,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct Invocation {
    #[serde(rename = "_id")]
    pub id: String,
    #[serde(rename = "_cs")]
    pub cs: u64,
    pub object: String,
    pub func: String,
    #[serde(default)]
    pub data: Value,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct Event {
    pub event: String,
    #[serde(default)]
    pub data: Value,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ErrorKind;
    use serde_json::json;

    #[tokio::test]
    async fn roundtrip() {
        let body = Call {
            id: "a-b-c".to_owned(),
            object: "sensors".to_owned(),
            func: "read".to_owned(),
            data: json!({"unit": "C", "n": 3}),
        };
        let buf = encode(MsgType::Call, &body).unwrap();
        assert_eq!(u32::from_le_bytes(buf[0..4].try_into().unwrap()) as usize, buf.len() - 4);
        let mut stream: &[u8] = &buf;
        let frame = read_raw_frame(&mut stream)
            .await
            .unwrap()
            .unwrap()
            .decode()
            .unwrap();
        assert_eq!(frame.kind, MsgType::Call);
        let parsed: Call = frame.parse().unwrap();
        assert_eq!(parsed.id, "a-b-c");
        assert_eq!(parsed.data, json!({"unit": "C", "n": 3}));
    }

    #[tokio::test]
    async fn clean_eof_is_none() {
        let mut stream: &[u8] = &[];
        assert!(read_raw_frame(&mut stream).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn truncated_frame_is_fatal() {
        let buf = encode(MsgType::Publish, &json!({"event": "e"})).unwrap();
        let mut stream: &[u8] = &buf[..buf.len() - 2];
        assert_eq!(
            read_raw_frame(&mut stream).await.unwrap_err().kind(),
            ErrorKind::Eof
        );
    }

    #[tokio::test]
    async fn unknown_tag_is_per_frame_error() {
        let mut buf = encode(MsgType::Publish, &json!({"event": "e"})).unwrap();
        buf[4] = 0x7f;
        let mut stream: &[u8] = &buf;
        let raw = read_raw_frame(&mut stream).await.unwrap().unwrap();
        assert_eq!(raw.decode().unwrap_err().kind(), ErrorKind::Data);
        // the bad frame was fully consumed, the stream is still framed
        assert!(read_raw_frame(&mut stream).await.unwrap().is_none());
    }

    #[test]
    fn unknown_body_fields_are_ignored() {
        let frame = Frame {
            kind: MsgType::Subscribe,
            body: json!({"_id": "x", "event": "e", "future_field": 1}),
        };
        let parsed: Subscribe = frame.parse().unwrap();
        assert_eq!(parsed.event, "e");
    }
}
