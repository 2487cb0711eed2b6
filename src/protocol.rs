// Copyright 2020 Joyent, Inc.

//! Framing for the message channel shared by the client and the server.
//!
//! Every frame carries one message: a fixed header followed by a JSON
//! payload. See the crate documentation for the byte layout.

use std::io::{Error, ErrorKind};
use std::sync::atomic::{AtomicU64, Ordering};
use std::{io, str};

use byteorder::{BigEndian, ByteOrder};
use bytes::{BufMut, BytesMut};
use chrono::Utc;
use crc16::{State, ARC};
use num_derive::{FromPrimitive, ToPrimitive};
use num_traits::{FromPrimitive, ToPrimitive};
use serde_derive::{Deserialize, Serialize};
use serde_json::Value;
use tokio_util::codec::{Decoder, Encoder};

const FP_OFF_TYPE: usize = 0x1;
const FP_OFF_STATUS: usize = 0x2;
const FP_OFF_MSGID: usize = 0x3;
const FP_OFF_CRC: usize = 0xb;
const FP_OFF_DATALEN: usize = 0xf;
const FP_OFF_DATA: usize = 0x13;

pub const FP_HEADER_SZ: usize = FP_OFF_DATA;

const FP_VERSION_2: u8 = 0x2;
const FP_VERSION_CURRENT: u8 = FP_VERSION_2;

/// Default upper bound on the payload of a single frame (16 MiB).
pub const DEFAULT_MAX_FRAME_SIZE: usize = 16 * 1024 * 1024;

/// Correlation key for one logical call, unique per connection.
pub type RequestId = u64;

#[derive(Debug, Clone, Copy, PartialEq, Eq, FromPrimitive, ToPrimitive)]
pub enum MessageType {
    Json = 1,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, FromPrimitive, ToPrimitive)]
pub enum MessageStatus {
    Request = 1,
    Answer = 2,
    Notice = 3,
}

#[derive(Debug)]
pub enum ParseError {
    NotEnoughBytes(usize),
    IOError(Error),
}

impl From<io::Error> for ParseError {
    fn from(error: io::Error) -> Self {
        ParseError::IOError(error)
    }
}

struct MessageHeader {
    msg_type: MessageType,
    status: MessageStatus,
    id: RequestId,
    crc: u32,
    data_len: usize,
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct MessageMetaData {
    pub uts: u64,
    pub name: String,
}

impl MessageMetaData {
    pub fn new(n: String) -> MessageMetaData {
        let now = Utc::now();
        let now_micros =
            now.timestamp().max(0) as u64 * 1_000_000 + u64::from(now.timestamp_subsec_micros());

        MessageMetaData {
            uts: now_micros,
            name: n,
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct MessageData {
    pub m: MessageMetaData,
    pub d: Value,
}

impl MessageData {
    pub fn new(n: String, d: Value) -> MessageData {
        MessageData {
            m: MessageMetaData::new(n),
            d,
        }
    }
}

#[derive(Debug, Clone)]
pub struct Message {
    pub msg_type: MessageType,
    pub status: MessageStatus,
    pub id: RequestId,
    pub data: MessageData,
    pub msg_size: Option<usize>,
}

impl Message {
    /// Parse one complete frame from the front of `buf`.
    pub fn parse(buf: &[u8]) -> Result<Message, ParseError> {
        Message::check_buffer_size(buf)?;
        let header = Message::parse_header(buf)?;

        Message::validate_data_length(buf, header.data_len)?;
        let raw_data = &buf[FP_OFF_DATA..FP_OFF_DATA + header.data_len];
        Message::validate_crc(raw_data, header.crc)?;
        let data = Message::parse_data(raw_data)?;

        Ok(Message {
            msg_type: header.msg_type,
            status: header.status,
            id: header.id,
            data,
            msg_size: Some(FP_HEADER_SZ + header.data_len),
        })
    }

    fn check_buffer_size(buf: &[u8]) -> Result<(), ParseError> {
        if buf.len() < FP_HEADER_SZ {
            Err(ParseError::NotEnoughBytes(buf.len()))
        } else {
            Ok(())
        }
    }

    fn parse_header(buf: &[u8]) -> Result<MessageHeader, ParseError> {
        if buf[0] != FP_VERSION_CURRENT {
            let msg = format!("Unsupported protocol version: {}", buf[0]);
            return Err(Error::new(ErrorKind::InvalidData, msg).into());
        }
        let msg_type = FromPrimitive::from_u8(buf[FP_OFF_TYPE]).ok_or_else(|| {
            let msg = "Failed to parse message type";
            Error::new(ErrorKind::InvalidData, msg)
        })?;
        let status = FromPrimitive::from_u8(buf[FP_OFF_STATUS]).ok_or_else(|| {
            let msg = "Failed to parse message status";
            Error::new(ErrorKind::InvalidData, msg)
        })?;
        let msg_id = BigEndian::read_u64(&buf[FP_OFF_MSGID..FP_OFF_MSGID + 8]);
        let expected_crc = BigEndian::read_u32(&buf[FP_OFF_CRC..FP_OFF_CRC + 4]);
        let data_len =
            BigEndian::read_u32(&buf[FP_OFF_DATALEN..FP_OFF_DATALEN + 4]) as usize;

        Ok(MessageHeader {
            msg_type,
            status,
            id: msg_id,
            crc: expected_crc,
            data_len,
        })
    }

    fn validate_data_length(buf: &[u8], data_length: usize) -> Result<(), ParseError> {
        if buf.len() < (FP_HEADER_SZ + data_length) {
            Err(ParseError::NotEnoughBytes(buf.len()))
        } else {
            Ok(())
        }
    }

    fn validate_crc(data_buf: &[u8], crc: u32) -> Result<(), ParseError> {
        let calculated_crc = u32::from(State::<ARC>::calculate(data_buf));
        if crc != calculated_crc {
            let msg = "Calculated CRC does not match the provided CRC";
            Err(Error::new(ErrorKind::InvalidData, msg).into())
        } else {
            Ok(())
        }
    }

    fn parse_data(data_buf: &[u8]) -> Result<MessageData, ParseError> {
        match str::from_utf8(data_buf) {
            Ok(data_str) => serde_json::from_str(data_str).map_err(|_e| {
                let msg = "Failed to parse data payload as JSON";
                Error::new(ErrorKind::InvalidData, msg).into()
            }),
            Err(_) => {
                let msg = "Failed to parse data payload as UTF-8";
                Err(Error::new(ErrorKind::InvalidData, msg).into())
            }
        }
    }

    fn new(status: MessageStatus, id: RequestId, name: &str, d: Value) -> Message {
        Message {
            msg_type: MessageType::Json,
            status,
            id,
            data: MessageData::new(String::from(name), d),
            msg_size: None,
        }
    }

    pub fn request(id: RequestId, name: &str, d: Value) -> Message {
        Message::new(MessageStatus::Request, id, name, d)
    }

    pub fn answer(id: RequestId, name: &str, d: Value) -> Message {
        Message::new(MessageStatus::Answer, id, name, d)
    }

    pub fn notice(id: RequestId, name: &str, d: Value) -> Message {
        Message::new(MessageStatus::Notice, id, name, d)
    }

    pub fn name(&self) -> &str {
        &self.data.m.name
    }
}

/// Issues request identifiers from a strictly increasing counter.
#[derive(Debug)]
pub struct RequestIdGenerator(AtomicU64);

impl RequestIdGenerator {
    pub fn new() -> RequestIdGenerator {
        RequestIdGenerator(AtomicU64::new(1))
    }

    pub fn next(&self) -> RequestId {
        self.0.fetch_add(1, Ordering::SeqCst)
    }
}

impl Default for RequestIdGenerator {
    fn default() -> Self {
        Self::new()
    }
}

/// Frame codec used with `tokio_util::codec::Framed*`.
#[derive(Debug, Clone)]
pub struct MessageCodec {
    max_frame_size: usize,
}

impl MessageCodec {
    pub fn new(max_frame_size: usize) -> MessageCodec {
        MessageCodec { max_frame_size }
    }
}

impl Default for MessageCodec {
    fn default() -> Self {
        MessageCodec::new(DEFAULT_MAX_FRAME_SIZE)
    }
}

impl Decoder for MessageCodec {
    type Item = Message;
    type Error = io::Error;

    fn decode(&mut self, buf: &mut BytesMut) -> Result<Option<Self::Item>, io::Error> {
        if buf.len() < FP_HEADER_SZ {
            return Ok(None);
        }

        let data_len =
            BigEndian::read_u32(&buf[FP_OFF_DATALEN..FP_OFF_DATALEN + 4]) as usize;
        if data_len > self.max_frame_size {
            let msg = format!(
                "frame payload of {} bytes exceeds the limit of {} bytes",
                data_len, self.max_frame_size
            );
            return Err(Error::new(ErrorKind::InvalidData, msg));
        }

        let frame_len = FP_HEADER_SZ + data_len;
        if buf.len() < frame_len {
            buf.reserve(frame_len - buf.len());
            return Ok(None);
        }

        let frame = buf.split_to(frame_len);
        match Message::parse(&frame) {
            Ok(msg) => Ok(Some(msg)),
            Err(ParseError::IOError(e)) => {
                let msg = format!("failed to parse message: {}", e);
                Err(Error::new(ErrorKind::InvalidData, msg))
            }
            Err(ParseError::NotEnoughBytes(n)) => {
                let msg = format!("truncated frame: {} of {} bytes", n, frame_len);
                Err(Error::new(ErrorKind::InvalidData, msg))
            }
        }
    }
}

impl Encoder<Message> for MessageCodec {
    type Error = io::Error;

    fn encode(&mut self, item: Message, buf: &mut BytesMut) -> Result<(), io::Error> {
        encode_msg(&item, buf).map_err(|e| Error::new(ErrorKind::Other, e))
    }
}

pub fn encode_msg(msg: &Message, buf: &mut BytesMut) -> Result<(), String> {
    let m_msg_type_u8 = ToPrimitive::to_u8(&msg.msg_type);
    let m_status_u8 = ToPrimitive::to_u8(&msg.status);
    match (m_msg_type_u8, m_status_u8) {
        (Some(msg_type_u8), Some(status_u8)) => {
            let data_str = serde_json::to_string(&msg.data)
                .map_err(|e| format!("Failed to encode data payload: {}", e))?;
            let data_len = data_str.len();
            if data_len > u32::max_value() as usize {
                return Err(String::from("Data payload is too large"));
            }
            buf.reserve(FP_HEADER_SZ + data_len);
            buf.put_u8(FP_VERSION_CURRENT);
            buf.put_u8(msg_type_u8);
            buf.put_u8(status_u8);
            buf.put_u64(msg.id);
            buf.put_u32(u32::from(State::<ARC>::calculate(data_str.as_bytes())));
            buf.put_u32(data_len as u32);
            buf.put_slice(data_str.as_bytes());
            Ok(())
        }
        (None, Some(_)) => Err(String::from("Invalid message type")),
        (Some(_), None) => Err(String::from("Invalid status")),
        (None, None) => Err(String::from("Invalid message type and status")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use serde_json::json;

    fn encoded(msg: &Message) -> BytesMut {
        let mut buf = BytesMut::new();
        encode_msg(msg, &mut buf).expect("encode");
        buf
    }

    #[test]
    fn metadata_carries_wall_clock_micros() {
        let before = Utc::now().timestamp() as u64 * 1_000_000;
        let meta = MessageMetaData::new(String::from("load_strings"));
        let after = (Utc::now().timestamp() as u64 + 1) * 1_000_000;
        assert!(meta.uts >= before && meta.uts <= after, "{}", meta.uts);
    }

    #[test]
    fn request_ids_strictly_increase() {
        let ids = RequestIdGenerator::new();
        let mut last = 0;
        for _ in 0..1000 {
            let id = ids.next();
            assert!(id > last);
            last = id;
        }
    }

    #[test]
    fn decoder_waits_for_a_complete_frame() {
        let msg = Message::request(42, "load_strings", json!({"keys": ["a"]}));
        let full = encoded(&msg);
        let mut codec = MessageCodec::default();

        let mut partial = BytesMut::from(&full[..full.len() - 3]);
        assert!(codec.decode(&mut partial).expect("decode").is_none());

        partial.extend_from_slice(&full[full.len() - 3..]);
        let decoded = codec.decode(&mut partial).expect("decode").expect("frame");
        assert_eq!(decoded.id, 42);
        assert_eq!(decoded.status, MessageStatus::Request);
        assert_eq!(decoded.name(), "load_strings");
        assert_eq!(decoded.data.d, json!({"keys": ["a"]}));
        assert!(partial.is_empty());
    }

    #[test]
    fn decoder_splits_back_to_back_frames() {
        let mut buf = encoded(&Message::answer(1, "a", json!(1)));
        buf.extend_from_slice(&encoded(&Message::notice(2, "cancel", Value::Null)));
        let mut codec = MessageCodec::default();

        let first = codec.decode(&mut buf).expect("decode").expect("frame");
        let second = codec.decode(&mut buf).expect("decode").expect("frame");
        assert_eq!((first.id, first.status), (1, MessageStatus::Answer));
        assert_eq!((second.id, second.status), (2, MessageStatus::Notice));
        assert!(codec.decode(&mut buf).expect("decode").is_none());
    }

    #[test]
    fn corrupted_payload_fails_crc() {
        let mut buf = encoded(&Message::request(7, "x", json!("abcdef")));
        let last = buf.len() - 3;
        buf[last] = b'z';
        assert!(MessageCodec::default().decode(&mut buf).is_err());
    }

    #[test]
    fn oversized_frame_is_rejected() {
        let mut buf = encoded(&Message::request(7, "x", json!("a".repeat(64))));
        assert!(MessageCodec::new(16).decode(&mut buf).is_err());
    }
}
