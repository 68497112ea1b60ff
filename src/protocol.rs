// Copyright 2020 Joyent, Inc.

//! This module contains the types and functions used to encode and decode
//! Ticket protocol frames and envelopes. The contents of this module are not
//! needed for normal client or server consumers of this crate, but they are
//! exposed for the special case of someone needing to implement custom client
//! or server code.

use std::io::{Error, ErrorKind};
use std::{io, str};

use byteorder::{BigEndian, ByteOrder};
use bytes::{BufMut, BytesMut};
use crc16::*;
use num::{FromPrimitive, ToPrimitive};
use num_derive::{FromPrimitive, ToPrimitive};
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_derive::{Deserialize, Serialize};

const TF_OFF_KIND: usize = 0x1;
const TF_OFF_FLAGS: usize = 0x2;
const TF_OFF_CRC: usize = 0x3;
const TF_OFF_DATALEN: usize = 0x7;
const TF_OFF_DATA: usize = 0xb;

/// The size of a Ticket frame header
pub const TF_HEADER_SZ: usize = TF_OFF_DATA;

const TF_VERSION_1: u8 = 0x1;
const TF_VERSION_CURRENT: u8 = TF_VERSION_1;

/// Flag bit indicating more frames follow in the same message.
const TF_FLAG_MORE: u8 = 0x1;

/// An error type representing a failure to parse a buffer as a Ticket frame.
#[derive(Debug)]
pub enum FrameParseError {
    NotEnoughBytes(usize),
    IOError(Error),
}

impl From<io::Error> for FrameParseError {
    fn from(error: io::Error) -> Self {
        FrameParseError::IOError(error)
    }
}

impl From<FrameParseError> for Error {
    fn from(pfr: FrameParseError) -> Self {
        match pfr {
            FrameParseError::NotEnoughBytes(_) => {
                let msg = "Unable to parse frame: not enough bytes";
                Error::new(ErrorKind::Other, msg)
            }
            FrameParseError::IOError(e) => e,
        }
    }
}

/// Represents the Kind field of a Ticket frame. Identity frames carry the
/// opaque routing identity of a client connection; payload frames carry a
/// JSON-encoded envelope.
#[derive(Debug, FromPrimitive, ToPrimitive, PartialEq, Clone, Copy)]
pub enum FrameKind {
    Identity = 1,
    Payload = 2,
}

/// Represents one frame of a multipart Ticket message including its header
/// fields and data.
#[derive(Debug, Clone, PartialEq)]
pub struct Frame {
    /// The Kind field of the frame
    pub kind: FrameKind,
    /// Whether more frames follow in this message
    pub more: bool,
    /// The frame data
    pub data: Vec<u8>,
}

impl Frame {
    /// Returns an identity frame for the given routing identity. Identity
    /// frames always announce a following payload frame.
    pub fn identity(identity: &[u8]) -> Frame {
        Frame {
            kind: FrameKind::Identity,
            more: true,
            data: identity.to_vec(),
        }
    }

    /// Returns a payload frame terminating a message.
    pub fn payload(data: Vec<u8>) -> Frame {
        Frame {
            kind: FrameKind::Payload,
            more: false,
            data,
        }
    }

    /// The number of octets this frame occupies on the wire.
    pub fn wire_size(&self) -> usize {
        TF_HEADER_SZ + self.data.len()
    }

    /// Parse a byte buffer into a `Frame`. Returns a `FrameParseError` if the
    /// available bytes cannot be parsed to a `Frame`.
    pub fn parse(buf: &[u8]) -> Result<Frame, FrameParseError> {
        Frame::check_buffer_size(buf)?;

        if buf[0] != TF_VERSION_CURRENT {
            let msg = format!("Unsupported frame version: {}", buf[0]);
            return Err(FrameParseError::IOError(Error::new(
                ErrorKind::Other,
                msg,
            )));
        }

        let kind = FromPrimitive::from_u8(buf[TF_OFF_KIND]).ok_or_else(|| {
            let msg = "Failed to parse frame kind";
            FrameParseError::IOError(Error::new(ErrorKind::Other, msg))
        })?;
        let more = buf[TF_OFF_FLAGS] & TF_FLAG_MORE != 0;
        let expected_crc =
            BigEndian::read_u32(&buf[TF_OFF_CRC..TF_OFF_CRC + 4]);
        let data_len =
            BigEndian::read_u32(&buf[TF_OFF_DATALEN..TF_OFF_DATALEN + 4])
                as usize;

        if buf.len() < TF_HEADER_SZ + data_len {
            return Err(FrameParseError::NotEnoughBytes(buf.len()));
        }

        let data = &buf[TF_OFF_DATA..TF_OFF_DATA + data_len];
        Frame::validate_crc(data, expected_crc)?;

        Ok(Frame {
            kind,
            more,
            data: data.to_vec(),
        })
    }

    /// Check that the provided byte buffer contains at least `TF_HEADER_SZ`
    /// bytes. Returns a `FrameParseError` if this is not the case.
    pub fn check_buffer_size(buf: &[u8]) -> Result<(), FrameParseError> {
        if buf.len() < TF_HEADER_SZ {
            Err(FrameParseError::NotEnoughBytes(buf.len()))
        } else {
            Ok(())
        }
    }

    fn validate_crc(data_buf: &[u8], crc: u32) -> Result<(), FrameParseError> {
        let calculated_crc = u32::from(State::<ARC>::calculate(data_buf));
        if crc != calculated_crc {
            let msg = "Calculated CRC does not match the provided CRC";
            Err(FrameParseError::IOError(Error::new(ErrorKind::Other, msg)))
        } else {
            Ok(())
        }
    }
}

/// Encode a `Frame` into a byte buffer. The `Result` contains a unit type on
/// success and an error string on failure.
pub fn encode_frame(frame: &Frame, buf: &mut BytesMut) -> Result<(), String> {
    match frame.kind.to_u8() {
        Some(kind_u8) => {
            let buf_capacity = buf.capacity();
            if buf.len() + frame.wire_size() > buf_capacity {
                buf.reserve(frame.wire_size());
            }
            buf.put_u8(TF_VERSION_CURRENT);
            buf.put_u8(kind_u8);
            buf.put_u8(if frame.more { TF_FLAG_MORE } else { 0 });
            buf.put_u32(u32::from(State::<ARC>::calculate(&frame.data)));
            buf.put_u32(frame.data.len() as u32);
            buf.put_slice(&frame.data);
            Ok(())
        }
        None => Err(String::from("Invalid frame kind")),
    }
}

/// Encode a complete `[identity | payload]` message into a byte buffer.
pub fn encode_message(
    identity: &[u8],
    payload: &[u8],
    buf: &mut BytesMut,
) -> Result<(), String> {
    encode_frame(&Frame::identity(identity), buf)?;
    encode_frame(&Frame::payload(payload.to_vec()), buf)
}

/// Serialize an envelope (or handshake) into payload frame data.
pub fn to_payload<T: Serialize>(msg: &T) -> Result<Vec<u8>, Error> {
    serde_json::to_vec(msg).map_err(|e| {
        let msg = format!("Failed to serialize payload: {}", e);
        Error::new(ErrorKind::Other, msg)
    })
}

/// Deserialize payload frame data into an envelope (or handshake).
pub fn from_payload<T: DeserializeOwned>(buf: &[u8]) -> Result<T, Error> {
    match str::from_utf8(buf) {
        Ok(payload_str) => serde_json::from_str(payload_str).map_err(|_e| {
            let msg = "Failed to parse payload as JSON";
            Error::new(ErrorKind::Other, msg)
        }),
        Err(_) => {
            let msg = "Failed to parse payload as UTF-8";
            Err(Error::new(ErrorKind::Other, msg))
        }
    }
}

/// Represents the Status field carried on every response.
#[derive(Debug, Serialize, Deserialize, PartialEq, Clone, Copy)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Status {
    Success,
    ErrorInvalidInput,
    ErrorDivByZero,
    ErrorSubstrNotFound,
    ErrorStringTooLong,
    ErrorInternal,
    NotFinished,
}

impl Status {
    /// A status is terminal when the job it describes will never change
    /// again. `NOT_FINISHED` is the only transient status.
    pub fn is_terminal(self) -> bool {
        self != Status::NotFinished
    }
}

/// The math operations a submission may request.
#[derive(Debug, Serialize, Deserialize, PartialEq, Clone, Copy)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MathOp {
    Add,
    Sub,
    Mul,
    Div,
}

/// The string operations a submission may request.
#[derive(Debug, Serialize, Deserialize, PartialEq, Clone, Copy)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum StrOp {
    Concat,
    FindStart,
}

#[derive(Debug, Serialize, Deserialize, PartialEq, Clone, Copy)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SubmitMode {
    Blocking,
    Nonblocking,
}

#[derive(Debug, Serialize, Deserialize, PartialEq, Clone, Copy)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum GetWaitMode {
    NoWait,
    WaitUpTo,
}

#[derive(Debug, Serialize, Deserialize, PartialEq, Clone)]
pub struct MathArgs {
    pub op: MathOp,
    pub a: i32,
    pub b: i32,
}

#[derive(Debug, Serialize, Deserialize, PartialEq, Clone)]
pub struct StrArgs {
    pub op: StrOp,
    pub s1: String,
    pub s2: String,
}

/// The operation variant of a submission: exactly one of math or string.
#[derive(Debug, Serialize, Deserialize, PartialEq, Clone)]
#[serde(rename_all = "snake_case")]
pub enum OpArgs {
    Math(MathArgs),
    Str(StrArgs),
}

/// The 64-bit handle returned for a non-blocking submission.
#[derive(Debug, Serialize, Deserialize, PartialEq, Clone, Copy)]
pub struct Ticket {
    pub req_id: u64,
}

/// A tagged result value. Present on a response only when the status is
/// `SUCCESS`.
#[derive(Debug, Serialize, Deserialize, PartialEq, Clone)]
#[serde(rename_all = "snake_case")]
pub enum ResultValue {
    IntResult(i32),
    Position(i32),
    StrResult(String),
}

/// Sent by a client exactly once as the first application frame after
/// connect. The low byte of `exec_functions` carries the capability bitmask.
#[derive(Debug, Serialize, Deserialize, PartialEq, Clone)]
pub struct FirstHandshake {
    pub client_name: String,
    pub exec_functions: u32,
}

#[derive(Debug, Serialize, Deserialize, PartialEq, Clone)]
pub struct SubmitRequest {
    pub mode: SubmitMode,
    pub op: OpArgs,
}

#[derive(Debug, Serialize, Deserialize, PartialEq, Clone)]
pub struct GetRequest {
    pub ticket: Ticket,
    pub wait_mode: GetWaitMode,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_ms: Option<u32>,
}

/// The top-level request envelope.
#[derive(Debug, Serialize, Deserialize, PartialEq, Clone)]
#[serde(rename_all = "snake_case")]
pub enum EnvelopeReq {
    Submit(SubmitRequest),
    Get(GetRequest),
}

#[derive(Debug, Serialize, Deserialize, PartialEq, Clone)]
pub struct SubmitResponse {
    pub status: Status,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ticket: Option<Ticket>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<ResultValue>,
}

impl SubmitResponse {
    /// Returns a response carrying only a status, for failed submissions.
    pub fn error(status: Status) -> SubmitResponse {
        SubmitResponse {
            status,
            ticket: None,
            result: None,
        }
    }
}

#[derive(Debug, Serialize, Deserialize, PartialEq, Clone)]
pub struct GetResponse {
    pub status: Status,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<ResultValue>,
}

impl GetResponse {
    /// Returns a response carrying only a status, for pending or failed
    /// retrievals.
    pub fn error(status: Status) -> GetResponse {
        GetResponse {
            status,
            result: None,
        }
    }
}

/// The top-level response envelope, mirroring `EnvelopeReq`.
#[derive(Debug, Serialize, Deserialize, PartialEq, Clone)]
#[serde(rename_all = "snake_case")]
pub enum EnvelopeResp {
    Submit(SubmitResponse),
    Get(GetResponse),
}

#[cfg(test)]
mod test {
    use super::*;

    use quickcheck::{quickcheck, Arbitrary, Gen};
    use serde_json::json;

    impl Arbitrary for FrameKind {
        fn arbitrary(g: &mut Gen) -> FrameKind {
            *g.choose(&[FrameKind::Identity, FrameKind::Payload]).unwrap()
        }
    }

    impl Arbitrary for Frame {
        fn arbitrary(g: &mut Gen) -> Frame {
            Frame {
                kind: FrameKind::arbitrary(g),
                more: bool::arbitrary(g),
                data: Vec::<u8>::arbitrary(g),
            }
        }
    }

    impl Arbitrary for Status {
        fn arbitrary(g: &mut Gen) -> Status {
            *g.choose(&[
                Status::Success,
                Status::ErrorInvalidInput,
                Status::ErrorDivByZero,
                Status::ErrorSubstrNotFound,
                Status::ErrorStringTooLong,
                Status::ErrorInternal,
                Status::NotFinished,
            ])
            .unwrap()
        }
    }

    impl Arbitrary for OpArgs {
        fn arbitrary(g: &mut Gen) -> OpArgs {
            if bool::arbitrary(g) {
                OpArgs::Math(MathArgs {
                    op: *g
                        .choose(&[
                            MathOp::Add,
                            MathOp::Sub,
                            MathOp::Mul,
                            MathOp::Div,
                        ])
                        .unwrap(),
                    a: i32::arbitrary(g),
                    b: i32::arbitrary(g),
                })
            } else {
                OpArgs::Str(StrArgs {
                    op: *g.choose(&[StrOp::Concat, StrOp::FindStart]).unwrap(),
                    s1: String::arbitrary(g),
                    s2: String::arbitrary(g),
                })
            }
        }
    }

    impl Arbitrary for EnvelopeReq {
        fn arbitrary(g: &mut Gen) -> EnvelopeReq {
            if bool::arbitrary(g) {
                EnvelopeReq::Submit(SubmitRequest {
                    mode: *g
                        .choose(&[
                            SubmitMode::Blocking,
                            SubmitMode::Nonblocking,
                        ])
                        .unwrap(),
                    op: OpArgs::arbitrary(g),
                })
            } else {
                EnvelopeReq::Get(GetRequest {
                    ticket: Ticket {
                        req_id: u64::arbitrary(g),
                    },
                    wait_mode: *g
                        .choose(&[GetWaitMode::NoWait, GetWaitMode::WaitUpTo])
                        .unwrap(),
                    timeout_ms: Option::<u32>::arbitrary(g),
                })
            }
        }
    }

    impl Arbitrary for ResultValue {
        fn arbitrary(g: &mut Gen) -> ResultValue {
            match u8::arbitrary(g) % 3 {
                0 => ResultValue::IntResult(i32::arbitrary(g)),
                1 => ResultValue::Position(i32::arbitrary(g)),
                _ => ResultValue::StrResult(String::arbitrary(g)),
            }
        }
    }

    impl Arbitrary for EnvelopeResp {
        fn arbitrary(g: &mut Gen) -> EnvelopeResp {
            if bool::arbitrary(g) {
                EnvelopeResp::Submit(SubmitResponse {
                    status: Status::arbitrary(g),
                    ticket: Option::<u64>::arbitrary(g)
                        .map(|req_id| Ticket { req_id }),
                    result: Option::<ResultValue>::arbitrary(g),
                })
            } else {
                EnvelopeResp::Get(GetResponse {
                    status: Status::arbitrary(g),
                    result: Option::<ResultValue>::arbitrary(g),
                })
            }
        }
    }

    quickcheck! {
        fn prop_frame_roundtrip(frame: Frame) -> bool {
            let mut write_buf = BytesMut::new();
            match encode_frame(&frame, &mut write_buf) {
                Ok(_) => {
                    match Frame::parse(&write_buf) {
                        Ok(decoded) => decoded == frame,
                        Err(_) => false
                    }
                },
                Err(_) => false
            }
        }
    }

    quickcheck! {
        fn prop_frame_stream(frames: Vec<Frame>) -> bool {
            let mut write_buf = BytesMut::new();
            for frame in &frames {
                if encode_frame(frame, &mut write_buf).is_err() {
                    return false;
                }
            }

            let mut offset = 0;
            for frame in &frames {
                match Frame::parse(&write_buf[offset..]) {
                    Ok(decoded) => {
                        if decoded != *frame {
                            return false;
                        }
                        offset += decoded.wire_size();
                    }
                    Err(_) => return false,
                }
            }

            offset == write_buf.len()
        }
    }

    quickcheck! {
        fn prop_envelope_req_roundtrip(env: EnvelopeReq) -> bool {
            let buf = to_payload(&env).unwrap();
            match from_payload::<EnvelopeReq>(&buf) {
                Ok(decoded) => decoded == env,
                Err(_) => false
            }
        }
    }

    quickcheck! {
        fn prop_envelope_resp_roundtrip(env: EnvelopeResp) -> bool {
            let buf = to_payload(&env).unwrap();
            match from_payload::<EnvelopeResp>(&buf) {
                Ok(decoded) => decoded == env,
                Err(_) => false
            }
        }
    }

    #[test]
    fn short_buffer_is_not_enough_bytes() {
        let frame = Frame::payload(b"{}".to_vec());
        let mut write_buf = BytesMut::new();
        encode_frame(&frame, &mut write_buf).unwrap();

        for cut in 0..write_buf.len() {
            match Frame::parse(&write_buf[..cut]) {
                Err(FrameParseError::NotEnoughBytes(n)) => assert_eq!(n, cut),
                other => panic!("expected NotEnoughBytes, got {:?}", other),
            }
        }
    }

    #[test]
    fn corrupt_crc_is_rejected() {
        let frame = Frame::payload(b"{\"status\":\"SUCCESS\"}".to_vec());
        let mut write_buf = BytesMut::new();
        encode_frame(&frame, &mut write_buf).unwrap();

        let last = write_buf.len() - 1;
        write_buf[last] ^= 0xff;
        match Frame::parse(&write_buf) {
            Err(FrameParseError::IOError(_)) => (),
            other => panic!("expected IOError, got {:?}", other),
        }
    }

    #[test]
    fn unknown_kind_is_rejected() {
        let frame = Frame::payload(vec![]);
        let mut write_buf = BytesMut::new();
        encode_frame(&frame, &mut write_buf).unwrap();

        write_buf[TF_OFF_KIND] = 0x7;
        match Frame::parse(&write_buf) {
            Err(FrameParseError::IOError(_)) => (),
            other => panic!("expected IOError, got {:?}", other),
        }
    }

    #[test]
    fn handshake_wire_shape() {
        let hs = FirstHandshake {
            client_name: String::from("client-1"),
            exec_functions: 0x15,
        };
        let value = serde_json::to_value(&hs).unwrap();
        assert_eq!(
            value,
            json!({"client_name": "client-1", "exec_functions": 0x15})
        );
    }

    #[test]
    fn envelope_wire_shape() {
        let env = EnvelopeReq::Submit(SubmitRequest {
            mode: SubmitMode::Nonblocking,
            op: OpArgs::Math(MathArgs {
                op: MathOp::Add,
                a: 40,
                b: 2,
            }),
        });
        let value = serde_json::to_value(&env).unwrap();
        assert_eq!(
            value,
            json!({
                "submit": {
                    "mode": "NONBLOCKING",
                    "op": {"math": {"op": "ADD", "a": 40, "b": 2}}
                }
            })
        );

        let resp = EnvelopeResp::Get(GetResponse {
            status: Status::Success,
            result: Some(ResultValue::StrResult(String::from("helloworld"))),
        });
        let value = serde_json::to_value(&resp).unwrap();
        assert_eq!(
            value,
            json!({
                "get": {
                    "status": "SUCCESS",
                    "result": {"str_result": "helloworld"}
                }
            })
        );
    }

    #[test]
    fn handshake_does_not_parse_as_envelope() {
        let hs = FirstHandshake {
            client_name: String::from("client-1"),
            exec_functions: 0x3f,
        };
        let buf = to_payload(&hs).unwrap();
        assert!(from_payload::<EnvelopeReq>(&buf).is_err());
    }
}
