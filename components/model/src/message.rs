//! Typed views over [`Frame`]s and builders for the request frames the client
//! sends. Layouts follow the DCP dialect of the memcached binary protocol.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use codec::frame::{Frame, HeloFeature, OperationCode};

use crate::error::DecodeError;
use crate::stream::{FailoverLogEntry, StreamEndReason, StreamRequest};

const MUTATION_EXTRAS_LEN: usize = 31;
const DELETION_EXTRAS_LEN: usize = 18;
const SNAPSHOT_EXTRAS_LEN: usize = 20;
const STREAM_REQ_EXTRAS_LEN: usize = 48;

const OPEN_CONNECTION_FLAG_PRODUCER: u32 = 0x01;

fn expect_opcode(frame: &Frame, expected: OperationCode) -> Result<(), DecodeError> {
    if frame.opcode != expected {
        return Err(DecodeError::UnexpectedOpcode {
            expected,
            found: frame.opcode,
        });
    }
    Ok(())
}

fn malformed(opcode: OperationCode, reason: impl Into<String>) -> DecodeError {
    DecodeError::MalformedBody {
        opcode,
        reason: reason.into(),
    }
}

/// A document change delivered on a DCP stream.
#[derive(Debug, Clone, PartialEq)]
pub struct MutationMessage {
    pub partition: u16,
    pub by_seqno: u64,
    pub rev_seqno: u64,
    pub flags: u32,
    pub expiry: u32,
    pub lock_time: u32,
    pub cas: u64,
    pub key: Bytes,
    pub content: Bytes,
}

impl MutationMessage {
    pub fn parse(frame: &Frame) -> Result<Self, DecodeError> {
        expect_opcode(frame, OperationCode::Mutation)?;
        if frame.extras.len() < MUTATION_EXTRAS_LEN {
            return Err(malformed(
                frame.opcode,
                format!("extras too short: {}", frame.extras.len()),
            ));
        }
        let mut extras = frame.extras.clone();
        Ok(Self {
            partition: frame.vbucket(),
            by_seqno: extras.get_u64(),
            rev_seqno: extras.get_u64(),
            flags: extras.get_u32(),
            expiry: extras.get_u32(),
            lock_time: extras.get_u32(),
            cas: frame.cas,
            key: frame.key.clone(),
            content: frame.value.clone(),
        })
    }
}

/// A document removal or expiration. Both opcodes share the layout.
#[derive(Debug, Clone, PartialEq)]
pub struct DeletionMessage {
    pub partition: u16,
    pub by_seqno: u64,
    pub rev_seqno: u64,
    pub cas: u64,
    pub key: Bytes,
}

impl DeletionMessage {
    pub fn parse(frame: &Frame) -> Result<Self, DecodeError> {
        if frame.opcode != OperationCode::Deletion && frame.opcode != OperationCode::Expiration {
            return Err(DecodeError::UnexpectedOpcode {
                expected: OperationCode::Deletion,
                found: frame.opcode,
            });
        }
        if frame.extras.len() < DELETION_EXTRAS_LEN {
            return Err(malformed(
                frame.opcode,
                format!("extras too short: {}", frame.extras.len()),
            ));
        }
        let mut extras = frame.extras.clone();
        Ok(Self {
            partition: frame.vbucket(),
            by_seqno: extras.get_u64(),
            rev_seqno: extras.get_u64(),
            cas: frame.cas,
            key: frame.key.clone(),
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SnapshotMarkerMessage {
    pub partition: u16,
    pub start_seqno: u64,
    pub end_seqno: u64,
    pub flags: u32,
}

impl SnapshotMarkerMessage {
    pub fn parse(frame: &Frame) -> Result<Self, DecodeError> {
        expect_opcode(frame, OperationCode::SnapshotMarker)?;
        if frame.extras.len() < SNAPSHOT_EXTRAS_LEN {
            return Err(malformed(
                frame.opcode,
                format!("extras too short: {}", frame.extras.len()),
            ));
        }
        let mut extras = frame.extras.clone();
        Ok(Self {
            partition: frame.vbucket(),
            start_seqno: extras.get_u64(),
            end_seqno: extras.get_u64(),
            flags: extras.get_u32(),
        })
    }
}

pub fn parse_stream_end_reason(frame: &Frame) -> Result<StreamEndReason, DecodeError> {
    expect_opcode(frame, OperationCode::StreamEnd)?;
    if frame.extras.len() < 4 {
        return Err(malformed(frame.opcode, "missing reason flags"));
    }
    let mut extras = frame.extras.clone();
    Ok(StreamEndReason::from_code(extras.get_u32()))
}

/// Failover logs travel as a flat run of `(uuid, seqno)` u64 pairs,
/// most-recent-first.
pub fn parse_failover_log(body: &Bytes) -> Result<Vec<FailoverLogEntry>, DecodeError> {
    if body.len() % 16 != 0 {
        return Err(malformed(
            OperationCode::GetFailoverLog,
            format!("body length {} is not a multiple of 16", body.len()),
        ));
    }
    let mut buf = body.clone();
    let mut log = Vec::with_capacity(body.len() / 16);
    while buf.remaining() >= 16 {
        log.push(FailoverLogEntry {
            uuid: buf.get_u64(),
            seqno: buf.get_u64(),
        });
    }
    Ok(log)
}

pub fn encode_failover_log(log: &[FailoverLogEntry]) -> Bytes {
    let mut buf = BytesMut::with_capacity(log.len() * 16);
    for entry in log {
        buf.put_u64(entry.uuid);
        buf.put_u64(entry.seqno);
    }
    buf.freeze()
}

/// GET_ALL_VB_SEQNOS replies with `(vbucket id, high seqno)` pairs.
pub fn parse_seqnos(body: &Bytes) -> Result<Vec<(u16, u64)>, DecodeError> {
    if body.len() % 10 != 0 {
        return Err(malformed(
            OperationCode::GetAllVbSeqnos,
            format!("body length {} is not a multiple of 10", body.len()),
        ));
    }
    let mut buf = body.clone();
    let mut seqnos = Vec::with_capacity(body.len() / 10);
    while buf.remaining() >= 10 {
        seqnos.push((buf.get_u16(), buf.get_u64()));
    }
    Ok(seqnos)
}

pub fn encode_seqnos(seqnos: &[(u16, u64)]) -> Bytes {
    let mut buf = BytesMut::with_capacity(seqnos.len() * 10);
    for (partition, seqno) in seqnos {
        buf.put_u16(*partition);
        buf.put_u64(*seqno);
    }
    buf.freeze()
}

/// A rollback response carries the seqno to rewind to as its whole body.
pub fn parse_rollback_seqno(frame: &Frame) -> Result<u64, DecodeError> {
    if frame.value.len() < 8 {
        return Err(malformed(frame.opcode, "missing rollback seqno"));
    }
    let mut value = frame.value.clone();
    Ok(value.get_u64())
}

pub fn sasl_auth_plain(username: &str, password: &str) -> Frame {
    let mut frame = Frame::request(OperationCode::SaslAuth, 0);
    frame.key = Bytes::from_static(b"PLAIN");
    let mut value = BytesMut::with_capacity(username.len() + password.len() + 2);
    value.put_u8(0);
    value.put_slice(username.as_bytes());
    value.put_u8(0);
    value.put_slice(password.as_bytes());
    frame.value = value.freeze();
    frame
}

pub fn select_bucket(bucket: &str) -> Frame {
    let mut frame = Frame::request(OperationCode::SelectBucket, 0);
    frame.key = Bytes::copy_from_slice(bucket.as_bytes());
    frame
}

pub fn helo(connection_name: &str, features: &[HeloFeature]) -> Frame {
    let mut frame = Frame::request(OperationCode::Helo, 0);
    frame.key = Bytes::copy_from_slice(connection_name.as_bytes());
    let mut value = BytesMut::with_capacity(features.len() * 2);
    for feature in features {
        value.put_u16((*feature).into());
    }
    frame.value = value.freeze();
    frame
}

/// Features the server accepted, unknown codes skipped.
pub fn parse_helo_response(frame: &Frame) -> Vec<HeloFeature> {
    let mut value = frame.value.clone();
    let mut features = Vec::with_capacity(value.len() / 2);
    while value.remaining() >= 2 {
        if let Ok(feature) = HeloFeature::try_from(value.get_u16()) {
            features.push(feature);
        }
    }
    features
}

pub fn open_connection(connection_name: &str) -> Frame {
    let mut frame = Frame::request(OperationCode::OpenConnection, 0);
    let mut extras = BytesMut::with_capacity(8);
    extras.put_u32(0);
    extras.put_u32(OPEN_CONNECTION_FLAG_PRODUCER);
    frame.extras = extras.freeze();
    frame.key = Bytes::copy_from_slice(connection_name.as_bytes());
    frame
}

pub fn control(key: &str, value: &str) -> Frame {
    let mut frame = Frame::request(OperationCode::Control, 0);
    frame.key = Bytes::copy_from_slice(key.as_bytes());
    frame.value = Bytes::copy_from_slice(value.as_bytes());
    frame
}

pub fn stream_request_frame(request: &StreamRequest) -> Frame {
    let mut frame = Frame::request(OperationCode::StreamReq, request.partition);
    let mut extras = BytesMut::with_capacity(STREAM_REQ_EXTRAS_LEN);
    // flags + reserved
    extras.put_u32(0);
    extras.put_u32(0);
    extras.put_u64(request.start_seqno);
    extras.put_u64(request.end_seqno);
    extras.put_u64(request.vbucket_uuid);
    extras.put_u64(request.snapshot_start_seqno);
    extras.put_u64(request.snapshot_end_seqno);
    frame.extras = extras.freeze();
    frame
}

pub fn parse_stream_request(frame: &Frame) -> Result<StreamRequest, DecodeError> {
    expect_opcode(frame, OperationCode::StreamReq)?;
    if frame.extras.len() < STREAM_REQ_EXTRAS_LEN {
        return Err(malformed(
            frame.opcode,
            format!("extras too short: {}", frame.extras.len()),
        ));
    }
    let mut extras = frame.extras.clone();
    // flags + reserved
    extras.advance(8);
    let start_seqno = extras.get_u64();
    let end_seqno = extras.get_u64();
    let vbucket_uuid = extras.get_u64();
    let snapshot_start_seqno = extras.get_u64();
    let snapshot_end_seqno = extras.get_u64();
    Ok(StreamRequest {
        partition: frame.vbucket(),
        vbucket_uuid,
        start_seqno,
        end_seqno,
        snapshot_start_seqno,
        snapshot_end_seqno,
    })
}

pub fn close_stream(partition: u16) -> Frame {
    Frame::request(OperationCode::CloseStream, partition)
}

pub fn get_failover_log(partition: u16) -> Frame {
    Frame::request(OperationCode::GetFailoverLog, partition)
}

pub fn get_all_vb_seqnos() -> Frame {
    Frame::request(OperationCode::GetAllVbSeqnos, 0)
}

pub fn buffer_ack(bytes: u32) -> Frame {
    let mut frame = Frame::request(OperationCode::BufferAcknowledgement, 0);
    let mut extras = BytesMut::with_capacity(4);
    extras.put_u32(bytes);
    frame.extras = extras.freeze();
    frame
}

pub fn parse_buffer_ack(frame: &Frame) -> Result<u32, DecodeError> {
    expect_opcode(frame, OperationCode::BufferAcknowledgement)?;
    if frame.extras.len() < 4 {
        return Err(malformed(frame.opcode, "missing byte count"));
    }
    let mut extras = frame.extras.clone();
    Ok(extras.get_u32())
}

pub fn noop_reply(opaque: u32) -> Frame {
    Frame::response(OperationCode::Noop, codec::frame::Status::Success, opaque)
}

// Server-side builders, used by scripted test servers to author the inbound
// side of a stream.

pub fn mutation_frame(partition: u16, by_seqno: u64, rev_seqno: u64, key: &[u8], value: &[u8]) -> Frame {
    let mut frame = Frame::request(OperationCode::Mutation, partition);
    let mut extras = BytesMut::with_capacity(MUTATION_EXTRAS_LEN);
    extras.put_u64(by_seqno);
    extras.put_u64(rev_seqno);
    // flags, expiry, lock time
    extras.put_u32(0);
    extras.put_u32(0);
    extras.put_u32(0);
    // metadata size + nru
    extras.put_u16(0);
    extras.put_u8(0);
    frame.extras = extras.freeze();
    frame.key = Bytes::copy_from_slice(key);
    frame.value = Bytes::copy_from_slice(value);
    frame
}

pub fn deletion_frame(partition: u16, by_seqno: u64, rev_seqno: u64, key: &[u8]) -> Frame {
    let mut frame = Frame::request(OperationCode::Deletion, partition);
    let mut extras = BytesMut::with_capacity(DELETION_EXTRAS_LEN);
    extras.put_u64(by_seqno);
    extras.put_u64(rev_seqno);
    extras.put_u16(0);
    frame.extras = extras.freeze();
    frame.key = Bytes::copy_from_slice(key);
    frame
}

pub fn snapshot_marker_frame(partition: u16, start_seqno: u64, end_seqno: u64) -> Frame {
    let mut frame = Frame::request(OperationCode::SnapshotMarker, partition);
    let mut extras = BytesMut::with_capacity(SNAPSHOT_EXTRAS_LEN);
    extras.put_u64(start_seqno);
    extras.put_u64(end_seqno);
    extras.put_u32(0);
    frame.extras = extras.freeze();
    frame
}

pub fn stream_end_frame(partition: u16, reason: u32) -> Frame {
    let mut frame = Frame::request(OperationCode::StreamEnd, partition);
    let mut extras = BytesMut::with_capacity(4);
    extras.put_u32(reason);
    frame.extras = extras.freeze();
    frame
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stream::NO_END_SEQNO;

    #[test]
    fn test_stream_request_round_trip() {
        let request = StreamRequest {
            partition: 42,
            vbucket_uuid: 0xCAFE,
            start_seqno: 100,
            end_seqno: NO_END_SEQNO,
            snapshot_start_seqno: 90,
            snapshot_end_seqno: 100,
        };
        let frame = stream_request_frame(&request);
        assert_eq!(42, frame.vbucket());
        assert_eq!(request, parse_stream_request(&frame).unwrap());
    }

    #[test]
    fn test_mutation_round_trip() {
        let frame = mutation_frame(3, 17, 2, b"key", b"value");
        let message = MutationMessage::parse(&frame).unwrap();
        assert_eq!(3, message.partition);
        assert_eq!(17, message.by_seqno);
        assert_eq!(2, message.rev_seqno);
        assert_eq!(b"key", message.key.as_ref());
        assert_eq!(b"value", message.content.as_ref());
    }

    #[test]
    fn test_deletion_covers_expiration() {
        let mut frame = deletion_frame(1, 9, 1, b"gone");
        frame.opcode = OperationCode::Expiration;
        let message = DeletionMessage::parse(&frame).unwrap();
        assert_eq!(9, message.by_seqno);
    }

    #[test]
    fn test_snapshot_marker_round_trip() {
        let frame = snapshot_marker_frame(5, 10, 20);
        let marker = SnapshotMarkerMessage::parse(&frame).unwrap();
        assert_eq!(10, marker.start_seqno);
        assert_eq!(20, marker.end_seqno);
        assert_eq!(5, marker.partition);
    }

    #[test]
    fn test_failover_log_round_trip() {
        let log = vec![
            FailoverLogEntry {
                uuid: 0xAB,
                seqno: 50,
            },
            FailoverLogEntry { uuid: 0xCD, seqno: 0 },
        ];
        let body = encode_failover_log(&log);
        assert_eq!(log, parse_failover_log(&body).unwrap());
    }

    #[test]
    fn test_failover_log_rejects_ragged_body() {
        let body = Bytes::from_static(&[0u8; 15]);
        assert!(parse_failover_log(&body).is_err());
    }

    #[test]
    fn test_seqnos_round_trip() {
        let seqnos = vec![(0u16, 120u64), (1, 7)];
        let body = encode_seqnos(&seqnos);
        assert_eq!(seqnos, parse_seqnos(&body).unwrap());
    }

    #[test]
    fn test_helo_round_trip() {
        let features = [HeloFeature::DataType, HeloFeature::MutationSeqno];
        let frame = helo("consumer:10.0.0.1:1", &features);
        let mut response = Frame::response(
            OperationCode::Helo,
            codec::frame::Status::Success,
            frame.opaque,
        );
        response.value = frame.value.clone();
        assert_eq!(features.to_vec(), parse_helo_response(&response));
    }

    #[test]
    fn test_sasl_plain_layout() {
        let frame = sasl_auth_plain("user", "pass");
        assert_eq!(b"PLAIN", frame.key.as_ref());
        assert_eq!(b"\0user\0pass", frame.value.as_ref());
    }

    #[test]
    fn test_wrong_opcode_rejected() {
        let frame = Frame::request(OperationCode::Deletion, 0);
        assert!(matches!(
            MutationMessage::parse(&frame),
            Err(DecodeError::UnexpectedOpcode { .. })
        ));
    }
}
