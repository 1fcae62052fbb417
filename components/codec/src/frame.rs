use byteorder::ReadBytesExt;
use bytes::{Buf, BufMut, Bytes, BytesMut};
use log::{trace, warn};
use num_enum::{IntoPrimitive, TryFromPrimitive};
use std::fmt::{self, Display};
use std::io::Cursor;

use crate::error::FrameError;

pub const MAGIC_REQ: u8 = 0x80;
pub const MAGIC_RES: u8 = 0x81;

pub const HEADER_SIZE: usize = 24;

// Max frame body 32MB, generously above the default connection buffer size.
pub(crate) const MAX_BODY_LENGTH: u32 = 32 * 1024 * 1024;

/// A single message of the memcached binary protocol, DCP dialect.
///
/// The 24-byte header is followed by `extras ‖ key ‖ value`. Requests carry a
/// vbucket id where responses carry a status code; both live in the same
/// header slot and are exposed through `vbucket()` and `status()`.
#[derive(Debug, Clone, PartialEq)]
pub struct Frame {
    pub magic: u8,

    pub opcode: OperationCode,

    pub data_type: u8,

    // vbucket id on requests, status code on responses.
    pub vbucket_or_status: u16,

    // Correlation id, echoed verbatim by the peer.
    pub opaque: u32,

    pub cas: u64,

    pub extras: Bytes,

    pub key: Bytes,

    pub value: Bytes,
}

impl Frame {
    pub fn request(opcode: OperationCode, vbucket: u16) -> Self {
        Self {
            magic: MAGIC_REQ,
            opcode,
            data_type: 0,
            vbucket_or_status: vbucket,
            opaque: 0,
            cas: 0,
            extras: Bytes::new(),
            key: Bytes::new(),
            value: Bytes::new(),
        }
    }

    pub fn response(opcode: OperationCode, status: Status, opaque: u32) -> Self {
        Self {
            magic: MAGIC_RES,
            opcode,
            data_type: 0,
            vbucket_or_status: status.into(),
            opaque,
            cas: 0,
            extras: Bytes::new(),
            key: Bytes::new(),
            value: Bytes::new(),
        }
    }

    pub fn is_request(&self) -> bool {
        self.magic == MAGIC_REQ
    }

    pub fn is_response(&self) -> bool {
        self.magic == MAGIC_RES
    }

    /// Partition id this request addresses. Meaningless on responses.
    pub fn vbucket(&self) -> u16 {
        self.vbucket_or_status
    }

    /// Status code of a response. Meaningless on requests.
    pub fn status(&self) -> Status {
        Status::try_from(self.vbucket_or_status).unwrap_or(Status::Unknown)
    }

    pub fn body_len(&self) -> usize {
        self.extras.len() + self.key.len() + self.value.len()
    }

    /// Total wire size of the frame, header included.
    pub fn wire_len(&self) -> usize {
        HEADER_SIZE + self.body_len()
    }

    /// Cheap completeness and sanity scan over the buffered bytes.
    ///
    /// Advances the cursor to the end of the frame on success, so the caller
    /// can learn the frame length from the cursor position. `Incomplete` means
    /// more data is needed; the cursor must be reset before retrying.
    pub fn check(src: &mut Cursor<&[u8]>) -> Result<(), FrameError> {
        let magic = match src.read_u8() {
            Ok(m) => m,
            Err(_) => {
                trace!(
                    "Only {} bytes in buffer. Read more data to proceed",
                    src.remaining()
                );
                return Err(FrameError::Incomplete);
            }
        };

        if magic != MAGIC_REQ && magic != MAGIC_RES {
            warn!("Illegal magic code: {:#04x}", magic);
            return Err(FrameError::MagicCodeMismatch { found: magic });
        }

        if src.remaining() < HEADER_SIZE - 1 {
            return Err(FrameError::Incomplete);
        }

        // opcode
        src.advance(1);

        let key_length = src.get_u16() as u32;
        let extras_length = src.get_u8() as u32;

        // data type
        src.advance(1);

        // vbucket id / status
        src.advance(2);

        let body_length = src.get_u32();

        // opaque + cas
        src.advance(12);

        if body_length > MAX_BODY_LENGTH {
            warn!(
                "Illegal body length: {}, greater than maximum allowed: {}",
                body_length, MAX_BODY_LENGTH
            );
            return Err(FrameError::TooLongFrame {
                found: body_length,
                max: MAX_BODY_LENGTH,
            });
        }

        if extras_length + key_length > body_length {
            return Err(FrameError::BadFrame(format!(
                "Extras length {} plus key length {} exceed total body length {}",
                extras_length, key_length, body_length
            )));
        }

        if src.remaining() < body_length as usize {
            trace!(
                "Incoming frame body length: {}, remaining bytes: {}",
                body_length,
                src.remaining()
            );
            return Err(FrameError::Incomplete);
        }

        src.advance(body_length as usize);
        Ok(())
    }

    /// Parse a frame out of the buffer.
    ///
    /// A prior `check` call must have verified that a complete frame is
    /// available at the cursor position.
    pub fn parse(src: &mut Cursor<&[u8]>) -> Result<Frame, FrameError> {
        let magic = src.get_u8();

        let opcode = src.get_u8();
        let opcode = OperationCode::try_from(opcode).unwrap_or(OperationCode::Unknown);

        let key_length = src.get_u16() as usize;
        let extras_length = src.get_u8() as usize;
        let data_type = src.get_u8();
        let vbucket_or_status = src.get_u16();
        let body_length = src.get_u32() as usize;
        let opaque = src.get_u32();
        let cas = src.get_u64();

        let extras = src.copy_to_bytes(extras_length);
        let key = src.copy_to_bytes(key_length);
        let value = src.copy_to_bytes(body_length - extras_length - key_length);

        Ok(Frame {
            magic,
            opcode,
            data_type,
            vbucket_or_status,
            opaque,
            cas,
            extras,
            key,
            value,
        })
    }

    pub fn encode(&self, buf: &mut BytesMut) -> Result<(), FrameError> {
        let body_length = self.body_len();
        if body_length > MAX_BODY_LENGTH as usize {
            return Err(FrameError::TooLongFrame {
                found: body_length as u32,
                max: MAX_BODY_LENGTH,
            });
        }

        buf.reserve(HEADER_SIZE + body_length);
        buf.put_u8(self.magic);
        buf.put_u8(self.opcode.into());
        buf.put_u16(self.key.len() as u16);
        buf.put_u8(self.extras.len() as u8);
        buf.put_u8(self.data_type);
        buf.put_u16(self.vbucket_or_status);
        buf.put_u32(body_length as u32);
        buf.put_u32(self.opaque);
        buf.put_u64(self.cas);
        buf.extend_from_slice(self.extras.as_ref());
        buf.extend_from_slice(self.key.as_ref());
        buf.extend_from_slice(self.value.as_ref());
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, Eq, PartialEq, Hash, TryFromPrimitive, IntoPrimitive)]
#[repr(u8)]
pub enum OperationCode {
    // 0xFF is unassigned by the protocol and stands in for opcodes we do not speak.
    Unknown = 0xFF,

    // Feature negotiation, issued right after the TCP connection is up.
    Helo = 0x1F,

    // SASL PLAIN authentication.
    SaslAuth = 0x21,

    // Retrieve the high seqno of every vbucket on the node.
    GetAllVbSeqnos = 0x48,

    // Turn the connection into a DCP producer or consumer.
    OpenConnection = 0x50,
    AddStream = 0x51,
    CloseStream = 0x52,
    StreamReq = 0x53,
    GetFailoverLog = 0x54,
    StreamEnd = 0x55,
    SnapshotMarker = 0x56,
    Mutation = 0x57,
    Deletion = 0x58,
    Expiration = 0x59,
    Flush = 0x5A,
    SetVbucketState = 0x5B,
    Noop = 0x5C,
    BufferAcknowledgement = 0x5D,
    Control = 0x5E,

    // Scope subsequent operations to one bucket.
    SelectBucket = 0x89,
}

impl Display for OperationCode {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{:?}", self)
    }
}

#[derive(Debug, Clone, Copy, Eq, PartialEq, TryFromPrimitive, IntoPrimitive)]
#[repr(u16)]
pub enum Status {
    Success = 0x00,
    KeyNotFound = 0x01,
    KeyExists = 0x02,
    NotMyVbucket = 0x07,
    NoBucket = 0x08,
    AuthError = 0x20,
    Rollback = 0x23,
    UnknownCommand = 0x81,
    OutOfMemory = 0x82,
    NotSupported = 0x83,
    Busy = 0x85,
    TmpFail = 0x86,

    // Placeholder for status codes outside the set above.
    Unknown = 0xFFFF,
}

impl Status {
    /// Whether the request may simply be replayed later.
    pub fn is_transient(&self) -> bool {
        matches!(self, Status::TmpFail | Status::Busy | Status::OutOfMemory)
    }
}

impl Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{:?}", self)
    }
}

/// Features a client may request in HELO. The server replies with the subset
/// it accepts.
#[derive(Debug, Clone, Copy, Eq, PartialEq, Hash, TryFromPrimitive, IntoPrimitive)]
#[repr(u16)]
pub enum HeloFeature {
    DataType = 0x01,
    TcpNoDelay = 0x03,
    MutationSeqno = 0x04,
    Xattr = 0x06,
    Xerror = 0x07,
    SelectBucket = 0x08,
    Snappy = 0x0A,
    Json = 0x0B,
    Collections = 0x12,
}

#[cfg(test)]
mod tests {
    use std::io::Cursor;

    use bytes::{Buf, BufMut, Bytes, BytesMut};

    use super::*;

    #[test]
    fn test_num_enum() {
        let res = OperationCode::try_from(0x57u8);
        assert_eq!(Ok(OperationCode::Mutation), res);

        let num: u8 = OperationCode::StreamReq.into();
        assert_eq!(0x53, num);

        let res = Status::try_from(0x23u16);
        assert_eq!(Ok(Status::Rollback), res);
        let num: u16 = Status::NotMyVbucket.into();
        assert_eq!(0x07, num);
    }

    #[test]
    fn test_check_incomplete() {
        let raw = [MAGIC_REQ];
        let mut rdr = Cursor::new(&raw[..]);
        let res = Frame::check(&mut rdr);
        assert_eq!(Err(FrameError::Incomplete), res);
    }

    #[test]
    fn test_check_magic_code() {
        let raw = [0x42u8, 0, 0, 0];
        let mut rdr = Cursor::new(&raw[..]);
        match Frame::check(&mut rdr) {
            Ok(_) => panic!("Should have detected the magic code mismatch"),
            Err(e) => assert_eq!(FrameError::MagicCodeMismatch { found: 0x42 }, e),
        }
    }

    #[test]
    fn test_check_max_body_length() {
        let mut buffer = BytesMut::new();
        buffer.put_u8(MAGIC_REQ);
        buffer.put_u8(OperationCode::Mutation.into());
        buffer.put_u16(0);
        buffer.put_u8(0);
        buffer.put_u8(0);
        buffer.put_u16(0);
        buffer.put_u32(MAX_BODY_LENGTH + 1);
        buffer.put_u32(0);
        buffer.put_u64(0);

        let mut cursor = Cursor::new(&buffer[..]);
        match Frame::check(&mut cursor) {
            Ok(_) => panic!("Should have detected the body length issue"),
            Err(e) => assert_eq!(
                FrameError::TooLongFrame {
                    found: MAX_BODY_LENGTH + 1,
                    max: MAX_BODY_LENGTH
                },
                e
            ),
        }
    }

    #[test]
    fn test_check_inconsistent_lengths() {
        let mut buffer = BytesMut::new();
        buffer.put_u8(MAGIC_REQ);
        buffer.put_u8(OperationCode::StreamReq.into());
        // key length exceeds body length
        buffer.put_u16(12);
        buffer.put_u8(0);
        buffer.put_u8(0);
        buffer.put_u16(0);
        buffer.put_u32(4);
        buffer.put_u32(0);
        buffer.put_u64(0);
        buffer.put_u32(0);

        let mut cursor = Cursor::new(&buffer[..]);
        match Frame::check(&mut cursor) {
            Ok(_) => panic!("Should have detected the length inconsistency"),
            Err(e) => assert!(matches!(e, FrameError::BadFrame { .. })),
        }
    }

    #[test]
    fn test_encode_header() {
        let mut frame = Frame::request(OperationCode::StreamReq, 7);
        frame.opaque = 42;
        frame.key = Bytes::from_static(b"abc");

        let mut buf = BytesMut::new();
        frame.encode(&mut buf).unwrap();
        let mut buf = buf.freeze();

        assert_eq!(MAGIC_REQ, buf.get_u8());
        assert_eq!(0x53, buf.get_u8());
        assert_eq!(3, buf.get_u16());
        assert_eq!(0, buf.get_u8());
        assert_eq!(0, buf.get_u8());
        assert_eq!(7, buf.get_u16());
        assert_eq!(3, buf.get_u32());
        assert_eq!(42, buf.get_u32());
        assert_eq!(0, buf.get_u64());

        let key = buf.copy_to_bytes(3);
        assert_eq!(b"abc", key.as_ref());
        assert_eq!(0, buf.remaining());
    }

    #[test]
    fn test_check_and_parse() {
        let mut frame = Frame::request(OperationCode::Mutation, 3);
        frame.opaque = 9;
        frame.cas = 0xDEADBEEF;
        frame.extras = Bytes::from_static(&[1, 2, 3, 4]);
        frame.key = Bytes::from_static(b"key");
        frame.value = Bytes::from_static(b"value");

        let mut buf = BytesMut::new();
        frame.encode(&mut buf).unwrap();
        // Trailing bytes of the next frame must be left alone.
        buf.put_slice(b"garbage");
        let buf = buf.freeze();

        let mut cursor = Cursor::new(&buf[..]);
        assert_eq!(Ok(()), Frame::check(&mut cursor));
        assert_eq!(HEADER_SIZE + 12, cursor.position() as usize);

        cursor.set_position(0);
        let decoded = Frame::parse(&mut cursor).unwrap();
        assert_eq!(frame, decoded);
        assert_eq!(3, decoded.vbucket());
    }

    #[test]
    fn test_response_status() {
        let frame = Frame::response(OperationCode::StreamReq, Status::Rollback, 1);
        assert!(frame.is_response());
        assert_eq!(Status::Rollback, frame.status());

        let mut raw = Frame::response(OperationCode::StreamReq, Status::Success, 1);
        raw.vbucket_or_status = 0x7777;
        assert_eq!(Status::Unknown, raw.status());
    }
}
