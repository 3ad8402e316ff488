use bitflags::bitflags;
use bytes::{Buf, BufMut, Bytes, BytesMut};
use serde::{Deserialize, Serialize};

use crate::error::{Error, ErrorKind, Result};

pub(crate) const MAGIC_NUM: u32 = u32::from_be_bytes(*b"TWIN");
pub(crate) const MAX_MSG_SIZE: usize = 64 << 20;

const U32_SIZE: usize = std::mem::size_of::<u32>();
const HEADER_SIZE: usize = std::mem::size_of::<u64>();

/// Message flags.
///
/// Exactly one of `IsReq`, `IsRsp` and `IsHello` is set on a valid message;
/// the rest qualify it.
#[derive(Deserialize, Serialize, Debug, Default, PartialEq, Eq, Clone, Copy)]
#[repr(transparent)]
#[serde(transparent)]
pub struct MsgFlags(u8);

bitflags! {
    impl MsgFlags: u8 {
        /// Message is a request.
        const IsReq = 1;
        /// Message is a response.
        const IsRsp = 2;
        /// Meta and payload values are MessagePack rather than JSON.
        const UseMessagePack = 4;
        /// Request expects no response.
        const OneWay = 8;
        /// Response payload is a serialized error.
        const IsErr = 16;
        /// Connection handshake carrying the client identifier.
        const IsHello = 32;
    }
}

/// Routing and correlation data serialized ahead of every payload.
#[derive(Deserialize, Serialize, Debug, Default, PartialEq, Eq, Clone)]
pub struct MsgMeta {
    #[serde(default)]
    pub service: String,
    #[serde(default)]
    pub method: String,
    pub flags: MsgFlags,
    pub txid: u64,
}

impl MsgMeta {
    #[must_use]
    pub fn is_req(&self) -> bool {
        self.flags.contains(MsgFlags::IsReq)
    }

    #[must_use]
    pub fn is_rsp(&self) -> bool {
        self.flags.contains(MsgFlags::IsRsp)
    }

    #[must_use]
    pub fn is_hello(&self) -> bool {
        self.flags.contains(MsgFlags::IsHello)
    }
}

/// A decoded message body.
///
/// On the wire every message is framed as:
///
/// ```text
/// | 4 bytes | 4 bytes  | 4 bytes  | N bytes  | M bytes |
/// | "TWIN"  | body_len | meta_len | metadata | payload |
/// ```
///
/// `body_len` counts everything after itself. The metadata is JSON when it
/// starts with `{` and MessagePack otherwise.
#[derive(Debug, Default, Clone)]
pub struct Message {
    pub meta: MsgMeta,
    pub payload: Bytes,
}

impl Message {
    pub fn new(meta: MsgMeta, payload: Bytes) -> Self {
        Self { meta, payload }
    }

    /// Parses a message body, i.e. a frame without its 8-byte header.
    ///
    /// # Errors
    ///
    /// Returns `ParseFailed` when the meta length is out of bounds, or a
    /// deserialize error when the metadata is malformed.
    pub fn parse(mut body: Bytes) -> Result<Self> {
        let len = body.len();
        if len < U32_SIZE {
            return Err(Error::new(
                ErrorKind::ParseFailed,
                format!("invalid msg length: {len}"),
            ));
        }

        let meta_len = body.get_u32() as usize;
        if meta_len == 0 || meta_len > body.len() {
            return Err(Error::new(
                ErrorKind::ParseFailed,
                format!("invalid meta length: {meta_len}, msg length: {len}"),
            ));
        }

        let raw_meta = body.split_to(meta_len);
        let meta: MsgMeta = if raw_meta[0] == b'{' {
            serde_json::from_slice(&raw_meta)?
        } else {
            rmp_serde::from_slice(&raw_meta)?
        };

        Ok(Message {
            meta,
            payload: body,
        })
    }

    /// Serializes the complete frame, header included.
    ///
    /// # Errors
    ///
    /// Fails when the metadata cannot be serialized or the frame would exceed
    /// the maximum message size.
    pub fn encode(&self) -> Result<Bytes> {
        let meta = if self.meta.flags.contains(MsgFlags::UseMessagePack) {
            rmp_serde::to_vec_named(&self.meta)?
        } else {
            serde_json::to_vec(&self.meta)
                .map_err(|e| Error::new(ErrorKind::SerializeFailed, e.to_string()))?
        };

        let body_len = U32_SIZE + meta.len() + self.payload.len();
        if HEADER_SIZE + body_len >= MAX_MSG_SIZE {
            return Err(Error::new(
                ErrorKind::SerializeFailed,
                format!("msg is too long: {body_len}"),
            ));
        }

        let mut bytes = BytesMut::with_capacity(HEADER_SIZE + body_len);
        bytes.put_u32(MAGIC_NUM);
        bytes.put_u32(u32::try_from(body_len)?);
        bytes.put_u32(u32::try_from(meta.len())?);
        bytes.put_slice(&meta);
        bytes.put_slice(&self.payload);
        Ok(bytes.freeze())
    }
}

/// Splits one complete message body off the front of `buffer`.
///
/// Returns `Ok(None)` while the buffer holds only part of a frame.
///
/// # Errors
///
/// Returns `ParseFailed` on a bad magic number or an oversized frame; the
/// stream cannot be resynchronized after that.
pub(crate) fn parse_frame(buffer: &mut BytesMut) -> Result<Option<Bytes>> {
    if buffer.len() < HEADER_SIZE {
        return Ok(None);
    }
    let mut header = &buffer[..HEADER_SIZE];
    let magic_num = header.get_u32();
    if magic_num != MAGIC_NUM {
        return Err(Error::new(
            ErrorKind::ParseFailed,
            format!("invalid magic num: {magic_num:08X}"),
        ));
    }

    let len = header.get_u32() as usize;
    if HEADER_SIZE + len >= MAX_MSG_SIZE {
        return Err(Error::new(
            ErrorKind::ParseFailed,
            format!("msg is too long: {len}"),
        ));
    }

    if buffer.len() < HEADER_SIZE + len {
        Ok(None)
    } else {
        buffer.advance(HEADER_SIZE);
        Ok(Some(buffer.split_to(len).freeze()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample(flags: MsgFlags) -> Message {
        Message::new(
            MsgMeta {
                service: "Calculator".into(),
                method: "add(i64,i64)".into(),
                flags,
                txid: 42,
            },
            Bytes::from_static(b"payload"),
        )
    }

    #[test]
    fn test_frame_parse() {
        for flags in [MsgFlags::IsReq, MsgFlags::IsReq | MsgFlags::UseMessagePack] {
            let frame = sample(flags).encode().unwrap();

            // split delivery: nothing until the last byte arrives.
            let mut buffer = BytesMut::new();
            buffer.extend_from_slice(&frame[..frame.len() - 1]);
            assert!(parse_frame(&mut buffer).unwrap().is_none());
            buffer.extend_from_slice(&frame[frame.len() - 1..]);
            buffer.extend_from_slice(b"TW");

            let body = parse_frame(&mut buffer).unwrap().unwrap();
            assert_eq!(&buffer[..], b"TW");

            let msg = Message::parse(body).unwrap();
            assert_eq!(msg.meta, sample(flags).meta);
            assert_eq!(&msg.payload[..], b"payload");
        }
    }

    #[test]
    fn test_invalid_frame() {
        let mut buffer = BytesMut::from(&b"RUA!\0\0\0\x04abcd"[..]);
        let err = parse_frame(&mut buffer).unwrap_err();
        assert_eq!(err.kind, ErrorKind::ParseFailed);

        let mut buffer = BytesMut::new();
        buffer.put_u32(MAGIC_NUM);
        buffer.put_u32(u32::MAX);
        let err = parse_frame(&mut buffer).unwrap_err();
        assert_eq!(err.kind, ErrorKind::ParseFailed);

        let err = Message::parse(Bytes::from_static(b"\0\0\0\x09{}")).unwrap_err();
        assert_eq!(err.kind, ErrorKind::ParseFailed);
    }
}
