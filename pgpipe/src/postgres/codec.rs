//! Splitting the incoming byte stream into backend messages.
use bytes::{Buf, BytesMut};

use super::{BackendMessage, BackendProtocol, ProtocolError};
use crate::common::verbose;

/// msgtype + length
pub const HEADER_LEN: usize = 1 + 4;

/// Largest message accepted from the backend.
///
/// Postgres itself refuse to send a single value larger than 1GB.
pub const MAX_MESSAGE_LEN: usize = 1024 * 1024 * 1024;

/// Try to decode exactly one backend message from the front of `buf`.
///
/// Returns `Ok(None)` when `buf` does not yet contain a complete message, in which
/// case `buf` is left untouched and more bytes should be appended to it.
///
/// On success, `buf` is advanced exactly past the message boundary, regardless
/// of how much of the body the message decoder actually consumed.
pub fn decode(buf: &mut BytesMut) -> Result<Option<BackendMessage>, ProtocolError> {
    let Some(mut header) = buf.get(..HEADER_LEN) else {
        return Ok(None);
    };

    let msgtype = header.get_u8();
    let len = header.get_u32();

    if len < 4 || len as usize > MAX_MESSAGE_LEN {
        return Err(ProtocolError::Length { msgtype, len });
    }

    let frame_len = 1 + len as usize;
    if buf.len() < frame_len {
        buf.reserve(frame_len - buf.len());
        return Ok(None);
    }

    let mut frame = buf.split_to(frame_len).freeze();
    frame.advance(HEADER_LEN);

    verbose!("(B) {} [{len}]", BackendMessage::message_name(msgtype));

    BackendMessage::decode(msgtype, frame).map(Some)
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::postgres::backend::TransactionStatus;

    const READY: &[u8] = b"Z\0\0\0\x05I";
    const COMPLETE: &[u8] = b"C\0\0\0\x0dSELECT 1\0";

    #[test]
    fn partial_header_is_retained() {
        let mut buf = BytesMut::from(&READY[..4]);
        assert!(decode(&mut buf).unwrap().is_none());
        assert_eq!(&buf[..], &READY[..4]);
    }

    #[test]
    fn partial_body_is_retained() {
        let mut buf = BytesMut::from(&COMPLETE[..8]);
        assert!(decode(&mut buf).unwrap().is_none());
        assert_eq!(buf.len(), 8);

        buf.extend_from_slice(&COMPLETE[8..]);
        let Some(BackendMessage::CommandComplete(cmd)) = decode(&mut buf).unwrap() else {
            panic!("expected CommandComplete")
        };
        assert_eq!(cmd.tag, "SELECT 1");
        assert!(buf.is_empty());
    }

    #[test]
    fn concatenated_frames_yield_one_message_each() {
        let mut buf = BytesMut::new();
        buf.extend_from_slice(COMPLETE);
        buf.extend_from_slice(READY);
        buf.extend_from_slice(&READY[..2]);

        assert!(matches!(decode(&mut buf), Ok(Some(BackendMessage::CommandComplete(_)))));
        let Ok(Some(BackendMessage::ReadyForQuery(ready))) = decode(&mut buf) else {
            panic!("expected ReadyForQuery")
        };
        assert_eq!(ready.status, TransactionStatus::Idle);
        assert!(decode(&mut buf).unwrap().is_none());
        assert_eq!(&buf[..], &READY[..2]);
    }

    #[test]
    fn under_read_body_is_skipped() {
        // ParameterStatus with trailing garbage after both strings
        let mut buf = BytesMut::from(&b"S\0\0\0\x0fa\0b\0garbage"[..]);
        buf.extend_from_slice(READY);
        assert!(matches!(decode(&mut buf), Ok(Some(BackendMessage::ParameterStatus(_)))));
        assert!(matches!(decode(&mut buf), Ok(Some(BackendMessage::ReadyForQuery(_)))));
        assert!(buf.is_empty());
    }

    #[test]
    fn invalid_length_is_fatal() {
        let mut buf = BytesMut::from(&b"Z\0\0\0\x02I"[..]);
        assert!(decode(&mut buf).is_err());
    }
}
