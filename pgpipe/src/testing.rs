//! Scripted in-memory backend for unit tests.
use std::{future::poll_fn, pin::Pin, time::Duration};
use bytes::{Buf, BufMut, Bytes, BytesMut};
use futures_core::Stream;
use tokio::io::{AsyncReadExt, AsyncWriteExt, DuplexStream};

use crate::{Config, Connection, postgres::{DatabaseError, Oid}};

pub const DUPLEX_SIZE: usize = 64 * 1024;

const IDLE_WAIT: Duration = Duration::from_millis(50);

pub fn config() -> Config {
    Config::parse_static("postgres://u:p@localhost:5432/db").unwrap()
}

/// Handle that is never connected.
pub fn detached() -> Connection {
    Connection::detached()
}

pub fn database_error(code: &str, message: &str) -> DatabaseError {
    DatabaseError::decode(Bytes::from(msg::error_fields(code, message))).unwrap()
}

/// Connect to a fresh backend, startup is already completed.
pub async fn connect(config: Config) -> (Connection, Backend) {
    let (client, server) = tokio::io::duplex(DUPLEX_SIZE);
    let mut backend = Backend::new(server);
    let (conn, ()) = tokio::join!(
        Connection::connect_stream(client, config),
        backend.accept(),
    );
    (conn.unwrap(), backend)
}

pub async fn next<S: Stream + Unpin>(stream: &mut S) -> Option<S::Item> {
    poll_fn(|cx|Pin::new(&mut *stream).poll_next(cx)).await
}

/// Returns the tag of every frame in `buf`.
pub fn frame_tags(mut buf: &[u8]) -> Vec<u8> {
    let mut tags = vec![];
    while !buf.is_empty() {
        let tag = buf.get_u8();
        let len = buf.get_u32() as usize;
        buf.advance(len - 4);
        tags.push(tag);
    }
    tags
}

/// Server side of the connection.
pub struct Backend {
    stream: DuplexStream,
    buf: BytesMut,
}

impl Backend {
    pub fn new(stream: DuplexStream) -> Backend {
        Self { stream, buf: BytesMut::new() }
    }

    async fn fill(&mut self, len: usize) -> bool {
        while self.buf.len() < len {
            if self.stream.read_buf(&mut self.buf).await.unwrap() == 0 {
                return false;
            }
        }
        true
    }

    /// Read the untagged startup frame.
    pub async fn startup(&mut self) -> Vec<u8> {
        assert!(self.fill(4).await, "eof before startup");
        let len = (&self.buf[..4]).get_u32() as usize;
        assert!(self.fill(len).await, "eof in startup");
        let mut frame = self.buf.split_to(len);
        frame.advance(4);
        assert_eq!(frame.get_u32(), 196608, "protocol version 3.0");
        frame.to_vec()
    }

    /// Complete the startup without authentication.
    pub async fn accept(&mut self) {
        self.startup().await;
        self.send(&[
            msg::auth_ok(),
            msg::parameter_status("server_version", "16.0"),
            msg::backend_key(42, 7),
            msg::ready(b'I'),
        ]).await;
    }

    /// Read next frame, [`None`] on end of stream.
    pub async fn recv(&mut self) -> Option<(u8, Vec<u8>)> {
        if !self.fill(5).await {
            return None;
        }
        let len = (&self.buf[1..5]).get_u32() as usize;
        if !self.fill(1 + len).await {
            return None;
        }
        let mut frame = self.buf.split_to(1 + len);
        let tag = frame.get_u8();
        frame.advance(4);
        Some((tag, frame.to_vec()))
    }

    /// Read next frame and assert its tag, returns the body.
    pub async fn expect(&mut self, tag: u8) -> Vec<u8> {
        match self.recv().await {
            Some((found, body)) => {
                assert_eq!(found as char, tag as char, "unexpected frontend message");
                body
            }
            None => panic!("expected {:?}, found eof", tag as char),
        }
    }

    /// Assert that nothing is sent for a while, end of stream counts as idle.
    pub async fn assert_idle(&mut self) {
        assert!(self.buf.is_empty(), "unread frontend message {:?}", self.buf[0] as char);
        match tokio::time::timeout(IDLE_WAIT, self.stream.read_buf(&mut self.buf)).await {
            Err(_) | Ok(Ok(0)) => { }
            Ok(Ok(_)) => panic!("unexpected frontend message {:?}", self.buf[0] as char),
            Ok(Err(err)) => panic!("{err}"),
        }
    }

    pub async fn send(&mut self, frames: &[Vec<u8>]) {
        for frame in frames {
            self.stream.write_all(frame).await.unwrap();
        }
        self.stream.flush().await.unwrap();
    }
}

/// Backend message builders.
pub mod msg {
    use super::*;

    fn frame(tag: u8, body: impl FnOnce(&mut Vec<u8>)) -> Vec<u8> {
        let mut buf = vec![tag, 0, 0, 0, 0];
        body(&mut buf);
        let len = (buf.len() - 1) as u32;
        buf[1..5].copy_from_slice(&len.to_be_bytes());
        buf
    }

    fn put_nul(buf: &mut Vec<u8>, value: &str) {
        buf.put_slice(value.as_bytes());
        buf.put_u8(0);
    }

    pub fn auth_ok() -> Vec<u8> {
        frame(b'R', |b|b.put_u32(0))
    }

    pub fn auth_cleartext() -> Vec<u8> {
        frame(b'R', |b|b.put_u32(3))
    }

    pub fn auth_md5(salt: [u8; 4]) -> Vec<u8> {
        frame(b'R', |b|{
            b.put_u32(5);
            b.put_slice(&salt);
        })
    }

    pub fn auth_sasl() -> Vec<u8> {
        frame(b'R', |b|{
            b.put_u32(10);
            put_nul(b, "SCRAM-SHA-256");
            b.put_u8(0);
        })
    }

    pub fn backend_key(process_id: u32, secret_key: u32) -> Vec<u8> {
        frame(b'K', |b|{
            b.put_u32(process_id);
            b.put_u32(secret_key);
        })
    }

    pub fn parameter_status(name: &str, value: &str) -> Vec<u8> {
        frame(b'S', |b|{
            put_nul(b, name);
            put_nul(b, value);
        })
    }

    pub fn ready(status: u8) -> Vec<u8> {
        frame(b'Z', |b|b.put_u8(status))
    }

    pub fn command_complete(tag: &str) -> Vec<u8> {
        frame(b'C', |b|put_nul(b, tag))
    }

    pub fn empty_query() -> Vec<u8> {
        frame(b'I', |_|{})
    }

    pub fn parse_complete() -> Vec<u8> {
        frame(b'1', |_|{})
    }

    pub fn bind_complete() -> Vec<u8> {
        frame(b'2', |_|{})
    }

    pub fn close_complete() -> Vec<u8> {
        frame(b'3', |_|{})
    }

    pub fn no_data() -> Vec<u8> {
        frame(b'n', |_|{})
    }

    pub fn portal_suspended() -> Vec<u8> {
        frame(b's', |_|{})
    }

    pub fn parameter_description(oids: &[Oid]) -> Vec<u8> {
        frame(b't', |b|{
            b.put_u16(oids.len() as u16);
            oids.iter().for_each(|&oid|b.put_u32(oid));
        })
    }

    /// Columns of the given names and types, in text format.
    pub fn row_description(columns: &[(&str, Oid)]) -> Vec<u8> {
        frame(b'T', |b|{
            b.put_u16(columns.len() as u16);
            for &(name, oid) in columns {
                put_nul(b, name);
                b.put_u32(0);
                b.put_i16(0);
                b.put_u32(oid);
                b.put_i16(-1);
                b.put_i32(-1);
                b.put_u16(0);
            }
        })
    }

    pub fn data_row<B: AsRef<[u8]>>(values: &[Option<B>]) -> Vec<u8> {
        frame(b'D', |b|{
            b.put_u16(values.len() as u16);
            for value in values {
                match value {
                    Some(value) => {
                        b.put_i32(value.as_ref().len() as i32);
                        b.put_slice(value.as_ref());
                    }
                    None => b.put_i32(-1),
                }
            }
        })
    }

    pub(super) fn error_fields(code: &str, message: &str) -> Vec<u8> {
        let mut b = vec![];
        for (field, value) in [(b'S', "ERROR"), (b'V', "ERROR"), (b'C', code), (b'M', message)] {
            b.put_u8(field);
            put_nul(&mut b, value);
        }
        b.put_u8(0);
        b
    }

    pub fn error(code: &str, message: &str) -> Vec<u8> {
        frame(b'E', |b|b.put_slice(&error_fields(code, message)))
    }

    pub fn notice(message: &str) -> Vec<u8> {
        frame(b'N', |b|b.put_slice(&error_fields("01000", message)))
    }

    pub fn notification(process_id: u32, channel: &str, payload: &str) -> Vec<u8> {
        frame(b'A', |b|{
            b.put_u32(process_id);
            put_nul(b, channel);
            put_nul(b, payload);
        })
    }
}
