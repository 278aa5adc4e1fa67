//! SSL upgrade step.
//!
//! No tls library is bundled, provide a [`TlsConnector`] to
//! [`Config::set_tls_connector`][super::Config::set_tls_connector] to upgrade
//! the socket.
use std::{future::Future, io, pin::Pin};

use bytes::BytesMut;
use tokio::io::{AsyncReadExt, AsyncWriteExt};

use super::{Config, SslMode};
use crate::{
    Result,
    common::verbose,
    net::Socket,
    postgres::{ProtocolError, frontend::SslRequest},
};

/// Future returned by [`TlsConnector::upgrade`].
pub type UpgradeFuture = Pin<Box<dyn Future<Output = io::Result<Socket>> + Send>>;

/// Upgrade a plain socket into an encrypted one.
pub trait TlsConnector: Send + Sync + 'static {
    /// Perform the tls handshake over `socket` for server `host`.
    ///
    /// Use [`Socket::from_stream`] to wrap the resulting stream.
    fn upgrade(&self, socket: Socket, host: &str) -> UpgradeFuture;
}

/// Negotiate ssl before the startup message, the upgrade is invoked at most once.
pub(crate) async fn negotiate(mut socket: Socket, config: &Config) -> Result<Socket> {
    let tls = match (config.ssl, config.tls.as_ref()) {
        (SslMode::Disable, _) => return Ok(socket),
        (SslMode::Prefer, None) => return Ok(socket),
        (SslMode::Require, None) => {
            return Err(io::Error::new(io::ErrorKind::Unsupported, "ssl required but no tls connector configured").into())
        }
        (_, Some(tls)) => tls.clone(),
    };

    let mut buf = BytesMut::with_capacity(8);
    SslRequest.write(&mut buf);
    socket.write_all(&buf).await?;
    socket.flush().await?;

    match socket.read_u8().await? {
        b'S' => {
            verbose!("ssl accepted, upgrading");
            Ok(tls.upgrade(socket, &config.host).await?)
        }
        b'N' if config.ssl == SslMode::Prefer => {
            verbose!("ssl refused, continue in plain text");
            Ok(socket)
        }
        b'N' => Err(io::Error::new(io::ErrorKind::ConnectionRefused, "server does not support ssl").into()),
        found => Err(ProtocolError::unexpected(b'S', found).into()),
    }
}

#[cfg(test)]
mod test {
    use std::sync::{Arc, atomic::{AtomicUsize, Ordering}};
    use tokio::io::AsyncReadExt;

    use super::*;

    struct Counting(Arc<AtomicUsize>);

    impl TlsConnector for Counting {
        fn upgrade(&self, socket: Socket, _: &str) -> UpgradeFuture {
            self.0.fetch_add(1, Ordering::SeqCst);
            Box::pin(async move { Ok(socket) })
        }
    }

    fn config(ssl: SslMode, upgrades: &Arc<AtomicUsize>) -> Config {
        let mut config = Config::parse_static("postgres://u:p@localhost:5432/db").unwrap();
        config.set_ssl(ssl).set_tls_connector(Counting(upgrades.clone()));
        config
    }

    #[tokio::test]
    async fn accepted_upgrades_once() {
        let upgrades = Arc::new(AtomicUsize::new(0));
        let (client, mut server) = tokio::io::duplex(64);
        let config = config(SslMode::Require, &upgrades);

        let backend = tokio::spawn(async move {
            let mut request = [0u8; 8];
            server.read_exact(&mut request).await.unwrap();
            server.write_all(b"S").await.unwrap();
            request
        });

        negotiate(Socket::from_stream(client), &config).await.unwrap();
        assert_eq!(backend.await.unwrap(), [0, 0, 0, 8, 0x04, 0xd2, 0x16, 0x2f]);
        assert_eq!(upgrades.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn refused() {
        let upgrades = Arc::new(AtomicUsize::new(0));

        for (mode, ok) in [(SslMode::Prefer, true), (SslMode::Require, false)] {
            let (client, mut server) = tokio::io::duplex(64);
            tokio::spawn(async move {
                let mut request = [0u8; 8];
                server.read_exact(&mut request).await.unwrap();
                server.write_all(b"N").await.unwrap();
                server
            });
            let result = negotiate(Socket::from_stream(client), &config(mode, &upgrades)).await;
            assert_eq!(result.is_ok(), ok);
        }

        assert_eq!(upgrades.load(Ordering::SeqCst), 0);
    }
}
