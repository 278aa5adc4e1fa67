//! Connection initialization and authentication.
//!
//! <https://www.postgresql.org/docs/current/protocol-flow.html#PROTOCOL-FLOW-START-UP>
use bytes::BytesMut;
use md5::{Digest, Md5};

use super::{Config, command::Context, pending::Reply};
use crate::{
    Result,
    common::{ByteStr, verbose},
    error::UnsupportedAuth,
    postgres::{BackendMessage, ProtocolError, backend::Authentication, frontend},
};

/// Startup command, it is always the first command of a connection.
///
/// Any error while initializing is fatal to the connection.
pub(crate) struct Init {
    user: ByteStr,
    pass: ByteStr,
    dbname: ByteStr,
    application_name: Option<ByteStr>,
    reply: Reply<()>,
}

impl Init {
    pub(crate) fn new(config: &Config, reply: Reply<()>) -> Init {
        Self {
            user: config.user.clone(),
            pass: config.pass.clone(),
            dbname: config.dbname.clone(),
            application_name: config.application_name.clone(),
            reply,
        }
    }

    pub(super) fn encode(&self, buf: &mut BytesMut) {
        frontend::Startup {
            user: &self.user,
            database: Some(&self.dbname),
            application_name: self.application_name.as_deref(),
        }.write(buf);
    }

    pub(super) fn handle(&mut self, msg: BackendMessage, cx: &mut Context) -> Result<()> {
        match msg {
            BackendMessage::Authentication(auth) => self.authenticate(auth, cx.buf)?,
            BackendMessage::BackendKeyData(key) => cx.shared.set_backend_key(key),
            BackendMessage::NegotiateProtocolVersion(_) => { }
            BackendMessage::ErrorResponse(err) => return Err(err.error.into()),
            msg => return Err(ProtocolError::unexpected_phase(msg.msgtype(), "Init").into()),
        }
        Ok(())
    }

    fn authenticate(&self, auth: Authentication, buf: &mut BytesMut) -> Result<()> {
        verbose!("authentication: {}", auth.method_name());
        match auth {
            Authentication::Ok => { }
            Authentication::CleartextPassword => {
                frontend::write(frontend::PasswordMessage { password: &self.pass }, buf);
            }
            Authentication::MD5Password { salt } => {
                let password = md5_password(&self.user, &self.pass, salt);
                frontend::write(frontend::PasswordMessage { password: &password }, buf);
            }
            auth => return Err(UnsupportedAuth { method: auth.method_name() }.into()),
        }
        Ok(())
    }

    pub(super) fn complete(self) {
        self.reply.send(Ok(()));
    }

    pub(super) fn fail(self, err: crate::Error) {
        self.reply.send(Err(err));
    }
}

/// `"md5" + hex(md5(hex(md5(password + user)) + salt))`
fn md5_password(user: &str, pass: &str, salt: [u8; 4]) -> String {
    let mut md5 = Md5::new();
    md5.update(pass.as_bytes());
    md5.update(user.as_bytes());
    let inner = format!("{:x}", md5.finalize());

    let mut md5 = Md5::new();
    md5.update(inner.as_bytes());
    md5.update(salt);
    format!("md5{:x}", md5.finalize())
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn md5_password_format() {
        let password = md5_password("postgres", "secret", [1, 2, 3, 4]);
        assert_eq!(password.len(), 35);
        assert!(password.starts_with("md5"));
        assert!(password[3..].bytes().all(|b|b.is_ascii_hexdigit()));
        assert_ne!(password, md5_password("postgres", "secret", [4, 3, 2, 1]));
    }
}
