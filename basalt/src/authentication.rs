//! SASL authentication plug-point, used during the connection handshake
//! when the server answers STARTUP with AUTHENTICATE.

use async_trait::async_trait;
use bytes::{BufMut, BytesMut};

/// An authentication error message.
pub type AuthError = String;

/// Handles the challenge/response exchange of a single connection.
#[async_trait]
pub trait AuthenticatorSession: Send + Sync {
    /// Answers an authentication challenge sent by the server. The token
    /// is authentication-protocol specific and may be empty.
    async fn evaluate_challenge(
        &mut self,
        token: Option<&[u8]>,
    ) -> Result<Option<Vec<u8>>, AuthError>;

    /// Handles the final AUTH_SUCCESS token.
    async fn success(&mut self, token: Option<&[u8]>) -> Result<(), AuthError>;
}

/// A factory of [AuthenticatorSession]s; one session is created per
/// connection.
#[async_trait]
pub trait AuthenticatorProvider: Sync + Send {
    /// Returns the initial AUTH_RESPONSE token and the session that will
    /// handle the rest of the exchange.
    async fn start_authentication_session(
        &self,
        authenticator_name: &str,
    ) -> Result<(Option<Vec<u8>>, Box<dyn AuthenticatorSession>), AuthError>;
}

struct PlainTextAuthenticatorSession;

#[async_trait]
impl AuthenticatorSession for PlainTextAuthenticatorSession {
    async fn evaluate_challenge(
        &mut self,
        _token: Option<&[u8]>,
    ) -> Result<Option<Vec<u8>>, AuthError> {
        Err("Challenges are not expected during PlainTextAuthentication".to_string())
    }

    async fn success(&mut self, _token: Option<&[u8]>) -> Result<(), AuthError> {
        Ok(())
    }
}

/// Username/password authentication in the SASL PLAIN format.
pub struct PlainTextAuthenticator {
    username: String,
    password: String,
}

impl PlainTextAuthenticator {
    pub fn new(username: String, password: String) -> Self {
        PlainTextAuthenticator { username, password }
    }
}

#[async_trait]
impl AuthenticatorProvider for PlainTextAuthenticator {
    async fn start_authentication_session(
        &self,
        _authenticator_name: &str,
    ) -> Result<(Option<Vec<u8>>, Box<dyn AuthenticatorSession>), AuthError> {
        let mut response = BytesMut::new();

        response.put_u8(0);
        response.put_slice(self.username.as_bytes());
        response.put_u8(0);
        response.put_slice(self.password.as_bytes());

        Ok((
            Some(response.to_vec()),
            Box::new(PlainTextAuthenticatorSession),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn plain_text_initial_response() {
        let authenticator = PlainTextAuthenticator::new("cassandra".into(), "secret".into());
        let (response, _session) = authenticator
            .start_authentication_session("org.apache.cassandra.auth.PasswordAuthenticator")
            .await
            .unwrap();

        assert_eq!(response.unwrap(), b"\x00cassandra\x00secret".to_vec());
    }
}
