use crate::frame::frame_errors::ParseError;
use crate::frame::types;

/// AUTHENTICATE - the server demands authentication and names the
/// authenticator class it expects the client to satisfy.
#[derive(Debug)]
pub struct Authenticate {
    pub authenticator_name: String,
}

impl Authenticate {
    pub fn deserialize(buf: &mut &[u8]) -> Result<Self, ParseError> {
        let authenticator_name = types::read_string(buf)?.to_string();

        Ok(Authenticate { authenticator_name })
    }
}

/// AUTH_SUCCESS - authentication completed, with an optional final token.
#[derive(Debug)]
pub struct AuthSuccess {
    pub success_message: Option<Vec<u8>>,
}

impl AuthSuccess {
    pub fn deserialize(buf: &mut &[u8]) -> Result<Self, ParseError> {
        let success_message = types::read_bytes_opt(buf)?.map(ToOwned::to_owned);

        Ok(AuthSuccess { success_message })
    }
}

/// AUTH_CHALLENGE - a server challenge the client must answer with
/// AUTH_RESPONSE.
#[derive(Debug)]
pub struct AuthChallenge {
    pub authenticate_message: Option<Vec<u8>>,
}

impl AuthChallenge {
    pub fn deserialize(buf: &mut &[u8]) -> Result<Self, ParseError> {
        let authenticate_message = types::read_bytes_opt(buf)?.map(ToOwned::to_owned);

        Ok(AuthChallenge {
            authenticate_message,
        })
    }
}
