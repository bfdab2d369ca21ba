//! Responses as seen by the request executor and the caller.

pub mod query_result;

use std::collections::HashMap;

use uuid::Uuid;

use crate::errors::RequestAttemptError;
use basalt_cql::frame::response::{result, Response};

pub use query_result::QueryResult;

/// A deserialized response together with the frame extensions that came
/// with it.
#[derive(Debug)]
pub(crate) struct QueryResponse {
    pub(crate) response: Response,
    pub(crate) tracing_id: Option<Uuid>,
    pub(crate) warnings: Vec<String>,
    #[allow(dead_code)] // carried for completeness; no consumer yet
    pub(crate) custom_payload: Option<HashMap<String, Vec<u8>>>,
}

/// Like [Response], but cannot be ERROR.
#[derive(Debug)]
pub(crate) enum NonErrorResponse {
    Ready,
    Result(result::Result),
    Authenticate(basalt_cql::frame::response::authenticate::Authenticate),
    AuthSuccess(basalt_cql::frame::response::authenticate::AuthSuccess),
    AuthChallenge(basalt_cql::frame::response::authenticate::AuthChallenge),
    Supported(basalt_cql::frame::response::Supported),
    Event(basalt_cql::frame::response::event::Event),
}

impl NonErrorResponse {
    pub(crate) fn to_response_kind(&self) -> &'static str {
        match self {
            NonErrorResponse::Ready => "READY",
            NonErrorResponse::Result(_) => "RESULT",
            NonErrorResponse::Authenticate(_) => "AUTHENTICATE",
            NonErrorResponse::AuthSuccess(_) => "AUTH_SUCCESS",
            NonErrorResponse::AuthChallenge(_) => "AUTH_CHALLENGE",
            NonErrorResponse::Supported(_) => "SUPPORTED",
            NonErrorResponse::Event(_) => "EVENT",
        }
    }
}

/// [QueryResponse] that is known not to be an ERROR.
#[derive(Debug)]
pub(crate) struct NonErrorQueryResponse {
    pub(crate) response: NonErrorResponse,
    pub(crate) tracing_id: Option<Uuid>,
    pub(crate) warnings: Vec<String>,
}

impl QueryResponse {
    pub(crate) fn into_non_error_response(
        self,
    ) -> Result<NonErrorQueryResponse, RequestAttemptError> {
        let response = match self.response {
            Response::Error(err) => return Err(err.into()),
            Response::Ready => NonErrorResponse::Ready,
            Response::Result(res) => NonErrorResponse::Result(res),
            Response::Authenticate(auth) => NonErrorResponse::Authenticate(auth),
            Response::AuthSuccess(auth_succ) => NonErrorResponse::AuthSuccess(auth_succ),
            Response::AuthChallenge(auth_chal) => NonErrorResponse::AuthChallenge(auth_chal),
            Response::Supported(sup) => NonErrorResponse::Supported(sup),
            Response::Event(eve) => NonErrorResponse::Event(eve),
        };

        Ok(NonErrorQueryResponse {
            response,
            tracing_id: self.tracing_id,
            warnings: self.warnings,
        })
    }
}

impl NonErrorQueryResponse {
    pub(crate) fn into_query_result(self) -> Result<QueryResult, RequestAttemptError> {
        match self.response {
            NonErrorResponse::Result(result) => Ok(QueryResult::from_result(
                result,
                self.tracing_id,
                self.warnings,
            )),
            NonErrorResponse::Ready => {
                Ok(QueryResult::mock_empty(self.tracing_id, self.warnings))
            }
            other => Err(RequestAttemptError::UnexpectedResponse(
                other.to_response_kind(),
            )),
        }
    }

    pub(crate) fn as_set_keyspace(&self) -> Option<&result::SetKeyspace> {
        match &self.response {
            NonErrorResponse::Result(result::Result::SetKeyspace(sk)) => Some(sk),
            _ => None,
        }
    }

    pub(crate) fn as_schema_change(&self) -> Option<&result::SchemaChange> {
        match &self.response {
            NonErrorResponse::Result(result::Result::SchemaChange(sc)) => Some(sc),
            _ => None,
        }
    }
}
