//! Retry policies decide what to do with a failed request attempt: retry on
//! the same node, move on to the next node of the plan, or give up.

use crate::errors::{DbError, RequestAttemptError, WriteType};
use basalt_cql::Consistency;

/// Information about a failed request attempt.
pub struct RequestInfo<'a> {
    /// The error with which the attempt failed.
    pub error: &'a RequestAttemptError,
    /// True only if the request is known to be idempotent - applying it
    /// multiple times cannot change the outcome of the first application.
    pub is_idempotent: bool,
    /// Consistency with which the attempt was made.
    pub consistency: Consistency,
}

#[derive(Debug, PartialEq, Eq)]
pub enum RetryDecision {
    /// Retry on the same node, optionally changing the consistency.
    RetrySameNode(Option<Consistency>),
    /// Retry on the next node of the query plan.
    RetryNextNode(Option<Consistency>),
    /// Give up and propagate the error to the caller.
    DontRetry,
    /// Pretend the write succeeded; never produced by the builtin policies.
    IgnoreWriteError,
}

/// Creates per-request [RetrySession]s.
pub trait RetryPolicy: std::fmt::Debug + Send + Sync {
    /// Called for each new request; the session accumulates the retry
    /// history of that one request.
    fn new_session(&self) -> Box<dyn RetrySession>;
}

/// Decides the fate of consecutive failures of a single request.
pub trait RetrySession: Send + Sync {
    /// Called after a failed attempt.
    fn decide_should_retry(&mut self, request_info: RequestInfo) -> RetryDecision;

    /// Resets the session so it can be reused for a new request.
    fn reset(&mut self);
}

/// Forwards all errors directly to the caller, never retries.
#[derive(Debug, Default)]
pub struct FallthroughRetryPolicy;

pub struct FallthroughRetrySession;

impl FallthroughRetryPolicy {
    pub fn new() -> FallthroughRetryPolicy {
        FallthroughRetryPolicy
    }
}

impl RetryPolicy for FallthroughRetryPolicy {
    fn new_session(&self) -> Box<dyn RetrySession> {
        Box::new(FallthroughRetrySession)
    }
}

impl RetrySession for FallthroughRetrySession {
    fn decide_should_retry(&mut self, _request_info: RequestInfo) -> RetryDecision {
        RetryDecision::DontRetry
    }

    fn reset(&mut self) {}
}

/// The default retry policy - retries when there is a high chance that
/// another attempt might help.
#[derive(Debug, Default)]
pub struct DefaultRetryPolicy;

impl DefaultRetryPolicy {
    pub fn new() -> DefaultRetryPolicy {
        DefaultRetryPolicy
    }
}

impl RetryPolicy for DefaultRetryPolicy {
    fn new_session(&self) -> Box<dyn RetrySession> {
        Box::new(DefaultRetrySession::new())
    }
}

pub struct DefaultRetrySession {
    was_unavailable_retry: bool,
    was_read_timeout_retry: bool,
    was_write_timeout_retry: bool,
}

impl DefaultRetrySession {
    pub fn new() -> DefaultRetrySession {
        DefaultRetrySession {
            was_unavailable_retry: false,
            was_read_timeout_retry: false,
            was_write_timeout_retry: false,
        }
    }
}

impl Default for DefaultRetrySession {
    fn default() -> DefaultRetrySession {
        DefaultRetrySession::new()
    }
}

impl RetrySession for DefaultRetrySession {
    fn decide_should_retry(&mut self, request_info: RequestInfo) -> RetryDecision {
        if request_info.consistency.is_serial() {
            return RetryDecision::DontRetry;
        };
        match request_info.error {
            // Connection broke or the node misbehaved; another node may be
            // healthy, but the write may already have been applied, so only
            // idempotent requests are resent.
            RequestAttemptError::BrokenConnection(_)
            | RequestAttemptError::DbError(DbError::ServerError, _)
            | RequestAttemptError::DbError(DbError::TruncateError, _) => {
                if request_info.is_idempotent {
                    RetryDecision::RetryNextNode(None)
                } else {
                    RetryDecision::DontRetry
                }
            }
            // The node rejected the request before doing any work; safe to
            // try elsewhere regardless of idempotency.
            RequestAttemptError::DbError(DbError::Overloaded, _)
            | RequestAttemptError::DbError(DbError::IsBootstrapping, _) => {
                RetryDecision::RetryNextNode(None)
            }
            // Unavailable: the contacted node believes there are not enough
            // live replicas. Another node may have a fresher membership
            // view; retry once.
            RequestAttemptError::DbError(DbError::Unavailable { .. }, _) => {
                if !self.was_unavailable_retry {
                    self.was_unavailable_retry = true;
                    RetryDecision::RetryNextNode(None)
                } else {
                    RetryDecision::DontRetry
                }
            }
            // Read timeout: retry once on the same node, but only if enough
            // replicas responded yet none of them carried the data - the
            // coordinator will avoid the dead data replica on the retry.
            RequestAttemptError::DbError(
                DbError::ReadTimeout {
                    received,
                    required,
                    data_present,
                    ..
                },
                _,
            ) => {
                if !self.was_read_timeout_retry && received >= required && !*data_present {
                    self.was_read_timeout_retry = true;
                    RetryDecision::RetrySameNode(None)
                } else {
                    RetryDecision::DontRetry
                }
            }
            // Write timeout: retry once on the same node, only for a timed
            // out batch-log write - the batch log write not having
            // completed means the batch was not applied.
            RequestAttemptError::DbError(DbError::WriteTimeout { write_type, .. }, _) => {
                if !self.was_write_timeout_retry && *write_type == WriteType::BatchLog {
                    self.was_write_timeout_retry = true;
                    RetryDecision::RetrySameNode(None)
                } else {
                    RetryDecision::DontRetry
                }
            }
            // The connection is overloaded; try another node.
            RequestAttemptError::UnableToAllocStreamId => RetryDecision::RetryNextNode(None),
            // In all other cases propagate the error to the caller.
            _ => RetryDecision::DontRetry,
        }
    }

    fn reset(&mut self) {
        *self = DefaultRetrySession::new();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::BrokenConnectionError;
    use bytes::Bytes;

    fn make_request_info(error: &RequestAttemptError, is_idempotent: bool) -> RequestInfo<'_> {
        RequestInfo {
            error,
            is_idempotent,
            consistency: Consistency::One,
        }
    }

    // Asserts that the default policy never retries for this error.
    fn default_policy_assert_never_retries(error: RequestAttemptError) {
        let mut policy = DefaultRetryPolicy::new().new_session();
        assert_eq!(
            policy.decide_should_retry(make_request_info(&error, false)),
            RetryDecision::DontRetry
        );

        let mut policy = DefaultRetryPolicy::new().new_session();
        assert_eq!(
            policy.decide_should_retry(make_request_info(&error, true)),
            RetryDecision::DontRetry
        );
    }

    #[test]
    fn default_never_retries() {
        let never_retried_dberrors = vec![
            DbError::SyntaxError,
            DbError::Invalid,
            DbError::AlreadyExists {
                keyspace: String::new(),
                table: String::new(),
            },
            DbError::FunctionFailure {
                keyspace: String::new(),
                function: String::new(),
                arg_types: vec![],
            },
            DbError::AuthenticationError,
            DbError::Unauthorized,
            DbError::ConfigError,
            DbError::ReadFailure {
                consistency: Consistency::Two,
                received: 2,
                required: 1,
                numfailures: 1,
                data_present: false,
            },
            DbError::WriteFailure {
                consistency: Consistency::Two,
                received: 1,
                required: 2,
                numfailures: 1,
                write_type: WriteType::BatchLog,
            },
            DbError::Unprepared {
                statement_id: Bytes::from_static(b"deadbeef"),
            },
            DbError::ProtocolError,
            DbError::Other(0x124816),
        ];

        for dberror in never_retried_dberrors {
            default_policy_assert_never_retries(RequestAttemptError::DbError(
                dberror,
                String::new(),
            ));
        }

        default_policy_assert_never_retries(RequestAttemptError::UnexpectedResponse("AUTH_SUCCESS"));
    }

    // Asserts that for this error the policy retries on the next node for
    // idempotent requests only.
    fn default_policy_assert_idempotent_next(error: RequestAttemptError) {
        let mut policy = DefaultRetryPolicy::new().new_session();
        assert_eq!(
            policy.decide_should_retry(make_request_info(&error, false)),
            RetryDecision::DontRetry
        );

        let mut policy = DefaultRetryPolicy::new().new_session();
        assert_eq!(
            policy.decide_should_retry(make_request_info(&error, true)),
            RetryDecision::RetryNextNode(None)
        );
    }

    #[test]
    fn default_idempotent_next_retries() {
        let idempotent_next_errors = vec![
            RequestAttemptError::DbError(DbError::ServerError, String::new()),
            RequestAttemptError::DbError(DbError::TruncateError, String::new()),
            RequestAttemptError::BrokenConnection(BrokenConnectionError::ChannelError),
        ];

        for error in idempotent_next_errors {
            default_policy_assert_idempotent_next(error);
        }
    }

    // Bootstrapping and overloaded nodes did not process the request at
    // all; retry on the next node regardless of idempotency.
    #[test]
    fn default_bootstrapping_and_overloaded() {
        for error in [
            RequestAttemptError::DbError(DbError::IsBootstrapping, String::new()),
            RequestAttemptError::DbError(DbError::Overloaded, String::new()),
        ] {
            let mut policy = DefaultRetryPolicy::new().new_session();
            assert_eq!(
                policy.decide_should_retry(make_request_info(&error, false)),
                RetryDecision::RetryNextNode(None)
            );

            let mut policy = DefaultRetryPolicy::new().new_session();
            assert_eq!(
                policy.decide_should_retry(make_request_info(&error, true)),
                RetryDecision::RetryNextNode(None)
            );
        }
    }

    // On unavailable the policy retries the next node once, no matter the
    // idempotence.
    #[test]
    fn default_unavailable() {
        let error = RequestAttemptError::DbError(
            DbError::Unavailable {
                consistency: Consistency::Two,
                required: 2,
                alive: 1,
            },
            String::new(),
        );

        let mut policy_not_idempotent = DefaultRetryPolicy::new().new_session();
        assert_eq!(
            policy_not_idempotent.decide_should_retry(make_request_info(&error, false)),
            RetryDecision::RetryNextNode(None)
        );
        assert_eq!(
            policy_not_idempotent.decide_should_retry(make_request_info(&error, false)),
            RetryDecision::DontRetry
        );

        let mut policy_idempotent = DefaultRetryPolicy::new().new_session();
        assert_eq!(
            policy_idempotent.decide_should_retry(make_request_info(&error, true)),
            RetryDecision::RetryNextNode(None)
        );
        assert_eq!(
            policy_idempotent.decide_should_retry(make_request_info(&error, true)),
            RetryDecision::DontRetry
        );
    }

    #[test]
    fn default_read_timeout() {
        // Enough responses, no data: retry once on the same node.
        let enough_responses_no_data = RequestAttemptError::DbError(
            DbError::ReadTimeout {
                consistency: Consistency::Two,
                received: 2,
                required: 2,
                data_present: false,
            },
            String::new(),
        );

        for is_idempotent in [false, true] {
            let mut policy = DefaultRetryPolicy::new().new_session();
            assert_eq!(
                policy.decide_should_retry(make_request_info(
                    &enough_responses_no_data,
                    is_idempotent
                )),
                RetryDecision::RetrySameNode(None)
            );
            assert_eq!(
                policy.decide_should_retry(make_request_info(
                    &enough_responses_no_data,
                    is_idempotent
                )),
                RetryDecision::DontRetry
            );
        }

        // Enough responses but data was retrieved: retrying cannot help.
        let enough_responses_with_data = RequestAttemptError::DbError(
            DbError::ReadTimeout {
                consistency: Consistency::Two,
                received: 2,
                required: 2,
                data_present: true,
            },
            String::new(),
        );
        let mut policy = DefaultRetryPolicy::new().new_session();
        assert_eq!(
            policy.decide_should_retry(make_request_info(&enough_responses_with_data, true)),
            RetryDecision::DontRetry
        );

        // Not enough responses: the next attempt would time out again.
        let not_enough_responses = RequestAttemptError::DbError(
            DbError::ReadTimeout {
                consistency: Consistency::Two,
                received: 1,
                required: 2,
                data_present: false,
            },
            String::new(),
        );
        let mut policy = DefaultRetryPolicy::new().new_session();
        assert_eq!(
            policy.decide_should_retry(make_request_info(&not_enough_responses, true)),
            RetryDecision::DontRetry
        );
    }

    #[test]
    fn default_write_timeout() {
        // WriteType == BatchLog: the batch was not applied; retry once on
        // the same node regardless of idempotency.
        let batch_log_write = RequestAttemptError::DbError(
            DbError::WriteTimeout {
                consistency: Consistency::Two,
                received: 1,
                required: 2,
                write_type: WriteType::BatchLog,
            },
            String::new(),
        );

        for is_idempotent in [false, true] {
            let mut policy = DefaultRetryPolicy::new().new_session();
            assert_eq!(
                policy.decide_should_retry(make_request_info(&batch_log_write, is_idempotent)),
                RetryDecision::RetrySameNode(None)
            );
            assert_eq!(
                policy.decide_should_retry(make_request_info(&batch_log_write, is_idempotent)),
                RetryDecision::DontRetry
            );
        }

        // Any other write type: the write may have been applied.
        let simple_write = RequestAttemptError::DbError(
            DbError::WriteTimeout {
                consistency: Consistency::Two,
                received: 4,
                required: 2,
                write_type: WriteType::Simple,
            },
            String::new(),
        );
        let mut policy = DefaultRetryPolicy::new().new_session();
        assert_eq!(
            policy.decide_should_retry(make_request_info(&simple_write, true)),
            RetryDecision::DontRetry
        );
    }

    #[test]
    fn default_serial_consistency_never_retries() {
        let error = RequestAttemptError::DbError(DbError::IsBootstrapping, String::new());
        let mut policy = DefaultRetryPolicy::new().new_session();
        assert_eq!(
            policy.decide_should_retry(RequestInfo {
                error: &error,
                is_idempotent: true,
                consistency: Consistency::Serial,
            }),
            RetryDecision::DontRetry
        );
    }

    #[test]
    fn fallthrough_never_retries() {
        let error = RequestAttemptError::DbError(DbError::IsBootstrapping, String::new());
        let mut policy = FallthroughRetryPolicy::new().new_session();
        assert_eq!(
            policy.decide_should_retry(make_request_info(&error, true)),
            RetryDecision::DontRetry
        );
    }
}
