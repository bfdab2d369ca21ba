//! Pluggable policies consulted by the session: load balancing, retry,
//! reconnection, speculative execution and address translation.

pub mod address_translator;
pub mod load_balancing;
pub mod reconnection;
pub mod retry;
pub mod speculative_execution;

pub use address_translator::AddressTranslator;
pub use load_balancing::{
    DcAwareRoundRobinPolicy, LoadBalancingPolicy, RoundRobinPolicy, TokenAwarePolicy,
};
pub use reconnection::{
    ConstantReconnectionPolicy, ExponentialReconnectionPolicy, ReconnectionPolicy,
};
pub use retry::{DefaultRetryPolicy, FallthroughRetryPolicy, RetryDecision, RetryPolicy};
pub use speculative_execution::{SimpleSpeculativeExecutionPolicy, SpeculativeExecutionPolicy};
