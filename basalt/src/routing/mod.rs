//! Token-ring routing: tokens, partitioners and replica location.

pub mod locator;
pub mod partitioner;
pub mod ring;

use std::num::ParseIntError;
use std::str::FromStr;

pub use locator::ReplicaLocator;
pub use ring::TokenRing;

/// A position on the token ring.
#[derive(Eq, PartialEq, Hash, PartialOrd, Ord, Clone, Copy)]
pub struct Token {
    value: i64,
}

impl Token {
    /// A token that is never produced by a partitioner.
    pub const INVALID: Token = Token { value: i64::MIN };

    pub fn new(value: i64) -> Self {
        Self { value }
    }

    pub fn value(&self) -> i64 {
        self.value
    }
}

impl std::fmt::Debug for Token {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Token({})", self.value)
    }
}

impl FromStr for Token {
    type Err = ParseIntError;

    fn from_str(s: &str) -> Result<Self, ParseIntError> {
        Ok(Token::new(s.parse::<i64>()?))
    }
}

/// Routing information of a single request, consumed by token-aware load
/// balancing.
#[derive(Debug, Clone, Default)]
pub struct RoutingInfo {
    pub token: Option<Token>,
    pub keyspace: Option<String>,
}
