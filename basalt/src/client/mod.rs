//! The session and its builder.

pub mod session;
pub mod session_builder;

#[cfg(test)]
mod session_test;

pub use session::{Session, SessionConfig};
pub use session_builder::SessionBuilder;
