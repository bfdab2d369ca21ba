//! Address translation hook, applied to peer addresses fetched from
//! `system.peers` before the driver connects to them. Useful when the
//! cluster is reachable through NAT or a proxy.

use async_trait::async_trait;
use std::collections::HashMap;
use std::net::SocketAddr;
use thiserror::Error;

#[derive(Debug, Copy, Clone, Error, PartialEq, Eq)]
pub enum TranslationError {
    #[error("No rule for address {0}")]
    NoRuleForAddress(SocketAddr),
}

/// Translates node addresses broadcast by the cluster into addresses the
/// client can actually reach.
#[async_trait]
pub trait AddressTranslator: Send + Sync {
    async fn translate_address(
        &self,
        broadcast_address: SocketAddr,
    ) -> Result<SocketAddr, TranslationError>;
}

/// A static translation table. Addresses with no rule are skipped by the
/// driver, so the table must be complete.
#[async_trait]
impl AddressTranslator for HashMap<SocketAddr, SocketAddr> {
    async fn translate_address(
        &self,
        broadcast_address: SocketAddr,
    ) -> Result<SocketAddr, TranslationError> {
        match self.get(&broadcast_address) {
            Some(translated_address) => Ok(*translated_address),
            None => Err(TranslationError::NoRuleForAddress(broadcast_address)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::{IpAddr, Ipv4Addr};

    fn addr(a: u8, port: u16) -> SocketAddr {
        SocketAddr::new(IpAddr::V4(Ipv4Addr::new(10, 0, 0, a)), port)
    }

    #[tokio::test]
    async fn hashmap_translator() {
        let mut table = HashMap::new();
        table.insert(addr(1, 9042), addr(101, 19042));

        assert_eq!(
            table.translate_address(addr(1, 9042)).await,
            Ok(addr(101, 19042))
        );
        assert_eq!(
            table.translate_address(addr(2, 9042)).await,
            Err(TranslationError::NoRuleForAddress(addr(2, 9042)))
        );
    }
}
