//! Allow-lists for inbound Connect requests

use revdial_connection::ConnectAuthorizer;
use std::sync::Arc;

/// Networks and addresses a client agrees to dial.
///
/// Empty lists allow everything. Patterns ending in `*` match by prefix, so
/// `10.0.0.*` or `db.internal:*` cover a range.
#[derive(Debug, Clone, Default)]
pub struct AllowList {
    networks: Vec<String>,
    addresses: Vec<String>,
}

fn matches(patterns: &[String], value: &str) -> bool {
    patterns.is_empty()
        || patterns.iter().any(|pattern| match pattern.strip_suffix('*') {
            Some(prefix) => value.starts_with(prefix),
            None => pattern == value,
        })
}

impl AllowList {
    pub fn new(networks: Vec<String>, addresses: Vec<String>) -> Self {
        Self {
            networks,
            addresses,
        }
    }

    pub fn allows(&self, network: &str, address: &str) -> bool {
        matches(&self.networks, network) && matches(&self.addresses, address)
    }

    pub fn into_authorizer(self) -> ConnectAuthorizer {
        Arc::new(move |network: &str, address: &str| self.allows(network, address))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_allows_all() {
        let list = AllowList::default();
        assert!(list.allows("tcp", "example:80"));
        assert!(list.allows("unix", "/run/app.sock"));
    }

    #[test]
    fn test_exact_and_prefix() {
        let list = AllowList::new(
            vec!["tcp".into()],
            vec!["127.0.0.1:8080".into(), "db.internal:*".into()],
        );
        assert!(list.allows("tcp", "127.0.0.1:8080"));
        assert!(list.allows("tcp", "db.internal:5432"));
        assert!(!list.allows("tcp", "127.0.0.1:22"));
        assert!(!list.allows("unix", "127.0.0.1:8080"));
    }

    #[test]
    fn test_authorizer() {
        let auth = AllowList::new(vec!["tcp".into()], vec![]).into_authorizer();
        assert!(auth("tcp", "anything:1"));
        assert!(!auth("udp", "anything:1"));
    }
}
