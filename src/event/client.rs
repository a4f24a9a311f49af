use std::fmt::{Display, Formatter};
use std::hash::{Hash, Hasher};

use serde::{Deserialize, Serialize};

/// Identity of one consumer: the destination (source channel) it subscribes
/// to plus its client id. The optional filter expression travels with the
/// subscription but never participates in equality, so a resubscribe with a
/// new filter addresses the same registry entry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientIdentity {
    pub destination: String,
    pub client_id: i64,
    pub filter: Option<String>,
}

impl ClientIdentity {
    pub fn new(destination: impl Into<String>, client_id: i64) -> Self {
        Self {
            destination: destination.into(),
            client_id,
            filter: None,
        }
    }

    pub fn with_filter(mut self, filter: impl Into<String>) -> Self {
        self.filter = Some(filter.into());
        self
    }
}

impl PartialEq for ClientIdentity {
    fn eq(&self, other: &Self) -> bool {
        self.destination == other.destination && self.client_id == other.client_id
    }
}

impl Eq for ClientIdentity {}

impl Hash for ClientIdentity {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.destination.hash(state);
        self.client_id.hash(state);
    }
}

impl Display for ClientIdentity {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.destination, self.client_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn test_equality_ignores_filter() {
        let plain = ClientIdentity::new("example", 1001);
        let filtered = ClientIdentity::new("example", 1001).with_filter("db\\..*");
        assert_eq!(plain, filtered);

        let mut map = HashMap::new();
        map.insert(plain, 1);
        assert!(map.contains_key(&ClientIdentity::new("example", 1001).with_filter("other")));
    }

    #[test]
    fn test_distinct_clients() {
        let a = ClientIdentity::new("example", 1001);
        let b = ClientIdentity::new("example", 1002);
        let c = ClientIdentity::new("other", 1001);
        assert_ne!(a, b);
        assert_ne!(a, c);
    }
}
