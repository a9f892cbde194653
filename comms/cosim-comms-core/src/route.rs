//! Logical route identifiers and the per-transport table that resolves them.

use std::{collections::HashMap, fmt};

/// Identifies a logical destination for outgoing messages.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct RouteId(pub i32);

impl RouteId {
    /// The route to this node's broker.
    pub const PARENT: RouteId = RouteId(-1);
    /// Loops back to this node's own receive task.
    pub const CONTROL: RouteId = RouteId(-2);

    pub const fn new(id: i32) -> Self {
        Self(id)
    }

    pub const fn id(self) -> i32 {
        self.0
    }
}

impl From<i32> for RouteId {
    fn from(id: i32) -> Self {
        Self(id)
    }
}

impl fmt::Display for RouteId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match *self {
            Self::PARENT => write!(f, "parent"),
            Self::CONTROL => write!(f, "control"),
            Self(id) => write!(f, "{id}"),
        }
    }
}

/// Maps route ids to transport endpoints.
///
/// Owned by a transmit task; only that task reads or mutates it.
#[derive(Debug)]
pub struct RouteTable<E> {
    routes: HashMap<RouteId, E>,
}

impl<E> RouteTable<E> {
    pub fn new() -> Self {
        Self {
            routes: HashMap::new(),
        }
    }

    /// Adds or replaces the endpoint for a route, returning the old one.
    pub fn insert(&mut self, route: RouteId, endpoint: E) -> Option<E> {
        self.routes.insert(route, endpoint)
    }

    pub fn remove(&mut self, route: RouteId) -> Option<E> {
        self.routes.remove(&route)
    }

    /// Picks where a message for `route` should go. The parent route and any
    /// unknown route fall back to the broker; `None` means the message has
    /// nowhere to go.
    pub fn resolve<'a>(&'a self, route: RouteId, broker: Option<&'a E>) -> Option<&'a E> {
        if route == RouteId::PARENT {
            return broker;
        }
        self.routes.get(&route).or(broker)
    }

    /// Same as [`RouteTable::resolve`] but hands out mutable access, for
    /// endpoints such as sinks that need it to send.
    pub fn resolve_mut<'a>(
        &'a mut self,
        route: RouteId,
        broker: Option<&'a mut E>,
    ) -> Option<&'a mut E> {
        if route == RouteId::PARENT {
            return broker;
        }
        match self.routes.get_mut(&route) {
            Some(endpoint) => Some(endpoint),
            None => broker,
        }
    }
}

impl<E> Default for RouteTable<E> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn removed_route_falls_back_to_broker() {
        let mut table = RouteTable::new();
        let broker = "broker:23901".to_string();
        table.insert(RouteId(5), "host:9000".to_string());

        assert_eq!(
            table.resolve(RouteId(5), Some(&broker)).map(String::as_str),
            Some("host:9000")
        );

        table.remove(RouteId(5));
        assert_eq!(
            table.resolve(RouteId(5), Some(&broker)).map(String::as_str),
            Some("broker:23901")
        );
        assert_eq!(table.resolve(RouteId(5), None), None);
    }

    #[test]
    fn parent_always_goes_to_broker() {
        let mut table = RouteTable::new();
        table.insert(RouteId::PARENT, 1);
        assert_eq!(table.resolve(RouteId::PARENT, Some(&2)), Some(&2));
        assert_eq!(table.resolve(RouteId::PARENT, None), None);
    }

    #[test]
    fn replace_returns_previous() {
        let mut table = RouteTable::new();
        assert_eq!(table.insert(RouteId(0), 'a'), None);
        assert_eq!(table.insert(RouteId(0), 'b'), Some('a'));
        if let Some(endpoint) = table.resolve_mut(RouteId(0), None) {
            *endpoint = 'c';
        }
        assert_eq!(table.resolve(RouteId(0), None), Some(&'c'));
        assert_eq!(table.remove(RouteId(0)), Some('c'));
    }
}
