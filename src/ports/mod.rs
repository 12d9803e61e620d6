//! Listener port registry.
//!
//! # Responsibilities
//! - Map logical listener names ("http", "http_forward", "admin") to bound
//!   ports
//!
//! # Design Decisions
//! - Written once during setup, read-only afterward; duplicate registration
//!   or lookup of an unknown name is harness misuse and aborts immediately

use std::collections::HashMap;

/// Mapping from logical listener name to bound port.
#[derive(Debug, Default)]
pub struct PortRegistry {
    ports: HashMap<String, u16>,
}

impl PortRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a listener port.
    ///
    /// # Panics
    /// Panics if `name` was already registered.
    pub fn register(&mut self, name: &str, port: u16) {
        let previous = self.ports.insert(name.to_string(), port);
        assert!(
            previous.is_none(),
            "port {name:?} registered twice (registry is write-once)"
        );
        tracing::debug!(name, port, "registered listener port");
    }

    /// Look up a registered listener port.
    ///
    /// # Panics
    /// Panics if `name` was never registered.
    pub fn lookup(&self, name: &str) -> u16 {
        match self.ports.get(name) {
            Some(&port) => port,
            None => panic!("no port registered under {name:?}"),
        }
    }

    pub fn contains(&self, name: &str) -> bool {
        self.ports.contains_key(name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn register_then_lookup() {
        let mut registry = PortRegistry::new();
        registry.register("http", 8080);
        registry.register("admin", 9901);
        assert_eq!(registry.lookup("http"), 8080);
        assert_eq!(registry.lookup("admin"), 9901);
        assert!(registry.contains("http"));
        assert!(!registry.contains("https"));
    }

    #[test]
    #[should_panic(expected = "registered twice")]
    fn duplicate_registration_panics() {
        let mut registry = PortRegistry::new();
        registry.register("http", 8080);
        registry.register("http", 8081);
    }

    #[test]
    #[should_panic(expected = "no port registered")]
    fn unknown_lookup_panics() {
        PortRegistry::new().lookup("missing");
    }
}
