//! Core library for the alcatraz sandbox orchestrator
//!
//! Given a per-project configuration file, this crate brings up an isolated
//! development container, keeps host and container file state coherent, and
//! enforces outbound network isolation against a user-declared LAN
//! allowlist. It contains the configuration loader/merger, the container
//! runtime abstraction, the file-sync manager, the firewall and privileged
//! state manager, and the orchestrator composing them. The command-line
//! front-end lives elsewhere and talks to this crate only through the
//! public API.

pub mod apple_container;
pub mod config;
pub mod docker;
pub mod env;
pub mod errors;
pub mod firewall;
pub mod helper;
pub mod loader;
pub mod logging;
pub mod orchestrator;
pub mod platform;
pub mod runtime;
pub mod state;
pub mod sync;
pub mod transaction;

// Re-export IndexMap: the config env map preserves insertion order and
// appears in the public API
pub use indexmap::IndexMap;

/// Get the version of the core library
pub fn version() -> &'static str {
    env!("CARGO_PKG_VERSION")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_version() {
        let version = version();
        assert!(!version.is_empty());
        assert!(version.contains('.'));
    }
}
