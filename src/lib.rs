//! Server health tracking for the Spring Cloud Data Flow explorer views.
//!
//! Each registered SCDF server is probed on a timer while at least one
//! explorer view is visible. State changes are cached and every visible view
//! is asked to refresh once per poll cycle.

pub mod config;
pub mod explorer;
pub mod manager;
pub mod poller;
pub mod probe;
pub mod registration;
pub mod state;
pub mod visibility;
