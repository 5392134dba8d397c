//! # Nimbus Testkit
//!
//! Test utilities for Nimbus.
//!
//! This crate provides:
//! - An in-memory scripted backend speaking the wire protocol
//! - Fixtures: a sample service, its class registry, and connected clients
//! - Property-based value generators using proptest
//!
//! ## Usage
//!
//! ```rust,ignore
//! use nimbus_testkit::prelude::*;
//!
//! #[tokio::test]
//! async fn fetch_a_user() {
//!     let backend = FakeBackend::start(service());
//!     backend.put_record(USER_CLASS, "u1", 1, vec![text("name", "Sam")]);
//!     let client = client_for(&backend);
//!     let user = client.get_data(&user_key(&client, "u1")).await.unwrap();
//! }
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

pub mod backend;
pub mod fixtures;
pub mod generators;

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::backend::*;
    pub use crate::fixtures::*;
    pub use crate::generators::*;
}

pub use backend::*;
pub use fixtures::*;
pub use generators::*;

/// Installs a test subscriber filtered by `RUST_LOG`. Safe to call more
/// than once.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}
