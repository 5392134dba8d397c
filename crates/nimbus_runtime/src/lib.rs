//! # Nimbus Runtime
//!
//! Client runtime for Nimbus services.
//!
//! This crate provides:
//! - Remote method calls on callable objects, records and sessions
//! - A process-local cache of shared, versioned records
//! - Push subscriptions for record updates and events
//! - Request correlation over one duplex channel per service and credentials
//!
//! ## Architecture
//!
//! ```text
//! Client ──► RequestEncoder ──► Transport ──► channel
//!   ▲                              │
//!   │                      response / push
//!   │                              ▼
//!   └── Tracker::drain ◄── Reconciler ◄── ValueDecoder
//! ```
//!
//! ## Key Invariants
//!
//! - A cached record's version advances by exactly one per applied delta;
//!   anything else drops the record and refetches it
//! - One live instance per key
//! - Listeners run after references are resolved and before deletions
//! - A response yields one outcome: a value, a platform error, a script
//!   error, or a connection error

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod client;
mod codec;
mod config;
mod connector;
mod error;
mod identity;
mod instance;
mod keys;
mod listeners;
mod reconciler;
mod registry;
mod state;
mod tracker;
mod transport;
mod value;

pub use client::{Client, EventSubscription};
pub use codec::{RequestEncoder, ValueDecoder, MAX_VALUE_DEPTH};
pub use config::{AuthorizationKey, ConnectParams, Credentials, RuntimeConfig, DEFAULT_MAX_FRAME_BYTES};
pub use connector::{
    accept_tcp, Channel, Connector, MemoryConnection, MemoryConnector, MemoryListener, MessageSink,
    MessageStream, TcpConnector,
};
pub use error::{ConnectionError, PlatformErrorCode, RuntimeError, RuntimeResult};
pub use identity::IdentityMap;
pub use instance::{Instance, InstanceId, PropertyBag, RecordView, WeakInstance};
pub use keys::{ClassKey, ClassKind, EventChannelKey, InstanceKey, ServiceIdentity};
pub use listeners::{
    Event, EventListener, EventListeners, ListenerError, ListenerId, ListenerResult, UpdateListener,
};
pub use reconciler::{Reconciled, Reconciler};
pub use registry::{ClassInfo, ClassRegistry, RegistryBuilder, RegistryError};
pub use state::RuntimeState;
pub use tracker::{Fetcher, ResolutionCallback, Tracker};
pub use transport::{PushHandler, Transport, TransportPool};
pub use value::{SharedMap, Value};
