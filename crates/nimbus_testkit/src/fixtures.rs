//! Test fixtures: a sample service and clients connected to a backend.

use crate::backend::FakeBackend;
use nimbus_codec::{EncodedValue, TypeTag};
use nimbus_protocol::Property;
use nimbus_runtime::{
    Client, ClassRegistry, Credentials, InstanceKey, RuntimeConfig, ServiceIdentity, TransportPool,
};
use std::sync::Arc;

/// Service id of the sample service.
pub const SERVICE_ID: &str = "chat";
/// Service version of the sample service.
pub const SERVICE_VERSION: &str = "v1";

/// Record class `User`.
pub const USER_CLASS: u32 = 5;
/// Record class `Post`.
pub const POST_CLASS: u32 = 6;
/// Callable class `Api`.
pub const API_CLASS: u32 = 1;
/// Session class `ChatSession`.
pub const SESSION_CLASS: u32 = 2;
/// Event class `Ping`.
pub const PING_EVENT: u32 = 9;

/// The sample service.
pub fn service() -> ServiceIdentity {
    ServiceIdentity::new(SERVICE_ID, SERVICE_VERSION)
}

/// Registry of the sample service.
pub fn registry() -> ClassRegistry {
    ClassRegistry::builder(service())
        .record("User", USER_CLASS)
        .and_then(|b| b.record("Post", POST_CLASS))
        .and_then(|b| b.callable("Api", API_CLASS))
        .and_then(|b| b.session("ChatSession", SESSION_CLASS))
        .and_then(|b| b.event("Ping", PING_EVENT))
        .expect("sample registry is valid")
        .build()
}

/// Configuration for the sample service.
pub fn config() -> RuntimeConfig {
    RuntimeConfig::new(service(), "mem://chat", Credentials::user("user-key"))
        .with_log_context_prefix("test")
}

/// A client of `backend` on its own pool.
pub fn client_for(backend: &FakeBackend) -> Client {
    client_with_config(backend, config())
}

/// A client of `backend` with a custom configuration.
pub fn client_with_config(backend: &FakeBackend, config: RuntimeConfig) -> Client {
    let pool = TransportPool::new(Arc::new(backend.connector()));
    Client::new(config, registry(), &pool).expect("registry matches config")
}

/// Key of user `primary_key`.
pub fn user_key(client: &Client, primary_key: &str) -> InstanceKey {
    client
        .record_key("User", primary_key)
        .expect("User is registered")
}

/// A string property.
pub fn text(name: &str, value: &str) -> Property {
    Property::new(name, EncodedValue::string(value))
}

/// A number property.
pub fn number(name: &str, value: f64) -> Property {
    Property::new(name, EncodedValue::number(value))
}

/// A record reference.
pub fn record_ref(class_id: u32, primary_key: &str) -> EncodedValue {
    EncodedValue::reference(TypeTag::RecordRef, class_id, primary_key)
        .expect("record tag is a reference tag")
}

/// A callable reference.
pub fn callable_ref(class_id: u32, primary_key: &str) -> EncodedValue {
    EncodedValue::reference(TypeTag::CallableRef, class_id, primary_key)
        .expect("callable tag is a reference tag")
}
