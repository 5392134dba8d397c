//! In-memory scripted backend.
//!
//! Serves [`MemoryConnector`] channels with the real wire protocol. Records
//! are stored per (class id, primary key) with versions, saves advance those
//! versions and answer with the resulting deltas, and methods are scripted
//! per method id.

use bytes::Bytes;
use nimbus_codec::{EncodedValue, WireValue};
use nimbus_protocol::{
    CallMethodRequest, CallMethodResponse, DataUpdateMessage, DeltaData, EventChannelTarget,
    GetDataResponse, InboundFrame, OutboundFrame, Property, PushEnvelope, RecordTarget,
    RequestBody, RequestEnvelope, ResponseEnvelope, ServerMessage, PROTOCOL_VERSION,
};
use nimbus_runtime::{
    ConnectParams, MemoryConnection, MemoryConnector, MemoryListener, PlatformErrorCode,
    ServiceIdentity,
};
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

/// A method invocation as the backend sees it.
#[derive(Debug, Clone)]
pub struct MethodCall {
    /// Reference to the target object.
    pub target: EncodedValue,
    /// Method id.
    pub method_id: u32,
    /// Positional arguments.
    pub arguments: Vec<EncodedValue>,
    /// Snapshots the client attached.
    pub referenced_deltas: Vec<DeltaData>,
}

/// What a scripted method answers.
#[derive(Debug, Clone)]
pub enum MethodOutcome {
    /// Success, with bundled messages.
    Return {
        /// Return value.
        value: EncodedValue,
        /// Messages bundled with the response.
        messages: Vec<ServerMessage>,
    },
    /// The method threw.
    Exception {
        /// Exception message.
        message: String,
        /// Stack trace.
        stack: String,
    },
    /// Platform error code.
    Error(u32),
}

impl MethodOutcome {
    /// Success with no bundled messages.
    pub fn value(value: EncodedValue) -> Self {
        Self::Return {
            value,
            messages: Vec::new(),
        }
    }

    /// Success with bundled messages.
    pub fn with_messages(value: EncodedValue, messages: Vec<ServerMessage>) -> Self {
        Self::Return { value, messages }
    }

    /// A thrown exception.
    pub fn exception(message: impl Into<String>, stack: impl Into<String>) -> Self {
        Self::Exception {
            message: message.into(),
            stack: stack.into(),
        }
    }
}

/// Scripted method body.
pub type MethodHandler = Arc<dyn Fn(&MethodCall) -> MethodOutcome + Send + Sync>;

/// A stored record.
#[derive(Debug, Clone, PartialEq)]
pub struct StoredRecord {
    /// Current version; 0 never occurs for a live record.
    pub version: u64,
    /// Full property set.
    pub properties: Vec<Property>,
    /// Tombstone flag.
    pub deleted: bool,
}

type RecordId = (u32, String);

struct BackendInner {
    service: ServiceIdentity,
    records: Mutex<HashMap<RecordId, StoredRecord>>,
    methods: Mutex<HashMap<u32, MethodHandler>>,
    requests: Mutex<Vec<RequestEnvelope>>,
    connections: Mutex<Vec<mpsc::UnboundedSender<Bytes>>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    params: Mutex<Vec<ConnectParams>>,
    event_subscriptions: Mutex<Vec<EventChannelTarget>>,
    record_subscriptions: Mutex<HashSet<RecordId>>,
    console_log: Mutex<Vec<String>>,
    response_version: Mutex<Option<u16>>,
    unresponsive: AtomicBool,
}

/// In-memory backend for one service.
#[derive(Clone)]
pub struct FakeBackend {
    inner: Arc<BackendInner>,
    connector: MemoryConnector,
}

impl FakeBackend {
    /// Starts serving. Must be called inside a tokio runtime.
    pub fn start(service: ServiceIdentity) -> Self {
        let (connector, listener) = MemoryConnector::new();
        let inner = Arc::new(BackendInner {
            service,
            records: Mutex::new(HashMap::new()),
            methods: Mutex::new(HashMap::new()),
            requests: Mutex::new(Vec::new()),
            connections: Mutex::new(Vec::new()),
            tasks: Mutex::new(Vec::new()),
            params: Mutex::new(Vec::new()),
            event_subscriptions: Mutex::new(Vec::new()),
            record_subscriptions: Mutex::new(HashSet::new()),
            console_log: Mutex::new(Vec::new()),
            response_version: Mutex::new(Some(PROTOCOL_VERSION)),
            unresponsive: AtomicBool::new(false),
        });
        tokio::spawn(accept_loop(Arc::clone(&inner), listener));
        Self { inner, connector }
    }

    /// Connector that reaches this backend.
    pub fn connector(&self) -> MemoryConnector {
        self.connector.clone()
    }

    /// The service this backend hosts.
    pub fn service(&self) -> &ServiceIdentity {
        &self.inner.service
    }

    // Records

    /// Stores a record at `version`, replacing whatever was there.
    pub fn put_record(&self, class_id: u32, primary_key: &str, version: u64, properties: Vec<Property>) {
        self.inner.records.lock().insert(
            (class_id, primary_key.to_string()),
            StoredRecord {
                version,
                properties,
                deleted: false,
            },
        );
    }

    /// Merges `changed` into a record, advancing its version. Returns the
    /// delta a client needs to follow.
    pub fn update_record(&self, class_id: u32, primary_key: &str, changed: Vec<Property>) -> DeltaData {
        let mut records = self.inner.records.lock();
        let record = records
            .entry((class_id, primary_key.to_string()))
            .or_insert(StoredRecord {
                version: 0,
                properties: Vec::new(),
                deleted: false,
            });
        if record.deleted {
            *record = StoredRecord {
                version: 0,
                properties: Vec::new(),
                deleted: false,
            };
        }
        for property in &changed {
            match record.properties.iter_mut().find(|p| p.name == property.name) {
                Some(existing) => existing.value = property.value.clone(),
                None => record.properties.push(property.clone()),
            }
        }
        record.version += 1;
        DeltaData::update(class_id, primary_key, record.version, changed)
    }

    /// Tombstones a record. Returns the deletion delta.
    pub fn delete_record(&self, class_id: u32, primary_key: &str) -> DeltaData {
        let mut records = self.inner.records.lock();
        let version = match records.get_mut(&(class_id, primary_key.to_string())) {
            Some(record) => {
                record.deleted = true;
                record.version += 1;
                record.version
            }
            None => 1,
        };
        DeltaData::deletion(class_id, primary_key, version)
    }

    /// The stored record, tombstones included.
    pub fn record(&self, class_id: u32, primary_key: &str) -> Option<StoredRecord> {
        self.inner
            .records
            .lock()
            .get(&(class_id, primary_key.to_string()))
            .cloned()
    }

    // Methods

    /// Scripts `method_id`.
    pub fn on_method<F>(&self, method_id: u32, handler: F)
    where
        F: Fn(&MethodCall) -> MethodOutcome + Send + Sync + 'static,
    {
        self.inner.methods.lock().insert(method_id, Arc::new(handler));
    }

    // Pushes

    /// Pushes a message addressed to this backend's service. Returns how
    /// many connections it reached.
    pub fn push(&self, payload: ServerMessage) -> usize {
        self.push_envelope(PushEnvelope {
            log_context: "push".into(),
            service_id: self.inner.service.id().to_string(),
            service_version: self.inner.service.version().to_string(),
            payload,
        })
    }

    /// Pushes a data update carrying `deltas`.
    pub fn push_update(&self, deltas: Vec<DeltaData>) -> usize {
        self.push(ServerMessage::DataUpdate(DataUpdateMessage { deltas }))
    }

    /// Pushes an envelope as given, whatever service it names.
    pub fn push_envelope(&self, envelope: PushEnvelope) -> usize {
        self.push_raw(envelope.encode())
    }

    /// Pushes arbitrary bytes as a push-message frame.
    pub fn push_raw(&self, payload: Vec<u8>) -> usize {
        let frame = InboundFrame::message(payload).encode();
        let mut connections = self.inner.connections.lock();
        connections.retain(|c| c.send(frame.clone()).is_ok());
        connections.len()
    }

    // Behavior

    /// Console lines attached to every response.
    pub fn set_console_log(&self, lines: Vec<String>) {
        *self.inner.console_log.lock() = lines;
    }

    /// Protocol version reported in responses; `None` omits it.
    pub fn set_response_version(&self, version: Option<u16>) {
        *self.inner.response_version.lock() = version;
    }

    /// When set, requests are logged but never answered.
    pub fn set_unresponsive(&self, unresponsive: bool) {
        self.inner.unresponsive.store(unresponsive, Ordering::SeqCst);
    }

    /// Closes every open channel from the server side.
    pub fn drop_connections(&self) {
        self.inner.connections.lock().clear();
        for task in self.inner.tasks.lock().drain(..) {
            task.abort();
        }
    }

    // Inspection

    /// Every request received, in order.
    pub fn requests(&self) -> Vec<RequestEnvelope> {
        self.inner.requests.lock().clone()
    }

    /// Number of requests received.
    pub fn request_count(&self) -> usize {
        self.inner.requests.lock().len()
    }

    /// Waits until at least `count` requests have arrived.
    ///
    /// # Panics
    ///
    /// Panics after five seconds.
    pub async fn wait_for_requests(&self, count: usize) {
        let wait = async {
            while self.request_count() < count {
                tokio::time::sleep(Duration::from_millis(2)).await;
            }
        };
        if tokio::time::timeout(Duration::from_secs(5), wait).await.is_err() {
            panic!("timed out waiting for {count} requests");
        }
    }

    /// Parameters of every channel opened so far.
    pub fn connect_params(&self) -> Vec<ConnectParams> {
        self.inner.params.lock().clone()
    }

    /// Number of channels opened so far.
    pub fn connection_count(&self) -> usize {
        self.inner.params.lock().len()
    }

    /// True if some client subscribed to events of `class_id` from `source`.
    pub fn is_event_subscribed(&self, class_id: u32, source: &EncodedValue) -> bool {
        self.inner
            .event_subscriptions
            .lock()
            .iter()
            .any(|t| t.class_id == class_id && &t.source == source)
    }

    /// True if some client subscribed to updates of the record.
    pub fn is_record_subscribed(&self, class_id: u32, primary_key: &str) -> bool {
        self.inner
            .record_subscriptions
            .lock()
            .contains(&(class_id, primary_key.to_string()))
    }
}

impl std::fmt::Debug for FakeBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FakeBackend")
            .field("service", &self.inner.service)
            .field("records", &self.inner.records.lock().len())
            .field("requests", &self.request_count())
            .finish()
    }
}

async fn accept_loop(inner: Arc<BackendInner>, mut listener: MemoryListener) {
    while let Some(connection) = listener.accept().await {
        inner.params.lock().push(connection.params().clone());
        inner.connections.lock().push(connection.sender());
        let task = tokio::spawn(serve_connection(Arc::clone(&inner), connection));
        inner.tasks.lock().push(task);
    }
}

async fn serve_connection(inner: Arc<BackendInner>, mut connection: MemoryConnection) {
    while let Some(bytes) = connection.recv().await {
        let frame = match OutboundFrame::decode(&bytes) {
            Ok(frame) => frame,
            Err(e) => {
                warn!(error = %e, "backend dropped malformed frame");
                continue;
            }
        };
        let mut response = match RequestEnvelope::decode(&frame.payload) {
            Ok(request) => {
                inner.requests.lock().push(request.clone());
                if inner.unresponsive.load(Ordering::SeqCst) {
                    continue;
                }
                debug!(kind = ?request.kind(), "backend handling request");
                inner.handle(request)
            }
            Err(e) => ResponseEnvelope::error(
                PlatformErrorCode::InvalidRequest.code(),
                Some(e.to_string()),
            ),
        };
        response.console_log = inner.console_log.lock().clone();
        response.protocol_version = *inner.response_version.lock();
        let reply = InboundFrame::response(frame.request_id, response.encode()).encode();
        if !connection.send(reply) {
            break;
        }
    }
}

fn ack() -> WireValue {
    WireValue::Map(Vec::new())
}

impl BackendInner {
    fn handle(&self, request: RequestEnvelope) -> ResponseEnvelope {
        if !self
            .service
            .matches(&request.service_id, &request.service_version)
        {
            return ResponseEnvelope::error(
                PlatformErrorCode::ServiceMismatch.code(),
                Some(format!(
                    "{}@{} is not hosted here",
                    request.service_id, request.service_version
                )),
            );
        }
        match request.body {
            RequestBody::GetData(target) => {
                let snapshot = self.snapshot(&target);
                ResponseEnvelope::ok(GetDataResponse { snapshot }.to_wire(), Vec::new())
            }
            RequestBody::SaveData(save) => match self.save(save.referenced_deltas) {
                Ok(deltas) => ResponseEnvelope::ok(
                    ack(),
                    vec![ServerMessage::DataUpdate(DataUpdateMessage { deltas })],
                ),
                Err(response) => response,
            },
            RequestBody::CallMethod(call) => self.call(call),
            RequestBody::SubscribeEvent(target) => {
                self.event_subscriptions.lock().push(target);
                ResponseEnvelope::ok(ack(), Vec::new())
            }
            RequestBody::UnsubscribeEvent(target) => {
                let mut subscriptions = self.event_subscriptions.lock();
                if let Some(pos) = subscriptions.iter().position(|t| *t == target) {
                    subscriptions.remove(pos);
                }
                ResponseEnvelope::ok(ack(), Vec::new())
            }
            RequestBody::SubscribeDataUpdates(target) => {
                self.record_subscriptions
                    .lock()
                    .insert((target.class_id, target.primary_key));
                ResponseEnvelope::ok(ack(), Vec::new())
            }
            RequestBody::UnsubscribeDataUpdates(target) => {
                self.record_subscriptions
                    .lock()
                    .remove(&(target.class_id, target.primary_key));
                ResponseEnvelope::ok(ack(), Vec::new())
            }
        }
    }

    fn snapshot(&self, target: &RecordTarget) -> DeltaData {
        let records = self.records.lock();
        match records.get(&(target.class_id, target.primary_key.clone())) {
            Some(record) if !record.deleted => DeltaData::update(
                target.class_id,
                target.primary_key.as_str(),
                record.version,
                record.properties.clone(),
            ),
            Some(record) => {
                DeltaData::deletion(target.class_id, target.primary_key.as_str(), record.version)
            }
            None => DeltaData::deletion(target.class_id, target.primary_key.as_str(), 0),
        }
    }

    /// Stores every snapshot or nothing. Each must be based on the stored
    /// version (0 for a new record).
    fn save(&self, snapshots: Vec<DeltaData>) -> Result<Vec<DeltaData>, ResponseEnvelope> {
        let mut records = self.records.lock();
        let live_version = |records: &HashMap<RecordId, StoredRecord>, id: &RecordId| {
            records
                .get(id)
                .filter(|r| !r.deleted)
                .map_or(0, |r| r.version)
        };
        for snapshot in &snapshots {
            let id = (snapshot.class_id, snapshot.primary_key.clone());
            let stored = live_version(&*records, &id);
            if snapshot.version != stored {
                return Err(ResponseEnvelope::error(
                    PlatformErrorCode::WriteConflict.code(),
                    Some(format!(
                        "{}:{} is at version {stored}, save was based on {}",
                        snapshot.class_id, snapshot.primary_key, snapshot.version
                    )),
                ));
            }
        }

        let mut applied = Vec::with_capacity(snapshots.len());
        for snapshot in snapshots {
            let id = (snapshot.class_id, snapshot.primary_key.clone());
            let version = live_version(&*records, &id) + 1;
            let removed: Vec<String> = records
                .get(&id)
                .filter(|r| !r.deleted)
                .map(|r| {
                    r.properties
                        .iter()
                        .filter(|p| !snapshot.changed_properties.iter().any(|c| c.name == p.name))
                        .map(|p| p.name.clone())
                        .collect()
                })
                .unwrap_or_default();
            records.insert(
                id,
                StoredRecord {
                    version,
                    properties: snapshot.changed_properties.clone(),
                    deleted: false,
                },
            );
            let mut delta = DeltaData::update(
                snapshot.class_id,
                snapshot.primary_key,
                version,
                snapshot.changed_properties,
            );
            delta.deleted_property_names = removed;
            applied.push(delta);
        }
        Ok(applied)
    }

    fn call(&self, request: CallMethodRequest) -> ResponseEnvelope {
        let handler = self.methods.lock().get(&request.method_id).cloned();
        let Some(handler) = handler else {
            return ResponseEnvelope::error(
                PlatformErrorCode::InvalidRequest.code(),
                Some(format!("unknown method {}", request.method_id)),
            );
        };
        let call = MethodCall {
            target: request.target,
            method_id: request.method_id,
            arguments: request.arguments,
            referenced_deltas: request.referenced_deltas,
        };
        match handler(&call) {
            MethodOutcome::Return { value, messages } => ResponseEnvelope::ok(
                CallMethodResponse {
                    return_value: value,
                }
                .to_wire(),
                messages,
            ),
            MethodOutcome::Exception { message, stack } => ResponseEnvelope::exception(message, stack),
            MethodOutcome::Error(code) => ResponseEnvelope::error(code, None),
        }
    }
}
