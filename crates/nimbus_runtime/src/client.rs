//! Public operations against one service.
//!
//! Every operation follows the same shape: encode the request, send it,
//! reconcile what comes back into the identity map through a [`Tracker`],
//! then drain the tracker so listeners run against fully resolved state.

use crate::codec::{RequestEncoder, ValueDecoder};
use crate::config::RuntimeConfig;
use crate::error::{RuntimeError, RuntimeResult};
use crate::instance::Instance;
use crate::keys::{ClassKind, EventChannelKey, InstanceKey};
use crate::listeners::{Event, ListenerId, ListenerResult};
use crate::reconciler::Reconciler;
use crate::registry::ClassRegistry;
use crate::state::RuntimeState;
use crate::tracker::{Fetcher, Tracker};
use crate::transport::{PushHandler, Transport, TransportPool};
use crate::value::Value;
use async_trait::async_trait;
use bytes::Bytes;
use nimbus_codec::{EncodedValue, TypeTag, WireValue};
use nimbus_protocol::{
    CallMethodRequest, CallMethodResponse, DataUpdateMessage, EventChannelTarget,
    GetDataResponse, ProtocolError, PushEnvelope, RecordTarget, RequestBody, RequestEnvelope,
    ResponseBody, ResponseEnvelope, SaveDataRequest, ServerMessage,
};
use parking_lot::Mutex;
use std::collections::HashSet;
use std::sync::{Arc, Weak};
use tokio::sync::mpsc;
use tracing::{debug, info};

/// Handle for an event subscription.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EventSubscription {
    channel: EventChannelKey,
    id: ListenerId,
}

impl EventSubscription {
    /// The channel.
    pub fn channel(&self) -> &EventChannelKey {
        &self.channel
    }

    /// The listener id.
    pub fn id(&self) -> ListenerId {
        self.id
    }
}

/// Client for one service.
///
/// Cheap to clone; clones share state and the transport.
#[derive(Clone)]
pub struct Client {
    inner: Arc<ClientInner>,
}

struct ClientInner {
    config: RuntimeConfig,
    state: RuntimeState,
    transport: Arc<Transport>,
    faults_tx: mpsc::UnboundedSender<RuntimeError>,
    faults_rx: Mutex<Option<mpsc::UnboundedReceiver<RuntimeError>>>,
}

impl Client {
    /// Creates a client for `config.service` using `registry`.
    ///
    /// The channel opens lazily on the first request.
    ///
    /// # Errors
    ///
    /// Fails if the registry describes a different service.
    pub fn new(config: RuntimeConfig, registry: ClassRegistry, pool: &TransportPool) -> RuntimeResult<Self> {
        if registry.service() != &config.service {
            return Err(RuntimeError::validation(format!(
                "registry describes {}, config targets {}",
                registry.service(),
                config.service
            )));
        }
        let transport = pool.get(&config);
        let (faults_tx, faults_rx) = mpsc::unbounded_channel();
        let inner = Arc::new(ClientInner {
            config,
            state: RuntimeState::new(registry),
            transport,
            faults_tx,
            faults_rx: Mutex::new(Some(faults_rx)),
        });
        let handler: Weak<dyn PushHandler> = Arc::downgrade(&inner) as Weak<dyn PushHandler>;
        inner.transport.add_push_handler(handler);
        Ok(Self { inner })
    }

    /// Registry, identity map and listener tables.
    pub fn state(&self) -> &RuntimeState {
        &self.inner.state
    }

    /// Configuration.
    pub fn config(&self) -> &RuntimeConfig {
        &self.inner.config
    }

    /// Opens the channel now instead of on the first request.
    pub async fn connect(&self) -> RuntimeResult<()> {
        self.inner.transport.ensure_ready().await
    }

    /// Push-handling failures, available once.
    pub fn take_faults(&self) -> Option<mpsc::UnboundedReceiver<RuntimeError>> {
        self.inner.faults_rx.lock().take()
    }

    /// Closes the channel, rejecting outstanding requests.
    pub fn shutdown(&self) {
        self.inner.transport.shutdown();
    }

    /// Key of a record in this service.
    pub fn record_key(&self, class: &str, primary_key: impl Into<String>) -> RuntimeResult<InstanceKey> {
        Ok(self
            .inner
            .state
            .registry()
            .class_key(class, ClassKind::Record)?
            .instance(primary_key))
    }

    /// Creates an unconfirmed (version 0) record and registers it, so the
    /// first delta from a save adopts it.
    ///
    /// # Errors
    ///
    /// Fails with [`RuntimeError::IdentityConflict`] if a live instance
    /// already occupies the key.
    pub fn create_record(&self, class: &str, primary_key: impl Into<String>) -> RuntimeResult<Instance> {
        let key = self.record_key(class, primary_key)?;
        let state = &self.inner.state;
        let instance = state.registry().create_instance(key)?;
        state.identity().set_instance(&instance)?;
        Ok(instance)
    }

    /// The callable object `primary_key` of `class`.
    pub fn callable(&self, class: &str, primary_key: impl Into<String>) -> RuntimeResult<Instance> {
        let state = &self.inner.state;
        let key = state
            .registry()
            .class_key(class, ClassKind::Callable)?
            .instance(primary_key);
        if let Some(instance) = state.identity().try_get_instance(&key) {
            return Ok(instance);
        }
        let instance = state.registry().create_instance(key)?;
        state.identity().set_instance(&instance)?;
        Ok(instance)
    }

    /// A handle to session `session_id` of `class`. Sessions are not cached.
    pub fn session(&self, class: &str, session_id: impl Into<String>) -> RuntimeResult<Instance> {
        let state = &self.inner.state;
        let key = state
            .registry()
            .class_key(class, ClassKind::Session)?
            .instance(session_id);
        state.registry().create_instance(key)
    }

    /// Fetches the current snapshot of a record.
    ///
    /// Returns `None` if the server reports the record deleted.
    pub async fn get_data(&self, key: &InstanceKey) -> RuntimeResult<Option<Instance>> {
        self.inner.check_target(key, ClassKind::Record)?;
        let mut tracker = Tracker::new();
        let instance = self.inner.fetch(key, &mut tracker).await?;
        tracker.drain(&self.inner.state, &*self.inner).await?;
        Ok(instance)
    }

    /// Invokes `method_id` on `target`.
    ///
    /// Bundled events are applied first, each with its own tracker; bundled
    /// data updates and the return value then share one.
    pub async fn call_method(
        &self,
        target: &Instance,
        method_id: u32,
        arguments: Vec<Value>,
    ) -> RuntimeResult<Value> {
        let inner = &*self.inner;
        if target.kind() == ClassKind::Event {
            return Err(RuntimeError::UnsupportedValueType(format!(
                "{} cannot receive method calls",
                target.key()
            )));
        }

        let mut encoder = RequestEncoder::new(&inner.state);
        let target = encoder.encode(&Value::from(target.clone()))?;
        let arguments = arguments
            .iter()
            .map(|a| encoder.encode(a))
            .collect::<RuntimeResult<Vec<_>>>()?;
        let referenced_deltas = encoder.finish()?;

        let (response, messages) = inner
            .request(RequestBody::CallMethod(CallMethodRequest {
                target,
                method_id,
                arguments,
                referenced_deltas,
            }))
            .await?;
        let response = CallMethodResponse::from_wire(&response)?;

        let mut tracker = Tracker::new();
        inner.apply_bundled(messages, &mut tracker).await?;
        let value = ValueDecoder::new(&inner.state, &mut tracker).decode(&response.return_value)?;
        tracker.drain(&inner.state, inner).await?;
        Ok(value)
    }

    /// Saves records with their full property sets, plus every record they
    /// reference.
    ///
    /// # Errors
    ///
    /// Fails with [`RuntimeError::LocalValidation`], before anything is
    /// sent, if the records span services or repeat a key.
    pub async fn save_data(&self, records: &[Instance]) -> RuntimeResult<()> {
        if records.is_empty() {
            return Ok(());
        }
        let inner = &*self.inner;
        let service = records[0].key().service();
        let mut seen = HashSet::with_capacity(records.len());
        for record in records {
            if record.key().service() != service {
                return Err(RuntimeError::validation(format!(
                    "cannot save {} and {} together: different services",
                    records[0].key(),
                    record.key()
                )));
            }
            if !seen.insert(record.key()) {
                return Err(RuntimeError::validation(format!(
                    "{} appears more than once",
                    record.key()
                )));
            }
        }

        let mut encoder = RequestEncoder::new(&inner.state);
        for record in records {
            encoder.include(record)?;
        }
        let referenced_deltas = encoder.finish()?;

        let (_, messages) = inner
            .request(RequestBody::SaveData(SaveDataRequest { referenced_deltas }))
            .await?;
        let mut tracker = Tracker::new();
        inner.apply_bundled(messages, &mut tracker).await?;
        tracker.drain(&inner.state, inner).await
    }

    /// Subscribes `listener` to events of class `event_class` raised by
    /// `source`. Only the first local subscriber on a channel contacts the
    /// server.
    pub async fn subscribe_event<F>(
        &self,
        event_class: &str,
        source: &Instance,
        listener: F,
    ) -> RuntimeResult<EventSubscription>
    where
        F: Fn(&Event) -> ListenerResult + Send + Sync + 'static,
    {
        let inner = &*self.inner;
        let class = inner
            .state
            .registry()
            .class_key(event_class, ClassKind::Event)?
            .clone();
        let target = inner.channel_target(class.class_id, source.key())?;
        let channel = EventChannelKey::new(class, source.key().clone());

        let (id, first) = inner.state.events().add(channel.clone(), Arc::new(listener));
        if first {
            if let Err(e) = inner.request(RequestBody::SubscribeEvent(target)).await {
                inner.state.events().remove(&channel, id);
                return Err(e);
            }
            debug!(%channel, "event channel subscribed");
        }
        Ok(EventSubscription { channel, id })
    }

    /// Removes an event listener. The last one on a channel unsubscribes
    /// remotely.
    pub async fn unsubscribe_event(&self, subscription: &EventSubscription) -> RuntimeResult<()> {
        let inner = &*self.inner;
        let channel = &subscription.channel;
        if inner.state.events().remove(channel, subscription.id) != Some(true) {
            return Ok(());
        }
        let target = inner.channel_target(channel.event_class.class_id, &channel.source)?;
        inner.request(RequestBody::UnsubscribeEvent(target)).await?;
        Ok(())
    }

    /// Subscribes `listener` to changes of `record`. Listeners stay with
    /// this instance, not with its key.
    pub async fn subscribe_updates<F>(&self, record: &Instance, listener: F) -> RuntimeResult<ListenerId>
    where
        F: Fn(&Instance, bool) -> ListenerResult + Send + Sync + 'static,
    {
        let inner = &*self.inner;
        inner.check_target(record.key(), ClassKind::Record)?;
        let (id, first) = inner
            .state
            .identity()
            .add_update_listener(record, Arc::new(listener));
        if first {
            let target = RecordTarget::new(record.class_id(), record.primary_key());
            if let Err(e) = inner
                .request(RequestBody::SubscribeDataUpdates(target))
                .await
            {
                inner.state.identity().remove_update_listener(record, id);
                return Err(e);
            }
        }
        Ok(id)
    }

    /// Removes an update listener. The last one on the record unsubscribes
    /// remotely.
    pub async fn unsubscribe_updates(&self, record: &Instance, id: ListenerId) -> RuntimeResult<()> {
        let inner = &*self.inner;
        if inner.state.identity().remove_update_listener(record, id) != Some(true) {
            return Ok(());
        }
        let target = RecordTarget::new(record.class_id(), record.primary_key());
        inner
            .request(RequestBody::UnsubscribeDataUpdates(target))
            .await?;
        Ok(())
    }
}

impl std::fmt::Debug for Client {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Client")
            .field("service", self.inner.state.service())
            .field("transport", &self.inner.transport)
            .finish()
    }
}

impl ClientInner {
    /// Sends one request and unpacks the single outcome of its response.
    async fn request(&self, body: RequestBody) -> RuntimeResult<(WireValue, Vec<ServerMessage>)> {
        let service = self.state.service();
        let log_context = self.config.new_log_context();
        let kind = body.kind();
        let mut envelope =
            RequestEnvelope::new(log_context.as_str(), service.id(), service.version(), body);
        envelope.protocol_version = self.config.protocol_version;

        self.transport.ensure_ready().await?;
        let bytes = self.transport.send(Bytes::from(envelope.encode())).await?;
        let response = ResponseEnvelope::decode(&bytes)?;

        for line in &response.console_log {
            info!(target: "nimbus::console", log_context = %log_context, "{line}");
        }
        if let Some(remote) = response.protocol_version {
            if remote != self.config.protocol_version {
                return Err(ProtocolError::VersionMismatch {
                    local: self.config.protocol_version,
                    remote,
                }
                .into());
            }
        }
        match response.body {
            ResponseBody::Ok {
                response,
                bundled_messages,
            } => Ok((response, bundled_messages)),
            ResponseBody::Error {
                error_code,
                message,
            } => {
                debug!(?kind, error_code, %log_context, "request failed");
                Err(RuntimeError::platform(error_code, message))
            }
            ResponseBody::Exception { message, stack } => Err(RuntimeError::Script { message, stack }),
        }
    }

    /// Applies bundled messages: each event with its own drained tracker,
    /// then data updates into `tracker`. A malformed message rejects the
    /// batch before any of it is applied.
    async fn apply_bundled(&self, messages: Vec<ServerMessage>, tracker: &mut Tracker) -> RuntimeResult<()> {
        let reconciler = Reconciler::new(&self.state);
        reconciler.check(&messages)?;
        let mut updates: Vec<DataUpdateMessage> = Vec::new();
        for message in messages {
            match message {
                ServerMessage::Event(event) => {
                    let mut own = Tracker::new();
                    reconciler.apply_event(&event, &mut own)?;
                    own.drain(&self.state, self).await?;
                }
                ServerMessage::DataUpdate(update) => updates.push(update),
            }
        }
        for update in &updates {
            reconciler.apply_data_update(update, tracker)?;
        }
        Ok(())
    }

    fn check_target(&self, key: &InstanceKey, kind: ClassKind) -> RuntimeResult<()> {
        if key.kind() != kind {
            return Err(RuntimeError::UnsupportedValueType(format!(
                "{key} is not a {kind}"
            )));
        }
        if key.service() != self.state.service() {
            return Err(RuntimeError::validation(format!(
                "{key} belongs to another service than {}",
                self.state.service()
            )));
        }
        Ok(())
    }

    fn channel_target(&self, class_id: u32, source: &InstanceKey) -> RuntimeResult<EventChannelTarget> {
        let tag = match source.kind() {
            ClassKind::Record => TypeTag::RecordRef,
            ClassKind::Callable => TypeTag::CallableRef,
            other => {
                return Err(RuntimeError::UnsupportedValueType(format!(
                    "a {other} cannot raise events"
                )))
            }
        };
        self.check_target(source, source.kind())?;
        Ok(EventChannelTarget {
            class_id,
            source: EncodedValue::reference(tag, source.class.class_id, &source.primary_key)?,
        })
    }
}

#[async_trait]
impl Fetcher for ClientInner {
    async fn fetch(&self, key: &InstanceKey, tracker: &mut Tracker) -> RuntimeResult<Option<Instance>> {
        let target = RecordTarget::new(key.class.class_id, key.primary_key.as_str());
        let (response, messages) = self.request(RequestBody::GetData(target)).await?;
        let snapshot = GetDataResponse::from_wire(&response)?.snapshot;
        if snapshot.class_id != key.class.class_id || snapshot.primary_key != key.primary_key {
            return Err(ProtocolError::InvalidField {
                context: "GetDataResponse",
                field: "snapshot",
                expected: "the requested record",
            }
            .into());
        }
        self.apply_bundled(messages, tracker).await?;
        Reconciler::new(&self.state).apply_snapshot(&snapshot, tracker)
    }
}

#[async_trait]
impl PushHandler for ClientInner {
    async fn handle_push(&self, payload: Bytes) -> RuntimeResult<()> {
        let envelope = PushEnvelope::decode(&payload)?;
        let service = self.state.service();
        if !service.matches(&envelope.service_id, &envelope.service_version) {
            return Err(RuntimeError::validation(format!(
                "push addressed to {}@{}, this client serves {service}",
                envelope.service_id, envelope.service_version
            )));
        }
        let reconciler = Reconciler::new(&self.state);
        let mut tracker = Tracker::new();
        match &envelope.payload {
            ServerMessage::DataUpdate(update) => reconciler.apply_data_update(update, &mut tracker)?,
            ServerMessage::Event(event) => reconciler.apply_event(event, &mut tracker)?,
        }
        tracker.drain(&self.state, self).await
    }

    fn fault(&self, error: RuntimeError) {
        let _ = self.faults_tx.send(error);
    }
}
