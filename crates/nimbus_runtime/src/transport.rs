//! Request correlation and push demultiplexing over one channel.
//!
//! Each open channel runs three tasks:
//!
//! - a writer draining an unbounded queue of encoded frames into the sink
//! - a reader completing pending requests and forwarding push messages
//! - a push worker handing push messages to the registered handlers, one at
//!   a time, in arrival order
//!
//! [`Transport::send`] never queues while the channel is down: it fails with
//! [`ConnectionError::NotReady`] and the caller decides whether to call
//! [`Transport::ensure_ready`] and retry.

use crate::config::{ConnectParams, Credentials, RuntimeConfig};
use crate::connector::{Connector, MessageSink, MessageStream};
use crate::error::{ConnectionError, RuntimeError, RuntimeResult};
use crate::keys::ServiceIdentity;
use async_trait::async_trait;
use bytes::Bytes;
use nimbus_protocol::{FrameKind, InboundFrame, OutboundFrame, ProtocolError, INBOUND_HEADER_LEN};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Weak};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, error, warn};

/// Receives push messages.
#[async_trait]
pub trait PushHandler: Send + Sync {
    /// Handles one push payload (an encoded push envelope).
    async fn handle_push(&self, payload: Bytes) -> RuntimeResult<()>;

    /// Told about a push failure or a channel fault.
    fn fault(&self, error: RuntimeError);
}

type Completion = oneshot::Sender<RuntimeResult<Bytes>>;
type Handlers = Arc<Mutex<Vec<Weak<dyn PushHandler>>>>;

/// One open channel.
struct Link {
    open: AtomicBool,
    outbound: Mutex<Option<mpsc::UnboundedSender<Bytes>>>,
    pending: Mutex<HashMap<u32, Completion>>,
    reader: Mutex<Option<JoinHandle<()>>>,
}

impl Link {
    fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }

    /// Registers a completion for `id` and queues `frame`.
    fn submit(&self, id: u32, frame: Bytes, completion: Completion) -> Result<(), ConnectionError> {
        let mut pending = self.pending.lock();
        if !self.is_open() {
            return Err(ConnectionError::NotReady);
        }
        let outbound = self.outbound.lock();
        let Some(outbound) = outbound.as_ref() else {
            return Err(ConnectionError::NotReady);
        };
        outbound
            .send(frame)
            .map_err(|_| ConnectionError::NotReady)?;
        pending.insert(id, completion);
        Ok(())
    }

    fn complete(&self, id: u32, result: RuntimeResult<Bytes>) -> bool {
        match self.pending.lock().remove(&id) {
            Some(completion) => {
                let _ = completion.send(result);
                true
            }
            None => false,
        }
    }

    /// Marks the link closed and rejects everything still outstanding.
    fn close(&self) {
        let rejected: Vec<Completion> = {
            let mut pending = self.pending.lock();
            self.open.store(false, Ordering::SeqCst);
            pending.drain().map(|(_, c)| c).collect()
        };
        self.outbound.lock().take();
        if !rejected.is_empty() {
            debug!(count = rejected.len(), "rejecting outstanding requests");
        }
        for completion in rejected {
            let _ = completion.send(Err(ConnectionError::Closed.into()));
        }
    }
}

/// Request/response correlation over one (service, credentials) channel.
pub struct Transport {
    connector: Arc<dyn Connector>,
    params: ConnectParams,
    max_frame_bytes: usize,
    next_id: AtomicU32,
    connecting: tokio::sync::Mutex<()>,
    link: Mutex<Option<Arc<Link>>>,
    handlers: Handlers,
}

impl Transport {
    /// Creates a transport; no channel is opened until [`Transport::ensure_ready`].
    pub fn new(connector: Arc<dyn Connector>, params: ConnectParams, max_frame_bytes: usize) -> Self {
        Self {
            connector,
            params,
            max_frame_bytes,
            next_id: AtomicU32::new(1),
            connecting: tokio::sync::Mutex::new(()),
            link: Mutex::new(None),
            handlers: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// True if a channel is open.
    pub fn is_ready(&self) -> bool {
        self.link.lock().as_ref().is_some_and(|l| l.is_open())
    }

    fn open_link(&self) -> Option<Arc<Link>> {
        self.link.lock().as_ref().filter(|l| l.is_open()).cloned()
    }

    /// Opens a channel unless one is already open. A stale channel is
    /// discarded and rebuilt.
    pub async fn ensure_ready(&self) -> RuntimeResult<()> {
        let _connecting = self.connecting.lock().await;
        if self.is_ready() {
            return Ok(());
        }
        let channel = self.connector.connect(&self.params).await?;
        debug!(url = %self.params.url, "channel open");

        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
        let (push_tx, push_rx) = mpsc::unbounded_channel();
        let link = Arc::new(Link {
            open: AtomicBool::new(true),
            outbound: Mutex::new(Some(outbound_tx)),
            pending: Mutex::new(HashMap::new()),
            reader: Mutex::new(None),
        });

        tokio::spawn(write_loop(channel.sink, outbound_rx, Arc::clone(&link)));
        tokio::spawn(push_loop(push_rx, Arc::clone(&self.handlers)));
        let reader = tokio::spawn(read_loop(
            channel.stream,
            Arc::clone(&link),
            push_tx,
            Arc::clone(&self.handlers),
            self.max_frame_bytes,
        ));
        *link.reader.lock() = Some(reader);

        if let Some(stale) = self.link.lock().replace(link) {
            stale.close();
        }
        Ok(())
    }

    /// Sends one request payload and waits for its response payload.
    pub async fn send(&self, payload: Bytes) -> RuntimeResult<Bytes> {
        let link = self.open_link().ok_or(ConnectionError::NotReady)?;
        let id = self.next_request_id();
        let frame = OutboundFrame::new(id, payload).encode()?;
        let (tx, rx) = oneshot::channel();
        link.submit(id, frame, tx)?;
        rx.await.map_err(|_| ConnectionError::Closed)?
    }

    fn next_request_id(&self) -> u32 {
        loop {
            let id = self.next_id.fetch_add(1, Ordering::SeqCst);
            if id != 0 {
                return id;
            }
        }
    }

    /// Registers a push handler. Handlers are held weakly and dropped once
    /// their owner is gone.
    pub fn add_push_handler(&self, handler: Weak<dyn PushHandler>) {
        let mut handlers = self.handlers.lock();
        handlers.retain(|h| h.strong_count() > 0);
        handlers.push(handler);
    }

    /// Closes the channel, rejecting outstanding requests.
    pub fn shutdown(&self) {
        if let Some(link) = self.link.lock().take() {
            link.close();
            if let Some(reader) = link.reader.lock().take() {
                reader.abort();
            }
            debug!(url = %self.params.url, "channel shut down");
        }
    }
}

impl std::fmt::Debug for Transport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Transport")
            .field("url", &self.params.url)
            .field("ready", &self.is_ready())
            .finish()
    }
}

fn live_handlers(handlers: &Handlers) -> Vec<Arc<dyn PushHandler>> {
    handlers.lock().iter().filter_map(Weak::upgrade).collect()
}

fn report_fault(handlers: &Handlers, error: RuntimeError) {
    error!(%error, "channel fault");
    for handler in live_handlers(handlers) {
        handler.fault(error.clone());
    }
}

async fn write_loop(
    mut sink: Box<dyn MessageSink>,
    mut outbound: mpsc::UnboundedReceiver<Bytes>,
    link: Arc<Link>,
) {
    while let Some(frame) = outbound.recv().await {
        if let Err(e) = sink.send(frame).await {
            debug!(error = %e, "write failed");
            link.close();
            break;
        }
    }
    sink.close().await;
}

async fn read_loop(
    mut stream: Box<dyn MessageStream>,
    link: Arc<Link>,
    push: mpsc::UnboundedSender<Bytes>,
    handlers: Handlers,
    max_frame_bytes: usize,
) {
    while let Some(message) = stream.next().await {
        let bytes = match message {
            Ok(bytes) => bytes,
            Err(e) => {
                debug!(error = %e, "read failed");
                break;
            }
        };
        if bytes.len() > max_frame_bytes {
            let error = ProtocolError::FrameTooLarge {
                len: bytes.len(),
                max: max_frame_bytes,
            };
            // Fail the request it answers, if the header says which.
            let header = bytes.slice(..INBOUND_HEADER_LEN.min(bytes.len()));
            if let Ok(frame) = InboundFrame::decode(header) {
                if frame.kind == FrameKind::Response
                    && link.complete(frame.correlation_id, Err(error.clone().into()))
                {
                    continue;
                }
            }
            report_fault(&handlers, error.into());
            continue;
        }
        let frame = match InboundFrame::decode(bytes) {
            Ok(frame) => frame,
            Err(e) => {
                report_fault(&handlers, e.into());
                continue;
            }
        };
        match frame.kind {
            FrameKind::Response => {
                if !link.complete(frame.correlation_id, Ok(frame.payload)) {
                    warn!(correlation_id = frame.correlation_id, "response for unknown request dropped");
                }
            }
            FrameKind::Message => {
                let _ = push.send(frame.payload);
            }
        }
    }
    link.close();
    debug!("channel closed");
}

async fn push_loop(mut push: mpsc::UnboundedReceiver<Bytes>, handlers: Handlers) {
    while let Some(payload) = push.recv().await {
        for handler in live_handlers(&handlers) {
            if let Err(e) = handler.handle_push(payload.clone()).await {
                error!(error = %e, "push handler failed");
                handler.fault(e);
            }
        }
    }
}

/// Keeps exactly one transport per (service, credentials).
pub struct TransportPool {
    connector: Arc<dyn Connector>,
    transports: Mutex<HashMap<(ServiceIdentity, Credentials), Arc<Transport>>>,
}

impl TransportPool {
    /// Creates a pool that opens channels through `connector`.
    pub fn new(connector: Arc<dyn Connector>) -> Self {
        Self {
            connector,
            transports: Mutex::new(HashMap::new()),
        }
    }

    /// The transport for `config`'s service and credentials, created on
    /// first use.
    pub fn get(&self, config: &RuntimeConfig) -> Arc<Transport> {
        let key = (config.service.clone(), config.credentials.clone());
        let mut transports = self.transports.lock();
        Arc::clone(transports.entry(key).or_insert_with(|| {
            Arc::new(Transport::new(
                Arc::clone(&self.connector),
                config.connect_params(),
                config.max_frame_bytes,
            ))
        }))
    }

    /// Number of transports.
    pub fn len(&self) -> usize {
        self.transports.lock().len()
    }

    /// True if no transport has been created.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Shuts down and forgets every transport.
    pub fn shutdown(&self) {
        let transports: Vec<_> = self.transports.lock().drain().map(|(_, t)| t).collect();
        for transport in transports {
            transport.shutdown();
        }
    }
}

impl std::fmt::Debug for TransportPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransportPool")
            .field("transports", &self.len())
            .finish()
    }
}
