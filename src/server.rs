use crate::metrics::MonitoringService;
use crate::proto::{self, MsgKind, RpcFrame};
use bytes::BytesMut;
use crossfire::mpmc;
use crossfire::{MAsyncRx, MAsyncTx};
use futures::future::BoxFuture;
use futures::FutureExt;
use logbus_rpc_core::error::RpcError;
use logbus_rpc_core::idle::IdleStrategy;
use logbus_rpc_core::transport::{OfferOutcome, Publication, Subscription};
use logbus_rpc_core::Serializer;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::task::JoinHandle;

/// Server-side knobs. Engine construction validates them.
#[derive(Clone)]
pub struct ServerConfig {
    /// Worker tasks executing handlers off the poll loop.
    pub workers: usize,
    /// Bounded job queue; a full queue rejects with `Overloaded`.
    pub queue_capacity: usize,
    /// Frames drained from the request subscription per poll cycle.
    pub fragment_limit: usize,
    /// Budget for one back-pressured reply emission before it is dropped.
    pub send_deadline: Duration,
    /// Pause policy for empty poll cycles and back-pressured offers.
    pub idle: IdleStrategy,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            workers: std::thread::available_parallelism().map(|n| n.get()).unwrap_or(4),
            queue_capacity: 1000,
            fragment_limit: 10,
            send_deadline: Duration::from_secs(5),
            idle: IdleStrategy::default(),
        }
    }
}

impl ServerConfig {
    pub fn with_workers(mut self, workers: usize) -> Self {
        self.workers = workers;
        self
    }

    pub fn with_queue_capacity(mut self, capacity: usize) -> Self {
        self.queue_capacity = capacity;
        self
    }

    pub fn with_fragment_limit(mut self, limit: usize) -> Self {
        self.fragment_limit = limit;
        self
    }

    pub fn with_send_deadline(mut self, deadline: Duration) -> Self {
        self.send_deadline = deadline;
        self
    }

    pub fn with_idle(mut self, idle: IdleStrategy) -> Self {
        self.idle = idle;
        self
    }

    pub fn validate(&self) -> Result<(), RpcError> {
        if self.workers == 0 {
            return Err(RpcError::InvalidConfig("workers must be positive"));
        }
        if self.queue_capacity == 0 {
            return Err(RpcError::InvalidConfig("queue_capacity must be positive"));
        }
        if self.fragment_limit == 0 {
            return Err(RpcError::InvalidConfig("fragment_limit must be positive"));
        }
        if self.send_deadline.is_zero() {
            return Err(RpcError::InvalidConfig("send_deadline must be positive"));
        }
        Ok(())
    }
}

const STATE_NEW: u8 = 0;
const STATE_STARTING: u8 = 1;
const STATE_RUNNING: u8 = 2;
const STATE_CLOSING: u8 = 3;
const STATE_CLOSED: u8 = 4;

/// Request handler returning one reply.
pub trait UnaryHandler: Send + Sync + 'static {
    fn handle(&self, payload: Vec<u8>) -> BoxFuture<'static, Result<Vec<u8>, RpcError>>;
}

impl<F, Fut> UnaryHandler for F
where
    F: Fn(Vec<u8>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Vec<u8>, RpcError>> + Send + 'static,
{
    #[inline]
    fn handle(&self, payload: Vec<u8>) -> BoxFuture<'static, Result<Vec<u8>, RpcError>> {
        (self)(payload).boxed()
    }
}

/// Request handler emitting zero or more values through a [`StreamSink`].
///
/// A returned `Err` reaches the client as the stream's terminal error if
/// the sink has not already terminated.
pub trait StreamingHandler: Send + Sync + 'static {
    fn handle(&self, payload: Vec<u8>, sink: StreamSink) -> BoxFuture<'static, Result<(), RpcError>>;
}

impl<F, Fut> StreamingHandler for F
where
    F: Fn(Vec<u8>, StreamSink) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<(), RpcError>> + Send + 'static,
{
    #[inline]
    fn handle(
        &self, payload: Vec<u8>, sink: StreamSink,
    ) -> BoxFuture<'static, Result<(), RpcError>> {
        (self)(payload, sink).boxed()
    }
}

enum Handler {
    Unary(Arc<dyn UnaryHandler>),
    Streaming(Arc<dyn StreamingHandler>),
}

impl Clone for Handler {
    fn clone(&self) -> Self {
        match self {
            Self::Unary(h) => Self::Unary(h.clone()),
            Self::Streaming(h) => Self::Streaming(h.clone()),
        }
    }
}

type Job = BoxFuture<'static, ()>;

/// Server dispatch engine: polls the request stream, dispatches to
/// registered handlers on a bounded worker pool, and emits
/// RESPONSE / ERROR / COMPLETE frames carrying the request's
/// correlation id.
pub struct RpcServer<S: Serializer> {
    inner: Arc<ServerInner<S>>,
    subscription: Mutex<Option<Box<dyn Subscription>>>,
    job_rx: MAsyncRx<Job>,
    handles: Mutex<Vec<JoinHandle<()>>>,
}

struct ServerInner<S: Serializer> {
    config: ServerConfig,
    serializer: Arc<S>,
    emitter: Arc<ReplyEmitter>,
    services: Mutex<HashMap<String, Handler>>,
    state: AtomicU8,
    job_tx: Mutex<Option<MAsyncTx<Job>>>,
    monitoring: Arc<MonitoringService>,
}

impl<S: Serializer> RpcServer<S> {
    pub fn new(
        config: ServerConfig, subscription: Box<dyn Subscription>,
        publication: Arc<dyn Publication>, serializer: S, monitoring: Arc<MonitoringService>,
    ) -> Result<Self, RpcError> {
        config.validate()?;
        let (job_tx, job_rx) = mpmc::bounded_async(config.queue_capacity);
        let emitter = Arc::new(ReplyEmitter {
            publication,
            idle: config.idle,
            send_deadline: config.send_deadline,
            monitoring: monitoring.clone(),
        });
        Ok(Self {
            inner: Arc::new(ServerInner {
                config,
                serializer: Arc::new(serializer),
                emitter,
                services: Mutex::new(HashMap::new()),
                state: AtomicU8::new(STATE_NEW),
                job_tx: Mutex::new(Some(job_tx)),
                monitoring,
            }),
            subscription: Mutex::new(Some(subscription)),
            job_rx,
            handles: Mutex::new(Vec::new()),
        })
    }

    /// Register a unary handler. Fails on duplicate names.
    pub fn register(&self, name: &str, handler: impl UnaryHandler) -> Result<(), RpcError> {
        self.inner.add_handler(name, Handler::Unary(Arc::new(handler)))
    }

    /// Register a streaming handler. Fails on duplicate names.
    pub fn register_streaming(
        &self, name: &str, handler: impl StreamingHandler,
    ) -> Result<(), RpcError> {
        self.inner.add_handler(name, Handler::Streaming(Arc::new(handler)))
    }

    /// Register a unary handler with typed request/response going through
    /// the engine's serializer.
    pub fn register_typed<Req, Resp, F, Fut>(&self, name: &str, handler: F) -> Result<(), RpcError>
    where
        Req: DeserializeOwned + Send + 'static,
        Resp: Serialize + Send + 'static,
        F: Fn(Req) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Resp, RpcError>> + Send + 'static,
    {
        let serializer = self.inner.serializer.clone();
        let adapter = move |payload: Vec<u8>| {
            let invoked = serializer.deserialize::<Req>(&payload).map(&handler);
            let serializer = serializer.clone();
            async move {
                let response = invoked?.await?;
                serializer.serialize(&response)
            }
        };
        self.register(name, adapter)
    }

    /// Spawn the poll loop and worker pool. Fails unless the server is NEW.
    pub fn start(&self) -> Result<(), RpcError> {
        let inner = &self.inner;
        if inner
            .state
            .compare_exchange(STATE_NEW, STATE_STARTING, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return Err(RpcError::InvalidState("server already started"));
        }
        let subscription = self
            .subscription
            .lock()
            .unwrap()
            .take()
            .ok_or(RpcError::InvalidState("subscription already taken"))?;
        let job_tx = inner
            .job_tx
            .lock()
            .unwrap()
            .clone()
            .ok_or(RpcError::InvalidState("server already closed"))?;

        // poll loop checks for RUNNING, set it before the tasks spawn
        inner.state.store(STATE_RUNNING, Ordering::Release);

        let mut handles = self.handles.lock().unwrap();
        handles.push(spawn_poll_loop(inner.clone(), subscription, job_tx));
        for worker in 0..inner.config.workers {
            let job_rx = self.job_rx.clone();
            handles.push(tokio::spawn(async move {
                while let Ok(job) = job_rx.recv().await {
                    job.await;
                }
                trace!("rpc server: worker {} exits", worker);
            }));
        }
        info!("rpc server started with {} workers", inner.config.workers);
        Ok(())
    }

    #[inline]
    pub fn is_running(&self) -> bool {
        self.inner.state.load(Ordering::Acquire) == STATE_RUNNING
    }

    #[inline]
    pub fn monitoring(&self) -> &Arc<MonitoringService> {
        &self.inner.monitoring
    }

    /// Graceful shutdown: stop polling, drain queued jobs, release the
    /// transport pair. Idempotent; a NEW server goes straight to CLOSED.
    pub async fn close(&self) {
        let inner = &self.inner;
        if inner
            .state
            .compare_exchange(STATE_RUNNING, STATE_CLOSING, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            // never started, or another close in flight
            let _ = inner.state.compare_exchange(
                STATE_NEW,
                STATE_CLOSED,
                Ordering::AcqRel,
                Ordering::Acquire,
            );
            return;
        }
        // poll task exits on the state change; dropping the sender lets
        // the workers drain the queue and stop
        inner.job_tx.lock().unwrap().take();
        let handles: Vec<JoinHandle<()>> = self.handles.lock().unwrap().drain(..).collect();
        for handle in handles {
            let _ = handle.await;
        }
        inner.emitter.publication.close();
        inner.state.store(STATE_CLOSED, Ordering::Release);
        info!("rpc server closed");
    }
}

impl<S: Serializer> Drop for RpcServer<S> {
    fn drop(&mut self) {
        // best-effort teardown when close() was never awaited: the poll
        // task exits on the state change, workers on the dropped sender
        if self.inner.state.load(Ordering::Acquire) == STATE_RUNNING {
            self.inner.state.store(STATE_CLOSING, Ordering::Release);
            self.inner.job_tx.lock().unwrap().take();
            self.inner.emitter.publication.close();
        }
    }
}

impl<S: Serializer> ServerInner<S> {
    fn add_handler(&self, name: &str, handler: Handler) -> Result<(), RpcError> {
        let mut services = self.services.lock().unwrap();
        if services.contains_key(name) {
            return Err(RpcError::DuplicateService(name.to_string()));
        }
        services.insert(name.to_string(), handler);
        debug!("rpc server: service {} registered", name);
        Ok(())
    }

    /// Runs on the poll task: decode, account, dispatch. Must never block.
    fn on_request_frame(&self, frame: &[u8], job_tx: &MAsyncTx<Job>) {
        let parsed = match RpcFrame::decode(frame) {
            Ok(parsed) => parsed,
            Err(e) => {
                warn!("rpc server: dropping frame: {}", e);
                return;
            }
        };
        if parsed.kind != MsgKind::Request {
            trace!("rpc server: ignoring non-request frame {}", parsed.request_id);
            return;
        }
        let service = parsed.service;
        self.monitoring.record_request(service);

        let handler = { self.services.lock().unwrap().get(service).cloned() };
        let Some(handler) = handler else {
            debug!("rpc server: no handler for {}", service);
            self.monitoring.record_error(service, false);
            self.emitter.emit_no_wait(
                parsed.request_id,
                &RpcError::ServiceNotFound(service.to_string()),
                service,
            );
            return;
        };

        let job = self.make_job(handler, parsed.request_id, service.to_string(),
            parsed.method.to_string(), parsed.payload.to_vec());
        if job_tx.try_send(job).is_err() {
            warn!("rpc server: worker queue full, rejecting request {}", parsed.request_id);
            self.monitoring.record_error(service, false);
            self.emitter.emit_no_wait(parsed.request_id, &RpcError::Overloaded, service);
        }
    }

    fn make_job(
        &self, handler: Handler, request_id: u64, service: String, method: String,
        payload: Vec<u8>,
    ) -> Job {
        let emitter = self.emitter.clone();
        let monitoring = self.monitoring.clone();
        match handler {
            Handler::Unary(handler) => async move {
                let started = Instant::now();
                match handler.handle(payload).await {
                    Ok(response) => {
                        let took = started.elapsed();
                        if emitter
                            .emit(request_id, MsgKind::Response, &response, &service)
                            .await
                            .is_ok()
                        {
                            monitoring.record_response(&service, response.len() as u64, took);
                        }
                    }
                    Err(e) => {
                        debug!("rpc server: {}/{} req {} failed: {}", service, method, request_id, e);
                        monitoring.record_error(&service, false);
                        let _ = emitter.emit_error(request_id, &e, &service).await;
                    }
                }
            }
            .boxed(),
            Handler::Streaming(handler) => async move {
                let sink = StreamSink::new(request_id, service.clone(), emitter);
                if let Err(e) = handler.handle(payload, sink.clone()).await {
                    debug!("rpc server: stream {}/{} req {} failed: {}", service, method, request_id, e);
                    monitoring.record_error(&service, false);
                    sink.on_error(e).await;
                }
            }
            .boxed(),
        }
    }
}

fn spawn_poll_loop<S: Serializer>(
    inner: Arc<ServerInner<S>>, mut subscription: Box<dyn Subscription>, job_tx: MAsyncTx<Job>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut attempt = 0u32;
        while inner.state.load(Ordering::Acquire) == STATE_RUNNING {
            let read = subscription
                .poll(&mut |frame| inner.on_request_frame(frame, &job_tx), inner.config.fragment_limit);
            if read == 0 {
                inner.config.idle.idle(attempt).await;
                attempt = attempt.saturating_add(1);
            } else {
                attempt = 0;
                tokio::task::yield_now().await;
            }
        }
        subscription.close();
        trace!("rpc server: poller exits");
    })
}

/// Reply write path shared by all emissions of one server.
struct ReplyEmitter {
    publication: Arc<dyn Publication>,
    idle: IdleStrategy,
    send_deadline: Duration,
    monitoring: Arc<MonitoringService>,
}

impl ReplyEmitter {
    /// Offer with back-pressure handling, bounded by the send deadline.
    /// On exceeding it the reply is dropped (counted) and one last ERROR
    /// offer is attempted so the client can fail fast.
    async fn emit(
        &self, request_id: u64, kind: MsgKind, payload: &[u8], service: &str,
    ) -> Result<(), RpcError> {
        let mut buf = BytesMut::with_capacity(proto::wire_len("", "", payload.len()));
        proto::encode_into(&mut buf, request_id, kind, "", "", payload);
        let deadline = Instant::now() + self.send_deadline;
        let mut attempt = 0u32;
        loop {
            match self.publication.offer(&buf) {
                OfferOutcome::Accepted => return Ok(()),
                OfferOutcome::Closed => {
                    debug!("rpc server: reply {} dropped, publication closed", request_id);
                    return Err(RpcError::Closed);
                }
                OfferOutcome::BackPressure => {
                    if Instant::now() > deadline {
                        warn!("rpc server: reply {} dropped after send deadline", request_id);
                        self.monitoring.record_dropped_reply(service);
                        self.emit_no_wait(request_id, &RpcError::Overloaded, service);
                        return Err(RpcError::SendTimeout);
                    }
                    self.idle.idle(attempt).await;
                    attempt = attempt.saturating_add(1);
                }
            }
        }
    }

    #[inline]
    async fn emit_error(&self, request_id: u64, err: &RpcError, service: &str) -> Result<(), RpcError> {
        self.emit(request_id, MsgKind::Error, err.to_wire().as_bytes(), service).await
    }

    /// Single-attempt ERROR emission, safe on the poll task.
    fn emit_no_wait(&self, request_id: u64, err: &RpcError, service: &str) {
        let payload = err.to_wire();
        let mut buf = BytesMut::with_capacity(proto::wire_len("", "", payload.len()));
        proto::encode_into(&mut buf, request_id, MsgKind::Error, "", "", payload.as_bytes());
        if self.publication.offer(&buf) != OfferOutcome::Accepted {
            debug!("rpc server: error reply {} dropped", request_id);
            self.monitoring.record_dropped_reply(service);
        }
    }
}

/// Emission handle given to streaming handlers.
///
/// Usable from any worker task: emissions are serialized internally so
/// one stream's frames never interleave. After `on_complete` or
/// `on_error` every further call is silently dropped.
#[derive(Clone)]
pub struct StreamSink {
    inner: Arc<SinkShared>,
}

struct SinkShared {
    request_id: u64,
    service: String,
    emitter: Arc<ReplyEmitter>,
    terminated: AtomicBool,
    emit_order: tokio::sync::Mutex<()>,
}

impl StreamSink {
    fn new(request_id: u64, service: String, emitter: Arc<ReplyEmitter>) -> Self {
        Self {
            inner: Arc::new(SinkShared {
                request_id,
                service,
                emitter,
                terminated: AtomicBool::new(false),
                emit_order: tokio::sync::Mutex::new(()),
            }),
        }
    }

    #[inline]
    pub fn request_id(&self) -> u64 {
        self.inner.request_id
    }

    pub async fn on_next(&self, payload: &[u8]) {
        let shared = &self.inner;
        let _order = shared.emit_order.lock().await;
        if shared.terminated.load(Ordering::Acquire) {
            return;
        }
        let _ = shared
            .emitter
            .emit(shared.request_id, MsgKind::Response, payload, &shared.service)
            .await;
    }

    pub async fn on_error(&self, err: RpcError) {
        let shared = &self.inner;
        let _order = shared.emit_order.lock().await;
        if shared.terminated.swap(true, Ordering::AcqRel) {
            return;
        }
        let _ = shared.emitter.emit_error(shared.request_id, &err, &shared.service).await;
    }

    pub async fn on_complete(&self) {
        let shared = &self.inner;
        let _order = shared.emit_order.lock().await;
        if shared.terminated.swap(true, Ordering::AcqRel) {
            return;
        }
        let _ = shared
            .emitter
            .emit(shared.request_id, MsgKind::Complete, &[], &shared.service)
            .await;
    }
}
