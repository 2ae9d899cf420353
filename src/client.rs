use crate::balancer::{LoadBalancer, Strategy};
use crate::endpoint::{EndpointResolver, ServiceEndpoint};
use crate::limiter::TokenBucket;
use crate::metrics::MonitoringService;
use crate::pending::{PendingReply, PendingTable, ReplyWaiter, ResponseRoute};
use crate::proto::{self, MsgKind, RpcFrame};
use bytes::BytesMut;
use futures::future::{AbortHandle, Abortable};
use futures::FutureExt;
use logbus_rpc_core::error::RpcError;
use logbus_rpc_core::idle::IdleStrategy;
use logbus_rpc_core::transport::{OfferOutcome, Publication, Subscription};
use logbus_rpc_core::Serializer;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::{Duration, Instant};
use tokio::sync::oneshot;

/// Client-side knobs. Engine construction validates them.
#[derive(Clone)]
pub struct ClientConfig {
    /// Deadline for one request: covers both the offer loop and the reply wait.
    pub request_timeout: Duration,
    /// Frames drained from the response subscription per poll cycle.
    pub fragment_limit: usize,
    /// Pause policy for empty poll cycles and back-pressured offers.
    pub idle: IdleStrategy,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            request_timeout: Duration::from_secs(5),
            fragment_limit: 10,
            idle: IdleStrategy::default(),
        }
    }
}

impl ClientConfig {
    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    pub fn with_fragment_limit(mut self, limit: usize) -> Self {
        self.fragment_limit = limit;
        self
    }

    pub fn with_idle(mut self, idle: IdleStrategy) -> Self {
        self.idle = idle;
        self
    }

    pub fn validate(&self) -> Result<(), RpcError> {
        if self.request_timeout.is_zero() {
            return Err(RpcError::InvalidConfig("request_timeout must be positive"));
        }
        if self.fragment_limit == 0 {
            return Err(RpcError::InvalidConfig("fragment_limit must be positive"));
        }
        Ok(())
    }
}

/// Receives a streaming reply.
///
/// Called from the client's reply-poll task, in wire order; after the
/// terminal signal nothing further is delivered.
pub trait StreamSubscriber: Send + Sync + 'static {
    fn on_next(&self, payload: &[u8]);

    fn on_error(&self, err: RpcError);

    fn on_complete(&self);

    /// Demand is not propagated over the wire; hook for local bookkeeping.
    fn request(&self, _n: u64) {}
}

/// Assembles an [`RpcClient`]: mandatory config + serializer, optional
/// collaborators, then `build` with the transport pair.
pub struct ClientBuilder<S: Serializer> {
    config: ClientConfig,
    serializer: S,
    resolver: Option<Arc<dyn EndpointResolver>>,
    limiter: Option<TokenBucket>,
    strategy: Strategy,
    monitoring: Option<Arc<MonitoringService>>,
}

impl<S: Serializer> ClientBuilder<S> {
    pub fn new(config: ClientConfig, serializer: S) -> Self {
        Self {
            config,
            serializer,
            resolver: None,
            limiter: None,
            strategy: Strategy::default(),
            monitoring: None,
        }
    }

    /// Attach an endpoint resolver; calls fail with `NoEndpoints` when it
    /// returns an empty set.
    pub fn resolver(mut self, resolver: Arc<dyn EndpointResolver>) -> Self {
        self.resolver = Some(resolver);
        self
    }

    /// Attach admission control; denied requests fail fast with `RateLimited`.
    pub fn limiter(mut self, limiter: TokenBucket) -> Self {
        self.limiter = Some(limiter);
        self
    }

    pub fn strategy(mut self, strategy: Strategy) -> Self {
        self.strategy = strategy;
        self
    }

    pub fn monitoring(mut self, monitoring: Arc<MonitoringService>) -> Self {
        self.monitoring = Some(monitoring);
        self
    }

    /// Validate the config, take ownership of the transport pair and
    /// start the reply-poll and reaper tasks.
    ///
    /// Must be called within a tokio runtime.
    pub fn build(
        self, publication: Arc<dyn Publication>, subscription: Box<dyn Subscription>,
    ) -> Result<RpcClient<S>, RpcError> {
        self.config.validate()?;
        let inner = Arc::new(ClientInner {
            config: self.config,
            serializer: self.serializer,
            publication,
            pending: Arc::new(PendingTable::new()),
            // Correlation ids are salted per session: clients sharing a
            // reply stream must not collide, and 2^32 ids per session
            // keep the space monotonic and non-wrapping.
            next_id: AtomicU64::new((rand::random::<u32>() as u64) << 32),
            running: AtomicBool::new(true),
            resolver: self.resolver,
            limiter: self.limiter,
            balancer: LoadBalancer::new(self.strategy),
            monitoring: self.monitoring,
        });
        spawn_reply_poller(inner.clone(), subscription);
        let reaper_abort = spawn_reaper(inner.clone());
        Ok(RpcClient { inner, reaper_abort })
    }
}

/// Client dispatch engine: correlation-table request/response
/// multiplexing over one publication/subscription pair.
///
/// Cheap to share behind an `Arc`; all calls may come from any task.
/// Dropping the client cancels every pending request.
pub struct RpcClient<S: Serializer> {
    inner: Arc<ClientInner<S>>,
    reaper_abort: AbortHandle,
}

struct ClientInner<S: Serializer> {
    config: ClientConfig,
    serializer: S,
    publication: Arc<dyn Publication>,
    pending: Arc<PendingTable>,
    next_id: AtomicU64,
    running: AtomicBool,
    resolver: Option<Arc<dyn EndpointResolver>>,
    limiter: Option<TokenBucket>,
    balancer: LoadBalancer,
    monitoring: Option<Arc<MonitoringService>>,
}

impl<S: Serializer> RpcClient<S> {
    /// Round-trip call: send, then await the unary reply.
    pub async fn call(
        &self, service: &str, method: &str, payload: &[u8],
    ) -> Result<Vec<u8>, RpcError> {
        self.submit(service, method, payload).await?.await
    }

    /// Send a request and return the reply handle without awaiting it.
    ///
    /// Resolution order matches the admission pipeline: limiter, then
    /// resolver, then correlation id assignment and the offer loop.
    pub async fn submit(
        &self, service: &str, method: &str, payload: &[u8],
    ) -> Result<ReplyFuture, RpcError> {
        let inner = &self.inner;
        let (tx, rx) = oneshot::channel();
        let id = inner.admit(service, ReplyWaiter::Unary(tx))?;
        inner.send_request(id, service, method, payload).await?;
        Ok(ReplyFuture { rx })
    }

    /// Start a server-streaming call. Values, errors and the terminal
    /// signal arrive on `subscriber`; the returned handle allows a local
    /// cancel (no wire CANCEL exists).
    pub async fn stream(
        &self, service: &str, method: &str, payload: &[u8], subscriber: Arc<dyn StreamSubscriber>,
    ) -> Result<StreamHandle, RpcError> {
        let inner = &self.inner;
        let id = inner.admit(service, ReplyWaiter::Stream(subscriber))?;
        inner.send_request(id, service, method, payload).await?;
        Ok(StreamHandle { id, pending: inner.pending.clone() })
    }

    /// Typed round trip through the configured serializer.
    pub async fn call_typed<Req, Resp>(
        &self, service: &str, method: &str, request: &Req,
    ) -> Result<Resp, RpcError>
    where
        Req: Serialize,
        Resp: DeserializeOwned,
    {
        let payload = self.inner.serializer.serialize(request)?;
        let raw = self.call(service, method, &payload).await?;
        self.inner.serializer.deserialize(&raw)
    }

    #[inline]
    pub fn pending_requests(&self) -> usize {
        self.inner.pending.len()
    }

    #[inline]
    pub fn content_type(&self) -> &'static str {
        self.inner.serializer.content_type()
    }

    /// Stop the poll task and reaper, cancel every pending request and
    /// close the transport pair. Idempotent.
    pub fn close(&self) {
        if !self.inner.running.swap(false, Ordering::AcqRel) {
            return;
        }
        self.reaper_abort.abort();
        let drained = self.inner.pending.drain();
        if !drained.is_empty() {
            info!("rpc client: cancelling {} pending requests on close", drained.len());
        }
        for (id, entry) in drained {
            trace!("rpc client: request {} cancelled", id);
            entry.complete(Err(RpcError::Cancelled));
        }
        self.inner.publication.close();
    }
}

impl<S: Serializer> Drop for RpcClient<S> {
    fn drop(&mut self) {
        self.close();
    }
}

impl<S: Serializer> ClientInner<S> {
    /// Admission pipeline up to and including table registration.
    fn admit(&self, service: &str, waiter: ReplyWaiter) -> Result<u64, RpcError> {
        if !self.running.load(Ordering::Acquire) {
            return Err(RpcError::InvalidState("client is closed"));
        }
        if let Some(limiter) = &self.limiter {
            if !limiter.try_acquire() {
                debug!("rpc client: rate limiter denied call to {}", service);
                return Err(RpcError::RateLimited);
            }
        }
        let now = Instant::now();
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let entry = PendingReply {
            waiter,
            service: service.to_string(),
            deadline: now + self.config.request_timeout,
            created_at: now,
        };
        self.pending.insert(id, entry)?;
        if let Some(monitoring) = &self.monitoring {
            monitoring.record_request(service);
        }
        Ok(id)
    }

    async fn send_request(
        &self, id: u64, service: &str, method: &str, payload: &[u8],
    ) -> Result<(), RpcError> {
        let endpoint = match self.pick_endpoint(service) {
            Ok(ep) => ep,
            Err(e) => {
                self.pending.remove(id);
                return Err(e);
            }
        };
        let mut buf = BytesMut::with_capacity(proto::wire_len(service, method, payload.len()));
        proto::encode_into(&mut buf, id, MsgKind::Request, service, method, payload);

        let track_connections = self.balancer.strategy() == Strategy::LeastConnections;
        if track_connections {
            if let Some(ep) = &endpoint {
                self.balancer.increment_connections(ep);
            }
        }
        let deadline = Instant::now() + self.config.request_timeout;
        let result = self.offer_until_accepted(&buf, deadline).await;
        if track_connections {
            if let Some(ep) = &endpoint {
                self.balancer.decrement_connections(ep);
            }
        }

        if let Err(e) = &result {
            warn!("rpc client: sending request {} to {} failed: {}", id, service, e);
            self.pending.remove(id);
            if let Some(monitoring) = &self.monitoring {
                monitoring.record_error(service, e.is_timeout());
            }
        } else {
            trace!("rpc client: request {} to {}/{} sent", id, service, method);
        }
        result
    }

    fn pick_endpoint(&self, service: &str) -> Result<Option<ServiceEndpoint>, RpcError> {
        let Some(resolver) = &self.resolver else {
            return Ok(None);
        };
        let endpoints = resolver.find_endpoints(service);
        if endpoints.is_empty() {
            return Err(RpcError::NoEndpoints(service.to_string()));
        }
        Ok(self.balancer.select(service, &endpoints).cloned())
    }

    /// Busy-offer with the configured idle strategy between rejections.
    async fn offer_until_accepted(&self, frame: &[u8], deadline: Instant) -> Result<(), RpcError> {
        let mut attempt = 0u32;
        loop {
            match self.publication.offer(frame) {
                OfferOutcome::Accepted => return Ok(()),
                OfferOutcome::Closed => return Err(RpcError::Closed),
                OfferOutcome::BackPressure => {
                    if Instant::now() > deadline {
                        return Err(RpcError::SendTimeout);
                    }
                    self.config.idle.idle(attempt).await;
                    attempt = attempt.saturating_add(1);
                }
            }
        }
    }

    /// Runs on the reply-poll task, the sole completion writer.
    fn on_reply_frame(&self, frame: &[u8]) {
        let parsed = match RpcFrame::decode(frame) {
            Ok(parsed) => parsed,
            Err(e) => {
                warn!("rpc client: dropping frame: {}", e);
                return;
            }
        };
        let id = parsed.request_id;
        match parsed.kind {
            MsgKind::Request => {
                trace!("rpc client: ignoring REQUEST frame {} on response stream", id);
            }
            MsgKind::Response => match self.pending.route_response(id) {
                None => trace!("rpc client: stale response {}", id),
                Some(ResponseRoute::Unary(entry)) => {
                    if let Some(monitoring) = &self.monitoring {
                        monitoring.record_response(
                            &entry.service,
                            parsed.payload.len() as u64,
                            entry.created_at.elapsed(),
                        );
                    }
                    entry.complete(Ok(parsed.payload.to_vec()));
                }
                Some(ResponseRoute::Stream(subscriber)) => subscriber.on_next(parsed.payload),
            },
            MsgKind::Error => match self.pending.remove(id) {
                None => trace!("rpc client: stale error {}", id),
                Some(entry) => {
                    let err = RpcError::from_wire(parsed.payload);
                    debug!("rpc client: request {} failed remotely: {}", id, err);
                    if let Some(monitoring) = &self.monitoring {
                        monitoring.record_error(&entry.service, false);
                    }
                    entry.complete(Err(err));
                }
            },
            MsgKind::Complete => match self.pending.remove_stream(id) {
                None => trace!("rpc client: stray stream terminator {}", id),
                Some(subscriber) => subscriber.on_complete(),
            },
        }
    }
}

fn spawn_reply_poller<S: Serializer>(
    inner: Arc<ClientInner<S>>, mut subscription: Box<dyn Subscription>,
) {
    tokio::spawn(async move {
        let mut attempt = 0u32;
        while inner.running.load(Ordering::Acquire) {
            let read =
                subscription.poll(&mut |frame| inner.on_reply_frame(frame), inner.config.fragment_limit);
            if read == 0 {
                inner.config.idle.idle(attempt).await;
                attempt = attempt.saturating_add(1);
            } else {
                attempt = 0;
                tokio::task::yield_now().await;
            }
        }
        subscription.close();
        trace!("rpc client: reply poller exits");
    });
}

/// Fixed-rate sweep: any entry whose deadline passed completes with
/// `ReplyTimeout`, at latest one period after expiry.
fn spawn_reaper<S: Serializer>(inner: Arc<ClientInner<S>>) -> AbortHandle {
    let (abort_handle, abort_registration) = AbortHandle::new_pair();
    let period = inner.config.request_timeout;
    let task = Abortable::new(
        async move {
            let mut tick = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
            loop {
                tick.tick().await;
                for (id, entry) in inner.pending.sweep_expired(Instant::now()) {
                    warn!("rpc client: request {} to {} timed out", id, entry.service);
                    if let Some(monitoring) = &inner.monitoring {
                        monitoring.record_error(&entry.service, true);
                    }
                    entry.complete(Err(RpcError::ReplyTimeout));
                }
            }
        },
        abort_registration,
    )
    .map(|_| ());
    tokio::spawn(task);
    abort_handle
}

/// Awaitable unary reply. Resolves `Cancelled` if the client closes first.
#[derive(Debug)]
pub struct ReplyFuture {
    rx: oneshot::Receiver<Result<Vec<u8>, RpcError>>,
}

impl Future for ReplyFuture {
    type Output = Result<Vec<u8>, RpcError>;

    fn poll(mut self: Pin<&mut Self>, ctx: &mut Context) -> Poll<Self::Output> {
        Pin::new(&mut self.rx).poll(ctx).map(|received| match received {
            Ok(result) => result,
            Err(_) => Err(RpcError::Cancelled),
        })
    }
}

/// Handle to an open streaming call.
pub struct StreamHandle {
    id: u64,
    pending: Arc<PendingTable>,
}

impl StreamHandle {
    #[inline]
    pub fn request_id(&self) -> u64 {
        self.id
    }

    /// Advisory, local-only: the server keeps emitting but deliveries
    /// stop here. No terminal signal is raised on the subscriber.
    pub fn cancel(&self) {
        self.pending.remove(self.id);
    }

    /// Whether the stream is still registered (no terminal seen, not cancelled).
    pub fn is_active(&self) -> bool {
        self.pending.contains(self.id)
    }
}
