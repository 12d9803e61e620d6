//! Scenario orchestration.
//!
//! # Responsibilities
//! - Own the shared fixtures of one scenario run: upstream pool, port
//!   registry, codec selection, wait-timeout policy
//! - Carry the per-scenario connection state (client, collector, upstream
//!   connection/stream, open request stream) that scenario steps hand off
//!   through
//! - Provide the ordered action-list primitive and the shared
//!   request/response skeleton the concrete scenarios compose
//!
//! # Design Decisions
//! - Scenario steps run strictly in declared order, each to completion
//!   (including its internal blocking waits), so interleavings are
//!   reproducible run to run
//! - Per-scenario state accessors panic on misuse (e.g. reading the upstream
//!   stream before one arrived): that is a sequencing bug in the scenario,
//!   not a runtime condition to recover from

pub mod protocol;
pub mod router;

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use futures_util::future::LocalBoxFuture;
use http::{HeaderMap, Request, StatusCode};

use crate::admin::AdminClient;
use crate::client::{CodecClient, CodecKind, RequestStream};
use crate::collector::ResponseCollector;
use crate::error::Result;
use crate::ports::PortRegistry;
use crate::upstream::{FakeHttpConnection, FakeStream, FakeUpstream};

/// One ordered scenario step.
pub type Action = Box<dyn for<'h> FnOnce(&'h mut Harness) -> LocalBoxFuture<'h, Result<()>>>;

/// Wrap a closure as an [`Action`], guiding closure lifetime inference at the
/// call site.
pub fn step<F>(f: F) -> Action
where
    F: for<'h> FnOnce(&'h mut Harness) -> LocalBoxFuture<'h, Result<()>> + 'static,
{
    Box::new(f)
}

/// Shared fixtures plus the per-scenario connection state scenarios thread
/// their steps through.
pub struct Harness {
    downstream_codec: CodecKind,
    upstream_codec: CodecKind,
    upstreams: Vec<FakeUpstream>,
    ports: PortRegistry,
    wait_timeout: Option<Duration>,
    default_response_status: StatusCode,
    default_response_headers: HeaderMap,

    // Per-scenario state, torn down with the scenario.
    pub(crate) client: Option<CodecClient>,
    pub(crate) response: Option<Arc<ResponseCollector>>,
    pub(crate) request_stream: Option<RequestStream>,
    pub(crate) upstream_connection: Option<FakeHttpConnection>,
    pub(crate) upstream_request: Option<FakeStream>,
}

impl Harness {
    /// Build a harness with one simulated upstream.
    pub async fn new(downstream_codec: CodecKind, upstream_codec: CodecKind) -> Result<Self> {
        Self::with_upstreams(downstream_codec, upstream_codec, 1).await
    }

    /// Build a harness with `upstream_count` independent simulated upstreams.
    pub async fn with_upstreams(
        downstream_codec: CodecKind,
        upstream_codec: CodecKind,
        upstream_count: usize,
    ) -> Result<Self> {
        crate::observability::init();
        let wait_timeout = Some(crate::dispatch::DEFAULT_WAIT_TIMEOUT);
        let mut upstreams = Vec::with_capacity(upstream_count);
        for _ in 0..upstream_count {
            upstreams.push(FakeUpstream::bind(upstream_codec, wait_timeout).await?);
        }
        Ok(Self {
            downstream_codec,
            upstream_codec,
            upstreams,
            ports: PortRegistry::new(),
            wait_timeout,
            default_response_status: StatusCode::OK,
            default_response_headers: HeaderMap::new(),
            client: None,
            response: None,
            request_stream: None,
            upstream_connection: None,
            upstream_request: None,
        })
    }

    /// Override the deadline for waits started from here on (`None` waits
    /// forever). Upstreams bound before the override keep the default.
    pub fn with_wait_timeout(mut self, wait_timeout: Option<Duration>) -> Self {
        self.wait_timeout = wait_timeout;
        self
    }

    pub fn wait_timeout(&self) -> Option<Duration> {
        self.wait_timeout
    }

    pub fn downstream_codec(&self) -> CodecKind {
        self.downstream_codec
    }

    pub fn upstream_codec(&self) -> CodecKind {
        self.upstream_codec
    }

    pub fn upstream(&self, index: usize) -> &FakeUpstream {
        &self.upstreams[index]
    }

    pub fn ports(&self) -> &PortRegistry {
        &self.ports
    }

    pub fn ports_mut(&mut self) -> &mut PortRegistry {
        &mut self.ports
    }

    /// Resolve a registered listener name to a connectable address.
    pub fn listener_addr(&self, name: &str) -> SocketAddr {
        SocketAddr::from(([127, 0, 0, 1], self.ports.lookup(name)))
    }

    /// Populate the registry from the proxy's admin interface: polls until
    /// the proxy reports at least `names.len()` bound listeners, then
    /// registers them under `names` in declaration order.
    pub async fn register_listener_ports(&mut self, admin_port: u16, names: &[&str]) -> Result<()> {
        let admin = AdminClient::new(admin_port, self.wait_timeout)?;
        let addresses = admin.wait_for_listener_count(names.len()).await?;
        for (name, address) in names.iter().zip(addresses) {
            self.ports.register(name, address.port());
        }
        self.ports.register("admin", admin_port);
        Ok(())
    }

    // --- per-scenario state ---

    /// Connect the downstream client to the named listener with the
    /// configured codec.
    pub async fn connect(&mut self) -> Result<()> {
        self.connect_with("http", self.downstream_codec).await
    }

    pub async fn connect_with(&mut self, port_name: &str, codec: CodecKind) -> Result<()> {
        let addr = self.listener_addr(port_name);
        self.client = Some(CodecClient::connect(addr, codec, self.wait_timeout).await?);
        Ok(())
    }

    /// Start a fresh response collector, replacing the previous one.
    pub fn new_response(&mut self) -> Arc<ResponseCollector> {
        let collector = ResponseCollector::new(self.wait_timeout);
        self.response = Some(Arc::clone(&collector));
        collector
    }

    pub fn client_mut(&mut self) -> &mut CodecClient {
        self.client.as_mut().expect("no downstream client connected")
    }

    pub fn response(&self) -> Arc<ResponseCollector> {
        Arc::clone(self.response.as_ref().expect("no response collector active"))
    }

    pub fn upstream_connection(&self) -> &FakeHttpConnection {
        self.upstream_connection
            .as_ref()
            .expect("no upstream connection established")
    }

    pub fn upstream_request(&self) -> &FakeStream {
        self.upstream_request
            .as_ref()
            .expect("no upstream request received")
    }

    /// Open a request stream (headers sent, end-of-stream withheld) and stash
    /// it for later continuation steps.
    pub async fn start_request(&mut self, request: Request<()>) -> Result<()> {
        let collector = self.new_response();
        let stream = self.client_mut().start_request(request, &collector).await?;
        self.request_stream = Some(stream);
        Ok(())
    }

    /// Continue the open request stream with `size` filler bytes.
    pub async fn send_data(&mut self, size: usize, end_stream: bool) -> Result<()> {
        let mut stream = self.request_stream.take().expect("no open request stream");
        let result = self.client_mut().send_data(&mut stream, size, end_stream).await;
        self.request_stream = Some(stream);
        result
    }

    /// Finish the open request stream with trailers.
    pub async fn send_trailers(&mut self, trailers: HeaderMap) -> Result<()> {
        let mut stream = self.request_stream.take().expect("no open request stream");
        let result = self.client_mut().send_trailers(&mut stream, trailers).await;
        self.request_stream = Some(stream);
        result
    }

    /// Reset the open request stream (connection close on HTTP/1.1).
    pub async fn send_reset(&mut self) -> Result<()> {
        let mut stream = self.request_stream.take().expect("no open request stream");
        self.client_mut().send_reset(&mut stream).await
    }

    // --- shared scenario skeleton ---

    /// Run one complete proxied exchange: send the request downstream, wait
    /// for it to arrive upstream, answer with the default response head plus
    /// `response_size` filler bytes, and wait for the client to see
    /// end-of-stream.
    pub async fn send_request_and_wait_for_response(
        &mut self,
        request: Request<()>,
        request_body_size: usize,
        response_size: usize,
    ) -> Result<()> {
        let collector = self.new_response();
        if request_body_size > 0 {
            self.client_mut()
                .make_request_with_body(request, request_body_size, &collector)
                .await?;
        } else {
            self.client_mut()
                .make_header_only_request(request, &collector)
                .await?;
        }
        self.wait_for_next_upstream_request().await?;

        let status = self.default_response_status;
        let headers = self.default_response_headers.clone();
        let stream = self.upstream_request();
        // End at the headers when there is no response body.
        stream.encode_headers(status, headers, response_size == 0).await?;
        if response_size > 0 {
            stream.encode_data(response_size, true).await?;
        }
        collector.wait_for_end_stream().await
    }

    /// Establish the upstream connection if none exists yet, then wait for
    /// the next stream on it and for that request to be fully received.
    pub async fn wait_for_next_upstream_request(&mut self) -> Result<()> {
        if self.upstream_connection.is_none() {
            self.establish_upstream_connection().await?;
        }
        self.wait_for_new_upstream_stream().await?;
        self.upstream_request().wait_for_end_stream().await
    }

    pub async fn establish_upstream_connection(&mut self) -> Result<()> {
        self.upstream_connection = Some(self.upstreams[0].wait_for_http_connection().await?);
        Ok(())
    }

    pub async fn wait_for_new_upstream_stream(&mut self) -> Result<()> {
        let stream = self.upstream_connection().wait_for_new_stream().await?;
        self.upstream_request = Some(stream);
        Ok(())
    }

    /// Fixed teardown order: close the client, close the upstream
    /// connection, and confirm the upstream saw the disconnect.
    pub async fn cleanup_upstream_and_downstream(&mut self) -> Result<()> {
        if let Some(client) = &mut self.client {
            client.close().await?;
        }
        if let Some(connection) = &self.upstream_connection {
            connection.close().await?;
            connection.wait_for_disconnect().await?;
        }
        Ok(())
    }

    /// Run each action to completion, strictly in declared order.
    pub async fn execute_actions(&mut self, actions: Vec<Action>) -> Result<()> {
        for (index, action) in actions.into_iter().enumerate() {
            tracing::debug!(index, "scenario action");
            action(self).await?;
        }
        Ok(())
    }
}

/// One-shot utility: connect, issue a single request, wait for the complete
/// response, and return its collector. The connection is dropped afterward.
pub async fn single_request(
    addr: SocketAddr,
    codec: CodecKind,
    request: Request<()>,
    body: &[u8],
    wait_timeout: Option<Duration>,
) -> Result<Arc<ResponseCollector>> {
    let mut client = CodecClient::connect(addr, codec, wait_timeout).await?;
    let collector = ResponseCollector::new(wait_timeout);
    if body.is_empty() {
        client.make_header_only_request(request, &collector).await?;
    } else {
        let mut stream = client.start_request(request, &collector).await?;
        client
            .send_data_buf(&mut stream, bytes::Bytes::copy_from_slice(body), true)
            .await?;
    }
    collector.wait_for_end_stream().await?;
    client.close().await?;
    Ok(collector)
}
