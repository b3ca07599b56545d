//! Host-routed reverse proxy.
//!
//! Every request is routed by its Host (or HTTP/2 authority) through the
//! registry: static records are served from disk, server records are forwarded
//! through the shared upstream pool, and `Connection: Upgrade` requests get a
//! dedicated upstream connection that is tunnelled once both sides switch
//! protocols.

use crate::adapter::{normalize_host, RuntimeAdapter};
use crate::error::{json_error_response, ProxyErrorCode};
use crate::pool::{ConnectionPool, PoolConfig};
use crate::resolver::Route;
use crate::static_files::StaticFiles;
use http_body_util::combinators::BoxBody;
use http_body_util::{BodyExt, Empty, Full};
use hyper::body::{Bytes, Incoming};
use hyper::header::HeaderValue;
use hyper::service::service_fn;
use hyper::upgrade::Upgraded;
use hyper::{Request, Response, StatusCode, Uri};
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto::Builder as AutoBuilder;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tokio_rustls::TlsAcceptor;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Header name for request ID
const X_REQUEST_ID: &str = "x-request-id";
/// Header name for forwarded-for
const X_FORWARDED_FOR: &str = "x-forwarded-for";
/// Header name for forwarded host
const X_FORWARDED_HOST: &str = "x-forwarded-host";
/// Header name for forwarded proto
const X_FORWARDED_PROTO: &str = "x-forwarded-proto";

/// Everything a connection task needs to answer requests
struct ProxyState {
    adapter: RuntimeAdapter,
    pool: Arc<ConnectionPool>,
    static_files: StaticFiles,
    request_timeout: Duration,
    https_redirect_port: Option<u16>,
}

/// Host-routed reverse proxy and static file server
pub struct ProxyServer {
    bind_addr: SocketAddr,
    adapter: RuntimeAdapter,
    shutdown_rx: watch::Receiver<bool>,
    pool: Arc<ConnectionPool>,
    static_files: StaticFiles,
    request_timeout: Duration,
    tls_acceptor: Option<TlsAcceptor>,
    /// If set, redirect all HTTP requests to this HTTPS port
    https_redirect_port: Option<u16>,
}

impl ProxyServer {
    pub fn new(bind_addr: SocketAddr, adapter: RuntimeAdapter, shutdown_rx: watch::Receiver<bool>) -> Self {
        Self::with_pool(
            bind_addr,
            adapter,
            shutdown_rx,
            Arc::new(ConnectionPool::new(PoolConfig::default())),
        )
    }

    /// Share one upstream pool between the HTTP and HTTPS listeners
    pub fn with_pool(
        bind_addr: SocketAddr,
        adapter: RuntimeAdapter,
        shutdown_rx: watch::Receiver<bool>,
        pool: Arc<ConnectionPool>,
    ) -> Self {
        Self {
            bind_addr,
            adapter,
            shutdown_rx,
            pool,
            static_files: StaticFiles::new("index.html"),
            request_timeout: Duration::from_secs(30),
            tls_acceptor: None,
            https_redirect_port: None,
        }
    }

    pub fn with_tls(mut self, acceptor: TlsAcceptor) -> Self {
        self.tls_acceptor = Some(acceptor);
        self
    }

    /// Enable HTTPS redirect: all HTTP requests will be redirected to HTTPS on the given port
    pub fn with_https_redirect(mut self, port: u16) -> Self {
        self.https_redirect_port = Some(port);
        self
    }

    pub fn with_static_files(mut self, static_files: StaticFiles) -> Self {
        self.static_files = static_files;
        self
    }

    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    /// Get the connection pool (for statistics)
    pub fn pool(&self) -> &Arc<ConnectionPool> {
        &self.pool
    }

    pub fn tls_enabled(&self) -> bool {
        self.tls_acceptor.is_some()
    }

    pub async fn run(self) -> anyhow::Result<()> {
        let listener = TcpListener::bind(self.bind_addr).await?;
        self.run_on(listener).await
    }

    /// Serve connections from an already-bound listener
    pub async fn run_on(self, listener: TcpListener) -> anyhow::Result<()> {
        let local_addr = listener.local_addr()?;
        let protocol = if self.tls_acceptor.is_some() { "HTTPS" } else { "HTTP" };
        info!(addr = %local_addr, protocol, "Proxy server listening (HTTP/1.1 and HTTP/2)");

        let mut shutdown_rx = self.shutdown_rx.clone();
        let tls_acceptor = self.tls_acceptor.clone();
        let state = Arc::new(ProxyState {
            adapter: self.adapter,
            pool: self.pool,
            static_files: self.static_files,
            request_timeout: self.request_timeout,
            https_redirect_port: self.https_redirect_port,
        });

        loop {
            tokio::select! {
                result = listener.accept() => {
                    match result {
                        Ok((stream, addr)) => {
                            let state = Arc::clone(&state);
                            let tls_acceptor = tls_acceptor.clone();

                            tokio::spawn(async move {
                                if let Some(acceptor) = tls_acceptor {
                                    match acceptor.accept(stream).await {
                                        Ok(tls_stream) => {
                                            if let Err(e) = handle_connection(tls_stream, addr, state, true).await {
                                                debug!(addr = %addr, error = %e, "TLS connection error");
                                            }
                                        }
                                        Err(e) => {
                                            debug!(addr = %addr, error = %e, "TLS handshake failed");
                                        }
                                    }
                                } else if let Err(e) = handle_connection(stream, addr, state, false).await {
                                    debug!(addr = %addr, error = %e, "Connection error");
                                }
                            });
                        }
                        Err(e) => {
                            error!(error = %e, "Failed to accept connection");
                        }
                    }
                }
                _ = shutdown_rx.changed() => {
                    if *shutdown_rx.borrow() {
                        info!(addr = %local_addr, "Proxy server shutting down");
                        break;
                    }
                }
            }
        }

        Ok(())
    }
}

async fn handle_connection<S>(
    stream: S,
    addr: SocketAddr,
    state: Arc<ProxyState>,
    is_tls: bool,
) -> anyhow::Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let io = TokioIo::new(stream);

    let service = service_fn(move |req: Request<Incoming>| {
        let state = Arc::clone(&state);
        async move { handle_request(req, state, addr, is_tls).await }
    });

    // HTTP/1.1 keeps WebSocket upgrades working; HTTP/2 via ALPN or h2c
    AutoBuilder::new(TokioExecutor::new())
        .http1()
        .preserve_header_case(true)
        .http2()
        .max_concurrent_streams(250)
        .serve_connection_with_upgrades(io, service)
        .await
        .map_err(|e| anyhow::anyhow!("Connection error: {}", e))?;

    Ok(())
}

async fn handle_request(
    mut req: Request<Incoming>,
    state: Arc<ProxyState>,
    client_addr: SocketAddr,
    is_tls: bool,
) -> Result<Response<BoxBody<Bytes, hyper::Error>>, hyper::Error> {
    if let Some(redirect_port) = state.https_redirect_port {
        if !is_tls {
            return Ok(build_https_redirect(&req, redirect_port));
        }
    }

    // Generate or propagate request ID
    let request_id = req
        .headers()
        .get(X_REQUEST_ID)
        .and_then(|v| v.to_str().ok())
        .map(String::from)
        .unwrap_or_else(|| Uuid::new_v4().to_string());

    let hostname = match extract_hostname(&req) {
        Some(h) => h,
        None => {
            return Ok(json_error_response(
                ProxyErrorCode::MissingHostHeader,
                "Missing or invalid Host header",
            ));
        }
    };

    debug!(hostname, method = %req.method(), uri = %req.uri(), request_id, "Incoming request");

    let route = match state.adapter.resolve_route(&hostname) {
        Ok(Some(route)) => route,
        Ok(None) => {
            // Don't reveal whether host exists - use generic message
            return Ok(json_error_response(
                ProxyErrorCode::UnknownHost,
                "Unknown or unconfigured host",
            ));
        }
        Err(e) => {
            error!(hostname, error = %e, "Route lookup failed");
            return Ok(json_error_response(
                ProxyErrorCode::InternalError,
                "Route lookup failed",
            ));
        }
    };

    let upstream = match route {
        Route::Static { root_path } => {
            return Ok(state.static_files.serve(&req, &root_path).await);
        }
        Route::Proxy { upstream } => upstream,
    };

    let authority = req
        .uri()
        .authority()
        .and_then(|a| HeaderValue::from_str(a.as_str()).ok());

    // Overwrite X-Forwarded-* rather than append; this proxy is the first trusted hop
    let headers = req.headers_mut();

    if let Ok(value) = HeaderValue::from_str(&request_id) {
        headers.insert(X_REQUEST_ID, value);
    }

    if let Ok(value) = HeaderValue::from_str(&client_addr.ip().to_string()) {
        headers.insert(X_FORWARDED_FOR, value);
    }

    // HTTP/2 clients send :authority instead of Host; upstreams speak HTTP/1.1
    match headers.get(hyper::header::HOST).cloned() {
        Some(host) => {
            headers.insert(X_FORWARDED_HOST, host);
        }
        None => {
            if let Some(host) = authority {
                headers.insert(hyper::header::HOST, host.clone());
                headers.insert(X_FORWARDED_HOST, host);
            }
        }
    }

    let proto = if is_tls { "https" } else { "http" };
    headers.insert(X_FORWARDED_PROTO, HeaderValue::from_static(proto));

    if is_upgrade_request(&req) {
        return handle_upgrade(req, hostname, upstream, request_id, state.request_timeout).await;
    }

    let request_timeout = state.request_timeout;
    let result = tokio::time::timeout(request_timeout, state.pool.send_request(req, &upstream)).await;

    match result {
        Ok(Ok(response)) => Ok(response),
        Ok(Err(e)) => {
            // Log detailed error internally, return generic message externally
            error!(hostname, upstream, error = %e, "Failed to forward request via pool");
            Ok(json_error_response(
                ProxyErrorCode::ConnectionFailed,
                "Failed to connect to upstream",
            ))
        }
        Err(_) => {
            warn!(
                hostname,
                upstream,
                timeout_secs = request_timeout.as_secs(),
                "Request timed out"
            );
            Ok(json_error_response(
                ProxyErrorCode::RequestTimeout,
                format!(
                    "Request timed out after {} seconds",
                    request_timeout.as_secs()
                ),
            ))
        }
    }
}

/// Host header, or the URI authority for HTTP/2 requests
fn extract_hostname<B>(req: &Request<B>) -> Option<String> {
    req.headers()
        .get(hyper::header::HOST)
        .and_then(|h| h.to_str().ok())
        .or_else(|| req.uri().host())
        .and_then(normalize_host)
}

/// Build an HTTPS redirect response (301 Moved Permanently)
fn build_https_redirect<B>(req: &Request<B>, https_port: u16) -> Response<BoxBody<Bytes, hyper::Error>> {
    let host = extract_hostname(req).unwrap_or_else(|| "localhost".to_string());
    let path = req.uri().path_and_query().map(|pq| pq.as_str()).unwrap_or("/");

    let location = if https_port == 443 {
        format!("https://{}{}", host, path)
    } else {
        format!("https://{}:{}{}", host, https_port, path)
    };

    Response::builder()
        .status(StatusCode::MOVED_PERMANENTLY)
        .header(hyper::header::LOCATION, location)
        .header(hyper::header::CONTENT_TYPE, "text/plain")
        .body(
            Full::new(Bytes::from("Redirecting to HTTPS"))
                .map_err(|never| match never {})
                .boxed(),
        )
        .expect("valid response builder")
}

/// Check if a request is a WebSocket upgrade request
fn is_upgrade_request<B>(req: &Request<B>) -> bool {
    let has_upgrade_connection = req
        .headers()
        .get(hyper::header::CONNECTION)
        .and_then(|v| v.to_str().ok())
        .map(|v| v.to_lowercase().contains("upgrade"))
        .unwrap_or(false);

    has_upgrade_connection && req.headers().contains_key(hyper::header::UPGRADE)
}

/// Forward bytes bidirectionally between client and upstream connections
async fn forward_bidirectional(client: Upgraded, upstream: Upgraded, hostname: &str, request_id: &str) {
    let mut client_io = TokioIo::new(client);
    let mut upstream_io = TokioIo::new(upstream);

    match tokio::io::copy_bidirectional(&mut client_io, &mut upstream_io).await {
        Ok((client_to_upstream, upstream_to_client)) => {
            debug!(
                hostname,
                request_id,
                client_to_upstream,
                upstream_to_client,
                "Upgraded connection closed normally"
            );
        }
        Err(e) => {
            debug!(hostname, request_id, error = %e, "Upgraded connection closed with error");
        }
    }
}

/// Upstream handshake: the client's method, path and headers on a fresh HTTP/1.1 request
fn build_upgrade_request<B>(req: &Request<B>) -> Request<Empty<Bytes>> {
    let path = req.uri().path_and_query().map(|pq| pq.as_str()).unwrap_or("/");

    let mut request = Request::new(Empty::new());
    *request.method_mut() = req.method().clone();
    *request.uri_mut() = path.parse().unwrap_or_else(|_| Uri::from_static("/"));
    *request.headers_mut() = req.headers().clone();
    request
}

/// Open a dedicated connection to `upstream` and send the upgrade handshake
async fn send_upgrade_request(
    upstream: &str,
    request: Request<Empty<Bytes>>,
) -> anyhow::Result<Response<Incoming>> {
    let stream = TcpStream::connect(upstream).await?;
    let (mut sender, conn) = hyper::client::conn::http1::handshake(TokioIo::new(stream)).await?;

    // Drives the connection until the tunnel closes
    let upstream_addr = upstream.to_string();
    tokio::spawn(async move {
        if let Err(e) = conn.with_upgrades().await {
            debug!(upstream = %upstream_addr, error = %e, "Upstream upgrade connection ended");
        }
    });

    Ok(sender.send_request(request).await?)
}

async fn handle_upgrade(
    mut req: Request<Incoming>,
    hostname: String,
    upstream: String,
    request_id: String,
    handshake_timeout: Duration,
) -> Result<Response<BoxBody<Bytes, hyper::Error>>, hyper::Error> {
    let upgrade_type = req
        .headers()
        .get(hyper::header::UPGRADE)
        .and_then(|v| v.to_str().ok())
        .map(|s| s.to_lowercase())
        .unwrap_or_else(|| "unknown".to_string());
    debug!(hostname, request_id, upgrade_type, "Handling upgrade request");

    let upstream_request = build_upgrade_request(&req);
    let client_upgrade = hyper::upgrade::on(&mut req);

    let response = match tokio::time::timeout(
        handshake_timeout,
        send_upgrade_request(&upstream, upstream_request),
    )
    .await
    {
        Ok(Ok(response)) => response,
        Ok(Err(e)) => {
            error!(hostname, upstream, error = %e, "Upgrade handshake with upstream failed");
            return Ok(json_error_response(
                ProxyErrorCode::ConnectionFailed,
                "Failed to connect to upstream",
            ));
        }
        Err(_) => {
            warn!(
                hostname,
                upstream,
                timeout_secs = handshake_timeout.as_secs(),
                "Upgrade handshake timed out"
            );
            return Ok(json_error_response(
                ProxyErrorCode::RequestTimeout,
                format!(
                    "Upgrade handshake timed out after {} seconds",
                    handshake_timeout.as_secs()
                ),
            ));
        }
    };

    if response.status() != StatusCode::SWITCHING_PROTOCOLS {
        warn!(hostname, status = %response.status(), "Upstream rejected upgrade request");
        let (parts, body) = response.into_parts();
        return Ok(Response::from_parts(parts, body.boxed()));
    }

    info!(hostname, request_id, upgrade_type, "Upgrade successful");

    let mut client_response = Response::new(Empty::<Bytes>::new().map_err(|never| match never {}).boxed());
    *client_response.status_mut() = StatusCode::SWITCHING_PROTOCOLS;
    for (name, value) in response.headers() {
        // hyper manages framing headers itself
        if *name == hyper::header::CONTENT_LENGTH || *name == hyper::header::TRANSFER_ENCODING {
            continue;
        }
        client_response.headers_mut().append(name.clone(), value.clone());
    }

    // Bytes the upstream sent right after its 101 stay buffered in its Upgraded half
    tokio::spawn(async move {
        match tokio::try_join!(client_upgrade, hyper::upgrade::on(response)) {
            Ok((client, upstream_io)) => {
                debug!(hostname, request_id, "Both sides upgraded, starting forwarding");
                forward_bidirectional(client, upstream_io, &hostname, &request_id).await;
            }
            Err(e) => {
                error!(hostname, error = %e, "Failed to complete upgrade");
            }
        }
    });

    Ok(client_response)
}
