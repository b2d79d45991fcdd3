//! Plain-HTTP delivery of the root CA certificate.
//!
//! One request per connection. Every response carries `Connection: close`
//! and the socket is shut down once it has been written.

use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use socket2::{Domain, Protocol, Socket, Type};
use thiserror::Error;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use crate::ca::CertificateAuthority;
use crate::config::ResponderConfig;

const LISTEN_BACKLOG: i32 = 128;

#[derive(Debug, Error)]
pub enum ResponderError {
    #[error("failed to bind certificate responder on {addr}: {source}")]
    Bind {
        addr: SocketAddr,
        #[source]
        source: io::Error,
    },
    #[error("certificate responder stopped accepting connections: {0}")]
    Accept(#[source] io::Error),
}

/// A fully framed HTTP/1.1 response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpResponse {
    pub status: &'static str,
    pub content_type: &'static str,
    pub headers: Vec<String>,
    pub body: Vec<u8>,
}

impl HttpResponse {
    pub fn new(status: &'static str, content_type: &'static str, body: impl Into<Vec<u8>>) -> Self {
        Self {
            status,
            content_type,
            headers: Vec::new(),
            body: body.into(),
        }
    }

    pub fn html(status: &'static str, body: impl Into<Vec<u8>>) -> Self {
        Self::new(status, "text/html", body)
    }

    /// HTML error page that repeats the status, or shows `detail` when given.
    pub fn error(status: &'static str, detail: Option<&str>) -> Self {
        let page = format!(
            "<!DOCTYPE html>\n<html>\n<head><title>{status}</title></head>\n<body>\n<h1>{status}</h1>\n<p>{}</p>\n</body>\n</html>\n",
            detail.unwrap_or(status)
        );
        Self::html(status, page)
    }

    pub fn with_header(mut self, header: impl Into<String>) -> Self {
        self.headers.push(header.into());
        self
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut head = format!(
            "HTTP/1.1 {}\r\nContent-Type: {}\r\nContent-Length: {}\r\nConnection: close\r\n",
            self.status,
            self.content_type,
            self.body.len()
        );
        for header in &self.headers {
            head.push_str(header);
            head.push_str("\r\n");
        }
        head.push_str("\r\n");

        let mut bytes = head.into_bytes();
        bytes.extend_from_slice(&self.body);
        bytes
    }
}

/// Maps one raw request to its response. Holds no per-connection state.
pub struct Router {
    ca: Arc<CertificateAuthority>,
    download_filename: String,
}

impl Router {
    pub fn new(ca: Arc<CertificateAuthority>, download_filename: impl Into<String>) -> Self {
        Self {
            ca,
            download_filename: download_filename.into(),
        }
    }

    pub fn route(&self, request: &[u8]) -> HttpResponse {
        let Some((method, path)) = parse_request_line(request) else {
            return HttpResponse::error("400 Bad Request", None);
        };
        info!(target: "responder", %method, %path, "HTTP request");

        match (method, path) {
            ("GET", "/") => HttpResponse::html("200 OK", self.landing_page()),
            ("GET", "/cert") | ("GET", "/mitmproxy-ca-cert.pem") => self.certificate(),
            _ => HttpResponse::error("404 Not Found", None),
        }
    }

    fn certificate(&self) -> HttpResponse {
        let Some(pem) = self.ca.export_pem() else {
            warn!(target: "responder", "certificate requested before one was generated");
            return HttpResponse::error("500 Internal Server Error", Some("Certificate not available"));
        };

        info!(target: "responder", bytes = pem.len(), "serving root CA certificate");
        HttpResponse::new("200 OK", "application/x-pem-file", pem).with_header(format!(
            "Content-Disposition: attachment; filename=\"{}\"",
            self.download_filename
        ))
    }

    fn landing_page(&self) -> String {
        let name = &self.ca.settings().common_name;
        format!(
            r#"<!DOCTYPE html>
<html>
<head>
<title>{name}</title>
<meta name="viewport" content="width=device-width, initial-scale=1">
<style>
body {{ font-family: sans-serif; margin: 40px; line-height: 1.6; }}
.download {{ display: inline-block; padding: 12px 24px; background: #0a64d8; color: #fff; border-radius: 6px; text-decoration: none; }}
</style>
</head>
<body>
<h1>Install {name}</h1>
<p>Connections to the monitored services are only readable once this device trusts the root certificate below.</p>
<p><a class="download" href="/cert">Download certificate</a></p>
<ol>
<li>Download the certificate and install the profile it offers.</li>
<li>Open the certificate trust settings of the device.</li>
<li>Enable full trust for "{name}".</li>
</ol>
</body>
</html>
"#
        )
    }
}

/// Method and path of the request line. `None` when the line is not UTF-8 or
/// lacks either token.
fn parse_request_line(request: &[u8]) -> Option<(&str, &str)> {
    let line_end = request
        .windows(2)
        .position(|w| w == b"\r\n")
        .unwrap_or(request.len());
    let line = std::str::from_utf8(&request[..line_end]).ok()?;

    let mut parts = line.split_whitespace();
    let method = parts.next()?;
    let target = parts.next()?;
    let path = target.split('?').next().unwrap_or(target);
    Some((method, path))
}

pub struct CertificateResponder {
    listener: TcpListener,
    router: Arc<Router>,
    settings: ResponderConfig,
    running: AtomicBool,
}

impl CertificateResponder {
    /// Binds the listener with address reuse so a restart does not wait out
    /// TIME_WAIT on the fixed port.
    pub fn bind(ca: Arc<CertificateAuthority>, settings: ResponderConfig) -> Result<Self, ResponderError> {
        let addr = SocketAddr::new(settings.bind_address, settings.port);
        let listener = bind_reusable(addr).map_err(|source| ResponderError::Bind { addr, source })?;

        let router = Arc::new(Router::new(ca, settings.download_filename.clone()));
        Ok(Self {
            listener,
            router,
            settings,
            running: AtomicBool::new(false),
        })
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    pub fn server_url(&self) -> io::Result<String> {
        Ok(format!("http://{}", self.local_addr()?))
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Accepts until `shutdown` flips to true or accepting fails.
    pub async fn serve(&self, mut shutdown: watch::Receiver<bool>) -> Result<(), ResponderError> {
        self.running.store(true, Ordering::SeqCst);
        let _running = scopeguard::guard(&self.running, |flag| flag.store(false, Ordering::SeqCst));

        if let Ok(url) = self.server_url() {
            info!(target: "responder", %url, "certificate responder started");
        }

        loop {
            tokio::select! {
                accepted = self.listener.accept() => {
                    let (stream, peer) = accepted.map_err(|e| {
                        error!(target: "responder", error = %e, "accept failed");
                        ResponderError::Accept(e)
                    })?;
                    debug!(target: "responder", %peer, "connection accepted");

                    let router = Arc::clone(&self.router);
                    let settings = self.settings.clone();
                    tokio::spawn(async move {
                        if let Err(e) = handle_connection(stream, router, &settings).await {
                            debug!(target: "responder", %peer, error = %e, "connection ended with error");
                        }
                    });
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        info!(target: "responder", "certificate responder stopping");
                        break;
                    }
                }
            }
        }
        Ok(())
    }
}

fn bind_reusable(addr: SocketAddr) -> io::Result<TcpListener> {
    let socket = Socket::new(Domain::for_address(addr), Type::STREAM, Some(Protocol::TCP))?;
    socket.set_reuse_address(true)?;
    socket.set_nonblocking(true)?;
    socket.bind(&addr.into())?;
    socket.listen(LISTEN_BACKLOG)?;
    TcpListener::from_std(socket.into())
}

async fn handle_connection(
    mut stream: TcpStream,
    router: Arc<Router>,
    settings: &ResponderConfig,
) -> io::Result<()> {
    let request = match tokio::time::timeout(
        settings.read_timeout(),
        read_request(&mut stream, settings.max_request_bytes),
    )
    .await
    {
        Ok(read) => read?,
        Err(_) => {
            debug!(target: "responder", "request read timed out");
            return stream.shutdown().await;
        }
    };

    if request.is_empty() {
        return Ok(());
    }

    // Routing may read the key store from disk.
    let response = tokio::task::spawn_blocking(move || router.route(&request))
        .await
        .map_err(|e| io::Error::new(io::ErrorKind::Other, e))?;
    stream.write_all(&response.to_bytes()).await?;
    stream.shutdown().await
}

/// Reads until the end of the header block, EOF, or `limit` bytes.
async fn read_request(stream: &mut TcpStream, limit: usize) -> io::Result<Vec<u8>> {
    let mut request = Vec::with_capacity(1024.min(limit));
    let mut chunk = [0u8; 1024];

    while request.len() < limit {
        let want = chunk.len().min(limit - request.len());
        let n = stream.read(&mut chunk[..want]).await?;
        if n == 0 {
            break;
        }
        request.extend_from_slice(&chunk[..n]);
        if request.windows(4).any(|w| w == b"\r\n\r\n") {
            break;
        }
    }
    Ok(request)
}
