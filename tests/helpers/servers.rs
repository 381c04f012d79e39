use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use bytes::Bytes;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpListener;

use super::tls::acceptor;

/// Request as the server saw it.
#[derive(Debug, Clone)]
pub struct Recorded {
    pub method: String,
    pub path: String,
    /// Lower-cased names, wire order.
    pub headers: Vec<(String, String)>,
}

impl Recorded {
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k == name)
            .map(|(_, v)| v.as_str())
    }

    pub fn position(&self, name: &str) -> Option<usize> {
        self.headers.iter().position(|(k, _)| k == name)
    }
}

#[derive(Debug, Clone)]
pub struct Reply {
    pub status: u16,
    pub headers: Vec<(String, String)>,
    pub body: String,
}

impl Reply {
    pub fn ok(body: impl Into<String>) -> Self {
        Self {
            status: 200,
            headers: Vec::new(),
            body: body.into(),
        }
    }

    pub fn redirect(status: u16, location: &str) -> Self {
        Self {
            status,
            headers: vec![("location".to_string(), location.to_string())],
            body: String::new(),
        }
    }

    pub fn header(mut self, name: &str, value: &str) -> Self {
        self.headers.push((name.to_string(), value.to_string()));
        self
    }
}

pub type Handler = Arc<dyn Fn(&Recorded) -> Reply + Send + Sync>;

/// Which protocols the server's ALPN callback will pick from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Alpn {
    H2,
    Http1,
}

impl Alpn {
    fn wire(self) -> &'static [u8] {
        match self {
            Alpn::H2 => b"\x02h2\x08http/1.1",
            Alpn::Http1 => b"\x08http/1.1",
        }
    }
}

/// In-process TLS server speaking HTTP/2 or HTTP/1.1 depending on ALPN.
pub struct TestServer {
    pub port: u16,
    pub ca_cert: Vec<u8>,
    pub handshakes: Arc<AtomicUsize>,
    pub offered_alpn: Arc<Mutex<Vec<Vec<String>>>>,
    pub requests: Arc<Mutex<Vec<Recorded>>>,
}

impl TestServer {
    pub async fn start(alpn: Alpn, handler: Handler) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let offered_alpn = Arc::new(Mutex::new(Vec::new()));
        let (acceptor, ca_cert) = acceptor(alpn.wire(), offered_alpn.clone());
        let acceptor = Arc::new(acceptor);
        let handshakes = Arc::new(AtomicUsize::new(0));
        let requests = Arc::new(Mutex::new(Vec::new()));

        let counter = handshakes.clone();
        let log = requests.clone();
        tokio::spawn(async move {
            while let Ok((tcp, _)) = listener.accept().await {
                let acceptor = acceptor.clone();
                let counter = counter.clone();
                let log = log.clone();
                let handler = handler.clone();
                tokio::spawn(async move {
                    let Ok(tls) = tokio_boring::accept(&acceptor, tcp).await else {
                        return;
                    };
                    counter.fetch_add(1, Ordering::SeqCst);
                    let is_h2 = tls.ssl().selected_alpn_protocol() == Some(&b"h2"[..]);
                    if is_h2 {
                        serve_h2(tls, handler, log).await;
                    } else {
                        serve_h1(tls, handler, log).await;
                    }
                });
            }
        });

        Self {
            port,
            ca_cert,
            handshakes,
            offered_alpn,
            requests,
        }
    }

    pub fn url(&self, path: &str) -> String {
        format!("https://127.0.0.1:{}{}", self.port, path)
    }

    pub fn address(&self) -> String {
        format!("127.0.0.1:{}", self.port)
    }

    pub fn handshake_count(&self) -> usize {
        self.handshakes.load(Ordering::SeqCst)
    }

    pub fn recorded(&self) -> Vec<Recorded> {
        self.requests.lock().unwrap().clone()
    }
}

async fn serve_h2<S>(io: S, handler: Handler, log: Arc<Mutex<Vec<Recorded>>>)
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let Ok(mut conn) = h2::server::handshake(io).await else {
        return;
    };
    while let Some(Ok((request, mut respond))) = conn.accept().await {
        let recorded = Recorded {
            method: request.method().to_string(),
            path: request.uri().path().to_string(),
            headers: request
                .headers()
                .iter()
                .map(|(k, v)| (k.as_str().to_string(), v.to_str().unwrap_or_default().to_string()))
                .collect(),
        };
        log.lock().unwrap().push(recorded.clone());
        let reply = handler(&recorded);
        tokio::spawn(async move {
            let mut builder = http::Response::builder().status(reply.status);
            for (k, v) in &reply.headers {
                builder = builder.header(k.as_str(), v.as_str());
            }
            let response = builder.body(()).unwrap();
            let end = reply.body.is_empty();
            let Ok(mut send) = respond.send_response(response, end) else {
                return;
            };
            if !end {
                let _ = send.send_data(Bytes::from(reply.body), true);
            }
        });
    }
}

async fn serve_h1<S>(mut io: S, handler: Handler, log: Arc<Mutex<Vec<Recorded>>>)
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut buf = Vec::new();
    loop {
        let (recorded, consumed) = loop {
            if let Some(parsed) = parse_head(&buf) {
                break parsed;
            }
            let mut chunk = [0u8; 4096];
            match io.read(&mut chunk).await {
                Ok(0) | Err(_) => return,
                Ok(n) => buf.extend_from_slice(&chunk[..n]),
            }
        };
        let body_len: usize = recorded
            .header("content-length")
            .and_then(|v| v.parse().ok())
            .unwrap_or(0);
        while buf.len() < consumed + body_len {
            let mut chunk = [0u8; 4096];
            match io.read(&mut chunk).await {
                Ok(0) | Err(_) => return,
                Ok(n) => buf.extend_from_slice(&chunk[..n]),
            }
        }
        buf.drain(..consumed + body_len);

        log.lock().unwrap().push(recorded.clone());
        let reply = handler(&recorded);
        let mut out = format!("HTTP/1.1 {} X\r\ncontent-length: {}\r\n", reply.status, reply.body.len());
        for (k, v) in &reply.headers {
            out.push_str(&format!("{k}: {v}\r\n"));
        }
        out.push_str("\r\n");
        out.push_str(&reply.body);
        if io.write_all(out.as_bytes()).await.is_err() {
            return;
        }
        let _ = io.flush().await;
    }
}

fn parse_head(buf: &[u8]) -> Option<(Recorded, usize)> {
    let mut headers = [httparse::EMPTY_HEADER; 64];
    let mut req = httparse::Request::new(&mut headers);
    match req.parse(buf) {
        Ok(httparse::Status::Complete(consumed)) => Some((
            Recorded {
                method: req.method.unwrap_or_default().to_string(),
                path: req.path.unwrap_or_default().to_string(),
                headers: req
                    .headers
                    .iter()
                    .map(|h| (h.name.to_ascii_lowercase(), String::from_utf8_lossy(h.value).into_owned()))
                    .collect(),
            },
            consumed,
        )),
        _ => None,
    }
}

/// Accepts TCP and never speaks, for handshake timeouts.
pub async fn silent_listener() -> (u16, tokio::task::JoinHandle<()>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    let task = tokio::spawn(async move {
        let mut held = Vec::new();
        while let Ok((tcp, _)) = listener.accept().await {
            held.push(tcp);
        }
    });
    (port, task)
}
