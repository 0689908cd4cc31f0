//! Shared utilities for integration testing.

#![allow(dead_code)]

use std::net::{Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use hickory_proto::op::{Message, MessageType, OpCode, ResponseCode};
use hickory_proto::rr::rdata::A;
use hickory_proto::rr::{RData, Record, RecordType};
use hickory_proto::serialize::binary::BinEncodable;
use netx::measurement::{BufferSink, Emitter, Measurement};
use netx::resilience::BackoffPolicy;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpListener, UdpSocket};
use tokio_rustls::rustls::pki_types::{CertificateDer, PrivateKeyDer, PrivatePkcs8KeyDer};
use tokio_rustls::rustls::{RootCertStore, ServerConfig};
use tokio_rustls::TlsAcceptor;

/// Emitter recording into a fresh buffer.
pub fn recording_emitter() -> (Arc<Emitter>, Arc<BufferSink>) {
    let sink = Arc::new(BufferSink::new());
    (Arc::new(Emitter::new(sink.clone())), sink)
}

/// Five quick rounds: 10, 20, 40, 80, 160 ms, no jitter.
pub fn fast_backoff() -> BackoffPolicy {
    BackoffPolicy::new(0.01, 0.16, 2.0, 0.0)
}

pub fn kinds(measurements: &[Measurement]) -> Vec<&'static str> {
    measurements.iter().map(Measurement::kind).collect()
}

/// An address nothing listens on.
pub async fn closed_port() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);
    addr
}

/// Accepts connections and never writes to them.
pub async fn start_silent_backend() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        let mut held = Vec::new();
        while let Ok((socket, _)) = listener.accept().await {
            held.push(socket);
        }
    });
    addr
}

/// What a backend handler answers with.
pub struct Reply {
    pub content_type: &'static str,
    pub body: Vec<u8>,
}

impl Reply {
    pub fn text(body: impl Into<String>) -> Self {
        Self {
            content_type: "text/plain",
            body: body.into().into_bytes(),
        }
    }
}

/// Keep-alive HTTP/1.1 backend. `handler` maps the request line and body
/// to a reply.
pub async fn start_backend<F>(handler: F) -> SocketAddr
where
    F: Fn(&str, &[u8]) -> Reply + Send + Sync + 'static,
{
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let handler = Arc::new(handler);
    tokio::spawn(async move {
        while let Ok((socket, _)) = listener.accept().await {
            let handler = handler.clone();
            tokio::spawn(async move {
                serve_http(socket, Duration::ZERO, move |line: &str, body: &[u8]| handler(line, body)).await
            });
        }
    });
    addr
}

/// Keep-alive HTTP/1.1 backend. `handler` maps the request line to a body.
pub async fn start_http_backend<F>(handler: F) -> SocketAddr
where
    F: Fn(&str) -> String + Send + Sync + 'static,
{
    start_backend(move |line, _| Reply::text(handler(line))).await
}

/// Backend answering every request with `response`.
pub async fn start_mock_backend(response: &'static str) -> SocketAddr {
    start_http_backend(move |_| response.to_string()).await
}

fn content_length(head: &str) -> usize {
    head.lines()
        .filter_map(|line| line.split_once(':'))
        .find(|(name, _)| name.trim().eq_ignore_ascii_case("content-length"))
        .and_then(|(_, value)| value.trim().parse().ok())
        .unwrap_or(0)
}

/// Serve requests until the peer closes, answering each after `delay`.
pub async fn serve_http<S, F>(mut stream: S, delay: Duration, handler: F)
where
    S: AsyncRead + AsyncWrite + Unpin,
    F: Fn(&str, &[u8]) -> Reply,
{
    let mut pending = Vec::new();
    let mut buf = [0u8; 4096];
    loop {
        let head_end = loop {
            if let Some(pos) = pending.windows(4).position(|w| w == b"\r\n\r\n") {
                break pos + 4;
            }
            match stream.read(&mut buf).await {
                Ok(0) | Err(_) => return,
                Ok(n) => pending.extend_from_slice(&buf[..n]),
            }
        };
        let head = String::from_utf8_lossy(&pending[..head_end]).into_owned();
        pending.drain(..head_end);
        let body_len = content_length(&head);
        while pending.len() < body_len {
            match stream.read(&mut buf).await {
                Ok(0) | Err(_) => return,
                Ok(n) => pending.extend_from_slice(&buf[..n]),
            }
        }
        let body: Vec<u8> = pending.drain(..body_len).collect();

        let request_line = head.lines().next().unwrap_or_default();
        let reply = handler(request_line, &body);
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        let mut response = format!(
            "HTTP/1.1 200 OK\r\nContent-Type: {}\r\nContent-Length: {}\r\n\r\n",
            reply.content_type,
            reply.body.len()
        )
        .into_bytes();
        response.extend_from_slice(&reply.body);
        if stream.write_all(&response).await.is_err() {
            return;
        }
    }
}

/// Self-signed certificate for `localhost` and 127.0.0.1.
pub struct TestCert {
    pub cert: CertificateDer<'static>,
    pub key: PrivateKeyDer<'static>,
}

impl TestCert {
    pub fn generate() -> Self {
        let certified =
            rcgen::generate_simple_self_signed(vec!["localhost".to_string(), "127.0.0.1".to_string()]).unwrap();
        Self {
            cert: certified.cert.der().clone(),
            key: PrivateKeyDer::Pkcs8(PrivatePkcs8KeyDer::from(certified.key_pair.serialize_der())),
        }
    }

    pub fn roots(&self) -> RootCertStore {
        let mut roots = RootCertStore::empty();
        roots.add(self.cert.clone()).unwrap();
        roots
    }

    fn acceptor(&self) -> TlsAcceptor {
        let provider = Arc::new(tokio_rustls::rustls::crypto::ring::default_provider());
        let mut config = ServerConfig::builder_with_provider(provider)
            .with_safe_default_protocol_versions()
            .unwrap()
            .with_no_client_auth()
            .with_single_cert(vec![self.cert.clone()], self.key.clone_key())
            .unwrap();
        config.alpn_protocols = vec![b"http/1.1".to_vec()];
        TlsAcceptor::from(Arc::new(config))
    }
}

/// TLS backend serving HTTP/1.1 with a fixed body.
pub async fn start_tls_backend(cert: &TestCert, response: &'static str) -> SocketAddr {
    start_delayed_tls_backend(cert, response, Duration::ZERO).await
}

/// TLS backend that holds every response back for `delay`.
pub async fn start_delayed_tls_backend(cert: &TestCert, response: &'static str, delay: Duration) -> SocketAddr {
    let acceptor = cert.acceptor();
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        while let Ok((socket, _)) = listener.accept().await {
            let acceptor = acceptor.clone();
            tokio::spawn(async move {
                if let Ok(stream) = acceptor.accept(socket).await {
                    serve_http(stream, delay, move |_: &str, _: &[u8]| Reply::text(response)).await;
                }
            });
        }
    });
    addr
}

/// Wire-format reply to `query`: `name` has one A record and no AAAA
/// records, every other name is NXDOMAIN.
pub fn dns_answer(query: &[u8], name: &str, ipv4: Ipv4Addr) -> Vec<u8> {
    let query = Message::from_vec(query).unwrap();
    let question = query.queries()[0].clone();
    let mut reply = Message::new();
    reply
        .set_id(query.id())
        .set_message_type(MessageType::Response)
        .set_op_code(OpCode::Query)
        .set_recursion_desired(query.recursion_desired())
        .set_recursion_available(true);
    if question.name().to_ascii().trim_end_matches('.') != name {
        reply.set_response_code(ResponseCode::NXDomain);
    } else if question.query_type() == RecordType::A {
        reply.add_answer(Record::from_rdata(question.name().clone(), 300, RData::A(A(ipv4))));
    }
    reply.add_query(question);
    reply.to_vec().unwrap()
}

/// DNS server on UDP answering like `dns_answer`.
pub async fn start_udp_dns_server(name: &'static str, ipv4: &'static str) -> SocketAddr {
    let ipv4: Ipv4Addr = ipv4.parse().unwrap();
    let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let addr = socket.local_addr().unwrap();
    tokio::spawn(async move {
        let mut buf = vec![0u8; 4096];
        while let Ok((n, peer)) = socket.recv_from(&mut buf).await {
            let reply = dns_answer(&buf[..n], name, ipv4);
            let _ = socket.send_to(&reply, peer).await;
        }
    });
    addr
}

async fn serve_dns_stream<S>(mut stream: S, name: &'static str, ipv4: Ipv4Addr)
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    while let Ok(len) = stream.read_u16().await {
        let mut query = vec![0u8; usize::from(len)];
        if stream.read_exact(&mut query).await.is_err() {
            return;
        }
        let reply = dns_answer(&query, name, ipv4);
        let mut framed = (reply.len() as u16).to_be_bytes().to_vec();
        framed.extend_from_slice(&reply);
        if stream.write_all(&framed).await.is_err() || stream.flush().await.is_err() {
            return;
        }
    }
}

/// DNS server on TCP, or on TLS when `cert` is given.
pub async fn start_stream_dns_server(cert: Option<&TestCert>, name: &'static str, ipv4: &'static str) -> SocketAddr {
    let ipv4: Ipv4Addr = ipv4.parse().unwrap();
    let acceptor = cert.map(TestCert::acceptor);
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        while let Ok((socket, _)) = listener.accept().await {
            let acceptor = acceptor.clone();
            tokio::spawn(async move {
                match acceptor {
                    Some(acceptor) => {
                        if let Ok(stream) = acceptor.accept(socket).await {
                            serve_dns_stream(stream, name, ipv4).await;
                        }
                    }
                    None => serve_dns_stream(socket, name, ipv4).await,
                }
            });
        }
    });
    addr
}

/// RFC 8484 backend answering POSTed queries like `dns_answer`.
pub async fn start_doh_backend(name: &'static str, ipv4: &'static str) -> SocketAddr {
    let ipv4: Ipv4Addr = ipv4.parse().unwrap();
    start_backend(move |line, body| {
        if !line.starts_with("POST ") {
            return Reply::text("queries must be POSTed");
        }
        Reply {
            content_type: "application/dns-message",
            body: dns_answer(body, name, ipv4),
        }
    })
    .await
}

/// Poll `sink` until `pred` holds for its contents or time runs out.
pub async fn wait_for(sink: &BufferSink, pred: impl Fn(usize) -> bool) {
    for _ in 0..100 {
        if pred(sink.len()) {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}
