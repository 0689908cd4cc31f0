//! Traced HTTP round trips over the pooled transport.

mod common;

use std::collections::HashSet;
use std::sync::Arc;
use std::time::{Duration, Instant};

use http::Request;
use http_body_util::BodyExt;
use netx::http::{empty, BufferBody, HttpTransport, RoundTrip, Tracer};
use netx::measurement::{BufferSink, ConnId, Measurement, TransactionId};
use netx::net::tls::client_config_with_roots;
use netx::net::Dialer;
use netx::resolver::StaticResolver;
use netx::{Context, Emitter};

use common::{
    kinds, recording_emitter, start_delayed_tls_backend, start_mock_backend, start_silent_backend,
    start_tls_backend, TestCert,
};

fn traced_client(emitter: Arc<Emitter>) -> Tracer<HttpTransport> {
    let transport = HttpTransport::new(Dialer::new(emitter.clone()));
    Tracer::new(transport, emitter)
}

fn get(url: &str) -> Request<netx::http::HttpBody> {
    Request::get(url).body(empty()).unwrap()
}

fn for_transaction(ms: &[Measurement], tx: TransactionId) -> Vec<&'static str> {
    let mut out: Vec<&'static str> = Vec::new();
    for m in ms.iter().filter(|m| m.transaction_id() == tx) {
        if out.last() != Some(&m.kind()) {
            out.push(m.kind());
        }
    }
    out
}

const FULL_TRANSACTION: [&str; 7] = [
    "http_connection_ready",
    "http_request_headers_done",
    "http_request_done",
    "http_response_start",
    "http_response_headers_done",
    "http_response_body_part",
    "http_response_done",
];

#[tokio::test]
async fn get_emits_full_transaction_in_order() {
    let addr = start_mock_backend("hello world").await;
    let (emitter, sink) = recording_emitter();
    let client = traced_client(emitter);

    let response = client.round_trip(get(&format!("http://{addr}/path?q=1"))).await.unwrap();
    assert_eq!(response.status(), 200);
    let tx = *response.extensions().get::<TransactionId>().unwrap();
    let conn_id = *response.extensions().get::<ConnId>().unwrap();
    let body = response.into_body().collect().await.unwrap().to_bytes();
    assert_eq!(&body[..], b"hello world");

    let ms = sink.pop_all();
    assert_eq!(for_transaction(&ms, tx), FULL_TRANSACTION.to_vec());
    assert!(ms
        .iter()
        .filter(|m| m.transaction_id() == tx)
        .all(|m| m.conn_id() == conn_id));

    let headers_done = ms.iter().find_map(|m| match m {
        Measurement::HttpRequestHeadersDone(h) => Some(h),
        _ => None,
    });
    let headers_done = headers_done.unwrap();
    assert_eq!(headers_done.method, "GET");
    assert_eq!(headers_done.url, format!("http://{addr}/path?q=1"));
    assert!(headers_done.headers.iter().any(|(k, _)| k == "host"));

    // Connection-level measurements share the connection ID.
    assert!(ms
        .iter()
        .filter(|m| matches!(m, Measurement::Connect(_) | Measurement::Write(_)))
        .all(|m| m.conn_id() == conn_id));

    let done_at = ms.iter().position(|m| m.kind() == "http_response_done").unwrap();
    let headers_at = ms.iter().position(|m| m.kind() == "http_response_headers_done").unwrap();
    assert!(headers_at < done_at);
}

#[tokio::test]
async fn second_request_reuses_connection() {
    let addr = start_mock_backend("again").await;
    let (emitter, sink) = recording_emitter();
    let client = traced_client(emitter);
    let url = format!("http://{addr}/");

    let first = client.round_trip(get(&url)).await.unwrap();
    first.into_body().collect().await.unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;
    let second = client.round_trip(get(&url)).await.unwrap();
    second.into_body().collect().await.unwrap();

    let ready: Vec<_> = sink
        .pop_all()
        .into_iter()
        .filter_map(|m| match m {
            Measurement::HttpConnectionReady(r) => Some(r),
            _ => None,
        })
        .collect();
    assert_eq!(ready.len(), 2);
    assert!(!ready[0].reused);
    assert!(ready[1].reused);
    assert_eq!(ready[0].conn_id, ready[1].conn_id);
    assert_ne!(ready[0].transaction_id, ready[1].transaction_id);
}

#[tokio::test]
async fn concurrent_round_trips_get_distinct_transactions() {
    let addr = start_mock_backend("concurrent").await;
    let (emitter, sink) = recording_emitter();
    let client = traced_client(emitter);
    let url = format!("http://{addr}/");

    let mut handles = Vec::new();
    for _ in 0..5 {
        let client = client.clone();
        let url = url.clone();
        handles.push(tokio::spawn(async move {
            let response = client.round_trip(get(&url)).await.unwrap();
            let tx = *response.extensions().get::<TransactionId>().unwrap();
            response.into_body().collect().await.unwrap();
            tx
        }));
    }
    let mut txs = HashSet::new();
    for handle in handles {
        txs.insert(handle.await.unwrap());
    }
    assert_eq!(txs.len(), 5);

    let ms = sink.pop_all();
    for tx in txs {
        assert_eq!(for_transaction(&ms, tx), FULL_TRANSACTION.to_vec());
        let done = ms
            .iter()
            .filter(|m| m.transaction_id() == tx && m.kind() == "http_response_done")
            .count();
        assert_eq!(done, 1);
    }
}

#[tokio::test]
async fn eager_bodies_are_done_before_return() {
    let addr = start_mock_backend("eager body").await;
    let (emitter, sink) = recording_emitter();
    let client = BufferBody::new(traced_client(emitter));

    let response = client.round_trip(get(&format!("http://{addr}/"))).await.unwrap();
    let ms = sink.pop_all();
    assert_eq!(ms.iter().filter(|m| m.kind() == "http_response_done").count(), 1);
    let body = response.into_body().collect().await.unwrap().to_bytes();
    assert_eq!(&body[..], b"eager body");
    assert!(sink.pop_all().iter().all(|m| m.transaction_id() == TransactionId::NONE));
}

#[tokio::test]
async fn untraced_requests_emit_only_connection_events() {
    let addr = start_mock_backend("plain").await;
    let (emitter, sink) = recording_emitter();
    let transport = HttpTransport::new(Dialer::new(emitter));

    let response = transport.round_trip(get(&format!("http://{addr}/"))).await.unwrap();
    response.into_body().collect().await.unwrap();
    let ms = sink.pop_all();
    assert!(ms.iter().all(|m| m.transaction_id() == TransactionId::NONE));
    assert!(kinds(&ms).contains(&"connect"));
}

fn tls_client(cert: &TestCert, emitter: Arc<Emitter>) -> Tracer<HttpTransport> {
    let resolver = StaticResolver::new().with_host("localhost", ["127.0.0.1".parse().unwrap()]);
    let tls = client_config_with_roots(&["http/1.1".to_string()], cert.roots()).unwrap();
    let dialer = Dialer::new(emitter.clone())
        .with_resolver(Arc::new(resolver))
        .with_tls_config(tls);
    Tracer::new(HttpTransport::new(dialer), emitter)
}

#[tokio::test]
async fn https_round_trip_includes_handshake() {
    let cert = TestCert::generate();
    let addr = start_tls_backend(&cert, "over tls").await;
    let sink = Arc::new(BufferSink::new());
    let emitter = Arc::new(Emitter::new(sink.clone()));
    let client = tls_client(&cert, emitter);

    let response = client
        .round_trip(get(&format!("https://localhost:{}/", addr.port())))
        .await
        .unwrap();
    let tx = *response.extensions().get::<TransactionId>().unwrap();
    let body = response.into_body().collect().await.unwrap().to_bytes();
    assert_eq!(&body[..], b"over tls");

    let ms = sink.pop_all();
    let k = kinds(&ms);
    let handshake_at = k.iter().position(|k| *k == "tls_handshake").unwrap();
    let ready_at = k.iter().position(|k| *k == "http_connection_ready").unwrap();
    assert!(handshake_at < ready_at);
    assert_eq!(for_transaction(&ms, tx), FULL_TRANSACTION.to_vec());
}

#[tokio::test]
async fn https_response_start_waits_for_application_data() {
    let cert = TestCert::generate();
    let delay = Duration::from_millis(300);
    let addr = start_delayed_tls_backend(&cert, "slow answer", delay).await;
    let (emitter, sink) = recording_emitter();
    let client = tls_client(&cert, emitter);

    let response = client
        .round_trip(get(&format!("https://localhost:{}/", addr.port())))
        .await
        .unwrap();
    let tx = *response.extensions().get::<TransactionId>().unwrap();
    response.into_body().collect().await.unwrap();

    let ms = sink.pop_all();
    assert_eq!(for_transaction(&ms, tx), FULL_TRANSACTION.to_vec());
    let time_of = |kind: &str| {
        ms.iter()
            .find(|m| m.transaction_id() == tx && m.kind() == kind)
            .map(Measurement::time)
            .unwrap()
    };
    // Session tickets arrive right after the handshake; the response does not.
    let waited = time_of("http_response_start") - time_of("http_request_done");
    assert!(waited >= Duration::from_millis(250), "response start after {waited:?}");
}

#[tokio::test]
async fn request_context_bounds_waiting_for_headers() {
    let addr = start_silent_backend().await;
    let (emitter, sink) = recording_emitter();
    let client = traced_client(emitter);

    let mut req = get(&format!("http://{addr}/"));
    req.extensions_mut().insert(Context::with_timeout(Duration::from_millis(200)));
    let start = Instant::now();
    let err = tokio::time::timeout(Duration::from_secs(3), client.round_trip(req))
        .await
        .expect("round trip outlived its context")
        .unwrap_err();
    assert!(err.is_timeout(), "{err:?}");
    assert!(start.elapsed() < Duration::from_secs(2));

    let ms = sink.pop_all();
    let k = kinds(&ms);
    assert!(k.contains(&"http_request_done"));
    assert!(!k.contains(&"http_response_start"));
    assert!(!k.contains(&"http_response_headers_done"));
}
