mod support;

use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::time::Duration;

use htx::{ErrorCode, HttpClient, ProxyServer};
use support::{FixedCredentials, FlakyModernTls, MockResponse, MockServer, PassthroughTls};

const BASIC_USER_PASS: &str = "Basic dXNlcjpwYXNz";

fn proxied_client(proxy: &MockServer) -> HttpClient {
    HttpClient::builder()
        .read_timeout(Duration::from_secs(2))
        .proxy(ProxyServer::new(proxy.host(), proxy.port()))
        .tls_factory(Arc::new(PassthroughTls))
        .authenticator(Arc::new(FixedCredentials::new("user", "pass")))
        .build()
        .expect("build client")
}

#[test]
fn plain_http_proxy_gets_the_absolute_request_target() {
    let proxy = MockServer::start(vec![MockResponse::new(
        200,
        Vec::<(&str, &str)>::new(),
        b"proxied".to_vec(),
    )]);

    let client = proxied_client(&proxy);
    let mut response = client
        .open("http://origin.example/path?q=1")
        .expect("open")
        .response()
        .expect("proxied response");
    assert_eq!(response.read_body().expect("body"), b"proxied");

    let captured = &proxy.requests()[0];
    assert_eq!(captured.method, "GET");
    assert_eq!(captured.target, "http://origin.example/path?q=1");
    assert_eq!(captured.header("Host"), Some("origin.example"));
    assert_eq!(captured.header("Proxy-Connection"), Some("Keep-Alive"));
}

#[test]
fn proxy_challenge_on_plain_http_is_answered_with_proxy_credentials() {
    let proxy = MockServer::start(vec![
        MockResponse::new(
            407,
            vec![("Proxy-Authenticate", "Basic realm=\"proxy\"")],
            Vec::new(),
        ),
        MockResponse::new(200, Vec::<(&str, &str)>::new(), b"through".to_vec()),
    ]);

    let client = proxied_client(&proxy);
    let mut response = client
        .open("http://origin.example/")
        .expect("open")
        .response()
        .expect("response after proxy auth");
    assert_eq!(response.status(), 200);
    response.read_body().expect("drain");

    let requests = proxy.requests();
    assert_eq!(requests.len(), 2);
    assert_eq!(requests[0].header("Proxy-Authorization"), None);
    assert_eq!(
        requests[1].header("Proxy-Authorization"),
        Some(BASIC_USER_PASS)
    );
    // Proxy credentials never masquerade as origin credentials.
    assert_eq!(requests[1].header("Authorization"), None);
}

#[test]
fn https_through_a_proxy_tunnels_with_connect() {
    let proxy = MockServer::start(vec![
        MockResponse::new(200, Vec::<(&str, &str)>::new(), Vec::new()),
        MockResponse::new(200, Vec::<(&str, &str)>::new(), b"tunneled".to_vec()),
    ]);

    let client = proxied_client(&proxy);
    let mut request = client.open("https://origin.example/secret").expect("open");
    request.set_header("X-Custom", "caller").expect("set header");
    let mut response = request.response().expect("tunneled response");

    assert_eq!(response.read_body().expect("body"), b"tunneled");
    // The CONNECT exchange consumed sequence slot 0.
    assert_eq!(response.sequence_number(), 1);

    let requests = proxy.requests();
    assert_eq!(requests.len(), 2);
    assert_eq!(requests[0].method, "CONNECT");
    assert_eq!(requests[0].target, "origin.example:443");
    assert_eq!(requests[0].header("Host"), Some("origin.example:443"));
    assert_eq!(requests[0].header("Proxy-Connection"), Some("Keep-Alive"));
    // Origin request headers stay out of the tunnel handshake.
    assert_eq!(requests[0].header("X-Custom"), None);

    assert_eq!(requests[1].method, "GET");
    assert_eq!(requests[1].target, "/secret");
    assert_eq!(requests[1].header("X-Custom"), Some("caller"));
    assert_eq!(requests[1].header("Proxy-Connection"), None);
    assert_eq!(requests[1].connection, 0);
}

#[test]
fn connect_challenge_is_retried_once_with_credentials() {
    let proxy = MockServer::start(vec![
        MockResponse::new(
            407,
            vec![("Proxy-Authenticate", "Basic realm=\"proxy\"")],
            Vec::new(),
        ),
        MockResponse::new(200, Vec::<(&str, &str)>::new(), Vec::new()),
        MockResponse::new(200, Vec::<(&str, &str)>::new(), b"in".to_vec()),
    ]);

    let client = proxied_client(&proxy);
    let mut response = client
        .open("https://origin.example/")
        .expect("open")
        .response()
        .expect("tunneled response after auth");
    assert_eq!(response.read_body().expect("body"), b"in");
    assert_eq!(response.sequence_number(), 2);

    let requests = proxy.requests();
    assert_eq!(requests.len(), 3);
    assert_eq!(requests[0].method, "CONNECT");
    assert_eq!(requests[0].header("Proxy-Authorization"), None);
    assert_eq!(requests[1].method, "CONNECT");
    assert_eq!(
        requests[1].header("Proxy-Authorization"),
        Some(BASIC_USER_PASS)
    );
    assert_eq!(requests[2].method, "GET");
    assert_eq!(requests[2].header("Proxy-Authorization"), None);
}

#[test]
fn refused_tunnel_is_a_protocol_error() {
    let proxy = MockServer::start(vec![MockResponse::new(
        503,
        Vec::<(&str, &str)>::new(),
        Vec::new(),
    )]);

    let client = proxied_client(&proxy);
    let error = client
        .open("https://origin.example/")
        .expect("open")
        .response()
        .expect_err("refused CONNECT must fail");
    assert_eq!(error.code(), ErrorCode::Protocol);
}

#[test]
fn non_basic_connect_challenge_is_unsupported() {
    let proxy = MockServer::start(vec![MockResponse::new(
        407,
        vec![("Proxy-Authenticate", "Negotiate")],
        Vec::new(),
    )]);

    let client = proxied_client(&proxy);
    let error = client
        .open("https://origin.example/")
        .expect("open")
        .response()
        .expect_err("unanswerable proxy scheme must fail");
    assert_eq!(error.code(), ErrorCode::UnsupportedAuthScheme);
}

#[test]
fn failed_modern_handshake_gets_one_compat_retry() {
    let server = MockServer::start(vec![MockResponse::new(
        200,
        Vec::<(&str, &str)>::new(),
        b"downgraded".to_vec(),
    )]);

    let factory = Arc::new(FlakyModernTls::new());
    let client = HttpClient::builder()
        .read_timeout(Duration::from_secs(2))
        .tls_factory(Arc::clone(&factory) as Arc<dyn htx::TlsFactory>)
        .build()
        .expect("build client");

    let mut response = client
        .open(&format!("https://127.0.0.1:{}/", server.port()))
        .expect("open")
        .response()
        .expect("response after fallback");
    assert_eq!(response.read_body().expect("body"), b"downgraded");

    assert_eq!(factory.modern_attempts.load(Ordering::SeqCst), 1);
    assert_eq!(factory.compat_attempts.load(Ordering::SeqCst), 1);
}

#[test]
fn swapping_the_tls_factory_abandons_pooled_sockets() {
    let server = MockServer::start(vec![
        MockResponse::new(200, Vec::<(&str, &str)>::new(), b"a".to_vec()),
        MockResponse::new(200, Vec::<(&str, &str)>::new(), b"b".to_vec()),
        MockResponse::new(200, Vec::<(&str, &str)>::new(), b"c".to_vec()),
    ]);

    let original_factory = Arc::new(PassthroughTls);
    let client = HttpClient::builder()
        .read_timeout(Duration::from_secs(2))
        .tls_factory(Arc::clone(&original_factory) as Arc<dyn htx::TlsFactory>)
        .build()
        .expect("build client");
    let url = format!("https://127.0.0.1:{}/", server.port());

    for expected in [0_u64, 1] {
        let mut response = client.open(&url).expect("open").response().expect("response");
        assert_eq!(response.sequence_number(), expected);
        response.read_body().expect("drain");
    }

    // Reuse is keyed on the factory instance, so a new factory never
    // inherits sockets handshaken by the old one.
    client.set_tls_factory(Arc::new(PassthroughTls));
    let mut response = client.open(&url).expect("open").response().expect("response");
    assert_eq!(response.sequence_number(), 0);
    response.read_body().expect("drain");

    let requests = server.requests();
    assert_eq!(requests[2].connection, 1);
}
