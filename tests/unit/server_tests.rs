/* Relay Proxy (AGPL-3.0)

Copyright (C) 2025 - 404 Contributors

This program is free software: you can redistribute it and/or modify
it under the terms of the GNU Affero General Public License as published by
the Free Software Foundation, either version 3 of the License, or
(at your option) any later version.

This program is distributed in the hope that it will be useful,
but WITHOUT ANY WARRANTY; without even the implied warranty of
MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
GNU Affero General Public License for more details.

You should have received a copy of the GNU Affero General Public License
along with this program.  If not, see <https://www.gnu.org/licenses/>.

*/

use std::net::SocketAddr;

use http::{HeaderMap, HeaderValue, Method, StatusCode, Uri, Version};
use relay_proxy::config::{RelayConfig, TelemetryConfig};
use relay_proxy::proxy::flow::{BodyBuffer, RequestParts};
use relay_proxy::proxy::{ProxyServer, Relay};
use relay_proxy::telemetry::TelemetrySink;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};

fn relay() -> Relay {
    Relay::new(&RelayConfig::default(), TelemetrySink::new(TelemetryConfig::default()))
        .expect("relay builds")
}

fn request(method: Method, uri: &'static str) -> RequestParts {
    let mut headers = HeaderMap::new();
    headers.insert("host", HeaderValue::from_static("localhost:8080"));
    RequestParts {
        method,
        uri: Uri::from_static(uri),
        version: Version::HTTP_11,
        headers,
        body: BodyBuffer::default(),
    }
}

async fn spawn_server() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let addr = listener.local_addr().expect("addr");
    let server = ProxyServer::new(RelayConfig::default().listener, relay());
    tokio::spawn(async move {
        let _ = server.serve(listener).await;
    });
    addr
}

async fn roundtrip(addr: SocketAddr, raw: &str) -> String {
    let mut stream = TcpStream::connect(addr).await.expect("connect");
    stream.write_all(raw.as_bytes()).await.expect("write");
    let mut out = Vec::new();
    stream.read_to_end(&mut out).await.expect("read");
    String::from_utf8(out).expect("utf8 response")
}

#[tokio::test]
async fn missing_url_parameter_is_a_bad_request() {
    let relay = relay();
    for uri in ["/relay", "/relay?url=", "/relay?other=1"] {
        let response = relay.handle(request(Method::GET, uri)).await;
        assert_eq!(response.status, StatusCode::BAD_REQUEST, "{uri}");
        assert_eq!(response.body, r#"{"error":"Missing url parameter"}"#);
    }

    let mut post = request(Method::POST, "/relay");
    post.headers.insert(
        "content-type",
        HeaderValue::from_static("application/x-www-form-urlencoded"),
    );
    post.body = BodyBuffer::from_slice(b"q=rust");
    let response = relay.handle(post).await;
    assert_eq!(response.status, StatusCode::BAD_REQUEST);
    assert_eq!(response.body, r#"{"error":"Missing url parameter"}"#);
}

#[tokio::test]
async fn unparseable_targets_are_invalid_urls() {
    let relay = relay();
    for uri in [
        "/relay?url=not%20a%20url",
        "/relay?url=ftp%3A%2F%2Fexample.com%2Ffile",
        "/relay?url=mailto%3Ame%40example.com",
    ] {
        let response = relay.handle(request(Method::GET, uri)).await;
        assert_eq!(response.status, StatusCode::BAD_REQUEST, "{uri}");
        assert_eq!(response.body, r#"{"error":"Invalid URL format"}"#);
        assert_eq!(response.headers.get("access-control-allow-origin").unwrap(), "*");
    }
}

#[tokio::test]
async fn non_relay_methods_and_paths_are_rejected() {
    let relay = relay();

    let response = relay.handle(request(Method::PUT, "/relay?url=https%3A%2F%2Fexample.com")).await;
    assert_eq!(response.status, StatusCode::METHOD_NOT_ALLOWED);

    let response = relay.handle(request(Method::GET, "/elsewhere?url=https%3A%2F%2Fexample.com")).await;
    assert_eq!(response.status, StatusCode::NOT_FOUND);
    assert_eq!(response.body, r#"{"error":"Not found"}"#);

    let response = relay.handle(request(Method::OPTIONS, "/relay")).await;
    assert_eq!(response.status, StatusCode::NO_CONTENT);
    assert_eq!(response.headers.get("access-control-allow-methods").unwrap(), "GET, POST, OPTIONS");
}

#[tokio::test]
async fn listener_answers_over_http1() {
    let addr = spawn_server().await;

    let response = roundtrip(addr, "GET /relay HTTP/1.1\r\nHost: localhost\r\n\r\n").await;
    assert!(response.starts_with("HTTP/1.1 400 Bad Request\r\n"), "{response}");
    assert!(response.contains("content-type: application/json\r\n"));
    assert!(response.contains("connection: close\r\n"));
    assert!(response.ends_with(r#"{"error":"Missing url parameter"}"#));

    let response = roundtrip(addr, "OPTIONS /relay HTTP/1.1\r\nHost: localhost\r\n\r\n").await;
    assert!(response.starts_with("HTTP/1.1 204 No Content\r\n"), "{response}");
}

#[tokio::test]
async fn listener_enforces_body_limit() {
    let addr = spawn_server().await;
    let limit = RelayConfig::default().listener.max_body_bytes;
    let raw = format!(
        "POST /relay HTTP/1.1\r\nHost: localhost\r\nContent-Type: application/x-www-form-urlencoded\r\nContent-Length: {}\r\n\r\n",
        limit + 1
    );

    let response = roundtrip(addr, &raw).await;
    assert!(response.starts_with("HTTP/1.1 413 Payload Too Large\r\n"), "{response}");
    assert!(response.ends_with(r#"{"error":"Request body too large"}"#));
}

#[tokio::test]
async fn listener_answers_malformed_requests_with_json() {
    let addr = spawn_server().await;

    let response = roundtrip(addr, "HELLO\r\n").await;
    assert!(response.starts_with("HTTP/1.1 400 Bad Request\r\n"), "{response}");
    assert!(response.contains("content-type: application/json\r\n"));
    assert!(response.contains("access-control-allow-origin: *\r\n"));
    assert!(response.contains(r#"{"error":"Malformed request","message":"malformed HTTP request line"}"#));

    let response = roundtrip(
        addr,
        "POST /relay HTTP/1.1\r\nHost: localhost\r\nContent-Length: nope\r\n\r\n",
    )
    .await;
    assert!(response.starts_with("HTTP/1.1 400 Bad Request\r\n"), "{response}");
    assert!(response.contains("invalid Content-Length header"));
}
