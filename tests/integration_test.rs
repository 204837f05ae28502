use std::fs;
use std::io::Read;
use std::net::SocketAddr;
use std::sync::Arc;

use flate2::read::DeflateDecoder;
use tempfile::TempDir;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;

use webapi::{static_handler, Config, Exception, RootSandbox, Server};

fn test_config(root: &str) -> Config {
    Config::new()
        .with_port(0)
        .with_local(true)
        .with_www_root(root)
        .with_health_check_interval(3600)
}

async fn start_server(config: Config) -> (Server, SocketAddr) {
    let server = Server::new(config);
    let addr = server.start().await.unwrap();
    (server, addr)
}

async fn send_request(request: &[u8], addr: SocketAddr) -> Vec<u8> {
    let mut stream = TcpStream::connect(addr).await.unwrap();
    stream.write_all(request).await.unwrap();
    let mut response = Vec::new();
    stream.read_to_end(&mut response).await.unwrap();
    response
}

fn parse_response(response: &[u8]) -> (u16, Vec<(String, String)>, Vec<u8>) {
    let split = response
        .windows(4)
        .position(|w| w == b"\r\n\r\n")
        .expect("response head terminator");
    let head = String::from_utf8_lossy(&response[..split]).to_string();
    let lines: Vec<&str> = head.split("\r\n").collect();

    // 解析状态行
    let status_code = lines[0]
        .split_whitespace()
        .nth(1)
        .unwrap_or("0")
        .parse::<u16>()
        .unwrap_or(0);

    // 解析头部
    let headers = lines[1..]
        .iter()
        .filter_map(|line| line.split_once(": "))
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect();

    (status_code, headers, response[split + 4..].to_vec())
}

fn header<'a>(headers: &'a [(String, String)], key: &str) -> Option<&'a str> {
    headers
        .iter()
        .find(|(k, _)| k.eq_ignore_ascii_case(key))
        .map(|(_, v)| v.as_str())
}

#[tokio::test]
async fn test_registered_route_returns_text() {
    let (server, addr) = start_server(test_config("web")).await;
    server.routes().route("/hello", |ctx| {
        let name = ctx.request.query_value("name").unwrap_or("world").to_string();
        ctx.response.set_text(format!("hello {}", name));
        Ok(())
    });

    let response = send_request(b"GET /hello?name=rust HTTP/1.1\r\nHost: localhost\r\n\r\n", addr).await;
    let (status, headers, body) = parse_response(&response);

    assert_eq!(status, 200);
    assert_eq!(body, b"hello rust");
    assert_eq!(header(&headers, "Content-Type"), Some("text/plain"));
    assert_eq!(header(&headers, "Content-Length"), Some("10"));
    assert_eq!(header(&headers, "Connection"), Some("close"));
    assert!(header(&headers, "Date").is_some());
    assert!(header(&headers, "Server").unwrap().starts_with("webapi/"));

    server.stop().await;
}

#[tokio::test]
async fn test_trailing_slash_reaches_same_route() {
    let (server, addr) = start_server(test_config("web")).await;
    server.routes().route("/api/items", |ctx| {
        ctx.response.set_json(&serde_json::json!({ "items": [1, 2] }));
        Ok(())
    });

    let response = send_request(b"GET /api/items/ HTTP/1.1\r\n\r\n", addr).await;
    let (status, headers, body) = parse_response(&response);

    assert_eq!(status, 200);
    assert!(header(&headers, "Content-Type").unwrap().starts_with("application/json"));
    let value: serde_json::Value = serde_json::from_slice(&body).unwrap();
    assert_eq!(value["items"][1], 2);

    server.stop().await;
}

#[tokio::test]
async fn test_post_body_is_delivered_to_handler() {
    let (server, addr) = start_server(test_config("web")).await;
    server.routes().route("/echo", |ctx| {
        let body = ctx.request.body().clone();
        ctx.response.set_bytes(body).set_content_type("application/octet-stream");
        Ok(())
    });

    let response = send_request(
        b"POST /echo HTTP/1.1\r\nContent-Type: application/octet-stream\r\nContent-Length: 5\r\n\r\nabcde",
        addr,
    )
    .await;
    let (status, headers, body) = parse_response(&response);

    assert_eq!(status, 200);
    assert_eq!(body, b"abcde");
    assert_eq!(header(&headers, "Content-Type"), Some("application/octet-stream"));

    server.stop().await;
}

#[tokio::test]
async fn test_unsupported_method_returns_405() {
    let (server, addr) = start_server(test_config("web")).await;
    server.routes().route("/", |ctx| {
        ctx.response.set_text("root");
        Ok(())
    });

    for method in ["PUT", "DELETE", "HEAD", "get"] {
        let request = format!("{} / HTTP/1.1\r\n\r\n", method);
        let response = send_request(request.as_bytes(), addr).await;
        let (status, headers, body) = parse_response(&response);
        assert_eq!(status, 405, "method {}", method);
        assert_eq!(header(&headers, "Allow"), Some("OPTIONS, GET, POST"));
        assert!(body.is_empty());
    }

    server.stop().await;
}

#[tokio::test]
async fn test_options_preflight() {
    let (server, addr) = start_server(test_config("web")).await;

    let response = send_request(
        b"OPTIONS /anything HTTP/1.1\r\nOrigin: http://example.com\r\nAccess-Control-Request-Headers: X-Token\r\n\r\n",
        addr,
    )
    .await;
    let (status, headers, body) = parse_response(&response);

    assert_eq!(status, 200);
    assert!(body.is_empty());
    assert_eq!(header(&headers, "Access-Control-Allow-Origin"), Some("http://example.com"));
    assert_eq!(header(&headers, "Access-Control-Allow-Methods"), Some("OPTIONS, GET, POST"));
    assert_eq!(header(&headers, "Access-Control-Allow-Headers"), Some("X-Token"));
    assert_eq!(header(&headers, "Content-Length"), Some("0"));

    server.stop().await;
}

#[tokio::test]
async fn test_declared_body_over_limit_returns_413() {
    let (server, addr) = start_server(test_config("web").with_max_receive_size(1024)).await;
    server.routes().route("/upload", |_ctx| Ok(()));

    let response = send_request(
        b"POST /upload HTTP/1.1\r\nContent-Length: 4096\r\n\r\n",
        addr,
    )
    .await;
    let (status, _, body) = parse_response(&response);

    assert_eq!(status, 413);
    assert!(body.is_empty());

    server.stop().await;
}

#[tokio::test]
async fn test_missing_route_without_root_returns_404() {
    let (server, addr) = start_server(test_config("web")).await;
    server.routes().route("/only", |_ctx| Ok(()));

    let response = send_request(b"GET /missing HTTP/1.1\r\n\r\n", addr).await;
    let (status, _, _) = parse_response(&response);
    assert_eq!(status, 404);

    server.stop().await;
}

#[tokio::test]
async fn test_unregister_falls_back_to_root() {
    let (server, addr) = start_server(test_config("web")).await;
    server.routes().route("/", |ctx| {
        ctx.response.set_text("root");
        Ok(())
    });
    server.routes().route("/page", |ctx| {
        ctx.response.set_text("page");
        Ok(())
    });

    let (_, _, body) = parse_response(&send_request(b"GET /page HTTP/1.1\r\n\r\n", addr).await);
    assert_eq!(body, b"page");

    assert!(server.routes().unregister("/page"));
    let (_, _, body) = parse_response(&send_request(b"GET /page HTTP/1.1\r\n\r\n", addr).await);
    assert_eq!(body, b"root");

    server.stop().await;
}

#[tokio::test]
async fn test_handler_failure_returns_500() {
    let (server, addr) = start_server(test_config("web")).await;
    server.routes().route("/fail", |_ctx| Err(Exception::FileNotFound));
    server.routes().route("/panic", |_ctx| panic!("handler exploded"));
    server.routes().route("/big", |_ctx| Err(Exception::PayloadTooLarge));

    let (status, _, _) = parse_response(&send_request(b"GET /fail HTTP/1.1\r\n\r\n", addr).await);
    assert_eq!(status, 500);
    let (status, _, _) = parse_response(&send_request(b"GET /panic HTTP/1.1\r\n\r\n", addr).await);
    assert_eq!(status, 500);
    let (status, _, _) = parse_response(&send_request(b"GET /big HTTP/1.1\r\n\r\n", addr).await);
    assert_eq!(status, 413);

    // 处理器 panic 之后服务器仍然可用
    server.routes().route("/ok", |ctx| {
        ctx.response.set_text("ok");
        Ok(())
    });
    let (status, _, body) = parse_response(&send_request(b"GET /ok HTTP/1.1\r\n\r\n", addr).await);
    assert_eq!(status, 200);
    assert_eq!(body, b"ok");

    server.stop().await;
}

#[tokio::test]
async fn test_deflate_iff_accepted_and_non_empty() {
    let (server, addr) = start_server(test_config("web")).await;
    let text = "compress me ".repeat(200);
    let expected = text.clone();
    server.routes().route("/z", move |ctx| {
        ctx.response.set_text(text.clone());
        Ok(())
    });
    server.routes().route("/empty", |_ctx| Ok(()));

    let response = send_request(b"GET /z HTTP/1.1\r\nAccept-Encoding: gzip, deflate\r\n\r\n", addr).await;
    let (status, headers, body) = parse_response(&response);
    assert_eq!(status, 200);
    assert_eq!(header(&headers, "Content-Encoding"), Some("deflate"));
    assert_eq!(header(&headers, "Content-Length"), Some(body.len().to_string().as_str()));
    let mut decoded = String::new();
    DeflateDecoder::new(&body[..]).read_to_string(&mut decoded).unwrap();
    assert_eq!(decoded, expected);

    let response = send_request(b"GET /z HTTP/1.1\r\n\r\n", addr).await;
    let (_, headers, body) = parse_response(&response);
    assert_eq!(header(&headers, "Content-Encoding"), None);
    assert_eq!(body, expected.as_bytes());

    let response = send_request(b"GET /empty HTTP/1.1\r\nAccept-Encoding: deflate\r\n\r\n", addr).await;
    let (_, headers, body) = parse_response(&response);
    assert_eq!(header(&headers, "Content-Encoding"), None);
    assert!(body.is_empty());

    server.stop().await;
}

#[tokio::test]
async fn test_charset_negotiation_reencodes_text() {
    let (server, addr) = start_server(test_config("web")).await;
    server.routes().route("/latin", |ctx| {
        ctx.response.set_text("café");
        Ok(())
    });

    let response = send_request(
        b"GET /latin HTTP/1.1\r\nAccept-Charset: iso-8859-1, utf-8;q=0.5\r\n\r\n",
        addr,
    )
    .await;
    let (status, headers, body) = parse_response(&response);

    assert_eq!(status, 200);
    assert_eq!(body, b"caf\xe9");
    assert!(header(&headers, "Content-Type").unwrap().contains("charset=windows-1252"));

    server.stop().await;
}

#[tokio::test]
async fn test_cors_origin_is_echoed() {
    let (server, addr) = start_server(test_config("web")).await;
    server.routes().route("/cors", |ctx| {
        ctx.response.set_text("shared").set_cache(60);
        Ok(())
    });

    let response = send_request(b"GET /cors HTTP/1.1\r\nOrigin: http://app.local\r\n\r\n", addr).await;
    let (_, headers, _) = parse_response(&response);

    assert_eq!(header(&headers, "Access-Control-Allow-Origin"), Some("http://app.local"));
    assert_eq!(header(&headers, "Cache-Control"), Some("max-age=60"));

    server.stop().await;
}

#[tokio::test]
async fn test_static_files_and_directory_index() {
    let dir = TempDir::new().unwrap();
    fs::write(dir.path().join("index.html"), "<h1>home</h1>").unwrap();
    fs::create_dir(dir.path().join("docs")).unwrap();
    fs::write(dir.path().join("docs").join("notes.txt"), "some notes").unwrap();
    fs::write(dir.path().join("data.bin"), [0u8, 1, 2, 3]).unwrap();

    let root = dir.path().to_string_lossy().to_string();
    let (server, addr) = start_server(test_config(&root)).await;
    server
        .routes()
        .register("/", static_handler(root.clone(), Arc::new(RootSandbox)));

    let (status, headers, body) = parse_response(&send_request(b"GET / HTTP/1.1\r\n\r\n", addr).await);
    assert_eq!(status, 200);
    assert_eq!(body, b"<h1>home</h1>");
    assert!(header(&headers, "Content-Type").unwrap().starts_with("text/html"));

    let (status, headers, body) =
        parse_response(&send_request(b"GET /docs/notes.txt HTTP/1.1\r\n\r\n", addr).await);
    assert_eq!(status, 200);
    assert_eq!(body, b"some notes");
    assert!(header(&headers, "Content-Disposition").unwrap().starts_with("inline"));

    let (status, headers, body) =
        parse_response(&send_request(b"GET /data.bin HTTP/1.1\r\n\r\n", addr).await);
    assert_eq!(status, 200);
    assert_eq!(body, [0u8, 1, 2, 3]);
    assert_eq!(
        header(&headers, "Content-Disposition"),
        Some("attachment; filename=\"data.bin\"")
    );

    let (status, _, body) = parse_response(&send_request(b"GET /docs HTTP/1.1\r\n\r\n", addr).await);
    assert_eq!(status, 200);
    let listing = String::from_utf8(body).unwrap();
    assert!(listing.contains("notes.txt"));

    let (status, _, _) = parse_response(&send_request(b"GET /missing.txt HTTP/1.1\r\n\r\n", addr).await);
    assert_eq!(status, 404);
    let (status, _, _) = parse_response(&send_request(b"GET /missing HTTP/1.1\r\n\r\n", addr).await);
    assert_eq!(status, 400);

    server.stop().await;
}

#[tokio::test]
async fn test_observer_sees_each_request() {
    use std::sync::atomic::{AtomicUsize, Ordering};

    let (server, addr) = start_server(test_config("web")).await;
    let seen = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&seen);
    server.set_observer(Some(Arc::new(move |_ctx: &webapi::Context| {
        counter.fetch_add(1, Ordering::SeqCst);
    })));
    server.routes().route("/", |ctx| {
        ctx.response.set_text("root");
        Ok(())
    });

    for _ in 0..3 {
        send_request(b"GET / HTTP/1.1\r\n\r\n", addr).await;
    }
    assert_eq!(seen.load(Ordering::SeqCst), 3);

    server.stop().await;
}

#[tokio::test]
async fn test_ping_pong() {
    let (server, addr) = start_server(test_config("web")).await;
    server.routes().route("/ping", |ctx| {
        ctx.response.set_text("pong");
        Ok(())
    });

    let (status, headers, body) = parse_response(&send_request(b"GET /ping HTTP/1.1\r\n\r\n", addr).await);
    assert_eq!(status, 200);
    assert_eq!(header(&headers, "Content-Type"), Some("text/plain"));
    assert_eq!(header(&headers, "Content-Length"), Some("4"));
    assert_eq!(body, b"pong");

    server.stop().await;
}

#[tokio::test]
async fn test_json_map_is_deflated_with_spaced_format() {
    let (server, addr) = start_server(test_config("web")).await;
    server.routes().route("/data", |ctx| {
        let mut map = std::collections::BTreeMap::new();
        map.insert("a", 1);
        ctx.response.set_json(&map);
        Ok(())
    });

    let response = send_request(b"GET /data HTTP/1.1\r\nAccept-Encoding: deflate\r\n\r\n", addr).await;
    let (status, headers, body) = parse_response(&response);
    assert_eq!(status, 200);
    assert_eq!(header(&headers, "Content-Type"), Some("application/json"));
    assert_eq!(header(&headers, "Content-Encoding"), Some("deflate"));
    let mut decoded = String::new();
    DeflateDecoder::new(&body[..]).read_to_string(&mut decoded).unwrap();
    assert_eq!(decoded, "{ \"a\": 1 }");

    server.stop().await;
}

#[tokio::test]
async fn test_oversized_post_never_reaches_handler() {
    use std::sync::atomic::{AtomicBool, Ordering};

    let (server, addr) = start_server(test_config("web").with_max_receive_size(16)).await;
    let invoked = Arc::new(AtomicBool::new(false));
    let flag = Arc::clone(&invoked);
    server.routes().route("/data", move |_ctx| {
        flag.store(true, Ordering::SeqCst);
        Ok(())
    });

    let response = send_request(b"POST /data HTTP/1.1\r\nContent-Length: 17\r\n\r\n", addr).await;
    let (status, headers, _) = parse_response(&response);
    assert_eq!(status, 413);
    assert_eq!(header(&headers, "Connection"), Some("close"));
    assert!(!invoked.load(Ordering::SeqCst));

    server.stop().await;
}
