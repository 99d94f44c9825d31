use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;

/// Minimal Elasticsearch stand-in: answers the `GET /` version probe and
/// accepts `POST /_bulk`, forwarding each received bulk body on a channel.
/// The first `fail_first` bulk requests are answered with a 500 so retry
/// behavior can be observed.
pub async fn start_stub_es(
    version: &'static str,
    fail_first: usize,
) -> (String, mpsc::UnboundedReceiver<String>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = format!("http://{}", listener.local_addr().unwrap());
    let (bodies_tx, bodies_rx) = mpsc::unbounded_channel();
    let failures_left = Arc::new(AtomicUsize::new(fail_first));

    tokio::spawn(async move {
        loop {
            let Ok((stream, _)) = listener.accept().await else {
                break;
            };
            let bodies_tx = bodies_tx.clone();
            let failures_left = Arc::clone(&failures_left);
            tokio::spawn(handle_connection(stream, version, bodies_tx, failures_left));
        }
    });

    (addr, bodies_rx)
}

async fn handle_connection(
    mut stream: TcpStream,
    version: &'static str,
    bodies_tx: mpsc::UnboundedSender<String>,
    failures_left: Arc<AtomicUsize>,
) {
    let Some((method, path, body)) = read_request(&mut stream).await else {
        return;
    };

    let (status, response_body) = match (method.as_str(), path.as_str()) {
        ("GET", "/") => (
            "200 OK",
            format!(r#"{{"version":{{"number":"{version}"}}}}"#),
        ),
        ("POST", "/_bulk") => {
            if failures_left
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok()
            {
                (
                    "500 Internal Server Error",
                    r#"{"error":"forced"}"#.to_string(),
                )
            } else {
                let _ = bodies_tx.send(body);
                ("200 OK", r#"{"errors":false,"items":[]}"#.to_string())
            }
        }
        _ => ("404 Not Found", String::new()),
    };

    let response = format!(
        "HTTP/1.1 {status}\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{response_body}",
        response_body.len()
    );
    let _ = stream.write_all(response.as_bytes()).await;
    let _ = stream.shutdown().await;
}

/// Read one HTTP/1.1 request (headers + content-length body).
async fn read_request(stream: &mut TcpStream) -> Option<(String, String, String)> {
    let mut raw = Vec::new();
    let mut buf = [0u8; 4096];
    let header_end = loop {
        let n = stream.read(&mut buf).await.ok()?;
        if n == 0 {
            return None;
        }
        raw.extend_from_slice(&buf[..n]);
        if let Some(pos) = find_header_end(&raw) {
            break pos;
        }
        if raw.len() > 1 << 20 {
            return None;
        }
    };

    let head = String::from_utf8_lossy(&raw[..header_end]).into_owned();
    let mut lines = head.lines();
    let request_line = lines.next()?;
    let mut parts = request_line.split_whitespace();
    let method = parts.next()?.to_string();
    let path = parts.next()?.to_string();

    let content_length: usize = lines
        .filter_map(|l| l.split_once(':'))
        .find(|(k, _)| k.eq_ignore_ascii_case("content-length"))
        .and_then(|(_, v)| v.trim().parse().ok())
        .unwrap_or(0);

    let mut body = raw[header_end + 4..].to_vec();
    while body.len() < content_length {
        let n = stream.read(&mut buf).await.ok()?;
        if n == 0 {
            break;
        }
        body.extend_from_slice(&buf[..n]);
    }
    Some((method, path, String::from_utf8_lossy(&body).into_owned()))
}

fn find_header_end(raw: &[u8]) -> Option<usize> {
    raw.windows(4).position(|w| w == b"\r\n\r\n")
}
