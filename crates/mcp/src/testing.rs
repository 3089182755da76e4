//! Local HTTP tool servers for exercising the network transports.
//!
//! Both servers answer `initialize`, `tools/list` (one `add` tool) and
//! `tools/call` for `add`, and record every HTTP request they receive.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};

use serde_json::{Value, json};
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::tcp::OwnedReadHalf;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;

/// Session id both servers hand out.
pub(crate) const SESSION: &str = "sess-42";

#[derive(Debug, Clone)]
pub(crate) struct Recorded {
    pub method: String,
    pub path: String,
    pub headers: HashMap<String, String>,
    pub body: String,
}

impl Recorded {
    pub(crate) fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name).map(String::as_str)
    }

    /// JSON-RPC method of a POSTed message.
    pub(crate) fn rpc_method(&self) -> Option<String> {
        let message: Value = serde_json::from_str(&self.body).ok()?;
        message["method"].as_str().map(str::to_string)
    }
}

pub(crate) type RequestLog = Arc<Mutex<Vec<Recorded>>>;

pub(crate) struct MockServer {
    pub url: String,
    pub log: RequestLog,
}

impl MockServer {
    pub(crate) fn requests(&self) -> Vec<Recorded> {
        self.log.lock().unwrap().clone()
    }
}

/// Result for one JSON-RPC request.
fn answer(method: &str, params: &Value) -> Value {
    match method {
        "initialize" => json!({
            "protocolVersion": params["protocolVersion"],
            "capabilities": {"tools": {}},
            "serverInfo": {"name": "mock", "version": "1.0"}
        }),
        "tools/list" => json!({
            "tools": [{
                "name": "add",
                "description": "Add two numbers",
                "inputSchema": {"type": "object"}
            }]
        }),
        "tools/call" => {
            let args = &params["arguments"];
            let sum = args["a"].as_i64().unwrap_or(0) + args["b"].as_i64().unwrap_or(0);
            json!({"content": [{"type": "text", "text": sum.to_string()}]})
        }
        _ => json!({}),
    }
}

fn reply(message: &Value) -> Option<Value> {
    let id = message.get("id")?;
    let method = message.get("method")?.as_str()?;
    Some(json!({
        "jsonrpc": "2.0",
        "id": id,
        "result": answer(method, &message["params"]),
    }))
}

async fn read_request(reader: &mut BufReader<OwnedReadHalf>) -> Option<Recorded> {
    let mut line = String::new();
    if reader.read_line(&mut line).await.ok()? == 0 {
        return None;
    }
    let mut parts = line.split_whitespace();
    let method = parts.next()?.to_string();
    let path = parts.next()?.to_string();

    let mut headers = HashMap::new();
    loop {
        line.clear();
        reader.read_line(&mut line).await.ok()?;
        let header = line.trim_end();
        if header.is_empty() {
            break;
        }
        if let Some((name, value)) = header.split_once(':') {
            headers.insert(name.trim().to_ascii_lowercase(), value.trim().to_string());
        }
    }

    let length = headers
        .get("content-length")
        .and_then(|v| v.parse().ok())
        .unwrap_or(0);
    let mut body = vec![0; length];
    reader.read_exact(&mut body).await.ok()?;

    Some(Recorded {
        method,
        path,
        headers,
        body: String::from_utf8_lossy(&body).into_owned(),
    })
}

fn respond(status: &str, headers: &[(&str, &str)], body: &str) -> String {
    let mut out = format!("HTTP/1.1 {status}\r\ncontent-length: {}\r\n", body.len());
    for (name, value) in headers {
        out.push_str(&format!("{name}: {value}\r\n"));
    }
    out.push_str("\r\n");
    out.push_str(body);
    out
}

async fn bind() -> (TcpListener, SocketAddr) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    (listener, addr)
}

/// Streamable HTTP server at `/mcp`.
///
/// `initialize` is answered with a JSON body carrying the session header;
/// later requests are answered as a one-event stream.
pub(crate) async fn streamable_http_server() -> MockServer {
    let (listener, addr) = bind().await;
    let log = RequestLog::default();
    let accepted = log.clone();
    tokio::spawn(async move {
        while let Ok((stream, _)) = listener.accept().await {
            tokio::spawn(serve_streamable(stream, accepted.clone()));
        }
    });
    MockServer {
        url: format!("http://{addr}/mcp"),
        log,
    }
}

async fn serve_streamable(stream: TcpStream, log: RequestLog) {
    let (read, mut write) = stream.into_split();
    let mut reader = BufReader::new(read);
    while let Some(request) = read_request(&mut reader).await {
        log.lock().unwrap().push(request.clone());

        let response = match request.method.as_str() {
            "POST" => {
                let message: Value = serde_json::from_str(&request.body).unwrap_or_default();
                match reply(&message) {
                    Some(reply) if message["method"] == "initialize" => respond(
                        "200 OK",
                        &[("content-type", "application/json"), ("mcp-session-id", SESSION)],
                        &reply.to_string(),
                    ),
                    Some(reply) => respond(
                        "200 OK",
                        &[("content-type", "text/event-stream")],
                        &format!("event: message\ndata: {reply}\n\n"),
                    ),
                    None => respond("202 Accepted", &[], ""),
                }
            }
            "DELETE" => respond("200 OK", &[], ""),
            _ => respond("405 Method Not Allowed", &[], ""),
        };
        if write.write_all(response.as_bytes()).await.is_err() {
            return;
        }
    }
}

/// SSE server: the event stream lives at `/sse` and messages are POSTed to
/// the announced `/messages?sessionId=...` endpoint. A call to the tool
/// named `unreachable` is rejected with HTTP 500.
pub(crate) async fn sse_server() -> MockServer {
    let (listener, addr) = bind().await;
    let log = RequestLog::default();
    let (events_tx, events_rx) = mpsc::unbounded_channel::<String>();
    let events_rx = Arc::new(tokio::sync::Mutex::new(Some(events_rx)));

    let accepted = log.clone();
    tokio::spawn(async move {
        while let Ok((stream, _)) = listener.accept().await {
            tokio::spawn(serve_sse(
                stream,
                accepted.clone(),
                events_tx.clone(),
                events_rx.clone(),
            ));
        }
    });
    MockServer {
        url: format!("http://{addr}/sse"),
        log,
    }
}

async fn serve_sse(
    stream: TcpStream,
    log: RequestLog,
    events_tx: mpsc::UnboundedSender<String>,
    events_rx: Arc<tokio::sync::Mutex<Option<mpsc::UnboundedReceiver<String>>>>,
) {
    let (read, mut write) = stream.into_split();
    let mut reader = BufReader::new(read);
    while let Some(request) = read_request(&mut reader).await {
        log.lock().unwrap().push(request.clone());

        if request.method == "GET" {
            let Some(mut events) = events_rx.lock().await.take() else {
                let _ = write.write_all(respond("409 Conflict", &[], "").as_bytes()).await;
                return;
            };
            let head = "HTTP/1.1 200 OK\r\ncontent-type: text/event-stream\r\ncache-control: no-cache\r\nconnection: close\r\n\r\n";
            let endpoint = format!("event: endpoint\ndata: /messages?sessionId={SESSION}\n\n");
            if write.write_all(head.as_bytes()).await.is_err()
                || write.write_all(endpoint.as_bytes()).await.is_err()
            {
                return;
            }
            while let Some(data) = events.recv().await {
                let event = format!("event: message\ndata: {data}\n\n");
                if write.write_all(event.as_bytes()).await.is_err() {
                    return;
                }
            }
            return;
        }

        let message: Value = serde_json::from_str(&request.body).unwrap_or_default();
        if message["params"]["name"] == "unreachable" {
            let _ = write
                .write_all(respond("500 Internal Server Error", &[], "down").as_bytes())
                .await;
            continue;
        }
        if write
            .write_all(respond("202 Accepted", &[], "").as_bytes())
            .await
            .is_err()
        {
            return;
        }
        if let Some(reply) = reply(&message) {
            let _ = events_tx.send(reply.to_string());
        }
    }
}
