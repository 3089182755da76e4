//! Server-sent-events transport.
//!
//! The client holds one GET stream open. The server's first `endpoint` event
//! names the URL to POST messages to; everything the server sends back
//! arrives as `message` events on that stream. rmcp runs the protocol over
//! the sink and stream built here and correlates responses itself.

use std::pin::Pin;

use futures::{Sink, Stream};
use reqwest::Url;
use rmcp::model::{ClientJsonRpcMessage, ServerJsonRpcMessage};
use serde_json::json;
use tokio::sync::mpsc;

use super::event_stream::{EventStream, SseEvent};
use crate::error::{Error, Result};

/// JSON-RPC internal error, used for requests that never reached the server.
const UNDELIVERED: i32 = -32603;

pub(crate) type MessageSink = Pin<Box<dyn Sink<ClientJsonRpcMessage, Error = Error> + Send>>;
pub(crate) type MessageStream = Pin<Box<dyn Stream<Item = ServerJsonRpcMessage> + Send>>;

/// An open event stream whose endpoint has been announced.
pub struct SseTransport {
    client: reqwest::Client,
    endpoint: Url,
    session_id: Option<String>,
    events: EventStream,
}

impl SseTransport {
    /// Open the event stream and wait for the server to announce its endpoint.
    pub async fn connect(url: &str) -> Result<Self> {
        let base = Url::parse(url).map_err(|e| Error::Config(format!("invalid url {url}: {e}")))?;
        let client = reqwest::Client::new();

        let response = client
            .get(base.clone())
            .header("Accept", "text/event-stream")
            .send()
            .await?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(Error::HttpStatus {
                status: status.as_u16(),
                body,
            });
        }

        let mut events = EventStream::new(response);
        let endpoint = loop {
            match events.next_event().await? {
                Some(event) if event.event == "endpoint" => {
                    break resolve_endpoint(&base, event.data.trim())?;
                }
                Some(event) => {
                    tracing::debug!(event = %event.event, "ignoring event before endpoint");
                }
                None => return Err(Error::Closed),
            }
        };
        let session_id = endpoint
            .query_pairs()
            .find(|(key, _)| key == "sessionId" || key == "session_id")
            .map(|(_, value)| value.into_owned());

        tracing::debug!(%endpoint, "sse endpoint announced");

        Ok(Self {
            client,
            endpoint,
            session_id,
            events,
        })
    }

    pub fn endpoint(&self) -> &Url {
        &self.endpoint
    }

    pub fn session_id(&self) -> Option<&str> {
        self.session_id.as_deref()
    }

    /// Split into the outbound sink and inbound stream rmcp serves over.
    ///
    /// A POST that fails is answered locally with a JSON-RPC error for its
    /// request id, so the caller sees the failure instead of waiting out the
    /// request timeout.
    pub(crate) fn into_parts(self) -> (MessageSink, MessageStream) {
        let (failures_tx, failures_rx) = mpsc::unbounded_channel();
        let poster = Poster {
            client: self.client,
            endpoint: self.endpoint,
            failures: failures_tx,
        };
        let sink = futures::sink::unfold(poster, |poster, message: ClientJsonRpcMessage| async move {
            poster.deliver(&message).await;
            Ok::<_, Error>(poster)
        });
        let inbound = Inbound {
            events: self.events,
            failures: failures_rx,
        };
        let stream = futures::stream::unfold(inbound, Inbound::next);
        (Box::pin(sink), Box::pin(stream))
    }
}

struct Poster {
    client: reqwest::Client,
    endpoint: Url,
    failures: mpsc::UnboundedSender<ServerJsonRpcMessage>,
}

impl Poster {
    async fn deliver(&self, message: &ClientJsonRpcMessage) {
        if let Err(e) = self.post(message).await {
            tracing::warn!(endpoint = %self.endpoint, error = %e, "sse post failed");
            if let Some(reply) = undelivered_reply(message, &e) {
                let _ = self.failures.send(reply);
            }
        }
    }

    async fn post(&self, message: &ClientJsonRpcMessage) -> Result<()> {
        let response = self
            .client
            .post(self.endpoint.clone())
            .json(message)
            .send()
            .await?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(Error::HttpStatus {
                status: status.as_u16(),
                body,
            });
        }
        Ok(())
    }
}

struct Inbound {
    events: EventStream,
    failures: mpsc::UnboundedReceiver<ServerJsonRpcMessage>,
}

enum Next {
    Reply(ServerJsonRpcMessage),
    Event(Result<Option<SseEvent>>),
}

impl Inbound {
    async fn next(mut self) -> Option<(ServerJsonRpcMessage, Self)> {
        loop {
            let next = tokio::select! {
                Some(reply) = self.failures.recv() => Next::Reply(reply),
                event = self.events.next_event() => Next::Event(event),
            };
            match next {
                Next::Reply(reply) => return Some((reply, self)),
                Next::Event(Ok(Some(event))) if event.event == "message" => {
                    match serde_json::from_str::<ServerJsonRpcMessage>(&event.data) {
                        Ok(message) => return Some((message, self)),
                        Err(e) => tracing::warn!(error = %e, "malformed sse message"),
                    }
                }
                Next::Event(Ok(Some(event))) => {
                    tracing::debug!(event = %event.event, "ignoring sse event");
                }
                Next::Event(Ok(None)) => {
                    tracing::debug!("sse stream ended");
                    return None;
                }
                Next::Event(Err(e)) => {
                    tracing::warn!(error = %e, "sse stream failed");
                    return None;
                }
            }
        }
    }
}

fn resolve_endpoint(base: &Url, announced: &str) -> Result<Url> {
    base.join(announced)
        .map_err(|e| Error::InvalidResponse(format!("bad endpoint {announced:?}: {e}")))
}

/// The error response for a request whose POST failed. Notifications and
/// replies to server requests get none.
fn undelivered_reply(message: &ClientJsonRpcMessage, error: &Error) -> Option<ServerJsonRpcMessage> {
    let message = serde_json::to_value(message).ok()?;
    message.get("method")?;
    let id = message.get("id")?.clone();
    let reply = json!({
        "jsonrpc": "2.0",
        "id": id,
        "error": {
            "code": UNDELIVERED,
            "message": format!("request not delivered: {error}"),
        },
    });
    serde_json::from_value(reply).ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn relative_endpoint_resolves_against_stream_url() {
        let base = Url::parse("http://localhost:8000/sse").unwrap();
        let endpoint = resolve_endpoint(&base, "/messages/?sessionId=42").unwrap();
        assert_eq!(endpoint.as_str(), "http://localhost:8000/messages/?sessionId=42");
    }

    #[test]
    fn absolute_endpoint_is_kept() {
        let base = Url::parse("http://localhost:8000/sse").unwrap();
        let endpoint = resolve_endpoint(&base, "http://other:9000/rpc").unwrap();
        assert_eq!(endpoint.host_str(), Some("other"));
    }

    #[test]
    fn failed_request_gets_error_reply_with_its_id() {
        let request: ClientJsonRpcMessage = serde_json::from_value(json!({
            "jsonrpc": "2.0",
            "id": 3,
            "method": "tools/list",
            "params": {}
        }))
        .unwrap();
        let error = Error::HttpStatus {
            status: 500,
            body: "boom".into(),
        };

        let reply = undelivered_reply(&request, &error).unwrap();
        let reply = serde_json::to_value(&reply).unwrap();
        assert_eq!(reply["id"], 3);
        assert_eq!(reply["error"]["code"], UNDELIVERED);
        assert!(reply["error"]["message"].as_str().unwrap().contains("500"));
    }

    #[test]
    fn failed_notification_gets_no_reply() {
        let notification: ClientJsonRpcMessage = serde_json::from_value(json!({
            "jsonrpc": "2.0",
            "method": "notifications/initialized"
        }))
        .unwrap();
        assert!(undelivered_reply(&notification, &Error::Closed).is_none());
    }

    #[tokio::test]
    async fn connect_to_unreachable_host_fails() {
        let result = SseTransport::connect("http://127.0.0.1:9/sse").await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn invalid_url_is_config_error() {
        let result = SseTransport::connect("not a url").await;
        assert!(matches!(result, Err(Error::Config(_))));
    }
}
