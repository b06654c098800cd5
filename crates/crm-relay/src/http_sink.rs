//! CRM API sink: one HTTP POST per event.

use crate::error::RelayResult;
use async_trait::async_trait;
use batch_delivery_engine::{DeliveryError, DeliveryResult, Sink};
use reqwest::Client;
use serde_json::Value;
use std::time::Duration;
use tracing::debug;

/// Longest response body carried into a rejection error.
const MAX_ERROR_BODY: usize = 512;

/// Posts each CRM event as JSON to the CRM API.
pub struct CrmApiSink {
    client: Client,
    url: String,
    token: Option<String>,
}

impl CrmApiSink {
    /// Create a sink for `url`, authenticating with `token` when set.
    pub fn new(url: impl Into<String>, token: Option<String>, timeout: Duration) -> RelayResult<Self> {
        let client = Client::builder().timeout(timeout).build()?;

        Ok(Self {
            client,
            url: url.into(),
            token,
        })
    }

    pub fn url(&self) -> &str {
        &self.url
    }
}

#[async_trait]
impl Sink<Value> for CrmApiSink {
    async fn send(&self, payload: &Value) -> DeliveryResult<()> {
        let mut request = self.client.post(&self.url).json(payload);
        if let Some(token) = &self.token {
            request = request.bearer_auth(token);
        }

        let response = request
            .send()
            .await
            .map_err(|e| DeliveryError::Sink(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let mut body = response.text().await.unwrap_or_default();
            if body.len() > MAX_ERROR_BODY {
                let mut end = MAX_ERROR_BODY;
                while !body.is_char_boundary(end) {
                    end -= 1;
                }
                body.truncate(end);
            }
            return Err(DeliveryError::Rejected {
                status: status.as_u16(),
                message: body,
            });
        }

        debug!(url = %self.url, status = status.as_u16(), "CRM API accepted event");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::Arc;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;
    use tokio::sync::Mutex;

    /// A request as seen by the mock CRM server.
    #[derive(Debug, Clone)]
    struct CapturedRequest {
        head: String,
        body: String,
    }

    /// Minimal HTTP/1.1 server answering every request with `status` and
    /// `body`.
    async fn mock_crm(status: &'static str, body: &'static str) -> (String, Arc<Mutex<Vec<CapturedRequest>>>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let captured = Arc::new(Mutex::new(Vec::new()));
        let sink = captured.clone();

        tokio::spawn(async move {
            loop {
                let (mut socket, _) = match listener.accept().await {
                    Ok(conn) => conn,
                    Err(_) => return,
                };
                let mut buf = Vec::new();
                let mut chunk = [0u8; 4096];
                let head_end = loop {
                    let n = socket.read(&mut chunk).await.unwrap();
                    if n == 0 {
                        break None;
                    }
                    buf.extend_from_slice(&chunk[..n]);
                    if let Some(pos) = buf.windows(4).position(|w| w == b"\r\n\r\n") {
                        break Some(pos + 4);
                    }
                };
                let Some(head_end) = head_end else { continue };

                let head = String::from_utf8_lossy(&buf[..head_end]).to_string();
                let content_length = head
                    .lines()
                    .find_map(|line| {
                        let (name, value) = line.split_once(':')?;
                        name.eq_ignore_ascii_case("content-length")
                            .then(|| value.trim().parse::<usize>().ok())
                            .flatten()
                    })
                    .unwrap_or(0);
                while buf.len() < head_end + content_length {
                    let n = socket.read(&mut chunk).await.unwrap();
                    if n == 0 {
                        break;
                    }
                    buf.extend_from_slice(&chunk[..n]);
                }
                let body_text = String::from_utf8_lossy(&buf[head_end..]).to_string();
                sink.lock().await.push(CapturedRequest {
                    head,
                    body: body_text,
                });

                let response = format!(
                    "HTTP/1.1 {}\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
                    status,
                    body.len(),
                    body
                );
                socket.write_all(response.as_bytes()).await.unwrap();
                socket.shutdown().await.ok();
            }
        });

        (format!("http://{}/crm/events", addr), captured)
    }

    #[tokio::test]
    async fn test_success_posts_json_with_bearer_token() {
        let (url, captured) = mock_crm("201 Created", "").await;
        let sink = CrmApiSink::new(url, Some("secret".to_string()), Duration::from_secs(5)).unwrap();

        sink.send(&json!({"email": "a@example.com"})).await.unwrap();

        let requests = captured.lock().await.clone();
        assert_eq!(requests.len(), 1);
        let head = requests[0].head.to_ascii_lowercase();
        assert!(head.starts_with("post /crm/events"));
        assert!(head.contains("authorization: bearer secret"));
        assert!(head.contains("content-type: application/json"));
        let body: Value = serde_json::from_str(&requests[0].body).unwrap();
        assert_eq!(body, json!({"email": "a@example.com"}));
    }

    #[tokio::test]
    async fn test_no_token_sends_no_authorization() {
        let (url, captured) = mock_crm("200 OK", "{}").await;
        let sink = CrmApiSink::new(url, None, Duration::from_secs(5)).unwrap();

        sink.send(&json!({"id": 1})).await.unwrap();

        let requests = captured.lock().await.clone();
        assert!(!requests[0].head.to_ascii_lowercase().contains("authorization"));
    }

    #[tokio::test]
    async fn test_non_success_status_is_rejected() {
        let (url, _captured) = mock_crm("422 Unprocessable Entity", "missing email").await;
        let sink = CrmApiSink::new(url, None, Duration::from_secs(5)).unwrap();

        let err = sink.send(&json!({})).await.unwrap_err();

        match err {
            DeliveryError::Rejected { status, message } => {
                assert_eq!(status, 422);
                assert_eq!(message, "missing email");
            }
            other => panic!("expected rejection, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_unreachable_endpoint_is_sink_error() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let sink = CrmApiSink::new(
            format!("http://{}/crm/events", addr),
            None,
            Duration::from_secs(5),
        )
        .unwrap();

        let err = sink.send(&json!({})).await.unwrap_err();
        assert!(matches!(err, DeliveryError::Sink(_)));
    }
}
