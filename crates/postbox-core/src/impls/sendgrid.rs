//! SendGrid v3 `mail/send` client.
//!
//! Only builds the request and reports the status code. Whether a status is
//! worth retrying is decided by the dispatcher.

use std::fmt;
use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;
use tracing::debug;

use crate::domain::Address;
use crate::ports::{DeliveryContext, DeliveryTransport, OutboundMessage, TransportError};

pub const DEFAULT_ENDPOINT: &str = "https://api.sendgrid.com/v3/mail/send";

#[derive(Clone)]
pub struct SendGridConfig {
    pub api_key: String,
    pub endpoint: String,
    /// Upper bound for a single request; the lease deadline may shorten it.
    pub timeout: Duration,
}

impl SendGridConfig {
    pub fn new(api_key: impl Into<String>) -> Self {
        Self {
            api_key: api_key.into(),
            endpoint: DEFAULT_ENDPOINT.to_string(),
            timeout: Duration::from_secs(10),
        }
    }
}

// Keeps the credential out of logs.
impl fmt::Debug for SendGridConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SendGridConfig")
            .field("api_key", &"<redacted>")
            .field("endpoint", &self.endpoint)
            .field("timeout", &self.timeout)
            .finish()
    }
}

#[derive(Debug, Serialize, PartialEq)]
struct MailAddress<'a> {
    email: &'a str,
    #[serde(skip_serializing_if = "str::is_empty")]
    name: &'a str,
}

impl<'a> From<&'a Address> for MailAddress<'a> {
    fn from(address: &'a Address) -> Self {
        Self {
            email: &address.email,
            name: &address.name,
        }
    }
}

#[derive(Debug, Serialize, PartialEq)]
struct Personalization<'a> {
    to: Vec<MailAddress<'a>>,
}

#[derive(Debug, Serialize, PartialEq)]
struct Content<'a> {
    #[serde(rename = "type")]
    content_type: &'static str,
    value: &'a str,
}

#[derive(Debug, Serialize, PartialEq)]
struct MailSendRequest<'a> {
    personalizations: Vec<Personalization<'a>>,
    from: MailAddress<'a>,
    subject: &'a str,
    content: Vec<Content<'a>>,
}

impl<'a> MailSendRequest<'a> {
    fn from_message(message: &'a OutboundMessage) -> Self {
        // The API wants text/plain before text/html and rejects empty values.
        let mut content = Vec::with_capacity(2);
        if !message.text.is_empty() {
            content.push(Content {
                content_type: "text/plain",
                value: &message.text,
            });
        }
        if !message.html.is_empty() {
            content.push(Content {
                content_type: "text/html",
                value: &message.html,
            });
        }

        Self {
            personalizations: vec![Personalization {
                to: vec![MailAddress::from(&message.to)],
            }],
            from: MailAddress::from(&message.from),
            subject: &message.subject,
            content,
        }
    }
}

pub struct SendGridTransport {
    client: reqwest::Client,
    config: SendGridConfig,
}

impl SendGridTransport {
    pub fn new(config: SendGridConfig) -> Result<Self, TransportError> {
        if config.api_key.trim().is_empty() {
            return Err(TransportError::Rejected("missing SendGrid API key".to_string()));
        }
        let client = reqwest::Client::builder()
            .timeout(config.timeout)
            .user_agent(concat!("postbox/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| TransportError::Rejected(format!("client setup: {e}")))?;
        Ok(Self { client, config })
    }
}

#[async_trait]
impl DeliveryTransport for SendGridTransport {
    async fn send(
        &self,
        message: &OutboundMessage,
        ctx: &DeliveryContext,
    ) -> Result<u16, TransportError> {
        let timeout = ctx.remaining().min(self.config.timeout);
        if timeout.is_zero() {
            return Err(TransportError::Timeout(timeout));
        }

        let body = MailSendRequest::from_message(message);
        let response = self
            .client
            .post(&self.config.endpoint)
            .bearer_auth(&self.config.api_key)
            .json(&body)
            .timeout(timeout)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    TransportError::Timeout(timeout)
                } else if e.is_builder() {
                    TransportError::Rejected(e.to_string())
                } else {
                    TransportError::Network(e.to_string())
                }
            })?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            debug!(
                message_id = %ctx.message_id,
                status = status.as_u16(),
                body = %body,
                "provider returned non-success status"
            );
        }
        Ok(status.as_u16())
    }
}

#[cfg(test)]
mod tests {
    use tokio::time::Instant;
    use ulid::Ulid;
    use wiremock::{Mock, MockServer, ResponseTemplate, matchers};

    use super::*;
    use crate::domain::MessageId;

    fn message() -> OutboundMessage {
        OutboundMessage {
            from: Address::new("A", "a@x.com"),
            to: Address::new("", "b@x.com"),
            subject: "Hi".to_string(),
            text: "hello".to_string(),
            html: "<p>hello</p>".to_string(),
        }
    }

    #[test]
    fn request_body_matches_api_shape() {
        let msg = message();
        let body = serde_json::to_value(MailSendRequest::from_message(&msg)).unwrap();
        assert_eq!(
            body,
            serde_json::json!({
                "personalizations": [{"to": [{"email": "b@x.com"}]}],
                "from": {"email": "a@x.com", "name": "A"},
                "subject": "Hi",
                "content": [
                    {"type": "text/plain", "value": "hello"},
                    {"type": "text/html", "value": "<p>hello</p>"}
                ]
            })
        );
    }

    #[test]
    fn empty_bodies_are_left_out() {
        let mut msg = message();
        msg.text = String::new();
        let body = MailSendRequest::from_message(&msg);
        assert_eq!(body.content.len(), 1);
        assert_eq!(body.content[0].content_type, "text/html");
    }

    #[test]
    fn missing_api_key_is_rejected() {
        let err = SendGridTransport::new(SendGridConfig::new("  ")).err();
        assert!(matches!(err, Some(TransportError::Rejected(_))));
    }

    #[test]
    fn debug_redacts_api_key() {
        let config = SendGridConfig::new("SG.secret");
        let rendered = format!("{config:?}");
        assert!(!rendered.contains("SG.secret"));
        assert!(rendered.contains("<redacted>"));
    }

    fn transport(endpoint: String, timeout: Duration) -> SendGridTransport {
        SendGridTransport::new(SendGridConfig {
            endpoint,
            timeout,
            ..SendGridConfig::new("SG.test")
        })
        .unwrap()
    }

    fn ctx(budget: Duration) -> DeliveryContext {
        DeliveryContext::detached(MessageId::from_ulid(Ulid::new()), 1, Instant::now() + budget)
    }

    async fn provider(status: u16) -> MockServer {
        let server = MockServer::start().await;
        Mock::given(matchers::method("POST"))
            .and(matchers::path("/v3/mail/send"))
            .respond_with(ResponseTemplate::new(status).set_body_string("{}"))
            .mount(&server)
            .await;
        server
    }

    fn endpoint(server: &MockServer) -> String {
        format!("{}/v3/mail/send", server.uri())
    }

    #[tokio::test]
    async fn accepted_request_returns_202() {
        let server = MockServer::start().await;
        Mock::given(matchers::method("POST"))
            .and(matchers::path("/v3/mail/send"))
            .and(matchers::header("authorization", "Bearer SG.test"))
            .and(matchers::header("content-type", "application/json"))
            .and(matchers::body_partial_json(serde_json::json!({
                "personalizations": [{"to": [{"email": "b@x.com"}]}],
                "from": {"email": "a@x.com"},
                "subject": "Hi"
            })))
            .respond_with(ResponseTemplate::new(202))
            .expect(1)
            .mount(&server)
            .await;

        let sender = transport(endpoint(&server), Duration::from_secs(5));
        let status = sender.send(&message(), &ctx(Duration::from_secs(5))).await;
        assert_eq!(status, Ok(202));
    }

    #[tokio::test]
    async fn error_statuses_are_passed_through() {
        for code in [503, 400] {
            let server = provider(code).await;
            let sender = transport(endpoint(&server), Duration::from_secs(5));
            let status = sender.send(&message(), &ctx(Duration::from_secs(5))).await;
            assert_eq!(status, Ok(code));
        }
    }

    #[tokio::test]
    async fn slow_provider_times_out() {
        let server = MockServer::start().await;
        Mock::given(matchers::method("POST"))
            .respond_with(ResponseTemplate::new(202).set_delay(Duration::from_millis(500)))
            .mount(&server)
            .await;

        let sender = transport(endpoint(&server), Duration::from_millis(100));
        let err = sender
            .send(&message(), &ctx(Duration::from_secs(5)))
            .await
            .unwrap_err();
        assert_eq!(err, TransportError::Timeout(Duration::from_millis(100)));
        assert!(err.is_retryable());
    }

    #[tokio::test]
    async fn lease_deadline_caps_the_request_timeout() {
        let server = MockServer::start().await;
        Mock::given(matchers::method("POST"))
            .respond_with(ResponseTemplate::new(202).set_delay(Duration::from_secs(2)))
            .mount(&server)
            .await;

        let sender = transport(endpoint(&server), Duration::from_secs(10));
        let started = std::time::Instant::now();
        let err = sender
            .send(&message(), &ctx(Duration::from_millis(200)))
            .await
            .unwrap_err();
        assert!(matches!(err, TransportError::Timeout(_)));
        assert!(started.elapsed() < Duration::from_secs(2));
    }

    #[tokio::test]
    async fn refused_connection_is_a_network_error() {
        // Grab a free port and release it so nothing is listening there.
        let port = std::net::TcpListener::bind("127.0.0.1:0")
            .unwrap()
            .local_addr()
            .unwrap()
            .port();

        let sender = transport(
            format!("http://127.0.0.1:{port}/v3/mail/send"),
            Duration::from_secs(5),
        );
        let err = sender
            .send(&message(), &ctx(Duration::from_secs(5)))
            .await
            .unwrap_err();
        assert!(matches!(err, TransportError::Network(_)), "{err:?}");
        assert!(err.is_retryable());
    }

    #[tokio::test]
    async fn passed_deadline_skips_the_request() {
        let server = MockServer::start().await;
        Mock::given(matchers::method("POST"))
            .respond_with(ResponseTemplate::new(202))
            .expect(0)
            .mount(&server)
            .await;

        let sender = transport(endpoint(&server), Duration::from_secs(5));
        let err = sender
            .send(&message(), &ctx(Duration::ZERO))
            .await
            .unwrap_err();
        assert_eq!(err, TransportError::Timeout(Duration::ZERO));
    }
}
