//! Outbound notifications to the mailer and profile services
//!
//! `emit` is at-most-once with no acknowledgment. `TcpGateway` hands each
//! event to its own task and returns at once; failures are logged and
//! dropped there, so a slow or absent mailer never holds up the caller.
//! `request` is the only call that waits, and only it can fail the caller.

use std::time::Duration;

use async_trait::async_trait;
use keyward_core::{ErrorKind, Reply, ServicesConfig};
use serde_json::{json, Value};
use thiserror::Error;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::client::{ClientError, CommandClient};

pub const TOPIC_PROFILE_NEW: &str = "profile:new";
pub const TOPIC_PROFILE_GET_ID: &str = "profile:get:id";
pub const TOPIC_MAIL_SEND: &str = "mail:send";
pub const TOPIC_MAIL_FORGOT_PASSWORD: &str = "mail:forgotpassword";

/// Fire-and-forget event
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OutboundEvent {
    /// A new account exists; the profile service creates its profile
    ProfileCreated { email: String, owner: Uuid },
    /// Registration verification link
    VerificationMail { email: String, token: String },
    /// Password reset link
    ForgotPasswordMail { email: String, token: String },
}

impl OutboundEvent {
    pub fn topic(&self) -> &'static str {
        match self {
            OutboundEvent::ProfileCreated { .. } => TOPIC_PROFILE_NEW,
            OutboundEvent::VerificationMail { .. } => TOPIC_MAIL_SEND,
            OutboundEvent::ForgotPasswordMail { .. } => TOPIC_MAIL_FORGOT_PASSWORD,
        }
    }

    pub fn payload(&self) -> Value {
        match self {
            OutboundEvent::ProfileCreated { email, owner } => {
                json!({ "email": email, "owner": owner })
            }
            OutboundEvent::VerificationMail { email, token }
            | OutboundEvent::ForgotPasswordMail { email, token } => {
                json!({ "email": email, "token": token })
            }
        }
    }
}

#[derive(Debug, Error)]
pub enum GatewayError {
    #[error("{service} unavailable: {reason}")]
    Unavailable { service: String, reason: String },

    #[error("{service} rejected {topic}: {kind} {message}")]
    Rejected {
        service: String,
        topic: String,
        kind: ErrorKind,
        message: String,
    },

    #[error("No downstream service handles topic {0}")]
    UnknownTopic(String),
}

#[async_trait]
pub trait NotificationGateway: Send + Sync {
    /// Send an event; never fails the caller
    async fn emit(&self, event: OutboundEvent);

    /// Request/reply call bounded by `timeout`
    async fn request(
        &self,
        topic: &str,
        payload: Value,
        timeout: Duration,
    ) -> Result<Value, GatewayError>;
}

/// Gateway speaking the command protocol over TCP.
///
/// `mail:*` topics go to the mailer, `profile:*` topics to the profile service.
pub struct TcpGateway {
    mailer_addr: String,
    profile_addr: String,
    default_timeout: Duration,
}

impl TcpGateway {
    pub fn new(config: &ServicesConfig) -> Self {
        Self {
            mailer_addr: config.mailer_addr.clone(),
            profile_addr: config.profile_addr.clone(),
            default_timeout: config.request_timeout(),
        }
    }

    fn route(&self, topic: &str) -> Result<(&'static str, &str), GatewayError> {
        if topic.starts_with("mail:") {
            Ok(("mailer", self.mailer_addr.as_str()))
        } else if topic.starts_with("profile:") {
            Ok(("profile", self.profile_addr.as_str()))
        } else {
            Err(GatewayError::UnknownTopic(topic.to_string()))
        }
    }
}

#[async_trait]
impl NotificationGateway for TcpGateway {
    async fn emit(&self, event: OutboundEvent) {
        let topic = event.topic();
        let (service, addr) = match self.route(topic) {
            Ok(route) => route,
            Err(e) => {
                warn!(topic, error = %e, "Dropping outbound event");
                return;
            }
        };

        let client = CommandClient::new(addr, self.default_timeout);
        let payload = event.payload();
        tokio::spawn(async move {
            match client.send_event(topic, payload).await {
                Ok(()) => debug!(topic, service, "Event emitted"),
                Err(e) => warn!(topic, service, error = %e, "Event emission failed, dropping"),
            }
        });
    }

    async fn request(
        &self,
        topic: &str,
        payload: Value,
        timeout: Duration,
    ) -> Result<Value, GatewayError> {
        let (service, addr) = self.route(topic)?;
        let client = CommandClient::new(addr, timeout);

        let reply = client.call(topic, payload).await.map_err(|e| {
            let reason = match e {
                ClientError::Timeout(after) => format!("no reply within {after:?}"),
                other => other.to_string(),
            };
            GatewayError::Unavailable {
                service: service.to_string(),
                reason,
            }
        })?;

        match reply {
            Reply::Ok { data, .. } => Ok(data.unwrap_or(Value::Null)),
            Reply::Error { kind, message } => Err(GatewayError::Rejected {
                service: service.to_string(),
                topic: topic.to_string(),
                kind,
                message,
            }),
        }
    }
}

#[cfg(any(test, feature = "test-utils"))]
pub use recording::RecordingGateway;

#[cfg(any(test, feature = "test-utils"))]
mod recording {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Mutex;

    /// In-process gateway that records traffic.
    ///
    /// `profile:get:id` is answered with `{"id": "profile-<owner>"}` unless
    /// requests are switched to fail.
    #[derive(Default)]
    pub struct RecordingGateway {
        events: Mutex<Vec<OutboundEvent>>,
        requests: Mutex<Vec<(String, Value)>>,
        drop_events: AtomicBool,
        fail_requests: AtomicBool,
    }

    impl RecordingGateway {
        pub fn new() -> Self {
            Self::default()
        }

        /// Simulate an unreachable mailer/profile service for events
        pub fn drop_events(&self, drop: bool) {
            self.drop_events.store(drop, Ordering::SeqCst);
        }

        /// Simulate an unreachable profile service for request/reply
        pub fn fail_requests(&self, fail: bool) {
            self.fail_requests.store(fail, Ordering::SeqCst);
        }

        pub fn events(&self) -> Vec<OutboundEvent> {
            self.events.lock().map(|e| e.clone()).unwrap_or_default()
        }

        pub fn requests(&self) -> Vec<(String, Value)> {
            self.requests.lock().map(|r| r.clone()).unwrap_or_default()
        }

        /// Last token mailed to `email` on `topic`
        pub fn last_token(&self, topic: &str, email: &str) -> Option<String> {
            self.events().into_iter().rev().find_map(|event| {
                if event.topic() != topic {
                    return None;
                }
                match event {
                    OutboundEvent::VerificationMail { email: to, token }
                    | OutboundEvent::ForgotPasswordMail { email: to, token }
                        if to == email =>
                    {
                        Some(token)
                    }
                    _ => None,
                }
            })
        }
    }

    #[async_trait]
    impl NotificationGateway for RecordingGateway {
        async fn emit(&self, event: OutboundEvent) {
            if self.drop_events.load(Ordering::SeqCst) {
                warn!(topic = event.topic(), "Event emission failed, dropping");
                return;
            }
            if let Ok(mut events) = self.events.lock() {
                events.push(event);
            }
        }

        async fn request(
            &self,
            topic: &str,
            payload: Value,
            _timeout: Duration,
        ) -> Result<Value, GatewayError> {
            if let Ok(mut requests) = self.requests.lock() {
                requests.push((topic.to_string(), payload.clone()));
            }
            if self.fail_requests.load(Ordering::SeqCst) {
                return Err(GatewayError::Unavailable {
                    service: "profile".to_string(),
                    reason: "simulated outage".to_string(),
                });
            }

            match topic {
                TOPIC_PROFILE_GET_ID => {
                    let owner = payload.get("owner").and_then(Value::as_str).unwrap_or("");
                    Ok(json!({ "id": format!("profile-{owner}") }))
                }
                other => Err(GatewayError::UnknownTopic(other.to_string())),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_topics_and_payloads() {
        let owner = Uuid::new_v4();
        let event = OutboundEvent::ProfileCreated {
            email: "a@x.com".to_string(),
            owner,
        };
        assert_eq!(event.topic(), "profile:new");
        assert_eq!(event.payload()["owner"], owner.to_string());

        let event = OutboundEvent::ForgotPasswordMail {
            email: "a@x.com".to_string(),
            token: "t".to_string(),
        };
        assert_eq!(event.topic(), "mail:forgotpassword");
        assert_eq!(event.payload(), json!({"email": "a@x.com", "token": "t"}));
    }

    #[test]
    fn test_routing_by_topic_prefix() {
        let gateway = TcpGateway::new(&ServicesConfig::default());
        assert_eq!(gateway.route("mail:send").unwrap().0, "mailer");
        assert_eq!(gateway.route("profile:get:id").unwrap().0, "profile");
        assert!(matches!(
            gateway.route("billing:charge"),
            Err(GatewayError::UnknownTopic(_))
        ));
    }

    #[tokio::test]
    async fn test_tcp_emit_swallows_unreachable_mailer() {
        let config = ServicesConfig {
            mailer_addr: "127.0.0.1:1".to_string(),
            request_timeout_ms: 200,
            ..Default::default()
        };
        let gateway = TcpGateway::new(&config);

        // returns normally even though nothing listens
        gateway
            .emit(OutboundEvent::VerificationMail {
                email: "a@x.com".to_string(),
                token: "t".to_string(),
            })
            .await;
    }

    /// Address of a listener whose accept queue is full, so new connects hang
    async fn stalled_addr() -> (tokio::net::TcpListener, Vec<tokio::net::TcpStream>, String) {
        let socket = tokio::net::TcpSocket::new_v4().unwrap();
        socket.bind("127.0.0.1:0".parse().unwrap()).unwrap();
        let listener = socket.listen(0).unwrap();
        let addr = listener.local_addr().unwrap().to_string();

        let mut held = Vec::new();
        for _ in 0..3 {
            let connect = tokio::net::TcpStream::connect(&addr);
            if let Ok(Ok(stream)) = tokio::time::timeout(Duration::from_millis(100), connect).await {
                held.push(stream);
            }
        }
        (listener, held, addr)
    }

    #[tokio::test]
    async fn test_tcp_emit_does_not_wait_for_stalled_mailer() {
        let (_listener, _held, addr) = stalled_addr().await;
        let gateway = TcpGateway::new(&ServicesConfig {
            mailer_addr: addr,
            request_timeout_ms: 2000,
            ..Default::default()
        });

        let started = std::time::Instant::now();
        gateway
            .emit(OutboundEvent::VerificationMail {
                email: "a@x.com".to_string(),
                token: "t".to_string(),
            })
            .await;
        assert!(started.elapsed() < Duration::from_millis(500));
    }

    #[tokio::test]
    async fn test_tcp_emit_delivers_event_frame() {
        use keyward_core::RequestFrame;
        use tokio::io::{AsyncBufReadExt, BufReader};

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        let received = tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let mut line = String::new();
            BufReader::new(stream).read_line(&mut line).await.unwrap();
            serde_json::from_str::<RequestFrame>(&line).unwrap()
        });

        let gateway = TcpGateway::new(&ServicesConfig {
            mailer_addr: addr,
            ..Default::default()
        });
        gateway
            .emit(OutboundEvent::ForgotPasswordMail {
                email: "a@x.com".to_string(),
                token: "k1".to_string(),
            })
            .await;

        let frame = tokio::time::timeout(Duration::from_secs(2), received)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(frame.pattern, TOPIC_MAIL_FORGOT_PASSWORD);
        assert!(!frame.expects_reply());
        assert_eq!(frame.data["token"], "k1");
    }

    #[tokio::test]
    async fn test_tcp_request_unavailable() {
        let config = ServicesConfig {
            profile_addr: "127.0.0.1:1".to_string(),
            ..Default::default()
        };
        let gateway = TcpGateway::new(&config);

        let err = gateway
            .request(
                TOPIC_PROFILE_GET_ID,
                json!({"owner": "u1"}),
                Duration::from_millis(200),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, GatewayError::Unavailable { .. }));
    }

    #[tokio::test]
    async fn test_recording_gateway() {
        let gateway = RecordingGateway::new();
        gateway
            .emit(OutboundEvent::VerificationMail {
                email: "a@x.com".to_string(),
                token: "t1".to_string(),
            })
            .await;
        assert_eq!(gateway.last_token(TOPIC_MAIL_SEND, "a@x.com").as_deref(), Some("t1"));

        gateway.drop_events(true);
        gateway
            .emit(OutboundEvent::VerificationMail {
                email: "b@x.com".to_string(),
                token: "t2".to_string(),
            })
            .await;
        assert_eq!(gateway.events().len(), 1);

        let reply = gateway
            .request(TOPIC_PROFILE_GET_ID, json!({"owner": "u1"}), Duration::from_secs(1))
            .await
            .unwrap();
        assert_eq!(reply["id"], "profile-u1");
    }
}
