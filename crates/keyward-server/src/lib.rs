//! Keyward Server - identity command service
//!
//! Answers line-delimited JSON commands over TCP: registration, login,
//! email verification, token refresh, account archiving, password change
//! and password recovery.

pub mod audit;
pub mod auth;
pub mod client;
pub mod clock;
pub mod dispatch;
pub mod error;
pub mod notify;
pub mod recovery;
pub mod roles;
pub mod state;
pub mod transport;

pub use client::{ClientError, CommandClient};
pub use clock::{Clock, SystemClock};
pub use dispatch::{Backend, Dispatcher, COMMANDS};
pub use notify::{GatewayError, NotificationGateway, OutboundEvent, TcpGateway};
pub use recovery::PasswordRecoveryService;
pub use roles::RoleService;
pub use transport::serve;

#[cfg(any(test, feature = "test-utils"))]
pub use clock::ManualClock;
#[cfg(any(test, feature = "test-utils"))]
pub use notify::RecordingGateway;
