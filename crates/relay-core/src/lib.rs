//! # relay-core
//!
//! Hub, client sessions, and rate limiting for the Relay messaging gateway.
//!
//! This crate provides the fundamental building blocks:
//!
//! - **Hub** - Single-owner registry of connected clients and broadcast fan-out
//! - **Session** - Per-connection reader/writer pumps with keepalive
//! - **Client** - Handle and bounded outbound queue of a connected client
//! - **RateLimiter** - Sliding-window admission control with periodic cleanup
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────┐  register / broadcast  ┌─────────────┐
//! │  Session    │───────────────────────▶│     Hub     │
//! │  (reader)   │                        └─────────────┘
//! └─────────────┘                               │ try_send
//!        │ pong                                 ▼
//!        │                               ┌─────────────┐     ┌─────────────┐
//!        └──────────────────────────────▶│  Outbound   │────▶│  Session    │
//!                                        │   queue     │     │  (writer)   │
//!                                        └─────────────┘     └─────────────┘
//! ```

pub mod client;
pub mod hub;
pub mod ratelimit;
pub mod session;

pub use client::{ClientHandle, ClientId, EnqueueError, OutboundQueue, Replier};
pub use hub::{Hub, HubConfig, HubError, HubHandle, HubStats};
pub use ratelimit::{CleanupHandle, Decision, RateLimitConfig, RateLimitExceeded, RateLimiter};
pub use session::{Session, SessionConfig, SessionError, SessionState};
