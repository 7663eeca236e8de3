//! Transparent WebSocket relay.
//!
//! Each inbound client connection is upgraded on the relay route, paired
//! with a fresh connection to a single fixed upstream, and frames are copied
//! verbatim in both directions until either side closes or fails.
//!
//! # Architecture
//!
//! ```text
//! Client  <--WS-->  ws-relay  <--WS-->  Upstream
//!                     |
//!              [Origin allowlist]
//!                     |
//!               [Event log sink]
//! ```
//!
//! The relay checks the request path and `Origin` header during the
//! handshake, dials the upstream, and runs two forwarding loops
//! (client-to-upstream and upstream-to-client). The first loop to stop ends
//! the session: the other loop is cancelled and both legs are closed exactly
//! once.

pub mod connection;
pub mod dialer;
pub mod error;
pub mod handshake;
pub mod listener;
pub mod origin;
pub mod relay;

pub use connection::{FrameKind, Leg, LegWriter, Transport};
pub use dialer::{Dialer, DEFAULT_UPSTREAM};
pub use error::RelayError;
pub use handshake::{HandshakePolicy, DEFAULT_ROUTE};
pub use listener::{handle_connection, Relay, RelayConfig, RelayContext};
pub use origin::{is_allowed, OriginAllowlist};
pub use relay::{Direction, DirectionStats, FinishedSession, LoopEnd, RelaySession, SessionReport};
