//! weftline — HTTP/2 session engine.
//!
//! This crate is the endpoint-side state machine that multiplexes many
//! concurrent request/response streams onto a single bidirectional byte
//! transport: stream lifecycle and id allocation, session- and
//! stream-level flow control, protocol rule enforcement per frame type,
//! and the four-state close protocol (GO_AWAY, transport FIN, idle
//! timeout, fatal error).
//!
//! # Architecture
//!
//! ```text
//!    transport bytes                     application threads
//!         |                                      |
//!    +----v-----+    FrameListener    +----------v----------+
//!    |  Parser  |-------------------->|       Session       |
//!    +----------+                     |  streams / windows  |
//!                                     |  close machine      |
//!    +----------+      entries        | creator | flusher   |
//!    | Endpoint |<--------------------+---------------------+
//!    +----------+
//! ```
//!
//! Ingress is driven by the transport's read loop feeding [`Parser::feed`];
//! the session implements [`FrameListener`]. Egress operations
//! ([`Session::new_stream`], [`Session::data`], [`Session::close`], ...)
//! enqueue and return; completion is reported through [`Callback`] /
//! [`Promise`] tokens once frames reach the transport. HEADERS of
//! concurrently opened streams go on the wire in strictly increasing
//! stream-id order.
//!
//! # Example
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use weftline::{Callback, Promise, Session, SessionRole};
//! use weftline::frame::HeadersFrame;
//!
//! let session = Session::builder(SessionRole::Client, endpoint).build()?;
//!
//! // Open a stream; the promise completes once HEADERS are on the wire.
//! let frame = HeadersFrame::new(0, encoded_request_headers, false);
//! session.new_stream(frame, Promise::new(|stream| { /* ... */ }), Some(listener));
//!
//! // Feed transport bytes.
//! let mut parser = weftline::Parser::new(16_384);
//! parser.feed(&received, &session);
//! ```

pub mod api;
pub mod callback;
pub mod config;
mod creator;
pub mod endpoint;
mod entry;
pub mod error;
pub mod flow_control;
mod flusher;
pub mod frame;
pub mod generator;
pub mod metrics;
pub mod parser;
pub mod role;
pub mod session;
pub mod settings;
pub mod stream;

/// Session-level event observer.
pub use api::SessionListener;
/// Stream-level event observer.
pub use api::StreamListener;
/// One-shot completion token.
pub use callback::Callback;
/// One-shot completion token carrying a value.
pub use callback::Promise;
/// Session tuning knobs.
pub use config::SessionConfig;
/// Transport seam.
pub use endpoint::Endpoint;
/// RFC 7540 error codes.
pub use error::ErrorCode;
/// Engine error type.
pub use error::SessionError;
/// Flow control strategy seam.
pub use flow_control::FlowControlStrategy;
/// Default per-frame WINDOW_UPDATE strategy.
pub use flow_control::SimpleFlowControl;
/// Outbound frame generation.
pub use generator::Generator;
/// Ingress listener interface implemented by the session.
pub use parser::FrameListener;
/// Incremental inbound frame parser.
pub use parser::Parser;
/// Client/server role selector.
pub use role::SessionRole;
/// The HTTP/2 session.
pub use session::Session;
/// Session close-state register values.
pub use session::SessionState;
/// A single HTTP/2 stream.
pub use stream::Stream;
