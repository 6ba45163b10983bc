//! Session engine metrics.
//!
//! Counters cover frame traffic, stream churn, and failure classes.
//! Exposed via metriken's registry for Prometheus exposition.

use metriken::{Counter, metric};

#[metric(
    name = "weftline/frames/received",
    description = "Total frames received"
)]
pub static FRAMES_RECEIVED: Counter = Counter::new();

#[metric(name = "weftline/frames/sent", description = "Total frames sent")]
pub static FRAMES_SENT: Counter = Counter::new();

#[metric(
    name = "weftline/streams/local_opened",
    description = "Locally-initiated streams created"
)]
pub static LOCAL_STREAMS_OPENED: Counter = Counter::new();

#[metric(
    name = "weftline/streams/remote_opened",
    description = "Remotely-initiated streams created"
)]
pub static REMOTE_STREAMS_OPENED: Counter = Counter::new();

#[metric(name = "weftline/streams/closed", description = "Streams removed")]
pub static STREAMS_CLOSED: Counter = Counter::new();

#[metric(
    name = "weftline/streams/refused",
    description = "Remote streams refused over the concurrency limit"
)]
pub static STREAMS_REFUSED: Counter = Counter::new();

#[metric(name = "weftline/resets/sent", description = "RST_STREAM frames sent")]
pub static RESETS_SENT: Counter = Counter::new();

#[metric(name = "weftline/goaways/sent", description = "GO_AWAY frames sent")]
pub static GOAWAYS_SENT: Counter = Counter::new();

#[metric(
    name = "weftline/failures/connection",
    description = "Connection-level protocol failures"
)]
pub static CONNECTION_FAILURES: Counter = Counter::new();

#[metric(
    name = "weftline/flow/stalls",
    description = "DATA generations deferred on an exhausted window"
)]
pub static FLOW_STALLS: Counter = Counter::new();
