//! Framework metrics, registered with metriken for exposition by the
//! embedding application.

use metriken::{Counter, Gauge, metric};

#[metric(
    name = "connections_accepted",
    description = "Total connections accepted by the listening socket"
)]
pub static CONNECTIONS_ACCEPTED: Counter = Counter::new();

#[metric(
    name = "connections_active",
    description = "Connections currently established"
)]
pub static CONNECTIONS_ACTIVE: Gauge = Gauge::new();

#[metric(
    name = "bytes_received",
    description = "Bytes read off connection sockets"
)]
pub static BYTES_RECEIVED: Counter = Counter::new();

#[metric(
    name = "bytes_sent",
    description = "Bytes written to connection sockets"
)]
pub static BYTES_SENT: Counter = Counter::new();

#[metric(
    name = "loop_wakeups",
    description = "Cross-thread wakeups delivered to event loops"
)]
pub static LOOP_WAKEUPS: Counter = Counter::new();

#[metric(
    name = "loop_tasks",
    description = "Deferred tasks drained by event loops"
)]
pub static LOOP_TASKS: Counter = Counter::new();
