/*

tele104 implements the server side of IEC 60870-5-104: a controlled
station ("slave") accepting TCP sessions from controlling stations
("masters").

# Framing

Every frame (APDU) starts with a six byte APCI: a 0x68 start byte, a
length byte, and four control bytes. Three formats share the control
field, distinguished by the low bits of the first control byte:

  I frames carry an ASDU plus both sequence counters N(S)/N(R),
  S frames carry only N(R) and acknowledge received I frames,
  U frames carry one of the unnumbered functions (STARTDT, STOPDT,
  TESTFR, each as ACT and CON).

# Flow control

Sequence numbers are 15 bit counters mod 32768. A connection may have at
most k I frames sent and unacknowledged, tracked slot by slot in a FIFO
k-buffer; an incoming N(R) confirms a contiguous prefix of it. In the
receive direction, every w-th received I frame forces an S frame, and
timeout T2 forces one earlier on a quiet link. T1 bounds how long a sent
I frame may stay unacknowledged before the connection is torn down, and
T3 probes an idle link with TESTFR_ACT; three unanswered probes are
fatal.

# Queueing

Outbound ASDUs pass through a two tier queue: a persistent low-priority
ring whose entries survive connection loss (confirmation-aware, so a
successor peer resends whatever a dead peer never acknowledged), and a
transient high-priority ring for command responses that jump the event
backlog but are dropped under pressure.

# Activation and redundancy

Data transfer on a session begins only after the master sends
STARTDT_ACT. Which sessions may be active at once, and which queues a
session binds, is the server mode: one shared group, one group per
connection, or multiple named groups selected by peer address
(`ServerMode`). Within a group, activating one connection deactivates
the others, and the queue handoff gives the newly active peer the
undelivered backlog.

# Driving the server

Threaded: `Slave::start` spawns an acceptor thread and one worker per
connection. Threadless: `Slave::start_threadless` plus `Slave::tick`
runs the identical per-connection logic cooperatively on the caller's
thread.

*/

pub mod apci;
pub mod asdu;
mod clock;
mod queue;
pub mod server;
mod socket;

pub use apci::ApciParameters;
pub use asdu::{AppLayerParameters, Asdu, Cp56Time2a};
pub use server::{
    ConnectionEvent, ConnectionHandle, PluginResult, RedundancyGroup, ServerMode, Slave,
    SlavePlugin,
};

/// Errors surfaced by the public API. Protocol violations on a running
/// connection are not errors to the application; they close the
/// connection and emit a [`ConnectionEvent::Closed`].
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    #[error("server is already running")]
    AlreadyRunning,

    #[error("ASDU of {size} bytes exceeds the {max} byte limit")]
    AsduTooLarge { size: usize, max: usize },

    #[error("malformed ASDU: {0}")]
    MalformedAsdu(&'static str),
}
