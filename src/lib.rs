//! A minimal reliable unicast transport over an unreliable datagram
//! network: three-way handshake, sliding-window retransmission,
//! out-of-order reassembly, and three-way graceful termination.
//!
//! Data flows one way per connection, from a [`Connector`] (data
//! source) to an [`Accepter`] (data sink). Both are built from the same
//! segment codec and state-machine primitives, each driving its own
//! engine thread over a pair of bounded queues to the OS socket.

mod accepter;
mod clock;
mod codec;
mod config;
mod connector;
mod err;
mod net;
mod receiver;
mod sender;
mod state;

pub use accepter::Accepter;
pub use codec::{CodecError, Flags, Header, Segment, SeqNum};
pub use config::{
    Config, DEFAULT_TIMEOUT_MS, DEFAULT_WINDOW, HEADER_SIZE, PAYLOAD_SIZE, SEGMENT_SIZE,
    TIMER_TICK_MS,
};
pub use connector::Connector;
pub use err::{Error, Result};
pub use state::ConnState;
