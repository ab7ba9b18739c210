//! # Reliable datagram transport
//! A minimal connection-oriented transport over a link that carries small
//! fixed-size frames between a handful of hosts. The link may drop or
//! reorder frames but never corrupts or duplicates them. The transport
//! provides byte-stream connections with guaranteed, ordered delivery on
//! top of it.
//!
//! ## Segments
//! Every frame carries one segment. Control is expressed through four flags:
//! SYN opens a connection, ACK acknowledges, STP asks the peer to stop
//! sending new data (half-close) and FIN finishes the connection. ACK
//! combines with SYN and FIN to answer them.
//!
//! ## Reliable communication
//! Each direction of a connection numbers its DATA, SYN, STP and FIN
//! segments from 0. They are retransmitted on every timer tick until a
//! reply carrying the same sequence number arrives. The receiver processes
//! segments strictly in order: already processed segments are answered
//! again, segments from the future are dropped and recovered by
//! retransmission.
//!
//! ## Flow control
//! At most `SEND_WINDOW` segments of a connection are in flight at once. A
//! receiver buffers at most `RECV_WINDOW` unread segments and refuses to
//! acknowledge more.
//!
//! ## Closing
//! A connection with queued data is closed in two steps. STP tells the peer
//! that no new data follows, FIN is sent once everything was acknowledged.
//! A connection whose FIN is never answered is reaped by the timer.
//!
//! ## Tasks
//! A `Transport` runs four tasks: a link reader, a dispatcher applying
//! frames and timer ticks to the connection state machines, a sender
//! flushing the send engine onto the link and the retransmission timer.
#![deny(missing_docs)]
mod directory;
mod dispatcher;
pub mod error;
pub mod packet;
mod sender;
pub mod state;
mod timer;
mod transport;

pub use crate::directory::{ConnectionDirectory, Entry};
pub use crate::error::{Error, MalformedSegment, Result};
pub use crate::packet::{Flags, Segment, SegmentKind, SequenceNumber, MAX_PAYLOAD};
pub use crate::sender::SendEngine;
pub use crate::state::{transition, ConnectionState, Context, Effect, Event, Transition};
pub use crate::transport::{Transport, TransportBuilder, RECV_WINDOW, SEND_WINDOW};
pub use addr::{ConnectionKey, Endpoint, HostId, Port, PORT_LIMIT};
