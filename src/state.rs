//! Connection state machine.
//!
//! ```text
//!              CONNECT/SYN           SYN-ACK/-
//!   CLOSED ------------------> SYN_SENT ----------> ESTABLISHED
//!     |  SYN/-                                  ACCEPT/SYN-ACK ^
//!     +-------------------------> SYN_RCVD --------------------+
//!
//!   ESTABLISHED --CLOSE/STP--> STP_SENT --ACK (drained)/FIN--+
//!        |   \                                               v
//!        |    +--------------CLOSE/FIN (drained)---------> CLOSING
//!        |  STP/ACK                                          |
//!        +---------> STP_RCVD ----------CLOSE/FIN------------+
//!                                                            |
//!   FIN/FIN-ACK from ESTABLISHED, STP_*, CLOSING ----> CLOSED <+ FIN-ACK
//! ```
//!
//! The transition function is pure. It decides the next state and returns
//! the work to be done as a list of effects, which the caller executes while
//! still holding the directory lock.
use crate::error::{Error, Result};
use crate::packet::SegmentKind;

/// State of a connection.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub enum ConnectionState {
    /// No connection, also the state of unknown keys.
    Closed,
    /// SYN sent, waiting for SYN-ACK.
    SynSent,
    /// SYN received, waiting for accept.
    SynRcvd,
    /// Open in both directions.
    Established,
    /// The peer stopped sending.
    StpRcvd,
    /// Local side stopped sending, waiting for the send queue to drain.
    StpSent,
    /// FIN sent, waiting for FIN-ACK.
    Closing,
}

impl ConnectionState {
    /// All states.
    pub const ALL: [ConnectionState; 7] = [
        ConnectionState::Closed,
        ConnectionState::SynSent,
        ConnectionState::SynRcvd,
        ConnectionState::Established,
        ConnectionState::StpRcvd,
        ConnectionState::StpSent,
        ConnectionState::Closing,
    ];
}

impl Default for ConnectionState {
    fn default() -> Self {
        ConnectionState::Closed
    }
}

/// Input to the state machine.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub enum Event {
    /// Application opens a connection.
    Connect,
    /// Application accepts a pending connection.
    Accept,
    /// Application writes data.
    Send,
    /// Application closes the connection.
    Close,
    /// Retransmission timer fired.
    Timer,
    /// SYN received.
    Syn,
    /// SYN-ACK received.
    SynAck,
    /// DATA received.
    Data,
    /// ACK received.
    Ack,
    /// STP received.
    Stp,
    /// FIN received.
    Fin,
    /// FIN-ACK received.
    FinAck,
}

impl Event {
    /// All events.
    pub const ALL: [Event; 12] = [
        Event::Connect,
        Event::Accept,
        Event::Send,
        Event::Close,
        Event::Timer,
        Event::Syn,
        Event::SynAck,
        Event::Data,
        Event::Ack,
        Event::Stp,
        Event::Fin,
        Event::FinAck,
    ];

    /// Returns true for events raised by the application.
    pub fn is_local(self) -> bool {
        matches!(
            self,
            Event::Connect | Event::Accept | Event::Send | Event::Close
        )
    }
}

impl From<SegmentKind> for Event {
    fn from(kind: SegmentKind) -> Self {
        match kind {
            SegmentKind::Data => Event::Data,
            SegmentKind::Syn => Event::Syn,
            SegmentKind::SynAck => Event::SynAck,
            SegmentKind::Ack => Event::Ack,
            SegmentKind::Stp => Event::Stp,
            SegmentKind::Fin => Event::Fin,
            SegmentKind::FinAck => Event::FinAck,
        }
    }
}

/// Work requested by a transition.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub enum Effect {
    /// Originate a tracked segment (SYN, STP or FIN).
    Transmit(SegmentKind),
    /// Answer the inbound segment with an untracked reply.
    Reply(SegmentKind),
    /// Stash the inbound SYN for `accept`.
    QueueForAccept,
    /// Wake the blocked `connect`.
    WakeConnect,
    /// Hand the application's data to the send engine.
    Enqueue,
    /// Buffer the inbound data for the application.
    Deliver,
    /// Refuse further data from the application.
    StopSending,
    /// Drop all send engine state for the key.
    ReleaseSender,
    /// Drop all send engine and directory state for the key.
    Release,
    /// Resend the unacknowledged segments of the key.
    Retransmit,
}

/// Facts about the connection that some transitions depend on.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct Context {
    /// Nothing is pending or unacknowledged in the send engine.
    pub drained: bool,
    /// The connection stayed in `Closing` for too many timer firings.
    pub closing_expired: bool,
}

/// Result of a transition.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Transition {
    /// State after the transition.
    pub next: ConnectionState,
    /// Effects to execute, in order.
    pub effects: Vec<Effect>,
}

impl Transition {
    fn to(next: ConnectionState, effects: &[Effect]) -> Result<Self> {
        Ok(Self {
            next,
            effects: effects.to_vec(),
        })
    }
}

/// Computes the transition for `event` in `state`.
pub fn transition(state: ConnectionState, event: Event, ctx: Context) -> Result<Transition> {
    use ConnectionState::*;
    use Effect::*;
    use SegmentKind as K;

    match (state, event) {
        (Closed, Event::Connect) => Transition::to(SynSent, &[Transmit(K::Syn)]),
        (Closed, Event::Syn) => Transition::to(SynRcvd, &[QueueForAccept]),
        (Closed, Event::Fin) => Transition::to(Closed, &[Reply(K::FinAck)]),
        (Closed, Event::FinAck) => Transition::to(Closed, &[Release]),
        (Closed, Event::Close) | (Closed, Event::Timer) => Transition::to(Closed, &[]),

        (SynSent, Event::Syn) => Err(Error::Deadlock),
        (SynSent, Event::SynAck) => Transition::to(Established, &[WakeConnect]),
        (SynSent, Event::Timer) => Transition::to(SynSent, &[Retransmit]),

        (SynRcvd, Event::Accept) => Transition::to(Established, &[Reply(K::SynAck)]),
        (SynRcvd, Event::Syn) | (SynRcvd, Event::Timer) => Transition::to(SynRcvd, &[]),

        (Established, Event::Send) => Transition::to(Established, &[Enqueue]),
        (Established, Event::Data) => Transition::to(Established, &[Deliver]),
        (Established, Event::Ack) | (Established, Event::SynAck) => {
            Transition::to(Established, &[])
        }
        (Established, Event::Close) if ctx.drained => {
            Transition::to(Closing, &[Transmit(K::Fin)])
        }
        (Established, Event::Close) => Transition::to(StpSent, &[Transmit(K::Stp)]),
        (Established, Event::Stp) => Transition::to(StpRcvd, &[Reply(K::Ack), StopSending]),
        (Established, Event::Syn) => Transition::to(Established, &[Reply(K::SynAck)]),
        (Established, Event::Timer) => Transition::to(Established, &[Retransmit]),

        (StpRcvd, Event::Send) => Err(Error::FailSyscall("peer stopped the connection")),
        (StpRcvd, Event::Close) => Transition::to(Closing, &[Transmit(K::Fin)]),
        (StpRcvd, Event::Data) => Transition::to(StpRcvd, &[Deliver]),
        (StpRcvd, Event::Ack) => Transition::to(StpRcvd, &[]),
        (StpRcvd, Event::Timer) => Transition::to(StpRcvd, &[Retransmit]),

        (StpSent, Event::Ack) if ctx.drained => Transition::to(Closing, &[Transmit(K::Fin)]),
        (StpSent, Event::Ack) => Transition::to(StpSent, &[]),
        // The peer's STP is tracked on its side and must be acknowledged or
        // it never drains.
        (StpSent, Event::Stp) => Transition::to(Closing, &[Reply(K::Ack), Transmit(K::Fin)]),
        (StpSent, Event::Data) => Transition::to(StpSent, &[Reply(K::Ack)]),
        (StpSent, Event::Timer) => Transition::to(StpSent, &[Retransmit]),

        (Closing, Event::FinAck) => Transition::to(Closed, &[Release]),
        (Closing, Event::Timer) if ctx.closing_expired => Transition::to(Closed, &[Release]),
        (Closing, Event::Timer) => Transition::to(Closing, &[Retransmit]),
        (Closing, Event::Syn) => Transition::to(Closing, &[Reply(K::SynAck)]),
        (Closing, Event::Data) | (Closing, Event::Stp) => {
            Transition::to(Closing, &[Reply(K::Ack)])
        }
        (Closing, Event::Ack) => Transition::to(Closing, &[]),

        (Established, Event::Fin)
        | (StpRcvd, Event::Fin)
        | (StpSent, Event::Fin)
        | (Closing, Event::Fin) => Transition::to(Closed, &[Reply(K::FinAck), ReleaseSender]),

        (_, Event::Connect) => Err(Error::FailSyscall("connection already exists")),
        (_, Event::Accept) => Err(Error::FailSyscall("no pending connection")),
        (_, Event::Send) => Err(Error::FailSyscall("connection is not open for sending")),
        (_, Event::Close) => Err(Error::FailSyscall("connection is not open")),
        (state, event) => Err(Error::Protocol { state, event }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ConnectionState::*;
    use Effect::*;
    use SegmentKind as K;

    const IDLE: Context = Context {
        drained: false,
        closing_expired: false,
    };
    const DRAINED: Context = Context {
        drained: true,
        closing_expired: false,
    };
    const EXPIRED: Context = Context {
        drained: false,
        closing_expired: true,
    };

    fn table() -> Vec<(ConnectionState, Event, ConnectionState, Vec<Effect>)> {
        vec![
            (Closed, Event::Connect, SynSent, vec![Transmit(K::Syn)]),
            (Closed, Event::Syn, SynRcvd, vec![QueueForAccept]),
            (Closed, Event::Fin, Closed, vec![Reply(K::FinAck)]),
            (Closed, Event::FinAck, Closed, vec![Release]),
            (Closed, Event::Close, Closed, vec![]),
            (Closed, Event::Timer, Closed, vec![]),
            (SynSent, Event::SynAck, Established, vec![WakeConnect]),
            (SynSent, Event::Timer, SynSent, vec![Retransmit]),
            (SynRcvd, Event::Accept, Established, vec![Reply(K::SynAck)]),
            (SynRcvd, Event::Syn, SynRcvd, vec![]),
            (SynRcvd, Event::Timer, SynRcvd, vec![]),
            (Established, Event::Send, Established, vec![Enqueue]),
            (Established, Event::Data, Established, vec![Deliver]),
            (Established, Event::Ack, Established, vec![]),
            (Established, Event::SynAck, Established, vec![]),
            (Established, Event::Close, StpSent, vec![Transmit(K::Stp)]),
            (
                Established,
                Event::Stp,
                StpRcvd,
                vec![Reply(K::Ack), StopSending],
            ),
            (
                Established,
                Event::Fin,
                Closed,
                vec![Reply(K::FinAck), ReleaseSender],
            ),
            (Established, Event::Syn, Established, vec![Reply(K::SynAck)]),
            (Established, Event::Timer, Established, vec![Retransmit]),
            (StpRcvd, Event::Close, Closing, vec![Transmit(K::Fin)]),
            (
                StpRcvd,
                Event::Fin,
                Closed,
                vec![Reply(K::FinAck), ReleaseSender],
            ),
            (StpRcvd, Event::Data, StpRcvd, vec![Deliver]),
            (StpRcvd, Event::Ack, StpRcvd, vec![]),
            (StpRcvd, Event::Timer, StpRcvd, vec![Retransmit]),
            (StpSent, Event::Ack, StpSent, vec![]),
            (
                StpSent,
                Event::Stp,
                Closing,
                vec![Reply(K::Ack), Transmit(K::Fin)],
            ),
            (
                StpSent,
                Event::Fin,
                Closed,
                vec![Reply(K::FinAck), ReleaseSender],
            ),
            (StpSent, Event::Data, StpSent, vec![Reply(K::Ack)]),
            (StpSent, Event::Timer, StpSent, vec![Retransmit]),
            (
                Closing,
                Event::Fin,
                Closed,
                vec![Reply(K::FinAck), ReleaseSender],
            ),
            (Closing, Event::FinAck, Closed, vec![Release]),
            (Closing, Event::Timer, Closing, vec![Retransmit]),
            (Closing, Event::Syn, Closing, vec![Reply(K::SynAck)]),
            (Closing, Event::Data, Closing, vec![Reply(K::Ack)]),
            (Closing, Event::Stp, Closing, vec![Reply(K::Ack)]),
            (Closing, Event::Ack, Closing, vec![]),
        ]
    }

    #[test]
    fn test_listed_transitions() {
        for (state, event, next, effects) in table() {
            let t = transition(state, event, IDLE).unwrap();
            assert_eq!(t.next, next, "{:?} x {:?}", state, event);
            assert_eq!(t.effects, effects, "{:?} x {:?}", state, event);
        }
    }

    #[test]
    fn test_unlisted_transitions() {
        let listed: Vec<_> = table().into_iter().map(|(s, e, _, _)| (s, e)).collect();
        for state in ConnectionState::ALL.iter().copied() {
            for event in Event::ALL.iter().copied() {
                if listed.contains(&(state, event)) {
                    continue;
                }
                let err = transition(state, event, IDLE).unwrap_err();
                match (state, event, err) {
                    (SynSent, Event::Syn, Error::Deadlock) => {}
                    (_, event, Error::FailSyscall(_)) if event.is_local() => {}
                    (_, event, Error::Protocol { state: s, event: e }) if !event.is_local() => {
                        assert_eq!((s, e), (state, event));
                    }
                    (state, event, err) => {
                        panic!("{:?} x {:?} gave {:?}", state, event, err)
                    }
                }
            }
        }
    }

    #[test]
    fn test_close_depends_on_drain() {
        let t = transition(Established, Event::Close, DRAINED).unwrap();
        assert_eq!(t.next, Closing);
        assert_eq!(t.effects, vec![Transmit(K::Fin)]);

        let t = transition(StpSent, Event::Ack, DRAINED).unwrap();
        assert_eq!(t.next, Closing);
        assert_eq!(t.effects, vec![Transmit(K::Fin)]);
    }

    #[test]
    fn test_closing_reaper() {
        let t = transition(Closing, Event::Timer, EXPIRED).unwrap();
        assert_eq!(t.next, Closed);
        assert_eq!(t.effects, vec![Release]);
        // Expiry only matters in Closing.
        let t = transition(StpSent, Event::Timer, EXPIRED).unwrap();
        assert_eq!(t.next, StpSent);
    }

    #[test]
    fn test_event_from_kind() {
        assert_eq!(Event::from(K::FinAck), Event::FinAck);
        assert_eq!(Event::from(K::Data), Event::Data);
        assert!(!Event::from(K::Syn).is_local());
        assert!(Event::Close.is_local());
    }
}
