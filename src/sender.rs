//! Send engine.
//!
//! Every connection owns a sliding window of `send_window` tracked segments.
//! Tracked segments (DATA, SYN, STP, FIN) take the next sequence number of
//! their connection, wait in `pending` until the window admits them and stay
//! in `unacked` until the peer answers with a reply carrying the same
//! sequence number. Replies bypass the window and are never retransmitted.
//!
//! The timer retransmits per connection through `resend_unacked`, so a
//! connection's state decides whether it still retransmits.
//! `resend_all_unacked` is the host-wide form for callers driving the engine
//! without a dispatcher.
use crate::error::{Error, Result};
use crate::packet::{Segment, SegmentKind, SequenceNumber};
use addr::ConnectionKey;
use async_std::channel::Receiver;
use crossbeam::atomic::AtomicCell;
use link::Link;
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::{Arc, Mutex, PoisonError};
use tracing::{debug, trace, warn};

#[derive(Default)]
struct Window {
    next_seq: SequenceNumber,
    pending: VecDeque<Segment>,
    unacked: BTreeMap<SequenceNumber, Segment>,
    stopped: bool,
}

impl Window {
    fn is_drained(&self) -> bool {
        self.pending.is_empty() && self.unacked.is_empty()
    }
}

/// Outgoing queues of all connections of a host.
pub struct SendEngine {
    send_window: usize,
    windows: HashMap<ConnectionKey, Window>,
    replies: VecDeque<Segment>,
    resend: VecDeque<Segment>,
}

impl SendEngine {
    /// Creates a send engine admitting `send_window` segments in flight per
    /// connection.
    pub fn new(send_window: usize) -> Self {
        Self {
            send_window: send_window.max(1),
            windows: Default::default(),
            replies: Default::default(),
            resend: Default::default(),
        }
    }

    /// Appends a tracked segment to the tail of its connection's queue and
    /// returns the sequence number it was given.
    pub fn enqueue(&mut self, mut segment: Segment) -> Result<SequenceNumber> {
        let key = segment.sender_key();
        let window = self.windows.entry(key).or_default();
        if window.stopped && segment.kind() == Some(SegmentKind::Data) {
            return Err(Error::FailSyscall("sending was stopped"));
        }
        let seq = window.next_seq;
        window.next_seq = seq.wrapping_add(1);
        segment.set_seq(seq);
        trace!(key = %key, seq, ?segment, "enqueue");
        window.pending.push_back(segment);
        Ok(seq)
    }

    /// Queues an untracked reply for immediate transmission.
    pub fn reply(&mut self, segment: Segment) {
        trace!(?segment, "reply");
        self.replies.push_back(segment);
    }

    /// Returns everything that may go out now.
    ///
    /// Replies come first, then retransmissions, then new segments admitted
    /// by their windows. Admitted segments move into the unacked set.
    pub fn poll_transmit(&mut self) -> Vec<Segment> {
        let mut out: Vec<Segment> = self.replies.drain(..).collect();
        out.extend(self.resend.drain(..));
        let limit = self.send_window;
        for window in self.windows.values_mut() {
            while window.unacked.len() < limit {
                let segment = match window.pending.pop_front() {
                    Some(segment) => segment,
                    None => break,
                };
                window.unacked.insert(segment.seq(), segment.clone());
                out.push(segment);
            }
        }
        out
    }

    /// Removes the unacked segment `seq` of `key`. Duplicate and unknown
    /// acknowledgments return false.
    pub fn ack(&mut self, key: &ConnectionKey, seq: SequenceNumber) -> bool {
        let acked = self
            .windows
            .get_mut(key)
            .and_then(|window| window.unacked.remove(&seq))
            .is_some();
        if acked {
            trace!(key = %key, seq, "acked");
        }
        acked
    }

    /// Returns true if nothing is pending or unacknowledged for `key`.
    pub fn is_drained(&self, key: &ConnectionKey) -> bool {
        self.windows
            .get(key)
            .map(Window::is_drained)
            .unwrap_or(true)
    }

    /// Number of segments of `key` transmitted but not acknowledged.
    pub fn in_flight(&self, key: &ConnectionKey) -> usize {
        self.windows
            .get(key)
            .map(|window| window.unacked.len())
            .unwrap_or_default()
    }

    /// Number of segments of `key` waiting for the window.
    pub fn pending(&self, key: &ConnectionKey) -> usize {
        self.windows
            .get(key)
            .map(|window| window.pending.len())
            .unwrap_or_default()
    }

    /// Refuses further data for `key`. Queued segments still drain.
    pub fn stop(&mut self, key: &ConnectionKey) {
        self.windows.entry(*key).or_default().stopped = true;
    }

    /// Drops all tracked state of `key`.
    pub fn release(&mut self, key: &ConnectionKey) {
        if self.windows.remove(key).is_some() {
            debug!(key = %key, "released send state");
        }
        self.resend.retain(|segment| segment.sender_key() != *key);
    }

    /// Schedules every unacked segment of `key` for retransmission.
    pub fn resend_unacked(&mut self, key: &ConnectionKey) -> usize {
        let window = match self.windows.get(key) {
            Some(window) => window,
            None => return 0,
        };
        let resend = &mut self.resend;
        for segment in window.unacked.values() {
            if !resend.contains(segment) {
                resend.push_back(segment.clone());
            }
        }
        window.unacked.len()
    }

    /// Schedules every unacked segment of every connection for
    /// retransmission.
    pub fn resend_all_unacked(&mut self) -> usize {
        let keys: Vec<_> = self.windows.keys().copied().collect();
        keys.iter().map(|key| self.resend_unacked(key)).sum()
    }
}

/// Drives the send engine: every wake-up flushes what `poll_transmit`
/// returns onto the link.
pub(crate) async fn run_sender(
    engine: Arc<Mutex<SendEngine>>,
    link: Arc<dyn Link>,
    wake: Receiver<()>,
    shutdown: Arc<AtomicCell<bool>>,
) {
    while wake.recv().await.is_ok() {
        if shutdown.load() {
            break;
        }
        let segments = engine
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .poll_transmit();
        for segment in segments {
            let frame = match segment.encode() {
                Ok(frame) => frame,
                Err(err) => {
                    warn!(?segment, %err, "dropping unencodable segment");
                    continue;
                }
            };
            trace!(?segment, "send");
            if let Err(err) = link.send(frame).await {
                warn!(%err, "link send failed");
            }
        }
    }
    debug!("sender stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;

    const SEND_WINDOW: usize = 16;

    fn key() -> ConnectionKey {
        ConnectionKey::new(2, 7, 1, 3)
    }

    fn data(byte: u8) -> Segment {
        Segment::data(&key(), Bytes::from(vec![byte]))
    }

    #[test]
    fn test_window_bounds_flight() {
        let mut engine = SendEngine::new(SEND_WINDOW);
        let k = 5;
        for i in 0..SEND_WINDOW + k {
            assert_eq!(engine.enqueue(data(i as u8)).unwrap(), i as u32);
        }
        let sent = engine.poll_transmit();
        assert_eq!(sent.len(), SEND_WINDOW);
        assert_eq!(engine.in_flight(&key()), SEND_WINDOW);
        assert_eq!(engine.pending(&key()), k);
        // Nothing more until acknowledgments arrive.
        assert!(engine.poll_transmit().is_empty());

        // Three acks admit exactly three more, in order.
        for seq in [3, 0, 7].iter() {
            assert!(engine.ack(&key(), *seq));
        }
        let sent = engine.poll_transmit();
        let seqs: Vec<_> = sent.iter().map(Segment::seq).collect();
        assert_eq!(seqs, vec![16, 17, 18]);
        assert_eq!(engine.in_flight(&key()), SEND_WINDOW);
        assert_eq!(engine.pending(&key()), k - 3);
    }

    #[test]
    fn test_duplicate_ack() {
        let mut engine = SendEngine::new(SEND_WINDOW);
        engine.enqueue(data(1)).unwrap();
        engine.poll_transmit();
        assert!(!engine.is_drained(&key()));
        assert!(engine.ack(&key(), 0));
        assert!(!engine.ack(&key(), 0));
        assert!(!engine.ack(&key(), 42));
        assert!(engine.is_drained(&key()));
    }

    #[test]
    fn test_windows_are_per_connection() {
        let mut engine = SendEngine::new(2);
        let other = ConnectionKey::new(3, 7, 1, 4);
        for _ in 0..3 {
            engine.enqueue(data(0)).unwrap();
            engine
                .enqueue(Segment::data(&other, Bytes::new()))
                .unwrap();
        }
        assert_eq!(engine.poll_transmit().len(), 4);
        assert_eq!(engine.in_flight(&key()), 2);
        assert_eq!(engine.in_flight(&other), 2);
    }

    #[test]
    fn test_replies_first() {
        let mut engine = SendEngine::new(SEND_WINDOW);
        engine.enqueue(data(1)).unwrap();
        let mut inbound = Segment::data(&key().mirror(), Bytes::new());
        inbound.set_seq(9);
        engine.reply(inbound.ack());
        let sent = engine.poll_transmit();
        assert_eq!(sent[0].kind(), Some(SegmentKind::Ack));
        assert_eq!(sent[0].seq(), 9);
        assert_eq!(sent[1].kind(), Some(SegmentKind::Data));
        // Replies are not tracked.
        assert_eq!(engine.in_flight(&key()), 1);
    }

    #[test]
    fn test_resend_unacked() {
        let mut engine = SendEngine::new(SEND_WINDOW);
        for i in 0..3 {
            engine.enqueue(data(i)).unwrap();
        }
        engine.poll_transmit();
        engine.ack(&key(), 1);
        assert_eq!(engine.resend_all_unacked(), 2);
        // Scheduling twice does not duplicate.
        engine.resend_unacked(&key());
        let seqs: Vec<_> = engine.poll_transmit().iter().map(Segment::seq).collect();
        assert_eq!(seqs, vec![0, 2]);
        assert_eq!(engine.in_flight(&key()), 2);
    }

    #[test]
    fn test_stop_and_release() {
        let mut engine = SendEngine::new(SEND_WINDOW);
        engine.enqueue(data(1)).unwrap();
        engine.stop(&key());
        assert!(matches!(
            engine.enqueue(data(2)),
            Err(Error::FailSyscall(_))
        ));
        // Control segments still go out, queued data still drains.
        assert_eq!(engine.enqueue(Segment::fin(&key())).unwrap(), 1);
        assert_eq!(engine.poll_transmit().len(), 2);

        engine.resend_unacked(&key());
        engine.release(&key());
        assert!(engine.is_drained(&key()));
        assert!(engine.poll_transmit().is_empty());
        assert_eq!(engine.resend_all_unacked(), 0);
    }
}
