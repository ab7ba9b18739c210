//! Connection directory.
//!
//! Holds the state, receive queue and handshake waiter of every known
//! connection of a host, together with the SYNs waiting to be accepted.
//! Absent keys are `Closed`.
use crate::error::{Error, Result};
use crate::packet::{Segment, SequenceNumber};
use crate::state::ConnectionState;
use addr::{ConnectionKey, Port, PORT_LIMIT};
use futures::channel::oneshot;
use std::collections::{HashMap, HashSet, VecDeque};
use tracing::debug;

/// Per connection record.
#[derive(Debug, Default)]
pub struct Entry {
    pub(crate) state: ConnectionState,
    pub(crate) recv_queue: VecDeque<Segment>,
    /// Next in-order inbound sequence number.
    pub(crate) expected: SequenceNumber,
    pub(crate) waiter: Option<oneshot::Sender<Result<()>>>,
    /// Timer firings spent in `Closing`.
    pub(crate) closing_ticks: usize,
}

impl Entry {
    /// Current state.
    pub fn state(&self) -> ConnectionState {
        self.state
    }

    /// Number of unread segments.
    pub fn unread(&self) -> usize {
        self.recv_queue.len()
    }

    fn is_idle(&self) -> bool {
        self.state == ConnectionState::Closed
            && self.recv_queue.is_empty()
            && self.waiter.is_none()
    }
}

/// Table of connections.
pub struct ConnectionDirectory {
    recv_window: usize,
    entries: HashMap<ConnectionKey, Entry>,
    pending: HashMap<Port, VecDeque<Segment>>,
    listening: HashSet<Port>,
}

impl ConnectionDirectory {
    /// Creates an empty directory.
    pub fn new(recv_window: usize) -> Self {
        Self {
            recv_window,
            entries: Default::default(),
            pending: Default::default(),
            listening: Default::default(),
        }
    }

    /// State of `key`.
    pub fn state(&self, key: &ConnectionKey) -> ConnectionState {
        self.entries
            .get(key)
            .map(Entry::state)
            .unwrap_or_default()
    }

    /// Returns the entry of `key`.
    pub fn get(&self, key: &ConnectionKey) -> Option<&Entry> {
        self.entries.get(key)
    }

    pub(crate) fn get_mut(&mut self, key: &ConnectionKey) -> Option<&mut Entry> {
        self.entries.get_mut(key)
    }

    /// Returns the entry of `key`, creating a `Closed` one.
    pub(crate) fn entry(&mut self, key: ConnectionKey) -> &mut Entry {
        self.entries.entry(key).or_default()
    }

    /// Removes the entry of `key`.
    pub(crate) fn remove(&mut self, key: &ConnectionKey) -> Option<Entry> {
        let entry = self.entries.remove(key);
        if entry.is_some() {
            debug!(key = %key, "connection removed");
        }
        entry
    }

    /// Removes the entry of `key` if it is closed and holds nothing.
    pub(crate) fn reap(&mut self, key: &ConnectionKey) {
        if self.entries.get(key).map(Entry::is_idle).unwrap_or(false) {
            self.remove(key);
        }
    }

    /// Keys and states of all known connections.
    pub fn connections(&self) -> Vec<(ConnectionKey, ConnectionState)> {
        let mut connections: Vec<_> = self
            .entries
            .iter()
            .map(|(key, entry)| (*key, entry.state))
            .collect();
        connections.sort_by_key(|(key, _)| *key);
        connections
    }

    pub(crate) fn keys(&self) -> Vec<ConnectionKey> {
        self.entries.keys().copied().collect()
    }

    /// Expected inbound sequence number of a known connection.
    pub fn expected(&self, key: &ConnectionKey) -> Option<SequenceNumber> {
        self.entries.get(key).map(|entry| entry.expected)
    }

    /// Starts a new sequence space for `key`, as a reconnecting peer counts
    /// from 0 again. Unread data of the previous connection stays queued.
    pub(crate) fn restart(&mut self, key: &ConnectionKey) {
        if let Some(entry) = self.entries.get_mut(key) {
            debug!(key = %key, unread = entry.recv_queue.len(), "connection reused");
            entry.expected = 0;
            entry.closing_ticks = 0;
        }
    }

    /// Marks `seq` as processed.
    pub(crate) fn advance(&mut self, key: &ConnectionKey, seq: SequenceNumber) {
        if let Some(entry) = self.entries.get_mut(key) {
            entry.expected = seq.wrapping_add(1);
        }
    }

    /// Buffers an inbound data segment. Returns false if the receive queue
    /// is full.
    pub(crate) fn deliver(&mut self, key: ConnectionKey, segment: Segment) -> bool {
        let recv_window = self.recv_window;
        let entry = self.entry(key);
        if entry.recv_queue.len() >= recv_window {
            debug!(key = %key, seq = segment.seq(), "receive queue full");
            return false;
        }
        entry.recv_queue.push_back(segment);
        true
    }

    /// Copies the oldest unread data into `buf`.
    ///
    /// A segment larger than `buf` is shortened and put back at the head of
    /// the queue. Returns 0 if nothing is buffered on an open connection.
    pub fn read(&mut self, key: &ConnectionKey, buf: &mut [u8]) -> Result<usize> {
        let entry = self
            .entries
            .get_mut(key)
            .ok_or(Error::FailSyscall("connection closed"))?;
        let segment = match entry.recv_queue.pop_front() {
            Some(segment) => segment,
            None if entry.state == ConnectionState::Closed => {
                self.reap(key);
                return Err(Error::FailSyscall("connection closed"));
            }
            None => return Ok(0),
        };
        let len = buf.len().min(segment.payload().len());
        buf[..len].copy_from_slice(&segment.payload()[..len]);
        if len < segment.payload().len() {
            entry.recv_queue.push_front(segment.shorten(len));
        }
        self.reap(key);
        Ok(len)
    }

    /// Stashes an inbound SYN until its port is accepted on.
    pub(crate) fn push_pending(&mut self, syn: Segment) {
        self.pending
            .entry(syn.dest_port())
            .or_default()
            .push_back(syn);
    }

    /// Takes the earliest SYN waiting on `port`.
    pub(crate) fn pop_pending(&mut self, port: Port) -> Option<Segment> {
        self.pending.get_mut(&port).and_then(VecDeque::pop_front)
    }

    /// Number of SYNs waiting on `port`.
    pub fn pending(&self, port: Port) -> usize {
        self.pending.get(&port).map(VecDeque::len).unwrap_or_default()
    }

    /// Reserves `port` for accepting connections.
    pub(crate) fn listen(&mut self, port: Port) {
        self.listening.insert(port);
    }

    /// Returns the lowest local port that no connection or listener uses.
    pub fn allocate_port(&self) -> Result<Port> {
        let used: HashSet<Port> = self
            .entries
            .keys()
            .map(ConnectionKey::local_port)
            .chain(self.listening.iter().copied())
            .chain(self.pending.keys().copied())
            .collect();
        (0..=PORT_LIMIT)
            .find(|port| !used.contains(port))
            .ok_or(Error::NoFreePort)
    }
}
