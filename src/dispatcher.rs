//! Receive dispatcher.
//!
//! All inbound frames and timer ticks are funneled through one command
//! queue. Each command is processed under the directory lock; the send
//! engine lock is always taken after it.
use crate::directory::ConnectionDirectory;
use crate::error::{Error, Result};
use crate::packet::{Segment, SegmentKind};
use crate::sender::SendEngine;
use crate::state::{transition, ConnectionState, Context, Effect, Event};
use addr::ConnectionKey;
use async_std::channel::{Receiver, Sender};
use crossbeam::atomic::AtomicCell;
use link::{Frame, Link};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tracing::{debug, trace, warn};

/// Work for the dispatcher task.
#[derive(Debug)]
pub(crate) enum Command {
    /// A frame arrived on the link.
    Frame(Frame),
    /// The retransmission timer fired.
    Tick,
}

/// Outcome of an applied event.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub(crate) struct Applied {
    pub next: ConnectionState,
    /// False if the segment was refused and must not be treated as seen.
    pub accepted: bool,
}

/// Shared protocol engine of one host.
pub(crate) struct Dispatcher {
    directory: Mutex<ConnectionDirectory>,
    sender: Arc<Mutex<SendEngine>>,
    wake: Sender<()>,
    closing_ticks: usize,
}

impl Dispatcher {
    pub fn new(
        directory: ConnectionDirectory,
        sender: Arc<Mutex<SendEngine>>,
        wake: Sender<()>,
        closing_ticks: usize,
    ) -> Self {
        Self {
            directory: Mutex::new(directory),
            sender,
            wake,
            closing_ticks,
        }
    }

    pub fn directory(&self) -> MutexGuard<'_, ConnectionDirectory> {
        self.directory.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn sender(&self) -> MutexGuard<'_, SendEngine> {
        self.sender.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Nudges the sender task. Wake-ups coalesce.
    pub fn wake(&self) {
        self.wake.try_send(()).ok();
    }

    /// Runs `event` through the state machine of `key` and executes the
    /// resulting effects.
    ///
    /// `segment` is the segment the event is about: the inbound segment for
    /// network events, the outbound data for `Send` and the stashed SYN for
    /// `Accept`.
    pub fn apply(
        &self,
        dir: &mut ConnectionDirectory,
        key: ConnectionKey,
        event: Event,
        segment: Option<&Segment>,
        ctx: Context,
    ) -> Result<Applied> {
        let state = dir.state(&key);
        let result = transition(state, event, ctx).and_then(|t| {
            let accepted = self.execute(dir, key, &t.effects, segment)?;
            if t.next != state {
                debug!(key = %key, ?state, ?event, next = ?t.next, "transition");
            }
            if let Some(entry) = dir.get_mut(&key) {
                entry.state = t.next;
            }
            Ok(Applied {
                next: t.next,
                accepted,
            })
        });
        dir.reap(&key);
        result
    }

    fn execute(
        &self,
        dir: &mut ConnectionDirectory,
        key: ConnectionKey,
        effects: &[Effect],
        segment: Option<&Segment>,
    ) -> Result<bool> {
        let mut accepted = true;
        // Creates the entry for keys that were unknown.
        dir.entry(key);
        let mut sender = self.sender();
        for effect in effects {
            match *effect {
                Effect::Transmit(kind) => {
                    sender.enqueue(Segment::control(&key, kind))?;
                }
                Effect::Reply(kind) => {
                    if let Some(segment) = segment {
                        sender.reply(segment.reply(kind));
                    }
                }
                Effect::QueueForAccept => {
                    if let Some(syn) = segment {
                        dir.push_pending(syn.clone());
                    }
                }
                Effect::WakeConnect => {
                    let waiter = dir.get_mut(&key).and_then(|entry| entry.waiter.take());
                    if let Some(waiter) = waiter {
                        waiter.send(Ok(())).ok();
                    }
                }
                Effect::Enqueue => {
                    if let Some(segment) = segment {
                        sender.enqueue(segment.clone())?;
                    }
                }
                Effect::Deliver => {
                    if let Some(segment) = segment {
                        accepted = dir.deliver(key, segment.clone());
                        if accepted {
                            sender.reply(segment.ack());
                        }
                    }
                }
                Effect::StopSending => sender.stop(&key),
                Effect::ReleaseSender => sender.release(&key),
                Effect::Release => {
                    sender.release(&key);
                    dir.remove(&key);
                }
                Effect::Retransmit => {
                    sender.resend_unacked(&key);
                }
            }
        }
        Ok(accepted)
    }

    /// Processes one inbound frame.
    pub fn handle_frame(&self, frame: Frame) {
        match Segment::decode(&frame) {
            Ok(segment) => self.handle_segment(segment),
            Err(err) => warn!(?frame, %err, "dropping malformed frame"),
        }
    }

    /// Processes one inbound segment.
    pub fn handle_segment(&self, segment: Segment) {
        trace!(?segment, "recv");
        let kind = match segment.kind() {
            Some(kind) => kind,
            None => {
                warn!(?segment, "dropping segment with meaningless flags");
                return;
            }
        };
        let key = segment.key();
        let seq = segment.seq();
        let mut dir = self.directory();

        if kind.is_reply() {
            self.sender().ack(&key, seq);
        } else if kind == SegmentKind::Syn && dir.state(&key) == ConnectionState::Closed {
            // The key is kept only for unread data. The peer reconnects.
            dir.restart(&key);
        } else if let Some(expected) = dir.expected(&key) {
            if seq < expected {
                self.reack(&dir, &segment, kind);
                drop(dir);
                self.wake();
                return;
            }
            if seq > expected {
                debug!(key = %key, seq, expected, "dropping out of order segment");
                return;
            }
        }

        let ctx = Context {
            drained: self.sender().is_drained(&key),
            closing_expired: false,
        };
        match self.apply(&mut dir, key, Event::from(kind), Some(&segment), ctx) {
            Ok(applied) => {
                if applied.accepted && !kind.is_reply() {
                    dir.advance(&key, seq);
                }
            }
            Err(Error::Deadlock) => {
                warn!(key = %key, "simultaneous open");
                if let Some(mut entry) = dir.remove(&key) {
                    if let Some(waiter) = entry.waiter.take() {
                        waiter.send(Err(Error::Deadlock)).ok();
                    }
                }
                self.sender().release(&key);
            }
            Err(err) => warn!(key = %key, ?segment, %err, "dropping segment"),
        }
        drop(dir);
        self.wake();
    }

    /// Acknowledges a segment that was already processed. The peer may have
    /// missed the first acknowledgment.
    fn reack(&self, dir: &ConnectionDirectory, segment: &Segment, kind: SegmentKind) {
        let reply = match kind {
            SegmentKind::Data | SegmentKind::Stp => SegmentKind::Ack,
            SegmentKind::Fin => SegmentKind::FinAck,
            SegmentKind::Syn
                if matches!(
                    dir.state(&segment.key()),
                    ConnectionState::Established | ConnectionState::Closing
                ) =>
            {
                SegmentKind::SynAck
            }
            _ => {
                trace!(?segment, "dropping stale segment");
                return;
            }
        };
        debug!(?segment, "re-acknowledging stale segment");
        self.sender().reply(segment.reply(reply));
    }

    /// Runs a timer event for every connection.
    pub fn handle_tick(&self) {
        let mut dir = self.directory();
        for key in dir.keys() {
            let closing_expired = match dir.get_mut(&key) {
                Some(entry) if entry.state == ConnectionState::Closing => {
                    entry.closing_ticks += 1;
                    entry.closing_ticks > self.closing_ticks
                }
                Some(_) => false,
                None => continue,
            };
            let ctx = Context {
                drained: self.sender().is_drained(&key),
                closing_expired,
            };
            if closing_expired {
                debug!(key = %key, "reaping connection stuck in closing");
            }
            if let Err(err) = self.apply(&mut dir, key, Event::Timer, None, ctx) {
                warn!(key = %key, %err, "timer");
            }
        }
        drop(dir);
        self.wake();
    }
}

/// Consumes commands until the queue closes or the transport shuts down.
pub(crate) async fn run_dispatcher(
    dispatcher: Arc<Dispatcher>,
    commands: Receiver<Command>,
    shutdown: Arc<AtomicCell<bool>>,
) {
    while let Ok(command) = commands.recv().await {
        if shutdown.load() {
            break;
        }
        match command {
            Command::Frame(frame) => dispatcher.handle_frame(frame),
            Command::Tick => dispatcher.handle_tick(),
        }
    }
    debug!("dispatcher stopped");
}

/// Forwards frames from the link into the command queue.
pub(crate) async fn run_reader(
    link: Arc<dyn Link>,
    commands: Sender<Command>,
    shutdown: Arc<AtomicCell<bool>>,
) {
    loop {
        let frame = match link.recv().await {
            Ok(frame) => frame,
            Err(err) => {
                warn!(%err, "link receive failed");
                break;
            }
        };
        if shutdown.load() || commands.send(Command::Frame(frame)).await.is_err() {
            break;
        }
    }
    debug!("reader stopped");
}
