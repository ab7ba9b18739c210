//! Socket surface of the transport.
use crate::directory::ConnectionDirectory;
use crate::dispatcher::{run_dispatcher, run_reader, Command, Dispatcher};
use crate::error::{Error, Result};
use crate::packet::{Segment, MAX_PAYLOAD};
use crate::sender::{run_sender, SendEngine};
use crate::state::{ConnectionState, Context, Event};
use crate::timer::run_timer;
use addr::{is_valid_port, ConnectionKey, HostId, Port};
use async_std::channel::{bounded, unbounded, Sender};
use async_std::future::timeout;
use async_std::task::{self, JoinHandle};
use bytes::Bytes;
use crossbeam::atomic::AtomicCell;
use futures::channel::oneshot;
use link::Link;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::debug;

/// Segments in flight per connection.
pub const SEND_WINDOW: usize = 16;
/// Unread segments buffered per connection.
pub const RECV_WINDOW: usize = 16;

/// Builder for transports.
#[derive(Clone, Debug)]
pub struct TransportBuilder {
    /// Segments in flight per connection.
    send_window: usize,
    /// Unread segments buffered per connection.
    recv_window: usize,
    /// Period of the retransmission timer.
    rtx: Duration,
    /// Timer firings a connection may spend in `Closing` before it is
    /// reaped.
    closing_ticks: usize,
    /// Time to wait for the handshake. Waits forever if `None`.
    connect_timeout: Option<Duration>,
}

impl Default for TransportBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl TransportBuilder {
    /// Creates a new `TransportBuilder`.
    pub fn new() -> Self {
        Self {
            send_window: SEND_WINDOW,
            recv_window: RECV_WINDOW,
            rtx: Duration::from_millis(20),
            closing_ticks: 4,
            connect_timeout: None,
        }
    }

    /// Segments in flight per connection.
    pub fn set_send_window(mut self, send_window: usize) -> Self {
        self.send_window = send_window;
        self
    }

    /// Unread segments buffered per connection.
    pub fn set_recv_window(mut self, recv_window: usize) -> Self {
        self.recv_window = recv_window;
        self
    }

    /// Period of the retransmission timer.
    pub fn set_rtx(mut self, rtx: Duration) -> Self {
        self.rtx = rtx;
        self
    }

    /// Timer firings a connection may spend in `Closing` before it is
    /// reaped.
    pub fn set_closing_ticks(mut self, closing_ticks: usize) -> Self {
        self.closing_ticks = closing_ticks;
        self
    }

    /// Time to wait for the handshake.
    pub fn set_connect_timeout(mut self, connect_timeout: Duration) -> Self {
        self.connect_timeout = Some(connect_timeout);
        self
    }

    /// Starts a transport on `link`.
    pub fn build<L: Link + 'static>(&self, link: L) -> Transport {
        let host = link.local_host();
        let link: Arc<dyn Link> = Arc::new(link);
        let shutdown = Arc::new(AtomicCell::new(false));
        let (commands, command_rx) = unbounded();
        let (wake, wake_rx) = bounded(1);
        let engine = Arc::new(Mutex::new(SendEngine::new(self.send_window)));
        let dispatcher = Arc::new(Dispatcher::new(
            ConnectionDirectory::new(self.recv_window),
            engine.clone(),
            wake.clone(),
            self.closing_ticks,
        ));
        let tasks = vec![
            task::spawn(run_reader(link.clone(), commands.clone(), shutdown.clone())),
            task::spawn(run_dispatcher(
                dispatcher.clone(),
                command_rx,
                shutdown.clone(),
            )),
            task::spawn(run_sender(engine, link, wake_rx, shutdown.clone())),
            task::spawn(run_timer(self.rtx, commands.clone(), shutdown.clone())),
        ];
        debug!(host, "transport started");
        Transport {
            host,
            dispatcher,
            commands,
            wake,
            shutdown,
            connect_timeout: self.connect_timeout,
            tasks,
        }
    }
}

/// Reliable transport of one host.
pub struct Transport {
    host: HostId,
    dispatcher: Arc<Dispatcher>,
    commands: Sender<Command>,
    wake: Sender<()>,
    shutdown: Arc<AtomicCell<bool>>,
    connect_timeout: Option<Duration>,
    tasks: Vec<JoinHandle<()>>,
}

impl Transport {
    /// Local host.
    pub fn local_host(&self) -> HostId {
        self.host
    }

    fn check_running(&self) -> Result<()> {
        if self.shutdown.load() {
            return Err(Error::Shutdown);
        }
        Ok(())
    }

    /// Opens a connection to `remote_port` on `remote_host` from a free
    /// local port. Resolves once the peer accepted.
    pub async fn connect(&self, remote_host: HostId, remote_port: Port) -> Result<ConnectionKey> {
        self.check_running()?;
        if !is_valid_port(remote_port) {
            return Err(Error::FailSyscall("invalid port"));
        }
        let (key, waiter) = {
            let mut dir = self.dispatcher.directory();
            let local_port = dir.allocate_port()?;
            let key = ConnectionKey::new(remote_host, remote_port, self.host, local_port);
            let (tx, rx) = oneshot::channel();
            dir.entry(key).waiter = Some(tx);
            let applied = self
                .dispatcher
                .apply(&mut dir, key, Event::Connect, None, Context::default());
            if let Err(err) = applied {
                dir.remove(&key);
                return Err(err);
            }
            (key, rx)
        };
        self.dispatcher.wake();
        debug!(key = %key, "connecting");

        let handshake = async move { waiter.await.unwrap_or(Err(Error::Shutdown)) };
        let result = match self.connect_timeout {
            Some(limit) => timeout(limit, handshake)
                .await
                .unwrap_or(Err(Error::TimedOut)),
            None => handshake.await,
        };
        if let Err(err) = result {
            debug!(key = %key, %err, "connect failed");
            let mut dir = self.dispatcher.directory();
            dir.remove(&key);
            self.dispatcher.sender().release(&key);
            return Err(err);
        }
        debug!(key = %key, "connected");
        Ok(key)
    }

    /// Accepts the earliest pending connection on `local_port`.
    ///
    /// Never blocks: returns `None` if no connection is pending. The port
    /// is reserved for listening from the first call on.
    pub fn accept(&self, local_port: Port) -> Result<Option<ConnectionKey>> {
        self.check_running()?;
        if !is_valid_port(local_port) {
            return Err(Error::FailSyscall("invalid port"));
        }
        let mut dir = self.dispatcher.directory();
        dir.listen(local_port);
        while let Some(syn) = dir.pop_pending(local_port) {
            let key = syn.key();
            // The peer may have given up in the meantime.
            if dir.state(&key) != ConnectionState::SynRcvd {
                continue;
            }
            self.dispatcher
                .apply(&mut dir, key, Event::Accept, Some(&syn), Context::default())?;
            drop(dir);
            self.dispatcher.wake();
            debug!(key = %key, "accepted");
            return Ok(Some(key));
        }
        Ok(None)
    }

    /// Reads buffered data into `buf`. Returns 0 if nothing is buffered.
    pub fn read(&self, key: &ConnectionKey, buf: &mut [u8]) -> Result<usize> {
        self.check_running()?;
        self.dispatcher.directory().read(key, buf)
    }

    /// Queues `data` for transmission in segments of up to `MAX_PAYLOAD`
    /// bytes.
    pub fn write(&self, key: &ConnectionKey, data: &[u8]) -> Result<usize> {
        self.check_running()?;
        let mut dir = self.dispatcher.directory();
        for chunk in data.chunks(MAX_PAYLOAD) {
            let segment = Segment::data(key, Bytes::copy_from_slice(chunk));
            self.dispatcher
                .apply(&mut dir, *key, Event::Send, Some(&segment), Context::default())?;
        }
        drop(dir);
        self.dispatcher.wake();
        Ok(data.len())
    }

    /// Starts a graceful close. Does not wait for the peer.
    pub fn close(&self, key: &ConnectionKey) -> Result<()> {
        self.check_running()?;
        let mut dir = self.dispatcher.directory();
        let ctx = Context {
            drained: self.dispatcher.sender().is_drained(key),
            closing_expired: false,
        };
        let applied = self.dispatcher.apply(&mut dir, *key, Event::Close, None, ctx)?;
        drop(dir);
        self.dispatcher.wake();
        debug!(key = %key, next = ?applied.next, "closing");
        Ok(())
    }

    /// Like `read`, but returns the number of bytes read or -1.
    pub fn read_raw(&self, key: &ConnectionKey, buf: &mut [u8]) -> i32 {
        match self.read(key, buf) {
            Ok(len) => len as i32,
            Err(err) => {
                debug!(key = %key, %err, "read");
                -1
            }
        }
    }

    /// Like `write`, but returns the number of bytes written or -1.
    pub fn write_raw(&self, key: &ConnectionKey, data: &[u8]) -> i32 {
        match self.write(key, data) {
            Ok(len) => len as i32,
            Err(err) => {
                debug!(key = %key, %err, "write");
                -1
            }
        }
    }

    /// State of `key`.
    pub fn state(&self, key: &ConnectionKey) -> ConnectionState {
        self.dispatcher.directory().state(key)
    }

    /// All known connections and their states.
    pub fn connections(&self) -> Vec<(ConnectionKey, ConnectionState)> {
        self.dispatcher.directory().connections()
    }

    /// Segments of `key` transmitted but not acknowledged.
    pub fn in_flight(&self, key: &ConnectionKey) -> usize {
        self.dispatcher.sender().in_flight(key)
    }

    fn stop(&self) {
        self.shutdown.store(true);
        self.commands.close();
        self.wake.close();
    }

    /// Stops all tasks of the transport.
    pub async fn shutdown(mut self) {
        self.stop();
        for task in std::mem::take(&mut self.tasks) {
            task.cancel().await;
        }
        debug!(host = self.host, "transport stopped");
    }
}

impl Drop for Transport {
    fn drop(&mut self) {
        self.stop();
        // The reader may be parked in `Link::recv` forever.
        let tasks = std::mem::take(&mut self.tasks);
        if !tasks.is_empty() {
            task::spawn(async move {
                for task in tasks {
                    task.cancel().await;
                }
            });
        }
    }
}
