#![allow(dead_code)]
use async_std::task;
use async_trait::async_trait;
use link::{Frame, HostId, Link};
use rdtp::{ConnectionKey, Port, Result, Segment, Transport};
use std::io;
use std::sync::{Arc, Mutex};
use std::time::Duration;

pub fn init_logging() {
    let _ = tracing_subscriber::FmtSubscriber::builder()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// Records every segment sent through the wrapped link.
pub struct Tap<L> {
    inner: L,
    sent: Arc<Mutex<Vec<Segment>>>,
}

impl<L: Link> Tap<L> {
    pub fn new(inner: L) -> (Self, Arc<Mutex<Vec<Segment>>>) {
        let sent = Arc::new(Mutex::new(Vec::new()));
        (
            Self {
                inner,
                sent: sent.clone(),
            },
            sent,
        )
    }
}

#[async_trait]
impl<L: Link> Link for Tap<L> {
    fn local_host(&self) -> HostId {
        self.inner.local_host()
    }

    async fn send(&self, frame: Frame) -> io::Result<()> {
        if let Ok(segment) = Segment::decode(&frame) {
            self.sent.lock().unwrap().push(segment);
        }
        self.inner.send(frame).await
    }

    async fn recv(&self) -> io::Result<Frame> {
        self.inner.recv().await
    }
}

pub async fn wait_accept(transport: &Transport, port: Port) -> Result<ConnectionKey> {
    loop {
        if let Some(key) = transport.accept(port)? {
            return Ok(key);
        }
        task::sleep(Duration::from_millis(1)).await;
    }
}

/// Reads until `len` bytes arrived.
pub async fn read_exact(transport: &Transport, key: &ConnectionKey, len: usize) -> Result<Vec<u8>> {
    let mut data = Vec::with_capacity(len);
    let mut buf = [0; 64];
    while data.len() < len {
        let n = transport.read(key, &mut buf)?;
        if n == 0 {
            task::sleep(Duration::from_millis(1)).await;
        }
        data.extend_from_slice(&buf[..n]);
    }
    Ok(data)
}

/// Reads until the connection reports closed, returning what was left.
pub async fn read_to_close(transport: &Transport, key: &ConnectionKey) -> Vec<u8> {
    let mut data = Vec::new();
    let mut buf = [0; 64];
    loop {
        match transport.read(key, &mut buf) {
            Ok(0) => task::sleep(Duration::from_millis(1)).await,
            Ok(n) => data.extend_from_slice(&buf[..n]),
            Err(_) => return data,
        }
    }
}

pub async fn wait_until<F: Fn() -> bool>(cond: F) {
    while !cond() {
        task::sleep(Duration::from_millis(1)).await;
    }
}
