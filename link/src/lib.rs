//! Defines the `Link` trait.
//!
//! A link moves fixed-size frames between a small set of hosts. It may lose
//! or reorder frames but never corrupts them.
//!
//! ```text
//! 0       8       16      24      32
//! +-------+-------+-------+-------+
//! | dest  | src   | 0     | len   |
//! +-------+-------+-------+-------+
//! | contents (len bytes)          |
//! +-------+-------+-------+-------+
//! ```
#![deny(missing_docs)]
#![deny(warnings)]
pub use addr::HostId;
use async_std::channel::{unbounded, Receiver, Sender};
use async_trait::async_trait;
use bytes::{BufMut, Bytes, BytesMut};
use std::collections::HashMap;
use std::io::{Error, ErrorKind, Result};
use std::sync::{Arc, Mutex, PoisonError};
use tracing::trace;

/// Length of the link header.
pub const LINK_HEADER_LEN: usize = 4;
/// Maximum length of a raw frame.
pub const FRAME_LEN: usize = 32;
/// Maximum length of the contents of a frame.
pub const MAX_CONTENTS_LEN: usize = FRAME_LEN - LINK_HEADER_LEN;

/// Link trait is used to decouple the transport from the physical link.
#[async_trait]
pub trait Link: Send + Sync {
    /// Link address of the local host.
    fn local_host(&self) -> HostId;

    /// Receive a frame from the link.
    async fn recv(&self) -> Result<Frame>;

    /// Send a frame to the link.
    async fn send(&self, frame: Frame) -> Result<()>;
}

/// A frame sendable over a link.
#[derive(Clone, PartialEq, Eq)]
pub struct Frame {
    dest: HostId,
    src: HostId,
    contents: Bytes,
}

fn invalid(msg: &'static str) -> Error {
    Error::new(ErrorKind::InvalidData, msg)
}

impl Frame {
    /// Creates a new frame.
    pub fn new(dest: HostId, src: HostId, contents: Bytes) -> Result<Self> {
        if contents.len() > MAX_CONTENTS_LEN {
            return Err(invalid("frame contents too long"));
        }
        Ok(Self {
            dest,
            src,
            contents,
        })
    }

    /// Parses a raw frame.
    pub fn decode(raw: &[u8]) -> Result<Self> {
        if raw.len() < LINK_HEADER_LEN {
            return Err(invalid("truncated frame header"));
        }
        if raw[2] != 0 {
            return Err(invalid("reserved byte must be zero"));
        }
        let len = raw[3] as usize;
        if len != raw.len() - LINK_HEADER_LEN {
            return Err(invalid("frame length mismatch"));
        }
        Self::new(
            raw[0],
            raw[1],
            Bytes::copy_from_slice(&raw[LINK_HEADER_LEN..]),
        )
    }

    /// Returns the raw frame.
    pub fn encode(&self) -> Bytes {
        let mut bytes = BytesMut::with_capacity(LINK_HEADER_LEN + self.contents.len());
        bytes.put_u8(self.dest);
        bytes.put_u8(self.src);
        bytes.put_u8(0);
        bytes.put_u8(self.contents.len() as u8);
        bytes.put_slice(&self.contents);
        bytes.freeze()
    }

    /// Destination host.
    pub fn dest(&self) -> HostId {
        self.dest
    }

    /// Source host.
    pub fn src(&self) -> HostId {
        self.src
    }

    /// Returns a byte slice of the contents.
    pub fn contents(&self) -> &[u8] {
        &self.contents
    }

    /// Returns the owned contents.
    pub fn into_contents(self) -> Bytes {
        self.contents
    }
}

impl std::fmt::Debug for Frame {
    fn fmt(&self, fmt: &mut std::fmt::Formatter) -> std::fmt::Result {
        fmt.debug_struct("Frame")
            .field("dest", &self.dest)
            .field("src", &self.src)
            .field("contents", &self.contents.len())
            .finish()
    }
}

/// A reliable in-memory switch.
///
/// Frames are carried in their raw encoding. Frames for a host that is not
/// attached are dropped.
#[derive(Clone, Default)]
pub struct Hub(Arc<Mutex<HashMap<HostId, Sender<Bytes>>>>);

impl Hub {
    /// Creates a new hub.
    pub fn new() -> Self {
        Self::default()
    }

    /// Attaches a host to the hub.
    ///
    /// Attaching the same host twice replaces the earlier link.
    pub fn attach(&self, host: HostId) -> HubLink {
        let (tx, rx) = unbounded();
        self.0
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(host, tx);
        HubLink {
            host,
            hub: self.clone(),
            rx,
        }
    }

    /// Detaches a host from the hub.
    pub fn detach(&self, host: HostId) {
        self.0
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&host);
    }

    /// Delivers a frame to its destination host.
    pub fn deliver(&self, frame: &Frame) {
        let tx = {
            let hosts = self.0.lock().unwrap_or_else(PoisonError::into_inner);
            hosts.get(&frame.dest()).cloned()
        };
        match tx {
            Some(tx) => {
                if tx.try_send(frame.encode()).is_err() {
                    trace!(dest = frame.dest(), "host detached, dropping frame");
                }
            }
            None => trace!(dest = frame.dest(), "unknown host, dropping frame"),
        }
    }
}

/// A host's link into a `Hub`.
pub struct HubLink {
    host: HostId,
    hub: Hub,
    rx: Receiver<Bytes>,
}

impl HubLink {
    /// Returns the hub this link is attached to.
    pub fn hub(&self) -> &Hub {
        &self.hub
    }
}

#[async_trait]
impl Link for HubLink {
    fn local_host(&self) -> HostId {
        self.host
    }

    async fn send(&self, frame: Frame) -> Result<()> {
        if frame.src() != self.host {
            return Err(Error::new(ErrorKind::InvalidInput, "foreign source host"));
        }
        self.hub.deliver(&frame);
        Ok(())
    }

    async fn recv(&self) -> Result<Frame> {
        let raw = self
            .rx
            .recv()
            .await
            .map_err(|_| Error::new(ErrorKind::BrokenPipe, "link detached"))?;
        Frame::decode(&raw)
    }
}
