//! Unreliable link for testing purposes.
#![deny(missing_docs)]
#![deny(warnings)]
use addr::HostId;
use async_trait::async_trait;
use link::{Frame, Hub, HubLink, Link};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::collections::VecDeque;
use std::io::Result;
use std::sync::{Arc, Mutex, PoisonError};
use tracing::trace;

#[derive(Clone)]
struct Fate {
    px: f64,
    pq: f64,
    rng: Arc<Mutex<StdRng>>,
    delayed: Arc<Mutex<VecDeque<Frame>>>,
}

impl Fate {
    fn decide(&self) -> Tx {
        let mut rng = self.rng.lock().unwrap_or_else(PoisonError::into_inner);
        if rng.gen::<f64>() < self.px {
            Tx::Success
        } else if rng.gen::<f64>() < self.pq {
            Tx::Delay
        } else {
            Tx::Drop
        }
    }

    fn take_delayed(&self) -> Vec<Frame> {
        let mut delayed = self.delayed.lock().unwrap_or_else(PoisonError::into_inner);
        delayed.drain(..).collect()
    }
}

/// Lossy link.
pub struct LossyLink {
    fate: Fate,
    inner: HubLink,
}

#[async_trait]
impl Link for LossyLink {
    fn local_host(&self) -> HostId {
        self.inner.local_host()
    }

    async fn send(&self, frame: Frame) -> Result<()> {
        match self.fate.decide() {
            Tx::Success => {
                self.inner.send(frame).await?;
                // Frames held back earlier are released behind this one.
                for frame in self.fate.take_delayed() {
                    self.inner.hub().deliver(&frame);
                }
            }
            Tx::Delay => {
                trace!(?frame, "delaying frame");
                self.fate
                    .delayed
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .push_back(frame);
            }
            Tx::Drop => trace!(?frame, "dropping frame"),
        }
        Ok(())
    }

    async fn recv(&self) -> Result<Frame> {
        self.inner.recv().await
    }
}

/// Lossy network builder.
pub struct LossyNetworkBuilder {
    px: f64,
    pq: f64,
    hub: Hub,
    fate: Fate,
}

impl LossyNetworkBuilder {
    /// Creates a new lossy network.
    ///
    /// The px parameter defines the probability of a frame getting
    /// transmitted immediately.
    /// The pq parameter defines the probability of a frame that was not
    /// transmitted immediately getting queued and delivered out of order,
    /// instead of being dropped.
    ///
    /// Through the combination of the px and pq parameters we can
    /// create links that are reliable (px=1.0), simulate network
    /// partitions (px=0.0, pq=0.0), reorder without loss (pq=1.0) or
    /// anything in between. The link never duplicates a frame.
    pub fn new(px: f64, pq: f64) -> Self {
        assert!((0.0..=1.0).contains(&px));
        assert!((0.0..=1.0).contains(&pq));
        Self {
            px,
            pq,
            hub: Hub::new(),
            fate: Fate {
                px,
                pq,
                rng: Arc::new(Mutex::new(StdRng::from_entropy())),
                delayed: Default::default(),
            },
        }
    }

    /// Seeds the random number generator so a run can be reproduced.
    pub fn seed(self, seed: u64) -> Self {
        *self.fate.rng.lock().unwrap_or_else(PoisonError::into_inner) =
            StdRng::seed_from_u64(seed);
        self
    }

    /// Attaches a host to the network.
    pub fn attach(&self, host: HostId) -> LossyLink {
        LossyLink {
            fate: self.fate.clone(),
            inner: self.hub.attach(host),
        }
    }

    /// Delivers every held-back frame now, as if the partition healed.
    pub fn flush(&self) {
        for frame in self.fate.take_delayed() {
            self.hub.deliver(&frame);
        }
    }

    /// Number of frames currently held back.
    pub fn delayed(&self) -> usize {
        self.fate
            .delayed
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }
}

/// Enumerates the conditions during transmission.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Tx {
    /// Frame is transmitted immediately.
    Success,
    /// Frame is delayed and will be received out of order.
    Delay,
    /// Frame is dropped.
    Drop,
}

impl LossyNetworkBuilder {
    /// Returns the probability of a condition occuring.
    pub fn probability(&self, cond: Tx) -> f64 {
        match cond {
            Tx::Success => self.px,
            Tx::Delay => (1.0 - self.px) * self.pq,
            Tx::Drop => (1.0 - self.px) * (1.0 - self.pq),
        }
    }
}

impl std::fmt::Display for LossyNetworkBuilder {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        writeln!(f, "p(transmission) = {}", self.px)?;
        writeln!(f, "p(queue) = {}", self.pq)?;
        writeln!(f, "p(success) = {}", self.probability(Tx::Success))?;
        writeln!(f, "p(delay) = {}", self.probability(Tx::Delay))?;
        writeln!(f, "p(drop) = {}", self.probability(Tx::Drop))?;
        Ok(())
    }
}
