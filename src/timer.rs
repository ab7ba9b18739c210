//! Retransmission timer.
use crate::dispatcher::Command;
use async_std::channel::Sender;
use crossbeam::atomic::AtomicCell;
use futures_timer::Delay;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

/// Emits a tick into the command queue every `period`.
pub(crate) async fn run_timer(
    period: Duration,
    commands: Sender<Command>,
    shutdown: Arc<AtomicCell<bool>>,
) {
    loop {
        Delay::new(period).await;
        if shutdown.load() || commands.send(Command::Tick).await.is_err() {
            break;
        }
    }
    debug!("timer stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_std::channel::unbounded;
    use async_std::task;

    #[test]
    fn test_ticks_until_shutdown() {
        task::block_on(async {
            let (tx, rx) = unbounded();
            let shutdown = Arc::new(AtomicCell::new(false));
            let timer = task::spawn(run_timer(
                Duration::from_millis(1),
                tx,
                shutdown.clone(),
            ));
            assert!(matches!(rx.recv().await, Ok(Command::Tick)));
            assert!(matches!(rx.recv().await, Ok(Command::Tick)));
            shutdown.store(true);
            timer.await;
        });
    }
}
