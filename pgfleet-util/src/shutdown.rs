//! Process-wide stop flag for the writer's background tasks.
//!
//! The flag is a watched boolean: flipping it wakes every task that is
//! parked in [`ShutdownReceiver::recv`] (the batcher and maintenance loops
//! select on it with priority), while ingress paths that must never suspend
//! (`write` shedding batches at the door) just read the current value with
//! [`ShutdownReceiver::signalled`]. Once flipped the flag never clears, so
//! a receiver subscribing late still observes the stop immediately.

use tokio::sync::watch;

/// Creates the stop flag, initially unset.
pub fn channel() -> (ShutdownSender, ShutdownReceiver) {
    let (tx, rx) = watch::channel(false);
    (ShutdownSender(tx), ShutdownReceiver(rx))
}

/// Owner of the stop flag; held by the process entry point.
#[derive(Debug)]
pub struct ShutdownSender(watch::Sender<bool>);

impl ShutdownSender {
    /// Raise the flag, then wait until every [`ShutdownReceiver`] has been
    /// dropped, i.e. until every background task has wound down.
    pub async fn shutdown(self) {
        self.0.send_replace(true);
        self.0.closed().await;
    }
}

/// A task's view of the stop flag. Clones share the same flag.
#[derive(Clone, Debug)]
pub struct ShutdownReceiver(watch::Receiver<bool>);

impl ShutdownReceiver {
    /// Resolves once the flag is raised; meant for a `tokio::select!` arm.
    /// Resolves immediately when the flag is already up, and treats a
    /// dropped [`ShutdownSender`] as a raised flag.
    pub async fn recv(&mut self) {
        let _ = self.0.wait_for(|stopping| *stopping).await;
    }

    /// Non-suspending read of the flag; a dropped sender counts as raised.
    pub fn signalled(&self) -> bool {
        *self.0.borrow() || self.0.has_changed().is_err()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn recv_resolves_on_shutdown() {
        let (tx, mut rx) = channel();
        let task = tokio::spawn(async move {
            rx.recv().await;
        });
        tx.shutdown().await;
        task.await.unwrap();
    }

    #[tokio::test]
    async fn recv_resolves_immediately_when_already_raised() {
        let (tx, rx) = channel();
        let mut late = rx.clone();
        let stopper = tokio::spawn(tx.shutdown());

        // the flag is level- not edge-triggered: both the receiver that
        // existed before the send and a clone polled afterwards resolve
        late.recv().await;
        let mut original = rx;
        original.recv().await;

        drop((late, original));
        stopper.await.unwrap();
    }

    #[tokio::test]
    async fn signalled_observes_the_raised_flag() {
        let (tx, rx) = channel();
        let probe = rx.clone();
        assert!(!probe.signalled());

        let stopper = tokio::spawn(tx.shutdown());
        let mut waiter = rx.clone();
        waiter.recv().await;
        assert!(probe.signalled());

        drop((rx, waiter, probe));
        stopper.await.unwrap();
    }

    #[tokio::test]
    async fn dropped_sender_counts_as_raised() {
        let (tx, mut rx) = channel();
        drop(tx);
        assert!(rx.signalled());
        // recv does not hang on a dropped sender either
        rx.recv().await;
    }

    #[tokio::test]
    async fn shutdown_waits_for_receivers() {
        let (tx, mut rx) = channel();
        let task = tokio::spawn(async move {
            rx.recv().await;
        });
        // resolves only once the spawned receiver has been dropped
        tx.shutdown().await;
        task.await.unwrap();
    }
}
