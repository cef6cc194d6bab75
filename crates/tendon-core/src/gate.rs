//! Single-writer transport guard with emergency-stop priority.
//!
//! Every backend keeps its transport inside a [`CommandGate`]. Regular commands
//! take [`CommandGate::regular`], emergency stops take
//! [`CommandGate::priority`]. Both hand out exclusive access, so bytes of two
//! commands are never interleaved. While a priority request is waiting, regular
//! requests step aside: whichever regular command currently owns the transport
//! finishes its transaction, and the priority request gets the very next turn.

use std::sync::atomic::{AtomicUsize, Ordering};
use tokio::sync::{Mutex, MutexGuard, Notify};

/// Exclusive transport access with a priority lane.
#[derive(Debug)]
pub struct CommandGate<T> {
    inner: Mutex<T>,
    priority_waiting: AtomicUsize,
    priority_served: Notify,
}

impl<T> CommandGate<T> {
    /// Wrap a transport.
    pub fn new(transport: T) -> Self {
        Self {
            inner: Mutex::new(transport),
            priority_waiting: AtomicUsize::new(0),
            priority_served: Notify::new(),
        }
    }

    /// Acquire the transport for a regular command.
    ///
    /// Waits behind any pending priority request.
    pub async fn regular(&self) -> MutexGuard<'_, T> {
        loop {
            self.wait_for_priority().await;
            let guard = self.inner.lock().await;
            if self.priority_waiting.load(Ordering::SeqCst) == 0 {
                return guard;
            }
            // A priority request queued while we waited; hand it the turn.
            drop(guard);
        }
    }

    /// Acquire the transport ahead of every waiting regular command.
    pub async fn priority(&self) -> MutexGuard<'_, T> {
        self.priority_waiting.fetch_add(1, Ordering::SeqCst);
        let guard = self.inner.lock().await;
        self.priority_waiting.fetch_sub(1, Ordering::SeqCst);
        self.priority_served.notify_waiters();
        guard
    }

    /// Number of priority requests currently waiting for the transport.
    pub fn priority_pending(&self) -> usize {
        self.priority_waiting.load(Ordering::SeqCst)
    }

    async fn wait_for_priority(&self) {
        loop {
            let served = self.priority_served.notified();
            if self.priority_waiting.load(Ordering::SeqCst) == 0 {
                return;
            }
            served.await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;

    #[tokio::test]
    async fn priority_wins_next_turn() {
        let gate = Arc::new(CommandGate::new(Vec::<&'static str>::new()));

        // A long regular command owns the transport.
        let held = gate.regular().await;

        let queued = {
            let gate = gate.clone();
            tokio::spawn(async move {
                gate.regular().await.push("regular");
            })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;

        let estop = {
            let gate = gate.clone();
            tokio::spawn(async move {
                gate.priority().await.push("estop");
            })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(gate.priority_pending(), 1);

        drop(held);
        estop.await.unwrap();
        queued.await.unwrap();

        assert_eq!(*gate.regular().await, vec!["estop", "regular"]);
    }

    #[tokio::test]
    async fn regular_commands_stay_in_order() {
        let gate = Arc::new(CommandGate::new(Vec::new()));
        let held = gate.regular().await;

        let mut tasks = Vec::new();
        for i in 0..3 {
            let gate = gate.clone();
            tasks.push(tokio::spawn(async move {
                gate.regular().await.push(i);
            }));
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        drop(held);
        for task in tasks {
            task.await.unwrap();
        }

        assert_eq!(*gate.regular().await, vec![0, 1, 2]);
    }
}
