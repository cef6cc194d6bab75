//! Per-consumer sample channels.
//!
//! Ordinary consumers each get their own `broadcast` channel, so a slow
//! consumer loses its oldest samples (reported as `Lagged`) without stalling
//! acquisition or the other consumers. Broadcast capacities are rounded up to
//! a power of two.
//!
//! A matcher is the lossless counterpart: an unbounded channel that receives
//! only the samples its predicate selects.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tendon_core::{SensorSample, TaggedSample};
use tokio::sync::broadcast::{self, error::RecvError, error::TryRecvError};
use tokio::sync::mpsc;
use tracing::warn;

/// Largest queue a consumer may ask for.
pub const MAX_SINK_CAPACITY: usize = 1 << 20;

/// Selects the samples a matcher receives.
pub type SamplePredicate = Arc<dyn Fn(&SensorSample) -> bool + Send + Sync>;

/// Producer half of a drop-oldest sink, held by the streaming engine.
#[derive(Debug)]
pub(crate) struct SinkSender {
    name: Arc<str>,
    tx: broadcast::Sender<TaggedSample>,
    dropped: Arc<AtomicU64>,
}

/// Consumer half of a drop-oldest sink.
#[derive(Debug)]
pub struct SampleReceiver {
    name: Arc<str>,
    rx: broadcast::Receiver<TaggedSample>,
    dropped: Arc<AtomicU64>,
}

pub(crate) fn sample_channel(name: &str, capacity: usize) -> (SinkSender, SampleReceiver) {
    let (tx, rx) = broadcast::channel(capacity.clamp(1, MAX_SINK_CAPACITY));
    let name: Arc<str> = Arc::from(name);
    let dropped = Arc::new(AtomicU64::new(0));
    (
        SinkSender {
            name: name.clone(),
            tx,
            dropped: dropped.clone(),
        },
        SampleReceiver { name, rx, dropped },
    )
}

impl SinkSender {
    /// Hand a sample to the consumer without waiting.
    pub(crate) fn push(&self, sample: TaggedSample) {
        // Only fails with no receiver left, which `is_open` reports.
        let _ = self.tx.send(sample);
    }

    /// False once the receiver has been dropped.
    pub(crate) fn is_open(&self) -> bool {
        self.tx.receiver_count() > 0
    }

    pub(crate) fn name(&self) -> &str {
        &self.name
    }

    /// Samples the consumer has been told it lost.
    pub(crate) fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

impl SampleReceiver {
    fn lagged(&self, skipped: u64) {
        self.dropped.fetch_add(skipped, Ordering::Relaxed);
        warn!(sink = %self.name, skipped, "Sink fell behind, oldest samples dropped");
    }

    /// Next sample, waiting if none is queued. `None` once the streaming
    /// engine is gone.
    pub async fn recv(&mut self) -> Option<TaggedSample> {
        loop {
            match self.rx.recv().await {
                Ok(sample) => return Some(sample),
                Err(RecvError::Lagged(skipped)) => self.lagged(skipped),
                Err(RecvError::Closed) => return None,
            }
        }
    }

    /// Next sample if one is queued.
    pub fn try_recv(&mut self) -> Option<TaggedSample> {
        loop {
            match self.rx.try_recv() {
                Ok(sample) => return Some(sample),
                Err(TryRecvError::Lagged(skipped)) => self.lagged(skipped),
                Err(TryRecvError::Empty | TryRecvError::Closed) => return None,
            }
        }
    }

    /// Take everything currently queued.
    pub fn drain(&mut self) -> Vec<TaggedSample> {
        std::iter::from_fn(|| self.try_recv()).collect()
    }

    /// Samples lost because this consumer fell behind.
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    /// Name given at subscription.
    pub fn name(&self) -> &str {
        &self.name
    }
}

/// Lossless filtered feed.
pub(crate) struct Matcher {
    name: Arc<str>,
    predicate: SamplePredicate,
    tx: mpsc::UnboundedSender<TaggedSample>,
}

pub(crate) fn matcher(
    name: &str,
    predicate: SamplePredicate,
) -> (Matcher, mpsc::UnboundedReceiver<TaggedSample>) {
    let (tx, rx) = mpsc::unbounded_channel();
    (
        Matcher {
            name: Arc::from(name),
            predicate,
            tx,
        },
        rx,
    )
}

impl Matcher {
    /// Forward `sample` if the predicate selects it.
    pub(crate) fn offer(&self, sample: TaggedSample) {
        if (self.predicate)(&sample.sample) {
            let _ = self.tx.send(sample);
        }
    }

    pub(crate) fn is_open(&self) -> bool {
        !self.tx.is_closed()
    }

    pub(crate) fn name(&self) -> &str {
        &self.name
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tagged(position: i32, current: u32) -> TaggedSample {
        TaggedSample {
            run_id: None,
            sample: SensorSample {
                timestamp: 0.0,
                position,
                velocity: 0,
                current,
                force_tendon: 0,
                force_tip: 0,
                angle_joint: 0,
            },
        }
    }

    #[test]
    fn full_sink_drops_oldest_and_counts_the_loss() {
        let (tx, mut rx) = sample_channel("plot", 4);
        for p in 0..7 {
            tx.push(tagged(p, 0));
        }
        let kept: Vec<i32> = rx.drain().iter().map(|t| t.sample.position).collect();
        assert_eq!(kept, vec![3, 4, 5, 6]);
        assert_eq!(rx.dropped(), 3);
        assert_eq!(tx.dropped(), 3);
    }

    #[tokio::test]
    async fn recv_wakes_on_push_and_ends_on_close() {
        let (tx, mut rx) = sample_channel("logger", 8);
        let consumer = tokio::spawn(async move {
            let mut seen = Vec::new();
            while let Some(t) = rx.recv().await {
                seen.push(t.sample.position);
            }
            seen
        });
        tokio::task::yield_now().await;
        tx.push(tagged(1, 0));
        tx.push(tagged(2, 0));
        drop(tx);
        assert_eq!(consumer.await.unwrap(), vec![1, 2]);
    }

    #[test]
    fn sender_sees_dropped_receiver() {
        let (tx, rx) = sample_channel("gone", 1);
        assert!(tx.is_open());
        drop(rx);
        assert!(!tx.is_open());
    }

    #[test]
    fn matcher_keeps_every_selected_sample() {
        let (m, mut rx) = matcher("overcurrent", Arc::new(|s: &SensorSample| s.current > 1_000));
        m.offer(tagged(1, 5_000));
        for p in 2..200 {
            m.offer(tagged(p, 100));
        }
        m.offer(tagged(200, 1_500));

        let got: Vec<u32> = std::iter::from_fn(|| rx.try_recv().ok())
            .map(|t| t.sample.current)
            .collect();
        assert_eq!(got, vec![5_000, 1_500]);
        drop(rx);
        assert!(!m.is_open());
    }
}
