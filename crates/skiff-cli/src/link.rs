//! In-process loopback link that loses chunks at random.

use crossbeam_channel::{Receiver, Sender, unbounded};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use skiff_core::{ChunkSink, Status};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::thread::{self, JoinHandle};

/// Chunk counters of one link
#[derive(Debug, Default)]
pub struct LinkStats {
    sent: AtomicU64,
    dropped: AtomicU64,
}

impl LinkStats {
    /// Chunks handed to the link
    #[must_use]
    pub fn sent(&self) -> u64 {
        self.sent.load(Ordering::Relaxed)
    }

    /// Chunks the link discarded
    #[must_use]
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

/// Sending half of a lossy link
pub struct LossySink {
    tx: Sender<Vec<u8>>,
    rng: StdRng,
    loss: f64,
    stats: Arc<LinkStats>,
}

impl ChunkSink for LossySink {
    fn write(&mut self, chunk: &[u8]) -> Result<(), Status> {
        self.stats.sent.fetch_add(1, Ordering::Relaxed);
        if self.loss > 0.0 && self.rng.gen_bool(self.loss) {
            self.stats.dropped.fetch_add(1, Ordering::Relaxed);
            tracing::trace!("Dropped {} byte chunk", chunk.len());
            return Ok(());
        }
        self.tx.send(chunk.to_vec()).map_err(|_| Status::Unavailable)
    }
}

/// Create a link losing each chunk with probability `loss`
///
/// Sends never block. Deliver the receiving half with [`pump`].
#[must_use]
pub fn lossy_link(loss: f64, seed: u64, stats: Arc<LinkStats>) -> (LossySink, Receiver<Vec<u8>>) {
    let (tx, rx) = unbounded();
    let sink = LossySink {
        tx,
        rng: StdRng::seed_from_u64(seed),
        loss: loss.clamp(0.0, 1.0),
        stats,
    };
    (sink, rx)
}

/// Deliver every chunk from `rx` until the link closes or delivery fails
pub fn pump<F>(name: &str, rx: Receiver<Vec<u8>>, mut deliver: F) -> std::io::Result<JoinHandle<()>>
where
    F: FnMut(&[u8]) -> skiff_core::Result<()> + Send + 'static,
{
    let name = name.to_string();
    thread::Builder::new().name(name.clone()).spawn(move || {
        for chunk in rx {
            if let Err(e) = deliver(&chunk) {
                tracing::debug!("{} stopped: {}", name, e);
                break;
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lossless_link_delivers_everything() {
        let stats = Arc::new(LinkStats::default());
        let (mut sink, rx) = lossy_link(0.0, 1, stats.clone());
        for i in 0..10u8 {
            sink.write(&[i]).unwrap();
        }
        drop(sink);
        assert_eq!(rx.iter().count(), 10);
        assert_eq!(stats.sent(), 10);
        assert_eq!(stats.dropped(), 0);
    }

    #[test]
    fn test_total_loss_drops_everything() {
        let stats = Arc::new(LinkStats::default());
        let (mut sink, rx) = lossy_link(1.0, 1, stats.clone());
        sink.write(b"gone").unwrap();
        drop(sink);
        assert_eq!(rx.iter().count(), 0);
        assert_eq!(stats.dropped(), 1);
    }

    #[test]
    fn test_loss_pattern_is_seeded() {
        let pattern = |seed| {
            let (mut sink, rx) = lossy_link(0.5, seed, Arc::new(LinkStats::default()));
            for i in 0..64u8 {
                sink.write(&[i]).unwrap();
            }
            drop(sink);
            rx.iter().map(|c| c[0]).collect::<Vec<_>>()
        };
        assert_eq!(pattern(7), pattern(7));
    }

    #[test]
    fn test_pump_forwards_until_closed() {
        let (tx, rx) = unbounded();
        let (out_tx, out_rx) = unbounded();
        let handle = pump("test-pump", rx, move |chunk| {
            out_tx.send(chunk.to_vec()).ok();
            Ok(())
        })
        .unwrap();
        tx.send(vec![1, 2]).unwrap();
        drop(tx);
        handle.join().unwrap();
        assert_eq!(out_rx.recv().unwrap(), vec![1, 2]);
    }
}
