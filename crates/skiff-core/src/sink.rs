//! Outbound side of the message channel.
//!
//! The transfer thread writes encoded chunks into a [`ChunkSink`]. Sinks must
//! not block on the peer's transfer thread: when both ends run in the same
//! process, queue the bytes (see [`ChannelSink`]) and deliver them elsewhere.

use crate::status::Status;
use crossbeam_channel::{Sender, TrySendError};

/// Destination for encoded chunks
pub trait ChunkSink: Send {
    /// Send one encoded chunk
    ///
    /// # Errors
    ///
    /// Returns a status if the chunk could not be handed to the channel.
    fn write(&mut self, chunk: &[u8]) -> Result<(), Status>;
}

impl<F> ChunkSink for F
where
    F: FnMut(&[u8]) -> Result<(), Status> + Send,
{
    fn write(&mut self, chunk: &[u8]) -> Result<(), Status> {
        self(chunk)
    }
}

/// Sink queueing chunks on a crossbeam channel
#[derive(Debug, Clone)]
pub struct ChannelSink {
    tx: Sender<Vec<u8>>,
}

impl ChannelSink {
    /// Create a sink feeding `tx`
    #[must_use]
    pub fn new(tx: Sender<Vec<u8>>) -> Self {
        Self { tx }
    }
}

impl ChunkSink for ChannelSink {
    fn write(&mut self, chunk: &[u8]) -> Result<(), Status> {
        match self.tx.try_send(chunk.to_vec()) {
            Ok(()) => Ok(()),
            Err(TrySendError::Full(_)) => Err(Status::ResourceExhausted),
            Err(TrySendError::Disconnected(_)) => Err(Status::Unavailable),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crossbeam_channel::bounded;

    #[test]
    fn test_channel_sink() {
        let (tx, rx) = bounded(1);
        let mut sink = ChannelSink::new(tx);
        sink.write(b"one").unwrap();
        assert_eq!(sink.write(b"two"), Err(Status::ResourceExhausted));
        assert_eq!(rx.recv().unwrap(), b"one");
        drop(rx);
        assert_eq!(sink.write(b"three"), Err(Status::Unavailable));
    }

    #[test]
    fn test_closure_sink() {
        let mut sent = Vec::new();
        {
            let mut sink = |chunk: &[u8]| {
                sent.push(chunk.len());
                Ok(())
            };
            ChunkSink::write(&mut sink, &[0; 3]).unwrap();
        }
        assert_eq!(sent, vec![3]);
    }
}
