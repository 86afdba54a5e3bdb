//! New-block subscription handle

use tokio::sync::mpsc;
use tokio::task::JoinHandle;

/// Stream of new block heights
///
/// Dropping the subscription unsubscribes.
pub struct BlockSubscription {
    heights: mpsc::Receiver<u64>,
    producer: Option<JoinHandle<()>>,
}

impl BlockSubscription {
    /// Wrap a channel fed by a background producer task
    pub fn new(heights: mpsc::Receiver<u64>, producer: JoinHandle<()>) -> Self {
        Self {
            heights,
            producer: Some(producer),
        }
    }

    /// Wrap a channel whose sender is owned elsewhere
    #[cfg(test)]
    pub fn from_receiver(heights: mpsc::Receiver<u64>) -> Self {
        Self {
            heights,
            producer: None,
        }
    }

    /// Next block height, `None` once the subscription has ended
    pub async fn next(&mut self) -> Option<u64> {
        self.heights.recv().await
    }

    /// Stop receiving notifications. Safe to call repeatedly.
    pub fn unsubscribe(&mut self) {
        self.heights.close();
        if let Some(producer) = self.producer.take() {
            producer.abort();
        }
    }
}

impl Drop for BlockSubscription {
    fn drop(&mut self) {
        self.unsubscribe();
    }
}
