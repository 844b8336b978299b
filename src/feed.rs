//! Change feed of newly inserted messages.
//!
//! Uses `tokio::sync::broadcast` so any number of trigger sources, loggers
//! or tests can watch inserts. Delivery is at-least-once from the point of
//! view of the engagement path: consumers must tolerate duplicates, and a
//! lagging consumer silently skips what it missed.

use tokio::sync::broadcast;

use crate::db::messages::Message;

/// Broadcast sender for inserted messages.
///
/// Clone this to share between components that publish.
/// Sending to zero receivers silently succeeds.
#[derive(Clone)]
pub struct MessageFeed {
    tx: broadcast::Sender<Message>,
}

impl MessageFeed {
    /// Create a new feed with the specified buffer capacity.
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx }
    }

    /// Publish a committed message to all subscribers.
    pub fn publish(&self, message: Message) {
        let _ = self.tx.send(message);
    }

    /// Create a new subscriber to receive inserts from now on.
    pub fn subscribe(&self) -> MessageFeedReceiver {
        MessageFeedReceiver {
            rx: self.tx.subscribe(),
        }
    }

    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

impl Default for MessageFeed {
    fn default() -> Self {
        Self::new(256)
    }
}

/// Receiver for inserted messages.
pub struct MessageFeedReceiver {
    rx: broadcast::Receiver<Message>,
}

impl MessageFeedReceiver {
    /// Receive the next message, waiting asynchronously.
    ///
    /// Returns `None` once the feed is dropped. Lagged gaps are skipped
    /// with a warning; the next human message re-triggers evaluation.
    pub async fn recv(&mut self) -> Option<Message> {
        loop {
            match self.rx.recv().await {
                Ok(message) => return Some(message),
                Err(broadcast::error::RecvError::Lagged(missed)) => {
                    tracing::warn!(missed, "message feed lagged, skipping missed inserts");
                    continue;
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }

    /// Try to receive a message without waiting.
    pub fn try_recv(&mut self) -> Option<Message> {
        loop {
            match self.rx.try_recv() {
                Ok(message) => return Some(message),
                Err(broadcast::error::TryRecvError::Lagged(_)) => continue,
                Err(_) => return None,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_publish_without_subscribers() {
        let feed = MessageFeed::new(4);
        feed.publish(Message::human("lobby", "amy", "nobody listening"));
        assert_eq!(feed.subscriber_count(), 0);
    }

    #[tokio::test]
    async fn test_multiple_subscribers_each_receive() {
        let feed = MessageFeed::new(4);
        let mut a = feed.subscribe();
        let mut b = feed.subscribe();

        feed.publish(Message::human("lobby", "amy", "hi"));

        assert_eq!(a.recv().await.map(|m| m.content), Some("hi".to_string()));
        assert_eq!(b.recv().await.map(|m| m.content), Some("hi".to_string()));
    }

    #[tokio::test]
    async fn test_lagged_receiver_skips_to_newest() {
        let feed = MessageFeed::new(2);
        let mut rx = feed.subscribe();

        for i in 0..5 {
            feed.publish(Message::human("lobby", "amy", format!("m{i}")));
        }

        // Oldest entries were overwritten; recv resumes at what remains
        let first = rx.recv().await.expect("message");
        assert_eq!(first.content, "m3");
        assert_eq!(rx.try_recv().map(|m| m.content), Some("m4".to_string()));
        assert!(rx.try_recv().is_none());
    }

    #[tokio::test]
    async fn test_closed_feed_returns_none() {
        let feed = MessageFeed::new(2);
        let mut rx = feed.subscribe();
        drop(feed);
        assert!(rx.recv().await.is_none());
    }
}
