//! Per-guild FIFO of pending tracks.

use std::collections::VecDeque;

use thiserror::Error;
use tracing::info;

use super::PcmSource;

#[derive(Debug, Error)]
pub enum QueueError {
    #[error("the queue is full (max {0} tracks)")]
    Full(usize),
}

/// One pending track. Source and display title travel as a unit, so the two
/// can never drift out of lockstep.
pub struct QueuedTrack {
    pub source: Box<dyn PcmSource>,
    pub title: String,
}

pub struct GuildQueue {
    items: VecDeque<QueuedTrack>,
    max_size: usize,
}

impl GuildQueue {
    pub fn new(max_size: usize) -> Self {
        Self {
            items: VecDeque::new(),
            max_size,
        }
    }

    pub fn push(&mut self, source: Box<dyn PcmSource>, title: String) -> Result<(), QueueError> {
        if self.items.len() >= self.max_size {
            return Err(QueueError::Full(self.max_size));
        }
        info!("➕ Queued: {title}");
        self.items.push_back(QueuedTrack { source, title });
        Ok(())
    }

    /// FIFO pop. The caller takes ownership of the source; this is the only
    /// way a track leaves the queue besides [`GuildQueue::clear`].
    pub fn pop(&mut self) -> Option<QueuedTrack> {
        self.items.pop_front()
    }

    /// Drops every pending track, releasing each source exactly once.
    pub fn clear(&mut self) {
        if !self.items.is_empty() {
            info!("🗑️ Dropping {} queued tracks", self.items.len());
        }
        self.items.clear();
    }

    pub fn titles(&self) -> Vec<String> {
        self.items.iter().map(|item| item.title.clone()).collect()
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    struct Silent;

    impl PcmSource for Silent {
        fn next_chunk(&mut self) -> anyhow::Result<Option<Vec<i16>>> {
            Ok(None)
        }
    }

    fn track(queue: &mut GuildQueue, title: &str) {
        queue.push(Box::new(Silent), title.to_string()).expect("queue has room");
    }

    #[test]
    fn pop_is_fifo_and_titles_stay_aligned() {
        let mut queue = GuildQueue::new(10);
        track(&mut queue, "one");
        track(&mut queue, "two");
        track(&mut queue, "three");

        assert_eq!(queue.titles(), vec!["one", "two", "three"]);

        let popped = queue.pop().expect("queue not empty");
        assert_eq!(popped.title, "one");
        assert_eq!(queue.titles(), vec!["two", "three"]);
        assert_eq!(queue.titles().len(), queue.len());
    }

    #[test]
    fn push_rejects_when_full() {
        let mut queue = GuildQueue::new(1);
        track(&mut queue, "only");
        assert!(matches!(
            queue.push(Box::new(Silent), "extra".into()),
            Err(QueueError::Full(1))
        ));
        assert_eq!(queue.len(), 1);
    }

    #[test]
    fn clear_empties_the_queue() {
        let mut queue = GuildQueue::new(10);
        track(&mut queue, "one");
        track(&mut queue, "two");
        queue.clear();
        assert!(queue.is_empty());
        assert!(queue.pop().is_none());
    }
}
