use tracing::{debug, warn};

use crate::backend::Backend;
use crate::core::Core;
use crate::message::{Message, MsgCode};
use crate::{MAX_FUTURE_HEIGHT, MAX_UNCHECKED_BACKLOG};

/// A buffered message together with its decoded position, so replay scans do
/// not re-decode payloads.
#[derive(Debug)]
pub(crate) struct BacklogEntry {
    pub round: u64,
    pub height: u64,
    pub msg: Message,
}

impl<B: Backend> Core<B> {
    /// Buffers a validated current-height message whose round or step is
    /// ahead. Per-sender queues stay ordered by round, then step.
    pub(crate) fn store_backlog(&mut self, msg: Message, round: u64) {
        let entry = BacklogEntry {
            round,
            height: self.height,
            msg,
        };
        let queue = self.backlogs.entry(entry.msg.sender).or_default();
        let position = queue
            .partition_point(|e| (e.round, e.msg.step()) <= (round, entry.msg.step()));
        queue.insert(position, entry);
    }

    /// Buffers an unvalidated message for a future height. Heights too far
    /// ahead are misbehavior and dropped, as is everything past the cap.
    pub(crate) fn store_unchecked_backlog(&mut self, msg: Message, height: u64) {
        if height > self.height + MAX_FUTURE_HEIGHT {
            warn!(
                sender = %msg.sender,
                height,
                current = self.height,
                "message too far in the future, dropping"
            );
            return;
        }
        let buffered: usize = self.backlog_unchecked.values().map(Vec::len).sum();
        if buffered >= MAX_UNCHECKED_BACKLOG {
            warn!(sender = %msg.sender, height, "future height backlog full, dropping");
            return;
        }
        self.backlog_unchecked.entry(height).or_default().push(msg);
    }

    /// Replays buffered messages that became on-time after a round or step
    /// change, preserving per-sender order. Messages whose height or round
    /// has been passed are discarded, except old-round precommits which are
    /// re-fed for aggregation.
    pub(crate) fn process_backlog(&mut self) {
        let mut ready = Vec::new();
        for queue in self.backlogs.values_mut() {
            let mut keep = Vec::with_capacity(queue.len());
            for entry in queue.drain(..) {
                if entry.height != self.height {
                    continue;
                }
                let still_future = entry.round > self.round
                    || (entry.round == self.round && entry.msg.step() > self.step);
                if still_future {
                    keep.push(entry);
                    continue;
                }
                if entry.round < self.round && entry.msg.code != MsgCode::Precommit {
                    continue;
                }
                ready.push(entry.msg);
            }
            *queue = keep;
        }
        self.backlogs.retain(|_, queue| !queue.is_empty());

        for msg in ready {
            if let Err(err) = self.handle_checked_msg(msg) {
                debug!(%err, "backlog message not processed");
            }
        }
    }

    /// Promotes buffered future-height messages once their height starts.
    /// They never passed validation, so they re-enter through the full
    /// pipeline.
    pub(crate) fn process_unchecked_backlog(&mut self) {
        self.backlog_unchecked = self.backlog_unchecked.split_off(&self.height);
        if let Some(messages) = self.backlog_unchecked.remove(&self.height) {
            for msg in messages {
                if let Err(err) = self.handle_msg(msg) {
                    debug!(%err, "promoted backlog message not processed");
                }
            }
        }
    }
}
