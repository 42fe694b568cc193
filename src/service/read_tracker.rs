use std::collections::{HashMap, HashSet};

use tokio::time::Instant;

use crate::config::ReadTrackingConfig;
use crate::models::{Message, MessageId, MessageState, UserId};

/// Viewport capability the monitor samples.
///
/// A GUI implements this with its layout information; headless ports can use
/// [`AlwaysVisible`].
pub trait VisibilityProbe: Send + Sync {
    /// Fraction (0.0..=1.0) of the message inside the viewport, `None` if not rendered.
    fn visible_fraction(&self, id: MessageId) -> Option<f32>;

    /// Pixels between the bottom of the viewport and the end of the log.
    fn distance_from_bottom(&self) -> f32;
}

/// Treats every rendered message as fully visible and the log as scrolled to the bottom.
#[derive(Debug, Clone, Copy, Default)]
pub struct AlwaysVisible;

impl VisibilityProbe for AlwaysVisible {
    fn visible_fraction(&self, _id: MessageId) -> Option<f32> {
        Some(1.0)
    }

    fn distance_from_bottom(&self) -> f32 {
        0.0
    }
}

/// Outcome of one sample.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct ReadDecision {
    /// Ids to acknowledge now, each exactly once per conversation.
    pub acknowledge: Vec<MessageId>,
    /// The whole open conversation should be marked read.
    pub mark_all: bool,
}

/// Decides which messages the user has read from repeated viewport samples.
#[derive(Debug)]
pub struct ReadTracker {
    config: ReadTrackingConfig,
    conversation: Option<UserId>,
    visible_since: HashMap<MessageId, Instant>,
    buffer: Vec<MessageId>,
    last_added: Option<Instant>,
    processed: HashSet<MessageId>,
    settle_since: Option<Instant>,
    settled: bool,
}

impl ReadTracker {
    pub fn new(config: ReadTrackingConfig) -> Self {
        Self {
            config,
            conversation: None,
            visible_since: HashMap::new(),
            buffer: Vec::new(),
            last_added: None,
            processed: HashSet::new(),
            settle_since: None,
            settled: false,
        }
    }

    pub fn conversation(&self) -> Option<UserId> {
        self.conversation
    }

    /// Switching to another conversation forgets everything tracked so far.
    pub fn set_conversation(&mut self, key: Option<UserId>) {
        if self.conversation == key {
            return;
        }
        *self = Self { conversation: key, ..Self::new(self.config.clone()) };
    }

    pub fn sample(
        &mut self,
        now: Instant,
        messages: &[&Message],
        local_user: UserId,
        probe: &dyn VisibilityProbe,
    ) -> ReadDecision {
        let mut decision = ReadDecision::default();
        if self.conversation.is_none() {
            return decision;
        }
        let dwell = self.config.dwell;

        let mut seen = HashSet::new();
        for message in messages {
            let Some(id) = message.id else { continue };
            if message.state != MessageState::Confirmed
                || message.sender_id == local_user
                || message.read_at.is_some()
                || self.processed.contains(&id)
                || self.buffer.contains(&id)
            {
                continue;
            }
            let visible = probe
                .visible_fraction(id)
                .is_some_and(|f| f >= self.config.visible_fraction);
            if !visible {
                continue;
            }
            seen.insert(id);
            let since = *self.visible_since.entry(id).or_insert(now);
            if now.saturating_duration_since(since) >= dwell {
                self.buffer.push(id);
                self.last_added = Some(now);
            }
        }
        self.visible_since.retain(|id, _| seen.contains(id));

        let quiet = self
            .last_added
            .is_some_and(|last| now.saturating_duration_since(last) >= dwell);
        if quiet && !self.buffer.is_empty() {
            let ids = std::mem::take(&mut self.buffer);
            self.last_added = None;
            decision.acknowledge = ids.into_iter().filter(|id| self.processed.insert(*id)).collect();
        }

        if !self.settled {
            if probe.distance_from_bottom() <= self.config.bottom_proximity_px {
                let since = *self.settle_since.get_or_insert(now);
                if now.saturating_duration_since(since) >= self.config.settle {
                    self.settled = true;
                    decision.mark_all = true;
                }
            } else {
                self.settle_since = None;
            }
        }
        decision
    }

    /// Records `ids` as acknowledged and returns those not processed before.
    /// Claimed ids are dropped from the pending batch.
    pub fn claim(&mut self, ids: impl IntoIterator<Item = MessageId>) -> Vec<MessageId> {
        let claimed: Vec<MessageId> = ids.into_iter().filter(|id| self.processed.insert(*id)).collect();
        self.buffer.retain(|id| !claimed.contains(id));
        claimed
    }

    /// Allows an id whose acknowledgement failed to be submitted again.
    pub fn forget(&mut self, id: MessageId) {
        self.processed.remove(&id);
    }
}
