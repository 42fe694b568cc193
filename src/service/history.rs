use std::sync::atomic::{AtomicU64, Ordering};

use tracing::debug;

use crate::api::ChatApi;
use crate::errors::SyncError;
use crate::models::{MessageRecord, UserId};

/// Identifies one history request. Only the latest ticket is current.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HistoryTicket {
    generation: u64,
    pub key: UserId,
}

/// One-shot backlog fetches whose results are dropped once the selection moves on.
#[derive(Debug, Default)]
pub struct HistoryLoader {
    generation: AtomicU64,
}

impl HistoryLoader {
    pub fn new() -> Self {
        Self::default()
    }

    /// Starts a new load for `key`, superseding every earlier ticket.
    pub fn begin(&self, key: UserId) -> HistoryTicket {
        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        HistoryTicket { generation, key }
    }

    /// Supersedes all outstanding tickets without starting a new load.
    pub fn invalidate(&self) {
        self.generation.fetch_add(1, Ordering::SeqCst);
    }

    pub fn is_current(&self, ticket: &HistoryTicket) -> bool {
        self.generation.load(Ordering::SeqCst) == ticket.generation
    }

    /// Fetches the backlog. `Ok(None)` means the ticket went stale meanwhile.
    pub async fn load(
        &self,
        api: &dyn ChatApi,
        ticket: &HistoryTicket,
    ) -> Result<Option<Vec<MessageRecord>>, SyncError> {
        let records = api.fetch_dialog(ticket.key).await?;
        if !self.is_current(ticket) {
            debug!(key = ticket.key, "dropping stale history response");
            return Ok(None);
        }
        Ok(Some(records))
    }
}
