use crate::models::Notification;

/// Newest-first notification list fed by the notify channel.
#[derive(Debug, Default)]
pub struct NotificationFeed {
    items: Vec<Notification>,
}

impl NotificationFeed {
    pub fn new() -> Self {
        Self::default()
    }

    /// Prepends `notification`, replacing an older entry with the same id.
    pub fn push(&mut self, notification: Notification) {
        self.items.retain(|n| n.id != notification.id);
        self.items.insert(0, notification);
    }

    pub fn items(&self) -> &[Notification] {
        &self.items
    }

    pub fn unread_count(&self) -> usize {
        self.items.iter().filter(|n| !n.is_read).count()
    }

    pub fn mark_read(&mut self, id: &str) -> bool {
        match self.items.iter_mut().find(|n| n.id == id) {
            Some(n) => {
                n.is_read = true;
                true
            }
            None => false,
        }
    }

    pub fn clear(&mut self) {
        self.items.clear();
    }
}

#[cfg(test)]
mod tests {
    use chrono::Utc;
    use serde_json::json;

    use super::*;

    fn note(id: &str) -> Notification {
        Notification { id: id.into(), user_id: None, payload: json!({}), is_read: false, created_at: Utc::now() }
    }

    #[test]
    fn newest_first_and_unread_count() {
        let mut feed = NotificationFeed::new();
        feed.push(note("a"));
        feed.push(note("b"));
        feed.push(note("a"));
        let ids: Vec<_> = feed.items().iter().map(|n| n.id.as_str()).collect();
        assert_eq!(ids, vec!["a", "b"]);
        assert_eq!(feed.unread_count(), 2);
        assert!(feed.mark_read("b"));
        assert!(!feed.mark_read("zzz"));
        assert_eq!(feed.unread_count(), 1);
        feed.clear();
        assert!(feed.items().is_empty());
    }
}
