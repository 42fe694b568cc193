use std::collections::HashMap;

use crate::models::{DirectorySnapshot, Group, GroupId, Student, UserId};

/// The tutor's roster and its unread counters.
///
/// Counters change only through [`apply_snapshot`](Self::apply_snapshot) and
/// [`apply_read_receipt`](Self::apply_read_receipt); group counters are always
/// the sum of their members.
#[derive(Debug, Default)]
pub struct DirectoryCache {
    groups: Vec<Group>,
    roster: HashMap<GroupId, Vec<Student>>,
}

impl DirectoryCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn apply_snapshot(&mut self, snapshot: DirectorySnapshot) {
        self.groups = snapshot.groups;
        self.roster = snapshot.roster;
        let ids: Vec<GroupId> = self.groups.iter().map(|g| g.id.clone()).collect();
        for id in ids {
            self.recompute(&id);
        }
    }

    pub fn clear(&mut self) {
        self.groups.clear();
        self.roster.clear();
    }

    pub fn groups(&self) -> &[Group] {
        &self.groups
    }

    pub fn group(&self, id: &str) -> Option<&Group> {
        self.groups.iter().find(|g| g.id == id)
    }

    pub fn students(&self, group_id: &str) -> &[Student] {
        self.roster.get(group_id).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn student(&self, id: UserId) -> Option<&Student> {
        self.roster.values().flatten().find(|s| s.id == id)
    }

    pub fn unread_count(&self, student_id: UserId) -> u32 {
        self.student(student_id).map_or(0, |s| s.unread_count)
    }

    /// Zeroes `student_id`'s counter in every group listing it and returns the
    /// prior count, or `None` if the student is not on the roster.
    pub fn apply_read_receipt(&mut self, student_id: UserId) -> Option<u32> {
        let mut prior = None;
        let mut touched = Vec::new();
        for (group_id, students) in self.roster.iter_mut() {
            for student in students.iter_mut().filter(|s| s.id == student_id) {
                prior = Some(prior.unwrap_or(0).max(student.unread_count));
                student.unread_count = 0;
                touched.push(group_id.clone());
            }
        }
        for group_id in touched {
            self.recompute(&group_id);
        }
        prior
    }

    fn recompute(&mut self, group_id: &str) {
        let total = self.students(group_id).iter().map(|s| s.unread_count).sum();
        if let Some(group) = self.groups.iter_mut().find(|g| g.id == group_id) {
            group.unread_count = total;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn student(id: UserId, unread: u32) -> Student {
        Student { id, full_name: format!("S{id}"), photo: None, hemis_id: None, unread_count: unread }
    }

    fn cache() -> DirectoryCache {
        let mut snapshot = DirectorySnapshot::default();
        snapshot.groups.push(Group { id: "g1".into(), name: "G1".into(), unread_count: 999 });
        snapshot.groups.push(Group { id: "g2".into(), name: "G2".into(), unread_count: 0 });
        snapshot.roster.insert("g1".into(), vec![student(42, 3), student(43, 4)]);
        snapshot.roster.insert("g2".into(), vec![student(50, 1)]);
        let mut cache = DirectoryCache::new();
        cache.apply_snapshot(snapshot);
        cache
    }

    #[test]
    fn snapshot_aggregates_are_member_sums() {
        let cache = cache();
        assert_eq!(cache.group("g1").unwrap().unread_count, 7);
        assert_eq!(cache.group("g2").unwrap().unread_count, 1);
        assert_eq!(cache.students("g1").len(), 2);
        assert!(cache.students("missing").is_empty());
    }

    #[test]
    fn read_receipt_zeroes_student_and_reduces_group_by_prior_count() {
        let mut cache = cache();
        let before = cache.group("g1").unwrap().unread_count;
        assert_eq!(cache.apply_read_receipt(42), Some(3));
        assert_eq!(cache.unread_count(42), 0);
        assert_eq!(cache.group("g1").unwrap().unread_count, before - 3);
        assert_eq!(cache.group("g2").unwrap().unread_count, 1);
    }

    #[test]
    fn read_receipt_for_unknown_student_changes_nothing() {
        let mut cache = cache();
        assert_eq!(cache.apply_read_receipt(7), None);
        assert_eq!(cache.group("g1").unwrap().unread_count, 7);
    }
}
