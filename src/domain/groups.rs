//! Media groups, group collections and per-session assignments.
//!
//! Mirrors the shape the partitioner works with: every message belongs to
//! exactly one group (real album or synthetic singleton), and every group is
//! assigned whole to exactly one session.

use std::collections::HashMap;

use crate::domain::entities::Message;

/// An indivisible parcel of messages: one platform album, or a synthetic
/// single-message group keyed `single:<message-id>`.
#[derive(Debug, Clone)]
pub struct MessageGroup {
    pub id: String,
    pub messages: Vec<Message>,
    pub estimated_size: u64,
    is_album: bool,
}

impl MessageGroup {
    pub fn album(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            messages: Vec::new(),
            estimated_size: 0,
            is_album: true,
        }
    }

    pub fn singleton(message: Message) -> Self {
        let mut group = Self {
            id: format!("single:{}", message.id),
            messages: Vec::new(),
            estimated_size: 0,
            is_album: false,
        };
        group.push(message);
        group
    }

    pub fn push(&mut self, message: Message) {
        self.estimated_size += message.estimated_size();
        self.messages.push(message);
    }

    /// True for a real platform album (shared group id), false for a
    /// synthetic singleton.
    pub fn is_album(&self) -> bool {
        self.is_album
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    pub fn message_ids(&self) -> Vec<i32> {
        self.messages.iter().map(|m| m.id).collect()
    }
}

/// Output of the grouper: all groups in first-seen order plus aggregate
/// statistics.
#[derive(Debug, Default)]
pub struct GroupCollection {
    pub groups: Vec<MessageGroup>,
}

impl GroupCollection {
    pub fn album_count(&self) -> usize {
        self.groups.iter().filter(|g| g.is_album()).count()
    }

    pub fn singleton_count(&self) -> usize {
        self.groups.iter().filter(|g| !g.is_album()).count()
    }

    pub fn total_messages(&self) -> usize {
        self.groups.iter().map(|g| g.len()).sum()
    }

    pub fn estimated_total_size(&self) -> u64 {
        self.groups.iter().map(|g| g.estimated_size).sum()
    }
}

/// Work parcel for one session: the groups it must download, with running
/// totals maintained as groups are added.
#[derive(Debug, Clone)]
pub struct ClientAssignment {
    pub session: String,
    pub groups: Vec<MessageGroup>,
    pub total_messages: usize,
    pub estimated_size: u64,
}

impl ClientAssignment {
    pub fn new(session: impl Into<String>) -> Self {
        Self {
            session: session.into(),
            groups: Vec::new(),
            total_messages: 0,
            estimated_size: 0,
        }
    }

    pub fn add_group(&mut self, group: MessageGroup) {
        self.total_messages += group.len();
        self.estimated_size += group.estimated_size;
        self.groups.push(group);
    }

    pub fn is_empty(&self) -> bool {
        self.groups.is_empty()
    }
}

/// Result of partitioning a collection across sessions.
#[derive(Debug)]
pub struct Distribution {
    pub assignments: Vec<ClientAssignment>,
}

impl Distribution {
    pub fn total_messages(&self) -> usize {
        self.assignments.iter().map(|a| a.total_messages).sum()
    }

    /// min/max estimated byte load across sessions; 1.0 when the
    /// distribution is empty or carries no bytes at all.
    pub fn balance_ratio(&self) -> f64 {
        let loads: Vec<u64> = self.assignments.iter().map(|a| a.estimated_size).collect();
        let max = loads.iter().copied().max().unwrap_or(0);
        if max == 0 {
            return 1.0;
        }
        let min = loads.iter().copied().min().unwrap_or(0);
        min as f64 / max as f64
    }

    /// Map group-id -> owning session, used by validation and tests.
    pub fn group_owners(&self) -> HashMap<&str, &str> {
        let mut owners = HashMap::new();
        for assignment in &self.assignments {
            for group in &assignment.groups {
                owners.insert(group.id.as_str(), assignment.session.as_str());
            }
        }
        owners
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn text_message(id: i32) -> Message {
        Message {
            id,
            chat_id: 1,
            group_id: None,
            text: Some("t".into()),
            caption: None,
            media: None,
        }
    }

    #[test]
    fn test_singleton_key_and_flag() {
        let group = MessageGroup::singleton(text_message(42));
        assert_eq!(group.id, "single:42");
        assert!(!group.is_album());
        assert_eq!(group.len(), 1);
    }

    #[test]
    fn test_album_accumulates_estimates() {
        let mut group = MessageGroup::album("g1");
        group.push(text_message(1));
        group.push(text_message(2));
        assert_eq!(group.estimated_size, 2 * 1024);
        assert_eq!(group.message_ids(), vec![1, 2]);
    }

    #[test]
    fn test_assignment_totals() {
        let mut assignment = ClientAssignment::new("s1");
        assignment.add_group(MessageGroup::singleton(text_message(1)));
        assignment.add_group(MessageGroup::singleton(text_message(2)));
        assert_eq!(assignment.total_messages, 2);
        assert_eq!(assignment.estimated_size, 2 * 1024);
    }

    #[test]
    fn test_balance_ratio_empty_is_one() {
        let distribution = Distribution { assignments: vec![] };
        assert_eq!(distribution.balance_ratio(), 1.0);
    }
}
