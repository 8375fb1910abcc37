//! Assigns media groups to sessions: group-atomic, byte-balanced greedy.
//!
//! Largest-first greedy over estimated sizes gets near-optimal balance on
//! these distributions; the imbalance ratio is reported but never fails a
//! run. Validation failures, in contrast, are internal bugs and abort.

use tracing::{info, warn};

use crate::domain::{ClientAssignment, Distribution, DomainError, GroupCollection};

#[derive(Debug, Clone)]
pub struct DistributionSettings {
    /// Sort groups by estimated size descending before assigning.
    pub largest_first: bool,
    /// Advisory cap: warn when min/max load drops below `1 - ratio`.
    pub max_imbalance_ratio: f64,
}

impl Default for DistributionSettings {
    fn default() -> Self {
        Self { largest_first: true, max_imbalance_ratio: 0.3 }
    }
}

/// Assign every group to exactly one session. Each group goes whole to the
/// session with the smallest running byte total; ties break on pool order.
pub fn distribute(
    collection: GroupCollection,
    session_names: &[String],
    settings: &DistributionSettings,
) -> Result<Distribution, DomainError> {
    if session_names.is_empty() {
        return Err(DomainError::Validation("no sessions to distribute to".into()));
    }
    {
        let mut seen = std::collections::HashSet::new();
        if !session_names.iter().all(|n| seen.insert(n.as_str())) {
            return Err(DomainError::Validation("duplicate session names".into()));
        }
    }

    let input_messages = collection.total_messages();
    let input_groups = collection.groups.len();

    let mut groups = collection.groups;
    if settings.largest_first {
        // Stable sort keeps the grouper's first-seen order among equals, so
        // re-partitioning the same input reproduces the same assignment.
        groups.sort_by(|a, b| b.estimated_size.cmp(&a.estimated_size));
    }

    let mut assignments: Vec<ClientAssignment> =
        session_names.iter().map(ClientAssignment::new).collect();

    for group in groups {
        let target = assignments
            .iter()
            .enumerate()
            .min_by_key(|(index, a)| (a.estimated_size, *index))
            .map(|(index, _)| index)
            .expect("at least one assignment");
        assignments[target].add_group(group);
    }

    let distribution = Distribution { assignments };
    validate(&distribution, input_messages, input_groups, session_names.len())?;

    let ratio = distribution.balance_ratio();
    if ratio < 1.0 - settings.max_imbalance_ratio {
        warn!(
            balance_ratio = format!("{ratio:.2}"),
            "byte load imbalance exceeds the configured cap (advisory)"
        );
    }
    info!(
        sessions = distribution.assignments.len(),
        groups = input_groups,
        messages = input_messages,
        balance_ratio = format!("{ratio:.2}"),
        "workload distributed"
    );
    Ok(distribution)
}

fn validate(
    distribution: &Distribution,
    input_messages: usize,
    input_groups: usize,
    session_count: usize,
) -> Result<(), DomainError> {
    let distributed = distribution.total_messages();
    if distributed != input_messages {
        return Err(DomainError::Validation(format!(
            "distributed {distributed} messages, input had {input_messages}"
        )));
    }

    let owners = distribution.group_owners();
    if owners.len() != input_groups {
        return Err(DomainError::Validation(format!(
            "{} distinct groups assigned, input had {input_groups}",
            owners.len()
        )));
    }

    if input_groups >= session_count {
        let empty: Vec<&str> = distribution
            .assignments
            .iter()
            .filter(|a| a.is_empty())
            .map(|a| a.session.as_str())
            .collect();
        if !empty.is_empty() {
            return Err(DomainError::Validation(format!(
                "sessions left without work despite enough groups: {empty:?}"
            )));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{MediaDescriptor, MediaKind, MediaMeta, Message, MessageGroup};
    use crate::usecases::grouper::group_messages;

    fn sized_message(id: i32, group_id: Option<&str>, size: u64) -> Message {
        Message {
            id,
            chat_id: 1,
            group_id: group_id.map(String::from),
            text: None,
            caption: None,
            media: Some(MediaDescriptor {
                kind: MediaKind::Document,
                file_size: Some(size),
                mime_type: None,
                file_name: None,
                meta: MediaMeta::default(),
                location: None,
            }),
        }
    }

    fn sessions(names: &[&str]) -> Vec<String> {
        names.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_every_group_lands_once() {
        let collection = group_messages(vec![
            sized_message(1, Some("a"), 10),
            sized_message(2, Some("a"), 10),
            sized_message(3, Some("b"), 30),
            sized_message(4, None, 5),
        ]);
        let distribution =
            distribute(collection, &sessions(&["s1", "s2"]), &DistributionSettings::default())
                .unwrap();
        let owners = distribution.group_owners();
        assert_eq!(owners.len(), 3);
        assert!(owners.contains_key("a"));
        assert!(owners.contains_key("b"));
        assert!(owners.contains_key("single:4"));
        assert_eq!(distribution.total_messages(), 4);
    }

    #[test]
    fn test_single_session_takes_everything() {
        let messages: Vec<Message> = (0..100)
            .map(|i| sized_message(i, Some(&format!("g{}", i / 10)), 100))
            .collect();
        let collection = group_messages(messages);
        let distribution =
            distribute(collection, &sessions(&["only"]), &DistributionSettings::default()).unwrap();
        assert_eq!(distribution.assignments.len(), 1);
        assert_eq!(distribution.assignments[0].groups.len(), 10);
        assert_eq!(distribution.assignments[0].total_messages, 100);
    }

    #[test]
    fn test_three_singletons_three_sessions() {
        let collection = group_messages(vec![
            sized_message(1, None, 10),
            sized_message(2, None, 10),
            sized_message(3, None, 10),
        ]);
        let distribution = distribute(
            collection,
            &sessions(&["s1", "s2", "s3"]),
            &DistributionSettings::default(),
        )
        .unwrap();
        assert!(distribution.assignments.iter().all(|a| a.total_messages == 1));
    }

    #[test]
    fn test_one_album_three_sessions_leaves_two_empty() {
        let messages: Vec<Message> =
            (1..=10).map(|i| sized_message(i, Some("g"), 100)).collect();
        let collection = group_messages(messages);
        let distribution = distribute(
            collection,
            &sessions(&["s1", "s2", "s3"]),
            &DistributionSettings::default(),
        )
        .unwrap();
        let non_empty: Vec<_> =
            distribution.assignments.iter().filter(|a| !a.is_empty()).collect();
        assert_eq!(non_empty.len(), 1);
        assert_eq!(non_empty[0].total_messages, 10);
    }

    #[test]
    fn test_largest_first_balances_byte_load() {
        // Sizes 8,7,3,2,1,1: largest-first greedy over two bins gives 11/11.
        let collection = group_messages(vec![
            sized_message(1, None, 8),
            sized_message(2, None, 7),
            sized_message(3, None, 3),
            sized_message(4, None, 2),
            sized_message(5, None, 1),
            sized_message(6, None, 1),
        ]);
        let distribution =
            distribute(collection, &sessions(&["s1", "s2"]), &DistributionSettings::default())
                .unwrap();
        assert_eq!(distribution.balance_ratio(), 1.0);
    }

    #[test]
    fn test_deterministic_reassignment() {
        let build = || {
            group_messages(vec![
                sized_message(1, Some("a"), 50),
                sized_message(2, Some("a"), 50),
                sized_message(3, Some("b"), 100),
                sized_message(4, None, 30),
                sized_message(5, None, 30),
            ])
        };
        let names = sessions(&["s1", "s2", "s3"]);
        let first = distribute(build(), &names, &DistributionSettings::default()).unwrap();
        let second = distribute(build(), &names, &DistributionSettings::default()).unwrap();
        let first_owners: std::collections::HashMap<String, String> = first
            .group_owners()
            .into_iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        let second_owners: std::collections::HashMap<String, String> = second
            .group_owners()
            .into_iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        assert_eq!(first_owners, second_owners);
    }

    #[test]
    fn test_empty_collection_distributes_empty() {
        let distribution = distribute(
            GroupCollection::default(),
            &sessions(&["s1", "s2"]),
            &DistributionSettings::default(),
        )
        .unwrap();
        assert_eq!(distribution.total_messages(), 0);
        assert!(distribution.assignments.iter().all(|a| a.is_empty()));
    }

    #[test]
    fn test_no_sessions_is_an_error() {
        let result =
            distribute(GroupCollection::default(), &[], &DistributionSettings::default());
        assert!(matches!(result, Err(DomainError::Validation(_))));
    }

    #[test]
    fn test_album_never_splits() {
        let mut big = MessageGroup::album("big");
        for i in 1..=10 {
            big.push(sized_message(i, Some("big"), 1000));
        }
        let mut collection = GroupCollection::default();
        collection.groups.push(big);
        for i in 11..=16 {
            collection.groups.push(MessageGroup::singleton(sized_message(i, None, 10)));
        }
        let distribution =
            distribute(collection, &sessions(&["s1", "s2"]), &DistributionSettings::default())
                .unwrap();
        let owners = distribution.group_owners();
        let owner = owners["big"];
        let assignment = distribution
            .assignments
            .iter()
            .find(|a| a.session == owner)
            .unwrap();
        let album = assignment.groups.iter().find(|g| g.id == "big").unwrap();
        assert_eq!(album.len(), 10);
    }
}
