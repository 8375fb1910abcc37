//! Groups a flat message list into albums and synthetic singletons.

use std::collections::HashMap;

use tracing::info;

use crate::domain::{GroupCollection, Message, MessageGroup};

/// Single linear pass: messages sharing a group id are appended to that
/// album (created on first encounter, first-seen order preserved); everything
/// else becomes a `single:<message-id>` group.
pub fn group_messages(messages: Vec<Message>) -> GroupCollection {
    let mut collection = GroupCollection::default();
    let mut album_index: HashMap<String, usize> = HashMap::new();

    for message in messages {
        match message.group_id.clone() {
            Some(group_id) => {
                let index = *album_index.entry(group_id.clone()).or_insert_with(|| {
                    collection.groups.push(MessageGroup::album(group_id));
                    collection.groups.len() - 1
                });
                collection.groups[index].push(message);
            }
            None => collection.groups.push(MessageGroup::singleton(message)),
        }
    }

    info!(
        albums = collection.album_count(),
        singletons = collection.singleton_count(),
        messages = collection.total_messages(),
        estimated_bytes = collection.estimated_total_size(),
        "message grouping complete"
    );
    collection
}
