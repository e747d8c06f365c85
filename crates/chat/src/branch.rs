use std::collections::{HashMap, HashSet};

use mindcoach_storage::{MessageId, MessageRecord};

/// Index over the live message set. Deleted nodes are never admitted, so
/// every lookup and walk below sees only visible messages.
pub struct MessageTree<'a> {
    by_id: HashMap<MessageId, &'a MessageRecord>,
    children: HashMap<MessageId, Vec<&'a MessageRecord>>,
}

impl<'a> MessageTree<'a> {
    pub fn build(messages: &'a [MessageRecord]) -> Self {
        let mut by_id = HashMap::new();
        let mut children: HashMap<MessageId, Vec<&'a MessageRecord>> = HashMap::new();

        for message in messages.iter().filter(|message| !message.is_deleted) {
            by_id.insert(message.id, message);
            if let Some(parent_id) = message.parent_id {
                children.entry(parent_id).or_default().push(message);
            }
        }

        for siblings in children.values_mut() {
            siblings.sort_by_key(|message| (message.created_at_unix_ms, message.id));
        }

        Self { by_id, children }
    }

    pub fn get(&self, message_id: MessageId) -> Option<&'a MessageRecord> {
        self.by_id.get(&message_id).copied()
    }

    /// Walks parent links upward from `message_id` and returns the path
    /// root-first. A missing or deleted link ends the walk early, so the
    /// result is the longest reachable prefix rather than an error.
    pub fn path_to_root(&self, message_id: MessageId) -> Vec<&'a MessageRecord> {
        let mut path = Vec::new();
        let mut seen = HashSet::new();
        let mut next = Some(message_id);

        while let Some(current_id) = next {
            // A parent cycle would be corrupt data; stop rather than spin.
            if !seen.insert(current_id) {
                break;
            }
            let Some(current) = self.get(current_id) else {
                break;
            };
            path.push(current);
            next = current.parent_id;
        }

        path.reverse();
        path
    }

    /// All descendants of `message_id` in depth-first order, siblings in
    /// chronological order. The starting node itself is not included.
    pub fn subtree(&self, message_id: MessageId) -> Vec<&'a MessageRecord> {
        let mut descendants = Vec::new();
        let mut stack: Vec<&'a MessageRecord> = match self.children.get(&message_id) {
            Some(direct) => direct.iter().rev().copied().collect(),
            None => return descendants,
        };

        while let Some(node) = stack.pop() {
            descendants.push(node);
            if let Some(next) = self.children.get(&node.id) {
                stack.extend(next.iter().rev().copied());
            }
        }

        descendants
    }

    /// The first off-main ancestor of `message_id`, i.e. the node where its
    /// branch forks away from the main line. A message sitting on the main
    /// branch has no branch root. When the upward walk breaks at a missing
    /// parent, the highest reachable node stands in as the root.
    pub fn branch_root_of(&self, message_id: MessageId) -> Option<MessageId> {
        let path = self.path_to_root(message_id);
        let top = path.first()?;

        if top.parent_id.is_some() {
            return Some(top.id);
        }

        path.get(1).map(|root| root.id)
    }

    /// Branch-local part of the cursor's ancestry: the path from the branch
    /// root down to the cursor, excluding any main-branch anchor. A cursor
    /// that itself sits on the main branch anchors the view at that node.
    fn branch_path_ids(&self, cursor: MessageId) -> Vec<MessageId> {
        let Some(node) = self.get(cursor) else {
            return Vec::new();
        };

        if node.parent_id.is_none() {
            return vec![node.id];
        }

        self.path_to_root(cursor)
            .into_iter()
            .filter(|ancestor| ancestor.parent_id.is_some())
            .map(|ancestor| ancestor.id)
            .collect()
    }

    fn descends_into(&self, message: &MessageRecord, targets: &HashSet<MessageId>) -> bool {
        let mut seen = HashSet::new();
        let mut next = message.parent_id;

        while let Some(parent_id) = next {
            if targets.contains(&parent_id) {
                return true;
            }
            if !seen.insert(parent_id) {
                break;
            }
            next = self.get(parent_id).and_then(|parent| parent.parent_id);
        }

        false
    }
}

/// Resolves the messages visible under the given cursor.
///
/// A `None` cursor selects the main branch: every live message without a
/// parent, oldest first. A `Some` cursor selects its branch: the path from
/// the branch root to the cursor plus all descendants of any node on that
/// path. A cursor pointing at a missing or deleted message yields an empty
/// view so the caller can fall back explicitly.
pub fn active_branch_messages(
    messages: &[MessageRecord],
    cursor: Option<MessageId>,
) -> Vec<MessageRecord> {
    let tree = MessageTree::build(messages);

    let mut selected: Vec<&MessageRecord> = match cursor {
        None => messages
            .iter()
            .filter(|message| !message.is_deleted && message.parent_id.is_none())
            .collect(),
        Some(cursor) => {
            let path_ids: HashSet<MessageId> = tree.branch_path_ids(cursor).into_iter().collect();
            if path_ids.is_empty() {
                return Vec::new();
            }

            messages
                .iter()
                .filter(|message| !message.is_deleted)
                .filter(|message| {
                    path_ids.contains(&message.id) || tree.descends_into(message, &path_ids)
                })
                .collect()
        }
    };

    selected.sort_by_key(|message| (message.created_at_unix_ms, message.id));
    selected.into_iter().cloned().collect()
}

#[cfg(test)]
mod tests {
    use mindcoach_storage::MessageRole;

    use super::*;

    fn message(
        content: &str,
        parent_id: Option<MessageId>,
        created_at_unix_ms: i64,
    ) -> MessageRecord {
        MessageRecord {
            id: MessageId::new_v7(),
            role: MessageRole::User,
            content: content.to_string(),
            parent_id,
            created_at_unix_ms,
            is_deleted: false,
        }
    }

    /// a(main) -> b(main), branch under b: c -> d, plus sibling e under c.
    fn sample_tree() -> Vec<MessageRecord> {
        let a = message("a", None, 1);
        let b = message("b", None, 2);
        let c = message("c", Some(b.id), 3);
        let d = message("d", Some(c.id), 4);
        let e = message("e", Some(c.id), 5);
        vec![a, b, c, d, e]
    }

    #[test]
    fn path_to_root_is_root_first() {
        let messages = sample_tree();
        let tree = MessageTree::build(&messages);

        let path = tree.path_to_root(messages[3].id);
        let labels: Vec<&str> = path.iter().map(|m| m.content.as_str()).collect();
        assert_eq!(labels, vec!["b", "c", "d"]);
        assert!(path[0].parent_id.is_none());
    }

    #[test]
    fn path_to_root_stops_at_a_broken_link() {
        let orphan = message("orphan", Some(MessageId::new_v7()), 1);
        let child = message("child", Some(orphan.id), 2);
        let messages = vec![orphan, child];
        let tree = MessageTree::build(&messages);

        let path = tree.path_to_root(messages[1].id);
        let labels: Vec<&str> = path.iter().map(|m| m.content.as_str()).collect();
        assert_eq!(labels, vec!["orphan", "child"]);
    }

    #[test]
    fn path_to_root_skips_deleted_ancestors() {
        let mut messages = sample_tree();
        messages[2].is_deleted = true; // c
        let tree = MessageTree::build(&messages);

        // d's walk ends as soon as it hits the deleted c.
        let path = tree.path_to_root(messages[3].id);
        let labels: Vec<&str> = path.iter().map(|m| m.content.as_str()).collect();
        assert_eq!(labels, vec!["d"]);
    }

    #[test]
    fn subtree_collects_all_descendants_without_the_start_node() {
        let messages = sample_tree();
        let tree = MessageTree::build(&messages);

        let descendants = tree.subtree(messages[1].id); // under b
        let labels: Vec<&str> = descendants.iter().map(|m| m.content.as_str()).collect();
        assert_eq!(labels, vec!["c", "d", "e"]);

        assert!(tree.subtree(messages[3].id).is_empty()); // d is a leaf
    }

    #[test]
    fn subtree_excludes_deleted_nodes() {
        let mut messages = sample_tree();
        messages[3].is_deleted = true; // d
        let tree = MessageTree::build(&messages);

        let descendants = tree.subtree(messages[1].id);
        let labels: Vec<&str> = descendants.iter().map(|m| m.content.as_str()).collect();
        assert_eq!(labels, vec!["c", "e"]);
    }

    #[test]
    fn branch_root_is_the_first_off_main_ancestor() {
        let messages = sample_tree();
        let tree = MessageTree::build(&messages);
        let c = messages[2].id;

        assert_eq!(tree.branch_root_of(messages[3].id), Some(c)); // d
        assert_eq!(tree.branch_root_of(messages[4].id), Some(c)); // e
        assert_eq!(tree.branch_root_of(c), Some(c));
        assert_eq!(tree.branch_root_of(messages[1].id), None); // b is on main
    }

    #[test]
    fn branch_root_of_a_broken_walk_is_the_highest_reachable_node() {
        let orphan = message("orphan", Some(MessageId::new_v7()), 1);
        let child = message("child", Some(orphan.id), 2);
        let messages = vec![orphan, child];
        let tree = MessageTree::build(&messages);

        assert_eq!(tree.branch_root_of(messages[1].id), Some(messages[0].id));
    }

    #[test]
    fn null_cursor_selects_only_main_branch_messages() {
        let messages = sample_tree();

        let main = active_branch_messages(&messages, None);
        let labels: Vec<&str> = main.iter().map(|m| m.content.as_str()).collect();
        assert_eq!(labels, vec!["a", "b"]);
    }

    #[test]
    fn branch_cursor_selects_path_and_descendants_excluding_the_main_anchor() {
        let messages = sample_tree();

        // Cursor on the branch root c: c plus its whole subtree, but not
        // the main-branch node b it forked from.
        let branch = active_branch_messages(&messages, Some(messages[2].id));
        let labels: Vec<&str> = branch.iter().map(|m| m.content.as_str()).collect();
        assert_eq!(labels, vec!["c", "d", "e"]);

        // Cursor deeper in the branch resolves the same view.
        let from_leaf = active_branch_messages(&messages, Some(messages[3].id));
        let leaf_labels: Vec<&str> = from_leaf.iter().map(|m| m.content.as_str()).collect();
        assert_eq!(leaf_labels, vec!["c", "d", "e"]);
    }

    #[test]
    fn cursor_on_a_main_message_anchors_the_view_at_that_node() {
        let messages = sample_tree();

        let view = active_branch_messages(&messages, Some(messages[1].id));
        let labels: Vec<&str> = view.iter().map(|m| m.content.as_str()).collect();
        assert_eq!(labels, vec!["b", "c", "d", "e"]);
    }

    #[test]
    fn missing_or_deleted_cursor_yields_an_empty_view() {
        let mut messages = sample_tree();

        assert!(active_branch_messages(&messages, Some(MessageId::new_v7())).is_empty());

        messages[2].is_deleted = true;
        let cursor = messages[2].id;
        assert!(active_branch_messages(&messages, Some(cursor)).is_empty());
    }

    #[test]
    fn deleted_messages_never_appear_in_any_view() {
        let mut messages = sample_tree();
        messages[4].is_deleted = true; // e

        let branch = active_branch_messages(&messages, Some(messages[2].id));
        let labels: Vec<&str> = branch.iter().map(|m| m.content.as_str()).collect();
        assert_eq!(labels, vec!["c", "d"]);
    }
}
