//! Message batch selection for a turn.
//!
//! A batch is up to [`MAX_BATCH_SIZE`] messages sharing one `task_id`
//! (and one sender when the task id is null). The anchor is the
//! default human's earliest message when present, else the oldest
//! message overall. Per-sender FIFO is preserved: a sender is eligible
//! only if their earliest unprocessed message matches the selected
//! target, so a later message from a sender can never jump an earlier
//! one.

use std::collections::HashMap;

use delegate_core::types::Message;

/// Upper bound on messages consumed by one turn.
pub const MAX_BATCH_SIZE: usize = 5;

/// Select the batch from an inbox sorted oldest-first.
pub fn select_batch(
    inbox: &[Message],
    max_size: usize,
    human_name: Option<&str>,
) -> Vec<Message> {
    let Some(first) = inbox.first() else {
        return Vec::new();
    };

    // Anchor: the human's earliest message gets priority.
    let anchor = human_name
        .and_then(|human| inbox.iter().find(|m| m.sender == human))
        .unwrap_or(first);

    let target_task_id = anchor.task_id;
    let target_sender = if target_task_id.is_none() {
        Some(anchor.sender.as_str())
    } else {
        None
    };

    // A sender is eligible only when their earliest message matches
    // the target; otherwise taking a later message would reorder them.
    let mut earliest_by_sender: HashMap<&str, &Message> = HashMap::new();
    for msg in inbox {
        earliest_by_sender.entry(msg.sender.as_str()).or_insert(msg);
    }
    let eligible: Vec<&str> = earliest_by_sender
        .iter()
        .filter(|(sender, first_msg)| {
            first_msg.task_id == target_task_id
                && target_sender.map(|t| t == **sender).unwrap_or(true)
        })
        .map(|(sender, _)| *sender)
        .collect();

    let mut batch = Vec::new();
    for msg in inbox {
        if !eligible.contains(&msg.sender.as_str()) {
            continue;
        }
        if msg.task_id != target_task_id {
            continue;
        }
        if let Some(target) = target_sender {
            if msg.sender != target {
                continue;
            }
        }
        batch.push(msg.clone());
        if batch.len() >= max_size {
            break;
        }
    }
    batch
}

#[cfg(test)]
mod tests {
    use super::*;
    use delegate_core::types::MessageType;

    fn msg(id: i64, sender: &str, task_id: Option<i64>) -> Message {
        Message {
            id,
            timestamp: format!("2026-01-01T00:00:{id:02}Z"),
            sender: sender.to_string(),
            recipient: "alice".to_string(),
            content: format!("m{id}"),
            msg_type: MessageType::Chat,
            task_id,
            delivered_at: None,
            seen_at: None,
            processed_at: None,
            result: None,
            team: "alpha".to_string(),
            team_uuid: String::new(),
            sender_uuid: String::new(),
            recipient_uuid: String::new(),
        }
    }

    fn ids(batch: &[Message]) -> Vec<i64> {
        batch.iter().map(|m| m.id).collect()
    }

    #[test]
    fn test_empty_inbox() {
        assert!(select_batch(&[], MAX_BATCH_SIZE, None).is_empty());
    }

    #[test]
    fn test_same_task_batched_across_senders() {
        let inbox = vec![
            msg(1, "bob", Some(7)),
            msg(2, "carol", Some(7)),
            msg(3, "bob", Some(7)),
        ];
        let batch = select_batch(&inbox, MAX_BATCH_SIZE, None);
        assert_eq!(ids(&batch), vec![1, 2, 3]);
    }

    #[test]
    fn test_null_task_restricted_to_anchor_sender() {
        let inbox = vec![
            msg(1, "bob", None),
            msg(2, "carol", None),
            msg(3, "bob", None),
        ];
        let batch = select_batch(&inbox, MAX_BATCH_SIZE, None);
        // Carol's chatter stays out of Bob's batch.
        assert_eq!(ids(&batch), vec![1, 3]);
    }

    #[test]
    fn test_mixed_tasks_scenario() {
        // m1 from Bob (no task), m2 from Bob (task 1), m3 from Carol
        // (task 1). Anchor is m1: target (None, bob). Carol's earliest
        // is for task 1 -> ineligible; Bob's m2 is for task 1 ->
        // filtered. Batch is m1 alone.
        let inbox = vec![
            msg(1, "bob", None),
            msg(2, "bob", Some(1)),
            msg(3, "carol", Some(1)),
        ];
        let batch = select_batch(&inbox, MAX_BATCH_SIZE, None);
        assert_eq!(ids(&batch), vec![1]);
    }

    #[test]
    fn test_per_sender_fifo_never_reordered() {
        // Alice's oldest message targets task 1; the anchor targets
        // task 2. Taking alice's later task-2 message would skip her
        // task-1 message, so she is excluded entirely.
        let inbox = vec![
            msg(1, "bob", Some(2)),
            msg(2, "ann", Some(1)),
            msg(3, "ann", Some(2)),
        ];
        let batch = select_batch(&inbox, MAX_BATCH_SIZE, None);
        assert_eq!(ids(&batch), vec![1]);
    }

    #[test]
    fn test_human_anchor_priority() {
        let inbox = vec![
            msg(1, "bob", Some(4)),
            msg(2, "dana", Some(9)),
            msg(3, "bob", Some(9)),
        ];
        // Without a human hint, the batch follows m1 (task 4).
        let batch = select_batch(&inbox, MAX_BATCH_SIZE, None);
        assert_eq!(ids(&batch), vec![1]);

        // With dana as default human, her earliest message anchors the
        // batch; bob is ineligible (his earliest is for task 4).
        let batch = select_batch(&inbox, MAX_BATCH_SIZE, Some("dana"));
        assert_eq!(ids(&batch), vec![2]);
    }

    #[test]
    fn test_batch_capped() {
        let inbox: Vec<Message> = (1..=8).map(|i| msg(i, "bob", Some(1))).collect();
        let batch = select_batch(&inbox, MAX_BATCH_SIZE, None);
        assert_eq!(batch.len(), MAX_BATCH_SIZE);
        assert_eq!(ids(&batch), vec![1, 2, 3, 4, 5]);
    }
}
