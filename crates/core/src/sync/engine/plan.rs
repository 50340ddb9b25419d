//! Drain planning: which pending items may run, and in which groups

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use tillsync_domain::{RecordIdentity, SyncQueueItem};

/// Items grouped by record identity.
///
/// Groups are independent and may run concurrently; items inside a group
/// run strictly in order.
#[derive(Debug, Default)]
pub(crate) struct DrainPlan {
    pub groups: Vec<Vec<SyncQueueItem>>,
    /// Pending items held back this run: not yet due, or queued behind an
    /// item that is not yet due or dead-lettered.
    pub deferred: u32,
}

impl DrainPlan {
    pub fn ready(&self) -> usize {
        self.groups.iter().map(Vec::len).sum()
    }
}

/// Build the plan for one drain.
///
/// `pending` may arrive in any order. `failed_since` maps a record identity
/// to the `created_at` of its oldest dead-lettered item; pending items of
/// that record created after it stay blocked until the failure is re-armed.
pub(crate) fn plan_drain(
    mut pending: Vec<SyncQueueItem>,
    failed_since: &HashMap<RecordIdentity, DateTime<Utc>>,
    now: DateTime<Utc>,
) -> DrainPlan {
    pending.sort_by(|a, b| {
        a.created_at.cmp(&b.created_at).then_with(|| a.client_id.cmp(&b.client_id))
    });

    let mut order: Vec<RecordIdentity> = Vec::new();
    let mut by_record: HashMap<RecordIdentity, Vec<SyncQueueItem>> = HashMap::new();
    for item in pending {
        let identity = item.record_identity();
        by_record
            .entry(identity.clone())
            .or_insert_with(|| {
                order.push(identity);
                Vec::new()
            })
            .push(item);
    }

    let mut plan = DrainPlan::default();
    for identity in order {
        let Some(items) = by_record.remove(&identity) else { continue };
        let blocked_after = failed_since.get(&identity);

        let runnable = items
            .iter()
            .take_while(|item| {
                item.is_due(now) && blocked_after.map_or(true, |failed| item.created_at < *failed)
            })
            .count();

        plan.deferred += u32::try_from(items.len() - runnable).unwrap_or(u32::MAX);
        if runnable > 0 {
            let mut items = items;
            items.truncate(runnable);
            plan.groups.push(items);
        }
    }
    plan
}

#[cfg(test)]
mod tests {
    use chrono::Duration;
    use serde_json::json;
    use tillsync_domain::QueueOperation;

    use super::*;

    fn item(id: &str, key: &str, offset: i64, base: DateTime<Utc>) -> SyncQueueItem {
        SyncQueueItem::new(QueueOperation::Update, "products", json!({}), base + Duration::seconds(offset))
            .with_client_id(id)
            .with_record_key(key)
    }

    fn ids(group: &[SyncQueueItem]) -> Vec<&str> {
        group.iter().map(|i| i.client_id.as_str()).collect()
    }

    #[test]
    fn groups_by_record_in_creation_order() {
        let now = Utc::now();
        let pending = vec![item("b2", "B", 3, now), item("a1", "A", 0, now), item("b1", "B", 1, now), item("a2", "A", 2, now)];

        let plan = plan_drain(pending, &HashMap::new(), now + Duration::seconds(10));
        assert_eq!(plan.groups.len(), 2);
        assert_eq!(ids(&plan.groups[0]), vec!["a1", "a2"]);
        assert_eq!(ids(&plan.groups[1]), vec!["b1", "b2"]);
        assert_eq!(plan.deferred, 0);
        assert_eq!(plan.ready(), 4);
    }

    #[test]
    fn not_due_head_blocks_the_rest_of_its_group() {
        let now = Utc::now();
        let mut head = item("a1", "A", 0, now);
        head.next_attempt_at = Some(now + Duration::minutes(5));
        let pending = vec![head, item("a2", "A", 1, now), item("b1", "B", 2, now)];

        let plan = plan_drain(pending, &HashMap::new(), now);
        assert_eq!(plan.groups.len(), 1);
        assert_eq!(ids(&plan.groups[0]), vec!["b1"]);
        assert_eq!(plan.deferred, 2);
    }

    #[test]
    fn dead_lettered_record_blocks_later_items() {
        let now = Utc::now();
        let identity = RecordIdentity { entity: "products".into(), key: "A".into() };
        let failed = HashMap::from([(identity, now + Duration::seconds(1))]);
        let pending = vec![item("a0", "A", 0, now), item("a2", "A", 2, now)];

        let plan = plan_drain(pending, &failed, now + Duration::seconds(10));
        assert_eq!(ids(&plan.groups[0]), vec!["a0"]);
        assert_eq!(plan.deferred, 1);
    }
}
