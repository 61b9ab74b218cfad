use chrono::{DateTime, Utc};
use fleet_domain::{Task, TaskId, TaskStatus};
use std::collections::BTreeSet;

/// In-memory priority index over READY tasks, keyed by (priority desc,
/// created-at asc). The TaskRepository stays authoritative; the queue is
/// recomputed from it on startup and maintained on each status transition.
#[derive(Debug, Default)]
pub struct TaskQueue {
    entries: BTreeSet<QueueKey>,
}

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
struct QueueKey {
    neg_priority: i64,
    created_at: DateTime<Utc>,
    task_id: TaskId,
}

impl QueueKey {
    fn for_task(task: &Task) -> Self {
        Self {
            neg_priority: -(task.priority as i64),
            created_at: task.created_at,
            task_id: task.id,
        }
    }
}

impl TaskQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn rebuild(&mut self, tasks: &[Task]) {
        self.entries.clear();
        for task in tasks.iter().filter(|t| t.status == TaskStatus::Ready) {
            self.entries.insert(QueueKey::for_task(task));
        }
    }

    pub fn push(&mut self, task: &Task) {
        self.entries.insert(QueueKey::for_task(task));
    }

    pub fn remove(&mut self, task: &Task) {
        self.entries.remove(&QueueKey::for_task(task));
    }

    pub fn pop(&mut self) -> Option<TaskId> {
        let first = self.entries.iter().next().cloned()?;
        self.entries.remove(&first);
        Some(first.task_id)
    }

    /// Snapshot of the queue in assignment order; the queue is unchanged.
    pub fn ordered_ids(&self) -> Vec<TaskId> {
        self.entries.iter().map(|k| k.task_id).collect()
    }

    pub fn contains(&self, task: &Task) -> bool {
        self.entries.contains(&QueueKey::for_task(task))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use fleet_domain::test_fixtures::{task, test_epoch};
    use fleet_domain::{PlayerId, TaskType};

    #[test]
    fn pops_by_priority_desc_then_created_at_asc() {
        let mut queue = TaskQueue::new();

        let mut low_old = task(TaskType::CollectSell, "IRON", PlayerId(1));
        low_old.status = TaskStatus::Ready;
        low_old.priority = 1;

        let mut high = task(TaskType::CollectSell, "COPPER", PlayerId(1));
        high.status = TaskStatus::Ready;
        high.priority = 10;
        high.created_at = test_epoch() + chrono::Duration::seconds(30);

        let mut low_new = task(TaskType::CollectSell, "GOLD", PlayerId(1));
        low_new.status = TaskStatus::Ready;
        low_new.priority = 1;
        low_new.created_at = test_epoch() + chrono::Duration::seconds(60);

        queue.rebuild(&[low_new.clone(), high.clone(), low_old.clone()]);

        assert_eq!(queue.pop(), Some(high.id));
        assert_eq!(queue.pop(), Some(low_old.id));
        assert_eq!(queue.pop(), Some(low_new.id));
        assert_eq!(queue.pop(), None);
    }

    #[test]
    fn rebuild_only_indexes_ready_tasks() {
        let mut queue = TaskQueue::new();
        let mut ready = task(TaskType::CollectSell, "IRON", PlayerId(1));
        ready.status = TaskStatus::Ready;
        let pending = task(TaskType::CollectSell, "COPPER", PlayerId(1));

        queue.rebuild(&[ready.clone(), pending.clone()]);
        assert_eq!(queue.len(), 1);
        assert!(queue.contains(&ready));
        assert!(!queue.contains(&pending));
    }

    #[test]
    fn remove_is_stable_under_double_remove() {
        let mut queue = TaskQueue::new();
        let mut ready = task(TaskType::CollectSell, "IRON", PlayerId(1));
        ready.status = TaskStatus::Ready;
        queue.push(&ready);
        queue.remove(&ready);
        queue.remove(&ready);
        assert!(queue.is_empty());
    }
}
