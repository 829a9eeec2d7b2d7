mod common;

use chrono::Utc;
use common::strategies::*;
use proptest::prelude::*;
use std::collections::{HashMap, HashSet};
use tasker_scheduler::models::{Priority, QueueItem, WorkerSlots};
use tasker_scheduler::queue::plan_assignments;
use uuid::Uuid;

fn candidates(priorities: &[i32]) -> Vec<QueueItem> {
    priorities
        .iter()
        .enumerate()
        .map(|(index, priority)| QueueItem {
            id: index as i64 + 1,
            tenant_id: Uuid::nil(),
            queue: "default".to_string(),
            priority: Priority::new(*priority).unwrap(),
            step_run_id: Uuid::new_v4(),
            action_id: "svc:act".to_string(),
            schedule_timeout_at: None,
            step_timeout: None,
            desired_worker_id: None,
            sticky: None,
            queued: true,
        })
        .collect()
}

fn workers(capacities: &[i32]) -> Vec<WorkerSlots> {
    capacities
        .iter()
        .map(|available| WorkerSlots {
            worker_id: Uuid::new_v4(),
            dispatcher_id: Uuid::new_v4(),
            available_slots: *available,
            actions: vec!["svc:act".to_string()],
        })
        .collect()
}

proptest! {
    /// Property: assignments never exceed a worker's free slots and never
    /// assign an entry twice
    #[test]
    fn assignments_respect_capacity(priorities in priorities_strategy(), capacities in capacities_strategy()) {
        let slots = workers(&capacities);
        let capacity: HashMap<Uuid, i32> =
            slots.iter().map(|s| (s.worker_id, s.available_slots)).collect();

        let plan = plan_assignments(candidates(&priorities), slots, Utc::now());

        let mut used: HashMap<Uuid, i32> = HashMap::new();
        for assignment in &plan.commit.assignments {
            *used.entry(assignment.worker_id).or_default() += 1;
        }
        for (worker_id, count) in used {
            prop_assert!(count <= capacity[&worker_id]);
        }

        let ids: HashSet<i64> = plan.commit.assignments.iter().map(|a| a.queue_item_id).collect();
        prop_assert_eq!(ids.len(), plan.commit.assignments.len());

        let total: i32 = capacities.iter().sum();
        prop_assert_eq!(
            plan.commit.assignments.len(),
            priorities.len().min(total as usize)
        );
        prop_assert_eq!(
            plan.commit.assignments.len() + plan.unassigned.len(),
            priorities.len()
        );
    }

    /// Property: no unassigned entry outranks an assigned one
    #[test]
    fn higher_priority_drains_first(priorities in priorities_strategy(), capacities in capacities_strategy()) {
        let items = candidates(&priorities);
        let priority_of: HashMap<i64, (i32, i64)> =
            items.iter().map(|i| (i.id, (i.priority.value(), i.id))).collect();

        let plan = plan_assignments(items, workers(&capacities), Utc::now());

        // Order key: higher priority first, then lower id
        let rank = |id: &i64| {
            let (priority, id) = priority_of[id];
            (-priority, id)
        };
        if let Some(worst_assigned) = plan.commit.assignments.iter().map(|a| rank(&a.queue_item_id)).max() {
            for unassigned in &plan.unassigned {
                prop_assert!(rank(unassigned) > worst_assigned);
            }
        }
    }
}
