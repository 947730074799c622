use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard};

use dashmap::DashMap;
use tracing::warn;
use uuid::Uuid;

use crate::events::DispatchEvent;

/// Per-driver delivery cursor.
///
/// Each successful commit produces one batch tagged with the driver version
/// it created. Batches are released strictly in version order, so events for
/// one driver reach subscribers in commit order even when the committing
/// threads race to publish. Whichever thread finds the lane idle drains it;
/// everyone else (including a handler publishing re-entrantly) just parks
/// its batch and returns.
#[derive(Debug)]
struct Lane {
    next_version: u64,
    pending: BTreeMap<u64, Vec<DispatchEvent>>,
    draining: bool,
}

#[derive(Debug, Default)]
pub(crate) struct Lanes {
    lanes: DashMap<Uuid, Arc<Mutex<Lane>>>,
}

impl Lanes {
    /// Starts tracking a driver whose stored version is `loaded_version`.
    /// Must run before the first commit on top of that version; later calls
    /// are no-ops.
    pub(crate) fn open(&self, driver_id: Uuid, loaded_version: u64) {
        self.lanes.entry(driver_id).or_insert_with(|| {
            Arc::new(Mutex::new(Lane {
                next_version: loaded_version + 1,
                pending: BTreeMap::new(),
                draining: false,
            }))
        });
    }

    pub(crate) fn submit<F>(&self, driver_id: Uuid, version: u64, batch: Vec<DispatchEvent>, mut deliver: F)
    where
        F: FnMut(&DispatchEvent),
    {
        // Clone the handle out so no map guard is held while handlers run.
        let Some(lane) = self.lanes.get(&driver_id).map(|entry| Arc::clone(entry.value())) else {
            warn!(driver_id = %driver_id, version, "publishing on an unopened lane");
            batch.iter().for_each(&mut deliver);
            return;
        };

        {
            let mut state = lock(&lane);
            if version < state.next_version {
                warn!(
                    driver_id = %driver_id,
                    version,
                    next_version = state.next_version,
                    "batch older than lane cursor; delivering immediately"
                );
                drop(state);
                batch.iter().for_each(&mut deliver);
                return;
            }
            state.pending.insert(version, batch);
            if state.draining {
                return;
            }
            state.draining = true;
        }

        loop {
            let ready = {
                let mut state = lock(&lane);
                let next = state.next_version;
                match state.pending.remove(&next) {
                    Some(ready) => {
                        state.next_version += 1;
                        ready
                    }
                    None => {
                        state.draining = false;
                        break;
                    }
                }
            };
            ready.iter().for_each(&mut deliver);
        }
    }
}

fn lock(lane: &Mutex<Lane>) -> MutexGuard<'_, Lane> {
    lane.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

#[cfg(test)]
mod tests {
    use chrono::Utc;
    use uuid::Uuid;

    use super::Lanes;
    use crate::events::DispatchEvent;

    fn marker(driver_id: Uuid, completed_today: u32) -> DispatchEvent {
        DispatchEvent::DeliveryCompleted {
            driver_id,
            order_id: Uuid::new_v4(),
            delivered_at: Utc::now(),
            completed_today,
            consecutive_deliveries: completed_today,
            gap_from_target: 0,
            on_time: true,
        }
    }

    fn completed(event: &DispatchEvent) -> u32 {
        match event {
            DispatchEvent::DeliveryCompleted {
                completed_today, ..
            } => *completed_today,
            _ => unreachable!(),
        }
    }

    #[test]
    fn out_of_order_batches_are_held_until_the_gap_closes() {
        let lanes = Lanes::default();
        let driver_id = Uuid::new_v4();
        lanes.open(driver_id, 0);

        let mut seen = Vec::new();
        lanes.submit(driver_id, 2, vec![marker(driver_id, 2)], |e| seen.push(completed(e)));
        assert!(seen.is_empty());

        lanes.submit(driver_id, 1, vec![marker(driver_id, 1)], |e| seen.push(completed(e)));
        assert_eq!(seen, vec![1, 2]);
    }

    #[test]
    fn empty_batches_advance_the_cursor() {
        let lanes = Lanes::default();
        let driver_id = Uuid::new_v4();
        lanes.open(driver_id, 4);

        let mut seen = Vec::new();
        lanes.submit(driver_id, 6, vec![marker(driver_id, 6)], |e| seen.push(completed(e)));
        lanes.submit(driver_id, 5, Vec::new(), |e| seen.push(completed(e)));
        assert_eq!(seen, vec![6]);
    }

    #[test]
    fn reopening_keeps_the_original_cursor() {
        let lanes = Lanes::default();
        let driver_id = Uuid::new_v4();
        lanes.open(driver_id, 0);
        lanes.open(driver_id, 7);

        let mut seen = Vec::new();
        lanes.submit(driver_id, 1, vec![marker(driver_id, 1)], |e| seen.push(completed(e)));
        assert_eq!(seen, vec![1]);
    }
}
