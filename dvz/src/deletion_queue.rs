/// Timeline based deltion queue
///
/// Austin Shafer - 2024
/// Marker for anything the deletion queue can hold. Real teardown
/// (destroying the Vulkan handle) happens in the concrete type's own
/// `Drop` impl; the queue just controls *when* that drop runs.
pub trait Droppable: Send + Sync {}
impl<T: Send + Sync> Droppable for T {}

/// A queue of items to be dropped for a particular timeline point.
struct DQTimelinePointQueue {
    pq_sync_point: u64,
    pq_items: Vec<Box<dyn Droppable + Send + Sync>>,
}

/// A timeline point based deletion queue for Device
///
/// This schedules items to be dropped when a certain timeline
/// point is hit. This timeline point will refer to the Device's
/// graphics timeline.
pub struct DeletionQueue {
    /// The last timeline point that we have already seen
    /// If new items are not newer than this point then they are dropped
    /// immediately instead of being added to any queue.
    dq_last_signaled: u64,
    /// A queue per timeline point
    dq_point_queues: Vec<DQTimelinePointQueue>,
}

impl DeletionQueue {
    /// Creates an empty deletion queue
    pub fn new() -> Self {
        Self {
            dq_last_signaled: 0,
            dq_point_queues: Vec::new(),
        }
    }

    /// Schedule the item to be dropped once the specified timeline
    /// point has passed.
    ///
    /// This does not drop the item immediately, unless the timeline point
    /// is already known to be signaled.
    pub fn schedule_drop_at_point(
        &mut self,
        item: Box<dyn Droppable + Send + Sync>,
        sync_point: u64,
    ) {
        if sync_point <= self.dq_last_signaled {
            return;
        }

        // Add this item to an existing queue, if there is one for this sync point
        if let Some(point_queue) = self
            .dq_point_queues
            .iter_mut()
            .find(|pq| pq.pq_sync_point == sync_point)
        {
            point_queue.pq_items.push(item);
            return;
        }

        // Otherwise create a new queue that contains this item
        self.dq_point_queues.push(DQTimelinePointQueue {
            pq_sync_point: sync_point,
            pq_items: vec![item],
        });
    }

    /// Release all pending items for a timeline point
    ///
    /// This clears all deletion queues for this sync point, including
    /// sync points preceeding this one.
    pub fn drop_all_at_point(&mut self, sync_point: u64) {
        self.dq_last_signaled = sync_point;

        self.dq_point_queues
            .retain(|pq| pq.pq_sync_point <= sync_point);
    }
}

impl Default for DeletionQueue {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    struct DropCounter(Arc<AtomicU32>);
    impl Drop for DropCounter {
        fn drop(&mut self) {
            self.0.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[test]
    fn item_is_not_dropped_before_its_point() {
        let dropped = Arc::new(AtomicU32::new(0));
        let mut dq = DeletionQueue::new();
        dq.schedule_drop_at_point(Box::new(DropCounter(dropped.clone())), 5);

        dq.drop_all_at_point(4);
        assert_eq!(dropped.load(Ordering::SeqCst), 0);

        dq.drop_all_at_point(5);
        assert_eq!(dropped.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn drop_all_at_point_clears_preceding_points_too() {
        let dropped = Arc::new(AtomicU32::new(0));
        let mut dq = DeletionQueue::new();
        dq.schedule_drop_at_point(Box::new(DropCounter(dropped.clone())), 2);
        dq.schedule_drop_at_point(Box::new(DropCounter(dropped.clone())), 3);
        dq.schedule_drop_at_point(Box::new(DropCounter(dropped.clone())), 10);

        dq.drop_all_at_point(3);
        assert_eq!(dropped.load(Ordering::SeqCst), 2, "points <= 3 should be gone");

        dq.drop_all_at_point(10);
        assert_eq!(dropped.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn already_signaled_point_drops_immediately() {
        let dropped = Arc::new(AtomicU32::new(0));
        let mut dq = DeletionQueue::new();
        dq.drop_all_at_point(100);
        dq.schedule_drop_at_point(Box::new(DropCounter(dropped.clone())), 50);
        // `schedule_drop_at_point` returns without queuing a point already
        // passed; the boxed value drops right there in the caller's scope.
        assert_eq!(dropped.load(Ordering::SeqCst), 1);
    }
}
