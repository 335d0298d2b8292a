//! Resource management

use crate::error::ApiError;

use std::sync::Arc;
use tokio::sync::{OwnedSemaphorePermit, Semaphore, SemaphorePermit};

/// [crate::resource_manager::ResourceManager] provides a simple way to allocate various resources
/// to tasks. Resource management is performed using a Tokio Semaphore for each type of resource.
#[derive(Debug)]
pub struct ResourceManager {
    /// Optional semaphore for requests blocked waiting on a queued task.
    blocking_slots: Option<Semaphore>,

    /// Optional semaphore for tasks executed by a worker.
    tasks: Option<Arc<Semaphore>>,

    /// Optional total number of task permits.
    task_limit: Option<usize>,
}

impl ResourceManager {
    /// Returns a new ResourceManager object.
    pub fn new(blocking_slot_limit: Option<usize>, task_limit: Option<usize>) -> Self {
        Self {
            blocking_slots: blocking_slot_limit.map(Semaphore::new),
            tasks: task_limit.map(|limit| Arc::new(Semaphore::new(limit))),
            task_limit,
        }
    }

    /// Acquire a slot for a request that blocks until its queued task finishes.
    pub async fn blocking_slot(&self) -> Result<Option<SemaphorePermit>, ApiError> {
        optional_acquire(&self.blocking_slots, 1).await
    }

    /// Acquire a task resource.
    ///
    /// The permit is owned so that it can move into the spawned task.
    pub async fn task(&self) -> Result<Option<OwnedSemaphorePermit>, ApiError> {
        if let Some(tasks) = &self.tasks {
            Ok(Some(tasks.clone().acquire_owned().await?))
        } else {
            Ok(None)
        }
    }

    /// Wait until every task permit has been returned.
    pub async fn drain_tasks(&self) -> Result<(), ApiError> {
        if let (Some(tasks), Some(limit)) = (&self.tasks, self.task_limit) {
            let _all = tasks.acquire_many(u32::try_from(limit).unwrap_or(u32::MAX)).await?;
        }
        Ok(())
    }
}

/// Acquire permits on an optional Semaphore, if present.
async fn optional_acquire(
    sem: &Option<Semaphore>,
    n: u32,
) -> Result<Option<SemaphorePermit>, ApiError> {
    if let Some(sem) = sem {
        sem.acquire_many(n)
            .await
            .map(Some)
            .map_err(|err| err.into())
    } else {
        Ok(None)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::time::Duration;
    use tokio::sync::TryAcquireError;

    #[tokio::test]
    async fn no_resource_management() {
        let rm = ResourceManager::new(None, None);
        assert!(rm.blocking_slots.is_none());
        assert!(rm.tasks.is_none());
        let _b = rm.blocking_slot().await.unwrap();
        let _t = rm.task().await.unwrap();
        assert!(_b.is_none());
        assert!(_t.is_none());
        rm.drain_tasks().await.unwrap();
    }

    #[tokio::test]
    async fn full_resource_management() {
        let rm = ResourceManager::new(Some(1), Some(1));
        assert!(rm.blocking_slots.is_some());
        assert!(rm.tasks.is_some());
        let _b = rm.blocking_slot().await.unwrap();
        let _t = rm.task().await.unwrap();
        assert!(_b.is_some());
        assert!(_t.is_some());
        // Check that there are no more resources (without blocking).
        assert_eq!(
            rm.blocking_slots.as_ref().unwrap().try_acquire().err(),
            Some(TryAcquireError::NoPermits)
        );
        assert_eq!(
            rm.tasks.as_ref().unwrap().try_acquire().err(),
            Some(TryAcquireError::NoPermits)
        );
    }

    #[tokio::test(start_paused = true)]
    async fn drain_waits_for_tasks() {
        let rm = Arc::new(ResourceManager::new(None, Some(2)));
        let permit = rm.task().await.unwrap();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(3)).await;
            drop(permit);
        });
        let start = tokio::time::Instant::now();
        rm.drain_tasks().await.unwrap();
        assert!(start.elapsed() >= Duration::from_secs(3));
    }
}
