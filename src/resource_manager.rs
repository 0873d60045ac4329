//! Resource management

use crate::error::EngineError;

use std::sync::Arc;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};

/// [crate::resource_manager::ResourceManager] provides a simple way to allocate resources to
/// tasks in flight. Resource management is performed using a Tokio Semaphore for each type of
/// resource. Permits are owned so that they can travel with a task into a spawned future.
#[derive(Debug)]
pub struct ResourceManager {
    /// Optional semaphore for memory (bytes of partition data).
    memory: Option<Arc<Semaphore>>,

    /// Optional total memory pool in bytes.
    total_memory: Option<usize>,

    /// Optional semaphore for tasks in flight.
    tasks: Option<Arc<Semaphore>>,
}

/// Resources held by one task in flight. Released on drop.
#[derive(Debug)]
pub struct TaskPermits {
    _task: Option<OwnedSemaphorePermit>,
    _memory: Option<OwnedSemaphorePermit>,
}

impl ResourceManager {
    /// Returns a new ResourceManager object.
    pub fn new(memory_limit: Option<usize>, task_limit: Option<usize>) -> Self {
        Self {
            memory: memory_limit.map(|limit| Arc::new(Semaphore::new(limit))),
            total_memory: memory_limit,
            tasks: task_limit.map(|limit| Arc::new(Semaphore::new(limit))),
        }
    }

    /// Acquire memory resource.
    pub async fn memory(
        &self,
        bytes: usize,
    ) -> Result<Option<OwnedSemaphorePermit>, EngineError> {
        if let Some(total_memory) = self.total_memory {
            if bytes > total_memory {
                return Err(EngineError::InsufficientMemory {
                    requested: bytes,
                    total: total_memory,
                });
            };
        };
        optional_acquire(&self.memory, bytes).await
    }

    /// Acquire a task resource.
    pub async fn task(&self) -> Result<Option<OwnedSemaphorePermit>, EngineError> {
        optional_acquire(&self.tasks, 1).await
    }

    /// Acquire the resources for one task processing `bytes` of partition data.
    ///
    /// The task slot is acquired first so that waiting tasks do not hold memory.
    pub async fn task_permits(&self, bytes: usize) -> Result<TaskPermits, EngineError> {
        let task = self.task().await?;
        let memory = self.memory(bytes).await?;
        Ok(TaskPermits {
            _task: task,
            _memory: memory,
        })
    }
}

/// Acquire permits on an optional Semaphore, if present.
async fn optional_acquire(
    sem: &Option<Arc<Semaphore>>,
    n: usize,
) -> Result<Option<OwnedSemaphorePermit>, EngineError> {
    let n = n.try_into()?;
    if let Some(sem) = sem {
        sem.clone()
            .acquire_many_owned(n)
            .await
            .map(Some)
            .map_err(|err| err.into())
    } else {
        Ok(None)
    }
}
