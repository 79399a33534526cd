//! Worker-pool abstraction the manager uses to run cleaner workers.
//! Three interchangeable implementations; `CleanerManager`
//! is generic over `ThreadPool` the same way the rest of this crate's
//! collaborators are generic over traits rather than concrete types.

use crate::error::Result;

mod naive_tp;
mod rayon_tp;
mod sharedq_tp;
pub use naive_tp::NaiveThreadPool;
pub use rayon_tp::RayonThreadPool;
pub use sharedq_tp::SharedQueueThreadPool;

pub trait ThreadPool {
    fn new(num_threads: u32) -> Result<Self>
    where
        Self: Sized;
    fn spawn<F>(&self, job: F)
    where
        F: FnOnce() + Send + 'static;
}
