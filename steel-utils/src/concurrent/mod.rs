//! Concurrency primitives: priorities, task queues, the worker pool,
//! shareable completions and the coordinate-sharded map.

mod completion;
mod priority;
mod sharded_map;
mod task_queue;
mod thread_pool;

pub use completion::{Cancelled, Completer, Completion, completion};
pub use priority::Priority;
pub use sharded_map::ShardedLongMap;
pub use task_queue::{PrioritisedTaskQueue, TaskError, TaskHandle, TaskOutcome};
pub use thread_pool::PrioritisedThreadPool;
