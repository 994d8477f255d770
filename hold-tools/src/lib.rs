//! Runtime building blocks shared by the holdnode crates: caches with
//! cookie-based insertion, broadcastable promises, dedicated I/O worker
//! queues and renewable leases.

pub mod lease;
pub mod lru_cache;
pub mod shared_promise;
pub mod task_queue;
pub mod weight_cache;
