//! Durable, self-rescheduling recurring tasks.

pub mod handlers;
pub mod scheduler;
pub mod task_store;
