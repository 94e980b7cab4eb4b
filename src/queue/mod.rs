//! Queue orchestration: scheduling policies, the action coordinator, the
//! service point registry and the change feed that keeps the cache fresh.

pub mod changes;
pub mod coordinator;
pub mod debounce;
#[cfg(test)]
pub mod memory;
pub mod notify;
pub mod policy;
pub mod postgres;
pub mod registry;
pub mod repository;
pub mod store;

pub use coordinator::{CoordinatorOptions, QueueCoordinator};
