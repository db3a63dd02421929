//! Repository functions — one function per database operation.
//!
//! Every function takes a `&DbPool` and returns a `Result<T, StoreError>`.
//! No dispatch logic, no live `DispatcherPayload` handling — pure SQL; see
//! [`crate::PgFlowStore`] for the typed wrapper that does.

pub mod flow_instances;
