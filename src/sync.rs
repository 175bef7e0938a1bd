//! The synchronization engine: fetch, push, and the per-remote push
//! state cache driving the commit walks.

mod fetch;
mod push;
mod push_state;

pub use fetch::{fetch, FetchOptions, FetchStats};
pub use push::{push, PushOptions, PushStats};
pub use push_state::PushStateCache;
