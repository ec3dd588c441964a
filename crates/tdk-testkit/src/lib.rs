//! Offline, deterministic test harness for the sync core.
//!
//! Provides a scriptable in-memory channel (the fake server side of the
//! event protocol), a minimal REST stub for the idle-sync and prefetch
//! paths, and engine builders for multi-tab scenarios.

mod api;
mod channel;
mod harness;

pub use api::{spawn_fake_api, FakeApi};
pub use channel::InMemoryChannel;
pub use harness::{mk_event, mk_task, spawn_tab, test_epoch, TestTab};
