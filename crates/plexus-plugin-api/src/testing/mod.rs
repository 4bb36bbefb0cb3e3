//! Testing utilities for plugin and host developers
//!
//! Mocks record every lifecycle call into a shared [`Journal`], so tests can
//! assert on ordering after the plugin has been handed to the host.

pub mod helpers;
pub mod mocks;

pub use helpers::{mock_module, HarnessState, PluginTestHarness};
pub use mocks::{Journal, MockPlugin, MockService, RecordingTask, TaskSpec};
