pub mod cluster;
pub mod config;
pub mod controller;
pub mod error;
pub mod executor;
pub mod health;
pub mod history;
pub mod manifest;
pub mod reconciler;
pub mod registry;
pub mod state;
pub mod types;

#[cfg(any(test, feature = "testkit"))]
pub mod testkit;

pub use controller::{Controller, ControllerHandle, HistoryPage, ManualOutcome};
pub use error::{DeployError, Result};
