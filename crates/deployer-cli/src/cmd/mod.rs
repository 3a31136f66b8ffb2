pub mod config;
pub mod manifest;
pub mod reconcile;
pub mod serve;
