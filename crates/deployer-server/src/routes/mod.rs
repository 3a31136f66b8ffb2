pub mod actions;
pub mod controller;
pub mod deployments;
pub mod events;
pub mod health;
pub mod history;
pub mod images;
