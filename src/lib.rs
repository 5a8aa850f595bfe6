#[macro_use]
extern crate diesel;

pub mod actions;
pub mod admission;
pub mod capacity;
pub mod config;
pub mod error;
pub mod ledger;
pub mod lock;
pub mod memory;
pub mod models;
pub mod queue;
pub mod schema;
