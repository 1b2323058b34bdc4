pub mod api;
pub mod config;
pub mod daemon;
pub mod db;
pub mod error;
pub mod queue;
pub mod shutdown;
pub mod stats;
pub mod store;
pub mod worker;
