pub mod adapters;
pub mod config;
pub mod context;
pub mod core;
pub mod db;
pub mod logging;
pub mod store;
pub mod utils;
