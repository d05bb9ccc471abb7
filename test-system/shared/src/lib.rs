pub mod config;
pub mod constants;
pub mod errors;
pub mod models;
pub mod queues;
pub mod state;
