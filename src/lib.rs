pub mod admin;
pub mod botrun;
pub mod config;
pub mod convert;
pub mod events;
pub mod exchange;
pub mod market_store;
pub mod observability;
pub mod orders;
pub mod persistence;
pub mod scheduler;
pub mod strategy;
pub mod types;
