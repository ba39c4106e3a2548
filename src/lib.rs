pub mod admission;
pub mod batcher;
pub mod config;
pub mod db;
pub mod gateway;
pub mod model;
pub mod queue;
pub mod relay;
pub mod store;
pub mod upstream;
