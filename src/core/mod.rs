pub mod engine;
pub mod position;
pub mod tracker;
pub mod types;
