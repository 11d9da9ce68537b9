pub mod arbiter;
pub mod decoder;
pub mod engine;
pub mod error;
pub mod events;
pub mod model;
