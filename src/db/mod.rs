pub mod article;
pub mod core;
pub mod provider;
pub mod queue;
pub mod schema;

pub use core::Database;
