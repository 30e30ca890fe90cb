pub mod config;
pub mod context;
pub mod error;
pub mod expr;
pub mod rules;
pub mod snapshot;
pub mod template;
pub mod upstream;
