pub mod config;
pub mod context;
pub mod errors;
pub mod expr;
pub mod logging;
