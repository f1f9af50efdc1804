pub mod loader;
pub mod model;
pub mod validate;

pub use loader::load_plan_file;
pub use model::*;
pub use validate::{validate_plan, ValidationReport};
