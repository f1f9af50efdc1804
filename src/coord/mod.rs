//! Collaborator contracts: tools the engine calls and observers it notifies.

pub mod observer;
pub mod tool;

pub use observer::*;
pub use tool::*;
