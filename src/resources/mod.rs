pub mod common;
pub mod volume;
