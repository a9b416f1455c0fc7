mod cache;
pub mod model;

pub use cache::*;
pub use model::*;
