pub mod probe;
pub mod reply;

pub use probe::*;
pub use reply::*;
