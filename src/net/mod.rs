pub mod interface;
pub mod sender;

pub use interface::*;
pub use sender::*;
