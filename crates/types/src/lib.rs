pub mod address;
pub mod amount;
pub mod block;
pub mod delegate;
pub mod schedule;

pub use address::*;
pub use amount::*;
pub use block::*;
pub use delegate::*;
pub use schedule::*;
