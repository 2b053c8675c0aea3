mod message;
mod topic;

pub use message::*;
pub use topic::*;
