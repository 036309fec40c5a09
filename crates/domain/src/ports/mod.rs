pub mod messaging;
pub mod state_store;

pub use messaging::{ChannelStats, MessageChannel};
pub use state_store::{RingChange, StateStore};
