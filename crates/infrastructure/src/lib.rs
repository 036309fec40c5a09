pub mod in_memory_channel;
pub mod state_store;

pub use in_memory_channel::InMemoryChannel;
pub use state_store::InMemoryStateStore;
