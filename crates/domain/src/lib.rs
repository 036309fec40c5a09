pub mod entities;
pub mod ports;

pub use entities::{
    DeviceStatus, Message, MessagePayload, Recipient, Ring, SlaveInfo, SlaveStatus, Task,
    TaskStatus,
};
pub use ports::{ChannelStats, MessageChannel, RingChange, StateStore};
