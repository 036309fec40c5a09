pub mod agent;
pub mod components;
pub mod handlers;
pub mod probe;
pub mod registry;

pub use agent::SlaveAgent;
pub use components::{DeviceStatusEmitter, HeartbeatEmitter, TaskExecutionManager};
pub use handlers::{
    AsyncFnHandler, BlockingFnHandler, ProgressReporter, TaskContext, TaskHandler,
};
pub use probe::{DeviceProbe, SimulatedDeviceProbe, StaticDeviceProbe};
pub use registry::HandlerRegistry;
