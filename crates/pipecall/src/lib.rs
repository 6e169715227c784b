//! pipecall: line-framed calls between a host process and a supervised
//! worker process.

pub mod bridge;
pub mod config;
pub mod dispatch;
pub mod error_log;
pub mod host;
pub mod logging;
pub mod supervisor;
pub mod watchdog;
pub mod worker;

mod version;

pub use bridge::{ERROR_TAG, Endpoint, Frame, FrameError, ProtocolAnomaly, TransportError};
pub use config::{ChannelConfig, DEFAULT_WORKER_NAME};
pub use dispatch::{Dispatch, Dispatcher, Handler, HandlerError};
pub use error_log::RotatingErrorLog;
pub use host::{
    BlockingHost, CallOutcome, Continuation, Continuations, HostClient, HostConfig, HostError,
    HostSession,
};
pub use supervisor::{
    ProcessProbe, SupervisorConfig, SupervisorError, SystemProbe, WorkerSupervisor,
};
pub use version::{PIPECALL_VERSION, VersionInfo};
pub use watchdog::{Watchdog, WatchdogConfig, WatchdogExit};
pub use worker::{LoopState, WorkerConfig, run_worker};
