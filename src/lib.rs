pub mod config;
pub mod error;
pub mod protocol;
pub mod scheduler;
pub mod shutdown;
pub mod supervisor;
pub mod transport;
pub mod worker;

pub use config::{SupervisorConfig, WorkerOptions};
pub use error::{HandlerError, RequestError, Result, SupervisorError, WorkerError};
pub use scheduler::Completion;
pub use supervisor::{PoolStats, Supervisor, WorkerId, WorkerStats};
pub use transport::{EntryTarget, MemoryTransport, ProcessTransport};
pub use worker::{Worker, WorkerLogger};
