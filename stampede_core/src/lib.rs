pub mod automaton;
pub mod call;
pub mod config;
pub mod controller;
pub mod fuzzer;
pub mod issue;
pub mod job;
pub mod listener;
pub mod process;
pub mod reduce;
pub mod registry;
pub mod repository;
pub mod update;
pub mod worker;

pub use call::{Call, CallError, CallInput};
pub use config::{Config, ConfigError, Limit, SessionSettings};
pub use controller::{Controller, ControllerError, ControllerHandle, NewJob, Submission};
pub use fuzzer::{Fuzzer, FuzzerError};
pub use issue::{Issue, Outcome, Value};
pub use job::{CancelToken, JobError, JobSpec};
pub use listener::{Event, EventSink, Listener, ListenerManager};
pub use registry::{BuildContext, Registry};
pub use repository::{Repository, RepositoryError, open_repository};
pub use worker::{Launcher, ProcessLauncher, ThreadLauncher};
