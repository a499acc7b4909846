//! Agent dispatch: container supervision, workspace snapshots, and the
//! stdin/stdout contract with the agent child process.

pub mod container;
pub mod output;
pub mod runner;
pub mod snapshots;

pub use container::{CliRuntime, ContainerLaunch, ContainerRuntime, MountPolicy, ResolvedMount};
pub use output::{AgentInput, AgentResponse, AgentResult, AgentStatus, OutputKind, OutputScanner};
pub use runner::{AgentDispatcher, AgentRun, BatchRequest};
