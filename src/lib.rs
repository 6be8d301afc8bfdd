//! Collection run engine: executes HTTP request collections across
//! iterations with scripts, variables, auth and transport policy, and
//! reports every step as an ordered event stream.

pub mod auth;
pub mod cli;
pub mod collections;
pub mod environment;
pub mod history;
pub mod http;
pub mod runner;
pub mod scripts;
pub mod storage;
pub mod summary;
pub mod testing;

pub use collections::{Collection, Entrypoint};
pub use runner::{Run, RunError, RunEvent, RunHandle, RunOptions, Runner, RunnerOptions};
pub use summary::RunSummary;
