//! Hypervisor host agent
//!
//! Executes typed control-plane commands against one host of a hypervisor
//! pool through its management API: sessions, async tasks, storage
//! repositories, VM power and migration, networking and statistics.
//!
//! # Key Features
//!
//! - **Session pool** - memoized connections with re-login and credential rotation
//! - **Task tracking** - every async task is polled, bounded and destroyed
//! - **Idempotent storage** - SRs are reused by backing store, never duplicated
//! - **Compensation** - a failed VM start leaves nothing behind
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use hv_agent::{Agent, AgentConfig, Command};
//! use hv_agent::mgmt::SimulatedPool;
//!
//! let sim = SimulatedPool::new();
//! let config = AgentConfig::builder()
//!     .host("host-1", "10.0.0.1")
//!     .credentials("root", "secret")
//!     .build();
//!
//! let agent = Agent::new(config, Arc::new(sim.clone()), Arc::new(sim))?;
//! agent.initialize()?;
//!
//! let answer = agent.execute(Command::Ping);
//! println!("{}", answer.details);
//! # Ok::<(), hv_agent::Error>(())
//! ```

pub mod agent;
pub mod command;
pub mod config;
pub mod error;
pub mod locks;
pub mod mgmt;
pub mod network;
pub mod session;
pub mod stats;
pub mod storage;
pub mod task;
pub mod vm;

#[cfg(test)]
mod testing;

pub use agent::{Agent, HostInfo};
pub use command::{Answer, AnswerPayload, Command};
pub use config::AgentConfig;
pub use error::{Error, ErrorKind, Result};
