pub mod agent;
pub mod agg;
pub mod batchio;
pub mod catalog;
pub mod config;
pub mod context;
pub mod control;
pub mod error;
pub mod initctl;
pub mod signal;

pub use batchio::BatchIo;
pub use config::{Domain, PlatformTopo};
pub use context::PlatformContext;
pub use error::{MsrflowError, Result};

pub use agent::{Agent, PowerBalancer, PowerBalancerAgent};
