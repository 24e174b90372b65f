// Library exports for svc-harness
// Makes modules accessible to tests and to services built on the harness

pub mod audit;
pub mod config;
pub mod error;
pub mod harness;
pub mod ident;
pub mod logger;
pub mod server;
pub mod tls;
pub mod validation;

pub use error::{BindingError, HarnessError};
pub use harness::{RunContext, Service};
