//! Connection pooling and routing.

pub mod address;
pub mod comms;
pub mod config;
pub mod guard;
pub mod inner;
pub mod pool_impl;
pub mod router;

pub use address::{Address, Target};
pub use config::Config;
pub use guard::{Guard, VersionTag};
pub use pool_impl::Pool;
pub use router::{Route, Router};
