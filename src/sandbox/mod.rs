//! The context registry and everything it is built from.

pub mod bridge;
pub mod cache;
pub mod config;
pub mod context;
pub mod guard;
pub mod io;
pub mod limits;
pub mod registry;
pub mod snapshot;
pub mod stack;
pub mod transfer;
pub mod value;
