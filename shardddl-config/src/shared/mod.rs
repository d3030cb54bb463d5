mod base;
mod connection;
mod coordinator;
mod service;
mod store;

pub use base::*;
pub use connection::*;
pub use coordinator::*;
pub use service::*;
pub use store::*;
