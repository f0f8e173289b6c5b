pub mod bus;
pub mod callers;
pub mod cascade;
pub mod client;
pub mod config;
pub mod http;
pub mod proxy;
pub mod router;

pub use cascade::{Caller, Level, Verdict, cascade};
pub use proxy::GatewayError;
pub use router::{RouteTable, RouteValues};
