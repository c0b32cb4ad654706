//! nrtsearch protocol - HTTP surface of an index node
//!
//! - `types`: JSON request/response bodies shared by the server and clients
//! - `rest`: async REST client (reqwest)

#![warn(missing_docs)]

pub mod rest;
pub mod types;

pub use rest::{ClientError, RestClient};
pub use types::*;
