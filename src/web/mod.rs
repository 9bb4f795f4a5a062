//! HTTP gateway exposing the billing operations as a JSON API.

pub mod auth;
pub mod server;
pub mod types;

pub use server::{GatewayState, router, start_server};
