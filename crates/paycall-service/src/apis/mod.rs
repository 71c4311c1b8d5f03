//! Request handlers for the paycall HTTP API.

pub mod health;
pub mod job;
pub mod paycall;
pub mod quote;
