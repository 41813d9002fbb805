pub mod gateway;
pub mod money;
pub mod order;
pub mod ports;
pub mod refund;
pub mod transaction;
pub mod webhook;
