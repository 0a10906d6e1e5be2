pub mod engine;
pub mod engine_internals;
pub mod error;
pub mod network;
pub mod receiver;
pub mod registry;
pub mod request;
pub mod uring;
