// ABOUTME: WebSocket front end for shellcast - JSON-RPC protocol engine and server lifecycle
// ABOUTME: Used by the shellcast binary and by end-to-end tests that run a real server

pub mod engine;
pub mod protocol;
pub mod server;

pub use engine::Engine;
pub use server::{run, Server};
