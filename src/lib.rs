//! webcam-mcp: a browser tab's webcam and screen, exposed to MCP clients.
//!
//! An MCP client connects over stdio or streamable HTTP and calls the
//! `capture` / `screenshot` tools. The [`broker`] forwards each call to the
//! user's open capture page over server-sent events and hands the image it
//! posts back to the waiting tool call.

pub mod activity;
pub mod api;
pub mod broker;
pub mod config;
pub mod data_url;
pub mod liveness;
pub mod mcp;
pub mod protocol;
pub mod session;
pub mod transport;
