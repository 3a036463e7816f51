//! agent-flow server
//!
//! Wires the core pipeline to the outside world: the authenticated HTTP
//! surface (ingest + queries), the WebSocket realtime gateway, and the two
//! in-process schedulers (periodic insight analysis, user cron jobs). All
//! of them move events through the same store-then-bus path, so a cron run
//! shows up on a dashboard exactly like a live coding session.

pub mod cron;
pub mod http;
pub mod insights;
pub mod pipeline;
pub mod state;
pub mod tools;
pub mod transcript;
pub mod ws;
