//! Domain services used by websocket and HTTP routes.
//!
//! ARCHITECTURE
//! ============
//! Service modules own delivery, aggregation and persistence concerns so
//! route handlers can stay focused on protocol translation and auth plumbing.

pub mod aggregator;
pub mod attachments;
pub mod heartbeat;
pub mod locks;
pub mod receipts;
pub mod registry;
pub mod router;
pub mod session;
