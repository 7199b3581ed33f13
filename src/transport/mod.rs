//! HTTP control plane between the dispatch server and its agents.
//!
//! Agents pull work: they register, heartbeat, poll their mailbox and
//! report each attempt. Every route but `/health` requires the shared
//! bearer token.

pub mod auth;
pub mod client;
pub mod delivery;
pub mod protocol;
pub mod server;

pub use auth::AuthState;
pub use client::ControlPlaneClient;
pub use delivery::{Delivery, Mailbox};
pub use server::{router, serve, AppState};
