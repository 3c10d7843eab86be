//! Chat client for a hosted backend: auth flows, rooms, messages,
//! profiles and a synchronizer that keeps a room view current.

pub mod api;
pub mod auth;
pub mod backend;
pub mod cli;
pub mod codec;
pub mod config;
pub mod error;
pub mod files;
pub mod messages;
pub mod profiles;
pub mod rooms;
pub mod session;
pub mod sync;

pub use error::{ChatError, Result};
