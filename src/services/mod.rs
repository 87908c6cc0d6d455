//! Domain services used by websocket and HTTP routes.
//!
//! ARCHITECTURE
//! ============
//! Service modules own room coordination logic so route handlers can stay
//! focused on protocol translation. Every service takes `&AppState` and
//! reaches live state only through the registry, connection table, and
//! topic router it carries.

pub mod buffer;
pub mod chat;
pub mod connection;
pub mod directory;
pub mod execution;
pub mod maintenance;
pub mod presence;
