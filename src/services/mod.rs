//! Domain services used by websocket and HTTP routes.
//!
//! ARCHITECTURE
//! ============
//! `broker` owns the live group registry and message fan-out. `groups` and
//! `session` are the persistence-backed collaborators it consults, kept
//! behind traits so route handlers and tests never touch SQL directly.

pub mod broker;
pub mod groups;
pub mod session;
