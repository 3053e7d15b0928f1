//! # courier-store
//!
//! Durable storage for the message-delivery subsystem, backed by SQLite.
//!
//! The crate exposes a synchronous [`Database`] handle that wraps a
//! `rusqlite::Connection` and provides typed CRUD helpers for every domain
//! record: chats, participants, messages, and the per-recipient mailbox.
//! Async code shares one connection per process through [`StoreHandle`],
//! which never holds the lock across an await.

pub mod chats;
pub mod database;
pub mod handle;
pub mod mailbox;
pub mod messages;
pub mod migrations;
pub mod models;

mod error;

pub use database::Database;
pub use error::{Result, StoreError};
pub use handle::StoreHandle;
pub use models::*;
