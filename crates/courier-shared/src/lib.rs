//! # courier-shared
//!
//! Types shared across the courier crates: entity identifiers, the JSON
//! socket protocol, and the upload-completion event schema consumed by the
//! mailbox reconciler.

pub mod error;
pub mod events;
pub mod frames;
pub mod ids;

pub use error::FrameError;
pub use events::{CompletionEvent, CompletionKind, UploadStatus};
pub use frames::{ClientFrame, ServerFrame, MAX_CONTENT_LEN};
pub use ids::{ChatId, MessageId, UserId};
