//! Collaborative spreadsheet client engine.
//!
//! Connects over TCP to a shared sheet server, applies remote edits from
//! peers, and issues local edits with optimistic concurrency control, undo,
//! save, and leave. The UI shell drives [`session::Session`] and re-renders
//! in response to [`events::SessionEvent`]s.

pub mod config;
pub mod events;
pub mod session;

// Re-export the types a UI shell needs alongside the session.
pub use events::{EventCollector, EventHandler, SessionEvent};
pub use gridlink_engine::cell::{CellContents, CellValue};
pub use gridlink_engine::sheet::{Normalizer, SheetError, Validator};
pub use gridlink_io::ReadWriteError;
pub use gridlink_protocol::DEFAULT_PORT;
pub use session::Session;
