//! Session persistence and the public facade above the agent loop.
//!
//! A session is one append-only journal file plus the runtime state that
//! drives conversations over it: the in-memory entry tree, the agent loop,
//! and the queues for user input that arrives mid-run.

mod entry;
mod journal;
mod session;

pub use entry::{Entry, EntryPayload, SessionHeader};
pub use journal::{JournalError, SessionJournal};
pub use session::{PromptOptions, PromptOutcome, Session, SessionBuilder, SessionError};
