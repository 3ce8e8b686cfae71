//! LLM client contract and stream plumbing.
//!
//! The loop consumes an abstract [`ModelClient`] that produces an
//! [`AssistantStream`]: an event stream whose terminal event carries the
//! finalized assistant message. Providers live outside the core; tests use
//! scripted clients.

mod accumulator;
mod client;
mod event_stream;
mod stream_event;

pub use accumulator::StreamAccumulator;
pub use client::{ModelClient, ModelInfo, StreamError, StreamRequest, ToolDescriptor};
pub use event_stream::{EventSender, EventStream, channel};
pub use stream_event::{AssistantStream, AssistantStreamSender, StreamEvent};
