//! Control command delivery for the Drover control plane.
//!
//! A controller pushes one-shot commands (start/stop/pause/resume/update) at
//! a specific agent; the agent's subscription consumes each command exactly
//! once and the channel writes the outcome back — a failing handler marks
//! the command failed and the subscription keeps going.
//!
//! # Main types
//!
//! - [`CommandChannel`] — Send commands, subscribe per agent, write back outcomes.
//! - [`CommandHandler`] — The agent-side callback invoked per command.

/// The command channel.
pub mod channel;

pub use channel::{CommandChannel, CommandHandler};
