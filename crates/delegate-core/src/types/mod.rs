//! Delegate domain types — tasks, messages, reviews, sessions, members.

pub mod member;
pub mod message;
pub mod review;
pub mod session;
pub mod task;

pub use member::*;
pub use message::*;
pub use review::*;
pub use session::*;
pub use task::*;
