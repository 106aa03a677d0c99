//! Zero-copy wire format shared by producers, the engine and every sink.
//!
//! Every record is exactly [`MESSAGE_SIZE`] bytes and can be transmuted
//! directly from wire bytes without parsing.

pub mod messages;
pub mod parser;
pub mod security;

pub use messages::*;
pub use parser::*;
pub use security::*;
