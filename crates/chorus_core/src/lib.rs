//! CHORUS Core Types
//!
//! This crate contains pure types and logic with no I/O.
//! Everything that crosses the wire is serializable with a stable encoding.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod codec;
pub mod error;
pub mod incarnation;
pub mod member;
pub mod message;
pub mod node;

// Re-exports
pub use codec::{Decode, Encode};
pub use error::{CoreError, CoreResult};
pub use incarnation::Incarnation;
pub use member::{Member, MemberStatus};
pub use message::{Message, Packet, Update};
pub use node::Node;
