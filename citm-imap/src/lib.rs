//! IMAP4rev1 wire codec.
//!
//! The crate is split the same way the protocol is: [`types`] is the AST,
//! [`parse`] turns bytes into ASTs (streaming, partial-input aware), and
//! [`write`] turns ASTs back into bytes through a restartable,
//! byte-budgeted encoder.  Extension-gated constructs consult an
//! [`extensions::Extensions`] record on both paths.

pub mod error;
pub mod extensions;
pub mod imf;
pub mod parse;
pub mod types;
pub mod write;

pub use error::ImapError;
pub use extensions::{Ext, ExtState, Extensions};
pub use types::command::{Command, CommandBody};
pub use types::response::{Response, ResponseData, ResponseStatus};
