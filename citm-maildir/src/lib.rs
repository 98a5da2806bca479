//! The imaildir: one mailbox folder's authoritative local store.
//!
//! Content lives in a maildir-style directory (`cur/` + `tmp/`) next to
//! a sqlite log of metadata, expunges and modseqs.  Many downstream
//! sessions read concurrently through [`dn::DnView`]s; one upstream
//! session keeps the store synchronized through [`up::UpSession`].
//! [`dirmgr::Dirmgr`] hands out folders and arbitrates freezes (blocks
//! on DELETE/RENAME) and holds (blocks closure during APPEND).

pub mod dirmgr;
pub mod dn;
pub mod error;
pub mod imaildir;
pub mod log;
pub mod msg;
pub mod name;
pub mod up;

pub use dirmgr::Dirmgr;
pub use error::MaildirError;
pub use imaildir::Imaildir;
pub use msg::{Expunge, Msg, MsgFlags, MsgState};
