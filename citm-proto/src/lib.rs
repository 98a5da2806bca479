//! The proxy: everything between a downstream socket and an upstream
//! mail server.
//!
//! A connection's life: accept → [`anon`] (greeting, capabilities,
//! LOGIN proxying) → [`preuser`] (XKEYSYNC warm-up, mykey upload) →
//! [`user`] (one per account: keydir + keysync client) → [`sc`] (the
//! per-mailbox server/client bridge).  [`status`] is the local
//! control-socket surface.

pub mod anon;
pub mod conn;
pub mod error;
pub mod keydir;
pub mod keysync;
pub mod preuser;
pub mod sc;
pub mod server;
pub mod status;
pub mod tls;
pub mod user;

pub use error::ProtoError;
