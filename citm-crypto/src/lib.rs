//! Account keys and the end-to-end message envelope.
//!
//! [`keypair`] wraps RSA keys with SHA-256 fingerprints and PEM
//! persistence.  [`envelope`] implements the content-addressed
//! multi-recipient encryption format stored on the mail server.
//! [`keyshare`] is the subscribe/notify bus that fans key add/delete
//! events out to interested sessions.

pub mod envelope;
pub mod error;
pub mod keypair;
pub mod keyshare;

pub use envelope::{Decrypter, Encrypter};
pub use error::CryptoError;
pub use keypair::{Fingerprint, Keypair, PublicKey};
pub use keyshare::{KeyListener, Keyshare};
