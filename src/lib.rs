//! cryptobox: end-to-end encrypted session lifecycle and cache manager.
//!
//! A [`CryptoBox`] owns one local identity, its prekeys and every ratchet
//! session derived from it. Sessions are cached, one instance per id, and
//! their state is only written to storage when it is explicitly saved, so a
//! caller can commit or discard the effects of an encryption depending on
//! whether the message was delivered.
//!
//! ## Modules
//!
//! - `cryptobox` - the box itself and its lifecycle
//! - `session` - session handles
//! - `prekeys` - prekey bundles and their generation
//! - `engine` - the ratchet engine the box drives
//! - `store` - identity, prekey and session persistence
//! - `crypto` - key agreement, key derivation and AEAD primitives
//! - `config` - box configuration
//! - `error` - error type and stable error codes
//!
//! ```no_run
//! use cryptobox::CryptoBox;
//!
//! # fn main() -> cryptobox::Result<()> {
//! let alice = CryptoBox::open("./alice")?;
//! let bob = CryptoBox::open("./bob")?;
//!
//! let prekey = bob.generate_prekeys(0..1)?.remove(0);
//! let session = alice.session_with_id("bob", &prekey)?;
//! let ciphertext = session.encrypt(b"hello")?;
//! alice.save_sessions_requiring_save()?;
//!
//! let received = bob.session_message_with_id("alice", &ciphertext)?;
//! assert_eq!(received.plaintext, b"hello");
//! bob.save_sessions_requiring_save()?;
//! # Ok(())
//! # }
//! ```

mod cache;
pub mod config;
pub mod crypto;
mod cryptobox;
pub mod engine;
pub mod error;
mod prekeys;
mod session;
pub mod store;

pub use config::BoxConfig;
pub use cryptobox::{fingerprint_prekey, is_prekey, CryptoBox};
pub use engine::prekey::{LAST_PREKEY_ID, MAX_PREKEY_ID};
pub use engine::IdentityMode;
pub use error::{CryptoboxError, ErrorCode, Result};
pub use prekeys::PreKey;
pub use session::{Session, SessionMessage};
pub use store::{FileStore, MemoryStore, Store};
