mod types;
pub use types::*;

mod keys;
pub use keys::*;

mod prekey;
pub use prekey::*;

mod x3dh;
pub use x3dh::*;

mod ratchet;
pub use ratchet::DoubleRatchet;

mod envelope;
pub use envelope::*;

mod session;
pub use session::*;

mod engine;
pub use engine::SessionEngine;

mod error;
pub use error::Error;

mod account;
pub use account::{Account, TrustedIdentity};

mod config;
pub use config::{AccountConfig, FanoutConfig};

mod store;
pub use store::{MemorySessionStore, SessionStore, StorageError, StorageKey};

mod fanout;
pub use fanout::*;

mod proto;
