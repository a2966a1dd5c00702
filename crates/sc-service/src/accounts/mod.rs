//! Accounts: directory, stores, handshake authentication, verification.

pub mod auth;
pub mod directory;
pub mod store;
pub mod verify;

pub use auth::{AuthGrant, Authenticator, HandshakeLimiter};
pub use directory::{Account, AccountDirectory, DirectoryHandle, Plan};
pub use store::{AccountStore, MySqlAccountStore, StaticAccountStore};
pub use verify::CredentialVerifier;
