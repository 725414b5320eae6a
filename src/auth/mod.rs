#[allow(clippy::module_inception)]
pub mod auth;
pub mod directory;
pub mod identity;

pub use directory::InMemoryUserDirectory;
pub use identity::{AuthError, IdentityStore, JwtIdentityStore, UserDirectory};
