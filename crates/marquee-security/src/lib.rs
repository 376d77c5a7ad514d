//! Access verification for Marquee.
//!
//! Sessions resolve to identities; roles are always read from the role
//! store at decision time.

pub mod roles;
pub mod session;
pub mod verifier;

pub use roles::{CachedRoleStore, InMemoryRoleStore, RoleAdmin, RoleStore};
pub use session::{JwtSessionResolver, SessionHandle, SessionResolver, StaticSessionResolver};
pub use verifier::{AccessError, AccessVerifier, Decision};
