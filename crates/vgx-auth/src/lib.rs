//! vgx-auth — node-side authorization for admin operations.
//!
//! A client first asks the node for a one-shot token bound to its host
//! ([`TokenStore::issue`]), then presents it with the admin request
//! ([`TokenStore::consume`]). Mutating operations additionally run inside
//! the [`AdminGate`], which admits one token at a time. [`AdminAuthGate`]
//! bundles both for the request handlers.

pub mod authority;
pub mod gate;
pub mod token;

pub use authority::AdminAuthGate;
pub use gate::AdminGate;
pub use token::{AuthToken, TokenStore};
