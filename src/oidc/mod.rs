//! OIDC identity tokens: signing key cache and token verification.
//!
//! ```text
//! Bearer token
//!   -> TokenVerifier::verify
//!        -> KeyCache::get_key(kid)    -- cached; one refresh on miss/stale
//!             -> KeySource::fetch     -- HTTPS GET of the JWKS
//!        -> signature, iss, aud, exp
//!   -> Claims { repository, ... }
//! ```
//!
//! The [`KeyCache`] is one instance per process, shared by every request
//! through the verifier.

pub mod jwks;
pub mod verifier;

pub use jwks::{HttpKeySource, JwksDocument, KeyCache, KeySource, SigningKey};
pub use verifier::{Audience, Claims, GITHUB_ACTIONS_ISSUER, TokenVerifier};
