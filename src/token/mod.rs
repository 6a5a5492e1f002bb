//! Token
//!
//! Bearer token acquisition and caching.

pub mod acquirer;
pub mod cache;

pub use acquirer::{
    ClientCredentialsAcquirer, ClientCredentialsConfig, TokenAcquirer, TENANT_PLACEHOLDER,
};
pub use cache::{AuthFailure, TokenCache};
