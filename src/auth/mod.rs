// Authentication module
// Backend credential lifecycle: decoding, expiry, provider selection, refresh

pub mod codec;
pub mod expiry;
mod manager;
pub mod provider;
pub mod refresh;
pub mod types;

pub use manager::{AuthManager, AuthSettings};
pub use types::{ProviderFlag, TokenPair};
