//! Credential plumbing for media-platform web APIs.
//!
//! - [`spotify`]: TOTP secret resolution and the three access-token providers
//! - [`bilibili`]: WBI request signing and the web cookie refresh handshake
//! - [`apple_music`]: developer token scraping and expiry tracking
//! - [`interceptor`]: attaches platform cookies to requests and reacts to 401/403
//!
//! Every cached credential lives in an [`cache::ExpiringCell`], which lets at most
//! one refresh run at a time while other callers wait for its result.

pub mod apple_music;
pub mod bilibili;
pub mod cache;
pub mod config;
pub mod default;
pub mod error;
pub mod interceptor;
pub mod spotify;
pub mod token;

pub use cache::{Expiring, ExpiringCell};
pub use config::AuthConfig;
pub use default::{DEFAULT_UA, default_client};
pub use error::AuthError;
pub use interceptor::RequestInterceptor;
pub use token::{Token, TokenKind};
