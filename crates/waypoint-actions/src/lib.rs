//! Action gateway: external side effects for action nodes.
//!
//! `ActionGateway` renders an action's parameter template from the call's
//! collected data, decodes the integration's stored credential through the
//! `CredentialResolver` fallback chain, and invokes an `ActionBackend` once.

pub mod credentials;
pub mod gateway;
pub mod http;
pub mod template;

pub use credentials::{
    seal_envelope, seal_token, CredentialError, CredentialResolver, CredentialStrategy,
    ResolvedCredential, StaticCredentialSource, CREDENTIAL_CHAIN,
};
pub use gateway::{ActionGateway, ActionReport};
pub use http::HttpActionBackend;
pub use template::render_parameters;
