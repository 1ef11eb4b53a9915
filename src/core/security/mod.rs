pub mod authenticator;
pub mod digest;
pub mod orchestrator;
pub mod password;
pub mod token;

pub use authenticator::{AccountDocumentLayout, Authenticator, Credential};
pub use orchestrator::{SecurityOrchestrator, SecurityOutcome};
pub use token::RandomTokenManager;

use crate::{
    core::exchange::{Account, Exchange},
    ports::authorizer::Authorizer,
};

/// Allows every request. Bound to unsecured pipelines.
#[derive(Debug, Clone, Copy, Default)]
pub struct AllowAllAuthorizer;

impl Authorizer for AllowAllAuthorizer {
    fn is_allowed(&self, _exchange: &mut Exchange, _account: Option<&Account>) -> bool {
        true
    }
}
