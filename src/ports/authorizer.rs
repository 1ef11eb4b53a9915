use crate::core::exchange::{Account, Exchange};

/// Decides whether an exchange may proceed.
///
/// Authorizers may attach request-scoped data to the exchange (for example
/// filter predicates) while deciding.
pub trait Authorizer: Send + Sync + 'static {
    fn is_allowed(&self, exchange: &mut Exchange, account: Option<&Account>) -> bool;
}
