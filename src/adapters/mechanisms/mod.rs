//! Built-in authentication mechanisms.
pub mod basic;
pub mod digest;
pub mod identity;
pub mod token;

pub use basic::{BasicAuthMechanism, BasicArgs};
pub use digest::{DigestArgs, DigestAuthMechanism};
pub use identity::{IdentityArgs, IdentityAuthMechanism};
pub use token::TokenAuthMechanism;

use base64::{Engine, engine::general_purpose::STANDARD};
use hyper::header;
use thiserror::Error;

use crate::core::exchange::Exchange;

/// Why a credential header could not be read.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum MechanismError {
    #[error("Authorization header is not valid base64")]
    InvalidEncoding,
    #[error("Authorization header is not valid UTF-8")]
    InvalidUtf8,
    #[error("Basic credentials lack a ':' separator")]
    MissingSeparator,
}

/// `(id, secret)` from an `Authorization: Basic` header. `Ok(None)` when the
/// request carries no Basic credentials.
pub fn basic_credentials(exchange: &Exchange) -> Result<Option<(String, String)>, MechanismError> {
    let Some(value) = exchange.header_str(header::AUTHORIZATION) else {
        return Ok(None);
    };
    let Some((scheme, encoded)) = value.trim().split_once(' ') else {
        return Ok(None);
    };
    if !scheme.eq_ignore_ascii_case("basic") {
        return Ok(None);
    }

    let decoded = STANDARD
        .decode(encoded.trim())
        .map_err(|_| MechanismError::InvalidEncoding)?;
    let decoded = String::from_utf8(decoded).map_err(|_| MechanismError::InvalidUtf8)?;
    let (id, secret) = decoded
        .split_once(':')
        .ok_or(MechanismError::MissingSeparator)?;

    Ok(Some((id.to_string(), secret.to_string())))
}

#[cfg(test)]
pub(crate) mod test_support {
    use base64::{Engine, engine::general_purpose::STANDARD};
    use hyper::{HeaderMap, Method, header};

    use crate::core::exchange::{Exchange, ExchangeBody};

    pub fn basic_header(id: &str, secret: &str) -> String {
        format!("Basic {}", STANDARD.encode(format!("{id}:{secret}")))
    }

    pub fn exchange_with(name: header::HeaderName, value: &str) -> Exchange {
        let mut headers = HeaderMap::new();
        headers.insert(name, value.parse().unwrap());
        Exchange::new(Method::GET, "/api/x".parse().unwrap(), headers, ExchangeBody::Empty)
    }
}
