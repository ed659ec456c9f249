//! Token verification for agent connections.

use jsonwebtoken::{Algorithm, DecodingKey, Validation};
use mesh_core::RecipientId;
use secrecy::{ExposeSecret, SecretString};
use serde::Deserialize;

use crate::connection::Role;

/// Who a verified token belongs to.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Identity {
    pub recipient: RecipientId,
    pub role: Role,
}

#[derive(Debug, thiserror::Error)]
pub enum AuthError {
    #[error("missing token")]
    Missing,
    #[error("invalid token: {0}")]
    Invalid(String),
}

/// Maps a bearer token to an [`Identity`].
pub trait TokenVerifier: Send + Sync {
    fn verify(&self, token: &str) -> Result<Identity, AuthError>;
}

#[derive(Debug, Deserialize)]
struct Claims {
    sub: String,
    #[serde(default)]
    typ: Option<String>,
}

/// HS256 JWT verifier. `sub` is the recipient id, `typ` the role; `exp`
/// is required.
pub struct JwtVerifier {
    key: DecodingKey,
    validation: Validation,
}

impl JwtVerifier {
    pub fn new(secret: &SecretString) -> Self {
        let mut validation = Validation::new(Algorithm::HS256);
        validation.set_required_spec_claims(&["exp", "sub"]);
        Self {
            key: DecodingKey::from_secret(secret.expose_secret().as_bytes()),
            validation,
        }
    }
}

impl TokenVerifier for JwtVerifier {
    fn verify(&self, token: &str) -> Result<Identity, AuthError> {
        if token.is_empty() {
            return Err(AuthError::Missing);
        }
        let data = jsonwebtoken::decode::<Claims>(token, &self.key, &self.validation)
            .map_err(|e| AuthError::Invalid(e.to_string()))?;
        if data.claims.sub.is_empty() {
            return Err(AuthError::Invalid("empty subject".into()));
        }
        Ok(Identity {
            recipient: RecipientId::new(data.claims.sub),
            role: Role::from_claim(data.claims.typ.as_deref()),
        })
    }
}

/// Development verifier: the token itself is the recipient id.
///
/// A `provider:` prefix marks the connection as a provider.
pub struct InsecureVerifier;

impl TokenVerifier for InsecureVerifier {
    fn verify(&self, token: &str) -> Result<Identity, AuthError> {
        let (role, name) = match token.strip_prefix("provider:") {
            Some(name) => (Role::Provider, name),
            None => (Role::User, token),
        };
        if name.is_empty() {
            return Err(AuthError::Missing);
        }
        Ok(Identity {
            recipient: RecipientId::from(name),
            role,
        })
    }
}
