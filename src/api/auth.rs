//! Bearer-token verification shared by the WebSocket upgrade and the HTTP
//! analytics endpoints.

use crate::config::AuthConfig;
use crate::core::{CoreError, CoreResult};
use jsonwebtoken::{decode, Algorithm, DecodingKey, Validation};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Claims {
    pub sub: String,
    pub aud: String,
    pub exp: usize,
}

#[derive(Clone)]
pub struct TokenVerifier {
    decoding_key: DecodingKey,
    validation: Validation,
}

impl TokenVerifier {
    pub fn new(config: &AuthConfig) -> Self {
        let mut validation = Validation::new(Algorithm::HS256);
        validation.set_audience(&[&config.jwt_audience]);
        Self {
            decoding_key: DecodingKey::from_secret(config.jwt_secret.as_bytes()),
            validation,
        }
    }

    /// Verifies signature, expiration, and audience; returns the
    /// authenticated user id on success.
    pub fn verify(&self, token: &str) -> CoreResult<String> {
        let data = decode::<Claims>(token, &self.decoding_key, &self.validation)
            .map_err(|e| CoreError::Authorization(format!("token verification failed: {e}")))?;
        Ok(data.claims.sub)
    }
}

/// Strips a `Bearer ` prefix if present.
pub fn extract_bearer(header_value: &str) -> &str {
    header_value.strip_prefix("Bearer ").unwrap_or(header_value)
}

#[cfg(test)]
mod tests {
    use super::*;
    use jsonwebtoken::{encode, EncodingKey, Header};

    fn config() -> AuthConfig {
        AuthConfig { jwt_secret: "test-secret".to_string(), jwt_audience: "portfolio-core".to_string() }
    }

    fn token_for(sub: &str, aud: &str, secret: &str) -> String {
        let claims = Claims { sub: sub.to_string(), aud: aud.to_string(), exp: 9_999_999_999 };
        encode(&Header::new(Algorithm::HS256), &claims, &EncodingKey::from_secret(secret.as_bytes())).unwrap()
    }

    #[test]
    fn valid_token_yields_subject() {
        let verifier = TokenVerifier::new(&config());
        let token = token_for("user_1", "portfolio-core", "test-secret");
        assert_eq!(verifier.verify(&token).unwrap(), "user_1");
    }

    #[test]
    fn wrong_secret_is_rejected() {
        let verifier = TokenVerifier::new(&config());
        let token = token_for("user_1", "portfolio-core", "wrong-secret");
        assert!(verifier.verify(&token).is_err());
    }

    #[test]
    fn wrong_audience_is_rejected() {
        let verifier = TokenVerifier::new(&config());
        let token = token_for("user_1", "some-other-service", "test-secret");
        assert!(verifier.verify(&token).is_err());
    }

    #[test]
    fn bearer_prefix_is_stripped() {
        assert_eq!(extract_bearer("Bearer abc.def.ghi"), "abc.def.ghi");
        assert_eq!(extract_bearer("abc.def.ghi"), "abc.def.ghi");
    }
}
