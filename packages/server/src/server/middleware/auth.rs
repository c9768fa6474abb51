//! Request authentication/authorization.
//!
//! Verifies a bearer JWT and attaches the resulting [`AuthenticatedUser`] to
//! request extensions. Requests without a valid token proceed as anonymous;
//! individual handlers decide whether anonymous access is acceptable.

use axum::extract::Request;
use axum::http::HeaderMap;
use axum::middleware::Next;
use axum::response::Response;
use jsonwebtoken::{decode, DecodingKey, Validation};
use serde::{Deserialize, Serialize};

use crate::server::app::AppState;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Claims {
    pub sub: String,
    pub is_admin: bool,
    pub exp: usize,
}

#[derive(Debug, Clone)]
pub struct AuthenticatedUser {
    pub subject: String,
    pub is_admin: bool,
}

pub struct JwtVerifier {
    secret: String,
}

impl JwtVerifier {
    pub fn new(secret: impl Into<String>) -> Self {
        Self {
            secret: secret.into(),
        }
    }

    pub fn verify(&self, token: &str) -> Result<Claims, jsonwebtoken::errors::Error> {
        let data = decode::<Claims>(
            token,
            &DecodingKey::from_secret(self.secret.as_bytes()),
            &Validation::default(),
        )?;
        Ok(data.claims)
    }
}

pub fn extract_bearer_token(headers: &HeaderMap) -> Option<String> {
    let value = headers.get("authorization")?.to_str().ok()?;
    value.strip_prefix("Bearer ").map(|t| t.to_string())
}

pub async fn auth_middleware(
    axum::extract::State(state): axum::extract::State<AppState>,
    mut request: Request,
    next: Next,
) -> Response {
    if let Some(token) = extract_bearer_token(request.headers()) {
        if let Ok(claims) = state.jwt.verify(&token) {
            request.extensions_mut().insert(AuthenticatedUser {
                subject: claims.sub,
                is_admin: claims.is_admin,
            });
        }
    }
    next.run(request).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use jsonwebtoken::{encode, EncodingKey, Header};

    #[test]
    fn round_trips_a_valid_token() {
        let verifier = JwtVerifier::new("test_secret");
        let claims = Claims {
            sub: "user-1".to_string(),
            is_admin: false,
            exp: (chrono::Utc::now().timestamp() + 3600) as usize,
        };
        let token = encode(
            &Header::default(),
            &claims,
            &EncodingKey::from_secret(b"test_secret"),
        )
        .unwrap();

        let verified = verifier.verify(&token).unwrap();
        assert_eq!(verified.sub, "user-1");
    }

    #[test]
    fn rejects_token_signed_with_wrong_secret() {
        let claims = Claims {
            sub: "user-1".to_string(),
            is_admin: false,
            exp: (chrono::Utc::now().timestamp() + 3600) as usize,
        };
        let token = encode(
            &Header::default(),
            &claims,
            &EncodingKey::from_secret(b"other_secret"),
        )
        .unwrap();

        let verifier = JwtVerifier::new("test_secret");
        assert!(verifier.verify(&token).is_err());
    }

    #[test]
    fn extracts_bearer_token_from_header() {
        let mut headers = HeaderMap::new();
        headers.insert("authorization", "Bearer abc.def.ghi".parse().unwrap());
        assert_eq!(extract_bearer_token(&headers).unwrap(), "abc.def.ghi");
    }
}
