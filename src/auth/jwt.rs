//! JWT token handler
//! Mission: Stateless bearer tokens with role and org claims

use anyhow::{Context, Result};
use chrono::Utc;
use jsonwebtoken::{decode, encode, DecodingKey, EncodingKey, Header, Validation};
use tracing::debug;

use crate::auth::models::{Claims, Operator};

pub struct JwtHandler {
    secret: String,
    expiration_hours: i64,
}

impl JwtHandler {
    pub fn new(secret: String) -> Self {
        Self {
            secret,
            expiration_hours: 24,
        }
    }

    /// Generate a token for an operator. Returns the token and its lifetime
    /// in seconds.
    pub fn generate_token(&self, operator: &Operator) -> Result<(String, usize)> {
        let expiration = Utc::now()
            .checked_add_signed(chrono::Duration::hours(self.expiration_hours))
            .context("Invalid timestamp")?
            .timestamp() as usize;

        let claims = Claims {
            sub: operator.id.to_string(),
            username: operator.username.clone(),
            role: operator.role,
            org_id: operator.org_id.clone(),
            exp: expiration,
        };

        debug!(
            username = %operator.username,
            role = operator.role.as_str(),
            "Generating JWT"
        );

        let token = encode(
            &Header::default(),
            &claims,
            &EncodingKey::from_secret(self.secret.as_bytes()),
        )
        .context("Failed to generate JWT")?;

        Ok((token, (self.expiration_hours * 3600) as usize))
    }

    pub fn validate_token(&self, token: &str) -> Result<Claims> {
        let decoded = decode::<Claims>(
            token,
            &DecodingKey::from_secret(self.secret.as_bytes()),
            &Validation::default(),
        )
        .context("Invalid or expired token")?;

        Ok(decoded.claims)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::models::Role;
    use uuid::Uuid;

    fn operator(role: Role) -> Operator {
        Operator {
            id: Uuid::new_v4(),
            username: "ops".to_string(),
            password_hash: "hash".to_string(),
            role,
            org_id: "org_1".to_string(),
            created_at: Utc::now().to_rfc3339(),
        }
    }

    #[test]
    fn test_round_trip() {
        let handler = JwtHandler::new("test-secret".to_string());
        let op = operator(Role::Analyst);

        let (token, expires_in) = handler.generate_token(&op).unwrap();
        assert_eq!(expires_in, 24 * 3600);

        let claims = handler.validate_token(&token).unwrap();
        assert_eq!(claims.username, "ops");
        assert_eq!(claims.role, Role::Analyst);
        assert_eq!(claims.org_id, "org_1");
    }

    #[test]
    fn test_wrong_secret_rejected() {
        let handler = JwtHandler::new("secret-a".to_string());
        let other = JwtHandler::new("secret-b".to_string());
        let (token, _) = handler.generate_token(&operator(Role::Admin)).unwrap();

        assert!(other.validate_token(&token).is_err());
        assert!(handler.validate_token("garbage.token.here").is_err());
    }
}
