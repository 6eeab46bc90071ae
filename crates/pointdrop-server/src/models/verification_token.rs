//! Email verification token model.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;

/// Stored verification token. Only the hash of the secret is kept.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct VerificationToken {
    /// Subject (account id) the token verifies. One live token per subject.
    pub subject: String,
    /// SHA-256 hex of the token secret.
    pub token_hash: String,
    pub expires_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
}

impl VerificationToken {
    /// Returns true if the token is expired at `now`.
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        self.expires_at <= now
    }
}

/// A freshly issued token; `token` is the plaintext secret to deliver.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct IssuedToken {
    pub token: String,
    pub expires_at: DateTime<Utc>,
}

/// Result of consuming a token.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Consumed {
    /// The token was live; carries its subject.
    Success(String),
    /// The token existed but had expired.
    Expired,
    /// No token matches.
    Invalid,
}

impl Consumed {
    /// Status tag used on the verification result page.
    pub fn status(&self) -> &'static str {
        match self {
            Consumed::Success(_) => "success",
            Consumed::Expired => "expired",
            Consumed::Invalid => "invalid",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn token(expires_at: DateTime<Utc>) -> VerificationToken {
        VerificationToken {
            subject: "acct_1".to_string(),
            token_hash: "00".repeat(32),
            expires_at,
            created_at: Utc::now(),
        }
    }

    #[test]
    fn test_is_expired_at() {
        let now = Utc::now();
        assert!(!token(now + Duration::minutes(10)).is_expired_at(now));
        assert!(token(now - Duration::minutes(1)).is_expired_at(now));
        assert!(token(now).is_expired_at(now));
    }

    #[test]
    fn test_consumed_status() {
        assert_eq!(Consumed::Success("a".into()).status(), "success");
        assert_eq!(Consumed::Expired.status(), "expired");
        assert_eq!(Consumed::Invalid.status(), "invalid");
    }
}
