use async_trait::async_trait;
use subtle::ConstantTimeEq;
use uuid::Uuid;

/// Opaque token issuance/validation capability. Concrete JWT/bcrypt/etc.
/// machinery is an external collaborator (see the purpose/scope notes); this
/// crate only depends on the trait.
#[async_trait]
pub trait TokenIssuer: Send + Sync {
    /// Mint a fresh session token for a daemon that just completed registration.
    async fn issue_token(&self, daemon_id: Uuid) -> String;

    /// Validate a bootstrap token presented on the control channel accept path.
    fn validate_token(&self, presented: &str) -> bool;
}

/// A fixed shared-secret bootstrap token, useful for local development and
/// tests. Comparison is constant-time to avoid leaking the token length/
/// prefix through timing.
pub struct StaticBootstrapToken {
    expected: String,
}

impl StaticBootstrapToken {
    pub fn new(expected: impl Into<String>) -> Self {
        Self { expected: expected.into() }
    }
}

#[async_trait]
impl TokenIssuer for StaticBootstrapToken {
    async fn issue_token(&self, daemon_id: Uuid) -> String {
        format!("session-{daemon_id}")
    }

    fn validate_token(&self, presented: &str) -> bool {
        let expected = self.expected.as_bytes();
        let presented = presented.as_bytes();
        if expected.len() != presented.len() {
            return false;
        }
        expected.ct_eq(presented).into()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn issues_a_token_per_daemon() {
        let issuer = StaticBootstrapToken::new("secret");
        let daemon_id = Uuid::new_v4();
        let token = issuer.issue_token(daemon_id).await;
        assert!(token.contains(&daemon_id.to_string()));
    }

    #[test]
    fn validates_matching_token() {
        let issuer = StaticBootstrapToken::new("secret");
        assert!(issuer.validate_token("secret"));
    }

    #[test]
    fn rejects_mismatched_token() {
        let issuer = StaticBootstrapToken::new("secret");
        assert!(!issuer.validate_token("wrong"));
        assert!(!issuer.validate_token("secre"));
        assert!(!issuer.validate_token(""));
    }
}
