use std::collections::HashMap;
use std::sync::Arc;

use axum::http::HeaderMap;
use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum AuthError {
    #[error("missing authentication metadata")]
    MissingMetadata,
    #[error("missing agent_id header")]
    MissingAgentId,
    #[error("missing agent_token header")]
    MissingAgentToken,
    #[error("invalid credentials")]
    InvalidCredentials,
}

/// Injected agent credential map. Token comparison is exact-match; rotation
/// is out of scope.
#[derive(Clone, Default)]
pub struct CredentialStore {
    tokens: Arc<HashMap<String, String>>,
}

impl CredentialStore {
    pub fn new(tokens: HashMap<String, String>) -> Self {
        Self {
            tokens: Arc::new(tokens),
        }
    }

    fn expected_token(&self, agent_id: &str) -> Option<&str> {
        self.tokens.get(agent_id).map(String::as_str)
    }
}

/// Validate the `agent_id` / `agent_token` headers an agent attaches at
/// stream establishment. Returns the authenticated agent ID.
pub fn authenticate(headers: &HeaderMap, store: &CredentialStore) -> Result<String, AuthError> {
    let agent_id = headers.get("agent_id").and_then(|v| v.to_str().ok());
    let agent_token = headers.get("agent_token").and_then(|v| v.to_str().ok());

    match (agent_id, agent_token) {
        (None, None) => Err(AuthError::MissingMetadata),
        (None, Some(_)) => Err(AuthError::MissingAgentId),
        (Some(_), None) => Err(AuthError::MissingAgentToken),
        (Some(id), Some(token)) => {
            if id.is_empty() {
                return Err(AuthError::MissingAgentId);
            }
            if token.is_empty() {
                return Err(AuthError::MissingAgentToken);
            }
            match store.expected_token(id) {
                Some(expected) if expected == token => Ok(id.to_string()),
                _ => Err(AuthError::InvalidCredentials),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::{HeaderName, HeaderValue};

    fn store() -> CredentialStore {
        let mut tokens = HashMap::new();
        tokens.insert("agent-1".to_string(), "secret-1".to_string());
        CredentialStore::new(tokens)
    }

    fn headers(pairs: &[(&str, &str)]) -> HeaderMap {
        let mut h = HeaderMap::new();
        for (k, v) in pairs {
            h.insert(
                HeaderName::from_bytes(k.as_bytes()).unwrap(),
                HeaderValue::from_str(v).unwrap(),
            );
        }
        h
    }

    #[test]
    fn accepts_valid_credentials() {
        let h = headers(&[("agent_id", "agent-1"), ("agent_token", "secret-1")]);
        assert_eq!(authenticate(&h, &store()).unwrap(), "agent-1");
    }

    #[test]
    fn rejects_missing_metadata() {
        assert_eq!(
            authenticate(&HeaderMap::new(), &store()).unwrap_err(),
            AuthError::MissingMetadata
        );
    }

    #[test]
    fn rejects_missing_id_or_token() {
        let h = headers(&[("agent_token", "secret-1")]);
        assert_eq!(
            authenticate(&h, &store()).unwrap_err(),
            AuthError::MissingAgentId
        );

        let h = headers(&[("agent_id", "agent-1")]);
        assert_eq!(
            authenticate(&h, &store()).unwrap_err(),
            AuthError::MissingAgentToken
        );
    }

    #[test]
    fn rejects_wrong_token_and_unknown_agent() {
        let h = headers(&[("agent_id", "agent-1"), ("agent_token", "nope")]);
        assert_eq!(
            authenticate(&h, &store()).unwrap_err(),
            AuthError::InvalidCredentials
        );

        let h = headers(&[("agent_id", "ghost"), ("agent_token", "secret-1")]);
        assert_eq!(
            authenticate(&h, &store()).unwrap_err(),
            AuthError::InvalidCredentials
        );
    }
}
