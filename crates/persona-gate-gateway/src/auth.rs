//! Bearer-token authentication at the gateway boundary.
//!
//! The identity provider itself is external; this shim resolves tokens
//! from the config table into a [`CallerIdentity`] that is threaded
//! through the turn explicitly.

use std::collections::HashMap;

use axum::http::{header, HeaderMap};

use persona_gate_core::config::Config;
use persona_gate_tools::CallerIdentity;

#[derive(Clone, Default)]
pub struct TokenVerifier {
    tokens: HashMap<String, CallerIdentity>,
}

impl TokenVerifier {
    pub fn from_config(config: &Config) -> Self {
        let tokens = config
            .auth
            .as_ref()
            .map(|auth| {
                auth.tokens
                    .iter()
                    .map(|entry| {
                        (
                            entry.token.clone(),
                            CallerIdentity {
                                user_id: entry.user_id.clone(),
                                name: entry.name.clone(),
                                email: entry.email.clone(),
                            },
                        )
                    })
                    .collect()
            })
            .unwrap_or_default();
        Self { tokens }
    }

    pub fn verify(&self, token: &str) -> Option<CallerIdentity> {
        self.tokens.get(token).cloned()
    }
}

/// Resolve the request principal from the `Authorization` header.
pub fn authenticate(verifier: &TokenVerifier, headers: &HeaderMap) -> Option<CallerIdentity> {
    let value = headers.get(header::AUTHORIZATION)?.to_str().ok()?;
    let token = value
        .strip_prefix("Bearer ")
        .or_else(|| value.strip_prefix("bearer "))?;
    verifier.verify(token.trim())
}

#[cfg(test)]
mod tests {
    use super::*;
    use persona_gate_core::config::{AuthConfig, TokenEntry};

    fn verifier() -> TokenVerifier {
        let config = Config {
            auth: Some(AuthConfig {
                tokens: vec![TokenEntry {
                    token: "secret-token".into(),
                    user_id: "u1".into(),
                    name: Some("Jess".into()),
                    email: Some("jess@example.com".into()),
                }],
            }),
            ..Default::default()
        };
        TokenVerifier::from_config(&config)
    }

    #[test]
    fn resolves_known_bearer_token() {
        let mut headers = HeaderMap::new();
        headers.insert(header::AUTHORIZATION, "Bearer secret-token".parse().unwrap());

        let caller = authenticate(&verifier(), &headers).unwrap();
        assert_eq!(caller.user_id, "u1");
        assert_eq!(caller.email.as_deref(), Some("jess@example.com"));
    }

    #[test]
    fn rejects_unknown_token() {
        let mut headers = HeaderMap::new();
        headers.insert(header::AUTHORIZATION, "Bearer wrong".parse().unwrap());
        assert!(authenticate(&verifier(), &headers).is_none());
    }

    #[test]
    fn rejects_missing_and_malformed_headers() {
        assert!(authenticate(&verifier(), &HeaderMap::new()).is_none());

        let mut headers = HeaderMap::new();
        headers.insert(header::AUTHORIZATION, "Basic abc".parse().unwrap());
        assert!(authenticate(&verifier(), &headers).is_none());
    }
}
