//! Credential to identity resolution.

use std::collections::HashMap;

use async_trait::async_trait;

use crate::error::Result;

/// Trait for resolving an access credential to a rate-limiting identity.
///
/// The identity service itself is external to this crate; this trait is the
/// seam where a deployment plugs in its own lookup. Resolution is called at
/// most once per request, before the limiter.
#[async_trait]
pub trait IdentityResolver: Send + Sync {
    /// Resolve a credential to an identity, or `None` if the credential is
    /// unknown. `Err` means the resolver itself was unreachable.
    async fn resolve(&self, credential: &str) -> Result<Option<String>>;
}

/// Resolver backed by a static credential map loaded at startup.
pub struct StaticTokenResolver {
    tokens: HashMap<String, String>,
}

impl StaticTokenResolver {
    /// Create a resolver from a credential-to-identity map.
    pub fn new(tokens: HashMap<String, String>) -> Self {
        Self { tokens }
    }
}

#[async_trait]
impl IdentityResolver for StaticTokenResolver {
    async fn resolve(&self, credential: &str) -> Result<Option<String>> {
        Ok(self.tokens.get(credential).cloned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_known_credential_resolves() {
        let resolver = StaticTokenResolver::new(HashMap::from([(
            "secret".to_string(),
            "user-1".to_string(),
        )]));

        let identity = resolver.resolve("secret").await.unwrap();
        assert_eq!(identity.as_deref(), Some("user-1"));
    }

    #[tokio::test]
    async fn test_unknown_credential_resolves_to_none() {
        let resolver = StaticTokenResolver::new(HashMap::new());
        assert_eq!(resolver.resolve("nope").await.unwrap(), None);
    }
}
