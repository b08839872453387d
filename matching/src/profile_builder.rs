//! Profile embedding builder
//!
//! Profile embeddings are regenerated only when the canonical profile text
//! actually changes: the sha256 of the text is compared against the stored
//! `source_text_hash` before any embedding call is made.

use anyhow::{Context, Result};
use grantradar_gateways::EmbeddingClient;
use grantradar_storage::{EntityStore, ProfileRecord};
use sha2::{Digest, Sha256};
use std::sync::Arc;
use tracing::{debug, info};
use uuid::Uuid;

/// Hash of the canonical profile text
pub fn profile_text_hash(text: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(text.as_bytes());
    format!("{:x}", hasher.finalize())
}

/// Whether a profile's embedding is stale for the given canonical text
pub fn needs_refresh(profile: &ProfileRecord, text: &str) -> bool {
    let hash = profile_text_hash(text);
    profile.source_text_hash.as_deref() != Some(hash.as_str())
}

/// Builds and stores profile embeddings
pub struct ProfileBuilder {
    store: EntityStore,
    embeddings: Arc<EmbeddingClient>,
}

impl ProfileBuilder {
    pub fn new(store: EntityStore, embeddings: Arc<EmbeddingClient>) -> Self {
        Self { store, embeddings }
    }

    /// Regenerate the embedding for a user's profile iff the canonical
    /// text changed since the last build. Returns whether a new embedding
    /// was generated.
    pub async fn refresh(&self, user_id: Uuid) -> Result<bool> {
        let Some(profile) = self.store.get_profile(user_id).await? else {
            debug!(%user_id, "no profile to embed");
            return Ok(false);
        };

        let text = profile.to_embedding_text();
        if text.is_empty() {
            debug!(%user_id, "profile has no embeddable content");
            return Ok(false);
        }

        if !needs_refresh(&profile, &text) {
            debug!(%user_id, "profile embedding is current");
            return Ok(false);
        }

        let embedding = self
            .embeddings
            .embed(&text)
            .await
            .context("profile embedding generation failed")?;

        let hash = profile_text_hash(&text);
        self.store
            .update_profile_embedding(user_id, &embedding, &hash)
            .await?;

        info!(%user_id, "profile embedding regenerated");
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn profile(hash: Option<&str>) -> ProfileRecord {
        ProfileRecord {
            user_id: Uuid::new_v4(),
            research_areas: vec!["oncology".to_string()],
            methods: vec![],
            past_grants: vec![],
            institution: None,
            department: None,
            keywords: vec![],
            source_text_hash: hash.map(|s| s.to_string()),
            embedding_updated_at: None,
        }
    }

    #[test]
    fn hash_is_stable_and_hex() {
        let a = profile_text_hash("Research areas: oncology");
        let b = profile_text_hash("Research areas: oncology");
        assert_eq!(a, b);
        assert_eq!(a.len(), 64);
    }

    #[test]
    fn unchanged_text_needs_no_refresh() {
        let p = profile(None);
        let text = p.to_embedding_text();
        let hash = profile_text_hash(&text);

        let current = profile(Some(&hash));
        assert!(!needs_refresh(&current, &text));
    }

    #[test]
    fn changed_text_triggers_refresh() {
        let p = profile(Some("stale-hash"));
        let text = p.to_embedding_text();
        assert!(needs_refresh(&p, &text));
    }

    #[test]
    fn missing_hash_triggers_refresh() {
        let p = profile(None);
        let text = p.to_embedding_text();
        assert!(needs_refresh(&p, &text));
    }
}
