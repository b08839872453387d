//! Grant embedding backfill
//!
//! Curation embeds grants inline; this backfill covers grants whose
//! embedding call failed at validation time (the event records
//! `embedding_generated: false`). Texts are embedded in batches to keep
//! provider calls cheap.

use anyhow::{Context, Result};
use grantradar_gateways::EmbeddingClient;
use grantradar_storage::EntityStore;
use std::sync::Arc;
use tracing::{info, warn};

/// Grants per provider call
pub const EMBED_BATCH_SIZE: usize = 100;
/// Embedding input character budget
const EMBED_TEXT_LIMIT: usize = 8000;

/// Text representation of a grant for embedding, truncated from the right
pub fn grant_embedding_text(title: &str, description: Option<&str>) -> String {
    let mut text = title.to_string();
    if let Some(description) = description {
        text.push(' ');
        text.push_str(description);
    }
    text.chars().take(EMBED_TEXT_LIMIT).collect()
}

/// Backfills embeddings for grants that missed them at validation
pub struct GrantEmbedder {
    store: EntityStore,
    embeddings: Arc<EmbeddingClient>,
}

impl GrantEmbedder {
    pub fn new(store: EntityStore, embeddings: Arc<EmbeddingClient>) -> Self {
        Self { store, embeddings }
    }

    /// Embed up to `limit` grants missing embeddings. Returns how many
    /// were filled in.
    pub async fn backfill(&self, limit: i64) -> Result<usize> {
        let pending = self
            .store
            .grants_missing_embedding(limit)
            .await
            .context("failed to list grants for backfill")?;

        if pending.is_empty() {
            return Ok(0);
        }

        let mut embedded = 0usize;

        for chunk in pending.chunks(EMBED_BATCH_SIZE) {
            let texts: Vec<String> = chunk
                .iter()
                .map(|(_, title, description)| {
                    grant_embedding_text(title, description.as_deref())
                })
                .collect();
            let text_refs: Vec<&str> = texts.iter().map(|t| t.as_str()).collect();

            let vectors = match self.embeddings.embed_batch(&text_refs).await {
                Ok(vectors) => vectors,
                Err(err) => {
                    warn!(error = %err, batch = chunk.len(), "embedding batch failed, stopping backfill");
                    break;
                }
            };

            for ((grant_id, _, _), vector) in chunk.iter().zip(vectors) {
                self.store.set_grant_embedding(*grant_id, &vector).await?;
                embedded += 1;
            }
        }

        info!(embedded, "grant embedding backfill finished");
        Ok(embedded)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn embedding_text_joins_title_and_description() {
        let text = grant_embedding_text("Title", Some("Description"));
        assert_eq!(text, "Title Description");
    }

    #[test]
    fn missing_description_is_just_the_title() {
        assert_eq!(grant_embedding_text("Title", None), "Title");
    }

    #[test]
    fn text_is_truncated_from_the_right() {
        let long = "d".repeat(10_000);
        let text = grant_embedding_text("Title", Some(&long));
        assert_eq!(text.chars().count(), 8000);
        assert!(text.starts_with("Title d"));
    }
}
