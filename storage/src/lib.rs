//! Entity store for GrantRadar
//!
//! Downstream agents read authoritative records from here; the bus carries
//! only envelopes. Writes are idempotent: grants upsert on
//! (source, external_id), matches on (grant_id, user_id), and alert
//! deliveries are append-only.

pub mod migrations;
pub mod models;

use anyhow::{Context, Result};
use chrono::Utc;
use grantradar_config::DatabaseSettings;
use sqlx::postgres::PgPoolOptions;
use sqlx::{PgPool, Row};
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};
use uuid::Uuid;

pub use models::{
    embedding_literal, parse_embedding_literal, AlertDeliveryRecord, GrantRecord,
    ManualReviewItem, MatchRecord, NotificationPreferences, ProfileCandidate, ProfileRecord,
    UserRecord,
};

/// Entity store handle backed by a process-scoped connection pool
#[derive(Clone)]
pub struct EntityStore {
    pool: PgPool,
}

impl EntityStore {
    /// Connect with the configured pool bounds and verify the connection
    pub async fn connect(settings: &DatabaseSettings) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .min_connections(settings.pool_min)
            .max_connections(settings.pool_max)
            .acquire_timeout(Duration::from_secs(settings.connect_timeout_secs))
            .connect(&settings.url)
            .await
            .context("failed to create database connection pool")?;

        sqlx::query("SELECT 1")
            .execute(&pool)
            .await
            .context("failed to verify database connection")?;

        info!("entity store connected");
        Ok(Self { pool })
    }

    /// Build from an existing pool (tests)
    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Apply the schema
    pub async fn run_migrations(&self) -> Result<()> {
        migrations::run_migrations(&self.pool).await
    }

    /// Trivial query round trip; returns latency in milliseconds
    pub async fn health_check(&self) -> Result<f64> {
        let start = Instant::now();
        sqlx::query("SELECT 1")
            .execute(&self.pool)
            .await
            .context("store health check failed")?;
        Ok(start.elapsed().as_secs_f64() * 1000.0)
    }

    // =========================================================================
    // Grants
    // =========================================================================

    /// Persist a validated grant, upserting on (source, external_id).
    pub async fn upsert_grant(&self, grant: &GrantRecord) -> Result<()> {
        let embedding = grant.embedding.as_deref().map(embedding_literal);

        sqlx::query(
            r#"
            INSERT INTO grants (
                id, source, sources, external_id, title, description, url,
                agency, amount_min, amount_max, deadline, eligibility,
                categories, keywords, quality_score, confidence_score,
                embedding, posted_at, discovered_at, validated_at
            ) VALUES (
                $1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14,
                $15, $16, $17::vector, $18, $19, $20
            )
            ON CONFLICT (source, external_id) DO UPDATE SET
                sources = EXCLUDED.sources,
                title = EXCLUDED.title,
                description = EXCLUDED.description,
                url = EXCLUDED.url,
                agency = EXCLUDED.agency,
                amount_min = EXCLUDED.amount_min,
                amount_max = EXCLUDED.amount_max,
                deadline = EXCLUDED.deadline,
                eligibility = EXCLUDED.eligibility,
                categories = EXCLUDED.categories,
                keywords = EXCLUDED.keywords,
                quality_score = EXCLUDED.quality_score,
                confidence_score = EXCLUDED.confidence_score,
                embedding = EXCLUDED.embedding,
                validated_at = EXCLUDED.validated_at
            "#,
        )
        .bind(grant.grant_id)
        .bind(&grant.source)
        .bind(&grant.sources)
        .bind(&grant.external_id)
        .bind(&grant.title)
        .bind(&grant.description)
        .bind(&grant.url)
        .bind(&grant.funding_agency)
        .bind(grant.amount_min)
        .bind(grant.amount_max)
        .bind(grant.deadline)
        .bind(&grant.eligibility)
        .bind(&grant.categories)
        .bind(&grant.keywords)
        .bind(grant.quality_score)
        .bind(grant.confidence_score)
        .bind(embedding)
        .bind(grant.posted_at)
        .bind(grant.discovered_at)
        .bind(grant.validated_at)
        .execute(&self.pool)
        .await
        .context("failed to upsert grant")?;

        debug!(grant_id = %grant.grant_id, source = %grant.source, "grant persisted");
        Ok(())
    }

    /// Fetch a grant by id
    pub async fn get_grant(&self, grant_id: Uuid) -> Result<Option<GrantRecord>> {
        let row = sqlx::query(
            r#"
            SELECT id, source, sources, external_id, title, description,
                   url, agency, amount_min, amount_max, deadline,
                   eligibility, categories, keywords, quality_score,
                   confidence_score, embedding::text AS embedding_text,
                   posted_at, discovered_at, validated_at
            FROM grants
            WHERE id = $1
            "#,
        )
        .bind(grant_id)
        .fetch_optional(&self.pool)
        .await
        .context("failed to fetch grant")?;

        let Some(row) = row else {
            return Ok(None);
        };

        let embedding_text: Option<String> = row.try_get("embedding_text")?;

        Ok(Some(GrantRecord {
            grant_id: row.try_get("id")?,
            source: row.try_get("source")?,
            sources: row.try_get("sources")?,
            external_id: row.try_get("external_id")?,
            title: row.try_get("title")?,
            description: row.try_get("description")?,
            url: row.try_get("url")?,
            funding_agency: row.try_get("agency")?,
            amount_min: row.try_get("amount_min")?,
            amount_max: row.try_get("amount_max")?,
            deadline: row.try_get("deadline")?,
            eligibility: row.try_get("eligibility")?,
            categories: row.try_get("categories")?,
            keywords: row.try_get("keywords")?,
            quality_score: row.try_get("quality_score")?,
            confidence_score: row.try_get("confidence_score")?,
            embedding: embedding_text.map(|text| parse_embedding_literal(&text)),
            posted_at: row.try_get("posted_at")?,
            discovered_at: row.try_get("discovered_at")?,
            validated_at: row.try_get("validated_at")?,
        }))
    }

    /// Look up an existing grant id by identity
    pub async fn find_grant_id(&self, source: &str, external_id: &str) -> Result<Option<Uuid>> {
        let row = sqlx::query("SELECT id FROM grants WHERE source = $1 AND external_id = $2")
            .bind(source)
            .bind(external_id)
            .fetch_optional(&self.pool)
            .await
            .context("failed to look up grant by identity")?;

        Ok(row.map(|r| r.get("id")))
    }

    // =========================================================================
    // Users and profiles
    // =========================================================================

    /// Fetch a user with notification preferences
    pub async fn get_user(&self, user_id: Uuid) -> Result<Option<UserRecord>> {
        let row = sqlx::query(
            r#"
            SELECT id, name, email, phone, slack_webhook_url,
                   email_notifications, sms_notifications, slack_notifications,
                   digest_frequency, minimum_match_score
            FROM users
            WHERE id = $1
            "#,
        )
        .bind(user_id)
        .fetch_optional(&self.pool)
        .await
        .context("failed to fetch user")?;

        let Some(row) = row else {
            return Ok(None);
        };

        Ok(Some(UserRecord {
            user_id: row.try_get("id")?,
            name: row.try_get("name")?,
            email: row.try_get("email")?,
            phone: row.try_get("phone")?,
            slack_webhook_url: row.try_get("slack_webhook_url")?,
            preferences: NotificationPreferences {
                email_notifications: row.try_get("email_notifications")?,
                sms_notifications: row.try_get("sms_notifications")?,
                slack_notifications: row.try_get("slack_notifications")?,
                digest_frequency: row.try_get("digest_frequency")?,
                minimum_match_score: row.try_get("minimum_match_score")?,
            },
        }))
    }

    /// Fetch a user's research profile
    pub async fn get_profile(&self, user_id: Uuid) -> Result<Option<ProfileRecord>> {
        let row = sqlx::query(
            r#"
            SELECT user_id, research_areas, methods, past_grants, institution,
                   department, keywords, source_text_hash, embedding_updated_at
            FROM lab_profiles
            WHERE user_id = $1
            "#,
        )
        .bind(user_id)
        .fetch_optional(&self.pool)
        .await
        .context("failed to fetch profile")?;

        let Some(row) = row else {
            return Ok(None);
        };

        Ok(Some(profile_from_row(&row)?))
    }

    /// Store a freshly generated profile embedding with its source hash
    pub async fn update_profile_embedding(
        &self,
        user_id: Uuid,
        embedding: &[f32],
        source_text_hash: &str,
    ) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE lab_profiles
            SET profile_embedding = $2::vector,
                source_text_hash = $3,
                embedding_updated_at = $4
            WHERE user_id = $1
            "#,
        )
        .bind(user_id)
        .bind(embedding_literal(embedding))
        .bind(source_text_hash)
        .bind(Utc::now())
        .execute(&self.pool)
        .await
        .context("failed to update profile embedding")?;

        debug!(%user_id, "profile embedding updated");
        Ok(())
    }

    /// Phase-1 candidate selection: profiles whose embedding cosine
    /// similarity to the grant exceeds `threshold`, best first.
    pub async fn similar_profiles(
        &self,
        grant_embedding: &[f32],
        threshold: f64,
        limit: i64,
    ) -> Result<Vec<ProfileCandidate>> {
        let literal = embedding_literal(grant_embedding);

        let rows = sqlx::query(
            r#"
            SELECT lp.user_id,
                   1 - (lp.profile_embedding <=> $1::vector) AS similarity,
                   lp.research_areas, lp.methods, lp.past_grants,
                   lp.institution, lp.department, lp.keywords,
                   lp.source_text_hash, lp.embedding_updated_at
            FROM lab_profiles lp
            WHERE lp.profile_embedding IS NOT NULL
              AND 1 - (lp.profile_embedding <=> $1::vector) > $2
            ORDER BY similarity DESC
            LIMIT $3
            "#,
        )
        .bind(&literal)
        .bind(threshold)
        .bind(limit)
        .fetch_all(&self.pool)
        .await
        .context("vector similarity query failed")?;

        let mut candidates = Vec::with_capacity(rows.len());
        for row in rows {
            let similarity: f64 = row.try_get("similarity")?;
            candidates.push(ProfileCandidate {
                profile: profile_from_row(&row)?,
                vector_similarity: similarity,
            });
        }

        Ok(candidates)
    }

    // =========================================================================
    // Matches
    // =========================================================================

    /// Upsert a match, keyed on (grant_id, user_id) — safe under retry.
    pub async fn upsert_match(&self, record: &MatchRecord) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO matches (
                id, grant_id, user_id, match_score, vector_similarity,
                llm_match_score, reasoning, key_strengths, concerns,
                predicted_success, created_at
            ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)
            ON CONFLICT (grant_id, user_id) DO UPDATE SET
                match_score = EXCLUDED.match_score,
                vector_similarity = EXCLUDED.vector_similarity,
                llm_match_score = EXCLUDED.llm_match_score,
                reasoning = EXCLUDED.reasoning,
                key_strengths = EXCLUDED.key_strengths,
                concerns = EXCLUDED.concerns,
                predicted_success = EXCLUDED.predicted_success,
                created_at = EXCLUDED.created_at
            "#,
        )
        .bind(record.match_id)
        .bind(record.grant_id)
        .bind(record.user_id)
        .bind(record.final_score)
        .bind(record.vector_similarity)
        .bind(record.llm_match_score)
        .bind(&record.reasoning)
        .bind(&record.key_strengths)
        .bind(&record.concerns)
        .bind(record.predicted_success)
        .bind(record.created_at)
        .execute(&self.pool)
        .await
        .context("failed to upsert match")?;

        Ok(())
    }

    /// Fetch an existing match by identity
    pub async fn get_match(&self, grant_id: Uuid, user_id: Uuid) -> Result<Option<MatchRecord>> {
        let row = sqlx::query(
            r#"
            SELECT id, grant_id, user_id, match_score, vector_similarity,
                   llm_match_score, reasoning, key_strengths, concerns,
                   predicted_success, created_at
            FROM matches
            WHERE grant_id = $1 AND user_id = $2
            "#,
        )
        .bind(grant_id)
        .bind(user_id)
        .fetch_optional(&self.pool)
        .await
        .context("failed to fetch match")?;

        let Some(row) = row else {
            return Ok(None);
        };

        Ok(Some(MatchRecord {
            match_id: row.try_get("id")?,
            grant_id: row.try_get("grant_id")?,
            user_id: row.try_get("user_id")?,
            final_score: row.try_get("match_score")?,
            vector_similarity: row.try_get("vector_similarity")?,
            llm_match_score: row.try_get("llm_match_score")?,
            reasoning: row.try_get("reasoning")?,
            key_strengths: row.try_get("key_strengths")?,
            concerns: row.try_get("concerns")?,
            predicted_success: row.try_get("predicted_success")?,
            created_at: row.try_get("created_at")?,
        }))
    }

    // =========================================================================
    // Alert deliveries
    // =========================================================================

    /// Append one delivery attempt record
    pub async fn record_delivery(&self, record: &AlertDeliveryRecord) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO alert_deliveries (
                id, match_id, channel, status, sent_at, delivered_at,
                provider_message_id, retry_count, error_message,
                latency_seconds
            ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
            "#,
        )
        .bind(record.alert_id)
        .bind(record.match_id)
        .bind(&record.channel)
        .bind(&record.status)
        .bind(record.sent_at)
        .bind(record.delivered_at)
        .bind(&record.provider_message_id)
        .bind(record.retry_count)
        .bind(&record.error_message)
        .bind(record.latency_seconds)
        .execute(&self.pool)
        .await
        .context("failed to record alert delivery")?;

        Ok(())
    }

    /// Channels already attempted for a match with their latest status.
    ///
    /// Used as the idempotency check before re-sending: a channel whose
    /// latest attempt is sent/delivered must not be retried.
    pub async fn deliveries_for_match(&self, match_id: Uuid) -> Result<Vec<(String, String)>> {
        let rows = sqlx::query(
            r#"
            SELECT DISTINCT ON (channel) channel, status
            FROM alert_deliveries
            WHERE match_id = $1
            ORDER BY channel, created_at DESC
            "#,
        )
        .bind(match_id)
        .fetch_all(&self.pool)
        .await
        .context("failed to fetch deliveries for match")?;

        Ok(rows
            .into_iter()
            .map(|row| (row.get("channel"), row.get("status")))
            .collect())
    }

    /// Update a delivery's status from a provider webhook, matched by the
    /// provider's message id. Returns whether a row was updated.
    pub async fn update_delivery_status(
        &self,
        provider_message_id: &str,
        status: &str,
        delivered_at: Option<chrono::DateTime<Utc>>,
    ) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE alert_deliveries
            SET status = $2,
                delivered_at = COALESCE($3, delivered_at)
            WHERE provider_message_id = $1
            "#,
        )
        .bind(provider_message_id)
        .bind(status)
        .bind(delivered_at)
        .execute(&self.pool)
        .await
        .context("failed to update delivery status")?;

        Ok(result.rows_affected() > 0)
    }

    // =========================================================================
    // Maintenance
    // =========================================================================

    /// Grants persisted without an embedding, oldest first
    pub async fn grants_missing_embedding(
        &self,
        limit: i64,
    ) -> Result<Vec<(Uuid, String, Option<String>)>> {
        let rows = sqlx::query(
            r#"
            SELECT id, title, description
            FROM grants
            WHERE embedding IS NULL
            ORDER BY validated_at ASC
            LIMIT $1
            "#,
        )
        .bind(limit)
        .fetch_all(&self.pool)
        .await
        .context("failed to list grants missing embeddings")?;

        rows.into_iter()
            .map(|row| {
                Ok((
                    row.try_get("id")?,
                    row.try_get("title")?,
                    row.try_get("description")?,
                ))
            })
            .collect()
    }

    /// Backfill a grant's embedding
    pub async fn set_grant_embedding(&self, grant_id: Uuid, embedding: &[f32]) -> Result<()> {
        sqlx::query("UPDATE grants SET embedding = $2::vector WHERE id = $1")
            .bind(grant_id)
            .bind(embedding_literal(embedding))
            .execute(&self.pool)
            .await
            .context("failed to set grant embedding")?;
        Ok(())
    }

    /// Every user with a research profile
    pub async fn all_profile_user_ids(&self) -> Result<Vec<Uuid>> {
        let rows = sqlx::query("SELECT user_id FROM lab_profiles")
            .fetch_all(&self.pool)
            .await
            .context("failed to list profile user ids")?;

        Ok(rows.into_iter().map(|row| row.get("user_id")).collect())
    }

    // =========================================================================
    // Manual review
    // =========================================================================

    /// Append a grant to the human review queue
    pub async fn append_manual_review(&self, item: &ManualReviewItem) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO manual_review_items (
                grant_id, reason, quality_score, issues, grant_snapshot,
                created_at
            ) VALUES ($1, $2, $3, $4, $5, $6)
            "#,
        )
        .bind(item.grant_id)
        .bind(&item.reason)
        .bind(item.quality_score)
        .bind(&item.issues)
        .bind(&item.grant_snapshot)
        .bind(item.created_at)
        .execute(&self.pool)
        .await
        .context("failed to append manual review item")?;

        warn!(grant_id = %item.grant_id, reason = %item.reason, "grant routed to manual review");
        Ok(())
    }
}

fn profile_from_row(row: &sqlx::postgres::PgRow) -> Result<ProfileRecord> {
    Ok(ProfileRecord {
        user_id: row.try_get("user_id")?,
        research_areas: row.try_get("research_areas")?,
        methods: row.try_get("methods")?,
        past_grants: row.try_get("past_grants")?,
        institution: row.try_get("institution")?,
        department: row.try_get("department")?,
        keywords: row.try_get("keywords")?,
        source_text_hash: row.try_get("source_text_hash")?,
        embedding_updated_at: row.try_get("embedding_updated_at")?,
    })
}
