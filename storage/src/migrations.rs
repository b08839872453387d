//! Idempotent schema setup
//!
//! Every statement is CREATE ... IF NOT EXISTS so workers can race on
//! startup without coordination. The embedding columns use pgvector.

use anyhow::{Context, Result};
use sqlx::PgPool;
use tracing::info;

const STATEMENTS: &[&str] = &[
    "CREATE EXTENSION IF NOT EXISTS vector",
    r#"
    CREATE TABLE IF NOT EXISTS grants (
        id UUID PRIMARY KEY,
        source TEXT NOT NULL,
        sources TEXT[] NOT NULL DEFAULT '{}',
        external_id TEXT NOT NULL,
        title TEXT NOT NULL,
        description TEXT,
        url TEXT NOT NULL,
        agency TEXT,
        amount_min DOUBLE PRECISION,
        amount_max DOUBLE PRECISION,
        deadline TIMESTAMPTZ,
        eligibility JSONB,
        categories TEXT[] NOT NULL DEFAULT '{}',
        keywords TEXT[] NOT NULL DEFAULT '{}',
        quality_score DOUBLE PRECISION NOT NULL DEFAULT 0,
        confidence_score DOUBLE PRECISION NOT NULL DEFAULT 1.0,
        embedding vector(1536),
        posted_at TIMESTAMPTZ,
        discovered_at TIMESTAMPTZ NOT NULL,
        validated_at TIMESTAMPTZ NOT NULL,
        created_at TIMESTAMPTZ NOT NULL DEFAULT now(),
        UNIQUE (source, external_id)
    )
    "#,
    "CREATE INDEX IF NOT EXISTS idx_grants_deadline ON grants (deadline)",
    r#"
    CREATE TABLE IF NOT EXISTS users (
        id UUID PRIMARY KEY,
        name TEXT,
        email TEXT NOT NULL,
        phone TEXT,
        slack_webhook_url TEXT,
        email_notifications BOOLEAN NOT NULL DEFAULT TRUE,
        sms_notifications BOOLEAN NOT NULL DEFAULT FALSE,
        slack_notifications BOOLEAN NOT NULL DEFAULT FALSE,
        digest_frequency TEXT NOT NULL DEFAULT 'immediate',
        minimum_match_score DOUBLE PRECISION NOT NULL DEFAULT 0.7,
        created_at TIMESTAMPTZ NOT NULL DEFAULT now()
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS lab_profiles (
        user_id UUID PRIMARY KEY REFERENCES users (id),
        research_areas TEXT[] NOT NULL DEFAULT '{}',
        methods TEXT[] NOT NULL DEFAULT '{}',
        past_grants TEXT[] NOT NULL DEFAULT '{}',
        institution TEXT,
        department TEXT,
        keywords TEXT[] NOT NULL DEFAULT '{}',
        profile_embedding vector(1536),
        source_text_hash TEXT,
        embedding_updated_at TIMESTAMPTZ
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS matches (
        id UUID PRIMARY KEY,
        grant_id UUID NOT NULL,
        user_id UUID NOT NULL,
        match_score DOUBLE PRECISION NOT NULL,
        vector_similarity DOUBLE PRECISION NOT NULL,
        llm_match_score DOUBLE PRECISION NOT NULL,
        reasoning TEXT NOT NULL DEFAULT '',
        key_strengths TEXT[] NOT NULL DEFAULT '{}',
        concerns TEXT[] NOT NULL DEFAULT '{}',
        predicted_success DOUBLE PRECISION NOT NULL DEFAULT 0,
        created_at TIMESTAMPTZ NOT NULL,
        UNIQUE (grant_id, user_id)
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS alert_deliveries (
        id UUID PRIMARY KEY,
        match_id UUID NOT NULL,
        channel TEXT NOT NULL,
        status TEXT NOT NULL,
        sent_at TIMESTAMPTZ,
        delivered_at TIMESTAMPTZ,
        provider_message_id TEXT,
        retry_count INTEGER NOT NULL DEFAULT 0,
        error_message TEXT,
        latency_seconds DOUBLE PRECISION,
        created_at TIMESTAMPTZ NOT NULL DEFAULT now()
    )
    "#,
    "CREATE INDEX IF NOT EXISTS idx_alert_deliveries_match ON alert_deliveries (match_id)",
    r#"
    CREATE TABLE IF NOT EXISTS manual_review_items (
        id UUID PRIMARY KEY DEFAULT gen_random_uuid(),
        grant_id UUID NOT NULL,
        reason TEXT NOT NULL,
        quality_score DOUBLE PRECISION NOT NULL,
        issues TEXT[] NOT NULL DEFAULT '{}',
        grant_snapshot JSONB NOT NULL,
        created_at TIMESTAMPTZ NOT NULL
    )
    "#,
];

/// Apply the schema
pub async fn run_migrations(pool: &PgPool) -> Result<()> {
    for statement in STATEMENTS {
        sqlx::query(statement)
            .execute(pool)
            .await
            .with_context(|| format!("migration failed: {}", statement.lines().nth(1).unwrap_or(statement).trim()))?;
    }
    info!("entity store schema up to date");
    Ok(())
}
