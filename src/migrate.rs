use anyhow::Result;
use sqlx::SqlitePool;

use crate::config::Config;
use crate::db;

/// Create every table and index the engine needs. Idempotent.
pub async fn run_migrations(config: &Config) -> Result<()> {
    let pool = db::connect(config).await?;
    apply(&pool).await?;
    pool.close().await;
    Ok(())
}

/// Apply the schema to an already-open pool.
pub async fn apply(pool: &SqlitePool) -> Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS documents (
            id TEXT PRIMARY KEY,
            source_url TEXT,
            body TEXT NOT NULL,
            content_hash TEXT NOT NULL,
            ingested_at INTEGER NOT NULL,
            status TEXT NOT NULL DEFAULT 'pending',
            next_block INTEGER NOT NULL DEFAULT 0
        )
        "#,
    )
    .execute(pool)
    .await?;

    // Block high-water marks of deleted documents
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS retired_blocks (
            document_id TEXT PRIMARY KEY,
            next_block INTEGER NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    // Vector index: one row per passage, with the passage metadata
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS passage_vectors (
            block_id TEXT PRIMARY KEY,
            document_id TEXT NOT NULL,
            ordinal INTEGER NOT NULL,
            heading TEXT,
            text TEXT NOT NULL,
            hash TEXT NOT NULL,
            model TEXT NOT NULL,
            dims INTEGER NOT NULL,
            embedding BLOB NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    // FTS5 CREATE is not idempotent natively, so we check first
    let fts_exists: bool = sqlx::query_scalar(
        "SELECT COUNT(*) > 0 FROM sqlite_master WHERE type='table' AND name='passages_fts'",
    )
    .fetch_one(pool)
    .await?;

    if !fts_exists {
        sqlx::query(
            r#"
            CREATE VIRTUAL TABLE passages_fts USING fts5(
                block_id UNINDEXED,
                document_id UNINDEXED,
                ordinal UNINDEXED,
                heading UNINDEXED,
                text
            )
            "#,
        )
        .execute(pool)
        .await?;
    }

    sqlx::query(
        "CREATE INDEX IF NOT EXISTS idx_passage_vectors_document_id ON passage_vectors(document_id)",
    )
    .execute(pool)
    .await?;
    sqlx::query(
        "CREATE INDEX IF NOT EXISTS idx_documents_ingested_at ON documents(ingested_at DESC)",
    )
    .execute(pool)
    .await?;

    Ok(())
}
