//! SQLite-backed [`Store`] implementation.
//!
//! - Vector index: `passage_vectors`, little-endian f32 BLOBs searched by
//!   brute-force cosine similarity over the document-filtered rows.
//! - Lexical index: the `passages_fts` FTS5 table ranked with `bm25()`. FTS5
//!   returns negative ranks (lower is better); the store negates them and
//!   saturates into `[0, 1)` so scores are comparable with the in-memory
//!   backend.
//!
//! A passage counts as indexed only while it has a row in both tables.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqlitePool};

use snapmind_core::embedding::{blob_to_vec, cosine_similarity, vec_to_blob};
use snapmind_core::error::{Error, Result};
use snapmind_core::fusion::Candidate;
use snapmind_core::lexical::saturate;
use snapmind_core::models::{BlockId, Document, IndexStatus, Passage};
use snapmind_core::store::{DocumentSummary, IndexedText, Store};

/// SQLite implementation of the [`Store`] trait.
pub struct SqliteStore {
    pool: SqlitePool,
}

impl SqliteStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    pub async fn close(&self) {
        self.pool.close().await;
    }
}

fn db_err(err: sqlx::Error) -> Error {
    Error::storage(err)
}

/// Build an FTS5 MATCH expression from normalized terms: each term quoted,
/// joined with `OR`.
pub fn fts_match_expression(terms: &[String]) -> String {
    terms
        .iter()
        .map(|t| format!("\"{}\"", t.replace('"', "")))
        .collect::<Vec<_>>()
        .join(" OR ")
}

fn ts_from_millis(ms: i64) -> DateTime<Utc> {
    DateTime::from_timestamp_millis(ms).unwrap_or_default()
}

fn document_from_row(row: &SqliteRow) -> Result<Document> {
    let status: String = row.get("status");
    let next_block: i64 = row.get("next_block");
    Ok(Document {
        id: row.get("id"),
        source_url: row.get("source_url"),
        body: row.get("body"),
        content_hash: row.get("content_hash"),
        ingested_at: ts_from_millis(row.get("ingested_at")),
        status: status.parse()?,
        next_block: next_block.max(0) as u64,
    })
}

fn passage_from_row(row: &SqliteRow) -> Result<Passage> {
    let block_id: String = row.get("block_id");
    let document_id: String = row.get("document_id");
    let ordinal: i64 = row.get("ordinal");
    let text: String = row.get("text");
    let heading: Option<String> = row.get("heading");
    Passage::new(
        BlockId::parse(&block_id)?,
        &document_id,
        ordinal.max(0) as u32,
        text,
        heading,
    )
}

fn candidate_from_row(row: &SqliteRow, score: f64) -> Result<Candidate> {
    let block_id: String = row.get("block_id");
    Ok(Candidate {
        block_id: BlockId::parse(&block_id)?,
        document_id: row.get("document_id"),
        score,
        text: row.get("text"),
        heading: row.get("heading"),
    })
}

#[async_trait]
impl Store for SqliteStore {
    async fn upsert_document(&self, doc: &Document) -> Result<()> {
        let mut tx = self.pool.begin().await.map_err(db_err)?;

        sqlx::query(
            r#"
            INSERT INTO documents (id, source_url, body, content_hash, ingested_at, status, next_block)
            VALUES (?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(id) DO UPDATE SET
                source_url = excluded.source_url,
                body = excluded.body,
                content_hash = excluded.content_hash,
                ingested_at = excluded.ingested_at,
                status = excluded.status,
                next_block = excluded.next_block
            "#,
        )
        .bind(&doc.id)
        .bind(&doc.source_url)
        .bind(&doc.body)
        .bind(&doc.content_hash)
        .bind(doc.ingested_at.timestamp_millis())
        .bind(doc.status.as_str())
        .bind(doc.next_block as i64)
        .execute(&mut *tx)
        .await
        .map_err(db_err)?;

        sqlx::query("DELETE FROM retired_blocks WHERE document_id = ?")
            .bind(&doc.id)
            .execute(&mut *tx)
            .await
            .map_err(db_err)?;

        tx.commit().await.map_err(db_err)
    }

    async fn get_document(&self, id: &str) -> Result<Option<Document>> {
        let row = sqlx::query(
            "SELECT id, source_url, body, content_hash, ingested_at, status, next_block FROM documents WHERE id = ?",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await
        .map_err(db_err)?;

        row.as_ref().map(document_from_row).transpose()
    }

    async fn set_document_status(&self, id: &str, status: IndexStatus) -> Result<()> {
        let result = sqlx::query("UPDATE documents SET status = ? WHERE id = ?")
            .bind(status.as_str())
            .bind(id)
            .execute(&self.pool)
            .await
            .map_err(db_err)?;
        if result.rows_affected() == 0 {
            return Err(Error::Storage(format!("no such document: {}", id)));
        }
        Ok(())
    }

    async fn list_documents(&self) -> Result<Vec<DocumentSummary>> {
        let rows = sqlx::query(
            r#"
            SELECT d.id, d.source_url, d.status, d.ingested_at,
                   (SELECT COUNT(*) FROM passage_vectors v
                     WHERE v.document_id = d.id
                       AND EXISTS (SELECT 1 FROM passages_fts f WHERE f.block_id = v.block_id)
                   ) AS passage_count
            FROM documents d
            ORDER BY d.ingested_at DESC, d.id ASC
            "#,
        )
        .fetch_all(&self.pool)
        .await
        .map_err(db_err)?;

        rows.iter()
            .map(|row| {
                let status: String = row.get("status");
                let count: i64 = row.get("passage_count");
                Ok(DocumentSummary {
                    id: row.get("id"),
                    source_url: row.get("source_url"),
                    status: status.parse()?,
                    ingested_at: ts_from_millis(row.get("ingested_at")),
                    passage_count: count.max(0) as usize,
                })
            })
            .collect()
    }

    async fn delete_document(&self, id: &str) -> Result<bool> {
        let mut tx = self.pool.begin().await.map_err(db_err)?;

        let next_block: Option<i64> =
            sqlx::query_scalar("SELECT next_block FROM documents WHERE id = ?")
                .bind(id)
                .fetch_optional(&mut *tx)
                .await
                .map_err(db_err)?;
        let Some(next_block) = next_block else {
            return Ok(false);
        };

        sqlx::query("DELETE FROM passage_vectors WHERE document_id = ?")
            .bind(id)
            .execute(&mut *tx)
            .await
            .map_err(db_err)?;
        sqlx::query("DELETE FROM passages_fts WHERE document_id = ?")
            .bind(id)
            .execute(&mut *tx)
            .await
            .map_err(db_err)?;
        sqlx::query("DELETE FROM documents WHERE id = ?")
            .bind(id)
            .execute(&mut *tx)
            .await
            .map_err(db_err)?;
        sqlx::query(
            r#"
            INSERT INTO retired_blocks (document_id, next_block) VALUES (?, ?)
            ON CONFLICT(document_id) DO UPDATE SET
                next_block = MAX(next_block, excluded.next_block)
            "#,
        )
        .bind(id)
        .bind(next_block)
        .execute(&mut *tx)
        .await
        .map_err(db_err)?;

        tx.commit().await.map_err(db_err)?;
        Ok(true)
    }

    async fn next_block(&self, document_id: &str) -> Result<u64> {
        let max: Option<i64> = sqlx::query_scalar(
            r#"
            SELECT MAX(n) FROM (
                SELECT next_block AS n FROM documents WHERE id = ?
                UNION ALL
                SELECT next_block AS n FROM retired_blocks WHERE document_id = ?
            )
            "#,
        )
        .bind(document_id)
        .bind(document_id)
        .fetch_one(&self.pool)
        .await
        .map_err(db_err)?;
        Ok(max.unwrap_or(0).max(0) as u64)
    }

    async fn upsert_vector(&self, passage: &Passage, vector: &[f32], model: &str) -> Result<()> {
        let blob = vec_to_blob(vector);
        sqlx::query(
            r#"
            INSERT INTO passage_vectors (block_id, document_id, ordinal, heading, text, hash, model, dims, embedding)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(block_id) DO UPDATE SET
                document_id = excluded.document_id,
                ordinal = excluded.ordinal,
                heading = excluded.heading,
                text = excluded.text,
                hash = excluded.hash,
                model = excluded.model,
                dims = excluded.dims,
                embedding = excluded.embedding
            "#,
        )
        .bind(passage.block_id().as_str())
        .bind(passage.document_id())
        .bind(passage.ordinal() as i64)
        .bind(passage.heading())
        .bind(passage.text())
        .bind(passage.hash())
        .bind(model)
        .bind(vector.len() as i64)
        .bind(&blob)
        .execute(&self.pool)
        .await
        .map_err(|e| Error::IndexWrite {
            block_id: passage.block_id().to_string(),
            message: e.to_string(),
        })?;
        Ok(())
    }

    async fn upsert_lexical(&self, passage: &Passage) -> Result<()> {
        let write_err = |e: sqlx::Error| Error::IndexWrite {
            block_id: passage.block_id().to_string(),
            message: e.to_string(),
        };
        let mut tx = self.pool.begin().await.map_err(write_err)?;

        sqlx::query("DELETE FROM passages_fts WHERE block_id = ?")
            .bind(passage.block_id().as_str())
            .execute(&mut *tx)
            .await
            .map_err(write_err)?;
        sqlx::query(
            "INSERT INTO passages_fts (block_id, document_id, ordinal, heading, text) VALUES (?, ?, ?, ?, ?)",
        )
        .bind(passage.block_id().as_str())
        .bind(passage.document_id())
        .bind(passage.ordinal() as i64)
        .bind(passage.heading())
        .bind(passage.text())
        .execute(&mut *tx)
        .await
        .map_err(write_err)?;

        tx.commit().await.map_err(write_err)
    }

    async fn remove_passage(&self, block_id: &BlockId) -> Result<()> {
        let mut tx = self.pool.begin().await.map_err(db_err)?;
        sqlx::query("DELETE FROM passage_vectors WHERE block_id = ?")
            .bind(block_id.as_str())
            .execute(&mut *tx)
            .await
            .map_err(db_err)?;
        sqlx::query("DELETE FROM passages_fts WHERE block_id = ?")
            .bind(block_id.as_str())
            .execute(&mut *tx)
            .await
            .map_err(db_err)?;
        tx.commit().await.map_err(db_err)
    }

    async fn clear_passages(&self, document_id: &str) -> Result<()> {
        let mut tx = self.pool.begin().await.map_err(db_err)?;
        sqlx::query("DELETE FROM passage_vectors WHERE document_id = ?")
            .bind(document_id)
            .execute(&mut *tx)
            .await
            .map_err(db_err)?;
        sqlx::query("DELETE FROM passages_fts WHERE document_id = ?")
            .bind(document_id)
            .execute(&mut *tx)
            .await
            .map_err(db_err)?;
        tx.commit().await.map_err(db_err)
    }

    async fn list_passages(&self, document_id: &str) -> Result<Vec<Passage>> {
        let rows = sqlx::query(
            r#"
            SELECT v.block_id, v.document_id, v.ordinal, v.heading, v.text
            FROM passage_vectors v
            WHERE v.document_id = ?
              AND EXISTS (SELECT 1 FROM passages_fts f WHERE f.block_id = v.block_id)
            ORDER BY v.ordinal ASC
            "#,
        )
        .bind(document_id)
        .fetch_all(&self.pool)
        .await
        .map_err(db_err)?;

        rows.iter().map(passage_from_row).collect()
    }

    async fn indexed_text(&self, block_id: &BlockId) -> Result<IndexedText> {
        let vector_text: Option<String> =
            sqlx::query_scalar("SELECT text FROM passage_vectors WHERE block_id = ?")
                .bind(block_id.as_str())
                .fetch_optional(&self.pool)
                .await
                .map_err(db_err)?;
        let lexical_text: Option<String> =
            sqlx::query_scalar("SELECT text FROM passages_fts WHERE block_id = ?")
                .bind(block_id.as_str())
                .fetch_optional(&self.pool)
                .await
                .map_err(db_err)?;
        Ok(IndexedText {
            vector_text,
            lexical_text,
        })
    }

    async fn vector_search(
        &self,
        query_vec: &[f32],
        document_id: Option<&str>,
        limit: usize,
        min_similarity: f64,
    ) -> Result<Vec<Candidate>> {
        let rows = sqlx::query(
            r#"
            SELECT v.block_id, v.document_id, v.heading, v.text, v.embedding
            FROM passage_vectors v
            WHERE (? IS NULL OR v.document_id = ?)
              AND EXISTS (SELECT 1 FROM passages_fts f WHERE f.block_id = v.block_id)
            "#,
        )
        .bind(document_id)
        .bind(document_id)
        .fetch_all(&self.pool)
        .await
        .map_err(db_err)?;

        let mut candidates = Vec::new();
        for row in &rows {
            let blob: Vec<u8> = row.get("embedding");
            let similarity = cosine_similarity(query_vec, &blob_to_vec(&blob)) as f64;
            if similarity >= min_similarity {
                candidates.push(candidate_from_row(row, similarity)?);
            }
        }

        candidates.sort_by(|a, b| {
            b.score
                .total_cmp(&a.score)
                .then_with(|| a.block_id.cmp(&b.block_id))
        });
        candidates.truncate(limit);
        Ok(candidates)
    }

    async fn lexical_search(
        &self,
        terms: &[String],
        document_id: Option<&str>,
        limit: usize,
    ) -> Result<Vec<Candidate>> {
        if terms.is_empty() {
            return Ok(Vec::new());
        }

        let rows = sqlx::query(
            r#"
            SELECT block_id, document_id, heading, text, bm25(passages_fts) AS score
            FROM passages_fts
            WHERE passages_fts MATCH ?
              AND (? IS NULL OR document_id = ?)
              AND EXISTS (SELECT 1 FROM passage_vectors v WHERE v.block_id = passages_fts.block_id)
            ORDER BY score
            LIMIT ?
            "#,
        )
        .bind(fts_match_expression(terms))
        .bind(document_id)
        .bind(document_id)
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await
        .map_err(db_err)?;

        rows.iter()
            .map(|row| {
                let bm25: f64 = row.get("score");
                candidate_from_row(row, saturate(-bm25))
            })
            .collect()
    }

    async fn count_indexed_passages(&self, document_id: Option<&str>) -> Result<usize> {
        let count: i64 = sqlx::query_scalar(
            r#"
            SELECT COUNT(*) FROM passage_vectors v
            WHERE (? IS NULL OR v.document_id = ?)
              AND EXISTS (SELECT 1 FROM passages_fts f WHERE f.block_id = v.block_id)
            "#,
        )
        .bind(document_id)
        .bind(document_id)
        .fetch_one(&self.pool)
        .await
        .map_err(db_err)?;
        Ok(count.max(0) as usize)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::{db, migrate};
    use snapmind_core::lexical::normalize_query;
    use tempfile::TempDir;

    async fn temp_store() -> (TempDir, SqliteStore) {
        let tmp = TempDir::new().unwrap();
        let db_path = tmp.path().join("test.sqlite");
        let config: Config =
            toml::from_str(&format!("[db]\npath = \"{}\"\n", db_path.display())).unwrap();
        let pool = db::connect(&config).await.unwrap();
        migrate::apply(&pool).await.unwrap();
        (tmp, SqliteStore::new(pool))
    }

    fn passage(doc: &str, n: u64, text: &str) -> Passage {
        Passage::new(BlockId::new(doc, n), doc, n as u32, text, Some("Intro".into())).unwrap()
    }

    async fn index(store: &SqliteStore, p: &Passage, v: &[f32]) {
        store.upsert_vector(p, v, "test-model").await.unwrap();
        store.upsert_lexical(p).await.unwrap();
    }

    #[test]
    fn test_fts_match_expression() {
        let terms = vec!["rust".to_string(), "tokio".to_string()];
        assert_eq!(fts_match_expression(&terms), "\"rust\" OR \"tokio\"");
    }

    #[tokio::test]
    async fn test_document_roundtrip_and_status() {
        let (_tmp, store) = temp_store().await;
        let doc = Document::new(Some("https://example.com/a/"), "body text", Utc::now());
        store.upsert_document(&doc).await.unwrap();

        let loaded = store.get_document(&doc.id).await.unwrap().unwrap();
        assert_eq!(loaded.source_url.as_deref(), Some("https://example.com/a"));
        assert_eq!(loaded.status, IndexStatus::Pending);

        store
            .set_document_status(&doc.id, IndexStatus::Indexed)
            .await
            .unwrap();
        let loaded = store.get_document(&doc.id).await.unwrap().unwrap();
        assert_eq!(loaded.status, IndexStatus::Indexed);
        assert!(store
            .set_document_status("doc-missing", IndexStatus::Failed)
            .await
            .is_err());
    }

    #[tokio::test]
    async fn test_searches_respect_filter_and_pairing() {
        let (_tmp, store) = temp_store().await;
        index(&store, &passage("doc-a", 0, "tokio runtime scheduling"), &[1.0, 0.0]).await;
        index(&store, &passage("doc-b", 0, "tokio channels and tasks"), &[0.9, 0.1]).await;
        // Only half-written: must stay invisible
        store
            .upsert_lexical(&passage("doc-a", 1, "tokio orphan"))
            .await
            .unwrap();

        let terms = normalize_query("tokio");
        let all = store.lexical_search(&terms, None, 10).await.unwrap();
        assert_eq!(all.len(), 2);
        assert!(all.iter().all(|c| c.score > 0.0 && c.score < 1.0));

        let scoped = store.lexical_search(&terms, Some("doc-a"), 10).await.unwrap();
        assert_eq!(scoped.len(), 1);
        assert_eq!(scoped[0].heading.as_deref(), Some("Intro"));

        let vectors = store
            .vector_search(&[1.0, 0.0], Some("doc-b"), 10, 0.3)
            .await
            .unwrap();
        assert_eq!(vectors.len(), 1);
        assert_eq!(vectors[0].document_id, "doc-b");

        assert_eq!(store.count_indexed_passages(None).await.unwrap(), 2);
        assert_eq!(store.count_indexed_passages(Some("doc-a")).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_delete_retires_block_numbers() {
        let (_tmp, store) = temp_store().await;
        let mut doc = Document::new(Some("https://example.com/b"), "body", Utc::now());
        doc.next_block = 6;
        store.upsert_document(&doc).await.unwrap();
        index(&store, &passage(&doc.id, 5, "some text"), &[1.0]).await;

        assert!(store.delete_document(&doc.id).await.unwrap());
        assert!(store.get_document(&doc.id).await.unwrap().is_none());
        assert_eq!(store.next_block(&doc.id).await.unwrap(), 6);
        assert_eq!(store.count_indexed_passages(Some(&doc.id)).await.unwrap(), 0);
        assert!(!store.delete_document(&doc.id).await.unwrap());
    }

    #[tokio::test]
    async fn test_list_passages_and_indexed_text() {
        let (_tmp, store) = temp_store().await;
        let p0 = passage("doc-c", 0, "zero");
        let p1 = passage("doc-c", 1, "one");
        index(&store, &p1, &[1.0]).await;
        index(&store, &p0, &[1.0]).await;

        let listed = store.list_passages("doc-c").await.unwrap();
        assert_eq!(listed, vec![p0.clone(), p1.clone()]);
        assert!(store.indexed_text(p0.block_id()).await.unwrap().is_consistent());

        store.remove_passage(p0.block_id()).await.unwrap();
        assert_eq!(store.indexed_text(p0.block_id()).await.unwrap(), IndexedText::default());
        store.clear_passages("doc-c").await.unwrap();
        assert!(store.list_passages("doc-c").await.unwrap().is_empty());
    }
}
