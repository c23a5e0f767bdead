//! Full-text search over stubs. Used for candidate discovery and by readers.

use std::collections::{BTreeMap, BTreeSet};

use async_trait::async_trait;
use canon_core::{StubId, StubKind};
use sqlx::postgres::PgPool;
use sqlx::Row;
use tokio::sync::Mutex;

use crate::StoreError;

#[derive(Debug, Clone, PartialEq)]
pub struct IndexedDocument {
    pub id: StubId,
    pub kind: StubKind,
    pub visible: bool,
    pub parent: Option<StubId>,
    pub tags: Vec<String>,
    pub full_text: Vec<String>,
}

impl IndexedDocument {
    fn text(&self) -> String {
        self.full_text.join("\n")
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct SearchQuery {
    pub text: String,
    /// Match `text` as a contiguous phrase instead of any of its terms.
    pub phrase: bool,
    pub kind: Option<StubKind>,
    pub tag: Option<String>,
    pub visible_only: bool,
    pub limit: usize,
}

impl SearchQuery {
    pub fn phrase(text: impl Into<String>, limit: usize) -> Self {
        Self {
            text: text.into(),
            phrase: true,
            kind: None,
            tag: None,
            visible_only: false,
            limit,
        }
    }

    pub fn terms(text: impl Into<String>, limit: usize) -> Self {
        Self {
            phrase: false,
            ..Self::phrase(text, limit)
        }
    }
}

#[async_trait]
pub trait SearchIndex: Send + Sync {
    async fn index_document(&self, document: &IndexedDocument) -> Result<(), StoreError>;
    async fn delete_document(&self, id: StubId) -> Result<bool, StoreError>;
    /// Best matches first.
    async fn query(&self, query: &SearchQuery) -> Result<Vec<StubId>, StoreError>;
    /// Make indexed changes visible to readers.
    async fn commit(&self) -> Result<(), StoreError>;
    async fn document_count(&self) -> Result<u64, StoreError>;
}

fn tokens(text: &str) -> Vec<String> {
    text.split(|c: char| !c.is_alphanumeric())
        .filter(|t| !t.is_empty())
        .map(str::to_lowercase)
        .collect()
}

/// In-process index; changes are visible immediately.
#[derive(Debug, Default)]
pub struct MemoryIndex {
    documents: Mutex<BTreeMap<StubId, IndexedDocument>>,
}

impl MemoryIndex {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn document(&self, id: StubId) -> Option<IndexedDocument> {
        self.documents.lock().await.get(&id).cloned()
    }

    fn matches(document: &IndexedDocument, query: &SearchQuery, terms: &[String]) -> bool {
        if query.visible_only && !document.visible {
            return false;
        }
        if query.kind.is_some_and(|k| k != document.kind) {
            return false;
        }
        if let Some(tag) = &query.tag {
            if !document.tags.iter().any(|t| t == tag) {
                return false;
            }
        }
        let body = tokens(&document.text());
        if query.phrase {
            !terms.is_empty() && body.windows(terms.len()).any(|w| w == terms)
        } else {
            let body: BTreeSet<&String> = body.iter().collect();
            terms.iter().any(|t| body.contains(t))
        }
    }
}

#[async_trait]
impl SearchIndex for MemoryIndex {
    async fn index_document(&self, document: &IndexedDocument) -> Result<(), StoreError> {
        self.documents
            .lock()
            .await
            .insert(document.id, document.clone());
        Ok(())
    }

    async fn delete_document(&self, id: StubId) -> Result<bool, StoreError> {
        Ok(self.documents.lock().await.remove(&id).is_some())
    }

    async fn query(&self, query: &SearchQuery) -> Result<Vec<StubId>, StoreError> {
        let terms = tokens(&query.text);
        let needle = terms.join(" ");
        let documents = self.documents.lock().await;
        let mut hits: Vec<(f64, StubId)> = documents
            .values()
            .filter(|d| Self::matches(d, query, &terms))
            .map(|d| {
                let best = d
                    .full_text
                    .iter()
                    .map(|line| strsim::normalized_levenshtein(&tokens(line).join(" "), &needle))
                    .fold(0.0, f64::max);
                (best, d.id)
            })
            .collect();
        hits.sort_by(|a, b| b.0.total_cmp(&a.0).then(a.1.cmp(&b.1)));
        Ok(hits.into_iter().take(query.limit).map(|(_, id)| id).collect())
    }

    async fn commit(&self) -> Result<(), StoreError> {
        Ok(())
    }

    async fn document_count(&self) -> Result<u64, StoreError> {
        Ok(self.documents.lock().await.len() as u64)
    }
}

/// Postgres `tsvector` index stored in `search_document`.
#[derive(Debug, Clone)]
pub struct PgSearchIndex {
    pool: PgPool,
}

impl PgSearchIndex {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl SearchIndex for PgSearchIndex {
    async fn index_document(&self, document: &IndexedDocument) -> Result<(), StoreError> {
        sqlx::query(
            "INSERT INTO search_document (id, kind, visible, parent, tags, full_text, tsv, updated_at)
             VALUES ($1, $2, $3, $4, $5, $6, to_tsvector('simple', $6), now())
             ON CONFLICT (id) DO UPDATE SET kind = EXCLUDED.kind, visible = EXCLUDED.visible,
                 parent = EXCLUDED.parent, tags = EXCLUDED.tags, full_text = EXCLUDED.full_text,
                 tsv = EXCLUDED.tsv, updated_at = EXCLUDED.updated_at",
        )
        .bind(document.id)
        .bind(document.kind.as_str())
        .bind(document.visible)
        .bind(document.parent)
        .bind(&document.tags)
        .bind(document.text())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn delete_document(&self, id: StubId) -> Result<bool, StoreError> {
        let affected = sqlx::query("DELETE FROM search_document WHERE id = $1")
            .bind(id)
            .execute(&self.pool)
            .await?
            .rows_affected();
        Ok(affected > 0)
    }

    async fn query(&self, query: &SearchQuery) -> Result<Vec<StubId>, StoreError> {
        let parser = if query.phrase {
            "phraseto_tsquery"
        } else {
            "plainto_tsquery"
        };
        let sql = format!(
            "SELECT id FROM search_document, {parser}('simple', $1) q
             WHERE tsv @@ q
               AND ($2::text IS NULL OR kind = $2)
               AND ($3::text IS NULL OR $3 = ANY(tags))
               AND (NOT $4 OR visible)
             ORDER BY ts_rank(tsv, q) DESC, id
             LIMIT $5"
        );
        let rows = sqlx::query(&sql)
            .bind(&query.text)
            .bind(query.kind.map(|k| k.as_str()))
            .bind(query.tag.as_deref())
            .bind(query.visible_only)
            .bind(i64::try_from(query.limit).unwrap_or(i64::MAX))
            .fetch_all(&self.pool)
            .await?;
        rows.iter()
            .map(|row| row.try_get("id").map_err(StoreError::from))
            .collect()
    }

    async fn commit(&self) -> Result<(), StoreError> {
        Ok(())
    }

    async fn document_count(&self) -> Result<u64, StoreError> {
        let n: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM search_document")
            .fetch_one(&self.pool)
            .await?;
        Ok(n.max(0) as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    fn doc(kind: StubKind, text: &str) -> IndexedDocument {
        IndexedDocument {
            id: Uuid::new_v4(),
            kind,
            visible: true,
            parent: None,
            tags: Vec::new(),
            full_text: vec![text.to_string()],
        }
    }

    #[tokio::test]
    async fn phrase_queries_need_contiguous_terms() {
        let index = MemoryIndex::new();
        let tower = doc(StubKind::Place, "Big Ben clock tower");
        let other = doc(StubKind::Place, "Ben Nevis is big");
        index.index_document(&tower).await.expect("index");
        index.index_document(&other).await.expect("index");

        let hits = index
            .query(&SearchQuery::phrase("big ben", 10))
            .await
            .expect("query");
        assert_eq!(hits, vec![tower.id]);

        let hits = index
            .query(&SearchQuery::terms("big ben", 10))
            .await
            .expect("query");
        assert_eq!(hits.len(), 2);
    }

    #[tokio::test]
    async fn filters_and_ranking_apply() {
        let index = MemoryIndex::new();
        let exact = doc(StubKind::Person, "Ada Lovelace");
        let longer = doc(StubKind::Person, "Ada Lovelace, mathematician and writer");
        let place = doc(StubKind::Place, "Ada Lovelace house");
        for d in [&exact, &longer, &place] {
            index.index_document(d).await.expect("index");
        }
        let mut query = SearchQuery::phrase("Ada Lovelace", 10);
        query.kind = Some(StubKind::Person);
        let hits = index.query(&query).await.expect("query");
        assert_eq!(hits, vec![exact.id, longer.id]);

        assert!(index.delete_document(exact.id).await.expect("delete"));
        assert_eq!(index.document_count().await.expect("count"), 2);
    }
}
