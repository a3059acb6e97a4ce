use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::sync::Arc;
use substrate_core::{Result, SubstrateError};
use substrate_llm::{EmbeddingProvider, cosine_similarity};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::store::MemoryStore;

/// What kind of thing an archival entry records.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MemoryCategory {
    Fact,
    Emotion,
    Insight,
    InteractionMoment,
    Preference,
    Event,
}

impl MemoryCategory {
    pub const ALL: [MemoryCategory; 6] = [
        Self::Fact,
        Self::Emotion,
        Self::Insight,
        Self::InteractionMoment,
        Self::Preference,
        Self::Event,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Fact => "fact",
            Self::Emotion => "emotion",
            Self::Insight => "insight",
            Self::InteractionMoment => "interaction_moment",
            Self::Preference => "preference",
            Self::Event => "event",
        }
    }
}

impl std::fmt::Display for MemoryCategory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for MemoryCategory {
    type Err = SubstrateError;

    fn from_str(s: &str) -> Result<Self> {
        Self::ALL
            .into_iter()
            .find(|c| c.as_str() == s)
            .ok_or_else(|| SubstrateError::InvalidArguments {
                tool: "archival_memory".into(),
                reason: format!(
                    "unknown category '{s}', expected one of: {}",
                    Self::ALL.map(|c| c.as_str()).join(", ")
                ),
            })
    }
}

/// An append-only long-term memory record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ArchivalEntry {
    pub id: Uuid,
    pub content: String,
    pub category: MemoryCategory,
    /// 1 (trivia) to 10 (core to identity).
    pub importance: u8,
    pub tags: BTreeSet<String>,
    #[serde(skip)]
    pub embedding: Vec<f32>,
    pub timestamp: DateTime<Utc>,
}

/// Input to [`ArchivalMemory::insert`].
#[derive(Debug, Clone)]
pub struct NewEntry {
    pub content: String,
    pub category: MemoryCategory,
    pub importance: u8,
    pub tags: BTreeSet<String>,
}

impl NewEntry {
    pub fn new(content: impl Into<String>, category: MemoryCategory, importance: u8) -> Self {
        Self {
            content: content.into(),
            category,
            importance,
            tags: BTreeSet::new(),
        }
    }

    pub fn with_tags<I, S>(mut self, tags: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.tags = tags.into_iter().map(Into::into).collect();
        self
    }
}

/// Parameters of an archival search.
#[derive(Debug, Clone)]
pub struct SearchQuery {
    pub query: String,
    pub limit: usize,
    pub category: Option<MemoryCategory>,
    pub min_importance: Option<u8>,
    /// When non-empty, entries must carry at least one of these tags.
    pub tags: BTreeSet<String>,
}

impl SearchQuery {
    pub fn new(query: impl Into<String>, limit: usize) -> Self {
        Self {
            query: query.into(),
            limit,
            category: None,
            min_importance: None,
            tags: BTreeSet::new(),
        }
    }

    pub fn category(mut self, category: MemoryCategory) -> Self {
        self.category = Some(category);
        self
    }

    pub fn min_importance(mut self, min: u8) -> Self {
        self.min_importance = Some(min);
        self
    }

    fn admits(&self, entry: &ArchivalEntry) -> bool {
        self.category.is_none_or(|c| c == entry.category)
            && self.min_importance.is_none_or(|m| entry.importance >= m)
            && (self.tags.is_empty() || !self.tags.is_disjoint(&entry.tags))
    }
}

/// A search hit.
#[derive(Debug, Clone, Serialize)]
pub struct ScoredEntry {
    #[serde(flatten)]
    pub entry: ArchivalEntry,
    pub similarity: f32,
}

/// Aggregate figures over archival memory.
#[derive(Debug, Clone, Default, Serialize)]
pub struct ArchivalStats {
    pub total: usize,
    pub excluded: usize,
    pub by_category: BTreeMap<String, usize>,
    pub average_importance: f64,
}

fn validate_importance(importance: u8) -> Result<()> {
    if !(1..=10).contains(&importance) {
        return Err(SubstrateError::InvalidArguments {
            tool: "archival_memory".into(),
            reason: format!("importance must be 1-10, got {importance}"),
        });
    }
    Ok(())
}

/// Similarity-searched long-term memory.
///
/// Entries are never edited once inserted. `exclude` hides an entry from
/// search without removing it.
pub struct ArchivalMemory {
    entries: RwLock<Vec<Arc<ArchivalEntry>>>,
    excluded: RwLock<HashSet<Uuid>>,
    embedder: Option<Arc<dyn EmbeddingProvider>>,
    store: Option<Arc<MemoryStore>>,
}

impl ArchivalMemory {
    pub fn new(embedder: Option<Arc<dyn EmbeddingProvider>>) -> Self {
        Self {
            entries: RwLock::new(Vec::new()),
            excluded: RwLock::new(HashSet::new()),
            embedder,
            store: None,
        }
    }

    /// Archival memory backed by `store`, preloaded with its entries.
    pub fn with_store(
        store: Arc<MemoryStore>,
        embedder: Option<Arc<dyn EmbeddingProvider>>,
    ) -> Result<Self> {
        let rows = store.load_archival()?;
        let mut entries = Vec::with_capacity(rows.len());
        let mut excluded = HashSet::new();
        for (entry, is_excluded) in rows {
            if is_excluded {
                excluded.insert(entry.id);
            }
            entries.push(Arc::new(entry));
        }
        debug!(count = entries.len(), "loaded archival entries");
        Ok(Self {
            entries: RwLock::new(entries),
            excluded: RwLock::new(excluded),
            embedder,
            store: Some(store),
        })
    }

    /// Probe the embedding backend once. Returns false (and logs) if it is unreachable.
    pub async fn probe_embedder(&self) -> bool {
        let Some(ref embedder) = self.embedder else {
            warn!("no embedding backend configured, archival search disabled");
            return false;
        };
        match embedder.embed_one("health check").await {
            Ok(v) => {
                info!(embedder = embedder.name(), dims = v.len(), "embedding backend ready");
                true
            }
            Err(e) => {
                warn!(embedder = embedder.name(), error = %e, "embedding backend unavailable, archival search will degrade");
                false
            }
        }
    }

    /// Embed and append a new entry.
    pub async fn insert(&self, new: NewEntry) -> Result<ArchivalEntry> {
        validate_importance(new.importance)?;
        if new.content.trim().is_empty() {
            return Err(SubstrateError::InvalidArguments {
                tool: "archival_memory".into(),
                reason: "content is empty".into(),
            });
        }

        let embedding = match self.embedder {
            Some(ref embedder) => embedder.embed_one(&new.content).await?,
            None => {
                debug!("no embedder configured, storing entry without a vector");
                Vec::new()
            }
        };

        let entry = ArchivalEntry {
            id: Uuid::new_v4(),
            content: new.content,
            category: new.category,
            importance: new.importance,
            tags: new.tags,
            embedding,
            timestamp: Utc::now(),
        };

        if let Some(ref store) = self.store {
            store.insert_archival(&entry)?;
        }
        self.entries.write().push(Arc::new(entry.clone()));
        info!(id = %entry.id, category = %entry.category, importance = entry.importance, "archival entry inserted");
        Ok(entry)
    }

    /// Return at most `query.limit` entries ordered by similarity desc, then
    /// importance desc, then timestamp desc.
    ///
    /// Returns an empty result, never an error, when the embedding backend fails.
    pub async fn search(&self, query: &SearchQuery) -> Vec<ScoredEntry> {
        if query.limit == 0 || query.query.trim().is_empty() {
            return Vec::new();
        }
        let Some(ref embedder) = self.embedder else {
            return Vec::new();
        };
        let query_vec = match embedder.embed_one(&query.query).await {
            Ok(v) => v,
            Err(e) => {
                warn!(error = %e, "archival search degraded: embedding backend failed");
                return Vec::new();
            }
        };

        let candidates: Vec<Arc<ArchivalEntry>> = {
            let excluded = self.excluded.read();
            self.entries
                .read()
                .iter()
                .filter(|e| !e.embedding.is_empty() && !excluded.contains(&e.id))
                .filter(|e| query.admits(e))
                .cloned()
                .collect()
        };

        let mut hits: Vec<ScoredEntry> = candidates
            .into_iter()
            .map(|e| ScoredEntry {
                similarity: cosine_similarity(&query_vec, &e.embedding),
                entry: (*e).clone(),
            })
            .collect();

        rank(&mut hits);
        hits.truncate(query.limit);
        debug!(query = %query.query, hits = hits.len(), "archival search");
        hits
    }

    pub fn get(&self, id: Uuid) -> Result<ArchivalEntry> {
        self.entries
            .read()
            .iter()
            .find(|e| e.id == id)
            .map(|e| (**e).clone())
            .ok_or_else(|| SubstrateError::EntryNotFound(id.to_string()))
    }

    /// Hide an entry from search. The entry itself is kept.
    pub fn exclude(&self, id: Uuid) -> Result<()> {
        self.get(id)?;
        if let Some(ref store) = self.store {
            store.set_archival_excluded(id, true)?;
        }
        self.excluded.write().insert(id);
        info!(%id, "archival entry excluded from search");
        Ok(())
    }

    pub fn is_excluded(&self, id: Uuid) -> bool {
        self.excluded.read().contains(&id)
    }

    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn stats(&self) -> ArchivalStats {
        let entries = self.entries.read();
        let mut stats = ArchivalStats {
            total: entries.len(),
            excluded: self.excluded.read().len(),
            ..Default::default()
        };
        let mut importance_sum = 0u64;
        for e in entries.iter() {
            *stats.by_category.entry(e.category.to_string()).or_default() += 1;
            importance_sum += e.importance as u64;
        }
        if !entries.is_empty() {
            stats.average_importance =
                (importance_sum as f64 / entries.len() as f64 * 100.0).round() / 100.0;
        }
        stats
    }
}

/// Sort by similarity desc, importance desc, timestamp desc.
fn rank(hits: &mut [ScoredEntry]) {
    hits.sort_by(|a, b| {
        b.similarity
            .total_cmp(&a.similarity)
            .then_with(|| b.entry.importance.cmp(&a.entry.importance))
            .then_with(|| b.entry.timestamp.cmp(&a.entry.timestamp))
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn hit(similarity: f32, importance: u8, age_secs: i64) -> ScoredEntry {
        ScoredEntry {
            entry: ArchivalEntry {
                id: Uuid::new_v4(),
                content: format!("{similarity}/{importance}/{age_secs}"),
                category: MemoryCategory::Fact,
                importance,
                tags: BTreeSet::new(),
                embedding: vec![],
                timestamp: Utc::now() - Duration::seconds(age_secs),
            },
            similarity,
        }
    }

    #[test]
    fn test_rank_breaks_ties_by_importance_then_recency() {
        let mut hits = vec![hit(0.5, 3, 0), hit(0.9, 1, 0), hit(0.5, 7, 100), hit(0.5, 7, 1)];
        rank(&mut hits);
        let order: Vec<&str> = hits.iter().map(|h| h.entry.content.as_str()).collect();
        assert_eq!(order, vec!["0.9/1/0", "0.5/7/1", "0.5/7/100", "0.5/3/0"]);
    }

    #[test]
    fn test_category_parse() {
        assert_eq!(
            "interaction_moment".parse::<MemoryCategory>().unwrap(),
            MemoryCategory::InteractionMoment
        );
        assert!("gossip".parse::<MemoryCategory>().is_err());
    }

    #[test]
    fn test_query_filters() {
        let mut entry = hit(0.0, 6, 0).entry;
        entry.tags.insert("coffee".into());
        let q = SearchQuery::new("x", 5).min_importance(5);
        assert!(q.admits(&entry));
        assert!(!SearchQuery::new("x", 5).min_importance(7).admits(&entry));
        assert!(!SearchQuery::new("x", 5).category(MemoryCategory::Event).admits(&entry));
        let mut tagged = SearchQuery::new("x", 5);
        tagged.tags.insert("tea".into());
        assert!(!tagged.admits(&entry));
        tagged.tags.insert("coffee".into());
        assert!(tagged.admits(&entry));
    }

    #[test]
    fn test_importance_bounds() {
        assert!(validate_importance(0).is_err());
        assert!(validate_importance(11).is_err());
        assert!(validate_importance(1).is_ok());
        assert!(validate_importance(10).is_ok());
    }
}
