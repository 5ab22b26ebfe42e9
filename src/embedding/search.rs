//! Semantic + text + chronological search over past sessions.
//!
//! Tier selection is a graceful-degradation ladder: cosine similarity
//! over indexed sessions when vectors exist and the backend answers,
//! substring scan over transcripts otherwise, chronological listing when
//! both come up empty. Ordering is deterministic: score descending, then
//! `created_at` descending, then session id descending.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{debug, warn};

use crate::config::SearchConfig;
use crate::embedding::indexer::EmbeddingIndexer;
use crate::embedding::{cosine_similarity, Embedder};
use crate::session::model::Session;
use crate::session::SessionStore;
use crate::types::{ChatId, CoreError, CoreResult, SessionId};

/// How a result was matched.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum MatchType {
    Semantic,
    Text,
    Chronological,
}

/// A highlighted window of transcript text around a match.
#[derive(Debug, Clone, Serialize)]
pub struct PreviewFragment {
    pub text: String,
    /// (start, len) of the matched span, in characters within `text`
    pub highlight: (usize, usize),
}

/// One search hit.
#[derive(Debug, Clone, Serialize)]
pub struct SearchResult {
    pub session_id: SessionId,
    pub display_name: String,
    /// Relevance in [0, 1]; zero for chronological listings
    pub score: f32,
    pub match_type: MatchType,
    pub previews: Vec<PreviewFragment>,
    pub created_at: DateTime<Utc>,
    pub audio_count: usize,
}

/// The full response for one query.
#[derive(Debug, Clone, Serialize)]
pub struct SearchResponse {
    pub query: String,
    pub match_type: MatchType,
    pub results: Vec<SearchResult>,
    pub sessions_searched: usize,
}

pub struct SearchEngine {
    store: SessionStore,
    indexer: EmbeddingIndexer,
    embedder: Arc<dyn Embedder>,
    config: SearchConfig,
}

impl SearchEngine {
    pub fn new(
        store: SessionStore,
        indexer: EmbeddingIndexer,
        embedder: Arc<dyn Embedder>,
        config: SearchConfig,
    ) -> Self {
        Self {
            store,
            indexer,
            embedder,
            config,
        }
    }

    pub fn indexer(&self) -> &EmbeddingIndexer {
        &self.indexer
    }

    /// Run one query for a chat.
    pub async fn search(
        &self,
        query: &str,
        chat_id: ChatId,
        limit: usize,
        min_score: f32,
    ) -> CoreResult<SearchResponse> {
        let query = query.trim();
        if query.is_empty() {
            return Err(CoreError::validation("empty_query", "search query is empty"));
        }

        // Snapshot once; every tier operates on this immutable copy.
        let sessions: Vec<Session> = self
            .store
            .load_all()?
            .into_iter()
            .filter(|s| s.chat_id == chat_id)
            .collect();
        let searched = sessions.len();

        if let Some(results) = self
            .semantic_tier(query, &sessions, limit, min_score)
            .await?
        {
            if !results.is_empty() {
                return Ok(SearchResponse {
                    query: query.to_string(),
                    match_type: MatchType::Semantic,
                    results,
                    sessions_searched: searched,
                });
            }
        }

        let results = self.text_tier(query, &sessions, limit)?;
        if !results.is_empty() {
            return Ok(SearchResponse {
                query: query.to_string(),
                match_type: MatchType::Text,
                results,
                sessions_searched: searched,
            });
        }

        let results = chronological_results(&sessions, limit, 0);
        Ok(SearchResponse {
            query: query.to_string(),
            match_type: MatchType::Chronological,
            results,
            sessions_searched: searched,
        })
    }

    /// Cosine ranking over indexed sessions. Returns `None` when the
    /// semantic tier cannot run (no vectors or backend unavailable).
    async fn semantic_tier(
        &self,
        query: &str,
        sessions: &[Session],
        limit: usize,
        min_score: f32,
    ) -> CoreResult<Option<Vec<SearchResult>>> {
        let indexed: Vec<(&Session, Vec<f32>)> = sessions
            .iter()
            .filter_map(|s| self.indexer.load(&s.id).map(|e| (s, e.vector)))
            .collect();
        if indexed.is_empty() || !self.embedder.is_available().await {
            return Ok(None);
        }

        let timeout = Duration::from_secs(self.config.query_timeout_secs.max(1));
        let query_vector =
            match tokio::time::timeout(timeout, self.embedder.embed(query)).await {
                Ok(Ok(v)) => v,
                Ok(Err(e)) => {
                    warn!(error = %e, "query embedding failed, falling back to text search");
                    return Ok(None);
                }
                Err(_) => {
                    warn!(
                        waited_secs = self.config.query_timeout_secs,
                        "query embedding timed out, falling back to text search"
                    );
                    return Ok(None);
                }
            };

        let mut hits: Vec<SearchResult> = Vec::new();
        for (session, vector) in indexed {
            let score = cosine_similarity(&query_vector, &vector);
            if score < min_score {
                continue;
            }
            let corpus = self.indexer.corpus_text(session)?;
            hits.push(SearchResult {
                session_id: session.id.clone(),
                display_name: session.intelligible_name.clone(),
                score,
                match_type: MatchType::Semantic,
                previews: extract_previews(&corpus, query, self.config.preview_radius),
                created_at: session.created_at,
                audio_count: session.audio_entries.len(),
            });
        }
        sort_results(&mut hits);
        hits.truncate(limit);
        debug!(hits = hits.len(), "semantic tier ranked");
        Ok(Some(hits))
    }

    /// Substring scan over transcripts with a hit-density score.
    fn text_tier(
        &self,
        query: &str,
        sessions: &[Session],
        limit: usize,
    ) -> CoreResult<Vec<SearchResult>> {
        let mut hits: Vec<SearchResult> = Vec::new();
        for session in sessions {
            let corpus = self.indexer.corpus_text(session)?;
            if corpus.is_empty() {
                continue;
            }
            let occurrences = count_occurrences(&corpus, query);
            if occurrences == 0 {
                continue;
            }
            let score = text_score(occurrences, query.chars().count(), corpus.chars().count());
            hits.push(SearchResult {
                session_id: session.id.clone(),
                display_name: session.intelligible_name.clone(),
                score,
                match_type: MatchType::Text,
                previews: extract_previews(&corpus, query, self.config.preview_radius),
                created_at: session.created_at,
                audio_count: session.audio_entries.len(),
            });
        }
        sort_results(&mut hits);
        hits.truncate(limit);
        Ok(hits)
    }

    /// Chronological browsing / fallback listing.
    pub fn list_chronological(
        &self,
        chat_id: ChatId,
        limit: usize,
        offset: usize,
    ) -> CoreResult<Vec<SearchResult>> {
        let sessions: Vec<Session> = self
            .store
            .load_all()?
            .into_iter()
            .filter(|s| s.chat_id == chat_id)
            .collect();
        Ok(chronological_results(&sessions, limit, offset))
    }

    /// Diagnostics used by `get_index_status` consumers.
    pub fn index_status(&self) -> CoreResult<crate::embedding::IndexStatus> {
        Ok(self.indexer.status(&self.store.load_all()?))
    }
}

fn chronological_results(sessions: &[Session], limit: usize, offset: usize) -> Vec<SearchResult> {
    let mut ordered: Vec<&Session> = sessions.iter().collect();
    ordered.sort_by(|a, b| b.created_at.cmp(&a.created_at).then(b.id.cmp(&a.id)));
    ordered
        .into_iter()
        .skip(offset)
        .take(limit)
        .map(|s| SearchResult {
            session_id: s.id.clone(),
            display_name: s.intelligible_name.clone(),
            score: 0.0,
            match_type: MatchType::Chronological,
            previews: Vec::new(),
            created_at: s.created_at,
            audio_count: s.audio_entries.len(),
        })
        .collect()
}

/// Score desc, then created_at desc, then id desc.
fn sort_results(results: &mut [SearchResult]) {
    results.sort_by(|a, b| {
        b.score
            .partial_cmp(&a.score)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then(b.created_at.cmp(&a.created_at))
            .then(b.session_id.cmp(&a.session_id))
    });
}

/// Lowercase one char to one char; Portuguese casing is 1:1, which keeps
/// char indices aligned between the haystack and its folded form.
fn fold(c: char) -> char {
    c.to_lowercase().next().unwrap_or(c)
}

fn count_occurrences(haystack: &str, needle: &str) -> usize {
    let hay: Vec<char> = haystack.chars().map(fold).collect();
    let needle: Vec<char> = needle.chars().map(fold).collect();
    if needle.is_empty() || hay.len() < needle.len() {
        return 0;
    }
    hay.windows(needle.len()).filter(|w| *w == &needle[..]).count()
}

/// Hit density capped to [0, 1].
fn text_score(occurrences: usize, needle_chars: usize, corpus_chars: usize) -> f32 {
    if corpus_chars == 0 {
        return 0.0;
    }
    let density = (occurrences * needle_chars) as f32 / corpus_chars as f32;
    (density * 20.0).min(1.0)
}

/// Up to three ±radius windows around occurrences of the query (or its
/// strongest token), with highlight spans in character units.
fn extract_previews(corpus: &str, query: &str, radius: usize) -> Vec<PreviewFragment> {
    const MAX_PREVIEWS: usize = 3;

    let chars: Vec<char> = corpus.chars().collect();
    let folded: Vec<char> = chars.iter().map(|c| fold(*c)).collect();

    // Prefer the full query; fall back to its most frequent token.
    let needle: Vec<char> = {
        let full: Vec<char> = query.chars().map(fold).collect();
        if !full.is_empty() && count_windows(&folded, &full) > 0 {
            full
        } else {
            let mut best: (usize, Vec<char>) = (0, Vec::new());
            for token in query.split_whitespace() {
                let token: Vec<char> = token.chars().map(fold).collect();
                if token.is_empty() {
                    continue;
                }
                let count = count_windows(&folded, &token);
                if count > best.0 {
                    best = (count, token);
                }
            }
            best.1
        }
    };
    if needle.is_empty() {
        return Vec::new();
    }

    let mut previews = Vec::new();
    let mut cursor = 0usize;
    while previews.len() < MAX_PREVIEWS {
        let Some(pos) = find_window(&folded, &needle, cursor) else {
            break;
        };
        let start = pos.saturating_sub(radius);
        let end = (pos + needle.len() + radius).min(chars.len());
        previews.push(PreviewFragment {
            text: chars[start..end].iter().collect(),
            highlight: (pos - start, needle.len()),
        });
        cursor = pos + needle.len();
    }
    previews
}

fn count_windows(hay: &[char], needle: &[char]) -> usize {
    if needle.is_empty() || hay.len() < needle.len() {
        return 0;
    }
    hay.windows(needle.len()).filter(|w| *w == needle).count()
}

fn find_window(hay: &[char], needle: &[char], from: usize) -> Option<usize> {
    if needle.is_empty() || hay.len() < needle.len() {
        return None;
    }
    (from..=hay.len() - needle.len()).find(|&i| &hay[i..i + needle.len()] == needle)
}
