//! Hybrid search engine.
//!
//! Each query part produces up to three ranked streams — lexical FTS, text
//! semantic, image semantic — which are fused per modality with Reciprocal
//! Rank Fusion (k = 60). A stream that errors is treated as empty; the
//! engine never fails a query, it just returns what the reachable streams
//! found. Semantic streams filter stored vectors strictly by the query
//! model's name, so vectors from different models never meet in a dot
//! product.

use moka::sync::Cache;
use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, warn};

use crate::config::{Config, FileKind};
use crate::constants::RRF_K;
use crate::error::Result;
use crate::models::ModelRegistry;
use crate::store::Store;
use crate::utils::{blob_to_vector, dot, fts_match_expression, l2_normalize, normalize_path_str};

/// How many query vectors to keep around between searches.
const QUERY_CACHE_CAPACITY: u64 = 512;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueryKind {
    Text,
    Image,
}

/// One part of a multi-modal query: free text, or the path of an example
/// image to search by.
#[derive(Debug, Clone)]
pub struct QueryPart {
    pub kind: QueryKind,
    pub value: String,
}

impl QueryPart {
    pub fn text(value: impl Into<String>) -> Self {
        Self {
            kind: QueryKind::Text,
            value: value.into(),
        }
    }

    pub fn image(path: impl Into<String>) -> Self {
        Self {
            kind: QueryKind::Image,
            value: path.into(),
        }
    }
}

/// Enable-map over artifact sources.
#[derive(Debug, Clone, Copy)]
pub struct SourceFilter {
    pub ocr: bool,
    pub embed: bool,
    pub llm: bool,
}

impl Default for SourceFilter {
    fn default() -> Self {
        Self {
            ocr: true,
            embed: true,
            llm: true,
        }
    }
}

impl SourceFilter {
    fn allows(&self, source: &str) -> bool {
        match source {
            "ocr" => self.ocr,
            "embed" => self.embed,
            "llm" => self.llm,
            _ => false,
        }
    }
}

#[derive(Debug, Clone)]
pub struct SearchRequest {
    pub parts: Vec<QueryPart>,
    /// Only return results under this folder prefix
    pub folder: Option<String>,
    pub sources: SourceFilter,
    pub top_k: usize,
}

impl SearchRequest {
    pub fn text_query(query: impl Into<String>, top_k: usize) -> Self {
        Self {
            parts: vec![QueryPart::text(query)],
            folder: None,
            sources: SourceFilter::default(),
            top_k,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MatchType {
    Lexical,
    Semantic,
    Hybrid,
}

/// One ranked result.
#[derive(Debug, Clone)]
pub struct SearchHit {
    pub path: String,
    /// Preview text: the best-scoring chunk seen for this file
    pub content: String,
    pub score: f32,
    pub match_type: MatchType,
    pub source: String,
    /// How many rows across all streams collapsed into this file
    pub num_hits: usize,
}

/// Ranked text and image results, each up to `top_k` entries.
#[derive(Debug, Clone, Default)]
pub struct SearchResults {
    pub text: Vec<SearchHit>,
    pub images: Vec<SearchHit>,
}

/// A per-file collapsed entry inside one stream.
#[derive(Debug, Clone)]
struct CollapsedHit {
    path: String,
    content: String,
    score: f32,
    source: String,
    num_hits: usize,
}

/// One ranked stream: per-file hits sorted by score descending.
struct Stream {
    match_type: MatchType,
    hits: Vec<CollapsedHit>,
}

pub struct SearchEngine {
    store: Arc<Store>,
    models: Arc<ModelRegistry>,
    config: Arc<Config>,
    query_cache: Cache<String, Arc<Vec<f32>>>,
}

impl SearchEngine {
    pub fn new(store: Arc<Store>, models: Arc<ModelRegistry>, config: Arc<Config>) -> Self {
        Self {
            store,
            models,
            config,
            query_cache: Cache::new(QUERY_CACHE_CAPACITY),
        }
    }

    /// Run a multi-modal hybrid query. Never fails: unreachable streams
    /// contribute nothing.
    pub fn search(&self, request: &SearchRequest) -> SearchResults {
        let top_k = request.top_k.max(1);
        let fetch_limit = std::cmp::max(200, 10 * top_k);
        let folder_prefix = request
            .folder
            .as_deref()
            .filter(|f| !f.is_empty())
            .map(|f| {
                let normalized = normalize_path_str(f);
                normalized.trim_end_matches('/').to_string()
            });

        let mut streams: Vec<Stream> = Vec::new();
        for part in &request.parts {
            match part.kind {
                QueryKind::Text => {
                    if let Some(stream) =
                        self.lexical_stream(&part.value, fetch_limit, &request.sources)
                    {
                        streams.push(stream);
                    }
                    if let Some(stream) =
                        self.text_semantic_stream(&part.value, fetch_limit, &request.sources)
                    {
                        streams.push(stream);
                    }
                    if let Some(stream) =
                        self.image_semantic_stream_for_text(&part.value, fetch_limit, &request.sources)
                    {
                        streams.push(stream);
                    }
                }
                QueryKind::Image => {
                    if let Some(stream) =
                        self.image_semantic_stream_for_image(&part.value, fetch_limit, &request.sources)
                    {
                        streams.push(stream);
                    }
                }
            }
        }

        // Folder filtering happens before fusion so ranks are computed over
        // the surviving candidates only
        if let Some(prefix) = &folder_prefix {
            for stream in &mut streams {
                stream
                    .hits
                    .retain(|hit| is_under_folder(&hit.path, prefix));
            }
        }

        let (text_hits, image_hits) = self.fuse(&streams, top_k);
        let image_hits = self.hydrate_image_previews(image_hits);

        SearchResults {
            text: text_hits,
            images: image_hits,
        }
    }

    // --- streams ---

    fn lexical_stream(
        &self,
        query: &str,
        limit: usize,
        sources: &SourceFilter,
    ) -> Option<Stream> {
        let expression = fts_match_expression(query);
        if expression.is_empty() {
            return None;
        }
        let rows = match self.store.search_lexical(&expression, limit) {
            Ok(rows) => rows,
            Err(e) => {
                warn!("Lexical search failed: {e}");
                return None;
            }
        };

        let mut by_file: HashMap<String, CollapsedHit> = HashMap::new();
        let mut order: Vec<String> = Vec::new();
        for row in rows {
            if !sources.allows(&row.source) {
                continue;
            }
            // BM25 rank is lower-is-better; negate into a score
            let score = -(row.rank as f32);
            collapse_into(&mut by_file, &mut order, CollapsedHit {
                path: row.path,
                content: row.content,
                score,
                source: row.source,
                num_hits: 1,
            });
        }

        Some(finish_stream(MatchType::Lexical, by_file, order, limit))
    }

    fn text_semantic_stream(
        &self,
        query: &str,
        limit: usize,
        sources: &SourceFilter,
    ) -> Option<Stream> {
        let text_model = self.models.text();
        if !text_model.loaded() {
            return None;
        }

        let prefixed = match text_model.query_prefix() {
            Some(prefix) => format!("{prefix}{query}"),
            None => query.to_string(),
        };
        let model_name = text_model.model_name();
        let query_vector = self.cached_query_vector(&model_name, &prefixed, || {
            text_model
                .encode(std::slice::from_ref(&prefixed), 1)
                .map(|mut vectors| vectors.pop().unwrap_or_default())
        })?;

        self.semantic_stream(&model_name, &query_vector, limit, sources)
    }

    fn image_semantic_stream_for_text(
        &self,
        query: &str,
        limit: usize,
        sources: &SourceFilter,
    ) -> Option<Stream> {
        let image_model = self.models.image();
        if !image_model.loaded() || !image_model.capabilities().text_encode {
            return None;
        }

        let model_name = image_model.model_name();
        let query_vector = self.cached_query_vector(&model_name, query, || {
            image_model
                .encode_query_text(std::slice::from_ref(&query.to_string()))
                .map(|mut vectors| vectors.pop().unwrap_or_default())
        })?;

        self.semantic_stream(&model_name, &query_vector, limit, sources)
    }

    fn image_semantic_stream_for_image(
        &self,
        image_path: &str,
        limit: usize,
        sources: &SourceFilter,
    ) -> Option<Stream> {
        let image_model = self.models.image();
        if !image_model.loaded() {
            return None;
        }

        let vector = match image_model.encode_images(std::slice::from_ref(&image_path.to_string()), 1)
        {
            Ok(mut vectors) => {
                let mut vector = vectors.pop().unwrap_or_default();
                l2_normalize(&mut vector);
                vector
            }
            Err(e) => {
                warn!("Query image embedding failed: {e}");
                return None;
            }
        };

        self.semantic_stream(&image_model.model_name(), &vector, limit, sources)
    }

    /// Score all stored vectors of one model against a normalized query
    /// vector and collapse per file.
    fn semantic_stream(
        &self,
        model_name: &str,
        query_vector: &[f32],
        limit: usize,
        sources: &SourceFilter,
    ) -> Option<Stream> {
        if query_vector.is_empty() {
            return None;
        }
        let rows = match self.store.list_embeddings(model_name) {
            Ok(rows) => rows,
            Err(e) => {
                warn!("Semantic fetch failed for {model_name}: {e}");
                return None;
            }
        };

        let mut by_file: HashMap<String, CollapsedHit> = HashMap::new();
        let mut order: Vec<String> = Vec::new();
        for row in rows {
            if !sources.allows(row.source()) {
                continue;
            }
            let vector = blob_to_vector(&row.embedding);
            // Vectors are stored normalized, so the dot product is cosine
            let score = dot(query_vector, &vector);
            let source = row.source().to_string();
            collapse_into(&mut by_file, &mut order, CollapsedHit {
                path: row.path,
                content: row.text_content,
                score,
                source,
                num_hits: 1,
            });
        }

        Some(finish_stream(MatchType::Semantic, by_file, order, limit))
    }

    fn cached_query_vector(
        &self,
        model_name: &str,
        query: &str,
        encode: impl FnOnce() -> Result<Vec<f32>>,
    ) -> Option<Arc<Vec<f32>>> {
        let key = format!("{model_name}\u{1}{query}");
        if let Some(cached) = self.query_cache.get(&key) {
            return Some(cached);
        }
        match encode() {
            Ok(mut vector) if !vector.is_empty() => {
                l2_normalize(&mut vector);
                let vector = Arc::new(vector);
                self.query_cache.insert(key, vector.clone());
                Some(vector)
            }
            Ok(_) => None,
            Err(e) => {
                debug!("Query embedding unavailable: {e}");
                None
            }
        }
    }

    // --- fusion ---

    /// Reciprocal Rank Fusion across streams, computed separately per
    /// modality. A path ranked r (zero-based) in a stream contributes
    /// `1 / (k + r + 1)` to its fused score.
    fn fuse(&self, streams: &[Stream], top_k: usize) -> (Vec<SearchHit>, Vec<SearchHit>) {
        struct Fused {
            hit: SearchHit,
            best_stream_score: f32,
        }

        let mut text: HashMap<String, Fused> = HashMap::new();
        let mut text_order: Vec<String> = Vec::new();
        let mut images: HashMap<String, Fused> = HashMap::new();
        let mut image_order: Vec<String> = Vec::new();

        for stream in streams {
            for (rank, hit) in stream.hits.iter().enumerate() {
                let (bucket, order) = match self.config.file_kind(Path::new(&hit.path)) {
                    Some(FileKind::Text) => (&mut text, &mut text_order),
                    Some(FileKind::Image) => (&mut images, &mut image_order),
                    // Results matching neither extension set are dropped
                    None => continue,
                };

                let contribution = 1.0 / (RRF_K + rank as f32 + 1.0);
                match bucket.get_mut(&hit.path) {
                    Some(fused) => {
                        fused.hit.score += contribution;
                        fused.hit.num_hits += hit.num_hits;
                        if fused.hit.match_type != stream.match_type {
                            fused.hit.match_type = MatchType::Hybrid;
                        }
                        // Preview follows the single best-scoring chunk seen
                        if hit.score > fused.best_stream_score {
                            fused.best_stream_score = hit.score;
                            fused.hit.content = hit.content.clone();
                            fused.hit.source = hit.source.clone();
                        }
                    }
                    None => {
                        order.push(hit.path.clone());
                        bucket.insert(
                            hit.path.clone(),
                            Fused {
                                best_stream_score: hit.score,
                                hit: SearchHit {
                                    path: hit.path.clone(),
                                    content: hit.content.clone(),
                                    score: contribution,
                                    match_type: stream.match_type,
                                    source: hit.source.clone(),
                                    num_hits: hit.num_hits,
                                },
                            },
                        );
                    }
                }
            }
        }

        let collect = |bucket: HashMap<String, Fused>, order: Vec<String>| -> Vec<SearchHit> {
            let mut bucket = bucket;
            let mut hits: Vec<SearchHit> = order
                .into_iter()
                .filter_map(|path| bucket.remove(&path))
                .map(|fused| fused.hit)
                .collect();
            // Stable sort: ties keep the store's natural order
            hits.sort_by(|a, b| b.score.partial_cmp(&a.score).unwrap_or(std::cmp::Ordering::Equal));
            hits.truncate(top_k);
            hits
        };

        (collect(text, text_order), collect(images, image_order))
    }

    /// Replace `[IMAGE]` placeholders in image previews with stored OCR
    /// text, when present.
    fn hydrate_image_previews(&self, mut hits: Vec<SearchHit>) -> Vec<SearchHit> {
        // Lexical previews carry the FTS content column (path + text), so
        // the placeholder may arrive with the path prefixed
        let needy: Vec<String> = hits
            .iter()
            .filter(|hit| hit.content.trim().is_empty() || hit.content.contains("[IMAGE]"))
            .map(|hit| hit.path.clone())
            .collect();
        if needy.is_empty() {
            return hits;
        }

        match self.store.get_ocr_texts(&needy) {
            Ok(texts) => {
                for hit in &mut hits {
                    if let Some(text) = texts.get(&hit.path) {
                        if !text.trim().is_empty() {
                            hit.content = text.clone();
                        }
                    }
                }
            }
            Err(e) => warn!("OCR hydration failed: {e}"),
        }
        hits
    }
}

/// Collapse a row into its file bucket: first row creates the entry, later
/// rows bump `num_hits` and swap in a better-scoring preview.
fn collapse_into(
    by_file: &mut HashMap<String, CollapsedHit>,
    order: &mut Vec<String>,
    hit: CollapsedHit,
) {
    match by_file.get_mut(&hit.path) {
        Some(existing) => {
            existing.num_hits += 1;
            if hit.score > existing.score {
                existing.score = hit.score;
                existing.content = hit.content;
                existing.source = hit.source;
            }
        }
        None => {
            order.push(hit.path.clone());
            by_file.insert(hit.path.clone(), hit);
        }
    }
}

fn finish_stream(
    match_type: MatchType,
    mut by_file: HashMap<String, CollapsedHit>,
    order: Vec<String>,
    limit: usize,
) -> Stream {
    let mut hits: Vec<CollapsedHit> = order
        .into_iter()
        .filter_map(|path| by_file.remove(&path))
        .collect();
    hits.sort_by(|a, b| b.score.partial_cmp(&a.score).unwrap_or(std::cmp::Ordering::Equal));
    hits.truncate(limit);
    Stream { match_type, hits }
}

fn is_under_folder(path: &str, prefix: &str) -> bool {
    let normalized = normalize_path_str(path);
    normalized == prefix || normalized.starts_with(&format!("{prefix}/"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::testing::*;
    use crate::models::ModelRegistry;
    use crate::store::{EmbeddingRow, Store};
    use crate::utils::vector_to_blob;
    use pretty_assertions::assert_eq;

    fn row(path: &str, index: i64, text: &str, vector: &[f32], model: &str) -> EmbeddingRow {
        EmbeddingRow {
            path: path.to_string(),
            chunk_index: index,
            text_content: text.to_string(),
            embedding: vector_to_blob(vector),
            model_name: model.to_string(),
        }
    }

    struct Fixture {
        store: Arc<Store>,
        engine: SearchEngine,
    }

    /// Registry whose text queries embed to [1,0,0] and image-space queries
    /// to [0,1,0].
    fn fixture() -> Fixture {
        let store = Arc::new(Store::open_in_memory().unwrap());
        let registry = Arc::new(ModelRegistry::new(
            Arc::new(MockOcr::reading("")),
            Arc::new(MockTextEmbedder::new("mock-text")),
            Arc::new(MockImageEmbedder::new("mock-image")),
            Arc::new(MockLlm::answering("")),
            Arc::new(MockScreenshotter::default()),
        ));
        let engine = SearchEngine::new(store.clone(), registry, Arc::new(Config::default()));
        Fixture { store, engine }
    }

    #[test]
    fn test_semantic_text_search_ranks_by_similarity() {
        let fx = fixture();
        fx.store
            .save_embeddings(&[
                row("/notes/close.md", 0, "about databases", &[1.0, 0.0, 0.0], "mock-text"),
                row("/notes/far.md", 0, "about gardening", &[0.0, 0.0, 1.0], "mock-text"),
            ])
            .unwrap();

        let results = fx.engine.search(&SearchRequest::text_query("databases", 10));
        assert_eq!(results.text.len(), 2);
        assert_eq!(results.text[0].path, "/notes/close.md");
        assert!(results.images.is_empty());
    }

    #[test]
    fn test_model_name_filter_hides_foreign_vectors() {
        let fx = fixture();
        fx.store
            .save_embeddings(&[row(
                "/notes/old-model.md",
                0,
                "legacy",
                &[1.0, 0.0, 0.0],
                "some-retired-model",
            )])
            .unwrap();

        let results = fx.engine.search(&SearchRequest::text_query("legacy", 10));
        // The stored vector was produced by a different model: the semantic
        // stream must not see it. The lexical stream still can.
        assert_eq!(results.text.len(), 1);
        assert_eq!(results.text[0].match_type, MatchType::Lexical);
    }

    #[test]
    fn test_hybrid_fusion_scores_and_match_types() {
        let fx = fixture();
        // quantum appears lexically in a.txt only; b.txt is semantically
        // nearest (query embeds to [1,0,0])
        fx.store
            .save_embeddings(&[
                row("/docs/a.txt", 0, "quantum mechanics primer", &[0.0, 0.0, 1.0], "mock-text"),
                row("/docs/b.txt", 0, "wave function collapse", &[1.0, 0.0, 0.0], "mock-text"),
            ])
            .unwrap();

        let results = fx.engine.search(&SearchRequest::text_query("quantum", 10));
        let a = results.text.iter().find(|h| h.path == "/docs/a.txt").unwrap();
        let b = results.text.iter().find(|h| h.path == "/docs/b.txt").unwrap();

        // a.txt is rank 0 lexically and also appears in the semantic stream
        // (all stored vectors are scored), so it fuses to Hybrid. b.txt only
        // appears semantically, at rank 0.
        assert_eq!(a.match_type, MatchType::Hybrid);
        assert_eq!(b.match_type, MatchType::Semantic);

        // a.txt: rank 0 in lexical + rank 1 in semantic
        let expected_a = 1.0 / 61.0 + 1.0 / 62.0;
        assert!((a.score - expected_a).abs() < 1e-6);
        // b.txt: rank 0 in the semantic stream only
        let expected_b = 1.0 / 61.0;
        assert!((b.score - expected_b).abs() < 1e-6);
    }

    #[test]
    fn test_rank_zero_in_two_streams_fuses_to_two_sixty_firsts() {
        let fx = fixture();
        // One file, best in both lexical and semantic streams
        fx.store
            .save_embeddings(&[row(
                "/docs/only.txt",
                0,
                "quantum computing notes",
                &[1.0, 0.0, 0.0],
                "mock-text",
            )])
            .unwrap();

        let results = fx.engine.search(&SearchRequest::text_query("quantum", 10));
        assert_eq!(results.text.len(), 1);
        let hit = &results.text[0];
        assert_eq!(hit.match_type, MatchType::Hybrid);
        let expected = 1.0 / 61.0 + 1.0 / 61.0;
        assert!((hit.score - expected).abs() < 1e-6);
    }

    #[test]
    fn test_modality_split_by_extension() {
        let fx = fixture();
        fx.store
            .save_embeddings(&[
                row("/notes/doc.md", 0, "sunset photo notes", &[1.0, 0.0, 0.0], "mock-text"),
            ])
            .unwrap();
        fx.store
            .save_embeddings(&[
                row("/shots/sunset.png", 0, "[IMAGE]", &[0.0, 1.0, 0.0], "mock-image"),
            ])
            .unwrap();
        // A row with an unclassifiable extension is dropped entirely
        fx.store
            .save_embeddings(&[
                row("/misc/data.zip", 0, "sunset archive", &[1.0, 0.0, 0.0], "mock-text"),
            ])
            .unwrap();

        let results = fx.engine.search(&SearchRequest::text_query("sunset", 10));
        assert_eq!(results.text.len(), 1);
        assert_eq!(results.text[0].path, "/notes/doc.md");
        assert_eq!(results.images.len(), 1);
        assert_eq!(results.images[0].path, "/shots/sunset.png");
    }

    #[test]
    fn test_image_preview_hydrated_from_ocr() {
        let fx = fixture();
        fx.store
            .save_embeddings(&[
                row("/shots/receipt.png", 0, "[IMAGE]", &[0.0, 1.0, 0.0], "mock-image"),
            ])
            .unwrap();
        fx.store
            .save_ocr("/shots/receipt.png", "TOTAL 42.00", "mock-ocr")
            .unwrap();

        // A query with no lexical match: only the image-semantic stream
        // contributes, so the preview starts as the [IMAGE] placeholder
        let results = fx.engine.search(&SearchRequest::text_query("zzz-unlexical", 10));
        assert_eq!(results.images.len(), 1);
        assert_eq!(results.images[0].content, "TOTAL 42.00");
    }

    #[test]
    fn test_folder_filter_discards_outside_paths() {
        let fx = fixture();
        fx.store
            .save_embeddings(&[
                row("/work/report.md", 0, "sprint report", &[1.0, 0.0, 0.0], "mock-text"),
                row("/personal/diary.md", 0, "sprint training", &[1.0, 0.0, 0.0], "mock-text"),
            ])
            .unwrap();

        let mut request = SearchRequest::text_query("sprint", 10);
        request.folder = Some("/work".to_string());
        let results = fx.engine.search(&request);

        assert_eq!(results.text.len(), 1);
        assert_eq!(results.text[0].path, "/work/report.md");
    }

    #[test]
    fn test_source_filter_excludes_summary_rows() {
        let fx = fixture();
        fx.store
            .save_embeddings(&[row("/notes/a.md", 0, "content chunk", &[1.0, 0.0, 0.0], "mock-text")])
            .unwrap();
        fx.store
            .save_embeddings(&[row("/notes/b.md", -1, "llm summary", &[1.0, 0.0, 0.0], "mock-text")])
            .unwrap();

        let mut request = SearchRequest::text_query("zzz-no-lexical-match", 10);
        request.sources = SourceFilter {
            ocr: true,
            embed: true,
            llm: false,
        };
        let results = fx.engine.search(&request);

        let paths: Vec<&str> = results.text.iter().map(|h| h.path.as_str()).collect();
        assert_eq!(paths, vec!["/notes/a.md"]);
    }

    #[test]
    fn test_num_hits_accumulates_across_chunks() {
        let fx = fixture();
        fx.store
            .save_embeddings(&[
                row("/notes/long.md", 0, "first chunk", &[1.0, 0.0, 0.0], "mock-text"),
                row("/notes/long.md", 1, "second chunk", &[0.9, 0.1, 0.0], "mock-text"),
                row("/notes/long.md", 2, "third chunk", &[0.8, 0.2, 0.0], "mock-text"),
            ])
            .unwrap();

        let results = fx.engine.search(&SearchRequest::text_query("zzz-nolex", 10));
        assert_eq!(results.text.len(), 1);
        assert_eq!(results.text[0].num_hits, 3);
        assert_eq!(results.text[0].content, "first chunk");
    }

    #[test]
    fn test_unloaded_embedders_fall_back_to_lexical_only() {
        let fx = fixture();
        fx.engine.models.text().unload();
        fx.engine.models.image().unload();
        fx.store.save_ocr("/shots/cat.png", "a cat", "mock-ocr").unwrap();

        let results = fx.engine.search(&SearchRequest::text_query("cat", 10));
        assert_eq!(results.images.len(), 1);
        assert_eq!(results.images[0].match_type, MatchType::Lexical);
    }

    #[test]
    fn test_everything_offline_returns_empty_not_error() {
        let fx = fixture();
        fx.engine.models.text().unload();
        fx.engine.models.image().unload();

        let results = fx.engine.search(&SearchRequest::text_query("anything", 10));
        assert!(results.text.is_empty());
        assert!(results.images.is_empty());
    }

    #[test]
    fn test_image_query_part_searches_image_space() {
        let fx = fixture();
        fx.store
            .save_embeddings(&[
                row("/shots/a.png", 0, "[IMAGE]", &[0.0, 1.0, 0.0], "mock-image"),
                row("/shots/b.png", 0, "[IMAGE]", &[1.0, 0.0, 0.0], "mock-image"),
            ])
            .unwrap();

        let request = SearchRequest {
            parts: vec![QueryPart::image("/query/example.png")],
            folder: None,
            sources: SourceFilter::default(),
            top_k: 10,
        };
        let results = fx.engine.search(&request);

        // Mock image embedder answers [0,1,0]: a.png is the nearest
        assert_eq!(results.images[0].path, "/shots/a.png");
        assert!(results.text.is_empty());
    }
}
