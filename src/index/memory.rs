use std::collections::HashMap;

use async_trait::async_trait;
use tantivy::collector::TopDocs;
use tantivy::query::{
    BooleanQuery, BoostQuery, DisjunctionMaxQuery, FuzzyTermQuery, Occur, PhraseQuery, Query,
    TermQuery,
};
use tantivy::schema::{Field, IndexRecordOption, Schema, Value, INDEXED, STORED, STRING, TEXT};
use tantivy::tokenizer::TokenStream;
use tantivy::{Index, IndexReader, IndexWriter, ReloadPolicy, TantivyDocument, Term};
use tokio::sync::{Mutex, RwLock};

use super::{
    rank_order, KnnQuery, LexicalQuery, ScoreFloors, SearchIndex, BEST_FIELDS, FUZZY_BOOST,
    MOST_FIELDS, PARTIAL_BOOST, PHRASE_BOOST, PHRASE_FIELDS,
};
use crate::error::Result;
use crate::models::{IndexDocument, SearchHit, EMBEDDING_DIMS};

/// Smallest heap tantivy accepts for a single indexing thread.
const WRITER_HEAP_BYTES: usize = 15_000_000;

/// Fuzzy matches score a constant per term and BM25 IDF collapses on small
/// corpora, so absolute floors tuned for Elasticsearch do not carry over.
/// Every document the query matches is kept.
const MEMORY_FLOORS: ScoreFloors = ScoreFloors {
    index: 0.0,
    post: 0.0,
};

/// Tantivy field handles for the post schema.
#[derive(Debug, Clone, Copy)]
struct PostFields {
    id: Field,
    title: Field,
    description: Field,
    content: Field,
    tags: Field,
    source: Field,
    url: Field,
}

impl PostFields {
    fn build() -> (Schema, Self) {
        let mut b = Schema::builder();
        let id = b.add_i64_field("id", INDEXED | STORED);
        let title = b.add_text_field("title", TEXT);
        let description = b.add_text_field("description", TEXT);
        let content = b.add_text_field("content", TEXT);
        let tags = b.add_text_field("tags", STRING);
        let source = b.add_text_field("source", STRING | STORED);
        let url = b.add_text_field("url", STRING | STORED);
        let fields = Self {
            id,
            title,
            description,
            content,
            tags,
            source,
            url,
        };
        (b.build(), fields)
    }

    fn by_name(&self, name: &str) -> Option<Field> {
        match name {
            "title" => Some(self.title),
            "description" => Some(self.description),
            "content" => Some(self.content),
            "tags" => Some(self.tags),
            _ => None,
        }
    }

    fn to_document(&self, id: i64, doc: &IndexDocument) -> TantivyDocument {
        let mut out = TantivyDocument::default();
        out.add_i64(self.id, id);
        out.add_text(self.title, &doc.title);
        out.add_text(self.description, &doc.description);
        out.add_text(self.content, &doc.content);
        for tag in &doc.tags {
            // Keyword field: the whole tag, matched case-insensitively
            out.add_text(self.tags, tag.trim().to_lowercase());
        }
        out.add_text(self.source, &doc.source);
        out.add_text(self.url, &doc.url);
        out
    }
}

/// In-process index backed by a RAM tantivy index.
///
/// Text fields use tantivy's default analyzer and BM25; the three lexical
/// tiers are phrase, fuzzy and partial term queries with the same field
/// boosts as the Elasticsearch mapping. Documents are also kept by id so
/// hits carry the full [`IndexDocument`] and kNN can run an exact cosine
/// scan scored as `(1 + cos) / 2`.
pub struct MemoryIndex {
    index: Index,
    fields: PostFields,
    writer: Mutex<IndexWriter>,
    reader: IndexReader,
    docs: RwLock<HashMap<i64, IndexDocument>>,
}

impl MemoryIndex {
    pub fn new() -> Result<Self> {
        let (schema, fields) = PostFields::build();
        let index = Index::create_in_ram(schema);
        let writer = index.writer_with_num_threads(1, WRITER_HEAP_BYTES)?;
        let reader = index
            .reader_builder()
            .reload_policy(ReloadPolicy::Manual)
            .try_into()?;

        Ok(Self {
            index,
            fields,
            writer: Mutex::new(writer),
            reader,
            docs: RwLock::new(HashMap::new()),
        })
    }

    /// Commit pending operations and make them visible to searchers.
    fn commit(&self, writer: &mut IndexWriter) -> Result<()> {
        writer.commit()?;
        self.reader.reload()?;
        Ok(())
    }

    /// Tokens of `text` as the text fields index them.
    fn analyze(&self, text: &str) -> Result<Vec<String>> {
        let mut analyzer = self.index.tokenizer_for_field(self.fields.title)?;
        let mut stream = analyzer.token_stream(text);
        let mut tokens = Vec::new();
        while stream.advance() {
            tokens.push(stream.token().text.clone());
        }
        Ok(tokens)
    }

    /// Query terms for one field: text fields take the analyzed tokens,
    /// the keyword tags field takes the whole lowercased query.
    fn field_terms(
        &self,
        name: &str,
        tokens: &[String],
        keyword: &str,
    ) -> Option<(Field, Vec<String>)> {
        let field = self.fields.by_name(name)?;
        let terms = if field == self.fields.tags {
            if keyword.is_empty() {
                return None;
            }
            vec![keyword.to_string()]
        } else {
            if tokens.is_empty() {
                return None;
            }
            tokens.to_vec()
        };
        Some((field, terms))
    }

    /// `bool.should` over the three tiers. `None` when nothing is searchable.
    fn build_query(&self, text: &str) -> Result<Option<BooleanQuery>> {
        let tokens = self.analyze(text)?;
        let keyword = text.trim().to_lowercase();

        let mut phrase = Vec::new();
        for (name, boost) in PHRASE_FIELDS {
            if let Some((field, terms)) = self.field_terms(name, &tokens, &keyword) {
                phrase.push(boosted(phrase_query(field, &terms), boost));
            }
        }

        let mut fuzzy = Vec::new();
        for (name, boost) in BEST_FIELDS {
            if let Some((field, terms)) = self.field_terms(name, &tokens, &keyword) {
                let clauses = terms
                    .iter()
                    .map(|t| (Occur::Should, fuzzy_query(field, t)))
                    .collect();
                fuzzy.push(boosted(Box::new(BooleanQuery::new(clauses)), boost));
            }
        }

        let mut partial = Vec::new();
        for (name, boost) in MOST_FIELDS {
            if let Some((field, terms)) = self.field_terms(name, &tokens, &keyword) {
                let clauses = terms
                    .iter()
                    .map(|t| (Occur::Should, term_query(field, t)))
                    .collect();
                partial.push((
                    Occur::Should,
                    boosted(Box::new(BooleanQuery::new(clauses)), boost),
                ));
            }
        }

        if phrase.is_empty() {
            return Ok(None);
        }

        // Phrase and fuzzy take the best field, partial sums across fields
        Ok(Some(BooleanQuery::new(vec![
            (
                Occur::Should,
                boosted(Box::new(DisjunctionMaxQuery::new(phrase)), PHRASE_BOOST),
            ),
            (
                Occur::Should,
                boosted(Box::new(DisjunctionMaxQuery::new(fuzzy)), FUZZY_BOOST),
            ),
            (
                Occur::Should,
                boosted(Box::new(BooleanQuery::new(partial)), PARTIAL_BOOST),
            ),
        ])))
    }
}

fn boosted(query: Box<dyn Query>, boost: f32) -> Box<dyn Query> {
    Box::new(BoostQuery::new(query, boost))
}

fn term_query(field: Field, text: &str) -> Box<dyn Query> {
    Box::new(TermQuery::new(
        Term::from_field_text(field, text),
        IndexRecordOption::WithFreqs,
    ))
}

fn phrase_query(field: Field, terms: &[String]) -> Box<dyn Query> {
    match terms {
        [single] => term_query(field, single),
        _ => Box::new(PhraseQuery::new(
            terms
                .iter()
                .map(|t| Term::from_field_text(field, t))
                .collect(),
        )),
    }
}

fn fuzzy_query(field: Field, text: &str) -> Box<dyn Query> {
    match auto_fuzziness(text) {
        0 => term_query(field, text),
        distance => Box::new(FuzzyTermQuery::new(
            Term::from_field_text(field, text),
            distance,
            true,
        )),
    }
}

/// Elasticsearch AUTO fuzziness: exact up to 2 chars, one edit up to 5,
/// two edits beyond.
fn auto_fuzziness(term: &str) -> u8 {
    match term.chars().count() {
        0..=2 => 0,
        3..=5 => 1,
        _ => 2,
    }
}

#[async_trait]
impl SearchIndex for MemoryIndex {
    async fn ensure_index(&self) -> Result<()> {
        Ok(())
    }

    async fn upsert(&self, id: i64, document: IndexDocument) -> Result<()> {
        let mut writer = self.writer.lock().await;
        writer.delete_term(Term::from_field_i64(self.fields.id, id));
        writer.add_document(self.fields.to_document(id, &document))?;
        self.commit(&mut writer)?;

        self.docs.write().await.insert(id, document);
        Ok(())
    }

    async fn delete(&self, id: i64) -> Result<bool> {
        let mut writer = self.writer.lock().await;
        let mut docs = self.docs.write().await;
        if docs.remove(&id).is_none() {
            return Ok(false);
        }
        writer.delete_term(Term::from_field_i64(self.fields.id, id));
        self.commit(&mut writer)?;
        Ok(true)
    }

    async fn delete_by_source(&self, source: &str) -> Result<usize> {
        let mut writer = self.writer.lock().await;
        let mut docs = self.docs.write().await;
        let before = docs.len();
        docs.retain(|_, doc| doc.source != source);
        writer.delete_term(Term::from_field_text(self.fields.source, source));
        self.commit(&mut writer)?;
        Ok(before - docs.len())
    }

    async fn lexical(&self, query: &LexicalQuery) -> Result<Vec<SearchHit>> {
        let Some(text_query) = self.build_query(&query.text)? else {
            return Ok(Vec::new());
        };

        let docs = self.docs.read().await;
        let searcher = self.reader.searcher();
        // Collect every match so equal scores can be ordered by date
        let limit = (searcher.num_docs() as usize).max(1);
        let top = searcher.search(&text_query, &TopDocs::with_limit(limit))?;

        let mut hits = Vec::with_capacity(top.len());
        for (score, address) in top {
            if score < query.min_score {
                continue;
            }
            let stored: TantivyDocument = searcher.doc(address)?;
            let Some(id) = stored.get_first(self.fields.id).and_then(|v| v.as_i64()) else {
                continue;
            };
            if let Some(doc) = docs.get(&id) {
                hits.push(SearchHit::new(id, score, doc.clone()));
            }
        }

        hits.sort_by(rank_order);
        hits.truncate(query.size);
        Ok(hits)
    }

    async fn knn(&self, query: &KnnQuery) -> Result<Vec<SearchHit>> {
        let docs = self.docs.read().await;

        let mut candidates: Vec<SearchHit> = docs
            .iter()
            .filter_map(|(id, doc)| {
                let embedding = doc.embedding.as_ref()?;
                if embedding.len() != EMBEDDING_DIMS || embedding.len() != query.vector.len() {
                    return None;
                }
                let similarity = cosine_similarity(&query.vector, embedding)?;
                Some(SearchHit::new(*id, (1.0 + similarity) / 2.0, doc.clone()))
            })
            .collect();

        candidates.sort_by(|a, b| b.score.partial_cmp(&a.score).unwrap_or(std::cmp::Ordering::Equal));
        candidates.truncate(query.num_candidates.max(query.k));
        candidates.sort_by(rank_order);
        candidates.truncate(query.k);
        Ok(candidates)
    }

    async fn count(&self) -> Result<usize> {
        Ok(self.reader.searcher().num_docs() as usize)
    }

    fn score_floors(&self) -> ScoreFloors {
        MEMORY_FLOORS
    }
}

fn cosine_similarity(a: &[f32], b: &[f32]) -> Option<f32> {
    let dot: f32 = a.iter().zip(b).map(|(x, y)| x * y).sum();
    let norm_a: f32 = a.iter().map(|x| x * x).sum::<f32>().sqrt();
    let norm_b: f32 = b.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm_a == 0.0 || norm_b == 0.0 {
        return None;
    }
    Some(dot / (norm_a * norm_b))
}
