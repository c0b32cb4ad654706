//! Point-in-time searcher backed by tantivy
//!
//! A `PointSearcher` is materialized from the documents of one manifest, in
//! manifest order, by a single-threaded writer with merging disabled. Two nodes
//! holding the same manifest therefore build identical indexes and return the
//! same total hits, scores and ranking for the same query.

use super::Document;
use crate::Result;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use tantivy::collector::{Count, TopDocs};
use tantivy::merge_policy::NoMergePolicy;
use tantivy::query::{AllQuery, Query, QueryParser};
use tantivy::schema::*;
use tantivy::{Index, IndexReader, IndexWriter, ReloadPolicy, TantivyDocument};

/// Indexing buffer for materializing a point
const WRITER_MEMORY_BYTES: usize = 50_000_000;

/// One ranked hit
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Hit {
    /// Document id
    pub id: String,
    /// Relevance score
    pub score: f32,
    /// Requested stored fields
    pub fields: BTreeMap<String, String>,
}

/// Result page of a search against one point
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SearchHits {
    /// Number of matching documents
    pub total_hits: u64,
    /// Hits from `start_hit`, at most `top_hits` of them
    pub hits: Vec<Hit>,
}

#[derive(Debug, Clone, Copy)]
struct PointFields {
    id: Field,
    body: Field,
    source: Field,
    ordinal: Field,
}

/// Immutable searchable view of one NRT point
pub struct PointSearcher {
    index: Index,
    reader: IndexReader,
    fields: PointFields,
    num_docs: u64,
}

impl std::fmt::Debug for PointSearcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PointSearcher")
            .field("num_docs", &self.num_docs)
            .finish()
    }
}

impl PointSearcher {
    /// Build a searcher over `docs` (in order)
    pub fn build<'a>(docs: impl IntoIterator<Item = &'a Document>) -> Result<Self> {
        let mut schema_builder = Schema::builder();
        let fields = PointFields {
            id: schema_builder.add_text_field("id", STRING | STORED),
            body: schema_builder.add_text_field("body", TEXT),
            source: schema_builder.add_text_field("source", STORED),
            ordinal: schema_builder.add_u64_field("ordinal", STORED),
        };
        let index = Index::create_in_ram(schema_builder.build());

        let mut writer: IndexWriter<TantivyDocument> =
            index.writer_with_num_threads(1, WRITER_MEMORY_BYTES)?;
        writer.set_merge_policy(Box::new(NoMergePolicy));

        let mut num_docs = 0u64;
        for doc in docs {
            let body = doc
                .fields
                .values()
                .map(String::as_str)
                .collect::<Vec<_>>()
                .join(" ");

            let mut tdoc = TantivyDocument::new();
            tdoc.add_text(fields.id, &doc.id);
            tdoc.add_text(fields.body, &body);
            tdoc.add_text(fields.source, serde_json::to_string(&doc.fields)?);
            tdoc.add_u64(fields.ordinal, num_docs);
            writer.add_document(tdoc)?;
            num_docs += 1;
        }
        writer.commit()?;

        let reader = index
            .reader_builder()
            .reload_policy(ReloadPolicy::Manual)
            .try_into()?;

        Ok(Self {
            index,
            reader,
            fields,
            num_docs,
        })
    }

    /// Number of documents in the point
    pub fn num_docs(&self) -> u64 {
        self.num_docs
    }

    /// Run a query.
    ///
    /// An empty query or `*` matches every document. Equal scores are ordered
    /// by document ordinal so every node pages through ties identically.
    pub fn search(
        &self,
        query: &str,
        start_hit: usize,
        top_hits: usize,
        retrieve_fields: &[String],
    ) -> Result<SearchHits> {
        let searcher = self.reader.searcher();
        let query = self.parse_query(query)?;

        let total_hits = searcher.search(&query, &Count)? as u64;
        if top_hits == 0 || start_hit as u64 >= total_hits {
            return Ok(SearchHits {
                total_hits,
                hits: Vec::new(),
            });
        }
        // page bounds are client input; never size collectors past the match count
        let matched = usize::try_from(total_hits).unwrap_or(usize::MAX);
        let limit = start_hit.saturating_add(top_hits).min(matched);
        let page_size = top_hits.min(matched - start_hit);

        let top_docs = searcher.search(&query, &TopDocs::with_limit(limit))?;

        let mut ranked = Vec::with_capacity(top_docs.len());
        for (score, address) in top_docs {
            let doc: TantivyDocument = searcher.doc(address)?;
            let ordinal = doc
                .get_first(self.fields.ordinal)
                .and_then(|v| v.as_u64())
                .unwrap_or(u64::MAX);
            ranked.push((score, ordinal, doc));
        }
        ranked.sort_by(|a, b| b.0.total_cmp(&a.0).then(a.1.cmp(&b.1)));

        let mut hits = Vec::with_capacity(page_size);
        for (score, _, doc) in ranked.into_iter().skip(start_hit).take(page_size) {
            hits.push(self.to_hit(&doc, score, retrieve_fields)?);
        }

        Ok(SearchHits { total_hits, hits })
    }

    fn parse_query(&self, query: &str) -> Result<Box<dyn Query>> {
        let trimmed = query.trim();
        if trimmed.is_empty() || trimmed == "*" {
            return Ok(Box::new(AllQuery));
        }
        let parser = QueryParser::for_index(&self.index, vec![self.fields.body]);
        Ok(parser.parse_query(trimmed)?)
    }

    fn to_hit(&self, doc: &TantivyDocument, score: f32, retrieve_fields: &[String]) -> Result<Hit> {
        let id = doc
            .get_first(self.fields.id)
            .and_then(|v| v.as_str())
            .unwrap_or_default()
            .to_string();

        let fields = if retrieve_fields.is_empty() {
            BTreeMap::new()
        } else {
            let source = doc
                .get_first(self.fields.source)
                .and_then(|v| v.as_str())
                .unwrap_or("{}");
            let mut stored: BTreeMap<String, String> = serde_json::from_str(source)?;
            stored.retain(|name, _| retrieve_fields.iter().any(|f| f == name));
            stored
        };

        Ok(Hit { id, score, fields })
    }
}
