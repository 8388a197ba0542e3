//! Per-region document index wrapper.
//!
//! Documents live in `document_data` (bincode rows) with their scalar
//! fields in `document_scalar`, MVCC-encoded under the document namespace.
//! The live index is an in-memory inverted index ranked with BM25:
//!
//! ```text
//! score(q, d) = Σ IDF(t) * (TF(t,d) * (k1 + 1)) / (TF(t,d) + k1 * (1 - b + b * |d|/avgdl))
//! ```

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use kite_common::error::{KiteResult, RawError};
use kite_common::types::{KeyRange, RegionId, Ts};
use kite_mvcc::codec::{pack_tombstone, pack_value, ValueFlag, NS_DOCUMENT};
use kite_mvcc::reader::MvccReader;
use kite_storage::engine::{RawEngine, WriteBatch, CF_DOCUMENT_DATA, CF_DOCUMENT_SCALAR};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

/// Term-frequency saturation; the conventional default.
const BM25_K1: f64 = 1.2;
/// Length normalization; the conventional default.
const BM25_B: f64 = 0.75;

/// One document row as written by clients.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DocumentWithData {
    pub id: u64,
    /// Named text fields, all of which are indexed.
    pub fields: BTreeMap<String, String>,
    pub scalars: BTreeMap<String, String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ScoredDoc {
    pub id: u64,
    pub score: f64,
}

#[derive(Default)]
struct InvertedIndex {
    /// term → (doc id → term frequency)
    postings: HashMap<String, HashMap<u64, u32>>,
    doc_len: HashMap<u64, u32>,
}

impl InvertedIndex {
    fn add(&mut self, id: u64, text: &str) {
        let mut len = 0u32;
        for term in tokenize(text) {
            *self
                .postings
                .entry(term)
                .or_default()
                .entry(id)
                .or_default() += 1;
            len += 1;
        }
        *self.doc_len.entry(id).or_default() += len;
    }

    fn remove(&mut self, id: u64) {
        self.doc_len.remove(&id);
        self.postings.retain(|_, docs| {
            docs.remove(&id);
            !docs.is_empty()
        });
    }

    fn avg_doc_len(&self) -> f64 {
        if self.doc_len.is_empty() {
            return 0.0;
        }
        self.doc_len.values().map(|&l| l as f64).sum::<f64>() / self.doc_len.len() as f64
    }

    fn score(&self, query_terms: &[String]) -> HashMap<u64, f64> {
        let n = self.doc_len.len() as f64;
        let avgdl = self.avg_doc_len().max(f64::EPSILON);
        let mut scores: HashMap<u64, f64> = HashMap::new();
        for term in query_terms {
            let Some(docs) = self.postings.get(term) else {
                continue;
            };
            let df = docs.len() as f64;
            let idf = ((n - df + 0.5) / (df + 0.5) + 1.0).ln();
            for (&id, &tf) in docs {
                let dl = *self.doc_len.get(&id).unwrap_or(&0) as f64;
                let tf = tf as f64;
                let contribution =
                    idf * (tf * (BM25_K1 + 1.0)) / (tf + BM25_K1 * (1.0 - BM25_B + BM25_B * dl / avgdl));
                *scores.entry(id).or_default() += contribution;
            }
        }
        scores
    }
}

fn tokenize(text: &str) -> impl Iterator<Item = String> + '_ {
    text.split(|c: char| !c.is_alphanumeric())
        .filter(|t| !t.is_empty())
        .map(|t| t.to_lowercase())
}

/// Per-region coordination around the inverted index.
pub struct DocumentIndexWrapper {
    region_id: RegionId,
    engine: Arc<dyn RawEngine>,
    index: RwLock<InvertedIndex>,
}

impl DocumentIndexWrapper {
    pub fn new(region_id: RegionId, engine: Arc<dyn RawEngine>) -> Self {
        Self {
            region_id,
            engine,
            index: RwLock::new(InvertedIndex::default()),
        }
    }

    pub fn region_id(&self) -> RegionId {
        self.region_id
    }

    /// Write one document at `ts` and index its text fields.
    pub fn upsert(&self, ts: Ts, doc: &DocumentWithData) -> KiteResult<()> {
        let id_key = doc.id.to_be_bytes();
        let doc_raw =
            bincode::serialize(doc).map_err(|e| RawError::Codec(e.to_string()))?;
        let scalars_raw =
            bincode::serialize(&doc.scalars).map_err(|e| RawError::Codec(e.to_string()))?;

        let mut batch = WriteBatch::new();
        batch.put(
            CF_DOCUMENT_DATA,
            kite_mvcc::codec::encode_key(NS_DOCUMENT, &id_key, ts),
            pack_value(ValueFlag::Normal, &doc_raw),
        );
        batch.put(
            CF_DOCUMENT_SCALAR,
            kite_mvcc::codec::encode_key(NS_DOCUMENT, &id_key, ts),
            pack_value(ValueFlag::Normal, &scalars_raw),
        );
        self.engine.write_batch(batch)?;

        let mut index = self.index.write();
        index.remove(doc.id);
        for text in doc.fields.values() {
            index.add(doc.id, text);
        }
        Ok(())
    }

    pub fn delete(&self, ts: Ts, id: u64) -> KiteResult<()> {
        let id_key = id.to_be_bytes();
        let mut batch = WriteBatch::new();
        batch.put(
            CF_DOCUMENT_DATA,
            kite_mvcc::codec::encode_key(NS_DOCUMENT, &id_key, ts),
            pack_tombstone(),
        );
        batch.put(
            CF_DOCUMENT_SCALAR,
            kite_mvcc::codec::encode_key(NS_DOCUMENT, &id_key, ts),
            pack_tombstone(),
        );
        self.engine.write_batch(batch)?;
        self.index.write().remove(id);
        Ok(())
    }

    /// BM25 top-n over the live index, optionally restricted to documents
    /// whose scalar fields match every predicate at `ts`.
    pub fn search(
        &self,
        ts: Ts,
        query: &str,
        top_n: usize,
        scalar_filter: Option<&BTreeMap<String, String>>,
    ) -> KiteResult<Vec<ScoredDoc>> {
        let terms: Vec<String> = tokenize(query).collect();
        let scores = self.index.read().score(&terms);

        let mut hits: Vec<ScoredDoc> = Vec::with_capacity(scores.len());
        for (id, score) in scores {
            if let Some(predicates) = scalar_filter {
                if !self.scalar_matches(ts, id, predicates)? {
                    continue;
                }
            }
            hits.push(ScoredDoc { id, score });
        }
        hits.sort_by(|a, b| b.score.total_cmp(&a.score).then(a.id.cmp(&b.id)));
        hits.truncate(top_n);
        Ok(hits)
    }

    /// Load one document row at `ts`.
    pub fn query(&self, ts: Ts, id: u64) -> KiteResult<Option<DocumentWithData>> {
        let reader = MvccReader::document(self.engine.snapshot());
        let Some(raw) = reader.kv_get(CF_DOCUMENT_DATA, ts, &id.to_be_bytes())? else {
            return Ok(None);
        };
        let doc = bincode::deserialize(&raw).map_err(|e| RawError::Codec(e.to_string()))?;
        Ok(Some(doc))
    }

    /// Rebuild the inverted index from the data CF at `ts`.
    pub fn rebuild(&self, ts: Ts) -> KiteResult<usize> {
        let reader = MvccReader::document(self.engine.snapshot());
        let range = KeyRange::new(0u64.to_be_bytes().to_vec(), Vec::new());
        let mut fresh = InvertedIndex::default();
        let mut loaded = 0usize;
        let mut first_error: Option<RawError> = None;
        reader.kv_scan_with(CF_DOCUMENT_DATA, ts, &range, |_, value| {
            match bincode::deserialize::<DocumentWithData>(value) {
                Ok(doc) => {
                    for text in doc.fields.values() {
                        fresh.add(doc.id, text);
                    }
                    loaded += 1;
                    true
                }
                Err(e) => {
                    first_error = Some(RawError::Codec(e.to_string()));
                    false
                }
            }
        })?;
        if let Some(e) = first_error {
            return Err(e.into());
        }
        *self.index.write() = fresh;
        tracing::info!(region = self.region_id, loaded, "document index rebuilt");
        Ok(loaded)
    }

    fn scalar_matches(
        &self,
        ts: Ts,
        id: u64,
        predicates: &BTreeMap<String, String>,
    ) -> KiteResult<bool> {
        let reader = MvccReader::document(self.engine.snapshot());
        let Some(raw) = reader.kv_get(CF_DOCUMENT_SCALAR, ts, &id.to_be_bytes())? else {
            return Ok(false);
        };
        let scalars: BTreeMap<String, String> =
            bincode::deserialize(&raw).map_err(|e| RawError::Codec(e.to_string()))?;
        Ok(predicates
            .iter()
            .all(|(k, v)| scalars.get(k).map(|s| s == v).unwrap_or(false)))
    }
}
