//! Shared fixtures for the integration tests.

#![allow(dead_code)]

use std::fs;
use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use template_harness::config::Config;
use template_harness::embedding::EmbeddingProvider;
use template_harness::error::Result;
use template_harness::index::{MemoryIndex, VectorIndex};
use template_harness::retrieval::RetrievalEngine;
use template_harness::store::VectorStore;

pub const DIMS: usize = 64;

/// Bag-of-words embedder: each lowercase word is hashed (FNV-1a) into one
/// of `DIMS` buckets and the vector is L2-normalized. Texts sharing words
/// land close together.
pub struct HashEmbedder;

fn fnv1a(word: &str) -> u64 {
    let mut hash: u64 = 0xcbf29ce484222325;
    for byte in word.bytes() {
        hash ^= u64::from(byte);
        hash = hash.wrapping_mul(0x100000001b3);
    }
    hash
}

pub fn hash_embed(text: &str) -> Vec<f32> {
    let mut v = vec![0.0f32; DIMS];
    for word in text
        .split(|c: char| !c.is_ascii_alphanumeric())
        .filter(|w| !w.is_empty())
    {
        let bucket = (fnv1a(&word.to_ascii_lowercase()) % DIMS as u64) as usize;
        v[bucket] += 1.0;
    }
    let norm = v.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm > 0.0 {
        for x in &mut v {
            *x /= norm;
        }
    }
    v
}

#[async_trait]
impl EmbeddingProvider for HashEmbedder {
    fn model_name(&self) -> &str {
        "hash-test"
    }

    fn dims(&self) -> usize {
        DIMS
    }

    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        Ok(texts.iter().map(|t| hash_embed(t)).collect())
    }
}

pub fn test_config() -> Config {
    let mut cfg = Config::default();
    cfg.store.backend = "memory".to_string();
    cfg
}

pub fn store_on(index: Arc<dyn VectorIndex>, cfg: &Config) -> Arc<VectorStore> {
    Arc::new(VectorStore::from_config(cfg, index, Arc::new(HashEmbedder)).unwrap())
}

pub fn memory_engine(cfg: &Config) -> Arc<RetrievalEngine> {
    let store = store_on(Arc::new(MemoryIndex::new()), cfg);
    Arc::new(RetrievalEngine::new(store, cfg))
}

pub fn template_yaml(id: &str, name: &str, severity: &str, tags: &str) -> String {
    format!(
        "id: {id}\n\ninfo:\n  name: {name}\n  author: tester\n  severity: {severity}\n  tags: {tags}\n\nhttp:\n  - method: GET\n    path:\n      - \"{{{{BaseURL}}}}/\"\n    matchers:\n      - type: status\n        status:\n          - 200\n"
    )
}

pub fn write_template(dir: &Path, file: &str, content: &str) {
    if let Some(parent) = dir.join(file).parent() {
        fs::create_dir_all(parent).unwrap();
    }
    fs::write(dir.join(file), content).unwrap();
}

/// A small corpus of three templates with distinct severities and tags.
pub fn write_corpus(dir: &Path) {
    write_template(
        dir,
        "http/sqli-login.yaml",
        &template_yaml("sqli-login", "SQL Injection in Login", "high", "sqli,login"),
    );
    write_template(
        dir,
        "http/git-config.yaml",
        &template_yaml("git-config", "Exposed Git Config", "medium", "exposure,git"),
    );
    write_template(
        dir,
        "http/tech-detect.yaml",
        &template_yaml("tech-detect", "Technology Detection", "info", "tech"),
    );
}
