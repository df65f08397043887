//! Text embeddings for the exemplar retriever.
//!
//! Rather than pull in an ONNX runtime and ship a model file, the
//! `Embedder` trait here is backed by a deterministic feature-hashing
//! embedder: good enough to cluster near-duplicate config snippets, and it
//! needs no model file, network call, or native library.

use serde::{Deserialize, Serialize};

pub const EMBEDDING_DIM: usize = 256;

pub type Embedding = Vec<f32>;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EmbeddingResult {
    pub embedding: Embedding,
    pub text: String,
    pub token_count: usize,
}

/// Seam between the exemplar retriever and whatever turns text into a
/// vector. A real ONNX/sentence-transformer backend can implement this
/// later without touching `retriever.rs`.
pub trait Embedder: Send + Sync {
    fn dim(&self) -> usize;
    fn embed(&self, text: &str) -> EmbeddingResult;

    fn embed_batch(&self, texts: &[&str]) -> Vec<EmbeddingResult> {
        texts.iter().map(|t| self.embed(t)).collect()
    }
}

/// Feature-hashing bag-of-words embedder: each lowercased token is hashed
/// into one of `EMBEDDING_DIM` buckets (sign from a second hash, to reduce
/// collision bias), then the vector is L2-normalized. Deterministic and
/// dependency-free, at the cost of not capturing semantic similarity beyond
/// shared vocabulary.
#[derive(Clone, Default)]
pub struct HashingEmbedder;

impl HashingEmbedder {
    pub fn new() -> Self {
        Self
    }

    fn hash_token(token: &str) -> (usize, f32) {
        let mut h1: u64 = 0xcbf29ce484222325;
        for b in token.bytes() {
            h1 ^= b as u64;
            h1 = h1.wrapping_mul(0x100000001b3);
        }
        let mut h2 = h1;
        h2 ^= h2 >> 33;
        h2 = h2.wrapping_mul(0xff51afd7ed558ccd);

        let bucket = (h1 as usize) % EMBEDDING_DIM;
        let sign = if h2 & 1 == 0 { 1.0 } else { -1.0 };
        (bucket, sign)
    }

    fn tokenize(text: &str) -> Vec<String> {
        text.to_lowercase()
            .split(|c: char| !c.is_alphanumeric())
            .filter(|t| !t.is_empty())
            .map(|t| t.to_string())
            .collect()
    }
}

impl Embedder for HashingEmbedder {
    fn dim(&self) -> usize {
        EMBEDDING_DIM
    }

    fn embed(&self, text: &str) -> EmbeddingResult {
        let tokens = Self::tokenize(text);
        let mut vector = vec![0.0f32; EMBEDDING_DIM];

        for token in &tokens {
            let (bucket, sign) = Self::hash_token(token);
            vector[bucket] += sign;
        }

        let norm: f32 = vector.iter().map(|x| x * x).sum::<f32>().sqrt();
        if norm > 0.0 {
            for v in vector.iter_mut() {
                *v /= norm;
            }
        }

        EmbeddingResult {
            embedding: vector,
            text: text.to_string(),
            token_count: tokens.len(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn embedding_is_l2_normalized() {
        let embedder = HashingEmbedder::new();
        let result = embedder.embed("interface GigabitEthernet0/1 switchport mode trunk");
        let norm: f32 = result.embedding.iter().map(|x| x * x).sum::<f32>().sqrt();
        assert!((norm - 1.0).abs() < 1e-4 || norm == 0.0);
    }

    #[test]
    fn identical_text_is_deterministic() {
        let embedder = HashingEmbedder::new();
        let a = embedder.embed("ip dhcp snooping vlan 10");
        let b = embedder.embed("ip dhcp snooping vlan 10");
        assert_eq!(a.embedding, b.embedding);
    }

    #[test]
    fn similar_text_scores_higher_than_unrelated() {
        let embedder = HashingEmbedder::new();
        let base = embedder.embed("aaa new-model radius server group ISE");
        let similar = embedder.embed("aaa new-model radius server group ISE-secondary");
        let unrelated = embedder.embed("no service password-encryption banner motd");

        let dot = |a: &[f32], b: &[f32]| -> f32 { a.iter().zip(b).map(|(x, y)| x * y).sum() };
        assert!(dot(&base.embedding, &similar.embedding) > dot(&base.embedding, &unrelated.embedding));
    }

    #[test]
    fn empty_text_yields_zero_vector() {
        let embedder = HashingEmbedder::new();
        let result = embedder.embed("");
        assert!(result.embedding.iter().all(|x| *x == 0.0));
    }
}
