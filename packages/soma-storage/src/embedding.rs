/// Embedding seam. The engine never talks to a model itself: callers
/// supply an `Embedder` that turns text into a 384-dim vector,
/// deterministic for a given input. Output is normalized here when the
/// model does not already produce unit vectors.
use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};

use async_trait::async_trait;

use crate::error::{Result, SomaError};
use crate::types::{normalize_vector, EMBEDDING_DIM};

#[async_trait]
pub trait Embedder: Send + Sync {
    async fn embed(&self, text: &str) -> Result<Vec<f32>>;
}

/// Embeds and normalizes, folding model failures into `EmbedFailed`.
pub async fn embed_normalized(embedder: &dyn Embedder, text: &str) -> Result<Vec<f32>> {
    let raw = embedder
        .embed(text)
        .await
        .map_err(|e| SomaError::EmbedFailed(e.to_string()))?;
    normalize_vector(raw)
}

/// Deterministic hash-based embedder: token and bigram features bucketed
/// over the embedding dimensions. No model weights, no network; useful
/// offline and as the reference embedder in tests. Semantically crude by
/// construction.
#[derive(Debug, Clone, Copy, Default)]
pub struct HashingEmbedder;

impl HashingEmbedder {
    fn bucket(token: &str, salt: u64) -> (usize, f32) {
        let mut hasher = DefaultHasher::new();
        salt.hash(&mut hasher);
        token.hash(&mut hasher);
        let h = hasher.finish();
        let dim = (h % EMBEDDING_DIM as u64) as usize;
        let sign = if (h >> 62) & 1 == 0 { 1.0 } else { -1.0 };
        (dim, sign)
    }
}

#[async_trait]
impl Embedder for HashingEmbedder {
    async fn embed(&self, text: &str) -> Result<Vec<f32>> {
        let mut vector = vec![0.0f32; EMBEDDING_DIM];
        let tokens: Vec<&str> = text
            .split(|c: char| !c.is_alphanumeric())
            .filter(|t| !t.is_empty())
            .collect();
        for token in &tokens {
            let lowered = token.to_lowercase();
            let (dim, sign) = Self::bucket(&lowered, 0);
            vector[dim] += sign;
        }
        for pair in tokens.windows(2) {
            let bigram = format!("{} {}", pair[0].to_lowercase(), pair[1].to_lowercase());
            let (dim, sign) = Self::bucket(&bigram, 1);
            vector[dim] += sign * 0.5;
        }
        // Bias feature keeps even empty input off the zero vector.
        let (dim, _) = Self::bucket("", 2);
        vector[dim] += 0.25;
        Ok(vector)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_deterministic_and_normalized() {
        let embedder = HashingEmbedder;
        let a = embed_normalized(&embedder, "graph storage engine").await.unwrap();
        let b = embed_normalized(&embedder, "graph storage engine").await.unwrap();
        assert_eq!(a, b);
        let norm: f32 = a.iter().map(|x| x * x).sum::<f32>().sqrt();
        assert!((norm - 1.0).abs() < 1e-5);
    }

    #[tokio::test]
    async fn test_different_texts_differ() {
        let embedder = HashingEmbedder;
        let a = embed_normalized(&embedder, "alpha").await.unwrap();
        let b = embed_normalized(&embedder, "omega").await.unwrap();
        assert_ne!(a, b);
    }

    #[tokio::test]
    async fn test_empty_input_still_embeds() {
        let embedder = HashingEmbedder;
        let v = embed_normalized(&embedder, "").await.unwrap();
        assert_eq!(v.len(), EMBEDDING_DIM);
    }
}
