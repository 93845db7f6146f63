//! 해싱 임베딩 - 로컬 결정적 임베딩 모델
//!
//! 토큰과 토큰별 문자 trigram(경계 표시 `^`, `$` 포함)을 SHA-256으로
//! D개의 부호 있는 버킷에 투영한 뒤 L2 정규화합니다.
//! 네트워크 없이 동작하며 같은 텍스트는 항상 같은 벡터가 됩니다.
//!
//! ref: https://en.wikipedia.org/wiki/Feature_hashing

use async_trait::async_trait;
use sha2::{Digest, Sha256};

use super::{ensure_embeddable, l2_normalize, EmbeddingProvider};
use crate::error::{RagError, Result};

/// 단어 피처 가중치
const WORD_WEIGHT: f32 = 1.0;
/// 문자 trigram 피처 가중치 (어형 변화/접미사 유사성)
const TRIGRAM_WEIGHT: f32 = 0.5;
/// 단어로 취급할 최소 글자 수 (d', l' 같은 관사 제거)
const MIN_TOKEN_CHARS: usize = 2;

/// 로컬 해싱 임베딩 구현체
#[derive(Debug, Clone)]
pub struct HashingEmbedding {
    dimension: usize,
    model_id: String,
}

impl HashingEmbedding {
    /// 차원을 지정하여 생성
    pub fn new(dimension: usize) -> Result<Self> {
        if dimension == 0 {
            return Err(RagError::invalid("hashing dimension must be positive"));
        }
        Ok(Self {
            dimension,
            model_id: format!("hashing-v1-{}", dimension),
        })
    }

    /// 동기 임베딩 (async 트레이트 구현이 위임)
    pub fn embed_sync(&self, text: &str) -> Result<Vec<f32>> {
        ensure_embeddable(text)?;

        let mut vector = vec![0.0f32; self.dimension];
        for token in tokenize(text) {
            self.accumulate(&mut vector, &format!("w:{}", token), WORD_WEIGHT);

            let padded: Vec<char> = format!("^{}$", token).chars().collect();
            for window in padded.windows(3) {
                let trigram: String = window.iter().collect();
                self.accumulate(&mut vector, &format!("g:{}", trigram), TRIGRAM_WEIGHT);
            }
        }

        Ok(l2_normalize(vector))
    }

    fn accumulate(&self, vector: &mut [f32], feature: &str, weight: f32) {
        let digest = Sha256::digest(feature.as_bytes());
        let mut head = [0u8; 8];
        head.copy_from_slice(&digest[..8]);
        let bucket = (u64::from_le_bytes(head) % self.dimension as u64) as usize;
        let sign = if digest[8] & 1 == 0 { 1.0 } else { -1.0 };
        vector[bucket] += sign * weight;
    }
}

/// 소문자화 후 영숫자가 아닌 문자로 분할
///
/// 2글자 이상 토큰이 하나도 없으면 전체 텍스트를 하나의 토큰으로 사용합니다.
fn tokenize(text: &str) -> Vec<String> {
    let lowered = text.to_lowercase();
    let tokens: Vec<String> = lowered
        .split(|c: char| !c.is_alphanumeric())
        .filter(|t| t.chars().count() >= MIN_TOKEN_CHARS)
        .map(str::to_string)
        .collect();

    if tokens.is_empty() {
        let whole = lowered.trim();
        if whole.is_empty() {
            return vec![];
        }
        return vec![whole.to_string()];
    }
    tokens
}

#[async_trait]
impl EmbeddingProvider for HashingEmbedding {
    async fn embed(&self, text: &str) -> Result<Vec<f32>> {
        self.embed_sync(text)
    }

    fn dimension(&self) -> usize {
        self.dimension
    }

    fn model_id(&self) -> &str {
        &self.model_id
    }

    fn name(&self) -> &str {
        "hashing"
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::embedding::cosine_similarity;

    fn embedder() -> HashingEmbedding {
        HashingEmbedding::new(384).unwrap()
    }

    #[test]
    fn test_tokenize_drops_elisions() {
        assert_eq!(
            tokenize("Pose d'implant DENTAIRE"),
            vec!["pose", "implant", "dentaire"]
        );
        assert_eq!(tokenize("?"), vec!["?"]);
    }

    #[test]
    fn test_deterministic_and_normalized() {
        let e = embedder();
        let a = e.embed_sync("traitement de canal molaire").unwrap();
        let b = e.embed_sync("traitement de canal molaire").unwrap();
        assert_eq!(a, b);

        let norm: f32 = a.iter().map(|x| x * x).sum::<f32>().sqrt();
        assert!((norm - 1.0).abs() < 1e-5);
        assert_eq!(a.len(), 384);
    }

    #[test]
    fn test_case_insensitive() {
        let e = embedder();
        let a = e.embed_sync("Molaire").unwrap();
        let b = e.embed_sync("molaire").unwrap();
        assert!((cosine_similarity(&a, &b) - 1.0).abs() < 1e-5);
    }

    #[test]
    fn test_shared_terms_score_higher() {
        let e = embedder();
        let query = e.embed_sync("endodontie molaire douloureuse").unwrap();
        let canal = e.embed_sync("traitement de canal molaire").unwrap();
        let scaling = e.embed_sync("détartrage de routine").unwrap();
        assert!(cosine_similarity(&query, &canal) > cosine_similarity(&query, &scaling));
    }

    #[test]
    fn test_empty_rejected() {
        let e = embedder();
        assert!(matches!(e.embed_sync(""), Err(RagError::InvalidInput(_))));
        assert!(matches!(e.embed_sync(" \n\t"), Err(RagError::InvalidInput(_))));
    }

    #[test]
    fn test_zero_dimension_rejected() {
        assert!(HashingEmbedding::new(0).is_err());
    }

    #[test]
    fn test_model_id_carries_dimension() {
        assert_eq!(HashingEmbedding::new(128).unwrap().model_id(), "hashing-v1-128");
    }
}
