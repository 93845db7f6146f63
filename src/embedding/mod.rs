//! 임베딩 모듈 - 텍스트를 고정 길이 벡터로 변환
//!
//! 인덱스 시점과 쿼리 시점 벡터가 같은 공간에 있어야 하므로
//! 정규화는 프로바이더가 책임집니다 (모든 구현체가 L2 정규화된 벡터 반환).
//!
//! ## 사용법
//! ```rust,ignore
//! let embedder = HashingEmbedding::new(384)?;
//! let embedding = embedder.embed("traitement de canal molaire").await?;
//! ```

mod gemini;
mod hashing;

use std::sync::Arc;

use async_trait::async_trait;

use crate::config::{EmbedderKind, RagConfig};
use crate::error::{RagError, Result};

pub use gemini::{get_api_key, has_api_key, GeminiEmbedding, GEMINI_DIMENSIONS};
pub use hashing::HashingEmbedding;

/// 기본 임베딩 차원
pub const DEFAULT_DIMENSION: usize = 384;

// ============================================================================
// EmbeddingProvider Trait
// ============================================================================

/// 임베딩 프로바이더 트레이트
///
/// 모델 상태에 대한 순수 함수입니다. 같은 `model_id`에서 같은 텍스트는
/// 항상 같은 벡터를 반환해야 합니다. 모델 추론이 가장 느린 단계일 수 있습니다.
#[async_trait]
pub trait EmbeddingProvider: Send + Sync {
    /// 단일 텍스트 임베딩 (빈/공백 텍스트는 `InvalidInput`)
    async fn embed(&self, text: &str) -> Result<Vec<f32>>;

    /// 배치 임베딩 (기본 구현: 순차 호출)
    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        let mut results = Vec::with_capacity(texts.len());
        for text in texts {
            results.push(self.embed(text).await?);
        }
        Ok(results)
    }

    /// 임베딩 차원 수
    fn dimension(&self) -> usize;

    /// 모델 식별자 (인덱스 스키마 버전의 일부)
    fn model_id(&self) -> &str;

    /// 프로바이더 이름
    fn name(&self) -> &str;
}

// ============================================================================
// Helpers
// ============================================================================

/// 빈 텍스트 거부
pub(crate) fn ensure_embeddable(text: &str) -> Result<()> {
    if text.trim().is_empty() {
        return Err(RagError::invalid("cannot embed empty or whitespace-only text"));
    }
    Ok(())
}

/// L2 정규화 (영벡터는 그대로 반환)
pub fn l2_normalize(mut vector: Vec<f32>) -> Vec<f32> {
    let norm: f32 = vector.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm > 0.0 && norm.is_finite() {
        for x in vector.iter_mut() {
            *x /= norm;
        }
    }
    vector
}

/// 코사인 유사도 계산
///
/// 결과는 -1.0 ~ 1.0 범위입니다. 길이가 다르거나 영벡터면 0.0입니다.
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }

    let dot_product: f32 = a.iter().zip(b.iter()).map(|(x, y)| x * y).sum();
    let norm_a: f32 = a.iter().map(|x| x * x).sum::<f32>().sqrt();
    let norm_b: f32 = b.iter().map(|x| x * x).sum::<f32>().sqrt();

    if norm_a == 0.0 || norm_b == 0.0 {
        return 0.0;
    }

    (dot_product / (norm_a * norm_b)).clamp(-1.0, 1.0)
}

// ============================================================================
// Factory Function
// ============================================================================

/// 설정에 맞는 임베딩 프로바이더 생성
pub fn create_embedder(config: &RagConfig) -> Result<Arc<dyn EmbeddingProvider>> {
    let embedder: Arc<dyn EmbeddingProvider> = match config.embedder {
        EmbedderKind::Hashing => Arc::new(HashingEmbedding::new(config.embedding_dimension())?),
        EmbedderKind::Gemini => {
            Arc::new(GeminiEmbedding::from_env_with_dimension(
                config.embedding_dimension(),
            )?)
        }
    };

    tracing::info!(
        "Using {} embedding (model: {}, dimension: {})",
        embedder.name(),
        embedder.model_id(),
        embedder.dimension()
    );
    Ok(embedder)
}

// ============================================================================
// Tests
// ============================================================================
