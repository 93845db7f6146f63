//! Retrieval Service - 쿼리 임베딩 → 벡터 검색 → 필터/랭킹/절단 → 하이드레이션
//!
//! 읽기 경로는 빠르고 명시적으로 실패합니다. 저장소에서 확인할 수 없는
//! 케이스는 결과에 절대 포함되지 않습니다.

use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;

use super::index::{IndexSchema, ScoredCase, VectorIndex};
use super::record::{normalize_tags, CaseId, CaseMetadata, CaseSource, CaseState};
use super::store::CaseStore;
use crate::config::RetrievalConfig;
use crate::embedding::EmbeddingProvider;
use crate::error::{RagError, Result};

// ============================================================================
// Types
// ============================================================================

/// 메타데이터 필터 (`source`, `tags`만 필터 가능)
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MetadataFilter {
    /// 이 중 하나라도 가진 케이스만 (비어 있으면 무시)
    pub tags: Vec<String>,
    pub source: Option<CaseSource>,
}

impl MetadataFilter {
    pub fn is_empty(&self) -> bool {
        self.tags.is_empty() && self.source.is_none()
    }

    pub fn matches(&self, metadata: &CaseMetadata) -> bool {
        if let Some(source) = self.source {
            if metadata.source != source {
                return false;
            }
        }
        self.tags.is_empty() || self.tags.iter().any(|t| metadata.tags.contains(t))
    }
}

/// 검색 쿼리 (영속화되지 않음)
#[derive(Debug, Clone)]
pub struct RetrievalQuery {
    pub text: String,
    pub max_results: Option<usize>,
    pub min_similarity: Option<f32>,
    pub filter: MetadataFilter,
    /// 호출자 데드라인 (초과 시 `Timeout`)
    pub deadline: Option<Duration>,
}

impl RetrievalQuery {
    pub fn new(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            max_results: None,
            min_similarity: None,
            filter: MetadataFilter::default(),
            deadline: None,
        }
    }

    pub fn max_results(mut self, n: usize) -> Self {
        self.max_results = Some(n);
        self
    }

    pub fn min_similarity(mut self, threshold: f32) -> Self {
        self.min_similarity = Some(threshold);
        self
    }

    pub fn tags<I, S>(mut self, tags: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        self.filter.tags = normalize_tags(tags);
        self
    }

    pub fn source(mut self, source: CaseSource) -> Self {
        self.filter.source = Some(source);
        self
    }

    pub fn deadline(mut self, deadline: Duration) -> Self {
        self.deadline = Some(deadline);
        self
    }
}

/// 검색된 케이스
#[derive(Debug, Clone, Serialize)]
pub struct RetrievedCase {
    pub case_id: CaseId,
    /// 코사인 유사도 (-1.0 ~ 1.0)
    pub score: f32,
    pub raw_text: String,
    pub metadata: CaseMetadata,
    pub version: u64,
}

// ============================================================================
// RetrievalService
// ============================================================================

/// 유사 케이스 검색 서비스
///
/// 인덱스와 저장소에 대해 읽기 전용이므로 동시 호출이 자유롭습니다.
pub struct RetrievalService {
    embedder: Arc<dyn EmbeddingProvider>,
    index: Arc<dyn VectorIndex>,
    store: Arc<CaseStore>,
    config: RetrievalConfig,
}

impl RetrievalService {
    /// 서비스 생성 (프로바이더와 인덱스 스키마가 같아야 함)
    pub fn new(
        embedder: Arc<dyn EmbeddingProvider>,
        index: Arc<dyn VectorIndex>,
        store: Arc<CaseStore>,
        config: RetrievalConfig,
    ) -> Result<Self> {
        let provider_schema = IndexSchema::for_provider(embedder.as_ref());
        let index_schema = index.schema();
        if provider_schema.dimension != index_schema.dimension {
            return Err(RagError::DimensionMismatch {
                expected: index_schema.dimension,
                actual: provider_schema.dimension,
            });
        }
        if provider_schema.model_id != index_schema.model_id {
            return Err(RagError::invalid(format!(
                "embedder model {} does not match index model {}",
                provider_schema.model_id, index_schema.model_id
            )));
        }

        Ok(Self {
            embedder,
            index,
            store,
            config,
        })
    }

    pub fn config(&self) -> &RetrievalConfig {
        &self.config
    }

    /// 유사 케이스 검색
    ///
    /// # Arguments
    /// * `query_text` - 자유 텍스트 임상 쿼리
    /// * `max_results` - 최대 결과 수 (기본 3)
    /// * `min_similarity` - 최소 코사인 유사도 (기본 0.2)
    pub async fn retrieve(
        &self,
        query_text: &str,
        max_results: Option<usize>,
        min_similarity: Option<f32>,
    ) -> Result<Vec<RetrievedCase>> {
        let mut query = RetrievalQuery::new(query_text);
        query.max_results = max_results;
        query.min_similarity = min_similarity;
        self.search(&query).await
    }

    /// 쿼리 객체로 검색 (데드라인 적용)
    ///
    /// 데드라인을 넘기면 부분 결과 대신 `Timeout`을 반환합니다.
    /// 읽기 전용이므로 중간에 버려져도 인덱스는 손상되지 않습니다.
    pub async fn search(&self, query: &RetrievalQuery) -> Result<Vec<RetrievedCase>> {
        match query.deadline {
            Some(deadline) => tokio::time::timeout(deadline, self.search_inner(query))
                .await
                .map_err(|_| RagError::Timeout(deadline))?,
            None => self.search_inner(query).await,
        }
    }

    async fn search_inner(&self, query: &RetrievalQuery) -> Result<Vec<RetrievedCase>> {
        // 1. 입력 검증 (인덱스 접근 전)
        if query.text.trim().is_empty() {
            return Err(RagError::invalid("query text must not be empty"));
        }
        let max_results = query.max_results.unwrap_or(self.config.max_results);
        let min_similarity = query.min_similarity.unwrap_or(self.config.min_similarity);
        if min_similarity.is_nan() {
            return Err(RagError::invalid("min_similarity must be a number"));
        }
        if max_results == 0 {
            return Ok(vec![]);
        }

        // 2. 쿼리 임베딩 (실패 시 즉시 반환)
        let query_vector = self.embedder.embed(&query.text).await?;

        // 3. 오버페치
        let top_n = max_results.saturating_mul(self.config.overfetch_factor.max(1));
        let candidates = self.index.query(&query_vector, top_n).await?;

        // 4. 임계값 필터 (인덱스 순서 유지)
        let candidates: Vec<ScoredCase> = candidates
            .into_iter()
            .filter(|c| c.score >= min_similarity)
            .collect();

        // 5~6. 하이드레이션하면서 max_results까지 채움
        let results = self.hydrate(candidates, max_results, &query.filter)?;

        tracing::debug!(
            "Retrieved {} case(s) for query ({} chars, k={}, t={:.3})",
            results.len(),
            query.text.chars().count(),
            max_results,
            min_similarity
        );
        Ok(results)
    }

    /// 저장소에서 케이스 로드
    ///
    /// - 저장소에 없음 (drift): 제외 + 경고
    /// - version 불일치/미인덱싱/다른 모델: 제외 (오래된 벡터의 점수)
    /// - 메타데이터 필터 불일치: 제외
    fn hydrate(
        &self,
        candidates: Vec<ScoredCase>,
        max_results: usize,
        filter: &MetadataFilter,
    ) -> Result<Vec<RetrievedCase>> {
        let model_id = self.embedder.model_id();
        let mut results = Vec::with_capacity(max_results.min(candidates.len()));

        for candidate in candidates {
            if results.len() >= max_results {
                break;
            }

            let record = match self.store.find(&candidate.case_id)? {
                Some(record) => record,
                None => {
                    tracing::warn!(
                        "Index/store drift: {} is indexed but missing from the case store",
                        candidate.case_id
                    );
                    continue;
                }
            };

            if record.version != candidate.version
                || record.state != CaseState::Indexed
                || record.embedding_model.as_deref() != Some(model_id)
            {
                tracing::warn!(
                    "Skipping stale index entry {} (index v{}, store v{} {})",
                    candidate.case_id,
                    candidate.version,
                    record.version,
                    record.state
                );
                continue;
            }

            if !filter.matches(&record.metadata) {
                continue;
            }

            results.push(RetrievedCase {
                case_id: record.case_id,
                score: candidate.score,
                raw_text: record.raw_text,
                metadata: record.metadata,
                version: record.version,
            });
        }

        Ok(results)
    }
}

// ============================================================================
// Tests
// ============================================================================
