//! Vector Index - 벡터 인덱스 트레이트 및 인메모리 구현
//!
//! 점수 규약: 코사인 유사도 (-1.0 ~ 1.0), 높을수록 유사.
//! 정렬: 점수 내림차순, 동점은 case_id 오름차순.
//! 인덱스는 벡터를 정규화하지 않습니다 (프로바이더 책임).

use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::sync::{Arc, RwLock};

use async_trait::async_trait;
use serde::Serialize;

use super::record::CaseId;
use crate::embedding::EmbeddingProvider;
use crate::error::{RagError, Result};

// ============================================================================
// Types
// ============================================================================

/// 인덱스 스키마 - 임베딩 모델 식별자 + 차원
///
/// 다른 모델이 만든 벡터는 랭킹에 참여할 수 없습니다.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct IndexSchema {
    pub model_id: String,
    pub dimension: usize,
}

impl IndexSchema {
    pub fn new(model_id: impl Into<String>, dimension: usize) -> Self {
        Self {
            model_id: model_id.into(),
            dimension,
        }
    }

    /// 프로바이더에서 스키마 생성
    pub fn for_provider(provider: &dyn EmbeddingProvider) -> Self {
        Self::new(provider.model_id(), provider.dimension())
    }

    /// 벡터 검증 (차원, 유한값). 자르기/패딩은 하지 않습니다.
    pub fn check_vector(&self, vector: &[f32]) -> Result<()> {
        if vector.len() != self.dimension {
            return Err(RagError::DimensionMismatch {
                expected: self.dimension,
                actual: vector.len(),
            });
        }
        if vector.iter().any(|v| !v.is_finite()) {
            return Err(RagError::invalid("vector contains NaN or infinite values"));
        }
        Ok(())
    }
}

/// 검색 결과 (인덱스 단위)
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ScoredCase {
    pub case_id: CaseId,
    /// 인덱싱 당시 케이스 version
    pub version: u64,
    /// 코사인 유사도
    pub score: f32,
}

// ============================================================================
// VectorIndex Trait
// ============================================================================

/// VectorIndex 트레이트 (async)
///
/// `upsert`/`remove`는 `query`와 동시에 호출될 수 있어야 합니다.
/// 동시 쿼리는 엔트리의 이전 또는 새 벡터 중 하나를 보며, 찢어진 벡터는 보지 않습니다.
#[async_trait]
pub trait VectorIndex: Send + Sync {
    /// 인덱스 스키마
    fn schema(&self) -> &IndexSchema;

    /// 벡터 삽입 또는 교체 (멱등)
    async fn upsert(&self, case_id: &CaseId, version: u64, vector: &[f32]) -> Result<()>;

    /// 벡터 삭제 (없으면 no-op, false 반환)
    async fn remove(&self, case_id: &CaseId) -> Result<bool>;

    /// top-k 검색 (빈 인덱스는 빈 결과)
    async fn query(&self, vector: &[f32], k: usize) -> Result<Vec<ScoredCase>>;

    /// 엔트리 개수
    async fn size(&self) -> Result<usize>;

    /// 인덱싱된 모든 case_id (오름차순)
    async fn case_ids(&self) -> Result<Vec<CaseId>>;

    /// 전체 삭제 (전체 리빌드용)
    async fn clear(&self) -> Result<()>;

    /// 저장된 엔트리가 현재 스키마로 쓰여졌는지 (아니면 리빌드 전에 비워야 함)
    async fn matches_schema(&self) -> Result<bool> {
        Ok(true)
    }

    /// 백엔드 이름
    fn name(&self) -> &str;
}

/// 점수 내림차순 + case_id 오름차순 정렬 후 k개로 자르기
pub(crate) fn rank(mut hits: Vec<ScoredCase>, k: usize) -> Vec<ScoredCase> {
    hits.sort_by(compare_hits);
    hits.truncate(k);
    hits
}

fn compare_hits(a: &ScoredCase, b: &ScoredCase) -> Ordering {
    b.score
        .total_cmp(&a.score)
        .then_with(|| a.case_id.cmp(&b.case_id))
}

// ============================================================================
// MemoryIndex
// ============================================================================

#[derive(Debug)]
struct IndexEntry {
    version: u64,
    vector: Vec<f32>,
    norm: f32,
}

/// 인메모리 벡터 인덱스 (정확한 코사인 검색)
///
/// 엔트리는 `Arc`로 통째 교체되므로 쿼리는 항상 완전한 벡터를 봅니다.
/// 영속성은 케이스 저장소가 담당하며 시작 시 저장소에서 다시 로드합니다.
#[derive(Debug)]
pub struct MemoryIndex {
    schema: IndexSchema,
    entries: RwLock<BTreeMap<CaseId, Arc<IndexEntry>>>,
}

impl MemoryIndex {
    pub fn new(schema: IndexSchema) -> Self {
        Self {
            schema,
            entries: RwLock::new(BTreeMap::new()),
        }
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, BTreeMap<CaseId, Arc<IndexEntry>>> {
        self.entries.read().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn write(&self) -> std::sync::RwLockWriteGuard<'_, BTreeMap<CaseId, Arc<IndexEntry>>> {
        self.entries.write().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// 특정 케이스의 인덱싱된 version
    pub fn version_of(&self, case_id: &CaseId) -> Option<u64> {
        self.read().get(case_id).map(|e| e.version)
    }
}

#[async_trait]
impl VectorIndex for MemoryIndex {
    fn schema(&self) -> &IndexSchema {
        &self.schema
    }

    async fn upsert(&self, case_id: &CaseId, version: u64, vector: &[f32]) -> Result<()> {
        self.schema.check_vector(vector)?;

        let norm = vector.iter().map(|x| x * x).sum::<f32>().sqrt();
        let entry = Arc::new(IndexEntry {
            version,
            vector: vector.to_vec(),
            norm,
        });

        self.write().insert(case_id.clone(), entry);
        Ok(())
    }

    async fn remove(&self, case_id: &CaseId) -> Result<bool> {
        Ok(self.write().remove(case_id).is_some())
    }

    async fn query(&self, vector: &[f32], k: usize) -> Result<Vec<ScoredCase>> {
        self.schema.check_vector(vector)?;
        if k == 0 {
            return Ok(vec![]);
        }

        let query_norm = vector.iter().map(|x| x * x).sum::<f32>().sqrt();

        // 스냅샷만 잡고 락을 풀어 upsert를 막지 않음
        let snapshot: Vec<(CaseId, Arc<IndexEntry>)> = self
            .read()
            .iter()
            .map(|(id, entry)| (id.clone(), Arc::clone(entry)))
            .collect();

        let hits = snapshot
            .into_iter()
            .map(|(case_id, entry)| {
                let score = if query_norm == 0.0 || entry.norm == 0.0 {
                    0.0
                } else {
                    let dot: f32 = vector
                        .iter()
                        .zip(entry.vector.iter())
                        .map(|(a, b)| a * b)
                        .sum();
                    (dot / (query_norm * entry.norm)).clamp(-1.0, 1.0)
                };
                ScoredCase {
                    case_id,
                    version: entry.version,
                    score,
                }
            })
            .collect();

        Ok(rank(hits, k))
    }

    async fn size(&self) -> Result<usize> {
        Ok(self.read().len())
    }

    async fn case_ids(&self) -> Result<Vec<CaseId>> {
        Ok(self.read().keys().cloned().collect())
    }

    async fn clear(&self) -> Result<()> {
        self.write().clear();
        Ok(())
    }

    fn name(&self) -> &str {
        "memory"
    }
}

// ============================================================================
// Tests
// ============================================================================
