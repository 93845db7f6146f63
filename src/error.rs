//! 에러 타입 - RAG 코어 공통 에러 분류
//!
//! 쓰기 경로(인덱싱)는 재시도 후 로그, 읽기 경로(검색)는 즉시 실패가 원칙입니다.

use std::time::Duration;

use crate::casebase::CaseId;

/// RAG 코어 결과 타입
pub type Result<T, E = RagError> = std::result::Result<T, E>;

/// RAG 코어 에러
#[derive(Debug, thiserror::Error)]
pub enum RagError {
    /// 빈 쿼리/텍스트 등 호출자 오류 (재시도 안 함)
    #[error("invalid input: {0}")]
    InvalidInput(String),

    /// 벡터 차원 불일치 (모델 변경 후 전체 리빌드 필요)
    #[error("dimension mismatch: expected {expected}, got {actual}")]
    DimensionMismatch { expected: usize, actual: usize },

    /// 케이스 없음
    #[error("case not found: {0}")]
    NotFound(CaseId),

    /// 임베딩 백엔드 장애
    #[error("embedding provider unavailable: {0}")]
    ProviderUnavailable(String),

    /// 벡터 인덱스 구조 손상 (rebuild --clear 권장)
    #[error("vector index corruption: {0}")]
    IndexCorruption(String),

    /// 호출자 데드라인 초과
    #[error("retrieval timed out after {0:?}")]
    Timeout(Duration),

    /// 리빌드가 이미 진행 중
    #[error("a full rebuild is already in progress")]
    RebuildInProgress,

    /// 임베딩 도중 케이스 텍스트가 변경됨
    #[error("case {case_id} changed during embedding (expected version {expected})")]
    VersionConflict { case_id: CaseId, expected: u64 },

    #[error(transparent)]
    Storage(#[from] rusqlite::Error),

    #[error(transparent)]
    Serialization(#[from] serde_json::Error),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl RagError {
    /// 백오프 후 재시도할 가치가 있는 에러인지
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            RagError::ProviderUnavailable(_) | RagError::VersionConflict { .. }
        )
    }

    pub(crate) fn invalid(message: impl Into<String>) -> Self {
        RagError::InvalidInput(message.into())
    }

    pub(crate) fn corruption(message: impl std::fmt::Display) -> Self {
        RagError::IndexCorruption(message.to_string())
    }
}
