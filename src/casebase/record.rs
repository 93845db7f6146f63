//! 케이스 레코드 - 임상 케이스 데이터 모델

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{RagError, Result};

// ============================================================================
// CaseId
// ============================================================================

/// 안정적인 케이스 식별자 (생성 후 불변)
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CaseId(String);

impl CaseId {
    /// 식별자 생성 (앞뒤 공백 제거, 빈 값 거부)
    pub fn new(id: impl Into<String>) -> Result<Self> {
        let id = id.into();
        let trimmed = id.trim();
        if trimmed.is_empty() {
            return Err(RagError::invalid("case_id must not be empty"));
        }
        if trimmed.chars().any(char::is_control) {
            return Err(RagError::invalid("case_id must not contain control characters"));
        }
        Ok(Self(trimmed.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for CaseId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for CaseId {
    type Err = RagError;

    fn from_str(s: &str) -> Result<Self> {
        Self::new(s)
    }
}

// ============================================================================
// Metadata
// ============================================================================

/// 케이스 유입 경로 (필터 가능)
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CaseSource {
    /// 직접 작성된 케이스
    #[default]
    Authored,
    /// 치료 JSON 파일에서 가져온 케이스
    Imported,
}

/// 케이스 메타데이터
///
/// 유사도 계산에는 사용되지 않습니다. `source`와 `tags`만 검색 필터로
/// 쓸 수 있고 나머지는 설명용 필드입니다.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CaseMetadata {
    /// 유입 경로 (필터 가능)
    #[serde(default)]
    pub source: CaseSource,
    /// 임상 태그, 정렬/중복 제거됨 (필터 가능)
    #[serde(default)]
    pub tags: Vec<String>,
    /// 원본 파일 이름
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_file: Option<String>,
    /// 상담 요약
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub consultation: Option<String>,
    /// 치료 예약 횟수
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub treatments_count: Option<u32>,
    /// 원본 파일 SHA-256 (변경 감지용)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content_hash: Option<String>,
}

impl CaseMetadata {
    /// 태그 설정 (소문자, 공백 제거, 정렬, 중복 제거)
    pub fn with_tags<I, S>(mut self, tags: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        self.tags = normalize_tags(tags);
        self
    }

    pub fn with_consultation(mut self, consultation: impl Into<String>) -> Self {
        self.consultation = Some(consultation.into());
        self
    }
}

pub(crate) fn normalize_tags<I, S>(tags: I) -> Vec<String>
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    let mut out: Vec<String> = tags
        .into_iter()
        .map(|t| t.as_ref().trim().to_lowercase())
        .filter(|t| !t.is_empty())
        .collect();
    out.sort();
    out.dedup();
    out
}

// ============================================================================
// State
// ============================================================================

/// 케이스 인덱싱 상태
///
/// `NEW → EMBEDDING → INDEXED → (STALE → EMBEDDING → INDEXED)*`.
/// 삭제된 케이스는 저장소에서 사라지며 별도 상태를 갖지 않습니다.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CaseState {
    New,
    Embedding,
    Indexed,
    Stale,
}

impl CaseState {
    pub fn as_str(&self) -> &'static str {
        match self {
            CaseState::New => "new",
            CaseState::Embedding => "embedding",
            CaseState::Indexed => "indexed",
            CaseState::Stale => "stale",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "new" => Some(CaseState::New),
            "embedding" => Some(CaseState::Embedding),
            "indexed" => Some(CaseState::Indexed),
            "stale" => Some(CaseState::Stale),
            _ => None,
        }
    }
}

impl fmt::Display for CaseState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ============================================================================
// Records
// ============================================================================

/// 저장된 케이스 레코드
#[derive(Debug, Clone, Serialize)]
pub struct CaseRecord {
    pub case_id: CaseId,
    pub raw_text: String,
    pub metadata: CaseMetadata,
    /// `raw_text`에서만 파생되는 임베딩 (텍스트 변경 시 제거됨)
    #[serde(skip)]
    pub embedding: Option<Vec<f32>>,
    /// 임베딩을 만든 모델 식별자
    pub embedding_model: Option<String>,
    /// `raw_text` 또는 임베딩 변경 시 증가
    pub version: u64,
    pub state: CaseState,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl CaseRecord {
    /// 현재 모델/차원 기준으로 유효한 임베딩을 가지고 있는지
    pub fn has_current_embedding(&self, model_id: &str, dimension: usize) -> bool {
        self.state == CaseState::Indexed
            && self.embedding_model.as_deref() == Some(model_id)
            && self
                .embedding
                .as_ref()
                .map(|e| e.len() == dimension)
                .unwrap_or(false)
    }
}

/// 새 케이스 입력 (작성/수정 공용)
#[derive(Debug, Clone)]
pub struct NewCase {
    pub case_id: CaseId,
    pub raw_text: String,
    pub metadata: CaseMetadata,
}

impl NewCase {
    pub fn new(case_id: CaseId, raw_text: impl Into<String>) -> Self {
        Self {
            case_id,
            raw_text: raw_text.into(),
            metadata: CaseMetadata::default(),
        }
    }

    pub fn with_metadata(mut self, metadata: CaseMetadata) -> Self {
        self.metadata = metadata;
        self
    }
}

// ============================================================================
// Tests
// ============================================================================
