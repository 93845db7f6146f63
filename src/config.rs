//! 설정 모듈 - 환경변수 + CLI 플래그 기반 런타임 설정
//!
//! 우선순위: CLI 플래그 > `DENTAL_RAG_*` 환경변수 > 기본값

use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use serde::Serialize;

use crate::error::{RagError, Result};

/// 기본 결과 개수
pub const DEFAULT_MAX_RESULTS: usize = 3;
/// 기본 최소 유사도 (코사인, -1.0 ~ 1.0)
pub const DEFAULT_MIN_SIMILARITY: f32 = 0.2;
/// 후처리 필터링을 위한 오버페치 배수
pub const DEFAULT_OVERFETCH_FACTOR: usize = 3;

// ============================================================================
// Data Directory
// ============================================================================

/// 데이터 디렉토리 경로 (~/.dental-case-rag/)
pub fn get_data_dir() -> PathBuf {
    dirs::data_local_dir()
        .or_else(dirs::home_dir)
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".dental-case-rag")
}

// ============================================================================
// Backends
// ============================================================================

/// 임베딩 백엔드 종류
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum EmbedderKind {
    /// 로컬 해싱 임베딩 (오프라인, 결정적)
    Hashing,
    /// Gemini API 임베딩
    Gemini,
}

impl EmbedderKind {
    /// 임베더별 기본 차원 (Gemini는 MRL 지원 차원만 허용)
    pub fn default_dimension(&self) -> usize {
        match self {
            EmbedderKind::Hashing => crate::embedding::DEFAULT_DIMENSION,
            EmbedderKind::Gemini => crate::embedding::GEMINI_DIMENSIONS[0],
        }
    }
}

impl FromStr for EmbedderKind {
    type Err = RagError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_lowercase().as_str() {
            "hashing" | "local" => Ok(EmbedderKind::Hashing),
            "gemini" => Ok(EmbedderKind::Gemini),
            other => Err(RagError::invalid(format!("unknown embedder: {other}"))),
        }
    }
}

/// 벡터 인덱스 백엔드 종류
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum IndexBackend {
    /// 메모리 인덱스 (시작 시 케이스 저장소에서 로드)
    Memory,
    /// LanceDB 온디스크 인덱스
    Lance,
}

impl FromStr for IndexBackend {
    type Err = RagError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_lowercase().as_str() {
            "memory" | "mem" => Ok(IndexBackend::Memory),
            "lance" | "lancedb" => Ok(IndexBackend::Lance),
            other => Err(RagError::invalid(format!("unknown index backend: {other}"))),
        }
    }
}

// ============================================================================
// Retry Policy
// ============================================================================

/// 쓰기 경로 재시도 정책 (지수 백오프)
#[derive(Debug, Clone, Serialize)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 4,
            initial_backoff: Duration::from_millis(500),
            max_backoff: Duration::from_secs(8),
        }
    }
}

impl RetryPolicy {
    /// 테스트용 즉시 재시도 정책
    pub fn immediate(max_attempts: u32) -> Self {
        Self {
            max_attempts,
            initial_backoff: Duration::ZERO,
            max_backoff: Duration::ZERO,
        }
    }

    /// attempt(0-based) 이후 대기 시간
    pub fn backoff(&self, attempt: u32) -> Duration {
        let factor = 2u32.saturating_pow(attempt);
        self.initial_backoff
            .saturating_mul(factor)
            .min(self.max_backoff)
    }
}

// ============================================================================
// Retrieval Config
// ============================================================================

/// 검색 기본값
#[derive(Debug, Clone, Serialize)]
pub struct RetrievalConfig {
    pub max_results: usize,
    pub min_similarity: f32,
    pub overfetch_factor: usize,
}

impl Default for RetrievalConfig {
    fn default() -> Self {
        Self {
            max_results: DEFAULT_MAX_RESULTS,
            min_similarity: DEFAULT_MIN_SIMILARITY,
            overfetch_factor: DEFAULT_OVERFETCH_FACTOR,
        }
    }
}

// ============================================================================
// RagConfig
// ============================================================================

/// 런타임 전체 설정
#[derive(Debug, Clone, Serialize)]
pub struct RagConfig {
    pub data_dir: PathBuf,
    pub embedder: EmbedderKind,
    /// 임베딩 차원 (None이면 임베더 기본값)
    pub dimension: Option<usize>,
    pub index: IndexBackend,
    pub retrieval: RetrievalConfig,
    pub retry: RetryPolicy,
}

impl Default for RagConfig {
    fn default() -> Self {
        Self {
            data_dir: get_data_dir(),
            embedder: EmbedderKind::Hashing,
            dimension: None,
            index: IndexBackend::Memory,
            retrieval: RetrievalConfig::default(),
            retry: RetryPolicy::default(),
        }
    }
}

impl RagConfig {
    /// 지정 디렉토리를 사용하는 기본 설정
    pub fn with_data_dir(data_dir: impl Into<PathBuf>) -> Self {
        Self {
            data_dir: data_dir.into(),
            ..Default::default()
        }
    }

    /// `DENTAL_RAG_*` 환경변수에서 설정 로드
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// 키 조회 함수로 설정 로드 (빈 값은 미설정으로 취급)
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());
        let mut config = Self::default();

        if let Some(dir) = get("DENTAL_RAG_DATA_DIR") {
            config.data_dir = PathBuf::from(dir);
        }
        if let Some(kind) = get("DENTAL_RAG_EMBEDDER") {
            config.embedder = kind.parse()?;
        }
        if let Some(dim) = get("DENTAL_RAG_DIMENSION") {
            config.dimension = Some(parse_number("DENTAL_RAG_DIMENSION", &dim)?);
        }
        if let Some(backend) = get("DENTAL_RAG_INDEX") {
            config.index = backend.parse()?;
        }
        if let Some(n) = get("DENTAL_RAG_MAX_RESULTS") {
            config.retrieval.max_results = parse_number("DENTAL_RAG_MAX_RESULTS", &n)?;
        }
        if let Some(t) = get("DENTAL_RAG_MIN_SIMILARITY") {
            config.retrieval.min_similarity = parse_number("DENTAL_RAG_MIN_SIMILARITY", &t)?;
        }
        if let Some(f) = get("DENTAL_RAG_OVERFETCH") {
            config.retrieval.overfetch_factor = parse_number("DENTAL_RAG_OVERFETCH", &f)?;
        }

        config.validate()?;
        Ok(config)
    }

    /// 값 범위 검증
    pub fn validate(&self) -> Result<()> {
        if self.dimension == Some(0) {
            return Err(RagError::invalid("dimension must be positive"));
        }
        if self.retrieval.max_results == 0 {
            return Err(RagError::invalid("max_results must be at least 1"));
        }
        if self.retrieval.overfetch_factor == 0 {
            return Err(RagError::invalid("overfetch factor must be at least 1"));
        }
        if !(-1.0..=1.0).contains(&self.retrieval.min_similarity) {
            return Err(RagError::invalid(format!(
                "min_similarity {} outside [-1, 1]",
                self.retrieval.min_similarity
            )));
        }
        Ok(())
    }

    /// 실제 사용할 임베딩 차원
    pub fn embedding_dimension(&self) -> usize {
        self.dimension
            .unwrap_or_else(|| self.embedder.default_dimension())
    }

    /// SQLite 케이스 DB 경로
    pub fn store_path(&self) -> PathBuf {
        self.data_dir.join("cases.db")
    }

    /// LanceDB 인덱스 경로
    pub fn lance_path(&self) -> PathBuf {
        self.data_dir.join("cases.lance")
    }
}

fn parse_number<T: FromStr>(key: &str, raw: &str) -> Result<T> {
    raw.trim()
        .parse()
        .map_err(|_| RagError::invalid(format!("{key}: cannot parse '{raw}'")))
}

// ============================================================================
// Tests
// ============================================================================
