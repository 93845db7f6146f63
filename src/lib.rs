//! dental-case-rag - 치과 임상 케이스 유사도 검색 RAG 코어
//!
//! 자유 텍스트 임상 쿼리에 대해 가장 유사한 과거 케이스를 찾아
//! LLM 프롬프트용 컨텍스트로 조립합니다.
//! 케이스 원본은 SQLite에, 벡터는 메모리 또는 LanceDB 인덱스에 저장됩니다.

pub mod casebase;
pub mod cli;
pub mod config;
pub mod embedding;
pub mod error;

// Re-exports
pub use casebase::{
    AssembledContext, CaseBase, CaseBaseStats, CaseId, CaseImporter, CaseMetadata, CaseRecord,
    CaseReference, CaseSource, CaseState, CaseStore, ContextAssembler, ImportReport, IndexSchema,
    Indexer, LanceVectorIndex, MemoryIndex, MetadataFilter, NewCase, RebuildReport,
    ReconcileOutcome, RetrievalQuery, RetrievalService, RetrievedCase, ScoredCase, StoreStats,
    VectorIndex,
};
pub use config::{get_data_dir, EmbedderKind, IndexBackend, RagConfig, RetrievalConfig, RetryPolicy};
pub use embedding::{
    cosine_similarity, get_api_key, has_api_key, EmbeddingProvider, GeminiEmbedding,
    HashingEmbedding,
};
pub use error::{RagError, Result};
