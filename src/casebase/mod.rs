//! 케이스 베이스 모듈
//!
//! 임상 케이스 저장소(rusqlite)와 벡터 인덱스(메모리/LanceDB)를 관리하고
//! 유사 케이스 검색과 컨텍스트 조립을 제공합니다.

pub mod context;
pub mod import;
pub mod index;
pub mod indexer;
pub mod lance;
pub mod record;
pub mod retrieval;
pub mod runtime;
pub mod store;

pub use context::{AssembledContext, CaseReference, ContextAssembler};
pub use import::{CaseImporter, ImportReport};
pub use index::{IndexSchema, MemoryIndex, ScoredCase, VectorIndex};
pub use indexer::{Indexer, RebuildReport, ReconcileOutcome};
pub use lance::LanceVectorIndex;
pub use record::{CaseId, CaseMetadata, CaseRecord, CaseSource, CaseState, NewCase};
pub use retrieval::{MetadataFilter, RetrievalQuery, RetrievalService, RetrievedCase};
pub use runtime::{CaseBase, CaseBaseStats};
pub use store::{CaseStore, StoreStats};
