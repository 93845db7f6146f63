//! 런타임 - 저장소/인덱스/임베더를 묶는 명시적 핸들
//!
//! 전역 싱글턴 대신 `CaseBase::open`으로 만든 핸들을 호출자가 소유합니다.

use std::sync::Arc;

use serde::Serialize;

use super::context::ContextAssembler;
use super::import::CaseImporter;
use super::index::{IndexSchema, MemoryIndex, VectorIndex};
use super::indexer::Indexer;
use super::lance::LanceVectorIndex;
use super::retrieval::RetrievalService;
use super::store::{CaseStore, StoreStats};
use crate::config::{IndexBackend, RagConfig};
use crate::embedding::{create_embedder, EmbeddingProvider};
use crate::error::Result;

/// 런타임 통계
#[derive(Debug, Clone, Serialize)]
pub struct CaseBaseStats {
    pub store: StoreStats,
    pub index_backend: String,
    pub index_size: usize,
    pub embedder: String,
    pub schema: IndexSchema,
    pub pending_removals: usize,
}

/// 케이스 베이스 런타임 핸들
pub struct CaseBase {
    config: RagConfig,
    store: Arc<CaseStore>,
    index: Arc<dyn VectorIndex>,
    embedder: Arc<dyn EmbeddingProvider>,
    retrieval: Arc<RetrievalService>,
    indexer: Arc<Indexer>,
    assembler: ContextAssembler,
}

impl CaseBase {
    /// 설정으로 런타임 열기 (데이터 디렉토리 생성, 임베더 생성)
    pub async fn open(config: RagConfig) -> Result<Self> {
        config.validate()?;
        let embedder = create_embedder(&config)?;
        Self::open_with_embedder(config, embedder).await
    }

    /// 임베더를 직접 지정하여 열기
    pub async fn open_with_embedder(
        config: RagConfig,
        embedder: Arc<dyn EmbeddingProvider>,
    ) -> Result<Self> {
        config.validate()?;
        std::fs::create_dir_all(&config.data_dir)?;

        let store = Arc::new(CaseStore::open(&config.store_path())?);
        let schema = IndexSchema::for_provider(embedder.as_ref());

        let index: Arc<dyn VectorIndex> = match config.index {
            IndexBackend::Memory => {
                let index = MemoryIndex::new(schema);
                warm_load(&store, &index).await?;
                Arc::new(index)
            }
            IndexBackend::Lance => {
                Arc::new(LanceVectorIndex::open(&config.lance_path(), schema).await?)
            }
        };

        let retrieval = Arc::new(RetrievalService::new(
            embedder.clone(),
            index.clone(),
            store.clone(),
            config.retrieval.clone(),
        )?);
        let indexer = Arc::new(Indexer::new(
            store.clone(),
            index.clone(),
            embedder.clone(),
            config.retry.clone(),
        )?);
        if config.index == IndexBackend::Lance {
            // 이전 실행에서 인덱스 제거를 끝내지 못한 삭제 케이스 정리
            let removed = indexer.remove_orphans().await?;
            if removed > 0 {
                tracing::info!("Removed {} orphan lance entries on open", removed);
            }
        }

        tracing::info!(
            "Case base ready at {:?} ({} index, {})",
            config.data_dir,
            index.name(),
            embedder.model_id()
        );

        Ok(Self {
            config,
            store,
            index,
            embedder,
            retrieval,
            indexer,
            assembler: ContextAssembler::default(),
        })
    }

    pub fn config(&self) -> &RagConfig {
        &self.config
    }

    pub fn store(&self) -> Arc<CaseStore> {
        self.store.clone()
    }

    pub fn index(&self) -> Arc<dyn VectorIndex> {
        self.index.clone()
    }

    pub fn embedder(&self) -> Arc<dyn EmbeddingProvider> {
        self.embedder.clone()
    }

    pub fn retrieval(&self) -> Arc<RetrievalService> {
        self.retrieval.clone()
    }

    pub fn indexer(&self) -> Arc<Indexer> {
        self.indexer.clone()
    }

    pub fn assembler(&self) -> &ContextAssembler {
        &self.assembler
    }

    /// 치료 케이스 가져오기 도구
    pub fn importer(&self) -> CaseImporter {
        CaseImporter::new(self.store.clone(), self.indexer.clone())
    }

    /// 런타임 통계
    pub async fn stats(&self) -> Result<CaseBaseStats> {
        Ok(CaseBaseStats {
            store: self.store.stats()?,
            index_backend: self.index.name().to_string(),
            index_size: self.index.size().await?,
            embedder: self.embedder.name().to_string(),
            schema: self.index.schema().clone(),
            pending_removals: self.indexer.pending_removals().len(),
        })
    }

    /// 종료 (대기 중인 인덱스 제거 처리)
    pub async fn shutdown(self) -> Result<()> {
        self.indexer.drain_pending_removals().await?;
        let left = self.indexer.pending_removals().len();
        if left > 0 {
            tracing::warn!(
                "{} index removal(s) still pending; run `rebuild` to clean up",
                left
            );
        }
        tracing::info!("Case base at {:?} closed", self.config.data_dir);
        Ok(())
    }
}

/// 저장소의 유효한 임베딩으로 메모리 인덱스 채우기
async fn warm_load(store: &CaseStore, index: &MemoryIndex) -> Result<usize> {
    let schema = index.schema().clone();
    let mut loaded = 0;
    let mut pending = 0;

    for record in store.list_all()? {
        match record.embedding.as_deref() {
            Some(vector) if record.has_current_embedding(&schema.model_id, schema.dimension) => {
                index.upsert(&record.case_id, record.version, vector).await?;
                loaded += 1;
            }
            _ => pending += 1,
        }
    }

    tracing::info!("Loaded {} vector(s) into memory index", loaded);
    if pending > 0 {
        tracing::warn!(
            "{} case(s) have no embedding for {}; run `rebuild` to index them",
            pending,
            schema.model_id
        );
    }
    Ok(loaded)
}

// ============================================================================
// Tests
// ============================================================================
