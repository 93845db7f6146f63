//! Indexer - 저장소 변경을 벡터 인덱스에 반영하는 쓰기 경로
//!
//! 같은 case_id에 대한 쓰기는 케이스별 async mutex로 직렬화되고
//! 서로 다른 케이스는 동시에 진행됩니다. 전체 리빌드는 배타적입니다.

use std::collections::{BTreeSet, HashMap};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Instant;

use serde::Serialize;
use tokio::sync::Mutex as AsyncMutex;

use super::index::{IndexSchema, VectorIndex};
use super::record::{CaseId, CaseRecord, NewCase};
use super::store::CaseStore;
use crate::config::RetryPolicy;
use crate::embedding::EmbeddingProvider;
use crate::error::{RagError, Result};

// ============================================================================
// Types
// ============================================================================

/// 단일 케이스 동기화 결과
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ReconcileOutcome {
    /// 인덱스에 반영됨 (`embedded`: 새로 임베딩했는지)
    Indexed { version: u64, embedded: bool },
    /// 저장소에 없어 인덱스에서 제거됨
    Removed,
}

/// 전체 리빌드 결과
#[derive(Debug, Clone, Default, Serialize)]
pub struct RebuildReport {
    /// 저장소 케이스 수
    pub total: usize,
    /// 새로 임베딩한 케이스 수
    pub embedded: usize,
    /// 인덱스에 반영한 케이스 수
    pub upserted: usize,
    /// 제거한 고아 엔트리 수
    pub orphans_removed: usize,
    pub failed: usize,
    /// 시작 전 인덱스를 비웠는지
    pub cleared: bool,
    pub elapsed_ms: u64,
}

// ============================================================================
// Indexer
// ============================================================================

pub struct Indexer {
    store: Arc<CaseStore>,
    index: Arc<dyn VectorIndex>,
    embedder: Arc<dyn EmbeddingProvider>,
    schema: IndexSchema,
    retry: RetryPolicy,
    case_locks: Mutex<HashMap<CaseId, Arc<AsyncMutex<()>>>>,
    rebuild_lock: AsyncMutex<()>,
    /// 인덱스 제거에 실패한 삭제 케이스 (다음 쓰기/리빌드에서 처리)
    pending_removals: Mutex<BTreeSet<CaseId>>,
}

impl Indexer {
    pub fn new(
        store: Arc<CaseStore>,
        index: Arc<dyn VectorIndex>,
        embedder: Arc<dyn EmbeddingProvider>,
        retry: RetryPolicy,
    ) -> Result<Self> {
        let schema = index.schema().clone();
        if embedder.dimension() != schema.dimension {
            return Err(RagError::DimensionMismatch {
                expected: schema.dimension,
                actual: embedder.dimension(),
            });
        }

        Ok(Self {
            store,
            index,
            embedder,
            schema,
            retry,
            case_locks: Mutex::new(HashMap::new()),
            rebuild_lock: AsyncMutex::new(()),
            pending_removals: Mutex::new(BTreeSet::new()),
        })
    }

    /// 케이스 작성/수정 (저장 + 인덱싱)
    ///
    /// 저장이 성공하면 임베딩/인덱싱 실패는 재시도 후 로그만 남기고
    /// 저장된 레코드를 반환합니다. 상태가 `Indexed`가 아니면 아직 검색되지 않습니다.
    pub async fn upsert_case(&self, case: NewCase) -> Result<CaseRecord> {
        self.drain_pending_removals().await?;

        let case_id = case.case_id.clone();
        let lock = self.case_lock(&case_id);
        let _guard = lock.lock_owned().await;

        self.store.put(case)?;
        if let Err(e) = self.reconcile_locked(&case_id).await {
            log_write_failure(&case_id, &e);
            self.discard_entry(&case_id).await;
        }

        self.store.get(&case_id)
    }

    /// 단일 케이스를 저장소 기준으로 인덱스에 반영
    pub async fn reconcile_one(&self, case_id: &CaseId) -> Result<ReconcileOutcome> {
        self.drain_pending_removals().await?;

        let lock = self.case_lock(case_id);
        let _guard = lock.lock_owned().await;
        let outcome = self.reconcile_locked(case_id).await;
        if outcome.is_err() {
            self.discard_entry(case_id).await;
        }
        outcome
    }

    /// 케이스 삭제 (저장소 → 인덱스)
    ///
    /// 인덱스 제거가 재시도 후에도 실패하면 대기 큐에 넣고 이후 쓰기에서 다시 시도합니다.
    pub async fn on_delete(&self, case_id: &CaseId) -> Result<bool> {
        self.drain_pending_removals().await?;

        let lock = self.case_lock(case_id);
        let _guard = lock.lock_owned().await;

        let existed = self.store.delete(case_id)?;
        if let Err(e) = self.remove_with_retry(case_id).await {
            tracing::warn!(
                "Index removal for {} failed, queued for later: {}",
                case_id,
                e
            );
            self.pending().insert(case_id.clone());
        }

        tracing::debug!("Deleted case {} (existed: {})", case_id, existed);
        Ok(existed)
    }

    /// 저장소 전체로 인덱스 재구성
    pub async fn rebuild_all(&self, clear: bool) -> Result<RebuildReport> {
        let _rebuild = self
            .rebuild_lock
            .try_lock()
            .map_err(|_| RagError::RebuildInProgress)?;
        let started = Instant::now();

        self.drain_pending_removals().await?;
        // 임베딩 모델/차원이 바뀐 인덱스는 덮어쓸 수 없으므로 비우고 시작
        let clear = if !clear && !self.index.matches_schema().await? {
            tracing::info!(
                "{} index was built for another embedding schema, clearing before rebuild",
                self.index.name()
            );
            true
        } else {
            clear
        };
        if clear {
            self.index.clear().await?;
            tracing::info!("Cleared {} index before rebuild", self.index.name());
        }

        let ids = self.store.list_ids()?;
        let mut report = RebuildReport {
            total: ids.len(),
            cleared: clear,
            ..Default::default()
        };

        for case_id in &ids {
            let lock = self.case_lock(case_id);
            let _guard = lock.lock_owned().await;

            match self.reconcile_locked(case_id).await {
                Ok(ReconcileOutcome::Indexed { embedded, .. }) => {
                    report.upserted += 1;
                    if embedded {
                        report.embedded += 1;
                    }
                }
                Ok(ReconcileOutcome::Removed) => {}
                Err(e) => {
                    log_write_failure(case_id, &e);
                    report.failed += 1;
                    self.discard_entry(case_id).await;
                }
            }
        }

        report.orphans_removed = self.remove_orphans().await?;

        report.elapsed_ms = started.elapsed().as_millis() as u64;
        tracing::info!(
            "Rebuild complete: {} case(s), {} embedded, {} upserted, {} orphan(s), {} failed ({} ms)",
            report.total,
            report.embedded,
            report.upserted,
            report.orphans_removed,
            report.failed,
            report.elapsed_ms
        );
        Ok(report)
    }

    /// 저장소에 없는 인덱스 엔트리 제거
    ///
    /// 재시작으로 대기 큐를 잃은 온디스크 인덱스도 이것으로 정리됩니다.
    pub async fn remove_orphans(&self) -> Result<usize> {
        let mut removed = 0;
        for case_id in self.index.case_ids().await? {
            let lock = self.case_lock(&case_id);
            let _guard = lock.lock_owned().await;

            if self.store.find(&case_id)?.is_none() && self.index.remove(&case_id).await? {
                tracing::debug!("Removed orphan index entry {}", case_id);
                removed += 1;
            }
        }
        self.pending().clear();
        Ok(removed)
    }

    /// 대기 중인 인덱스 제거 처리
    ///
    /// 그 사이 다시 저장된 케이스는 큐에서만 빠집니다.
    pub async fn drain_pending_removals(&self) -> Result<usize> {
        let queued: Vec<CaseId> = self.pending().iter().cloned().collect();
        if queued.is_empty() {
            return Ok(0);
        }

        let mut drained = 0;
        for case_id in queued {
            let lock = self.case_lock(&case_id);
            let _guard = lock.lock_owned().await;

            if self.store.find(&case_id)?.is_some() {
                self.pending().remove(&case_id);
                continue;
            }

            match self.index.remove(&case_id).await {
                Ok(_) => {
                    self.pending().remove(&case_id);
                    drained += 1;
                }
                Err(e) => tracing::warn!("Pending removal of {} still failing: {}", case_id, e),
            }
        }

        if drained > 0 {
            tracing::info!("Drained {} pending index removal(s)", drained);
        }
        Ok(drained)
    }

    /// 대기 큐에 남은 케이스 ID
    pub fn pending_removals(&self) -> Vec<CaseId> {
        self.pending().iter().cloned().collect()
    }

    // ========================================================================
    // Internals
    // ========================================================================

    /// 케이스 락을 잡은 상태에서 호출
    async fn reconcile_locked(&self, case_id: &CaseId) -> Result<ReconcileOutcome> {
        let model_id = self.embedder.model_id().to_string();
        let mut conflicts = 0;

        loop {
            let record = match self.store.find(case_id)? {
                Some(record) => record,
                None => {
                    self.index.remove(case_id).await?;
                    return Ok(ReconcileOutcome::Removed);
                }
            };

            // 유효한 임베딩이 있으면 재임베딩 없이 반영
            if record.has_current_embedding(&model_id, self.schema.dimension) {
                if let Some(vector) = record.embedding.as_deref() {
                    self.index.upsert(case_id, record.version, vector).await?;
                    return Ok(ReconcileOutcome::Indexed {
                        version: record.version,
                        embedded: false,
                    });
                }
            }

            self.store.mark_embedding(case_id, record.version)?;
            let vector = self.embed_with_retry(&record.raw_text).await?;
            self.schema.check_vector(&vector)?;

            match self
                .store
                .attach_embedding(case_id, record.version, &vector, &model_id)
            {
                Ok(updated) => {
                    self.index.upsert(case_id, updated.version, &vector).await?;
                    tracing::debug!("Indexed {} at version {}", case_id, updated.version);
                    return Ok(ReconcileOutcome::Indexed {
                        version: updated.version,
                        embedded: true,
                    });
                }
                Err(RagError::VersionConflict { expected, .. })
                    if conflicts + 1 < self.retry.max_attempts =>
                {
                    conflicts += 1;
                    tracing::warn!(
                        "Case {} changed while embedding version {}, retrying",
                        case_id,
                        expected
                    );
                }
                Err(RagError::NotFound(_)) => {
                    self.index.remove(case_id).await?;
                    return Ok(ReconcileOutcome::Removed);
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// `ProviderUnavailable`에 대해 지수 백오프로 재시도
    async fn embed_with_retry(&self, text: &str) -> Result<Vec<f32>> {
        let mut attempt = 0;
        loop {
            match self.embedder.embed(text).await {
                Ok(vector) => return Ok(vector),
                Err(e) if e.is_retryable() && attempt + 1 < self.retry.max_attempts => {
                    let delay = self.retry.backoff(attempt);
                    tracing::warn!(
                        "Embedding attempt {} failed ({}), retrying in {:?}",
                        attempt + 1,
                        e,
                        delay
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// 실패한 쓰기 뒤 인덱스에 남은 이전 벡터 제거 (케이스 락을 잡은 상태)
    async fn discard_entry(&self, case_id: &CaseId) {
        match self.index.remove(case_id).await {
            Ok(true) => tracing::debug!("Dropped outdated index entry {}", case_id),
            Ok(false) => {}
            // 남은 엔트리는 version 검사로 검색에서 걸러지고 다음 리빌드에서 정리됨
            Err(e) => tracing::warn!("Could not drop outdated entry {}: {}", case_id, e),
        }
    }

    async fn remove_with_retry(&self, case_id: &CaseId) -> Result<bool> {
        let mut attempt = 0;
        loop {
            match self.index.remove(case_id).await {
                Ok(removed) => return Ok(removed),
                Err(e) if attempt + 1 < self.retry.max_attempts => {
                    let delay = self.retry.backoff(attempt);
                    tracing::warn!("Index removal of {} failed ({}), retrying", case_id, e);
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// 케이스별 락 (사용 중이 아닌 락은 정리)
    fn case_lock(&self, case_id: &CaseId) -> Arc<AsyncMutex<()>> {
        let mut locks = self
            .case_locks
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        locks.retain(|_, lock| Arc::strong_count(lock) > 1);
        locks
            .entry(case_id.clone())
            .or_insert_with(|| Arc::new(AsyncMutex::new(())))
            .clone()
    }

    fn pending(&self) -> MutexGuard<'_, BTreeSet<CaseId>> {
        self.pending_removals
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

fn log_write_failure(case_id: &CaseId, error: &RagError) {
    match error {
        RagError::IndexCorruption(_) => tracing::warn!(
            "Index corrupted while writing {}: {} (run `rebuild --clear`)",
            case_id,
            error
        ),
        _ => tracing::warn!("Failed to index case {}: {}", case_id, error),
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::casebase::index::{MemoryIndex, ScoredCase};
    use crate::casebase::record::CaseState;
    use crate::embedding::HashingEmbedding;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    /// 처음 `failures`번 호출 또는 `fail_text`를 포함한 텍스트는 실패하는 임베더
    struct FlakyEmbedder {
        inner: HashingEmbedding,
        failures: usize,
        fail_text: Option<&'static str>,
        error: fn(String) -> RagError,
        calls: AtomicUsize,
    }

    impl FlakyEmbedder {
        fn new(failures: usize) -> Self {
            Self {
                inner: HashingEmbedding::new(64).unwrap(),
                failures,
                fail_text: None,
                error: RagError::ProviderUnavailable,
                calls: AtomicUsize::new(0),
            }
        }

        fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl EmbeddingProvider for FlakyEmbedder {
        async fn embed(&self, text: &str) -> Result<Vec<f32>> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst);
            let fails_text = self.fail_text.map_or(false, |t| text.contains(t));
            if call < self.failures || fails_text {
                return Err((self.error)("scripted outage".into()));
            }
            self.inner.embed(text).await
        }

        fn dimension(&self) -> usize {
            self.inner.dimension()
        }

        fn model_id(&self) -> &str {
            self.inner.model_id()
        }

        fn name(&self) -> &str {
            "flaky"
        }
    }

    /// remove를 실패시키거나 스키마 불일치를 흉내낼 수 있는 인덱스
    struct FlakyIndex {
        inner: MemoryIndex,
        fail_removes: AtomicBool,
        stale_schema: AtomicBool,
    }

    #[async_trait]
    impl VectorIndex for FlakyIndex {
        fn schema(&self) -> &IndexSchema {
            self.inner.schema()
        }

        async fn upsert(&self, case_id: &CaseId, version: u64, vector: &[f32]) -> Result<()> {
            self.inner.upsert(case_id, version, vector).await
        }

        async fn remove(&self, case_id: &CaseId) -> Result<bool> {
            if self.fail_removes.load(Ordering::SeqCst) {
                return Err(RagError::corruption("scripted remove failure"));
            }
            self.inner.remove(case_id).await
        }

        async fn query(&self, vector: &[f32], k: usize) -> Result<Vec<ScoredCase>> {
            self.inner.query(vector, k).await
        }

        async fn size(&self) -> Result<usize> {
            self.inner.size().await
        }

        async fn case_ids(&self) -> Result<Vec<CaseId>> {
            self.inner.case_ids().await
        }

        async fn clear(&self) -> Result<()> {
            self.stale_schema.store(false, Ordering::SeqCst);
            self.inner.clear().await
        }

        async fn matches_schema(&self) -> Result<bool> {
            Ok(!self.stale_schema.load(Ordering::SeqCst))
        }

        fn name(&self) -> &str {
            "flaky"
        }
    }

    fn id(s: &str) -> CaseId {
        CaseId::new(s).unwrap()
    }

    fn setup(failures: usize) -> (Arc<CaseStore>, Arc<FlakyIndex>, Indexer) {
        setup_with(Arc::new(FlakyEmbedder::new(failures)))
    }

    fn setup_with(embedder: Arc<FlakyEmbedder>) -> (Arc<CaseStore>, Arc<FlakyIndex>, Indexer) {
        let index = Arc::new(FlakyIndex {
            inner: MemoryIndex::new(IndexSchema::for_provider(embedder.as_ref())),
            fail_removes: AtomicBool::new(false),
            stale_schema: AtomicBool::new(false),
        });
        let store = Arc::new(CaseStore::open_in_memory().unwrap());
        let indexer = Indexer::new(
            store.clone(),
            index.clone(),
            embedder,
            RetryPolicy::immediate(3),
        )
        .unwrap();
        (store, index, indexer)
    }

    #[tokio::test]
    async fn test_upsert_case_indexes() {
        let (_, index, indexer) = setup(0);
        let record = indexer
            .upsert_case(NewCase::new(id("case_a"), "traitement de canal"))
            .await
            .unwrap();

        assert_eq!(record.state, CaseState::Indexed);
        assert_eq!(record.version, 2);
        assert_eq!(index.inner.version_of(&id("case_a")), Some(2));
    }

    #[tokio::test]
    async fn test_upsert_retries_provider_outage() {
        let (_, _, indexer) = setup(2);
        let record = indexer
            .upsert_case(NewCase::new(id("case_a"), "pose d'implant"))
            .await
            .unwrap();
        assert_eq!(record.state, CaseState::Indexed);
    }

    #[tokio::test]
    async fn test_upsert_gives_up_after_retries() {
        let (store, index, indexer) = setup(10);
        let record = indexer
            .upsert_case(NewCase::new(id("case_a"), "pose d'implant"))
            .await
            .unwrap();

        assert_ne!(record.state, CaseState::Indexed);
        assert_eq!(index.size().await.unwrap(), 0);
        assert!(store.find(&id("case_a")).unwrap().is_some());
    }

    #[tokio::test]
    async fn test_text_change_reindexes() {
        let (_, index, indexer) = setup(0);
        indexer
            .upsert_case(NewCase::new(id("case_a"), "détartrage"))
            .await
            .unwrap();
        let record = indexer
            .upsert_case(NewCase::new(id("case_a"), "extraction de sagesse"))
            .await
            .unwrap();

        assert_eq!(record.state, CaseState::Indexed);
        assert_eq!(index.inner.version_of(&id("case_a")), Some(record.version));
    }

    #[tokio::test]
    async fn test_reconcile_missing_case_removes() {
        let (_, index, indexer) = setup(0);
        index.upsert(&id("ghost"), 1, &[1.0; 64]).await.unwrap();

        let outcome = indexer.reconcile_one(&id("ghost")).await.unwrap();
        assert_eq!(outcome, ReconcileOutcome::Removed);
        assert_eq!(index.size().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_reconcile_reuses_stored_embedding() {
        let (_, _, indexer) = setup(0);
        indexer
            .upsert_case(NewCase::new(id("case_a"), "couronne céramique"))
            .await
            .unwrap();

        let outcome = indexer.reconcile_one(&id("case_a")).await.unwrap();
        assert_eq!(
            outcome,
            ReconcileOutcome::Indexed {
                version: 2,
                embedded: false
            }
        );
    }

    #[tokio::test]
    async fn test_delete_queues_failed_removal() {
        let (store, index, indexer) = setup(0);
        indexer
            .upsert_case(NewCase::new(id("case_a"), "couronne céramique"))
            .await
            .unwrap();

        index.fail_removes.store(true, Ordering::SeqCst);
        assert!(indexer.on_delete(&id("case_a")).await.unwrap());
        assert!(store.find(&id("case_a")).unwrap().is_none());
        assert_eq!(indexer.pending_removals(), vec![id("case_a")]);

        // 다음 쓰기에서 처리
        index.fail_removes.store(false, Ordering::SeqCst);
        indexer
            .upsert_case(NewCase::new(id("case_b"), "bridge"))
            .await
            .unwrap();
        assert!(indexer.pending_removals().is_empty());
        assert_eq!(index.case_ids().await.unwrap(), vec![id("case_b")]);
    }

    #[tokio::test]
    async fn test_rebuild_removes_orphans_and_reembeds() {
        let (store, index, indexer) = setup(0);
        indexer
            .upsert_case(NewCase::new(id("case_a"), "traitement de canal"))
            .await
            .unwrap();
        store
            .put(NewCase::new(id("case_b"), "blanchiment"))
            .unwrap();
        index.upsert(&id("orphan"), 1, &[1.0; 64]).await.unwrap();

        let report = indexer.rebuild_all(false).await.unwrap();
        assert_eq!(report.total, 2);
        assert_eq!(report.upserted, 2);
        assert_eq!(report.embedded, 1);
        assert_eq!(report.orphans_removed, 1);
        assert_eq!(report.failed, 0);
        assert_eq!(
            index.case_ids().await.unwrap(),
            vec![id("case_a"), id("case_b")]
        );
    }

    #[tokio::test]
    async fn test_rebuild_is_exclusive() {
        let (_, _, indexer) = setup(0);
        let _held = indexer.rebuild_lock.try_lock().unwrap();
        let result = indexer.rebuild_all(false).await;
        assert!(matches!(result, Err(RagError::RebuildInProgress)));
    }

    #[tokio::test]
    async fn test_invalid_input_not_retried() {
        let embedder = Arc::new(FlakyEmbedder {
            error: RagError::InvalidInput,
            ..FlakyEmbedder::new(10)
        });
        let (_, _, indexer) = setup_with(embedder.clone());
        indexer
            .upsert_case(NewCase::new(id("case_a"), "pose d'implant"))
            .await
            .unwrap();
        assert_eq!(embedder.calls(), 1);

        let outage = Arc::new(FlakyEmbedder::new(10));
        let (_, _, indexer) = setup_with(outage.clone());
        indexer
            .upsert_case(NewCase::new(id("case_a"), "pose d'implant"))
            .await
            .unwrap();
        assert_eq!(outage.calls(), 3);
    }

    #[tokio::test]
    async fn test_failed_reembed_drops_previous_vector() {
        let embedder = Arc::new(FlakyEmbedder {
            fail_text: Some("fracture"),
            ..FlakyEmbedder::new(0)
        });
        let (store, index, indexer) = setup_with(embedder);

        indexer
            .upsert_case(NewCase::new(id("case_a"), "détartrage"))
            .await
            .unwrap();
        assert_eq!(index.inner.version_of(&id("case_a")), Some(2));

        let record = indexer
            .upsert_case(NewCase::new(id("case_a"), "fracture radiculaire"))
            .await
            .unwrap();
        assert_ne!(record.state, CaseState::Indexed);
        assert!(index.case_ids().await.unwrap().is_empty());

        // reconcile_one도 실패 시 엔트리를 남기지 않음
        index.upsert(&id("case_a"), 2, &[1.0; 64]).await.unwrap();
        assert!(indexer.reconcile_one(&id("case_a")).await.is_err());
        assert!(index.case_ids().await.unwrap().is_empty());
        assert!(store.find(&id("case_a")).unwrap().is_some());
    }

    #[tokio::test]
    async fn test_remove_orphans_clears_pending_queue() {
        let (_, index, indexer) = setup(0);
        indexer
            .upsert_case(NewCase::new(id("case_a"), "détartrage"))
            .await
            .unwrap();
        indexer
            .upsert_case(NewCase::new(id("case_b"), "blanchiment"))
            .await
            .unwrap();

        index.fail_removes.store(true, Ordering::SeqCst);
        indexer.on_delete(&id("case_a")).await.unwrap();
        assert_eq!(indexer.pending_removals(), vec![id("case_a")]);
        index.fail_removes.store(false, Ordering::SeqCst);
        index.upsert(&id("orphan"), 1, &[1.0; 64]).await.unwrap();

        assert_eq!(indexer.remove_orphans().await.unwrap(), 2);
        assert!(indexer.pending_removals().is_empty());
        assert_eq!(index.case_ids().await.unwrap(), vec![id("case_b")]);
    }

    #[tokio::test]
    async fn test_rebuild_clears_index_with_stale_schema() {
        let (store, index, indexer) = setup(0);
        store
            .put(NewCase::new(id("case_a"), "détartrage"))
            .unwrap();
        index.stale_schema.store(true, Ordering::SeqCst);

        let report = indexer.rebuild_all(false).await.unwrap();
        assert!(report.cleared);
        assert_eq!(report.upserted, 1);
        assert_eq!(report.failed, 0);
        assert!(index.matches_schema().await.unwrap());

        let report = indexer.rebuild_all(false).await.unwrap();
        assert!(!report.cleared);
    }

    #[test]
    fn test_dimension_mismatch_rejected() {
        let embedder = Arc::new(HashingEmbedding::new(64).unwrap());
        let index = Arc::new(MemoryIndex::new(IndexSchema::new("other", 32)));
        let store = Arc::new(CaseStore::open_in_memory().unwrap());
        let result = Indexer::new(store, index, embedder, RetryPolicy::immediate(1));
        assert!(matches!(result, Err(RagError::DimensionMismatch { .. })));
    }
}
