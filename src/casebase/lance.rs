//! LanceDB Vector Index - 온디스크 케이스 벡터 인덱스
//!
//! 케이스당 1행 (case_id, version, model_id, embedding).
//! 코사인 거리로 검색하고 `score = 1 - distance`로 변환합니다.
//! ref: https://lancedb.github.io/lancedb/

use std::path::Path;
use std::sync::Arc;

use arrow_array::{
    Array, FixedSizeListArray, Float32Array, Int64Array, RecordBatch, RecordBatchIterator,
    StringArray,
};
use arrow_schema::{DataType, Field, Schema};
use async_trait::async_trait;
use futures::TryStreamExt;
use lancedb::connection::Connection;
use lancedb::query::{ExecutableQuery, QueryBase};
use lancedb::DistanceType;
use tokio::sync::RwLock;

use super::index::{rank, IndexSchema, ScoredCase, VectorIndex};
use super::record::CaseId;
use crate::error::{RagError, Result};

/// 벡터 테이블 이름
const TABLE_NAME: &str = "case_vectors";

// ============================================================================
// LanceVectorIndex
// ============================================================================

/// LanceDB 벡터 인덱스 구현
///
/// upsert는 delete + add 두 단계이므로 쓰기 락 아래에서 수행합니다.
/// 동시 쿼리는 읽기 락을 잡아 엔트리가 빠진 중간 상태를 보지 않습니다.
pub struct LanceVectorIndex {
    db: Connection,
    schema: IndexSchema,
    /// 현재 테이블의 임베딩 차원 (테이블 없으면 None)
    table_dimension: RwLock<Option<usize>>,
}

impl LanceVectorIndex {
    /// LanceDB 인덱스 열기
    ///
    /// # Arguments
    /// * `path` - .lance 디렉토리 경로
    /// * `schema` - 현재 임베딩 모델 스키마
    pub async fn open(path: &Path, schema: IndexSchema) -> Result<Self> {
        if let Some(parent) = path.parent() {
            if !parent.exists() {
                tokio::fs::create_dir_all(parent).await?;
            }
        }

        let path_str = path
            .to_str()
            .ok_or_else(|| RagError::invalid("Invalid path encoding"))?;

        let db = lancedb::connect(path_str)
            .execute()
            .await
            .map_err(|e| lance_error("connect", e))?;

        let index = Self {
            db,
            schema,
            table_dimension: RwLock::new(None),
        };

        let existing = index.read_table_dimension().await?;
        if let Some(dim) = existing {
            if dim != index.schema.dimension {
                tracing::warn!(
                    "Lance index stores {}-d vectors but the embedder produces {}-d; run `rebuild --clear`",
                    dim,
                    index.schema.dimension
                );
            }
        }
        *index.table_dimension.write().await = existing;

        Ok(index)
    }

    /// 벡터 테이블 스키마 생성
    fn create_schema(dimension: i32) -> Schema {
        Schema::new(vec![
            Field::new("case_id", DataType::Utf8, false),
            Field::new("version", DataType::Int64, false),
            Field::new("model_id", DataType::Utf8, false),
            Field::new(
                "embedding",
                DataType::FixedSizeList(
                    Arc::new(Field::new("item", DataType::Float32, true)),
                    dimension,
                ),
                false,
            ),
        ])
    }

    /// 단일 엔트리를 Arrow RecordBatch로 변환
    fn entry_to_batch(&self, case_id: &CaseId, version: u64, vector: &[f32]) -> Result<RecordBatch> {
        let dimension = i32::try_from(self.schema.dimension)
            .map_err(|_| RagError::invalid("dimension too large for Arrow"))?;

        let values = Float32Array::from(vector.to_vec());
        let field = Arc::new(Field::new("item", DataType::Float32, true));
        let embeddings = FixedSizeListArray::try_new(
            field,
            dimension,
            Arc::new(values) as Arc<dyn Array>,
            None,
        )
        .map_err(|e| RagError::corruption(format!("embedding array: {}", e)))?;

        RecordBatch::try_new(
            Arc::new(Self::create_schema(dimension)),
            vec![
                Arc::new(StringArray::from(vec![case_id.as_str()])),
                Arc::new(Int64Array::from(vec![version as i64])),
                Arc::new(StringArray::from(vec![self.schema.model_id.as_str()])),
                Arc::new(embeddings),
            ],
        )
        .map_err(|e| RagError::corruption(format!("record batch: {}", e)))
    }

    /// 테이블 존재 여부 확인
    async fn table_exists(&self) -> Result<bool> {
        let names = self
            .db
            .table_names()
            .execute()
            .await
            .map_err(|e| lance_error("list tables", e))?;
        Ok(names.iter().any(|n| n == TABLE_NAME))
    }

    async fn open_table(&self) -> Result<lancedb::table::Table> {
        self.db
            .open_table(TABLE_NAME)
            .execute()
            .await
            .map_err(|e| lance_error("open table", e))
    }

    /// 기존 테이블의 임베딩 차원 조회
    async fn read_table_dimension(&self) -> Result<Option<usize>> {
        if !self.table_exists().await? {
            return Ok(None);
        }

        let table = self.open_table().await?;
        let schema = table
            .schema()
            .await
            .map_err(|e| lance_error("read schema", e))?;

        let field = schema
            .field_with_name("embedding")
            .map_err(|e| RagError::corruption(format!("missing embedding column: {}", e)))?;

        match field.data_type() {
            DataType::FixedSizeList(_, size) => Ok(Some(*size as usize)),
            other => Err(RagError::corruption(format!(
                "unexpected embedding column type {:?}",
                other
            ))),
        }
    }

    /// 코사인 거리 기준 상위 `limit`개 (정렬 전)
    async fn search(
        &self,
        table: &lancedb::table::Table,
        vector: &[f32],
        limit: usize,
    ) -> Result<Vec<ScoredCase>> {
        let stream = table
            .vector_search(vector.to_vec())
            .map_err(|e| lance_error("create vector search", e))?
            .distance_type(DistanceType::Cosine)
            .only_if(self.model_filter())
            .limit(limit)
            .execute()
            .await
            .map_err(|e| lance_error("execute vector search", e))?;

        let batches: Vec<RecordBatch> = stream
            .try_collect()
            .await
            .map_err(|e| lance_error("collect search results", e))?;

        let mut hits = Vec::new();
        for batch in batches {
            let case_ids = string_column(&batch, "case_id")?;
            let versions = batch
                .column_by_name("version")
                .and_then(|c| c.as_any().downcast_ref::<Int64Array>())
                .ok_or_else(|| RagError::corruption("Missing version column"))?;
            // _distance 컬럼 (LanceDB가 자동 추가)
            let distances = batch
                .column_by_name("_distance")
                .and_then(|c| c.as_any().downcast_ref::<Float32Array>())
                .ok_or_else(|| RagError::corruption("Missing _distance column"))?;

            for i in 0..batch.num_rows() {
                hits.push(ScoredCase {
                    case_id: CaseId::new(case_ids.value(i))?,
                    version: versions.value(i).max(0) as u64,
                    score: (1.0 - distances.value(i)).clamp(-1.0, 1.0),
                });
            }
        }
        Ok(hits)
    }

    /// 모델 필터 (다른 모델의 벡터는 랭킹에서 제외)
    fn model_filter(&self) -> String {
        format!("model_id = '{}'", escape_literal(&self.schema.model_id))
    }
}

#[async_trait]
impl VectorIndex for LanceVectorIndex {
    fn schema(&self) -> &IndexSchema {
        &self.schema
    }

    async fn upsert(&self, case_id: &CaseId, version: u64, vector: &[f32]) -> Result<()> {
        self.schema.check_vector(vector)?;

        let mut table_dimension = self.table_dimension.write().await;
        if let Some(dim) = *table_dimension {
            if dim != vector.len() {
                return Err(RagError::DimensionMismatch {
                    expected: dim,
                    actual: vector.len(),
                });
            }
        }

        let batch = self.entry_to_batch(case_id, version, vector)?;
        let schema = batch.schema();
        let batches = RecordBatchIterator::new(vec![Ok(batch)], schema);

        if table_dimension.is_some() {
            let table = self.open_table().await?;
            table
                .delete(&format!("case_id = '{}'", escape_literal(case_id.as_str())))
                .await
                .map_err(|e| lance_error("delete before upsert", e))?;
            table
                .add(batches)
                .execute()
                .await
                .map_err(|e| lance_error("add vector", e))?;
        } else {
            self.db
                .create_table(TABLE_NAME, batches)
                .execute()
                .await
                .map_err(|e| lance_error("create table", e))?;
            *table_dimension = Some(vector.len());
        }

        Ok(())
    }

    async fn remove(&self, case_id: &CaseId) -> Result<bool> {
        let table_dimension = self.table_dimension.write().await;
        if table_dimension.is_none() {
            return Ok(false);
        }

        let table = self.open_table().await?;
        let filter = format!("case_id = '{}'", escape_literal(case_id.as_str()));
        let existing = table
            .count_rows(Some(filter.clone()))
            .await
            .map_err(|e| lance_error("count before delete", e))?;
        if existing == 0 {
            return Ok(false);
        }

        table
            .delete(&filter)
            .await
            .map_err(|e| lance_error("delete vector", e))?;
        Ok(true)
    }

    async fn query(&self, vector: &[f32], k: usize) -> Result<Vec<ScoredCase>> {
        self.schema.check_vector(vector)?;

        let table_dimension = self.table_dimension.read().await;
        match *table_dimension {
            None => return Ok(vec![]),
            Some(dim) if dim != vector.len() => {
                return Err(RagError::DimensionMismatch {
                    expected: dim,
                    actual: vector.len(),
                })
            }
            Some(_) => {}
        }
        if k == 0 {
            return Ok(vec![]);
        }

        // 경계 점수가 같은 엔트리가 잘리지 않도록 동점이 끊길 때까지 넓혀서 가져옴
        let table = self.open_table().await?;
        let mut limit = k.saturating_mul(2);
        loop {
            let hits = self.search(&table, vector, limit).await?;
            if hits.len() < limit || !boundary_tied(&hits, k) {
                return Ok(rank(hits, k));
            }
            limit = limit.saturating_mul(2);
        }
    }

    async fn size(&self) -> Result<usize> {
        if self.table_dimension.read().await.is_none() {
            return Ok(0);
        }

        let table = self.open_table().await?;
        table
            .count_rows(None)
            .await
            .map_err(|e| lance_error("count rows", e))
    }

    async fn case_ids(&self) -> Result<Vec<CaseId>> {
        if self.table_dimension.read().await.is_none() {
            return Ok(vec![]);
        }

        let table = self.open_table().await?;
        let rows = table
            .count_rows(None)
            .await
            .map_err(|e| lance_error("count rows", e))?;
        if rows == 0 {
            return Ok(vec![]);
        }

        let batches: Vec<RecordBatch> = table
            .query()
            .limit(rows)
            .execute()
            .await
            .map_err(|e| lance_error("scan case ids", e))?
            .try_collect()
            .await
            .map_err(|e| lance_error("collect case ids", e))?;

        let mut ids = Vec::with_capacity(rows);
        for batch in batches {
            let column = string_column(&batch, "case_id")?;
            for i in 0..batch.num_rows() {
                ids.push(CaseId::new(column.value(i))?);
            }
        }
        ids.sort();
        ids.dedup();
        Ok(ids)
    }

    async fn clear(&self) -> Result<()> {
        let mut table_dimension = self.table_dimension.write().await;
        if self.table_exists().await? {
            self.db
                .drop_table(TABLE_NAME)
                .await
                .map_err(|e| lance_error("drop table", e))?;
        }
        *table_dimension = None;
        tracing::info!("Cleared lance vector index");
        Ok(())
    }

    fn name(&self) -> &str {
        "lance"
    }

    async fn matches_schema(&self) -> Result<bool> {
        Ok(self
            .table_dimension
            .read()
            .await
            .map_or(true, |dim| dim == self.schema.dimension))
    }
}

// ============================================================================
// Helper Functions
// ============================================================================

/// k번째 점수와 같은 점수가 결과 끝까지 이어지는지
fn boundary_tied(hits: &[ScoredCase], k: usize) -> bool {
    let mut scores: Vec<f32> = hits.iter().map(|h| h.score).collect();
    scores.sort_by(|a, b| b.total_cmp(a));
    match (scores.get(k.saturating_sub(1)), scores.last()) {
        (Some(kth), Some(last)) => k > 0 && kth == last,
        _ => false,
    }
}

fn lance_error(action: &str, err: lancedb::Error) -> RagError {
    RagError::IndexCorruption(format!("lance {}: {}", action, err))
}

/// SQL 문자열 리터럴 이스케이프 (작은따옴표 이중화)
fn escape_literal(value: &str) -> String {
    value.replace('\'', "''")
}

fn string_column<'a>(batch: &'a RecordBatch, name: &str) -> Result<&'a StringArray> {
    batch
        .column_by_name(name)
        .and_then(|c| c.as_any().downcast_ref::<StringArray>())
        .ok_or_else(|| RagError::corruption(format!("Missing {} column", name)))
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    const DIM: usize = 8;

    fn id(s: &str) -> CaseId {
        CaseId::new(s).unwrap()
    }

    fn unit(axis: usize) -> Vec<f32> {
        let mut v = vec![0.0; DIM];
        v[axis] = 1.0;
        v
    }

    async fn open_index(dir: &TempDir) -> LanceVectorIndex {
        LanceVectorIndex::open(&dir.path().join("test.lance"), IndexSchema::new("m1", DIM))
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_lance_upsert_and_query() {
        let temp_dir = TempDir::new().unwrap();
        let index = open_index(&temp_dir).await;

        assert!(index.query(&unit(0), 3).await.unwrap().is_empty());

        index.upsert(&id("case_a"), 2, &unit(0)).await.unwrap();
        index.upsert(&id("case_b"), 1, &unit(1)).await.unwrap();

        let results = index.query(&unit(0), 2).await.unwrap();
        assert_eq!(results[0].case_id.as_str(), "case_a");
        assert_eq!(results[0].version, 2);
        assert!((results[0].score - 1.0).abs() < 1e-4);
    }

    #[tokio::test]
    async fn test_lance_upsert_replaces() {
        let temp_dir = TempDir::new().unwrap();
        let index = open_index(&temp_dir).await;

        index.upsert(&id("case_a"), 1, &unit(0)).await.unwrap();
        index.upsert(&id("case_a"), 2, &unit(1)).await.unwrap();

        assert_eq!(index.size().await.unwrap(), 1);
        let results = index.query(&unit(1), 1).await.unwrap();
        assert_eq!(results[0].version, 2);
    }

    #[tokio::test]
    async fn test_lance_remove_and_case_ids() {
        let temp_dir = TempDir::new().unwrap();
        let index = open_index(&temp_dir).await;

        index.upsert(&id("case_b"), 1, &unit(0)).await.unwrap();
        index.upsert(&id("case_a"), 1, &unit(1)).await.unwrap();
        assert_eq!(index.case_ids().await.unwrap(), vec![id("case_a"), id("case_b")]);

        assert!(index.remove(&id("case_a")).await.unwrap());
        assert!(!index.remove(&id("case_a")).await.unwrap());
        assert_eq!(index.size().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_lance_persists_and_clears() {
        let temp_dir = TempDir::new().unwrap();
        {
            let index = open_index(&temp_dir).await;
            index.upsert(&id("case_a"), 1, &unit(0)).await.unwrap();
        }

        let index = open_index(&temp_dir).await;
        assert_eq!(index.size().await.unwrap(), 1);

        index.clear().await.unwrap();
        assert_eq!(index.size().await.unwrap(), 0);
        assert!(index.query(&unit(0), 1).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_lance_dimension_mismatch() {
        let temp_dir = TempDir::new().unwrap();
        let index = open_index(&temp_dir).await;
        let result = index.upsert(&id("case_a"), 1, &[1.0, 0.0]).await;
        assert!(matches!(result, Err(RagError::DimensionMismatch { .. })));
    }

    #[tokio::test]
    async fn test_lance_ties_resolved_by_case_id() {
        let temp_dir = TempDir::new().unwrap();
        let index = open_index(&temp_dir).await;

        for name in ["case_e", "case_d", "case_c", "case_b", "case_a"] {
            index.upsert(&id(name), 1, &unit(0)).await.unwrap();
        }

        let results = index.query(&unit(0), 2).await.unwrap();
        let ids: Vec<&str> = results.iter().map(|r| r.case_id.as_str()).collect();
        assert_eq!(ids, vec!["case_a", "case_b"]);
    }

    #[tokio::test]
    async fn test_lance_schema_drift_detected() {
        let temp_dir = TempDir::new().unwrap();
        {
            let index = open_index(&temp_dir).await;
            assert!(index.matches_schema().await.unwrap());
            index.upsert(&id("case_a"), 1, &unit(0)).await.unwrap();
        }

        let index =
            LanceVectorIndex::open(&temp_dir.path().join("test.lance"), IndexSchema::new("m2", 4))
                .await
                .unwrap();
        assert!(!index.matches_schema().await.unwrap());

        index.clear().await.unwrap();
        assert!(index.matches_schema().await.unwrap());
        index.upsert(&id("case_a"), 2, &[1.0, 0.0, 0.0, 0.0]).await.unwrap();
        assert_eq!(index.query(&[1.0, 0.0, 0.0, 0.0], 1).await.unwrap().len(), 1);
    }

    #[test]
    fn test_boundary_tied() {
        let hit = |name: &str, score: f32| ScoredCase {
            case_id: id(name),
            version: 1,
            score,
        };
        assert!(boundary_tied(&[hit("case_a", 0.9), hit("case_b", 0.5), hit("case_c", 0.5)], 2));
        assert!(!boundary_tied(&[hit("case_a", 0.9), hit("case_b", 0.5), hit("case_c", 0.4)], 2));
        assert!(!boundary_tied(&[hit("case_a", 0.9)], 2));
    }

    #[test]
    fn test_escape_literal() {
        assert_eq!(escape_literal("case_d'implant"), "case_d''implant");
    }
}
