//! Case Store - rusqlite 기반 케이스 저장소
//!
//! 케이스 원문, 메타데이터, 현재 임베딩을 영속화합니다.
//! 벡터 인덱스는 언제든 이 저장소만으로 재구성할 수 있습니다.
//! 저장 위치: <data_dir>/cases.db

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OpenFlags, OptionalExtension};
use serde::Serialize;

use super::record::{normalize_tags, CaseId, CaseMetadata, CaseRecord, CaseState, NewCase};
use crate::error::{RagError, Result};

const SELECT_COLUMNS: &str = "SELECT case_id, raw_text, metadata, embedding, embedding_model,
        version, state, created_at, updated_at FROM cases";

// ============================================================================
// Types
// ============================================================================

/// 저장소 통계
#[derive(Debug, Clone, Serialize)]
pub struct StoreStats {
    pub case_count: usize,
    pub by_state: BTreeMap<String, usize>,
    pub total_text_bytes: usize,
    pub db_path: PathBuf,
}

/// SQLite 행 (변환 전)
struct CaseRow {
    case_id: String,
    raw_text: String,
    metadata: String,
    embedding: Option<Vec<u8>>,
    embedding_model: Option<String>,
    version: i64,
    state: String,
    created_at: String,
    updated_at: String,
}

impl CaseRow {
    fn from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            case_id: row.get(0)?,
            raw_text: row.get(1)?,
            metadata: row.get(2)?,
            embedding: row.get(3)?,
            embedding_model: row.get(4)?,
            version: row.get(5)?,
            state: row.get(6)?,
            created_at: row.get(7)?,
            updated_at: row.get(8)?,
        })
    }

    fn into_record(self) -> Result<CaseRecord> {
        let metadata: CaseMetadata = serde_json::from_str(&self.metadata)?;
        let state = CaseState::parse(&self.state).ok_or_else(|| {
            RagError::invalid(format!("unknown case state '{}' for {}", self.state, self.case_id))
        })?;
        let embedding = self.embedding.as_deref().map(decode_vector).transpose()?;

        Ok(CaseRecord {
            case_id: CaseId::new(self.case_id)?,
            raw_text: self.raw_text,
            metadata,
            embedding,
            embedding_model: self.embedding_model,
            version: self.version.max(0) as u64,
            state,
            created_at: parse_datetime(&self.created_at),
            updated_at: parse_datetime(&self.updated_at),
        })
    }
}

// ============================================================================
// CaseStore
// ============================================================================

/// Case Store - 동기 케이스 저장소
///
/// 모든 변경은 단일 트랜잭션으로 적용되며, 실패한 `put`은 이전 레코드를 그대로 남깁니다.
pub struct CaseStore {
    conn: Arc<Mutex<Connection>>,
    db_path: PathBuf,
}

impl CaseStore {
    /// 저장소 열기 (없으면 생성)
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            if !parent.exists() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let conn = Connection::open_with_flags(
            path,
            OpenFlags::SQLITE_OPEN_READ_WRITE
                | OpenFlags::SQLITE_OPEN_CREATE
                | OpenFlags::SQLITE_OPEN_NO_MUTEX,
        )?;

        let store = Self {
            conn: Arc::new(Mutex::new(conn)),
            db_path: path.to_path_buf(),
        };

        store.initialize()?;
        Ok(store)
    }

    /// 인메모리 저장소 (테스트용)
    pub fn open_in_memory() -> Result<Self> {
        let store = Self {
            conn: Arc::new(Mutex::new(Connection::open_in_memory()?)),
            db_path: PathBuf::from(":memory:"),
        };
        store.initialize()?;
        Ok(store)
    }

    /// DB 경로 반환
    pub fn db_path(&self) -> &Path {
        &self.db_path
    }

    /// 커넥션 잠금 (poison 시에도 SQLite 트랜잭션이 일관성을 보장하므로 복구)
    fn lock(&self) -> MutexGuard<'_, Connection> {
        self.conn.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// 스키마 초기화
    fn initialize(&self) -> Result<()> {
        let conn = self.lock();

        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS cases (
                case_id TEXT PRIMARY KEY,
                raw_text TEXT NOT NULL,
                metadata TEXT NOT NULL DEFAULT '{}',
                embedding BLOB,
                embedding_model TEXT,
                version INTEGER NOT NULL,
                state TEXT NOT NULL,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL
             );
             CREATE INDEX IF NOT EXISTS idx_cases_state ON cases(state);",
        )?;

        tracing::debug!("Case store initialized at {:?}", self.db_path);
        Ok(())
    }

    /// 케이스 upsert
    ///
    /// - 신규: version 1, `New`
    /// - 텍스트 변경: version 증가, 임베딩 제거, `Indexed`/`Embedding`이면 `Stale`
    /// - 메타데이터만 변경: version/임베딩/상태 유지
    pub fn put(&self, mut case: NewCase) -> Result<CaseRecord> {
        if case.raw_text.trim().is_empty() {
            return Err(RagError::invalid(format!(
                "case {} has empty raw_text",
                case.case_id
            )));
        }
        // 직접 채운 태그도 필터와 같은 형태로 저장
        case.metadata.tags = normalize_tags(std::mem::take(&mut case.metadata.tags));

        let metadata = serde_json::to_string(&case.metadata)?;
        let now = Utc::now().to_rfc3339();

        {
            let mut conn = self.lock();
            let tx = conn.transaction()?;

            let existing: Option<(String, i64, String)> = tx
                .query_row(
                    "SELECT raw_text, version, state FROM cases WHERE case_id = ?1",
                    params![case.case_id.as_str()],
                    |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
                )
                .optional()?;

            match existing {
                None => {
                    tx.execute(
                        "INSERT INTO cases (case_id, raw_text, metadata, embedding, embedding_model,
                            version, state, created_at, updated_at)
                         VALUES (?1, ?2, ?3, NULL, NULL, 1, ?4, ?5, ?5)",
                        params![
                            case.case_id.as_str(),
                            case.raw_text,
                            metadata,
                            CaseState::New.as_str(),
                            now
                        ],
                    )?;
                    tracing::debug!("Created case {}", case.case_id);
                }
                Some((old_text, version, state)) if old_text != case.raw_text => {
                    let next_state = match CaseState::parse(&state) {
                        Some(CaseState::Indexed) | Some(CaseState::Embedding) => CaseState::Stale,
                        Some(other) => other,
                        None => CaseState::Stale,
                    };
                    tx.execute(
                        "UPDATE cases SET raw_text = ?2, metadata = ?3, embedding = NULL,
                            embedding_model = NULL, version = ?4, state = ?5, updated_at = ?6
                         WHERE case_id = ?1",
                        params![
                            case.case_id.as_str(),
                            case.raw_text,
                            metadata,
                            version + 1,
                            next_state.as_str(),
                            now
                        ],
                    )?;
                    tracing::debug!(
                        "Case {} text changed (version {} -> {}, {})",
                        case.case_id,
                        version,
                        version + 1,
                        next_state
                    );
                }
                Some(_) => {
                    tx.execute(
                        "UPDATE cases SET metadata = ?2, updated_at = ?3 WHERE case_id = ?1",
                        params![case.case_id.as_str(), metadata, now],
                    )?;
                }
            }

            tx.commit()?;
        }

        self.get(&case.case_id)
    }

    /// ID로 케이스 조회 (없으면 `NotFound`)
    pub fn get(&self, case_id: &CaseId) -> Result<CaseRecord> {
        self.find(case_id)?
            .ok_or_else(|| RagError::NotFound(case_id.clone()))
    }

    /// ID로 케이스 조회 (없으면 None)
    pub fn find(&self, case_id: &CaseId) -> Result<Option<CaseRecord>> {
        let row = {
            let conn = self.lock();
            let mut stmt = conn.prepare(&format!("{} WHERE case_id = ?1", SELECT_COLUMNS))?;
            stmt.query_row(params![case_id.as_str()], CaseRow::from_row)
                .optional()?
        };

        row.map(CaseRow::into_record).transpose()
    }

    /// 케이스 삭제
    pub fn delete(&self, case_id: &CaseId) -> Result<bool> {
        let conn = self.lock();
        let rows = conn.execute(
            "DELETE FROM cases WHERE case_id = ?1",
            params![case_id.as_str()],
        )?;
        Ok(rows > 0)
    }

    /// 전체 케이스 (case_id 오름차순)
    pub fn list_all(&self) -> Result<Vec<CaseRecord>> {
        let rows: Vec<CaseRow> = {
            let conn = self.lock();
            let mut stmt = conn.prepare(&format!("{} ORDER BY case_id ASC", SELECT_COLUMNS))?;
            let rows = stmt.query_map([], CaseRow::from_row)?;
            rows.collect::<rusqlite::Result<_>>()?
        };

        rows.into_iter().map(CaseRow::into_record).collect()
    }

    /// 전체 케이스 ID (case_id 오름차순)
    pub fn list_ids(&self) -> Result<Vec<CaseId>> {
        let ids: Vec<String> = {
            let conn = self.lock();
            let mut stmt = conn.prepare("SELECT case_id FROM cases ORDER BY case_id ASC")?;
            let rows = stmt.query_map([], |row| row.get(0))?;
            rows.collect::<rusqlite::Result<_>>()?
        };

        ids.into_iter().map(CaseId::new).collect()
    }

    /// 임베딩 시작 표시 (version이 일치할 때만)
    pub fn mark_embedding(&self, case_id: &CaseId, version: u64) -> Result<bool> {
        let conn = self.lock();
        let rows = conn.execute(
            "UPDATE cases SET state = ?3, updated_at = ?4 WHERE case_id = ?1 AND version = ?2",
            params![
                case_id.as_str(),
                version as i64,
                CaseState::Embedding.as_str(),
                Utc::now().to_rfc3339()
            ],
        )?;
        Ok(rows > 0)
    }

    /// 임베딩 저장 (compare-and-set)
    ///
    /// `expected_version`이 현재 version과 같을 때만 저장하고 version을 올린 뒤
    /// `Indexed`로 전환합니다. 그 사이 텍스트가 바뀌었다면 `VersionConflict`.
    pub fn attach_embedding(
        &self,
        case_id: &CaseId,
        expected_version: u64,
        embedding: &[f32],
        model_id: &str,
    ) -> Result<CaseRecord> {
        let updated = {
            let conn = self.lock();
            conn.execute(
                "UPDATE cases SET embedding = ?3, embedding_model = ?4, version = version + 1,
                    state = ?5, updated_at = ?6
                 WHERE case_id = ?1 AND version = ?2",
                params![
                    case_id.as_str(),
                    expected_version as i64,
                    encode_vector(embedding),
                    model_id,
                    CaseState::Indexed.as_str(),
                    Utc::now().to_rfc3339()
                ],
            )?
        };

        if updated == 0 {
            return match self.find(case_id)? {
                Some(_) => Err(RagError::VersionConflict {
                    case_id: case_id.clone(),
                    expected: expected_version,
                }),
                None => Err(RagError::NotFound(case_id.clone())),
            };
        }

        self.get(case_id)
    }

    /// 저장소 통계
    pub fn stats(&self) -> Result<StoreStats> {
        let conn = self.lock();

        let mut by_state = BTreeMap::new();
        {
            let mut stmt = conn.prepare("SELECT state, COUNT(*) FROM cases GROUP BY state")?;
            let rows = stmt.query_map([], |row| {
                Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?))
            })?;
            for row in rows {
                let (state, count) = row?;
                by_state.insert(state, count.max(0) as usize);
            }
        }

        let total_size: i64 = conn.query_row(
            "SELECT COALESCE(SUM(LENGTH(CAST(raw_text AS BLOB))), 0) FROM cases",
            [],
            |row| row.get(0),
        )?;

        Ok(StoreStats {
            case_count: by_state.values().sum(),
            by_state,
            total_text_bytes: total_size.max(0) as usize,
            db_path: self.db_path.clone(),
        })
    }
}

// ============================================================================
// Helper Functions
// ============================================================================

/// f32 벡터를 little-endian BLOB으로 인코딩
fn encode_vector(vector: &[f32]) -> Vec<u8> {
    vector.iter().flat_map(|x| x.to_le_bytes()).collect()
}

/// little-endian BLOB을 f32 벡터로 디코딩
fn decode_vector(bytes: &[u8]) -> Result<Vec<f32>> {
    if bytes.len() % 4 != 0 {
        return Err(RagError::invalid(format!(
            "embedding blob length {} is not a multiple of 4",
            bytes.len()
        )));
    }
    Ok(bytes
        .chunks_exact(4)
        .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
        .collect())
}

/// RFC3339 문자열을 DateTime<Utc>로 파싱
fn parse_datetime(s: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .unwrap_or_else(|_| Utc::now())
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn create_test_store() -> (TempDir, CaseStore) {
        let dir = TempDir::new().unwrap();
        let db_path = dir.path().join("test.db");
        let store = CaseStore::open(&db_path).unwrap();
        (dir, store)
    }

    fn id(s: &str) -> CaseId {
        CaseId::new(s).unwrap()
    }

    #[test]
    fn test_put_and_get() {
        let (_dir, store) = create_test_store();

        let meta = CaseMetadata::default().with_tags(["endo"]);
        let record = store
            .put(NewCase::new(id("case_a"), "traitement de canal molaire").with_metadata(meta))
            .unwrap();

        assert_eq!(record.version, 1);
        assert_eq!(record.state, CaseState::New);
        assert!(record.embedding.is_none());

        let fetched = store.get(&id("case_a")).unwrap();
        assert_eq!(fetched.raw_text, "traitement de canal molaire");
        assert_eq!(fetched.metadata.tags, vec!["endo"]);
    }

    #[test]
    fn test_get_missing_is_not_found() {
        let (_dir, store) = create_test_store();
        assert!(matches!(store.get(&id("nope")), Err(RagError::NotFound(_))));
        assert!(store.find(&id("nope")).unwrap().is_none());
    }

    #[test]
    fn test_empty_text_rejected_and_previous_kept() {
        let (_dir, store) = create_test_store();
        store.put(NewCase::new(id("case_a"), "pose d'implant")).unwrap();

        let result = store.put(NewCase::new(id("case_a"), "   "));
        assert!(matches!(result, Err(RagError::InvalidInput(_))));
        assert_eq!(store.get(&id("case_a")).unwrap().raw_text, "pose d'implant");
    }

    #[test]
    fn test_text_change_bumps_version_and_marks_stale() {
        let (_dir, store) = create_test_store();
        let a = id("case_a");
        store.put(NewCase::new(a.clone(), "texte initial")).unwrap();

        store.mark_embedding(&a, 1).unwrap();
        let indexed = store.attach_embedding(&a, 1, &[0.6, 0.8], "test-model").unwrap();
        assert_eq!(indexed.version, 2);
        assert_eq!(indexed.state, CaseState::Indexed);
        assert_eq!(indexed.embedding, Some(vec![0.6, 0.8]));

        let edited = store.put(NewCase::new(a.clone(), "texte modifié")).unwrap();
        assert_eq!(edited.version, 3);
        assert_eq!(edited.state, CaseState::Stale);
        assert!(edited.embedding.is_none());
        assert!(edited.embedding_model.is_none());
    }

    #[test]
    fn test_metadata_only_change_keeps_version() {
        let (_dir, store) = create_test_store();
        let a = id("case_a");
        store.put(NewCase::new(a.clone(), "détartrage")).unwrap();
        store.attach_embedding(&a, 1, &[1.0, 0.0], "m").unwrap();

        let meta = CaseMetadata::default().with_tags(["hygiene"]);
        let updated = store
            .put(NewCase::new(a.clone(), "détartrage").with_metadata(meta))
            .unwrap();

        assert_eq!(updated.version, 2);
        assert_eq!(updated.state, CaseState::Indexed);
        assert_eq!(updated.metadata.tags, vec!["hygiene"]);
        assert!(updated.embedding.is_some());
    }

    #[test]
    fn test_attach_embedding_version_conflict() {
        let (_dir, store) = create_test_store();
        let a = id("case_a");
        store.put(NewCase::new(a.clone(), "v1")).unwrap();
        store.put(NewCase::new(a.clone(), "v2")).unwrap();

        let result = store.attach_embedding(&a, 1, &[1.0], "m");
        assert!(matches!(result, Err(RagError::VersionConflict { expected: 1, .. })));

        let result = store.attach_embedding(&id("ghost"), 1, &[1.0], "m");
        assert!(matches!(result, Err(RagError::NotFound(_))));
    }

    #[test]
    fn test_list_all_ordered_by_id() {
        let (_dir, store) = create_test_store();
        for name in ["case_c", "case_a", "case_b"] {
            store.put(NewCase::new(id(name), format!("texte {}", name))).unwrap();
        }

        let ids: Vec<String> = store
            .list_all()
            .unwrap()
            .into_iter()
            .map(|r| r.case_id.to_string())
            .collect();
        assert_eq!(ids, vec!["case_a", "case_b", "case_c"]);
        assert_eq!(store.list_ids().unwrap().len(), 3);
    }

    #[test]
    fn test_delete() {
        let (_dir, store) = create_test_store();
        store.put(NewCase::new(id("case_a"), "à supprimer")).unwrap();

        assert!(store.delete(&id("case_a")).unwrap());
        assert!(!store.delete(&id("case_a")).unwrap());
        assert!(store.find(&id("case_a")).unwrap().is_none());
    }

    #[test]
    fn test_persists_across_reopen() {
        let dir = TempDir::new().unwrap();
        let db_path = dir.path().join("cases.db");
        {
            let store = CaseStore::open(&db_path).unwrap();
            store.put(NewCase::new(id("case_a"), "molaire")).unwrap();
            store.attach_embedding(&id("case_a"), 1, &[0.25, -0.5], "m").unwrap();
        }

        let store = CaseStore::open(&db_path).unwrap();
        let record = store.get(&id("case_a")).unwrap();
        assert_eq!(record.embedding, Some(vec![0.25, -0.5]));
        assert_eq!(record.embedding_model.as_deref(), Some("m"));
    }

    #[test]
    fn test_stats() {
        let (_dir, store) = create_test_store();
        store.put(NewCase::new(id("case_a"), "1234567890")).unwrap();
        store.put(NewCase::new(id("case_b"), "abc")).unwrap();
        store.attach_embedding(&id("case_b"), 1, &[1.0], "m").unwrap();

        let stats = store.stats().unwrap();
        assert_eq!(stats.case_count, 2);
        assert_eq!(stats.total_text_bytes, 13);
        assert_eq!(stats.by_state.get("new"), Some(&1));
        assert_eq!(stats.by_state.get("indexed"), Some(&1));
    }

    #[test]
    fn test_put_normalizes_raw_tags() {
        let (_dir, store) = create_test_store();

        let meta = CaseMetadata {
            tags: vec![" Urgence ".into(), "ENDO".into(), "endo".into(), "".into()],
            ..Default::default()
        };
        let record = store
            .put(NewCase::new(id("case_a"), "douleur aiguë molaire").with_metadata(meta))
            .unwrap();

        assert_eq!(record.metadata.tags, vec!["endo", "urgence"]);
        assert_eq!(store.get(&id("case_a")).unwrap().metadata.tags, vec!["endo", "urgence"]);
    }

    #[test]
    fn test_vector_codec() {
        let v = vec![0.1f32, -2.5, 3.0];
        assert_eq!(decode_vector(&encode_vector(&v)).unwrap(), v);
        assert!(decode_vector(&[0, 1, 2]).is_err());
    }
}
