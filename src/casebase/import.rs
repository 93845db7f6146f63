//! 치료 케이스 JSON 가져오기
//!
//! 폴더의 `*.json` 치료 케이스 파일을 읽어 케이스 저장소에 반영합니다.
//! 파일 내용 해시가 같고 이미 인덱싱된 케이스는 건너뜁니다.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use walkdir::WalkDir;

use super::indexer::Indexer;
use super::record::{CaseId, CaseMetadata, CaseSource, CaseState, NewCase};
use super::store::CaseStore;
use crate::error::{RagError, Result};

// ============================================================================
// File Format
// ============================================================================

/// 치료 케이스 파일
#[derive(Debug, Deserialize)]
struct TreatmentCaseFile {
    consultation_text: Option<String>,
    treatment_sequence: Option<Vec<TreatmentStep>>,
}

/// 예약 1회분 치료 (값 타입이 일정하지 않아 그대로 보관)
#[derive(Debug, Default, Deserialize)]
struct TreatmentStep {
    #[serde(default)]
    traitement: serde_json::Value,
    #[serde(default)]
    duree: serde_json::Value,
    #[serde(default)]
    dr: serde_json::Value,
    #[serde(default)]
    remarque: serde_json::Value,
}

impl TreatmentCaseFile {
    /// 임베딩용 원문 (" | "로 연결)
    fn raw_text(&self) -> String {
        let mut parts = Vec::new();

        if let Some(consultation) = &self.consultation_text {
            parts.push(format!("Consultation: {}", consultation));
        }

        if let Some(sequence) = &self.treatment_sequence {
            parts.push("Treatment Sequence:".to_string());
            for (i, step) in sequence.iter().enumerate() {
                parts.push(format!(
                    "RDV {}: {} - Duration: {} - Doctor: {} - Remarks: {}",
                    i + 1,
                    field(&step.traitement),
                    field(&step.duree),
                    field(&step.dr),
                    field(&step.remarque)
                ));
            }
        }

        parts.join(" | ")
    }
}

fn field(value: &serde_json::Value) -> String {
    match value {
        serde_json::Value::Null => String::new(),
        serde_json::Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

// ============================================================================
// Importer
// ============================================================================

/// 가져오기 결과
#[derive(Debug, Clone, Default, Serialize)]
pub struct ImportReport {
    pub scanned: usize,
    pub imported: usize,
    pub unchanged: usize,
    pub failed: usize,
    pub failed_files: Vec<PathBuf>,
}

/// 치료 케이스 가져오기
pub struct CaseImporter {
    store: Arc<CaseStore>,
    indexer: Arc<Indexer>,
    recursive: bool,
}

impl CaseImporter {
    pub fn new(store: Arc<CaseStore>, indexer: Arc<Indexer>) -> Self {
        Self {
            store,
            indexer,
            recursive: false,
        }
    }

    /// 하위 폴더까지 탐색
    pub fn recursive(mut self, recursive: bool) -> Self {
        self.recursive = recursive;
        self
    }

    /// 폴더 가져오기
    pub async fn import_dir(&self, dir: &Path) -> Result<ImportReport> {
        if !dir.is_dir() {
            return Err(RagError::invalid(format!("not a directory: {:?}", dir)));
        }

        let max_depth = if self.recursive { usize::MAX } else { 1 };
        let mut report = ImportReport::default();

        for entry in WalkDir::new(dir)
            .max_depth(max_depth)
            .sort_by_file_name()
        {
            let entry = match entry {
                Ok(e) => e,
                Err(e) => {
                    tracing::warn!("Failed to read entry: {}", e);
                    continue;
                }
            };

            let path = entry.path();
            if !entry.file_type().is_file() || !is_json(path) {
                continue;
            }

            report.scanned += 1;
            match self.import_file(path).await {
                Ok(FileOutcome::Imported) => report.imported += 1,
                Ok(FileOutcome::Unchanged) => report.unchanged += 1,
                Ok(FileOutcome::NotIndexed) => {
                    report.failed += 1;
                    report.failed_files.push(path.to_path_buf());
                }
                Err(e) => {
                    tracing::warn!("Failed to import {:?}: {}", path, e);
                    report.failed += 1;
                    report.failed_files.push(path.to_path_buf());
                }
            }
        }

        tracing::info!(
            "Imported {} case(s) from {:?} ({} unchanged, {} failed)",
            report.imported,
            dir,
            report.unchanged,
            report.failed
        );
        Ok(report)
    }

    async fn import_file(&self, path: &Path) -> Result<FileOutcome> {
        let bytes = std::fs::read(path)?;
        let content_hash = format!("{:x}", Sha256::digest(&bytes));

        let stem = path
            .file_stem()
            .and_then(|s| s.to_str())
            .ok_or_else(|| RagError::invalid(format!("invalid file name: {:?}", path)))?;
        let case_id = CaseId::new(format!("case_{}", stem))?;

        if let Some(existing) = self.store.find(&case_id)? {
            if existing.metadata.content_hash.as_deref() == Some(content_hash.as_str()) {
                if existing.state == CaseState::Indexed {
                    tracing::debug!("Skipping unchanged {:?}", path);
                    return Ok(FileOutcome::Unchanged);
                }
                // 이전 가져오기에서 인덱싱에 실패한 케이스
                self.indexer.reconcile_one(&case_id).await?;
                return Ok(FileOutcome::Imported);
            }
        }

        let parsed: TreatmentCaseFile = serde_json::from_slice(&bytes)?;
        let metadata = CaseMetadata {
            source: CaseSource::Imported,
            tags: vec![],
            source_file: path.file_name().and_then(|n| n.to_str()).map(str::to_string),
            consultation: parsed.consultation_text.clone(),
            treatments_count: parsed
                .treatment_sequence
                .as_ref()
                .map(|s| s.len() as u32),
            content_hash: Some(content_hash),
        };

        let record = self
            .indexer
            .upsert_case(NewCase::new(case_id, parsed.raw_text()).with_metadata(metadata))
            .await?;

        if record.state == CaseState::Indexed {
            Ok(FileOutcome::Imported)
        } else {
            Ok(FileOutcome::NotIndexed)
        }
    }
}

enum FileOutcome {
    Imported,
    Unchanged,
    /// 저장은 됐지만 인덱싱 실패 (다음 가져오기에서 재시도)
    NotIndexed,
}

fn is_json(path: &Path) -> bool {
    path.extension()
        .and_then(|ext| ext.to_str())
        .map(|ext| ext.eq_ignore_ascii_case("json"))
        .unwrap_or(false)
}

// ============================================================================
// Tests
// ============================================================================
