//! CLI 모듈
//!
//! dental-case-rag CLI 명령어 정의 및 구현

use std::path::PathBuf;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::{Args, Parser, Subcommand};

use crate::casebase::{CaseBase, CaseId, CaseMetadata, NewCase, RetrievalQuery};
use crate::config::{EmbedderKind, IndexBackend, RagConfig};
use crate::embedding::has_api_key;

// ============================================================================
// CLI Definition
// ============================================================================

#[derive(Parser)]
#[command(name = "dental-case-rag")]
#[command(version, about = "치과 임상 케이스 유사도 검색 (RAG)", long_about = None)]
pub struct Cli {
    #[command(flatten)]
    pub global: GlobalArgs,

    #[command(subcommand)]
    pub command: Commands,
}

/// 공통 설정 플래그 (환경변수보다 우선)
#[derive(Args, Debug, Default)]
pub struct GlobalArgs {
    /// 데이터 디렉토리
    #[arg(long, global = true)]
    pub data_dir: Option<PathBuf>,

    /// 임베딩 백엔드
    #[arg(long, global = true, value_enum)]
    pub embedder: Option<EmbedderKind>,

    /// 벡터 인덱스 백엔드
    #[arg(long, global = true, value_enum)]
    pub index: Option<IndexBackend>,

    /// 임베딩 차원
    #[arg(long, global = true)]
    pub dimension: Option<usize>,
}

impl GlobalArgs {
    /// 환경변수 설정 위에 플래그 적용
    pub fn to_config(&self) -> Result<RagConfig> {
        let mut config = RagConfig::from_env().context("환경변수 설정 오류")?;
        if let Some(ref dir) = self.data_dir {
            config.data_dir = dir.clone();
        }
        if let Some(kind) = self.embedder {
            config.embedder = kind;
        }
        if let Some(backend) = self.index {
            config.index = backend;
        }
        if let Some(dim) = self.dimension {
            config.dimension = Some(dim);
        }
        config.validate().context("잘못된 설정")?;
        Ok(config)
    }
}

#[derive(Subcommand)]
pub enum Commands {
    /// 치료 케이스 JSON 폴더 가져오기
    Import {
        /// 케이스 폴더 경로
        dir: PathBuf,

        /// 하위 폴더까지 탐색
        #[arg(short, long)]
        recursive: bool,
    },

    /// 케이스 작성 또는 수정
    Add {
        /// 케이스 원문
        text: String,

        /// 케이스 ID (생략 시 새로 생성)
        #[arg(long)]
        id: Option<String>,

        /// 임상 태그 (반복 가능)
        #[arg(short, long)]
        tag: Vec<String>,

        /// 상담 요약
        #[arg(short, long)]
        consultation: Option<String>,
    },

    /// 케이스 삭제
    Delete {
        /// 케이스 ID
        id: String,
    },

    /// 유사 케이스 검색
    Query {
        /// 검색 쿼리
        query: String,

        /// 결과 개수 제한
        #[arg(short, long)]
        limit: Option<usize>,

        /// 최소 코사인 유사도
        #[arg(short, long)]
        min_similarity: Option<f32>,

        /// 태그 필터 (반복 가능)
        #[arg(short, long)]
        tag: Vec<String>,

        /// 데드라인 (밀리초)
        #[arg(long)]
        timeout_ms: Option<u64>,
    },

    /// 검색 결과로 LLM 컨텍스트 조립
    Context {
        /// 검색 쿼리
        query: String,

        /// 결과 개수 제한
        #[arg(short, long)]
        limit: Option<usize>,

        /// 최소 코사인 유사도
        #[arg(short, long)]
        min_similarity: Option<f32>,

        /// 전체 글자 예산
        #[arg(short, long)]
        budget: Option<usize>,
    },

    /// 단일 케이스 재인덱싱
    Reconcile {
        /// 케이스 ID
        id: String,
    },

    /// 저장소 전체로 인덱스 재구성
    Rebuild {
        /// 인덱스를 비우고 시작
        #[arg(long)]
        clear: bool,
    },

    /// 저장된 케이스 목록
    List {
        /// 결과 개수 제한
        #[arg(short, long, default_value = "20")]
        limit: usize,
    },

    /// 상태 확인
    Status,
}

// ============================================================================
// CLI Runner
// ============================================================================

/// CLI 명령어 실행
pub async fn run(cli: Cli) -> Result<()> {
    let config = cli.global.to_config()?;

    if config.embedder == EmbedderKind::Gemini && !has_api_key() {
        bail!(
            "API 키가 설정되지 않았습니다.\n\n\
             설정 방법:\n  \
             export GEMINI_API_KEY=your-api-key\n  \
             또는\n  \
             export GOOGLE_AI_API_KEY=your-api-key\n\n\
             또는 --embedder hashing 으로 로컬 임베딩을 사용하세요."
        );
    }

    let base = CaseBase::open(config)
        .await
        .context("케이스 베이스 초기화 실패")?;

    let result = match cli.command {
        Commands::Import { dir, recursive } => cmd_import(&base, dir, recursive).await,
        Commands::Add {
            id,
            text,
            tag,
            consultation,
        } => cmd_add(&base, id, text, tag, consultation).await,
        Commands::Delete { id } => cmd_delete(&base, &id).await,
        Commands::Query {
            query,
            limit,
            min_similarity,
            tag,
            timeout_ms,
        } => cmd_query(&base, &query, limit, min_similarity, tag, timeout_ms).await,
        Commands::Context {
            query,
            limit,
            min_similarity,
            budget,
        } => cmd_context(&base, &query, limit, min_similarity, budget).await,
        Commands::Reconcile { id } => cmd_reconcile(&base, &id).await,
        Commands::Rebuild { clear } => cmd_rebuild(&base, clear).await,
        Commands::List { limit } => cmd_list(&base, limit),
        Commands::Status => cmd_status(&base).await,
    };

    base.shutdown().await.context("종료 처리 실패")?;
    result
}

// ============================================================================
// Command Implementations
// ============================================================================

/// 가져오기 명령어 (import)
async fn cmd_import(base: &CaseBase, dir: PathBuf, recursive: bool) -> Result<()> {
    println!("[*] 케이스 가져오는 중: {}", dir.display());

    let report = base
        .importer()
        .recursive(recursive)
        .import_dir(&dir)
        .await
        .context("케이스 가져오기 실패")?;

    println!(
        "[OK] 완료: 검사 {}, 반영 {}, 변경 없음 {}, 실패 {}",
        report.scanned, report.imported, report.unchanged, report.failed
    );
    for path in &report.failed_files {
        println!("[!] 실패: {}", path.display());
    }

    Ok(())
}

/// 작성 명령어 (add)
async fn cmd_add(
    base: &CaseBase,
    id: Option<String>,
    text: String,
    tags: Vec<String>,
    consultation: Option<String>,
) -> Result<()> {
    let case_id = match id {
        Some(id) => CaseId::new(id)?,
        None => CaseId::new(format!("case_{}", uuid::Uuid::new_v4().simple()))?,
    };
    let mut metadata = CaseMetadata::default().with_tags(tags);
    if let Some(consultation) = consultation {
        metadata = metadata.with_consultation(consultation);
    }

    println!("[*] 케이스 저장 및 임베딩 생성 중...");

    let record = base
        .indexer()
        .upsert_case(NewCase::new(case_id, text).with_metadata(metadata))
        .await
        .context("케이스 저장 실패")?;

    println!(
        "[OK] 케이스 {} 저장됨 (version {}, {})",
        record.case_id, record.version, record.state
    );
    if record.state != crate::casebase::CaseState::Indexed {
        println!("[!] 아직 인덱싱되지 않았습니다. `reconcile {}`로 재시도하세요.", record.case_id);
    }

    Ok(())
}

/// 삭제 명령어 (delete)
async fn cmd_delete(base: &CaseBase, id: &str) -> Result<()> {
    let case_id = CaseId::new(id)?;
    let deleted = base
        .indexer()
        .on_delete(&case_id)
        .await
        .context("케이스 삭제 실패")?;

    if deleted {
        println!("[OK] 케이스 {} 삭제됨", case_id);
    } else {
        println!("[!] 케이스 {}를 찾을 수 없습니다", case_id);
    }

    Ok(())
}

/// 검색 명령어 (query)
async fn cmd_query(
    base: &CaseBase,
    query: &str,
    limit: Option<usize>,
    min_similarity: Option<f32>,
    tags: Vec<String>,
    timeout_ms: Option<u64>,
) -> Result<()> {
    println!("[*] 검색 중: \"{}\"", query);

    let mut request = RetrievalQuery::new(query).tags(tags);
    request.max_results = limit;
    request.min_similarity = min_similarity;
    request.deadline = timeout_ms.map(Duration::from_millis);

    let results = base
        .retrieval()
        .search(&request)
        .await
        .context("검색 실패")?;

    if results.is_empty() {
        println!("\n[!] 유사한 케이스가 없습니다.");
        return Ok(());
    }

    println!("\n[OK] 검색 결과 ({} 건):\n", results.len());

    for (i, result) in results.iter().enumerate() {
        println!(
            "{}. [유사도: {:.4}] {} (v{})",
            i + 1,
            result.score,
            result.case_id,
            result.version
        );
        if let Some(ref consultation) = result.metadata.consultation {
            println!("   상담: {}", truncate_text(consultation, 80));
        }
        if !result.metadata.tags.is_empty() {
            println!("   태그: {}", result.metadata.tags.join(", "));
        }
        println!("   내용: {}", truncate_text(&result.raw_text, 200));
        println!();
    }

    Ok(())
}

/// 컨텍스트 명령어 (context)
async fn cmd_context(
    base: &CaseBase,
    query: &str,
    limit: Option<usize>,
    min_similarity: Option<f32>,
    budget: Option<usize>,
) -> Result<()> {
    let results = base
        .retrieval()
        .retrieve(query, limit, min_similarity)
        .await
        .context("검색 실패")?;

    let mut assembler = base.assembler().clone();
    if let Some(budget) = budget {
        assembler = assembler.with_budget(budget);
    }
    let context = assembler.assemble(&results);

    println!("{}", context.text);
    if !context.references.is_empty() {
        println!();
        for reference in &context.references {
            println!(
                "[*] {} - {} ({:.4}) {}",
                reference.title, reference.case_id, reference.score, reference.description
            );
        }
    }
    if context.truncated {
        println!("[!] 예산 초과로 일부 케이스가 생략되었습니다.");
    }

    Ok(())
}

/// 재인덱싱 명령어 (reconcile)
async fn cmd_reconcile(base: &CaseBase, id: &str) -> Result<()> {
    let case_id = CaseId::new(id)?;
    let outcome = base
        .indexer()
        .reconcile_one(&case_id)
        .await
        .context("재인덱싱 실패")?;

    match outcome {
        crate::casebase::ReconcileOutcome::Indexed { version, embedded } => println!(
            "[OK] 케이스 {} 인덱싱됨 (version {}{})",
            case_id,
            version,
            if embedded { ", 새 임베딩" } else { "" }
        ),
        crate::casebase::ReconcileOutcome::Removed => {
            println!("[OK] 케이스 {}가 저장소에 없어 인덱스에서 제거됨", case_id)
        }
    }

    Ok(())
}

/// 리빌드 명령어 (rebuild)
async fn cmd_rebuild(base: &CaseBase, clear: bool) -> Result<()> {
    println!("[*] 인덱스 재구성 중{}...", if clear { " (초기화)" } else { "" });

    let report = base
        .indexer()
        .rebuild_all(clear)
        .await
        .context("인덱스 재구성 실패")?;

    println!(
        "[OK] 완료: 케이스 {}, 임베딩 {}, 반영 {}, 고아 제거 {}, 실패 {} ({} ms)",
        report.total,
        report.embedded,
        report.upserted,
        report.orphans_removed,
        report.failed,
        report.elapsed_ms
    );

    Ok(())
}

/// 목록 명령어 (list)
fn cmd_list(base: &CaseBase, limit: usize) -> Result<()> {
    let records = base.store().list_all().context("케이스 목록 조회 실패")?;

    if records.is_empty() {
        println!("[!] 저장된 케이스가 없습니다.");
        return Ok(());
    }

    println!("[OK] 저장된 케이스 ({} 건):\n", records.len());

    for record in records.iter().take(limit) {
        let consultation = record
            .metadata
            .consultation
            .as_ref()
            .map(|c| truncate_text(c, 40))
            .unwrap_or_else(|| "-".to_string());

        println!("  {:<16} [{}] {}", record.case_id, record.state, consultation);
        println!(
            "        v{} | {} | {} chars",
            record.version,
            record.updated_at.format("%Y-%m-%d %H:%M"),
            record.raw_text.chars().count()
        );
        println!();
    }

    Ok(())
}

/// 상태 명령어 (status)
async fn cmd_status(base: &CaseBase) -> Result<()> {
    println!("dental-case-rag v{}", env!("CARGO_PKG_VERSION"));
    println!();

    let config = base.config();
    println!("[*] 데이터 디렉토리: {}", config.data_dir.display());

    if has_api_key() {
        println!("[OK] API 키: 설정됨");
    } else {
        println!("[*] API 키: 미설정 (해싱 임베딩만 사용 가능)");
    }

    let stats = base.stats().await.context("통계 조회 실패")?;
    println!(
        "[OK] 임베딩: {} ({}, {}차원)",
        stats.embedder, stats.schema.model_id, stats.schema.dimension
    );
    println!(
        "[OK] 저장된 케이스: {} 건 ({})",
        stats.store.case_count,
        format_bytes(stats.store.total_text_bytes)
    );
    for (state, count) in &stats.store.by_state {
        println!("     {}: {}", state, count);
    }
    println!(
        "[OK] 벡터 인덱스 ({}): {} 건",
        stats.index_backend, stats.index_size
    );
    if stats.pending_removals > 0 {
        println!("[!] 대기 중인 인덱스 제거: {} 건", stats.pending_removals);
    }

    Ok(())
}

// ============================================================================
// Helper Functions
// ============================================================================

/// 텍스트 자르기 (UTF-8 안전)
fn truncate_text(text: &str, max_chars: usize) -> String {
    let cleaned = text.replace('\n', " ").replace('\r', "");
    let cleaned = cleaned.trim();

    if cleaned.chars().count() <= max_chars {
        cleaned.to_string()
    } else {
        let truncated: String = cleaned.chars().take(max_chars).collect();
        format!("{}...", truncated)
    }
}

/// 바이트 크기 포맷팅
fn format_bytes(bytes: usize) -> String {
    const KB: usize = 1024;
    const MB: usize = KB * 1024;

    if bytes >= MB {
        format!("{:.2} MB", bytes as f64 / MB as f64)
    } else if bytes >= KB {
        format!("{:.2} KB", bytes as f64 / KB as f64)
    } else {
        format!("{} B", bytes)
    }
}

// ============================================================================
// Tests
// ============================================================================
