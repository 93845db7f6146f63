//! Context Assembler - 검색 결과를 LLM 프롬프트용 컨텍스트로 변환

use serde::Serialize;

use super::record::CaseId;
use super::retrieval::RetrievedCase;

const HEADER: &str = "=== CAS SIMILAIRES ===";
const EMPTY_CONTEXT: &str = "Aucun cas similaire trouvé.";
const UNSPECIFIED: &str = "Non spécifiée";

/// 컨텍스트에 인용된 케이스
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CaseReference {
    pub case_id: CaseId,
    pub title: String,
    pub description: String,
    pub score: f32,
}

/// 조립된 컨텍스트
#[derive(Debug, Clone, Serialize)]
pub struct AssembledContext {
    pub text: String,
    pub references: Vec<CaseReference>,
    /// 예산 때문에 일부 케이스가 빠졌는지
    pub truncated: bool,
}

/// 컨텍스트 조립기
#[derive(Debug, Clone)]
pub struct ContextAssembler {
    /// 상담 요약 최대 글자 수
    pub consultation_chars: usize,
    /// 원문 미리보기 최대 글자 수
    pub preview_chars: usize,
    /// 참조 설명 최대 글자 수
    pub description_chars: usize,
    /// 전체 글자 예산
    pub max_chars: usize,
}

impl Default for ContextAssembler {
    fn default() -> Self {
        Self {
            consultation_chars: 80,
            preview_chars: 150,
            description_chars: 40,
            max_chars: 4000,
        }
    }
}

impl ContextAssembler {
    pub fn with_budget(mut self, max_chars: usize) -> Self {
        self.max_chars = max_chars;
        self
    }

    /// 검색 결과 순서대로 렌더링 (예산 초과 시 중단)
    pub fn assemble(&self, cases: &[RetrievedCase]) -> AssembledContext {
        if cases.is_empty() {
            return AssembledContext {
                text: EMPTY_CONTEXT.to_string(),
                references: vec![],
                truncated: false,
            };
        }

        let mut text = HEADER.to_string();
        let mut used = HEADER.chars().count();
        let mut references = Vec::with_capacity(cases.len());
        let mut truncated = false;

        for (i, case) in cases.iter().enumerate() {
            let n = i + 1;
            let consultation = case
                .metadata
                .consultation
                .as_deref()
                .filter(|c| !c.trim().is_empty())
                .unwrap_or(UNSPECIFIED);
            let block = format!(
                "\nCas {}: {} (similarité: {:.2})\nDétails: {}",
                n,
                clip(consultation, self.consultation_chars),
                case.score,
                preview(&case.raw_text, self.preview_chars)
            );

            let block_chars = block.chars().count();
            if used + block_chars > self.max_chars {
                truncated = true;
                break;
            }
            used += block_chars;
            text.push_str(&block);

            references.push(CaseReference {
                case_id: case.case_id.clone(),
                title: format!("Cas clinique {}", n),
                description: preview(consultation, self.description_chars),
                score: case.score,
            });
        }

        if truncated {
            tracing::debug!(
                "Context budget of {} chars reached after {} case(s)",
                self.max_chars,
                references.len()
            );
        }

        AssembledContext {
            text,
            references,
            truncated,
        }
    }
}

/// 글자 단위로 자르기
fn clip(text: &str, max_chars: usize) -> &str {
    match text.char_indices().nth(max_chars) {
        Some((idx, _)) => &text[..idx],
        None => text,
    }
}

/// 잘렸으면 "..." 추가
fn preview(text: &str, max_chars: usize) -> String {
    let clipped = clip(text, max_chars);
    if clipped.len() < text.len() {
        format!("{}...", clipped)
    } else {
        text.to_string()
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::casebase::record::CaseMetadata;

    fn case(id: &str, consultation: Option<&str>, text: &str, score: f32) -> RetrievedCase {
        let mut metadata = CaseMetadata::default();
        metadata.consultation = consultation.map(str::to_string);
        RetrievedCase {
            case_id: CaseId::new(id).unwrap(),
            score,
            raw_text: text.to_string(),
            metadata,
            version: 2,
        }
    }

    #[test]
    fn test_empty_results() {
        let ctx = ContextAssembler::default().assemble(&[]);
        assert_eq!(ctx.text, "Aucun cas similaire trouvé.");
        assert!(ctx.references.is_empty());
    }

    #[test]
    fn test_render_format() {
        let ctx = ContextAssembler::default().assemble(&[case(
            "case_1",
            Some("Douleur molaire"),
            "Consultation: Douleur molaire | Treatment Sequence:",
            0.8712,
        )]);

        assert_eq!(
            ctx.text,
            "=== CAS SIMILAIRES ===\nCas 1: Douleur molaire (similarité: 0.87)\n\
             Détails: Consultation: Douleur molaire | Treatment Sequence:"
        );
        assert_eq!(ctx.references[0].title, "Cas clinique 1");
        assert_eq!(ctx.references[0].case_id.as_str(), "case_1");
    }

    #[test]
    fn test_missing_consultation_placeholder() {
        let ctx = ContextAssembler::default().assemble(&[case("c", None, "texte", 0.5)]);
        assert!(ctx.text.contains("Cas 1: Non spécifiée"));
    }

    #[test]
    fn test_preview_is_utf8_safe() {
        let long = "é".repeat(300);
        let ctx = ContextAssembler::default().assemble(&[case("c", Some(&long), &long, 0.5)]);
        assert!(ctx.text.contains(&format!("Détails: {}...", "é".repeat(150))));
        assert_eq!(
            ctx.references[0].description,
            format!("{}...", "é".repeat(40))
        );
    }

    #[test]
    fn test_budget_stops_rendering() {
        let cases: Vec<_> = (0..5)
            .map(|i| case(&format!("case_{}", i), Some("Bilan"), &"x".repeat(100), 0.5))
            .collect();
        let ctx = ContextAssembler::default().with_budget(300).assemble(&cases);

        assert!(ctx.truncated);
        assert!(ctx.text.chars().count() <= 300);
        assert!(!ctx.references.is_empty());
        assert!(ctx.references.len() < 5);
    }
}
