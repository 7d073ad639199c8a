//! Combines a product's per-image verdicts into one product-level verdict:
//! a trimmed mean over the best-scoring 70% (outliers dropped), rendered
//! into the Korean markdown summary the seller-facing UI shows directly.

use chrono::Utc;
use marketplace_protocol::types::{Condition, ProductVerdict, Severity};

/// Aggregate a set of per-image verdicts for `product_id` into one
/// [`ProductVerdict`]. Returns the error markdown path if `verdicts` is
/// empty - every image failed to analyze or the request timed out before
/// any image completed.
pub fn aggregate(
    product_id: &str,
    product_name: Option<&str>,
    verdicts: &[marketplace_protocol::types::ImageVerdict],
    total_requested: usize,
    failed_count: usize,
    timed_out: bool,
) -> ProductVerdict {
    if verdicts.is_empty() {
        return ProductVerdict {
            product_id: product_id.to_string(),
            condition: Condition::D,
            price_adjustment: -100,
            total_defects: 0,
            markdown: error_markdown(total_requested, verdicts.len(), failed_count, timed_out),
            completed_at: Utc::now(),
        };
    }

    let condition = aggregate_condition(verdicts);
    let price_adjustment = aggregate_price_adjustment(verdicts);
    let total_defects: usize = verdicts.iter().map(|v| v.defects.len()).sum();
    let skipped = total_requested.saturating_sub(verdicts.len() + failed_count);

    let markdown = render_markdown(
        product_name.unwrap_or("제품"),
        condition,
        price_adjustment,
        verdicts,
        failed_count,
        skipped,
        timed_out,
    );

    ProductVerdict {
        product_id: product_id.to_string(),
        condition,
        price_adjustment,
        total_defects,
        markdown,
        completed_at: Utc::now(),
    }
}

/// Number of verdicts kept by the trim, at least 1.
fn top_count(n: usize) -> usize {
    ((n as f64) * marketplace_protocol::defaults::DEFAULT_TRIM_KEEP_FRACTION) as usize
}

fn trim_keep_count(n: usize) -> usize {
    top_count(n).max(1)
}

/// Best-scoring 70% by condition ordinal (lower is better), averaged, then
/// snapped to the nearest letter grade.
fn aggregate_condition(verdicts: &[marketplace_protocol::types::ImageVerdict]) -> Condition {
    let mut ordinals: Vec<u8> = verdicts.iter().map(|v| v.condition.ordinal()).collect();
    ordinals.sort_unstable();
    let keep = trim_keep_count(ordinals.len());
    let kept = &ordinals[..keep];
    let avg = kept.iter().map(|&o| o as f64).sum::<f64>() / kept.len() as f64;

    Condition::ORDER
        .iter()
        .copied()
        .min_by(|a, b| {
            let da = (a.ordinal() as f64 - avg).abs();
            let db = (b.ordinal() as f64 - avg).abs();
            da.partial_cmp(&db).unwrap()
        })
        .unwrap_or(Condition::C)
}

/// Best-scoring 70% by price adjustment (least negative first), averaged.
fn aggregate_price_adjustment(verdicts: &[marketplace_protocol::types::ImageVerdict]) -> i32 {
    let mut adjustments: Vec<i32> = verdicts.iter().map(|v| v.price_adjustment).collect();
    adjustments.sort_unstable_by(|a, b| b.cmp(a));
    let keep = trim_keep_count(adjustments.len());
    let kept = &adjustments[..keep];
    (kept.iter().sum::<i32>() as f64 / kept.len() as f64) as i32
}

fn severity_label(severity: Severity) -> &'static str {
    match severity {
        Severity::High => "상",
        Severity::Medium => "중",
        Severity::Low => "하",
    }
}

fn render_markdown(
    product_name: &str,
    condition: Condition,
    price_adjustment: i32,
    verdicts: &[marketplace_protocol::types::ImageVerdict],
    failed_count: usize,
    skipped_count: usize,
    timed_out: bool,
) -> String {
    let _ = product_name;
    let mut md = String::from("# 결함 분석 결과\n\n");

    if timed_out || skipped_count > 0 {
        md.push_str("⚠️ **주의**: 처리 시간 제한으로 인해 일부 이미지만 분석되었습니다.\n\n");
        md.push_str(&format!(
            "- 전체 이미지: {}장\n",
            verdicts.len() + failed_count + skipped_count
        ));
        md.push_str(&format!("- 분석 완료: {}장\n", verdicts.len()));
        if failed_count > 0 {
            md.push_str(&format!("- 분석 실패: {failed_count}장\n"));
        }
        if skipped_count > 0 {
            md.push_str(&format!("- 시간 초과로 미분석: {skipped_count}장\n"));
        }
        md.push('\n');
    }

    md.push_str(&format!(
        "**전체 상태 등급**: {} - {}\n\n",
        condition,
        condition.label_ko()
    ));

    let total_defects: usize = verdicts.iter().map(|v| v.defects.len()).sum();
    md.push_str(&format!("**발견된 결함**: {total_defects}건\n\n"));
    let _ = price_adjustment;

    if total_defects == 0 {
        md.push_str("## ✅ 결함 없음\n\n");
        md.push_str("분석한 이미지에서 특별한 결함이 발견되지 않았습니다.\n");
    } else {
        md.push_str("## 🔍 발견된 결함\n\n");
        let mut idx = 1;
        for verdict in verdicts {
            for defect in &verdict.defects {
                md.push_str(&format!(
                    "{idx}. **{}** ({}) - {}\n",
                    defect.kind,
                    severity_label(defect.severity),
                    defect.location
                ));
                md.push_str(&format!("   - {}\n\n", defect.description));
                idx += 1;
            }
        }
    }

    md.push_str("---\n\n");
    md.push_str("*분석 모델: 내부 비전 검수 모델*\n\n");
    md.push_str(&format!(
        "*분석 일시: {} UTC*\n",
        Utc::now().format("%Y-%m-%d %H:%M:%S")
    ));

    md
}

fn error_markdown(total_images: usize, processed: usize, failed_count: usize, timed_out: bool) -> String {
    let mut md = String::from("# 결함 분석 결과\n\n");
    md.push_str("❌ **분석 실패**: 모든 이미지 분석에 실패했습니다.\n\n");

    if timed_out {
        md.push_str("⚠️ **원인**: 처리 시간 제한 초과\n\n");
    }

    md.push_str("**상태 정보**:\n");
    md.push_str(&format!("- 전체 이미지: {total_images}장\n"));
    md.push_str(&format!("- 처리 시도: {processed}장\n"));
    md.push_str(&format!("- 분석 실패: {failed_count}장\n"));

    let skipped = total_images.saturating_sub(processed);
    if skipped > 0 {
        md.push_str(&format!("- 시간 초과로 미분석: {skipped}장\n"));
    }

    md.push_str("\n**권장 조치**:\n");
    md.push_str("1. 이미지 수를 줄여서 다시 시도해보세요 (권장: 10-20장)\n");
    md.push_str("2. 이미지 파일 크기를 확인해보세요 (권장: 5MB 이하)\n");
    md.push_str("3. 이미지 경로가 올바른지 확인해보세요\n\n");

    md.push_str("---\n\n");
    md.push_str(&format!(
        "*분석 일시: {} UTC*\n",
        Utc::now().format("%Y-%m-%d %H:%M:%S")
    ));
    md
}

#[cfg(test)]
mod tests {
    use super::*;
    use marketplace_protocol::types::{Defect, ImageVerdict};

    fn verdict(condition: Condition, price_adjustment: i32) -> ImageVerdict {
        ImageVerdict {
            image_ref: "img".to_string(),
            defects: Vec::new(),
            condition,
            price_adjustment,
            confidence: 0.9,
        }
    }

    #[test]
    fn empty_verdicts_produce_error_markdown_and_worst_grade() {
        let result = aggregate("p1", None, &[], 5, 5, false);
        assert_eq!(result.condition, Condition::D);
        assert_eq!(result.price_adjustment, -100);
        assert!(result.markdown.contains("분석 실패"));
    }

    #[test]
    fn single_verdict_is_kept_whole() {
        let verdicts = vec![verdict(Condition::A, -5)];
        let result = aggregate("p2", None, &verdicts, 1, 0, false);
        assert_eq!(result.condition, Condition::A);
        assert_eq!(result.price_adjustment, -5);
    }

    #[test]
    fn trims_worst_scoring_outlier_from_ten_verdicts() {
        // 9 verdicts at S (ordinal 0), 1 outlier at D (ordinal 4).
        // keep = floor(10 * 0.7) = 7, all from the S cluster -> aggregated S.
        let mut verdicts: Vec<ImageVerdict> = (0..9).map(|_| verdict(Condition::S, 0)).collect();
        verdicts.push(verdict(Condition::D, -50));

        let result = aggregate("p3", None, &verdicts, 10, 0, false);
        assert_eq!(result.condition, Condition::S);
        assert_eq!(result.price_adjustment, 0);
    }

    #[test]
    fn total_defects_counts_across_all_kept_images() {
        let mut v1 = verdict(Condition::B, -10);
        v1.defects.push(Defect {
            kind: "scratch".to_string(),
            severity: Severity::Low,
            location: "corner".to_string(),
            description: "small".to_string(),
            confidence: 0.8,
        });
        let v2 = verdict(Condition::B, -10);

        let result = aggregate("p4", None, &[v1, v2], 2, 0, false);
        assert_eq!(result.total_defects, 1);
        assert!(result.markdown.contains("발견된 결함"));
    }

    #[test]
    fn timed_out_with_partial_results_notes_skipped_count_in_markdown() {
        let verdicts = vec![verdict(Condition::B, -10)];
        let result = aggregate("p5", None, &verdicts, 10, 1, true);
        assert!(result.markdown.contains("시간 초과로 미분석"));
    }
}
