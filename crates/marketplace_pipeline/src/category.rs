//! Infers an item-category hint for the analyzer's prompt from the product
//! name, rather than sending the same literal category for every product.
//!
//! The original pipeline had this helper sitting unused next to a call site
//! that passed a hardcoded literal instead; wiring it in gives the model a
//! better prior on what it's inspecting without changing the request shape.

/// Keyword -> category table, checked in order; the first match wins. Falls
/// back to a generic "물품" (item/goods) category when nothing matches or no
/// product name was supplied.
const CATEGORY_KEYWORDS: &[(&[&str], &str)] = &[
    (&["신발", "운동화", "스니커즈", "shoe", "sneaker"], "신발"),
    (&["가방", "백팩", "핸드백", "bag", "backpack"], "가방"),
    (&["시계", "워치", "watch"], "시계"),
    (&["의류", "셔츠", "자켓", "코트", "바지", "원피스", "shirt", "jacket", "coat"], "의류"),
    (&["가전", "냉장고", "세탁기", "전자레인지", "appliance"], "가전제품"),
    (&["가구", "소파", "책상", "의자", "furniture", "sofa", "desk", "chair"], "가구"),
    (&["전자기기", "노트북", "카메라", "laptop", "camera", "electronics"], "전자기기"),
];

/// Default category sent when the product name doesn't match any known
/// keyword, matching the literal the original call site always used.
pub const DEFAULT_CATEGORY: &str = "물품";

/// Infer a category hint for the analyzer from an optional product name.
pub fn infer_category(product_name: Option<&str>) -> String {
    let Some(name) = product_name else {
        return DEFAULT_CATEGORY.to_string();
    };
    let lower = name.to_lowercase();
    for (keywords, category) in CATEGORY_KEYWORDS {
        if keywords.iter().any(|kw| lower.contains(&kw.to_lowercase())) {
            return category.to_string();
        }
    }
    DEFAULT_CATEGORY.to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn matches_known_keyword() {
        assert_eq!(infer_category(Some("나이키 에어포스 운동화")), "신발");
        assert_eq!(infer_category(Some("Leather Backpack")), "가방");
    }

    #[test]
    fn falls_back_to_default_on_no_match() {
        assert_eq!(infer_category(Some("미스터리 물건")), DEFAULT_CATEGORY);
    }

    #[test]
    fn falls_back_to_default_when_name_absent() {
        assert_eq!(infer_category(None), DEFAULT_CATEGORY);
    }

    #[test]
    fn matching_is_case_insensitive() {
        assert_eq!(infer_category(Some("NIKE SNEAKER")), "신발");
    }
}
