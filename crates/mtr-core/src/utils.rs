//! 通用工具函数

/// 规范化临床术语：去除首尾空白并转为小写
pub fn normalize_term(term: &str) -> String {
    term.trim().to_lowercase()
}

/// 不区分大小写的子串匹配，空的待匹配项永远不匹配
pub fn contains_term(haystack: &str, needle: &str) -> bool {
    let needle = normalize_term(needle);
    if needle.is_empty() {
        return false;
    }
    normalize_term(haystack).contains(&needle)
}

/// 双向子串匹配，用于患者自由文本与知识表条目的比对
pub fn terms_overlap(a: &str, b: &str) -> bool {
    contains_term(a, b) || contains_term(b, a)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_contains_term_is_case_insensitive() {
        assert!(contains_term("Amoxicillin 500mg", "AMOXICILLIN"));
        assert!(!contains_term("Amoxicillin 500mg", "penicillin"));
    }

    #[test]
    fn test_empty_needle_never_matches() {
        assert!(!contains_term("Warfarin", ""));
        assert!(!contains_term("Warfarin", "   "));
        assert!(!terms_overlap("", "asthma"));
    }

    #[test]
    fn test_terms_overlap_both_directions() {
        assert!(terms_overlap("chronic kidney disease", "kidney disease"));
        assert!(terms_overlap("asthma", "Severe asthma"));
    }
}
