//! Refinement detection for incremental search.
//!
//! `next` refines `prev` when every record matching `next` is guaranteed to
//! match `prev`, so `next` may be evaluated over `prev`'s results instead
//! of the whole store. Appending characters alone does not guarantee this
//! (an OR alternative or a negated term can widen), so the check is
//! structural: conjuncts of `prev` must reappear in `next`, each equal or a
//! longer positive substring literal.

use super::expression::QueryNode;
use super::matcher::CompiledQuery;

/// True if `next` extends `prev` by appended characters and can only narrow it.
pub fn is_refinement(prev: &CompiledQuery, next: &CompiledQuery) -> bool {
    if prev.case_sensitive() != next.case_sensitive() {
        return false;
    }
    if next.raw().len() <= prev.raw().len() || !next.raw().starts_with(prev.raw()) {
        return false;
    }

    let before = prev.conjuncts();
    let after = next.conjuncts();
    before.len() <= after.len()
        && before
            .iter()
            .zip(after)
            .all(|(old, new)| conjunct_narrows(old, new))
}

fn conjunct_narrows(old: &QueryNode, new: &QueryNode) -> bool {
    if old == new {
        return true;
    }
    match (old, new) {
        (QueryNode::Literal(old), QueryNode::Literal(new)) => {
            !old.anchored
                && !new.anchored
                && old.target == new.target
                && new.text.contains(old.text.as_str())
        }
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn refines(prev: &str, next: &str) -> bool {
        let prev = CompiledQuery::compile(prev, false).expect("compile prev");
        let next = CompiledQuery::compile(next, false).expect("compile next");
        is_refinement(&prev, &next)
    }

    #[test]
    fn appended_literal_characters_refine() {
        assert!(refines("rep", "repo"));
        assert!(refines("rep", "rep csv"));
        assert!(refines("report -draft", "report -draft x"));
        assert!(refines("", "a"));
        assert!(refines("ab", "ab "));
    }

    #[test]
    fn edits_that_can_widen_do_not_refine() {
        assert!(!refines("repo", "rep"));
        assert!(!refines("rep", "rop"));
        assert!(!refines("a -b", "a -bc"));
        assert!(!refines("a", "a|b"));
        assert!(!refines("a|b", "a|bc"));
        assert!(!refines("*.c", "*.cs"));
        assert!(!refines("report -", "report -d"));
        assert!(!refines("same", "same"));
    }

    #[test]
    fn case_mode_change_does_not_refine() {
        let prev = CompiledQuery::compile("a", false).expect("compile");
        let next = CompiledQuery::compile("ab", true).expect("compile");
        assert!(!is_refinement(&prev, &next));
    }
}
