//! Compiled query matcher.

use std::cell::OnceCell;
use std::collections::BTreeSet;

use crate::error::Result;
use crate::storage::StoredRecord;
use crate::types::PathRecord;

use super::expression::{lowercase_query_node, MatchTarget, QueryNode, Term};
use super::parser::QueryParser;
use super::text_match::{contains_literal, leading_literal, literal_chunks, wildcard_matches};

/// Lower-cased name text usable for names-index lookups and ranking.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct NameNeedle {
    pub text: String,
    /// A record named exactly `text` ranks as an exact match.
    pub allow_exact: bool,
}

/// An immutable compiled form of one raw search string.
#[derive(Debug, Clone)]
pub struct CompiledQuery {
    raw: String,
    root: QueryNode,
    case_sensitive: bool,
    needles: Vec<NameNeedle>,
}

impl CompiledQuery {
    /// Compiles a raw query string.
    ///
    /// The compilation pipeline:
    /// 1. Tokenize and parse into an `And` of conjuncts
    /// 2. Lowercase every term unless matching is case sensitive
    /// 3. Derive name needles for index lookups and ranking
    pub fn compile(raw: &str, case_sensitive: bool) -> Result<Self> {
        let parsed = QueryParser::parse(raw)?;
        let root = if case_sensitive {
            parsed
        } else {
            lowercase_query_node(parsed)
        };

        let mut needles = Vec::new();
        if let QueryNode::And(parts) = &root {
            for part in parts {
                collect_needles(part, &mut needles);
            }
        }
        needles.dedup();

        Ok(Self {
            raw: raw.to_string(),
            root,
            case_sensitive,
            needles,
        })
    }

    pub fn raw(&self) -> &str {
        &self.raw
    }

    /// The top-level `And` node.
    pub fn root(&self) -> &QueryNode {
        &self.root
    }

    /// Top-level conjuncts in source order.
    pub fn conjuncts(&self) -> &[QueryNode] {
        match &self.root {
            QueryNode::And(parts) => parts,
            _ => std::slice::from_ref(&self.root),
        }
    }

    pub fn case_sensitive(&self) -> bool {
        self.case_sensitive
    }

    /// True for a query without terms, which matches every record.
    pub fn is_empty(&self) -> bool {
        !self.root.has_terms()
    }

    pub(crate) fn name_needles(&self) -> &[NameNeedle] {
        &self.needles
    }

    /// Checks a record against the predicate tree.
    pub fn matches_record(&self, record: &PathRecord) -> bool {
        if self.case_sensitive {
            return self.matches_subject(&MatchSubject::new(&record.name, &record.full_path, true));
        }
        let name_lower = record.name.to_lowercase();
        self.matches_subject(&MatchSubject::new(&name_lower, &record.full_path, false))
    }

    pub(crate) fn matches_stored(&self, stored: &StoredRecord) -> bool {
        let record = stored.record();
        let name = if self.case_sensitive {
            record.name.as_str()
        } else {
            stored.name_lower()
        };
        self.matches_subject(&MatchSubject::new(name, &record.full_path, self.case_sensitive))
    }

    fn matches_subject(&self, subject: &MatchSubject) -> bool {
        evaluate_node(&self.root, subject)
    }

    /// Returns terms that should be highlighted in search results.
    ///
    /// Literal chunks of every positive term, sorted and deduplicated.
    pub fn highlight_terms(&self) -> Vec<String> {
        let mut terms = BTreeSet::new();
        collect_highlights(&self.root, &mut terms);
        terms.into_iter().collect()
    }
}

struct MatchSubject<'a> {
    name: &'a str,
    full_path: &'a str,
    case_sensitive: bool,
    lowered_path: OnceCell<String>,
}

impl<'a> MatchSubject<'a> {
    fn new(name: &'a str, full_path: &'a str, case_sensitive: bool) -> Self {
        Self {
            name,
            full_path,
            case_sensitive,
            lowered_path: OnceCell::new(),
        }
    }

    fn target(&self, target: MatchTarget) -> &str {
        match target {
            MatchTarget::Name => self.name,
            MatchTarget::FullPath if self.case_sensitive => self.full_path,
            MatchTarget::FullPath => self
                .lowered_path
                .get_or_init(|| self.full_path.to_lowercase()),
        }
    }
}

fn evaluate_node(node: &QueryNode, subject: &MatchSubject) -> bool {
    match node {
        QueryNode::Literal(term) => {
            let haystack = subject.target(term.target);
            if term.anchored {
                haystack == term.text
            } else {
                contains_literal(haystack, &term.text)
            }
        }
        QueryNode::Wildcard(term) => wildcard_matches(&term.text, subject.target(term.target)),
        QueryNode::Not(inner) => !evaluate_node(inner, subject),
        QueryNode::Or(parts) => parts.iter().any(|part| evaluate_node(part, subject)),
        QueryNode::And(parts) => parts.iter().all(|part| evaluate_node(part, subject)),
    }
}

fn collect_needles(node: &QueryNode, needles: &mut Vec<NameNeedle>) {
    let name_term = |term: &Term| term.target == MatchTarget::Name;
    match node {
        QueryNode::Literal(term) if name_term(term) && !term.text.is_empty() => {
            needles.push(NameNeedle {
                text: term.text.to_lowercase(),
                allow_exact: true,
            });
        }
        QueryNode::Wildcard(term) if name_term(term) => {
            let leading = leading_literal(&term.text);
            if !leading.is_empty() {
                needles.push(NameNeedle {
                    text: leading.to_lowercase(),
                    allow_exact: false,
                });
            }
        }
        QueryNode::Or(parts) => {
            for part in parts {
                collect_needles(part, needles);
            }
        }
        _ => {}
    }
}

fn collect_highlights(node: &QueryNode, terms: &mut BTreeSet<String>) {
    match node {
        QueryNode::Literal(term) | QueryNode::Wildcard(term) => {
            for chunk in literal_chunks(&term.text) {
                let chunk = match term.target {
                    MatchTarget::Name => chunk,
                    MatchTarget::FullPath => chunk.rsplit('/').next().unwrap_or(chunk),
                };
                if !chunk.is_empty() {
                    terms.insert(chunk.to_lowercase());
                }
            }
        }
        QueryNode::Not(_) => {}
        QueryNode::Or(parts) | QueryNode::And(parts) => {
            for part in parts {
                collect_highlights(part, terms);
            }
        }
    }
}
