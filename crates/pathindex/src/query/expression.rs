//! Predicate tree types.

/// What a term is matched against.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MatchTarget {
    /// The record's base name.
    Name,
    /// The record's full path (term contains a path separator).
    FullPath,
}

/// A single match term (leaf of the tree).
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Term {
    pub text: String,
    pub target: MatchTarget,
    /// Must match the whole target instead of a substring.
    pub anchored: bool,
}

impl Term {
    pub fn new(text: impl Into<String>) -> Self {
        let text = text.into();
        let target = if text.contains('/') {
            MatchTarget::FullPath
        } else {
            MatchTarget::Name
        };
        Self {
            text,
            target,
            anchored: false,
        }
    }

    pub fn anchored(mut self) -> Self {
        self.anchored = true;
        self
    }
}

/// A compiled predicate tree node.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum QueryNode {
    Literal(Term),
    /// `*`/`?` pattern, always anchored to the whole target.
    Wildcard(Term),
    Not(Box<QueryNode>),
    Or(Vec<QueryNode>),
    And(Vec<QueryNode>),
}

impl QueryNode {
    /// Checks if the node contains at least one term.
    pub fn has_terms(&self) -> bool {
        match self {
            Self::Literal(_) | Self::Wildcard(_) => true,
            Self::Not(inner) => inner.has_terms(),
            Self::And(parts) | Self::Or(parts) => parts.iter().any(Self::has_terms),
        }
    }
}

/// Converts the entire tree to lowercase for case-insensitive matching.
pub fn lowercase_query_node(node: QueryNode) -> QueryNode {
    let lower = |term: Term| Term {
        text: term.text.to_lowercase(),
        ..term
    };
    match node {
        QueryNode::Literal(term) => QueryNode::Literal(lower(term)),
        QueryNode::Wildcard(term) => QueryNode::Wildcard(lower(term)),
        QueryNode::Not(inner) => QueryNode::Not(Box::new(lowercase_query_node(*inner))),
        QueryNode::Or(parts) => {
            QueryNode::Or(parts.into_iter().map(lowercase_query_node).collect())
        }
        QueryNode::And(parts) => {
            QueryNode::And(parts.into_iter().map(lowercase_query_node).collect())
        }
    }
}
