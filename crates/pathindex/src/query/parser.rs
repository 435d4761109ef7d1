//! Query parser and tokenizer.
//!
//! Grammar, loosest binding first:
//! - whitespace separated groups are ANDed
//! - `|` joins adjacent words into an OR group
//! - a leading `-` or `!` negates the single word it is attached to
//! - `"..."` quotes a segment so whitespace and `|` stay literal; quotes
//!   may appear anywhere in a word and `\"` / `\\` escape inside words
//!
//! Every input compiles except one with an unterminated quote.

use crate::error::QuerySyntaxError;

use super::expression::{QueryNode, Term};
use super::text_match::has_wildcards;

// ---------------------------------------------------------------------------
// Token types
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq)]
enum QueryToken {
    Word(WordToken),
    Pipe,
}

/// One whitespace-delimited word after quote and escape processing.
#[derive(Debug, Clone, PartialEq, Eq)]
struct WordToken {
    text: String,
    negated: bool,
}

// ---------------------------------------------------------------------------
// Query parser
// ---------------------------------------------------------------------------

pub struct QueryParser {
    tokens: Vec<QueryToken>,
    index: usize,
}

impl QueryParser {
    /// Parses `input` into a top-level `And` node.
    pub fn parse(input: &str) -> Result<QueryNode, QuerySyntaxError> {
        let tokens = tokenize_query_input(input)?;
        let mut parser = Self { tokens, index: 0 };

        let mut conjuncts = Vec::new();
        while let Some(group) = parser.next_group() {
            parser.push_group(group, &mut conjuncts);
        }
        Ok(QueryNode::And(conjuncts))
    }

    /// Collects the next run of words joined by `|`.
    fn next_group(&mut self) -> Option<Vec<WordToken>> {
        while self.peek_is_pipe() {
            self.index += 1;
        }
        let mut group = vec![self.next_word()?];
        loop {
            if !self.peek_is_pipe() {
                break;
            }
            while self.peek_is_pipe() {
                self.index += 1;
            }
            match self.next_word() {
                Some(word) => group.push(word),
                None => break,
            }
        }
        Some(group)
    }

    fn push_group(&self, group: Vec<WordToken>, conjuncts: &mut Vec<QueryNode>) {
        let (negated, positive): (Vec<_>, Vec<_>) = group
            .into_iter()
            .filter(|word| !word.text.is_empty())
            .partition(|word| word.negated);

        // Negation binds to its own word, even inside a group.
        for word in negated {
            conjuncts.push(QueryNode::Not(Box::new(word_node(word.text, false))));
        }

        match positive.len() {
            0 => {}
            1 => {
                if let Some(word) = positive.into_iter().next() {
                    conjuncts.push(word_node(word.text, false));
                }
            }
            _ => conjuncts.push(QueryNode::Or(
                positive
                    .into_iter()
                    .map(|word| word_node(word.text, true))
                    .collect(),
            )),
        }
    }

    fn peek_is_pipe(&self) -> bool {
        matches!(self.tokens.get(self.index), Some(QueryToken::Pipe))
    }

    fn next_word(&mut self) -> Option<WordToken> {
        match self.tokens.get(self.index) {
            Some(QueryToken::Word(word)) => {
                let word = word.clone();
                self.index += 1;
                Some(word)
            }
            _ => None,
        }
    }
}

/// Builds the leaf for one word. `anchored` is set for OR alternatives.
fn word_node(text: String, anchored: bool) -> QueryNode {
    if has_wildcards(&text) {
        QueryNode::Wildcard(Term::new(text).anchored())
    } else if anchored {
        QueryNode::Literal(Term::new(text).anchored())
    } else {
        QueryNode::Literal(Term::new(text))
    }
}

// ---------------------------------------------------------------------------
// Tokenizer
// ---------------------------------------------------------------------------

#[derive(Default)]
struct WordBuilder {
    started: bool,
    text: String,
    negated: bool,
}

impl WordBuilder {
    fn begin(&mut self) {
        self.started = true;
    }

    fn push(&mut self, ch: char) {
        self.started = true;
        self.text.push(ch);
    }

    fn finish(&mut self, tokens: &mut Vec<QueryToken>) {
        if !std::mem::take(&mut self.started) {
            return;
        }
        tokens.push(QueryToken::Word(WordToken {
            text: std::mem::take(&mut self.text),
            negated: std::mem::take(&mut self.negated),
        }));
    }
}

fn tokenize_query_input(input: &str) -> Result<Vec<QueryToken>, QuerySyntaxError> {
    let mut tokens = Vec::new();
    let mut word = WordBuilder::default();
    let mut open_quote: Option<usize> = None;
    let mut chars = input.char_indices().peekable();

    while let Some((position, ch)) = chars.next() {
        if ch == '\\' {
            if let Some(&(_, escaped @ ('"' | '\\'))) = chars.peek() {
                chars.next();
                word.push(escaped);
                continue;
            }
        }

        if open_quote.is_some() {
            if ch == '"' {
                open_quote = None;
            } else {
                word.push(ch);
            }
            continue;
        }

        match ch {
            '"' => {
                word.begin();
                open_quote = Some(position);
            }
            '|' => {
                word.finish(&mut tokens);
                tokens.push(QueryToken::Pipe);
            }
            '-' | '!' if !word.started => {
                let attaches = chars
                    .peek()
                    .is_some_and(|&(_, next)| !next.is_whitespace() && next != '|');
                if attaches {
                    word.begin();
                    word.negated = true;
                } else {
                    word.push(ch);
                }
            }
            _ if ch.is_whitespace() => word.finish(&mut tokens),
            _ => word.push(ch),
        }
    }

    if let Some(position) = open_quote {
        return Err(QuerySyntaxError { position });
    }
    word.finish(&mut tokens);
    Ok(tokens)
}
