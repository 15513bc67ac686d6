//! Search AST and predicate evaluation.
//!
//! The query-language parser (out of scope here) produces a boolean tree
//! of literal token-sets combined by AND/OR. [`Matcher`] compiles that tree
//! into a predicate over candidate text. Precedence is already encoded in
//! the tree shape; evaluation recurses without any precedence climbing.

use serde::{Deserialize, Serialize};

/// A boolean search tree over literal token-sets.
///
/// A [`Search::Literal`] with zero tokens is the universal predicate: it
/// matches every candidate, acting as the neutral element for AND and the
/// absorbing element for OR.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Search {
    /// Matches iff every token is a substring of the candidate.
    Literal(Vec<String>),
    /// Short-circuiting conjunction.
    And(Box<Search>, Box<Search>),
    /// Short-circuiting disjunction.
    Or(Box<Search>, Box<Search>),
}

impl Search {
    /// Creates a literal node from a token list.
    #[must_use]
    pub fn literal<I, S>(tokens: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self::Literal(tokens.into_iter().map(Into::into).collect())
    }

    /// Creates the universal predicate (matches everything).
    #[must_use]
    pub fn any() -> Self {
        Self::Literal(Vec::new())
    }

    /// Combines two subtrees with AND.
    #[must_use]
    pub fn and(left: Self, right: Self) -> Self {
        Self::And(Box::new(left), Box::new(right))
    }

    /// Combines two subtrees with OR.
    #[must_use]
    pub fn or(left: Self, right: Self) -> Self {
        Self::Or(Box::new(left), Box::new(right))
    }
}

/// Whether token matching folds case.
///
/// Adapters differ: the container and remote adapters lower-case both
/// sides, the in-memory baseline does not.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CaseSensitivity {
    /// Tokens must match the candidate byte-for-byte.
    Sensitive,
    /// Both sides are lower-cased before matching.
    Insensitive,
}

/// A compiled search predicate.
///
/// # Example
///
/// ```
/// use shared::query::{CaseSensitivity, Matcher, Search};
///
/// let ast = Search::and(
///     Search::literal(["error"]),
///     Search::or(Search::literal(["db"]), Search::literal(["cache"])),
/// );
/// let matcher = Matcher::new(&ast, CaseSensitivity::Insensitive);
///
/// assert!(matcher.matches("ERROR: db connection lost"));
/// assert!(!matcher.matches("error: disk full"));
/// ```
#[derive(Debug, Clone)]
pub struct Matcher {
    ast: Search,
    case: CaseSensitivity,
}

impl Matcher {
    /// Compiles a search tree into a predicate.
    ///
    /// Tokens are case-folded once at compile time when matching is
    /// insensitive.
    #[must_use]
    pub fn new(ast: &Search, case: CaseSensitivity) -> Self {
        let ast = match case {
            CaseSensitivity::Sensitive => ast.clone(),
            CaseSensitivity::Insensitive => fold_tokens(ast),
        };
        Self { ast, case }
    }

    /// Evaluates the predicate against a candidate line or field.
    #[must_use]
    pub fn matches(&self, candidate: &str) -> bool {
        match self.case {
            CaseSensitivity::Sensitive => evaluate(&self.ast, candidate),
            CaseSensitivity::Insensitive => evaluate(&self.ast, &candidate.to_lowercase()),
        }
    }
}

/// Lower-cases every literal token in the tree.
fn fold_tokens(ast: &Search) -> Search {
    match ast {
        Search::Literal(tokens) => {
            Search::Literal(tokens.iter().map(|t| t.to_lowercase()).collect())
        }
        Search::And(left, right) => Search::and(fold_tokens(left), fold_tokens(right)),
        Search::Or(left, right) => Search::or(fold_tokens(left), fold_tokens(right)),
    }
}

fn evaluate(ast: &Search, candidate: &str) -> bool {
    match ast {
        // Zero tokens: the universal predicate, true for every candidate.
        Search::Literal(tokens) => tokens.iter().all(|token| candidate.contains(token.as_str())),
        Search::And(left, right) => evaluate(left, candidate) && evaluate(right, candidate),
        Search::Or(left, right) => evaluate(left, candidate) || evaluate(right, candidate),
    }
}
