//! Formula groups and rules for calculated nodes.
//!
//! A rule assigns an expression over other node identifiers to a target
//! node, with a precedence tier controlling evaluation order. Terms are
//! tagged at definition time: a referenced node is either a raw-mapping
//! aggregate or a reference to another calculated node, so the dependency
//! graph can be checked before any evaluation runs.

use std::fmt;
use std::sync::OnceLock;

use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::domain::entities::NodeId;
use crate::domain::error::DomainError;

/// Arithmetic operator between two formula terms.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FormulaOp {
    Add,
    Subtract,
    Multiply,
    Divide,
}

impl FormulaOp {
    fn from_token(token: &str) -> Option<Self> {
        match token {
            "+" => Some(Self::Add),
            "-" | "\u{2212}" => Some(Self::Subtract),
            "*" | "\u{00d7}" => Some(Self::Multiply),
            "/" | "\u{00f7}" => Some(Self::Divide),
            _ => None,
        }
    }
}

impl fmt::Display for FormulaOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let sym = match self {
            Self::Add => "+",
            Self::Subtract => "-",
            Self::Multiply => "*",
            Self::Divide => "/",
        };
        write!(f, "{sym}")
    }
}

/// Tagged operand of a formula expression.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum FormulaTerm {
    /// Rollup of raw mapping values over the node's subtree.
    Aggregate(NodeId),
    /// Value of another calculated node.
    Reference(NodeId),
    /// Literal operand.
    Constant(f64),
}

impl FormulaTerm {
    /// The node this term reads from, if any.
    pub fn node(&self) -> Option<&NodeId> {
        match self {
            Self::Aggregate(id) | Self::Reference(id) => Some(id),
            Self::Constant(_) => None,
        }
    }
}

/// Untyped operand as parsed from text, before tagging against the store.
#[derive(Debug, Clone, PartialEq)]
pub enum RawTerm {
    Identifier(String),
    Constant(f64),
}

/// Left-associative chain of terms: `first (op term)*`.
#[derive(Debug, Clone, PartialEq)]
pub struct RawExpr {
    pub first: RawTerm,
    pub rest: Vec<(FormulaOp, RawTerm)>,
}

fn token_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"[A-Za-z_][A-Za-z0-9_]*|\d+(?:\.\d+)?|[+\-*/\u{2212}\u{00d7}\u{00f7}]")
            .expect("token regex is valid")
    })
}

impl RawExpr {
    /// Parse an expression such as `REVENUE - COGS` or `GROSS_PROFIT / 100`.
    ///
    /// Grammar: `term (op term)*` where a term is a node identifier or a
    /// numeric literal. Unicode minus/times/divide signs are accepted.
    pub fn parse(input: &str) -> Result<Self, DomainError> {
        let invalid = |reason: &str| DomainError::InvalidExpression {
            expr: input.to_string(),
            reason: reason.to_string(),
        };

        // Reject any character the tokenizer would silently skip.
        let mut residue = input.to_string();
        for m in token_regex().find_iter(input) {
            residue = residue.replacen(m.as_str(), " ", 1);
        }
        if !residue.trim().is_empty() {
            return Err(invalid(&format!(
                "unexpected characters: '{}'",
                residue.trim()
            )));
        }

        let tokens: Vec<&str> = token_regex()
            .find_iter(input)
            .map(|m| m.as_str())
            .collect();
        if tokens.is_empty() {
            return Err(invalid("empty expression"));
        }

        let mut iter = tokens.into_iter();
        let first = Self::parse_term(iter.next().ok_or_else(|| invalid("empty expression"))?)
            .ok_or_else(|| invalid("expression must start with a term"))?;

        let mut rest = Vec::new();
        loop {
            let Some(op_token) = iter.next() else { break };
            let op = FormulaOp::from_token(op_token)
                .ok_or_else(|| invalid(&format!("expected operator, found '{op_token}'")))?;
            let term_token = iter
                .next()
                .ok_or_else(|| invalid("expression ends with a dangling operator"))?;
            let term = Self::parse_term(term_token)
                .ok_or_else(|| invalid(&format!("expected term, found '{term_token}'")))?;
            rest.push((op, term));
        }

        Ok(Self { first, rest })
    }

    fn parse_term(token: &str) -> Option<RawTerm> {
        if FormulaOp::from_token(token).is_some() {
            return None;
        }
        if token.starts_with(|c: char| c.is_ascii_digit()) {
            return token.parse::<f64>().ok().map(RawTerm::Constant);
        }
        Some(RawTerm::Identifier(token.to_string()))
    }
}

/// One tagged, validated formula expression.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FormulaExpr {
    pub first: FormulaTerm,
    pub rest: Vec<(FormulaOp, FormulaTerm)>,
}

impl FormulaExpr {
    /// All node ids this expression reads from.
    pub fn referenced_nodes(&self) -> impl Iterator<Item = &NodeId> {
        std::iter::once(&self.first)
            .chain(self.rest.iter().map(|(_, term)| term))
            .filter_map(FormulaTerm::node)
    }
}

impl fmt::Display for FormulaExpr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let write_term = |f: &mut fmt::Formatter<'_>, term: &FormulaTerm| match term {
            FormulaTerm::Aggregate(id) | FormulaTerm::Reference(id) => write!(f, "{id}"),
            FormulaTerm::Constant(value) => write!(f, "{value}"),
        };
        write_term(f, &self.first)?;
        for (op, term) in &self.rest {
            write!(f, " {op} ")?;
            write_term(f, term)?;
        }
        Ok(())
    }
}

/// A rule assigning a calculated value to a target node.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FormulaRule {
    pub target: NodeId,
    /// Evaluation order class, 1 = first. Lower tiers are finalized
    /// before higher tiers start.
    pub tier: u8,
    pub expr: FormulaExpr,
}

/// Named, ordered list of formula rules.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FormulaGroup {
    pub name: String,
    pub rules: Vec<FormulaRule>,
}

impl FormulaGroup {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            rules: Vec::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn given_binary_expression_when_parsing_then_yields_terms_and_op() {
        let expr = RawExpr::parse("REVENUE - COGS").unwrap();
        assert_eq!(expr.first, RawTerm::Identifier("REVENUE".to_string()));
        assert_eq!(
            expr.rest,
            vec![(FormulaOp::Subtract, RawTerm::Identifier("COGS".to_string()))]
        );
    }

    #[test]
    fn given_unicode_operators_when_parsing_then_accepted() {
        let expr = RawExpr::parse("A \u{00d7} B \u{00f7} 100").unwrap();
        assert_eq!(expr.rest.len(), 2);
        assert_eq!(expr.rest[0].0, FormulaOp::Multiply);
        assert_eq!(expr.rest[1].0, FormulaOp::Divide);
        assert_eq!(expr.rest[1].1, RawTerm::Constant(100.0));
    }

    #[test]
    fn given_dangling_operator_when_parsing_then_errors() {
        let result = RawExpr::parse("REVENUE -");
        assert!(matches!(
            result,
            Err(DomainError::InvalidExpression { .. })
        ));
    }

    #[test]
    fn given_stray_characters_when_parsing_then_errors() {
        let result = RawExpr::parse("REVENUE ? COGS");
        assert!(matches!(
            result,
            Err(DomainError::InvalidExpression { .. })
        ));
    }

    #[test]
    fn given_two_identifiers_without_operator_when_parsing_then_errors() {
        let result = RawExpr::parse("REVENUE COGS");
        assert!(matches!(
            result,
            Err(DomainError::InvalidExpression { .. })
        ));
    }
}
