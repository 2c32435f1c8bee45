//! Predicate expressions over composed world state.
//!
//! ```text
//! expr  := and ('||' and)*
//! and   := unary ('&&' unary)*
//! unary := '!' unary | '(' expr ')' | cmp | 'true' | 'false'
//! cmp   := term op number
//! term  := ('count' | 'value') '(' name ',' name ')'
//! op    := '>=' | '>' | '<=' | '<' | '==' | '!='
//! name  := identifier | "quoted string"
//! ```

use std::collections::BTreeSet;
use std::fmt;
use std::sync::OnceLock;

use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::error::ConfigError;
use crate::types::RelationName;
use crate::views::ViewReader;

const TOKEN_PATTERN: &str = r#"^\s*(?:(?P<op>&&|\|\||>=|<=|==|!=|>|<|!|\(|\)|,)|(?P<num>-?\d+(?:\.\d+)?)|(?P<str>"(?:[^"\\]|\\.)*")|(?P<ident>[A-Za-z_][A-Za-z0-9_.:\-]*))"#;

static TOKEN_REGEX: OnceLock<Result<Regex, regex::Error>> = OnceLock::new();

fn malformed(position: usize, reason: impl Into<String>) -> ConfigError {
    ConfigError::MalformedPredicate {
        position,
        reason: reason.into(),
    }
}

#[derive(Debug, Clone, PartialEq)]
enum Tok {
    Op(&'static str),
    Num(f64),
    Str(String),
    Ident(String),
    End,
}

const OPS: [&str; 12] = ["&&", "||", ">=", "<=", "==", "!=", ">", "<", "!", "(", ")", ","];

fn tokenize(src: &str) -> Result<Vec<(usize, Tok)>, ConfigError> {
    let re = TOKEN_REGEX
        .get_or_init(|| Regex::new(TOKEN_PATTERN))
        .as_ref()
        .map_err(|e| malformed(0, format!("tokenizer unavailable: {e}")))?;

    let mut out = Vec::new();
    let mut pos = 0;
    loop {
        let rest = &src[pos..];
        if rest.trim().is_empty() {
            out.push((src.len(), Tok::End));
            return Ok(out);
        }
        let caps = re
            .captures(rest)
            .ok_or_else(|| malformed(pos + (rest.len() - rest.trim_start().len()), "unexpected character"))?;
        let whole = caps.get(0).map_or(0, |m| m.end());

        let (start, tok) = if let Some(m) = caps.name("op") {
            let op = OPS
                .iter()
                .find(|o| **o == m.as_str())
                .copied()
                .ok_or_else(|| malformed(pos + m.start(), "unknown operator"))?;
            (m.start(), Tok::Op(op))
        } else if let Some(m) = caps.name("num") {
            let n: f64 = m
                .as_str()
                .parse()
                .map_err(|_| malformed(pos + m.start(), "invalid number"))?;
            (m.start(), Tok::Num(n))
        } else if let Some(m) = caps.name("str") {
            let raw = m.as_str();
            let inner = raw[1..raw.len() - 1].replace("\\\"", "\"").replace("\\\\", "\\");
            (m.start(), Tok::Str(inner))
        } else if let Some(m) = caps.name("ident") {
            (m.start(), Tok::Ident(m.as_str().to_string()))
        } else {
            return Err(malformed(pos, "unexpected input"));
        };

        out.push((pos + start, tok));
        pos += whole;
    }
}

/// Quantity read from one (relation, key) cell.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Term {
    /// Accumulated multiplicity.
    Count {
        /// Relation read.
        relation: RelationName,
        /// Key read.
        key: String,
    },
    /// Accumulated numeric value.
    Value {
        /// Relation read.
        relation: RelationName,
        /// Key read.
        key: String,
    },
}

impl Term {
    /// The (relation, key) cell this term reads.
    #[must_use]
    pub fn cell(&self) -> (&RelationName, &str) {
        match self {
            Self::Count { relation, key } | Self::Value { relation, key } => (relation, key),
        }
    }

    fn eval(&self, reader: &dyn ViewReader) -> f64 {
        match self {
            #[allow(clippy::cast_precision_loss)]
            Self::Count { relation, key } => reader.read(relation, key).count() as f64,
            Self::Value { relation, key } => reader.read(relation, key).value(),
        }
    }
}

impl fmt::Display for Term {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Count { relation, key } => write!(f, "count({relation}, {key})"),
            Self::Value { relation, key } => write!(f, "value({relation}, {key})"),
        }
    }
}

/// Comparison operator.
#[allow(missing_docs)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CmpOp {
    Ge,
    Gt,
    Le,
    Lt,
    Eq,
    Ne,
}

impl CmpOp {
    fn from_token(op: &str) -> Option<Self> {
        Some(match op {
            ">=" => Self::Ge,
            ">" => Self::Gt,
            "<=" => Self::Le,
            "<" => Self::Lt,
            "==" => Self::Eq,
            "!=" => Self::Ne,
            _ => return None,
        })
    }

    fn apply(self, lhs: f64, rhs: f64) -> bool {
        const EPS: f64 = 1e-9;
        match self {
            Self::Ge => lhs >= rhs - EPS,
            Self::Gt => lhs > rhs + EPS,
            Self::Le => lhs <= rhs + EPS,
            Self::Lt => lhs < rhs - EPS,
            Self::Eq => (lhs - rhs).abs() <= EPS,
            Self::Ne => (lhs - rhs).abs() > EPS,
        }
    }

    const fn symbol(self) -> &'static str {
        match self {
            Self::Ge => ">=",
            Self::Gt => ">",
            Self::Le => "<=",
            Self::Lt => "<",
            Self::Eq => "==",
            Self::Ne => "!=",
        }
    }
}

/// Compiled expression tree.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "node", rename_all = "snake_case")]
pub enum Expr {
    /// Literal.
    Const {
        /// Literal value.
        value: bool,
    },
    /// `term op rhs`.
    Cmp {
        /// Left-hand side.
        term: Term,
        /// Operator.
        op: CmpOp,
        /// Right-hand side.
        rhs: f64,
    },
    /// Negation.
    Not {
        /// Negated expression.
        inner: Box<Expr>,
    },
    /// Conjunction.
    And {
        /// Operands.
        all: Vec<Expr>,
    },
    /// Disjunction.
    Or {
        /// Operands.
        any: Vec<Expr>,
    },
}

impl Expr {
    /// Evaluate against a reader.
    #[must_use]
    pub fn eval(&self, reader: &dyn ViewReader) -> bool {
        match self {
            Self::Const { value } => *value,
            Self::Cmp { term, op, rhs } => op.apply(term.eval(reader), *rhs),
            Self::Not { inner } => !inner.eval(reader),
            Self::And { all } => all.iter().all(|e| e.eval(reader)),
            Self::Or { any } => any.iter().any(|e| e.eval(reader)),
        }
    }

    fn collect_terms<'a>(&'a self, out: &mut Vec<&'a Term>) {
        match self {
            Self::Const { .. } => {}
            Self::Cmp { term, .. } => out.push(term),
            Self::Not { inner } => inner.collect_terms(out),
            Self::And { all: xs } | Self::Or { any: xs } => {
                for x in xs {
                    x.collect_terms(out);
                }
            }
        }
    }
}

impl fmt::Display for Expr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Const { value } => write!(f, "{value}"),
            Self::Cmp { term, op, rhs } => write!(f, "{term} {} {rhs}", op.symbol()),
            Self::Not { inner } => write!(f, "!({inner})"),
            Self::And { all } => join(f, all, " && "),
            Self::Or { any } => join(f, any, " || "),
        }
    }
}

fn join(f: &mut fmt::Formatter<'_>, xs: &[Expr], sep: &str) -> fmt::Result {
    write!(f, "(")?;
    for (i, x) in xs.iter().enumerate() {
        if i > 0 {
            write!(f, "{sep}")?;
        }
        write!(f, "{x}")?;
    }
    write!(f, ")")
}

struct Parser {
    toks: Vec<(usize, Tok)>,
    idx: usize,
}

impl Parser {
    fn peek(&self) -> &Tok {
        self.toks.get(self.idx).map_or(&Tok::End, |(_, t)| t)
    }

    fn pos(&self) -> usize {
        self.toks.get(self.idx).map_or(0, |(p, _)| *p)
    }

    fn bump(&mut self) -> Tok {
        let tok = self.peek().clone();
        if self.idx < self.toks.len() {
            self.idx += 1;
        }
        tok
    }

    fn eat_op(&mut self, op: &str) -> bool {
        if matches!(self.peek(), Tok::Op(o) if *o == op) {
            self.idx += 1;
            true
        } else {
            false
        }
    }

    fn expect_op(&mut self, op: &str) -> Result<(), ConfigError> {
        if self.eat_op(op) {
            Ok(())
        } else {
            Err(malformed(self.pos(), format!("expected '{op}'")))
        }
    }

    fn expr(&mut self) -> Result<Expr, ConfigError> {
        let mut any = vec![self.and()?];
        while self.eat_op("||") {
            any.push(self.and()?);
        }
        Ok(if any.len() == 1 { any.remove(0) } else { Expr::Or { any } })
    }

    fn and(&mut self) -> Result<Expr, ConfigError> {
        let mut all = vec![self.unary()?];
        while self.eat_op("&&") {
            all.push(self.unary()?);
        }
        Ok(if all.len() == 1 { all.remove(0) } else { Expr::And { all } })
    }

    fn unary(&mut self) -> Result<Expr, ConfigError> {
        if self.eat_op("!") {
            return Ok(Expr::Not {
                inner: Box::new(self.unary()?),
            });
        }
        if self.eat_op("(") {
            let inner = self.expr()?;
            self.expect_op(")")?;
            return Ok(inner);
        }

        let pos = self.pos();
        match self.bump() {
            Tok::Ident(word) if word == "true" => Ok(Expr::Const { value: true }),
            Tok::Ident(word) if word == "false" => Ok(Expr::Const { value: false }),
            Tok::Ident(word) if word == "count" || word == "value" => {
                let term = self.term(&word)?;
                let op_pos = self.pos();
                let op = match self.bump() {
                    Tok::Op(o) => CmpOp::from_token(o),
                    _ => None,
                }
                .ok_or_else(|| malformed(op_pos, "expected comparison operator"))?;
                let rhs_pos = self.pos();
                let Tok::Num(rhs) = self.bump() else {
                    return Err(malformed(rhs_pos, "expected number"));
                };
                Ok(Expr::Cmp { term, op, rhs })
            }
            Tok::End => Err(malformed(pos, "unexpected end of input")),
            _ => Err(malformed(pos, "expected 'count', 'value', 'true', 'false', '!' or '('")),
        }
    }

    fn name(&mut self) -> Result<String, ConfigError> {
        let pos = self.pos();
        match self.bump() {
            Tok::Ident(s) | Tok::Str(s) => Ok(s),
            _ => Err(malformed(pos, "expected name")),
        }
    }

    fn term(&mut self, kind: &str) -> Result<Term, ConfigError> {
        self.expect_op("(")?;
        let relation = RelationName::new(self.name()?);
        self.expect_op(",")?;
        let key = self.name()?;
        self.expect_op(")")?;
        Ok(if kind == "count" {
            Term::Count { relation, key }
        } else {
            Term::Value { relation, key }
        })
    }
}

/// A parsed predicate and the cells it depends on.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Predicate {
    source: String,
    expr: Expr,
    deps: BTreeSet<(RelationName, String)>,
}

impl Predicate {
    /// Parse and compile a predicate.
    pub fn parse(source: &str) -> Result<Self, ConfigError> {
        let mut parser = Parser {
            toks: tokenize(source)?,
            idx: 0,
        };
        let expr = parser.expr()?;
        if parser.peek() != &Tok::End {
            return Err(malformed(parser.pos(), "unexpected trailing input"));
        }

        let mut terms = Vec::new();
        expr.collect_terms(&mut terms);
        let deps = terms
            .into_iter()
            .map(|t| {
                let (r, k) = t.cell();
                (r.clone(), k.to_string())
            })
            .collect();

        Ok(Self {
            source: source.to_string(),
            expr,
            deps,
        })
    }

    /// Source text as registered.
    #[must_use]
    pub fn source(&self) -> &str {
        &self.source
    }

    /// Compiled expression.
    #[must_use]
    pub const fn expr(&self) -> &Expr {
        &self.expr
    }

    /// Every (relation, key) cell the predicate reads.
    #[must_use]
    pub const fn dependencies(&self) -> &BTreeSet<(RelationName, String)> {
        &self.deps
    }

    /// Distinct relations read.
    #[must_use]
    pub fn relations(&self) -> BTreeSet<RelationName> {
        self.deps.iter().map(|(r, _)| r.clone()).collect()
    }

    /// Returns true if a change at (relation, key) can change the outcome.
    #[must_use]
    pub fn depends_on(&self, relation: &RelationName, key: &str) -> bool {
        self.deps.contains(&(relation.clone(), key.to_string()))
    }

    /// Evaluate against a reader.
    #[must_use]
    pub fn eval(&self, reader: &dyn ViewReader) -> bool {
        self.expr.eval(reader)
    }
}

impl fmt::Display for Predicate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.source)
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;
    use crate::diff::{Accum, Delta};

    struct Fixed(HashMap<(String, String), Accum>);

    impl Fixed {
        fn with(cells: &[(&str, &str, Delta)]) -> Self {
            let mut map = HashMap::new();
            for (r, k, d) in cells {
                map.insert((r.to_string(), k.to_string()), Accum::from_delta(*d));
            }
            Self(map)
        }
    }

    impl ViewReader for Fixed {
        fn read(&self, relation: &RelationName, key: &str) -> Accum {
            self.0
                .get(&(relation.to_string(), key.to_string()))
                .copied()
                .unwrap_or_default()
        }

        fn entries(&self, _relation: &RelationName) -> Vec<(String, Accum)> {
            Vec::new()
        }
    }

    #[test]
    fn parses_comparisons_and_precedence() {
        let p = Predicate::parse("count(orders, X) >= 12 || count(orders, Y) > 1 && !(value(spend, c7) < 2.5)").unwrap();
        match p.expr() {
            Expr::Or { any } => {
                assert_eq!(any.len(), 2);
                assert!(matches!(any[1], Expr::And { .. }));
            }
            other => panic!("expected Or, got {other:?}"),
        }
        assert_eq!(p.dependencies().len(), 3);
        assert!(p.depends_on(&RelationName::from("spend"), "c7"));
        assert_eq!(p.relations().len(), 2);
    }

    #[test]
    fn evaluates_against_reader() {
        let reader = Fixed::with(&[("orders", "X", Delta::count(13)), ("spend", "c7", Delta::value(3.0))]);
        assert!(Predicate::parse("count(orders, X) >= 12").unwrap().eval(&reader));
        assert!(!Predicate::parse("count(orders, X) < 12").unwrap().eval(&reader));
        assert!(Predicate::parse("value(spend, c7) == 3").unwrap().eval(&reader));
        assert!(Predicate::parse("count(orders, missing) == 0 && true").unwrap().eval(&reader));
        assert!(!Predicate::parse("!(value(spend, c7) != 3.0) && false").unwrap().eval(&reader));
    }

    #[test]
    fn quoted_names_allow_spaces() {
        let p = Predicate::parse(r#"count("big orders", "sku 1") > 0"#).unwrap();
        assert!(p.depends_on(&RelationName::from("big orders"), "sku 1"));
    }

    #[test]
    fn malformed_reports_position() {
        let err = Predicate::parse("count(orders, X) >= ").unwrap_err();
        assert!(matches!(err, ConfigError::MalformedPredicate { position: 20, .. }));

        let err = Predicate::parse("count(orders X) > 1").unwrap_err();
        assert!(matches!(err, ConfigError::MalformedPredicate { position: 13, .. }));

        let err = Predicate::parse("count(orders, X) > 1 $").unwrap_err();
        assert!(matches!(err, ConfigError::MalformedPredicate { position: 21, .. }));

        assert!(Predicate::parse("").is_err());
        assert!(Predicate::parse("(true").is_err());
        assert!(Predicate::parse("true false").is_err());
    }

    #[test]
    fn negative_numbers_and_identifiers_with_dashes() {
        let reader = Fixed::with(&[("stock", "SKU-1", Delta::count(-3))]);
        assert!(Predicate::parse("count(stock, SKU-1) <= -3").unwrap().eval(&reader));
    }
}
