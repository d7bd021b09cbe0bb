//! LDAP-style attribute filters.
//!
//! A [`Filter`] is a boolean predicate over a provider's [`Properties`]. The
//! supported grammar is the familiar prefix form:
//!
//! ```text
//! filter     = "(" ( and | or | not | item ) ")"
//! and        = "&" filter+
//! or         = "|" filter+
//! not        = "!" filter
//! item       = attr ( "=" | "~=" | ">=" | "<=" ) value
//! ```
//!
//! `attr=*` tests presence, and unescaped `*` inside an `=` value makes it a
//! substring match. `\` escapes the next character. A filter of `*` (or an
//! empty string) matches everything.
//!
//! Two filters are equal when their canonical renderings are equal. The
//! listener consolidation relies on this: it groups dependency listeners by
//! filter identity, not by semantic equivalence.

use std::cmp::Ordering;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::sync::Arc;

use globset::{GlobBuilder, GlobMatcher};
use serde::{Deserialize, Serialize};

use crate::error::{FilterError, FilterResult};
use crate::properties::{Properties, PropertyValue, keys};

/// A parsed attribute filter.
#[derive(Clone)]
pub struct Filter {
    root: Arc<Node>,
    text: Arc<str>,
}

#[derive(Debug, Clone)]
enum Node {
    MatchAll,
    And(Vec<Node>),
    Or(Vec<Node>),
    Not(Box<Node>),
    Present(String),
    Compare {
        attr: String,
        op: Op,
        value: String,
    },
    Substring {
        attr: String,
        pieces: Vec<String>,
        matcher: GlobMatcher,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Op {
    Equal,
    Approx,
    GreaterEq,
    LessEq,
}

impl Op {
    fn symbol(self) -> &'static str {
        match self {
            Self::Equal => "=",
            Self::Approx => "~=",
            Self::GreaterEq => ">=",
            Self::LessEq => "<=",
        }
    }

    fn holds(self, ord: Ordering) -> bool {
        match self {
            Self::Equal | Self::Approx => ord == Ordering::Equal,
            Self::GreaterEq => ord != Ordering::Less,
            Self::LessEq => ord != Ordering::Greater,
        }
    }
}

impl Filter {
    /// Parse a filter string.
    ///
    /// # Errors
    ///
    /// Returns a [`FilterError`] pointing at the offending offset if the
    /// text is not a well-formed filter.
    pub fn parse(text: &str) -> FilterResult<Self> {
        let trimmed = text.trim();
        if trimmed.is_empty() || trimmed == "*" {
            return Ok(Self::match_all());
        }
        let mut parser = Parser::new(trimmed);
        let node = parser.filter()?;
        parser.skip_whitespace();
        if !parser.at_end() {
            return Err(FilterError::new(parser.pos, "trailing characters"));
        }
        Ok(Self::from_node(node))
    }

    /// A filter that matches every property map.
    #[must_use]
    pub fn match_all() -> Self {
        Self::from_node(Node::MatchAll)
    }

    /// `(objectClass=<interface>)`.
    #[must_use]
    pub fn object_class(interface: &str) -> Self {
        Self::from_node(Node::Compare {
            attr: keys::OBJECT_CLASS.to_owned(),
            op: Op::Equal,
            value: interface.to_owned(),
        })
    }

    /// Intersection of two filters.
    ///
    /// Match-all operands are absorbed and identical operands collapse, so
    /// intersecting a filter with itself yields an equal filter.
    #[must_use]
    pub fn and(&self, other: &Filter) -> Filter {
        if self.is_match_all() || self == other {
            return other.clone();
        }
        if other.is_match_all() {
            return self.clone();
        }
        let mut children = Vec::new();
        for node in [&*self.root, &*other.root] {
            match node {
                Node::And(inner) => children.extend(inner.iter().cloned()),
                other => children.push(other.clone()),
            }
        }
        Self::from_node(Node::And(children))
    }

    /// Whether this filter matches everything.
    #[must_use]
    pub fn is_match_all(&self) -> bool {
        matches!(*self.root, Node::MatchAll)
    }

    /// Evaluate the filter against a property map.
    #[must_use]
    pub fn matches(&self, properties: &Properties) -> bool {
        self.root.matches(properties)
    }

    /// The canonical text of this filter.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.text
    }

    fn from_node(node: Node) -> Self {
        let mut text = String::new();
        node.render(&mut text);
        Self {
            root: Arc::new(node),
            text: text.into(),
        }
    }
}

impl Node {
    fn matches(&self, props: &Properties) -> bool {
        match self {
            Self::MatchAll => true,
            Self::And(children) => children.iter().all(|c| c.matches(props)),
            Self::Or(children) => children.iter().any(|c| c.matches(props)),
            Self::Not(child) => !child.matches(props),
            Self::Present(attr) => props.contains_key(attr),
            Self::Compare { attr, op, value } => props
                .get(attr)
                .is_some_and(|actual| compare(actual, *op, value)),
            Self::Substring { attr, matcher, .. } => props
                .get(attr)
                .is_some_and(|actual| substring_matches(actual, matcher)),
        }
    }

    fn render(&self, out: &mut String) {
        match self {
            Self::MatchAll => out.push('*'),
            Self::And(children) | Self::Or(children) => {
                out.push('(');
                out.push(if matches!(self, Self::And(_)) { '&' } else { '|' });
                for child in children {
                    child.render(out);
                }
                out.push(')');
            },
            Self::Not(child) => {
                out.push_str("(!");
                child.render(out);
                out.push(')');
            },
            Self::Present(attr) => {
                out.push('(');
                out.push_str(attr);
                out.push_str("=*)");
            },
            Self::Compare { attr, op, value } => {
                out.push('(');
                out.push_str(attr);
                out.push_str(op.symbol());
                escape_into(value, out);
                out.push(')');
            },
            Self::Substring { attr, pieces, .. } => {
                out.push('(');
                out.push_str(attr);
                out.push('=');
                for (i, piece) in pieces.iter().enumerate() {
                    if i > 0 {
                        out.push('*');
                    }
                    escape_into(piece, out);
                }
                out.push(')');
            },
        }
    }
}

fn escape_into(value: &str, out: &mut String) {
    for c in value.chars() {
        if matches!(c, '\\' | '(' | ')' | '*') {
            out.push('\\');
        }
        out.push(c);
    }
}

fn compare(actual: &PropertyValue, op: Op, operand: &str) -> bool {
    match actual {
        PropertyValue::List(items) => items.iter().any(|item| compare(item, op, operand)),
        PropertyValue::String(s) => match op {
            Op::Approx => normalize(s) == normalize(operand),
            _ => op.holds(s.as_str().cmp(operand)),
        },
        PropertyValue::Int(i) => operand
            .trim()
            .parse::<i64>()
            .is_ok_and(|o| op.holds(i.cmp(&o))),
        PropertyValue::Float(x) => operand
            .trim()
            .parse::<f64>()
            .ok()
            .and_then(|o| x.partial_cmp(&o))
            .is_some_and(|ord| op.holds(ord)),
        PropertyValue::Bool(b) => match op {
            Op::Equal | Op::Approx => operand
                .trim()
                .eq_ignore_ascii_case(if *b { "true" } else { "false" }),
            Op::GreaterEq | Op::LessEq => false,
        },
    }
}

fn substring_matches(actual: &PropertyValue, matcher: &GlobMatcher) -> bool {
    match actual {
        PropertyValue::List(items) => items.iter().any(|item| substring_matches(item, matcher)),
        PropertyValue::String(s) => matcher.is_match(s.as_str()),
        _ => false,
    }
}

fn normalize(s: &str) -> String {
    s.chars()
        .filter(|c| !c.is_whitespace())
        .flat_map(char::to_lowercase)
        .collect()
}

impl PartialEq for Filter {
    fn eq(&self, other: &Self) -> bool {
        self.text == other.text
    }
}

impl Eq for Filter {}

impl Hash for Filter {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.text.hash(state);
    }
}

impl fmt::Display for Filter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.text)
    }
}

impl fmt::Debug for Filter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Filter").field(&&*self.text).finish()
    }
}

impl std::str::FromStr for Filter {
    type Err = FilterError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl Serialize for Filter {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.text)
    }
}

impl<'de> Deserialize<'de> for Filter {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        Self::parse(&s).map_err(serde::de::Error::custom)
    }
}

/// Deepest nesting of `&`, `|` and `!` a filter may have.
pub const MAX_FILTER_DEPTH: usize = 64;

struct Parser<'a> {
    bytes: &'a [u8],
    pos: usize,
    depth: usize,
}

impl<'a> Parser<'a> {
    fn new(text: &'a str) -> Self {
        Self {
            bytes: text.as_bytes(),
            pos: 0,
            depth: 0,
        }
    }

    fn at_end(&self) -> bool {
        self.pos >= self.bytes.len()
    }

    fn peek(&self) -> Option<u8> {
        self.bytes.get(self.pos).copied()
    }

    fn bump(&mut self) {
        self.pos = self.pos.saturating_add(1);
    }

    fn skip_whitespace(&mut self) {
        while self.peek().is_some_and(|b| b.is_ascii_whitespace()) {
            self.bump();
        }
    }

    fn expect(&mut self, byte: u8) -> FilterResult<()> {
        self.skip_whitespace();
        if self.peek() == Some(byte) {
            self.bump();
            Ok(())
        } else {
            Err(FilterError::new(
                self.pos,
                format!("expected '{}'", char::from(byte)),
            ))
        }
    }

    fn filter(&mut self) -> FilterResult<Node> {
        self.expect(b'(')?;
        if self.depth >= MAX_FILTER_DEPTH {
            return Err(FilterError::new(
                self.pos,
                format!("nesting deeper than {MAX_FILTER_DEPTH}"),
            ));
        }
        self.depth = self.depth.saturating_add(1);
        self.skip_whitespace();
        let node = match self.peek() {
            Some(b'&') => {
                self.bump();
                Node::And(self.filter_list()?)
            },
            Some(b'|') => {
                self.bump();
                Node::Or(self.filter_list()?)
            },
            Some(b'!') => {
                self.bump();
                Node::Not(Box::new(self.filter()?))
            },
            Some(_) => self.item()?,
            None => return Err(FilterError::new(self.pos, "unexpected end of filter")),
        };
        self.expect(b')')?;
        self.depth = self.depth.saturating_sub(1);
        Ok(node)
    }

    fn filter_list(&mut self) -> FilterResult<Vec<Node>> {
        let mut children = Vec::new();
        loop {
            self.skip_whitespace();
            if self.peek() != Some(b'(') {
                break;
            }
            children.push(self.filter()?);
        }
        if children.is_empty() {
            return Err(FilterError::new(self.pos, "expected at least one operand"));
        }
        Ok(children)
    }

    fn item(&mut self) -> FilterResult<Node> {
        let start = self.pos;
        while let Some(b) = self.peek() {
            if matches!(b, b'=' | b'~' | b'<' | b'>' | b'(' | b')') {
                break;
            }
            self.bump();
        }
        let attr = std::str::from_utf8(&self.bytes[start..self.pos])
            .map_err(|_| FilterError::new(start, "attribute is not valid UTF-8"))?
            .trim()
            .to_owned();
        if attr.is_empty() {
            return Err(FilterError::new(start, "missing attribute name"));
        }

        let op = match self.peek() {
            Some(b'=') => {
                self.bump();
                Op::Equal
            },
            Some(first @ (b'~' | b'<' | b'>')) => {
                self.bump();
                if self.peek() != Some(b'=') {
                    return Err(FilterError::new(self.pos, "expected '='"));
                }
                self.bump();
                match first {
                    b'~' => Op::Approx,
                    b'<' => Op::LessEq,
                    _ => Op::GreaterEq,
                }
            },
            _ => return Err(FilterError::new(self.pos, "expected comparison operator")),
        };

        let pieces = self.value(op == Op::Equal)?;
        if op != Op::Equal {
            let value = pieces.into_iter().next().unwrap_or_default();
            return Ok(Node::Compare { attr, op, value });
        }
        match pieces.as_slice() {
            [value] => Ok(Node::Compare {
                attr,
                op,
                value: value.clone(),
            }),
            [a, b] if a.is_empty() && b.is_empty() => Ok(Node::Present(attr)),
            _ => {
                let pattern = pieces
                    .iter()
                    .map(|p| globset::escape(p))
                    .collect::<Vec<_>>()
                    .join("*");
                let matcher = GlobBuilder::new(&pattern)
                    .literal_separator(false)
                    .build()
                    .map_err(|e| FilterError::new(self.pos, e.to_string()))?
                    .compile_matcher();
                Ok(Node::Substring {
                    attr,
                    pieces,
                    matcher,
                })
            },
        }
    }

    /// Read a value up to the closing parenthesis, splitting on unescaped
    /// `*` when `wildcards` is set.
    fn value(&mut self, wildcards: bool) -> FilterResult<Vec<String>> {
        let mut pieces = Vec::new();
        let mut current = Vec::new();
        loop {
            match self.peek() {
                None => return Err(FilterError::new(self.pos, "unterminated value")),
                Some(b')') => break,
                Some(b'(') => return Err(FilterError::new(self.pos, "unescaped '(' in value")),
                Some(b'\\') => {
                    self.bump();
                    let Some(escaped) = self.peek() else {
                        return Err(FilterError::new(self.pos, "dangling escape"));
                    };
                    current.push(escaped);
                    self.bump();
                },
                Some(b'*') if wildcards => {
                    pieces.push(std::mem::take(&mut current));
                    self.bump();
                },
                Some(b) => {
                    current.push(b);
                    self.bump();
                },
            }
        }
        pieces.push(current);
        pieces
            .into_iter()
            .map(|bytes| {
                String::from_utf8(bytes)
                    .map_err(|_| FilterError::new(self.pos, "value is not valid UTF-8"))
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn props() -> Properties {
        Properties::new()
            .with("objectClass", vec!["Greeter", "Named"])
            .with("service.ranking", 5)
            .with("region", "eu-west")
            .with("enabled", true)
            .with("weight", 0.5)
    }

    #[test]
    fn test_equality_and_lists() {
        assert!(Filter::parse("(objectClass=Greeter)").unwrap().matches(&props()));
        assert!(Filter::parse("(objectClass=Named)").unwrap().matches(&props()));
        assert!(!Filter::parse("(objectClass=Other)").unwrap().matches(&props()));
    }

    #[test]
    fn test_numeric_comparisons() {
        let p = props();
        assert!(Filter::parse("(service.ranking>=5)").unwrap().matches(&p));
        assert!(Filter::parse("(service.ranking<=5)").unwrap().matches(&p));
        assert!(!Filter::parse("(service.ranking>=6)").unwrap().matches(&p));
        assert!(Filter::parse("(weight<=1.0)").unwrap().matches(&p));
        assert!(Filter::parse("(enabled=TRUE)").unwrap().matches(&p));
    }

    #[test]
    fn test_boolean_operators() {
        let p = props();
        let f = Filter::parse("(&(objectClass=Greeter)(|(region=us)(region=eu-west)))").unwrap();
        assert!(f.matches(&p));
        let f = Filter::parse("(!(region=eu-west))").unwrap();
        assert!(!f.matches(&p));
    }

    #[test]
    fn test_presence_and_substring() {
        let p = props();
        assert!(Filter::parse("(region=*)").unwrap().matches(&p));
        assert!(!Filter::parse("(missing=*)").unwrap().matches(&p));
        assert!(Filter::parse("(region=eu-*)").unwrap().matches(&p));
        assert!(Filter::parse("(region=*west)").unwrap().matches(&p));
        assert!(!Filter::parse("(region=us-*)").unwrap().matches(&p));
    }

    #[test]
    fn test_escaped_star_is_literal() {
        let p = Properties::new().with("name", "a*b");
        let f = Filter::parse(r"(name=a\*b)").unwrap();
        assert!(f.matches(&p));
        assert_eq!(f.as_str(), r"(name=a\*b)");
        assert!(!f.matches(&Properties::new().with("name", "axxb")));
    }

    #[test]
    fn test_canonical_text_identity() {
        let a = Filter::parse("( & (a=1) (b=2) )").unwrap();
        let b = Filter::parse("(&(a=1)(b=2))").unwrap();
        assert_eq!(a, b);
        assert_eq!(a.to_string(), "(&(a=1)(b=2))");
    }

    #[test]
    fn test_and_absorbs_match_all_and_duplicates() {
        let base = Filter::object_class("Greeter");
        assert_eq!(base.and(&Filter::match_all()), base);
        assert_eq!(Filter::match_all().and(&base), base);
        assert_eq!(base.and(&base), base);

        let narrowed = base.and(&Filter::parse("(region=eu)").unwrap());
        assert_eq!(narrowed.as_str(), "(&(objectClass=Greeter)(region=eu))");
    }

    #[test]
    fn test_parse_errors() {
        assert!(Filter::parse("(a=1").is_err());
        assert!(Filter::parse("a=1)").is_err());
        assert!(Filter::parse("(&)").is_err());
        assert!(Filter::parse("(=1)").is_err());
        assert!(Filter::parse("(a=1))").is_err());
    }

    fn nested_not(levels: usize) -> String {
        format!("{}(a=1){}", "(!".repeat(levels), ")".repeat(levels))
    }

    #[test]
    fn test_nesting_depth_is_capped() {
        assert!(Filter::parse(&nested_not(MAX_FILTER_DEPTH.saturating_sub(1))).is_ok());

        let err = Filter::parse(&nested_not(MAX_FILTER_DEPTH)).unwrap_err();
        assert!(err.message.contains("nesting"), "{err}");

        let hostile = format!("(&{})", nested_not(100_000));
        assert!(Filter::parse(&hostile).is_err());
    }

    #[test]
    fn test_match_all_parses() {
        assert!(Filter::parse("").unwrap().is_match_all());
        assert!(Filter::parse("*").unwrap().matches(&Properties::new()));
    }
}
