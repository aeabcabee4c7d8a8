// Distro requirement parsing.
//
// A requirement names a distro, optionally constrains its version with
// pep-440 specifiers and optionally guards the whole requirement with a
// marker expression evaluated against host facts:
//
//     houdini19.5>=19.5.493,<20
//     side_scanner==1.2; platform_system == 'Windows'
//
// Versions and specifiers are handled by `pep440_rs`, the requirement line
// and the marker expression grammar are parsed here.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use indexmap::IndexMap;
use pep440_rs::{Version, VersionSpecifier};
use tracing::warn;

use crate::errors::{HabError, Result};
use crate::platform::Platform;

/// A single distro requirement.
#[derive(Debug, Clone, PartialEq)]
pub struct Requirement {
    pub name: String,
    pub specifiers: Vec<VersionSpecifier>,
    pub marker: Option<Marker>,
}

impl Requirement {
    /// Build a requirement with just a name and no constraints.
    pub fn unversioned(name: impl Into<String>) -> Self {
        Requirement {
            name: name.into(),
            specifiers: Vec::new(),
            marker: None,
        }
    }

    /// True when the version satisfies every specifier of this requirement.
    pub fn contains(&self, version: &Version) -> bool {
        self.specifiers.iter().all(|spec| spec.contains(version))
    }

    /// True when a specifier explicitly names a pre-release, which makes
    /// pre-release versions acceptable even when the site disallows them.
    pub fn mentions_prerelease(&self) -> bool {
        self.specifiers
            .iter()
            .any(|spec| spec.version().any_prerelease())
    }

    /// Merge another requirement's specifiers into this one.
    pub fn merge_specifiers(&mut self, other: &Requirement) {
        for spec in &other.specifiers {
            if !self.specifiers.iter().any(|s| s == spec) {
                self.specifiers.push(spec.clone());
            }
        }
    }

    /// Flatten requirement strings into one requirement per name, merging
    /// the specifiers of duplicated names.
    pub fn simplify<I, S>(requirements: I) -> Result<IndexMap<String, Requirement>>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut ret: IndexMap<String, Requirement> = IndexMap::new();
        for text in requirements {
            let req: Requirement = text.as_ref().parse()?;
            match ret.get_mut(&req.name) {
                Some(existing) => existing.merge_specifiers(&req),
                None => {
                    ret.insert(req.name.clone(), req);
                }
            }
        }
        Ok(ret)
    }
}

impl FromStr for Requirement {
    type Err = HabError;

    fn from_str(text: &str) -> Result<Self> {
        let text = text.trim();
        let (spec_part, marker_part) = match text.split_once(';') {
            Some((left, right)) => (left.trim(), Some(right.trim())),
            None => (text, None),
        };

        let name_end = spec_part
            .find(|c: char| !(c.is_ascii_alphanumeric() || "._-".contains(c)))
            .unwrap_or(spec_part.len());
        let name = &spec_part[..name_end];
        if name.is_empty() {
            return Err(HabError::InvalidRequirement(format!(
                "Invalid requirement: \"{text}\""
            )));
        }

        let mut specifiers = Vec::new();
        let spec_text = spec_part[name_end..].trim();
        if !spec_text.is_empty() {
            for chunk in spec_text.split(',') {
                let spec = VersionSpecifier::from_str(chunk.trim()).map_err(|err| {
                    HabError::InvalidRequirement(format!(
                        "Invalid requirement \"{text}\": {err}"
                    ))
                })?;
                specifiers.push(spec);
            }
        }

        let marker = match marker_part {
            Some(marker_text) if !marker_text.is_empty() => Some(marker_text.parse()?),
            _ => None,
        };

        Ok(Requirement {
            name: name.to_string(),
            specifiers,
            marker,
        })
    }
}

impl fmt::Display for Requirement {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.name)?;
        let specs = self
            .specifiers
            .iter()
            .map(|s| s.to_string())
            .collect::<Vec<_>>()
            .join(",");
        f.write_str(&specs)?;
        if let Some(marker) = &self.marker {
            write!(f, "; {marker}")?;
        }
        Ok(())
    }
}

/// Host facts markers are evaluated against.
///
/// The facts are injectable so tests can solve for a platform other than the
/// host hab is running on.
#[derive(Debug, Clone)]
pub struct MarkerEnv {
    facts: BTreeMap<String, String>,
}

impl MarkerEnv {
    pub fn for_platform(platform: Platform) -> Self {
        let mut facts = BTreeMap::new();
        let (system, sys_platform, os_name) = match platform {
            Platform::Windows => ("Windows", "win32", "nt"),
            Platform::Linux => ("Linux", "linux", "posix"),
            Platform::Osx => ("Darwin", "darwin", "posix"),
        };
        facts.insert("platform_system".to_string(), system.to_string());
        facts.insert("sys_platform".to_string(), sys_platform.to_string());
        facts.insert("os_name".to_string(), os_name.to_string());
        facts.insert(
            "platform_machine".to_string(),
            std::env::consts::ARCH.to_string(),
        );
        MarkerEnv { facts }
    }

    /// Override or add a fact, mostly useful for tests.
    pub fn set_fact(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.facts.insert(name.into(), value.into());
    }

    fn lookup(&self, name: &str) -> String {
        match self.facts.get(name) {
            Some(value) => value.clone(),
            None => {
                warn!("Unknown marker variable \"{name}\", treated as empty");
                String::new()
            }
        }
    }
}

/// A marker comparison operand, either a variable or a quoted literal.
#[derive(Debug, Clone, PartialEq)]
pub enum MarkerOperand {
    Variable(String),
    Literal(String),
}

impl MarkerOperand {
    fn value(&self, env: &MarkerEnv) -> String {
        match self {
            MarkerOperand::Variable(name) => env.lookup(name),
            MarkerOperand::Literal(value) => value.clone(),
        }
    }
}

impl fmt::Display for MarkerOperand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MarkerOperand::Variable(name) => f.write_str(name),
            MarkerOperand::Literal(value) => write!(f, "\"{value}\""),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MarkerOp {
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
    In,
    NotIn,
}

impl fmt::Display for MarkerOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            MarkerOp::Eq => "==",
            MarkerOp::Ne => "!=",
            MarkerOp::Lt => "<",
            MarkerOp::Le => "<=",
            MarkerOp::Gt => ">",
            MarkerOp::Ge => ">=",
            MarkerOp::In => "in",
            MarkerOp::NotIn => "not in",
        };
        f.write_str(text)
    }
}

/// A parsed marker expression.
#[derive(Debug, Clone, PartialEq)]
pub enum Marker {
    Compare {
        lhs: MarkerOperand,
        op: MarkerOp,
        rhs: MarkerOperand,
    },
    And(Box<Marker>, Box<Marker>),
    Or(Box<Marker>, Box<Marker>),
}

impl Marker {
    pub fn evaluate(&self, env: &MarkerEnv) -> bool {
        match self {
            Marker::Compare { lhs, op, rhs } => {
                let left = lhs.value(env);
                let right = rhs.value(env);
                match op {
                    MarkerOp::Eq => left == right,
                    MarkerOp::Ne => left != right,
                    MarkerOp::Lt => left < right,
                    MarkerOp::Le => left <= right,
                    MarkerOp::Gt => left > right,
                    MarkerOp::Ge => left >= right,
                    MarkerOp::In => right.contains(&left),
                    MarkerOp::NotIn => !right.contains(&left),
                }
            }
            Marker::And(a, b) => a.evaluate(env) && b.evaluate(env),
            Marker::Or(a, b) => a.evaluate(env) || b.evaluate(env),
        }
    }
}

impl fmt::Display for Marker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Marker::Compare { lhs, op, rhs } => write!(f, "{lhs} {op} {rhs}"),
            Marker::And(a, b) => write!(f, "{a} and {b}"),
            Marker::Or(a, b) => write!(f, "{a} or {b}"),
        }
    }
}

impl FromStr for Marker {
    type Err = HabError;

    fn from_str(text: &str) -> Result<Self> {
        let tokens = tokenize_marker(text)?;
        let mut parser = MarkerParser {
            tokens,
            pos: 0,
            source: text,
        };
        let marker = parser.parse_or()?;
        if parser.pos != parser.tokens.len() {
            return Err(parser.error("unexpected trailing tokens"));
        }
        Ok(marker)
    }
}

#[derive(Debug, Clone, PartialEq)]
enum MarkerToken {
    Word(String),
    Literal(String),
    Op(MarkerOp),
    LParen,
    RParen,
}

fn tokenize_marker(text: &str) -> Result<Vec<MarkerToken>> {
    let mut tokens = Vec::new();
    let mut chars = text.chars().peekable();

    while let Some(&ch) = chars.peek() {
        match ch {
            ' ' | '\t' => {
                chars.next();
            }
            '(' => {
                chars.next();
                tokens.push(MarkerToken::LParen);
            }
            ')' => {
                chars.next();
                tokens.push(MarkerToken::RParen);
            }
            '\'' | '"' => {
                let quote = ch;
                chars.next();
                let mut literal = String::new();
                let mut closed = false;
                for c in chars.by_ref() {
                    if c == quote {
                        closed = true;
                        break;
                    }
                    literal.push(c);
                }
                if !closed {
                    return Err(HabError::InvalidRequirement(format!(
                        "Invalid marker \"{text}\": unterminated string"
                    )));
                }
                tokens.push(MarkerToken::Literal(literal));
            }
            '=' | '!' | '<' | '>' => {
                chars.next();
                let op = match (ch, chars.peek()) {
                    ('=', Some('=')) => {
                        chars.next();
                        MarkerOp::Eq
                    }
                    ('!', Some('=')) => {
                        chars.next();
                        MarkerOp::Ne
                    }
                    ('<', Some('=')) => {
                        chars.next();
                        MarkerOp::Le
                    }
                    ('>', Some('=')) => {
                        chars.next();
                        MarkerOp::Ge
                    }
                    ('<', _) => MarkerOp::Lt,
                    ('>', _) => MarkerOp::Gt,
                    _ => {
                        return Err(HabError::InvalidRequirement(format!(
                            "Invalid marker \"{text}\": unexpected \"{ch}\""
                        )))
                    }
                };
                tokens.push(MarkerToken::Op(op));
            }
            _ => {
                let mut word = String::new();
                while let Some(&c) = chars.peek() {
                    if c.is_ascii_alphanumeric() || c == '_' || c == '.' {
                        word.push(c);
                        chars.next();
                    } else {
                        break;
                    }
                }
                if word.is_empty() {
                    return Err(HabError::InvalidRequirement(format!(
                        "Invalid marker \"{text}\": unexpected \"{ch}\""
                    )));
                }
                tokens.push(MarkerToken::Word(word));
            }
        }
    }
    Ok(tokens)
}

struct MarkerParser<'a> {
    tokens: Vec<MarkerToken>,
    pos: usize,
    source: &'a str,
}

impl MarkerParser<'_> {
    fn error(&self, reason: &str) -> HabError {
        HabError::InvalidRequirement(format!("Invalid marker \"{}\": {reason}", self.source))
    }

    fn peek_word(&self) -> Option<&str> {
        match self.tokens.get(self.pos) {
            Some(MarkerToken::Word(word)) => Some(word.as_str()),
            _ => None,
        }
    }

    fn parse_or(&mut self) -> Result<Marker> {
        let mut left = self.parse_and()?;
        while self.peek_word() == Some("or") {
            self.pos += 1;
            let right = self.parse_and()?;
            left = Marker::Or(Box::new(left), Box::new(right));
        }
        Ok(left)
    }

    fn parse_and(&mut self) -> Result<Marker> {
        let mut left = self.parse_atom()?;
        while self.peek_word() == Some("and") {
            self.pos += 1;
            let right = self.parse_atom()?;
            left = Marker::And(Box::new(left), Box::new(right));
        }
        Ok(left)
    }

    fn parse_atom(&mut self) -> Result<Marker> {
        if self.tokens.get(self.pos) == Some(&MarkerToken::LParen) {
            self.pos += 1;
            let inner = self.parse_or()?;
            if self.tokens.get(self.pos) != Some(&MarkerToken::RParen) {
                return Err(self.error("expected \")\""));
            }
            self.pos += 1;
            return Ok(inner);
        }

        let lhs = self.parse_operand()?;
        let op = self.parse_op()?;
        let rhs = self.parse_operand()?;
        Ok(Marker::Compare { lhs, op, rhs })
    }

    fn parse_operand(&mut self) -> Result<MarkerOperand> {
        let token = self
            .tokens
            .get(self.pos)
            .ok_or_else(|| self.error("expected an operand"))?
            .clone();
        self.pos += 1;
        match token {
            MarkerToken::Word(word) => Ok(MarkerOperand::Variable(word)),
            MarkerToken::Literal(value) => Ok(MarkerOperand::Literal(value)),
            _ => Err(self.error("expected an operand")),
        }
    }

    fn parse_op(&mut self) -> Result<MarkerOp> {
        let token = self
            .tokens
            .get(self.pos)
            .ok_or_else(|| self.error("expected an operator"))?
            .clone();
        match token {
            MarkerToken::Op(op) => {
                self.pos += 1;
                Ok(op)
            }
            MarkerToken::Word(word) if word == "in" => {
                self.pos += 1;
                Ok(MarkerOp::In)
            }
            MarkerToken::Word(word) if word == "not" => {
                self.pos += 1;
                if self.peek_word() != Some("in") {
                    return Err(self.error("expected \"in\" after \"not\""));
                }
                self.pos += 1;
                Ok(MarkerOp::NotIn)
            }
            _ => Err(self.error("expected an operator")),
        }
    }
}
