//! LDAP-style provider selectors.
//!
//! Grammar, whitespace allowed between filters:
//!
//! ```text
//! filter  = "(" ( "&" list | "|" list | "!" filter | item ) ")"
//! list    = filter+
//! item    = key "=" value
//! value   = "*"              presence
//!         | chars ("*" chars)*  equality, or wildcard when a '*' appears
//! ```
//!
//! `\` escapes the next character inside a value so `(`, `)`, `*` and `\` can be
//! matched literally. Keys and values compare exactly.

use std::fmt;
use std::str::FromStr;

use crate::Attributes;

/// Parse failure with the byte offset into the selector source.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{message} at byte {offset}")]
pub struct SelectorError {
	pub offset: usize,
	pub message: &'static str,
}

/// Compiled selector.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Selector {
	Equals { key: String, value: String },
	Present { key: String },
	/// Literal segments separated by `*`. The first and last segments anchor the
	/// value's start and end; empty segments leave that end open.
	Wildcard { key: String, segments: Vec<String> },
	And(Vec<Selector>),
	Or(Vec<Selector>),
	Not(Box<Selector>),
}

impl Selector {
	pub fn parse(source: &str) -> Result<Self, SelectorError> {
		let mut parser = Parser { source, pos: 0 };
		parser.skip_whitespace();
		let selector = parser.filter()?;
		parser.skip_whitespace();
		if parser.pos != source.len() {
			return Err(parser.error("trailing input after selector"));
		}
		Ok(selector)
	}

	/// Equality selector, mostly for building filters in code.
	pub fn equals(key: impl Into<String>, value: impl Into<String>) -> Self {
		Self::Equals {
			key: key.into(),
			value: value.into(),
		}
	}

	pub fn matches(&self, attributes: &Attributes) -> bool {
		match self {
			Self::Equals { key, value } => attributes.get(key) == Some(value.as_str()),
			Self::Present { key } => attributes.contains_key(key),
			Self::Wildcard { key, segments } => attributes.get(key).is_some_and(|value| wildcard_match(segments, value)),
			Self::And(children) => children.iter().all(|child| child.matches(attributes)),
			Self::Or(children) => children.iter().any(|child| child.matches(attributes)),
			Self::Not(child) => !child.matches(attributes),
		}
	}
}

fn wildcard_match(segments: &[String], value: &str) -> bool {
	let [first, middle @ .., last] = segments else {
		return segments.first().is_none_or(|only| only == value);
	};
	let Some(mut rest) = value.strip_prefix(first.as_str()) else {
		return false;
	};
	for segment in middle {
		match rest.find(segment.as_str()) {
			Some(at) => rest = &rest[at + segment.len()..],
			None => return false,
		}
	}
	rest.ends_with(last.as_str())
}

impl FromStr for Selector {
	type Err = SelectorError;

	fn from_str(source: &str) -> Result<Self, Self::Err> {
		Self::parse(source)
	}
}

impl fmt::Display for Selector {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		match self {
			Self::Equals { key, value } => {
				write!(f, "({key}=")?;
				write_escaped(f, value)?;
				f.write_str(")")
			}
			Self::Present { key } => write!(f, "({key}=*)"),
			Self::Wildcard { key, segments } => {
				write!(f, "({key}=")?;
				for (index, segment) in segments.iter().enumerate() {
					if index > 0 {
						f.write_str("*")?;
					}
					write_escaped(f, segment)?;
				}
				f.write_str(")")
			}
			Self::And(children) | Self::Or(children) => {
				f.write_str(if matches!(self, Self::And(_)) { "(&" } else { "(|" })?;
				for child in children {
					write!(f, "{child}")?;
				}
				f.write_str(")")
			}
			Self::Not(child) => write!(f, "(!{child})"),
		}
	}
}

fn write_escaped(f: &mut fmt::Formatter<'_>, text: &str) -> fmt::Result {
	for ch in text.chars() {
		if matches!(ch, '(' | ')' | '*' | '\\') {
			f.write_str("\\")?;
		}
		write!(f, "{ch}")?;
	}
	Ok(())
}

struct Parser<'a> {
	source: &'a str,
	pos: usize,
}

impl Parser<'_> {
	fn error(&self, message: &'static str) -> SelectorError {
		SelectorError { offset: self.pos, message }
	}

	fn peek(&self) -> Option<char> {
		self.source[self.pos..].chars().next()
	}

	fn bump(&mut self) -> Option<char> {
		let ch = self.peek()?;
		self.pos += ch.len_utf8();
		Some(ch)
	}

	fn skip_whitespace(&mut self) {
		while self.peek().is_some_and(char::is_whitespace) {
			self.bump();
		}
	}

	fn expect(&mut self, expected: char, message: &'static str) -> Result<(), SelectorError> {
		if self.peek() == Some(expected) {
			self.bump();
			Ok(())
		} else {
			Err(self.error(message))
		}
	}

	fn filter(&mut self) -> Result<Selector, SelectorError> {
		self.expect('(', "expected '('")?;
		let selector = match self.peek() {
			Some('&') => {
				self.bump();
				Selector::And(self.list()?)
			}
			Some('|') => {
				self.bump();
				Selector::Or(self.list()?)
			}
			Some('!') => {
				self.bump();
				self.skip_whitespace();
				Selector::Not(Box::new(self.filter()?))
			}
			Some(_) => self.item()?,
			None => return Err(self.error("unexpected end of selector")),
		};
		self.skip_whitespace();
		self.expect(')', "expected ')'")?;
		Ok(selector)
	}

	fn list(&mut self) -> Result<Vec<Selector>, SelectorError> {
		let mut children = Vec::new();
		loop {
			self.skip_whitespace();
			if self.peek() != Some('(') {
				break;
			}
			children.push(self.filter()?);
		}
		if children.is_empty() {
			return Err(self.error("composite selector needs at least one operand"));
		}
		Ok(children)
	}

	fn item(&mut self) -> Result<Selector, SelectorError> {
		let start = self.pos;
		while let Some(ch) = self.peek() {
			if matches!(ch, '=' | '(' | ')' | '*' | '\\') {
				break;
			}
			self.bump();
		}
		let key = self.source[start..self.pos].trim();
		if key.is_empty() {
			return Err(SelectorError {
				offset: start,
				message: "missing attribute name",
			});
		}
		let key = key.to_owned();
		self.expect('=', "expected '=' after attribute name")?;

		let mut segments = vec![String::new()];
		loop {
			match self.peek() {
				None => return Err(self.error("unterminated selector value")),
				Some(')') => break,
				Some('(') => return Err(self.error("unescaped '(' in value")),
				Some('*') => {
					self.bump();
					segments.push(String::new());
				}
				Some('\\') => {
					self.bump();
					let Some(escaped) = self.bump() else {
						return Err(self.error("dangling escape"));
					};
					if let Some(segment) = segments.last_mut() {
						segment.push(escaped);
					}
				}
				Some(ch) => {
					self.bump();
					if let Some(segment) = segments.last_mut() {
						segment.push(ch);
					}
				}
			}
		}

		Ok(match segments.as_slice() {
			[value] => Selector::Equals {
				key,
				value: value.clone(),
			},
			[head, tail] if head.is_empty() && tail.is_empty() => Selector::Present { key },
			_ => Selector::Wildcard { key, segments },
		})
	}
}
