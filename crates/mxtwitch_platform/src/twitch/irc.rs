#![forbid(unsafe_code)]

//! Minimal IRC line codec for the subset of Twitch chat the bridge speaks.

use std::collections::BTreeMap;
use std::fmt;

/// One parsed IRC line.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct IrcMessage {
	pub tags: BTreeMap<String, String>,
	pub prefix: Option<String>,
	pub command: String,
	pub params: Vec<String>,
}

impl IrcMessage {
	pub fn new(command: impl Into<String>, params: Vec<String>) -> Self {
		Self {
			command: command.into(),
			params,
			..Self::default()
		}
	}

	/// Parse a single line (without the trailing CRLF). Returns `None` for blank or
	/// command-less input.
	pub fn parse(line: &str) -> Option<Self> {
		let mut rest = line.trim_end_matches(['\r', '\n']);
		if rest.trim().is_empty() {
			return None;
		}

		let mut tags = BTreeMap::new();
		if let Some(stripped) = rest.strip_prefix('@') {
			let (raw_tags, after) = stripped.split_once(' ')?;
			for pair in raw_tags.split(';').filter(|p| !p.is_empty()) {
				let (k, v) = pair.split_once('=').unwrap_or((pair, ""));
				tags.insert(k.to_string(), unescape_tag_value(v));
			}
			rest = after.trim_start();
		}

		let mut prefix = None;
		if let Some(stripped) = rest.strip_prefix(':') {
			let (p, after) = stripped.split_once(' ')?;
			prefix = Some(p.to_string());
			rest = after.trim_start();
		}

		let (head, trailing) = match rest.split_once(" :") {
			Some((head, trailing)) => (head, Some(trailing)),
			None => (rest, None),
		};

		let mut words = head.split(' ').filter(|w| !w.is_empty());
		let command = words.next()?.to_ascii_uppercase();
		let mut params: Vec<String> = words.map(str::to_string).collect();
		if let Some(trailing) = trailing {
			params.push(trailing.to_string());
		}

		Some(Self {
			tags,
			prefix,
			command,
			params,
		})
	}

	/// Nickname portion of the prefix (`nick!user@host`).
	pub fn nick(&self) -> Option<&str> {
		let prefix = self.prefix.as_deref()?;
		Some(prefix.split_once('!').map(|(n, _)| n).unwrap_or(prefix))
	}

	pub fn tag(&self, key: &str) -> Option<&str> {
		self.tags.get(key).map(String::as_str).filter(|v| !v.is_empty())
	}

	pub fn param(&self, idx: usize) -> Option<&str> {
		self.params.get(idx).map(String::as_str)
	}

	/// Last parameter, which carries the message text for PRIVMSG/NOTICE.
	pub fn trailing(&self) -> Option<&str> {
		self.params.last().map(String::as_str)
	}
}

impl fmt::Display for IrcMessage {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		if !self.tags.is_empty() {
			f.write_str("@")?;
			for (i, (k, v)) in self.tags.iter().enumerate() {
				if i > 0 {
					f.write_str(";")?;
				}
				if v.is_empty() {
					f.write_str(k)?;
				} else {
					write!(f, "{k}={}", escape_tag_value(v))?;
				}
			}
			f.write_str(" ")?;
		}
		if let Some(prefix) = &self.prefix {
			write!(f, ":{prefix} ")?;
		}
		f.write_str(&self.command)?;

		let last = self.params.len().saturating_sub(1);
		for (i, p) in self.params.iter().enumerate() {
			if i == last && (p.is_empty() || p.contains(' ') || p.starts_with(':')) {
				write!(f, " :{p}")?;
			} else {
				write!(f, " {p}")?;
			}
		}
		Ok(())
	}
}

fn unescape_tag_value(v: &str) -> String {
	let mut out = String::with_capacity(v.len());
	let mut chars = v.chars();
	while let Some(c) = chars.next() {
		if c != '\\' {
			out.push(c);
			continue;
		}
		match chars.next() {
			Some(':') => out.push(';'),
			Some('s') => out.push(' '),
			Some('\\') => out.push('\\'),
			Some('r') => out.push('\r'),
			Some('n') => out.push('\n'),
			Some(other) => out.push(other),
			None => {}
		}
	}
	out
}

fn escape_tag_value(v: &str) -> String {
	let mut out = String::with_capacity(v.len());
	for c in v.chars() {
		match c {
			';' => out.push_str("\\:"),
			' ' => out.push_str("\\s"),
			'\\' => out.push_str("\\\\"),
			'\r' => out.push_str("\\r"),
			'\n' => out.push_str("\\n"),
			other => out.push(other),
		}
	}
	out
}

/// Outbound chat text must be a single line.
pub fn sanitize_chat_text(body: &str) -> String {
	body.split(['\r', '\n']).filter(|l| !l.trim().is_empty()).collect::<Vec<_>>().join(" ")
}
