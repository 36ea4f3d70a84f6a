#![forbid(unsafe_code)]

use std::fmt;
use std::fs;
use std::path::Path;

use anyhow::Context as _;
use rand::distr::{Alphanumeric, SampleString};
use serde::{Deserialize, Serialize};

const TOKEN_LEN: usize = 64;

/// Appservice registration document shared with the home server.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Registration {
	pub id: String,
	pub url: String,
	pub as_token: String,
	pub hs_token: String,
	pub sender_localpart: String,
	#[serde(default)]
	pub rate_limited: bool,
	#[serde(default)]
	pub namespaces: Namespaces,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Namespaces {
	#[serde(default)]
	pub users: Vec<Namespace>,
	#[serde(default)]
	pub aliases: Vec<Namespace>,
	#[serde(default)]
	pub rooms: Vec<Namespace>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Namespace {
	pub exclusive: bool,
	pub regex: String,
}

impl fmt::Debug for Registration {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.debug_struct("Registration")
			.field("id", &self.id)
			.field("url", &self.url)
			.field("as_token", &"<redacted>")
			.field("hs_token", &"<redacted>")
			.field("sender_localpart", &self.sender_localpart)
			.field("namespaces", &self.namespaces)
			.finish()
	}
}

impl Registration {
	/// Fresh registration with random tokens and an exclusive puppet namespace
	/// `@{puppet_prefix}.*:{server_name}`.
	pub fn generate(id: &str, url: &str, sender_localpart: &str, puppet_prefix: &str, server_name: &str) -> Self {
		let mut rng = rand::rng();
		Self {
			id: id.to_string(),
			url: url.to_string(),
			as_token: Alphanumeric.sample_string(&mut rng, TOKEN_LEN),
			hs_token: Alphanumeric.sample_string(&mut rng, TOKEN_LEN),
			sender_localpart: sender_localpart.to_string(),
			rate_limited: false,
			namespaces: Namespaces {
				users: vec![Namespace {
					exclusive: true,
					regex: format!("@{}.*:{}", escape_regex(puppet_prefix), escape_regex(server_name)),
				}],
				aliases: Vec::new(),
				rooms: Vec::new(),
			},
		}
	}

	pub fn load(path: &Path) -> anyhow::Result<Self> {
		let raw = fs::read_to_string(path).with_context(|| format!("read registration {}", path.display()))?;
		let reg: Self = serde_yaml::from_str(&raw).with_context(|| format!("parse registration {}", path.display()))?;
		if reg.as_token.trim().is_empty() || reg.hs_token.trim().is_empty() {
			anyhow::bail!("registration {} is missing as_token/hs_token", path.display());
		}
		Ok(reg)
	}

	pub fn save(&self, path: &Path) -> anyhow::Result<()> {
		if let Some(parent) = path.parent()
			&& !parent.as_os_str().is_empty()
		{
			fs::create_dir_all(parent).with_context(|| format!("create {}", parent.display()))?;
		}
		let raw = serde_yaml::to_string(self).context("serialize registration")?;
		fs::write(path, raw).with_context(|| format!("write registration {}", path.display()))
	}
}

fn escape_regex(s: &str) -> String {
	let mut out = String::with_capacity(s.len());
	for c in s.chars() {
		if matches!(c, '.' | '*' | '+' | '?' | '(' | ')' | '[' | ']' | '{' | '}' | '|' | '^' | '$' | '\\') {
			out.push('\\');
		}
		out.push(c);
	}
	out
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn generate_produces_distinct_tokens_and_namespace() {
		let reg = Registration::generate("twitch", "http://localhost:9000", "twitchbot", "twitch_", "example.org");
		assert_eq!(reg.as_token.len(), TOKEN_LEN);
		assert_ne!(reg.as_token, reg.hs_token);
		assert_eq!(reg.namespaces.users.len(), 1);
		assert_eq!(reg.namespaces.users[0].regex, "@twitch_.*:example\\.org");
		assert!(reg.namespaces.users[0].exclusive);
	}

	#[test]
	fn save_then_load_from_disk() {
		let dir = tempfile::tempdir().unwrap();
		let path = dir.path().join("nested").join("registration.yaml");
		let reg = Registration::generate("twitch", "http://localhost:9000", "twitchbot", "twitch_", "example.org");
		reg.save(&path).unwrap();

		let loaded = Registration::load(&path).unwrap();
		assert_eq!(loaded, reg);
	}

	#[test]
	fn load_rejects_missing_tokens() {
		let dir = tempfile::tempdir().unwrap();
		let path = dir.path().join("registration.yaml");
		fs::write(
			&path,
			"id: twitch\nurl: http://localhost\nas_token: ''\nhs_token: x\nsender_localpart: bot\n",
		)
		.unwrap();
		assert!(Registration::load(&path).is_err());
	}

	#[test]
	fn debug_redacts_tokens() {
		let reg = Registration::generate("twitch", "http://localhost", "bot", "twitch_", "example.org");
		let dbg = format!("{reg:?}");
		assert!(!dbg.contains(&reg.as_token));
		assert!(!dbg.contains(&reg.hs_token));
	}
}
