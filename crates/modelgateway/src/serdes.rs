use std::io;
use std::path::PathBuf;

use secrecy::SecretString;
use serde::{Deserialize, Deserializer, Serializer};

pub fn is_default<T: Default + PartialEq>(t: &T) -> bool {
	*t == Default::default()
}

/// Durations as human strings ("100ms", "1m30s") in config files.
pub mod serde_dur {
	use duration_str::HumanFormat;
	pub use duration_str::deserialize_duration as deserialize;
	use serde::Serializer;

	pub fn serialize<S: Serializer, T: HumanFormat>(t: &T, serializer: S) -> Result<S::Ok, S::Error> {
		serializer.serialize_str(&t.human_format())
	}
}

pub mod serde_dur_option {
	use duration_str::HumanFormat;
	pub use duration_str::deserialize_option_duration as deserialize;
	use serde::Serializer;

	pub fn serialize<S: Serializer, T: HumanFormat>(
		t: &Option<T>,
		serializer: S,
	) -> Result<S::Ok, S::Error> {
		match t {
			None => serializer.serialize_none(),
			Some(t) => serializer.serialize_str(&t.human_format()),
		}
	}
}

pub fn ser_redact<S: Serializer, T>(_t: &T, serializer: S) -> Result<S::Ok, S::Error> {
	serializer.serialize_str("<redacted>")
}

pub fn ser_display<S: Serializer, T: std::fmt::Display>(
	t: &T,
	serializer: S,
) -> Result<S::Ok, S::Error> {
	serializer.serialize_str(&t.to_string())
}

/// Secrets may be given inline or as a file path.
#[derive(Debug, Clone, serde::Deserialize)]
#[serde(untagged)]
pub enum FileOrInline {
	File { file: PathBuf },
	Inline(String),
}

impl FileOrInline {
	pub fn load(&self) -> io::Result<String> {
		match self {
			FileOrInline::File { file } => std::fs::read_to_string(file),
			FileOrInline::Inline(s) => Ok(s.clone()),
		}
	}
}

pub fn deser_key_from_file<'de, D>(deserializer: D) -> Result<SecretString, D::Error>
where
	D: Deserializer<'de>,
{
	let input = FileOrInline::deserialize(deserializer)?;
	let k = input
		.load()
		.map_err(|e| serde::de::Error::custom(e.to_string()))?;
	Ok(SecretString::from(k.trim().to_string()))
}

pub fn deser_key_from_file_option<'de, D>(deserializer: D) -> Result<Option<SecretString>, D::Error>
where
	D: Deserializer<'de>,
{
	let input = Option::<FileOrInline>::deserialize(deserializer)?;
	let Some(input) = input else { return Ok(None) };
	let k = input
		.load()
		.map_err(|e| serde::de::Error::custom(e.to_string()))?;
	Ok(Some(SecretString::from(k.trim().to_string())))
}
