//! Cheaply clonable interned strings. Provider names, model names and tenant
//! ids are copied onto nearly every request, log line and metric label, so we
//! use reference counted strings throughout rather than `String`.

use std::fmt::{Display, Formatter};

use prometheus_client::encoding::{EncodeLabelValue, LabelValueEncoder};

pub type Strng = arcstr::ArcStr;

pub use arcstr::format;
pub use arcstr::literal;

pub fn new<A: AsRef<str>>(s: A) -> Strng {
	arcstr::ArcStr::from(s.as_ref())
}

/// A `Strng` that can be used directly as a prometheus label value.
#[derive(Clone, Hash, Default, Debug, PartialEq, Eq)]
pub struct RichStrng(Strng);

impl RichStrng {
	pub fn as_str(&self) -> &str {
		self.0.as_str()
	}
}

impl<T: AsRef<str>> From<T> for RichStrng {
	fn from(value: T) -> Self {
		RichStrng(new(value))
	}
}

impl Display for RichStrng {
	fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
		self.0.fmt(f)
	}
}

impl EncodeLabelValue for RichStrng {
	fn encode(&self, encoder: &mut LabelValueEncoder) -> Result<(), std::fmt::Error> {
		use std::fmt::Write;
		encoder.write_str(self.0.as_str())
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn literal_and_new_are_equal() {
		let a = literal!("openai");
		let b = new(String::from("openai"));
		assert_eq!(a, b);
	}
}
