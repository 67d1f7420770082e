//! Helpers for encoding optional and display-only values as prometheus
//! labels.

use std::fmt::Display;

use prometheus_client::encoding::{EncodeLabelValue, LabelValueEncoder};
use prometheus_client::registry::Registry;

/// An optional label value encoded as `"unknown"` when absent.
#[derive(Clone, Hash, Default, Debug, PartialEq, Eq)]
pub struct DefaultedUnknown<T>(Option<T>);

impl<T> DefaultedUnknown<T> {
	pub fn inner(&self) -> Option<&T> {
		self.0.as_ref()
	}
}

impl<T, X: Into<T>> From<Option<X>> for DefaultedUnknown<T> {
	fn from(value: Option<X>) -> Self {
		DefaultedUnknown(value.map(Into::into))
	}
}

impl<T: EncodeLabelValue> EncodeLabelValue for DefaultedUnknown<T> {
	fn encode(&self, encoder: &mut LabelValueEncoder) -> Result<(), std::fmt::Error> {
		use std::fmt::Write;
		match &self.0 {
			Some(v) => v.encode(encoder),
			None => encoder.write_str("unknown"),
		}
	}
}

/// Encode any `Display` type as its display form.
#[derive(Clone, Hash, Default, Debug, PartialEq, Eq)]
pub struct EncodeDisplay<T>(pub T);

impl<T: Display> From<T> for EncodeDisplay<T> {
	fn from(value: T) -> Self {
		EncodeDisplay(value)
	}
}

impl<T: Display> EncodeLabelValue for EncodeDisplay<T> {
	fn encode(&self, encoder: &mut LabelValueEncoder) -> Result<(), std::fmt::Error> {
		use std::fmt::Write;
		write!(encoder, "{}", self.0)
	}
}

/// Registers everything under a common prefix.
pub fn sub_registry(registry: &mut Registry) -> &mut Registry {
	registry.sub_registry_with_prefix("modelgateway")
}
