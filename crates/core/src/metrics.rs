//! Helpers for prometheus label encoding.

use std::fmt;
use std::fmt::Write;

use prometheus_client::encoding::{EncodeLabelValue, LabelValueEncoder};

use crate::strng::{RichStrng, Strng};

/// A label value that encodes as "unknown" when absent.
///
/// Prometheus requires every label to have a value; many of ours are only
/// known part way through a request (backend, route, status).
#[derive(Clone, Hash, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub struct DefaultedUnknown<T>(Option<T>);

impl<T> Default for DefaultedUnknown<T> {
	fn default() -> Self {
		DefaultedUnknown(None)
	}
}

impl<T> DefaultedUnknown<T> {
	pub fn new(t: T) -> Self {
		DefaultedUnknown(Some(t))
	}
	pub fn inner(&self) -> Option<&T> {
		self.0.as_ref()
	}
}

impl<T> From<Option<T>> for DefaultedUnknown<T> {
	fn from(t: Option<T>) -> Self {
		DefaultedUnknown(t)
	}
}

impl From<Strng> for DefaultedUnknown<RichStrng> {
	fn from(t: Strng) -> Self {
		DefaultedUnknown(Some(t.into()))
	}
}

impl From<&Strng> for DefaultedUnknown<RichStrng> {
	fn from(t: &Strng) -> Self {
		DefaultedUnknown(Some(t.clone().into()))
	}
}

impl From<Option<&Strng>> for DefaultedUnknown<RichStrng> {
	fn from(t: Option<&Strng>) -> Self {
		DefaultedUnknown(t.map(|s| s.clone().into()))
	}
}

impl From<String> for DefaultedUnknown<RichStrng> {
	fn from(t: String) -> Self {
		DefaultedUnknown(Some(t.into()))
	}
}

impl From<&str> for DefaultedUnknown<RichStrng> {
	fn from(t: &str) -> Self {
		DefaultedUnknown(Some(t.into()))
	}
}

impl<T: EncodeLabelValue> EncodeLabelValue for DefaultedUnknown<T> {
	fn encode(&self, writer: &mut LabelValueEncoder) -> Result<(), fmt::Error> {
		match &self.0 {
			Some(i) => i.encode(writer),
			None => writer.write_str("unknown"),
		}
	}
}

/// Encode any Display type as a label value.
#[derive(Clone, Hash, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub struct EncodeDisplay<T>(pub T);

impl<T: fmt::Display> EncodeLabelValue for EncodeDisplay<T> {
	fn encode(&self, writer: &mut LabelValueEncoder) -> Result<(), fmt::Error> {
		write!(writer, "{}", self.0)
	}
}

/// Encode any Debug type as a label value.
#[derive(Clone, Hash, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub struct EncodeDebug<T>(pub T);

impl<T: fmt::Debug> EncodeLabelValue for EncodeDebug<T> {
	fn encode(&self, writer: &mut LabelValueEncoder) -> Result<(), fmt::Error> {
		write!(writer, "{:?}", self.0)
	}
}
