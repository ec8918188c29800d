//! Cheaply clonable, immutable strings.
//!
//! Configuration and telemetry pass the same names around constantly; `Strng`
//! makes those clones a refcount bump instead of an allocation.

use std::borrow::Borrow;
use std::fmt;
use std::ops::Deref;
use std::sync::Arc;

use serde::{Deserialize, Deserializer, Serialize, Serializer};

#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub struct Strng(Inner);

#[derive(Clone)]
enum Inner {
	Static(&'static str),
	Shared(Arc<str>),
}

impl Default for Inner {
	fn default() -> Self {
		Inner::Static("")
	}
}

impl PartialEq for Inner {
	fn eq(&self, other: &Self) -> bool {
		self.as_str() == other.as_str()
	}
}
impl Eq for Inner {}
impl PartialOrd for Inner {
	fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
		Some(self.cmp(other))
	}
}
impl Ord for Inner {
	fn cmp(&self, other: &Self) -> std::cmp::Ordering {
		self.as_str().cmp(other.as_str())
	}
}
impl std::hash::Hash for Inner {
	fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
		self.as_str().hash(state)
	}
}

impl Inner {
	fn as_str(&self) -> &str {
		match self {
			Inner::Static(s) => s,
			Inner::Shared(s) => s,
		}
	}
}

impl Strng {
	pub const fn from_static(s: &'static str) -> Strng {
		Strng(Inner::Static(s))
	}
	pub fn as_str(&self) -> &str {
		self.0.as_str()
	}
	pub fn is_empty(&self) -> bool {
		self.as_str().is_empty()
	}
	pub fn len(&self) -> usize {
		self.as_str().len()
	}
}

pub fn new<S: AsRef<str>>(s: S) -> Strng {
	Strng(Inner::Shared(Arc::from(s.as_ref())))
}

/// literal builds a Strng from a static string without allocating.
#[macro_export]
macro_rules! __strng_literal {
	($s:expr) => {
		$crate::strng::Strng::from_static($s)
	};
}
pub use crate::__strng_literal as literal;

/// format builds a Strng with the normal format machinery.
#[macro_export]
macro_rules! __strng_format {
	($($arg:tt)*) => {
		$crate::strng::new(format!($($arg)*))
	};
}
pub use crate::__strng_format as format;

impl Deref for Strng {
	type Target = str;
	fn deref(&self) -> &str {
		self.as_str()
	}
}

impl Borrow<str> for Strng {
	fn borrow(&self) -> &str {
		self.as_str()
	}
}

impl AsRef<str> for Strng {
	fn as_ref(&self) -> &str {
		self.as_str()
	}
}

impl fmt::Display for Strng {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str(self.as_str())
	}
}

impl fmt::Debug for Strng {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		fmt::Debug::fmt(self.as_str(), f)
	}
}

impl From<&str> for Strng {
	fn from(s: &str) -> Strng {
		new(s)
	}
}

impl From<String> for Strng {
	fn from(s: String) -> Strng {
		Strng(Inner::Shared(Arc::from(s)))
	}
}

impl From<&String> for Strng {
	fn from(s: &String) -> Strng {
		new(s)
	}
}

impl PartialEq<str> for Strng {
	fn eq(&self, other: &str) -> bool {
		self.as_str() == other
	}
}

impl PartialEq<&str> for Strng {
	fn eq(&self, other: &&str) -> bool {
		self.as_str() == *other
	}
}

impl Serialize for Strng {
	fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
		serializer.serialize_str(self.as_str())
	}
}

impl<'de> Deserialize<'de> for Strng {
	fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Strng, D::Error> {
		let s = String::deserialize(deserializer)?;
		Ok(Strng::from(s))
	}
}

/// RichStrng is a Strng usable as a prometheus label value.
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Debug, Default)]
pub struct RichStrng(Strng);

impl RichStrng {
	pub fn as_str(&self) -> &str {
		self.0.as_str()
	}
}

impl<T: Into<Strng>> From<T> for RichStrng {
	fn from(value: T) -> Self {
		RichStrng(value.into())
	}
}

impl Deref for RichStrng {
	type Target = str;
	fn deref(&self) -> &str {
		self.0.as_str()
	}
}

impl prometheus_client::encoding::EncodeLabelValue for RichStrng {
	fn encode(
		&self,
		encoder: &mut prometheus_client::encoding::LabelValueEncoder,
	) -> Result<(), fmt::Error> {
		use std::fmt::Write;
		encoder.write_str(self.as_str())
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn equality_across_representations() {
		let a = literal!("example.com");
		let b = new("example.com");
		assert_eq!(a, b);
		assert_eq!(a, "example.com");
		let mut set = std::collections::HashSet::new();
		set.insert(a);
		assert!(set.contains("example.com"));
	}

	#[test]
	fn format_macro() {
		let s = format!("svc/{}/{}", "ns", "name");
		assert_eq!(s, "svc/ns/name");
	}
}
