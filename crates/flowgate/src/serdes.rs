//! Shared serde helpers for config types.

use std::fmt::Display;
use std::str::FromStr;

use serde::{Deserialize, Deserializer, Serializer};

pub fn ser_display<S: Serializer, T: Display>(t: &T, serializer: S) -> Result<S::Ok, S::Error> {
	serializer.serialize_str(&t.to_string())
}

pub fn de_parse<'de, D, T>(deserializer: D) -> Result<T, D::Error>
where
	D: Deserializer<'de>,
	T: FromStr,
	T::Err: Display,
{
	let s = String::deserialize(deserializer)?;
	T::from_str(&s).map_err(serde::de::Error::custom)
}

pub fn ser_bytes<S: Serializer, T: AsRef<[u8]>>(t: &T, serializer: S) -> Result<S::Ok, S::Error> {
	match std::str::from_utf8(t.as_ref()) {
		Ok(s) => serializer.serialize_str(s),
		Err(_) => serializer.serialize_none(),
	}
}

/// Credential material never leaves the process via config dumps.
pub fn ser_redacted<S: Serializer>(
	_: &secrecy::SecretString,
	serializer: S,
) -> Result<S::Ok, S::Error> {
	serializer.serialize_str("<redacted>")
}

pub fn ser_redacted_option<S: Serializer>(
	v: &Option<secrecy::SecretString>,
	serializer: S,
) -> Result<S::Ok, S::Error> {
	match v {
		Some(_) => serializer.serialize_some("<redacted>"),
		None => serializer.serialize_none(),
	}
}

/// Durations as Go-style strings ("250ms", "1h30m").
pub mod serde_dur {
	use std::time::Duration;

	use serde::{Deserialize, Deserializer, Serializer};

	pub fn serialize<S: Serializer>(d: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
		serializer.serialize_str(&flowgate_core::durfmt::format(*d))
	}

	pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
		let s = String::deserialize(deserializer)?;
		flowgate_core::durfmt::parse(&s).map_err(serde::de::Error::custom)
	}
}

pub mod serde_dur_option {
	use std::time::Duration;

	use serde::{Deserialize, Deserializer, Serializer};

	pub fn serialize<S: Serializer>(
		d: &Option<Duration>,
		serializer: S,
	) -> Result<S::Ok, S::Error> {
		match d {
			Some(d) => serializer.serialize_some(&flowgate_core::durfmt::format(*d)),
			None => serializer.serialize_none(),
		}
	}

	pub fn deserialize<'de, D: Deserializer<'de>>(
		deserializer: D,
	) -> Result<Option<Duration>, D::Error> {
		let s = Option::<String>::deserialize(deserializer)?;
		s.map(|s| flowgate_core::durfmt::parse(&s).map_err(serde::de::Error::custom))
			.transpose()
	}
}
