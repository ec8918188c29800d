pub mod arc;
pub mod drain;
pub mod durfmt;
pub mod metrics;
pub mod strng;
pub mod telemetry;
pub mod version;

pub mod prelude {
	pub use crate::strng::{self, Strng};
}
