//! Conversion of delivered connections to other I/O frameworks.
//!
//! A [`ChildConnection`][crate::ChildConnection] is an ordinary blocking socket. A child that would rather serve its connection asynchronously can convert it here, without giving up the close-on-drop behavior that ends the child's accept loop.

cfg_if::cfg_if! {
	if #[cfg(feature = "tokio")] {
		mod tokio;
		pub use self::tokio::*;
	}
}
