//! This library provides a listener that hands every accepted connection to a freshly spawned copy of the running program.
//!
//! The same program runs on both sides. The first copy, the *parent*, binds a socket and accepts connections. For each connection, it starts the program again, with the connection at file descriptor 3 and an environment variable marking the new process as a *child*. When the child calls [`listen`] with the same arguments, it gets a listener that yields that one connection and then reports that it is closed. Server code written as an ordinary accept loop therefore serves one connection per process, each in its own session and optionally as a different user.
//!
//!
//! # Usage
//!
//! The entry point of this library is the [`listen`][listen()] function, which returns a [`Listener`]:
//!
//! ```no_run
//! use fork_listener::{listen, ForkOptions};
//! use std::io::{self, Write};
//!
//! fn main() -> io::Result<()> {
//! 	let listener = listen("tcp", ":8080", ForkOptions::default())?;
//!
//! 	if listener.is_parent() {
//! 		return match listener.run() {
//! 			Err(error) if error.is_closed() => Ok(()),
//! 			result => Ok(result?),
//! 		};
//! 	}
//!
//! 	loop {
//! 		let mut connection = match listener.accept() {
//! 			Ok(connection) => connection,
//! 			Err(error) if error.is_closed() => return Ok(()),
//! 			Err(error) => return Err(error.into()),
//! 		};
//!
//! 		writeln!(connection, "served by process {}", std::process::id())?;
//! 	}
//! }
//! ```
//!
//! The parent never exits on its own. Something has to [`close`][Listener::close] its listener, for example a signal handler holding a clone of the [`ParentListener`].
//!
//!
//! # Logging
//!
//! This library logs through [`tracing`]: each handoff at the `debug` level, and each failed handoff at the `error` level. It never installs a subscriber of its own.
//!
//!
//! # Platform support
//!
//! Unix-like platforms only. The handoff depends on file descriptor inheritance and `setsid`.
#![cfg_attr(feature = "tokio", doc = r#"

# Feature flags

* `tokio`: Adds [`ChildConnection::into_tokio`], which converts a delivered connection for use with [`tokio`].
"#)]

#![allow(clippy::tabs_in_doc_comments)] // This project uses tabs for indentation throughout, including in documentation examples.

cfg_if::cfg_if! {
	if #[cfg(unix)] {
		mod addr;
		mod child;
		mod connection;
		pub mod convert;
		pub mod errors;
		pub mod identity;
		mod listener;
		mod options;
		mod parent;
		mod spawn;
		mod sync;
		mod sys;

		pub use self::{
			addr::*,
			child::*,
			connection::{Connection, TransferableConnection},
			errors::is_closed,
			listener::*,
			options::*,
			parent::*,
			spawn::fork,
			sys::INHERITED_CONNECTION_FD,
		};
	}
	else {
		compile_error!("fork_listener only supports Unix-like platforms");
	}
}
