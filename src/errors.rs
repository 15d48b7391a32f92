//! Various errors that can be raised by this library.

use std::{
	io,
	os::fd::RawFd,
	process::ExitStatus,
	sync::Arc,
};

#[cfg(doc)]
use crate::{
	listen,
	listen_context,
	BindContext,
	ChildListener,
	Listener,
	Network,
	ParentListener,
};

/// An error parsing a [`Network`] from a string.
#[derive(Debug, thiserror::Error)]
#[error("unrecognized network `{network}` (expected `tcp`, `tcp4`, `tcp6`, `unix`, `unixpacket`, `udp`, `udp4`, `udp6`, or `unixgram`)")]
#[non_exhaustive]
pub struct InvalidNetworkError {
	/// The string that could not be parsed.
	pub network: String,
}

/// An error that occurred while constructing a [`Listener`] with [`listen`] or [`listen_context`].
///
/// All of these are fatal to construction. Nothing is retried.
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum ListenError {
	/// The network name was not recognized.
	#[error("{0}")]
	InvalidNetwork(#[from] InvalidNetworkError),

	/// The address could not be resolved.
	#[error("couldn't resolve address `{address}`: {error}")]
	#[non_exhaustive]
	ResolveAddress {
		/// The address as given.
		address: String,

		/// The error that this one arose from.
		#[source]
		error: io::Error,
	},

	/// The address resolved, but not to any address of the family the network requires (for example, an IPv6 address with `tcp4`).
	#[error("address `{address}` has no usable address for this network")]
	#[non_exhaustive]
	NoUsableAddress {
		/// The address as given.
		address: String,
	},

	/// The Unix-domain socket path is invalid. This most likely indicates that the path is too long.
	#[error("invalid Unix-domain socket path: {error}")]
	#[non_exhaustive]
	InvalidUnixPath {
		/// The error that this one arose from.
		#[source]
		error: io::Error,
	},

	/// [`socket2::Socket::new`] failed.
	#[error("couldn't create socket: {error}")]
	#[non_exhaustive]
	CreateSocket {
		/// The error that this one arose from.
		#[source]
		error: io::Error,
	},

	/// A stale Unix-domain socket could not be removed.
	#[error("{0}")]
	Cleanup(#[from] CleanupSocketError),

	/// Setting a socket option failed.
	#[error("couldn't set socket option `{option}`: {error}")]
	#[non_exhaustive]
	SetSockOpt {
		/// The name of the socket option, like `SO_REUSEADDR`.
		option: &'static str,

		/// The error that this one arose from.
		#[source]
		error: io::Error,
	},

	/// [`socket2::Socket::bind`] failed.
	#[error("couldn't bind socket to address: {error}")]
	#[non_exhaustive]
	Bind {
		/// The error that this one arose from.
		#[source]
		error: io::Error,
	},

	/// [`socket2::Socket::listen`] failed.
	#[error("couldn't make the socket listen: {error}")]
	#[non_exhaustive]
	Listen {
		/// The error that this one arose from.
		#[source]
		error: io::Error,
	},

	/// The type, protocol, or state of the bound socket could not be determined.
	#[error("couldn't check the bound socket: {error}")]
	#[non_exhaustive]
	CheckSocket {
		/// The error that this one arose from.
		#[source]
		error: io::Error,
	},

	/// The bound socket is not a TCP or Unix-domain stream listener. Only those can hand connections to a child process.
	#[error("unsupported listener type {kind}")]
	#[non_exhaustive]
	UnsupportedListenerType {
		/// A description of the socket that was bound, like `UDP socket`.
		kind: String,
	},

	/// The process was started as a child, but the inherited descriptor slot is not open.
	#[error("invalid connection file descriptor {fd}: {error}")]
	#[non_exhaustive]
	InvalidInheritedDescriptor {
		/// The descriptor number that was checked.
		fd: RawFd,

		/// The error that this one arose from.
		#[source]
		error: io::Error,
	},

	/// The process was started as a child, and the inherited descriptor is open, but it could not be inspected. This usually means it is not a socket.
	#[error("couldn't check inherited file descriptor {fd}: {error}")]
	#[non_exhaustive]
	CheckInheritedDescriptor {
		/// The descriptor number that was checked.
		fd: RawFd,

		/// The error that this one arose from.
		#[source]
		error: io::Error,
	},

	/// The process was started as a child, and the inherited descriptor is open, but it is not a connected TCP or Unix-domain stream socket.
	#[error("inherited file descriptor {fd} is not a connected TCP or Unix-domain stream socket (found {kind})")]
	#[non_exhaustive]
	InheritedNotConnection {
		/// The descriptor number that was checked.
		fd: RawFd,

		/// A description of what was found instead.
		kind: String,
	},

	/// The [`BindContext`] was cancelled.
	#[error("listen was cancelled")]
	Cancelled,

	/// The deadline of the [`BindContext`] passed.
	#[error("listen deadline exceeded")]
	DeadlineExceeded,
}

impl From<ListenError> for io::Error {
	fn from(error: ListenError) -> Self {
		use io::ErrorKind as EK;

		let kind = match &error {
			ListenError::InvalidNetwork(_)                  => EK::InvalidInput,
			ListenError::NoUsableAddress { .. }             => EK::AddrNotAvailable,
			ListenError::UnsupportedListenerType { .. }     => EK::Unsupported,
			ListenError::InheritedNotConnection { .. }      => EK::InvalidData,
			ListenError::Cancelled                          => EK::Interrupted,
			ListenError::DeadlineExceeded                   => EK::TimedOut,

			| ListenError::ResolveAddress { error, .. }
			| ListenError::InvalidUnixPath { error }
			| ListenError::CreateSocket { error }
			| ListenError::SetSockOpt { error, .. }
			| ListenError::Bind { error }
			| ListenError::Listen { error }
			| ListenError::CheckSocket { error }
			| ListenError::InvalidInheritedDescriptor { error, .. }
			| ListenError::CheckInheritedDescriptor { error, .. }
			| ListenError::Cleanup(
				| CleanupSocketError::Stat { error }
				| CleanupSocketError::Unlink { error }
			)
			=> error.kind(),
		};

		io::Error::new(kind, error)
	}
}

/// Error raised when a stale Unix-domain socket is checked for or removed before binding.
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum CleanupSocketError {
	/// [`std::fs::symlink_metadata`] reported an error checking for a stale socket.
	#[error("couldn't check for a stale Unix-domain socket: {error}")]
	#[non_exhaustive]
	Stat {
		#[source]
		error: io::Error,
	},

	/// There is a stale socket at the designated path, but [`std::fs::remove_file`] reported an error removing it.
	#[error("couldn't remove the stale Unix-domain socket: {error}")]
	#[non_exhaustive]
	Unlink {
		#[source]
		error: io::Error,
	},
}

/// The error that ends an accept loop.
///
/// On a [`ParentListener`], this is the terminal error: it is recorded once and can be retrieved again with [`ParentListener::wait`]. It is cheap to clone.
///
/// On a [`ChildListener`], the only error is [`AcceptError::Closed`].
#[derive(Clone, Debug, thiserror::Error)]
#[non_exhaustive]
pub enum AcceptError {
	/// The listener was closed. This is the expected way for an accept loop to end.
	#[error("listener closed")]
	Closed,

	/// The underlying socket reported an error.
	#[error("couldn't accept a connection: {error}")]
	#[non_exhaustive]
	Io {
		/// The error that this one arose from.
		#[source]
		error: Arc<io::Error>,
	},
}

impl AcceptError {
	/// Returns true if this is [`AcceptError::Closed`].
	pub fn is_closed(&self) -> bool {
		matches!(self, Self::Closed)
	}

	pub(crate) fn io(error: io::Error) -> Self {
		Self::Io { error: Arc::new(error) }
	}
}

impl From<AcceptError> for io::Error {
	fn from(error: AcceptError) -> Self {
		let kind = match &error {
			AcceptError::Closed => io::ErrorKind::NotConnected,
			AcceptError::Io { error } => error.kind(),
		};

		io::Error::new(kind, error)
	}
}

/// Returns true if `error` was produced from [`AcceptError::Closed`], either directly or through [`RunError`].
///
/// This tells intentional shutdown apart from a genuine failure, for callers that have converted errors into [`io::Error`].
pub fn is_closed(error: &io::Error) -> bool {
	error.get_ref()
	.and_then(|inner| inner.downcast_ref::<AcceptError>())
	.is_some_and(AcceptError::is_closed)
}

/// An error from [`Listener::start`], [`Listener::wait`], or [`Listener::run`].
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum RunError {
	/// The operation was attempted on a [`ChildListener`]. A child listener represents a single delivered connection, not a server loop.
	#[error("cannot {operation} a child listener")]
	#[non_exhaustive]
	ChildListener {
		/// The operation that was attempted: `start`, `wait`, or `run`.
		operation: &'static str,
	},

	/// The accept loop ended with this terminal error.
	#[error("{0}")]
	Accept(#[from] AcceptError),

	/// The background accept thread could not be created.
	#[error("couldn't spawn the accept thread: {error}")]
	#[non_exhaustive]
	SpawnThread {
		/// The error that this one arose from.
		#[source]
		error: io::Error,
	},
}

impl RunError {
	/// Returns true if the accept loop ended because the listener was closed.
	pub fn is_closed(&self) -> bool {
		matches!(self, Self::Accept(error) if error.is_closed())
	}
}

impl From<RunError> for io::Error {
	fn from(error: RunError) -> Self {
		match error {
			RunError::ChildListener { .. } => io::Error::new(io::ErrorKind::Unsupported, error),
			RunError::Accept(error) => error.into(),
			RunError::SpawnThread { error } => error,
		}
	}
}

/// An error handing one connection to a child process.
///
/// These errors are local to one connection. They are logged by the parent's worker and never end the accept loop.
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum ForkError {
	/// The accepted socket could not be inspected.
	#[error("couldn't check the accepted connection: {error}")]
	#[non_exhaustive]
	CheckConnection {
		#[source]
		error: io::Error,
	},

	/// The accepted socket is not a TCP or Unix-domain stream connection.
	#[error("unsupported connection type {kind}")]
	#[non_exhaustive]
	UnsupportedConnection {
		/// A description of the socket, like `Unix-domain datagram socket`.
		kind: String,
	},

	/// The connection's descriptor could not be duplicated.
	#[error("couldn't duplicate the connection's file descriptor: {error}")]
	#[non_exhaustive]
	DuplicateDescriptor {
		#[source]
		error: io::Error,
	},

	/// The path of the running executable could not be determined.
	#[error("couldn't determine the running executable: {error}")]
	#[non_exhaustive]
	CurrentExe {
		#[source]
		error: io::Error,
	},

	/// A configured standard stream could not be prepared for the child.
	#[error("couldn't prepare the child's {stream}: {error}")]
	#[non_exhaustive]
	Stdio {
		/// `stdin`, `stdout`, or `stderr`.
		stream: &'static str,

		#[source]
		error: io::Error,
	},

	/// The child process could not be started.
	#[error("couldn't spawn child process: {error}")]
	#[non_exhaustive]
	Spawn {
		#[source]
		error: io::Error,
	},

	/// Waiting for the child process failed.
	#[error("couldn't wait for child process: {error}")]
	#[non_exhaustive]
	Wait {
		#[source]
		error: io::Error,
	},

	/// The child process exited unsuccessfully.
	#[error("child process exited with {status}")]
	#[non_exhaustive]
	ChildExited {
		/// The child's exit status.
		status: ExitStatus,
	},
}

impl From<ForkError> for io::Error {
	fn from(error: ForkError) -> Self {
		let kind = match &error {
			ForkError::UnsupportedConnection { .. } => io::ErrorKind::Unsupported,
			ForkError::ChildExited { .. } => io::ErrorKind::Other,

			| ForkError::CheckConnection { error }
			| ForkError::DuplicateDescriptor { error }
			| ForkError::CurrentExe { error }
			| ForkError::Stdio { error, .. }
			| ForkError::Spawn { error }
			| ForkError::Wait { error }
			=> error.kind(),
		};

		io::Error::new(kind, error)
	}
}

#[test]
fn test_is_closed() {
	assert!(is_closed(&AcceptError::Closed.into()));
	assert!(is_closed(&RunError::Accept(AcceptError::Closed).into()));

	assert!(!is_closed(&AcceptError::io(io::ErrorKind::ConnectionReset.into()).into()));
	assert!(!is_closed(&RunError::ChildListener { operation: "start" }.into()));
	assert!(!is_closed(&io::Error::new(io::ErrorKind::NotConnected, "listener closed")));
}

/// An error converting a [`ChildConnection`][crate::ChildConnection] into a [`TokioConnection`][crate::convert::TokioConnection].
///
/// # Availability
///
/// Requires the `tokio` feature.
#[cfg(feature = "tokio")]
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum IntoTokioError {
	/// There was an error setting non-blocking mode on the socket.
	#[error("couldn't set socket to non-blocking mode: {error}")]
	#[non_exhaustive]
	SetNonBlocking {
		#[source]
		error: io::Error,
	},

	/// There was an error registering the socket with Tokio.
	#[error("couldn't register socket with Tokio: {error}")]
	#[non_exhaustive]
	Wrap {
		#[source]
		error: io::Error,
	},
}

#[cfg(feature = "tokio")]
impl From<IntoTokioError> for io::Error {
	fn from(error: IntoTokioError) -> Self {
		let kind = match &error {
			| IntoTokioError::SetNonBlocking { error }
			| IntoTokioError::Wrap { error }
			=> error.kind(),
		};

		io::Error::new(kind, error)
	}
}
