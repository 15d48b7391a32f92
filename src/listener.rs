use crate::{
	errors::{AcceptError, ListenError, RunError},
	ChildConnection,
	ChildListener,
	ForkOptions,
	Network,
	ParentListener,
};
use socket2::SockAddr;
use std::{
	env,
	ffi::OsStr,
	io,
	sync::{
		atomic::{AtomicBool, Ordering},
		Arc,
	},
	time::{Duration, Instant},
};

/// Which side of the handoff this process is on.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Role {
	/// This process binds the real listener and spawns children.
	Parent,

	/// This process was spawned by a parent, and has a connection waiting at file descriptor 3.
	Child,
}

impl Role {
	/// Decides the role from this process's environment: [`Role::Child`] if the variable named by [`ForkOptions::child_env_name`] is set to exactly `1`, otherwise [`Role::Parent`].
	pub fn from_env(options: &ForkOptions) -> Self {
		Self::from_marker(env::var_os(&options.child_env_name).as_deref())
	}

	/// Decides the role from the value of the marker variable, if it is set.
	pub fn from_marker(marker: Option<&OsStr>) -> Self {
		match marker {
			Some(value) if value == "1" => Self::Child,
			_ => Self::Parent,
		}
	}
}

/// Limits on how long, and whether, [`listen_context`] may keep setting up a listener.
///
/// The context only covers setup. Once a listener has been returned, cancelling its context has no effect on it.
///
/// Clones share the same cancellation flag, so a context can be cancelled from another thread.
#[derive(Clone, Debug, Default)]
pub struct BindContext {
	deadline: Option<Instant>,
	cancelled: Arc<AtomicBool>,
}

impl BindContext {
	/// A context with no deadline, which is never cancelled unless [`cancel`][Self::cancel] is called.
	pub fn new() -> Self {
		Self::default()
	}

	/// Gives up with [`ListenError::DeadlineExceeded`] once `deadline` has passed.
	pub fn with_deadline(mut self, deadline: Instant) -> Self {
		self.deadline = Some(deadline);
		self
	}

	/// Like [`with_deadline`][Self::with_deadline], with the deadline `timeout` from now.
	pub fn with_timeout(self, timeout: Duration) -> Self {
		self.with_deadline(Instant::now() + timeout)
	}

	/// Cancels this context and every clone of it. Setup still in progress fails with [`ListenError::Cancelled`] at its next check.
	pub fn cancel(&self) {
		self.cancelled.store(true, Ordering::SeqCst);
	}

	/// Whether [`cancel`][Self::cancel] has been called on this context or a clone of it.
	pub fn is_cancelled(&self) -> bool {
		self.cancelled.load(Ordering::SeqCst)
	}

	/// The deadline, if there is one.
	pub fn deadline(&self) -> Option<Instant> {
		self.deadline
	}

	pub(crate) fn check(&self) -> Result<(), ListenError> {
		if self.is_cancelled() {
			return Err(ListenError::Cancelled);
		}

		if let Some(deadline) = self.deadline {
		if Instant::now() >= deadline {
			return Err(ListenError::DeadlineExceeded);
		}}

		Ok(())
	}
}

/// A listener that is either a [`ParentListener`] or a [`ChildListener`], depending on how this process was started. Created by [`listen`].
///
/// The same server code runs in both roles. In the parent, [`accept`][Self::accept] hands connections to children and only returns when the listener is closed or fails. In a child, it yields the one connection the parent handed over, and then reports [`AcceptError::Closed`] once that connection is done.
#[derive(Debug)]
pub enum Listener {
	Parent(ParentListener),
	Child(ChildListener),
}

impl Listener {
	/// Accepts a connection.
	///
	/// In a child, this yields the inherited connection once. In the parent, this runs the accept loop and never yields a connection. See [`ParentListener::accept`].
	///
	/// # Errors
	///
	/// [`AcceptError::Closed`] when there are no more connections to give, which is the normal way for a server loop to end. In the parent, also [`AcceptError::Io`].
	pub fn accept(&self) -> Result<ChildConnection, AcceptError> {
		match self {
			Self::Parent(listener) => match listener.accept() {
				Ok(never) => match never {},
				Err(error) => Err(error),
			},

			Self::Child(listener) => listener.accept(),
		}
	}

	/// An iterator over accepted connections, which ends when the listener is closed.
	///
	/// Errors other than [`AcceptError::Closed`] are yielded once, and end the iteration.
	pub fn incoming(&self) -> Incoming<'_> {
		Incoming {
			listener: self,
			done: false,
		}
	}

	/// Closes the listener, waking any blocked [`accept`][Self::accept]. Closing more than once is harmless.
	pub fn close(&self) -> io::Result<()> {
		match self {
			Self::Parent(listener) => listener.close(),
			Self::Child(listener) => listener.close(),
		}
	}

	/// The address the listener is bound to, or, in a child, the local address of the inherited connection.
	pub fn local_addr(&self) -> &SockAddr {
		match self {
			Self::Parent(listener) => listener.local_addr(),
			Self::Child(listener) => listener.local_addr(),
		}
	}

	/// See [`ParentListener::start`]. Fails with [`RunError::ChildListener`] in a child.
	pub fn start(&self) -> Result<(), RunError> {
		match self {
			Self::Parent(listener) => listener.start(),
			Self::Child(listener) => listener.start(),
		}
	}

	/// See [`ParentListener::wait`]. Fails with [`RunError::ChildListener`] in a child.
	pub fn wait(&self) -> Result<(), RunError> {
		match self {
			Self::Parent(listener) => listener.wait(),
			Self::Child(listener) => listener.wait(),
		}
	}

	/// See [`ParentListener::run`]. Fails with [`RunError::ChildListener`] in a child.
	pub fn run(&self) -> Result<(), RunError> {
		match self {
			Self::Parent(listener) => listener.run(),
			Self::Child(listener) => listener.run(),
		}
	}

	pub fn is_child(&self) -> bool {
		matches!(self, Self::Child(_))
	}

	pub fn is_parent(&self) -> bool {
		matches!(self, Self::Parent(_))
	}
}

impl From<ParentListener> for Listener {
	fn from(listener: ParentListener) -> Self {
		Self::Parent(listener)
	}
}

impl From<ChildListener> for Listener {
	fn from(listener: ChildListener) -> Self {
		Self::Child(listener)
	}
}

/// Iterator returned by [`Listener::incoming`].
#[derive(Debug)]
pub struct Incoming<'a> {
	listener: &'a Listener,
	done: bool,
}

impl Iterator for Incoming<'_> {
	type Item = Result<ChildConnection, AcceptError>;

	fn next(&mut self) -> Option<Self::Item> {
		if self.done {
			return None;
		}

		match self.listener.accept() {
			Ok(connection) => Some(Ok(connection)),

			Err(error) => {
				self.done = true;

				match error {
					AcceptError::Closed => None,
					error => Some(Err(error)),
				}
			}
		}
	}
}

/// Creates a listener.
///
/// If this process was started by a parent listener (see [`Role::from_env`]), this adopts the connection the parent handed over, and `network` and `address` are ignored. Otherwise, this binds a socket on `network` (like `tcp` or `unix`) at `address` (like `127.0.0.1:8080`, `:8080`, or a socket path).
///
/// Only `tcp`, `tcp4`, `tcp6`, and `unix` listeners can hand off connections. Other networks are bound and then rejected.
///
///
/// # Example
///
/// ```no_run
/// use fork_listener::{listen, ForkOptions};
/// use std::io::Write;
///
/// let listener = listen("tcp", "127.0.0.1:8080", ForkOptions::default())?;
///
/// if listener.is_parent() {
/// 	// Hand every connection to a copy of this program, until something closes the listener.
/// 	listener.run()?;
/// }
/// else {
/// 	for connection in listener.incoming() {
/// 		let mut connection = connection?;
/// 		writeln!(connection, "hello from process {}", std::process::id())?;
/// 	}
/// }
/// # Ok::<(), Box<dyn std::error::Error>>(())
/// ```
///
///
/// # Errors
///
/// See [`ListenError`]. Nothing is spawned when this fails.
pub fn listen(network: &str, address: &str, options: ForkOptions) -> Result<Listener, ListenError> {
	listen_context(&BindContext::new(), network, address, options)
}

/// Like [`listen`], but gives up with [`ListenError::Cancelled`] or [`ListenError::DeadlineExceeded`] if `context` is cancelled or its deadline passes while the socket is being set up.
///
/// The context is checked between setup steps, not during them. In particular, resolving the address, which may mean a DNS lookup that blocks for a while, can't be interrupted. The context is checked right after resolving finishes, so a context that was cancelled or expired in the meantime still prevents the socket from being created.
///
/// A child process ignores `context`, since adopting the inherited connection doesn't block.
pub fn listen_context(
	context: &BindContext,
	network: &str,
	address: &str,
	options: ForkOptions,
) -> Result<Listener, ListenError> {
	let role = Role::from_env(&options);
	listen_with_role(role, context, network, address, options)
}

/// Like [`listen_context`], but with the role decided by the caller instead of by the environment.
pub fn listen_with_role(
	role: Role,
	context: &BindContext,
	network: &str,
	address: &str,
	options: ForkOptions,
) -> Result<Listener, ListenError> {
	match role {
		Role::Child => ChildListener::inherit().map(Listener::Child),

		Role::Parent => {
			let network: Network = network.parse()?;
			ParentListener::bind(context, network, address, options).map(Listener::Parent)
		}
	}
}

#[cfg(test)]
mod tests {
	use assert_matches::assert_matches;
	use crate::errors::InvalidNetworkError;
	use std::{
		io::{Read, Write},
		os::unix::net::UnixStream,
		thread,
	};
	use super::*;

	#[test]
	fn test_role_from_marker() {
		assert_eq!(Role::from_marker(Some(OsStr::new("1"))), Role::Child);
		assert_eq!(Role::from_marker(Some(OsStr::new("0"))), Role::Parent);
		assert_eq!(Role::from_marker(Some(OsStr::new("true"))), Role::Parent);
		assert_eq!(Role::from_marker(Some(OsStr::new(""))), Role::Parent);
		assert_eq!(Role::from_marker(None), Role::Parent);

		let options = ForkOptions::default()
			.with_child_env_name("FORK_LISTENER_TEST_UNSET_MARKER");

		assert_eq!(Role::from_env(&options), Role::Parent);
	}

	#[test]
	fn test_bind_context() {
		let context = BindContext::new();
		assert_eq!(context.deadline(), None);
		context.check().unwrap();

		let clone = context.clone();
		clone.cancel();
		assert!(context.is_cancelled());
		assert_matches!(context.check(), Err(ListenError::Cancelled));

		let before = Instant::now();
		let context = BindContext::new().with_timeout(Duration::from_secs(60));
		assert!(context.deadline().unwrap() >= before + Duration::from_secs(60));
		context.check().unwrap();

		let context = BindContext::new().with_deadline(before);
		assert_matches!(context.check(), Err(ListenError::DeadlineExceeded));
	}

	#[test]
	fn test_parent_listener() {
		let listener = listen_with_role(
			Role::Parent,
			&BindContext::new(),
			"tcp4",
			"127.0.0.1:0",
			ForkOptions::default(),
		).unwrap();

		assert!(listener.is_parent());
		assert!(!listener.is_child());
		assert_ne!(listener.local_addr().as_socket().unwrap().port(), 0);

		listener.close().unwrap();
		assert_matches!(listener.accept(), Err(AcceptError::Closed));
		assert_eq!(listener.incoming().count(), 0);
	}

	#[test]
	fn test_invalid_network() {
		assert_matches!(
			listen_with_role(Role::Parent, &BindContext::new(), "sctp", ":0", ForkOptions::default()),
			Err(ListenError::InvalidNetwork(InvalidNetworkError { network, .. }))
			if network == "sctp"
		);
	}

	#[test]
	fn test_child_listener() {
		let (a, mut b) = UnixStream::pair().unwrap();
		let listener = Listener::from(ChildListener::from_connection(a.into()).unwrap());

		assert!(listener.is_child());
		assert_matches!(listener.run(), Err(RunError::ChildListener { .. }));

		let server = thread::spawn(move || {
			let mut served = 0;

			for connection in listener.incoming() {
				let mut connection = connection.unwrap();
				connection.write_all(b"pong").unwrap();
				served += 1;
			}

			served
		});

		let mut received = String::new();
		b.read_to_string(&mut received).unwrap();
		assert_eq!(received, "pong");

		assert_eq!(server.join().unwrap(), 1);
	}
}
