use crate::{
	addr::{cleanup_unix_path_socket, BindAddr},
	connection::SocketKind,
	errors::{AcceptError, ForkError, ListenError, RunError},
	spawn,
	sync::{lock, CloseLatch, WaitGroup},
	sys,
	BindContext,
	Connection,
	DisplayAddr,
	ForkOptions,
	Network,
};
use once_cell::sync::OnceCell;
use socket2::{SockAddr, Socket};
use std::{
	convert::Infallible,
	fs,
	io,
	os::{fd::AsFd, unix::net::UnixStream},
	path::{Path, PathBuf},
	sync::{Arc, Mutex, PoisonError, RwLock},
	thread,
};
use tracing::{debug, error, warn};

#[cfg(doc)]
use crate::{listen, ChildListener};

/// The listener a parent process gets from [`listen`]. Every connection it accepts is handed to a new copy of the running program, which sees it through a [`ChildListener`].
///
/// Cloning a `ParentListener` is cheap, and all clones share the same socket. This is how one thread can [`close`][Self::close] a listener that another thread is [`run`][Self::run]ning.
#[derive(Clone, Debug)]
pub struct ParentListener {
	inner: Arc<Inner>,
}

#[derive(Debug)]
struct Inner {
	socket: RwLock<Option<Socket>>,
	addr: SockAddr,
	unix_path: Option<PathBuf>,
	options: Arc<ForkOptions>,

	closed: Arc<CloseLatch>,

	// Closing drops `wake_tx`, which makes `wake_rx` readable and so wakes every blocked accept.
	wake_rx: UnixStream,
	wake_tx: Mutex<Option<UnixStream>>,

	tasks: Arc<WaitGroup>,
	terminal_error: OnceCell<AcceptError>,
}

impl ParentListener {
	pub(crate) fn bind(
		context: &BindContext,
		network: Network,
		address: &str,
		options: ForkOptions,
	) -> Result<Self, ListenError> {
		let bind_addr = network.resolve(address)?;

		context.check()?;

		if let Some(path) = &bind_addr.unix_path {
		if options.unlink_stale_unix_socket {
			cleanup_unix_path_socket(path)?;
		}}

		let socket = match bind_socket(network, &bind_addr.addr, bind_addr.dual_stack) {
			Err(error) if is_ipv6_unavailable(&error) => match bind_addr.ipv4_fallback() {
				Some(fallback) => {
					debug!(%network, %error, "IPv6 is unavailable; listening on IPv4 only");
					bind_socket(network, &fallback, false)?
				}

				None => return Err(error),
			},

			result => result?,
		};

		let BindAddr { unix_path, .. } = bind_addr;

		// From here on, a failure leaves a socket file behind unless it's removed.
		let finished = finish_bind(context, network, socket, &options);

		let (socket, addr, wake_rx, wake_tx) = match finished {
			Ok(ok) => ok,
			Err(error) => {
				if let Some(path) = &unix_path {
					remove_socket_file(path);
				}

				return Err(error);
			}
		};

		debug!(%network, addr = %DisplayAddr(&addr), "listening");

		Ok(Self {
			inner: Arc::new(Inner {
				socket: RwLock::new(Some(socket)),
				addr,
				unix_path,
				options: Arc::new(options),
				closed: CloseLatch::new(),
				wake_rx,
				wake_tx: Mutex::new(Some(wake_tx)),
				tasks: Arc::new(WaitGroup::default()),
				terminal_error: OnceCell::new(),
			}),
		})
	}

	/// Accepts connections, handing each one to a new child process on a thread of its own, until the listener is closed or accepting fails.
	///
	/// This never returns a connection. Connections belong to the child processes. The error it returns is also recorded as the listener's terminal error, for [`wait`][Self::wait], unless an earlier accept loop already recorded one.
	///
	/// Failures to hand off a particular connection are logged and do not end the loop.
	///
	/// # Errors
	///
	/// [`AcceptError::Closed`] when the listener is closed. [`AcceptError::Io`] if the socket reports an error other than a transient one.
	pub fn accept(&self) -> Result<Infallible, AcceptError> {
		self.accept_loop().map_err(|error| self.record(error))
	}

	fn accept_loop(&self) -> Result<Infallible, AcceptError> {
		let inner = &*self.inner;

		loop {
			if inner.closed.is_fired() {
				return Err(AcceptError::Closed);
			}

			let socket_guard = inner.socket.read().unwrap_or_else(PoisonError::into_inner);

			let Some(socket) = socket_guard.as_ref() else {
				return Err(AcceptError::Closed);
			};

			match sys::wait_readable(&[socket.as_fd(), inner.wake_rx.as_fd()]) {
				Ok(()) => {}
				Err(error) if error.kind() == io::ErrorKind::Interrupted => continue,
				Err(error) => return Err(AcceptError::io(error)),
			}

			if inner.closed.is_fired() {
				return Err(AcceptError::Closed);
			}

			match socket.accept() {
				Ok((connection, peer)) => self.dispatch(connection, peer),

				Err(error) if matches!(
					error.kind(),
					| io::ErrorKind::WouldBlock
					| io::ErrorKind::Interrupted
					| io::ErrorKind::ConnectionAborted
				) => continue,

				Err(error) => return Err(AcceptError::io(error)),
			}
		}
	}

	fn record(&self, error: AcceptError) -> AcceptError {
		let _ = self.inner.terminal_error.set(error.clone());
		error
	}

	fn dispatch(&self, connection: Socket, peer: SockAddr) {
		let options = Arc::clone(&self.inner.options);
		let peer = DisplayAddr(&peer).to_string();

		let spawned =
			thread::Builder::new()
			.name("fork-listener-worker".to_owned())
			.spawn({
				let peer = peer.clone();

				move || {
					if let Err(error) = handoff(connection, &options) {
						error!(%peer, %error, "couldn't hand off connection");
					}
				}
			});

		if let Err(error) = spawned {
			error!(%peer, %error, "couldn't spawn a worker thread; dropping connection");
		}
	}

	/// Runs [`accept`][Self::accept] on a background thread, and returns immediately. Use [`wait`][Self::wait] to wait for it to end.
	///
	/// # Errors
	///
	/// [`RunError::SpawnThread`] if the thread can't be created.
	pub fn start(&self) -> Result<(), RunError> {
		let token = self.inner.tasks.add();
		let this = self.clone();

		thread::Builder::new()
		.name("fork-listener-accept".to_owned())
		.spawn(move || {
			let _token = token;
			let _ = this.accept();
		})
		.map_err(|error| RunError::SpawnThread { error })?;

		Ok(())
	}

	/// Blocks until every accept loop started with [`start`][Self::start] has ended.
	///
	/// Child processes that are still running are not waited for.
	///
	/// # Errors
	///
	/// The listener's terminal error, if one has been recorded. After a normal shutdown, that's [`AcceptError::Closed`].
	pub fn wait(&self) -> Result<(), RunError> {
		self.inner.tasks.wait();

		match self.inner.terminal_error.get() {
			Some(error) => Err(error.clone().into()),
			None => Ok(()),
		}
	}

	/// [`start`][Self::start], then [`wait`][Self::wait].
	pub fn run(&self) -> Result<(), RunError> {
		self.start()?;
		self.wait()
	}

	/// Stops accepting connections. Blocked calls to [`accept`][Self::accept] return [`AcceptError::Closed`].
	///
	/// The listening socket is closed, and if it was bound to a Unix-domain socket path, the socket file is removed. Child processes that are already running are unaffected.
	///
	/// Closing an already closed listener does nothing.
	pub fn close(&self) -> io::Result<()> {
		let inner = &*self.inner;

		if !inner.closed.fire() {
			return Ok(());
		}

		lock(&inner.wake_tx).take();

		// Waits for blocked accepts to notice the wakeup and let go of the socket.
		let socket = inner.socket.write().unwrap_or_else(PoisonError::into_inner).take();
		drop(socket);

		if let Some(path) = &inner.unix_path {
			remove_socket_file(path);
		}

		debug!(addr = %DisplayAddr(&inner.addr), "closed");

		Ok(())
	}

	/// The address this listener is bound to. For a TCP listener bound to port 0, this has the port the system picked.
	pub fn local_addr(&self) -> &SockAddr {
		&self.inner.addr
	}
}

impl Drop for Inner {
	fn drop(&mut self) {
		if !self.closed.is_fired() {
		if let Some(path) = &self.unix_path {
			remove_socket_file(path);
		}}
	}
}

fn bind_socket(network: Network, addr: &SockAddr, dual_stack: bool) -> Result<Socket, ListenError> {
	let socket =
		Socket::new(addr.domain(), network.socket_type(), None)
		.map_err(|error| ListenError::CreateSocket { error })?;

	if !network.is_unix() {
		if network.is_connection_oriented() {
			socket.set_reuse_address(true)
			.map_err(|error| ListenError::SetSockOpt { option: "SO_REUSEADDR", error })?;
		}

		if dual_stack || matches!(network, Network::Tcp6 | Network::Udp6) {
			socket.set_only_v6(!dual_stack)
			.map_err(|error| ListenError::SetSockOpt { option: "IPV6_V6ONLY", error })?;
		}
	}

	socket.bind(addr)
	.map_err(|error| ListenError::Bind { error })?;

	Ok(socket)
}

/// Whether `error` means this host can't open IPv6 sockets at all, as opposed to a problem with this particular address.
fn is_ipv6_unavailable(error: &ListenError) -> bool {
	match error {
		ListenError::CreateSocket { error } => error.raw_os_error() == Some(libc::EAFNOSUPPORT),

		| ListenError::Bind { error }
		| ListenError::SetSockOpt { error, .. }
		=> matches!(error.raw_os_error(), Some(libc::EAFNOSUPPORT | libc::EADDRNOTAVAIL)),

		_ => false,
	}
}

type Bound = (Socket, SockAddr, UnixStream, UnixStream);

fn finish_bind(
	context: &BindContext,
	network: Network,
	socket: Socket,
	options: &ForkOptions,
) -> Result<Bound, ListenError> {
	if network.is_connection_oriented() {
		socket.listen(options.listen_backlog.unwrap_or(ForkOptions::DEFAULT_LISTEN_BACKLOG))
		.map_err(|error| ListenError::Listen { error })?;
	}

	context.check()?;

	let socket: Socket = match SocketKind::try_from(socket) {
		Ok(SocketKind::TcpListener(listener)) => listener.into(),
		Ok(SocketKind::UnixListener(listener)) => listener.into(),

		Ok(other) => return Err(ListenError::UnsupportedListenerType {
			kind: other.describe(),
		}),

		Err(error) => return Err(ListenError::CheckSocket { error }),
	};

	socket.set_nonblocking(true)
	.map_err(|error| ListenError::SetSockOpt { option: "O_NONBLOCK", error })?;

	let addr =
		socket.local_addr()
		.map_err(|error| ListenError::CheckSocket { error })?;

	let (wake_rx, wake_tx) =
		UnixStream::pair()
		.map_err(|error| ListenError::CreateSocket { error })?;

	Ok((socket, addr, wake_rx, wake_tx))
}

fn handoff(socket: Socket, options: &ForkOptions) -> Result<(), ForkError> {
	spawn::fork(accepted_connection(socket)?, options)
}

fn accepted_connection(socket: Socket) -> Result<Connection, ForkError> {
	// Some platforms pass the listener's non-blocking mode on to accepted sockets. The child expects a blocking one.
	socket.set_nonblocking(false)
	.map_err(|error| ForkError::CheckConnection { error })?;

	match SocketKind::from_accepted(socket) {
		Ok(SocketKind::TcpStream(s)) => Ok(s.into()),
		Ok(SocketKind::UnixStream(s)) => Ok(s.into()),

		Ok(other) => Err(ForkError::UnsupportedConnection {
			kind: other.describe(),
		}),

		Err(error) => Err(ForkError::CheckConnection { error }),
	}
}

fn remove_socket_file(path: &Path) {
	if let Err(error) = fs::remove_file(path) {
	if error.kind() != io::ErrorKind::NotFound {
		warn!(path = %path.display(), %error, "couldn't remove Unix-domain socket file");
	}}
}

#[cfg(test)]
mod tests {
	use assert_matches::assert_matches;
	use crate::addr::{is_unix_socket, test_scratch_path};
	use std::{
		net::{Ipv4Addr, Ipv6Addr, SocketAddr, TcpStream},
		time::Duration,
	};
	use super::*;

	fn bind(network: Network, address: &str) -> Result<ParentListener, ListenError> {
		ParentListener::bind(&BindContext::new(), network, address, ForkOptions::default())
	}

	#[test]
	fn test_bind_tcp() {
		let listener = bind(Network::Tcp4, "127.0.0.1:0").unwrap();

		let addr: SocketAddr = listener.local_addr().as_socket().unwrap();
		assert_eq!(addr.ip(), Ipv4Addr::LOCALHOST);
		assert_ne!(addr.port(), 0);

		// Connections queue up even before anything accepts them.
		TcpStream::connect(addr).unwrap();

		listener.close().unwrap();
		TcpStream::connect(addr).unwrap_err();
	}

	#[test]
	fn test_close_unblocks_accept() {
		let listener = bind(Network::Tcp, "127.0.0.1:0").unwrap();

		let acceptor = {
			let listener = listener.clone();
			thread::spawn(move || listener.accept())
		};

		thread::sleep(Duration::from_millis(50));
		assert!(!acceptor.is_finished());

		listener.close().unwrap();
		assert_matches!(acceptor.join().unwrap(), Err(AcceptError::Closed));

		// Idempotent.
		listener.close().unwrap();
		assert_matches!(listener.accept(), Err(AcceptError::Closed));

		// The terminal error was recorded.
		assert_matches!(listener.wait(), Err(RunError::Accept(AcceptError::Closed)));
	}

	#[test]
	fn test_wait_without_start() {
		let listener = bind(Network::Tcp, "127.0.0.1:0").unwrap();
		listener.wait().unwrap();
	}

	#[test]
	fn test_run() {
		let listener = bind(Network::Tcp, "127.0.0.1:0").unwrap();

		let runner = {
			let listener = listener.clone();
			thread::spawn(move || listener.run())
		};

		thread::sleep(Duration::from_millis(50));
		listener.close().unwrap();

		let result = runner.join().unwrap();
		assert_matches!(&result, Err(error) if error.is_closed());
	}

	#[test]
	fn test_unix_socket_file() {
		let path = test_scratch_path("parent_unix_socket_file");
		let path_str = path.to_str().unwrap();

		let listener = bind(Network::Unix, path_str).unwrap();
		assert!(is_unix_socket(&path).unwrap());
		assert_eq!(listener.local_addr().as_pathname(), Some(path.as_path()));

		// The path is taken.
		assert_matches!(bind(Network::Unix, path_str), Err(ListenError::Bind { .. }));

		listener.close().unwrap();
		assert!(!path.exists());

		// A stale socket is only removed on request.
		let stale = std::os::unix::net::UnixListener::bind(&path).unwrap();
		drop(stale);

		assert_matches!(bind(Network::Unix, path_str), Err(ListenError::Bind { .. }));

		let listener = ParentListener::bind(
			&BindContext::new(),
			Network::Unix,
			path_str,
			ForkOptions::default().with_unlink_stale_unix_socket(true),
		).unwrap();

		// Dropping the last handle without closing also removes the file.
		drop(listener);
		assert!(!path.exists());
	}

	#[test]
	fn test_unsupported_listener_types() {
		assert_matches!(
			bind(Network::Udp4, "127.0.0.1:0"),
			Err(ListenError::UnsupportedListenerType { kind })
			if kind == "IPv4 UDP socket"
		);

		let path = test_scratch_path("parent_unixpacket");

		assert_matches!(
			bind(Network::UnixPacket, path.to_str().unwrap()),
			Err(ListenError::UnsupportedListenerType { .. })
		);

		// The socket file was cleaned up.
		assert!(!path.exists());
	}

	#[test]
	fn test_cancelled() {
		let context = BindContext::new();
		context.cancel();

		assert_matches!(
			ParentListener::bind(&context, Network::Tcp, "127.0.0.1:0", ForkOptions::default()),
			Err(ListenError::Cancelled)
		);

		let context = BindContext::new().with_timeout(Duration::ZERO);

		assert_matches!(
			ParentListener::bind(&context, Network::Tcp, "127.0.0.1:0", ForkOptions::default()),
			Err(ListenError::DeadlineExceeded)
		);
	}

	#[test]
	fn test_accepted_connection_after_reset() {
		let listener = bind(Network::Tcp4, "127.0.0.1:0").unwrap();
		let addr: SocketAddr = listener.local_addr().as_socket().unwrap();

		let client = Socket::from(TcpStream::connect(addr).unwrap());
		client.set_linger(Some(Duration::ZERO)).unwrap();
		drop(client);
		thread::sleep(Duration::from_millis(50));

		let (accepted, _) = {
			let socket = listener.inner.socket.read().unwrap();
			let socket = socket.as_ref().unwrap();
			sys::wait_readable(&[socket.as_fd()]).unwrap();
			socket.accept().unwrap()
		};

		// The peer is gone, but the connection is still a TCP stream, and the child gets to see the reset.
		assert_matches!(accepted_connection(accepted), Ok(Connection::Tcp(_)));
	}

	#[test]
	fn test_dual_stack() {
		let listener = bind(Network::Tcp, ":0").unwrap();
		let addr: SocketAddr = listener.local_addr().as_socket().unwrap();

		TcpStream::connect((Ipv4Addr::LOCALHOST, addr.port())).unwrap();

		// On a host without IPv6, the listener falls back to IPv4 only.
		if addr.is_ipv6() {
			assert!(addr.ip().is_unspecified());
			TcpStream::connect((Ipv6Addr::LOCALHOST, addr.port())).unwrap();
		}
		else {
			assert_eq!(addr.ip(), Ipv4Addr::UNSPECIFIED);
		}

		listener.close().unwrap();
	}

	#[test]
	fn test_handoff_unsupported_connection() {
		let (datagram, _other) = std::os::unix::net::UnixDatagram::pair().unwrap();

		assert_matches!(
			handoff(Socket::from(datagram), &ForkOptions::default()),
			Err(ForkError::UnsupportedConnection { kind })
			if kind == "Unix-domain datagram socket"
		);
	}
}
