use crate::{
	connection::SocketKind,
	errors::{AcceptError, ListenError, RunError},
	sync::{lock, CloseGuard, CloseLatch},
	sys::{self, INHERITED_CONNECTION_FD},
	Connection,
};
use socket2::{SockAddr, Socket};
use std::{
	io::{self, IoSlice, IoSliceMut, Read, Write},
	net::Shutdown,
	os::fd::{FromRawFd, OwnedFd, RawFd},
	sync::{Arc, Mutex},
};

#[cfg(doc)]
use crate::listen;

/// The listener a child process gets from [`listen`]. It yields exactly one connection: the one its parent accepted.
///
/// After that connection has been taken, [`accept`][Self::accept] blocks until the connection or the listener is closed, and then reports [`AcceptError::Closed`]. A server loop that runs until `accept` fails therefore serves its one connection and then ends, and the child process can exit.
#[derive(Debug)]
pub struct ChildListener {
	slot: Mutex<Option<Connection>>,
	latch: Arc<CloseLatch>,
	addr: SockAddr,
}

impl ChildListener {
	/// Adopts the connection that the parent placed at file descriptor 3.
	///
	/// # Errors
	///
	/// [`ListenError::InvalidInheritedDescriptor`] if descriptor 3 is not open, which usually means this process was not actually started by a parent listener. [`ListenError::InheritedNotConnection`] if it is open, but is not a connected TCP or Unix-domain stream socket.
	pub fn inherit() -> Result<Self, ListenError> {
		Self::from_fd(INHERITED_CONNECTION_FD)
	}

	pub(crate) fn from_fd(fd: RawFd) -> Result<Self, ListenError> {
		sys::check_fd_open(fd)
		.map_err(|error| ListenError::InvalidInheritedDescriptor { fd, error })?;

		// Safety: the descriptor is open, and nothing else in this process claims it.
		let socket = Socket::from(unsafe { OwnedFd::from_raw_fd(fd) });

		// Keep it out of any process this one spawns.
		socket.set_cloexec(true)
		.map_err(|error| ListenError::CheckInheritedDescriptor { fd, error })?;

		let connection: Connection = match SocketKind::try_from(socket) {
			Ok(SocketKind::TcpStream(s)) => s.into(),
			Ok(SocketKind::UnixStream(s)) => s.into(),

			Ok(other) => return Err(ListenError::InheritedNotConnection {
				fd,
				kind: other.describe(),
			}),

			Err(error) => return Err(ListenError::CheckInheritedDescriptor { fd, error }),
		};

		Self::from_connection(connection)
		.map_err(|error| ListenError::CheckInheritedDescriptor { fd, error })
	}

	/// Wraps an already-connected stream, so that it is served the same way as an inherited one.
	///
	/// # Errors
	///
	/// Fails if the connection's local address can't be determined.
	pub fn from_connection(connection: Connection) -> io::Result<Self> {
		let addr = connection.local_addr()?;

		Ok(Self {
			slot: Mutex::new(Some(connection)),
			latch: CloseLatch::new(),
			addr,
		})
	}

	/// Yields the connection the first time it is called. After that, blocks until the listener or the connection is closed.
	///
	/// # Errors
	///
	/// [`AcceptError::Closed`], once the connection has been taken and then closed, or the listener has been closed. This is the only error.
	pub fn accept(&self) -> Result<ChildConnection, AcceptError> {
		if self.latch.is_fired() {
			return Err(AcceptError::Closed);
		}

		if let Some(connection) = lock(&self.slot).take() {
			return Ok(ChildConnection {
				connection,
				_guard: CloseGuard(Arc::clone(&self.latch)),
			});
		}

		self.latch.wait();
		Err(AcceptError::Closed)
	}

	/// Closes the listener, waking any blocked [`accept`][Self::accept].
	///
	/// A connection that was already taken stays open. One that was not taken yet is dropped. Calling this more than once is harmless.
	pub fn close(&self) -> io::Result<()> {
		self.latch.fire();
		lock(&self.slot).take();
		Ok(())
	}

	/// The local address of the inherited connection.
	pub fn local_addr(&self) -> &SockAddr {
		&self.addr
	}

	/// Always fails. A child listener has no accept loop to run in the background.
	pub fn start(&self) -> Result<(), RunError> {
		Err(RunError::ChildListener { operation: "start" })
	}

	/// Always fails. See [`start`][Self::start].
	pub fn wait(&self) -> Result<(), RunError> {
		Err(RunError::ChildListener { operation: "wait on" })
	}

	/// Always fails. See [`start`][Self::start].
	pub fn run(&self) -> Result<(), RunError> {
		Err(RunError::ChildListener { operation: "run" })
	}
}

/// The connection yielded by a [`ChildListener`].
///
/// Closing or dropping it also closes the listener it came from, so a blocked [`ChildListener::accept`] returns.
#[derive(Debug)]
pub struct ChildConnection {
	connection: Connection,
	_guard: CloseGuard,
}

impl ChildConnection {
	pub fn local_addr(&self) -> io::Result<SockAddr> {
		self.connection.local_addr()
	}

	pub fn peer_addr(&self) -> io::Result<SockAddr> {
		self.connection.peer_addr()
	}

	pub fn shutdown(&self, how: Shutdown) -> io::Result<()> {
		self.connection.shutdown(how)
	}

	/// The underlying connection.
	pub fn get_ref(&self) -> &Connection {
		&self.connection
	}

	/// Shuts the connection down in both directions and closes it, releasing the listener.
	///
	/// A peer that already hung up is not an error.
	pub fn close(self) -> io::Result<()> {
		match self.connection.shutdown(Shutdown::Both) {
			Err(error) if error.kind() != io::ErrorKind::NotConnected => Err(error),
			_ => Ok(()),
		}
	}

	#[cfg(feature = "tokio")]
	pub(crate) fn into_parts(self) -> (Connection, CloseGuard) {
		(self.connection, self._guard)
	}
}

impl Read for ChildConnection {
	fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
		self.connection.read(buf)
	}

	fn read_vectored(&mut self, bufs: &mut [IoSliceMut<'_>]) -> io::Result<usize> {
		self.connection.read_vectored(bufs)
	}
}

impl Read for &ChildConnection {
	fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
		(&self.connection).read(buf)
	}
}

impl Write for ChildConnection {
	fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
		self.connection.write(buf)
	}

	fn write_vectored(&mut self, bufs: &[IoSlice<'_>]) -> io::Result<usize> {
		self.connection.write_vectored(bufs)
	}

	fn flush(&mut self) -> io::Result<()> {
		self.connection.flush()
	}
}

impl Write for &ChildConnection {
	fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
		(&self.connection).write(buf)
	}

	fn flush(&mut self) -> io::Result<()> {
		(&self.connection).flush()
	}
}

#[cfg(test)]
mod tests {
	use assert_matches::assert_matches;
	use std::{
		os::{fd::IntoRawFd, unix::net::UnixStream},
		thread,
		time::Duration,
	};
	use super::*;

	fn pair() -> (ChildListener, UnixStream) {
		let (a, b) = UnixStream::pair().unwrap();
		(ChildListener::from_connection(a.into()).unwrap(), b)
	}

	#[test]
	fn test_accept_once() {
		let (listener, mut peer) = pair();

		assert!(listener.local_addr().is_unnamed());

		let mut connection = listener.accept().unwrap();
		peer.write_all(b"hi").unwrap();

		let mut buf = [0u8; 2];
		connection.read_exact(&mut buf).unwrap();
		assert_eq!(&buf, b"hi");

		connection.close().unwrap();

		assert_matches!(listener.accept(), Err(AcceptError::Closed));
		assert_matches!(listener.accept(), Err(AcceptError::Closed));
	}

	#[test]
	fn test_close_before_accept() {
		let (listener, _peer) = pair();

		listener.close().unwrap();
		assert_matches!(listener.accept(), Err(AcceptError::Closed));
	}

	#[test]
	fn test_concurrent_close() {
		let (listener, _peer) = pair();
		let listener = Arc::new(listener);

		let _connection = listener.accept().unwrap();

		let waiter = {
			let listener = Arc::clone(&listener);
			thread::spawn(move || listener.accept())
		};

		let closers: Vec<_> = (0..4).map(|_| {
			let listener = Arc::clone(&listener);
			thread::spawn(move || listener.close())
		}).collect();

		for closer in closers {
			closer.join().unwrap().unwrap();
		}

		assert_matches!(waiter.join().unwrap(), Err(AcceptError::Closed));
	}

	#[test]
	fn test_connection_drop_unblocks_accept() {
		let (listener, _peer) = pair();
		let listener = Arc::new(listener);

		let connection = listener.accept().unwrap();

		let waiter = {
			let listener = Arc::clone(&listener);
			thread::spawn(move || listener.accept())
		};

		thread::sleep(Duration::from_millis(50));
		assert!(!waiter.is_finished());

		drop(connection);
		assert_matches!(waiter.join().unwrap(), Err(AcceptError::Closed));
	}

	#[test]
	fn test_misuse() {
		let (listener, _peer) = pair();

		assert_matches!(listener.start(), Err(RunError::ChildListener { operation: "start" }));
		assert_matches!(listener.wait(), Err(RunError::ChildListener { .. }));
		assert_matches!(listener.run(), Err(RunError::ChildListener { .. }));

		// None of those used up the connection.
		listener.accept().unwrap();
	}

	#[test]
	fn test_from_fd() {
		let (a, mut b) = UnixStream::pair().unwrap();
		let fd = a.into_raw_fd();

		let listener = ChildListener::from_fd(fd).unwrap();
		let mut connection = listener.accept().unwrap();
		connection.write_all(b"x").unwrap();

		let mut buf = [0u8; 1];
		b.read_exact(&mut buf).unwrap();
		assert_eq!(&buf, b"x");

		let (datagram, _other) = std::os::unix::net::UnixDatagram::pair().unwrap();
		let fd = datagram.into_raw_fd();

		assert_matches!(
			ChildListener::from_fd(fd),
			Err(ListenError::InheritedNotConnection { kind, .. })
			if kind == "Unix-domain datagram socket"
		);
	}
}
