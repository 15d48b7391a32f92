use cfg_if::cfg_if;
use socket2::{SockAddr, SockRef, Socket};
use std::{
	io::{self, IoSlice, IoSliceMut, Read, Write},
	net::{Shutdown, TcpListener, TcpStream},
	os::{
		fd::{AsFd, AsRawFd, BorrowedFd, OwnedFd, RawFd},
		unix::net::{UnixListener, UnixStream},
	},
	time::Duration,
};

/// A connection that can be handed to a child process by duplicating its file descriptor.
///
/// Only TCP and Unix-domain stream connections are known to survive the handoff, so only [`TcpStream`], [`UnixStream`], and [`Connection`] implement this trait.
pub trait TransferableConnection: AsFd {
	/// Duplicates the connection's file descriptor.
	///
	/// The duplicate has the close-on-exec flag set, so it is not inherited by any child process other than the one it is explicitly installed into.
	fn duplicate_descriptor(&self) -> io::Result<OwnedFd> {
		self.as_fd().try_clone_to_owned()
	}
}

impl TransferableConnection for TcpStream {}
impl TransferableConnection for UnixStream {}
impl TransferableConnection for Connection {}

/// A connected stream socket, either TCP or Unix-domain.
///
/// This is what a parent hands to a child process, and what a child receives.
#[derive(Debug, derive_more::From)]
#[non_exhaustive]
pub enum Connection {
	/// A connected TCP socket.
	Tcp(TcpStream),

	/// A connected Unix-domain stream socket.
	Unix(UnixStream),
}

impl Connection {
	/// Returns the local address of this connection.
	pub fn local_addr(&self) -> io::Result<SockAddr> {
		SockRef::from(self).local_addr()
	}

	/// Returns the address of the connected peer.
	pub fn peer_addr(&self) -> io::Result<SockAddr> {
		SockRef::from(self).peer_addr()
	}

	/// Shuts down the read half, write half, or both halves of this connection.
	pub fn shutdown(&self, how: Shutdown) -> io::Result<()> {
		match self {
			Self::Tcp(s) => s.shutdown(how),
			Self::Unix(s) => s.shutdown(how),
		}
	}

	/// Creates a new independently owned handle to the same connection.
	pub fn try_clone(&self) -> io::Result<Self> {
		match self {
			Self::Tcp(s) => s.try_clone().map(Self::Tcp),
			Self::Unix(s) => s.try_clone().map(Self::Unix),
		}
	}

	pub fn set_nonblocking(&self, nonblocking: bool) -> io::Result<()> {
		match self {
			Self::Tcp(s) => s.set_nonblocking(nonblocking),
			Self::Unix(s) => s.set_nonblocking(nonblocking),
		}
	}

	pub fn set_read_timeout(&self, timeout: Option<Duration>) -> io::Result<()> {
		match self {
			Self::Tcp(s) => s.set_read_timeout(timeout),
			Self::Unix(s) => s.set_read_timeout(timeout),
		}
	}

	pub fn set_write_timeout(&self, timeout: Option<Duration>) -> io::Result<()> {
		match self {
			Self::Tcp(s) => s.set_write_timeout(timeout),
			Self::Unix(s) => s.set_write_timeout(timeout),
		}
	}
}

impl Read for Connection {
	fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
		(&*self).read(buf)
	}

	fn read_vectored(&mut self, bufs: &mut [IoSliceMut<'_>]) -> io::Result<usize> {
		(&*self).read_vectored(bufs)
	}
}

impl Read for &Connection {
	fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
		match self {
			Connection::Tcp(s) => (&*s).read(buf),
			Connection::Unix(s) => (&*s).read(buf),
		}
	}

	fn read_vectored(&mut self, bufs: &mut [IoSliceMut<'_>]) -> io::Result<usize> {
		match self {
			Connection::Tcp(s) => (&*s).read_vectored(bufs),
			Connection::Unix(s) => (&*s).read_vectored(bufs),
		}
	}
}

impl Write for Connection {
	fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
		(&*self).write(buf)
	}

	fn write_vectored(&mut self, bufs: &[IoSlice<'_>]) -> io::Result<usize> {
		(&*self).write_vectored(bufs)
	}

	fn flush(&mut self) -> io::Result<()> {
		(&*self).flush()
	}
}

impl Write for &Connection {
	fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
		match self {
			Connection::Tcp(s) => (&*s).write(buf),
			Connection::Unix(s) => (&*s).write(buf),
		}
	}

	fn write_vectored(&mut self, bufs: &[IoSlice<'_>]) -> io::Result<usize> {
		match self {
			Connection::Tcp(s) => (&*s).write_vectored(bufs),
			Connection::Unix(s) => (&*s).write_vectored(bufs),
		}
	}

	fn flush(&mut self) -> io::Result<()> {
		match self {
			Connection::Tcp(s) => (&*s).flush(),
			Connection::Unix(s) => (&*s).flush(),
		}
	}
}

impl AsFd for Connection {
	fn as_fd(&self) -> BorrowedFd<'_> {
		match self {
			Self::Tcp(s) => s.as_fd(),
			Self::Unix(s) => s.as_fd(),
		}
	}
}

impl AsRawFd for Connection {
	fn as_raw_fd(&self) -> RawFd {
		match self {
			Self::Tcp(s) => s.as_raw_fd(),
			Self::Unix(s) => s.as_raw_fd(),
		}
	}
}

impl From<Connection> for OwnedFd {
	fn from(connection: Connection) -> Self {
		match connection {
			Connection::Tcp(s) => s.into(),
			Connection::Unix(s) => s.into(),
		}
	}
}

/// What a raw socket turned out to be, after checking its domain, type, protocol, and state.
#[derive(Debug)]
pub(crate) enum SocketKind {
	TcpListener(TcpListener),
	TcpStream(TcpStream),
	UnixListener(UnixListener),
	UnixStream(UnixStream),

	/// Anything else. `description` says what it is, for error messages.
	Other {
		socket: Socket,
		description: String,
	},
}

impl SocketKind {
	/// Describes the socket, for error messages.
	pub fn describe(&self) -> String {
		match self {
			Self::TcpListener(_) => "listening TCP socket".to_owned(),
			Self::TcpStream(_) => "connected TCP socket".to_owned(),
			Self::UnixListener(_) => "listening Unix-domain stream socket".to_owned(),
			Self::UnixStream(_) => "connected Unix-domain stream socket".to_owned(),
			Self::Other { description, .. } => description.clone(),
		}
	}
}

impl SocketKind {
	/// Sorts a socket that came out of `accept` on one of our listeners.
	///
	/// Only the domain and type are checked. Whether the peer is still connected doesn't matter here: a connection the peer already reset is still a TCP or Unix-domain stream, and the child finds out about the reset when it reads.
	pub fn from_accepted(socket: Socket) -> io::Result<Self> {
		let domain: socket2::Domain = socket.local_addr()?.domain();
		let r#type: socket2::Type = socket.r#type()?;

		Ok(match (domain, r#type) {
			(socket2::Domain::IPV4 | socket2::Domain::IPV6, socket2::Type::STREAM) => Self::TcpStream(socket.into()),
			(socket2::Domain::UNIX, socket2::Type::STREAM) => Self::UnixStream(socket.into()),

			_ => {
				let description = describe(domain, r#type, None, Some(false), false);
				Self::Other { socket, description }
			}
		})
	}
}

impl TryFrom<Socket> for SocketKind {
	type Error = io::Error;

	#[allow(clippy::needless_late_init)] // False positive. Clippy doesn't seem to see the `cfg_if!`.
	fn try_from(socket: Socket) -> Result<Self, Self::Error> {
		let address: SockAddr = socket.local_addr()?;
		let domain: socket2::Domain = address.domain();
		let r#type: socket2::Type = socket.r#type()?;

		let protocol: Option<socket2::Protocol>;
		let is_listening: Option<bool>;

		cfg_if! {
			if #[cfg(any(
				target_os = "android",
				target_os = "freebsd",
				target_os = "fuchsia",
				target_os = "linux",
			))] {
				protocol = socket.protocol()?;
			}
			else {
				protocol = None;
			}
		}

		cfg_if! {
			if #[cfg(any(
				target_os = "aix",
				target_os = "android",
				target_os = "freebsd",
				target_os = "fuchsia",
				target_os = "linux",
			))] {
				is_listening = Some(socket.is_listener()?);
			}
			else {
				is_listening = None;
			}
		}

		let is_connected: bool = {
			if
				r#type != socket2::Type::STREAM ||
				is_listening == Some(true)
			{
				false
			}
			else { match socket.peer_addr() {
				Ok(_) => true,

				Err(error) if error.kind() == io::ErrorKind::NotConnected => false,

				Err(error) => return Err(error),
			}}
		};

		let is_ip = matches!(domain, socket2::Domain::IPV4 | socket2::Domain::IPV6);

		// Where the protocol can't be checked, an IP stream socket is assumed to be TCP.
		let is_tcp =
			is_ip &&
			r#type == socket2::Type::STREAM &&
			matches!(protocol, None | Some(socket2::Protocol::TCP));

		let is_unix_stream =
			domain == socket2::Domain::UNIX &&
			r#type == socket2::Type::STREAM;

		// Where listening state can't be checked, an unconnected stream socket is assumed to be listening.
		Ok(match (is_tcp, is_unix_stream, is_listening, is_connected) {
			(true, _, None | Some(true), false) => Self::TcpListener(socket.into()),
			(true, _, _, true) => Self::TcpStream(socket.into()),
			(_, true, None | Some(true), false) => Self::UnixListener(socket.into()),
			(_, true, _, true) => Self::UnixStream(socket.into()),

			_ => {
				let description = describe(domain, r#type, protocol, is_listening, is_connected);
				Self::Other { socket, description }
			}
		})
	}
}

fn describe(
	domain: socket2::Domain,
	r#type: socket2::Type,
	protocol: Option<socket2::Protocol>,
	is_listening: Option<bool>,
	is_connected: bool,
) -> String {
	let domain: &str = match domain {
		socket2::Domain::IPV4 => "IPv4",
		socket2::Domain::IPV6 => "IPv6",
		socket2::Domain::UNIX => "Unix-domain",
		_ => "unknown-domain",
	};

	let r#type: &str = match (r#type, protocol) {
		(_, Some(socket2::Protocol::UDP)) | (socket2::Type::DGRAM, None) if domain != "Unix-domain" => "UDP",
		(_, Some(socket2::Protocol::TCP)) => "TCP",
		(socket2::Type::STREAM, _) => "stream",
		(socket2::Type::DGRAM, _) => "datagram",
		(socket2::Type::SEQPACKET, _) => "sequenced-packet",
		(socket2::Type::RAW, _) => "raw",
		_ => "unknown-type",
	};

	let state: &str = match (is_listening, is_connected) {
		(Some(true), _) => "listening ",
		(_, true) => "connected ",
		(Some(false), false) if r#type == "TCP" || r#type == "stream" => "unconnected ",
		_ => "",
	};

	format!("{state}{domain} {type} socket")
}
