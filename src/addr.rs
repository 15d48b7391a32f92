use crate::errors::{
	CleanupSocketError,
	InvalidNetworkError,
	ListenError,
};
use socket2::SockAddr;
use std::{
	fmt::{self, Display, Formatter},
	fs,
	io,
	net::{Ipv4Addr, Ipv6Addr, SocketAddr, ToSocketAddrs},
	os::unix::fs::FileTypeExt,
	path::{Path, PathBuf},
	str::FromStr,
};

#[cfg(test)]
use assert_matches::assert_matches;

/// The kind of network to listen on. This is the first parameter to [`listen`][crate::listen()].
///
/// Networks are named the same way as in many other socket libraries, and are parsed from those names with [`str::parse`]:
///
/// * `tcp`, `tcp4`, `tcp6`: TCP over IPv4 or IPv6, IPv4 only, or IPv6 only.
/// * `unix`: Unix-domain stream socket.
/// * `unixpacket`: Unix-domain sequenced-packet socket.
/// * `udp`, `udp4`, `udp6`: UDP.
/// * `unixgram`: Unix-domain datagram socket.
///
/// Every network can be bound, but only TCP and Unix-domain stream listeners can hand connections to a child process. Listening on any other network fails with [`ListenError::UnsupportedListenerType`] after the socket has been bound.
#[derive(Clone, Copy, Debug, derive_more::Display, Eq, Hash, PartialEq)]
#[non_exhaustive]
pub enum Network {
	#[display(fmt = "tcp")]
	Tcp,

	#[display(fmt = "tcp4")]
	Tcp4,

	#[display(fmt = "tcp6")]
	Tcp6,

	#[display(fmt = "unix")]
	Unix,

	#[display(fmt = "unixpacket")]
	UnixPacket,

	#[display(fmt = "udp")]
	Udp,

	#[display(fmt = "udp4")]
	Udp4,

	#[display(fmt = "udp6")]
	Udp6,

	#[display(fmt = "unixgram")]
	UnixGram,
}

impl Network {
	/// The socket type used for this network.
	pub fn socket_type(self) -> socket2::Type {
		match self {
			Self::Tcp | Self::Tcp4 | Self::Tcp6 | Self::Unix => socket2::Type::STREAM,
			Self::UnixPacket => socket2::Type::SEQPACKET,
			Self::Udp | Self::Udp4 | Self::Udp6 | Self::UnixGram => socket2::Type::DGRAM,
		}
	}

	/// Whether the address is a Unix-domain socket path rather than an IP address and port.
	pub fn is_unix(self) -> bool {
		matches!(self, Self::Unix | Self::UnixPacket | Self::UnixGram)
	}

	/// Whether sockets on this network are put into the listening state after binding.
	pub fn is_connection_oriented(self) -> bool {
		matches!(self.socket_type(), socket2::Type::STREAM | socket2::Type::SEQPACKET)
	}

	/// Resolves `address` to something a socket on this network can be bound to.
	///
	/// For IP networks, the address is `host:port`. An empty host, as in `:8080`, means all interfaces. For `tcp` and `udp`, that is the IPv6 wildcard with IPv4 also accepted on the same socket. For Unix-domain networks, the address is a file system path.
	pub(crate) fn resolve(self, address: &str) -> Result<BindAddr, ListenError> {
		if self.is_unix() {
			let path = PathBuf::from(address);

			let addr =
				SockAddr::unix(&path)
				.map_err(|error| ListenError::InvalidUnixPath { error })?;

			return Ok(BindAddr {
				addr,
				unix_path: Some(path),
				dual_stack: false,
			});
		}

		let want_v4 = !matches!(self, Self::Tcp6 | Self::Udp6);
		let want_v6 = !matches!(self, Self::Tcp4 | Self::Udp4);

		let resolve_error = |error: io::Error| ListenError::ResolveAddress {
			address: address.to_owned(),
			error,
		};

		let mut dual_stack = false;

		let addr: SocketAddr = if let Some(port) = address.strip_prefix(':') {
			let port: u16 =
				port.parse()
				.map_err(|error| resolve_error(io::Error::new(io::ErrorKind::InvalidInput, error)))?;

			// With no host and no family restriction, listen on IPv6 and IPv4 at once.
			dual_stack = want_v4 && want_v6;

			match want_v6 {
				true => (Ipv6Addr::UNSPECIFIED, port).into(),
				false => (Ipv4Addr::UNSPECIFIED, port).into(),
			}
		}
		else {
			address.to_socket_addrs()
			.map_err(resolve_error)?
			.find(|addr| match addr {
				SocketAddr::V4(_) => want_v4,
				SocketAddr::V6(_) => want_v6,
			})
			.ok_or_else(|| ListenError::NoUsableAddress {
				address: address.to_owned(),
			})?
		};

		Ok(BindAddr {
			addr: addr.into(),
			unix_path: None,
			dual_stack,
		})
	}
}

impl FromStr for Network {
	type Err = InvalidNetworkError;

	fn from_str(s: &str) -> Result<Self, Self::Err> {
		Ok(match s {
			"tcp" => Self::Tcp,
			"tcp4" => Self::Tcp4,
			"tcp6" => Self::Tcp6,
			"unix" => Self::Unix,
			"unixpacket" => Self::UnixPacket,
			"udp" => Self::Udp,
			"udp4" => Self::Udp4,
			"udp6" => Self::Udp6,
			"unixgram" => Self::UnixGram,
			_ => return Err(InvalidNetworkError {
				network: s.to_owned(),
			}),
		})
	}
}

/// A resolved address, ready to bind.
#[derive(Debug)]
pub(crate) struct BindAddr {
	pub addr: SockAddr,

	/// The path, if this is a path-based Unix-domain address.
	pub unix_path: Option<PathBuf>,

	/// The address is the IPv6 wildcard, and the socket should also accept IPv4 (`IPV6_V6ONLY` off).
	pub dual_stack: bool,
}

impl BindAddr {
	/// The IPv4 wildcard address with the same port, for hosts where a dual-stack IPv6 socket can't be used.
	pub fn ipv4_fallback(&self) -> Option<SockAddr> {
		if !self.dual_stack {
			return None;
		}

		let port = self.addr.as_socket()?.port();
		Some(SocketAddr::from((Ipv4Addr::UNSPECIFIED, port)).into())
	}
}

/// Formats a [`SockAddr`] for humans: `127.0.0.1:8080`, `[::1]:8080`, a socket path, or `(unnamed)`.
///
/// `SockAddr` itself only implements [`Debug`][fmt::Debug], which is not suitable for log lines or for telling a client where a listener is.
#[derive(Clone, Copy, Debug)]
pub struct DisplayAddr<'a>(pub &'a SockAddr);

impl Display for DisplayAddr<'_> {
	fn fmt(&self, f: &mut Formatter) -> fmt::Result {
		if let Some(addr) = self.0.as_socket() {
			return write!(f, "{addr}");
		}

		if let Some(path) = self.0.as_pathname() {
			return write!(f, "{}", path.display());
		}

		if self.0.is_unnamed() {
			return write!(f, "(unnamed)");
		}

		write!(f, "{:?}", self.0)
	}
}

/// Checks whether the file at the given `path` is a Unix-domain socket.
pub fn is_unix_socket(path: &Path) -> io::Result<bool> {
	fs::symlink_metadata(path)
	.map(|metadata| metadata.file_type().is_socket())
}

/// Removes a stale Unix-domain socket at `path`, if there is one. Files that are not sockets are left alone, and binding will then fail.
pub(crate) fn cleanup_unix_path_socket(path: &Path) -> Result<(), CleanupSocketError> {
	let is_unix_socket: bool =
		is_unix_socket(path)
		.or_else(|error| {
			// Treat a “not found” error as equivalent to `Ok(false)`.
			if error.kind() == io::ErrorKind::NotFound {
				Ok(false)
			}
			else {
				Err(error)
			}
		})
		.map_err(|error| CleanupSocketError::Stat { error })?;

	if is_unix_socket {
		if let Err(error) = fs::remove_file(path) {
		if error.kind() != io::ErrorKind::NotFound {
			return Err(CleanupSocketError::Unlink { error });
		}}
	}

	Ok(())
}

#[cfg(test)]
pub(crate) fn test_scratch_path(name: &str) -> PathBuf {
	use once_cell::sync::Lazy;

	static TEST_SCRATCH: Lazy<PathBuf> = Lazy::new(|| {
		let path: PathBuf = ["target", "lib-test-scratch"].into_iter().collect();

		// Try to remove the scratch folder, but ignore errors in doing so.
		let _ = fs::remove_dir_all(&path);

		fs::create_dir_all(&path)
		.expect("couldn't create test scratch folder");

		path
	});

	TEST_SCRATCH.join(name)
}

#[test]
fn test_parse_network() {
	for network in [
		Network::Tcp,
		Network::Tcp4,
		Network::Tcp6,
		Network::Unix,
		Network::UnixPacket,
		Network::Udp,
		Network::Udp4,
		Network::Udp6,
		Network::UnixGram,
	] {
		assert_eq!(network.to_string().parse::<Network>().unwrap(), network);
	}

	assert_matches!(
		"sctp".parse::<Network>(),
		Err(InvalidNetworkError { network }) if network == "sctp"
	);

	assert!(Network::Unix.is_connection_oriented());
	assert!(Network::UnixPacket.is_connection_oriented());
	assert!(!Network::Udp.is_connection_oriented());
}

#[test]
fn test_resolve() {
	let resolved = Network::Tcp.resolve(":8080").unwrap();
	assert_eq!(resolved.addr.as_socket(), Some((Ipv6Addr::UNSPECIFIED, 8080).into()));
	assert!(resolved.dual_stack);
	assert!(resolved.unix_path.is_none());
	assert_eq!(
		resolved.ipv4_fallback().and_then(|addr| addr.as_socket()),
		Some((Ipv4Addr::UNSPECIFIED, 8080).into()),
	);

	let resolved = Network::Tcp4.resolve(":8080").unwrap();
	assert_eq!(resolved.addr.as_socket(), Some((Ipv4Addr::UNSPECIFIED, 8080).into()));
	assert!(!resolved.dual_stack);

	let resolved = Network::Tcp6.resolve(":8080").unwrap();
	assert_eq!(resolved.addr.as_socket(), Some((Ipv6Addr::UNSPECIFIED, 8080).into()));
	assert!(!resolved.dual_stack);
	assert!(resolved.ipv4_fallback().is_none());

	let resolved = Network::Tcp.resolve("127.0.0.1:0").unwrap();
	assert_eq!(resolved.addr.as_socket(), Some((Ipv4Addr::LOCALHOST, 0).into()));
	assert!(!resolved.dual_stack);

	assert_matches!(
		Network::Tcp4.resolve("[::1]:80"),
		Err(ListenError::NoUsableAddress { .. })
	);

	assert_matches!(
		Network::Tcp.resolve(":http"),
		Err(ListenError::ResolveAddress { .. })
	);

	let resolved = Network::Unix.resolve("./some.socket").unwrap();
	assert_eq!(resolved.unix_path.as_deref(), Some(Path::new("./some.socket")));

	assert_matches!(
		Network::Unix.resolve(&"x".repeat(4096)),
		Err(ListenError::InvalidUnixPath { .. })
	);
}

#[test]
fn test_display_addr() {
	let addr: SockAddr = SocketAddr::from((Ipv4Addr::LOCALHOST, 1234)).into();
	assert_eq!(DisplayAddr(&addr).to_string(), "127.0.0.1:1234");

	let addr = SockAddr::unix("/run/example.socket").unwrap();
	assert_eq!(DisplayAddr(&addr).to_string(), "/run/example.socket");
}

#[test]
fn test_cleanup_unix_path_socket() {
	let socket_path: PathBuf = test_scratch_path("cleanup.socket");

	// Nothing there yet.
	cleanup_unix_path_socket(&socket_path).unwrap();

	// A folder is not a socket, and is left in place.
	fs::create_dir(&socket_path).unwrap();
	assert_matches!(is_unix_socket(&socket_path), Ok(false));
	cleanup_unix_path_socket(&socket_path).unwrap();
	assert!(socket_path.is_dir());
	fs::remove_dir(&socket_path).unwrap();

	assert_matches!(
		is_unix_socket(&socket_path),
		Err(error)
		if error.kind() == io::ErrorKind::NotFound
	);

	// An actual socket is removed.
	let socket = socket2::Socket::new(
		socket2::Domain::UNIX,
		socket2::Type::STREAM,
		None,
	).unwrap();

	socket.bind(&SockAddr::unix(&socket_path).unwrap()).unwrap();
	assert_matches!(is_unix_socket(&socket_path), Ok(true));

	cleanup_unix_path_socket(&socket_path).unwrap();
	assert!(fs::symlink_metadata(&socket_path).is_err());

	drop(socket);
}
