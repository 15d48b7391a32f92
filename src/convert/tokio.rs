use crate::{
	errors::IntoTokioError,
	sync::CloseGuard,
	ChildConnection,
	Connection,
};
use pin_project::pin_project;
use socket2::SockAddr;
use std::{
	io,
	os::fd::{AsFd, AsRawFd, BorrowedFd, RawFd},
	path::Path,
	pin::Pin,
	task,
};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};

fn unix_sockaddr_into(addr: tokio::net::unix::SocketAddr) -> io::Result<SockAddr> {
	let pathname =
		addr.as_pathname()
		.unwrap_or(Path::new(""));

	SockAddr::unix(pathname)
}

/// A connected TCP or Unix-domain stream socket, adapted for use with [`tokio`].
#[derive(Debug, derive_more::From)]
#[pin_project(project = AnyTokioStreamProj)]
pub enum AnyTokioStream {
	Tcp(#[pin] tokio::net::TcpStream),
	Unix(#[pin] tokio::net::UnixStream),
}

impl AnyTokioStream {
	pub fn local_addr(&self) -> io::Result<SockAddr> {
		match self {
			Self::Tcp(s) => s.local_addr().map(SockAddr::from),
			Self::Unix(s) => s.local_addr().and_then(unix_sockaddr_into),
		}
	}

	pub fn peer_addr(&self) -> io::Result<SockAddr> {
		match self {
			Self::Tcp(s) => s.peer_addr().map(SockAddr::from),
			Self::Unix(s) => s.peer_addr().and_then(unix_sockaddr_into),
		}
	}
}

impl TryFrom<Connection> for AnyTokioStream {
	type Error = IntoTokioError;

	fn try_from(connection: Connection) -> Result<Self, Self::Error> {
		connection.set_nonblocking(true)
		.map_err(|error| IntoTokioError::SetNonBlocking { error })?;

		match connection {
			Connection::Tcp(s) => s.try_into().map(Self::Tcp),
			Connection::Unix(s) => s.try_into().map(Self::Unix),
		}
		.map_err(|error| IntoTokioError::Wrap { error })
	}
}

impl AsyncRead for AnyTokioStream {
	fn poll_read(
		self: Pin<&mut Self>,
		cx: &mut task::Context,
		buf: &mut ReadBuf,
	) -> task::Poll<io::Result<()>> {
		match self.project() {
			AnyTokioStreamProj::Tcp(s) => s.poll_read(cx, buf),
			AnyTokioStreamProj::Unix(s) => s.poll_read(cx, buf),
		}
	}
}

impl AsyncWrite for AnyTokioStream {
	fn poll_write(
		self: Pin<&mut Self>,
		cx: &mut task::Context,
		buf: &[u8],
	) -> task::Poll<Result<usize, io::Error>> {
		match self.project() {
			AnyTokioStreamProj::Tcp(s) => s.poll_write(cx, buf),
			AnyTokioStreamProj::Unix(s) => s.poll_write(cx, buf),
		}
	}

	fn poll_flush(
		self: Pin<&mut Self>,
		cx: &mut task::Context,
	) -> task::Poll<Result<(), io::Error>> {
		match self.project() {
			AnyTokioStreamProj::Tcp(s) => s.poll_flush(cx),
			AnyTokioStreamProj::Unix(s) => s.poll_flush(cx),
		}
	}

	fn poll_shutdown(
		self: Pin<&mut Self>,
		cx: &mut task::Context,
	) -> task::Poll<Result<(), io::Error>> {
		match self.project() {
			AnyTokioStreamProj::Tcp(s) => s.poll_shutdown(cx),
			AnyTokioStreamProj::Unix(s) => s.poll_shutdown(cx),
		}
	}

	fn poll_write_vectored(
		self: Pin<&mut Self>,
		cx: &mut task::Context,
		bufs: &[io::IoSlice],
	) -> task::Poll<Result<usize, io::Error>> {
		match self.project() {
			AnyTokioStreamProj::Tcp(s) => s.poll_write_vectored(cx, bufs),
			AnyTokioStreamProj::Unix(s) => s.poll_write_vectored(cx, bufs),
		}
	}

	fn is_write_vectored(&self) -> bool {
		match self {
			Self::Tcp(s) => s.is_write_vectored(),
			Self::Unix(s) => s.is_write_vectored(),
		}
	}
}

impl AsFd for AnyTokioStream {
	fn as_fd(&self) -> BorrowedFd {
		match self {
			Self::Tcp(s) => s.as_fd(),
			Self::Unix(s) => s.as_fd(),
		}
	}
}

impl AsRawFd for AnyTokioStream {
	fn as_raw_fd(&self) -> RawFd {
		match self {
			Self::Tcp(s) => s.as_raw_fd(),
			Self::Unix(s) => s.as_raw_fd(),
		}
	}
}

/// A [`ChildConnection`], adapted for use with [`tokio`]. Created with [`ChildConnection::into_tokio`].
///
/// Like the `ChildConnection` it came from, dropping this closes the [`ChildListener`][crate::ChildListener] it was accepted from.
///
///
/// # Availability
///
/// Requires the `tokio` feature.
#[derive(Debug)]
#[pin_project]
pub struct TokioConnection {
	#[pin]
	stream: AnyTokioStream,
	_guard: CloseGuard,
}

impl TokioConnection {
	pub fn local_addr(&self) -> io::Result<SockAddr> {
		self.stream.local_addr()
	}

	pub fn peer_addr(&self) -> io::Result<SockAddr> {
		self.stream.peer_addr()
	}

	pub fn get_ref(&self) -> &AnyTokioStream {
		&self.stream
	}
}

impl ChildConnection {
	/// Converts this connection for use with [`tokio`].
	///
	/// # Panics
	///
	/// Panics if not called from within a Tokio runtime with I/O enabled.
	///
	///
	/// # Availability
	///
	/// Requires the `tokio` feature.
	pub fn into_tokio(self) -> Result<TokioConnection, IntoTokioError> {
		let (connection, guard) = self.into_parts();

		Ok(TokioConnection {
			stream: connection.try_into()?,
			_guard: guard,
		})
	}
}

impl AsyncRead for TokioConnection {
	fn poll_read(
		self: Pin<&mut Self>,
		cx: &mut task::Context,
		buf: &mut ReadBuf,
	) -> task::Poll<io::Result<()>> {
		self.project().stream.poll_read(cx, buf)
	}
}

impl AsyncWrite for TokioConnection {
	fn poll_write(
		self: Pin<&mut Self>,
		cx: &mut task::Context,
		buf: &[u8],
	) -> task::Poll<Result<usize, io::Error>> {
		self.project().stream.poll_write(cx, buf)
	}

	fn poll_flush(
		self: Pin<&mut Self>,
		cx: &mut task::Context,
	) -> task::Poll<Result<(), io::Error>> {
		self.project().stream.poll_flush(cx)
	}

	fn poll_shutdown(
		self: Pin<&mut Self>,
		cx: &mut task::Context,
	) -> task::Poll<Result<(), io::Error>> {
		self.project().stream.poll_shutdown(cx)
	}

	fn poll_write_vectored(
		self: Pin<&mut Self>,
		cx: &mut task::Context,
		bufs: &[io::IoSlice],
	) -> task::Poll<Result<usize, io::Error>> {
		self.project().stream.poll_write_vectored(cx, bufs)
	}

	fn is_write_vectored(&self) -> bool {
		self.stream.is_write_vectored()
	}
}

impl AsFd for TokioConnection {
	fn as_fd(&self) -> BorrowedFd {
		self.stream.as_fd()
	}
}

#[cfg(test)]
mod tests {
	use assert_matches::assert_matches;
	use crate::{errors::AcceptError, ChildListener};
	use std::{
		os::unix::net::UnixStream,
		sync::Arc,
	};
	use tokio::io::{AsyncReadExt, AsyncWriteExt};
	use super::*;

	#[tokio::test]
	async fn test_into_tokio() {
		let (a, b) = UnixStream::pair().unwrap();
		let listener = Arc::new(ChildListener::from_connection(a.into()).unwrap());

		let mut connection = listener.accept().unwrap().into_tokio().unwrap();
		assert_matches!(connection.get_ref(), AnyTokioStream::Unix(_));

		let mut peer = AnyTokioStream::try_from(Connection::from(b)).unwrap();

		connection.write_all(b"ping").await.unwrap();

		let mut buf = [0u8; 4];
		peer.read_exact(&mut buf).await.unwrap();
		assert_eq!(&buf, b"ping");

		drop(connection);

		let closed = tokio::task::spawn_blocking(move || listener.accept()).await.unwrap();
		assert_matches!(closed, Err(AcceptError::Closed));

		let mut rest = Vec::new();
		peer.read_to_end(&mut rest).await.unwrap();
		assert!(rest.is_empty());
	}
}
