use std::{
	io,
	os::fd::{AsRawFd, BorrowedFd, RawFd},
};

/// The descriptor slot a child process finds its connection in, immediately after standard input, output, and error.
pub const INHERITED_CONNECTION_FD: RawFd = 3;

fn cvt(result: libc::c_int) -> io::Result<libc::c_int> {
	if result == -1 {
		Err(io::Error::last_os_error())
	}
	else {
		Ok(result)
	}
}

/// Runs in the child process, after `fork` and before `exec`. Only async-signal-safe calls are allowed here.
///
/// Starts a new session, then installs `fd` at [`INHERITED_CONNECTION_FD`] without the close-on-exec flag.
pub fn prepare_child(fd: RawFd) -> io::Result<()> {
	unsafe {
		cvt(libc::setsid())?;

		if fd == INHERITED_CONNECTION_FD {
			// `dup2` onto itself is a no-op that leaves close-on-exec set, so clear it by hand.
			let flags = cvt(libc::fcntl(fd, libc::F_GETFD))?;
			cvt(libc::fcntl(fd, libc::F_SETFD, flags & !libc::FD_CLOEXEC))?;
		}
		else {
			cvt(libc::dup2(fd, INHERITED_CONNECTION_FD))?;
		}
	}

	Ok(())
}

/// Checks that `fd` is an open file descriptor, without taking ownership of it.
pub fn check_fd_open(fd: RawFd) -> io::Result<()> {
	nix::fcntl::fcntl(fd, nix::fcntl::FcntlArg::F_GETFD)
	.map(drop)
	.map_err(io::Error::from)
}

/// Blocks until any of `fds` is readable or has hung up. Interruptions by signals are reported as [`io::ErrorKind::Interrupted`].
pub fn wait_readable(fds: &[BorrowedFd<'_>]) -> io::Result<()> {
	let mut poll_fds: Vec<libc::pollfd> =
		fds.iter()
		.map(|fd| libc::pollfd {
			fd: fd.as_raw_fd(),
			events: libc::POLLIN,
			revents: 0,
		})
		.collect();

	unsafe {
		cvt(libc::poll(poll_fds.as_mut_ptr(), poll_fds.len() as libc::nfds_t, -1))?;
	}

	Ok(())
}
