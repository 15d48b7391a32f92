use nix::unistd::{Gid, Uid};
use std::{
	ffi::{c_int, OsString},
	fs::File,
	io,
	os::fd::OwnedFd,
	process::Stdio,
	sync::Arc,
};

#[cfg(doc)]
use crate::{listen, Role};

/// The environment variable that marks a process as a child, unless [`ForkOptions::child_env_name`] says otherwise.
pub const DEFAULT_CHILD_ENV_NAME: &str = "FORK_LISTENER_CHILD";

/// A standard stream for child processes.
///
/// A stream needs a file descriptor that the child can inherit. To send a child's output to something that has none, like an in-memory buffer or a logger, pass one end of a pipe or a socket pair as an [`OwnedFd`], and read the other end in this process.
#[derive(Clone, Debug, Default)]
#[non_exhaustive]
pub enum ChildStdio {
	/// Share the parent's stream. This is the default.
	#[default]
	Inherit,

	/// Connect the stream to `/dev/null`.
	Null,

	/// Use this file (or pipe, or anything else with a file descriptor). Each child gets its own duplicate of it.
	File(Arc<File>),

	/// Use this file descriptor, such as one end of a pipe or a socket. Each child gets its own duplicate of it.
	Fd(Arc<OwnedFd>),
}

impl ChildStdio {
	pub(crate) fn to_stdio(&self) -> io::Result<Stdio> {
		Ok(match self {
			Self::Inherit => Stdio::inherit(),
			Self::Null => Stdio::null(),
			Self::File(file) => file.try_clone()?.into(),
			Self::Fd(fd) => fd.try_clone()?.into(),
		})
	}
}

impl From<File> for ChildStdio {
	fn from(file: File) -> Self {
		Self::File(Arc::new(file))
	}
}

impl From<OwnedFd> for ChildStdio {
	fn from(fd: OwnedFd) -> Self {
		Self::Fd(Arc::new(fd))
	}
}

/// Options for [`listen`]. They are resolved before it decides whether this process is the parent or a child, and are not changed afterward.
///
/// Options are set with the `with_*` builder methods, starting from [`ForkOptions::default`]:
///
/// ```
/// use fork_listener::{ChildStdio, ForkOptions};
///
/// let options = ForkOptions::default()
/// 	.with_child_env_name("MY_APP_CHILD")
/// 	.with_env([("MY_APP_MODE", "worker")])
/// 	.with_stdin(ChildStdio::Null);
///
/// assert_eq!(options.child_env_name, "MY_APP_CHILD");
/// ```
///
/// Only the parent uses most of these options. A child only looks at [`child_env_name`][Self::child_env_name], and only to decide that it is a child.
#[derive(Clone, Debug)]
#[non_exhaustive]
pub struct ForkOptions {
	/// Name of the environment variable that marks a process as a child. Default is [`DEFAULT_CHILD_ENV_NAME`].
	///
	/// A process is a child if this variable is set to exactly `1`. See [`Role::from_env`].
	pub child_env_name: String,

	/// Extra environment variables for child processes, in addition to this process's own environment.
	pub extra_env: Vec<(OsString, OsString)>,

	/// Standard input for child processes. Default is to share the parent's.
	pub stdin: ChildStdio,

	/// Standard output for child processes. Default is to share the parent's.
	pub stdout: ChildStdio,

	/// Standard error for child processes. Default is to share the parent's.
	pub stderr: ChildStdio,

	/// User to run child processes as. Default is this process's user.
	///
	/// Changing to a different user requires privileges, such as running as root.
	pub uid: Option<Uid>,

	/// Group to run child processes as. Default is this process's group.
	pub gid: Option<Gid>,

	/// Maximum pending connections on the listening socket. Default is 128.
	pub listen_backlog: Option<c_int>,

	/// Remove a stale Unix-domain socket at the listening path before binding. Default is false, in which case binding fails if the path exists.
	///
	/// Files at that path that aren't sockets are never removed.
	pub unlink_stale_unix_socket: bool,
}

impl ForkOptions {
	/// The default value used when [`ForkOptions::listen_backlog`] is `None`.
	pub const DEFAULT_LISTEN_BACKLOG: c_int = 128;

	pub fn with_child_env_name(mut self, name: impl Into<String>) -> Self {
		self.child_env_name = name.into();
		self
	}

	/// Adds extra environment variables for child processes.
	pub fn with_env<I, K, V>(mut self, vars: I) -> Self
	where
		I: IntoIterator<Item = (K, V)>,
		K: Into<OsString>,
		V: Into<OsString>,
	{
		self.extra_env.extend(vars.into_iter().map(|(k, v)| (k.into(), v.into())));
		self
	}

	pub fn with_stdin(mut self, stdin: impl Into<ChildStdio>) -> Self {
		self.stdin = stdin.into();
		self
	}

	pub fn with_stdout(mut self, stdout: impl Into<ChildStdio>) -> Self {
		self.stdout = stdout.into();
		self
	}

	pub fn with_stderr(mut self, stderr: impl Into<ChildStdio>) -> Self {
		self.stderr = stderr.into();
		self
	}

	pub fn with_uid(mut self, uid: Uid) -> Self {
		self.uid = Some(uid);
		self
	}

	pub fn with_gid(mut self, gid: Gid) -> Self {
		self.gid = Some(gid);
		self
	}

	pub fn with_listen_backlog(mut self, backlog: c_int) -> Self {
		self.listen_backlog = Some(backlog);
		self
	}

	pub fn with_unlink_stale_unix_socket(mut self, unlink: bool) -> Self {
		self.unlink_stale_unix_socket = unlink;
		self
	}
}

impl Default for ForkOptions {
	fn default() -> Self {
		Self {
			child_env_name: DEFAULT_CHILD_ENV_NAME.to_owned(),
			extra_env: Vec::new(),
			stdin: ChildStdio::Inherit,
			stdout: ChildStdio::Inherit,
			stderr: ChildStdio::Inherit,
			uid: None,
			gid: None,
			listen_backlog: None,
			unlink_stale_unix_socket: false,
		}
	}
}

#[test]
fn test_builder() {
	let options = ForkOptions::default()
		.with_env([("A", "1")])
		.with_env([("B", "2")])
		.with_uid(Uid::from_raw(1000))
		.with_listen_backlog(16);

	assert_eq!(options.child_env_name, DEFAULT_CHILD_ENV_NAME);
	assert_eq!(
		options.extra_env,
		[
			(OsString::from("A"), OsString::from("1")),
			(OsString::from("B"), OsString::from("2")),
		],
	);
	assert_eq!(options.uid, Some(Uid::from_raw(1000)));
	assert_eq!(options.gid, None);
	assert_eq!(options.listen_backlog, Some(16));
}

#[test]
fn test_stdio_descriptor() {
	use std::{
		io::Read,
		os::unix::net::UnixStream,
		process::Command,
	};

	let (write_end, mut read_end) = UnixStream::pair().unwrap();
	let stdout = ChildStdio::from(OwnedFd::from(write_end));

	let mut command = Command::new("/bin/sh");
	command.args(["-c", "echo hi"]).stdout(stdout.to_stdio().unwrap());

	assert!(command.status().unwrap().success());

	drop(command);
	drop(stdout);

	let mut output = String::new();
	read_end.read_to_string(&mut output).unwrap();
	assert_eq!(output, "hi\n");
}
