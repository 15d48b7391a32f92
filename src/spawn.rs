use crate::{
	errors::ForkError,
	identity::Credentials,
	sys,
	DisplayAddr,
	ForkOptions,
	TransferableConnection,
};
use socket2::SockRef;
use std::{
	env,
	os::{
		fd::{AsRawFd, OwnedFd},
		unix::process::CommandExt,
	},
	process::Command,
};
use tracing::debug;

#[cfg(doc)]
use crate::{listen, ParentListener};

/// Hands `connection` to a new copy of the running program, and blocks until that copy exits.
///
/// The new process runs the same executable with the same arguments, in a new session, as the user and group from [`Credentials::resolve`]. Its environment is this process's, plus [`ForkOptions::extra_env`], plus [`ForkOptions::child_env_name`] set to `1`. The connection is at file descriptor 3, so the new process's own call to [`listen`] yields a child listener with this connection in it.
///
/// This process's handle to the connection is closed as soon as the new process has been started (or has failed to start). Only the new process holds the connection while this function waits.
///
/// This is what [`ParentListener`] does for each accepted connection, on a thread of its own.
///
///
/// # Errors
///
/// [`ForkError::ChildExited`] if the new process exits unsuccessfully. Any other error means no process was started.
pub fn fork<C>(connection: C, options: &ForkOptions) -> Result<(), ForkError>
where
	C: TransferableConnection,
{
	let peer: String =
		SockRef::from(&connection)
		.peer_addr()
		.map(|addr| DisplayAddr(&addr).to_string())
		.unwrap_or_else(|_| "(unknown peer)".to_owned());

	let credentials = Credentials::resolve(options);

	let descriptor: OwnedFd =
		connection.duplicate_descriptor()
		.map_err(|error| ForkError::DuplicateDescriptor { error })?;

	let command: Command = build_command(&descriptor, options, credentials)?;

	debug!(%peer, uid = %credentials.uid, gid = %credentials.gid, "starting child process");

	run_child(command, descriptor, connection, &peer)
}

/// Starts `command`, closes this process's handles to the connection, and waits for the child to exit.
pub(crate) fn run_child<C>(
	mut command: Command,
	descriptor: OwnedFd,
	connection: C,
	peer: &str,
) -> Result<(), ForkError> {
	let spawned = command.spawn();

	// The new process has its own copy now, or never will.
	drop(command);
	drop(descriptor);
	drop(connection);

	let mut child = spawned.map_err(|error| ForkError::Spawn { error })?;
	let pid: u32 = child.id();

	debug!(%peer, pid, "child process started");

	let status =
		child.wait()
		.map_err(|error| ForkError::Wait { error })?;

	debug!(%peer, pid, %status, "child process released");

	if !status.success() {
		return Err(ForkError::ChildExited { status });
	}

	Ok(())
}

pub(crate) fn build_command(
	descriptor: &OwnedFd,
	options: &ForkOptions,
	credentials: Credentials,
) -> Result<Command, ForkError> {
	let executable =
		env::current_exe()
		.map_err(|error| ForkError::CurrentExe { error })?;

	let mut args = env::args_os();

	let mut command = Command::new(executable);

	if let Some(arg0) = args.next() {
		command.arg0(arg0);
	}

	let stdio = |stream: &'static str, stdio: &crate::ChildStdio| {
		stdio.to_stdio()
		.map_err(|error| ForkError::Stdio { stream, error })
	};

	command
	.args(args)
	.uid(credentials.uid.as_raw())
	.gid(credentials.gid.as_raw())
	.stdin(stdio("stdin", &options.stdin)?)
	.stdout(stdio("stdout", &options.stdout)?)
	.stderr(stdio("stderr", &options.stderr)?)
	.envs(options.extra_env.iter().map(|(key, value)| (key, value)))
	.env(&options.child_env_name, "1");

	install_descriptor(&mut command, descriptor);

	Ok(command)
}

/// Arranges for `descriptor` to be at file descriptor 3 in the process `command` starts, which also gets a session of its own.
///
/// `descriptor` must stay open until the process has been spawned.
pub(crate) fn install_descriptor(command: &mut Command, descriptor: &OwnedFd) {
	let fd = descriptor.as_raw_fd();

	// Safety: `prepare_child` only makes async-signal-safe system calls.
	unsafe {
		command.pre_exec(move || sys::prepare_child(fd));
	}
}

#[cfg(test)]
mod tests {
	use assert_matches::assert_matches;
	use nix::unistd::{Gid, Uid};
	use std::{
		ffi::{OsStr, OsString},
		io::Read,
		os::unix::net::UnixStream,
		path::Path,
	};
	use super::*;

	#[test]
	fn test_build_command() {
		let (a, _b) = UnixStream::pair().unwrap();
		let descriptor = a.duplicate_descriptor().unwrap();

		let options = ForkOptions::default()
			.with_child_env_name("TEST_FORK_CHILD")
			.with_env([("EXTRA_ONE", "a"), ("EXTRA_TWO", "b")]);

		let credentials = Credentials {
			uid: Uid::current(),
			gid: Gid::current(),
		};

		let command = build_command(&descriptor, &options, credentials).unwrap();

		assert_eq!(Path::new(command.get_program()), env::current_exe().unwrap().as_path());

		let expected_args: Vec<OsString> = env::args_os().skip(1).collect();
		let actual_args: Vec<OsString> = command.get_args().map(OsStr::to_owned).collect();
		assert_eq!(actual_args, expected_args);

		let envs: Vec<(&OsStr, Option<&OsStr>)> = command.get_envs().collect();
		assert!(envs.contains(&(OsStr::new("TEST_FORK_CHILD"), Some(OsStr::new("1")))));
		assert!(envs.contains(&(OsStr::new("EXTRA_ONE"), Some(OsStr::new("a")))));
		assert!(envs.contains(&(OsStr::new("EXTRA_TWO"), Some(OsStr::new("b")))));
	}

	#[test]
	fn test_marker_overrides_extra_env() {
		let (a, _b) = UnixStream::pair().unwrap();
		let descriptor = a.duplicate_descriptor().unwrap();

		// An extra variable with the marker's name can't turn the marker off.
		let options = ForkOptions::default()
			.with_env([(crate::DEFAULT_CHILD_ENV_NAME, "0")]);

		let command = build_command(&descriptor, &options, Credentials::resolve(&options)).unwrap();

		let marker: Option<Option<&OsStr>> =
			command.get_envs()
			.find(|(key, _)| *key == OsStr::new(crate::DEFAULT_CHILD_ENV_NAME))
			.map(|(_, value)| value);

		assert_eq!(marker, Some(Some(OsStr::new("1"))));
	}

	fn shell(script: &str) -> Command {
		let mut command = Command::new("/bin/sh");
		command.arg("-c").arg(script);
		command
	}

	#[test]
	fn test_child_sees_connection() {
		let (a, mut b) = UnixStream::pair().unwrap();
		let descriptor = a.duplicate_descriptor().unwrap();

		let mut command = shell("echo ok >&3");
		install_descriptor(&mut command, &descriptor);

		run_child(command, descriptor, a, "test peer").unwrap();

		// Both of this process's handles are gone, and so is the child's, so this reaches end of file.
		let mut received = String::new();
		b.read_to_string(&mut received).unwrap();
		assert_eq!(received, "ok\n");
	}

	#[test]
	fn test_child_failure() {
		let (a, _b) = UnixStream::pair().unwrap();
		let descriptor = a.duplicate_descriptor().unwrap();

		let mut command = shell("exit 3");
		install_descriptor(&mut command, &descriptor);

		assert_matches!(
			run_child(command, descriptor, a, "test peer"),
			Err(ForkError::ChildExited { status })
			if status.code() == Some(3)
		);
	}

	#[test]
	fn test_spawn_failure() {
		let (a, _b) = UnixStream::pair().unwrap();
		let descriptor = a.duplicate_descriptor().unwrap();

		let command = Command::new("/nonexistent/fork-listener-test-program");

		assert_matches!(
			run_child(command, descriptor, a, "test peer"),
			Err(ForkError::Spawn { .. })
		);
	}
}
