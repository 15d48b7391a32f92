use assert_matches::assert_matches;
use escargot::CargoBuild;
use fork_listener::{
	errors::ListenError,
	listen_with_role,
	BindContext,
	ForkOptions,
	Role,
	DEFAULT_CHILD_ENV_NAME,
};
use std::{
	collections::HashSet,
	io::{BufRead, BufReader, Read, Write},
	net::TcpStream,
	os::unix::{net::UnixStream, process::CommandExt},
	path::Path,
	process::{Child, Command, Stdio},
	sync::mpsc,
	thread,
	time::{Duration, Instant},
};

fn demo_command() -> Command {
	let mut command =
		CargoBuild::new()
		.example("peer_echo")
		.run()
		.unwrap()
		.command();

	command.env_remove(DEFAULT_CHILD_ENV_NAME);
	command
}

/// Starts the demo as a parent, and returns it along with the address it printed.
fn start_parent(args: &[&str]) -> (KillOnDrop, String) {
	let mut command = demo_command();
	command.args(args);
	spawn_parent(&mut command)
}

fn spawn_parent(command: &mut Command) -> (KillOnDrop, String) {
	let mut parent = KillOnDrop(
		command
		.stdout(Stdio::piped())
		.spawn()
		.unwrap()
	);

	let mut line = String::new();
	BufReader::new(parent.stdout.take().unwrap()).read_line(&mut line).unwrap();

	let addr =
		line.trim_end()
		.strip_prefix("listening on ")
		.unwrap_or_else(|| panic!("unexpected first line from parent: {line:?}"))
		.to_owned();

	(parent, addr)
}

/// Parses a `<pid> <peer address>` response.
fn parse_response(response: &str) -> (u32, String) {
	let (pid, peer) =
		response.trim_end()
		.split_once(' ')
		.unwrap_or_else(|| panic!("malformed response {response:?}"));

	(pid.parse().unwrap(), peer.to_owned())
}

#[test]
fn tcp_handoff() {
	let (parent, addr) = start_parent(&["--network", "tcp4", "127.0.0.1:0"]);

	let mut child_pids = HashSet::new();

	for _ in 0..2 {
		let mut client = TcpStream::connect(&addr).unwrap();
		let client_addr = client.local_addr().unwrap();

		let mut response = String::new();
		client.read_to_string(&mut response).unwrap();

		let (pid, peer) = parse_response(&response);

		// The child sees the client exactly as the client sees itself.
		assert_eq!(peer, client_addr.to_string());

		assert_ne!(pid, parent.id());
		assert_ne!(pid, std::process::id());
		assert!(child_pids.insert(pid), "two connections were served by the same process");
	}
}

#[test]
fn failed_child_does_not_stop_parent() {
	let mut command = demo_command();

	command
	.args(["--network", "tcp4", "--fail-on", "fail", "127.0.0.1:0"])
	.env("RUST_LOG", "error")
	.env("NO_COLOR", "1")
	.stderr(Stdio::piped());

	let (mut parent, addr) = spawn_parent(&mut command);

	let (log_tx, log_rx) = mpsc::channel::<String>();
	let stderr = parent.stderr.take().unwrap();

	thread::spawn(move || {
		for line in BufReader::new(stderr).lines() {
			let Ok(line) = line else { break };

			if log_tx.send(line).is_err() {
				break;
			}
		}
	});

	// This child exits with a failure status without answering.
	let mut client = TcpStream::connect(&addr).unwrap();
	client.write_all(b"fail\n").unwrap();

	let mut response = String::new();
	client.read_to_string(&mut response).unwrap();
	assert_eq!(response, "");

	// The parent logs the failure.
	let deadline = Instant::now() + Duration::from_secs(30);

	loop {
		let remaining = deadline.saturating_duration_since(Instant::now());

		let line =
			log_rx.recv_timeout(remaining)
			.unwrap_or_else(|error| panic!("parent never logged the failed child: {error}"));

		if line.contains("exited with exit status: 1") {
			break;
		}
	}

	// And keeps serving.
	let mut client = TcpStream::connect(&addr).unwrap();
	let client_addr = client.local_addr().unwrap();
	client.write_all(b"hello\n").unwrap();

	let mut response = String::new();
	client.read_to_string(&mut response).unwrap();

	let (pid, peer) = parse_response(&response);
	assert_eq!(peer, client_addr.to_string());
	assert_ne!(pid, parent.id());

	assert!(parent.try_wait().unwrap().is_none(), "parent exited");
}

#[test]
fn unix_handoff() {
	let path = Path::new("target").join("peer_echo_test.socket");

	let (parent, addr) = start_parent(&[
		"--network", "unix",
		"--unlink",
		path.to_str().unwrap(),
	]);

	assert_eq!(Path::new(&addr), path);

	let mut client = UnixStream::connect(&path).unwrap();

	let mut response = String::new();
	client.read_to_string(&mut response).unwrap();

	let (pid, peer) = parse_response(&response);
	assert_eq!(peer, "(unnamed)");
	assert_ne!(pid, parent.id());
}

#[test]
fn child_without_descriptor() {
	let mut command = demo_command();

	command
	.env(DEFAULT_CHILD_ENV_NAME, "1")
	.arg("127.0.0.1:0")
	.stdout(Stdio::null())
	.stderr(Stdio::piped());

	// Make sure nothing this process inherited turns up at descriptor 3.
	unsafe {
		command.pre_exec(|| {
			libc::close(3);
			Ok(())
		});
	}

	let output = command.output().unwrap();
	let stderr = String::from_utf8_lossy(&output.stderr);

	assert!(!output.status.success());
	assert!(stderr.contains("file descriptor 3"), "unexpected error output: {stderr}");
}

#[test]
fn datagram_listener_rejected() {
	assert_matches!(
		listen_with_role(
			Role::Parent,
			&BindContext::new(),
			"udp",
			"127.0.0.1:0",
			ForkOptions::default(),
		),
		Err(ListenError::UnsupportedListenerType { .. })
	);
}

#[derive(derive_more::Deref, derive_more::DerefMut)]
struct KillOnDrop(Child);
impl Drop for KillOnDrop {
	fn drop(&mut self) {
		let _ = self.0.kill();
		let _ = self.0.wait();
	}
}
