use anyhow::Context as _;
use fork_listener::{
	identity::{parse_gid, parse_uid, Gid, Uid},
	listen,
	DisplayAddr,
	ForkOptions,
};
use std::io::{self, BufRead, BufReader, Write};
use tracing_subscriber::EnvFilter;

/// A server that tells each client which process served it, and what address that process saw the client at.
///
/// Every connection is served by a fresh copy of this program.
#[derive(clap::Parser)]
struct CommandLine {
	/// Network to listen on: `tcp`, `tcp4`, `tcp6`, or `unix`.
	#[arg(long, default_value = "tcp")]
	network: String,

	/// Run children as this user, given as a name or a numeric ID.
	#[arg(long, value_parser = parse_uid)]
	uid: Option<Uid>,

	/// Run children as this group, given as a name or a numeric ID.
	#[arg(long, value_parser = parse_gid)]
	gid: Option<Gid>,

	/// Remove a stale Unix-domain socket at the address before listening.
	#[arg(long)]
	unlink: bool,

	/// Make each child read one line from its client first, and exit with a failure status if the line is this word.
	#[arg(long, value_name = "WORD")]
	fail_on: Option<String>,

	/// Address to listen on, like `127.0.0.1:8080`, `:8080`, or a socket path.
	address: String,
}

fn main() -> anyhow::Result<()> {
	tracing_subscriber::fmt()
	.with_env_filter(EnvFilter::from_default_env())
	.with_writer(io::stderr)
	.init();

	// Children get the same command line, so they parse it the same way.
	let command_line = <CommandLine as clap::Parser>::parse();

	let mut options = ForkOptions::default()
		.with_unlink_stale_unix_socket(command_line.unlink);

	if let Some(uid) = command_line.uid {
		options = options.with_uid(uid);
	}

	if let Some(gid) = command_line.gid {
		options = options.with_gid(gid);
	}

	let listener =
		listen(&command_line.network, &command_line.address, options)
		.context("couldn't listen")?;

	if listener.is_parent() {
		println!("listening on {}", DisplayAddr(listener.local_addr()));
		io::stdout().flush()?;

		return match listener.run() {
			Err(error) if error.is_closed() => Ok(()),
			result => result.context("listener failed"),
		};
	}

	let pid = std::process::id();

	for connection in listener.incoming() {
		let mut connection = connection.context("couldn't accept a connection")?;

		if let Some(word) = &command_line.fail_on {
			let mut line = String::new();

			BufReader::new(&connection).read_line(&mut line)
			.context("couldn't read from the peer")?;

			if line.trim_end() == word {
				tracing::error!(%word, "told to fail");
				std::process::exit(1);
			}
		}

		let peer =
			connection.peer_addr()
			.context("couldn't get the peer's address")?;

		writeln!(connection, "{pid} {}", DisplayAddr(&peer))
		.context("couldn't write to the peer")?;

		connection.close()
		.context("couldn't close the connection")?;
	}

	Ok(())
}
