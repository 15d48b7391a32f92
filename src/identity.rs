//! The user and group identity that child processes run as.

use crate::ForkOptions;
use libc::{gid_t, uid_t};
use nix::unistd::{Group, User};

pub use nix::unistd::{Gid, Uid};
use std::str::FromStr;

/// The user and group a child process is started with.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct Credentials {
	pub uid: Uid,
	pub gid: Gid,
}

impl Credentials {
	/// The configured override, if any, falling back to this process's real user and group IDs.
	pub fn resolve(options: &ForkOptions) -> Self {
		Self {
			uid: options.uid.unwrap_or_else(Uid::current),
			gid: options.gid.unwrap_or_else(Gid::current),
		}
	}
}

#[derive(Clone, Copy, Debug, derive_more::Display, Eq, PartialEq)]
pub enum PrincipalKind {
	#[display(fmt = "user")]
	User,

	#[display(fmt = "group")]
	Group,
}

/// An error looking up a user or group by name.
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum PrincipalLookupError {
	#[error("{principal_kind} not found")]
	NotFound {
		principal_kind: PrincipalKind,
	},

	#[error("error looking up {principal_kind} ID: {error}")]
	Error {
		principal_kind: PrincipalKind,

		#[source]
		error: nix::Error,
	},
}

/// Parses a user, given either as a numeric ID or as a user name.
///
/// This is meant for command-line front ends, for example as a `clap` value parser for a `--uid` option that feeds [`ForkOptions::uid`].
pub fn parse_uid(user: &str) -> Result<Uid, PrincipalLookupError> {
	if let Ok(id) = uid_t::from_str(user) {
		return Ok(Uid::from_raw(id));
	}

	match User::from_name(user) {
		Ok(Some(user)) => Ok(user.uid),
		Ok(None) => Err(PrincipalLookupError::NotFound {
			principal_kind: PrincipalKind::User,
		}),
		Err(error) => Err(PrincipalLookupError::Error {
			principal_kind: PrincipalKind::User,
			error,
		}),
	}
}

/// Parses a group, given either as a numeric ID or as a group name.
pub fn parse_gid(group: &str) -> Result<Gid, PrincipalLookupError> {
	if let Ok(id) = gid_t::from_str(group) {
		return Ok(Gid::from_raw(id));
	}

	match Group::from_name(group) {
		Ok(Some(group)) => Ok(group.gid),
		Ok(None) => Err(PrincipalLookupError::NotFound {
			principal_kind: PrincipalKind::Group,
		}),
		Err(error) => Err(PrincipalLookupError::Error {
			principal_kind: PrincipalKind::Group,
			error,
		}),
	}
}

#[cfg(test)]
mod tests {
	use assert_matches::assert_matches;
	use super::*;

	#[test]
	fn test_resolve() {
		let current = Credentials::resolve(&ForkOptions::default());
		assert_eq!(current.uid, Uid::current());
		assert_eq!(current.gid, Gid::current());

		let options = ForkOptions::default()
			.with_uid(Uid::from_raw(4242))
			.with_gid(Gid::from_raw(4343));

		assert_eq!(
			Credentials::resolve(&options),
			Credentials {
				uid: Uid::from_raw(4242),
				gid: Gid::from_raw(4343),
			},
		);
	}

	#[test]
	fn test_principal_parse_lookup() {
		let my_uid = Uid::current();
		let my_user = User::from_uid(my_uid).unwrap().unwrap().name;
		let my_gid = Gid::current();
		let my_group = Group::from_gid(my_gid).unwrap().unwrap().name;

		assert_eq!(parse_uid(&format!("{my_uid}")).unwrap(), my_uid);
		assert_eq!(parse_uid(&my_user).unwrap(), my_uid);
		assert_eq!(parse_gid(&format!("{my_gid}")).unwrap(), my_gid);
		assert_eq!(parse_gid(&my_group).unwrap(), my_gid);

		assert_matches!(
			parse_uid("<imaginary user, looking up for testing, please ignore>"),
			Err(PrincipalLookupError::NotFound {
				principal_kind: PrincipalKind::User,
			})
		);

		assert_matches!(
			parse_gid("<imaginary group, looking up for testing, please ignore>"),
			Err(PrincipalLookupError::NotFound {
				principal_kind: PrincipalKind::Group,
			})
		);
	}
}
