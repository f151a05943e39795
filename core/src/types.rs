//! Shared types for the transport core.

use std::fmt::{self, Display, Formatter};
use std::str::FromStr;

use color_eyre::{eyre::eyre, Report};
use serde::{de, Deserialize, Deserializer, Serialize, Serializer};

/// An account identity on the messaging fabric, i.e. `user@host` with an
/// optional per-connection `resource` qualifier.
///
/// Identities without a resource are "bare".  The fabric assigns each live
/// connection a resource, so a bare identity may map to several live
/// resources at once.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Identity {
	user: String,
	host: String,
	resource: Option<String>,
}

impl Identity {
	pub fn bare(user: impl Into<String>, host: impl Into<String>) -> Self {
		Self {
			user: user.into(),
			host: host.into(),
			resource: None,
		}
	}

	pub fn full(
		user: impl Into<String>,
		host: impl Into<String>,
		resource: impl Into<String>,
	) -> Self {
		Self {
			user: user.into(),
			host: host.into(),
			resource: Some(resource.into()),
		}
	}

	pub fn user(&self) -> &str {
		&self.user
	}

	pub fn host(&self) -> &str {
		&self.host
	}

	pub fn resource(&self) -> Option<&str> {
		self.resource.as_deref()
	}

	pub fn is_bare(&self) -> bool {
		self.resource.is_none()
	}

	/// Returns the bare form of this identity, dropping any resource.
	pub fn to_bare(&self) -> Identity {
		Identity {
			user: self.user.clone(),
			host: self.host.clone(),
			resource: None,
		}
	}

	/// Returns a full identity with the given resource in place of any
	/// current one.
	pub fn with_resource(&self, resource: impl Into<String>) -> Identity {
		Identity {
			user: self.user.clone(),
			host: self.host.clone(),
			resource: Some(resource.into()),
		}
	}

	/// Whether the bare parts of the two identities match.
	pub fn same_bare(&self, other: &Identity) -> bool {
		self.user == other.user && self.host == other.host
	}
}

impl Display for Identity {
	fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
		write!(f, "{}@{}", self.user, self.host)?;
		if let Some(resource) = &self.resource {
			write!(f, "/{resource}")?;
		}
		Ok(())
	}
}

impl FromStr for Identity {
	type Err = Report;

	fn from_str(s: &str) -> Result<Self, Self::Err> {
		let (bare, resource) = match s.split_once('/') {
			Some((bare, resource)) if !resource.is_empty() => (bare, Some(resource)),
			Some(_) => return Err(eyre!("identity has an empty resource: {s}")),
			None => (s, None),
		};
		let (user, host) = bare
			.split_once('@')
			.ok_or_else(|| eyre!("identity is missing the host part: {s}"))?;
		if user.is_empty() || host.is_empty() {
			return Err(eyre!("identity has an empty user or host: {s}"));
		}
		Ok(Identity {
			user: user.to_string(),
			host: host.to_string(),
			resource: resource.map(ToString::to_string),
		})
	}
}

impl Serialize for Identity {
	fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
		serializer.serialize_str(&self.to_string())
	}
}

impl<'de> Deserialize<'de> for Identity {
	fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
		let s = String::deserialize(deserializer)?;
		s.parse().map_err(de::Error::custom)
	}
}

/// Credentials for connecting an account to the fabric.
#[derive(Clone, Debug)]
pub struct Account {
	/// Bare identity of the account.
	pub identity: Identity,
	pub password: String,
}

impl Account {
	pub fn new(identity: Identity, password: impl Into<String>) -> Self {
		Self {
			identity: identity.to_bare(),
			password: password.into(),
		}
	}
}

pub mod duration_seconds_format {
	use serde::{Deserialize, Deserializer, Serialize, Serializer};
	use std::time::Duration;

	pub fn serialize<S: Serializer>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
		duration.as_secs_f64().serialize(serializer)
	}

	pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
		let seconds = f64::deserialize(deserializer)?;
		Ok(Duration::from_secs_f64(seconds))
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use test_case::test_case;

	#[test_case("alice@example.org" => (false, None) ; "bare identity")]
	#[test_case("alice@example.org/res-1" => (true, Some("res-1".to_string())) ; "full identity")]
	fn identity_parsing(s: &str) -> (bool, Option<String>) {
		let id: Identity = s.parse().unwrap();
		assert_eq!(id.to_string(), s);
		(!id.is_bare(), id.resource().map(ToString::to_string))
	}

	#[test_case("alice" ; "missing host")]
	#[test_case("@example.org" ; "empty user")]
	#[test_case("alice@" ; "empty host")]
	#[test_case("alice@example.org/" ; "empty resource")]
	fn invalid_identities(s: &str) {
		assert!(s.parse::<Identity>().is_err());
	}

	#[test]
	fn bare_and_resource_helpers() {
		let bare: Identity = "srv@example.org".parse().unwrap();
		let full = bare.with_resource("res-7");
		assert!(full.same_bare(&bare));
		assert_eq!(full.to_bare(), bare);
		assert_eq!(full.resource(), Some("res-7"));
	}
}
