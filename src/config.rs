//! Configuration: an optional TOML file, overridable field-by-field by CLI
//! flags. Every field has a default so a config file is itself optional.

use std::path::Path;
use std::time::Duration;

use serde::Deserialize;

use crate::crypto::Method;
use crate::error::Error;

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
	/// TCP+UDP bind address (server) or upstream server address (client).
	pub server_address: String,
	pub password: String,
	#[serde(default)]
	pub method: Method,
	#[serde(default = "default_timeout_secs")]
	pub timeout_secs: u64,
	#[serde(default = "default_rate_limit")]
	pub rate_limit: u32,
	#[serde(default = "default_rate_burst")]
	pub rate_burst: u32,
	#[serde(default = "default_key_rotation_hours")]
	pub key_rotation_hours: u64,
	#[serde(default = "default_true")]
	pub enable_udp: bool,
	#[serde(default = "default_local_address")]
	pub local_address: String,
	#[serde(default = "default_log_level")]
	pub log_level: String,
}

fn default_timeout_secs() -> u64 {
	5 * 60
}
fn default_rate_limit() -> u32 {
	100
}
fn default_rate_burst() -> u32 {
	200
}
fn default_key_rotation_hours() -> u64 {
	24
}
fn default_true() -> bool {
	true
}
fn default_local_address() -> String {
	"127.0.0.1:1080".to_owned()
}
fn default_log_level() -> String {
	"info".to_owned()
}

impl Default for Config {
	fn default() -> Self {
		Config {
			server_address: String::new(),
			password: String::new(),
			method: Method::default(),
			timeout_secs: default_timeout_secs(),
			rate_limit: default_rate_limit(),
			rate_burst: default_rate_burst(),
			key_rotation_hours: default_key_rotation_hours(),
			enable_udp: true,
			local_address: default_local_address(),
			log_level: default_log_level(),
		}
	}
}

impl Config {
	pub fn load(path: &Path) -> Result<Self, Error> {
		let contents = std::fs::read_to_string(path)
			.map_err(|e| Error::Config(format!("reading {}: {e}", path.display())))?;
		toml::from_str(&contents).map_err(|e| Error::Config(format!("parsing {}: {e}", path.display())))
	}

	pub fn timeout(&self) -> Duration {
		Duration::from_secs(self.timeout_secs)
	}

	/// `0` disables rotation entirely.
	pub fn key_rotation_interval(&self) -> Option<Duration> {
		if self.key_rotation_hours == 0 {
			None
		} else {
			Some(Duration::from_secs(self.key_rotation_hours * 3600))
		}
	}

	pub fn validate(&self) -> Result<(), Error> {
		if self.server_address.is_empty() {
			return Err(Error::Config("server_address must not be empty".into()));
		}
		if self.password.is_empty() {
			return Err(Error::Config("password must not be empty".into()));
		}
		Ok(())
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn defaults_match_spec() {
		let c = Config::default();
		assert_eq!(c.timeout_secs, 300);
		assert_eq!(c.method, Method::Aes256Gcm);
		assert_eq!(c.local_address, "127.0.0.1:1080");
	}

	#[test]
	fn zero_rotation_disables_rotation() {
		let mut c = Config::default();
		c.key_rotation_hours = 0;
		assert!(c.key_rotation_interval().is_none());
	}

	#[test]
	fn load_parses_minimal_toml() {
		let dir = std::env::temp_dir();
		let path = dir.join(format!("nyxsocks-test-config-{:?}.toml", std::thread::current().id()));
		std::fs::write(
			&path,
			"server_address = \"0.0.0.0:8443\"\npassword = \"hunter2\"\n",
		)
		.unwrap();
		let c = Config::load(&path).unwrap();
		std::fs::remove_file(&path).ok();
		assert_eq!(c.server_address, "0.0.0.0:8443");
		assert_eq!(c.rate_limit, 100);
	}

	#[test]
	fn validate_rejects_empty_password() {
		let mut c = Config::default();
		c.server_address = "0.0.0.0:8443".into();
		assert!(c.validate().is_err());
	}
}
