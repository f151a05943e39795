//! Selection of the RPC methods exposed on the local endpoint, mirroring
//! the server-side selection: explicit list and/or JSON method-spec file,
//! minus an exclude list.

use std::collections::BTreeSet;
use std::fs;

use color_eyre::{eyre::eyre, eyre::WrapErr, Result};
use serde_json::Value;
use tracing::info;

use crate::config::RuntimeConfig;

fn parse_comma_separated(list: &str) -> BTreeSet<String> {
	if list.is_empty() {
		return BTreeSet::new();
	}
	list.split(',').map(ToString::to_string).collect()
}

fn methods_from_json_spec(file: &str) -> Result<BTreeSet<String>> {
	if file.is_empty() {
		return Ok(BTreeSet::new());
	}

	info!(file, "loading JSON method specification");
	let raw = fs::read_to_string(file).wrap_err("failed to open the JSON spec file")?;
	let spec: Value = serde_json::from_str(&raw).wrap_err("invalid JSON spec file")?;
	let entries = spec
		.as_array()
		.ok_or_else(|| eyre!("JSON specification is not an array"))?;

	let mut result = BTreeSet::new();
	for entry in entries {
		let name = entry["name"]
			.as_str()
			.ok_or_else(|| eyre!("spec entry without a name: {entry}"))?;
		if entry.get("returns").is_some() {
			result.insert(name.to_string());
		} else {
			info!(name, "ignoring notification");
		}
	}

	Ok(result)
}

/// The effective set of forwarded methods per the configuration.
pub fn selected_methods(config: &RuntimeConfig) -> Result<BTreeSet<String>> {
	let mut methods = parse_comma_separated(&config.methods);
	methods.extend(methods_from_json_spec(&config.methods_json_spec)?);

	for excluded in parse_comma_separated(&config.methods_exclude) {
		methods.remove(&excluded);
	}

	Ok(methods)
}
