//! Selection of the RPC methods the server forwards to its backend.
//!
//! Methods come from an explicit comma-separated list and/or a JSON
//! method-spec file (an array of `{"name": .., "returns": ..}` entries;
//! entries without a `returns` field describe notifications and are
//! skipped).  An exclude list is subtracted from the union.

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
			info!(name, "using method from the JSON spec");
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

#[cfg(test)]
mod tests {
	use super::*;
	use std::io::Write;

	fn config(methods: &str, exclude: &str, spec: &str) -> RuntimeConfig {
		RuntimeConfig {
			methods: methods.to_string(),
			methods_exclude: exclude.to_string(),
			methods_json_spec: spec.to_string(),
			..Default::default()
		}
	}

	#[test]
	fn explicit_list_minus_excluded() {
		let selected = selected_methods(&config("echo,getstate,stop", "stop", "")).unwrap();
		assert_eq!(
			selected.into_iter().collect::<Vec<_>>(),
			vec!["echo".to_string(), "getstate".to_string()],
		);
	}

	#[test]
	fn spec_entries_without_returns_are_notifications() {
		let mut file = tempfile::NamedTempFile::new().unwrap();
		write!(
			file,
			r#"[
				{{"name": "getstate", "returns": {{}}}},
				{{"name": "notifyme"}}
			]"#,
		)
		.unwrap();

		let cfg = config("echo", "", file.path().to_str().unwrap());
		let selected = selected_methods(&cfg).unwrap();
		assert_eq!(
			selected.into_iter().collect::<Vec<_>>(),
			vec!["echo".to_string(), "getstate".to_string()],
		);
	}

	#[test]
	fn empty_selection_is_fine() {
		assert!(selected_methods(&config("", "", "")).unwrap().is_empty());
	}
}
