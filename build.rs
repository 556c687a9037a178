use std::env;
use std::process::Command;

use chrono::Utc;

fn main() {
	println!("cargo:rerun-if-changed=build.rs");
	println!("cargo:rerun-if-env-changed=GIT_DIR");
	println!("cargo:rerun-if-changed=.git/HEAD");

	let commit = match git(&["rev-parse", "--short", "HEAD"]) {
		Ok(sha) => {
			let dirty = git(&["status", "--porcelain"])
				.map(|out| !out.trim().is_empty())
				.unwrap_or(false);
			if dirty { format!("{sha}-dirty") } else { sha }
		}
		Err(err) => {
			println!("cargo:warning=commit stamp unavailable: {err}");
			"unknown".to_string()
		}
	};

	let rustc = Command::new(env::var("RUSTC").unwrap_or_else(|_| "rustc".into()))
		.arg("--version")
		.output()
		.ok()
		.filter(|out| out.status.success())
		.and_then(|out| String::from_utf8(out.stdout).ok())
		.map(|text| text.trim().to_string())
		.unwrap_or_else(|| "unknown".into());

	let stamps = [
		("MICRO_RUN_COMMIT", commit),
		("MICRO_RUN_BUILT_AT", Utc::now().to_rfc3339()),
		("MICRO_RUN_TARGET", env::var("TARGET").unwrap_or_else(|_| "unknown".into())),
		("MICRO_RUN_PROFILE", env::var("PROFILE").unwrap_or_else(|_| "unknown".into())),
		("MICRO_RUN_RUSTC", rustc),
	];
	for (key, value) in stamps {
		println!("cargo:rustc-env={key}={value}");
	}
}

fn git(args: &[&str]) -> Result<String, String> {
	let output = Command::new("git")
		.args(args)
		.output()
		.map_err(|err| err.to_string())?;
	if !output.status.success() {
		return Err(format!("git {:?} exited with {:?}", args, output.status.code()));
	}
	String::from_utf8(output.stdout)
		.map(|text| text.trim().to_string())
		.map_err(|err| err.to_string())
}
