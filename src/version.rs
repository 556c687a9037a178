//! Build stamp reported by `micro-run version`.

const PKG_NAME: &str = env!("CARGO_PKG_NAME");
const PKG_VERSION: &str = env!("CARGO_PKG_VERSION");
const PKG_DESCRIPTION: &str = env!("CARGO_PKG_DESCRIPTION");
const PKG_LICENSE: Option<&str> = option_env!("CARGO_PKG_LICENSE");
const COMMIT: Option<&str> = option_env!("MICRO_RUN_COMMIT");
const BUILT_AT: Option<&str> = option_env!("MICRO_RUN_BUILT_AT");
const TARGET: Option<&str> = option_env!("MICRO_RUN_TARGET");
const PROFILE: Option<&str> = option_env!("MICRO_RUN_PROFILE");
const RUSTC: Option<&str> = option_env!("MICRO_RUN_RUSTC");

pub fn short() -> String {
    format!("{PKG_NAME} {PKG_VERSION}")
}

pub fn describe() -> String {
    let mut lines = vec![short(), PKG_DESCRIPTION.to_string()];
    if let Some(license) = PKG_LICENSE {
        lines.push(format!("license: {license}"));
    }
    lines.push(format!("commit: {}", COMMIT.unwrap_or("unknown")));
    lines.push(format!(
        "built: {} [{} for {}]",
        BUILT_AT.unwrap_or("unknown time"),
        PROFILE.unwrap_or("unknown profile"),
        TARGET.unwrap_or("unknown target"),
    ));
    lines.push(format!("rustc: {}", RUSTC.unwrap_or("unknown rustc")));
    lines.join("\n")
}
