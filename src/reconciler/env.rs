//! Environment handed to a started service.

use crate::service::ServiceSpec;

pub const ENV_NAME: &str = "SERVICE_NAME";
pub const ENV_VERSION: &str = "SERVICE_VERSION";
pub const ENV_NAMESPACE: &str = "SERVICE_NAMESPACE";
pub const SECRET_AUTH_ID: &str = "SERVICE_AUTH_ID";
pub const SECRET_AUTH_SECRET: &str = "SERVICE_AUTH_SECRET";

/// Identity vars, then the spec's env, then profile overrides, then the
/// namespace. Later entries replace earlier ones with the same key;
/// entries without `=` are dropped.
pub fn runtime_env(spec: &ServiceSpec, profile: &[String]) -> Vec<String> {
    let mut vars: Vec<(String, String)> = vec![
        (ENV_NAME.to_string(), spec.name.clone()),
        (ENV_VERSION.to_string(), spec.version.clone()),
    ];

    for entry in spec.env.iter().chain(profile) {
        match entry.split_once('=') {
            Some((key, value)) if !key.is_empty() => set(&mut vars, key, value),
            _ => {}
        }
    }
    set(&mut vars, ENV_NAMESPACE, &spec.namespace);

    vars.into_iter().map(|(k, v)| format!("{}={}", k, v)).collect()
}

fn set(vars: &mut Vec<(String, String)>, key: &str, value: &str) {
    match vars.iter_mut().find(|(k, _)| k == key) {
        Some(existing) => existing.1 = value.to_string(),
        None => vars.push((key.to_string(), value.to_string())),
    }
}
