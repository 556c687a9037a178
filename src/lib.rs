pub mod app;
pub mod auth;
pub mod build;
pub mod cancel;
pub mod cli;
pub mod config;
pub mod error;
pub mod platform;
pub mod reconciler;
pub mod runtime;
pub mod service;
pub mod source;
pub mod store;
pub mod supervisor;
pub mod version;

pub use error::{Error, Result};
