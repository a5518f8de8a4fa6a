//! # gcdctl
//!
//! Drives the gcd G-code interpreter through a [`session::Session`].
//!
//! ## Overview
//!
//! - **Configuration**: TOML file with environment overrides ([`config`])
//! - **Invocation**: the gcd command line built from configuration ([`invocation`])
//! - **Runner**: spawns gcd, writes commands, echoes output, reports the exit ([`runner`])
//!
//! ```text
//!   Config ──► Invocation ──► Runner ──► Session ──► gcd -c <cfg> --configtest
//!                               ▲                        │
//!                               └──── stdout / stderr ◄──┘
//! ```

pub mod config;
pub mod invocation;
pub mod runner;

pub use config::{default_config_path, Config, ConfigError};
pub use invocation::Invocation;
pub use runner::{exit_code, InputSource, RunOptions, Runner};
