//! Settings are read from a TOML file plus `TURNSTILE__SECTION__KEY`
//! environment overrides, then validated. See `bin/settings_demo.rs`.

mod cli;
pub use clap::Parser;
pub use cli::*;

mod settings;
pub use settings::*;
