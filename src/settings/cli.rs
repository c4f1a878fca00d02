use super::Parser;

#[derive(Parser, Debug)]
#[command(about = "Rate limiting and session refresh service")]
pub struct Cli {
    /// Path to a settings file; defaults to settings/dev.toml or settings/release.toml.
    #[arg(long)]
    pub settings: Option<String>,
}
