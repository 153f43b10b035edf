use clap::Parser;
use std::path::PathBuf;

#[derive(Parser, Debug, Clone)]
#[command(author, version, about, long_about = None)]
pub struct Args {
    /// TOML configuration file. Values can be overridden with
    /// `EQUIARB__<SECTION>__<KEY>` environment variables.
    #[arg(long, default_value = "equiarb.toml")]
    pub config: PathBuf,
}
