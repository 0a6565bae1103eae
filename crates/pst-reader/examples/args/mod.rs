use clap::Parser;

#[derive(Parser)]
#[command(version, about, long_about)]
pub struct Args {
    /// Path to the PST file to inspect.
    #[arg(default_value = "mailbox.pst")]
    pub file: String,
}
