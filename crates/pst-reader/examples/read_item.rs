use anyhow::Result;
use clap::Parser;
use std::collections::HashMap;

use pst_reader::props::{PT_BOOLEAN, PT_LONG, PT_SYSTIME, PT_UNICODE};
use pst_reader::{describe_property, PstFile};

#[derive(Parser)]
#[command(version, about, long_about)]
struct Args {
    /// Path to the PST file to inspect.
    #[arg(default_value = "mailbox.pst")]
    file: String,

    /// Descriptor id, hex or decimal.
    #[arg(long, value_parser = parse_id, default_value = "0x2")]
    descriptor: u64,
}

fn parse_id(raw: &str) -> Result<u64, std::num::ParseIntError> {
    match raw.strip_prefix("0x") {
        Some(hex) => u64::from_str_radix(hex, 16),
        None => raw.parse(),
    }
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let args = Args::try_parse()?;
    let pst = PstFile::open(&args.file)?;

    let type_names = HashMap::from([
        (PT_LONG, "Integer32"),
        (PT_BOOLEAN, "Boolean"),
        (PT_UNICODE, "String"),
        (PT_SYSTIME, "Time"),
    ]);
    let tag_names = HashMap::from([
        ((0x0037_u16, PT_UNICODE), "Subject"),
        ((0x0039, PT_SYSTIME), "ClientSubmitTime"),
        ((0x0C1A, PT_UNICODE), "SenderName"),
        ((0x0E07, PT_LONG), "MessageFlags"),
        ((0x3001, PT_UNICODE), "DisplayName"),
    ]);

    let descriptor = pst.find_descriptor(args.descriptor)?;
    let store = pst.load_properties(descriptor)?;
    println!(
        "Descriptor 0x{:X}: {} properties",
        descriptor.id(),
        store.len()
    );
    for property in store.iter() {
        match property {
            Ok(property) => {
                println!("  {}", describe_property(&property, &type_names, &tag_names))
            }
            Err(error) => println!("  <{error}>"),
        }
    }

    Ok(())
}
