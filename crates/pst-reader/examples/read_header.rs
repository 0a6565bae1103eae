use anyhow::Result;
use clap::Parser;

mod args;

use args::Args;
use pst_reader::PstFile;

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let args = Args::try_parse()?;
    let pst = PstFile::open(&args.file)?;
    let header = pst.header();

    println!("File type: 0x{:02X}", header.file_type());
    println!("Encrypted: {}", header.is_encrypted());
    println!("Declared size: {} bytes", header.file_size());
    println!(
        "Descriptor tree root: offset 0x{:X}, back-pointer 0x{:X}",
        header.descriptor_root(),
        header.descriptor_root_back_ptr()
    );
    println!(
        "Allocation tree root: offset 0x{:X}, back-pointer 0x{:X}",
        header.allocation_root(),
        header.allocation_root_back_ptr()
    );

    Ok(())
}
