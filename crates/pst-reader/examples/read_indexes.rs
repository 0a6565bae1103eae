use anyhow::Result;
use clap::Parser;
use std::io::{Read, Seek};

mod args;

use args::Args;
use pst_reader::index::{IndexNode, DESCRIPTOR_NODE_TYPE, INDEX_NODE_SIZE};
use pst_reader::{BlockSource, PstFile};

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let args = Args::try_parse()?;
    let pst = PstFile::open(&args.file)?;

    let raw = pst.read_block(pst.header().descriptor_root(), INDEX_NODE_SIZE)?;
    let root_node = IndexNode::parse(&raw, DESCRIPTOR_NODE_TYPE)?;
    println!(
        "Descriptor root node: level {}, back-pointer 0x{:X}",
        root_node.level(),
        root_node.back_ptr()
    );
    println!("Descriptors: {}", pst.descriptors().len());
    println!("Blocks: {}", pst.blocks().len());

    println!("Hierarchy:");
    for &id in pst.descriptors().top_level() {
        print_subtree(&pst, id, 1)?;
    }

    Ok(())
}

fn print_subtree<R: Read + Seek>(pst: &PstFile<R>, id: u64, depth: usize) -> Result<()> {
    let descriptor = pst.find_descriptor(id)?;
    println!(
        "{:indent$}0x{:X} (data 0x{:X})",
        "",
        descriptor.id(),
        descriptor.data_id(),
        indent = depth * 2
    );
    for &child in descriptor.children() {
        print_subtree(pst, child, depth + 1)?;
    }
    Ok(())
}
