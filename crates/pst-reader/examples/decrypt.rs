use anyhow::{bail, Result};
use clap::Parser;
use std::collections::HashSet;
use std::fs;
use std::io::{Read, Seek};

use pst_reader::assoc::SEGMENT_TABLE_MARKER;
use pst_reader::{decode_block, header, BlockSource, PstFile};

#[derive(Parser)]
struct Args {
    /// Path to the encrypted PST file.
    file: String,

    /// Where to write the decrypted copy.
    #[arg(long, default_value = "decrypted.pst")]
    output: String,
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let args = Args::try_parse()?;
    let pst = PstFile::open(&args.file)?;
    if !pst.header().is_encrypted() {
        bail!("{} is not encrypted", args.file);
    }

    // table blocks are stored in the clear and must stay that way
    let clear = table_block_ids(&pst)?;

    let mut image = fs::read(&args.file)?;
    let mut decoded = 0_usize;
    for block in pst.blocks().records() {
        if clear.contains(&block.id()) {
            continue;
        }
        let start = block.offset() as usize;
        let end = start.saturating_add(usize::from(block.size()));
        if end > image.len() {
            bail!("block 0x{:X} runs past the end of {}", block.id(), args.file);
        }
        decode_block(&mut image[start..end]);
        decoded += 1;
    }
    // mark the copy as the unencrypted variant
    image[header::FILE_TYPE_OFFSET as usize] = 0x0E;
    fs::write(&args.output, &image)?;

    println!(
        "Decrypted {decoded} of {} blocks into {}",
        pst.blocks().len(),
        args.output
    );
    Ok(())
}

/// Ids of the associated data tables and the segment tables they point
/// at, collected by walking every descriptor's references.
fn table_block_ids<R: Read + Seek>(pst: &PstFile<R>) -> Result<HashSet<u64>> {
    let mut ids = HashSet::new();
    for descriptor in pst.descriptors().records() {
        let Some(assoc_id) = descriptor.assoc_data_id() else {
            continue;
        };
        ids.insert(assoc_id);

        let table = pst.read_data_block(assoc_id)?;
        if table.len() < 4 {
            continue;
        }
        let count = usize::from(u16::from_le_bytes([table[2], table[3]]));
        let entries = table.get(4..4 + count * 24).unwrap_or_default();
        for entry in entries.chunks_exact(24) {
            let data_id = u64::from_le_bytes(entry[8..16].try_into()?) & 0xFFFF_FFFF;
            let target = pst.read_data_block(data_id)?;
            if target.len() >= 2 && target[..2] == SEGMENT_TABLE_MARKER.to_le_bytes() {
                ids.insert(data_id);
            }
        }
    }
    Ok(ids)
}
