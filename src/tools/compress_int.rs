use crate::{load_int_stream, open_output_sink, Args};

use anyhow::{anyhow, Result};
use casm_rs::intcomp::{CompressionFlags, IntCompressor};
use casm_rs::stream::{Queue, QueueRef};
use casm_rs::trace::TraceSink;
use casm_rs::WASM_BINARY_VERSION_D;
use clap::Parser;

/// Compress an integer stream with pattern abbreviations
#[derive(Clone, Debug, Parser)]
pub struct CompressIntArgs {
    /// Huffman-encode the abbreviation indices
    #[arg(long)]
    pub huffman: bool,
    /// emit the CISM model instead of the single-switch model
    #[arg(long)]
    pub cism: bool,
    #[arg(long, default_value_t = 4096)]
    pub max_abbreviations: usize,
    /// drop patterns observed fewer times than this
    #[arg(long, default_value_t = 2)]
    pub count_cutoff: u64,
    /// drop patterns lighter than this
    #[arg(long, default_value_t = 2)]
    pub weight_cutoff: u64,
    /// longest integer sequence considered for an abbreviation
    #[arg(long, default_value_t = 10)]
    pub pattern_limit: usize,
    /// longest allowed Huffman code
    #[arg(long, default_value_t = 32)]
    pub max_path_length: u32,
    /// keep fixed-width block sizes instead of minimizing them
    #[arg(long)]
    pub no_minimize: bool,
}

impl CompressIntArgs {
    pub fn to_flags(&self) -> CompressionFlags {
        CompressionFlags {
            count_cutoff: self.count_cutoff,
            weight_cutoff: self.weight_cutoff,
            pattern_length_limit: self.pattern_limit,
            max_abbreviations: self.max_abbreviations,
            use_huffman_encoding: self.huffman,
            use_cism_model: self.cism,
            max_path_length: self.max_path_length,
            minimize_block_size: !self.no_minimize,
            ..CompressionFlags::default()
        }
    }
}

pub fn compress_int(args: &Args, cargs: &CompressIntArgs) -> Result<()> {
    let stream = load_int_stream(args)?;
    let output = Queue::write_backed(open_output_sink(args)?);

    let mut compressor = IntCompressor::new(cargs.to_flags());
    compressor.set_trace(TraceSink::new("compress-int", args.verbose));
    let (_, summary) = compressor.compress_stream(
        &stream.borrow(),
        QueueRef::clone(&output),
        WASM_BINARY_VERSION_D,
    )?;
    if args.verbose > 0 {
        eprintln!(
            "{} entries -> {} bytes using {} abbreviations{}",
            summary.input_entries,
            summary.output_bytes,
            summary.abbreviation_count,
            if summary.huffman_encoded {
                " (huffman)"
            } else {
                ""
            }
        );
    }
    output.flush().map_err(|error| anyhow!("{error}"))?;
    Ok(())
}
