use crate::{open_input_queue, open_output_sink, Args};

use std::path::PathBuf;
use std::rc::Rc;

use anyhow::{anyhow, Context, Result};
use casm_rs::ast::SymbolTable;
use casm_rs::casm::CasmReader;
use casm_rs::interp::{ByteInput, ByteOutput, DecompressSelector, Interpreter};
use casm_rs::stream::{Queue, QueueRef, ReadCursor};
use casm_rs::trace::TraceSink;
use clap::Parser;

/// Run the input through its decompression algorithms
#[derive(Clone, Debug, Parser)]
pub struct DecompressArgs {
    /// casm algorithm file(s) to apply, in order; algorithms embedded
    /// at the front of the input are picked up automatically
    #[arg(short, long)]
    pub algorithm: Vec<PathBuf>,
    /// keep fixed-width block sizes instead of minimizing them
    #[arg(long)]
    pub no_minimize: bool,
}

pub fn decompress(args: &Args, dargs: &DecompressArgs) -> Result<()> {
    let input = open_input_queue(args)?;
    let mut pos = ReadCursor::new(QueueRef::clone(&input));
    let reader = CasmReader::new();

    let mut chain: Vec<Rc<SymbolTable>> = Vec::new();
    for path in &dargs.algorithm {
        let bytes = std::fs::read(path)
            .with_context(|| format!("Reading algorithm {}", path.display()))?;
        let symtab = reader
            .read_binary(Queue::from_bytes(&bytes))
            .with_context(|| format!("Parsing algorithm {}", path.display()))?;
        chain.push(Rc::new(symtab));
    }
    // Compressed files carry their algorithms up front.
    while CasmReader::header_at(&pos) {
        let symtab = reader
            .read_from(&mut pos, None)
            .context("Parsing embedded algorithm")?;
        chain.push(Rc::new(symtab));
    }

    let out_queue = Queue::write_backed(open_output_sink(args)?);
    let mut byte_input = ByteInput::new(QueueRef::clone(&input));
    byte_input.set_pos(pos);
    let byte_output = ByteOutput::new(QueueRef::clone(&out_queue));

    let mut interp = Interpreter::new(Box::new(byte_input), Box::new(byte_output), None);
    interp.set_minimize_block_size(!dargs.no_minimize);
    interp.set_trace(TraceSink::new("decompress", args.verbose));
    if chain.is_empty() {
        // Nothing to apply: pass the input through unchanged.
        interp.copy_start();
    } else {
        interp.add_selector(Rc::new(DecompressSelector::new(chain)?));
        interp.algorithm_start()?;
    }
    interp.algorithm_read_back_filled()?;

    out_queue.flush().map_err(|error| anyhow!("{error}"))?;
    Ok(())
}
