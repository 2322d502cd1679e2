mod casm2cast;
use casm2cast::casm2cast;
mod compress_int;
use compress_int::{compress_int, CompressIntArgs};
mod decompress;
use decompress::{decompress, DecompressArgs};
mod dump_counts;
use dump_counts::dump_counts;

use std::fs::File;
use std::io::{BufReader, BufWriter, Write};
use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::{anyhow, Context, Result};
use casm_rs::interp::{IntEntry, IntStream, IntStreamRef};
use casm_rs::stream::{Queue, QueueRef, ReadCursor, ReadFormats};
use clap::{Parser, Subcommand};

/// Compress and decompress wasm files with filter algorithms
#[derive(Clone, Debug, Parser)]
struct Args {
    /// input filename to process
    #[arg(short, long)]
    input: PathBuf,
    /// output filename, stdout when omitted
    #[arg(short, long)]
    output: Option<PathBuf>,
    /// invert the exit code (for inputs that must be rejected)
    #[arg(long)]
    expect_fail: bool,
    /// diagnostic verbosity on stderr
    #[arg(short, long, default_value_t = 0)]
    verbose: u8,
    // operation to execute
    #[command(subcommand)]
    operation: Operation,
}

#[derive(Clone, Debug, Subcommand)]
enum Operation {
    /// Apply decompression algorithms to a wasm/casm input
    Decompress(DecompressArgs),
    /// Print a casm algorithm file as s-expression text
    Casm2Cast,
    /// Compress an integer stream with pattern abbreviations
    CompressInt(CompressIntArgs),
    /// Dump the pattern counts the compressor would collect
    DumpCounts(CompressIntArgs),
}

fn main() -> ExitCode {
    let args = Args::parse();
    let result = run(&args);
    match (result, args.expect_fail) {
        (Ok(()), false) => ExitCode::SUCCESS,
        (Ok(()), true) => {
            eprintln!("Error: expected a failure, but the operation succeeded");
            ExitCode::FAILURE
        }
        (Err(error), true) => {
            if args.verbose > 0 {
                eprintln!("Expected failure: {error:#}");
            }
            ExitCode::SUCCESS
        }
        (Err(error), false) => {
            eprintln!("{error:#}");
            ExitCode::FAILURE
        }
    }
}

fn run(args: &Args) -> Result<()> {
    match &args.operation {
        Operation::Decompress(dargs) => decompress(args, dargs),
        Operation::Casm2Cast => casm2cast(args),
        Operation::CompressInt(cargs) => compress_int(args, cargs),
        Operation::DumpCounts(cargs) => dump_counts(args, cargs),
    }
}

/// Open the input as a read-backed queue; pages fill on demand.
fn open_input_queue(args: &Args) -> Result<QueueRef> {
    let file = File::open(&args.input)
        .with_context(|| format!("Opening {}", args.input.display()))?;
    Ok(Queue::read_backed(Box::new(BufReader::new(file))))
}

/// Read the whole input up front, for tools that reparse it.
fn read_input_bytes(args: &Args) -> Result<Vec<u8>> {
    std::fs::read(&args.input).with_context(|| format!("Reading {}", args.input.display()))
}

fn open_output_sink(args: &Args) -> Result<Box<dyn Write>> {
    match &args.output {
        Some(path) => {
            let file =
                File::create(path).with_context(|| format!("Creating {}", path.display()))?;
            Ok(Box::new(BufWriter::new(file)))
        }
        None => Ok(Box::new(std::io::stdout())),
    }
}

fn write_output(args: &Args, bytes: &[u8]) -> Result<()> {
    let mut sink = open_output_sink(args)?;
    sink.write_all(bytes)?;
    sink.flush()?;
    Ok(())
}

/// Parse an input of LEB128-encoded integers into an int stream.
fn load_int_stream(args: &Args) -> Result<IntStreamRef> {
    let bytes = read_input_bytes(args)?;
    let queue = Queue::from_bytes(&bytes);
    let mut pos = ReadCursor::new(queue);
    let stream = IntStream::new();
    {
        let mut stream = stream.borrow_mut();
        while !pos.at_eof() {
            let value = pos
                .read_varuint64()
                .context("Input is not a varuint64 stream")?;
            stream
                .push(IntEntry::Value(value))
                .map_err(|error| anyhow!("{error}"))?;
        }
        stream.freeze();
    }
    Ok(stream)
}
