use std::rc::Rc;

use anyhow::Result;
use serde::Serialize;

use super::codegen::AbbreviationCodegen;
use super::collector::AbbreviationsCollector;
use super::count::CountRoot;
use super::flags::CompressionFlags;
use super::output::AbbreviationWriter;
use crate::ast::SymbolTable;
use crate::casm::CasmWriter;
use crate::interp::IntStream;
use crate::stream::QueueRef;
use crate::trace::TraceSink;

/// What a compression run decided; serialized by the dump tools.
#[derive(Debug, Clone, Serialize)]
pub struct CompressionSummary {
    pub input_entries: usize,
    pub abbreviation_count: usize,
    pub huffman_encoded: bool,
    pub output_bytes: u64,
}

/// Top-level integer-pattern compressor: count patterns, pick
/// abbreviations, synthesize the decoding algorithm, and emit the
/// algorithm followed by the abbreviated data.
pub struct IntCompressor {
    flags: CompressionFlags,
    trace: TraceSink,
}

impl IntCompressor {
    pub fn new(flags: CompressionFlags) -> Self {
        Self {
            flags,
            trace: TraceSink::off(),
        }
    }

    pub fn set_trace(&mut self, trace: TraceSink) {
        self.trace = trace;
    }

    pub fn flags(&self) -> &CompressionFlags {
        &self.flags
    }

    /// Compress `input`, appending a CASM rendition of the synthesized
    /// read algorithm and then the abbreviated data to `output`.
    /// Returns the algorithm for callers that want to verify or reuse
    /// it.
    pub fn compress_stream(
        &self,
        input: &IntStream,
        output: QueueRef,
        wasm_version: u32,
    ) -> Result<(Rc<SymbolTable>, CompressionSummary)> {
        let root = CountRoot::new();
        root.add_stream(input, &self.flags);

        let mut collector = AbbreviationsCollector::new(&root, &self.flags);
        collector.set_trace(self.trace.clone());
        let assignments = collector.assign_abbreviations();
        self.trace
            .note(|| format!("{} abbreviations assigned", assignments.len()));

        let encoding_root = if self.flags.use_huffman_encoding {
            collector.assign_huffman_encoding(&assignments)?
        } else {
            None
        };

        let codegen = AbbreviationCodegen::new(
            &self.flags,
            &assignments,
            encoding_root.as_ref(),
            true,
        );
        let algorithm = codegen.generate(wasm_version)?;

        let mut casm = CasmWriter::new();
        casm.set_minimize_block_size(self.flags.minimize_block_size)
            .set_freeze_on_finish(false);
        casm.write_symtab(&algorithm, QueueRef::clone(&output))?;

        let writer = AbbreviationWriter::new(&self.flags, &root);
        writer.write(input, QueueRef::clone(&output))?;

        let summary = CompressionSummary {
            input_entries: input.len(),
            abbreviation_count: assignments.len(),
            huffman_encoded: encoding_root.is_some(),
            output_bytes: output.size(),
        };
        Ok((algorithm, summary))
    }

    /// Count patterns only; used by the dump tools.
    pub fn count_stream(&self, input: &IntStream) -> CountRoot {
        let root = CountRoot::new();
        root.add_stream(input, &self.flags);
        root
    }
}
