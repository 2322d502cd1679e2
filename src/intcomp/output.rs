use anyhow::{anyhow, Result};

use super::count::{CountNodeRc, CountRoot};
use super::flags::CompressionFlags;
use crate::ast::PredefinedSym;
use crate::interp::{ByteOutput, IntEntry, IntStream, IntTypeFormat, StreamOutput};
use crate::stream::QueueRef;
use crate::{IntType, CISM_BINARY_MAGIC, CISM_BINARY_VERSION};

/// Emits the abbreviated form of an integer stream: a CISM header,
/// then abbreviation indices (plain or Huffman bits) with the inline
/// operands the synthesized read algorithm expects.
pub struct AbbreviationWriter<'a> {
    flags: &'a CompressionFlags,
    root: &'a CountRoot,
}

impl<'a> AbbreviationWriter<'a> {
    pub fn new(flags: &'a CompressionFlags, root: &'a CountRoot) -> Self {
        Self { flags, root }
    }

    pub fn write(&self, input: &IntStream, output: QueueRef) -> Result<()> {
        let mut out = ByteOutput::new(output);
        out.set_minimize_block_size(self.flags.minimize_block_size);
        out.write_header_value(IntType::from(CISM_BINARY_MAGIC), IntTypeFormat::Uint32)
            .map_err(|error| anyhow!("{error}"))?;
        out.write_header_value(IntType::from(CISM_BINARY_VERSION), IntTypeFormat::Uint32)
            .map_err(|error| anyhow!("{error}"))?;

        // Huffman bits interleave with byte operands; keeping every
        // unit byte-aligned mirrors the align callback the generated
        // algorithm runs after each abbreviation.
        let align_units = self.flags.align_opcodes || self.flags.use_huffman_encoding;
        let entries = input.entries();
        let mut index = 0;
        while index < entries.len() {
            match entries[index] {
                IntEntry::Action(action) => {
                    self.emit_action(&mut out, action)?;
                    index += 1;
                }
                IntEntry::Header(..) => {
                    // Upstream headers were already consumed by the
                    // previous pipeline stage.
                    index += 1;
                }
                IntEntry::Value(_) => {
                    index = self.emit_values(&mut out, entries, index)?;
                }
            }
            if align_units {
                out.align_to_byte().map_err(|error| anyhow!("{error}"))?;
            }
        }
        out.write_freeze_eof().map_err(|error| anyhow!("{error}"))?;
        Ok(())
    }

    fn emit_action(&self, out: &mut ByteOutput, action: IntType) -> Result<()> {
        let sym = u32::try_from(action)
            .ok()
            .and_then(|raw| PredefinedSym::try_from(raw).ok());
        match sym {
            Some(PredefinedSym::BlockEnter | PredefinedSym::BlockEnterWriteonly) => {
                self.emit_abbrev(out, self.root.block_enter())?;
                out.write_block_enter().map_err(|error| anyhow!("{error}"))
            }
            Some(PredefinedSym::BlockExit | PredefinedSym::BlockExitWriteonly) => {
                self.emit_abbrev(out, self.root.block_exit())?;
                out.write_block_exit().map_err(|error| anyhow!("{error}"))
            }
            Some(PredefinedSym::Align) => {
                if self.root.align().has_abbrev_index() && self.flags.align_opcodes {
                    self.emit_abbrev(out, self.root.align())?;
                    out.align_to_byte().map_err(|error| anyhow!("{error}"))?;
                }
                Ok(())
            }
            _ => Ok(()),
        }
    }

    /// Encode values starting at `start`: the longest assigned pattern
    /// when one matches, a default escape otherwise. Returns the index
    /// after the consumed values.
    fn emit_values(&self, out: &mut ByteOutput, entries: &[IntEntry], start: usize) -> Result<usize> {
        if let Some((node, length)) = self.longest_match(entries, start) {
            self.emit_abbrev(out, &node)?;
            return Ok(start + length);
        }
        // No pattern: gather the run of unmatched values.
        let mut run = Vec::new();
        let mut cursor = start;
        while let Some(IntEntry::Value(value)) = entries.get(cursor) {
            if self.longest_match(entries, cursor).is_some() {
                break;
            }
            run.push(*value);
            cursor += 1;
        }
        debug_assert!(!run.is_empty());
        if run.len() == 1 {
            self.emit_abbrev(out, self.root.default_single())?;
            out.write_varint64(run[0] as i64)
                .map_err(|error| anyhow!("{error}"))?;
        } else {
            self.emit_abbrev(out, self.root.default_multiple())?;
            out.write_varuint64(run.len() as u64)
                .map_err(|error| anyhow!("{error}"))?;
            for value in &run {
                out.write_varint64(*value as i64)
                    .map_err(|error| anyhow!("{error}"))?;
            }
        }
        Ok(cursor)
    }

    /// Longest abbreviated pattern starting at `start`.
    fn longest_match(
        &self,
        entries: &[IntEntry],
        start: usize,
    ) -> Option<(CountNodeRc, usize)> {
        let mut best: Option<(CountNodeRc, usize)> = None;
        let mut node: Option<CountNodeRc> = None;
        for (offset, entry) in entries[start..].iter().enumerate() {
            if offset >= self.flags.pattern_length_limit {
                break;
            }
            let IntEntry::Value(value) = entry else {
                break;
            };
            let next = match &node {
                None => self.root.root().get_successor(*value),
                Some(current) => current.get_successor(*value),
            };
            let Some(next) = next else {
                break;
            };
            if next.has_abbrev_index() {
                best = Some((CountNodeRc::clone(&next), offset + 1));
            }
            node = Some(next);
        }
        best
    }

    fn emit_abbrev(&self, out: &mut ByteOutput, node: &CountNodeRc) -> Result<()> {
        let index = node
            .abbrev_index()
            .ok_or_else(|| anyhow!("Pattern has no abbreviation index: {node:?}"))?;
        match node.huffman_symbol() {
            Some(symbol) => out
                .write_bits(symbol.path(), symbol.num_bits())
                .map_err(|error| anyhow!("{error}")),
            None => out
                .write_value(index, self.flags.abbrev_format.to_kind(), None)
                .map_err(|error| anyhow!("{error}")),
        }
    }
}
