use serde::Serialize;

use crate::interp::IntTypeFormat;
use crate::IntType;

/// Knobs of the integer-pattern compressor.
#[derive(Debug, Clone, Serialize)]
pub struct CompressionFlags {
    /// Patterns observed fewer times than this are never candidates.
    pub count_cutoff: u64,
    /// Patterns lighter than this are never candidates.
    pub weight_cutoff: u64,
    /// Longest integer sequence tracked by the trie.
    pub pattern_length_limit: usize,
    /// Weight boost per pattern element; longer matches save more.
    pub pattern_length_multiplier: usize,
    pub max_abbreviations: usize,
    /// Values at or below this are "small"; small singletons need
    /// `small_value_count_cutoff` observations to be kept.
    pub small_value_max: IntType,
    pub small_value_count_cutoff: u64,
    /// Wire format of emitted abbreviation indices.
    #[serde(skip)]
    pub abbrev_format: IntTypeFormat,
    pub minimize_block_size: bool,
    pub use_huffman_encoding: bool,
    /// Emit the CISM model (cooperating defines under an enclosing
    /// algorithm) instead of the single-switch model.
    pub use_cism_model: bool,
    /// Byte-align after each abbreviation read.
    pub align_opcodes: bool,
    /// Longest Huffman code allowed; violating subtrees are flattened.
    pub max_path_length: u32,
}

impl Default for CompressionFlags {
    fn default() -> Self {
        Self {
            count_cutoff: 2,
            weight_cutoff: 2,
            pattern_length_limit: 10,
            pattern_length_multiplier: 2,
            max_abbreviations: 4096,
            small_value_max: u8::MAX as IntType,
            small_value_count_cutoff: 2,
            abbrev_format: IntTypeFormat::Varuint64,
            minimize_block_size: true,
            use_huffman_encoding: false,
            use_cism_model: false,
            align_opcodes: false,
            max_path_length: 32,
        }
    }
}
