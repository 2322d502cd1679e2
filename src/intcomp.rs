pub mod codegen;
pub mod collector;
pub mod compress;
pub mod count;
pub mod flags;
pub mod huffman;
pub mod output;

pub use codegen::AbbreviationCodegen;
pub use collector::{AbbreviationsCollector, CollectionScope, CountNodeCollector};
pub use compress::{CompressionSummary, IntCompressor};
pub use count::{CountKind, CountNode, CountNodeRc, CountRoot};
pub use flags::CompressionFlags;
pub use huffman::{HuffNode, HuffSymbol, HuffmanEncoder};
pub use output::AbbreviationWriter;
