pub mod flatten;
pub mod inflate;
pub mod reader;
pub mod symbol_index;
pub mod writer;

pub use flatten::FlattenAst;
pub use inflate::InflateAst;
pub use reader::CasmReader;
pub use symbol_index::SymbolIndex;
pub use writer::CasmWriter;
