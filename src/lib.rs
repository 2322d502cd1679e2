#![forbid(unsafe_code)]
pub mod ast;
pub mod casm;
pub mod intcomp;
pub mod interp;
pub mod stream;
pub mod trace;

#[cfg(test)]
mod test;

use std::io::Read;

use anyhow::{anyhow, ensure, Result};
use serde::{Deserialize, Serialize};

/// Integer type flowing through filter algorithms. All narrower formats
/// widen into this on read and narrow from it on write.
pub type IntType = u64;

/// The standard wasm file magic, `\0asm` in little-endian byte order.
pub const WASM_BINARY_MAGIC: u32 = 0x6d73_6100;
/// Wasm version `0xb` (pre-MVP layout).
pub const WASM_BINARY_VERSION_B: u32 = 0xb;
/// Wasm version `0xd` (MVP layout).
pub const WASM_BINARY_VERSION_D: u32 = 0xd;

/// Magic of compressed algorithm (CASM) files, `casm` in little-endian
/// byte order. Chosen to never collide with the wasm magic.
pub const CASM_BINARY_MAGIC: u32 = 0x6d73_6163;
pub const CASM_BINARY_VERSION: u32 = 0x0;

/// Magic of compressed integer stream (CISM) data, `cism` little-endian.
pub const CISM_BINARY_MAGIC: u32 = 0x6d73_6963;
pub const CISM_BINARY_VERSION: u32 = 0x0;

/// The fixed little-endian triple that starts every CASM file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CasmHeader {
    pub magic: u32,
    pub casm_version: u32,
    pub wasm_version: u32,
}

impl CasmHeader {
    pub fn new(wasm_version: u32) -> Self {
        Self {
            magic: CASM_BINARY_MAGIC,
            casm_version: CASM_BINARY_VERSION,
            wasm_version,
        }
    }
}

/// File kinds the toolchain can identify from the first bytes of a stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinaryFormat {
    /// A wasm module, magic already validated, `version` as found.
    Wasm { version: u32 },
    /// A compressed algorithm file.
    Casm { casm_version: u32, wasm_version: u32 },
}

/// Identify the format of a wasm/casm input from its leading header words.
pub fn identify_stream<I: Read>(input: &mut I) -> Result<BinaryFormat> {
    let magic: u32 = bincode::deserialize_from(&mut *input)?;
    match magic {
        WASM_BINARY_MAGIC => {
            let version: u32 = bincode::deserialize_from(&mut *input)?;
            ensure!(
                version == WASM_BINARY_VERSION_B || version == WASM_BINARY_VERSION_D,
                "Unknown wasm version: {version:#x}"
            );
            Ok(BinaryFormat::Wasm { version })
        }
        CASM_BINARY_MAGIC => {
            let casm_version: u32 = bincode::deserialize_from(&mut *input)?;
            let wasm_version: u32 = bincode::deserialize_from(&mut *input)?;
            ensure!(
                casm_version == CASM_BINARY_VERSION,
                "Unknown casm version: {casm_version:#x}"
            );
            Ok(BinaryFormat::Casm {
                casm_version,
                wasm_version,
            })
        }
        magic => Err(anyhow!("Unknown input magic: {magic:#010x}")),
    }
}
