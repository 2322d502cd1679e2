use crate::{read_input_bytes, write_output, Args};

use anyhow::{anyhow, Result};
use casm_rs::ast::write_text;
use casm_rs::casm::CasmReader;
use casm_rs::stream::Queue;

pub fn casm2cast(args: &Args) -> Result<()> {
    let bytes = read_input_bytes(args)?;
    let symtab = CasmReader::new().read_binary(Queue::from_bytes(&bytes))?;
    let algorithm = symtab
        .algorithm()
        .ok_or_else(|| anyhow!("casm file holds no algorithm"))?;
    let text = write_text(&symtab, algorithm);
    write_output(args, text.as_bytes())
}
