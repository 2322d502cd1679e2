use crate::{load_int_stream, Args};
use crate::compress_int::CompressIntArgs;

use anyhow::Result;
use casm_rs::intcomp::{CollectionScope, CountNodeCollector, IntCompressor};

pub fn dump_counts(args: &Args, cargs: &CompressIntArgs) -> Result<()> {
    let stream = load_int_stream(args)?;
    let flags = cargs.to_flags();
    let compressor = IntCompressor::new(flags.clone());
    let root = compressor.count_stream(&stream.borrow());

    let mut collector = CountNodeCollector::new(&root, &flags);
    collector.collect(CollectionScope::All);
    collector.build_heap();

    let mut position = 0usize;
    while let Some(node) = collector.pop_heap() {
        position += 1;
        println!(
            "{position:8}: weight {:8} {node:?}",
            node.weight(&flags)
        );
    }
    println!(
        "total count {} (reported {}), total weight {} (reported {})",
        collector.count_total,
        collector.count_reported,
        collector.weight_total,
        collector.weight_reported
    );
    Ok(())
}
