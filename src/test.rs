use rstest::rstest;

use std::cell::RefCell;
use std::rc::Rc;

use crate::ast::{NodeKind, NodeRef, PredefinedSym, SymbolTable, ValueFormat};
use crate::casm::{CasmReader, CasmWriter, FlattenAst};
use crate::intcomp::{
    AbbreviationsCollector, CompressionFlags, CountRoot, HuffNode, HuffmanEncoder, IntCompressor,
};
use crate::interp::{
    ByteInput, ByteOutput, DecompressSelector, IntEntry, IntOutput, IntStream, Interpreter,
    StreamOutput,
};
use crate::stream::{Queue, QueueRef, ReadCursor, ReadFormats, WriteCursor, WriteFormats};
use crate::*;

fn write_bytes<F: FnOnce(&mut WriteCursor)>(build: F) -> Vec<u8> {
    let queue = Queue::new();
    let mut pos = WriteCursor::new(QueueRef::clone(&queue));
    build(&mut pos);
    queue.to_bytes()
}

#[rstest]
#[case(&[0x00], 0)]
#[case(&[0x7f], 127)]
#[case(&[0x80, 0x01], 128)]
#[case(&[0xe5, 0x8e, 0x26], 624_485)]
#[case(&[0xff, 0xff, 0xff, 0xff, 0x0f], u32::MAX as u64)]
fn varuint32_round_trip(#[case] bytes: &[u8], #[case] value: u64) {
    let mut pos = ReadCursor::new(Queue::from_bytes(bytes));
    assert_eq!(pos.read_varuint32().unwrap(), value as u32);
    let encoded = write_bytes(|pos| pos.write_varuint32(value as u32).unwrap());
    assert_eq!(encoded, bytes);
}

#[rstest]
#[case(&[0xc0, 0xbb, 0x78], -123_456)]
#[case(&[0x7f], -1)]
#[case(&[0x3f], 63)]
#[case(&[0xc0, 0x00], 64)]
fn varint32_round_trip(#[case] bytes: &[u8], #[case] value: i32) {
    let mut pos = ReadCursor::new(Queue::from_bytes(bytes));
    assert_eq!(pos.read_varint32().unwrap(), value);
    let encoded = write_bytes(|pos| pos.write_varint32(value).unwrap());
    assert_eq!(encoded, bytes);
}

#[test]
fn varuint32_overflow_is_malformed() {
    // Five bytes whose top chunk overflows 32 bits.
    let mut pos = ReadCursor::new(Queue::from_bytes(&[0xff, 0xff, 0xff, 0xff, 0x1f]));
    pos.read_varuint32().unwrap_err();
    // A sixth continuation byte is over-long even when zero.
    let mut pos = ReadCursor::new(Queue::from_bytes(&[0x80, 0x80, 0x80, 0x80, 0x80, 0x00]));
    pos.read_varuint32().unwrap_err();
}

#[test]
fn fixed_leb128_reserves_five_bytes() {
    let encoded = write_bytes(|pos| pos.write_fixed_leb128(3).unwrap());
    assert_eq!(encoded, [0x83, 0x80, 0x80, 0x80, 0x00]);
    // Redundant padding still decodes to the same value.
    let mut pos = ReadCursor::new(Queue::from_bytes(&encoded));
    assert_eq!(pos.read_varuint32().unwrap(), 3);
}

#[test]
fn queue_pages_spill_into_sink() {
    struct SharedSink(Rc<RefCell<Vec<u8>>>);
    impl std::io::Write for SharedSink {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            self.0.borrow_mut().extend_from_slice(buf);
            Ok(buf.len())
        }
        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    let collected = Rc::new(RefCell::new(Vec::new()));
    let queue = Queue::write_backed(Box::new(SharedSink(Rc::clone(&collected))));
    let mut pos = WriteCursor::new(QueueRef::clone(&queue));
    let total = (crate::stream::PAGE_SIZE * 2 + 17) as usize;
    for index in 0..total {
        pos.write_byte(index as u8).unwrap();
    }
    queue.flush().unwrap();
    // Full leading pages were retired once unpinned.
    assert!(queue.first_address() >= crate::stream::PAGE_SIZE);
    let bytes = collected.borrow();
    assert_eq!(bytes.len(), total);
    assert!(bytes.iter().enumerate().all(|(i, &b)| b == i as u8));
}

#[test]
fn retired_pages_fail_reads() {
    let queue = Queue::write_backed(Box::new(std::io::sink()));
    let mut pos = WriteCursor::new(QueueRef::clone(&queue));
    // One byte past two pages forces a third page, retiring the first.
    for index in 0..(crate::stream::PAGE_SIZE * 2 + 1) {
        pos.write_byte(index as u8).unwrap();
    }
    queue.read_byte_at(0).unwrap_err();
}

#[test]
fn frozen_queue_rejects_writes() {
    let queue = Queue::new();
    let mut pos = WriteCursor::new(QueueRef::clone(&queue));
    pos.write_byte(1).unwrap();
    queue.freeze_eof();
    pos.write_byte(2).unwrap_err();
}

#[test]
fn zero_sized_block_is_immediately_at_eob() {
    let mut pos = ReadCursor::new(Queue::from_bytes(&[0x00, 0xaa]));
    let size = pos.read_varuint32().unwrap();
    pos.push_eob(u64::from(size));
    assert!(pos.at_eob());
    pos.pop_eob();
    assert!(!pos.at_eob());
    assert_eq!(pos.read_byte().unwrap(), 0xaa);
}

#[test]
fn block_back_patch_fixed_and_minimized() {
    for (minimize, expected) in [
        (false, vec![0x83, 0x80, 0x80, 0x80, 0x00, 1, 2, 3]),
        (true, vec![0x03, 1, 2, 3]),
    ] {
        let queue = Queue::new();
        let mut out = ByteOutput::new(QueueRef::clone(&queue));
        out.set_minimize_block_size(minimize);
        out.write_block_enter().unwrap();
        for byte in [1, 2, 3] {
            out.write_u8(byte).unwrap();
        }
        out.write_block_exit().unwrap();
        assert_eq!(queue.to_bytes(), expected);
    }
}

#[test]
fn integer_nodes_are_uniqued() {
    let mut symtab = SymbolTable::new();
    let first = symtab.int(NodeKind::U32Const, 42, ValueFormat::Decimal);
    let second = symtab.int(NodeKind::U32Const, 42, ValueFormat::Decimal);
    assert_eq!(first, second);
    let hex = symtab.int(NodeKind::U32Const, 42, ValueFormat::Hexadecimal);
    assert_ne!(first, hex);
    let default = symtab.int_default(NodeKind::Varuint32);
    let default_again = symtab.int_default(NodeKind::Varuint32);
    assert_eq!(default, default_again);
    let symbol = symtab.symbol("f");
    assert_eq!(symbol, symtab.symbol("f"));
}

// Small algorithm builders shared by the interpreter tests.

fn empty_header(symtab: &mut SymbolTable) -> NodeRef {
    symtab.create(NodeKind::SourceHeader, Vec::new())
}

fn file_define(symtab: &mut SymbolTable, body: NodeRef) -> NodeRef {
    let file = symtab.predefined_node(PredefinedSym::File);
    let params = symtab.int_default(NodeKind::Params);
    let locals = symtab.int_default(NodeKind::Locals);
    symtab.create(NodeKind::Define, vec![file, params, locals, body])
}

fn install_algorithm(mut symtab: SymbolTable, kids: Vec<NodeRef>) -> Rc<SymbolTable> {
    let algorithm = symtab.create(NodeKind::Algorithm, kids);
    symtab.set_algorithm(algorithm);
    symtab.install().unwrap();
    Rc::new(symtab)
}

fn transcode(symtab: Rc<SymbolTable>, input: &[u8]) -> (Interpreter, Vec<u8>) {
    let in_queue = Queue::from_bytes(input);
    let out_queue = Queue::new();
    let mut interp = Interpreter::new(
        Box::new(ByteInput::new(in_queue)),
        Box::new(ByteOutput::new(QueueRef::clone(&out_queue))),
        Some(symtab),
    );
    interp.algorithm_start().unwrap();
    interp.algorithm_read_back_filled().unwrap();
    (interp, out_queue.to_bytes())
}

#[test]
fn transcoding_identity_copies_varuints() {
    let mut symtab = SymbolTable::new();
    let header = empty_header(&mut symtab);
    let format = symtab.int_default(NodeKind::Varuint64);
    let body = symtab.create(NodeKind::LoopUnbounded, vec![format]);
    let define = file_define(&mut symtab, body);
    let symtab = install_algorithm(symtab, vec![header, define]);

    let input = write_bytes(|pos| {
        for value in [0u64, 1, 127, 128, 624_485, 1 << 40] {
            pos.write_varuint64(value).unwrap();
        }
    });
    let (interp, output) = transcode(symtab, &input);
    assert!(interp.is_successful());
    assert_eq!(output, input);
}

#[test]
fn opcode_dispatch_selects_case_and_operand() {
    // (opcode (uint8) (case 0x40 (uint8)) (case 0x41 (uint32)))
    let build = || {
        let mut symtab = SymbolTable::new();
        let header = empty_header(&mut symtab);
        let selector = symtab.int_default(NodeKind::Uint8);
        let key_a = symtab.int(NodeKind::U64Const, 0x40, ValueFormat::Hexadecimal);
        let operand_a = symtab.int_default(NodeKind::Uint8);
        let case_a = symtab.create(NodeKind::Case, vec![key_a, operand_a]);
        let key_b = symtab.int(NodeKind::U64Const, 0x41, ValueFormat::Hexadecimal);
        let operand_b = symtab.int_default(NodeKind::Uint32);
        let case_b = symtab.create(NodeKind::Case, vec![key_b, operand_b]);
        let opcode = symtab.create(NodeKind::Opcode, vec![selector, case_a, case_b]);
        let define = file_define(&mut symtab, opcode);
        install_algorithm(symtab, vec![header, define])
    };

    let (interp, output) = transcode(build(), &[0x40, 0xaa]);
    assert!(interp.is_successful());
    assert_eq!(interp.last_read_value(), 0xaa);
    assert_eq!(output, [0x40, 0xaa]);

    let (interp, output) = transcode(build(), &[0x41, 0x01, 0x00, 0x00, 0x00]);
    assert!(interp.is_successful());
    assert_eq!(interp.last_read_value(), 1);
    assert_eq!(output, [0x41, 0x01, 0x00, 0x00, 0x00]);
}

#[test]
fn opcode_colliding_cases_are_rejected() {
    let mut symtab = SymbolTable::new();
    let header = empty_header(&mut symtab);
    let selector = symtab.int_default(NodeKind::Uint8);
    let key = symtab.int(NodeKind::U64Const, 7, ValueFormat::Decimal);
    let operand_a = symtab.int_default(NodeKind::Uint8);
    let case_a = symtab.create(NodeKind::Case, vec![key, operand_a]);
    let operand_b = symtab.int_default(NodeKind::Uint32);
    let case_b = symtab.create(NodeKind::Case, vec![key, operand_b]);
    let opcode = symtab.create(NodeKind::Opcode, vec![selector, case_a, case_b]);
    let define = file_define(&mut symtab, opcode);
    let algorithm = symtab.create(NodeKind::Algorithm, vec![header, define]);
    symtab.set_algorithm(algorithm);
    symtab.install().unwrap_err();
}

#[test]
fn param_out_of_range_fails_install() {
    let mut symtab = SymbolTable::new();
    let header = empty_header(&mut symtab);
    let name = symtab.symbol_node("f");
    let params = symtab.int(NodeKind::Params, 1, ValueFormat::Decimal);
    let locals = symtab.int_default(NodeKind::Locals);
    let body = symtab.int(NodeKind::Param, 1, ValueFormat::Decimal);
    let define = symtab.create(NodeKind::Define, vec![name, params, locals, body]);
    let algorithm = symtab.create(NodeKind::Algorithm, vec![header, define]);
    symtab.set_algorithm(algorithm);
    symtab.install().unwrap_err();
}

#[test]
fn eval_substitutes_parameters_lexically() {
    // f(x) evaluates its argument expression at each use, so a uint8
    // argument reads one byte per substitution.
    let mut symtab = SymbolTable::new();
    let header = empty_header(&mut symtab);
    let f = symtab.symbol_node("f");
    let params = symtab.int(NodeKind::Params, 1, ValueFormat::Decimal);
    let locals = symtab.int_default(NodeKind::Locals);
    let p0_first = symtab.int(NodeKind::Param, 0, ValueFormat::Decimal);
    let p0_second = symtab.int(NodeKind::Param, 0, ValueFormat::Decimal);
    let f_body = symtab.create(NodeKind::Sequence, vec![p0_first, p0_second]);
    let f_define = symtab.create(NodeKind::Define, vec![f, params, locals, f_body]);

    let f_use = symtab.symbol_node("f");
    let arg = symtab.int_default(NodeKind::Uint8);
    let call = symtab.create(NodeKind::Eval, vec![f_use, arg]);
    let define = file_define(&mut symtab, call);
    let symtab = install_algorithm(symtab, vec![header, f_define, define]);

    let (interp, output) = transcode(symtab, &[0x05, 0x07]);
    assert!(interp.is_successful());
    assert_eq!(interp.last_read_value(), 0x07);
    assert_eq!(output, [0x05, 0x07]);
}

#[test]
fn locals_hold_values_within_a_define() {
    // file() { local[0] = read(uint8); write(uint8, local[0]) }
    let mut symtab = SymbolTable::new();
    let header = empty_header(&mut symtab);
    let file = symtab.predefined_node(PredefinedSym::File);
    let params = symtab.int_default(NodeKind::Params);
    let locals = symtab.int(NodeKind::Locals, 1, ValueFormat::Decimal);
    let slot = symtab.int(NodeKind::Local, 0, ValueFormat::Decimal);
    let format = symtab.int_default(NodeKind::Uint8);
    let read = symtab.create(NodeKind::Read, vec![format]);
    let set = symtab.create(NodeKind::Set, vec![slot, read]);
    let dest = symtab.int_default(NodeKind::Uint8);
    let slot_use = symtab.int(NodeKind::Local, 0, ValueFormat::Decimal);
    let write = symtab.create(NodeKind::Write, vec![dest, slot_use]);
    let body = symtab.create(NodeKind::Sequence, vec![set, write]);
    let define = symtab.create(NodeKind::Define, vec![file, params, locals, body]);
    let symtab = install_algorithm(symtab, vec![header, define]);

    let (interp, output) = transcode(symtab, &[0x2a]);
    assert!(interp.is_successful());
    assert_eq!(output, [0x2a]);
}

#[test]
fn bad_wasm_magic_is_rejected() {
    // A headerless algorithm falls back to the raw wasm magic probe.
    let mut symtab = SymbolTable::new();
    let format = symtab.int_default(NodeKind::Uint8);
    let body = symtab.create(NodeKind::LoopUnbounded, vec![format]);
    let define = file_define(&mut symtab, body);
    let symtab = install_algorithm(symtab, vec![define]);

    let in_queue = Queue::from_bytes(&[0xde, 0xad, 0xbe, 0xef, 0x0d, 0, 0, 0]);
    let out_queue = Queue::new();
    let mut interp = Interpreter::new(
        Box::new(ByteInput::new(in_queue)),
        Box::new(ByteOutput::new(out_queue)),
        Some(symtab),
    );
    interp.algorithm_start().unwrap();
    interp.algorithm_read_back_filled().unwrap_err();
}

fn sample_algorithm() -> Rc<SymbolTable> {
    // Exercises headers, defines, literals, switch, eval, binary
    // trees, locals, params, and callbacks in one tree.
    let mut symtab = SymbolTable::new();
    let magic = symtab.int(
        NodeKind::U32Const,
        CASM_BINARY_MAGIC as u64,
        ValueFormat::Hexadecimal,
    );
    let casm_version = symtab.int(
        NodeKind::U32Const,
        CASM_BINARY_VERSION as u64,
        ValueFormat::Hexadecimal,
    );
    let wasm_version = symtab.int(
        NodeKind::U32Const,
        WASM_BINARY_VERSION_D as u64,
        ValueFormat::Hexadecimal,
    );
    let header = symtab.create(
        NodeKind::SourceHeader,
        vec![magic, casm_version, wasm_version],
    );

    let lit_sym = symtab.symbol_node("limit");
    let lit_value = symtab.int(NodeKind::U64Const, 3, ValueFormat::Decimal);
    let literal = symtab.create(NodeKind::LiteralDef, vec![lit_sym, lit_value]);

    let helper = symtab.symbol_node("helper");
    let params = symtab.int(NodeKind::Params, 1, ValueFormat::Decimal);
    let locals = symtab.int(NodeKind::Locals, 1, ValueFormat::Decimal);
    let slot = symtab.int(NodeKind::Local, 0, ValueFormat::Decimal);
    let param = symtab.int(NodeKind::Param, 0, ValueFormat::Decimal);
    let set = symtab.create(NodeKind::Set, vec![slot, param]);
    let slot_use = symtab.int(NodeKind::Local, 0, ValueFormat::Decimal);
    let helper_body = symtab.create(NodeKind::Sequence, vec![set, slot_use]);
    let helper_define = symtab.create(NodeKind::Define, vec![helper, params, locals, helper_body]);

    let selector = symtab.int_default(NodeKind::Varuint32);
    let read_sel = symtab.create(NodeKind::Read, vec![selector]);
    let error = symtab.create(NodeKind::Error, Vec::new());
    let key_use_sym = symtab.symbol_node("limit");
    let key_use = symtab.create(NodeKind::LiteralUse, vec![key_use_sym]);
    let accept_a = symtab.int(NodeKind::BinaryAccept, 0, ValueFormat::Decimal);
    let accept_b = symtab.int(NodeKind::BinaryAccept, 1, ValueFormat::Decimal);
    let select = symtab.create(NodeKind::BinarySelect, vec![accept_a, accept_b]);
    let tree = symtab.create(NodeKind::BinaryEval, vec![select]);
    let case_lit = symtab.create(NodeKind::Case, vec![key_use, tree]);
    let key_two = symtab.int(NodeKind::U64Const, 2, ValueFormat::Decimal);
    let helper_use = symtab.symbol_node("helper");
    let arg = symtab.int(NodeKind::U64Const, 9, ValueFormat::Decimal);
    let call = symtab.create(NodeKind::Eval, vec![helper_use, arg]);
    let case_two = symtab.create(NodeKind::Case, vec![key_two, call]);
    let switch = symtab.create(NodeKind::Switch, vec![read_sel, error, case_lit, case_two]);

    let enter = symtab.predefined_node(PredefinedSym::BlockEnter);
    let action = symtab.create(NodeKind::LiteralActionUse, vec![enter]);
    let callback = symtab.create(NodeKind::Callback, vec![action]);
    let body = symtab.create(NodeKind::Sequence, vec![switch, callback]);
    let define = file_define(&mut symtab, body);

    install_algorithm(symtab, vec![header, literal, helper_define, define])
}

#[test]
fn install_is_idempotent() {
    let symtab = sample_algorithm();
    let mut owner = Rc::try_unwrap(symtab).map_err(|_| ()).unwrap();
    let before = crate::ast::write_text(&owner, owner.algorithm().unwrap());
    owner.install().unwrap();
    let after = crate::ast::write_text(&owner, owner.algorithm().unwrap());
    assert_eq!(before, after);
}

#[test]
fn flatten_inflate_round_trip() {
    let symtab = sample_algorithm();
    let stream = IntStream::new();
    FlattenAst::new(&symtab, Rc::clone(&stream))
        .flatten()
        .unwrap();

    // Round-trip law 2: inflating a flattened tree rebuilds it.
    let mut inflater = crate::casm::InflateAst::new();
    stream.borrow().replay(&mut inflater).unwrap();
    let rebuilt = inflater.into_symtab().unwrap();
    assert_eq!(
        crate::ast::write_text(&symtab, symtab.algorithm().unwrap()),
        crate::ast::write_text(&rebuilt, rebuilt.algorithm().unwrap()),
    );

    // Round-trip law 1: re-flattening emits the same integers.
    let second = IntStream::new();
    FlattenAst::new(&rebuilt, Rc::clone(&second))
        .flatten()
        .unwrap();
    assert_eq!(stream.borrow().entries(), second.borrow().entries());
}

#[test]
fn casm_bytes_round_trip() {
    let symtab = sample_algorithm();
    for minimize in [false, true] {
        let queue = Queue::new();
        let mut writer = CasmWriter::new();
        writer.set_minimize_block_size(minimize);
        writer
            .write_symtab(&symtab, QueueRef::clone(&queue))
            .unwrap();

        let rebuilt = CasmReader::new().read_binary(queue).unwrap();
        assert_eq!(
            crate::ast::write_text(&symtab, symtab.algorithm().unwrap()),
            crate::ast::write_text(&rebuilt, rebuilt.algorithm().unwrap()),
        );
    }
}

#[test]
fn identify_stream_reads_headers() {
    let wasm = [0x00, 0x61, 0x73, 0x6d, 0x0d, 0x00, 0x00, 0x00];
    assert_eq!(
        identify_stream(&mut &wasm[..]).unwrap(),
        BinaryFormat::Wasm { version: 0xd }
    );
    let casm = write_bytes(|pos| {
        pos.write_u32(CASM_BINARY_MAGIC).unwrap();
        pos.write_u32(CASM_BINARY_VERSION).unwrap();
        pos.write_u32(WASM_BINARY_VERSION_D).unwrap();
    });
    assert_eq!(
        identify_stream(&mut &casm[..]).unwrap(),
        BinaryFormat::Casm {
            casm_version: CASM_BINARY_VERSION,
            wasm_version: WASM_BINARY_VERSION_D
        }
    );
    identify_stream(&mut &[0u8; 8][..]).unwrap_err();
}

#[test]
fn huffman_respects_max_path_length() {
    let mut encoder = HuffmanEncoder::new();
    encoder.set_max_path_length(3);
    for weight in [1u64, 1, 2, 3, 5, 8, 13, 21] {
        encoder.create_symbol(weight);
    }
    let root = encoder.encode_symbols().unwrap().unwrap();
    let leaves = root.leaves();
    assert_eq!(leaves.len(), 8);
    for leaf in &leaves {
        assert!(leaf.num_bits() <= 3);
    }
    // Prefix-free: no code is a prefix of another.
    for a in &leaves {
        for b in &leaves {
            if a.id() == b.id() {
                continue;
            }
            assert!(
                a.num_bits() != b.num_bits() || a.path() != b.path(),
                "duplicate code"
            );
            if a.num_bits() < b.num_bits() {
                let mask = (1u64 << a.num_bits()) - 1;
                assert_ne!(a.path(), b.path() & mask, "prefix collision");
            }
        }
    }
}

#[test]
fn huffman_trivial_alphabets() {
    let mut encoder = HuffmanEncoder::new();
    assert!(encoder.encode_symbols().unwrap().is_none());

    let mut encoder = HuffmanEncoder::new();
    let symbol = encoder.create_symbol(10);
    let root = encoder.encode_symbols().unwrap().unwrap();
    assert!(matches!(root, HuffNode::Symbol(_)));
    assert_eq!(symbol.num_bits(), 0);
}

fn value_stream(values: &[u64]) -> crate::interp::IntStreamRef {
    let stream = IntStream::new();
    {
        let mut stream = stream.borrow_mut();
        for &value in values {
            stream.push(IntEntry::Value(value)).unwrap();
        }
        stream.freeze();
    }
    stream
}

fn captured_values(stream: &IntStream) -> Vec<u64> {
    stream
        .entries()
        .iter()
        .filter_map(|entry| match entry {
            IntEntry::Value(value) => Some(*value),
            _ => None,
        })
        .collect()
}

fn compress_then_decompress(flags: CompressionFlags, values: &[u64]) -> Vec<u64> {
    let input = value_stream(values);
    let output = Queue::new();
    let compressor = IntCompressor::new(flags);
    let (_, summary) = compressor
        .compress_stream(
            &input.borrow(),
            QueueRef::clone(&output),
            WASM_BINARY_VERSION_D,
        )
        .unwrap();
    assert!(summary.output_bytes > 0);

    // The compressed image carries its own algorithm up front.
    let bytes = output.to_bytes();
    let queue = Queue::from_bytes(&bytes);
    let mut pos = ReadCursor::new(QueueRef::clone(&queue));
    let reader = CasmReader::new();
    assert!(CasmReader::header_at(&pos));
    let algorithm = Rc::new(reader.read_from(&mut pos, None).unwrap());

    let mut byte_input = ByteInput::new(queue);
    byte_input.set_pos(pos);
    let capture = IntStream::new();
    let mut interp = Interpreter::new(
        Box::new(byte_input),
        Box::new(IntOutput::new(Rc::clone(&capture))),
        None,
    );
    interp.add_selector(Rc::new(DecompressSelector::new(vec![algorithm]).unwrap()));
    interp.algorithm_start().unwrap();
    interp.algorithm_read_back_filled().unwrap();
    let result = captured_values(&capture.borrow());
    result
}

#[test]
fn compress_decompress_round_trip_plain() {
    let values = [1u64, 2, 3, 1, 2, 3, 900, 1, 2, 3, 7, 7, 7, 1, 2, 3, 42];
    let decoded = compress_then_decompress(CompressionFlags::default(), &values);
    assert_eq!(decoded, values);
}

#[test]
fn compress_decompress_round_trip_huffman() {
    let values = [5u64, 6, 5, 6, 5, 6, 5, 6, 1000, 5, 6, 9, 9, 9, 5, 6];
    let flags = CompressionFlags {
        use_huffman_encoding: true,
        ..CompressionFlags::default()
    };
    let decoded = compress_then_decompress(flags, &values);
    assert_eq!(decoded, values);
}

#[test]
fn abbreviations_respect_budget() {
    let values: Vec<u64> = (0..100).map(|i| i % 5).collect();
    let stream = value_stream(&values);
    let flags = CompressionFlags {
        max_abbreviations: 7,
        ..CompressionFlags::default()
    };
    let root = CountRoot::new();
    root.add_stream(&stream.borrow(), &flags);
    let mut collector = AbbreviationsCollector::new(&root, &flags);
    let assignments = collector.assign_abbreviations();
    assert!(assignments.len() <= 7);
    // Abbreviation indices are unique and dense.
    for (index, node) in assignments.iter().enumerate() {
        assert_eq!(node.abbrev_index(), Some(index as u64));
    }
}

#[test]
fn selector_rewinds_after_bad_header() {
    // Two candidate algorithms; the input matches the second one.
    let values = [4u64, 4, 4, 8, 8, 8, 4, 4, 4];
    let input = value_stream(&values);
    let output = Queue::new();
    let compressor = IntCompressor::new(CompressionFlags::default());
    compressor
        .compress_stream(
            &input.borrow(),
            QueueRef::clone(&output),
            WASM_BINARY_VERSION_D,
        )
        .unwrap();

    // A decoy whose read header can never match the data.
    let mut decoy = SymbolTable::new();
    let src = empty_header(&mut decoy);
    let magic = decoy.int(NodeKind::U32Const, 0x1234_5678, ValueFormat::Hexadecimal);
    let read_header = decoy.create(NodeKind::ReadHeader, vec![magic]);
    let format = decoy.int_default(NodeKind::Varuint64);
    let body = decoy.create(NodeKind::LoopUnbounded, vec![format]);
    let define = file_define(&mut decoy, body);
    let decoy = install_algorithm(decoy, vec![src, read_header, define]);

    let bytes = output.to_bytes();
    let queue = Queue::from_bytes(&bytes);
    let mut pos = ReadCursor::new(QueueRef::clone(&queue));
    let reader = CasmReader::new();
    let embedded = Rc::new(reader.read_from(&mut pos, None).unwrap());
    let mut byte_input = ByteInput::new(queue);
    byte_input.set_pos(pos);

    let capture = IntStream::new();
    let mut interp = Interpreter::new(
        Box::new(byte_input),
        Box::new(IntOutput::new(Rc::clone(&capture))),
        None,
    );
    interp.add_selector(Rc::new(DecompressSelector::new(vec![decoy]).unwrap()));
    interp.add_selector(Rc::new(DecompressSelector::new(vec![embedded]).unwrap()));
    interp.algorithm_start().unwrap();
    interp.algorithm_read_back_filled().unwrap();
    assert_eq!(captured_values(&capture.borrow()), values);
}

#[test]
fn unpack_stream_rejects_reserved_patterns() {
    crate::stream::unpack_stream(0x02).unwrap_err();
    crate::stream::unpack_stream(0x03).unwrap_err();
    let (kind, typ) = crate::stream::unpack_stream(0x11).unwrap();
    assert_eq!(kind, crate::stream::StreamKind::Output);
    assert_eq!(typ, crate::stream::StreamType::Int);
}

#[test]
fn text_writer_renders_sexp() {
    let mut symtab = SymbolTable::new();
    let format = symtab.int_default(NodeKind::Uint8);
    insta::assert_snapshot!(
        crate::ast::write_text(&symtab, format).trim_end(),
        @"(uint8)"
    );

    let count = symtab.int(NodeKind::U32Const, 2, ValueFormat::Decimal);
    let body = symtab.int_default(NodeKind::Varuint32);
    let looped = symtab.create(NodeKind::Loop, vec![count, body]);
    insta::assert_snapshot!(
        crate::ast::write_text(&symtab, looped).trim_end(),
        @r"
    (loop
      (u32.const 2)
      (varuint32)
    )
    "
    );
}

#[test]
fn int_stream_output_captures_blocks() {
    let stream = IntStream::new();
    let mut out = IntOutput::new(Rc::clone(&stream));
    out.write_action(PredefinedSym::BlockEnter.action_value())
        .unwrap();
    out.write_varuint64(11).unwrap();
    out.write_action(PredefinedSym::BlockExit.action_value())
        .unwrap();
    out.write_freeze_eof().unwrap();
    let stream = stream.borrow();
    assert_eq!(
        stream.entries(),
        [
            IntEntry::Action(PredefinedSym::BlockEnter.action_value()),
            IntEntry::Value(11),
            IntEntry::Action(PredefinedSym::BlockExit.action_value()),
        ]
    );
    assert!(stream.is_frozen());
}
