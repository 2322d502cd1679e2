use std::rc::Rc;

use anyhow::{anyhow, Result};

use super::format::IntTypeFormat;
use super::selector::AlgorithmSelector;
use super::state::{CallFrame, EvalFrame, Method, Mode, OpcodeFrame, State, ValueStack};
use super::thrown::{TResult, ThrowKind, Thrown};
use super::{StreamInput, StreamOutput};
use crate::ast::{NodeKind, NodeRef, PredefinedSym, SymbolTable};
use crate::trace::TraceSink;
use crate::{IntType, WASM_BINARY_MAGIC, WASM_BINARY_VERSION_B, WASM_BINARY_VERSION_D};

/// Resumable evaluator of filter algorithms.
///
/// Execution is an explicit state machine over `(method, state)` pairs
/// rather than host recursion, so the interpreter can return to its
/// driver when input runs dry and continue when more bytes arrive.
pub struct Interpreter {
    input: Box<dyn StreamInput>,
    output: Box<dyn StreamOutput>,
    symtab: Option<Rc<SymbolTable>>,
    selectors: Vec<Rc<dyn AlgorithmSelector>>,

    frames: ValueStack<CallFrame>,
    calling_eval: ValueStack<EvalFrame>,
    catch: ValueStack<Method>,
    catch_state: State,
    thrown: Option<Thrown>,
    fail_method: Method,
    is_fatal: bool,

    loop_counter: ValueStack<IntType>,
    locals_base: ValueStack<usize>,
    local_values: Vec<IntType>,
    opcode_locals: ValueStack<OpcodeFrame>,

    last_read_value: IntType,
    dispatched_method: Method,
    magic: u32,
    version: u32,
    read_file_header: bool,
    freeze_eof_at_exit: bool,
    trace: TraceSink,
}

impl Interpreter {
    pub fn new(
        input: Box<dyn StreamInput>,
        output: Box<dyn StreamOutput>,
        symtab: Option<Rc<SymbolTable>>,
    ) -> Self {
        Self {
            input,
            output,
            symtab,
            selectors: Vec::new(),
            frames: ValueStack::new(CallFrame::default()),
            calling_eval: ValueStack::new(EvalFrame::default()),
            catch: ValueStack::new(Method::NoSuchMethod),
            catch_state: State::Enter,
            thrown: None,
            fail_method: Method::NoSuchMethod,
            is_fatal: false,
            loop_counter: ValueStack::new(0),
            locals_base: ValueStack::new(0),
            local_values: Vec::new(),
            opcode_locals: ValueStack::new(OpcodeFrame::default()),
            last_read_value: 0,
            dispatched_method: Method::NoSuchMethod,
            magic: 0,
            version: 0,
            read_file_header: true,
            freeze_eof_at_exit: true,
            trace: TraceSink::off(),
        }
    }

    /// Queue a candidate algorithm selector. Only meaningful when no
    /// symbol table was fixed at construction.
    pub fn add_selector(&mut self, selector: Rc<dyn AlgorithmSelector>) {
        debug_assert!(
            self.symtab.is_none(),
            "selectors only apply without a fixed symbol table"
        );
        self.selectors.push(selector);
    }

    pub fn set_symtab(&mut self, symtab: Option<Rc<SymbolTable>>) {
        self.symtab = symtab;
    }

    pub fn symtab(&self) -> Option<Rc<SymbolTable>> {
        self.symtab.clone()
    }

    pub fn swap_output(&mut self, output: Box<dyn StreamOutput>) -> Box<dyn StreamOutput> {
        std::mem::replace(&mut self.output, output)
    }

    pub fn swap_input(&mut self, input: Box<dyn StreamInput>) -> Box<dyn StreamInput> {
        std::mem::replace(&mut self.input, input)
    }

    pub fn set_minimize_block_size(&mut self, minimize: bool) {
        self.output.set_minimize_block_size(minimize);
    }

    pub fn set_freeze_eof_at_exit(&mut self, freeze: bool) {
        self.freeze_eof_at_exit = freeze;
    }

    pub fn set_trace(&mut self, trace: TraceSink) {
        self.trace = trace;
    }

    pub fn last_read_value(&self) -> IntType {
        self.last_read_value
    }

    // Driver surface.

    pub fn is_finished(&self) -> bool {
        self.frames.top().method == Method::Finished
    }

    pub fn is_successful(&self) -> bool {
        self.is_finished() && self.frames.top().state == State::Succeeded
    }

    pub fn errors_found(&self) -> bool {
        self.frames.top().state == State::Failed
    }

    /// Begin a run: straight to `GetFile` when an algorithm is fixed,
    /// through `GetAlgorithm` header matching otherwise.
    pub fn algorithm_start(&mut self) -> Result<()> {
        if self.symtab.is_some() {
            self.call_top_level(Method::GetFile, None);
            return Ok(());
        }
        if self.selectors.is_empty() {
            return Err(anyhow!("No algorithm or selectors to run"));
        }
        self.call_top_level(Method::GetAlgorithm, None);
        Ok(())
    }

    /// Begin a raw byte-copy run (no algorithm applied).
    pub fn copy_start(&mut self) {
        self.call_top_level(Method::CopyBlock, None);
    }

    /// Run dispatch steps while input headroom lasts, surrendering
    /// control when more input is needed.
    pub fn algorithm_resume(&mut self) {
        if !self.input.can_process_more_now() {
            return;
        }
        while !self.is_finished() {
            if self.errors_found() {
                break;
            }
            if !self.input.can_process_more_now() {
                return;
            }
            self.step();
        }
    }

    /// Pull-model driver: alternate refilling the input with resuming
    /// until the state machine finishes.
    pub fn algorithm_read_back_filled(&mut self) -> Result<()> {
        while !self.is_finished() {
            let filled = self.input.fill_more_input();
            self.algorithm_resume();
            if !self.is_finished() && !filled && !self.input.can_process_more_now() {
                self.fail("Input exhausted before algorithm completed");
            }
        }
        self.finish_result()
    }

    /// Single-line rendering of the final state, per the CLI contract.
    pub fn finish_result(&self) -> Result<()> {
        if self.is_successful() {
            return Ok(());
        }
        let message = self
            .thrown
            .as_ref()
            .map(|thrown| thrown.to_string())
            .unwrap_or_else(|| "Failed".to_string());
        Err(anyhow!(
            "Error: (method {}) {}",
            self.fail_method.name(),
            message
        ))
    }

    pub fn thrown(&self) -> Option<&Thrown> {
        self.thrown.as_ref()
    }

    // Frame plumbing.

    fn call_top_level(&mut self, method: Method, nd: Option<NodeRef>) {
        self.reset_run_state();
        *self.frames.top_mut() = CallFrame {
            method: Method::Started,
            state: State::Enter,
            mode: Mode::ReadAndWrite,
            nd: None,
            return_value: 0,
        };
        self.call(method, Mode::ReadAndWrite, nd);
    }

    fn reset_run_state(&mut self) {
        self.frames.clear();
        self.frames.top_mut().reset();
        self.calling_eval.clear();
        self.catch.clear();
        *self.catch.top_mut() = Method::NoSuchMethod;
        self.loop_counter.clear();
        self.locals_base.clear();
        self.local_values.clear();
        self.opcode_locals.clear();
        self.thrown = None;
        self.is_fatal = false;
    }

    fn call(&mut self, method: Method, mode: Mode, nd: Option<NodeRef>) {
        self.frames.top_mut().return_value = 0;
        self.frames.push_value(CallFrame {
            method,
            state: State::Enter,
            mode,
            nd,
            return_value: 0,
        });
    }

    fn pop_and_return(&mut self, value: IntType) {
        if !self.frames.is_empty() {
            self.frames.pop();
        }
        self.frames.top_mut().return_value = value;
    }

    fn pop_and_return_read(&mut self, value: IntType) {
        self.last_read_value = value;
        self.pop_and_return(value);
    }

    // Throw machinery.

    fn throw(&mut self, thrown: Thrown) {
        self.trace.note(|| format!("throw: {thrown}"));
        self.fail_method = self.frames.top().method;
        if thrown.kind == ThrowKind::Fatal {
            self.is_fatal = true;
        }
        self.thrown = Some(thrown);
        self.catch_or_else_fail();
    }

    fn fail(&mut self, message: impl Into<String>) {
        self.throw(Thrown::fatal(message));
    }

    fn fail_bad_state(&mut self) {
        let state = self.frames.top().state;
        self.fail(format!("Bad internal decompressor state: {}", state.name()));
    }

    fn fail_not_implemented(&mut self) {
        self.fail("Method not implemented!");
    }

    fn rethrow(&mut self) {
        let thrown = self
            .thrown
            .clone()
            .unwrap_or_else(|| Thrown::fatal("Rethrow without a pending throw"));
        self.throw(thrown);
    }

    fn catch_or_else_fail(&mut self) {
        let catchable = !self.is_fatal
            && self
                .thrown
                .as_ref()
                .map(|thrown| thrown.is_catchable())
                .unwrap_or(false);
        while !self.frames.is_empty() {
            if catchable && self.frames.top().method == *self.catch.top() {
                self.catch_state = self.frames.top().state;
                self.frames.top_mut().state = State::Catch;
                self.catch.pop();
                return;
            }
            self.pop_and_return(0);
        }
        // Nothing caught; report context and die.
        if let Some(thrown) = &self.thrown {
            self.trace.note(|| format!("uncaught: {thrown}"));
        }
        self.frames.top_mut().fail();
    }

    // Node access helpers.

    fn require_symtab(&self) -> TResult<Rc<SymbolTable>> {
        self.symtab
            .clone()
            .ok_or_else(|| Thrown::fatal("No symbol table installed"))
    }

    fn format_width(symtab: &SymbolTable, nd: NodeRef) -> Option<u32> {
        let value = symtab.int_value(nd)?;
        if value.is_default {
            None
        } else {
            u32::try_from(value.value).ok()
        }
    }

    // One dispatch step.

    fn step(&mut self) {
        let frame = *self.frames.top();
        let result = match frame.method {
            Method::Eval => self.step_eval(frame),
            Method::EvalBlock => self.step_eval_block(frame),
            Method::EvalParam => self.step_eval_param(frame),
            Method::ReadOpcode => self.step_read_opcode(frame),
            Method::GetFile => self.step_get_file(frame),
            Method::GetAlgorithm => self.step_get_algorithm(frame),
            Method::CopyBlock => self.step_copy_block(frame),
            Method::Started | Method::Finished | Method::NoSuchMethod => {
                self.handle_other_methods();
                Ok(())
            }
        };
        if let Err(thrown) = result {
            self.throw(thrown);
        }
    }

    fn handle_other_methods(&mut self) {
        match self.frames.top().method {
            Method::Started => {
                debug_assert!(self.frames.is_empty());
                self.frames.top_mut().method = Method::Finished;
                if self.input.processed_correctly() {
                    self.frames.top_mut().state = State::Succeeded;
                } else {
                    self.throw(Thrown::malformed("Malformed input in compressed file"));
                }
            }
            Method::Finished => {
                let state = self.frames.top().state;
                if !matches!(state, State::Succeeded | State::Failed) {
                    self.trace
                        .note(|| format!("Malformed finish state {}; correcting", state.name()));
                    self.frames.top_mut().state = State::Failed;
                }
            }
            _ => self.fail_not_implemented(),
        }
    }

    fn step_copy_block(&mut self, frame: CallFrame) -> TResult<()> {
        match frame.state {
            State::Enter => {
                self.frames.top_mut().state = State::Loop;
                Ok(())
            }
            State::Loop => {
                if self.input.at_input_eob() {
                    self.frames.top_mut().state = State::Exit;
                    return Ok(());
                }
                let value = self.input.read_u8()?;
                self.last_read_value = IntType::from(value);
                self.output.write_u8(value)?;
                Ok(())
            }
            State::Exit => {
                if self.freeze_eof_at_exit {
                    self.output.write_freeze_eof()?;
                }
                self.pop_and_return(0);
                Ok(())
            }
            _ => {
                self.fail_bad_state();
                Ok(())
            }
        }
    }

    fn step_eval_block(&mut self, frame: CallFrame) -> TResult<()> {
        match frame.state {
            State::Enter => {
                let action = PredefinedSym::BlockEnter.action_value();
                if frame.mode.has_read() {
                    self.input.read_action(action)?;
                }
                if frame.mode.has_write() {
                    self.output.write_action(action)?;
                }
                self.frames.top_mut().state = State::Exit;
                let dispatched = self.dispatched_method;
                self.call(dispatched, frame.mode, frame.nd);
                Ok(())
            }
            State::Exit => {
                let action = PredefinedSym::BlockExit.action_value();
                if frame.mode.has_read() {
                    self.input.read_action(action)?;
                }
                if frame.mode.has_write() {
                    self.output.write_action(action)?;
                }
                self.pop_and_return(0);
                Ok(())
            }
            _ => {
                self.fail_bad_state();
                Ok(())
            }
        }
    }

    fn step_eval_param(&mut self, frame: CallFrame) -> TResult<()> {
        match frame.state {
            State::Enter => {
                let symtab = self.require_symtab()?;
                let current = *self.calling_eval.top();
                let Some(caller) = current.caller else {
                    return Err(Thrown::new(
                        ThrowKind::ScopeViolation,
                        "Not inside a call frame, can't evaluate parameter accessor!",
                    ));
                };
                let nd = frame.nd.ok_or_else(|| Thrown::fatal("EvalParam without node"))?;
                let index = symtab
                    .int_value(nd)
                    .ok_or_else(|| Thrown::fatal("Param without an index"))?
                    .value;
                let arg_index = (index + 1) as usize;
                if arg_index >= symtab.num_kids(caller) {
                    return Err(Thrown::new(
                        ThrowKind::ScopeViolation,
                        "Parameter reference doesn't match calling context!",
                    ));
                }
                let context = symtab.kid(caller, arg_index);
                // Rebind the caller's own calling context so nested
                // parameters resolve lexically.
                let enclosing = *self.calling_eval.at(current.calling_eval_index);
                self.calling_eval.push_value(enclosing);
                self.frames.top_mut().state = State::Exit;
                let dispatched = self.dispatched_method;
                self.call(dispatched, frame.mode, Some(context));
                Ok(())
            }
            State::Exit => {
                self.calling_eval.pop();
                self.pop_and_return(frame.return_value);
                Ok(())
            }
            _ => {
                self.fail_bad_state();
                Ok(())
            }
        }
    }

    fn step_read_opcode(&mut self, frame: CallFrame) -> TResult<()> {
        let symtab = self.require_symtab()?;
        let nd = frame.nd.ok_or_else(|| Thrown::fatal("ReadOpcode without node"))?;
        match symtab.kind(nd) {
            NodeKind::Opcode => match frame.state {
                State::Enter => {
                    self.frames.top_mut().state = State::Step2;
                    self.call(Method::ReadOpcode, frame.mode, Some(symtab.kid(nd, 0)));
                    Ok(())
                }
                State::Step2 => {
                    let locals = *self.opcode_locals.top();
                    let combined = (locals.prefix << locals.sel_shift) | locals.case_mask;
                    self.last_read_value = combined;
                    match symtab.get_case(nd, combined) {
                        Some(case) => {
                            let body = symtab.kid(case, 1);
                            if symtab.kind(body) == NodeKind::Opcode {
                                // Deeper selector: accumulate into a
                                // fresh frame seeded with our bits.
                                self.frames.top_mut().state = State::Step3;
                                self.opcode_locals.push_value(OpcodeFrame {
                                    prefix: combined,
                                    sel_shift: 0,
                                    case_mask: 0,
                                });
                                self.call(Method::ReadOpcode, frame.mode, Some(body));
                            } else {
                                self.frames.top_mut().state = State::Step4;
                                self.call(Method::Eval, frame.mode, Some(body));
                            }
                            Ok(())
                        }
                        None => {
                            self.pop_and_return(combined);
                            Ok(())
                        }
                    }
                }
                State::Step3 => {
                    self.opcode_locals.pop();
                    self.pop_and_return(frame.return_value);
                    Ok(())
                }
                State::Step4 => {
                    self.pop_and_return(frame.return_value);
                    Ok(())
                }
                _ => {
                    self.fail_bad_state();
                    Ok(())
                }
            },
            NodeKind::LastRead => {
                // Reuse of the outer read: dispatch on it, no new bits.
                let value = self.last_read_value;
                let locals = self.opcode_locals.top_mut();
                locals.case_mask = value;
                locals.sel_shift = 0;
                self.pop_and_return(value);
                Ok(())
            }
            kind if kind.is_fixed_format() => match frame.state {
                State::Enter => {
                    self.frames.top_mut().state = State::Exit;
                    self.call(Method::Eval, frame.mode, Some(nd));
                    Ok(())
                }
                State::Exit => {
                    let width = Self::format_width(&symtab, nd)
                        .or_else(|| symtab.kind(nd).natural_bits())
                        .unwrap_or(0);
                    let locals = self.opcode_locals.top_mut();
                    locals.case_mask = frame.return_value;
                    locals.sel_shift = width;
                    self.pop_and_return(frame.return_value);
                    Ok(())
                }
                _ => {
                    self.fail_bad_state();
                    Ok(())
                }
            },
            kind => Err(Thrown::fatal(format!(
                "Illegal opcode selector: {}",
                kind.sexp_name()
            ))),
        }
    }

    fn step_get_file(&mut self, frame: CallFrame) -> TResult<()> {
        let symtab = self.require_symtab()?;
        match frame.state {
            State::Enter => {
                if frame.nd.is_none() {
                    let root = symtab
                        .algorithm()
                        .ok_or_else(|| Thrown::fatal("Symbol table has no algorithm"))?;
                    self.frames.top_mut().nd = Some(root);
                }
                match symtab.target_header() {
                    Some(header) => {
                        let write_header = symtab.write_header();
                        if write_header.is_some() && frame.mode.has_write() {
                            self.frames.top_mut().state = State::Step2;
                            self.call(Method::Eval, Mode::ReadOnly, Some(header));
                        } else {
                            self.frames.top_mut().state = State::Step3;
                            self.call(Method::Eval, frame.mode, Some(header));
                        }
                    }
                    None => {
                        self.frames.top_mut().state = if self.read_file_header {
                            State::Loop
                        } else {
                            State::Step3
                        };
                    }
                }
                Ok(())
            }
            State::Step2 => {
                // Input header matched; now emit the declared output
                // header instead of mirroring.
                let write_header = symtab
                    .write_header()
                    .ok_or_else(|| Thrown::fatal("Write header disappeared"))?;
                self.frames.top_mut().state = State::Step3;
                self.call(Method::Eval, Mode::WriteOnly, Some(write_header));
                Ok(())
            }
            State::Loop => {
                // Legacy headerless form: raw wasm magic then version.
                self.magic = self.input.read_header_value(IntTypeFormat::Uint32)? as u32;
                self.version = self.input.read_header_value(IntTypeFormat::Uint32)? as u32;
                if self.magic != WASM_BINARY_MAGIC {
                    return Err(Thrown::new(
                        ThrowKind::BadHeader,
                        "Unable to decompress, did not find WASM binary magic number",
                    ));
                }
                if self.version != WASM_BINARY_VERSION_B && self.version != WASM_BINARY_VERSION_D {
                    return Err(Thrown::new(
                        ThrowKind::BadHeader,
                        "Unable to decompress, WASM version number not known",
                    ));
                }
                if frame.mode.has_write() {
                    self.output
                        .write_header_value(IntType::from(self.magic), IntTypeFormat::Uint32)?;
                    self.output
                        .write_header_value(IntType::from(self.version), IntTypeFormat::Uint32)?;
                }
                self.frames.top_mut().state = State::Step3;
                Ok(())
            }
            State::Step3 => {
                let define = symtab.file_define().ok_or_else(|| {
                    Thrown::new(
                        ThrowKind::UnresolvedSymbol,
                        "Can't find sexpression to process file",
                    )
                })?;
                self.frames.top_mut().state = State::Exit;
                self.call(Method::Eval, frame.mode, Some(define));
                Ok(())
            }
            State::Exit => {
                if self.freeze_eof_at_exit {
                    self.output.write_freeze_eof()?;
                }
                self.pop_and_return(0);
                Ok(())
            }
            _ => {
                self.fail_bad_state();
                Ok(())
            }
        }
    }

    fn step_get_algorithm(&mut self, frame: CallFrame) -> TResult<()> {
        match frame.state {
            State::Enter => {
                self.catch.push_value(Method::GetAlgorithm);
                self.input.push_peek_pos();
                self.loop_counter.push_value(0);
                self.frames.top_mut().state = State::Loop;
                Ok(())
            }
            State::Loop => {
                let index = *self.loop_counter.top() as usize;
                if index >= self.selectors.len() {
                    self.catch.pop();
                    self.input.pop_peek_pos()?;
                    self.loop_counter.pop();
                    return Err(Thrown::malformed("Unable to find algorithm to apply!"));
                }
                let selector = Rc::clone(&self.selectors[index]);
                let (symtab, header) = selector.target_header();
                self.symtab = Some(symtab);
                self.frames.top_mut().state = State::Step2;
                self.call(Method::Eval, Mode::ReadOnly, Some(header));
                Ok(())
            }
            State::Step2 => {
                // Header matched: rewind, install, and run.
                self.catch.pop();
                self.input.pop_peek_pos()?;
                let index = *self.loop_counter.top() as usize;
                let selector = Rc::clone(&self.selectors[index]);
                selector
                    .configure(self)
                    .map_err(|error| Thrown::fatal(error.to_string()))?;
                if self.symtab.is_none() {
                    return Err(Thrown::fatal("No algorithm defined for selected algorithm"));
                }
                self.frames.top_mut().state = State::Step3;
                Ok(())
            }
            State::Step3 => {
                self.frames.top_mut().state = State::Step4;
                self.call(Method::GetFile, frame.mode, None);
                Ok(())
            }
            State::Step4 => {
                let index = *self.loop_counter.top() as usize;
                let selector = Rc::clone(&self.selectors[index]);
                let more = selector
                    .reset(self)
                    .map_err(|error| Thrown::fatal(error.to_string()))?;
                if more {
                    if self.symtab.is_some() {
                        // Another queued algorithm; rerun without
                        // rescanning headers.
                        self.frames.top_mut().state = State::Step3;
                        return Ok(());
                    }
                    return Err(Thrown::fatal(
                        "Unable to reset state after applying algorithm",
                    ));
                }
                if self.input.at_input_eof() {
                    self.loop_counter.pop();
                    self.frames.top_mut().state = State::Exit;
                    return Ok(());
                }
                self.catch.push_value(Method::GetAlgorithm);
                self.input.push_peek_pos();
                *self.loop_counter.top_mut() = 0;
                self.frames.top_mut().state = State::Loop;
                Ok(())
            }
            State::Catch => match self.catch_state {
                State::Step2 => {
                    // Header probe failed: rewind and try the next
                    // candidate.
                    self.catch.push_value(Method::GetAlgorithm);
                    self.input.pop_peek_pos()?;
                    self.input.push_peek_pos();
                    *self.loop_counter.top_mut() += 1;
                    self.frames.top_mut().state = State::Loop;
                    Ok(())
                }
                _ => {
                    self.rethrow();
                    Ok(())
                }
            },
            State::Exit => {
                self.pop_and_return(0);
                Ok(())
            }
            _ => {
                self.fail_bad_state();
                Ok(())
            }
        }
    }

    fn step_eval(&mut self, frame: CallFrame) -> TResult<()> {
        let symtab = self.require_symtab()?;
        let nd = frame.nd.ok_or_else(|| Thrown::fatal("Eval without node"))?;
        let kind = symtab.kind(nd);
        match kind {
            NodeKind::Convert
            | NodeKind::Filter
            | NodeKind::Params
            | NodeKind::Locals
            | NodeKind::LiteralDef
            | NodeKind::LiteralActionDef
            | NodeKind::LiteralActionUse
            | NodeKind::LiteralUse
            | NodeKind::Rename
            | NodeKind::Symbol
            | NodeKind::Section
            | NodeKind::Undefine
            | NodeKind::Algorithm
            | NodeKind::EnclosingAlgorithms
            | NodeKind::BinarySelect => {
                self.fail_not_implemented();
                Ok(())
            }
            NodeKind::Error => Err(Thrown::malformed("Algorithm error!")),
            NodeKind::SourceHeader | NodeKind::ReadHeader | NodeKind::WriteHeader => {
                self.step_eval_header(frame, &symtab, nd)
            }
            NodeKind::BitwiseAnd | NodeKind::BitwiseOr | NodeKind::BitwiseXor => {
                match frame.state {
                    State::Enter => {
                        if !frame.mode.has_read() {
                            self.fail("Method can only be processed in read mode");
                            return Ok(());
                        }
                        self.frames.top_mut().state = State::Step2;
                        self.call(Method::Eval, frame.mode, Some(symtab.kid(nd, 0)));
                        Ok(())
                    }
                    State::Step2 => {
                        self.local_values.push(frame.return_value);
                        self.frames.top_mut().state = State::Exit;
                        self.call(Method::Eval, frame.mode, Some(symtab.kid(nd, 1)));
                        Ok(())
                    }
                    State::Exit => {
                        let arg2 = frame.return_value;
                        let arg1 = self
                            .local_values
                            .pop()
                            .ok_or_else(|| Thrown::fatal("Scratch stack underflow"))?;
                        let value = match kind {
                            NodeKind::BitwiseAnd => arg1 & arg2,
                            NodeKind::BitwiseOr => arg1 | arg2,
                            _ => arg1 ^ arg2,
                        };
                        self.pop_and_return(value);
                        Ok(())
                    }
                    _ => {
                        self.fail_bad_state();
                        Ok(())
                    }
                }
            }
            NodeKind::BitwiseNegate => match frame.state {
                State::Enter => {
                    if !frame.mode.has_read() {
                        self.fail("Method can only be processed in read mode");
                        return Ok(());
                    }
                    self.frames.top_mut().state = State::Exit;
                    self.call(Method::Eval, frame.mode, Some(symtab.kid(nd, 0)));
                    Ok(())
                }
                State::Exit => {
                    self.pop_and_return(!frame.return_value);
                    Ok(())
                }
                _ => {
                    self.fail_bad_state();
                    Ok(())
                }
            },
            NodeKind::Callback => {
                let action = symtab
                    .action_value(symtab.kid(nd, 0))
                    .map_err(|error| Thrown::new(ThrowKind::UnresolvedSymbol, error.to_string()))?;
                if !self.input.read_action(action)? || !self.output.write_action(action)? {
                    self.fail(format!("Unable to apply action: {action}"));
                    return Ok(());
                }
                let value = self.last_read_value;
                self.pop_and_return(value);
                Ok(())
            }
            NodeKind::U8Const
            | NodeKind::U32Const
            | NodeKind::U64Const
            | NodeKind::I32Const
            | NodeKind::I64Const => {
                let value = symtab
                    .int_value(nd)
                    .ok_or_else(|| Thrown::fatal("Integer literal without a value"))?
                    .value;
                if frame.mode.has_read() {
                    self.last_read_value = value;
                }
                self.pop_and_return(value);
                Ok(())
            }
            NodeKind::LastRead => {
                let value = self.last_read_value;
                self.pop_and_return(value);
                Ok(())
            }
            NodeKind::Local => {
                let index = symtab
                    .int_value(nd)
                    .ok_or_else(|| Thrown::fatal("Local without an index"))?
                    .value as usize;
                let address = *self.locals_base.top() + index;
                let value = *self.local_values.get(address).ok_or_else(|| {
                    Thrown::new(
                        ThrowKind::ScopeViolation,
                        "Local variable index out of range!",
                    )
                })?;
                self.pop_and_return(value);
                Ok(())
            }
            NodeKind::Peek => match frame.state {
                State::Enter => {
                    self.input.push_peek_pos();
                    self.frames.top_mut().state = State::Exit;
                    self.call(Method::Eval, Mode::ReadOnly, Some(symtab.kid(nd, 0)));
                    Ok(())
                }
                State::Exit => {
                    self.input.pop_peek_pos()?;
                    self.pop_and_return(frame.return_value);
                    Ok(())
                }
                _ => {
                    self.fail_bad_state();
                    Ok(())
                }
            },
            NodeKind::Read => match frame.state {
                State::Enter => {
                    self.frames.top_mut().state = State::Exit;
                    self.call(Method::Eval, Mode::ReadOnly, Some(symtab.kid(nd, 0)));
                    Ok(())
                }
                State::Exit => {
                    self.pop_and_return(frame.return_value);
                    Ok(())
                }
                _ => {
                    self.fail_bad_state();
                    Ok(())
                }
            },
            NodeKind::Uint8
            | NodeKind::Uint32
            | NodeKind::Uint64
            | NodeKind::Varint32
            | NodeKind::Varint64
            | NodeKind::Varuint32
            | NodeKind::Varuint64 => {
                let width = Self::format_width(&symtab, nd);
                if frame.mode.has_read() {
                    self.last_read_value = self.input.read_value(kind, width)?;
                }
                if frame.mode.has_write() {
                    self.output.write_value(self.last_read_value, kind, width)?;
                }
                let value = self.last_read_value;
                self.pop_and_return(value);
                Ok(())
            }
            NodeKind::Map => match frame.state {
                State::Enter => {
                    self.frames.top_mut().state = State::Step2;
                    if frame.mode.has_read() {
                        self.call(Method::Eval, Mode::ReadOnly, Some(symtab.kid(nd, 0)));
                    }
                    Ok(())
                }
                State::Step2 => {
                    self.frames.top_mut().state = State::Exit;
                    if frame.mode.has_read() {
                        self.last_read_value = frame.return_value;
                        let case = symtab.get_case(nd, frame.return_value).ok_or_else(|| {
                            Thrown::new(
                                ThrowKind::RangeError,
                                format!("No map case for {}", frame.return_value),
                            )
                        })?;
                        self.call(Method::Eval, Mode::ReadOnly, Some(case));
                    }
                    Ok(())
                }
                State::Exit => {
                    if frame.mode.has_read() {
                        self.last_read_value = frame.return_value;
                    }
                    let value = self.last_read_value;
                    self.pop_and_return(value);
                    Ok(())
                }
                _ => {
                    self.fail_bad_state();
                    Ok(())
                }
            },
            NodeKind::Opcode => self.step_eval_opcode(frame, &symtab, nd),
            NodeKind::Set => match frame.state {
                State::Enter => {
                    self.frames.top_mut().state = State::Exit;
                    self.call(Method::Eval, frame.mode, Some(symtab.kid(nd, 1)));
                    Ok(())
                }
                State::Exit => {
                    let target = symtab.kid(nd, 0);
                    if symtab.kind(target) != NodeKind::Local {
                        return Err(Thrown::fatal("Set target is not a local"));
                    }
                    let index = symtab
                        .int_value(target)
                        .ok_or_else(|| Thrown::fatal("Local without an index"))?
                        .value as usize;
                    let address = *self.locals_base.top() + index;
                    let slot = self.local_values.get_mut(address).ok_or_else(|| {
                        Thrown::new(
                            ThrowKind::ScopeViolation,
                            "Local variable index out of range, can't set!",
                        )
                    })?;
                    *slot = frame.return_value;
                    let value = self.last_read_value;
                    self.pop_and_return(value);
                    Ok(())
                }
                _ => {
                    self.fail_bad_state();
                    Ok(())
                }
            },
            NodeKind::Write => match frame.state {
                State::Enter => {
                    self.loop_counter.push_value(0);
                    self.frames.top_mut().state = State::Loop;
                    Ok(())
                }
                State::Loop => {
                    *self.loop_counter.top_mut() += 1;
                    let counter = *self.loop_counter.top() as usize;
                    if counter >= symtab.num_kids(nd) {
                        self.frames.top_mut().state = State::Exit;
                        return Ok(());
                    }
                    self.frames.top_mut().state = State::Step2;
                    self.call(Method::Eval, Mode::ReadOnly, Some(symtab.kid(nd, counter)));
                    Ok(())
                }
                State::Step2 => {
                    // The evaluated source expression is what gets
                    // written, whatever was last decoded.
                    self.last_read_value = frame.return_value;
                    self.frames.top_mut().state = State::Loop;
                    self.call(Method::Eval, Mode::WriteOnly, Some(symtab.kid(nd, 0)));
                    Ok(())
                }
                State::Exit => {
                    self.loop_counter.pop();
                    self.pop_and_return(frame.return_value);
                    Ok(())
                }
                _ => {
                    self.fail_bad_state();
                    Ok(())
                }
            },
            NodeKind::Stream => {
                let value = match symtab.payload(nd) {
                    crate::ast::Payload::Stream(kind, typ) => {
                        let actual = match kind {
                            crate::stream::StreamKind::Input => self.input.stream_type(),
                            crate::stream::StreamKind::Output => self.output.stream_type(),
                        };
                        IntType::from(actual == typ)
                    }
                    _ => 0,
                };
                self.pop_and_return(value);
                Ok(())
            }
            NodeKind::Not => match frame.state {
                State::Enter => {
                    if !frame.mode.has_read() {
                        self.fail("Method can only be processed in read mode");
                        return Ok(());
                    }
                    self.frames.top_mut().state = State::Exit;
                    self.call(Method::Eval, frame.mode, Some(symtab.kid(nd, 0)));
                    Ok(())
                }
                State::Exit => {
                    self.pop_and_return(IntType::from(frame.return_value == 0));
                    Ok(())
                }
                _ => {
                    self.fail_bad_state();
                    Ok(())
                }
            },
            NodeKind::And | NodeKind::Or => match frame.state {
                State::Enter => {
                    if !frame.mode.has_read() {
                        self.fail("Method can only be processed in read mode");
                        return Ok(());
                    }
                    self.frames.top_mut().state = State::Step2;
                    self.call(Method::Eval, frame.mode, Some(symtab.kid(nd, 0)));
                    Ok(())
                }
                State::Step2 => {
                    self.frames.top_mut().state = State::Exit;
                    let short_circuit = match kind {
                        NodeKind::And => frame.return_value == 0,
                        _ => frame.return_value != 0,
                    };
                    if !short_circuit {
                        self.call(Method::Eval, frame.mode, Some(symtab.kid(nd, 1)));
                    }
                    Ok(())
                }
                State::Exit => {
                    self.pop_and_return(frame.return_value);
                    Ok(())
                }
                _ => {
                    self.fail_bad_state();
                    Ok(())
                }
            },
            NodeKind::Sequence => match frame.state {
                State::Enter => {
                    self.loop_counter.push_value(0);
                    self.frames.top_mut().state = State::Loop;
                    Ok(())
                }
                State::Loop => {
                    let counter = *self.loop_counter.top() as usize;
                    if counter >= symtab.num_kids(nd) {
                        self.frames.top_mut().state = State::Exit;
                        return Ok(());
                    }
                    *self.loop_counter.top_mut() += 1;
                    self.call(Method::Eval, frame.mode, Some(symtab.kid(nd, counter)));
                    Ok(())
                }
                State::Exit => {
                    self.loop_counter.pop();
                    let value = self.last_read_value;
                    self.pop_and_return(value);
                    Ok(())
                }
                _ => {
                    self.fail_bad_state();
                    Ok(())
                }
            },
            NodeKind::Loop => match frame.state {
                State::Enter => {
                    self.frames.top_mut().state = State::Step2;
                    self.call(Method::Eval, frame.mode, Some(symtab.kid(nd, 0)));
                    Ok(())
                }
                State::Step2 => {
                    self.loop_counter.push_value(frame.return_value);
                    self.frames.top_mut().state = State::Loop;
                    Ok(())
                }
                State::Loop => {
                    if *self.loop_counter.top() == 0 {
                        self.frames.top_mut().state = State::Exit;
                        return Ok(());
                    }
                    *self.loop_counter.top_mut() -= 1;
                    self.call(Method::Eval, frame.mode, Some(symtab.kid(nd, 1)));
                    Ok(())
                }
                State::Exit => {
                    self.loop_counter.pop();
                    self.pop_and_return(0);
                    Ok(())
                }
                _ => {
                    self.fail_bad_state();
                    Ok(())
                }
            },
            NodeKind::LoopUnbounded => match frame.state {
                State::Enter => {
                    self.frames.top_mut().state = State::Loop;
                    Ok(())
                }
                State::Loop => {
                    if self.input.at_input_eob() {
                        self.frames.top_mut().state = State::Exit;
                        return Ok(());
                    }
                    self.call(Method::Eval, frame.mode, Some(symtab.kid(nd, 0)));
                    Ok(())
                }
                State::Exit => {
                    self.pop_and_return(0);
                    Ok(())
                }
                _ => {
                    self.fail_bad_state();
                    Ok(())
                }
            },
            NodeKind::IfThen => match frame.state {
                State::Enter => {
                    self.frames.top_mut().state = State::Step2;
                    self.call(Method::Eval, frame.mode, Some(symtab.kid(nd, 0)));
                    Ok(())
                }
                State::Step2 => {
                    self.frames.top_mut().state = State::Exit;
                    if frame.return_value != 0 {
                        self.call(Method::Eval, frame.mode, Some(symtab.kid(nd, 1)));
                    }
                    Ok(())
                }
                State::Exit => {
                    self.pop_and_return(0);
                    Ok(())
                }
                _ => {
                    self.fail_bad_state();
                    Ok(())
                }
            },
            NodeKind::IfThenElse => match frame.state {
                State::Enter => {
                    self.frames.top_mut().state = State::Step2;
                    self.call(Method::Eval, frame.mode, Some(symtab.kid(nd, 0)));
                    Ok(())
                }
                State::Step2 => {
                    self.frames.top_mut().state = State::Exit;
                    let branch = if frame.return_value != 0 { 1 } else { 2 };
                    self.call(Method::Eval, frame.mode, Some(symtab.kid(nd, branch)));
                    Ok(())
                }
                State::Exit => {
                    self.pop_and_return(0);
                    Ok(())
                }
                _ => {
                    self.fail_bad_state();
                    Ok(())
                }
            },
            NodeKind::Switch => match frame.state {
                State::Enter => {
                    self.frames.top_mut().state = State::Step2;
                    self.call(Method::Eval, frame.mode, Some(symtab.kid(nd, 0)));
                    Ok(())
                }
                State::Step2 => {
                    self.frames.top_mut().state = State::Exit;
                    match symtab.get_case(nd, frame.return_value) {
                        Some(case) => self.call(Method::Eval, frame.mode, Some(case)),
                        None => self.call(Method::Eval, frame.mode, Some(symtab.kid(nd, 1))),
                    }
                    Ok(())
                }
                State::Exit => {
                    self.pop_and_return(frame.return_value);
                    Ok(())
                }
                _ => {
                    self.fail_bad_state();
                    Ok(())
                }
            },
            NodeKind::Case => match frame.state {
                State::Enter => {
                    self.frames.top_mut().state = State::Exit;
                    self.call(Method::Eval, frame.mode, Some(symtab.kid(nd, 1)));
                    Ok(())
                }
                State::Exit => {
                    self.pop_and_return(frame.return_value);
                    Ok(())
                }
                _ => {
                    self.fail_bad_state();
                    Ok(())
                }
            },
            NodeKind::Define => match frame.state {
                State::Enter => {
                    let num_locals = symtab.define_num_locals(nd);
                    if num_locals > 0 {
                        self.locals_base.push_value(self.local_values.len());
                        self.local_values
                            .resize(self.local_values.len() + num_locals as usize, 0);
                    }
                    self.frames.top_mut().state = State::Exit;
                    let body = symtab.define_body(nd);
                    self.call(Method::Eval, frame.mode, Some(body));
                    Ok(())
                }
                State::Exit => {
                    if symtab.define_num_locals(nd) > 0 {
                        let base = *self.locals_base.top();
                        self.local_values.truncate(base);
                        self.locals_base.pop();
                    }
                    self.pop_and_return(0);
                    Ok(())
                }
                _ => {
                    self.fail_bad_state();
                    Ok(())
                }
            },
            NodeKind::Param => match frame.state {
                State::Enter => {
                    self.frames.top_mut().state = State::Exit;
                    self.dispatched_method = Method::Eval;
                    self.call(Method::EvalParam, frame.mode, Some(nd));
                    Ok(())
                }
                State::Exit => {
                    self.pop_and_return(frame.return_value);
                    Ok(())
                }
                _ => {
                    self.fail_bad_state();
                    Ok(())
                }
            },
            NodeKind::Eval => match frame.state {
                State::Enter => {
                    let sym = symtab
                        .symbol_id(symtab.kid(nd, 0))
                        .ok_or_else(|| Thrown::fatal("Eval target is not a symbol"))?;
                    let define = symtab.define_of(sym).ok_or_else(|| {
                        Thrown::new(
                            ThrowKind::UnresolvedSymbol,
                            format!("Undefined symbol: {}", symtab.symbol_name(sym)),
                        )
                    })?;
                    let num_params = symtab.define_num_params(define);
                    let num_args = (symtab.num_kids(nd) - 1) as IntType;
                    if num_params != num_args {
                        return Err(Thrown::new(
                            ThrowKind::ArityMismatch,
                            format!(
                                "Definition {} expects {num_params} parameters, found: {num_args}",
                                symtab.symbol_name(sym)
                            ),
                        ));
                    }
                    let index = self.calling_eval.len();
                    self.calling_eval.push_value(EvalFrame {
                        caller: Some(nd),
                        calling_eval_index: index,
                    });
                    self.frames.top_mut().state = State::Exit;
                    self.call(Method::Eval, frame.mode, Some(define));
                    Ok(())
                }
                State::Exit => {
                    self.calling_eval.pop();
                    let value = self.last_read_value;
                    self.pop_and_return(value);
                    Ok(())
                }
                _ => {
                    self.fail_bad_state();
                    Ok(())
                }
            },
            NodeKind::Block => match frame.state {
                State::Enter => {
                    self.frames.top_mut().state = State::Exit;
                    self.dispatched_method = Method::Eval;
                    self.call(Method::EvalBlock, frame.mode, Some(symtab.kid(nd, 0)));
                    Ok(())
                }
                State::Exit => {
                    self.pop_and_return(0);
                    Ok(())
                }
                _ => {
                    self.fail_bad_state();
                    Ok(())
                }
            },
            NodeKind::BinaryEval => {
                if frame.mode == Mode::WriteOnly {
                    let value = self.last_read_value;
                    self.write_binary(&symtab, symtab.kid(nd, 0), value)?;
                    self.pop_and_return(value);
                    return Ok(());
                }
                let mut cursor = symtab.kid(nd, 0);
                let value = loop {
                    match symtab.kind(cursor) {
                        NodeKind::BinaryAccept => {
                            break symtab
                                .int_value(cursor)
                                .ok_or_else(|| Thrown::fatal("binary.accept without a value"))?
                                .value;
                        }
                        NodeKind::BinarySelect => {
                            let bit = self.input.read_bit()?;
                            cursor = symtab.kid(cursor, usize::from(bit));
                        }
                        kind => {
                            return Err(Thrown::fatal(format!(
                                "Malformed binary encoding: {}",
                                kind.sexp_name()
                            )))
                        }
                    }
                };
                self.pop_and_return_read(value);
                Ok(())
            }
            NodeKind::BinaryAccept => {
                let value = symtab
                    .int_value(nd)
                    .ok_or_else(|| Thrown::fatal("binary.accept without a value"))?
                    .value;
                self.pop_and_return_read(value);
                Ok(())
            }
            NodeKind::Void => {
                let value = self.last_read_value;
                self.pop_and_return(value);
                Ok(())
            }
        }
    }

    fn step_eval_header(
        &mut self,
        frame: CallFrame,
        symtab: &SymbolTable,
        nd: NodeRef,
    ) -> TResult<()> {
        match frame.state {
            State::Enter => {
                if !self.catch.is_empty() {
                    self.catch.push_value(Method::Eval);
                }
                self.loop_counter.push_value(0);
                self.frames.top_mut().state = State::Loop;
                Ok(())
            }
            State::Loop => {
                let counter = *self.loop_counter.top() as usize;
                if counter >= symtab.num_kids(nd) {
                    self.frames.top_mut().state = State::Exit;
                    return Ok(());
                }
                *self.loop_counter.top_mut() += 1;
                let lit = symtab.kid(nd, counter);
                let value = symtab.int_value(lit).ok_or_else(|| {
                    Thrown::malformed("Literal header value expected, but not found")
                })?;
                let format = IntTypeFormat::from_kind(symtab.kind(lit)).ok_or_else(|| {
                    Thrown::malformed("Format header contains badly formed constant")
                })?;
                if frame.mode == Mode::WriteOnly {
                    // Declared output header: emit without matching.
                    self.output.write_header_value(value.value, format)?;
                    return Ok(());
                }
                let found = self.input.read_header_value(format)?;
                if value.value != found {
                    return Err(Thrown::bad_header(value.value, found));
                }
                if frame.mode.has_write() {
                    self.output.write_header_value(found, format)?;
                }
                Ok(())
            }
            State::Catch => {
                self.loop_counter.pop();
                self.pop_and_return(0);
                self.rethrow();
                Ok(())
            }
            State::Exit => {
                if !self.catch.is_empty() && *self.catch.top() == Method::Eval {
                    self.catch.pop();
                }
                self.loop_counter.pop();
                self.pop_and_return(0);
                Ok(())
            }
            _ => {
                self.fail_bad_state();
                Ok(())
            }
        }
    }

    fn step_eval_opcode(
        &mut self,
        frame: CallFrame,
        symtab: &SymbolTable,
        nd: NodeRef,
    ) -> TResult<()> {
        if frame.mode == Mode::WriteOnly {
            return self.step_write_opcode(frame, symtab, nd);
        }
        match frame.state {
            State::Enter => {
                self.opcode_locals.push_value(OpcodeFrame::default());
                self.frames.top_mut().state = State::Exit;
                self.call(Method::ReadOpcode, frame.mode, Some(nd));
                Ok(())
            }
            State::Exit => {
                self.opcode_locals.pop();
                self.pop_and_return_read(frame.return_value);
                Ok(())
            }
            _ => {
                self.fail_bad_state();
                Ok(())
            }
        }
    }

    /// Write-side opcode emission: split the value into selector and
    /// case payload using the installed case ranges.
    fn step_write_opcode(
        &mut self,
        frame: CallFrame,
        symtab: &SymbolTable,
        nd: NodeRef,
    ) -> TResult<()> {
        match frame.state {
            State::Enter => {
                let value = self.last_read_value;
                let (shift, mask, case) = match symtab.get_write_case(nd, value) {
                    Some(range) => (range.shift, range.mask(), Some(range.case)),
                    None => (0, 0, None),
                };
                self.opcode_locals.push_value(OpcodeFrame {
                    prefix: value,
                    sel_shift: shift,
                    case_mask: mask,
                });
                self.last_read_value = value >> shift;
                self.frames.top_mut().state = if case.is_some() {
                    State::Step2
                } else {
                    State::Exit
                };
                self.call(Method::Eval, Mode::WriteOnly, Some(symtab.kid(nd, 0)));
                Ok(())
            }
            State::Step2 => {
                let locals = *self.opcode_locals.top();
                let range = symtab
                    .get_write_case(nd, locals.prefix)
                    .ok_or_else(|| Thrown::fatal("Opcode write case disappeared"))?;
                self.last_read_value = locals.prefix & locals.case_mask;
                self.frames.top_mut().state = State::Exit;
                self.call(Method::Eval, Mode::WriteOnly, Some(symtab.kid(range.case, 1)));
                Ok(())
            }
            State::Exit => {
                let locals = *self.opcode_locals.top();
                self.opcode_locals.pop();
                self.last_read_value = locals.prefix;
                self.pop_and_return(locals.prefix);
                Ok(())
            }
            _ => {
                self.fail_bad_state();
                Ok(())
            }
        }
    }

    fn write_binary(&mut self, symtab: &SymbolTable, root: NodeRef, value: IntType) -> TResult<()> {
        // Depth-first search for the accept leaf, accumulating the path
        // (first branch choice in the least significant bit).
        let mut stack = vec![(root, 0u64, 0u32)];
        while let Some((nd, path, bits)) = stack.pop() {
            match symtab.kind(nd) {
                NodeKind::BinaryAccept => {
                    let accept = symtab
                        .int_value(nd)
                        .ok_or_else(|| Thrown::fatal("binary.accept without a value"))?
                        .value;
                    if accept == value {
                        self.output.write_bits(path, bits)?;
                        return Ok(());
                    }
                }
                NodeKind::BinarySelect => {
                    stack.push((symtab.kid(nd, 0), path, bits + 1));
                    stack.push((symtab.kid(nd, 1), path | (1 << bits), bits + 1));
                }
                kind => {
                    return Err(Thrown::fatal(format!(
                        "Malformed binary encoding: {}",
                        kind.sexp_name()
                    )))
                }
            }
        }
        Err(Thrown::new(
            ThrowKind::RangeError,
            format!("No binary encoding for value {value}"),
        ))
    }
}

impl std::fmt::Debug for Interpreter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let frame = self.frames.top();
        write!(
            f,
            "Interpreter {{ {}.{}, depth {} }}",
            frame.method.name(),
            frame.state.name(),
            self.frames.len()
        )
    }
}
