use std::cell::RefCell;
use std::rc::Rc;

use anyhow::{anyhow, Result};

use super::int_stream::{IntInput, IntOutput, IntStream, IntStreamRef};
use super::interpreter::Interpreter;
use crate::ast::{NodeRef, SymbolTable};

/// One candidate algorithm the interpreter may select by matching its
/// target header against the input.
pub trait AlgorithmSelector {
    /// The header AST to probe, together with the table owning it.
    fn target_header(&self) -> (Rc<SymbolTable>, NodeRef);

    /// Called once the header matched; installs the symbol table and
    /// may rewire the interpreter's streams.
    fn configure(&self, interp: &mut Interpreter) -> Result<()>;

    /// Called after the matched algorithm ran. Returning true means
    /// another algorithm was installed and `GetFile` should rerun.
    fn reset(&self, interp: &mut Interpreter) -> Result<bool>;
}

/// State shared by the selectors of one decompression run: the ordered
/// chain of algorithms still to apply and the stream plumbing between
/// them.
#[derive(Default)]
pub struct PipelineState {
    /// Algorithms queued behind the currently running one.
    pending: Vec<Rc<SymbolTable>>,
    /// Capture stream between the current stage and the next.
    intermediate: Option<IntStreamRef>,
    /// The caller's writer, reinstalled for the last stage.
    original_output: Option<Box<dyn super::StreamOutput>>,
}

/// Selector running a chain of algorithms pipelined through
/// intermediate integer streams: the first stage reads the input bytes,
/// every later stage reads the previous stage's capture, and the last
/// stage writes to the original output.
pub struct DecompressSelector {
    symtab: Rc<SymbolTable>,
    /// Probe target inside `symtab`, checked at construction.
    header: NodeRef,
    /// Stages queued after `symtab`, applied in order.
    rest: Vec<Rc<SymbolTable>>,
    state: Rc<RefCell<PipelineState>>,
}

impl DecompressSelector {
    /// Build a selector for an ordered algorithm chain. The chain must
    /// be non-empty; the first algorithm's header is the probe target.
    pub fn new(chain: Vec<Rc<SymbolTable>>) -> Result<Self> {
        let mut chain = chain.into_iter();
        let symtab = chain
            .next()
            .ok_or_else(|| anyhow!("Empty algorithm chain"))?;
        let header = symtab
            .target_header()
            .ok_or_else(|| anyhow!("Algorithm chain head declares no header"))?;
        Ok(Self {
            symtab,
            header,
            rest: chain.collect(),
            state: Rc::new(RefCell::new(PipelineState::default())),
        })
    }

    fn install_stage(
        &self,
        interp: &mut Interpreter,
        stage: Rc<SymbolTable>,
        stages_left: bool,
    ) {
        interp.set_symtab(Some(stage));
        let mut state = self.state.borrow_mut();
        if stages_left {
            // Capture this stage's output for the next stage to read.
            let stream = IntStream::new();
            let previous = interp.swap_output(Box::new(IntOutput::new(Rc::clone(&stream))));
            if state.original_output.is_none() {
                state.original_output = Some(previous);
            }
            state.intermediate = Some(stream);
        } else if let Some(original) = state.original_output.take() {
            interp.swap_output(original);
            state.intermediate = None;
        }
    }
}

impl AlgorithmSelector for DecompressSelector {
    fn target_header(&self) -> (Rc<SymbolTable>, NodeRef) {
        (Rc::clone(&self.symtab), self.header)
    }

    fn configure(&self, interp: &mut Interpreter) -> Result<()> {
        {
            let mut state = self.state.borrow_mut();
            state.pending = self.rest.clone();
        }
        let stages_left = !self.rest.is_empty();
        self.install_stage(interp, Rc::clone(&self.symtab), stages_left);
        Ok(())
    }

    fn reset(&self, interp: &mut Interpreter) -> Result<bool> {
        let next = {
            let mut state = self.state.borrow_mut();
            if state.pending.is_empty() {
                None
            } else {
                Some(state.pending.remove(0))
            }
        };
        let Some(next) = next else {
            // Chain finished; drop the algorithm so the driver checks
            // for further inputs.
            interp.set_symtab(None);
            return Ok(false);
        };
        // Rewire: the finished stage's capture becomes the next
        // stage's input.
        let stream = {
            let state = self.state.borrow();
            state
                .intermediate
                .clone()
                .ok_or_else(|| anyhow!("Pipeline stage finished without a capture stream"))?
        };
        interp.swap_input(Box::new(IntInput::new(stream)));
        let stages_left = !self.state.borrow().pending.is_empty();
        self.install_stage(interp, next, stages_left);
        Ok(true)
    }
}
