//! Functions, basic blocks, and modules.

use crate::arena::{Arena, Handle};
use crate::error::IrError;
use crate::inst::{InstKind, Value, ValueDef};
use crate::types::{ArgAlign, Type};

/// How control leaves a basic block. The taxonomy is closed: passes that
/// classify terminators match exhaustively.
#[derive(Clone, Debug)]
pub enum Terminator {
    /// Unconditional jump.
    Branch { dest: Handle<BasicBlock> },
    /// Two-way conditional jump.
    CondBranch {
        cond: Handle<Value>,
        then_dest: Handle<BasicBlock>,
        else_dest: Handle<BasicBlock>,
    },
    /// Return from the kernel.
    Return { value: Option<Handle<Value>> },
}

impl Terminator {
    /// Successor blocks, in order.
    pub fn successors(&self) -> Vec<Handle<BasicBlock>> {
        match *self {
            Self::Branch { dest } => vec![dest],
            Self::CondBranch {
                then_dest,
                else_dest,
                ..
            } => vec![then_dest, else_dest],
            Self::Return { .. } => Vec::new(),
        }
    }
}

/// A basic block: a straight-line instruction sequence plus a terminator.
#[derive(Clone, Debug, Default)]
pub struct BasicBlock {
    /// Optional label for dumps.
    pub name: Option<String>,
    /// Instruction results in program order.
    pub insts: Vec<Handle<Value>>,
    /// How control leaves this block; `None` until the block is finished.
    pub terminator: Option<Terminator>,
}

/// A single kernel function.
#[derive(Clone, Debug)]
pub struct Function {
    /// Kernel name.
    pub name: String,
    /// All SSA values (arguments and instruction results).
    pub values: Arena<Value>,
    /// All basic blocks.
    pub blocks: Arena<BasicBlock>,
    /// The entry block (the first block added).
    pub entry: Option<Handle<BasicBlock>>,
    /// Formal parameters, in declaration order.
    pub arguments: Vec<Handle<Value>>,
}

impl Function {
    /// Creates an empty function with the given name.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            values: Arena::new(),
            blocks: Arena::new(),
            entry: None,
            arguments: Vec::new(),
        }
    }

    /// Declares a formal parameter and returns its value handle.
    pub fn add_argument(
        &mut self,
        name: impl Into<String>,
        ty: Type,
        align: Option<ArgAlign>,
    ) -> Handle<Value> {
        let index = self.arguments.len() as u32;
        let handle = self.values.append(Value {
            name: Some(name.into()),
            ty,
            def: ValueDef::Argument { index, align },
        });
        self.arguments.push(handle);
        handle
    }

    /// Adds a basic block; the first block added becomes the entry.
    pub fn add_block(&mut self, name: impl Into<String>) -> Handle<BasicBlock> {
        let handle = self.blocks.append(BasicBlock {
            name: Some(name.into()),
            insts: Vec::new(),
            terminator: None,
        });
        if self.entry.is_none() {
            self.entry = Some(handle);
        }
        handle
    }

    /// Appends an instruction to a block and returns its result value.
    pub fn add_inst(
        &mut self,
        block: Handle<BasicBlock>,
        kind: InstKind,
        ty: Type,
    ) -> Handle<Value> {
        let handle = self.values.append(Value {
            name: None,
            ty,
            def: ValueDef::Inst(kind),
        });
        self.blocks[block].insts.push(handle);
        handle
    }

    /// Creates an instruction value without placing it in any block.
    ///
    /// Used by the staged-edit protocol: the value is materialized first and
    /// spliced into an instruction list afterwards.
    pub fn make_inst(&mut self, kind: InstKind, ty: Type) -> Handle<Value> {
        self.values.append(Value {
            name: None,
            ty,
            def: ValueDef::Inst(kind),
        })
    }

    /// Sets the terminator of a block.
    pub fn set_terminator(&mut self, block: Handle<BasicBlock>, terminator: Terminator) {
        self.blocks[block].terminator = Some(terminator);
    }

    /// Checks structural invariants: an entry exists, every block is
    /// terminated, and phi incoming edges come from actual predecessors.
    pub fn validate(&self) -> Result<(), IrError> {
        if self.entry.is_none() {
            return Err(IrError::NoEntryBlock {
                function: self.name.clone(),
            });
        }
        for (handle, block) in self.blocks.iter() {
            if block.terminator.is_none() {
                return Err(IrError::NoTerminator {
                    block: handle.index(),
                });
            }
        }
        let preds = crate::cfg::predecessors(self);
        for (handle, block) in self.blocks.iter() {
            let block_preds = preds.get(handle).map(Vec::as_slice).unwrap_or(&[]);
            for &inst in &block.insts {
                let Some(incoming) = self.values[inst].inst().and_then(InstKind::as_phi) else {
                    continue;
                };
                for &(pred, _) in incoming {
                    if !block_preds.contains(&pred) {
                        return Err(IrError::BadPhiIncoming {
                            block: handle.index(),
                            pred: pred.index(),
                        });
                    }
                }
            }
        }
        Ok(())
    }
}

/// A compiled module: one or more kernels.
#[derive(Clone, Debug, Default)]
pub struct Module {
    /// Module name.
    pub name: String,
    /// Kernel functions.
    pub functions: Vec<Function>,
}
