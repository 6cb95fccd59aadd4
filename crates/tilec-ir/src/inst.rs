//! Values and the closed instruction taxonomy.
//!
//! Every SSA value is either a function argument or the result of an
//! instruction. [`InstKind`] is a closed sum type: passes match on it
//! exhaustively or narrow through the `as_*` accessors, which return
//! `None` on mismatch instead of downcasting.

use crate::arena::Handle;
use crate::func::BasicBlock;
use crate::types::{ArgAlign, Type};

/// A binary elementwise operation.
#[derive(Clone, Copy, Debug, Hash, Eq, PartialEq)]
pub enum BinaryOp {
    Add,
    Sub,
    Mul,
    Div,
    Max,
    Min,
    And,
    Or,
}

/// A reduction operation across one tile axis.
#[derive(Clone, Copy, Debug, Hash, Eq, PartialEq)]
pub enum ReduceOp {
    Sum,
    Max,
    Min,
}

/// An atomic read-modify-write operation.
#[derive(Clone, Copy, Debug, Hash, Eq, PartialEq)]
pub enum AtomicOp {
    Add,
    Max,
    Min,
    Exchange,
}

/// An SSA value: a type plus its definition.
#[derive(Clone, Debug)]
pub struct Value {
    /// Optional name for diagnostics and dumps.
    pub name: Option<String>,
    /// The value's type.
    pub ty: Type,
    /// How the value is defined.
    pub def: ValueDef,
}

/// The definition of a [`Value`].
#[derive(Clone, Debug)]
pub enum ValueDef {
    /// A formal parameter of the function.
    Argument {
        /// Position in the argument list.
        index: u32,
        /// Contiguity/alignment attributes for pointer arguments.
        align: Option<ArgAlign>,
    },
    /// The result of an instruction.
    Inst(InstKind),
}

/// The closed instruction taxonomy.
#[derive(Clone, Debug)]
pub enum InstKind {
    /// Elementwise binary operation on tiles or scalars.
    Binary {
        op: BinaryOp,
        lhs: Handle<Value>,
        rhs: Handle<Value>,
    },
    /// Replicate a scalar into a tile.
    Splat { src: Handle<Value> },
    /// Expand size-1 dimensions of a tile to the result shape.
    Broadcast { src: Handle<Value> },
    /// Matrix-multiply-accumulate: `a @ b + c`.
    Dot {
        a: Handle<Value>,
        b: Handle<Value>,
        c: Handle<Value>,
    },
    /// Transpose (reverse the tile axes).
    Trans { src: Handle<Value> },
    /// Reduce one axis of a tile.
    Reduce {
        op: ReduceOp,
        src: Handle<Value>,
        axis: u32,
    },
    /// Reshuffle an MMA-resident tile into scanline-distributed form.
    Recoalesce { src: Handle<Value> },
    /// Pointer arithmetic: `base + offset`, elementwise.
    PtrAdd {
        base: Handle<Value>,
        offset: Handle<Value>,
    },
    /// Load a tile through a tile of pointers.
    Load { ptr: Handle<Value> },
    /// Load with a per-element predicate and fallback value.
    MaskedLoad {
        ptr: Handle<Value>,
        mask: Handle<Value>,
        fallback: Handle<Value>,
    },
    /// Asynchronous masked load targeting shared memory; completes
    /// independently of the issuing thread and must be waited on.
    MaskedLoadAsync {
        ptr: Handle<Value>,
        mask: Handle<Value>,
        fallback: Handle<Value>,
    },
    /// Store a tile through a tile of pointers.
    Store {
        ptr: Handle<Value>,
        value: Handle<Value>,
    },
    /// Stage a register-resident tile into shared memory.
    CopyToShared { src: Handle<Value> },
    /// Atomic read-modify-write through a pointer.
    AtomicRmw {
        op: AtomicOp,
        ptr: Handle<Value>,
        value: Handle<Value>,
    },
    /// Control-flow merge of per-predecessor incoming values.
    Phi {
        incoming: Vec<(Handle<BasicBlock>, Handle<Value>)>,
    },
    /// Block all threads until every thread in the block arrives.
    Barrier,
    /// Wait until at most `n` asynchronous copies remain outstanding.
    AsyncWait { n: u32 },
}

impl InstKind {
    /// All value operands, in order.
    pub fn operands(&self) -> Vec<Handle<Value>> {
        match *self {
            Self::Binary { lhs, rhs, .. } => vec![lhs, rhs],
            Self::Splat { src }
            | Self::Broadcast { src }
            | Self::Trans { src }
            | Self::Recoalesce { src }
            | Self::CopyToShared { src } => vec![src],
            Self::Dot { a, b, c } => vec![a, b, c],
            Self::Reduce { src, .. } => vec![src],
            Self::PtrAdd { base, offset } => vec![base, offset],
            Self::Load { ptr } => vec![ptr],
            Self::MaskedLoad {
                ptr,
                mask,
                fallback,
            }
            | Self::MaskedLoadAsync {
                ptr,
                mask,
                fallback,
            } => vec![ptr, mask, fallback],
            Self::Store { ptr, value } => vec![ptr, value],
            Self::AtomicRmw { ptr, value, .. } => vec![ptr, value],
            Self::Phi { ref incoming } => incoming.iter().map(|&(_, v)| v).collect(),
            Self::Barrier | Self::AsyncWait { .. } => Vec::new(),
        }
    }

    /// Replaces every operand equal to `old` with `new`. Returns `true`
    /// if any operand was rewritten.
    pub fn replace_operand(&mut self, old: Handle<Value>, new: Handle<Value>) -> bool {
        if old == new {
            return false;
        }
        let mut changed = false;
        let mut rep = |h: &mut Handle<Value>| {
            if *h == old {
                *h = new;
                changed = true;
            }
        };
        match self {
            Self::Binary { lhs, rhs, .. } => {
                rep(lhs);
                rep(rhs);
            }
            Self::Splat { src }
            | Self::Broadcast { src }
            | Self::Trans { src }
            | Self::Recoalesce { src }
            | Self::CopyToShared { src }
            | Self::Reduce { src, .. } => rep(src),
            Self::Dot { a, b, c } => {
                rep(a);
                rep(b);
                rep(c);
            }
            Self::PtrAdd { base, offset } => {
                rep(base);
                rep(offset);
            }
            Self::Load { ptr } => rep(ptr),
            Self::MaskedLoad {
                ptr,
                mask,
                fallback,
            }
            | Self::MaskedLoadAsync {
                ptr,
                mask,
                fallback,
            } => {
                rep(ptr);
                rep(mask);
                rep(fallback);
            }
            Self::Store { ptr, value } => {
                rep(ptr);
                rep(value);
            }
            Self::AtomicRmw { ptr, value, .. } => {
                rep(ptr);
                rep(value);
            }
            Self::Phi { incoming } => {
                for (_, v) in incoming.iter_mut() {
                    rep(v);
                }
            }
            Self::Barrier | Self::AsyncWait { .. } => {}
        }
        changed
    }

    /// The pointer operand of memory instructions, if any.
    pub fn pointer_operand(&self) -> Option<Handle<Value>> {
        match *self {
            Self::Load { ptr }
            | Self::MaskedLoad { ptr, .. }
            | Self::MaskedLoadAsync { ptr, .. }
            | Self::Store { ptr, .. }
            | Self::AtomicRmw { ptr, .. } => Some(ptr),
            _ => None,
        }
    }

    /// Narrows to a phi's incoming list.
    pub fn as_phi(&self) -> Option<&[(Handle<BasicBlock>, Handle<Value>)]> {
        match self {
            Self::Phi { incoming } => Some(incoming),
            _ => None,
        }
    }

    /// Narrows to a dot's `(a, b, c)` operands.
    pub fn as_dot(&self) -> Option<(Handle<Value>, Handle<Value>, Handle<Value>)> {
        match *self {
            Self::Dot { a, b, c } => Some((a, b, c)),
            _ => None,
        }
    }

    /// Narrows to an async wait's permitted outstanding count.
    pub fn as_async_wait(&self) -> Option<u32> {
        match *self {
            Self::AsyncWait { n } => Some(n),
            _ => None,
        }
    }

    pub fn is_barrier(&self) -> bool {
        matches!(self, Self::Barrier)
    }

    pub fn is_trans(&self) -> bool {
        matches!(self, Self::Trans { .. })
    }

    pub fn is_copy_to_shared(&self) -> bool {
        matches!(self, Self::CopyToShared { .. })
    }

    pub fn is_masked_load_async(&self) -> bool {
        matches!(self, Self::MaskedLoadAsync { .. })
    }

    /// Returns `true` for instructions that stage data into shared memory.
    pub fn writes_shared(&self) -> bool {
        self.is_copy_to_shared() || self.is_masked_load_async()
    }

    /// Returns `true` for instructions with observable side effects, which
    /// dead-code elimination must keep even when the result is unused.
    pub fn has_side_effect(&self) -> bool {
        matches!(
            self,
            Self::Store { .. } | Self::AtomicRmw { .. } | Self::Barrier | Self::AsyncWait { .. }
        )
    }
}

impl Value {
    /// The instruction kind if this value is an instruction result.
    pub fn inst(&self) -> Option<&InstKind> {
        match &self.def {
            ValueDef::Inst(kind) => Some(kind),
            ValueDef::Argument { .. } => None,
        }
    }

    /// Returns `true` if this value is defined by an instruction.
    pub fn is_inst(&self) -> bool {
        matches!(self.def, ValueDef::Inst(_))
    }
}
