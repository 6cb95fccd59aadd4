//! tilec intermediate representation.
//!
//! An arena-based SSA IR for tile-structured tensor kernels. Values live in
//! per-function arenas and are addressed by typed [`Handle`]s; instructions
//! form a closed sum type ([`InstKind`]) so that passes can match on the full
//! taxonomy instead of downcasting. Control flow is explicit: functions are
//! made of basic blocks with terminators, and phi nodes merge loop-carried
//! values.

pub mod arena;
pub mod cfg;
mod display;
mod edit;
mod error;
mod func;
mod inst;
mod target;
mod types;

pub use arena::{Arena, Handle, HandleMap};
pub use display::dump_function;
pub use edit::EditList;
pub use error::IrError;
pub use func::{BasicBlock, Function, Module, Terminator};
pub use inst::{AtomicOp, BinaryOp, InstKind, ReduceOp, Value, ValueDef};
pub use target::{Target, TensorCoreGen};
pub use types::{ArgAlign, Bytes, ElemType, Scalar, ScalarKind, Type};
