//! Display implementations and text dump for debugging.

use std::fmt;

use crate::func::{Function, Terminator};
use crate::inst::{AtomicOp, BinaryOp, InstKind, ReduceOp, ValueDef};
use crate::types::{ElemType, Scalar, ScalarKind, Type};

impl fmt::Display for Scalar {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.kind {
            ScalarKind::Void => write!(f, "void"),
            ScalarKind::Bool => write!(f, "bool"),
            ScalarKind::Sint => write!(f, "i{}", self.bits()),
            ScalarKind::Uint => write!(f, "u{}", self.bits()),
            ScalarKind::Float => write!(f, "f{}", self.bits()),
        }
    }
}

impl fmt::Display for Type {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.elem {
            ElemType::Scalar(s) => write!(f, "{s}")?,
            ElemType::Pointer(p) => write!(f, "{p}*")?,
        }
        if self.is_tile() {
            write!(f, "<")?;
            for (i, extent) in self.shape.iter().enumerate() {
                if i > 0 {
                    write!(f, "x")?;
                }
                write!(f, "{extent}")?;
            }
            write!(f, ">")?;
        }
        Ok(())
    }
}

impl fmt::Display for BinaryOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Add => "add",
            Self::Sub => "sub",
            Self::Mul => "mul",
            Self::Div => "div",
            Self::Max => "max",
            Self::Min => "min",
            Self::And => "and",
            Self::Or => "or",
        })
    }
}

impl fmt::Display for ReduceOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Sum => "sum",
            Self::Max => "max",
            Self::Min => "min",
        })
    }
}

impl fmt::Display for AtomicOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Add => "add",
            Self::Max => "max",
            Self::Min => "min",
            Self::Exchange => "xchg",
        })
    }
}

impl InstKind {
    /// Short mnemonic for dumps.
    pub fn mnemonic(&self) -> &'static str {
        match self {
            Self::Binary { .. } => "binary",
            Self::Splat { .. } => "splat",
            Self::Broadcast { .. } => "broadcast",
            Self::Dot { .. } => "dot",
            Self::Trans { .. } => "trans",
            Self::Reduce { .. } => "reduce",
            Self::Recoalesce { .. } => "recoalesce",
            Self::PtrAdd { .. } => "ptradd",
            Self::Load { .. } => "load",
            Self::MaskedLoad { .. } => "masked_load",
            Self::MaskedLoadAsync { .. } => "masked_load_async",
            Self::Store { .. } => "store",
            Self::CopyToShared { .. } => "copy_to_shared",
            Self::AtomicRmw { .. } => "atomic",
            Self::Phi { .. } => "phi",
            Self::Barrier => "barrier",
            Self::AsyncWait { .. } => "async_wait",
        }
    }
}

/// Renders a function as text, one instruction per line.
pub fn dump_function(func: &Function) -> String {
    use std::fmt::Write;

    let mut out = String::new();
    write!(out, "fn {}(", func.name).ok();
    for (i, &arg) in func.arguments.iter().enumerate() {
        if i > 0 {
            out.push_str(", ");
        }
        let value = &func.values[arg];
        let name = value.name.as_deref().unwrap_or("_");
        write!(out, "{}: {}", name, value.ty).ok();
    }
    out.push_str(") {\n");

    for (handle, block) in func.blocks.iter() {
        let label = block.name.as_deref().unwrap_or("bb");
        writeln!(out, "{label}{}:", handle.index()).ok();
        for &inst in &block.insts {
            let value = &func.values[inst];
            let ValueDef::Inst(kind) = &value.def else {
                continue;
            };
            write!(out, "  %{} = {}", inst.index(), kind.mnemonic()).ok();
            match kind {
                InstKind::Binary { op, .. } => {
                    write!(out, ".{op}").ok();
                }
                InstKind::Reduce { op, axis, .. } => {
                    write!(out, ".{op} axis={axis}").ok();
                }
                InstKind::AtomicRmw { op, .. } => {
                    write!(out, ".{op}").ok();
                }
                InstKind::AsyncWait { n } => {
                    write!(out, " {n}").ok();
                }
                _ => {}
            }
            for (i, op) in kind.operands().iter().enumerate() {
                write!(out, "{} %{}", if i == 0 { "" } else { "," }, op.index()).ok();
            }
            writeln!(out, " : {}", value.ty).ok();
        }
        match &block.terminator {
            Some(Terminator::Branch { dest }) => {
                writeln!(out, "  br bb{}", dest.index()).ok();
            }
            Some(Terminator::CondBranch {
                cond,
                then_dest,
                else_dest,
            }) => {
                writeln!(
                    out,
                    "  condbr %{} bb{} bb{}",
                    cond.index(),
                    then_dest.index(),
                    else_dest.index()
                )
                .ok();
            }
            Some(Terminator::Return { value }) => {
                match value {
                    Some(v) => writeln!(out, "  ret %{}", v.index()),
                    None => writeln!(out, "  ret"),
                }
                .ok();
            }
            None => {
                writeln!(out, "  <unterminated>").ok();
            }
        }
    }
    out.push_str("}\n");
    out
}
