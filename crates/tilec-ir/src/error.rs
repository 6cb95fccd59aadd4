//! Error types for the tile IR.

/// Errors that can occur when constructing or validating IR.
#[derive(Debug, thiserror::Error)]
pub enum IrError {
    /// A function has no entry block.
    #[error("function '{function}' has no entry block")]
    NoEntryBlock { function: String },

    /// A basic block is missing a terminator.
    #[error("basic block {block} has no terminator")]
    NoTerminator { block: usize },

    /// A phi node has an incoming edge from a non-predecessor block.
    #[error("phi in block {block} has an incoming edge from non-predecessor {pred}")]
    BadPhiIncoming { block: usize, pred: usize },
}
