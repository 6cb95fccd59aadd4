//! Analyses for the tilec middle-end: axis equivalence, pointer alignment,
//! layout inference, shared-memory liveness and offset allocation.

pub mod align;
pub mod allocation;
pub mod axes;
pub mod layout;
pub mod liveness;
pub mod union_find;

pub use align::Align;
pub use allocation::Allocation;
pub use axes::{Axes, AxisId};
pub use layout::{
    DotOperand, DoubleBufferInfo, Layout, LayoutBase, LayoutError, LayoutId, Layouts, MmaLayout,
    ScanlineLayout, SharedLayout,
};
pub use liveness::{Liveness, Segment};
pub use union_find::ValueGraph;
