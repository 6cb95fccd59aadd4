//! Type system for the tile IR.
//!
//! Every value is either a scalar or a tile: a block-shaped array with a
//! rank and per-dimension extents, distributed across hardware execution
//! units. Tiles of pointers are how memory instructions address global
//! memory.

/// Width of a scalar type in bytes.
pub type Bytes = u8;

/// The kind of a scalar type.
#[derive(Clone, Copy, Debug, Hash, Eq, PartialEq, Ord, PartialOrd)]
pub enum ScalarKind {
    /// No value (result type of pure side-effect instructions).
    Void,
    /// Boolean.
    Bool,
    /// Signed integer.
    Sint,
    /// Unsigned integer.
    Uint,
    /// Floating point.
    Float,
}

/// A scalar type: kind + byte width.
#[derive(Clone, Copy, Debug, Hash, Eq, PartialEq, Ord, PartialOrd)]
pub struct Scalar {
    pub kind: ScalarKind,
    pub width: Bytes,
}

impl Scalar {
    pub const VOID: Self = Self {
        kind: ScalarKind::Void,
        width: 0,
    };
    pub const BOOL: Self = Self {
        kind: ScalarKind::Bool,
        width: 1,
    };
    pub const I32: Self = Self {
        kind: ScalarKind::Sint,
        width: 4,
    };
    pub const U32: Self = Self {
        kind: ScalarKind::Uint,
        width: 4,
    };
    pub const F16: Self = Self {
        kind: ScalarKind::Float,
        width: 2,
    };
    pub const F32: Self = Self {
        kind: ScalarKind::Float,
        width: 4,
    };

    /// Returns `true` for the half-precision float type.
    pub fn is_half(self) -> bool {
        self.kind == ScalarKind::Float && self.width == 2
    }

    /// Size of this scalar in bits.
    pub fn bits(self) -> u32 {
        self.width as u32 * 8
    }
}

/// The element of a type: plain data or a pointer to data.
#[derive(Clone, Copy, Debug, Hash, Eq, PartialEq)]
pub enum ElemType {
    /// A data element.
    Scalar(Scalar),
    /// A pointer to elements of the given scalar type.
    Pointer(Scalar),
}

/// A value type: an element type plus a (possibly empty) tile shape.
///
/// An empty shape means the value is a single scalar; a non-empty shape
/// means a tile with one extent per dimension. Tile-shaped values are the
/// only ones layouts are computed for.
#[derive(Clone, Debug, Hash, Eq, PartialEq)]
pub struct Type {
    pub elem: ElemType,
    pub shape: Vec<u32>,
}

impl Type {
    /// Result type of instructions that produce no value.
    pub const VOID: Self = Self {
        elem: ElemType::Scalar(Scalar::VOID),
        shape: Vec::new(),
    };

    /// A scalar type with no tile shape.
    pub fn scalar(scalar: Scalar) -> Self {
        Self {
            elem: ElemType::Scalar(scalar),
            shape: Vec::new(),
        }
    }

    /// A tile of data elements.
    pub fn tile(scalar: Scalar, shape: Vec<u32>) -> Self {
        Self {
            elem: ElemType::Scalar(scalar),
            shape,
        }
    }

    /// A tile of pointers to the given element type.
    pub fn ptr_tile(pointee: Scalar, shape: Vec<u32>) -> Self {
        Self {
            elem: ElemType::Pointer(pointee),
            shape,
        }
    }

    /// Returns `true` if this is a tile (block-shaped) type.
    pub fn is_tile(&self) -> bool {
        !self.shape.is_empty()
    }

    /// Returns `true` if the element is a pointer.
    pub fn is_pointer(&self) -> bool {
        matches!(self.elem, ElemType::Pointer(_))
    }

    /// Number of tile dimensions (0 for scalars).
    pub fn rank(&self) -> usize {
        self.shape.len()
    }

    /// Total number of tile elements (1 for scalars).
    pub fn num_elements(&self) -> u64 {
        self.shape.iter().map(|&s| s as u64).product()
    }

    /// The data scalar this type ultimately refers to: the element scalar,
    /// or the pointee for pointer types.
    pub fn element_scalar(&self) -> Scalar {
        match self.elem {
            ElemType::Scalar(s) => s,
            ElemType::Pointer(p) => p,
        }
    }
}

/// Per-axis contiguity and alignment attributes of a pointer argument,
/// declared by the front-end and consumed by the alignment analysis.
#[derive(Clone, Debug, Default)]
pub struct ArgAlign {
    /// Number of elements known contiguous along each axis.
    pub contiguous: Vec<u32>,
    /// Element-count alignment of addresses along each axis.
    pub aligned: Vec<u32>,
}
