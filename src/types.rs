use std::fmt;

use thiserror::Error;

/// Identifier attached to every emitted runtime call.
pub type Id = i32;

/// Statement identifier; also used as a branch identifier (the id of the
/// successor statement a conditional selects).
pub type StmtId = i32;

pub type FunctionId = u32;

/// Symbolic input variable.
pub type VarId = u32;

/// Concrete witness carried by every expression node, interpreted
/// according to the node's size in bytes.
pub type Value = i64;

/// Machine address.
pub type Addr = u64;

/// Virtual branch ids marking function calls and returns in a trace.
pub const CALL_ID: StmtId = -1;
pub const RETURN_ID: StmtId = -2;

/// Byte ordering assumed for concatenation and byte extraction.
pub const BIG_ENDIAN: bool = cfg!(feature = "big-endian");

#[derive(Debug, Error)]
#[error("unknown operator code {0:#x}")]
pub struct BadOpCode(pub u8);

#[derive(Debug, Error)]
#[error("unknown type code {0}")]
pub struct BadTypeCode(pub i32);

/// Comparison operators. Codes live in the shared runtime op-code space
/// together with [`BinaryOp`], [`PointerOp`] and [`UnaryOp`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum CompareOp {
    Eq = 24,
    Neq = 25,
    Gt = 26,
    Le = 27,
    Lt = 28,
    Ge = 29,
    SGt = 30,
    SLe = 31,
    SLt = 32,
    SGe = 33,
}

impl CompareOp {
    /// The complementary comparison: exactly one of `op`, `op.negate()`
    /// holds for any pair of operands.
    pub fn negate(self) -> CompareOp {
        match self {
            CompareOp::Eq => CompareOp::Neq,
            CompareOp::Neq => CompareOp::Eq,
            CompareOp::Gt => CompareOp::Le,
            CompareOp::Le => CompareOp::Gt,
            CompareOp::Lt => CompareOp::Ge,
            CompareOp::Ge => CompareOp::Lt,
            CompareOp::SGt => CompareOp::SLe,
            CompareOp::SLe => CompareOp::SGt,
            CompareOp::SLt => CompareOp::SGe,
            CompareOp::SGe => CompareOp::SLt,
        }
    }

    pub fn is_signed(self) -> bool {
        matches!(
            self,
            CompareOp::SGt | CompareOp::SLe | CompareOp::SLt | CompareOp::SGe
        )
    }

    pub fn try_from(code: u8) -> Result<CompareOp, BadOpCode> {
        Ok(match code {
            24 => CompareOp::Eq,
            25 => CompareOp::Neq,
            26 => CompareOp::Gt,
            27 => CompareOp::Le,
            28 => CompareOp::Lt,
            29 => CompareOp::Ge,
            30 => CompareOp::SGt,
            31 => CompareOp::SLe,
            32 => CompareOp::SLt,
            33 => CompareOp::SGe,
            c => return Err(BadOpCode(c)),
        })
    }
}

impl fmt::Display for CompareOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            CompareOp::Eq => "==",
            CompareOp::Neq => "!=",
            CompareOp::Gt => ">",
            CompareOp::Le => "<=",
            CompareOp::Lt => "<",
            CompareOp::Ge => ">=",
            CompareOp::SGt => "s>",
            CompareOp::SLe => "s<=",
            CompareOp::SLt => "s<",
            CompareOp::SGe => "s>=",
        })
    }
}

/// Binary operators over values. `Concrete` is the fallback code emitted
/// for C operators the front end cannot track symbolically; `Concat` and
/// `Extract` occur only inside expression trees, never in emitted calls.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum BinaryOp {
    Add = 0,
    Sub = 1,
    Mul = 2,
    Div = 3,
    SDiv = 4,
    Mod = 5,
    SMod = 6,
    Shl = 7,
    Shr = 8,
    SShr = 9,
    BitAnd = 10,
    BitOr = 11,
    BitXor = 12,
    Concrete = 18,
    Concat = 34,
    Extract = 35,
}

impl BinaryOp {
    pub fn try_from(code: u8) -> Result<BinaryOp, BadOpCode> {
        Ok(match code {
            0 => BinaryOp::Add,
            1 => BinaryOp::Sub,
            2 => BinaryOp::Mul,
            3 => BinaryOp::Div,
            4 => BinaryOp::SDiv,
            5 => BinaryOp::Mod,
            6 => BinaryOp::SMod,
            7 => BinaryOp::Shl,
            8 => BinaryOp::Shr,
            9 => BinaryOp::SShr,
            10 => BinaryOp::BitAnd,
            11 => BinaryOp::BitOr,
            12 => BinaryOp::BitXor,
            18 => BinaryOp::Concrete,
            34 => BinaryOp::Concat,
            35 => BinaryOp::Extract,
            c => return Err(BadOpCode(c)),
        })
    }
}

impl fmt::Display for BinaryOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            BinaryOp::Add => "+",
            BinaryOp::Sub => "-",
            BinaryOp::Mul => "*",
            BinaryOp::Div => "/",
            BinaryOp::SDiv => "s/",
            BinaryOp::Mod => "%",
            BinaryOp::SMod => "s%",
            BinaryOp::Shl => "<<",
            BinaryOp::Shr => ">>",
            BinaryOp::SShr => "s>>",
            BinaryOp::BitAnd => "&",
            BinaryOp::BitOr => "|",
            BinaryOp::BitXor => "^",
            BinaryOp::Concrete => "concrete",
            BinaryOp::Concat => "++",
            BinaryOp::Extract => "ext",
        })
    }
}

/// Pointer arithmetic operators; the second operand is scaled by the
/// element size passed alongside the code.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum PointerOp {
    AddPI = 13,
    SAddPI = 14,
    SubPI = 15,
    SSubPI = 16,
    SubPP = 17,
}

impl PointerOp {
    pub fn try_from(code: u8) -> Result<PointerOp, BadOpCode> {
        Ok(match code {
            13 => PointerOp::AddPI,
            14 => PointerOp::SAddPI,
            15 => PointerOp::SubPI,
            16 => PointerOp::SSubPI,
            17 => PointerOp::SubPP,
            c => return Err(BadOpCode(c)),
        })
    }
}

impl fmt::Display for PointerOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            PointerOp::AddPI => "+p",
            PointerOp::SAddPI => "s+p",
            PointerOp::SubPI => "-p",
            PointerOp::SSubPI => "s-p",
            PointerOp::SubPP => "-pp",
        })
    }
}

/// Unary operators. `UnsignedCast` (code 22) is the single cast code the
/// instrumenter emits; the runtime derives signedness from the destination
/// type code.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum UnaryOp {
    Negate = 19,
    LogicalNot = 20,
    BitwiseNot = 21,
    UnsignedCast = 22,
    SignedCast = 23,
}

impl UnaryOp {
    pub fn try_from(code: u8) -> Result<UnaryOp, BadOpCode> {
        Ok(match code {
            19 => UnaryOp::Negate,
            20 => UnaryOp::LogicalNot,
            21 => UnaryOp::BitwiseNot,
            22 => UnaryOp::UnsignedCast,
            23 => UnaryOp::SignedCast,
            c => return Err(BadOpCode(c)),
        })
    }
}

impl fmt::Display for UnaryOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            UnaryOp::Negate => "-",
            UnaryOp::LogicalNot => "!",
            UnaryOp::BitwiseNot => "~",
            UnaryOp::UnsignedCast => "u-cast",
            UnaryOp::SignedCast => "s-cast",
        })
    }
}

/// C numeric type codes shared between the instrumenter and the runtime.
/// `U128` is reserved; `Aggregate` covers arrays, structs and unions,
/// which are tracked as sized opaque blobs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(i32)]
pub enum CType {
    Bool = -1,
    U8 = 0,
    I8 = 1,
    U16 = 2,
    I16 = 3,
    U32 = 4,
    I32 = 5,
    U64 = 6,
    I64 = 7,
    U128 = 8,
    Aggregate = 9,
}

impl CType {
    pub fn size_of(self) -> usize {
        match self {
            CType::Bool | CType::U8 | CType::I8 => 1,
            CType::U16 | CType::I16 => 2,
            CType::U32 | CType::I32 => 4,
            CType::U64 | CType::I64 => 8,
            CType::U128 => 16,
            // Aggregates carry an explicit size everywhere they occur.
            CType::Aggregate => 0,
        }
    }

    /// Smallest representable value. Unsigned types bottom out at zero.
    pub fn min_value(self) -> Value {
        match self {
            CType::Bool | CType::U8 | CType::U16 | CType::U32 | CType::U64 | CType::U128 => 0,
            CType::I8 => i8::MIN as Value,
            CType::I16 => i16::MIN as Value,
            CType::I32 => i32::MIN as Value,
            CType::I64 => i64::MIN,
            CType::Aggregate => 0,
        }
    }

    /// Largest representable value, clamped to the witness width for the
    /// 64-bit-and-up unsigned types.
    pub fn max_value(self) -> Value {
        match self {
            CType::Bool => 1,
            CType::U8 => u8::MAX as Value,
            CType::I8 => i8::MAX as Value,
            CType::U16 => u16::MAX as Value,
            CType::I16 => i16::MAX as Value,
            CType::U32 => u32::MAX as Value,
            CType::I32 => i32::MAX as Value,
            CType::U64 | CType::I64 | CType::U128 => i64::MAX,
            CType::Aggregate => 0,
        }
    }

    pub fn is_signed(self) -> bool {
        matches!(self, CType::I8 | CType::I16 | CType::I32 | CType::I64)
    }

    pub fn try_from(code: i32) -> Result<CType, BadTypeCode> {
        Ok(match code {
            -1 => CType::Bool,
            0 => CType::U8,
            1 => CType::I8,
            2 => CType::U16,
            3 => CType::I16,
            4 => CType::U32,
            5 => CType::I32,
            6 => CType::U64,
            7 => CType::I64,
            8 => CType::U128,
            9 => CType::Aggregate,
            c => return Err(BadTypeCode(c)),
        })
    }
}
