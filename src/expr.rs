//! Symbolic expression trees.
//!
//! Every node records the concrete witness observed while the subject
//! program ran, alongside the symbolic shape of the computation that
//! produced it. Construction never evaluates; the runtime shims have
//! already computed the concrete result and the factories only record it.
//!
//! Nodes are hash-consed: structurally equal trees share one allocation
//! and equality is a pointer comparison. Sharing does not change the wire
//! format.

use std::fmt;
use std::io::{self, Read};

use fxhash::{FxHashMap, FxHashSet};
use hashconsing::{consign, HConsed, HashConsign};
use thiserror::Error;

use crate::object::SymbolicObject;
use crate::types::{
    Addr, BadOpCode, BinaryOp, CType, CompareOp, UnaryOp, Value, VarId, BIG_ENDIAN,
};

consign! {
    let EXPR = consign(16 * 1024) for Expr;
}

const TAG_BASIC: u8 = 0;
const TAG_COMPARE: u8 = 1;
const TAG_BINARY: u8 = 2;
const TAG_UNARY: u8 = 3;
const TAG_DEREF: u8 = 4;
const TAG_CONST: u8 = 5;

#[derive(Debug, Error)]
pub enum ParseError {
    #[error("truncated expression")]
    Truncated(#[from] io::Error),
    #[error("unknown node tag {0:#x}")]
    BadTag(u8),
    #[error(transparent)]
    BadOp(#[from] BadOpCode),
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
#[repr(transparent)]
pub struct SymExpr(HConsed<Expr>);

impl std::ops::Deref for SymExpr {
    type Target = Expr;

    fn deref(&self) -> &Expr {
        &*self.0
    }
}

impl From<Expr> for SymExpr {
    fn from(e: Expr) -> Self {
        Self(EXPR.mk(e))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Expr {
    Concrete {
        size: usize,
        value: Value,
    },
    Basic {
        size: usize,
        value: Value,
        var: VarId,
    },
    Unary {
        size: usize,
        value: Value,
        op: UnaryOp,
        child: SymExpr,
    },
    Binary {
        size: usize,
        value: Value,
        op: BinaryOp,
        left: SymExpr,
        right: SymExpr,
    },
    Compare {
        size: usize,
        value: Value,
        op: CompareOp,
        left: SymExpr,
        right: SymExpr,
    },
    Deref {
        size: usize,
        value: Value,
        object: SymbolicObject,
        addr: SymExpr,
        bytes: Vec<u8>,
    },
}

/// All-ones mask covering `size` bytes of a 64-bit word.
pub(crate) fn byte_mask(size: usize) -> u64 {
    if size >= 8 {
        u64::MAX
    } else {
        (1u64 << (8 * size)) - 1
    }
}

fn truncate(value: Value, size: usize) -> Value {
    (value as u64 & byte_mask(size)) as Value
}

impl Expr {
    pub fn size(&self) -> usize {
        match self {
            Expr::Concrete { size, .. }
            | Expr::Basic { size, .. }
            | Expr::Unary { size, .. }
            | Expr::Binary { size, .. }
            | Expr::Compare { size, .. }
            | Expr::Deref { size, .. } => *size,
        }
    }

    pub fn value(&self) -> Value {
        match self {
            Expr::Concrete { value, .. }
            | Expr::Basic { value, .. }
            | Expr::Unary { value, .. }
            | Expr::Binary { value, .. }
            | Expr::Compare { value, .. }
            | Expr::Deref { value, .. } => *value,
        }
    }

    pub fn is_concrete(&self) -> bool {
        matches!(self, Expr::Concrete { .. })
    }

    pub fn append_vars(&self, vars: &mut FxHashSet<VarId>) {
        match self {
            Expr::Concrete { .. } => {}
            Expr::Basic { var, .. } => {
                vars.insert(*var);
            }
            Expr::Unary { child, .. } => child.append_vars(vars),
            Expr::Binary { left, right, .. } | Expr::Compare { left, right, .. } => {
                left.append_vars(vars);
                right.append_vars(vars);
            }
            Expr::Deref { addr, .. } => addr.append_vars(vars),
        }
    }

    pub fn depends_on(&self, vars: &FxHashMap<VarId, CType>) -> bool {
        match self {
            Expr::Concrete { .. } => false,
            Expr::Basic { var, .. } => vars.contains_key(var),
            Expr::Unary { child, .. } => child.depends_on(vars),
            Expr::Binary { left, right, .. } | Expr::Compare { left, right, .. } => {
                left.depends_on(vars) || right.depends_on(vars)
            }
            Expr::Deref { addr, .. } => addr.depends_on(vars),
        }
    }
}

impl SymExpr {
    pub fn concrete(ty: CType, value: Value) -> SymExpr {
        Self::concrete_sized(ty.size_of(), value)
    }

    pub fn concrete_sized(size: usize, value: Value) -> SymExpr {
        Expr::Concrete { size, value }.into()
    }

    pub fn basic(ty: CType, value: Value, var: VarId) -> SymExpr {
        Expr::Basic {
            size: ty.size_of(),
            value,
            var,
        }
        .into()
    }

    pub fn unary(ty: CType, value: Value, op: UnaryOp, child: SymExpr) -> SymExpr {
        Expr::Unary {
            size: ty.size_of(),
            value,
            op,
            child,
        }
        .into()
    }

    pub fn binary(ty: CType, value: Value, op: BinaryOp, left: SymExpr, right: SymExpr) -> SymExpr {
        Expr::Binary {
            size: ty.size_of(),
            value,
            op,
            left,
            right,
        }
        .into()
    }

    /// Binary node whose right operand is a constant of the result type.
    pub fn binary_const(
        ty: CType,
        value: Value,
        op: BinaryOp,
        left: SymExpr,
        right: Value,
    ) -> SymExpr {
        let rhs = Self::concrete(ty, right);
        Self::binary(ty, value, op, left, rhs)
    }

    /// Comparison node; predicates are a single byte wide.
    pub fn compare(value: Value, op: CompareOp, left: SymExpr, right: SymExpr) -> SymExpr {
        Expr::Compare {
            size: 1,
            value,
            op,
            left,
            right,
        }
        .into()
    }

    /// A read of `ty` at a possibly-symbolic address inside `object`,
    /// with the region's concrete bytes snapshotted at evaluation time.
    pub fn deref(
        ty: CType,
        value: Value,
        object: SymbolicObject,
        addr: SymExpr,
        bytes: Vec<u8>,
    ) -> SymExpr {
        debug_assert_eq!(bytes.len(), object.size());
        Expr::Deref {
            size: ty.size_of(),
            value,
            object,
            addr,
            bytes,
        }
        .into()
    }

    /// Dereference at a concrete address.
    pub fn deref_const(
        ty: CType,
        value: Value,
        object: SymbolicObject,
        addr: Addr,
        bytes: Vec<u8>,
    ) -> SymExpr {
        let addr = Self::concrete(CType::U64, addr as Value);
        Self::deref(ty, value, object, addr, bytes)
    }

    /// Concatenate two values that are adjacent in memory, `e1` at the
    /// lower address. On a little-endian target the first operand holds
    /// the low-order bytes of the combined value; on big-endian it holds
    /// the high-order bytes. The node keeps the operands in memory order
    /// either way.
    pub fn concat(e1: SymExpr, e2: SymExpr) -> SymExpr {
        let (s1, s2) = (e1.size(), e2.size());
        let (hi, lo, lo_size) = if BIG_ENDIAN {
            (e1.value(), e2.value(), s2)
        } else {
            (e2.value(), e1.value(), s1)
        };
        let shifted = if lo_size >= 8 {
            0
        } else {
            (hi as u64) << (8 * lo_size)
        };
        let value = truncate((shifted | (lo as u64 & byte_mask(lo_size))) as Value, s1 + s2);
        Expr::Binary {
            size: s1 + s2,
            value,
            op: BinaryOp::Concat,
            left: e1,
            right: e2,
        }
        .into()
    }

    /// Extract `n` bytes of `e` starting at byte `i`: the i-th least
    /// significant byte on little-endian, the i-th most significant on
    /// big-endian. `i` must be `n`-aligned.
    ///
    /// Slices that land exactly on a concatenation seam return the
    /// matching operand; constants fold. Everything else becomes an
    /// extract node carrying the little-endian byte index.
    pub fn extract(e: SymExpr, i: usize, n: usize) -> SymExpr {
        assert_eq!(i % n, 0);

        if let Expr::Concrete { size, value } = &*e {
            return Self::extract_const(*size, *value, i, n);
        }
        if let Expr::Binary {
            op: BinaryOp::Concat,
            left,
            right,
            ..
        } = &*e
        {
            // Children are stored in memory order, so the index math is
            // the same for both byte orderings.
            if i == 0 && n == left.size() {
                return left.clone();
            }
            if i == left.size() && n == right.size() {
                return right.clone();
            }
        }

        let i_le = if BIG_ENDIAN { e.size() - i - n } else { i };
        let shifted = if 8 * i_le >= 64 {
            0
        } else {
            e.value() as u64 >> (8 * i_le)
        };
        let value = (shifted & byte_mask(n)) as Value;
        let index = Self::concrete(CType::U64, i_le as Value);
        Expr::Binary {
            size: n,
            value,
            op: BinaryOp::Extract,
            left: e,
            right: index,
        }
        .into()
    }

    /// Byte extraction on a bare constant.
    pub fn extract_const(size: usize, value: Value, i: usize, n: usize) -> SymExpr {
        assert_eq!(i % n, 0);

        let i_le = if BIG_ENDIAN { size - i - n } else { i };
        let shifted = if 8 * i_le >= 64 {
            0
        } else {
            value as u64 >> (8 * i_le)
        };
        Self::concrete_sized(n, (shifted & byte_mask(n)) as Value)
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::new();
        self.serialize(&mut out);
        out
    }

    /// Wire format: `<value:i64> <size:u64> <tag:u8> <payload>`, all
    /// little-endian, children serialized in stored order.
    pub fn serialize(&self, out: &mut Vec<u8>) {
        let header = |out: &mut Vec<u8>, tag: u8| {
            out.extend_from_slice(&self.value().to_le_bytes());
            out.extend_from_slice(&(self.size() as u64).to_le_bytes());
            out.push(tag);
        };
        match &**self {
            Expr::Concrete { .. } => header(out, TAG_CONST),
            Expr::Basic { var, .. } => {
                header(out, TAG_BASIC);
                out.extend_from_slice(&var.to_le_bytes());
            }
            Expr::Compare { op, left, right, .. } => {
                header(out, TAG_COMPARE);
                out.push(*op as u8);
                left.serialize(out);
                right.serialize(out);
            }
            Expr::Binary { op, left, right, .. } => {
                header(out, TAG_BINARY);
                out.push(*op as u8);
                left.serialize(out);
                right.serialize(out);
            }
            Expr::Unary { op, child, .. } => {
                header(out, TAG_UNARY);
                out.push(*op as u8);
                child.serialize(out);
            }
            Expr::Deref {
                object,
                addr,
                bytes,
                ..
            } => {
                header(out, TAG_DEREF);
                object.serialize(out);
                addr.serialize(out);
                out.extend_from_slice(bytes);
            }
        }
    }

    /// Strict parse of the wire format; any short read or unknown code
    /// aborts and partially built subtrees are dropped.
    pub fn parse(r: &mut impl Read) -> Result<SymExpr, ParseError> {
        let mut word = [0u8; 8];
        r.read_exact(&mut word)?;
        let value = i64::from_le_bytes(word);
        r.read_exact(&mut word)?;
        let size = u64::from_le_bytes(word) as usize;

        let mut byte = [0u8; 1];
        r.read_exact(&mut byte)?;
        match byte[0] {
            TAG_BASIC => {
                let mut var = [0u8; 4];
                r.read_exact(&mut var)?;
                Ok(Expr::Basic {
                    size,
                    value,
                    var: u32::from_le_bytes(var),
                }
                .into())
            }
            TAG_COMPARE => {
                r.read_exact(&mut byte)?;
                let op = CompareOp::try_from(byte[0])?;
                let left = Self::parse(r)?;
                let right = Self::parse(r)?;
                Ok(Expr::Compare {
                    size,
                    value,
                    op,
                    left,
                    right,
                }
                .into())
            }
            TAG_BINARY => {
                r.read_exact(&mut byte)?;
                let op = BinaryOp::try_from(byte[0])?;
                let left = Self::parse(r)?;
                let right = Self::parse(r)?;
                Ok(Expr::Binary {
                    size,
                    value,
                    op,
                    left,
                    right,
                }
                .into())
            }
            TAG_UNARY => {
                r.read_exact(&mut byte)?;
                let op = UnaryOp::try_from(byte[0])?;
                let child = Self::parse(r)?;
                Ok(Expr::Unary {
                    size,
                    value,
                    op,
                    child,
                }
                .into())
            }
            TAG_DEREF => {
                let object = SymbolicObject::parse(r)?;
                let addr = Self::parse(r)?;
                let mut bytes = vec![0u8; object.size()];
                r.read_exact(&mut bytes)?;
                Ok(Expr::Deref {
                    size,
                    value,
                    object,
                    addr,
                    bytes,
                }
                .into())
            }
            TAG_CONST => Ok(Expr::Concrete { size, value }.into()),
            tag => Err(ParseError::BadTag(tag)),
        }
    }
}

/// Traversal over expression trees by reference. Leaf methods must be
/// provided; inner-node methods default to visiting the children.
pub trait VisitRef<'e> {
    fn visit_concrete_ref(&mut self, size: usize, value: Value);
    fn visit_basic_ref(&mut self, size: usize, value: Value, var: VarId);

    #[allow(unused_variables)]
    fn visit_unary_ref(&mut self, size: usize, value: Value, op: UnaryOp, child: &'e SymExpr) {
        self.visit_expr_ref(child);
    }

    #[allow(unused_variables)]
    fn visit_binary_ref(
        &mut self,
        size: usize,
        value: Value,
        op: BinaryOp,
        left: &'e SymExpr,
        right: &'e SymExpr,
    ) {
        self.visit_expr_ref(left);
        self.visit_expr_ref(right);
    }

    #[allow(unused_variables)]
    fn visit_compare_ref(
        &mut self,
        size: usize,
        value: Value,
        op: CompareOp,
        left: &'e SymExpr,
        right: &'e SymExpr,
    ) {
        self.visit_expr_ref(left);
        self.visit_expr_ref(right);
    }

    #[allow(unused_variables)]
    fn visit_deref_ref(
        &mut self,
        size: usize,
        value: Value,
        object: &'e SymbolicObject,
        addr: &'e SymExpr,
        bytes: &'e [u8],
    ) {
        self.visit_expr_ref(addr);
    }

    fn visit_expr_ref(&mut self, expr: &'e SymExpr) {
        match &**expr {
            Expr::Concrete { size, value } => self.visit_concrete_ref(*size, *value),
            Expr::Basic { size, value, var } => self.visit_basic_ref(*size, *value, *var),
            Expr::Unary {
                size,
                value,
                op,
                child,
            } => self.visit_unary_ref(*size, *value, *op, child),
            Expr::Binary {
                size,
                value,
                op,
                left,
                right,
            } => self.visit_binary_ref(*size, *value, *op, left, right),
            Expr::Compare {
                size,
                value,
                op,
                left,
                right,
            } => self.visit_compare_ref(*size, *value, *op, left, right),
            Expr::Deref {
                size,
                value,
                object,
                addr,
                bytes,
            } => self.visit_deref_ref(*size, *value, object, addr, bytes),
        }
    }
}

impl fmt::Display for Expr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Expr::Concrete { value, .. } => write!(f, "{}", value),
            Expr::Basic { var, .. } => write!(f, "x{}", var),
            Expr::Unary { op, child, .. } => write!(f, "({} {})", op, &**child),
            Expr::Binary { op, left, right, .. } => {
                write!(f, "({} {} {})", op, &**left, &**right)
            }
            Expr::Compare { op, left, right, .. } => {
                write!(f, "({} {} {})", op, &**left, &**right)
            }
            Expr::Deref { addr, object, .. } => write!(f, "(* {} {})", &**addr, object),
        }
    }
}

impl fmt::Display for SymExpr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        (**self).fmt(f)
    }
}
