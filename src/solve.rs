//! Lowering of symbolic expressions into bit-vector terms.
//!
//! The solver itself lives outside this crate; here we only build terms a
//! caller can assert and solve against, one boolector bit-vector per
//! expression node, `8 * size` bits wide.

use std::sync::Arc;

use boolector::option::{BtorOption, ModelGen};
use boolector::{Btor, BV};
use fxhash::FxHashMap;

use crate::expr::{Expr, SymExpr, VisitRef};
use crate::object::SymbolicObject;
use crate::types::{BinaryOp, CompareOp, UnaryOp, Value, VarId, BIG_ENDIAN};

pub struct SolverContext {
    solver: Arc<Btor>,
    vars: FxHashMap<VarId, BV<Arc<Btor>>>,
}

impl SolverContext {
    pub fn new() -> Self {
        let solver = Btor::new();
        solver.set_opt(BtorOption::ModelGen(ModelGen::Asserted));
        solver.set_opt(BtorOption::Incremental(true));
        Self {
            solver: Arc::new(solver),
            vars: FxHashMap::default(),
        }
    }

    pub fn solver(&self) -> Arc<Btor> {
        self.solver.clone()
    }

    /// The term standing for a symbolic input, created on first use and
    /// cached. Widths are fixed by the input's type; a mismatched request
    /// is adjusted by zero extension or truncation.
    pub fn var(&mut self, var: VarId, bits: u32) -> BV<Arc<Btor>> {
        let solver = self.solver.clone();
        let bv = self
            .vars
            .entry(var)
            .or_insert_with(|| BV::new(solver, bits, Some(&format!("x{}", var))))
            .clone();
        resize_unsigned(bv, bits)
    }
}

impl Default for SolverContext {
    fn default() -> Self {
        Self::new()
    }
}

pub trait BitBlast {
    fn bit_blast(&self, ctxt: &mut SolverContext) -> BV<Arc<Btor>>;
}

impl BitBlast for SymExpr {
    fn bit_blast(&self, ctxt: &mut SolverContext) -> BV<Arc<Btor>> {
        let mut visitor = ToBv {
            value: None,
            ctxt,
        };
        visitor.visit_expr_ref(self);
        visitor.value()
    }
}

fn bv_const(solver: Arc<Btor>, value: Value, bits: u32) -> BV<Arc<Btor>> {
    if bits <= 64 {
        let mask = if bits == 64 {
            u64::MAX
        } else {
            (1u64 << bits) - 1
        };
        BV::from_u64(solver, value as u64 & mask, bits)
    } else {
        // Wider than the witness: sign extension realizes v mod 2^bits.
        BV::from_u64(solver, value as u64, 64).sext(bits - 64)
    }
}

fn resize_unsigned(bv: BV<Arc<Btor>>, bits: u32) -> BV<Arc<Btor>> {
    let w = bv.get_width();
    if w < bits {
        bv.uext(bits - w)
    } else if w > bits {
        bv.slice(bits - 1, 0)
    } else {
        bv
    }
}

fn resize_signed(bv: BV<Arc<Btor>>, bits: u32) -> BV<Arc<Btor>> {
    let w = bv.get_width();
    if w < bits {
        bv.sext(bits - w)
    } else if w > bits {
        bv.slice(bits - 1, 0)
    } else {
        bv
    }
}

struct ToBv<'c> {
    value: Option<BV<Arc<Btor>>>,
    ctxt: &'c mut SolverContext,
}

impl<'c> ToBv<'c> {
    fn value(&mut self) -> BV<Arc<Btor>> {
        self.value.take().unwrap()
    }

    fn solver(&self) -> Arc<Btor> {
        self.ctxt.solver()
    }

    fn snapshot_word(&self, bytes: &[u8], at: usize, size: usize) -> BV<Arc<Btor>> {
        let width = size.min(8);
        let mut word = 0u64;
        if BIG_ENDIAN {
            for b in &bytes[at..at + width] {
                word = (word << 8) | *b as u64;
            }
        } else {
            for b in bytes[at..at + width].iter().rev() {
                word = (word << 8) | *b as u64;
            }
        }
        bv_const(self.solver(), word as Value, 8 * size as u32)
    }
}

impl<'c, 'e> VisitRef<'e> for ToBv<'c> {
    fn visit_concrete_ref(&mut self, size: usize, value: Value) {
        self.value = Some(bv_const(self.solver(), value, 8 * size as u32));
    }

    fn visit_basic_ref(&mut self, size: usize, _value: Value, var: VarId) {
        self.value = Some(self.ctxt.var(var, 8 * size as u32));
    }

    fn visit_unary_ref(&mut self, size: usize, _value: Value, op: UnaryOp, child: &'e SymExpr) {
        self.visit_expr_ref(child);
        let c = self.value();
        let bits = 8 * size as u32;

        self.value = Some(match op {
            UnaryOp::Negate => resize_signed(c.neg(), bits),
            UnaryOp::LogicalNot => {
                let zero = BV::zero(self.solver(), c.get_width());
                c._eq(&zero).uext(bits - 1)
            }
            UnaryOp::BitwiseNot => resize_unsigned(c.not(), bits),
            UnaryOp::UnsignedCast => resize_unsigned(c, bits),
            UnaryOp::SignedCast => resize_signed(c, bits),
        });
    }

    fn visit_binary_ref(
        &mut self,
        size: usize,
        value: Value,
        op: BinaryOp,
        left: &'e SymExpr,
        right: &'e SymExpr,
    ) {
        let bits = 8 * size as u32;

        // The two composite codes keep their operands at natural widths.
        match op {
            BinaryOp::Concat => {
                self.visit_expr_ref(left);
                let l = self.value();
                self.visit_expr_ref(right);
                let r = self.value();
                // Operands are stored in memory order; the high-order half
                // is the second operand on little-endian targets.
                self.value = Some(if BIG_ENDIAN { l.concat(&r) } else { r.concat(&l) });
                return;
            }
            BinaryOp::Extract => {
                self.visit_expr_ref(left);
                let l = self.value();
                // The index operand is a concrete little-endian byte
                // offset; anything else came from a malformed tree and is
                // treated concretely.
                let idx = match &**right {
                    Expr::Concrete { value, .. } => Some(*value as u64 as usize),
                    _ => None,
                };
                self.value = Some(match idx {
                    Some(i) if 8 * (i + size) as u32 <= l.get_width() => {
                        l.slice(8 * (i + size) as u32 - 1, 8 * i as u32)
                    }
                    _ => bv_const(self.solver(), value, bits),
                });
                return;
            }
            BinaryOp::Concrete => {
                // Symbolic ancestry was dropped for this operation; only
                // the concrete result survives.
                self.value = Some(bv_const(self.solver(), value, bits));
                return;
            }
            _ => {}
        }

        let signed = matches!(op, BinaryOp::SDiv | BinaryOp::SMod | BinaryOp::SShr);
        self.visit_expr_ref(left);
        let l = self.value();
        self.visit_expr_ref(right);
        let r = self.value();
        let (l, r) = if signed {
            (resize_signed(l, bits), resize_signed(r, bits))
        } else {
            (resize_unsigned(l, bits), resize_unsigned(r, bits))
        };

        self.value = Some(match op {
            BinaryOp::Add => l.add(&r),
            BinaryOp::Sub => l.sub(&r),
            BinaryOp::Mul => l.mul(&r),
            BinaryOp::Div => l.udiv(&r),
            BinaryOp::SDiv => l.sdiv(&r),
            BinaryOp::Mod => l.urem(&r),
            BinaryOp::SMod => l.srem(&r),
            BinaryOp::Shl => l.sll(&r),
            BinaryOp::Shr => l.srl(&r),
            BinaryOp::SShr => l.sra(&r),
            BinaryOp::BitAnd => l.and(&r),
            BinaryOp::BitOr => l.or(&r),
            BinaryOp::BitXor => l.xor(&r),
            BinaryOp::Concat | BinaryOp::Extract | BinaryOp::Concrete => unreachable!(),
        });
    }

    fn visit_compare_ref(
        &mut self,
        _size: usize,
        _value: Value,
        op: CompareOp,
        left: &'e SymExpr,
        right: &'e SymExpr,
    ) {
        self.visit_expr_ref(left);
        let l = self.value();
        self.visit_expr_ref(right);
        let r = self.value();

        let bits = l.get_width().max(r.get_width());
        let (l, r) = if op.is_signed() {
            (resize_signed(l, bits), resize_signed(r, bits))
        } else {
            (resize_unsigned(l, bits), resize_unsigned(r, bits))
        };

        // Predicates are byte-sized.
        self.value = Some(
            match op {
                CompareOp::Eq => l._eq(&r),
                CompareOp::Neq => l._ne(&r),
                CompareOp::Gt => l.ugt(&r),
                CompareOp::Le => l.ulte(&r),
                CompareOp::Lt => l.ult(&r),
                CompareOp::Ge => l.ugte(&r),
                CompareOp::SGt => l.sgt(&r),
                CompareOp::SLe => l.slte(&r),
                CompareOp::SLt => l.slt(&r),
                CompareOp::SGe => l.sgte(&r),
            }
            .uext(7),
        );
    }

    fn visit_deref_ref(
        &mut self,
        size: usize,
        value: Value,
        object: &'e SymbolicObject,
        addr: &'e SymExpr,
        bytes: &'e [u8],
    ) {
        self.visit_expr_ref(addr);
        let addr_bv = self.value();
        let aw = addr_bv.get_width();
        let bits = 8 * size as u32;

        // A read at a symbolic address resolves against the snapshot: one
        // guarded case per aligned slot, defaulting to the witness.
        let mut result = bv_const(self.solver(), value, bits);
        if size > 0 && object.size() >= size {
            for k in (0..=object.size() - size).step_by(size) {
                let slot = BV::from_u64(self.solver(), object.start() + k as u64, aw);
                let word = self.snapshot_word(bytes, k, size);
                result = addr_bv._eq(&slot).cond_bv(&word, &result);
            }
        }
        self.value = Some(result);
    }
}
