//! Affine expression form `c0 + Σ ci·vi`.
//!
//! Used in place of a full tree when a value is known to be linear in the
//! symbolic inputs: comparisons and arithmetic stay cheap and the
//! representation is canonical, so equal forms serialize identically.

use std::collections::BTreeMap;
use std::fmt;
use std::io::{self, Read};
use std::ops::{AddAssign, MulAssign, SubAssign};

use fxhash::{FxHashMap, FxHashSet};

use crate::types::{CType, Value, VarId};

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LinearExpr {
    const_term: Value,
    // Ordered so that serialization is canonical.
    coeff: BTreeMap<VarId, Value>,
}

impl LinearExpr {
    /// The constant 0.
    pub fn new() -> Self {
        Self::default()
    }

    pub fn constant(c: Value) -> Self {
        Self {
            const_term: c,
            coeff: BTreeMap::new(),
        }
    }

    /// The singleton `c * v`.
    pub fn term(c: Value, v: VarId) -> Self {
        let mut coeff = BTreeMap::new();
        if c != 0 {
            coeff.insert(v, c);
        }
        Self {
            const_term: 0,
            coeff,
        }
    }

    pub fn negate(&mut self) {
        self.const_term = self.const_term.wrapping_neg();
        for c in self.coeff.values_mut() {
            *c = c.wrapping_neg();
        }
    }

    pub fn is_concrete(&self) -> bool {
        self.coeff.is_empty()
    }

    /// One slot for the constant plus one per non-zero term.
    pub fn size(&self) -> usize {
        1 + self.coeff.len()
    }

    pub fn const_term(&self) -> Value {
        self.const_term
    }

    pub fn terms(&self) -> impl Iterator<Item = (VarId, Value)> + '_ {
        self.coeff.iter().map(|(v, c)| (*v, *c))
    }

    pub fn append_vars(&self, vars: &mut FxHashSet<VarId>) {
        vars.extend(self.coeff.keys().copied());
    }

    pub fn depends_on(&self, vars: &FxHashMap<VarId, CType>) -> bool {
        self.coeff.keys().any(|v| vars.contains_key(v))
    }

    fn prune(&mut self) {
        self.coeff.retain(|_, c| *c != 0);
    }

    /// Wire format: `<const:i64> <count:u64> (<var:u32> <coeff:i64>)*`,
    /// little-endian, terms in ascending variable order.
    pub fn serialize(&self, out: &mut Vec<u8>) {
        out.extend_from_slice(&self.const_term.to_le_bytes());
        out.extend_from_slice(&(self.coeff.len() as u64).to_le_bytes());
        for (v, c) in &self.coeff {
            out.extend_from_slice(&v.to_le_bytes());
            out.extend_from_slice(&c.to_le_bytes());
        }
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::new();
        self.serialize(&mut out);
        out
    }

    /// Strict parse; any short read fails.
    pub fn parse(r: &mut impl Read) -> io::Result<Self> {
        let mut word = [0u8; 8];
        r.read_exact(&mut word)?;
        let const_term = i64::from_le_bytes(word);
        r.read_exact(&mut word)?;
        let count = u64::from_le_bytes(word);

        let mut coeff = BTreeMap::new();
        for _ in 0..count {
            let mut var = [0u8; 4];
            r.read_exact(&mut var)?;
            r.read_exact(&mut word)?;
            let c = i64::from_le_bytes(word);
            if c != 0 {
                coeff.insert(u32::from_le_bytes(var), c);
            }
        }
        Ok(Self { const_term, coeff })
    }
}

impl AddAssign<&LinearExpr> for LinearExpr {
    fn add_assign(&mut self, e: &LinearExpr) {
        self.const_term = self.const_term.wrapping_add(e.const_term);
        for (v, c) in &e.coeff {
            let slot = self.coeff.entry(*v).or_insert(0);
            *slot = slot.wrapping_add(*c);
        }
        self.prune();
    }
}

impl SubAssign<&LinearExpr> for LinearExpr {
    fn sub_assign(&mut self, e: &LinearExpr) {
        self.const_term = self.const_term.wrapping_sub(e.const_term);
        for (v, c) in &e.coeff {
            let slot = self.coeff.entry(*v).or_insert(0);
            *slot = slot.wrapping_sub(*c);
        }
        self.prune();
    }
}

impl AddAssign<Value> for LinearExpr {
    fn add_assign(&mut self, c: Value) {
        self.const_term = self.const_term.wrapping_add(c);
    }
}

impl SubAssign<Value> for LinearExpr {
    fn sub_assign(&mut self, c: Value) {
        self.const_term = self.const_term.wrapping_sub(c);
    }
}

impl MulAssign<Value> for LinearExpr {
    fn mul_assign(&mut self, c: Value) {
        self.const_term = self.const_term.wrapping_mul(c);
        for coeff in self.coeff.values_mut() {
            *coeff = coeff.wrapping_mul(c);
        }
        self.prune();
    }
}

impl fmt::Display for LinearExpr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.const_term)?;
        for (v, c) in &self.coeff {
            write!(f, " + {}*x{}", c, v)?;
        }
        Ok(())
    }
}
