//! Branch normalization.
//!
//! Every conditional gets two non-empty arms, so both successors have an
//! entry statement to attach a branch id to, and a predicate-form
//! condition: a single comparison at the top. Logical negations are
//! stripped while tracking polarity; anything that is not a comparison
//! becomes an explicit test against zero. Casts stay where they are,
//! since a narrowing cast can turn a nonzero value into zero.

use crate::cil::{Block, CBinOp, CUnOp, Expr, Function, Stmt, StmtKind, Ty};
use crate::types::CType;

pub fn normalize_function(func: &mut Function) {
    normalize_block(&mut func.body);
}

fn normalize_block(block: &mut Block) {
    for stmt in &mut block.stmts {
        match &mut stmt.kind {
            StmtKind::If {
                cond,
                then_blk,
                else_blk,
            } => {
                if then_blk.stmts.is_empty() {
                    then_blk.stmts.push(Stmt::new(StmtKind::Skip));
                }
                if else_blk.stmts.is_empty() {
                    else_blk.stmts.push(Stmt::new(StmtKind::Skip));
                }
                let owned = std::mem::replace(cond, Expr::int(0));
                *cond = to_predicate(owned);
                normalize_block(then_blk);
                normalize_block(else_blk);
            }
            StmtKind::Block(b) => normalize_block(b),
            _ => {}
        }
    }
}

/// Rewrite a branch condition into a single comparison. `polarity`
/// flips once per stripped logical negation.
fn to_predicate(cond: Expr) -> Expr {
    let mut polarity = true;
    let mut e = cond;
    while let Expr::UnOp(CUnOp::LNot, inner, _) = e {
        polarity = !polarity;
        e = *inner;
    }

    match e {
        Expr::BinOp(op, l, r, ty) if op.is_comparison() => {
            let op = if polarity { op } else { op.negate_comparison() };
            Expr::BinOp(op, l, r, ty)
        }
        other => {
            let op = if polarity { CBinOp::Ne } else { CBinOp::Eq };
            let zero = Expr::Const(0, other.ty().type_code().unwrap_or(CType::I32));
            Expr::BinOp(op, Box::new(other), Box::new(zero), Ty::Int(CType::I32))
        }
    }
}
