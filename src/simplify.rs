//! Pre-instrumentation rewrites.
//!
//! Two mandatory transforms run before anything looks at the tree:
//! memory-reference simplification, which hoists computed pointer hosts
//! into temporaries so every lvalue performs one addressing step, and the
//! single-return transform, which funnels every `return` through one exit
//! statement so a function has exactly one return site to instrument.

use crate::cil::{
    Block, Expr, Function, Host, Instr, Lval, Offset, Stmt, StmtKind, TranslationUnit, Ty,
    VarInfo,
};

pub const RETURN_LABEL: &str = "__sym_return";

/// Hoist every non-trivial `Mem` host into a fresh temporary across the
/// whole unit.
pub fn simplify_unit(tu: &mut TranslationUnit) {
    let mut functions = std::mem::take(&mut tu.functions);
    for func in functions.iter_mut().filter(|f| !f.is_skip()) {
        let mut s = Simplifier {
            tu,
            new_locals: Vec::new(),
        };
        s.simplify_block(&mut func.body);
        func.locals.append(&mut s.new_locals);
    }
    tu.functions = functions;
}

/// Rewrite every function to a single tail `return`, routing early
/// returns through a result temporary and an exit label.
pub fn single_return_unit(tu: &mut TranslationUnit) {
    let mut functions = std::mem::take(&mut tu.functions);
    for func in functions.iter_mut().filter(|f| !f.is_skip()) {
        single_return(tu, func);
    }
    tu.functions = functions;
}

struct Simplifier<'a> {
    tu: &'a mut TranslationUnit,
    new_locals: Vec<VarInfo>,
}

/// Expressions a `Mem` host may keep without a temporary.
fn is_atomic(e: &Expr) -> bool {
    match e {
        Expr::Const(..) | Expr::SizeOf(_) | Expr::AlignOf(_) => true,
        Expr::Lval(lv) | Expr::AddrOf(lv) | Expr::StartOf(lv) => {
            matches!(lv.host, Host::Var(_)) && matches!(lv.offset, Offset::None)
        }
        _ => false,
    }
}

impl<'a> Simplifier<'a> {
    fn simplify_block(&mut self, block: &mut Block) {
        let mut out = Vec::with_capacity(block.stmts.len());
        for mut stmt in block.stmts.drain(..) {
            let mut prelude = Vec::new();
            match &mut stmt.kind {
                StmtKind::Instr(instrs) => {
                    let mut rewritten = Vec::with_capacity(instrs.len());
                    for mut ins in instrs.drain(..) {
                        let mut pre = Vec::new();
                        match &mut ins {
                            Instr::Set(lv, rv) => {
                                self.simplify_expr(rv, &mut pre);
                                self.simplify_lval(lv, &mut pre);
                            }
                            Instr::Call { ret, args, .. } => {
                                for a in args {
                                    self.simplify_expr(a, &mut pre);
                                }
                                if let Some(lv) = ret {
                                    self.simplify_lval(lv, &mut pre);
                                }
                            }
                        }
                        rewritten.extend(pre);
                        rewritten.push(ins);
                    }
                    *instrs = rewritten;
                }
                StmtKind::Return(Some(e)) => self.simplify_expr(e, &mut prelude),
                StmtKind::If {
                    cond,
                    then_blk,
                    else_blk,
                } => {
                    self.simplify_expr(cond, &mut prelude);
                    self.simplify_block(then_blk);
                    self.simplify_block(else_blk);
                }
                StmtKind::Block(b) => self.simplify_block(b),
                _ => {}
            }
            if !prelude.is_empty() {
                // Keep labels on the first executed statement so gotos
                // still reach the hoisted computation.
                let mut pre_stmt = Stmt::new(StmtKind::Instr(prelude));
                pre_stmt.labels = std::mem::take(&mut stmt.labels);
                out.push(pre_stmt);
            }
            out.push(stmt);
        }
        block.stmts = out;
    }

    fn simplify_expr(&mut self, e: &mut Expr, pre: &mut Vec<Instr>) {
        match e {
            Expr::Lval(lv) | Expr::AddrOf(lv) | Expr::StartOf(lv) => self.simplify_lval(lv, pre),
            Expr::UnOp(_, a, _) | Expr::Cast(_, a) => self.simplify_expr(a, pre),
            Expr::BinOp(_, a, b, _) => {
                self.simplify_expr(a, pre);
                self.simplify_expr(b, pre);
            }
            Expr::Const(..) | Expr::SizeOf(_) | Expr::AlignOf(_) => {}
        }
    }

    fn simplify_lval(&mut self, lv: &mut Lval, pre: &mut Vec<Instr>) {
        if let Host::Mem(e) = &mut lv.host {
            self.simplify_expr(e, pre);
            if !is_atomic(e) {
                let ty = e.ty();
                let tmp = self.tu.fresh_local("mem", ty);
                self.new_locals.push(tmp.clone());
                let init = std::mem::replace(&mut **e, Expr::int(0));
                pre.push(Instr::Set(Lval::var(tmp.clone()), init));
                **e = Expr::Lval(Lval::var(tmp));
            }
        }
        self.simplify_offset(&mut lv.offset, pre);
    }

    fn simplify_offset(&mut self, off: &mut Offset, pre: &mut Vec<Instr>) {
        match off {
            Offset::None => {}
            Offset::Field(_, rest) => self.simplify_offset(rest, pre),
            Offset::Index(i, rest) => {
                self.simplify_expr(i, pre);
                self.simplify_offset(rest, pre);
            }
        }
    }
}

fn count_returns(block: &Block) -> usize {
    block
        .stmts
        .iter()
        .map(|s| match &s.kind {
            StmtKind::Return(_) => 1,
            StmtKind::If {
                then_blk, else_blk, ..
            } => count_returns(then_blk) + count_returns(else_blk),
            StmtKind::Block(b) => count_returns(b),
            _ => 0,
        })
        .sum()
}

fn redirect_returns(block: &mut Block, retvar: &Option<VarInfo>) {
    for stmt in &mut block.stmts {
        match &mut stmt.kind {
            StmtKind::Return(e) => {
                let mut instrs = Vec::new();
                if let (Some(v), Some(e)) = (retvar, e.take()) {
                    instrs.push(Instr::Set(Lval::var(v.clone()), e));
                }
                let mut stmts = Vec::new();
                if !instrs.is_empty() {
                    stmts.push(Stmt::new(StmtKind::Instr(instrs)));
                }
                stmts.push(Stmt::new(StmtKind::Goto(RETURN_LABEL.to_string())));
                stmt.kind = StmtKind::Block(Block::new(stmts));
            }
            StmtKind::If {
                then_blk, else_blk, ..
            } => {
                redirect_returns(then_blk, retvar);
                redirect_returns(else_blk, retvar);
            }
            StmtKind::Block(b) => redirect_returns(b, retvar),
            _ => {}
        }
    }
}

fn single_return(tu: &mut TranslationUnit, func: &mut Function) {
    let returns = count_returns(&func.body);
    let tail_return = matches!(
        func.body.stmts.last().map(|s| &s.kind),
        Some(StmtKind::Return(_))
    );
    if returns == 1 && tail_return {
        return;
    }
    if returns == 0 {
        func.body.stmts.push(Stmt::new(StmtKind::Return(None)));
        return;
    }

    let retvar = if matches!(func.ret_ty, Ty::Void) {
        None
    } else {
        let v = tu.fresh_local("retres", func.ret_ty.clone());
        func.locals.push(v.clone());
        Some(v)
    };
    redirect_returns(&mut func.body, &retvar);

    let result = retvar.map(|v| Expr::Lval(Lval::var(v)));
    func.body
        .stmts
        .push(Stmt::labeled(StmtKind::Return(result), RETURN_LABEL));
}
