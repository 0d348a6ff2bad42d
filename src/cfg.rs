//! Statement numbering and successor computation.
//!
//! Statement ids come from the persistent counter so they stay unique
//! across translation units. Successors follow the statement structure:
//! straight-line fallthrough, both arms of a conditional, label targets
//! for gotos, nothing after a return.

use fxhash::FxHashMap;
use smallvec::SmallVec;
use thiserror::Error;

use crate::cil::{Block, Function, Instr, StmtKind, TranslationUnit};
use crate::counters::Counters;
use crate::recorder::{CallTarget, CfgLine};
use crate::types::StmtId;

#[derive(Debug, Error)]
pub enum Error {
    #[error("goto target `{0}` is not defined in function `{1}`")]
    UnresolvedLabel(String, String),
    #[error("label `{0}` is defined twice in function `{1}`")]
    DuplicateLabel(String, String),
}

/// Per-unit view of the computed graph.
#[derive(Debug, Default)]
pub struct UnitCfg {
    /// Entry statement of every numbered (non-skip) function.
    pub entry: FxHashMap<String, StmtId>,
    pub lines: Vec<CfgLine>,
}

/// Check that the control structure of a function is well formed before
/// any rewriting happens: every goto must have a matching label.
pub fn prepare(func: &Function) -> Result<(), Error> {
    let mut labels = FxHashMap::default();
    collect_labels(&func.body, &func.name, &mut labels)?;
    check_gotos(&func.body, &func.name, &labels)
}

/// Drop statement ids and successor lists so the graph can be rebuilt
/// after normalization reshaped the tree.
pub fn clear(func: &mut Function) {
    clear_block(&mut func.body);
}

fn clear_block(block: &mut Block) {
    for stmt in &mut block.stmts {
        stmt.sid = None;
        stmt.succs.clear();
        match &mut stmt.kind {
            StmtKind::If {
                then_blk, else_blk, ..
            } => {
                clear_block(then_blk);
                clear_block(else_blk);
            }
            StmtKind::Block(b) => clear_block(b),
            _ => {}
        }
    }
}

/// Number every statement of every instrumentable function and compute
/// the successor graph, resolving intra-unit call targets to their
/// callee's entry statement.
pub fn compute(tu: &mut TranslationUnit, counters: &mut Counters) -> Result<UnitCfg, Error> {
    let mut cfg = UnitCfg::default();

    // Numbering first: call-target resolution needs every entry id.
    let mut all_labels = Vec::new();
    for func in tu.functions.iter_mut().filter(|f| !f.is_skip()) {
        let mut labels = FxHashMap::default();
        number_block(&mut func.body, counters, &func.name, &mut labels)?;
        if let Some(first) = func.body.first_sid() {
            cfg.entry.insert(func.name.clone(), first);
        }
        all_labels.push((func.name.clone(), labels));
    }

    let mut labels_by_func = all_labels.into_iter().collect::<FxHashMap<_, _>>();
    for func in tu.functions.iter_mut().filter(|f| !f.is_skip()) {
        let labels = labels_by_func.remove(&func.name).unwrap_or_default();
        link_block(&mut func.body, None, &func.name, &labels)?;
    }

    for func in tu.functions.iter().filter(|f| !f.is_skip()) {
        emit_lines(&func.body, &cfg.entry, &mut cfg.lines);
    }
    Ok(cfg)
}

fn collect_labels(
    block: &Block,
    func: &str,
    labels: &mut FxHashMap<String, StmtId>,
) -> Result<(), Error> {
    for stmt in &block.stmts {
        for l in &stmt.labels {
            if labels.insert(l.clone(), 0).is_some() {
                return Err(Error::DuplicateLabel(l.clone(), func.to_string()));
            }
        }
        match &stmt.kind {
            StmtKind::If {
                then_blk, else_blk, ..
            } => {
                collect_labels(then_blk, func, labels)?;
                collect_labels(else_blk, func, labels)?;
            }
            StmtKind::Block(b) => collect_labels(b, func, labels)?,
            _ => {}
        }
    }
    Ok(())
}

fn check_gotos(
    block: &Block,
    func: &str,
    labels: &FxHashMap<String, StmtId>,
) -> Result<(), Error> {
    for stmt in &block.stmts {
        match &stmt.kind {
            StmtKind::Goto(l) if !labels.contains_key(l) => {
                return Err(Error::UnresolvedLabel(l.clone(), func.to_string()));
            }
            StmtKind::If {
                then_blk, else_blk, ..
            } => {
                check_gotos(then_blk, func, labels)?;
                check_gotos(else_blk, func, labels)?;
            }
            StmtKind::Block(b) => check_gotos(b, func, labels)?,
            _ => {}
        }
    }
    Ok(())
}

fn number_block(
    block: &mut Block,
    counters: &mut Counters,
    func: &str,
    labels: &mut FxHashMap<String, StmtId>,
) -> Result<(), Error> {
    for stmt in &mut block.stmts {
        let sid = counters.next_stmt();
        stmt.sid = Some(sid);
        for l in &stmt.labels {
            if labels.insert(l.clone(), sid).is_some() {
                return Err(Error::DuplicateLabel(l.clone(), func.to_string()));
            }
        }
        match &mut stmt.kind {
            StmtKind::If {
                then_blk, else_blk, ..
            } => {
                number_block(then_blk, counters, func, labels)?;
                number_block(else_blk, counters, func, labels)?;
            }
            StmtKind::Block(b) => number_block(b, counters, func, labels)?,
            _ => {}
        }
    }
    Ok(())
}

fn link_block(
    block: &mut Block,
    follow: Option<StmtId>,
    func: &str,
    labels: &FxHashMap<String, StmtId>,
) -> Result<(), Error> {
    let next: Vec<Option<StmtId>> = (0..block.stmts.len())
        .map(|i| block.stmts.get(i + 1).and_then(|s| s.sid).or(follow))
        .collect();

    for (stmt, after) in block.stmts.iter_mut().zip(next) {
        match &mut stmt.kind {
            StmtKind::Instr(_) | StmtKind::Skip => {
                stmt.succs = after.into_iter().collect();
            }
            StmtKind::Return(_) => stmt.succs = SmallVec::new(),
            StmtKind::Goto(l) => {
                let target = labels
                    .get(l)
                    .ok_or_else(|| Error::UnresolvedLabel(l.clone(), func.to_string()))?;
                stmt.succs = SmallVec::from_slice(&[*target]);
            }
            StmtKind::Block(b) => {
                stmt.succs = b.first_sid().or(after).into_iter().collect();
                link_block(b, after, func, labels)?;
            }
            StmtKind::If {
                then_blk, else_blk, ..
            } => {
                let t = then_blk.first_sid().or(after);
                let f = else_blk.first_sid().or(after);
                stmt.succs = t.into_iter().chain(f).collect();
                link_block(then_blk, after, func, labels)?;
                link_block(else_blk, after, func, labels)?;
            }
        }
    }
    Ok(())
}

fn emit_lines(block: &Block, entry: &FxHashMap<String, StmtId>, lines: &mut Vec<CfgLine>) {
    for stmt in &block.stmts {
        let sid = match stmt.sid {
            Some(sid) => sid,
            None => continue,
        };
        let mut calls = Vec::new();
        if let StmtKind::Instr(instrs) = &stmt.kind {
            for instr in instrs {
                if let Instr::Call { func, .. } = instr {
                    calls.push(match entry.get(func) {
                        Some(sid) => CallTarget::Sid(*sid),
                        None => CallTarget::Name(func.clone()),
                    });
                }
            }
        }
        lines.push(CfgLine {
            sid,
            succs: stmt.succs.to_vec(),
            calls,
        });
        match &stmt.kind {
            StmtKind::If {
                then_blk, else_blk, ..
            } => {
                emit_lines(then_blk, entry, lines);
                emit_lines(else_blk, entry, lines);
            }
            StmtKind::Block(b) => emit_lines(b, entry, lines),
            _ => {}
        }
    }
}
