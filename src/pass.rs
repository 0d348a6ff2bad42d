//! The pass driver.
//!
//! Sub-passes run in a fixed order; reordering them breaks id stability
//! or leaves the graph stale. Counters are loaded once per invocation and
//! persisted only after instrumentation succeeded, together with the
//! branch-pair flush.

use std::path::PathBuf;

use thiserror::Error;

use crate::cfg;
use crate::cil::TranslationUnit;
use crate::counters::{self, Counters};
use crate::instrument::{self, Instrumenter};
use crate::normalize;
use crate::recorder::Recorder;
use crate::simplify;

#[derive(Debug, Clone)]
pub struct PassConfig {
    /// Directory holding the counter files and the append-only outputs.
    pub output_dir: PathBuf,
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct PassSummary {
    pub functions: usize,
    pub statements: usize,
    pub branches: usize,
}

#[derive(Debug, Error)]
pub enum Error {
    #[error(transparent)]
    Cfg(#[from] cfg::Error),
    #[error(transparent)]
    Counters(#[from] counters::Error),
    #[error(transparent)]
    Instrument(#[from] instrument::Error),
}

pub fn run(tu: &mut TranslationUnit, config: &PassConfig) -> Result<PassSummary, Error> {
    simplify::simplify_unit(tu);

    for func in tu.functions.iter().filter(|f| !f.is_skip()) {
        cfg::prepare(func)?;
    }

    simplify::single_return_unit(tu);

    for func in tu.functions.iter_mut().filter(|f| !f.is_skip()) {
        normalize::normalize_function(func);
    }

    for func in tu.functions.iter_mut() {
        cfg::clear(func);
    }

    let mut counters = Counters::load(&config.output_dir);
    let unit_cfg = cfg::compute(tu, &mut counters)?;

    let mut recorder = Recorder::new(&config.output_dir);
    for line in &unit_cfg.lines {
        recorder.add_cfg_line(line.clone());
    }
    for func in tu.functions.iter().filter(|f| !f.is_skip() && !f.is_static) {
        if let Some(sid) = unit_cfg.entry.get(&func.name) {
            recorder.add_function_entry(&func.name, *sid);
        }
    }
    recorder.write_cfg();

    let functions = tu.functions.iter().filter(|f| !f.is_skip()).count();
    {
        let mut ins = Instrumenter::new(&mut counters, &mut recorder, tu);
        ins.instrument_unit(tu)?;
        ins.add_initializer(tu);
    }

    counters.save()?;
    recorder.flush_branches();

    Ok(PassSummary {
        functions,
        statements: unit_cfg.lines.len(),
        branches: recorder.branch_pair_count(),
    })
}
