//! Append-only branch and control-flow records.
//!
//! The pass buffers everything it discovers in memory and appends to the
//! three output files when told to. The build system cleans the files
//! before the first translation unit; later units append.

use std::fmt::Write as _;
use std::fs::OpenOptions;
use std::io::Write as _;
use std::path::{Path, PathBuf};

use itertools::Itertools;

use crate::types::{FunctionId, StmtId};

pub const BRANCHES_FILE: &str = "branches";
pub const CFG_FILE: &str = "cfg";
pub const CFG_FUNC_MAP_FILE: &str = "cfg_func_map";

/// A call site inside a statement: resolved to the callee's entry
/// statement when the callee is defined in this unit, left as a name for
/// later stitching otherwise.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CallTarget {
    Sid(StmtId),
    Name(String),
}

#[derive(Debug, Clone)]
pub struct CfgLine {
    pub sid: StmtId,
    pub succs: Vec<StmtId>,
    pub calls: Vec<CallTarget>,
}

#[derive(Debug, Default)]
pub struct Recorder {
    dir: PathBuf,
    branches: Vec<(FunctionId, Vec<(StmtId, StmtId)>)>,
    func_map: Vec<(String, StmtId)>,
    cfg: Vec<CfgLine>,
}

impl Recorder {
    pub fn new(dir: &Path) -> Recorder {
        Recorder {
            dir: dir.to_path_buf(),
            ..Recorder::default()
        }
    }

    /// Drop everything buffered so far.
    pub fn clear(&mut self) {
        self.branches.clear();
        self.func_map.clear();
        self.cfg.clear();
    }

    /// Open a branch-pair group for a newly instrumented function.
    pub fn begin_function(&mut self, fid: FunctionId) {
        self.branches.push((fid, Vec::new()));
    }

    /// Record the (true successor, false successor) pair of a
    /// conditional in the current function.
    pub fn add_branch_pair(&mut self, true_sid: StmtId, false_sid: StmtId) {
        if let Some((_, pairs)) = self.branches.last_mut() {
            pairs.push((true_sid, false_sid));
        } else {
            log::warn!(
                "branch pair ({}, {}) recorded outside any function",
                true_sid,
                false_sid
            );
        }
    }

    /// Map a non-static function definition to its entry statement.
    pub fn add_function_entry(&mut self, name: &str, first_sid: StmtId) {
        self.func_map.push((name.to_string(), first_sid));
    }

    pub fn add_cfg_line(&mut self, line: CfgLine) {
        self.cfg.push(line);
    }

    pub fn branch_pair_count(&self) -> usize {
        self.branches.iter().map(|(_, pairs)| pairs.len()).sum()
    }

    fn append(&self, file: &str, content: &str) {
        let path = self.dir.join(file);
        let opened = OpenOptions::new().create(true).append(true).open(&path);
        match opened {
            Ok(mut f) => {
                if let Err(e) = f.write_all(content.as_bytes()) {
                    log::warn!("cannot append to {}: {}", path.display(), e);
                }
            }
            Err(e) => log::warn!("cannot open {}: {}", path.display(), e),
        }
    }

    /// Append the statement graph and the function map.
    pub fn write_cfg(&self) {
        let mut out = String::new();
        for line in &self.cfg {
            write!(out, "{}", line.sid).unwrap();
            for succ in &line.succs {
                write!(out, " {}", succ).unwrap();
            }
            for call in &line.calls {
                match call {
                    CallTarget::Sid(sid) => write!(out, " {}", sid).unwrap(),
                    CallTarget::Name(name) => write!(out, " {}", name).unwrap(),
                }
            }
            out.push('\n');
        }
        self.append(CFG_FILE, &out);

        let mut out = String::new();
        for (name, sid) in &self.func_map {
            writeln!(out, "{} {}", name, sid).unwrap();
        }
        self.append(CFG_FUNC_MAP_FILE, &out);
    }

    /// Append the per-function branch pairs, each group sorted so output
    /// is stable across runs.
    pub fn flush_branches(&self) {
        let mut out = String::new();
        for (fid, pairs) in &self.branches {
            writeln!(out, "{} {}", fid, pairs.len()).unwrap();
            for (t, f) in pairs.iter().sorted() {
                writeln!(out, "{} {}", t, f).unwrap();
            }
        }
        self.append(BRANCHES_FILE, &out);
    }
}

#[cfg(test)]
mod tests {
    use std::fs;

    use super::*;

    #[test]
    fn branches_are_grouped_and_sorted() {
        let dir = tempfile::tempdir().unwrap();
        let mut rec = Recorder::new(dir.path());
        rec.begin_function(1);
        rec.add_branch_pair(9, 10);
        rec.add_branch_pair(3, 4);
        rec.begin_function(2);
        rec.add_branch_pair(20, 21);
        rec.flush_branches();

        let text = fs::read_to_string(dir.path().join(BRANCHES_FILE)).unwrap();
        assert_eq!(text, "1 2\n3 4\n9 10\n2 1\n20 21\n");
    }

    #[test]
    fn cfg_lines_carry_successors_and_call_targets() {
        let dir = tempfile::tempdir().unwrap();
        let mut rec = Recorder::new(dir.path());
        rec.add_cfg_line(CfgLine {
            sid: 5,
            succs: vec![6, 9],
            calls: vec![CallTarget::Sid(12), CallTarget::Name("ext".to_string())],
        });
        rec.add_cfg_line(CfgLine {
            sid: 6,
            succs: vec![],
            calls: vec![],
        });
        rec.add_function_entry("main", 5);
        rec.write_cfg();

        assert_eq!(
            fs::read_to_string(dir.path().join(CFG_FILE)).unwrap(),
            "5 6 9 12 ext\n6\n"
        );
        assert_eq!(
            fs::read_to_string(dir.path().join(CFG_FUNC_MAP_FILE)).unwrap(),
            "main 5\n"
        );
    }

    #[test]
    fn appending_twice_accumulates() {
        let dir = tempfile::tempdir().unwrap();
        let mut rec = Recorder::new(dir.path());
        rec.begin_function(1);
        rec.add_branch_pair(1, 2);
        rec.flush_branches();

        rec.clear();
        rec.begin_function(2);
        rec.add_branch_pair(7, 8);
        rec.flush_branches();

        let text = fs::read_to_string(dir.path().join(BRANCHES_FILE)).unwrap();
        assert_eq!(text, "1 1\n1 2\n2 1\n7 8\n");
    }

    #[test]
    fn unwritable_directory_is_not_fatal() {
        let mut rec = Recorder::new(Path::new("/nonexistent/really/not"));
        rec.begin_function(1);
        rec.add_branch_pair(1, 2);
        rec.flush_branches();
        rec.write_cfg();
    }
}
