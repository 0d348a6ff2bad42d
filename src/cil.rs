//! The C AST the instrumentation pass transforms.
//!
//! An external front end delivers translation units in this form: types
//! resolved, expressions side-effect free, short-circuit operators and
//! loops already lowered to `if`/`goto` form, lvalues split into a host
//! and an offset chain. The pass rewrites the tree in place and hands it
//! back for printing/compilation.

use smallvec::SmallVec;

use crate::types::{CType, FunctionId, StmtId, Value, VarId};

/// Functions carrying this attribute are not instrumented, and calls to
/// them are left untouched.
pub const SKIP_ATTR: &str = "crest_skip";

#[derive(Debug, Clone, PartialEq)]
pub enum Ty {
    Void,
    Int(CType),
    Ptr(Box<Ty>),
    Array(Box<Ty>, Option<u64>),
    Comp(CompInfo),
    Enum(String),
    Fn { ret: Box<Ty>, variadic: bool },
}

#[derive(Debug, Clone, PartialEq)]
pub struct CompInfo {
    pub name: String,
    pub is_union: bool,
    pub size: u64,
    pub fields: Vec<Field>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Field {
    pub name: String,
    pub ty: Ty,
    /// Byte offset within the enclosing struct; zero in unions.
    pub offset: u64,
}

impl Ty {
    pub fn int(code: CType) -> Ty {
        Ty::Int(code)
    }

    pub fn ptr(to: Ty) -> Ty {
        Ty::Ptr(Box::new(to))
    }

    pub fn array(elem: Ty, len: u64) -> Ty {
        Ty::Array(Box::new(elem), Some(len))
    }

    pub fn size_of(&self) -> u64 {
        match self {
            Ty::Void | Ty::Fn { .. } => 0,
            Ty::Int(c) => c.size_of() as u64,
            Ty::Ptr(_) => 8,
            Ty::Array(elem, len) => elem.size_of() * len.unwrap_or(0),
            Ty::Comp(c) => c.size,
            Ty::Enum(_) => 4,
        }
    }

    pub fn align_of(&self) -> u64 {
        match self {
            Ty::Void | Ty::Fn { .. } => 1,
            Ty::Int(c) => (c.size_of() as u64).max(1),
            Ty::Ptr(_) => 8,
            Ty::Array(elem, _) => elem.align_of(),
            Ty::Comp(c) => c.fields.iter().map(|f| f.ty.align_of()).max().unwrap_or(1),
            Ty::Enum(_) => 4,
        }
    }

    /// The runtime type code for values of this type. Pointers are
    /// tracked as unsigned words, enums as ints, arrays and records as
    /// the aggregate code. Function and void types have none.
    pub fn type_code(&self) -> Option<CType> {
        match self {
            Ty::Int(c) => Some(*c),
            Ty::Ptr(_) => Some(CType::U64),
            Ty::Enum(_) => Some(CType::I32),
            Ty::Array(..) | Ty::Comp(_) => Some(CType::Aggregate),
            Ty::Void | Ty::Fn { .. } => None,
        }
    }

    /// Whether values of this type live on the symbolic operand stack as
    /// plain integers.
    pub fn is_symbolic(&self) -> bool {
        matches!(self, Ty::Int(_) | Ty::Enum(_))
    }

    pub fn is_aggregate(&self) -> bool {
        matches!(self, Ty::Array(..) | Ty::Comp(_))
    }

    pub fn is_pointer(&self) -> bool {
        matches!(self, Ty::Ptr(_))
    }

    /// Element type reached through one pointer or array step.
    pub fn pointee(&self) -> Option<&Ty> {
        match self {
            Ty::Ptr(t) | Ty::Array(t, _) => Some(t),
            _ => None,
        }
    }
}

/// C-level operators as delivered by the front end. Logical `&&`/`||`
/// survive only in non-branching contexts; branching uses of them arrive
/// pre-lowered to nested `if`s.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CBinOp {
    Add,
    Sub,
    Mul,
    Div,
    Mod,
    Shl,
    Shr,
    Lt,
    Gt,
    Le,
    Ge,
    Eq,
    Ne,
    BAnd,
    BXor,
    BOr,
    LAnd,
    LOr,
    PlusPI,
    MinusPI,
    MinusPP,
}

impl CBinOp {
    pub fn is_comparison(self) -> bool {
        matches!(
            self,
            CBinOp::Lt | CBinOp::Gt | CBinOp::Le | CBinOp::Ge | CBinOp::Eq | CBinOp::Ne
        )
    }

    pub fn is_pointer_arith(self) -> bool {
        matches!(self, CBinOp::PlusPI | CBinOp::MinusPI | CBinOp::MinusPP)
    }

    /// The complementary comparison, for branch normalization.
    pub fn negate_comparison(self) -> CBinOp {
        match self {
            CBinOp::Lt => CBinOp::Ge,
            CBinOp::Ge => CBinOp::Lt,
            CBinOp::Gt => CBinOp::Le,
            CBinOp::Le => CBinOp::Gt,
            CBinOp::Eq => CBinOp::Ne,
            CBinOp::Ne => CBinOp::Eq,
            op => op,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CUnOp {
    Neg,
    BNot,
    LNot,
}

#[derive(Debug, Clone, PartialEq)]
pub struct VarInfo {
    pub name: String,
    pub vid: VarId,
    pub ty: Ty,
    pub is_global: bool,
    pub is_static: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Host {
    Var(VarInfo),
    Mem(Box<Expr>),
}

#[derive(Debug, Clone, PartialEq)]
pub enum Offset {
    None,
    Field(Field, Box<Offset>),
    Index(Box<Expr>, Box<Offset>),
}

impl Offset {
    /// The chain flattened innermost-first.
    pub fn to_list(&self) -> Vec<Offset> {
        let mut out = Vec::new();
        let mut cur = self;
        loop {
            match cur {
                Offset::None => break,
                Offset::Field(f, rest) => {
                    out.push(Offset::Field(f.clone(), Box::new(Offset::None)));
                    cur = rest;
                }
                Offset::Index(i, rest) => {
                    out.push(Offset::Index(i.clone(), Box::new(Offset::None)));
                    cur = rest;
                }
            }
        }
        out
    }

    pub fn from_list(list: &[Offset]) -> Offset {
        let mut out = Offset::None;
        for step in list.iter().rev() {
            out = match step {
                Offset::Field(f, _) => Offset::Field(f.clone(), Box::new(out)),
                Offset::Index(i, _) => Offset::Index(i.clone(), Box::new(out)),
                Offset::None => out,
            };
        }
        out
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Lval {
    pub host: Host,
    pub offset: Offset,
}

impl Lval {
    pub fn var(v: VarInfo) -> Lval {
        Lval {
            host: Host::Var(v),
            offset: Offset::None,
        }
    }

    pub fn mem(e: Expr) -> Lval {
        Lval {
            host: Host::Mem(Box::new(e)),
            offset: Offset::None,
        }
    }

    pub fn ty(&self) -> Ty {
        let mut ty = match &self.host {
            Host::Var(v) => v.ty.clone(),
            Host::Mem(e) => match e.ty() {
                Ty::Ptr(t) | Ty::Array(t, _) => *t,
                other => other,
            },
        };
        let mut offset = &self.offset;
        loop {
            match offset {
                Offset::None => return ty,
                Offset::Field(f, rest) => {
                    ty = f.ty.clone();
                    offset = rest;
                }
                Offset::Index(_, rest) => {
                    ty = match ty {
                        Ty::Array(t, _) | Ty::Ptr(t) => *t,
                        other => other,
                    };
                    offset = rest;
                }
            }
        }
    }

    /// Whether the location's address depends on run-time values: any
    /// dereference of a computed pointer, or any indexing by a
    /// non-constant expression.
    pub fn has_symbolic_address(&self) -> bool {
        if matches!(self.host, Host::Mem(_)) {
            return true;
        }
        let mut offset = &self.offset;
        loop {
            match offset {
                Offset::None => return false,
                Offset::Field(_, rest) => offset = rest,
                Offset::Index(i, rest) => {
                    if !i.is_constant() {
                        return true;
                    }
                    offset = rest;
                }
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
    Const(Value, CType),
    Lval(Lval),
    SizeOf(Ty),
    AlignOf(Ty),
    UnOp(CUnOp, Box<Expr>, Ty),
    BinOp(CBinOp, Box<Expr>, Box<Expr>, Ty),
    Cast(Ty, Box<Expr>),
    AddrOf(Lval),
    StartOf(Lval),
}

impl Expr {
    pub fn int(v: Value) -> Expr {
        Expr::Const(v, CType::I32)
    }

    pub fn ty(&self) -> Ty {
        match self {
            Expr::Const(_, c) => Ty::Int(*c),
            Expr::Lval(lv) => lv.ty(),
            Expr::SizeOf(_) | Expr::AlignOf(_) => Ty::Int(CType::U64),
            Expr::UnOp(_, _, ty) | Expr::BinOp(_, _, _, ty) => ty.clone(),
            Expr::Cast(ty, _) => ty.clone(),
            Expr::AddrOf(lv) => Ty::ptr(lv.ty()),
            Expr::StartOf(lv) => match lv.ty() {
                Ty::Array(elem, _) => Ty::Ptr(elem),
                other => Ty::ptr(other),
            },
        }
    }

    pub fn is_constant(&self) -> bool {
        matches!(self, Expr::Const(..) | Expr::SizeOf(_) | Expr::AlignOf(_))
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Instr {
    Set(Lval, Expr),
    Call {
        ret: Option<Lval>,
        func: String,
        args: Vec<Expr>,
    },
}

#[derive(Debug, Clone, PartialEq)]
pub struct Block {
    pub stmts: Vec<Stmt>,
}

impl Block {
    pub fn new(stmts: Vec<Stmt>) -> Block {
        Block { stmts }
    }

    pub fn empty() -> Block {
        Block { stmts: Vec::new() }
    }

    /// Statement id of the block's entry statement.
    pub fn first_sid(&self) -> Option<StmtId> {
        self.stmts.first().and_then(|s| s.sid)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Stmt {
    pub kind: StmtKind,
    pub labels: Vec<String>,
    pub sid: Option<StmtId>,
    pub succs: SmallVec<[StmtId; 2]>,
}

impl Stmt {
    pub fn new(kind: StmtKind) -> Stmt {
        Stmt {
            kind,
            labels: Vec::new(),
            sid: None,
            succs: SmallVec::new(),
        }
    }

    pub fn labeled(kind: StmtKind, label: &str) -> Stmt {
        let mut s = Stmt::new(kind);
        s.labels.push(label.to_string());
        s
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum StmtKind {
    Instr(Vec<Instr>),
    Return(Option<Expr>),
    If {
        cond: Expr,
        then_blk: Block,
        else_blk: Block,
    },
    Block(Block),
    Goto(String),
    Skip,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Function {
    pub name: String,
    pub id: Option<FunctionId>,
    pub ret_ty: Ty,
    pub params: Vec<VarInfo>,
    pub locals: Vec<VarInfo>,
    pub body: Block,
    pub is_static: bool,
    pub is_variadic: bool,
    pub attrs: Vec<String>,
}

impl Function {
    pub fn new(name: &str, params: Vec<VarInfo>, body: Block) -> Function {
        Function {
            name: name.to_string(),
            id: None,
            ret_ty: Ty::Void,
            params,
            locals: Vec::new(),
            body,
            is_static: false,
            is_variadic: false,
            attrs: Vec::new(),
        }
    }

    pub fn is_skip(&self) -> bool {
        self.attrs.iter().any(|a| a == SKIP_ATTR)
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct TranslationUnit {
    pub globals: Vec<VarInfo>,
    pub functions: Vec<Function>,
    next_vid: VarId,
}

impl TranslationUnit {
    pub fn new() -> TranslationUnit {
        TranslationUnit::default()
    }

    pub fn with_vid_floor(next_vid: VarId) -> TranslationUnit {
        TranslationUnit {
            next_vid,
            ..TranslationUnit::default()
        }
    }

    pub fn function(&self, name: &str) -> Option<&Function> {
        self.functions.iter().find(|f| f.name == name)
    }

    /// A fresh local; the caller is responsible for attaching it to the
    /// owning function's locals.
    pub fn fresh_local(&mut self, hint: &str, ty: Ty) -> VarInfo {
        let vid = self.next_vid;
        self.next_vid += 1;
        VarInfo {
            name: format!("__{}_{}", hint, vid),
            vid,
            ty,
            is_global: false,
            is_static: false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    pub(crate) fn int_var(name: &str, vid: VarId) -> VarInfo {
        VarInfo {
            name: name.to_string(),
            vid,
            ty: Ty::Int(CType::I32),
            is_global: false,
            is_static: false,
        }
    }

    #[test]
    fn lval_type_follows_offsets() {
        let point = CompInfo {
            name: "point".to_string(),
            is_union: false,
            size: 8,
            fields: vec![
                Field {
                    name: "x".to_string(),
                    ty: Ty::Int(CType::I32),
                    offset: 0,
                },
                Field {
                    name: "y".to_string(),
                    ty: Ty::Int(CType::I32),
                    offset: 4,
                },
            ],
        };
        let arr = VarInfo {
            name: "pts".to_string(),
            vid: 1,
            ty: Ty::array(Ty::Comp(point.clone()), 4),
            is_global: false,
            is_static: false,
        };

        let lv = Lval {
            host: Host::Var(arr),
            offset: Offset::Index(
                Box::new(Expr::int(2)),
                Box::new(Offset::Field(
                    point.fields[1].clone(),
                    Box::new(Offset::None),
                )),
            ),
        };
        assert_eq!(lv.ty(), Ty::Int(CType::I32));
    }

    #[test]
    fn symbolic_address_detection() {
        let i = int_var("i", 1);
        let arr = VarInfo {
            name: "a".to_string(),
            vid: 2,
            ty: Ty::array(Ty::Int(CType::I32), 8),
            is_global: false,
            is_static: false,
        };
        let p = VarInfo {
            name: "p".to_string(),
            vid: 3,
            ty: Ty::ptr(Ty::Int(CType::I32)),
            is_global: false,
            is_static: false,
        };

        // a[3] has a constant address; a[i] does not; *p never does.
        let const_index = Lval {
            host: Host::Var(arr.clone()),
            offset: Offset::Index(Box::new(Expr::int(3)), Box::new(Offset::None)),
        };
        assert!(!const_index.has_symbolic_address());

        let var_index = Lval {
            host: Host::Var(arr),
            offset: Offset::Index(
                Box::new(Expr::Lval(Lval::var(i))),
                Box::new(Offset::None),
            ),
        };
        assert!(var_index.has_symbolic_address());

        let through_ptr = Lval::mem(Expr::Lval(Lval::var(p)));
        assert!(through_ptr.has_symbolic_address());
    }

    #[test]
    fn type_codes() {
        assert_eq!(Ty::Int(CType::I16).type_code(), Some(CType::I16));
        assert_eq!(Ty::ptr(Ty::Void).type_code(), Some(CType::U64));
        assert_eq!(Ty::Enum("color".into()).type_code(), Some(CType::I32));
        assert_eq!(
            Ty::array(Ty::Int(CType::U8), 16).type_code(),
            Some(CType::Aggregate)
        );
        assert_eq!(Ty::Void.type_code(), None);
        assert!(Ty::Int(CType::U8).is_symbolic());
        assert!(!Ty::ptr(Ty::Int(CType::U8)).is_symbolic());
        assert!(Ty::array(Ty::Int(CType::U8), 2).is_aggregate());
    }

    #[test]
    fn offset_list_round_trip() {
        let f = Field {
            name: "f".to_string(),
            ty: Ty::Int(CType::I8),
            offset: 2,
        };
        let off = Offset::Index(
            Box::new(Expr::int(1)),
            Box::new(Offset::Field(f, Box::new(Offset::None))),
        );
        let list = off.to_list();
        assert_eq!(list.len(), 2);
        assert_eq!(Offset::from_list(&list), off);
    }
}
