//! The x86-64 assembly data model.
//!
//! This is the vocabulary the code generator emits: the six allocatable
//! registers, operands, the instruction subset, and whole output lines
//! ([Item]).  Everything prints in AT&T syntax, so [`Assembly::asm_code`] is
//! just the listing joined line by line.
//!
//! # Calling convention
//!
//! The emitted ABI is a reduced subset of x86-64 System V:
//!
//! - Positional argument `i` travels in register `ALL[5 - i]`, i.e. in the
//!   order rdi, rsi, rdx, rcx, rbx, rax.  This diverges from the standard
//!   integer-argument order (rdi, rsi, rdx, rcx, r8, r9): r8/r9 are not part
//!   of the register file here, and rbx/rax serve as the fifth and sixth
//!   carriers instead.  At most six arguments are passed.
//! - `%rsp` is 16-byte aligned immediately before every `call`; the code
//!   generator inserts a `sub $pad, %rsp` where needed.
//! - Functions push `%rbx` on entry and pop it before `ret`; return values
//!   travel in `%rax`.
//!
//! # Output layout
//!
//! A program begins with `.text`, contains each function as parsed, and ends
//! with `.data` followed by the string table.  Generated labels are `l<id>`
//! with ids starting at 100.

use derive_more::Display;

use crate::common::Id;

/// Number of allocatable registers.
pub const REG_COUNT: usize = 6;

/// The allocatable general-purpose registers, in register-file order.
///
/// The allocator prefers low indices for fresh values and picks spill
/// victims from the high end, so the argument-carrying registers survive
/// longest.
#[derive(Clone, Copy, Debug, Display, Eq, Hash, PartialEq, PartialOrd, Ord)]
pub enum Register {
    #[display("%rax")]
    Rax,
    #[display("%rbx")]
    Rbx,
    #[display("%rcx")]
    Rcx,
    #[display("%rdx")]
    Rdx,
    #[display("%rsi")]
    Rsi,
    #[display("%rdi")]
    Rdi,
}

impl Register {
    pub const ALL: [Register; REG_COUNT] = [
        Register::Rax,
        Register::Rbx,
        Register::Rcx,
        Register::Rdx,
        Register::Rsi,
        Register::Rdi,
    ];

    /// Position in the register file.
    pub fn index(self) -> usize {
        self as usize
    }

    /// The register carrying positional argument `i`.
    pub fn argument(i: usize) -> Register {
        Register::ALL[REG_COUNT - 1 - i]
    }

    /// The low-byte alias, the destination of `set<cc>`.
    pub fn byte_name(self) -> &'static str {
        match self {
            Register::Rax => "%al",
            Register::Rbx => "%bl",
            Register::Rcx => "%cl",
            Register::Rdx => "%dl",
            Register::Rsi => "%sil",
            Register::Rdi => "%dil",
        }
    }
}

/// A generated label, printed as `l<id>`.
#[derive(Clone, Copy, Debug, Display, Eq, Hash, PartialEq, PartialOrd, Ord)]
#[display("l{_0}")]
pub struct Label(pub u32);

/// A source operand, in the order the code generator prefers them.
#[derive(Clone, Copy, Debug, Display, Eq, PartialEq)]
pub enum Operand {
    /// A register holding the value.
    #[display("{_0}")]
    Reg(Register),
    /// An immediate constant.
    #[display("${_0}")]
    Imm(u64),
    /// The address of a generated label (string literals).
    #[display("${_0}")]
    LabelAddr(Label),
    /// A stack slot, addressed relative to `%rsp`.
    #[display("{_0}(%rsp)")]
    Stack(u64),
    /// A global symbol referenced by name.
    #[display("{_0}")]
    Global(Id),
}

/// Arithmetic instructions of the form `op src, dst`.
#[derive(Clone, Copy, Debug, Display, Eq, PartialEq)]
pub enum ArithOp {
    #[display("add")]
    Add,
    #[display("sub")]
    Sub,
    #[display("imul")]
    Imul,
}

/// Conditions for the `set<cc>` family.
#[derive(Clone, Copy, Debug, Display, Eq, PartialEq)]
pub enum Condition {
    #[display("l")]
    Less,
    #[display("g")]
    Greater,
}

/// An instruction in the emitted x86-64 subset.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum Insn {
    Mov {
        src: Operand,
        dst: Operand,
    },
    Arith {
        op: ArithOp,
        src: Operand,
        dst: Register,
    },
    Cmp {
        src: Operand,
        dst: Register,
    },
    /// `set<cc>` into the byte alias of the register.
    Set {
        cond: Condition,
        dst: Register,
    },
    /// Zero-extend the byte alias back over the full register.
    Movzx(Register),
    Neg(Register),
    /// `or r, r`: sets ZF from the register for a following `jz`.
    Test(Register),
    Push(Register),
    Pop(Register),
    Jz(Label),
    Jmp(Label),
    Call(Id),
    Ret,
    /// `sub $n, %rsp`
    GrowStack(u64),
    /// `add $n, %rsp`
    ShrinkStack(u64),
}

impl std::fmt::Display for Insn {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        use Insn::*;

        match self {
            Mov { src, dst } => write!(f, "mov {src}, {dst}"),
            Arith { op, src, dst } => write!(f, "{op} {src}, {dst}"),
            Cmp { src, dst } => write!(f, "cmp {src}, {dst}"),
            Set { cond, dst } => write!(f, "set{cond} {}", dst.byte_name()),
            Movzx(r) => write!(f, "movzx {}, {r}", r.byte_name()),
            Neg(r) => write!(f, "neg {r}"),
            Test(r) => write!(f, "or {r}, {r}"),
            Push(r) => write!(f, "push {r}"),
            Pop(r) => write!(f, "pop {r}"),
            Jz(l) => write!(f, "jz {l}"),
            Jmp(l) => write!(f, "jmp {l}"),
            Call(id) => write!(f, "call {id}"),
            Ret => write!(f, "ret"),
            GrowStack(n) => write!(f, "sub ${n}, %rsp"),
            ShrinkStack(n) => write!(f, "add ${n}, %rsp"),
        }
    }
}

/// One line of the output listing.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum Item {
    /// The `.text` section directive.
    Text,
    /// The `.data` section directive.
    Data,
    /// `.global name`
    Global(Id),
    /// `name:` — a function entry point.
    Define(Id),
    /// `l<id>:` — a generated label.
    Label(Label),
    /// A string-table entry.  The bytes are emitted verbatim inside the
    /// `.string` directive; backslash escapes are the assembler's business.
    Str { label: Label, bytes: String },
    Insn(Insn),
}

impl std::fmt::Display for Item {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Item::Text => write!(f, "\t.text"),
            Item::Data => write!(f, "\t.data"),
            Item::Global(id) => write!(f, "\t.global {id}"),
            Item::Define(id) => write!(f, "{id}:"),
            Item::Label(l) => write!(f, "{l}:"),
            Item::Str { label, bytes } => write!(f, "{label}: .string \"{bytes}\""),
            Item::Insn(insn) => write!(f, "\t{insn}"),
        }
    }
}

/// The emitted program: the ordered assembly listing.
#[derive(Debug, Default)]
pub struct Assembly {
    pub items: Vec<Item>,
}

impl Assembly {
    /// Render the final assembly text.
    pub fn asm_code(&self) -> String {
        let mut out = String::new();
        for item in &self.items {
            out.push_str(&item.to_string());
            out.push('\n');
        }
        out
    }
}
