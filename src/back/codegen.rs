//! The code generator.
//!
//! Register allocation is fused into code generation; there is no separate
//! allocator pass.  The generator tracks, for every live [Value], where it
//! currently resides — a register, a constant, a stack slot, a global symbol,
//! or several of these at once — and emits loads and spills on demand while
//! the parser walks the source.
//!
//! # Occupancy model
//!
//! Six register slots (see [Register::ALL]) each hold at most one [ValueId].
//! Values live in an arena, so the same value keeps its identity while it is
//! reachable through a register slot and a stack slot at the same time.  A
//! parallel lock array pins slots for the duration of one operator emission;
//! locks are released on every path out of an emission step.
//!
//! # Stack model
//!
//! `stack_depth` counts the bytes reserved below the function's entry-time
//! stack pointer, starting at 8 for the pushed `%rbx`.  Locals and spills
//! grow it by 8, call-site alignment pads it to keep `%rsp` 16-byte aligned
//! before `call`, and every block exit shrinks it back to the depth saved at
//! block entry.  A stack slot is addressed as `stack_depth - stack_pos`
//! bytes above `%rsp`, which stays correct as the depth moves underneath it.

use derive_more::Display;

use crate::common::Id;

use super::asm::*;

/// The types the compiler distinguishes.
#[derive(Clone, Copy, Debug, Display, Eq, PartialEq)]
pub enum Type {
    #[display("void")]
    Void,
    #[display("function")]
    Function,
    #[display("pointer")]
    Pointer,
    #[display("char")]
    Char,
    #[display("int")]
    Int,
}

/// The record for every operand that flows through expressions: a global, a
/// parameter, a local, a literal, or a temporary intermediate result.
#[derive(Clone, Debug)]
pub struct Value {
    pub ty: Type,
    /// Name, present for top-level declarations and named parameters.
    pub ident: Option<Id>,
    /// Payload of a numeric literal.
    pub constant: Option<u64>,
    /// Bytes from the stack base when the value is materialized in a stack
    /// slot; 0 otherwise.
    pub stack_pos: u64,
    /// For functions: the type a call evaluates to.
    pub return_type: Type,
    /// For functions: extra arguments are accepted.
    pub varargs: bool,
    /// For functions: parameter declarations in positional order.
    pub args: Vec<Value>,
}

impl Value {
    pub fn of(ty: Type) -> Value {
        Value {
            ty,
            ident: None,
            constant: None,
            stack_pos: 0,
            return_type: Type::Void,
            varargs: false,
            args: vec![],
        }
    }
}

/// Index into the code generator's value arena.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct ValueId(usize);

/// Fatal conditions raised during emission.
#[derive(Clone, Copy, Debug, Display, Eq, PartialEq)]
pub enum CodegenError {
    #[display("non-numeric type for expression")]
    NonNumeric,
    #[display("unable to allocate a register")]
    OutOfRegisters,
}

pub struct CodeGen {
    values: Vec<Value>,
    symtab: Vec<ValueId>,
    registers: [Option<ValueId>; REG_COUNT],
    locked: [bool; REG_COUNT],
    stack_depth: u64,
    next_label: u32,
    strings: Vec<(Label, String)>,
    items: Vec<Item>,
}

impl CodeGen {
    pub fn new() -> CodeGen {
        CodeGen {
            values: vec![],
            symtab: vec![],
            registers: [None; REG_COUNT],
            locked: [false; REG_COUNT],
            stack_depth: 0,
            next_label: 100,
            strings: vec![],
            items: vec![],
        }
    }

    pub fn new_value(&mut self, val: Value) -> ValueId {
        self.values.push(val);
        ValueId(self.values.len() - 1)
    }

    pub fn value(&self, v: ValueId) -> &Value {
        &self.values[v.0]
    }

    pub fn stack_depth(&self) -> u64 {
        self.stack_depth
    }

    pub fn emit(&mut self, insn: Insn) {
        self.items.push(Item::Insn(insn));
    }

    pub fn emit_item(&mut self, item: Item) {
        self.items.push(item);
    }

    // ---- symbol table ----

    /// Look a name up, newest declaration first.
    pub fn lookup(&self, name: Id) -> Option<ValueId> {
        self.symtab
            .iter()
            .rev()
            .copied()
            .find(|&v| self.values[v.0].ident == Some(name))
    }

    pub fn define(&mut self, v: ValueId) {
        self.symtab.push(v);
    }

    /// The restore point for a scope: the symbol count at entry.
    pub fn scope_mark(&self) -> usize {
        self.symtab.len()
    }

    /// Close a scope, forgetting every symbol declared since the mark.
    pub fn close_scope(&mut self, mark: usize) {
        self.symtab.truncate(mark);
    }

    // ---- labels and strings ----

    pub fn alloc_label(&mut self) -> Label {
        let label = Label(self.next_label);
        self.next_label += 1;
        label
    }

    pub fn place_label(&mut self, label: Label) {
        self.emit_item(Item::Label(label));
    }

    /// Record a string literal; the table is written out at end of input.
    pub fn add_string(&mut self, bytes: String) -> Label {
        let label = self.alloc_label();
        self.strings.push((label, bytes));
        label
    }

    // ---- register file ----

    /// The register currently holding the value, if any.
    pub fn search_reg(&self, v: ValueId) -> Option<Register> {
        Register::ALL
            .into_iter()
            .find(|reg| self.registers[reg.index()] == Some(v))
    }

    /// The value currently held by the register, if any.
    pub fn occupant(&self, reg: Register) -> Option<ValueId> {
        self.registers[reg.index()]
    }

    /// How many independently reachable copies of the value exist.
    pub fn copies(&self, v: ValueId) -> usize {
        let val = &self.values[v.0];
        if val.constant.is_some() || val.ident.is_some() {
            // Reloadable from its home, so effectively infinite.
            return usize::MAX;
        }
        let on_stack = if val.stack_pos > 0 { 1 } else { 0 };
        on_stack + self.registers.iter().filter(|r| **r == Some(v)).count()
    }

    /// Called when a value is no longer needed.  Only pure temporaries give
    /// up their registers; anything with backing storage keeps its slots.
    pub fn discard(&mut self, v: ValueId) {
        let val = &self.values[v.0];
        if val.stack_pos > 0 || val.ident.is_some() {
            return;
        }
        for slot in self.registers.iter_mut() {
            if *slot == Some(v) {
                *slot = None;
            }
        }
    }

    /// Move a register's value to the stack to relieve register pressure.
    ///
    /// Only a value whose sole copy is this register gets a `push` and a
    /// stack slot; a value reachable elsewhere just vacates the slot.  The
    /// depth bookkeeping must stay exact in both cases, otherwise stack-slot
    /// offsets and call-site alignment drift from the real `%rsp`.
    pub fn spill(&mut self, reg: Register) {
        if let Some(v) = self.registers[reg.index()] {
            if self.copies(v) == 1 {
                self.emit(Insn::Push(reg));
                self.stack_depth += 8;
                self.values[v.0].stack_pos = self.stack_depth;
            }
            self.registers[reg.index()] = None;
        }
    }

    /// Pick a register for a new value: an empty slot if one exists,
    /// otherwise spill the highest-indexed unlocked slot.
    pub fn alloc_register(&mut self) -> Result<Register, CodegenError> {
        for reg in Register::ALL {
            if self.registers[reg.index()].is_none() {
                return Ok(reg);
            }
        }
        // Spill from the high end so the preferred registers survive.
        for reg in Register::ALL.into_iter().rev() {
            if !self.locked[reg.index()] {
                self.spill(reg);
                return Ok(reg);
            }
        }
        Err(CodegenError::OutOfRegisters)
    }

    /// The cheapest source operand for the value: a register if held, an
    /// immediate if constant, its stack slot, or its global name.
    pub fn asm_operand(&self, v: ValueId) -> Result<Operand, CodegenError> {
        let val = &self.values[v.0];
        if val.ty == Type::Void || val.ty == Type::Function {
            return Err(CodegenError::NonNumeric);
        }
        if let Some(reg) = self.search_reg(v) {
            return Ok(Operand::Reg(reg));
        }
        if let Some(n) = val.constant {
            return Ok(Operand::Imm(n));
        }
        if val.stack_pos > 0 {
            return Ok(Operand::Stack(self.stack_depth - val.stack_pos));
        }
        match val.ident {
            Some(id) => Ok(Operand::Global(id)),
            None => unreachable!("value has no storage location"),
        }
    }

    /// Ensure the value resides in `target`, or in any register for `None`.
    /// The chosen slot is locked so a second load within the same operator
    /// emission cannot evict it.
    pub fn load(
        &mut self,
        v: ValueId,
        target: Option<Register>,
    ) -> Result<Register, CodegenError> {
        let ty = self.values[v.0].ty;
        if ty == Type::Void || ty == Type::Function {
            return Err(CodegenError::NonNumeric);
        }

        let reg = match target {
            None => {
                if let Some(reg) = self.search_reg(v) {
                    self.locked[reg.index()] = true;
                    return Ok(reg);
                }
                self.alloc_register()?
            }
            Some(reg) => reg,
        };

        if self.registers[reg.index()] == Some(v) {
            self.locked[reg.index()] = true;
            return Ok(reg);
        }

        if self.registers[reg.index()].is_some() {
            // Evict the current occupant first
            self.spill(reg);
        }

        let src = self.asm_operand(v)?;
        self.emit(Insn::Mov {
            src,
            dst: Operand::Reg(reg),
        });
        self.registers[reg.index()] = Some(v);
        self.locked[reg.index()] = true;
        Ok(reg)
    }

    /// Record that a register now holds the given value.
    pub fn bind(&mut self, reg: Register, v: ValueId) {
        self.registers[reg.index()] = Some(v);
    }

    /// Locks last from the start to the end of one operator emission; every
    /// path out of an emission step ends here.
    pub fn release_locks(&mut self) {
        self.locked = [false; REG_COUNT];
    }

    // ---- stack model ----

    /// Reserve the 8-byte stack slot for a freshly declared local.
    pub fn reserve_local(&mut self, v: ValueId) {
        self.stack_depth += 8;
        self.values[v.0].stack_pos = self.stack_depth;
        self.emit(Insn::GrowStack(8));
    }

    /// Pad the stack so `%rsp` is 16-byte aligned immediately before a
    /// `call` pushes the return address.
    pub fn align_for_call(&mut self) {
        let rem = (self.stack_depth + 8) % 16;
        if rem > 0 {
            self.emit(Insn::GrowStack(16 - rem));
            self.stack_depth += 16 - rem;
        }
    }

    /// Unwind a closing block: release its stack space, invalidate stack
    /// slots that no longer exist, and clear every register binding.
    pub fn end_block(&mut self, old_depth: u64) {
        if self.stack_depth > old_depth {
            self.emit(Insn::ShrinkStack(self.stack_depth - old_depth));
            self.stack_depth = old_depth;
        }

        // A stale stack_pos beyond the restored depth would read freed
        // memory on the next access.
        for i in 0..self.symtab.len() {
            let v = self.symtab[i];
            if self.values[v.0].stack_pos > self.stack_depth {
                self.values[v.0].stack_pos = 0;
            }
        }

        self.registers = [None; REG_COUNT];
    }

    // ---- function framing ----

    pub fn begin_function(&mut self, name: Id) {
        self.emit_item(Item::Global(name));
        self.emit_item(Item::Define(name));
        self.emit(Insn::Push(Register::Rbx));
        // The pushed %rbx occupies the first eight bytes of the frame.
        self.stack_depth = 8;
    }

    pub fn end_function(&mut self) {
        self.emit(Insn::Pop(Register::Rbx));
        self.emit(Insn::Ret);
    }

    /// The return sequence.  The logical depth is left alone; the enclosing
    /// blocks still unwind their own share after the `ret`.
    pub fn emit_return(&mut self) {
        if self.stack_depth > 8 {
            self.emit(Insn::ShrinkStack(self.stack_depth - 8));
        }
        self.emit(Insn::Pop(Register::Rbx));
        self.emit(Insn::Ret);
    }

    /// Write the `.data` section and hand back the finished listing.  The
    /// string table comes out in reverse insertion order.
    pub fn finish(mut self) -> Assembly {
        self.emit_item(Item::Data);
        while let Some((label, bytes)) = self.strings.pop() {
            self.items.push(Item::Str { label, bytes });
        }
        Assembly { items: self.items }
    }
}

impl Default for CodeGen {
    fn default() -> CodeGen {
        CodeGen::new()
    }
}
