//! The parser.
//!
//! Recursive descent over the token stream.  No AST is built: the parser
//! drives the code generator directly, so parsing a program and compiling it
//! are the same traversal.  All binary operators share one precedence level
//! and associate left; assignment sits below them and associates right.

use std::fmt::Debug;

use derive_more::Display;

use super::lex::{LexError, Lexer, Token, TokenKind};
use crate::back::{
    ArithOp, Assembly, CodeGen, CodegenError, Condition, Insn, Item, Operand, Register, Type,
    Value, ValueId, REG_COUNT,
};
use crate::common::Id;

/// Any error that aborts compilation.  The first one wins; there is no
/// recovery.
#[derive(Clone, Display, Eq, PartialEq)]
pub enum CompileError {
    #[display("{_0}")]
    Lex(LexError),
    #[display("{_0}")]
    Codegen(CodegenError),
    #[display("expected '{want}', got {got}")]
    Expected { want: TokenKind, got: String },
    #[display("expected a declaration")]
    ExpectedDeclaration,
    #[display("expected an identifier")]
    ExpectedIdentifier,
    #[display("syntax error in expression, got {_0}")]
    Expression(String),
    #[display("undefined: {_0}")]
    Undefined(Id),
    #[display("already defined: {_0}")]
    Redefined(Id),
    #[display("calling a non-function: {_0}")]
    CallingNonFunction(Id),
    #[display("not a function: {_0}")]
    NotFunction(Id),
    #[display("too many arguments for {_0}")]
    TooManyArguments(Id),
    #[display("too many parameters for {_0}")]
    TooManyParameters(Id),
    #[display("typecasting is not supported")]
    Cast,
}

impl Debug for CompileError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{self}")
    }
}

impl From<LexError> for CompileError {
    fn from(err: LexError) -> CompileError {
        CompileError::Lex(err)
    }
}

impl From<CodegenError> for CompileError {
    fn from(err: CodegenError) -> CompileError {
        CompileError::Codegen(err)
    }
}

/// Compile a whole program to an assembly listing.
pub fn compile(input: &str) -> Result<Assembly, CompileError> {
    let mut parser = Parser::new(input)?;
    parser.program()?;
    Ok(parser.gen.finish())
}

struct Parser<'src> {
    lexer: Lexer<'src>,
    /// The current token; `None` past the end of input.
    tok: Option<Token<'src>>,
    gen: CodeGen,
}

impl<'src> Parser<'src> {
    fn new(input: &'src str) -> Result<Parser<'src>, CompileError> {
        let mut lexer = Lexer::new(input);
        let tok = lexer.next()?;
        Ok(Parser {
            lexer,
            tok,
            gen: CodeGen::new(),
        })
    }

    fn advance(&mut self) -> Result<(), CompileError> {
        self.tok = self.lexer.next()?;
        Ok(())
    }

    fn kind(&self) -> Option<TokenKind> {
        self.tok.map(|t| t.kind)
    }

    /// If the current token matches, skip over it.
    fn check(&mut self, kind: TokenKind) -> Result<bool, CompileError> {
        if self.kind() == Some(kind) {
            self.advance()?;
            Ok(true)
        } else {
            Ok(false)
        }
    }

    /// Require the current token to match, and skip over it.
    fn expect(&mut self, kind: TokenKind) -> Result<(), CompileError> {
        if self.check(kind)? {
            Ok(())
        } else {
            Err(CompileError::Expected {
                want: kind,
                got: self.describe(),
            })
        }
    }

    fn describe(&self) -> String {
        match self.tok {
            Some(tok) => format!("'{}'", tok.kind),
            None => "end of input".to_string(),
        }
    }

    // ---- declarations ----

    /// Parse a declaration: a type, optional `*`s, an optional name, and an
    /// optional parameter list.  Returns `None` when the current token does
    /// not start a type.
    fn declaration(&mut self) -> Result<Option<Value>, CompileError> {
        let ty = match self.kind() {
            Some(TokenKind::Void) => Type::Void,
            Some(TokenKind::Char) => Type::Char,
            Some(TokenKind::Int) => Type::Int,
            _ => return Ok(None),
        };
        self.advance()?;

        let mut val = Value::of(ty);
        while self.check(TokenKind::Star)? {
            val.ty = Type::Pointer;
        }

        if let Some(tok) = self.tok {
            if tok.kind == TokenKind::Id {
                val.ident = Some(Id::from(tok.text.to_string()));
                self.advance()?;
            }
        }

        if self.check(TokenKind::LParen)? {
            // A function: the declared type becomes its return type.
            val.return_type = val.ty;
            val.ty = Type::Function;

            while !self.check(TokenKind::RParen)? {
                if self.kind() == Some(TokenKind::Ellipsis) {
                    self.advance()?;
                    val.varargs = true;
                    self.expect(TokenKind::RParen)?;
                    break;
                }
                if let Some(param) = self.declaration()? {
                    val.args.push(param);
                }
                if self.kind() != Some(TokenKind::RParen) {
                    self.expect(TokenKind::Comma)?;
                }
            }
        }
        Ok(Some(val))
    }

    // ---- expressions ----

    /// A term: a parenthesized expression, unary minus, a variable
    /// reference, a call, or a literal.
    fn term(&mut self) -> Result<ValueId, CompileError> {
        let Some(tok) = self.tok else {
            return Err(CompileError::Expression("end of input".to_string()));
        };
        match tok.kind {
            TokenKind::LParen => {
                self.advance()?;
                if self.declaration()?.is_some() {
                    return Err(CompileError::Cast);
                }
                let result = self.expr()?;
                self.expect(TokenKind::RParen)?;
                Ok(result)
            }

            TokenKind::Minus => {
                self.advance()?;
                let val = self.term()?;
                let reg = self.gen.load(val, None)?;
                self.gen.emit(Insn::Neg(reg));
                let ty = self.gen.value(val).ty;
                self.gen.release_locks();
                self.gen.discard(val);

                let result = self.gen.new_value(Value::of(ty));
                self.gen.bind(reg, result);
                Ok(result)
            }

            TokenKind::Id => {
                let name = Id::from(tok.text.to_string());
                let val = self
                    .gen
                    .lookup(name)
                    .ok_or(CompileError::Undefined(name))?;
                self.advance()?;
                if self.check(TokenKind::LParen)? {
                    let fun = val;
                    self.function_call(fun, name)?;
                    let return_type = self.gen.value(fun).return_type;
                    let result = self.gen.new_value(Value::of(return_type));
                    if return_type != Type::Void {
                        self.gen.bind(Register::Rax, result);
                    }
                    Ok(result)
                } else {
                    Ok(val)
                }
            }

            TokenKind::Num => {
                let mut val = Value::of(Type::Int);
                val.constant = Some(tok.number());
                self.advance()?;
                Ok(self.gen.new_value(val))
            }

            TokenKind::Str => {
                // Record the literal and take its address
                let label = self.gen.add_string(tok.text.to_string());
                self.advance()?;

                let reg = self.gen.alloc_register()?;
                self.gen.emit(Insn::Mov {
                    src: Operand::LabelAddr(label),
                    dst: Operand::Reg(reg),
                });
                let result = self.gen.new_value(Value::of(Type::Pointer));
                self.gen.bind(reg, result);
                Ok(result)
            }

            kind => Err(CompileError::Expression(format!("'{kind}'"))),
        }
    }

    /// A chain of arithmetic binary operations, all on one precedence level
    /// and left-associative.
    fn binop_expr(&mut self) -> Result<ValueId, CompileError> {
        let mut result = self.term()?;
        loop {
            let op = match self.kind() {
                Some(
                    k @ (TokenKind::Plus
                    | TokenKind::Minus
                    | TokenKind::Star
                    | TokenKind::Lt
                    | TokenKind::Gt),
                ) => k,
                _ => break,
            };
            self.advance()?;

            let lhs = result;
            let rhs = self.term()?;

            // The left operand is loaded first; picking the right operand's
            // form must wait until after, since the load can spill it.
            let reg = self.gen.load(lhs, None)?;
            let src = self.gen.asm_operand(rhs)?;
            match op {
                TokenKind::Plus => self.gen.emit(Insn::Arith {
                    op: ArithOp::Add,
                    src,
                    dst: reg,
                }),
                TokenKind::Minus => self.gen.emit(Insn::Arith {
                    op: ArithOp::Sub,
                    src,
                    dst: reg,
                }),
                TokenKind::Star => self.gen.emit(Insn::Arith {
                    op: ArithOp::Imul,
                    src,
                    dst: reg,
                }),
                TokenKind::Lt | TokenKind::Gt => {
                    let cond = if op == TokenKind::Lt {
                        Condition::Less
                    } else {
                        Condition::Greater
                    };
                    self.gen.emit(Insn::Cmp { src, dst: reg });
                    self.gen.emit(Insn::Set { cond, dst: reg });
                    self.gen.emit(Insn::Movzx(reg));
                }
                _ => unreachable!(),
            }

            // The result takes the left operand's type; there are no
            // implicit conversions.
            let ty = self.gen.value(lhs).ty;
            self.gen.release_locks();
            self.gen.discard(lhs);
            self.gen.discard(rhs);
            result = self.gen.new_value(Value::of(ty));
            self.gen.bind(reg, result);
        }
        Ok(result)
    }

    /// A full expression.  Assignment binds everything to its right, so it
    /// ends up right-associative and below the binary operators.
    fn expr(&mut self) -> Result<ValueId, CompileError> {
        let result = self.binop_expr()?;
        if self.check(TokenKind::Assign)? {
            let target = result;
            let val = self.expr()?;

            let reg = self.gen.load(val, None)?;
            let dst = self.gen.asm_operand(target)?;
            self.gen.emit(Insn::Mov {
                src: Operand::Reg(reg),
                dst,
            });
            self.gen.release_locks();

            // The assigned value passes through as the result
            return Ok(val);
        }
        Ok(result)
    }

    /// A call inside an expression; the opening `(` is already consumed.
    fn function_call(&mut self, fun: ValueId, name: Id) -> Result<(), CompileError> {
        let (declared, varargs) = {
            let f = self.gen.value(fun);
            if f.ty != Type::Function {
                return Err(CompileError::CallingNonFunction(name));
            }
            (f.args.len(), f.varargs)
        };

        // Evaluate arguments left to right
        let mut values = vec![];
        while !self.check(TokenKind::RParen)? {
            if values.len() >= declared && !varargs {
                return Err(CompileError::TooManyArguments(name));
            }
            values.push(self.expr()?);
            if self.kind() != Some(TokenKind::RParen) {
                self.expect(TokenKind::Comma)?;
            }
        }

        // Arrange the values for the call convention.  An unused argument
        // register still holding a live value is spilled so the callee can
        // clobber it.  A variadic call may have evaluated more than six
        // arguments; only the first six are passed.
        for i in 0..REG_COUNT {
            let reg = Register::argument(i);
            if let Some(&val) = values.get(i) {
                self.gen.load(val, Some(reg))?;
            } else if self.gen.occupant(reg).is_some() {
                self.gen.spill(reg);
            }
        }

        // The stack must be 16-aligned when the call pushes the return
        // address.
        self.gen.align_for_call();
        self.gen.emit(Insn::Call(name));

        for &val in &values {
            self.gen.discard(val);
        }
        self.gen.release_locks();
        Ok(())
    }

    // ---- statements ----

    fn statement(&mut self) -> Result<(), CompileError> {
        match self.kind() {
            Some(TokenKind::If) => {
                self.advance()?;
                self.if_statement()
            }
            Some(TokenKind::While) => {
                self.advance()?;
                self.while_statement()
            }
            Some(TokenKind::For) => {
                self.advance()?;
                self.for_statement()
            }
            Some(TokenKind::Return) => {
                self.advance()?;
                self.return_statement()
            }
            _ => {
                if let Some(var) = self.declaration()? {
                    // A local variable declaration
                    let v = self.gen.new_value(var);
                    self.gen.reserve_local(v);
                    self.gen.define(v);

                    if self.check(TokenKind::Assign)? {
                        // Initialization
                        let init = self.expr()?;
                        let reg = self.gen.load(init, None)?;
                        let offset = self.gen.stack_depth() - self.gen.value(v).stack_pos;
                        self.gen.emit(Insn::Mov {
                            src: Operand::Reg(reg),
                            dst: Operand::Stack(offset),
                        });
                        self.gen.release_locks();
                        self.gen.discard(init);
                    }
                } else {
                    // An expression statement; the result is thrown away
                    let result = self.expr()?;
                    self.gen.discard(result);
                }
                self.expect(TokenKind::Semi)
            }
        }
    }

    fn if_statement(&mut self) -> Result<(), CompileError> {
        self.expect(TokenKind::LParen)?;

        let old_depth = self.gen.stack_depth();

        let condition = self.expr()?;
        self.expect(TokenKind::RParen)?;

        // Compare the condition against zero
        let skip = self.gen.alloc_label();
        let reg = self.gen.load(condition, None)?;
        self.gen.emit(Insn::Test(reg));
        self.gen.emit(Insn::Jz(skip));
        self.gen.release_locks();
        self.gen.discard(condition);

        self.gen.end_block(old_depth);

        self.block()?;

        self.gen.place_label(skip);
        Ok(())
    }

    fn while_statement(&mut self) -> Result<(), CompileError> {
        self.expect(TokenKind::LParen)?;

        let test = self.gen.alloc_label();
        self.gen.place_label(test);

        let old_depth = self.gen.stack_depth();

        let condition = self.expr()?;
        self.expect(TokenKind::RParen)?;

        // Compare the condition against zero
        let end = self.gen.alloc_label();
        let reg = self.gen.load(condition, None)?;
        self.gen.emit(Insn::Test(reg));
        self.gen.emit(Insn::Jz(end));
        self.gen.release_locks();
        self.gen.discard(condition);

        self.gen.end_block(old_depth);

        self.block()?;

        // Back to test the condition again
        self.gen.emit(Insn::Jmp(test));
        self.gen.place_label(end);
        Ok(())
    }

    fn for_statement(&mut self) -> Result<(), CompileError> {
        self.expect(TokenKind::LParen)?;

        let mut old_depth = self.gen.stack_depth();

        let initial = self.expr()?;
        self.gen.discard(initial);
        self.expect(TokenKind::Semi)?;

        self.gen.end_block(old_depth);

        let test = self.gen.alloc_label();
        self.gen.place_label(test);

        old_depth = self.gen.stack_depth();

        let condition = self.expr()?;
        self.expect(TokenKind::Semi)?;

        // Compare the condition against zero
        let end = self.gen.alloc_label();
        let reg = self.gen.load(condition, None)?;
        self.gen.emit(Insn::Test(reg));
        self.gen.emit(Insn::Jz(end));
        self.gen.release_locks();
        self.gen.discard(condition);

        // The step is emitted next but runs only after the body, so jump
        // over it on the way in.
        let begin = self.gen.alloc_label();
        self.gen.emit(Insn::Jmp(begin));

        self.gen.end_block(old_depth);

        let step_label = self.gen.alloc_label();
        self.gen.place_label(step_label);

        old_depth = self.gen.stack_depth();

        let step = self.expr()?;
        self.gen.discard(step);
        self.expect(TokenKind::RParen)?;

        // Back to test the condition
        self.gen.emit(Insn::Jmp(test));

        self.gen.end_block(old_depth);

        self.gen.place_label(begin);

        self.block()?;

        // Back to the step, after which the condition is tested
        self.gen.emit(Insn::Jmp(step_label));
        self.gen.place_label(end);
        Ok(())
    }

    fn return_statement(&mut self) -> Result<(), CompileError> {
        let val = self.expr()?;
        self.expect(TokenKind::Semi)?;

        self.gen.load(val, Some(Register::Rax))?;
        self.gen.release_locks();
        self.gen.emit_return();
        Ok(())
    }

    /// A brace-delimited block or a single statement; either way a fresh
    /// scope whose symbols and stack space are released on exit.
    fn block(&mut self) -> Result<(), CompileError> {
        let mark = self.gen.scope_mark();
        let old_depth = self.gen.stack_depth();

        if self.check(TokenKind::LBrace)? {
            while !self.check(TokenKind::RBrace)? {
                self.statement()?;
            }
        } else {
            self.statement()?;
        }

        self.gen.close_scope(mark);
        self.gen.end_block(old_depth);
        Ok(())
    }

    // ---- top level ----

    fn function_body(&mut self, fun: ValueId, name: Id) -> Result<(), CompileError> {
        let params = {
            let f = self.gen.value(fun);
            if f.ty != Type::Function {
                return Err(CompileError::NotFunction(name));
            }
            if f.args.len() > REG_COUNT {
                return Err(CompileError::TooManyParameters(name));
            }
            f.args.clone()
        };

        let mark = self.gen.scope_mark();

        // Parameters start life in the argument registers, not on the
        // stack; register pressure in the body spills them like any other
        // value.
        for (i, param) in params.into_iter().enumerate() {
            let v = self.gen.new_value(param);
            self.gen.bind(Register::argument(i), v);
            self.gen.define(v);
        }

        self.gen.begin_function(name);
        self.block()?;
        self.gen.end_function();

        self.gen.close_scope(mark);
        Ok(())
    }

    fn program(&mut self) -> Result<(), CompileError> {
        self.gen.emit_item(Item::Text);

        while self.tok.is_some() {
            let val = self
                .declaration()?
                .ok_or(CompileError::ExpectedDeclaration)?;
            let name = val.ident.ok_or(CompileError::ExpectedIdentifier)?;
            if self.gen.lookup(name).is_some() {
                return Err(CompileError::Redefined(name));
            }
            let v = self.gen.new_value(val);
            self.gen.define(v);

            if self.kind() == Some(TokenKind::LBrace) {
                self.function_body(v, name)?;
            } else {
                self.expect(TokenKind::Semi)?;
            }
        }
        Ok(())
    }
}
