use crate::error::{EvalError, ParseError};
use crate::registry::{Binding, Builtin, FunctionSet, Symbols};
use crate::traits::Scalar;
use std::collections::BTreeSet;

/// Comparison operators; evaluate to `1.0` when true, `0.0` otherwise.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CmpOp {
    Lt,
    Le,
    Gt,
    Ge,
    Eq,
    Ne,
}

impl CmpOp {
    fn holds(self, a: f64, b: f64) -> bool {
        match self {
            CmpOp::Lt => a < b,
            CmpOp::Le => a <= b,
            CmpOp::Gt => a > b,
            CmpOp::Ge => a >= b,
            CmpOp::Eq => a == b,
            CmpOp::Ne => a != b,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinaryOp {
    Add,
    Sub,
    Mul,
    Div,
    FloorDiv,
    Rem,
    Pow,
}

/// OpCodes for the stack-based virtual machine.
/// The VM operates on a stack of `Scalar` values (f64 or Dual).
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum OpCode {
    /// Pushes a constant onto the stack.
    LoadConst(f64),
    /// Pushes an independent variable (by index).
    LoadIndependent(usize),
    /// Pushes a state-vector component (by index).
    LoadState(usize),
    /// Pushes a parameter (by index).
    LoadParam(usize),
    /// Pops (b, a), pushes (a + b).
    Add,
    /// Pops (b, a), pushes (a - b).
    Sub,
    /// Pops (b, a), pushes (a * b).
    Mul,
    /// Pops (b, a), pushes (a / b).
    Div,
    /// Pops (b, a), pushes floor(a / b).
    FloorDiv,
    /// Pops (b, a), pushes a mod b with the sign of b.
    Rem,
    /// Pops (b, a), pushes a ** b.
    Pow,
    /// Pops a, pushes -a.
    Neg,
    /// Pops (b, a), pushes 1 or 0.
    Compare(CmpOp),
    /// Pops `argc` arguments, pushes the builtin's result.
    Call(Builtin, usize),
}

/// Represents a compiled sequence of operations.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Bytecode {
    pub ops: Vec<OpCode>,
}

impl Bytecode {
    pub fn new() -> Self {
        Self { ops: Vec::new() }
    }
}

/// Stack-based virtual machine for evaluating compiled expressions.
///
/// The VM is stateless; `execute` takes all necessary context:
/// - `bytecode`: instructions to run.
/// - `independent`: independent variables (x, n, or x and y).
/// - `state`: state vector read through the accessor.
/// - `params`: parameter values.
/// - `stack`: scratch buffer for intermediate values.
pub struct VM;

impl VM {
    /// Executes the bytecode, classifying NaN-producing operations as domain errors.
    pub fn execute<T: Scalar>(
        bytecode: &Bytecode,
        independent: &[T],
        state: &[T],
        params: &[f64],
        stack: &mut Vec<T>,
    ) -> Result<T, EvalError> {
        stack.clear();

        for op in &bytecode.ops {
            match *op {
                OpCode::LoadConst(val) => stack.push(T::lift(val)),
                OpCode::LoadIndependent(idx) => stack.push(independent[idx]),
                OpCode::LoadState(idx) => stack.push(state[idx]),
                OpCode::LoadParam(idx) => stack.push(T::lift(params[idx])),
                OpCode::Neg => {
                    let a = pop(stack);
                    stack.push(-a);
                }
                OpCode::Add => binary(stack, "+", |a, b| a + b)?,
                OpCode::Sub => binary(stack, "-", |a, b| a - b)?,
                OpCode::Mul => binary(stack, "*", |a, b| a * b)?,
                OpCode::Div => binary(stack, "/", |a, b| a / b)?,
                OpCode::FloorDiv => binary(stack, "//", |a, b| (a / b).floor())?,
                OpCode::Rem => binary(stack, "%", floored_rem)?,
                OpCode::Pow => binary(stack, "**", |a, b| a.powf(b))?,
                OpCode::Compare(cmp) => {
                    let b = pop(stack);
                    let a = pop(stack);
                    let truth = cmp.holds(a.real(), b.real());
                    stack.push(T::lift(if truth { 1.0 } else { 0.0 }));
                }
                OpCode::Call(builtin, argc) => {
                    let value = call(builtin, argc, stack)?;
                    stack.push(value);
                }
            }
        }

        // The compiler guarantees a balanced stack.
        let result = stack.pop().unwrap_or_else(T::nan);
        if result.is_finite() {
            Ok(result)
        } else {
            Err(EvalError::NonFinite {
                value: result.real(),
            })
        }
    }
}

fn pop<T: Scalar>(stack: &mut Vec<T>) -> T {
    stack.pop().unwrap_or_else(T::nan)
}

fn domain_checked<T: Scalar>(
    function: &'static str,
    argument: T,
    inputs_nan: bool,
    result: T,
) -> Result<T, EvalError> {
    if result.is_nan() && !inputs_nan {
        Err(EvalError::Domain {
            function,
            argument: argument.real(),
        })
    } else {
        Ok(result)
    }
}

fn binary<T: Scalar>(
    stack: &mut Vec<T>,
    name: &'static str,
    f: impl Fn(T, T) -> T,
) -> Result<(), EvalError> {
    let b = pop(stack);
    let a = pop(stack);
    let value = domain_checked(name, a, a.is_nan() || b.is_nan(), f(a, b))?;
    stack.push(value);
    Ok(())
}

fn floored_rem<T: Scalar>(a: T, b: T) -> T {
    a - b * (a / b).floor()
}

fn round_half_even<T: Scalar>(x: T) -> T {
    let two = T::lift(2.0);
    if (x - x.trunc()).abs().real() == 0.5 {
        (x / two).round() * two
    } else {
        x.round()
    }
}

fn sign<T: Scalar>(x: T) -> T {
    let v = x.real();
    if v > 0.0 {
        T::one()
    } else if v < 0.0 {
        -T::one()
    } else if v == 0.0 {
        T::zero()
    } else {
        T::nan()
    }
}

fn call<T: Scalar>(builtin: Builtin, argc: usize, stack: &mut Vec<T>) -> Result<T, EvalError> {
    let name = builtin.name();
    match builtin {
        Builtin::Atan2 | Builtin::Pow => {
            let b = pop(stack);
            let a = pop(stack);
            let value = match builtin {
                Builtin::Atan2 => a.atan2(b),
                _ => a.powf(b),
            };
            domain_checked(name, a, a.is_nan() || b.is_nan(), value)
        }
        Builtin::Heaviside => {
            let h0 = if argc == 2 { pop(stack) } else { T::lift(0.5) };
            let x = pop(stack);
            let v = x.real();
            Ok(if v < 0.0 {
                T::zero()
            } else if v > 0.0 {
                T::one()
            } else if v == 0.0 {
                h0
            } else {
                T::nan()
            })
        }
        Builtin::Min | Builtin::Max => {
            let mut acc = pop(stack);
            for _ in 1..argc {
                let next = pop(stack);
                acc = if builtin == Builtin::Min {
                    acc.min(next)
                } else {
                    acc.max(next)
                };
            }
            Ok(acc)
        }
        _ => {
            let a = pop(stack);
            let value = match builtin {
                Builtin::Sin => a.sin(),
                Builtin::Cos => a.cos(),
                Builtin::Tan => a.tan(),
                Builtin::Exp => a.exp(),
                Builtin::Ln => a.ln(),
                Builtin::Log10 => a.log10(),
                Builtin::Log2 => a.log2(),
                Builtin::Sqrt => a.sqrt(),
                Builtin::Cbrt => a.cbrt(),
                Builtin::Abs => a.abs(),
                Builtin::Sinh => a.sinh(),
                Builtin::Cosh => a.cosh(),
                Builtin::Tanh => a.tanh(),
                Builtin::Asin => a.asin(),
                Builtin::Acos => a.acos(),
                Builtin::Atan => a.atan(),
                Builtin::Floor => a.floor(),
                Builtin::Ceil => a.ceil(),
                Builtin::Round => round_half_even(a),
                Builtin::Trunc => a.trunc(),
                Builtin::Sign => sign(a),
                Builtin::Atan2
                | Builtin::Pow
                | Builtin::Heaviside
                | Builtin::Min
                | Builtin::Max => T::nan(),
            };
            domain_checked(name, a, a.is_nan(), value)
        }
    }
}

// --- AST & Parser ---

/// Abstract syntax tree nodes for expressions.
#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
    Number(f64),
    Variable(String),
    /// `name[index]`, only valid for the state accessor.
    Index(String, usize),
    Neg(Box<Expr>),
    Binary(Box<Expr>, BinaryOp, Box<Expr>),
    Compare(Box<Expr>, CmpOp, Box<Expr>),
    Call {
        name: String,
        args: Vec<Expr>,
        position: usize,
    },
}

impl Expr {
    /// Longest path from this node to a leaf.
    pub fn height(&self) -> usize {
        match self {
            Expr::Number(_) | Expr::Variable(_) | Expr::Index(..) => 0,
            Expr::Neg(inner) => inner.height() + 1,
            Expr::Binary(lhs, _, rhs) | Expr::Compare(lhs, _, rhs) => {
                lhs.height().max(rhs.height()) + 1
            }
            Expr::Call { args, .. } => args.iter().map(Expr::height).max().unwrap_or(0) + 1,
        }
    }
}

/// Compiles an AST into `Bytecode`, resolving names against a symbol table.
pub struct Compiler<'a> {
    symbols: &'a Symbols,
    functions: &'a FunctionSet,
    free_names: BTreeSet<String>,
}

impl<'a> Compiler<'a> {
    pub fn new(symbols: &'a Symbols, functions: &'a FunctionSet) -> Self {
        Self {
            symbols,
            functions,
            free_names: BTreeSet::new(),
        }
    }

    pub fn compile(&mut self, expr: &Expr) -> Result<Bytecode, ParseError> {
        let mut ops = Vec::new();
        self.compile_recursive(expr, &mut ops)?;
        Ok(Bytecode { ops })
    }

    /// Names (variables, state accessor, parameters) referenced so far.
    pub fn into_free_names(self) -> BTreeSet<String> {
        self.free_names
    }

    fn compile_recursive(&mut self, expr: &Expr, ops: &mut Vec<OpCode>) -> Result<(), ParseError> {
        match expr {
            Expr::Number(n) => ops.push(OpCode::LoadConst(*n)),
            Expr::Variable(name) => match self.symbols.resolve(name) {
                Some(Binding::Independent(idx)) => {
                    self.free_names.insert(name.clone());
                    ops.push(OpCode::LoadIndependent(idx));
                }
                Some(Binding::Parameter(idx)) => {
                    self.free_names.insert(name.clone());
                    ops.push(OpCode::LoadParam(idx));
                }
                Some(Binding::Constant(value)) => ops.push(OpCode::LoadConst(value)),
                Some(Binding::State) => {
                    return Err(ParseError::disallowed(format!(
                        "state accessor '{name}' used without an index"
                    )))
                }
                None if Builtin::from_name(name).is_some() => {
                    return Err(ParseError::disallowed(format!(
                        "function '{name}' used as a value"
                    )))
                }
                None => return Err(ParseError::UnknownName { name: name.clone() }),
            },
            Expr::Index(name, idx) => match (self.symbols.resolve(name), self.symbols.state()) {
                (Some(Binding::State), Some(accessor)) => {
                    if *idx >= accessor.len {
                        return Err(ParseError::UnknownName {
                            name: format!("{name}[{idx}]"),
                        });
                    }
                    self.free_names.insert(name.clone());
                    ops.push(OpCode::LoadState(*idx));
                }
                (None, _) => return Err(ParseError::UnknownName { name: name.clone() }),
                _ => {
                    return Err(ParseError::disallowed(format!("subscript on '{name}'")));
                }
            },
            Expr::Neg(operand) => {
                self.compile_recursive(operand, ops)?;
                ops.push(OpCode::Neg);
            }
            Expr::Binary(left, op, right) => {
                self.compile_recursive(left, ops)?;
                self.compile_recursive(right, ops)?;
                ops.push(match op {
                    BinaryOp::Add => OpCode::Add,
                    BinaryOp::Sub => OpCode::Sub,
                    BinaryOp::Mul => OpCode::Mul,
                    BinaryOp::Div => OpCode::Div,
                    BinaryOp::FloorDiv => OpCode::FloorDiv,
                    BinaryOp::Rem => OpCode::Rem,
                    BinaryOp::Pow => OpCode::Pow,
                });
            }
            Expr::Compare(left, cmp, right) => {
                self.compile_recursive(left, ops)?;
                self.compile_recursive(right, ops)?;
                ops.push(OpCode::Compare(*cmp));
            }
            Expr::Call {
                name,
                args,
                position,
            } => {
                let builtin = match self.functions.lookup(name) {
                    Some(builtin) => builtin,
                    None if self.symbols.resolve(name).is_some() => {
                        return Err(ParseError::disallowed(format!(
                            "call of non-function '{name}'"
                        )))
                    }
                    None => return Err(ParseError::UnknownName { name: name.clone() }),
                };
                if !builtin.accepts(args.len()) {
                    return Err(ParseError::syntax(
                        *position,
                        format!("{}() does not take {} argument(s)", name, args.len()),
                    ));
                }
                for arg in args {
                    self.compile_recursive(arg, ops)?;
                }
                ops.push(OpCode::Call(builtin, args.len()));
            }
        }
        Ok(())
    }
}

// --- Tokenizer ---

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Number(f64),
    Identifier(String),
    Plus,
    Minus,
    Star,
    DoubleStar,
    Slash,
    DoubleSlash,
    Percent,
    Caret,
    LParen,
    RParen,
    LBracket,
    RBracket,
    Comma,
    Dot,
    Cmp(CmpOp),
}

const KEYWORDS: &[&str] = &[
    "False", "None", "True", "and", "as", "assert", "async", "await", "break", "class",
    "continue", "def", "del", "elif", "else", "except", "finally", "for", "from", "global",
    "if", "import", "in", "is", "lambda", "nonlocal", "not", "or", "pass", "raise", "return",
    "try", "while", "with", "yield",
];

const FORBIDDEN_NAMES: &[&str] = &[
    "eval", "exec", "compile", "open", "getattr", "setattr", "delattr", "globals", "locals",
    "vars", "input", "breakpoint", "help", "dir", "type", "object",
];

fn tokenize(input: &str) -> Result<Vec<(Token, usize)>, ParseError> {
    let chars: Vec<char> = input.chars().collect();
    let mut tokens = Vec::new();
    let mut pos = 0;

    while pos < chars.len() {
        let c = chars[pos];
        let start = pos;
        if c.is_whitespace() {
            pos += 1;
            continue;
        }
        if c.is_ascii_digit() || (c == '.' && chars.get(pos + 1).is_some_and(|d| d.is_ascii_digit())) {
            let (value, end) = lex_number(&chars, pos)?;
            tokens.push((Token::Number(value), start));
            pos = end;
            continue;
        }
        if c.is_alphabetic() || c == '_' {
            while pos < chars.len() && (chars[pos].is_alphanumeric() || chars[pos] == '_') {
                pos += 1;
            }
            let ident: String = chars[start..pos].iter().collect();
            if KEYWORDS.contains(&ident.as_str()) {
                return Err(ParseError::disallowed(format!("keyword '{ident}'")));
            }
            if ident.starts_with("__") {
                return Err(ParseError::disallowed(format!("dunder name '{ident}'")));
            }
            if FORBIDDEN_NAMES.contains(&ident.as_str()) {
                return Err(ParseError::disallowed(format!("builtin '{ident}'")));
            }
            tokens.push((Token::Identifier(ident), start));
            continue;
        }

        let next = chars.get(pos + 1).copied();
        let (token, width) = match (c, next) {
            ('*', Some('*')) => (Token::DoubleStar, 2),
            ('/', Some('/')) => (Token::DoubleSlash, 2),
            ('<', Some('=')) => (Token::Cmp(CmpOp::Le), 2),
            ('>', Some('=')) => (Token::Cmp(CmpOp::Ge), 2),
            ('=', Some('=')) => (Token::Cmp(CmpOp::Eq), 2),
            ('!', Some('=')) => (Token::Cmp(CmpOp::Ne), 2),
            ('+', _) => (Token::Plus, 1),
            ('-', _) => (Token::Minus, 1),
            ('*', _) => (Token::Star, 1),
            ('/', _) => (Token::Slash, 1),
            ('%', _) => (Token::Percent, 1),
            ('^', _) => (Token::Caret, 1),
            ('(', _) => (Token::LParen, 1),
            (')', _) => (Token::RParen, 1),
            ('[', _) => (Token::LBracket, 1),
            (']', _) => (Token::RBracket, 1),
            (',', _) => (Token::Comma, 1),
            ('.', _) => (Token::Dot, 1),
            ('<', _) => (Token::Cmp(CmpOp::Lt), 1),
            ('>', _) => (Token::Cmp(CmpOp::Gt), 1),
            ('=', _) => return Err(ParseError::disallowed("assignment")),
            (';', _) => return Err(ParseError::disallowed("statement separator ';'")),
            (':', _) => return Err(ParseError::disallowed("':' (slice, lambda or annotation)")),
            ('\'' | '"', _) => return Err(ParseError::disallowed("string literal")),
            ('{' | '}', _) => return Err(ParseError::disallowed("dict or set display")),
            ('@', _) => return Err(ParseError::disallowed("'@' operator")),
            ('&' | '|' | '~', _) => return Err(ParseError::disallowed("bitwise operator")),
            _ => {
                return Err(ParseError::syntax(
                    start,
                    format!("unexpected character '{c}'"),
                ))
            }
        };
        tokens.push((token, start));
        pos += width;
    }
    Ok(tokens)
}

fn lex_number(chars: &[char], start: usize) -> Result<(f64, usize), ParseError> {
    let mut pos = start;
    let mut text = String::new();
    let digits = |pos: &mut usize, text: &mut String| {
        while *pos < chars.len() && (chars[*pos].is_ascii_digit() || chars[*pos] == '_') {
            if chars[*pos] != '_' {
                text.push(chars[*pos]);
            }
            *pos += 1;
        }
    };

    digits(&mut pos, &mut text);
    if pos < chars.len() && chars[pos] == '.' {
        text.push('.');
        pos += 1;
        digits(&mut pos, &mut text);
    }
    if pos < chars.len() && (chars[pos] == 'e' || chars[pos] == 'E') {
        let mut look = pos + 1;
        if look < chars.len() && (chars[look] == '+' || chars[look] == '-') {
            look += 1;
        }
        if look < chars.len() && chars[look].is_ascii_digit() {
            text.push('e');
            text.extend(&chars[pos + 1..look]);
            pos = look;
            digits(&mut pos, &mut text);
        }
    }
    if pos < chars.len() && (chars[pos].is_alphanumeric() || chars[pos] == '_') {
        if chars[pos] == 'j' || chars[pos] == 'J' {
            return Err(ParseError::disallowed("complex literal"));
        }
        return Err(ParseError::syntax(start, "invalid number literal"));
    }
    text.parse::<f64>()
        .map(|v| (v, pos))
        .map_err(|_| ParseError::syntax(start, "invalid number literal"))
}

// --- Parser ---

/// Parses a string expression into an AST without resolving names.
pub fn parse(input: &str) -> Result<Expr, ParseError> {
    let tokens = tokenize(input)?;
    if tokens.is_empty() {
        return Err(ParseError::syntax(0, "empty expression"));
    }
    let end = input.chars().count();
    let mut parser = Parser {
        tokens,
        pos: 0,
        end,
        depth: 0,
    };
    let expr = parser.parse_comparison()?;
    match parser.peek() {
        None => Ok(expr),
        Some(Token::Comma) => Err(ParseError::disallowed("tuple")),
        Some(_) => Err(ParseError::syntax(parser.position(), "unexpected token")),
    }
}

/// Deepest bracket, call or operator nesting the parser accepts.
const MAX_NESTING: usize = 128;

struct Parser {
    tokens: Vec<(Token, usize)>,
    pos: usize,
    end: usize,
    depth: usize,
}

fn too_deep(position: usize) -> ParseError {
    ParseError::syntax(
        position,
        format!("expression is nested more than {MAX_NESTING} levels deep"),
    )
}

/// Height of a left-leaning operator chain after appending `right`.
fn chained_height(height: usize, right: &Expr, position: usize) -> Result<usize, ParseError> {
    let height = height.max(right.height()) + 1;
    if height > MAX_NESTING {
        return Err(too_deep(position));
    }
    Ok(height)
}

impl Parser {
    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos).map(|(t, _)| t)
    }

    fn position(&self) -> usize {
        self.tokens.get(self.pos).map_or(self.end, |(_, p)| *p)
    }

    fn consume(&mut self) -> Option<Token> {
        let token = self.tokens.get(self.pos).map(|(t, _)| t.clone());
        if token.is_some() {
            self.pos += 1;
        }
        token
    }

    fn expect(&mut self, expected: Token, what: &str) -> Result<(), ParseError> {
        let position = self.position();
        match self.consume() {
            Some(ref t) if *t == expected => Ok(()),
            _ => Err(ParseError::syntax(position, format!("expected {what}"))),
        }
    }

    fn parse_comparison(&mut self) -> Result<Expr, ParseError> {
        let left = self.parse_arith()?;
        if let Some(Token::Cmp(cmp)) = self.peek().cloned() {
            self.consume();
            let right = self.parse_arith()?;
            if let Some(Token::Cmp(_)) = self.peek() {
                return Err(ParseError::disallowed("chained comparison"));
            }
            return Ok(Expr::Compare(Box::new(left), cmp, Box::new(right)));
        }
        Ok(left)
    }

    /// Runs `inner` one nesting level deeper, refusing input nested past `MAX_NESTING`.
    fn nested<R>(
        &mut self,
        inner: impl FnOnce(&mut Self) -> Result<R, ParseError>,
    ) -> Result<R, ParseError> {
        if self.depth >= MAX_NESTING {
            return Err(too_deep(self.position()));
        }
        self.depth += 1;
        let result = inner(self);
        self.depth -= 1;
        result
    }

    fn parse_arith(&mut self) -> Result<Expr, ParseError> {
        let mut left = self.parse_term()?;
        let mut height = left.height();
        loop {
            let op = match self.peek() {
                Some(Token::Plus) => BinaryOp::Add,
                Some(Token::Minus) => BinaryOp::Sub,
                _ => break,
            };
            self.consume();
            let position = self.position();
            let right = self.parse_term()?;
            height = chained_height(height, &right, position)?;
            left = Expr::Binary(Box::new(left), op, Box::new(right));
        }
        Ok(left)
    }

    fn parse_term(&mut self) -> Result<Expr, ParseError> {
        let mut left = self.parse_unary()?;
        let mut height = left.height();
        loop {
            let op = match self.peek() {
                Some(Token::Star) => BinaryOp::Mul,
                Some(Token::Slash) => BinaryOp::Div,
                Some(Token::DoubleSlash) => BinaryOp::FloorDiv,
                Some(Token::Percent) => BinaryOp::Rem,
                _ => break,
            };
            self.consume();
            let position = self.position();
            let right = self.parse_unary()?;
            height = chained_height(height, &right, position)?;
            left = Expr::Binary(Box::new(left), op, Box::new(right));
        }
        Ok(left)
    }

    fn parse_unary(&mut self) -> Result<Expr, ParseError> {
        match self.peek() {
            Some(Token::Minus) => {
                self.consume();
                let expr = self.nested(Self::parse_unary)?;
                Ok(Expr::Neg(Box::new(expr)))
            }
            Some(Token::Plus) => {
                self.consume();
                self.nested(Self::parse_unary)
            }
            _ => self.parse_power(),
        }
    }

    /// Right-associative; the exponent may carry its own unary sign.
    fn parse_power(&mut self) -> Result<Expr, ParseError> {
        let base = self.parse_postfix()?;
        if let Some(Token::DoubleStar | Token::Caret) = self.peek() {
            self.consume();
            let exponent = self.nested(Self::parse_unary)?;
            return Ok(Expr::Binary(Box::new(base), BinaryOp::Pow, Box::new(exponent)));
        }
        Ok(base)
    }

    fn parse_postfix(&mut self) -> Result<Expr, ParseError> {
        let expr = self.parse_primary()?;
        match self.peek() {
            Some(Token::Dot) => Err(ParseError::disallowed("attribute access")),
            Some(Token::LParen) => Err(ParseError::disallowed("call of a non-function value")),
            Some(Token::LBracket) => Err(ParseError::disallowed("subscript")),
            _ => Ok(expr),
        }
    }

    fn parse_primary(&mut self) -> Result<Expr, ParseError> {
        let position = self.position();
        match self.consume() {
            Some(Token::Number(n)) => Ok(Expr::Number(n)),
            Some(Token::Identifier(name)) => match self.peek() {
                Some(Token::LParen) => {
                    self.consume();
                    let args = self.nested(Self::parse_arguments)?;
                    Ok(Expr::Call {
                        name,
                        args,
                        position,
                    })
                }
                Some(Token::LBracket) => {
                    self.consume();
                    let index_pos = self.position();
                    let index = match self.consume() {
                        Some(Token::Number(n)) if n >= 0.0 && n.fract() == 0.0 => n as usize,
                        _ => {
                            return Err(ParseError::disallowed(format!(
                                "subscript of '{name}' at position {index_pos} must be a non-negative integer literal"
                            )))
                        }
                    };
                    self.expect(Token::RBracket, "']'")?;
                    Ok(Expr::Index(name, index))
                }
                _ => Ok(Expr::Variable(name)),
            },
            Some(Token::LParen) => {
                let expr = self.nested(Self::parse_comparison)?;
                match self.peek() {
                    Some(Token::Comma) => Err(ParseError::disallowed("tuple")),
                    _ => {
                        self.expect(Token::RParen, "')'")?;
                        Ok(expr)
                    }
                }
            }
            Some(Token::LBracket) => Err(ParseError::disallowed("list display")),
            Some(_) => Err(ParseError::syntax(position, "unexpected token")),
            None => Err(ParseError::syntax(position, "unexpected end of expression")),
        }
    }

    fn parse_arguments(&mut self) -> Result<Vec<Expr>, ParseError> {
        let mut args = Vec::new();
        if let Some(Token::RParen) = self.peek() {
            self.consume();
            return Ok(args);
        }
        loop {
            args.push(self.parse_comparison()?);
            let position = self.position();
            match self.consume() {
                Some(Token::Comma) => continue,
                Some(Token::RParen) => return Ok(args),
                _ => return Err(ParseError::syntax(position, "expected ',' or ')'")),
            }
        }
    }
}

/// Replaces literal `\uXXXX` and `\UXXXXXXXX` escapes with the characters they name.
/// Malformed escapes are left untouched.
pub fn normalize_unicode_escapes(text: &str) -> String {
    let chars: Vec<char> = text.chars().collect();
    let mut out = String::with_capacity(text.len());
    let mut i = 0;
    while i < chars.len() {
        if chars[i] == '\\' && i + 1 < chars.len() {
            let width = match chars[i + 1] {
                'u' => 4,
                'U' => 8,
                _ => 0,
            };
            if width > 0 && i + 2 + width <= chars.len() {
                let hex: String = chars[i + 2..i + 2 + width].iter().collect();
                if let Some(ch) = u32::from_str_radix(&hex, 16).ok().and_then(char::from_u32) {
                    out.push(ch);
                    i += 2 + width;
                    continue;
                }
            }
        }
        out.push(chars[i]);
        i += 1;
    }
    out
}

// --- Compiled expressions ---

/// A validated, compiled expression bound to a symbol table.
///
/// Evaluation is pure: it reads its inputs and the captured parameter values
/// and never touches anything else.
#[derive(Debug, Clone, PartialEq)]
pub struct CompiledExpression {
    source: String,
    bytecode: Bytecode,
    free_names: BTreeSet<String>,
    parameters: Vec<f64>,
}

impl CompiledExpression {
    pub fn source(&self) -> &str {
        &self.source
    }

    pub fn bytecode(&self) -> &Bytecode {
        &self.bytecode
    }

    /// Variables, state accessor, and parameters referenced by the expression.
    pub fn free_names(&self) -> &BTreeSet<String> {
        &self.free_names
    }

    pub fn evaluate(&self, independent: &[f64], state: &[f64]) -> Result<f64, EvalError> {
        let mut stack = Vec::with_capacity(16);
        self.evaluate_with(independent, state, &mut stack)
    }

    pub fn evaluate_with<T: Scalar>(
        &self,
        independent: &[T],
        state: &[T],
        stack: &mut Vec<T>,
    ) -> Result<T, EvalError> {
        VM::execute(&self.bytecode, independent, state, &self.parameters, stack)
    }
}

/// Compiles one expression against the declared names and function whitelist.
pub fn compile(
    text: &str,
    symbols: &Symbols,
    functions: &FunctionSet,
) -> Result<CompiledExpression, ParseError> {
    let source = normalize_unicode_escapes(text.trim());
    let expr = parse(&source)?;
    let mut compiler = Compiler::new(symbols, functions);
    let bytecode = compiler.compile(&expr)?;
    Ok(CompiledExpression {
        source,
        bytecode,
        free_names: compiler.into_free_names(),
        parameters: symbols.parameter_values(),
    })
}

/// Compiles a list of expressions against one shared symbol table.
pub fn compile_system<S: AsRef<str>>(
    texts: &[S],
    symbols: &Symbols,
    functions: &FunctionSet,
) -> Result<Vec<CompiledExpression>, ParseError> {
    texts
        .iter()
        .enumerate()
        .map(|(index, text)| {
            compile(text.as_ref(), symbols, functions).map_err(|source| ParseError::Component {
                index,
                source: Box::new(source),
            })
        })
        .collect()
}

/// Checks syntax only and returns human-readable problems; empty when the text parses.
pub fn validate_expression(text: &str) -> Vec<String> {
    let source = normalize_unicode_escapes(text.trim());
    if source.is_empty() {
        return vec!["Expression is empty".to_string()];
    }
    match parse(&source) {
        Ok(_) => Vec::new(),
        Err(err) => vec![err.to_string()],
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::autodiff::Dual;

    fn ode(text: &str, params: &[(&str, f64)]) -> Result<CompiledExpression, ParseError> {
        let symbols = Symbols::ode(2).with_parameters(params.iter().map(|(n, v)| (*n, *v)));
        compile(text, &symbols, &FunctionSet::standard())
    }

    fn eval_ode(text: &str, x: f64, y: &[f64]) -> Result<f64, EvalError> {
        ode(text, &[]).expect("compile").evaluate(&[x], y)
    }

    fn assert_disallowed(text: &str) {
        match ode(text, &[]) {
            Err(ParseError::DisallowedConstruct { .. }) => {}
            other => panic!("expected DisallowedConstruct for {text:?}, got {other:?}"),
        }
    }

    #[test]
    fn evaluates_state_and_independent_variable() {
        let value = eval_ode("sin(x)+y[0]", 0.0, &[2.0, 0.0]).expect("eval");
        assert_eq!(value, 2.0);
    }

    #[test]
    fn power_binds_tighter_than_unary_minus() {
        assert_eq!(eval_ode("-2**2", 0.0, &[0.0, 0.0]).expect("eval"), -4.0);
        assert_eq!(eval_ode("2**3**2", 0.0, &[0.0, 0.0]).expect("eval"), 512.0);
        assert_eq!(eval_ode("2^-1", 0.0, &[0.0, 0.0]).expect("eval"), 0.5);
    }

    #[test]
    fn floor_division_and_modulo_follow_the_divisor_sign() {
        assert_eq!(eval_ode("-7 // 2", 0.0, &[0.0, 0.0]).expect("eval"), -4.0);
        assert_eq!(eval_ode("-7 % 3", 0.0, &[0.0, 0.0]).expect("eval"), 2.0);
        assert_eq!(eval_ode("7 % -3", 0.0, &[0.0, 0.0]).expect("eval"), -2.0);
    }

    #[test]
    fn comparisons_yield_indicator_values() {
        assert_eq!(eval_ode("(x > 1) * 3", 2.0, &[0.0, 0.0]).expect("eval"), 3.0);
        assert_eq!(eval_ode("y[1] == 0", 0.0, &[0.0, 0.0]).expect("eval"), 1.0);
    }

    #[test]
    fn step_and_rounding_builtins() {
        assert_eq!(eval_ode("heaviside(x)", 0.0, &[0.0, 0.0]).expect("eval"), 0.5);
        assert_eq!(eval_ode("heaviside(x, 1)", 0.0, &[0.0, 0.0]).expect("eval"), 1.0);
        assert_eq!(eval_ode("sign(x)", 0.0, &[0.0, 0.0]).expect("eval"), 0.0);
        assert_eq!(eval_ode("round(2.5) + round(3.5)", 0.0, &[0.0, 0.0]).expect("eval"), 6.0);
        assert_eq!(eval_ode("max(1, x, 3)", 5.0, &[0.0, 0.0]).expect("eval"), 5.0);
    }

    #[test]
    fn scientific_literals_and_constants() {
        let value = eval_ode("1.5e-3 * 2 + pi - e", 0.0, &[0.0, 0.0]).expect("eval");
        assert!((value - (3e-3 + std::f64::consts::PI - std::f64::consts::E)).abs() < 1e-15);
    }

    #[test]
    fn parameters_are_captured_at_compile_time() {
        let compiled = ode("-k * y[0]", &[("k", 3.0)]).expect("compile");
        assert_eq!(compiled.evaluate(&[0.0], &[2.0, 0.0]).expect("eval"), -6.0);
        let names: Vec<_> = compiled.free_names().iter().cloned().collect();
        assert_eq!(names, vec!["k".to_string(), "y".to_string()]);
    }

    #[test]
    fn rejects_disallowed_constructs() {
        for text in [
            "y = 1",
            "x.real",
            "__import__('os')",
            "lambda: 0",
            "[1, 2]",
            "'abc'",
            "x; x",
            "eval(x)",
            "x, y[0]",
            "1 < x < 2",
            "y",
        ] {
            assert_disallowed(text);
        }
    }

    #[test]
    fn deep_nesting_is_a_syntax_error() {
        let parens = format!("{}1{}", "(".repeat(10_000), ")".repeat(10_000));
        let minuses = format!("{}1", "-".repeat(10_000));
        let chain = format!("1{}", " + x".repeat(10_000));
        let calls = format!("{}x{}", "sin(".repeat(10_000), ")".repeat(10_000));
        for text in [&parens, &minuses, &chain, &calls] {
            match ode(text, &[]) {
                Err(ParseError::Syntax { message, .. }) => {
                    assert!(message.contains("nested"), "{message}")
                }
                other => panic!("expected nesting error, got {other:?}"),
            }
        }
        let shallow = format!("{}y[0]{}", "(".repeat(50), ")".repeat(50));
        assert_eq!(eval_ode(&shallow, 0.0, &[3.0, 0.0]).expect("eval"), 3.0);
        let long_sum = format!("0{}", " + 1".repeat(100));
        assert_eq!(eval_ode(&long_sum, 0.0, &[0.0, 0.0]).expect("eval"), 100.0);
        let signs = format!("{}1", "-".repeat(100));
        assert_eq!(eval_ode(&signs, 0.0, &[0.0, 0.0]).expect("eval"), 1.0);
        assert!(!validate_expression(&parens).is_empty());
    }

    #[test]
    fn rejects_unknown_names_and_out_of_range_state() {
        assert!(matches!(ode("z + 1", &[]), Err(ParseError::UnknownName { .. })));
        assert!(matches!(ode("foo(x)", &[]), Err(ParseError::UnknownName { .. })));
        assert!(matches!(ode("y[2]", &[]), Err(ParseError::UnknownName { .. })));
    }

    #[test]
    fn reports_syntax_errors_with_position() {
        match ode("sin(x", &[]) {
            Err(ParseError::Syntax { position, .. }) => assert_eq!(position, 5),
            other => panic!("expected syntax error, got {other:?}"),
        }
        assert!(matches!(ode("sin(x, 1)", &[]), Err(ParseError::Syntax { .. })));
        assert!(matches!(ode("", &[]), Err(ParseError::Syntax { .. })));
    }

    #[test]
    fn domain_errors_name_the_function() {
        let err = eval_ode("sqrt(y[0])", 0.0, &[-1.0, 0.0]).expect_err("domain");
        assert_eq!(
            err,
            EvalError::Domain {
                function: "sqrt",
                argument: -1.0
            }
        );
        assert_eq!(
            eval_ode("1 / x", 0.0, &[0.0, 0.0]),
            Err(EvalError::NonFinite {
                value: f64::INFINITY
            })
        );
    }

    #[test]
    fn unicode_escapes_become_parameter_names() {
        assert_eq!(normalize_unicode_escapes(r"\u03C9**2 * y[0]"), "ω**2 * y[0]");
        assert_eq!(normalize_unicode_escapes(r"\u12"), r"\u12");
        let compiled = ode(r"-\u03C9**2 * y[0]", &[("ω", 2.0)]).expect("compile");
        assert_eq!(compiled.evaluate(&[0.0], &[1.0, 0.0]).expect("eval"), -4.0);
    }

    #[test]
    fn compile_system_tags_the_failing_component() {
        let symbols = Symbols::ode(2);
        let err = compile_system(&["y[1]", "q"], &symbols, &FunctionSet::standard())
            .expect_err("second component is invalid");
        assert!(matches!(err, ParseError::Component { index: 1, .. }));
    }

    #[test]
    fn field_expressions_reject_state_accessor() {
        let symbols = Symbols::field();
        let err = compile("y[0]", &symbols, &FunctionSet::standard()).expect_err("no state");
        assert!(matches!(err, ParseError::DisallowedConstruct { .. }));
        let ok = compile("sin(pi*x)*sin(pi*y)", &symbols, &FunctionSet::standard()).expect("field");
        assert!((ok.evaluate(&[0.5, 0.5], &[]).expect("eval") - 1.0).abs() < 1e-15);
    }

    #[test]
    fn compilation_is_idempotent() {
        let a = ode("y[1]*x - cos(y[0])", &[]).expect("compile");
        let b = ode("y[1]*x - cos(y[0])", &[]).expect("compile");
        assert_eq!(a, b);
    }

    #[test]
    fn dual_evaluation_differentiates() {
        let compiled = ode("y[0]**3 + sin(y[1])", &[]).expect("compile");
        let mut stack = Vec::new();
        let state = [Dual::new(2.0, 1.0), Dual::new(0.0, 0.0)];
        let value = compiled
            .evaluate_with(&[Dual::constant(0.0)], &state, &mut stack)
            .expect("eval");
        assert_eq!(value.val, 8.0);
        assert_eq!(value.eps, 12.0);
    }

    #[test]
    fn validate_expression_reports_messages() {
        assert!(validate_expression("y[0] + x").is_empty());
        assert_eq!(validate_expression("   "), vec!["Expression is empty".to_string()]);
        assert_eq!(validate_expression("x +").len(), 1);
    }
}
