//! Recursive-descent parser for the script language.

use std::rc::Rc;

use super::ast::{
    Arg, BinOp, Block, CmpOp, Const, Expr, FPart, FunctionDef, Handler, Param, Stmt, StmtKind,
    Target, UnaryOp,
};
use super::lexer::{tokenize, SyntaxError, Tok, Token};

const KEYWORDS: [&str; 35] = [
    "False", "None", "True", "and", "as", "assert", "async", "await", "break", "class",
    "continue", "def", "del", "elif", "else", "except", "finally", "for", "from", "global",
    "if", "import", "in", "is", "lambda", "nonlocal", "not", "or", "pass", "raise", "return",
    "try", "while", "with", "yield",
];

/// Nesting budget shared by blocks, brackets and operator chains. Debug
/// builds use far larger stack frames, so their budget is lower.
#[cfg(not(debug_assertions))]
pub(crate) const MAX_NESTING_DEPTH: u16 = 200;
#[cfg(debug_assertions)]
pub(crate) const MAX_NESTING_DEPTH: u16 = 40;

const UNSUPPORTED: [&str; 6] = ["class", "with", "async", "await", "yield", "nonlocal"];

/// Whether `name` is a reserved word.
pub(crate) fn is_keyword(name: &str) -> bool {
    KEYWORDS.contains(&name)
}

type PResult<T> = Result<T, SyntaxError>;

pub(crate) fn parse_module(source: &str) -> PResult<Block> {
    let mut parser = Parser::new(tokenize(source)?);
    let mut body = Vec::new();
    loop {
        parser.skip_newlines();
        if parser.peek() == &Tok::Eof {
            break;
        }
        body.extend(parser.statement()?);
    }
    Ok(body)
}

fn parse_expression(source: &str, line: u32) -> PResult<Expr> {
    let mut tokens = tokenize(source.trim()).map_err(|e| SyntaxError::new(e.message, line))?;
    for token in &mut tokens {
        token.line = line;
    }
    let mut parser = Parser::new(tokens);
    let expr = parser.testlist()?;
    parser.skip_newlines();
    if parser.peek() != &Tok::Eof {
        return Err(parser.unexpected());
    }
    Ok(expr)
}

struct Parser {
    tokens: Vec<Token>,
    pos: usize,
    loop_depth: usize,
    fn_depth: usize,
    depth_remaining: u16,
}

impl Parser {
    fn new(tokens: Vec<Token>) -> Self {
        Self {
            tokens,
            pos: 0,
            loop_depth: 0,
            fn_depth: 0,
            depth_remaining: MAX_NESTING_DEPTH,
        }
    }

    fn descend(&mut self) -> PResult<()> {
        match self.depth_remaining.checked_sub(1) {
            Some(remaining) => {
                self.depth_remaining = remaining;
                Ok(())
            }
            None => Err(self.error("too many nested parentheses")),
        }
    }

    fn nested<T>(&mut self, parse: impl FnOnce(&mut Self) -> PResult<T>) -> PResult<T> {
        self.descend()?;
        let result = parse(self);
        self.depth_remaining += 1;
        result
    }

    fn peek(&self) -> &Tok {
        self.peek_at(0)
    }

    fn peek_at(&self, offset: usize) -> &Tok {
        self.tokens
            .get(self.pos + offset)
            .map(|t| &t.tok)
            .unwrap_or(&Tok::Eof)
    }

    fn line(&self) -> u32 {
        self.tokens
            .get(self.pos)
            .or_else(|| self.tokens.last())
            .map_or(1, |t| t.line)
    }

    fn advance(&mut self) -> Tok {
        let tok = self.peek().clone();
        if self.pos < self.tokens.len() {
            self.pos += 1;
        }
        tok
    }

    fn error(&self, message: impl Into<String>) -> SyntaxError {
        SyntaxError::new(message, self.line())
    }

    fn unexpected(&self) -> SyntaxError {
        self.error(format!("invalid syntax near {}", self.peek()))
    }

    fn check_op(&self, op: &str) -> bool {
        matches!(self.peek(), Tok::Op(o) if *o == op)
    }

    fn eat_op(&mut self, op: &str) -> bool {
        if self.check_op(op) {
            self.pos += 1;
            true
        } else {
            false
        }
    }

    fn expect_op(&mut self, op: &str) -> PResult<()> {
        if self.eat_op(op) {
            Ok(())
        } else {
            Err(self.error(format!("expected '{op}', found {}", self.peek())))
        }
    }

    fn check_kw(&self, kw: &str) -> bool {
        matches!(self.peek(), Tok::Name(n) if n == kw)
    }

    fn eat_kw(&mut self, kw: &str) -> bool {
        if self.check_kw(kw) {
            self.pos += 1;
            true
        } else {
            false
        }
    }

    fn expect_kw(&mut self, kw: &str) -> PResult<()> {
        if self.eat_kw(kw) {
            Ok(())
        } else {
            Err(self.error(format!("expected '{kw}', found {}", self.peek())))
        }
    }

    fn expect_name(&mut self) -> PResult<String> {
        match self.peek().clone() {
            Tok::Name(name) if !is_keyword(&name) => {
                self.pos += 1;
                Ok(name)
            }
            _ => Err(self.error(format!("expected a name, found {}", self.peek()))),
        }
    }

    fn skip_newlines(&mut self) {
        while self.peek() == &Tok::Newline {
            self.pos += 1;
        }
    }

    fn at_clause_end(&self) -> bool {
        match self.peek() {
            Tok::Newline | Tok::Eof => true,
            Tok::Op(op) => matches!(
                *op,
                "=" | ")" | "]" | "}" | ":" | ";" | "+=" | "-=" | "*=" | "/=" | "//=" | "%=" | "**="
            ),
            Tok::Name(n) => n == "in",
            _ => false,
        }
    }

    // ----- statements -----

    fn statement(&mut self) -> PResult<Vec<Stmt>> {
        let line = self.line();
        let keyword = match self.peek() {
            Tok::Name(n) => n.clone(),
            _ => String::new(),
        };
        if UNSUPPORTED.contains(&keyword.as_str()) {
            return Err(self.error(format!("'{keyword}' statements are not supported")));
        }
        let kind = match keyword.as_str() {
            "if" => self.if_stmt()?,
            "while" => self.while_stmt()?,
            "for" => self.for_stmt()?,
            "def" => self.def_stmt()?,
            "try" => self.try_stmt()?,
            _ => return self.simple_line(),
        };
        Ok(vec![Stmt { kind, line }])
    }

    fn simple_line(&mut self) -> PResult<Vec<Stmt>> {
        let mut stmts = vec![self.simple()?];
        while self.eat_op(";") {
            if matches!(self.peek(), Tok::Newline | Tok::Eof) {
                break;
            }
            stmts.push(self.simple()?);
        }
        match self.peek() {
            Tok::Newline => {
                self.pos += 1;
                Ok(stmts)
            }
            Tok::Eof => Ok(stmts),
            _ => Err(self.unexpected()),
        }
    }

    fn block(&mut self) -> PResult<Block> {
        self.nested(Self::block_body)
    }

    fn block_body(&mut self) -> PResult<Block> {
        self.expect_op(":")?;
        if self.peek() != &Tok::Newline {
            return self.simple_line();
        }
        self.skip_newlines();
        if self.advance() != Tok::Indent {
            return Err(self.error("expected an indented block"));
        }
        let mut body = Vec::new();
        loop {
            self.skip_newlines();
            match self.peek() {
                Tok::Dedent => {
                    self.pos += 1;
                    break;
                }
                Tok::Eof => break,
                _ => body.extend(self.statement()?),
            }
        }
        Ok(body)
    }

    fn loop_body(&mut self) -> PResult<Block> {
        self.loop_depth += 1;
        let body = self.block();
        self.loop_depth -= 1;
        body
    }

    fn if_stmt(&mut self) -> PResult<StmtKind> {
        self.expect_kw("if")?;
        let mut branches = vec![(self.test()?, self.block()?)];
        let mut orelse = Vec::new();
        loop {
            if self.eat_kw("elif") {
                branches.push((self.test()?, self.block()?));
            } else if self.eat_kw("else") {
                orelse = self.block()?;
                break;
            } else {
                break;
            }
        }
        Ok(StmtKind::If { branches, orelse })
    }

    fn while_stmt(&mut self) -> PResult<StmtKind> {
        self.expect_kw("while")?;
        let test = self.test()?;
        let body = self.loop_body()?;
        let orelse = if self.eat_kw("else") { self.block()? } else { Vec::new() };
        Ok(StmtKind::While { test, body, orelse })
    }

    fn for_stmt(&mut self) -> PResult<StmtKind> {
        self.expect_kw("for")?;
        let target = self.for_target()?;
        self.expect_kw("in")?;
        let iter = self.testlist()?;
        let body = self.loop_body()?;
        let orelse = if self.eat_kw("else") { self.block()? } else { Vec::new() };
        Ok(StmtKind::For {
            target,
            iter,
            body,
            orelse,
        })
    }

    fn for_target(&mut self) -> PResult<Target> {
        let first = self.arith()?;
        if !self.check_op(",") {
            return to_target(first, self.line());
        }
        let mut items = vec![first];
        while self.eat_op(",") {
            if self.check_kw("in") {
                break;
            }
            items.push(self.arith()?);
        }
        to_target(Expr::List(items), self.line())
    }

    fn def_stmt(&mut self) -> PResult<StmtKind> {
        let line = self.line();
        self.expect_kw("def")?;
        let name = self.expect_name()?;
        self.expect_op("(")?;
        let (params, star, kwstar) = self.params(")")?;
        if self.eat_op("->") {
            self.test()?;
        }
        let saved_loops = std::mem::take(&mut self.loop_depth);
        self.fn_depth += 1;
        let body = self.block();
        self.fn_depth -= 1;
        self.loop_depth = saved_loops;
        Ok(StmtKind::Def(Rc::new(FunctionDef {
            name: name.into(),
            params,
            star,
            kwstar,
            body: body?,
            line,
        })))
    }

    /// Parameter list up to (and including) `close`.
    fn params(&mut self, close: &str) -> PResult<(Vec<Param>, Option<String>, Option<String>)> {
        let mut params: Vec<Param> = Vec::new();
        let mut star = None;
        let mut kwstar = None;
        while !self.eat_op(close) {
            if self.eat_op("**") {
                kwstar = Some(self.expect_name()?);
            } else if self.eat_op("*") {
                star = Some(self.expect_name()?);
            } else {
                if star.is_some() || kwstar.is_some() {
                    return Err(self.error("keyword-only parameters are not supported"));
                }
                let name = self.expect_name()?;
                let default = if self.eat_op("=") { Some(self.test()?) } else { None };
                if default.is_none() && params.iter().any(|p| p.default.is_some()) {
                    return Err(self.error("non-default argument follows default argument"));
                }
                params.push(Param { name, default });
            }
            if !self.eat_op(",") {
                self.expect_op(close)?;
                break;
            }
        }
        Ok((params, star, kwstar))
    }

    fn try_stmt(&mut self) -> PResult<StmtKind> {
        self.expect_kw("try")?;
        let body = self.block()?;
        let mut handlers = Vec::new();
        while self.eat_kw("except") {
            let (matcher, name) = if self.check_op(":") {
                (None, None)
            } else {
                let matcher = self.test()?;
                let name = if self.eat_kw("as") { Some(self.expect_name()?) } else { None };
                (Some(matcher), name)
            };
            handlers.push(Handler {
                matcher,
                name,
                body: self.block()?,
            });
        }
        let orelse = if !handlers.is_empty() && self.eat_kw("else") {
            self.block()?
        } else {
            Vec::new()
        };
        let finally = if self.eat_kw("finally") { self.block()? } else { Vec::new() };
        if handlers.is_empty() && finally.is_empty() {
            return Err(self.error("expected 'except' or 'finally' block"));
        }
        Ok(StmtKind::Try {
            body,
            handlers,
            orelse,
            finally,
        })
    }

    fn simple(&mut self) -> PResult<Stmt> {
        let line = self.line();
        let keyword = match self.peek() {
            Tok::Name(n) => n.clone(),
            _ => String::new(),
        };
        let kind = match keyword.as_str() {
            "pass" => {
                self.pos += 1;
                StmtKind::Pass
            }
            "break" | "continue" => {
                self.pos += 1;
                if self.loop_depth == 0 {
                    return Err(SyntaxError::new(format!("'{keyword}' outside loop"), line));
                }
                if keyword == "break" {
                    StmtKind::Break
                } else {
                    StmtKind::Continue
                }
            }
            "return" => {
                self.pos += 1;
                if self.fn_depth == 0 {
                    return Err(SyntaxError::new("'return' outside function", line));
                }
                let value = if self.at_clause_end() { None } else { Some(self.testlist()?) };
                StmtKind::Return(value)
            }
            "del" => {
                self.pos += 1;
                let mut targets = vec![to_target(self.test()?, line)?];
                while self.eat_op(",") {
                    if self.at_clause_end() {
                        break;
                    }
                    targets.push(to_target(self.test()?, line)?);
                }
                StmtKind::Del(targets)
            }
            "global" => {
                self.pos += 1;
                let mut names = vec![self.expect_name()?];
                while self.eat_op(",") {
                    names.push(self.expect_name()?);
                }
                StmtKind::Global(names)
            }
            "raise" => {
                self.pos += 1;
                let exc = if self.at_clause_end() { None } else { Some(self.test()?) };
                if self.eat_kw("from") {
                    self.test()?;
                }
                StmtKind::Raise(exc)
            }
            "assert" => {
                self.pos += 1;
                let test = self.test()?;
                let msg = if self.eat_op(",") { Some(self.test()?) } else { None };
                StmtKind::Assert { test, msg }
            }
            "import" | "from" => {
                self.pos += 1;
                let module = match self.advance() {
                    Tok::Name(name) => name,
                    _ => return Err(SyntaxError::new("expected a module name", line)),
                };
                while !matches!(self.peek(), Tok::Newline | Tok::Eof) && !self.check_op(";") {
                    self.pos += 1;
                }
                StmtKind::Import(module)
            }
            _ => self.expr_stmt(line)?,
        };
        Ok(Stmt { kind, line })
    }

    fn expr_stmt(&mut self, line: u32) -> PResult<StmtKind> {
        let first = self.testlist()?;
        if self.check_op("=") {
            let mut targets = vec![to_target(first, line)?];
            loop {
                self.expect_op("=")?;
                let next = self.testlist()?;
                if self.check_op("=") {
                    targets.push(to_target(next, line)?);
                } else {
                    return Ok(StmtKind::Assign {
                        targets,
                        value: next,
                    });
                }
            }
        }
        let op = match self.peek() {
            Tok::Op("+=") => Some(BinOp::Add),
            Tok::Op("-=") => Some(BinOp::Sub),
            Tok::Op("*=") => Some(BinOp::Mul),
            Tok::Op("/=") => Some(BinOp::Div),
            Tok::Op("//=") => Some(BinOp::FloorDiv),
            Tok::Op("%=") => Some(BinOp::Mod),
            Tok::Op("**=") => Some(BinOp::Pow),
            _ => None,
        };
        if let Some(op) = op {
            self.pos += 1;
            let target = match to_target(first, line)? {
                Target::Tuple(_) => {
                    return Err(SyntaxError::new(
                        "illegal expression for augmented assignment",
                        line,
                    ))
                }
                target => target,
            };
            let value = self.testlist()?;
            return Ok(StmtKind::AugAssign { target, op, value });
        }
        Ok(StmtKind::Expr(first))
    }

    // ----- expressions -----

    fn testlist(&mut self) -> PResult<Expr> {
        let first = self.test()?;
        if !self.check_op(",") {
            return Ok(first);
        }
        let mut items = vec![first];
        while self.eat_op(",") {
            if self.at_clause_end() {
                break;
            }
            items.push(self.test()?);
        }
        Ok(Expr::List(items))
    }

    fn test(&mut self) -> PResult<Expr> {
        self.nested(Self::conditional)
    }

    fn conditional(&mut self) -> PResult<Expr> {
        if self.eat_kw("lambda") {
            return self.lambda();
        }
        let expr = self.or_test()?;
        if self.eat_kw("if") {
            let test = self.or_test()?;
            self.expect_kw("else")?;
            let orelse = self.test()?;
            return Ok(Expr::IfElse {
                test: Box::new(test),
                body: Box::new(expr),
                orelse: Box::new(orelse),
            });
        }
        Ok(expr)
    }

    fn lambda(&mut self) -> PResult<Expr> {
        let line = self.line();
        let (params, star, kwstar) = self.params(":")?;
        let body = self.test()?;
        Ok(Expr::Lambda(Rc::new(FunctionDef {
            name: "<lambda>".into(),
            params,
            star,
            kwstar,
            body: vec![Stmt {
                kind: StmtKind::Return(Some(body)),
                line,
            }],
            line,
        })))
    }

    fn or_test(&mut self) -> PResult<Expr> {
        let mut left = self.and_test()?;
        let mark = self.depth_remaining;
        while self.eat_kw("or") {
            self.descend()?;
            let right = self.and_test()?;
            left = Expr::Or(Box::new(left), Box::new(right));
        }
        self.depth_remaining = mark;
        Ok(left)
    }

    fn and_test(&mut self) -> PResult<Expr> {
        let mut left = self.not_test()?;
        let mark = self.depth_remaining;
        while self.eat_kw("and") {
            self.descend()?;
            let right = self.not_test()?;
            left = Expr::And(Box::new(left), Box::new(right));
        }
        self.depth_remaining = mark;
        Ok(left)
    }

    fn not_test(&mut self) -> PResult<Expr> {
        if self.eat_kw("not") {
            let operand = self.nested(Self::not_test)?;
            return Ok(Expr::Unary(UnaryOp::Not, Box::new(operand)));
        }
        self.comparison()
    }

    fn comparison(&mut self) -> PResult<Expr> {
        let left = self.arith()?;
        let mut rest = Vec::new();
        loop {
            let op = match self.peek() {
                Tok::Op("==") => CmpOp::Eq,
                Tok::Op("!=") => CmpOp::NotEq,
                Tok::Op("<") => CmpOp::Lt,
                Tok::Op("<=") => CmpOp::LtE,
                Tok::Op(">") => CmpOp::Gt,
                Tok::Op(">=") => CmpOp::GtE,
                Tok::Name(n) if n == "in" => CmpOp::In,
                Tok::Name(n) if n == "not" && matches!(self.peek_at(1), Tok::Name(m) if m == "in") => {
                    self.pos += 1;
                    CmpOp::NotIn
                }
                Tok::Name(n) if n == "is" => {
                    if matches!(self.peek_at(1), Tok::Name(m) if m == "not") {
                        self.pos += 1;
                        CmpOp::IsNot
                    } else {
                        CmpOp::Is
                    }
                }
                _ => break,
            };
            self.pos += 1;
            rest.push((op, self.arith()?));
        }
        if rest.is_empty() {
            Ok(left)
        } else {
            Ok(Expr::Compare(Box::new(left), rest))
        }
    }

    fn arith(&mut self) -> PResult<Expr> {
        let mut left = self.term()?;
        let mark = self.depth_remaining;
        loop {
            let op = match self.peek() {
                Tok::Op("+") => BinOp::Add,
                Tok::Op("-") => BinOp::Sub,
                _ => break,
            };
            self.pos += 1;
            self.descend()?;
            let right = self.term()?;
            left = Expr::Binary(Box::new(left), op, Box::new(right));
        }
        self.depth_remaining = mark;
        Ok(left)
    }

    fn term(&mut self) -> PResult<Expr> {
        let mut left = self.factor()?;
        let mark = self.depth_remaining;
        loop {
            let op = match self.peek() {
                Tok::Op("*") => BinOp::Mul,
                Tok::Op("/") => BinOp::Div,
                Tok::Op("//") => BinOp::FloorDiv,
                Tok::Op("%") => BinOp::Mod,
                _ => break,
            };
            self.pos += 1;
            self.descend()?;
            let right = self.factor()?;
            left = Expr::Binary(Box::new(left), op, Box::new(right));
        }
        self.depth_remaining = mark;
        Ok(left)
    }

    fn factor(&mut self) -> PResult<Expr> {
        if self.eat_op("-") {
            return Ok(Expr::Unary(UnaryOp::Neg, Box::new(self.nested(Self::factor)?)));
        }
        if self.eat_op("+") {
            return Ok(Expr::Unary(UnaryOp::Pos, Box::new(self.nested(Self::factor)?)));
        }
        let base = self.postfix()?;
        if self.eat_op("**") {
            let exponent = self.nested(Self::factor)?;
            return Ok(Expr::Binary(Box::new(base), BinOp::Pow, Box::new(exponent)));
        }
        Ok(base)
    }

    fn postfix(&mut self) -> PResult<Expr> {
        let mut expr = self.atom()?;
        let mark = self.depth_remaining;
        loop {
            if self.check_op("(") || self.check_op("[") || self.check_op(".") {
                self.descend()?;
            }
            if self.eat_op("(") {
                let args = self.call_args()?;
                expr = Expr::Call {
                    func: Box::new(expr),
                    args,
                };
            } else if self.eat_op("[") {
                expr = self.subscript(expr)?;
            } else if self.eat_op(".") {
                let name = match self.advance() {
                    Tok::Name(name) => name,
                    _ => return Err(self.error("expected an attribute name")),
                };
                expr = Expr::Attr(Box::new(expr), name);
            } else {
                self.depth_remaining = mark;
                return Ok(expr);
            }
        }
    }

    fn subscript(&mut self, obj: Expr) -> PResult<Expr> {
        let lower = if self.check_op(":") { None } else { Some(self.test()?) };
        if !self.eat_op(":") {
            self.expect_op("]")?;
            let index = lower.ok_or_else(|| self.error("empty subscript"))?;
            return Ok(Expr::Index(Box::new(obj), Box::new(index)));
        }
        let upper = if self.check_op("]") || self.check_op(":") {
            None
        } else {
            Some(Box::new(self.test()?))
        };
        if self.check_op(":") {
            return Err(self.error("slice steps are not supported"));
        }
        self.expect_op("]")?;
        Ok(Expr::Slice {
            obj: Box::new(obj),
            lower: lower.map(Box::new),
            upper,
        })
    }

    fn call_args(&mut self) -> PResult<Vec<Arg>> {
        let mut args = Vec::new();
        while !self.eat_op(")") {
            if self.eat_op("**") {
                args.push(Arg::KwStar(self.test()?));
            } else if self.eat_op("*") {
                args.push(Arg::Star(self.test()?));
            } else if matches!(self.peek(), Tok::Name(n) if !is_keyword(n))
                && matches!(self.peek_at(1), Tok::Op("="))
            {
                let name = self.expect_name()?;
                self.pos += 1;
                args.push(Arg::Kw(name, self.test()?));
            } else {
                let value = self.test()?;
                if self.check_kw("for") {
                    args.push(Arg::Pos(self.comprehension(value)?));
                } else {
                    args.push(Arg::Pos(value));
                }
            }
            if !self.eat_op(",") {
                self.expect_op(")")?;
                break;
            }
        }
        Ok(args)
    }

    fn comprehension(&mut self, elt: Expr) -> PResult<Expr> {
        self.expect_kw("for")?;
        let target = self.for_target()?;
        self.expect_kw("in")?;
        let iter = self.or_test()?;
        let cond = if self.eat_kw("if") {
            Some(Box::new(self.or_test()?))
        } else {
            None
        };
        if self.check_kw("for") {
            return Err(self.error("nested comprehensions are not supported"));
        }
        Ok(Expr::ListComp {
            elt: Box::new(elt),
            target: Box::new(target),
            iter: Box::new(iter),
            cond,
        })
    }

    fn atom(&mut self) -> PResult<Expr> {
        let line = self.line();
        match self.advance() {
            Tok::Op("(") => {
                if self.eat_op(")") {
                    return Ok(Expr::List(Vec::new()));
                }
                let first = self.test()?;
                let expr = if self.check_kw("for") {
                    self.comprehension(first)?
                } else if self.check_op(",") {
                    let mut items = vec![first];
                    while self.eat_op(",") {
                        if self.check_op(")") {
                            break;
                        }
                        items.push(self.test()?);
                    }
                    Expr::List(items)
                } else {
                    first
                };
                self.expect_op(")")?;
                Ok(expr)
            }
            Tok::Op("[") => {
                if self.eat_op("]") {
                    return Ok(Expr::List(Vec::new()));
                }
                let first = self.test()?;
                if self.check_kw("for") {
                    let comp = self.comprehension(first)?;
                    self.expect_op("]")?;
                    return Ok(comp);
                }
                let mut items = vec![first];
                while self.eat_op(",") {
                    if self.check_op("]") {
                        break;
                    }
                    items.push(self.test()?);
                }
                self.expect_op("]")?;
                Ok(Expr::List(items))
            }
            Tok::Op("{") => {
                let mut entries = Vec::new();
                while !self.eat_op("}") {
                    let key = self.test()?;
                    if !self.eat_op(":") {
                        return Err(SyntaxError::new("set literals are not supported", line));
                    }
                    let value = self.test()?;
                    if self.check_kw("for") {
                        return Err(SyntaxError::new(
                            "dict comprehensions are not supported",
                            line,
                        ));
                    }
                    entries.push((key, value));
                    if !self.eat_op(",") {
                        self.expect_op("}")?;
                        break;
                    }
                }
                Ok(Expr::Dict(entries))
            }
            Tok::Op("...") => Ok(Expr::Const(Const::None)),
            Tok::Name(name) => match name.as_str() {
                "None" => Ok(Expr::Const(Const::None)),
                "True" => Ok(Expr::Const(Const::Bool(true))),
                "False" => Ok(Expr::Const(Const::Bool(false))),
                kw if is_keyword(kw) => Err(SyntaxError::new(
                    format!("invalid syntax near '{kw}'"),
                    line,
                )),
                _ => Ok(Expr::Name(name)),
            },
            Tok::Int(i) => Ok(Expr::Const(Const::Int(i))),
            Tok::Float(f) => Ok(Expr::Const(Const::Float(f))),
            Tok::Str(text) => self.strings(Some(text), None, line),
            Tok::FStr(text) => self.strings(None, Some(text), line),
            tok => Err(SyntaxError::new(format!("invalid syntax near {tok}"), line)),
        }
    }

    /// Adjacent string literals concatenate.
    fn strings(&mut self, plain: Option<String>, formatted: Option<String>, line: u32) -> PResult<Expr> {
        let mut parts = Vec::new();
        let mut any_formatted = false;
        let mut push = |plain: Option<String>, formatted: Option<String>| -> PResult<()> {
            if let Some(text) = plain {
                parts.push(FPart::Lit(text));
            }
            if let Some(text) = formatted {
                any_formatted = true;
                parts.extend(parse_fstring(&text, line)?);
            }
            Ok(())
        };
        push(plain, formatted)?;
        loop {
            match self.peek().clone() {
                Tok::Str(text) => {
                    self.pos += 1;
                    push(Some(text), None)?;
                }
                Tok::FStr(text) => {
                    self.pos += 1;
                    push(None, Some(text))?;
                }
                _ => break,
            }
        }
        if any_formatted {
            return Ok(Expr::FString(parts));
        }
        let text: String = parts
            .into_iter()
            .map(|part| match part {
                FPart::Lit(text) => text,
                FPart::Expr { .. } => String::new(),
            })
            .collect();
        Ok(Expr::Const(Const::Str(text.into())))
    }
}

fn to_target(expr: Expr, line: u32) -> PResult<Target> {
    match expr {
        Expr::Name(name) => Ok(Target::Name(name)),
        Expr::Index(obj, index) => Ok(Target::Index {
            obj: *obj,
            index: *index,
        }),
        Expr::List(items) => items
            .into_iter()
            .map(|item| to_target(item, line))
            .collect::<PResult<Vec<_>>>()
            .map(Target::Tuple),
        Expr::Attr(..) => Err(SyntaxError::new("attribute assignment is not supported", line)),
        Expr::Slice { .. } => Err(SyntaxError::new("slice assignment is not supported", line)),
        _ => Err(SyntaxError::new("cannot assign to expression", line)),
    }
}

fn parse_fstring(body: &str, line: u32) -> PResult<Vec<FPart>> {
    let chars: Vec<char> = body.chars().collect();
    let mut parts = Vec::new();
    let mut literal = String::new();
    let mut i = 0;
    while i < chars.len() {
        let c = chars[i];
        if c == '}' {
            if chars.get(i + 1) == Some(&'}') {
                literal.push('}');
                i += 2;
                continue;
            }
            return Err(SyntaxError::new("f-string: single '}' is not allowed", line));
        }
        if c != '{' {
            literal.push(c);
            i += 1;
            continue;
        }
        if chars.get(i + 1) == Some(&'{') {
            literal.push('{');
            i += 2;
            continue;
        }
        if !literal.is_empty() {
            parts.push(FPart::Lit(std::mem::take(&mut literal)));
        }

        // Scan the replacement field up to `!`, `:` or `}` at depth zero.
        let start = i + 1;
        let mut j = start;
        let mut depth = 0usize;
        let mut quote: Option<char> = None;
        while j < chars.len() {
            let ch = chars[j];
            match quote {
                Some(q) if ch == q => quote = None,
                Some(_) => {}
                None => match ch {
                    '\'' | '"' => quote = Some(ch),
                    '(' | '[' | '{' => depth += 1,
                    ')' | ']' => depth = depth.saturating_sub(1),
                    '}' if depth > 0 => depth -= 1,
                    '}' | ':' if depth == 0 => break,
                    '!' if depth == 0 && chars.get(j + 1) != Some(&'=') => break,
                    _ => {}
                },
            }
            j += 1;
        }
        let source: String = chars[start..j].iter().collect();
        if source.trim().is_empty() {
            return Err(SyntaxError::new("f-string: empty expression not allowed", line));
        }
        let expr = parse_expression(&source, line)?;

        let mut repr = false;
        if chars.get(j) == Some(&'!') {
            match chars.get(j + 1) {
                Some('r') => repr = true,
                Some('s') => {}
                _ => return Err(SyntaxError::new("f-string: invalid conversion character", line)),
            }
            j += 2;
        }
        let mut spec = None;
        if chars.get(j) == Some(&':') {
            let spec_start = j + 1;
            j = spec_start;
            while j < chars.len() && chars[j] != '}' {
                j += 1;
            }
            spec = Some(chars[spec_start..j].iter().collect());
        }
        if chars.get(j) != Some(&'}') {
            return Err(SyntaxError::new("f-string: expecting '}'", line));
        }
        parts.push(FPart::Expr { expr, repr, spec });
        i = j + 1;
    }
    if !literal.is_empty() {
        parts.push(FPart::Lit(literal));
    }
    Ok(parts)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn kinds(source: &str) -> Vec<StmtKind> {
        parse_module(source)
            .unwrap()
            .into_iter()
            .map(|s| s.kind)
            .collect()
    }

    #[test]
    fn test_chained_assignment() {
        match &kinds("a = b = 1")[..] {
            [StmtKind::Assign { targets, .. }] => assert_eq!(targets.len(), 2),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_tuple_unpacking_target() {
        match &kinds("a, b = 1, 2")[..] {
            [StmtKind::Assign { targets, value: Expr::List(items) }] => {
                assert!(matches!(&targets[0], Target::Tuple(t) if t.len() == 2));
                assert_eq!(items.len(), 2);
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_def_with_defaults_and_varargs() {
        match &kinds("def f(a, b=2, *rest, **opts):\n    return a\n")[..] {
            [StmtKind::Def(def)] => {
                assert_eq!(&*def.name, "f");
                assert_eq!(def.params.len(), 2);
                assert!(def.params[1].default.is_some());
                assert_eq!(def.star.as_deref(), Some("rest"));
                assert_eq!(def.kwstar.as_deref(), Some("opts"));
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_if_elif_else() {
        let source = "if a:\n    x = 1\nelif b:\n    x = 2\nelse:\n    x = 3\n";
        match &kinds(source)[..] {
            [StmtKind::If { branches, orelse }] => {
                assert_eq!(branches.len(), 2);
                assert_eq!(orelse.len(), 1);
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_try_except_finally() {
        let source = "try:\n    x = 1\nexcept (KeyError, ValueError) as e:\n    pass\nfinally:\n    y = 2\n";
        match &kinds(source)[..] {
            [StmtKind::Try {
                handlers, finally, ..
            }] => {
                assert_eq!(handlers.len(), 1);
                assert_eq!(handlers[0].name.as_deref(), Some("e"));
                assert_eq!(finally.len(), 1);
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_fstring_parts() {
        match &kinds("f'Hello {name!r:>8} {{x}}'")[..] {
            [StmtKind::Expr(Expr::FString(parts))] => {
                assert_eq!(parts.len(), 3);
                assert!(matches!(&parts[1], FPart::Expr { repr: true, spec: Some(s), .. } if s == ">8"));
                assert!(matches!(&parts[2], FPart::Lit(s) if s == " {x}"));
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_adjacent_strings_concatenate() {
        match &kinds("'a' 'b'")[..] {
            [StmtKind::Expr(Expr::Const(Const::Str(s)))] => assert_eq!(&**s, "ab"),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_comprehension_and_generator_argument() {
        assert!(matches!(
            &kinds("[x * 2 for x in xs if x]")[..],
            [StmtKind::Expr(Expr::ListComp { cond: Some(_), .. })]
        ));
        assert!(matches!(
            &kinds("sum(x for x in xs)")[..],
            [StmtKind::Expr(Expr::Call { .. })]
        ));
    }

    #[test]
    fn test_context_errors() {
        assert!(parse_module("return 1").is_err());
        assert!(parse_module("break").is_err());
        assert!(parse_module("def f():\n    for x in y:\n        pass\n    break\n").is_err());
    }

    #[test]
    fn test_unsupported_statements() {
        let err = parse_module("class A:\n    pass\n").unwrap_err();
        assert!(err.message.contains("class"));
        assert!(parse_module("x.y = 1").is_err());
    }

    #[test]
    fn test_import_is_parsed() {
        assert!(matches!(
            &kinds("import os.path as p")[..],
            [StmtKind::Import(m)] if m == "os"
        ));
    }

    #[test]
    fn test_nesting_budget() {
        let depth = usize::from(MAX_NESTING_DEPTH) / 2;
        let shallow = format!("{}1{}", "(".repeat(depth), ")".repeat(depth));
        assert!(parse_module(&shallow).is_ok());

        let err = parse_module(&format!("{}1{}", "(".repeat(5000), ")".repeat(5000))).unwrap_err();
        assert_eq!(err.message, "too many nested parentheses");
        assert!(parse_module(&format!("x = {}1", "-".repeat(5000))).is_err());
        assert!(parse_module(&format!("x = 1{}", " + 1".repeat(5000))).is_err());
        assert!(parse_module(&format!("x = f{}", "()".repeat(5000))).is_err());
    }

    #[test]
    fn test_deeply_indented_blocks_hit_the_budget() {
        let mut source = String::new();
        for level in 0..usize::from(MAX_NESTING_DEPTH) + 1 {
            source.push_str(&" ".repeat(level));
            source.push_str("if x:\n");
        }
        source.push_str(&" ".repeat(usize::from(MAX_NESTING_DEPTH) + 1));
        source.push_str("pass\n");
        let err = parse_module(&source).unwrap_err();
        assert_eq!(err.message, "too many nested parentheses");
    }

    #[test]
    fn test_syntax_error_line() {
        let err = parse_module("x = 1\ny = (\n").unwrap_err();
        assert!(err.line >= 2);
    }
}
