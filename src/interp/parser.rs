//! Recursive-descent parser producing [`Block`]s

use std::rc::Rc;

use super::ast::*;
use super::error::SyntaxError;
use super::lexer::{tokenize, Tok, Token};

const KEYWORDS: &[&str] = &[
    "False", "None", "True", "and", "as", "assert", "async", "await", "break", "class",
    "continue", "def", "del", "elif", "else", "except", "finally", "for", "from", "global", "if",
    "import", "in", "is", "lambda", "nonlocal", "not", "or", "pass", "raise", "return", "try",
    "while", "with", "yield",
];

/// Parse a whole source unit.
pub fn parse_module(source: &str) -> Result<Block, SyntaxError> {
    let mut parser = Parser::new(tokenize(source)?);
    let mut body = Vec::new();
    while !matches!(parser.peek(), Tok::Eof) {
        parser.statement(&mut body)?;
    }
    Ok(body.into())
}

/// Parse a single expression, reporting errors at `line`.
pub fn parse_expression(source: &str, line: u32) -> Result<Expr, SyntaxError> {
    let mut tokens = tokenize(source.trim())?;
    for token in &mut tokens {
        token.line = line;
    }
    let mut parser = Parser::new(tokens);
    let expr = parser.expr()?;
    if matches!(parser.peek(), Tok::Newline) {
        parser.advance();
    }
    match parser.peek() {
        Tok::Eof => Ok(expr),
        _ => Err(parser.error("invalid syntax")),
    }
}

/// Dotted names of every module imported anywhere in `source`, in order of
/// appearance. `from a.b import c` yields `a.b`.
pub fn imported_modules(source: &str) -> Result<Vec<String>, SyntaxError> {
    fn walk(block: &[Stmt], out: &mut Vec<String>) {
        for stmt in block {
            match &stmt.kind {
                StmtKind::Import { module, .. } | StmtKind::FromImport { module, .. } => {
                    out.push(module.join("."))
                }
                StmtKind::If { branches, orelse } => {
                    for (_, _, body) in branches {
                        walk(body, out);
                    }
                    if let Some(body) = orelse {
                        walk(body, out);
                    }
                }
                StmtKind::While { body, .. } | StmtKind::For { body, .. } => walk(body, out),
                StmtKind::Def(def) => walk(&def.body, out),
                StmtKind::Try {
                    body,
                    handlers,
                    orelse,
                    finally,
                } => {
                    walk(body, out);
                    for handler in handlers {
                        walk(&handler.body, out);
                    }
                    for body in [orelse, finally].into_iter().flatten() {
                        walk(body, out);
                    }
                }
                _ => {}
            }
        }
    }

    let block = parse_module(source)?;
    let mut modules = Vec::new();
    walk(&block, &mut modules);
    Ok(modules)
}

struct Parser {
    tokens: Vec<Token>,
    pos: usize,
    loop_depth: usize,
    func_depth: usize,
}

impl Parser {
    fn new(tokens: Vec<Token>) -> Self {
        Self {
            tokens,
            pos: 0,
            loop_depth: 0,
            func_depth: 0,
        }
    }

    fn peek(&self) -> &Tok {
        self.peek_at(0)
    }

    fn peek_at(&self, offset: usize) -> &Tok {
        let idx = (self.pos + offset).min(self.tokens.len().saturating_sub(1));
        self.tokens.get(idx).map(|t| &t.tok).unwrap_or(&Tok::Eof)
    }

    fn line(&self) -> u32 {
        let idx = self.pos.min(self.tokens.len().saturating_sub(1));
        self.tokens.get(idx).map(|t| t.line).unwrap_or(1)
    }

    fn advance(&mut self) -> Tok {
        let tok = self.peek().clone();
        if self.pos < self.tokens.len() {
            self.pos += 1;
        }
        tok
    }

    fn error(&self, message: impl Into<String>) -> SyntaxError {
        SyntaxError::new("SyntaxError", message, self.line())
    }

    fn check_op(&self, op: &str) -> bool {
        matches!(self.peek(), Tok::Op(o) if *o == op)
    }

    fn eat_op(&mut self, op: &str) -> bool {
        if self.check_op(op) {
            self.advance();
            true
        } else {
            false
        }
    }

    fn expect_op(&mut self, op: &str) -> Result<(), SyntaxError> {
        if self.eat_op(op) {
            Ok(())
        } else {
            Err(self.error(format!("expected '{op}'")))
        }
    }

    fn check_kw(&self, kw: &str) -> bool {
        matches!(self.peek(), Tok::Name(n) if n == kw)
    }

    fn eat_kw(&mut self, kw: &str) -> bool {
        if self.check_kw(kw) {
            self.advance();
            true
        } else {
            false
        }
    }

    fn expect_kw(&mut self, kw: &str) -> Result<(), SyntaxError> {
        if self.eat_kw(kw) {
            Ok(())
        } else {
            Err(self.error(format!("expected '{kw}'")))
        }
    }

    fn ident(&mut self) -> Result<String, SyntaxError> {
        match self.peek() {
            Tok::Name(name) if !KEYWORDS.contains(&name.as_str()) => {
                let name = name.clone();
                self.advance();
                Ok(name)
            }
            _ => Err(self.error("expected a name")),
        }
    }

    fn expect_newline(&mut self) -> Result<(), SyntaxError> {
        match self.peek() {
            Tok::Newline => {
                self.advance();
                Ok(())
            }
            Tok::Eof | Tok::Dedent => Ok(()),
            _ => Err(self.error("invalid syntax")),
        }
    }

    // ---- statements ----

    fn statement(&mut self, out: &mut Vec<Stmt>) -> Result<(), SyntaxError> {
        let keyword = match self.peek() {
            Tok::Indent => {
                return Err(SyntaxError::new(
                    "IndentationError",
                    "unexpected indent",
                    self.line(),
                ))
            }
            Tok::Name(name) => name.clone(),
            _ => String::new(),
        };

        match keyword.as_str() {
            "if" => out.push(self.if_statement()?),
            "while" => out.push(self.while_statement()?),
            "for" => out.push(self.for_statement()?),
            "def" => out.push(self.def_statement()?),
            "try" => out.push(self.try_statement()?),
            "class" | "with" | "lambda" | "async" | "await" | "yield" | "del" | "nonlocal" => {
                return Err(self.error(format!("'{keyword}' is not supported")))
            }
            _ => self.simple_line(out)?,
        }
        Ok(())
    }

    fn simple_line(&mut self, out: &mut Vec<Stmt>) -> Result<(), SyntaxError> {
        loop {
            out.push(self.simple_statement()?);
            if self.eat_op(";") && !matches!(self.peek(), Tok::Newline | Tok::Eof) {
                continue;
            }
            break;
        }
        self.expect_newline()
    }

    fn suite(&mut self) -> Result<Block, SyntaxError> {
        self.expect_op(":")?;
        let mut body = Vec::new();
        if matches!(self.peek(), Tok::Newline) {
            self.advance();
            if !matches!(self.peek(), Tok::Indent) {
                return Err(SyntaxError::new(
                    "IndentationError",
                    "expected an indented block",
                    self.line(),
                ));
            }
            self.advance();
            while !matches!(self.peek(), Tok::Dedent | Tok::Eof) {
                self.statement(&mut body)?;
            }
            if matches!(self.peek(), Tok::Dedent) {
                self.advance();
            }
        } else {
            self.simple_line(&mut body)?;
        }
        Ok(body.into())
    }

    fn loop_suite(&mut self) -> Result<Block, SyntaxError> {
        self.loop_depth += 1;
        let body = self.suite();
        self.loop_depth -= 1;
        body
    }

    fn if_statement(&mut self) -> Result<Stmt, SyntaxError> {
        let line = self.line();
        self.advance();
        let cond = self.expr()?;
        let body = self.suite()?;
        let mut branches = vec![(line, cond, body)];
        let mut orelse = None;
        loop {
            if self.check_kw("elif") {
                let elif_line = self.line();
                self.advance();
                let cond = self.expr()?;
                let body = self.suite()?;
                branches.push((elif_line, cond, body));
            } else if self.eat_kw("else") {
                orelse = Some(self.suite()?);
                break;
            } else {
                break;
            }
        }
        Ok(Stmt {
            line,
            kind: StmtKind::If { branches, orelse },
        })
    }

    fn while_statement(&mut self) -> Result<Stmt, SyntaxError> {
        let line = self.line();
        self.advance();
        let cond = self.expr()?;
        let body = self.loop_suite()?;
        Ok(Stmt {
            line,
            kind: StmtKind::While { cond, body },
        })
    }

    fn for_statement(&mut self) -> Result<Stmt, SyntaxError> {
        let line = self.line();
        self.advance();
        let mut items = vec![self.primary()?];
        while self.eat_op(",") {
            if self.check_kw("in") {
                break;
            }
            items.push(self.primary()?);
        }
        let target_expr = if items.len() == 1 {
            items.remove(0)
        } else {
            Expr::Tuple(items)
        };
        let target = self.to_target(target_expr)?;
        self.expect_kw("in")?;
        let iter = self.exprlist()?;
        let body = self.loop_suite()?;
        Ok(Stmt {
            line,
            kind: StmtKind::For { target, iter, body },
        })
    }

    fn def_statement(&mut self) -> Result<Stmt, SyntaxError> {
        let line = self.line();
        self.advance();
        let name = self.ident()?;
        self.expect_op("(")?;
        let mut params: Vec<Param> = Vec::new();
        while !self.check_op(")") {
            if self.check_op("*") || self.check_op("**") {
                return Err(self.error("variadic parameters are not supported"));
            }
            let param = self.ident()?;
            if self.eat_op(":") {
                self.expr()?;
            }
            let default = if self.eat_op("=") {
                Some(self.expr()?)
            } else {
                if params.iter().any(|p| p.default.is_some()) {
                    return Err(self.error("non-default argument follows default argument"));
                }
                None
            };
            params.push(Param {
                name: param,
                default,
            });
            if !self.eat_op(",") {
                break;
            }
        }
        self.expect_op(")")?;
        if self.eat_op("->") {
            self.expr()?;
        }

        let saved_loops = std::mem::replace(&mut self.loop_depth, 0);
        self.func_depth += 1;
        let body = self.suite();
        self.func_depth -= 1;
        self.loop_depth = saved_loops;

        Ok(Stmt {
            line,
            kind: StmtKind::Def(Rc::new(FunctionDef {
                name,
                params,
                body: body?,
                line,
            })),
        })
    }

    fn try_statement(&mut self) -> Result<Stmt, SyntaxError> {
        let line = self.line();
        self.advance();
        let body = self.suite()?;

        let mut handlers = Vec::new();
        while self.check_kw("except") {
            let handler_line = self.line();
            self.advance();
            let kind = if self.check_op(":") {
                None
            } else {
                Some(self.expr()?)
            };
            let name = if self.eat_kw("as") {
                Some(self.ident()?)
            } else {
                None
            };
            let body = self.suite()?;
            handlers.push(Handler {
                line: handler_line,
                kind,
                name,
                body,
            });
        }

        let orelse = if !handlers.is_empty() && self.eat_kw("else") {
            Some(self.suite()?)
        } else {
            None
        };
        let finally = if self.eat_kw("finally") {
            Some(self.suite()?)
        } else {
            None
        };
        if handlers.is_empty() && finally.is_none() {
            return Err(self.error("expected 'except' or 'finally' block"));
        }

        Ok(Stmt {
            line,
            kind: StmtKind::Try {
                body,
                handlers,
                orelse,
                finally,
            },
        })
    }

    fn dotted_name(&mut self) -> Result<Vec<String>, SyntaxError> {
        let mut parts = vec![self.ident()?];
        while self.eat_op(".") {
            parts.push(self.ident()?);
        }
        Ok(parts)
    }

    fn simple_statement(&mut self) -> Result<Stmt, SyntaxError> {
        let line = self.line();
        let keyword = match self.peek() {
            Tok::Name(name) => name.clone(),
            _ => String::new(),
        };

        let kind = match keyword.as_str() {
            "pass" => {
                self.advance();
                StmtKind::Pass
            }
            "break" | "continue" => {
                if self.loop_depth == 0 {
                    return Err(self.error(format!("'{keyword}' outside loop")));
                }
                self.advance();
                if keyword == "break" {
                    StmtKind::Break
                } else {
                    StmtKind::Continue
                }
            }
            "return" => {
                if self.func_depth == 0 {
                    return Err(self.error("'return' outside function"));
                }
                self.advance();
                if self.at_statement_end() {
                    StmtKind::Return(None)
                } else {
                    StmtKind::Return(Some(self.exprlist()?))
                }
            }
            "raise" => {
                self.advance();
                if self.at_statement_end() {
                    StmtKind::Raise(None)
                } else {
                    StmtKind::Raise(Some(self.expr()?))
                }
            }
            "global" => {
                self.advance();
                let mut names = vec![self.ident()?];
                while self.eat_op(",") {
                    names.push(self.ident()?);
                }
                StmtKind::Global(names)
            }
            "import" => {
                self.advance();
                let module = self.dotted_name()?;
                let alias = if self.eat_kw("as") {
                    Some(self.ident()?)
                } else {
                    None
                };
                StmtKind::Import { module, alias }
            }
            "from" => {
                self.advance();
                let module = self.dotted_name()?;
                self.expect_kw("import")?;
                let parens = self.eat_op("(");
                let mut names = Vec::new();
                loop {
                    let name = self.ident()?;
                    let alias = if self.eat_kw("as") {
                        Some(self.ident()?)
                    } else {
                        None
                    };
                    names.push((name, alias));
                    if !self.eat_op(",") || (parens && self.check_op(")")) {
                        break;
                    }
                }
                if parens {
                    self.expect_op(")")?;
                }
                StmtKind::FromImport { module, names }
            }
            _ => self.expression_statement()?,
        };
        Ok(Stmt { line, kind })
    }

    fn expression_statement(&mut self) -> Result<StmtKind, SyntaxError> {
        let first = self.exprlist()?;

        if self.check_op("=") {
            let mut targets = vec![self.to_target(first)?];
            let value = loop {
                self.advance();
                let next = self.exprlist()?;
                if self.check_op("=") {
                    targets.push(self.to_target(next)?);
                } else {
                    break next;
                }
            };
            return Ok(StmtKind::Assign { targets, value });
        }

        if let Some(op) = self.aug_op() {
            self.advance();
            let target = self.to_target(first)?;
            if matches!(target, Target::Tuple(_)) {
                return Err(self.error("illegal expression for augmented assignment"));
            }
            let value = self.exprlist()?;
            return Ok(StmtKind::AugAssign { target, op, value });
        }

        if self.eat_op(":") {
            let target = self.to_target(first)?;
            self.expr()?;
            if self.eat_op("=") {
                let value = self.exprlist()?;
                return Ok(StmtKind::Assign {
                    targets: vec![target],
                    value,
                });
            }
            return Ok(StmtKind::Pass);
        }

        Ok(StmtKind::Expr(first))
    }

    fn aug_op(&self) -> Option<BinOp> {
        match self.peek() {
            Tok::Op("+=") => Some(BinOp::Add),
            Tok::Op("-=") => Some(BinOp::Sub),
            Tok::Op("*=") => Some(BinOp::Mul),
            Tok::Op("/=") => Some(BinOp::Div),
            Tok::Op("//=") => Some(BinOp::FloorDiv),
            Tok::Op("%=") => Some(BinOp::Mod),
            Tok::Op("**=") => Some(BinOp::Pow),
            _ => None,
        }
    }

    fn at_statement_end(&self) -> bool {
        matches!(self.peek(), Tok::Newline | Tok::Eof | Tok::Dedent | Tok::Op(";"))
    }

    fn to_target(&self, expr: Expr) -> Result<Target, SyntaxError> {
        match expr {
            Expr::Name(name) => Ok(Target::Name(name)),
            Expr::Index(obj, index) => Ok(Target::Index(*obj, *index)),
            Expr::Attr(obj, name) => Ok(Target::Attr(*obj, name)),
            Expr::Tuple(items) | Expr::List(items) => Ok(Target::Tuple(
                items
                    .into_iter()
                    .map(|item| self.to_target(item))
                    .collect::<Result<_, _>>()?,
            )),
            _ => Err(self.error("cannot assign to expression")),
        }
    }

    // ---- expressions ----

    fn exprlist(&mut self) -> Result<Expr, SyntaxError> {
        let first = self.expr()?;
        if !self.check_op(",") {
            return Ok(first);
        }
        let mut items = vec![first];
        while self.eat_op(",") {
            if self.at_statement_end()
                || self.check_op("=")
                || self.check_op(")")
                || self.check_op(":")
                || self.aug_op().is_some()
            {
                break;
            }
            items.push(self.expr()?);
        }
        Ok(Expr::Tuple(items))
    }

    fn expr(&mut self) -> Result<Expr, SyntaxError> {
        let value = self.or_expr()?;
        if self.eat_kw("if") {
            let cond = self.or_expr()?;
            self.expect_kw("else")?;
            let orelse = self.expr()?;
            return Ok(Expr::IfElse {
                cond: Box::new(cond),
                then: Box::new(value),
                orelse: Box::new(orelse),
            });
        }
        Ok(value)
    }

    fn or_expr(&mut self) -> Result<Expr, SyntaxError> {
        let mut left = self.and_expr()?;
        while self.eat_kw("or") {
            let right = self.and_expr()?;
            left = Expr::Or(Box::new(left), Box::new(right));
        }
        Ok(left)
    }

    fn and_expr(&mut self) -> Result<Expr, SyntaxError> {
        let mut left = self.not_expr()?;
        while self.eat_kw("and") {
            let right = self.not_expr()?;
            left = Expr::And(Box::new(left), Box::new(right));
        }
        Ok(left)
    }

    fn not_expr(&mut self) -> Result<Expr, SyntaxError> {
        if self.eat_kw("not") {
            return Ok(Expr::Not(Box::new(self.not_expr()?)));
        }
        self.comparison()
    }

    fn comparison(&mut self) -> Result<Expr, SyntaxError> {
        let left = self.arith()?;
        let mut rest = Vec::new();
        loop {
            let op = match self.peek() {
                Tok::Op("==") => CmpOp::Eq,
                Tok::Op("!=") => CmpOp::Ne,
                Tok::Op("<") => CmpOp::Lt,
                Tok::Op("<=") => CmpOp::Le,
                Tok::Op(">") => CmpOp::Gt,
                Tok::Op(">=") => CmpOp::Ge,
                Tok::Name(n) if n == "in" => CmpOp::In,
                Tok::Name(n) if n == "not" && matches!(self.peek_at(1), Tok::Name(m) if m == "in") => {
                    self.advance();
                    CmpOp::NotIn
                }
                Tok::Name(n) if n == "is" => {
                    if matches!(self.peek_at(1), Tok::Name(m) if m == "not") {
                        self.advance();
                        CmpOp::IsNot
                    } else {
                        CmpOp::Is
                    }
                }
                _ => break,
            };
            self.advance();
            rest.push((op, self.arith()?));
        }
        if rest.is_empty() {
            Ok(left)
        } else {
            Ok(Expr::Compare(Box::new(left), rest))
        }
    }

    fn arith(&mut self) -> Result<Expr, SyntaxError> {
        let mut left = self.term()?;
        loop {
            let op = match self.peek() {
                Tok::Op("+") => BinOp::Add,
                Tok::Op("-") => BinOp::Sub,
                _ => break,
            };
            self.advance();
            let right = self.term()?;
            left = Expr::Binary(Box::new(left), op, Box::new(right));
        }
        Ok(left)
    }

    fn term(&mut self) -> Result<Expr, SyntaxError> {
        let mut left = self.factor()?;
        loop {
            let op = match self.peek() {
                Tok::Op("*") => BinOp::Mul,
                Tok::Op("/") => BinOp::Div,
                Tok::Op("//") => BinOp::FloorDiv,
                Tok::Op("%") => BinOp::Mod,
                _ => break,
            };
            self.advance();
            let right = self.factor()?;
            left = Expr::Binary(Box::new(left), op, Box::new(right));
        }
        Ok(left)
    }

    fn factor(&mut self) -> Result<Expr, SyntaxError> {
        if self.eat_op("-") {
            return Ok(Expr::Neg(Box::new(self.factor()?)));
        }
        if self.eat_op("+") {
            return Ok(Expr::Pos(Box::new(self.factor()?)));
        }
        self.power()
    }

    fn power(&mut self) -> Result<Expr, SyntaxError> {
        let base = self.primary()?;
        if self.eat_op("**") {
            let exponent = self.factor()?;
            return Ok(Expr::Binary(Box::new(base), BinOp::Pow, Box::new(exponent)));
        }
        Ok(base)
    }

    fn primary(&mut self) -> Result<Expr, SyntaxError> {
        let mut expr = self.atom()?;
        loop {
            if self.eat_op("(") {
                let (args, kwargs) = self.call_args()?;
                expr = Expr::Call {
                    func: Box::new(expr),
                    args,
                    kwargs,
                };
            } else if self.eat_op("[") {
                let index = self.subscript()?;
                self.expect_op("]")?;
                expr = Expr::Index(Box::new(expr), Box::new(index));
            } else if self.eat_op(".") {
                let name = self.ident()?;
                expr = Expr::Attr(Box::new(expr), name);
            } else {
                break;
            }
        }
        Ok(expr)
    }

    fn call_args(&mut self) -> Result<(Vec<Expr>, Vec<(String, Expr)>), SyntaxError> {
        let mut args = Vec::new();
        let mut kwargs: Vec<(String, Expr)> = Vec::new();
        while !self.check_op(")") {
            let is_keyword = matches!(self.peek(), Tok::Name(_))
                && matches!(self.peek_at(1), Tok::Op("="));
            if is_keyword {
                let name = self.ident()?;
                self.advance();
                if kwargs.iter().any(|(k, _)| *k == name) {
                    return Err(self.error(format!("keyword argument repeated: {name}")));
                }
                kwargs.push((name, self.expr()?));
            } else {
                if !kwargs.is_empty() {
                    return Err(self.error("positional argument follows keyword argument"));
                }
                args.push(self.expr()?);
            }
            if !self.eat_op(",") {
                break;
            }
        }
        self.expect_op(")")?;
        Ok((args, kwargs))
    }

    fn subscript(&mut self) -> Result<Expr, SyntaxError> {
        let lower = if self.check_op(":") {
            None
        } else {
            Some(self.expr()?)
        };
        if !self.eat_op(":") {
            return lower.ok_or_else(|| self.error("invalid syntax"));
        }
        let upper = if self.check_op("]") {
            None
        } else {
            Some(Box::new(self.expr()?))
        };
        Ok(Expr::Slice(lower.map(Box::new), upper))
    }

    fn atom(&mut self) -> Result<Expr, SyntaxError> {
        let line = self.line();
        match self.advance() {
            Tok::Int(v) => Ok(Expr::Const(Const::Int(v))),
            Tok::Float(v) => Ok(Expr::Const(Const::Float(v))),
            tok @ (Tok::Str(_) | Tok::FStr(_)) => self.string_atom(tok, line),
            Tok::Name(name) => match name.as_str() {
                "None" => Ok(Expr::Const(Const::None)),
                "True" => Ok(Expr::Const(Const::Bool(true))),
                "False" => Ok(Expr::Const(Const::Bool(false))),
                kw if KEYWORDS.contains(&kw) => Err(self.error("invalid syntax")),
                _ => Ok(Expr::Name(name)),
            },
            Tok::Op("(") => {
                if self.eat_op(")") {
                    return Ok(Expr::Tuple(Vec::new()));
                }
                let first = self.expr()?;
                if !self.check_op(",") {
                    self.expect_op(")")?;
                    return Ok(first);
                }
                let mut items = vec![first];
                while self.eat_op(",") {
                    if self.check_op(")") {
                        break;
                    }
                    items.push(self.expr()?);
                }
                self.expect_op(")")?;
                Ok(Expr::Tuple(items))
            }
            Tok::Op("[") => {
                let mut items = Vec::new();
                while !self.check_op("]") {
                    items.push(self.expr()?);
                    if self.check_kw("for") {
                        return Err(self.error("comprehensions are not supported"));
                    }
                    if !self.eat_op(",") {
                        break;
                    }
                }
                self.expect_op("]")?;
                Ok(Expr::List(items))
            }
            Tok::Op("{") => {
                let mut items = Vec::new();
                while !self.check_op("}") {
                    let key = self.expr()?;
                    self.expect_op(":")?;
                    let value = self.expr()?;
                    items.push((key, value));
                    if !self.eat_op(",") {
                        break;
                    }
                }
                self.expect_op("}")?;
                Ok(Expr::Dict(items))
            }
            _ => {
                self.pos = self.pos.saturating_sub(1);
                Err(self.error("invalid syntax"))
            }
        }
    }

    /// Adjacent literals concatenate; any f-string among them makes the
    /// whole run an f-string.
    fn string_atom(&mut self, first: Tok, line: u32) -> Result<Expr, SyntaxError> {
        let mut pieces = vec![first];
        while matches!(self.peek(), Tok::Str(_) | Tok::FStr(_)) {
            pieces.push(self.advance());
        }

        if pieces.iter().all(|p| matches!(p, Tok::Str(_))) {
            let text: String = pieces
                .into_iter()
                .filter_map(|p| match p {
                    Tok::Str(s) => Some(s),
                    _ => None,
                })
                .collect();
            return Ok(Expr::Const(Const::Str(Rc::from(text))));
        }

        let mut parts = Vec::new();
        for piece in pieces {
            match piece {
                Tok::Str(s) => parts.push(FPart::Lit(s)),
                Tok::FStr(body) => parts.extend(fstring_parts(&body, line)?),
                _ => {}
            }
        }
        Ok(Expr::FString(parts))
    }
}

fn fstring_parts(body: &str, line: u32) -> Result<Vec<FPart>, SyntaxError> {
    let chars: Vec<char> = body.chars().collect();
    let mut parts = Vec::new();
    let mut literal = String::new();
    let mut i = 0;

    while i < chars.len() {
        let c = chars[i];
        let next = chars.get(i + 1).copied();
        match c {
            '{' if next == Some('{') => {
                literal.push('{');
                i += 2;
            }
            '}' if next == Some('}') => {
                literal.push('}');
                i += 2;
            }
            '}' => {
                return Err(SyntaxError::new(
                    "SyntaxError",
                    "f-string: single '}' is not allowed",
                    line,
                ))
            }
            '{' => {
                let end = matching_brace(&chars, i + 1).ok_or_else(|| {
                    SyntaxError::new("SyntaxError", "f-string: expecting '}'", line)
                })?;
                let inner: String = chars[i + 1..end].iter().collect();
                if !literal.is_empty() {
                    parts.push(FPart::Lit(std::mem::take(&mut literal)));
                }
                parts.push(replacement_field(&inner, line)?);
                i = end + 1;
            }
            _ => {
                literal.push(c);
                i += 1;
            }
        }
    }
    if !literal.is_empty() {
        parts.push(FPart::Lit(literal));
    }
    Ok(parts)
}

fn matching_brace(chars: &[char], start: usize) -> Option<usize> {
    let mut depth = 0usize;
    let mut quote: Option<char> = None;
    for (offset, &c) in chars[start..].iter().enumerate() {
        if let Some(q) = quote {
            if c == q {
                quote = None;
            }
            continue;
        }
        match c {
            '\'' | '"' => quote = Some(c),
            '(' | '[' | '{' => depth += 1,
            ')' | ']' => depth = depth.saturating_sub(1),
            '}' if depth == 0 => return Some(start + offset),
            '}' => depth -= 1,
            _ => {}
        }
    }
    None
}

/// Split `expr[!r][:spec]` and parse the expression part.
fn replacement_field(inner: &str, line: u32) -> Result<FPart, SyntaxError> {
    let chars: Vec<char> = inner.chars().collect();
    let mut depth = 0usize;
    let mut quote: Option<char> = None;
    let mut split = chars.len();
    for (i, &c) in chars.iter().enumerate() {
        if let Some(q) = quote {
            if c == q {
                quote = None;
            }
            continue;
        }
        match c {
            '\'' | '"' => quote = Some(c),
            '(' | '[' | '{' => depth += 1,
            ')' | ']' | '}' => depth = depth.saturating_sub(1),
            '!' if depth == 0 && chars.get(i + 1) != Some(&'=') => {
                split = i;
                break;
            }
            ':' if depth == 0 => {
                split = i;
                break;
            }
            _ => {}
        }
    }

    let expr_src: String = chars[..split].iter().collect();
    if expr_src.trim().is_empty() {
        return Err(SyntaxError::new(
            "SyntaxError",
            "f-string: empty expression not allowed",
            line,
        ));
    }
    let mut rest: String = chars[split..].iter().collect();
    let mut repr = false;
    if let Some(conversion) = rest.strip_prefix('!') {
        let mut conv = conversion.chars();
        match conv.next() {
            Some('r') => repr = true,
            Some('s') => {}
            _ => {
                return Err(SyntaxError::new(
                    "SyntaxError",
                    "f-string: invalid conversion character",
                    line,
                ))
            }
        }
        rest = conv.collect();
    }
    let spec = rest.strip_prefix(':').map(str::to_string);

    Ok(FPart::Expr {
        expr: parse_expression(&expr_src, line)?,
        repr,
        spec,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn lines(block: &Block) -> Vec<u32> {
        block.iter().map(|s| s.line).collect()
    }

    #[test]
    fn test_imported_modules_walks_nested_blocks() {
        let src = "import a\nfrom pkg.mod import x\ndef f():\n    import inner\nif True:\n    import b.c as d\n";
        assert_eq!(
            imported_modules(src).unwrap(),
            vec!["a", "pkg.mod", "inner", "b.c"]
        );
    }

    #[test]
    fn test_statements_carry_their_line_numbers() {
        let block = parse_module("x = 1\n\ndef f(a, b=2):\n    return a + b\nf(x)\n").unwrap();
        assert_eq!(lines(&block), vec![1, 3, 5]);
        match &block[1].kind {
            StmtKind::Def(def) => {
                assert_eq!(def.name, "f");
                assert_eq!(def.params.len(), 2);
                assert_eq!(lines(&def.body), vec![4]);
            }
            other => panic!("expected def, got {other:?}"),
        }
    }

    #[test]
    fn test_elif_branches_keep_their_own_lines() {
        let block = parse_module("if a:\n    pass\nelif b:\n    pass\nelse:\n    pass\n").unwrap();
        match &block[0].kind {
            StmtKind::If { branches, orelse } => {
                assert_eq!(branches.len(), 2);
                assert_eq!(branches[1].0, 3);
                assert!(orelse.is_some());
            }
            other => panic!("expected if, got {other:?}"),
        }
    }

    #[test]
    fn test_chained_and_tuple_assignment() {
        let block = parse_module("a = b = 1\nx, y = y, x\n").unwrap();
        match &block[0].kind {
            StmtKind::Assign { targets, .. } => assert_eq!(targets.len(), 2),
            other => panic!("expected assign, got {other:?}"),
        }
        match &block[1].kind {
            StmtKind::Assign { targets, value } => {
                assert!(matches!(targets[0], Target::Tuple(_)));
                assert!(matches!(value, Expr::Tuple(items) if items.len() == 2));
            }
            other => panic!("expected assign, got {other:?}"),
        }
    }

    #[test]
    fn test_fstring_fields_are_parsed() {
        let expr = parse_expression("f'{name!r} = {value:.2f} {{literal}}'", 7).unwrap();
        match expr {
            Expr::FString(parts) => {
                assert!(matches!(&parts[0], FPart::Expr { repr: true, .. }));
                assert!(matches!(&parts[2], FPart::Expr { spec: Some(s), .. } if s == ".2f"));
                assert!(matches!(&parts[3], FPart::Lit(s) if s == " {literal}"));
            }
            other => panic!("expected f-string, got {other:?}"),
        }
    }

    #[test]
    fn test_misplaced_control_flow_is_rejected() {
        assert!(parse_module("break\n").is_err());
        assert!(parse_module("return 1\n").is_err());
        assert!(parse_module("def f():\n    break\n").is_err());
        assert!(parse_module("while True:\n    def g():\n        continue\n").is_err());
    }

    #[test]
    fn test_unsupported_constructs_report_a_line() {
        let err = parse_module("x = 1\nclass A:\n    pass\n").unwrap_err();
        assert_eq!(err.line, 2);
        assert!(err.message.contains("class"));
    }

    #[test]
    fn test_try_with_handlers_else_and_finally() {
        let src = "try:\n    x = 1\nexcept (ValueError, KeyError) as e:\n    pass\nelse:\n    y = 2\nfinally:\n    z = 3\n";
        let block = parse_module(src).unwrap();
        match &block[0].kind {
            StmtKind::Try {
                handlers,
                orelse,
                finally,
                ..
            } => {
                assert_eq!(handlers.len(), 1);
                assert_eq!(handlers[0].line, 3);
                assert_eq!(handlers[0].name.as_deref(), Some("e"));
                assert!(orelse.is_some());
                assert!(finally.is_some());
            }
            other => panic!("expected try, got {other:?}"),
        }
    }
}
