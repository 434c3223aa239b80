//! Tree-walking evaluator

use std::cell::RefCell;
use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::rc::Rc;

use super::ast::*;
use super::builtins::{self, Builtin};
use super::error::{ExecError, RuntimeError, TraceEntry, Unwind};
use super::frame::{Frame, FrameView, Output, Stream, TraceEvent, TraceHook};
use super::parser::parse_module;
use super::value::{
    new_scope, range_contains, range_len, ExceptionValue, Function, Module, Scope, Value,
};

pub const DEFAULT_RECURSION_LIMIT: usize = 200;

/// Outcome of executing a statement.
#[derive(Debug)]
enum Flow {
    Normal,
    Break,
    Continue,
    Return(Value),
    /// Resume at this line in the nearest enclosing block that has it
    Jump(u32),
}

/// Lazily produced loop items.
enum Items {
    Seq(std::vec::IntoIter<Value>),
    Range { next: i64, remaining: i64, step: i64 },
}

impl Iterator for Items {
    type Item = Value;

    fn next(&mut self) -> Option<Value> {
        match self {
            Items::Seq(iter) => iter.next(),
            Items::Range {
                next,
                remaining,
                step,
            } => {
                if *remaining <= 0 {
                    return None;
                }
                let value = *next;
                // past the last item the value is never read
                *next = next.wrapping_add(*step);
                *remaining -= 1;
                Some(Value::Int(value))
            }
        }
    }
}

/// Runs scripts, reporting every event to an optional [`TraceHook`].
pub struct Interpreter<'h> {
    hook: Option<&'h mut dyn TraceHook>,
    out: &'h mut dyn Output,
    frames: Vec<Frame>,
    next_frame_id: u64,
    modules: HashMap<String, Value>,
    sources: HashMap<Rc<Path>, Rc<[String]>>,
    root: PathBuf,
    recursion_limit: usize,
}

impl<'h> Interpreter<'h> {
    pub fn new(out: &'h mut dyn Output) -> Self {
        Self {
            hook: None,
            out,
            frames: Vec::new(),
            next_frame_id: 0,
            modules: HashMap::new(),
            sources: HashMap::new(),
            root: PathBuf::from("."),
            recursion_limit: DEFAULT_RECURSION_LIMIT,
        }
    }

    pub fn with_hook(mut self, hook: &'h mut dyn TraceHook) -> Self {
        self.hook = Some(hook);
        self
    }

    pub fn with_recursion_limit(mut self, limit: usize) -> Self {
        self.recursion_limit = limit;
        self
    }

    /// Run the script at `path` as `__main__`. Imports resolve relative to
    /// its directory.
    pub fn run_file(&mut self, path: &Path) -> Result<(), ExecError> {
        let source = std::fs::read_to_string(path).map_err(|source| ExecError::Io {
            path: path.display().to_string(),
            source,
        })?;
        self.run_source(path, &source)
    }

    /// Run `source` as `__main__`, attributing it to `unit`.
    pub fn run_source(&mut self, unit: &Path, source: &str) -> Result<(), ExecError> {
        if let Some(parent) = unit.parent() {
            self.root = parent.to_path_buf();
        }
        let block = parse_module(source).map_err(ExecError::Syntax)?;
        let unit: Rc<Path> = Rc::from(unit);
        self.sources
            .insert(unit.clone(), source.lines().map(String::from).collect());

        let globals = module_globals("__main__", &unit);
        self.modules.insert(
            "__main__".into(),
            Value::Module(Rc::new(Module {
                name: "__main__".into(),
                globals: globals.clone(),
            })),
        );

        match self.run_module_frame(unit, globals, &block) {
            Ok(()) => Ok(()),
            Err(Unwind::Error(error)) => {
                let rendered = format!(
                    "{}{}\n",
                    error.format_traceback(|u, l| self.source_line(u, l)),
                    error.summary()
                );
                Err(ExecError::Runtime {
                    error: *error,
                    rendered,
                })
            }
            Err(Unwind::Halt(halt)) => Err(ExecError::Halt(halt)),
        }
    }

    fn source_line(&self, unit: &Path, line: u32) -> Option<String> {
        let lines = self.sources.get(unit)?;
        lines.get(line.checked_sub(1)? as usize).cloned()
    }

    // ---- frames and events ----

    fn frame(&self) -> &Frame {
        self.frames.last().expect("statement executed outside a frame")
    }

    fn frame_mut(&mut self) -> &mut Frame {
        self.frames
            .last_mut()
            .expect("statement executed outside a frame")
    }

    fn fire(&mut self, event: TraceEvent<'_>) -> Result<(), Unwind> {
        let (Some(hook), Some(frame)) = (self.hook.as_mut(), self.frames.last_mut()) else {
            return Ok(());
        };
        let mut view = FrameView::new(frame);
        hook.trace(&mut view, event).map_err(Unwind::Halt)
    }

    /// Fire a line event and return any jump the hook requested.
    fn line_event(&mut self, line: u32) -> Result<Option<u32>, Unwind> {
        self.frame_mut().line = line;
        self.fire(TraceEvent::Line)?;
        Ok(self.frame_mut().jump.take())
    }

    fn push_frame(
        &mut self,
        code_name: Rc<str>,
        unit: Rc<Path>,
        line: u32,
        globals: Scope,
        locals: Option<Scope>,
    ) -> Result<(), Unwind> {
        if self.frames.len() >= self.recursion_limit {
            return Err(RuntimeError::new(
                "RecursionError",
                "maximum recursion depth exceeded",
            )
            .into());
        }
        self.next_frame_id += 1;
        let back = self.frames.last().map(|f| f.id);
        self.frames.push(Frame::new(
            self.next_frame_id,
            back,
            code_name,
            unit,
            line,
            globals,
            locals,
        ));
        Ok(())
    }

    fn run_module_frame(
        &mut self,
        unit: Rc<Path>,
        globals: Scope,
        block: &Block,
    ) -> Result<(), Unwind> {
        self.push_frame(Rc::from("<module>"), unit, 1, globals, None)?;
        let result = self.run_body(block).map(|_| ());
        self.frames.pop();
        result
    }

    /// Execute a frame's body between its call and return events.
    fn run_body(&mut self, block: &Block) -> Result<Value, Unwind> {
        self.fire(TraceEvent::Call)?;
        match self.exec_block(block) {
            Ok(Flow::Return(value)) => {
                self.fire(TraceEvent::Return(&value))?;
                Ok(value)
            }
            Ok(_) => {
                self.fire(TraceEvent::Return(&Value::None))?;
                Ok(Value::None)
            }
            Err(Unwind::Error(err)) => {
                self.fire(TraceEvent::Return(&Value::None))?;
                Err(Unwind::Error(err))
            }
            Err(halt) => Err(halt),
        }
    }

    /// Record `err` against the current frame once, then fire the
    /// exception event.
    fn report(&mut self, err: &mut RuntimeError) -> Result<(), Unwind> {
        let frame = self.frame();
        if err.reported_in == Some(frame.id) {
            return Ok(());
        }
        err.reported_in = Some(frame.id);
        err.traceback.push(TraceEntry {
            unit: frame.unit.clone(),
            line: frame.line,
            name: frame.code_name.clone(),
        });
        let traceback = err.format_traceback(|u, l| self.source_line(u, l));
        self.fire(TraceEvent::Exception {
            error: err,
            traceback: &traceback,
        })
    }

    // ---- statements ----

    fn exec_block(&mut self, block: &Block) -> Result<Flow, Unwind> {
        self.frame_mut().blocks.push(block.clone());
        let result = self.exec_statements(block);
        self.frame_mut().blocks.pop();
        result
    }

    fn exec_statements(&mut self, block: &Block) -> Result<Flow, Unwind> {
        let mut i = 0;
        while i < block.len() {
            match self.exec_stmt(&block[i])? {
                Flow::Normal => i += 1,
                Flow::Jump(line) => match block.iter().position(|s| s.line == line) {
                    Some(target) => i = target,
                    None => return Ok(Flow::Jump(line)),
                },
                flow => return Ok(flow),
            }
        }
        Ok(Flow::Normal)
    }

    fn exec_stmt(&mut self, stmt: &Stmt) -> Result<Flow, Unwind> {
        if let Some(line) = self.line_event(stmt.line)? {
            return Ok(Flow::Jump(line));
        }
        match self.exec_stmt_kind(stmt) {
            Err(Unwind::Error(mut err)) => {
                self.report(&mut err)?;
                Err(Unwind::Error(err))
            }
            other => other,
        }
    }

    fn exec_stmt_kind(&mut self, stmt: &Stmt) -> Result<Flow, Unwind> {
        match &stmt.kind {
            StmtKind::Expr(expr) => {
                self.eval(expr)?;
            }
            StmtKind::Assign { targets, value } => {
                let value = self.eval(value)?;
                for target in targets {
                    self.assign(target, value.clone())?;
                }
            }
            StmtKind::AugAssign { target, op, value } => self.aug_assign(target, *op, value)?,
            StmtKind::If { branches, orelse } => {
                for (i, (line, cond, body)) in branches.iter().enumerate() {
                    if i > 0 {
                        if let Some(jump) = self.line_event(*line)? {
                            return Ok(Flow::Jump(jump));
                        }
                    }
                    if self.eval(cond)?.truthy() {
                        return self.exec_block(body);
                    }
                }
                if let Some(orelse) = orelse {
                    return self.exec_block(orelse);
                }
            }
            StmtKind::While { cond, body } => {
                let mut first = true;
                loop {
                    if !first {
                        if let Some(jump) = self.line_event(stmt.line)? {
                            return Ok(Flow::Jump(jump));
                        }
                    }
                    first = false;
                    if !self.eval(cond)?.truthy() {
                        break;
                    }
                    match self.exec_block(body)? {
                        Flow::Break => break,
                        Flow::Normal | Flow::Continue => {}
                        flow => return Ok(flow),
                    }
                }
            }
            StmtKind::For { target, iter, body } => {
                let iterable = self.eval(iter)?;
                let mut items = match iterable {
                    Value::Range { start, step, .. } => Items::Range {
                        next: start,
                        remaining: range_len(&iterable)?,
                        step,
                    },
                    other => Items::Seq(builtins::iterate(&other)?.into_iter()),
                };
                let mut first = true;
                loop {
                    if !first {
                        if let Some(jump) = self.line_event(stmt.line)? {
                            return Ok(Flow::Jump(jump));
                        }
                    }
                    first = false;
                    let Some(item) = items.next() else { break };
                    self.assign(target, item)?;
                    match self.exec_block(body)? {
                        Flow::Break => break,
                        Flow::Normal | Flow::Continue => {}
                        flow => return Ok(flow),
                    }
                }
            }
            StmtKind::Def(def) => {
                let defaults = def
                    .params
                    .iter()
                    .map(|p| p.default.as_ref().map(|d| self.eval(d)).transpose())
                    .collect::<Result<Vec<_>, _>>()?;
                let frame = self.frame();
                let function = Value::Function(Rc::new(Function {
                    def: def.clone(),
                    defaults,
                    globals: frame.globals.clone(),
                    unit: frame.unit.clone(),
                }));
                frame.store(&def.name, function);
            }
            StmtKind::Return(value) => {
                let value = match value {
                    Some(expr) => self.eval(expr)?,
                    None => Value::None,
                };
                return Ok(Flow::Return(value));
            }
            StmtKind::Pass => {}
            StmtKind::Break => return Ok(Flow::Break),
            StmtKind::Continue => return Ok(Flow::Continue),
            StmtKind::Raise(value) => return Err(self.raise(value.as_ref())?.into()),
            StmtKind::Global(names) => {
                self.frame_mut()
                    .global_names
                    .extend(names.iter().cloned());
            }
            StmtKind::Import { module, alias } => {
                let imported = self.import_module(module)?;
                match alias {
                    Some(alias) => self.frame().store(alias, imported),
                    None => {
                        let top = self.import_module(&module[..1])?;
                        self.frame().store(&module[0], top);
                    }
                }
            }
            StmtKind::FromImport { module, names } => {
                let imported = self.import_module(module)?;
                let Value::Module(source) = &imported else {
                    return Err(RuntimeError::new("ImportError", "not a module").into());
                };
                for (name, alias) in names {
                    let found = source.globals.borrow().get(name).cloned();
                    let value = match found {
                        Some(value) => value,
                        None => {
                            let mut path = module.clone();
                            path.push(name.clone());
                            self.import_module(&path).map_err(|_| {
                                RuntimeError::new(
                                    "ImportError",
                                    format!(
                                        "cannot import name '{name}' from '{}'",
                                        module.join(".")
                                    ),
                                )
                            })?
                        }
                    };
                    self.frame().store(alias.as_deref().unwrap_or(name), value);
                }
            }
            StmtKind::Try {
                body,
                handlers,
                orelse,
                finally,
            } => return self.exec_try(body, handlers, orelse.as_ref(), finally.as_ref()),
        }
        Ok(Flow::Normal)
    }

    fn exec_try(
        &mut self,
        body: &Block,
        handlers: &[Handler],
        orelse: Option<&Block>,
        finally: Option<&Block>,
    ) -> Result<Flow, Unwind> {
        let outcome = match self.exec_block(body) {
            Err(Unwind::Error(err)) => self.handle(err, handlers),
            Ok(Flow::Normal) => match orelse {
                Some(orelse) => self.exec_block(orelse),
                None => Ok(Flow::Normal),
            },
            other => other,
        };

        let Some(finally) = finally else {
            return outcome;
        };
        if matches!(outcome, Err(Unwind::Halt(_))) {
            return outcome;
        }
        match self.exec_block(finally)? {
            Flow::Normal => outcome,
            flow => Ok(flow),
        }
    }

    fn handle(&mut self, err: Box<RuntimeError>, handlers: &[Handler]) -> Result<Flow, Unwind> {
        for handler in handlers {
            let matched = match &handler.kind {
                None => true,
                Some(expr) => self.handler_matches(expr, &err.kind)?,
            };
            if !matched {
                continue;
            }

            if let Some(jump) = self.line_event(handler.line)? {
                return Ok(Flow::Jump(jump));
            }
            if let Some(name) = &handler.name {
                let value = Value::Exception(Rc::new(ExceptionValue {
                    kind: err.kind.clone(),
                    message: err.message.clone(),
                }));
                self.frame().store(name, value);
            }
            let previous = self.frame_mut().handling.replace(err);
            let result = self.exec_block(&handler.body);
            self.frame_mut().handling = previous;
            if let Some(name) = &handler.name {
                self.frame().remove(name);
            }
            return result;
        }
        Err(Unwind::Error(err))
    }

    fn handler_matches(&mut self, expr: &Expr, kind: &str) -> Result<bool, Unwind> {
        let handler = self.eval(expr)?;
        let candidates = match &handler {
            Value::Tuple(items) => items.to_vec(),
            other => vec![other.clone()],
        };
        for candidate in &candidates {
            match candidate {
                Value::ExceptionType(name) => {
                    if builtins::exception_matches(kind, name) {
                        return Ok(true);
                    }
                }
                other => {
                    return Err(RuntimeError::type_error(format!(
                        "catching '{}' that does not inherit from BaseException is not allowed",
                        other.type_name()
                    ))
                    .into())
                }
            }
        }
        Ok(false)
    }

    fn raise(&mut self, value: Option<&Expr>) -> Result<RuntimeError, Unwind> {
        let Some(expr) = value else {
            let frame = self.frame();
            return Ok(match &frame.handling {
                Some(active) => {
                    let mut again = (**active).clone();
                    if again.reported_in == Some(frame.id) {
                        again.traceback.pop();
                    }
                    again.reported_in = None;
                    again
                }
                None => RuntimeError::new("RuntimeError", "No active exception to reraise"),
            });
        };
        Ok(match self.eval(expr)? {
            Value::ExceptionType(kind) => RuntimeError::new(&kind, ""),
            Value::Exception(exc) => RuntimeError::new(&exc.kind, exc.message.clone()),
            _ => RuntimeError::type_error("exceptions must derive from BaseException"),
        })
    }

    fn assign(&mut self, target: &Target, value: Value) -> Result<(), Unwind> {
        match target {
            Target::Name(name) => self.frame().store(name, value),
            Target::Index(obj, index) => {
                let obj = self.eval(obj)?;
                let index = self.eval(index)?;
                builtins::set_index(&obj, index, value)?;
            }
            Target::Attr(obj, name) => {
                let obj = self.eval(obj)?;
                set_attr(&obj, name, value)?;
            }
            Target::Tuple(targets) => {
                let items = builtins::iterate(&value)?;
                if items.len() < targets.len() {
                    return Err(RuntimeError::value_error(format!(
                        "not enough values to unpack (expected {}, got {})",
                        targets.len(),
                        items.len()
                    ))
                    .into());
                }
                if items.len() > targets.len() {
                    return Err(RuntimeError::value_error(format!(
                        "too many values to unpack (expected {})",
                        targets.len()
                    ))
                    .into());
                }
                for (target, item) in targets.iter().zip(items) {
                    self.assign(target, item)?;
                }
            }
        }
        Ok(())
    }

    fn aug_assign(&mut self, target: &Target, op: BinOp, value: &Expr) -> Result<(), Unwind> {
        match target {
            Target::Name(name) => {
                let current = self.load_name(name)?;
                let rhs = self.eval(value)?;
                let updated = in_place_op(op, &current, &rhs)?;
                self.frame().store(name, updated);
            }
            Target::Index(obj, index) => {
                let obj = self.eval(obj)?;
                let index = self.eval(index)?;
                let current = builtins::index_of(&obj, &index)?;
                let rhs = self.eval(value)?;
                let updated = in_place_op(op, &current, &rhs)?;
                builtins::set_index(&obj, index, updated)?;
            }
            Target::Attr(obj, name) => {
                let obj = self.eval(obj)?;
                let current = get_attr(&obj, name)?;
                let rhs = self.eval(value)?;
                let updated = in_place_op(op, &current, &rhs)?;
                set_attr(&obj, name, updated)?;
            }
            Target::Tuple(_) => {
                return Err(RuntimeError::new(
                    "SyntaxError",
                    "illegal expression for augmented assignment",
                )
                .into())
            }
        }
        Ok(())
    }

    // ---- imports ----

    fn import_module(&mut self, parts: &[String]) -> Result<Value, Unwind> {
        let dotted = parts.join(".");
        if let Some(module) = self.modules.get(&dotted) {
            return Ok(module.clone());
        }
        if parts.len() == 1 {
            if let Some(module) = builtins::builtin_module(&dotted) {
                self.modules.insert(dotted, module.clone());
                return Ok(module);
            }
        }

        let (last, prefix) = match parts.split_last() {
            Some(split) => split,
            None => return Err(RuntimeError::new("ImportError", "empty module name").into()),
        };
        let parent = if prefix.is_empty() {
            None
        } else {
            Some(self.import_module(prefix)?)
        };

        let dir = prefix.iter().fold(self.root.clone(), |dir, p| dir.join(p));
        let file = dir.join(format!("{last}.py"));
        let package = dir.join(last);
        let init = package.join("__init__.py");

        let module = if file.is_file() {
            self.load_module(&dotted, &file)?
        } else if init.is_file() {
            self.load_module(&dotted, &init)?
        } else if package.is_dir() {
            let globals = new_scope();
            globals
                .borrow_mut()
                .insert("__name__".into(), Value::str(dotted.as_str()));
            let module = Value::Module(Rc::new(Module {
                name: dotted.clone(),
                globals,
            }));
            self.modules.insert(dotted.clone(), module.clone());
            module
        } else {
            return Err(RuntimeError::new(
                "ModuleNotFoundError",
                format!("No module named '{dotted}'"),
            )
            .into());
        };

        if let Some(Value::Module(parent)) = parent {
            parent
                .globals
                .borrow_mut()
                .insert(last.clone(), module.clone());
        }
        Ok(module)
    }

    fn load_module(&mut self, name: &str, path: &Path) -> Result<Value, Unwind> {
        let source = std::fs::read_to_string(path).map_err(|e| {
            RuntimeError::new("ImportError", format!("cannot read {}: {e}", path.display()))
        })?;
        let block = parse_module(&source).map_err(|e| {
            RuntimeError::new(
                e.kind,
                format!("{} ({}, line {})", e.message, path.display(), e.line),
            )
        })?;

        let unit: Rc<Path> = Rc::from(path);
        self.sources
            .insert(unit.clone(), source.lines().map(String::from).collect());
        let globals = module_globals(name, &unit);
        let module = Value::Module(Rc::new(Module {
            name: name.to_string(),
            globals: globals.clone(),
        }));
        self.modules.insert(name.to_string(), module.clone());

        if let Err(err) = self.run_module_frame(unit, globals, &block) {
            self.modules.remove(name);
            return Err(err);
        }
        Ok(module)
    }

    // ---- expressions ----

    fn load_name(&self, name: &str) -> Result<Value, Unwind> {
        let frame = self.frame();
        if let Some(locals) = &frame.locals {
            if !frame.global_names.contains(name) {
                if let Some(value) = locals.borrow().get(name) {
                    return Ok(value.clone());
                }
            }
        }
        if let Some(value) = frame.globals.borrow().get(name) {
            return Ok(value.clone());
        }
        builtins::lookup(name).ok_or_else(|| RuntimeError::name_error(name).into())
    }

    fn eval(&mut self, expr: &Expr) -> Result<Value, Unwind> {
        Ok(match expr {
            Expr::Const(constant) => match constant {
                Const::None => Value::None,
                Const::Bool(b) => Value::Bool(*b),
                Const::Int(i) => Value::Int(*i),
                Const::Float(f) => Value::Float(*f),
                Const::Str(s) => Value::Str(s.clone()),
            },
            Expr::Name(name) => self.load_name(name)?,
            Expr::FString(parts) => {
                let mut text = String::new();
                for part in parts {
                    match part {
                        FPart::Lit(lit) => text.push_str(lit),
                        FPart::Expr { expr, repr, spec } => {
                            let value = self.eval(expr)?;
                            if *repr {
                                text.push_str(&value.repr());
                            } else if let Some(spec) = spec {
                                text.push_str(&format_spec(&value, spec)?);
                            } else {
                                text.push_str(&value.to_str());
                            }
                        }
                    }
                }
                Value::str(text)
            }
            Expr::List(items) => Value::list(self.eval_all(items)?),
            Expr::Tuple(items) => Value::tuple(self.eval_all(items)?),
            Expr::Dict(items) => {
                let mut dict = super::value::Dict::new();
                for (key, value) in items {
                    let key = self.eval(key)?;
                    let value = self.eval(value)?;
                    dict.insert(key, value)?;
                }
                Value::Dict(Rc::new(RefCell::new(dict)))
            }
            Expr::Binary(left, op, right) => {
                let left = self.eval(left)?;
                let right = self.eval(right)?;
                binary_op(*op, &left, &right)?
            }
            Expr::Neg(operand) => match self.eval(operand)? {
                Value::Float(f) => Value::Float(-f),
                other => match other.as_int() {
                    Some(i) => Value::Int(i.checked_neg().ok_or_else(RuntimeError::overflow)?),
                    None => return Err(bad_operand("-", &other).into()),
                },
            },
            Expr::Pos(operand) => match self.eval(operand)? {
                Value::Float(f) => Value::Float(f),
                other => match other.as_int() {
                    Some(i) => Value::Int(i),
                    None => return Err(bad_operand("+", &other).into()),
                },
            },
            Expr::Not(operand) => Value::Bool(!self.eval(operand)?.truthy()),
            Expr::And(left, right) => {
                let left = self.eval(left)?;
                if !left.truthy() {
                    left
                } else {
                    self.eval(right)?
                }
            }
            Expr::Or(left, right) => {
                let left = self.eval(left)?;
                if left.truthy() {
                    left
                } else {
                    self.eval(right)?
                }
            }
            Expr::Compare(first, rest) => {
                let mut left = self.eval(first)?;
                for (op, expr) in rest {
                    let right = self.eval(expr)?;
                    if !compare(*op, &left, &right)? {
                        return Ok(Value::Bool(false));
                    }
                    left = right;
                }
                Value::Bool(true)
            }
            Expr::IfElse { cond, then, orelse } => {
                if self.eval(cond)?.truthy() {
                    self.eval(then)?
                } else {
                    self.eval(orelse)?
                }
            }
            Expr::Call { func, args, kwargs } => {
                let callee = self.eval(func)?;
                let args = self.eval_all(args)?;
                let mut keyword = Vec::with_capacity(kwargs.len());
                for (name, expr) in kwargs {
                    keyword.push((name.clone(), self.eval(expr)?));
                }
                self.call_value(callee, args, keyword)?
            }
            Expr::Attr(obj, name) => {
                let obj = self.eval(obj)?;
                get_attr(&obj, name)?
            }
            Expr::Index(obj, index) => {
                let obj = self.eval(obj)?;
                match index.as_ref() {
                    Expr::Slice(lower, upper) => {
                        let lower = self.eval_bound(lower.as_deref())?;
                        let upper = self.eval_bound(upper.as_deref())?;
                        builtins::slice_of(&obj, lower, upper)?
                    }
                    index => {
                        let index = self.eval(index)?;
                        builtins::index_of(&obj, &index)?
                    }
                }
            }
            Expr::Slice(..) => {
                return Err(RuntimeError::new("SyntaxError", "slice outside subscript").into())
            }
        })
    }

    fn eval_all(&mut self, exprs: &[Expr]) -> Result<Vec<Value>, Unwind> {
        exprs.iter().map(|e| self.eval(e)).collect()
    }

    fn eval_bound(&mut self, expr: Option<&Expr>) -> Result<Option<i64>, Unwind> {
        let Some(expr) = expr else { return Ok(None) };
        match self.eval(expr)? {
            Value::None => Ok(None),
            value => value.as_int().map(Some).ok_or_else(|| {
                RuntimeError::type_error(
                    "slice indices must be integers or None or have an __index__ method",
                )
                .into()
            }),
        }
    }

    fn call_value(
        &mut self,
        callee: Value,
        args: Vec<Value>,
        kwargs: Vec<(String, Value)>,
    ) -> Result<Value, Unwind> {
        match callee {
            Value::Function(function) => self.call_function(&function, args, kwargs),
            Value::Builtin(Builtin::Print) => Ok(self.print(args, kwargs)?),
            Value::Builtin(builtin) => {
                reject_keywords(builtin.name(), &kwargs)?;
                Ok(builtins::call(builtin, args)?)
            }
            Value::Method(method) => {
                reject_keywords(&method.name, &kwargs)?;
                Ok(builtins::call_method(&method, args)?)
            }
            Value::ExceptionType(kind) => {
                reject_keywords(&kind, &kwargs)?;
                let message = match args.as_slice() {
                    [] => String::new(),
                    [single] => single.to_str(),
                    many => Value::tuple(many.to_vec()).repr(),
                };
                Ok(Value::Exception(Rc::new(ExceptionValue { kind, message })))
            }
            other => Err(RuntimeError::type_error(format!(
                "'{}' object is not callable",
                other.type_name()
            ))
            .into()),
        }
    }

    fn call_function(
        &mut self,
        function: &Rc<Function>,
        args: Vec<Value>,
        kwargs: Vec<(String, Value)>,
    ) -> Result<Value, Unwind> {
        let def = &function.def;
        let locals = bind_arguments(function, args, kwargs)?;

        self.push_frame(
            Rc::from(def.name.as_str()),
            function.unit.clone(),
            def.line,
            function.globals.clone(),
            Some(Rc::new(RefCell::new(locals))),
        )?;
        let result = self.run_body(&def.body);
        self.frames.pop();
        result
    }

    fn print(
        &mut self,
        args: Vec<Value>,
        kwargs: Vec<(String, Value)>,
    ) -> Result<Value, RuntimeError> {
        let mut sep = " ".to_string();
        let mut end = "\n".to_string();
        let mut flush = false;
        for (name, value) in kwargs {
            let text = |value: &Value| match value {
                Value::None => Ok(None),
                Value::Str(s) => Ok(Some(s.to_string())),
                other => Err(RuntimeError::type_error(format!(
                    "{name} must be None or a string, not {}",
                    other.type_name()
                ))),
            };
            match name.as_str() {
                "sep" => sep = text(&value)?.unwrap_or_else(|| " ".into()),
                "end" => end = text(&value)?.unwrap_or_else(|| "\n".into()),
                "flush" => flush = value.truthy(),
                _ => {
                    return Err(RuntimeError::type_error(format!(
                        "'{name}' is an invalid keyword argument for print()"
                    )))
                }
            }
        }

        let mut line = args.iter().map(Value::to_str).collect::<Vec<_>>().join(&sep);
        line.push_str(&end);
        self.out.write(Stream::Stdout, &line);
        if flush {
            self.out.flush(Stream::Stdout);
        }
        Ok(Value::None)
    }
}

fn module_globals(name: &str, unit: &Rc<Path>) -> Scope {
    let globals = new_scope();
    {
        let mut scope = globals.borrow_mut();
        scope.insert("__name__".into(), Value::str(name));
        scope.insert(
            "__file__".into(),
            Value::str(unit.display().to_string()),
        );
    }
    globals
}

fn bind_arguments(
    function: &Function,
    args: Vec<Value>,
    kwargs: Vec<(String, Value)>,
) -> Result<BTreeMap<String, Value>, RuntimeError> {
    let def = &function.def;
    let params = &def.params;
    if args.len() > params.len() {
        return Err(RuntimeError::type_error(format!(
            "{}() takes {} positional arguments but {} were given",
            def.name,
            params.len(),
            args.len()
        )));
    }

    let mut locals = BTreeMap::new();
    let positional = args.len();
    for (param, value) in params.iter().zip(args) {
        locals.insert(param.name.clone(), value);
    }
    for (name, value) in kwargs {
        match params.iter().position(|p| p.name == name) {
            Some(i) if i < positional => {
                return Err(RuntimeError::type_error(format!(
                    "{}() got multiple values for argument '{name}'",
                    def.name
                )))
            }
            Some(_) => {
                locals.insert(name, value);
            }
            None => {
                return Err(RuntimeError::type_error(format!(
                    "{}() got an unexpected keyword argument '{name}'",
                    def.name
                )))
            }
        }
    }

    let missing: Vec<&str> = params
        .iter()
        .zip(&function.defaults)
        .filter_map(|(param, default)| {
            if locals.contains_key(&param.name) {
                return None;
            }
            match default {
                Some(value) => {
                    locals.insert(param.name.clone(), value.clone());
                    None
                }
                None => Some(param.name.as_str()),
            }
        })
        .collect();
    if !missing.is_empty() {
        let names: Vec<String> = missing.iter().map(|n| format!("'{n}'")).collect();
        return Err(RuntimeError::type_error(format!(
            "{}() missing {} required positional argument{}: {}",
            def.name,
            missing.len(),
            if missing.len() == 1 { "" } else { "s" },
            names.join(" and ")
        )));
    }
    Ok(locals)
}

fn reject_keywords(name: &str, kwargs: &[(String, Value)]) -> Result<(), RuntimeError> {
    if kwargs.is_empty() {
        Ok(())
    } else {
        Err(RuntimeError::type_error(format!(
            "{name}() takes no keyword arguments"
        )))
    }
}

fn bad_operand(op: &str, value: &Value) -> RuntimeError {
    RuntimeError::type_error(format!(
        "bad operand type for unary {op}: '{}'",
        value.type_name()
    ))
}

fn get_attr(obj: &Value, name: &str) -> Result<Value, RuntimeError> {
    match obj {
        Value::Module(module) => module.globals.borrow().get(name).cloned().ok_or_else(|| {
            RuntimeError::new(
                "AttributeError",
                format!("module '{}' has no attribute '{name}'", module.name),
            )
        }),
        Value::Exception(exc) if name == "args" => {
            Ok(Value::tuple(vec![Value::str(exc.message.as_str())]))
        }
        other => builtins::method(other, name).ok_or_else(|| builtins::no_attribute(other, name)),
    }
}

fn set_attr(obj: &Value, name: &str, value: Value) -> Result<(), RuntimeError> {
    match obj {
        Value::Module(module) => {
            module.globals.borrow_mut().insert(name.to_string(), value);
            Ok(())
        }
        other => Err(builtins::no_attribute(other, name)),
    }
}

/// `+=` on a list extends it in place; everything else rebinds.
fn in_place_op(op: BinOp, current: &Value, rhs: &Value) -> Result<Value, RuntimeError> {
    if let (BinOp::Add, Value::List(items)) = (op, current) {
        let extra = builtins::iterate(rhs)?;
        items.borrow_mut().extend(extra);
        return Ok(current.clone());
    }
    binary_op(op, current, rhs)
}

pub fn binary_op(op: BinOp, left: &Value, right: &Value) -> Result<Value, RuntimeError> {
    let repeat = |count: i64| usize::try_from(count).unwrap_or(0);
    match (op, left, right) {
        (BinOp::Add, Value::Str(a), Value::Str(b)) => return Ok(Value::str(format!("{a}{b}"))),
        (BinOp::Mul, Value::Str(s), Value::Int(n)) | (BinOp::Mul, Value::Int(n), Value::Str(s)) => {
            return Ok(Value::str(s.repeat(repeat(*n))))
        }
        (BinOp::Add, Value::List(a), Value::List(b)) => {
            let mut items = a.borrow().clone();
            items.extend(b.borrow().iter().cloned());
            return Ok(Value::list(items));
        }
        (BinOp::Mul, Value::List(items), Value::Int(n))
        | (BinOp::Mul, Value::Int(n), Value::List(items)) => {
            let items = items.borrow();
            let mut out = Vec::with_capacity(items.len() * repeat(*n));
            for _ in 0..repeat(*n) {
                out.extend(items.iter().cloned());
            }
            return Ok(Value::list(out));
        }
        (BinOp::Add, Value::Tuple(a), Value::Tuple(b)) => {
            return Ok(Value::tuple(a.iter().chain(b.iter()).cloned().collect()))
        }
        _ => {}
    }

    if let (Some(a), Some(b)) = (left.as_int(), right.as_int()) {
        return int_op(op, a, b);
    }
    if let (Some(a), Some(b)) = (left.as_float(), right.as_float()) {
        return float_op(op, a, b);
    }
    Err(RuntimeError::type_error(format!(
        "unsupported operand type(s) for {}: '{}' and '{}'",
        op.symbol(),
        left.type_name(),
        right.type_name()
    )))
}

fn int_op(op: BinOp, a: i64, b: i64) -> Result<Value, RuntimeError> {
    let checked = |v: Option<i64>| v.map(Value::Int).ok_or_else(RuntimeError::overflow);
    match op {
        BinOp::Add => checked(a.checked_add(b)),
        BinOp::Sub => checked(a.checked_sub(b)),
        BinOp::Mul => checked(a.checked_mul(b)),
        BinOp::Div => {
            if b == 0 {
                return Err(RuntimeError::zero_division("division by zero"));
            }
            Ok(Value::Float(a as f64 / b as f64))
        }
        BinOp::FloorDiv | BinOp::Mod => {
            if b == 0 {
                return Err(RuntimeError::zero_division(
                    "integer division or modulo by zero",
                ));
            }
            let q = a.checked_div(b).ok_or_else(RuntimeError::overflow)?;
            let r = a.wrapping_rem(b);
            let adjust = r != 0 && ((r < 0) != (b < 0));
            if op == BinOp::FloorDiv {
                Ok(Value::Int(if adjust { q - 1 } else { q }))
            } else {
                Ok(Value::Int(if adjust { r + b } else { r }))
            }
        }
        BinOp::Pow => {
            if b < 0 {
                if a == 0 {
                    return Err(RuntimeError::zero_division(
                        "0.0 cannot be raised to a negative power",
                    ));
                }
                return Ok(Value::Float((a as f64).powf(b as f64)));
            }
            let exp = u32::try_from(b).map_err(|_| RuntimeError::overflow())?;
            checked(a.checked_pow(exp))
        }
    }
}

fn float_op(op: BinOp, a: f64, b: f64) -> Result<Value, RuntimeError> {
    Ok(Value::Float(match op {
        BinOp::Add => a + b,
        BinOp::Sub => a - b,
        BinOp::Mul => a * b,
        BinOp::Div => {
            if b == 0.0 {
                return Err(RuntimeError::zero_division("float division by zero"));
            }
            a / b
        }
        BinOp::FloorDiv => {
            if b == 0.0 {
                return Err(RuntimeError::zero_division("float floor division by zero"));
            }
            (a / b).floor()
        }
        BinOp::Mod => {
            if b == 0.0 {
                return Err(RuntimeError::zero_division("float modulo"));
            }
            let r = a % b;
            if r != 0.0 && ((r < 0.0) != (b < 0.0)) {
                r + b
            } else {
                r
            }
        }
        BinOp::Pow => {
            if a == 0.0 && b < 0.0 {
                return Err(RuntimeError::zero_division(
                    "0.0 cannot be raised to a negative power",
                ));
            }
            a.powf(b)
        }
    }))
}

fn compare(op: CmpOp, left: &Value, right: &Value) -> Result<bool, RuntimeError> {
    use std::cmp::Ordering::*;
    Ok(match op {
        CmpOp::Eq => left.py_eq(right),
        CmpOp::Ne => !left.py_eq(right),
        CmpOp::Lt => ordering(op, left, right)? == Less,
        CmpOp::Le => ordering(op, left, right)? != Greater,
        CmpOp::Gt => ordering(op, left, right)? == Greater,
        CmpOp::Ge => ordering(op, left, right)? != Less,
        CmpOp::In => contains(right, left)?,
        CmpOp::NotIn => !contains(right, left)?,
        CmpOp::Is => left.is_same(right),
        CmpOp::IsNot => !left.is_same(right),
    })
}

fn ordering(op: CmpOp, left: &Value, right: &Value) -> Result<std::cmp::Ordering, RuntimeError> {
    left.py_cmp(right).map_err(|_| {
        RuntimeError::type_error(format!(
            "'{}' not supported between instances of '{}' and '{}'",
            op.symbol(),
            left.type_name(),
            right.type_name()
        ))
    })
}

fn contains(container: &Value, item: &Value) -> Result<bool, RuntimeError> {
    match container {
        Value::Str(haystack) => match item {
            Value::Str(needle) => Ok(haystack.contains(needle.as_ref())),
            other => Err(RuntimeError::type_error(format!(
                "'in <string>' requires string as left operand, not {}",
                other.type_name()
            ))),
        },
        Value::List(items) => Ok(items.borrow().iter().any(|v| v.py_eq(item))),
        Value::Tuple(items) => Ok(items.iter().any(|v| v.py_eq(item))),
        Value::Dict(dict) => Ok(dict.borrow().contains(item)),
        Value::Range { .. } => Ok(item
            .as_int()
            .is_some_and(|i| range_contains(container, i))),
        other => Err(RuntimeError::type_error(format!(
            "argument of type '{}' is not iterable",
            other.type_name()
        ))),
    }
}

/// Apply an f-string format spec: `[<>^][width][.precision][d|f|%|s]`.
fn format_spec(value: &Value, spec: &str) -> Result<String, RuntimeError> {
    let invalid = || RuntimeError::value_error(format!("Invalid format specifier '{spec}'"));
    let mut rest = spec;
    let align = match rest.chars().next() {
        Some(c @ ('<' | '>' | '^')) => {
            rest = &rest[1..];
            Some(c)
        }
        _ => None,
    };
    let width_len = rest.chars().take_while(char::is_ascii_digit).count();
    let width: usize = if width_len == 0 {
        0
    } else {
        rest[..width_len].parse().map_err(|_| invalid())?
    };
    rest = &rest[width_len..];
    let precision = match rest.strip_prefix('.') {
        Some(after) => {
            let len = after.chars().take_while(char::is_ascii_digit).count();
            if len == 0 {
                return Err(invalid());
            }
            rest = &after[len..];
            Some(after[..len].parse::<usize>().map_err(|_| invalid())?)
        }
        None => None,
    };

    let numeric = matches!(value, Value::Int(_) | Value::Float(_) | Value::Bool(_));
    let body = match rest {
        "f" | "F" => {
            let f = value.as_float().ok_or_else(invalid)?;
            format!("{:.*}", precision.unwrap_or(6), f)
        }
        "%" => {
            let f = value.as_float().ok_or_else(invalid)?;
            format!("{:.*}%", precision.unwrap_or(6), f * 100.0)
        }
        "d" => match value {
            Value::Int(i) => i.to_string(),
            _ => return Err(invalid()),
        },
        "" | "s" => match (value, precision) {
            (Value::Float(f), Some(p)) if rest.is_empty() => format!("{:.*}", p, f),
            (Value::Str(s), Some(p)) => s.chars().take(p).collect(),
            _ => value.to_str(),
        },
        _ => return Err(invalid()),
    };

    let len = body.chars().count();
    if len >= width {
        return Ok(body);
    }
    let pad = width - len;
    let align = align.unwrap_or(if numeric { '>' } else { '<' });
    Ok(match align {
        '>' => format!("{}{body}", " ".repeat(pad)),
        '^' => format!(
            "{}{body}{}",
            " ".repeat(pad / 2),
            " ".repeat(pad - pad / 2)
        ),
        _ => format!("{body}{}", " ".repeat(pad)),
    })
}
