//! Tree-walking evaluator.
//!
//! A [`Machine`] borrows the interpreter and the active environment for the
//! duration of one `evaluate`. Module-level names go through the
//! environment; function locals live in reference-counted frames so that
//! closures see later bindings of their enclosing scopes.

use std::cell::RefCell;
use std::collections::{HashMap, HashSet};
use std::rc::Rc;

use indexmap::IndexMap;

use crate::error::ExecError;
use crate::interpreter::Environment;
use crate::sandbox::value::Value;

use super::ast::{Arg, BinOp, Block, CmpOp, Const, Expr, FPart, FunctionDef, Handler, Stmt, StmtKind, Target};
use super::builtins::{call_method, format_value};
use super::objects::{
    exception_value, function_value, is_subclass, BoundMethod, Builtin, ExceptionClass,
    ExceptionObject, Function, Kwargs, Locals,
};
use super::ops::{self, as_exception, type_error};
use super::ScriptInterpreter;

/// An exception unwinding through the evaluator.
#[derive(Debug)]
pub(crate) struct Raised {
    pub exc: Rc<ExceptionObject>,
    /// Line in the innermost frame not yet recorded in `trace`.
    pub line: Option<u32>,
    /// Finished frames, innermost first.
    pub trace: Vec<(Rc<str>, u32)>,
}

pub(crate) type Exec<T> = Result<T, Raised>;

impl Raised {
    pub fn new(class: &str, message: impl Into<String>) -> Self {
        Self::with(Rc::new(ExceptionObject::new(class, message)))
    }

    pub fn with(exc: Rc<ExceptionObject>) -> Self {
        Self {
            exc,
            line: None,
            trace: Vec::new(),
        }
    }

    pub fn from_error(error: ExecError) -> Self {
        Self::with(Rc::new(ExceptionObject::from_error(&error)))
    }

    fn fuel() -> Self {
        Self::from_error(ExecError::fuel_exhausted())
    }

    fn at(mut self, line: u32) -> Self {
        if self.line.is_none() {
            self.line = Some(line);
        }
        self
    }

    fn render(&self) -> String {
        let mut out = String::from("Traceback (most recent call last):\n");
        for (name, line) in self.trace.iter().rev() {
            out.push_str(&format!("  File \"<sandbox>\", line {line}, in {name}\n"));
        }
        if self.exc.message.is_empty() {
            out.push_str(&self.exc.class);
        } else {
            out.push_str(&format!("{}: {}", self.exc.class, self.exc.message));
        }
        out
    }

    /// Finish unwinding at module level.
    pub fn into_error(mut self, line: u32) -> ExecError {
        let line = self.line.take().unwrap_or(line);
        self.trace.push(("<module>".into(), line));
        let traceback = self.render();
        self.exc.to_error().with_traceback(traceback)
    }
}

pub(crate) enum Flow {
    Next,
    Break,
    Continue,
    Return(Value),
}

pub(crate) enum Scope {
    Module,
    Function(FunctionScope),
}

pub(crate) struct FunctionScope {
    locals: Locals,
    /// Enclosing scopes, outermost first.
    enclosing: Vec<Locals>,
    globals: HashSet<String>,
}

impl FunctionScope {
    fn new(locals: Locals, enclosing: Vec<Locals>) -> Self {
        Self {
            locals,
            enclosing,
            globals: HashSet::new(),
        }
    }

    fn lookup(&self, name: &str) -> Option<Value> {
        if self.globals.contains(name) {
            return None;
        }
        if let Some(value) = self.locals.borrow().get(name) {
            return Some(value.clone());
        }
        self.enclosing
            .iter()
            .rev()
            .find_map(|frame| frame.borrow().get(name).cloned())
    }

    fn chain(&self) -> Vec<Locals> {
        let mut chain = self.enclosing.clone();
        chain.push(self.locals.clone());
        chain
    }
}

pub(crate) struct Machine<'a> {
    pub interp: &'a mut ScriptInterpreter,
    pub env: &'a mut dyn Environment,
    handling: Vec<Rc<ExceptionObject>>,
}

impl<'a> Machine<'a> {
    pub fn new(interp: &'a mut ScriptInterpreter, env: &'a mut dyn Environment) -> Self {
        Self {
            interp,
            env,
            handling: Vec::new(),
        }
    }

    /// Run a module. The value of a trailing expression statement is
    /// returned unless it is `None`.
    pub fn run_module(&mut self, body: &Block) -> Result<Option<Value>, ExecError> {
        let mut scope = Scope::Module;
        let mut value = None;
        for (i, stmt) in body.iter().enumerate() {
            let result = match &stmt.kind {
                StmtKind::Expr(expr) if i + 1 == body.len() => {
                    self.charge().and_then(|()| self.eval(expr, &mut scope)).map(|v| {
                        value = Some(v);
                        Flow::Next
                    })
                }
                _ => self.exec_stmt(stmt, &mut scope),
            };
            if let Err(raised) = result {
                return Err(raised.into_error(stmt.line));
            }
        }
        Ok(value.filter(|v| !matches!(v, Value::None)))
    }

    pub fn charge(&mut self) -> Exec<()> {
        if self.interp.budget.charge() {
            Ok(())
        } else {
            Err(Raised::fuel())
        }
    }

    pub fn max_len(&self) -> usize {
        self.interp.limits.max_collection_len
    }

    pub fn iterate(&self, value: &Value) -> Exec<Vec<Value>> {
        ops::iterate(value, self.max_len())
    }

    fn exec_block(&mut self, body: &Block, scope: &mut Scope) -> Exec<Flow> {
        for stmt in body {
            match self.exec_stmt(stmt, scope)? {
                Flow::Next => {}
                flow => return Ok(flow),
            }
        }
        Ok(Flow::Next)
    }

    fn exec_stmt(&mut self, stmt: &Stmt, scope: &mut Scope) -> Exec<Flow> {
        let result = match self.charge() {
            Ok(()) => self.exec_kind(&stmt.kind, scope),
            Err(raised) => Err(raised),
        };
        result.map_err(|raised| raised.at(stmt.line))
    }

    fn exec_kind(&mut self, kind: &StmtKind, scope: &mut Scope) -> Exec<Flow> {
        match kind {
            StmtKind::Expr(expr) => {
                self.eval(expr, scope)?;
            }
            StmtKind::Assign { targets, value } => {
                let value = self.eval(value, scope)?;
                for target in targets {
                    self.assign(target, value.clone(), scope)?;
                }
            }
            StmtKind::AugAssign { target, op, value } => self.aug_assign(target, *op, value, scope)?,
            StmtKind::If { branches, orelse } => {
                for (test, body) in branches {
                    if self.eval(test, scope)?.is_truthy() {
                        return self.exec_block(body, scope);
                    }
                }
                return self.exec_block(orelse, scope);
            }
            StmtKind::While { test, body, orelse } => loop {
                if !self.eval(test, scope)?.is_truthy() {
                    return self.exec_block(orelse, scope);
                }
                match self.exec_block(body, scope)? {
                    Flow::Break => break,
                    Flow::Return(value) => return Ok(Flow::Return(value)),
                    Flow::Next | Flow::Continue => {}
                }
                self.charge()?;
            },
            StmtKind::For {
                target,
                iter,
                body,
                orelse,
            } => {
                let source = self.eval(iter, scope)?;
                for item in ops::items_of(&source)? {
                    self.charge()?;
                    self.assign(target, item, scope)?;
                    match self.exec_block(body, scope)? {
                        Flow::Break => return Ok(Flow::Next),
                        Flow::Return(value) => return Ok(Flow::Return(value)),
                        Flow::Next | Flow::Continue => {}
                    }
                }
                return self.exec_block(orelse, scope);
            }
            StmtKind::Break => return Ok(Flow::Break),
            StmtKind::Continue => return Ok(Flow::Continue),
            StmtKind::Pass => {}
            StmtKind::Def(def) => {
                let function = self.make_function(def, scope)?;
                self.store_name(&def.name, function, scope)?;
            }
            StmtKind::Return(value) => {
                let value = match value {
                    Some(expr) => self.eval(expr, scope)?,
                    None => Value::None,
                };
                return Ok(Flow::Return(value));
            }
            StmtKind::Del(targets) => {
                for target in targets {
                    self.delete(target, scope)?;
                }
            }
            StmtKind::Global(names) => {
                if let Scope::Function(frame) = scope {
                    frame.globals.extend(names.iter().cloned());
                }
            }
            StmtKind::Try {
                body,
                handlers,
                orelse,
                finally,
            } => return self.exec_try(body, handlers, orelse, finally, scope),
            StmtKind::Raise(None) => {
                return match self.handling.last() {
                    Some(exc) => Err(Raised::with(exc.clone())),
                    None => Err(Raised::new("RuntimeError", "No active exception to reraise")),
                };
            }
            StmtKind::Raise(Some(expr)) => {
                let value = self.eval(expr, scope)?;
                return Err(Raised::with(exception_from(&value)?));
            }
            StmtKind::Assert { test, msg } => {
                if !self.eval(test, scope)?.is_truthy() {
                    let message = match msg {
                        Some(expr) => ops::to_str(&self.eval(expr, scope)?),
                        None => String::new(),
                    };
                    return Err(Raised::new("AssertionError", message));
                }
            }
            StmtKind::Import(module) => {
                return Err(Raised::new(
                    "ImportError",
                    format!("import of '{module}' is not allowed in the sandbox"),
                ));
            }
        }
        Ok(Flow::Next)
    }

    fn exec_try(
        &mut self,
        body: &Block,
        handlers: &[Handler],
        orelse: &Block,
        finally: &Block,
        scope: &mut Scope,
    ) -> Exec<Flow> {
        let result = match self.exec_block(body, scope) {
            Err(raised) if raised.exc.kind.is_catchable() && !handlers.is_empty() => {
                self.handle(raised, handlers, scope)
            }
            Ok(Flow::Next) => self.exec_block(orelse, scope),
            other => other,
        };
        if let Err(raised) = &result {
            if !raised.exc.kind.is_catchable() {
                return result;
            }
        }
        match self.exec_block(finally, scope)? {
            Flow::Next => result,
            flow => Ok(flow),
        }
    }

    fn handle(&mut self, raised: Raised, handlers: &[Handler], scope: &mut Scope) -> Exec<Flow> {
        for handler in handlers {
            let matched = match &handler.matcher {
                None => true,
                Some(matcher) => {
                    let class = self.eval(matcher, scope)?;
                    exception_matches(&raised.exc, &class)?
                }
            };
            if !matched {
                continue;
            }
            if let Some(name) = &handler.name {
                self.store_name(name, exception_value(raised.exc.clone()), scope)?;
            }
            self.handling.push(raised.exc.clone());
            let result = self.exec_block(&handler.body, scope);
            self.handling.pop();
            return result;
        }
        Err(raised)
    }

    fn assign(&mut self, target: &Target, value: Value, scope: &mut Scope) -> Exec<()> {
        match target {
            Target::Name(name) => self.store_name(name, value, scope),
            Target::Index { obj, index } => {
                let obj = self.eval(obj, scope)?;
                let index = self.eval(index, scope)?;
                ops::set_item(&obj, index, value)
            }
            Target::Tuple(targets) => {
                let items = self.iterate(&value)?;
                if items.len() < targets.len() {
                    return Err(Raised::new(
                        "ValueError",
                        format!(
                            "not enough values to unpack (expected {}, got {})",
                            targets.len(),
                            items.len()
                        ),
                    ));
                }
                if items.len() > targets.len() {
                    return Err(Raised::new(
                        "ValueError",
                        format!("too many values to unpack (expected {})", targets.len()),
                    ));
                }
                for (target, item) in targets.iter().zip(items) {
                    self.assign(target, item, scope)?;
                }
                Ok(())
            }
        }
    }

    fn aug_assign(&mut self, target: &Target, op: BinOp, value: &Expr, scope: &mut Scope) -> Exec<()> {
        match target {
            Target::Name(name) => {
                let current = self.load_name(name, scope)?;
                let rhs = self.eval(value, scope)?;
                let updated = self.in_place(op, current, rhs)?;
                self.store_name(name, updated, scope)
            }
            Target::Index { obj, index } => {
                let obj = self.eval(obj, scope)?;
                let index = self.eval(index, scope)?;
                let current = ops::get_item(&obj, &index)?;
                let rhs = self.eval(value, scope)?;
                let updated = self.in_place(op, current, rhs)?;
                ops::set_item(&obj, index, updated)
            }
            Target::Tuple(_) => Err(Raised::new(
                "SyntaxError",
                "illegal expression for augmented assignment",
            )),
        }
    }

    /// `+=` extends lists in place; everything else rebinds.
    fn in_place(&mut self, op: BinOp, current: Value, rhs: Value) -> Exec<Value> {
        if let (BinOp::Add, Value::List(items)) = (op, &current) {
            let extra = self.iterate(&rhs)?;
            ops::check_len((items.borrow().len() + extra.len()) as u64, self.max_len())?;
            items.borrow_mut().extend(extra);
            return Ok(current);
        }
        ops::binary(op, current, rhs, self.max_len())
    }

    fn delete(&mut self, target: &Target, scope: &mut Scope) -> Exec<()> {
        match target {
            Target::Name(name) => self.delete_name(name, scope),
            Target::Index { obj, index } => {
                let obj = self.eval(obj, scope)?;
                let index = self.eval(index, scope)?;
                ops::del_item(&obj, &index)
            }
            Target::Tuple(targets) => {
                for target in targets {
                    self.delete(target, scope)?;
                }
                Ok(())
            }
        }
    }

    fn load_name(&mut self, name: &str, scope: &Scope) -> Exec<Value> {
        if let Scope::Function(frame) = scope {
            if let Some(value) = frame.lookup(name) {
                return Ok(value);
            }
        }
        if let Some(value) = self.env.load(name) {
            return Ok(value);
        }
        if let Some(value) = self.interp.globals.get(name) {
            return Ok(value.clone());
        }
        Err(Raised::new("NameError", format!("name '{name}' is not defined")))
    }

    fn store_name(&mut self, name: &str, value: Value, scope: &mut Scope) -> Exec<()> {
        if let Scope::Function(frame) = scope {
            if !frame.globals.contains(name) {
                frame.locals.borrow_mut().insert(name.to_string(), value);
                return Ok(());
            }
        }
        self.env.store(name, value).map_err(Raised::from_error)
    }

    fn delete_name(&mut self, name: &str, scope: &mut Scope) -> Exec<()> {
        if let Scope::Function(frame) = scope {
            if !frame.globals.contains(name) {
                return match frame.locals.borrow_mut().remove(name) {
                    Some(_) => Ok(()),
                    None => Err(Raised::new(
                        "NameError",
                        format!("local variable '{name}' is not defined"),
                    )),
                };
            }
        }
        match self.env.delete(name) {
            Ok(true) => Ok(()),
            Ok(false) => Err(Raised::new("NameError", format!("name '{name}' is not defined"))),
            Err(error) => Err(Raised::from_error(error)),
        }
    }

    fn make_function(&mut self, def: &Rc<FunctionDef>, scope: &mut Scope) -> Exec<Value> {
        let mut defaults = Vec::with_capacity(def.params.len());
        for param in &def.params {
            defaults.push(match &param.default {
                Some(expr) => Some(self.eval(expr, scope)?),
                None => None,
            });
        }
        let captured = match scope {
            Scope::Function(frame) => frame.chain(),
            Scope::Module => Vec::new(),
        };
        Ok(function_value(Function {
            def: def.clone(),
            defaults,
            captured,
        }))
    }

    pub fn eval(&mut self, expr: &Expr, scope: &mut Scope) -> Exec<Value> {
        match expr {
            Expr::Const(c) => Ok(match c {
                Const::None => Value::None,
                Const::Bool(b) => Value::Bool(*b),
                Const::Int(i) => Value::Int(*i),
                Const::Float(f) => Value::Float(*f),
                Const::Str(s) => Value::Str(s.clone()),
            }),
            Expr::Name(name) => self.load_name(name, scope),
            Expr::FString(parts) => self.eval_fstring(parts, scope),
            Expr::List(items) => {
                let mut values = Vec::with_capacity(items.len());
                for item in items {
                    values.push(self.eval(item, scope)?);
                }
                Ok(Value::list(values))
            }
            Expr::Dict(entries) => {
                let mut map = IndexMap::with_capacity(entries.len());
                for (key, value) in entries {
                    let key = self.eval(key, scope)?;
                    let Value::Str(key) = key else {
                        return type_error(format!(
                            "dict keys must be str, not {}",
                            key.type_name()
                        ));
                    };
                    let value = self.eval(value, scope)?;
                    map.insert(key.to_string(), value);
                }
                Ok(Value::dict(map))
            }
            Expr::Unary(op, operand) => {
                let value = self.eval(operand, scope)?;
                ops::unary(*op, value)
            }
            Expr::Binary(left, op, right) => {
                let left = self.eval(left, scope)?;
                let right = self.eval(right, scope)?;
                ops::binary(*op, left, right, self.max_len())
            }
            Expr::And(left, right) => {
                let left = self.eval(left, scope)?;
                if left.is_truthy() {
                    self.eval(right, scope)
                } else {
                    Ok(left)
                }
            }
            Expr::Or(left, right) => {
                let left = self.eval(left, scope)?;
                if left.is_truthy() {
                    Ok(left)
                } else {
                    self.eval(right, scope)
                }
            }
            Expr::Compare(first, rest) => self.eval_compare(first, rest, scope),
            Expr::IfElse { test, body, orelse } => {
                if self.eval(test, scope)?.is_truthy() {
                    self.eval(body, scope)
                } else {
                    self.eval(orelse, scope)
                }
            }
            Expr::Call { func, args } => self.eval_call(func, args, scope),
            Expr::Attr(obj, name) => {
                let value = self.eval(obj, scope)?;
                ops::get_attr(value, name)
            }
            Expr::Index(obj, index) => {
                let obj = self.eval(obj, scope)?;
                let index = self.eval(index, scope)?;
                ops::get_item(&obj, &index)
            }
            Expr::Slice { obj, lower, upper } => {
                let obj = self.eval(obj, scope)?;
                let lower = self.eval_bound(lower.as_deref(), scope)?;
                let upper = self.eval_bound(upper.as_deref(), scope)?;
                ops::slice(&obj, lower, upper)
            }
            Expr::ListComp {
                elt,
                target,
                iter,
                cond,
            } => self.eval_comprehension(elt, target, iter, cond.as_deref(), scope),
            Expr::Lambda(def) => self.make_function(def, scope),
        }
    }

    fn eval_bound(&mut self, bound: Option<&Expr>, scope: &mut Scope) -> Exec<Option<i64>> {
        let Some(expr) = bound else {
            return Ok(None);
        };
        match self.eval(expr, scope)? {
            Value::None => Ok(None),
            value => match value.as_int() {
                Some(i) => Ok(Some(i)),
                None => type_error("slice indices must be integers or None"),
            },
        }
    }

    fn eval_compare(&mut self, first: &Expr, rest: &[(CmpOp, Expr)], scope: &mut Scope) -> Exec<Value> {
        let mut left = self.eval(first, scope)?;
        for (op, expr) in rest {
            let right = self.eval(expr, scope)?;
            if !ops::compare(*op, &left, &right)? {
                return Ok(Value::Bool(false));
            }
            left = right;
        }
        Ok(Value::Bool(true))
    }

    fn eval_fstring(&mut self, parts: &[FPart], scope: &mut Scope) -> Exec<Value> {
        let mut out = String::new();
        for part in parts {
            match part {
                FPart::Lit(text) => out.push_str(text),
                FPart::Expr { expr, repr, spec } => {
                    let value = self.eval(expr, scope)?;
                    let value = if *repr {
                        Value::str(ops::repr_of(&value))
                    } else {
                        value
                    };
                    match spec {
                        Some(spec) => out.push_str(&format_value(&value, spec)?),
                        None => out.push_str(&ops::to_str(&value)),
                    }
                }
            }
        }
        ops::check_len(out.len() as u64, self.max_len())?;
        Ok(Value::str(out))
    }

    fn eval_comprehension(
        &mut self,
        elt: &Expr,
        target: &Target,
        iter: &Expr,
        cond: Option<&Expr>,
        scope: &mut Scope,
    ) -> Exec<Value> {
        let source = self.eval(iter, scope)?;
        let enclosing = match scope {
            Scope::Function(frame) => frame.chain(),
            Scope::Module => Vec::new(),
        };
        let locals: Locals = Rc::new(RefCell::new(HashMap::new()));
        let mut inner = Scope::Function(FunctionScope::new(locals, enclosing));
        let mut out = Vec::new();
        for item in ops::items_of(&source)? {
            self.charge()?;
            self.assign(target, item, &mut inner)?;
            if let Some(cond) = cond {
                if !self.eval(cond, &mut inner)?.is_truthy() {
                    continue;
                }
            }
            out.push(self.eval(elt, &mut inner)?);
            ops::check_len(out.len() as u64, self.max_len())?;
        }
        Ok(Value::list(out))
    }

    fn eval_call(&mut self, func: &Expr, args: &[Arg], scope: &mut Scope) -> Exec<Value> {
        let callee = self.eval(func, scope)?;
        let mut positional = Vec::with_capacity(args.len());
        let mut keywords = Kwargs::new();
        for arg in args {
            match arg {
                Arg::Pos(expr) => positional.push(self.eval(expr, scope)?),
                Arg::Star(expr) => {
                    let value = self.eval(expr, scope)?;
                    positional.extend(self.iterate(&value)?);
                }
                Arg::Kw(name, expr) => keywords.push((name.clone(), self.eval(expr, scope)?)),
                Arg::KwStar(expr) => {
                    let Value::Dict(entries) = self.eval(expr, scope)? else {
                        return type_error("argument after ** must be a dict");
                    };
                    for (key, value) in entries.borrow().iter() {
                        keywords.push((key.clone(), value.clone()));
                    }
                }
            }
        }
        self.call_value(&callee, positional, keywords)
    }

    pub fn call_value(&mut self, callee: &Value, args: Vec<Value>, kwargs: Kwargs) -> Exec<Value> {
        match callee {
            Value::Host(name) => {
                if !kwargs.is_empty() {
                    return type_error(format!("{name}() takes no keyword arguments"));
                }
                self.charge()?;
                self.env
                    .call_host(&mut *self.interp, name, args)
                    .map_err(Raised::from_error)
            }
            Value::Opaque(opaque) => {
                if let Some(function) = opaque.downcast_ref::<Function>() {
                    return self.call_function(function, args, kwargs);
                }
                if let Some(builtin) = opaque.downcast_ref::<Builtin>() {
                    self.charge()?;
                    return (builtin.func)(self, args, kwargs);
                }
                if let Some(method) = opaque.downcast_ref::<BoundMethod>() {
                    self.charge()?;
                    return call_method(self, &method.receiver, &method.name, args, kwargs);
                }
                if let Some(class) = opaque.downcast_ref::<ExceptionClass>() {
                    let message = args.first().map(ops::to_str).unwrap_or_default();
                    return Ok(exception_value(Rc::new(ExceptionObject::new(
                        class.name.clone(),
                        message,
                    ))));
                }
                type_error(format!("'{}' object is not callable", opaque.kind()))
            }
            other => type_error(format!("'{}' object is not callable", other.type_name())),
        }
    }

    fn call_function(&mut self, function: &Function, args: Vec<Value>, kwargs: Kwargs) -> Exec<Value> {
        self.charge()?;
        if self.interp.depth >= self.interp.limits.max_recursion_depth {
            return Err(Raised::new("RecursionError", "maximum recursion depth exceeded"));
        }
        let locals = bind_arguments(function, args, kwargs)?;
        let mut scope = Scope::Function(FunctionScope::new(
            Rc::new(RefCell::new(locals)),
            function.captured.clone(),
        ));
        self.interp.depth += 1;
        let result = self.exec_block(&function.def.body, &mut scope);
        self.interp.depth -= 1;
        match result {
            Ok(Flow::Return(value)) => Ok(value),
            Ok(_) => Ok(Value::None),
            Err(mut raised) => {
                let line = raised.line.take().unwrap_or(function.def.line);
                raised.trace.push((function.def.name.clone(), line));
                Err(raised)
            }
        }
    }
}

fn bind_arguments(function: &Function, args: Vec<Value>, kwargs: Kwargs) -> Exec<HashMap<String, Value>> {
    let def = &function.def;
    let given = args.len();
    let mut locals = HashMap::new();
    let mut args = args.into_iter();
    for param in &def.params {
        match args.next() {
            Some(value) => {
                locals.insert(param.name.clone(), value);
            }
            None => break,
        }
    }
    let extra: Vec<Value> = args.collect();
    match &def.star {
        Some(star) => {
            locals.insert(star.clone(), Value::list(extra));
        }
        None if !extra.is_empty() => {
            return type_error(format!(
                "{}() takes {} positional arguments but {given} were given",
                def.name,
                def.params.len()
            ));
        }
        None => {}
    }
    let mut extra_kwargs = IndexMap::new();
    for (key, value) in kwargs {
        if def.params.iter().any(|p| p.name == key) {
            if locals.contains_key(&key) {
                return type_error(format!(
                    "{}() got multiple values for argument '{key}'",
                    def.name
                ));
            }
            locals.insert(key, value);
        } else if def.kwstar.is_some() {
            extra_kwargs.insert(key, value);
        } else {
            return type_error(format!(
                "{}() got an unexpected keyword argument '{key}'",
                def.name
            ));
        }
    }
    if let Some(kwstar) = &def.kwstar {
        locals.insert(kwstar.clone(), Value::dict(extra_kwargs));
    }
    for (param, default) in def.params.iter().zip(&function.defaults) {
        if locals.contains_key(&param.name) {
            continue;
        }
        match default {
            Some(value) => {
                locals.insert(param.name.clone(), value.clone());
            }
            None => {
                return type_error(format!(
                    "{}() missing required positional argument: '{}'",
                    def.name, param.name
                ));
            }
        }
    }
    Ok(locals)
}

fn exception_from(value: &Value) -> Exec<Rc<ExceptionObject>> {
    if let Some(exc) = as_exception(value) {
        return Ok(exc);
    }
    if let Value::Opaque(opaque) = value {
        if let Some(class) = opaque.downcast_ref::<ExceptionClass>() {
            return Ok(Rc::new(ExceptionObject::new(class.name.clone(), "")));
        }
    }
    type_error("exceptions must derive from BaseException")
}

fn exception_matches(exc: &ExceptionObject, class: &Value) -> Exec<bool> {
    match class {
        Value::List(classes) => {
            let classes = classes.borrow().clone();
            for class in &classes {
                if exception_matches(exc, class)? {
                    return Ok(true);
                }
            }
            Ok(false)
        }
        Value::Opaque(opaque) => match opaque.downcast_ref::<ExceptionClass>() {
            Some(class) => Ok(is_subclass(&exc.class, &class.name)),
            None => type_error("catching classes that do not inherit from BaseException is not allowed"),
        },
        _ => type_error("catching classes that do not inherit from BaseException is not allowed"),
    }
}
