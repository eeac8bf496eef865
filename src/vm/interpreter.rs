//! Tree-walking evaluator for the contract dialect.
//!
//! Execution is bounded two ways: a statement/expression fuel budget and a
//! call-depth cap. Everything impure goes through the [`HostEnv`] handed to
//! [`run`]; the evaluator itself has no access to the clock, randomness or
//! the host beyond that trait.

use std::collections::BTreeMap;
use std::rc::Rc;

use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};

use super::ast::*;
use super::env::{HostEnv, QueryCall};
use super::errors::{Interrupt, VmError};
use super::value::{Binding, Closure, Value};
use crate::crypto;
use crate::crypto::keys::{is_valid_address, Address};

const MAX_CALL_DEPTH: u32 = 64;
/// Statements + expression nodes a single execution may evaluate.
pub const DEFAULT_FUEL: u64 = 1_000_000;

type XResult<T> = Result<T, Interrupt>;

enum Flow {
    Normal,
    Return(Value),
    Break,
    Continue,
}

enum PathSeg {
    Prop(String),
    Elem(Value),
}

/// Run a compiled body with the given root bindings.
pub fn run(
    body: &[Stmt],
    globals: Vec<(String, Value)>,
    host: &mut dyn HostEnv,
) -> Result<Value, Interrupt> {
    let mut root = BTreeMap::new();
    for (name, value) in globals {
        root.insert(name, Binding { value, constant: true });
    }
    let mut interp = Interpreter { host, scopes: vec![root], fuel: DEFAULT_FUEL, depth: 0 };
    match interp.exec_sequence(body)? {
        Flow::Return(value) => Ok(value),
        Flow::Normal => Ok(Value::Undefined),
        Flow::Break | Flow::Continue => {
            Err(VmError::runtime("break/continue outside a loop").into())
        }
    }
}

struct Interpreter<'h> {
    host: &'h mut dyn HostEnv,
    scopes: Vec<BTreeMap<String, Binding>>,
    fuel: u64,
    depth: u32,
}

impl<'h> Interpreter<'h> {
    fn burn(&mut self, amount: u64) -> XResult<()> {
        if self.fuel < amount {
            return Err(VmError::OutOfFuel.into());
        }
        self.fuel -= amount;
        Ok(())
    }

    fn lookup(&self, name: &str) -> Option<Value> {
        self.scopes
            .iter()
            .rev()
            .find_map(|scope| scope.get(name).map(|b| b.value.clone()))
    }

    fn is_bound(&self, name: &str) -> bool {
        self.scopes.iter().any(|scope| scope.contains_key(name))
    }

    // ── Statements ───────────────────────────────────────────────────────

    fn exec_sequence(&mut self, body: &[Stmt]) -> XResult<Flow> {
        for stmt in body {
            match self.exec_stmt(stmt)? {
                Flow::Normal => {}
                other => return Ok(other),
            }
        }
        Ok(Flow::Normal)
    }

    fn exec_scoped(&mut self, body: &[Stmt]) -> XResult<Flow> {
        self.scopes.push(BTreeMap::new());
        let result = self.exec_sequence(body);
        self.scopes.pop();
        result
    }

    fn exec_stmt(&mut self, stmt: &Stmt) -> XResult<Flow> {
        self.burn(1)?;
        match stmt {
            Stmt::Let { name, constant, init } => {
                let value = self.eval(init)?;
                self.scopes
                    .last_mut()
                    .expect("scope stack never empty")
                    .insert(name.clone(), Binding { value, constant: *constant });
                Ok(Flow::Normal)
            }
            Stmt::Assign { target, op, value } => {
                let value = self.eval(value)?;
                self.assign(target, *op, value)?;
                Ok(Flow::Normal)
            }
            Stmt::If { cond, then_branch, else_branch } => {
                if self.eval(cond)?.truthy() {
                    self.exec_scoped(then_branch)
                } else if let Some(body) = else_branch {
                    self.exec_scoped(body)
                } else {
                    Ok(Flow::Normal)
                }
            }
            Stmt::While { cond, body } => {
                while self.eval(cond)?.truthy() {
                    self.burn(1)?;
                    match self.exec_scoped(body)? {
                        Flow::Normal | Flow::Continue => {}
                        Flow::Break => break,
                        ret => return Ok(ret),
                    }
                }
                Ok(Flow::Normal)
            }
            Stmt::For { init, cond, update, body } => {
                // The init binding lives for the whole loop.
                self.scopes.push(BTreeMap::new());
                let result = self.exec_for(init, cond, update, body);
                self.scopes.pop();
                result
            }
            Stmt::Break => Ok(Flow::Break),
            Stmt::Continue => Ok(Flow::Continue),
            Stmt::Return(value) => {
                let value = match value {
                    Some(expr) => self.eval(expr)?,
                    None => Value::Undefined,
                };
                Ok(Flow::Return(value))
            }
            Stmt::Expr(expr) => {
                self.eval(expr)?;
                Ok(Flow::Normal)
            }
            Stmt::Block(body) => self.exec_scoped(body),
        }
    }

    fn exec_for(
        &mut self,
        init: &Option<Box<Stmt>>,
        cond: &Option<Expr>,
        update: &Option<Box<Stmt>>,
        body: &[Stmt],
    ) -> XResult<Flow> {
        if let Some(init) = init {
            self.exec_stmt(init)?;
        }
        loop {
            if let Some(cond) = cond {
                if !self.eval(cond)?.truthy() {
                    break;
                }
            }
            self.burn(1)?;
            match self.exec_scoped(body)? {
                Flow::Normal | Flow::Continue => {}
                Flow::Break => break,
                ret => return Ok(ret),
            }
            if let Some(update) = update {
                self.exec_stmt(update)?;
            }
        }
        Ok(Flow::Normal)
    }

    // ── Assignment ───────────────────────────────────────────────────────

    fn resolve_path(&mut self, expr: &Expr) -> XResult<(String, Vec<PathSeg>)> {
        match expr {
            Expr::Ident(name) => Ok((name.clone(), Vec::new())),
            Expr::Member { object, property } => {
                let (root, mut path) = self.resolve_path(object)?;
                path.push(PathSeg::Prop(property.clone()));
                Ok((root, path))
            }
            Expr::Index { object, index } => {
                let idx = self.eval(index)?;
                let (root, mut path) = self.resolve_path(object)?;
                path.push(PathSeg::Elem(idx));
                Ok((root, path))
            }
            _ => Err(VmError::runtime("invalid assignment target").into()),
        }
    }

    fn assign(&mut self, target: &Expr, op: AssignOp, value: Value) -> XResult<()> {
        let (root, path) = self.resolve_path(target)?;
        let scope_idx = self
            .scopes
            .iter()
            .rposition(|scope| scope.contains_key(&root))
            .ok_or_else(|| VmError::runtime(format!("{root} is not defined")))?;
        let binding = self.scopes[scope_idx]
            .get_mut(&root)
            .expect("checked above");
        if path.is_empty() {
            if binding.constant {
                return Err(VmError::runtime(format!("assignment to constant {root}")).into());
            }
            binding.value = apply_assign_op(op, &binding.value, value)?;
            return Ok(());
        }
        let slot = walk_mut(&mut binding.value, &path)?;
        *slot = apply_assign_op(op, slot, value)?;
        Ok(())
    }

    // ── Expressions ──────────────────────────────────────────────────────

    fn eval_args(&mut self, args: &[Expr]) -> XResult<Vec<Value>> {
        args.iter().map(|a| self.eval(a)).collect()
    }

    fn eval(&mut self, expr: &Expr) -> XResult<Value> {
        self.burn(1)?;
        match expr {
            Expr::Number(n) => Ok(Value::Number(*n)),
            Expr::Str(s) => Ok(Value::Str(s.clone())),
            Expr::Bool(b) => Ok(Value::Bool(*b)),
            Expr::Null => Ok(Value::Null),
            Expr::Undefined => Ok(Value::Undefined),
            Expr::Ident(name) => self
                .lookup(name)
                .ok_or_else(|| VmError::runtime(format!("{name} is not defined")).into()),
            Expr::Array(items) => {
                let values = items
                    .iter()
                    .map(|item| self.eval(item))
                    .collect::<XResult<Vec<_>>>()?;
                Ok(Value::Array(values))
            }
            Expr::Object(fields) => {
                let mut map = BTreeMap::new();
                for (key, value_expr) in fields {
                    let value = self.eval(value_expr)?;
                    map.insert(key.clone(), value);
                }
                Ok(Value::Object(map))
            }
            Expr::Member { object, property } => {
                let obj = self.eval(object)?;
                self.member(&obj, property)
            }
            Expr::Index { object, index } => {
                let obj = self.eval(object)?;
                let idx = self.eval(index)?;
                index_value(&obj, &idx)
            }
            Expr::Call { callee, args } => self.eval_call(callee, args),
            Expr::Arrow { params, body } => Ok(Value::Function(Rc::new(Closure {
                params: params.clone(),
                body: body.clone(),
                captured: self.scopes.clone(),
            }))),
            Expr::Await(inner) => {
                let value = self.eval(inner)?;
                match value {
                    Value::Promise(state) => match &state.outcome {
                        Ok(v) => Ok(v.clone()),
                        Err(e) => Err(VmError::runtime(format!(
                            "Uncaught error: {}",
                            error_text(e)
                        ))
                        .into()),
                    },
                    other => Ok(other),
                }
            }
            Expr::Unary { op, operand } => {
                let value = self.eval(operand)?;
                match op {
                    UnaryOp::Neg => match value {
                        Value::Number(n) => Ok(Value::Number(-n)),
                        other => Err(VmError::runtime(format!(
                            "unary - on {}",
                            other.type_name()
                        ))
                        .into()),
                    },
                    UnaryOp::Not => Ok(Value::Bool(!value.truthy())),
                    UnaryOp::TypeOf => Ok(Value::Str(value.type_name().to_string())),
                }
            }
            Expr::Binary { op, left, right } => {
                let l = self.eval(left)?;
                let r = self.eval(right)?;
                binary_op(*op, l, r).map_err(Into::into)
            }
            Expr::Logical { op, left, right } => {
                let l = self.eval(left)?;
                match op {
                    LogicalOp::And => {
                        if l.truthy() {
                            self.eval(right)
                        } else {
                            Ok(l)
                        }
                    }
                    LogicalOp::Or => {
                        if l.truthy() {
                            Ok(l)
                        } else {
                            self.eval(right)
                        }
                    }
                }
            }
            Expr::Conditional { cond, then_value, else_value } => {
                if self.eval(cond)?.truthy() {
                    self.eval(then_value)
                } else {
                    self.eval(else_value)
                }
            }
        }
    }

    fn member(&self, obj: &Value, property: &str) -> XResult<Value> {
        match obj {
            Value::Object(map) => Ok(map.get(property).cloned().unwrap_or(Value::Undefined)),
            Value::Array(items) if property == "length" => {
                Ok(Value::Number(items.len() as f64))
            }
            Value::Str(s) if property == "length" => {
                Ok(Value::Number(s.chars().count() as f64))
            }
            Value::Undefined | Value::Null => Err(VmError::runtime(format!(
                "cannot read property {property} of {}",
                obj.type_name()
            ))
            .into()),
            _ => Ok(Value::Undefined),
        }
    }

    // ── Calls ────────────────────────────────────────────────────────────

    fn eval_call(&mut self, callee: &Expr, args: &[Expr]) -> XResult<Value> {
        if let Expr::Ident(name) = callee {
            if !self.is_bound(name) {
                if let Some(result) = self.call_builtin(name, args)? {
                    return Ok(result);
                }
            }
        }
        if let Expr::Member { object, property } = callee {
            if let Expr::Ident(namespace) = &**object {
                if !self.is_bound(namespace) {
                    match (namespace.as_str(), property.as_str()) {
                        ("JSON", "parse") => {
                            let argv = self.eval_args(args)?;
                            let text = argv
                                .first()
                                .map(Value::to_display)
                                .unwrap_or_else(|| "undefined".to_string());
                            return Ok(self.host.json_parse(&text));
                        }
                        ("JSON", "stringify") => {
                            let argv = self.eval_args(args)?;
                            let value = argv.first().cloned().unwrap_or(Value::Undefined);
                            let text = serde_json::to_string(&value.to_json())
                                .map_err(|e| VmError::runtime(e.to_string()))?;
                            return Ok(Value::Str(text));
                        }
                        ("Object", "keys") => {
                            let argv = self.eval_args(args)?;
                            return match argv.first() {
                                Some(Value::Object(map)) => Ok(Value::Array(
                                    map.keys().map(|k| Value::Str(k.clone())).collect(),
                                )),
                                _ => Err(VmError::runtime("Object.keys needs an object")
                                    .into()),
                            };
                        }
                        ("Math", method) => {
                            let method = method.to_string();
                            let argv = self.eval_args(args)?;
                            return math_call(&method, &argv).map_err(Into::into);
                        }
                        _ => {}
                    }
                }
            }
            let obj = self.eval(object)?;
            let argv = self.eval_args(args)?;
            return self.call_method(object, obj, property, argv);
        }
        let callee_value = self.eval(callee)?;
        let argv = self.eval_args(args)?;
        match callee_value {
            Value::Function(closure) => self.call_closure(&closure, argv),
            other => {
                Err(VmError::runtime(format!("{} is not a function", other.type_name())).into())
            }
        }
    }

    fn call_closure(&mut self, closure: &Rc<Closure>, argv: Vec<Value>) -> XResult<Value> {
        if self.depth >= MAX_CALL_DEPTH {
            return Err(VmError::CallDepth.into());
        }
        self.depth += 1;
        let saved = std::mem::replace(&mut self.scopes, closure.captured.clone());
        let mut params = BTreeMap::new();
        for (i, name) in closure.params.iter().enumerate() {
            let value = argv.get(i).cloned().unwrap_or(Value::Undefined);
            params.insert(name.clone(), Binding { value, constant: false });
        }
        self.scopes.push(params);
        let result = match &closure.body {
            ArrowBody::Expr(expr) => self.eval(expr),
            ArrowBody::Block(body) => match self.exec_sequence(body) {
                Ok(Flow::Return(value)) => Ok(value),
                Ok(Flow::Normal) => Ok(Value::Undefined),
                Ok(Flow::Break | Flow::Continue) => {
                    Err(VmError::runtime("break/continue outside a loop").into())
                }
                Err(e) => Err(e),
            },
        };
        self.scopes = saved;
        self.depth -= 1;
        result
    }

    fn call_method(
        &mut self,
        object_expr: &Expr,
        obj: Value,
        name: &str,
        argv: Vec<Value>,
    ) -> XResult<Value> {
        match (&obj, name) {
            (Value::Promise(state), "catch") => {
                match &state.outcome {
                    Ok(_) => Ok(obj.clone()),
                    Err(error) => match argv.first() {
                        Some(Value::Function(handler)) => {
                            let mapped =
                                self.call_closure(&handler.clone(), vec![error.clone()])?;
                            Ok(Value::promise(Ok(mapped)))
                        }
                        Some(fallback) => Ok(Value::promise(Ok(fallback.clone()))),
                        None => Ok(Value::promise(Ok(Value::Undefined))),
                    },
                }
            }
            (Value::Array(_), "push") => {
                // push mutates; the receiver must be an assignable place.
                let (root, path) = self.resolve_path(object_expr)?;
                let scope_idx = self
                    .scopes
                    .iter()
                    .rposition(|scope| scope.contains_key(&root))
                    .ok_or_else(|| VmError::runtime(format!("{root} is not defined")))?;
                let binding = self.scopes[scope_idx].get_mut(&root).expect("checked");
                let slot = walk_mut(&mut binding.value, &path)?;
                let Value::Array(items) = slot else {
                    return Err(VmError::runtime("push on non-array").into());
                };
                items.extend(argv);
                Ok(Value::Number(items.len() as f64))
            }
            (Value::Array(items), "slice") => {
                let (start, end) = slice_bounds(&argv, items.len());
                Ok(Value::Array(items[start..end].to_vec()))
            }
            (Value::Array(items), "indexOf") => {
                let needle = argv.first().cloned().unwrap_or(Value::Undefined);
                let idx = items.iter().position(|v| *v == needle);
                Ok(Value::Number(idx.map(|i| i as f64).unwrap_or(-1.0)))
            }
            (Value::Array(items), "join") => {
                let sep = argv
                    .first()
                    .map(Value::to_display)
                    .unwrap_or_else(|| ",".to_string());
                Ok(Value::Str(
                    items.iter().map(Value::to_display).collect::<Vec<_>>().join(&sep),
                ))
            }
            (Value::Str(s), "slice") => {
                let chars: Vec<char> = s.chars().collect();
                let (start, end) = slice_bounds(&argv, chars.len());
                Ok(Value::Str(chars[start..end].iter().collect()))
            }
            (Value::Str(s), "indexOf") => {
                let needle = argv.first().map(Value::to_display).unwrap_or_default();
                match s.find(&needle) {
                    Some(byte_idx) => {
                        let char_idx = s[..byte_idx].chars().count();
                        Ok(Value::Number(char_idx as f64))
                    }
                    None => Ok(Value::Number(-1.0)),
                }
            }
            (Value::Str(s), "toLowerCase") => Ok(Value::Str(s.to_lowercase())),
            (Value::Str(s), "toUpperCase") => Ok(Value::Str(s.to_uppercase())),
            (Value::Str(s), "split") => {
                let sep = argv.first().map(Value::to_display).unwrap_or_default();
                let parts: Vec<Value> = if sep.is_empty() {
                    s.chars().map(|c| Value::Str(c.to_string())).collect()
                } else {
                    s.split(&sep).map(|p| Value::Str(p.to_string())).collect()
                };
                Ok(Value::Array(parts))
            }
            (Value::Str(_), "toString")
            | (Value::Number(_), "toString")
            | (Value::Bool(_), "toString") => Ok(Value::Str(obj.to_display())),
            _ => Err(VmError::runtime(format!(
                "unknown method {name} on {}",
                obj.type_name()
            ))
            .into()),
        }
    }

    fn call_builtin(&mut self, name: &str, args: &[Expr]) -> XResult<Option<Value>> {
        let digest = |argv: &[Value], f: &dyn Fn(&[u8]) -> Vec<u8>| -> XResult<Value> {
            let Some(Value::Str(input)) = argv.first() else {
                return Err(VmError::runtime(format!("{name} needs a string")).into());
            };
            Ok(Value::Str(hex::encode(f(input.as_bytes()))))
        };

        let result = match name {
            "sha1" => digest(&self.eval_args(args)?, &|b| crypto::sha1(b).to_vec())?,
            "sha256" => digest(&self.eval_args(args)?, &|b| crypto::sha256(b).to_vec())?,
            "sha512" => digest(&self.eval_args(args)?, &|b| crypto::sha512(b).to_vec())?,
            "md5" => digest(&self.eval_args(args)?, &|b| crypto::md5(b).to_vec())?,
            "ripemd160" => digest(&self.eval_args(args)?, &|b| crypto::ripemd160(b).to_vec())?,
            "hash160" => digest(&self.eval_args(args)?, &|b| crypto::hash160(b).to_vec())?,
            "hash256" => digest(&self.eval_args(args)?, &|b| crypto::hash256(b).to_vec())?,
            "utf8ToHex" => {
                let argv = self.eval_args(args)?;
                let Some(Value::Str(s)) = argv.first() else {
                    return Err(VmError::runtime("utf8ToHex needs a string").into());
                };
                Value::Str(hex::encode(s.as_bytes()))
            }
            "hexToUtf8" => {
                let bytes = self.hex_arg(args, "hexToUtf8")?;
                Value::Str(
                    String::from_utf8(bytes)
                        .map_err(|_| VmError::runtime("hexToUtf8: invalid utf-8"))?,
                )
            }
            "hexToBase64" => {
                let bytes = self.hex_arg(args, "hexToBase64")?;
                Value::Str(BASE64.encode(bytes))
            }
            "base64ToHex" => {
                let argv = self.eval_args(args)?;
                let Some(Value::Str(s)) = argv.first() else {
                    return Err(VmError::runtime("base64ToHex needs a string").into());
                };
                let bytes = BASE64
                    .decode(s)
                    .map_err(|_| VmError::runtime("base64ToHex: invalid base64"))?;
                Value::Str(hex::encode(bytes))
            }
            "base58Encode" => {
                let bytes = self.hex_arg(args, "base58Encode")?;
                Value::Str(crypto::base58_encode(&bytes))
            }
            "base58Decode" => {
                let argv = self.eval_args(args)?;
                let Some(Value::Str(s)) = argv.first() else {
                    return Err(VmError::runtime("base58Decode needs a string").into());
                };
                let bytes = crypto::base58_decode(s)
                    .map_err(|e| VmError::runtime(e.to_string()))?;
                Value::Str(hex::encode(bytes))
            }
            "isValidAddress" => {
                let argv = self.eval_args(args)?;
                let ok = matches!(argv.first(), Some(Value::Str(s)) if is_valid_address(s));
                Value::Bool(ok)
            }
            "addressAsString" => {
                let address = self.address_arg(args, "addressAsString")?;
                Value::Str(address.to_text())
            }
            "addressAsBuffer" => {
                let address = self.address_arg(args, "addressAsBuffer")?;
                Value::Str(hex::encode(address.as_bytes()))
            }
            "dateToISOString" => {
                let argv = self.eval_args(args)?;
                let Some(Value::Number(ms)) = argv.first() else {
                    return Err(
                        VmError::runtime("dateToISOString needs a millisecond number").into()
                    );
                };
                Value::Str(utc_iso_string(*ms).map_err(VmError::runtime)?)
            }
            "reject" => {
                let argv = self.eval_args(args)?;
                let reason = argv
                    .first()
                    .map(Value::to_display)
                    .unwrap_or_else(|| "undefined".to_string());
                self.host.reject(reason);
                return Err(Interrupt::Reject);
            }
            "query" | "queryFast" => {
                let argv = self.eval_args(args)?;
                let call = QueryCall { fast: name == "queryFast", args: argv };
                let outcome = self.host.query(call)?;
                Value::promise(outcome)
            }
            _ => return Ok(None),
        };
        Ok(Some(result))
    }

    fn hex_arg(&mut self, args: &[Expr], what: &str) -> XResult<Vec<u8>> {
        let argv = self.eval_args(args)?;
        let Some(Value::Str(s)) = argv.first() else {
            return Err(VmError::runtime(format!("{what} needs a hex string")).into());
        };
        hex::decode(s).map_err(|_| VmError::runtime(format!("{what}: invalid hex")).into())
    }

    /// Accept an address in text or hex-buffer form.
    fn address_arg(&mut self, args: &[Expr], what: &str) -> XResult<Address> {
        let argv = self.eval_args(args)?;
        let Some(Value::Str(s)) = argv.first() else {
            return Err(VmError::runtime(format!("{what} needs a string")).into());
        };
        if let Ok(address) = Address::from_text(s) {
            return Ok(address);
        }
        let bytes = hex::decode(s)
            .map_err(|_| VmError::runtime(format!("{what}: not an address")))?;
        Address::from_bytes(&bytes)
            .map_err(|_| VmError::runtime(format!("{what}: not an address")).into())
    }
}

// ── Operator helpers ─────────────────────────────────────────────────────

fn apply_assign_op(op: AssignOp, old: &Value, new: Value) -> Result<Value, VmError> {
    match op {
        AssignOp::Set => Ok(new),
        AssignOp::Add => binary_op(BinaryOp::Add, old.clone(), new),
        AssignOp::Sub => binary_op(BinaryOp::Sub, old.clone(), new),
    }
}

fn walk_mut<'v>(mut current: &'v mut Value, path: &[PathSeg]) -> Result<&'v mut Value, VmError> {
    for seg in path {
        current = match seg {
            PathSeg::Prop(name) => match current {
                Value::Object(map) => map.entry(name.clone()).or_insert(Value::Undefined),
                other => {
                    return Err(VmError::runtime(format!(
                        "cannot set property {name} on {}",
                        other.type_name()
                    )))
                }
            },
            PathSeg::Elem(idx) => match current {
                Value::Object(map) => {
                    map.entry(idx.to_display()).or_insert(Value::Undefined)
                }
                Value::Array(items) => {
                    let Value::Number(n) = idx else {
                        return Err(VmError::runtime("array index must be a number"));
                    };
                    if n.fract() != 0.0 || *n < 0.0 {
                        return Err(VmError::runtime("bad array index"));
                    }
                    let i = *n as usize;
                    if i == items.len() {
                        items.push(Value::Undefined);
                    }
                    items
                        .get_mut(i)
                        .ok_or_else(|| VmError::runtime("array index out of bounds"))?
                }
                other => {
                    return Err(VmError::runtime(format!(
                        "cannot index {}",
                        other.type_name()
                    )))
                }
            },
        };
    }
    Ok(current)
}

fn index_value(obj: &Value, idx: &Value) -> XResult<Value> {
    match obj {
        Value::Array(items) => match idx {
            Value::Number(n) if n.fract() == 0.0 && *n >= 0.0 => {
                Ok(items.get(*n as usize).cloned().unwrap_or(Value::Undefined))
            }
            _ => Ok(Value::Undefined),
        },
        Value::Object(map) => {
            Ok(map.get(&idx.to_display()).cloned().unwrap_or(Value::Undefined))
        }
        Value::Str(s) => match idx {
            Value::Number(n) if n.fract() == 0.0 && *n >= 0.0 => Ok(s
                .chars()
                .nth(*n as usize)
                .map(|c| Value::Str(c.to_string()))
                .unwrap_or(Value::Undefined)),
            _ => Ok(Value::Undefined),
        },
        Value::Undefined | Value::Null => {
            Err(VmError::runtime(format!("cannot index {}", obj.type_name())).into())
        }
        _ => Ok(Value::Undefined),
    }
}

fn loose_eq(left: &Value, right: &Value) -> bool {
    match (left, right) {
        (Value::Null | Value::Undefined, Value::Null | Value::Undefined) => true,
        _ => left == right,
    }
}

fn binary_op(op: BinaryOp, left: Value, right: Value) -> Result<Value, VmError> {
    use BinaryOp::*;
    match op {
        Add => match (&left, &right) {
            (Value::Number(a), Value::Number(b)) => Ok(Value::Number(a + b)),
            (Value::Str(_), _) | (_, Value::Str(_)) => Ok(Value::Str(format!(
                "{}{}",
                left.to_display(),
                right.to_display()
            ))),
            _ => Err(VmError::runtime(format!(
                "cannot add {} and {}",
                left.type_name(),
                right.type_name()
            ))),
        },
        Sub | Mul | Div | Rem => match (&left, &right) {
            (Value::Number(a), Value::Number(b)) => Ok(Value::Number(match op {
                Sub => a - b,
                Mul => a * b,
                Div => a / b,
                _ => a % b,
            })),
            _ => Err(VmError::runtime(format!(
                "arithmetic on {} and {}",
                left.type_name(),
                right.type_name()
            ))),
        },
        StrictEq => Ok(Value::Bool(left == right)),
        StrictNe => Ok(Value::Bool(left != right)),
        Eq => Ok(Value::Bool(loose_eq(&left, &right))),
        Ne => Ok(Value::Bool(!loose_eq(&left, &right))),
        Lt | Le | Gt | Ge => match (&left, &right) {
            (Value::Number(a), Value::Number(b)) => Ok(Value::Bool(match op {
                Lt => a < b,
                Le => a <= b,
                Gt => a > b,
                _ => a >= b,
            })),
            (Value::Str(a), Value::Str(b)) => Ok(Value::Bool(match op {
                Lt => a < b,
                Le => a <= b,
                Gt => a > b,
                _ => a >= b,
            })),
            _ => Err(VmError::runtime(format!(
                "comparison of {} and {}",
                left.type_name(),
                right.type_name()
            ))),
        },
    }
}

fn slice_bounds(argv: &[Value], len: usize) -> (usize, usize) {
    let norm = |v: Option<&Value>, default: i64| -> i64 {
        match v {
            Some(Value::Number(n)) => *n as i64,
            _ => default,
        }
    };
    let clamp = |i: i64| -> usize {
        if i < 0 {
            (len as i64 + i).max(0) as usize
        } else {
            (i as usize).min(len)
        }
    };
    let start = clamp(norm(argv.first(), 0));
    let end = clamp(norm(argv.get(1), len as i64));
    (start, end.max(start))
}

fn math_call(method: &str, argv: &[Value]) -> Result<Value, VmError> {
    let number = |i: usize| -> Result<f64, VmError> {
        match argv.get(i) {
            Some(Value::Number(n)) => Ok(*n),
            other => Err(VmError::runtime(format!(
                "Math.{method} needs numbers, got {:?}",
                other.map(Value::type_name)
            ))),
        }
    };
    let result = match method {
        "floor" => number(0)?.floor(),
        "ceil" => number(0)?.ceil(),
        "trunc" => number(0)?.trunc(),
        "abs" => number(0)?.abs(),
        // Half-way cases round toward positive infinity.
        "round" => (number(0)? + 0.5).floor(),
        "sign" => {
            let n = number(0)?;
            if n.is_nan() {
                f64::NAN
            } else if n == 0.0 {
                n
            } else {
                n.signum()
            }
        }
        "min" | "max" => {
            let mut acc = if method == "min" { f64::INFINITY } else { f64::NEG_INFINITY };
            for i in 0..argv.len() {
                let n = number(i)?;
                acc = if method == "min" { acc.min(n) } else { acc.max(n) };
            }
            acc
        }
        "pow" => number(0)?.powf(number(1)?),
        other => return Err(VmError::runtime(format!("unknown Math function {other}"))),
    };
    Ok(Value::Number(result))
}

/// Format UNIX milliseconds as an ISO-8601 UTC timestamp. Pure integer
/// civil-calendar arithmetic; never consults the host clock or timezone.
fn utc_iso_string(ms: f64) -> Result<String, String> {
    if ms.fract() != 0.0 || !ms.is_finite() || ms < 0.0 || ms > 9_007_199_254_740_991.0 {
        return Err("dateToISOString: not a safe millisecond count".to_string());
    }
    let ms = ms as u64;
    let (secs, millis) = (ms / 1000, ms % 1000);
    let (days, rem) = (secs / 86_400, secs % 86_400);
    let (hour, minute, second) = (rem / 3600, (rem / 60) % 60, rem % 60);

    // Civil date from day count (days since 1970-01-01).
    let z = days as i64 + 719_468;
    let era = z / 146_097;
    let doe = z - era * 146_097;
    let yoe = (doe - doe / 1460 + doe / 36_524 - doe / 146_096) / 365;
    let year = yoe + era * 400;
    let doy = doe - (365 * yoe + yoe / 4 - yoe / 100);
    let mp = (5 * doy + 2) / 153;
    let day = doy - (153 * mp + 2) / 5 + 1;
    let month = if mp < 10 { mp + 3 } else { mp - 9 };
    let year = if month <= 2 { year + 1 } else { year };

    Ok(format!(
        "{year:04}-{month:02}-{day:02}T{hour:02}:{minute:02}:{second:02}.{millis:03}Z"
    ))
}

fn error_text(error: &Value) -> String {
    match error.get_member("message") {
        Some(Value::Str(message)) => message.clone(),
        _ => error.to_display(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vm::env::{HostError, QueryCall};
    use crate::vm::parser::parse;

    /// Scripted host: pops query outcomes in order, records rejections.
    struct TestHost {
        responses: Vec<Result<Value, Value>>,
        rejected: Option<String>,
        queries: Vec<(bool, Vec<Value>)>,
    }

    impl TestHost {
        fn new(responses: Vec<Result<Value, Value>>) -> Self {
            Self { responses, rejected: None, queries: Vec::new() }
        }
    }

    impl HostEnv for TestHost {
        fn query(&mut self, call: QueryCall) -> Result<Result<Value, Value>, HostError> {
            self.queries.push((call.fast, call.args));
            if self.responses.is_empty() {
                Ok(Ok(Value::Object(BTreeMap::new())))
            } else {
                Ok(self.responses.remove(0))
            }
        }

        fn reject(&mut self, reason: String) {
            if self.rejected.is_none() {
                self.rejected = Some(reason);
            }
        }

        fn json_parse(&mut self, text: &str) -> Value {
            match serde_json::from_str::<serde_json::Value>(text) {
                Ok(json) => Value::from_json(&json),
                Err(_) => Value::Undefined,
            }
        }
    }

    fn eval_script(src: &str) -> Result<Value, Interrupt> {
        let body = parse(src).unwrap();
        let mut host = TestHost::new(vec![]);
        run(&body, vec![], &mut host)
    }

    fn eval_ok(src: &str) -> Value {
        eval_script(src).unwrap()
    }

    #[test]
    fn test_arithmetic_and_precedence() {
        assert_eq!(eval_ok("return 1 + 2 * 3;"), Value::Number(7.0));
        assert_eq!(eval_ok("return (1 + 2) * 3;"), Value::Number(9.0));
        assert_eq!(eval_ok("return 7 % 3;"), Value::Number(1.0));
        assert_eq!(eval_ok("return -4 / 2;"), Value::Number(-2.0));
    }

    #[test]
    fn test_string_concat_matches_display() {
        assert_eq!(eval_ok(r#"return "" + 0;"#), Value::Str("0".into()));
        assert_eq!(eval_ok(r#"return "n=" + 5;"#), Value::Str("n=5".into()));
        assert_eq!(eval_ok(r#"return 1 + "2";"#), Value::Str("12".into()));
    }

    #[test]
    fn test_variables_and_loops() {
        let src = "let total = 0; let i = 0; while (i < 5) { total += i; i += 1; } return total;";
        assert_eq!(eval_ok(src), Value::Number(10.0));
    }

    #[test]
    fn test_const_cannot_be_reassigned() {
        let result = eval_script("const a = 1; a = 2;");
        assert!(matches!(result, Err(Interrupt::Error(VmError::Runtime(_)))));
    }

    #[test]
    fn test_objects_arrays_and_member_assignment() {
        let src = r#"
            let state = { counts: [1, 2, 3] };
            state.counts[1] = 20;
            state.label = "ok";
            return state.counts[1] + state.counts.length + state.label.length;
        "#;
        assert_eq!(eval_ok(src), Value::Number(25.0));
    }

    #[test]
    fn test_array_methods() {
        assert_eq!(eval_ok("let a = [1]; a.push(2, 3); return a.length;"), Value::Number(3.0));
        assert_eq!(eval_ok("return [1,2,3].indexOf(2);"), Value::Number(1.0));
        assert_eq!(eval_ok(r#"return ["a","b"].join("-");"#), Value::Str("a-b".into()));
        assert_eq!(eval_ok("return [1,2,3,4].slice(1, 3).length;"), Value::Number(2.0));
    }

    #[test]
    fn test_string_methods() {
        assert_eq!(eval_ok(r#"return "HeLLo".toLowerCase();"#), Value::Str("hello".into()));
        assert_eq!(eval_ok(r#"return "abcdef".slice(1, 3);"#), Value::Str("bc".into()));
        assert_eq!(eval_ok(r#"return "a,b,c".split(",").length;"#), Value::Number(3.0));
        assert_eq!(eval_ok(r#"return "abc".indexOf("c");"#), Value::Number(2.0));
    }

    #[test]
    fn test_equality_semantics() {
        assert_eq!(eval_ok("return null == undefined;"), Value::Bool(true));
        assert_eq!(eval_ok("return null === undefined;"), Value::Bool(false));
        assert_eq!(eval_ok("return 1 === 1;"), Value::Bool(true));
        assert_eq!(eval_ok(r#"return "a" !== "b";"#), Value::Bool(true));
    }

    #[test]
    fn test_closures_capture_by_value() {
        let src = r#"
            let x = 10;
            let f = y => x + y;
            x = 99;
            return f(5);
        "#;
        // Captured at creation: 10 + 5.
        assert_eq!(eval_ok(src), Value::Number(15.0));
    }

    #[test]
    fn test_typeof_and_ternary() {
        assert_eq!(eval_ok("return typeof 5;"), Value::Str("number".into()));
        assert_eq!(eval_ok("return typeof undefined;"), Value::Str("undefined".into()));
        assert_eq!(eval_ok("return 1 > 2 ? \"a\" : \"b\";"), Value::Str("b".into()));
    }

    #[test]
    fn test_for_loops_with_break_and_continue() {
        let src = r#"
            let total = 0;
            for (let i = 0; i < 10; i += 1) {
                if (i % 2 == 0) continue;
                if (i > 6) break;
                total += i;
            }
            return total;
        "#;
        // 1 + 3 + 5
        assert_eq!(eval_ok(src), Value::Number(9.0));
    }

    #[test]
    fn test_break_outside_loop_is_an_error() {
        assert!(matches!(
            eval_script("break;"),
            Err(Interrupt::Error(VmError::Runtime(_)))
        ));
    }

    #[test]
    fn test_template_literals_interpolate() {
        assert_eq!(
            eval_ok(r#"let n = 5; return `count is ${n + 1}!`;"#),
            Value::Str("count is 6!".into())
        );
        assert_eq!(eval_ok(r#"return `${undefined}`;"#), Value::Str("undefined".into()));
    }

    #[test]
    fn test_math_namespace() {
        assert_eq!(eval_ok("return Math.floor(1.9);"), Value::Number(1.0));
        assert_eq!(eval_ok("return Math.ceil(1.1);"), Value::Number(2.0));
        assert_eq!(eval_ok("return Math.abs(0 - 7);"), Value::Number(7.0));
        assert_eq!(eval_ok("return Math.round(2.5);"), Value::Number(3.0));
        assert_eq!(eval_ok("return Math.min(3, 1, 2);"), Value::Number(1.0));
        assert_eq!(eval_ok("return Math.max(3, 1, 2);"), Value::Number(3.0));
        assert_eq!(eval_ok("return Math.pow(2, 10);"), Value::Number(1024.0));
        assert!(eval_script("return Math.random();").is_err(), "no randomness");
    }

    #[test]
    fn test_date_formatting_is_pure() {
        assert_eq!(
            eval_ok("return dateToISOString(0);"),
            Value::Str("1970-01-01T00:00:00.000Z".into())
        );
        assert_eq!(
            eval_ok("return dateToISOString(1600000000000);"),
            Value::Str("2020-09-13T12:26:40.000Z".into())
        );
        assert!(eval_script("return dateToISOString(0 - 1);").is_err());
    }

    #[test]
    fn test_crypto_builtins() {
        assert_eq!(
            eval_ok(r#"return sha256("abc");"#),
            Value::Str("ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad".into())
        );
        assert_eq!(eval_ok(r#"return utf8ToHex("AB");"#), Value::Str("4142".into()));
        assert_eq!(eval_ok(r#"return hexToUtf8("4142");"#), Value::Str("AB".into()));
        assert_eq!(eval_ok(r#"return base64ToHex("QUI=");"#), Value::Str("4142".into()));
        assert_eq!(eval_ok(r#"return hexToBase64("4142");"#), Value::Str("QUI=".into()));
        assert_eq!(
            eval_ok(r#"return isValidAddress("1FKhYFQ5jaG2DabjDYLCoY1eviWWNkBN8M");"#),
            Value::Bool(true)
        );
        assert_eq!(
            eval_ok(r#"return addressAsBuffer("1FKhYFQ5jaG2DabjDYLCoY1eviWWNkBN8M");"#),
            Value::Str("9d1b169d749e42bf455d2d791a155d44e82c808e".into())
        );
        assert_eq!(
            eval_ok(r#"return addressAsString("9d1b169d749e42bf455d2d791a155d44e82c808e");"#),
            Value::Str("1FKhYFQ5jaG2DabjDYLCoY1eviWWNkBN8M".into())
        );
    }

    #[test]
    fn test_json_namespace() {
        assert_eq!(
            eval_ok(r#"return JSON.stringify({b: 1, a: [true, null]});"#),
            Value::Str(r#"{"a":[true,null],"b":1}"#.into())
        );
        assert_eq!(eval_ok(r#"return JSON.parse("[1,2]").length;"#), Value::Number(2.0));
        // Sandbox sentinel: garbage parses to undefined instead of raising.
        assert_eq!(eval_ok(r#"return typeof JSON.parse("garbage");"#), Value::Str("undefined".into()));
    }

    #[test]
    fn test_reject_interrupts_execution() {
        let body = parse(r#"reject("nope"); return 1;"#).unwrap();
        let mut host = TestHost::new(vec![]);
        let result = run(&body, vec![], &mut host);
        assert!(matches!(result, Err(Interrupt::Reject)));
        assert_eq!(host.rejected.as_deref(), Some("nope"));
    }

    #[test]
    fn test_query_await_and_rows() {
        let mut rows_obj = BTreeMap::new();
        rows_obj.insert(
            "rows".to_string(),
            Value::Array(vec![Value::Object(
                [("called".to_string(), Value::Number(3.0))].into_iter().collect(),
            )]),
        );
        rows_obj.insert("rowCount".to_string(), Value::Number(1.0));
        let mut host = TestHost::new(vec![Ok(Value::Object(rows_obj))]);
        let body = parse(
            r#"
            let res = await query("SELECT called FROM test WHERE addr = $1;", [from]);
            return res.rows[0].called;
        "#,
        )
        .unwrap();
        let globals = vec![("from".to_string(), Value::Str("addr1".into()))];
        assert_eq!(run(&body, globals, &mut host).unwrap(), Value::Number(3.0));
        assert!(!host.queries[0].0, "not a fast query");
    }

    #[test]
    fn test_uncaught_query_error_is_an_error() {
        let error = Value::Object(
            [
                ("code".to_string(), Value::Str("23505".into())),
                ("message".to_string(), Value::Str("Constraint violation.".into())),
            ]
            .into_iter()
            .collect(),
        );
        let mut host = TestHost::new(vec![Err(error.clone())]);
        let body = parse(r#"await query("INSERT ...;", []);"#).unwrap();
        let result = run(&body, vec![], &mut host);
        assert!(matches!(result, Err(Interrupt::Error(VmError::Runtime(_)))));

        // The same failure routed through .catch is recoverable.
        let mut host = TestHost::new(vec![Err(error)]);
        let body = parse(r#"return await query("INSERT ...;", []).catch(e => e.code);"#).unwrap();
        assert_eq!(run(&body, vec![], &mut host).unwrap(), Value::Str("23505".into()));
    }

    #[test]
    fn test_fuel_bounds_infinite_loops() {
        let result = eval_script("while (true) { let a = 1; }");
        assert!(matches!(result, Err(Interrupt::Error(VmError::OutOfFuel))));
    }

    #[test]
    fn test_call_depth_is_bounded() {
        let src = "let f = x => f(x); return f(1);";
        let result = eval_script(src);
        // The self-capture is undefined at creation time in this dialect,
        // so this errors either way; depth must not overflow the stack.
        assert!(result.is_err());
    }

    #[test]
    fn test_member_of_undefined_errors() {
        assert!(matches!(
            eval_script("let a = undefined; return a.b;"),
            Err(Interrupt::Error(VmError::Runtime(_)))
        ));
    }

    #[test]
    fn test_shadowing_builtins_is_allowed() {
        let src = r#"let sha256 = x => "shadowed"; return sha256("abc");"#;
        assert_eq!(eval_ok(src), Value::Str("shadowed".into()));
    }
}
