//! Tree-walking evaluator. Values are JSON values; calls go to the host
//! except for a handful of pure helpers.

use std::collections::HashMap;

use futures::future::BoxFuture;
use futures::FutureExt;
use serde_json::{Map, Value};

use super::parser::{number, BinOp, Expr, Stmt, StmtKind, UnaryOp};
use super::{Host, ScriptError, ScriptFault};

pub(crate) struct Interpreter<'h> {
    host: &'h mut dyn Host,
    scope: HashMap<String, Value>,
}

impl<'h> Interpreter<'h> {
    pub fn new(host: &'h mut dyn Host, globals: Map<String, Value>) -> Self {
        Self {
            host,
            scope: globals.into_iter().collect(),
        }
    }

    pub async fn run(mut self, program: &[Stmt]) -> Result<(), ScriptFault> {
        self.block(program).await
    }

    fn block<'a>(&'a mut self, stmts: &'a [Stmt]) -> BoxFuture<'a, Result<(), ScriptFault>> {
        async move {
            for stmt in stmts {
                self.statement(stmt).await.map_err(|error| match error {
                    // Nested blocks already carry the innermost line.
                    Fault::Located(fault) => fault,
                    Fault::Raw(error) => ScriptFault {
                        line: Some(stmt.line),
                        error,
                    },
                })?;
            }
            Ok(())
        }
        .boxed()
    }

    async fn statement(&mut self, stmt: &Stmt) -> Result<(), Fault> {
        match &stmt.kind {
            StmtKind::Let { name, value } => {
                let v = self.eval(value).await?;
                self.scope.insert(name.clone(), v);
            }
            StmtKind::Assign { name, value } => {
                if !self.scope.contains_key(name) {
                    return Err(ScriptError::UndefinedVariable(name.clone()).into());
                }
                let v = self.eval(value).await?;
                self.scope.insert(name.clone(), v);
            }
            StmtKind::If {
                cond,
                then,
                otherwise,
            } => {
                let branch = if truthy(&self.eval(cond).await?) {
                    then
                } else {
                    otherwise
                };
                self.block(branch).await.map_err(Fault::Located)?;
            }
            StmtKind::Expr(expr) => {
                self.eval(expr).await?;
            }
        }
        Ok(())
    }

    fn eval<'a>(&'a mut self, expr: &'a Expr) -> BoxFuture<'a, Result<Value, ScriptError>> {
        async move {
            match expr {
                Expr::Literal(v) => Ok(v.clone()),
                Expr::Var(name) => self
                    .scope
                    .get(name)
                    .cloned()
                    .ok_or_else(|| ScriptError::UndefinedVariable(name.clone())),
                Expr::List(items) => {
                    let mut out = Vec::with_capacity(items.len());
                    for item in items {
                        out.push(self.eval(item).await?);
                    }
                    Ok(Value::Array(out))
                }
                Expr::Map(entries) => {
                    let mut out = Map::new();
                    for (key, value) in entries {
                        let v = self.eval(value).await?;
                        out.insert(key.clone(), v);
                    }
                    Ok(Value::Object(out))
                }
                Expr::Call { name, args } => {
                    let mut values = Vec::with_capacity(args.len());
                    for arg in args {
                        values.push(self.eval(arg).await?);
                    }
                    match builtin(name, &values) {
                        Some(result) => result,
                        None => self.host.call(name, values).await,
                    }
                }
                Expr::Field { target, name } => {
                    let v = self.eval(target).await?;
                    match v {
                        Value::Object(mut m) => Ok(m.remove(name).unwrap_or(Value::Null)),
                        Value::Null => Ok(Value::Null),
                        other => Err(ScriptError::Type(format!(
                            "cannot read field {name} of {}",
                            type_name(&other)
                        ))),
                    }
                }
                Expr::Index { target, index } => {
                    let v = self.eval(target).await?;
                    let i = self.eval(index).await?;
                    index_value(v, &i)
                }
                Expr::Unary { op, expr } => {
                    let v = self.eval(expr).await?;
                    match op {
                        UnaryOp::Not => Ok(Value::Bool(!truthy(&v))),
                        UnaryOp::Neg => Ok(number(-as_number(&v)?)),
                    }
                }
                Expr::Binary { op, lhs, rhs } => {
                    let l = self.eval(lhs).await?;
                    match op {
                        BinOp::And if !truthy(&l) => return Ok(Value::Bool(false)),
                        BinOp::Or if truthy(&l) => return Ok(Value::Bool(true)),
                        _ => {}
                    }
                    let r = self.eval(rhs).await?;
                    binary(*op, l, r)
                }
            }
        }
        .boxed()
    }
}

/// Statement failure before or after a line number is attached.
enum Fault {
    Raw(ScriptError),
    Located(ScriptFault),
}

impl From<ScriptError> for Fault {
    fn from(e: ScriptError) -> Self {
        Fault::Raw(e)
    }
}

pub(crate) fn truthy(v: &Value) -> bool {
    match v {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().map(|f| f != 0.0).unwrap_or(false),
        Value::String(s) => !s.is_empty(),
        Value::Array(a) => !a.is_empty(),
        Value::Object(m) => !m.is_empty(),
    }
}

fn type_name(v: &Value) -> &'static str {
    match v {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "list",
        Value::Object(_) => "map",
    }
}

fn as_number(v: &Value) -> Result<f64, ScriptError> {
    v.as_f64()
        .ok_or_else(|| ScriptError::Type(format!("expected number, got {}", type_name(v))))
}

/// Text form used by `+` concatenation and `str()`.
pub(crate) fn display(v: &Value) -> String {
    match v {
        Value::String(s) => s.clone(),
        Value::Null => "null".to_string(),
        other => other.to_string(),
    }
}

fn values_equal(a: &Value, b: &Value) -> bool {
    match (a.as_f64(), b.as_f64()) {
        (Some(x), Some(y)) => x == y,
        _ => a == b,
    }
}

fn binary(op: BinOp, l: Value, r: Value) -> Result<Value, ScriptError> {
    match op {
        BinOp::Add => match (l, r) {
            (Value::Array(mut a), Value::Array(b)) => {
                a.extend(b);
                Ok(Value::Array(a))
            }
            (l @ Value::String(_), r) | (l, r @ Value::String(_)) => {
                Ok(Value::String(display(&l) + &display(&r)))
            }
            (l, r) => Ok(number(as_number(&l)? + as_number(&r)?)),
        },
        BinOp::Sub => Ok(number(as_number(&l)? - as_number(&r)?)),
        BinOp::Mul => Ok(number(as_number(&l)? * as_number(&r)?)),
        BinOp::Div => {
            let d = as_number(&r)?;
            if d == 0.0 {
                return Err(ScriptError::Type("division by zero".to_string()));
            }
            Ok(number(as_number(&l)? / d))
        }
        BinOp::Eq => Ok(Value::Bool(values_equal(&l, &r))),
        BinOp::NotEq => Ok(Value::Bool(!values_equal(&l, &r))),
        BinOp::Lt | BinOp::Le | BinOp::Gt | BinOp::Ge => {
            let ord = match (&l, &r) {
                (Value::String(a), Value::String(b)) => a.partial_cmp(b),
                _ => as_number(&l)?.partial_cmp(&as_number(&r)?),
            };
            let ord = ord.ok_or_else(|| ScriptError::Type("values are not comparable".into()))?;
            Ok(Value::Bool(match op {
                BinOp::Lt => ord.is_lt(),
                BinOp::Le => ord.is_le(),
                BinOp::Gt => ord.is_gt(),
                _ => ord.is_ge(),
            }))
        }
        BinOp::And | BinOp::Or => Ok(Value::Bool(truthy(&r))),
    }
}

fn index_value(target: Value, index: &Value) -> Result<Value, ScriptError> {
    match (target, index) {
        (Value::Array(items), Value::Number(n)) => {
            let i = n
                .as_u64()
                .ok_or_else(|| ScriptError::Type(format!("invalid list index {n}")))?;
            let len = items.len();
            items
                .into_iter()
                .nth(i as usize)
                .ok_or_else(|| ScriptError::Type(format!("index {i} out of range for list of {len}")))
        }
        (Value::Object(mut m), Value::String(key)) => Ok(m.remove(key).unwrap_or(Value::Null)),
        (Value::String(s), Value::Number(n)) => {
            let i = n.as_u64().unwrap_or(u64::MAX) as usize;
            s.chars()
                .nth(i)
                .map(|c| Value::String(c.to_string()))
                .ok_or_else(|| ScriptError::Type(format!("index {n} out of range for string")))
        }
        (t, i) => Err(ScriptError::Type(format!(
            "cannot index {} with {}",
            type_name(&t),
            type_name(i)
        ))),
    }
}

fn arity(name: &str, args: &[Value], expected: usize) -> Result<(), ScriptError> {
    if args.len() == expected {
        Ok(())
    } else {
        Err(ScriptError::Arity {
            name: name.to_string(),
            expected: expected.to_string(),
            got: args.len(),
        })
    }
}

/// Pure helpers evaluated without the host. `None` means "not a builtin".
fn builtin(name: &str, args: &[Value]) -> Option<Result<Value, ScriptError>> {
    let result = match name {
        "contains" => arity(name, args, 2).and_then(|()| match &args[0] {
            Value::String(s) => Ok(Value::Bool(s.contains(&display(&args[1])))),
            Value::Array(items) => Ok(Value::Bool(items.iter().any(|v| values_equal(v, &args[1])))),
            Value::Object(m) => Ok(Value::Bool(m.contains_key(&display(&args[1])))),
            other => Err(ScriptError::Type(format!("contains() on {}", type_name(other)))),
        }),
        "len" => arity(name, args, 1).and_then(|()| match &args[0] {
            Value::String(s) => Ok(Value::from(s.chars().count())),
            Value::Array(a) => Ok(Value::from(a.len())),
            Value::Object(m) => Ok(Value::from(m.len())),
            other => Err(ScriptError::Type(format!("len() of {}", type_name(other)))),
        }),
        "str" => arity(name, args, 1).map(|()| Value::String(display(&args[0]))),
        "num" => arity(name, args, 1).and_then(|()| match &args[0] {
            Value::Number(_) => Ok(args[0].clone()),
            Value::String(s) => s
                .trim()
                .parse::<f64>()
                .map(number)
                .map_err(|_| ScriptError::Type(format!("cannot convert {s:?} to a number"))),
            Value::Bool(b) => Ok(Value::from(u8::from(*b))),
            other => Err(ScriptError::Type(format!("num() of {}", type_name(other)))),
        }),
        _ => return None,
    };
    Some(result)
}
