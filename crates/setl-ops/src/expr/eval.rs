//! Tree-walking evaluator over JSON records.

use serde_json::{Map, Number, Value};

use super::{BinaryOp, Expr, ExprError, Func, UnaryOp};

pub fn eval(expr: &Expr, record: &Map<String, Value>) -> Result<Value, ExprError> {
    match expr {
        Expr::Int(v) => Ok(Value::from(*v)),
        Expr::Float(v) => float_value(*v),
        Expr::Str(v) => Ok(Value::String(v.clone())),
        Expr::Bool(v) => Ok(Value::Bool(*v)),
        Expr::Null => Ok(Value::Null),
        Expr::Field(name) => record
            .get(name)
            .cloned()
            .ok_or_else(|| ExprError::UnknownField(name.clone())),
        Expr::Has(name) => Ok(Value::Bool(record.contains_key(name))),
        Expr::Unary { op, expr } => {
            let value = eval(expr, record)?;
            match op {
                UnaryOp::Not => match value {
                    Value::Bool(b) => Ok(Value::Bool(!b)),
                    other => Err(type_mismatch("not", &other)),
                },
                UnaryOp::Neg => match Num::of(&value) {
                    Some(Num::Int(i)) => i
                        .checked_neg()
                        .map(Value::from)
                        .ok_or_else(|| ExprError::Overflow("negation".to_string())),
                    Some(Num::Float(f)) => float_value(-f),
                    None => Err(type_mismatch("negation", &value)),
                },
            }
        }
        Expr::Binary { op, left, right } => eval_binary(*op, left, right, record),
        Expr::InList { needle, list, negated } => {
            let value = eval(needle, record)?;
            let mut found = false;
            for item in list {
                if values_equal(&value, &eval(item, record)?) {
                    found = true;
                    break;
                }
            }
            Ok(Value::Bool(found != *negated))
        }
        Expr::InValue { needle, haystack, negated } => {
            let value = eval(needle, record)?;
            let haystack = eval(haystack, record)?;
            let items = haystack
                .as_array()
                .ok_or_else(|| type_mismatch("in", &haystack))?;
            let found = items.iter().any(|item| values_equal(&value, item));
            Ok(Value::Bool(found != *negated))
        }
        Expr::Call { func, args } => eval_call(*func, args, record),
    }
}

fn eval_binary(
    op: BinaryOp,
    left: &Expr,
    right: &Expr,
    record: &Map<String, Value>,
) -> Result<Value, ExprError> {
    // Logical operators short-circuit.
    if matches!(op, BinaryOp::And | BinaryOp::Or) {
        let lhs = match eval(left, record)? {
            Value::Bool(b) => b,
            other => return Err(type_mismatch(op.name(), &other)),
        };
        match (op, lhs) {
            (BinaryOp::And, false) => return Ok(Value::Bool(false)),
            (BinaryOp::Or, true) => return Ok(Value::Bool(true)),
            _ => {}
        }
        return match eval(right, record)? {
            Value::Bool(b) => Ok(Value::Bool(b)),
            other => Err(type_mismatch(op.name(), &other)),
        };
    }

    let lhs = eval(left, record)?;
    let rhs = eval(right, record)?;

    match op {
        BinaryOp::Eq => Ok(Value::Bool(values_equal(&lhs, &rhs))),
        BinaryOp::Ne => Ok(Value::Bool(!values_equal(&lhs, &rhs))),
        BinaryOp::Lt | BinaryOp::Le | BinaryOp::Gt | BinaryOp::Ge => {
            let ordering = compare(&lhs, &rhs).ok_or_else(|| ExprError::TypeMismatch {
                operation: op.name().to_string(),
                value: format!("{lhs} vs {rhs}"),
            })?;
            let holds = match op {
                BinaryOp::Lt => ordering.is_lt(),
                BinaryOp::Le => ordering.is_le(),
                BinaryOp::Gt => ordering.is_gt(),
                BinaryOp::Ge => ordering.is_ge(),
                _ => unreachable!(),
            };
            Ok(Value::Bool(holds))
        }
        BinaryOp::Add | BinaryOp::Sub | BinaryOp::Mul | BinaryOp::Div | BinaryOp::Rem => {
            arithmetic(op, &lhs, &rhs)
        }
        BinaryOp::And | BinaryOp::Or => unreachable!("handled above"),
    }
}

fn arithmetic(op: BinaryOp, lhs: &Value, rhs: &Value) -> Result<Value, ExprError> {
    // String concatenation rides on `+`.
    if op == BinaryOp::Add {
        if let (Value::String(a), Value::String(b)) = (lhs, rhs) {
            return Ok(Value::String(format!("{a}{b}")));
        }
    }

    let (a, b) = match (Num::of(lhs), Num::of(rhs)) {
        (Some(a), Some(b)) => (a, b),
        _ => {
            return Err(ExprError::TypeMismatch {
                operation: op.name().to_string(),
                value: format!("{lhs} vs {rhs}"),
            })
        }
    };

    match (a, b) {
        (Num::Int(a), Num::Int(b)) => {
            let result = match op {
                BinaryOp::Add => a.checked_add(b),
                BinaryOp::Sub => a.checked_sub(b),
                BinaryOp::Mul => a.checked_mul(b),
                BinaryOp::Div => {
                    if b == 0 {
                        return Err(ExprError::DivisionByZero);
                    }
                    a.checked_div(b)
                }
                BinaryOp::Rem => {
                    if b == 0 {
                        return Err(ExprError::DivisionByZero);
                    }
                    a.checked_rem(b)
                }
                _ => unreachable!(),
            };
            result
                .map(Value::from)
                .ok_or_else(|| ExprError::Overflow(op.name().to_string()))
        }
        (a, b) => {
            let (a, b) = (a.as_f64(), b.as_f64());
            let result = match op {
                BinaryOp::Add => a + b,
                BinaryOp::Sub => a - b,
                BinaryOp::Mul => a * b,
                BinaryOp::Div => {
                    if b == 0.0 {
                        return Err(ExprError::DivisionByZero);
                    }
                    a / b
                }
                BinaryOp::Rem => {
                    if b == 0.0 {
                        return Err(ExprError::DivisionByZero);
                    }
                    a % b
                }
                _ => unreachable!(),
            };
            float_value(result)
        }
    }
}

fn eval_call(func: Func, args: &[Expr], record: &Map<String, Value>) -> Result<Value, ExprError> {
    let values: Vec<Value> = args
        .iter()
        .map(|arg| eval(arg, record))
        .collect::<Result<_, _>>()?;

    match func {
        Func::Int => {
            let v = &values[0];
            match v {
                Value::Number(n) if n.is_i64() || n.is_u64() => Ok(v.clone()),
                Value::Number(n) => Ok(Value::from(n.as_f64().unwrap_or(0.0).trunc() as i64)),
                Value::String(s) => s
                    .trim()
                    .parse::<i64>()
                    .map(Value::from)
                    .map_err(|_| conversion_error("int", v)),
                Value::Bool(b) => Ok(Value::from(i64::from(*b))),
                other => Err(conversion_error("int", other)),
            }
        }
        Func::Float => {
            let v = &values[0];
            match v {
                Value::Number(n) => float_value(n.as_f64().unwrap_or(0.0)),
                Value::String(s) => s
                    .trim()
                    .parse::<f64>()
                    .map_err(|_| conversion_error("float", v))
                    .and_then(float_value),
                Value::Bool(b) => float_value(f64::from(u8::from(*b))),
                other => Err(conversion_error("float", other)),
            }
        }
        Func::String => {
            let v = &values[0];
            match v {
                Value::String(s) => Ok(Value::String(s.clone())),
                Value::Number(n) => Ok(Value::String(n.to_string())),
                Value::Bool(b) => Ok(Value::String(b.to_string())),
                other => Err(conversion_error("string", other)),
            }
        }
        Func::Bool => {
            let v = &values[0];
            match v {
                Value::Bool(b) => Ok(Value::Bool(*b)),
                Value::String(s) => match s.as_str() {
                    "true" => Ok(Value::Bool(true)),
                    "false" => Ok(Value::Bool(false)),
                    _ => Err(conversion_error("bool", v)),
                },
                Value::Number(n) => Ok(Value::Bool(n.as_f64().unwrap_or(0.0) != 0.0)),
                other => Err(conversion_error("bool", other)),
            }
        }
        Func::Len => {
            let v = &values[0];
            let len = match v {
                Value::String(s) => s.chars().count(),
                Value::Array(a) => a.len(),
                Value::Object(o) => o.len(),
                other => return Err(conversion_error("len", other)),
            };
            Ok(Value::from(len as i64))
        }
        Func::Abs => match Num::of(&values[0]) {
            Some(Num::Int(i)) => i
                .checked_abs()
                .map(Value::from)
                .ok_or_else(|| ExprError::Overflow("abs".to_string())),
            Some(Num::Float(f)) => float_value(f.abs()),
            None => Err(conversion_error("abs", &values[0])),
        },
        Func::Ceil | Func::Floor | Func::Round => match Num::of(&values[0]) {
            Some(Num::Int(i)) => Ok(Value::from(i)),
            Some(Num::Float(f)) => {
                let rounded = match func {
                    Func::Ceil => f.ceil(),
                    Func::Floor => f.floor(),
                    _ => f.round(),
                };
                if rounded < i64::MIN as f64 || rounded > i64::MAX as f64 {
                    return Err(ExprError::Overflow(func.name().to_string()));
                }
                Ok(Value::from(rounded as i64))
            }
            None => Err(conversion_error(func.name(), &values[0])),
        },
        Func::Min | Func::Max => {
            let mut best: Option<Value> = None;
            for value in &values {
                let better = match &best {
                    None => true,
                    Some(current) => {
                        let ordering = compare(value, current).ok_or_else(|| {
                            ExprError::TypeMismatch {
                                operation: func.name().to_string(),
                                value: format!("{value} vs {current}"),
                            }
                        })?;
                        if func == Func::Min { ordering.is_lt() } else { ordering.is_gt() }
                    }
                };
                if better {
                    best = Some(value.clone());
                }
            }
            best.ok_or_else(|| ExprError::TypeMismatch {
                operation: func.name().to_string(),
                value: "no arguments".to_string(),
            })
        }
        Func::Concat => {
            let mut out = String::new();
            for value in &values {
                match value {
                    Value::String(s) => out.push_str(s),
                    Value::Number(n) => out.push_str(&n.to_string()),
                    Value::Bool(b) => out.push_str(&b.to_string()),
                    other => return Err(conversion_error("concat", other)),
                }
            }
            Ok(Value::String(out))
        }
    }
}

/// Numeric view over a JSON value.
enum Num {
    Int(i64),
    Float(f64),
}

impl Num {
    fn of(value: &Value) -> Option<Num> {
        let n = value.as_number()?;
        if let Some(i) = n.as_i64() {
            Some(Num::Int(i))
        } else {
            n.as_f64().map(Num::Float)
        }
    }

    fn as_f64(&self) -> f64 {
        match self {
            Num::Int(i) => *i as f64,
            Num::Float(f) => *f,
        }
    }
}

fn values_equal(a: &Value, b: &Value) -> bool {
    match (Num::of(a), Num::of(b)) {
        // 1 == 1.0 for numbers, regardless of JSON representation.
        (Some(x), Some(y)) => x.as_f64() == y.as_f64(),
        _ => a == b,
    }
}

fn compare(a: &Value, b: &Value) -> Option<std::cmp::Ordering> {
    match (a, b) {
        (Value::String(x), Value::String(y)) => Some(x.cmp(y)),
        _ => match (Num::of(a), Num::of(b)) {
            (Some(x), Some(y)) => x.as_f64().partial_cmp(&y.as_f64()),
            _ => None,
        },
    }
}

fn float_value(f: f64) -> Result<Value, ExprError> {
    Number::from_f64(f)
        .map(Value::Number)
        .ok_or_else(|| ExprError::Overflow("non-finite float result".to_string()))
}

fn type_mismatch(operation: &str, value: &Value) -> ExprError {
    ExprError::TypeMismatch { operation: operation.to_string(), value: value.to_string() }
}

fn conversion_error(func: &str, value: &Value) -> ExprError {
    ExprError::TypeMismatch { operation: func.to_string(), value: value.to_string() }
}
