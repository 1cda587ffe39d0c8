use std::cmp::Ordering;

use super::{
    Environment,
    parse::{BinaryOp, ExprNode, UnaryOp},
};
use crate::{error::ExprError, interface::Value};

pub(crate) fn eval(node: &ExprNode, env: &mut dyn Environment) -> Result<Value, ExprError> {
    match node {
        ExprNode::Literal(value) => Ok(value.clone()),
        ExprNode::List(items) => items
            .iter()
            .map(|item| eval(item, env))
            .collect::<Result<Vec<_>, _>>()
            .map(Value::List),
        ExprNode::Ident(name) => env.lookup(name).ok_or_else(|| ExprError::Unresolvable {
            name: name.clone(),
        }),
        ExprNode::Field { target, field } => {
            let target = eval(target, env)?;
            field_of(&target, field)
        }
        ExprNode::Index { target, index } => {
            let target = eval(target, env)?;
            let index = eval(index, env)?;
            index_of(&target, &index)
        }
        ExprNode::Call { callee, args } => {
            let callee = eval(callee, env)?;
            let args = args
                .iter()
                .map(|arg| eval(arg, env))
                .collect::<Result<Vec<_>, _>>()?;
            env.call(&callee, args)
        }
        ExprNode::Unary { op, operand } => {
            let operand = eval(operand, env)?;
            unary(*op, &operand)
        }
        ExprNode::Binary {
            op: BinaryOp::And,
            left,
            right,
        } => {
            // Short circuit
            if !eval(left, env)?.is_truthy() {
                return Ok(Value::Bool(false));
            }
            Ok(Value::Bool(eval(right, env)?.is_truthy()))
        }
        ExprNode::Binary {
            op: BinaryOp::Or,
            left,
            right,
        } => {
            // Short circuit
            if eval(left, env)?.is_truthy() {
                return Ok(Value::Bool(true));
            }
            Ok(Value::Bool(eval(right, env)?.is_truthy()))
        }
        ExprNode::Binary { op, left, right } => {
            let left = eval(left, env)?;
            let right = eval(right, env)?;
            binary(*op, left, right)
        }
        ExprNode::Assign { name, op, value } => {
            let mut value = eval(value, env)?;
            if let Some(op) = op {
                let current = env.lookup(name).ok_or_else(|| ExprError::Unresolvable {
                    name: name.clone(),
                })?;
                value = binary(*op, current, value)?;
            }
            env.assign(name, value.clone());
            Ok(value)
        }
        ExprNode::Sequence(items) => {
            let mut last = Value::Null;
            for item in items {
                last = eval(item, env)?;
            }
            Ok(last)
        }
    }
}

fn field_of(target: &Value, field: &str) -> Result<Value, ExprError> {
    let length = match (target, field) {
        (Value::Map(map), _) if map.contains_key(field) => {
            return Ok(map.get(field).cloned().unwrap_or_default());
        }
        (Value::List(items), "size" | "length") => Some(items.len()),
        (Value::Map(map), "size" | "length") => Some(map.len()),
        (Value::String(s), "size" | "length") => Some(s.chars().count()),
        _ => None,
    };
    length
        .map(|len| i64::try_from(len).map(Value::Int).map_err(|_| ExprError::Overflow))
        .unwrap_or_else(|| {
            Err(ExprError::NoField {
                field: field.to_string(),
                found: target.type_name().to_string(),
            })
        })
}

fn index_of(target: &Value, index: &Value) -> Result<Value, ExprError> {
    match (target, index) {
        (Value::List(items), Value::Int(i)) => usize::try_from(*i)
            .ok()
            .and_then(|idx| items.get(idx))
            .cloned()
            .ok_or(ExprError::OutOfBounds {
                index: *i,
                len: items.len(),
            }),
        (Value::String(s), Value::Int(i)) => usize::try_from(*i)
            .ok()
            .and_then(|idx| s.chars().nth(idx))
            .map(|c| Value::String(c.to_string()))
            .ok_or_else(|| ExprError::OutOfBounds {
                index: *i,
                len: s.chars().count(),
            }),
        (Value::Map(map), Value::String(key)) => Ok(map.get(key).cloned().unwrap_or_default()),
        _ => Err(ExprError::Index {
            found: target.type_name().to_string(),
            index: index.type_name().to_string(),
        }),
    }
}

fn unary(op: UnaryOp, operand: &Value) -> Result<Value, ExprError> {
    match (op, operand) {
        (UnaryOp::Not, value) => Ok(Value::Bool(!value.is_truthy())),
        (UnaryOp::Neg, Value::Int(i)) => i.checked_neg().map(Value::Int).ok_or(ExprError::Overflow),
        (UnaryOp::Neg, Value::Float(f)) => Ok(Value::Float(-f)),
        (UnaryOp::Neg, other) => Err(ExprError::Unary {
            op: "-".to_string(),
            operand: other.type_name().to_string(),
        }),
    }
}

fn mismatch(op: BinaryOp, left: &Value, right: &Value) -> ExprError {
    ExprError::Operator {
        op: op.symbol().to_string(),
        left: left.type_name().to_string(),
        right: right.type_name().to_string(),
    }
}

fn as_float(value: &Value) -> Option<f64> {
    match value {
        Value::Int(i) => Some(*i as f64),
        Value::Float(f) => Some(*f),
        Value::Null
        | Value::Bool(_)
        | Value::String(_)
        | Value::List(_)
        | Value::Map(_)
        | Value::Block(_) => None,
    }
}

fn binary(op: BinaryOp, left: Value, right: Value) -> Result<Value, ExprError> {
    match op {
        BinaryOp::Eq => Ok(Value::Bool(values_equal(&left, &right))),
        BinaryOp::Ne => Ok(Value::Bool(!values_equal(&left, &right))),
        BinaryOp::Lt | BinaryOp::Le | BinaryOp::Gt | BinaryOp::Ge => {
            let ordering = compare(&left, &right).ok_or_else(|| mismatch(op, &left, &right))?;
            Ok(Value::Bool(match op {
                BinaryOp::Lt => ordering == Ordering::Less,
                BinaryOp::Le => ordering != Ordering::Greater,
                BinaryOp::Gt => ordering == Ordering::Greater,
                _ => ordering != Ordering::Less,
            }))
        }
        BinaryOp::Add => add(left, right),
        BinaryOp::Sub | BinaryOp::Mul | BinaryOp::Div | BinaryOp::Rem => arithmetic(op, &left, &right),
        // Short-circuiting operators are handled in `eval`.
        BinaryOp::And => Ok(Value::Bool(left.is_truthy() && right.is_truthy())),
        BinaryOp::Or => Ok(Value::Bool(left.is_truthy() || right.is_truthy())),
    }
}

fn add(left: Value, right: Value) -> Result<Value, ExprError> {
    match (left, right) {
        (Value::Int(a), Value::Int(b)) => a.checked_add(b).map(Value::Int).ok_or(ExprError::Overflow),
        (Value::String(mut a), b) => {
            a.push_str(&b.to_string());
            Ok(Value::String(a))
        }
        (a, Value::String(b)) => Ok(Value::String(format!("{a}{b}"))),
        (Value::List(mut a), Value::List(b)) => {
            a.extend(b);
            Ok(Value::List(a))
        }
        (a, b) => match (as_float(&a), as_float(&b)) {
            (Some(x), Some(y)) => Ok(Value::Float(x + y)),
            _ => Err(mismatch(BinaryOp::Add, &a, &b)),
        },
    }
}

fn arithmetic(op: BinaryOp, left: &Value, right: &Value) -> Result<Value, ExprError> {
    if let (Value::Int(a), Value::Int(b)) = (left, right) {
        let result = match op {
            BinaryOp::Sub => a.checked_sub(*b),
            BinaryOp::Mul => a.checked_mul(*b),
            BinaryOp::Div | BinaryOp::Rem if *b == 0 => return Err(ExprError::DivisionByZero),
            BinaryOp::Div => a.checked_div(*b),
            _ => a.checked_rem(*b),
        };
        return result.map(Value::Int).ok_or(ExprError::Overflow);
    }

    let (Some(x), Some(y)) = (as_float(left), as_float(right)) else {
        return Err(mismatch(op, left, right));
    };
    Ok(Value::Float(match op {
        BinaryOp::Sub => x - y,
        BinaryOp::Mul => x * y,
        BinaryOp::Div => x / y,
        _ => x % y,
    }))
}

fn values_equal(left: &Value, right: &Value) -> bool {
    match (left, right) {
        (Value::Int(_), Value::Float(_)) | (Value::Float(_), Value::Int(_)) => {
            compare(left, right) == Some(Ordering::Equal)
        }
        _ => left == right,
    }
}

fn compare(left: &Value, right: &Value) -> Option<Ordering> {
    match (left, right) {
        (Value::Int(a), Value::Int(b)) => Some(a.cmp(b)),
        (Value::String(a), Value::String(b)) => Some(a.cmp(b)),
        _ => as_float(left)?.partial_cmp(&as_float(right)?),
    }
}
