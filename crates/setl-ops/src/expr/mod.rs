//! Record expression language used by the transformer and filter.
//!
//! A small embedded language over JSON records: field references, literals,
//! arithmetic (`+ - * / %`), comparisons, logical operators (`and or not`
//! and their symbol forms), membership (`in`, `not in`), a presence check
//! (`has(field)`), and a closed function set (`int float string bool len abs
//! ceil floor round min max concat`).
//!
//! Expressions are compiled once at pipeline startup and evaluated per
//! record; field references are checked against the declared schema before
//! any consumption begins.

mod eval;
mod lexer;
mod parser;

use serde_json::{Map, Value};

#[derive(Debug, thiserror::Error)]
pub enum ExprError {
    #[error("parse error at offset {pos}: {message}")]
    Parse { pos: usize, message: String },

    #[error("unknown field {0:?}")]
    UnknownField(String),

    #[error("{operation} is not defined for {value}")]
    TypeMismatch { operation: String, value: String },

    #[error("division by zero")]
    DivisionByZero,

    #[error("numeric overflow in {0}")]
    Overflow(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnaryOp {
    Not,
    Neg,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinaryOp {
    Add,
    Sub,
    Mul,
    Div,
    Rem,
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
    And,
    Or,
}

impl BinaryOp {
    pub(crate) fn name(&self) -> &'static str {
        match self {
            BinaryOp::Add => "+",
            BinaryOp::Sub => "-",
            BinaryOp::Mul => "*",
            BinaryOp::Div => "/",
            BinaryOp::Rem => "%",
            BinaryOp::Eq => "==",
            BinaryOp::Ne => "!=",
            BinaryOp::Lt => "<",
            BinaryOp::Le => "<=",
            BinaryOp::Gt => ">",
            BinaryOp::Ge => ">=",
            BinaryOp::And => "and",
            BinaryOp::Or => "or",
        }
    }
}

/// Closed function set.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Func {
    Int,
    Float,
    String,
    Bool,
    Len,
    Abs,
    Ceil,
    Floor,
    Round,
    Min,
    Max,
    Concat,
}

impl Func {
    pub(crate) fn by_name(name: &str) -> Option<Func> {
        Some(match name {
            "int" => Func::Int,
            "float" => Func::Float,
            "string" => Func::String,
            "bool" => Func::Bool,
            "len" => Func::Len,
            "abs" => Func::Abs,
            "ceil" => Func::Ceil,
            "floor" => Func::Floor,
            "round" => Func::Round,
            "min" => Func::Min,
            "max" => Func::Max,
            "concat" => Func::Concat,
            _ => return None,
        })
    }

    pub(crate) fn name(&self) -> &'static str {
        match self {
            Func::Int => "int",
            Func::Float => "float",
            Func::String => "string",
            Func::Bool => "bool",
            Func::Len => "len",
            Func::Abs => "abs",
            Func::Ceil => "ceil",
            Func::Floor => "floor",
            Func::Round => "round",
            Func::Min => "min",
            Func::Max => "max",
            Func::Concat => "concat",
        }
    }

    /// `(min, max)` argument counts; `None` max means variadic.
    pub(crate) fn arity(&self) -> (usize, Option<usize>) {
        match self {
            Func::Min | Func::Max => (1, None),
            Func::Concat => (1, None),
            _ => (1, Some(1)),
        }
    }

    pub(crate) fn arity_text(&self) -> &'static str {
        match self.arity() {
            (1, Some(1)) => "exactly one",
            _ => "one or more",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
    Int(i64),
    Float(f64),
    Str(String),
    Bool(bool),
    Null,
    Field(String),
    Has(String),
    Unary { op: UnaryOp, expr: Box<Expr> },
    Binary { op: BinaryOp, left: Box<Expr>, right: Box<Expr> },
    InList { needle: Box<Expr>, list: Vec<Expr>, negated: bool },
    InValue { needle: Box<Expr>, haystack: Box<Expr>, negated: bool },
    Call { func: Func, args: Vec<Expr> },
}

/// A parsed, reusable expression.
#[derive(Debug, Clone, PartialEq)]
pub struct Program {
    root: Expr,
    text: String,
}

impl Program {
    pub fn compile(text: &str) -> Result<Program, ExprError> {
        let tokens = lexer::tokenize(text)?;
        if tokens.is_empty() {
            return Err(ExprError::Parse { pos: 0, message: "empty expression".to_string() });
        }
        let root = parser::parse(&tokens, text.len())?;
        Ok(Program { root, text: text.to_string() })
    }

    pub fn text(&self) -> &str {
        &self.text
    }

    pub fn eval(&self, record: &Map<String, Value>) -> Result<Value, ExprError> {
        eval::eval(&self.root, record)
    }

    /// Evaluate as a predicate; a non-boolean result is an error.
    pub fn eval_predicate(&self, record: &Map<String, Value>) -> Result<bool, ExprError> {
        match self.eval(record)? {
            Value::Bool(b) => Ok(b),
            other => Err(ExprError::TypeMismatch {
                operation: "predicate".to_string(),
                value: other.to_string(),
            }),
        }
    }

    /// Every record field the expression reads (presence checks included),
    /// for startup validation against the declared schema.
    pub fn field_refs(&self) -> Vec<&str> {
        let mut refs = Vec::new();
        collect_fields(&self.root, &mut refs);
        refs.sort_unstable();
        refs.dedup();
        refs
    }
}

fn collect_fields<'a>(expr: &'a Expr, refs: &mut Vec<&'a str>) {
    match expr {
        Expr::Field(name) | Expr::Has(name) => refs.push(name),
        Expr::Unary { expr, .. } => collect_fields(expr, refs),
        Expr::Binary { left, right, .. } => {
            collect_fields(left, refs);
            collect_fields(right, refs);
        }
        Expr::InList { needle, list, .. } => {
            collect_fields(needle, refs);
            for item in list {
                collect_fields(item, refs);
            }
        }
        Expr::InValue { needle, haystack, .. } => {
            collect_fields(needle, refs);
            collect_fields(haystack, refs);
        }
        Expr::Call { args, .. } => {
            for arg in args {
                collect_fields(arg, refs);
            }
        }
        _ => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn record(value: Value) -> Map<String, Value> {
        value.as_object().unwrap().clone()
    }

    fn eval_text(text: &str, rec: Value) -> Value {
        Program::compile(text).unwrap().eval(&record(rec)).unwrap()
    }

    #[test]
    fn arithmetic_keeps_integers_integral() {
        assert_eq!(eval_text("a + b * 2", json!({"a": 1, "b": 3})), json!(7));
        assert_eq!(eval_text("7 / 2", json!({})), json!(3));
        assert_eq!(eval_text("7 % 2", json!({})), json!(1));
        assert_eq!(eval_text("7.0 / 2", json!({})), json!(3.5));
    }

    #[test]
    fn string_concatenation_via_plus_and_concat() {
        assert_eq!(
            eval_text("first + ' ' + last", json!({"first": "Ada", "last": "Lovelace"})),
            json!("Ada Lovelace")
        );
        assert_eq!(
            eval_text("concat(first, '-', 42)", json!({"first": "x"})),
            json!("x-42")
        );
    }

    #[test]
    fn comparisons_and_logic() {
        let rec = json!({"age": 41, "name": "Grace", "active": true});
        assert_eq!(eval_text("age >= 40 and active", rec.clone()), json!(true));
        assert_eq!(eval_text("name < 'Ada' or age == 41", rec.clone()), json!(true));
        assert_eq!(eval_text("not (age < 40)", rec.clone()), json!(true));
        assert_eq!(eval_text("!(age < 40) && active", rec), json!(true));
    }

    #[test]
    fn numeric_equality_crosses_representations() {
        assert_eq!(eval_text("a == 1.0", json!({"a": 1})), json!(true));
    }

    #[test]
    fn membership_list_and_array_value() {
        let rec = json!({"status": "new", "tags": ["a", "b"]});
        assert_eq!(eval_text("status in ('new', 'open')", rec.clone()), json!(true));
        assert_eq!(eval_text("status not in ('closed', 'done')", rec.clone()), json!(true));
        assert_eq!(eval_text("'b' in tags", rec.clone()), json!(true));
        assert_eq!(eval_text("'c' not in tags", rec), json!(true));
    }

    #[test]
    fn presence_check_never_touches_missing_fields() {
        let rec = json!({"a": 1});
        assert_eq!(eval_text("has(a)", rec.clone()), json!(true));
        assert_eq!(eval_text("has(b)", rec.clone()), json!(false));
        // A direct reference to a missing field is an error.
        let program = Program::compile("b == 1").unwrap();
        assert!(matches!(
            program.eval(&record(rec)),
            Err(ExprError::UnknownField(name)) if name == "b"
        ));
    }

    #[test]
    fn function_surface() {
        assert_eq!(eval_text("int('42')", json!({})), json!(42));
        assert_eq!(eval_text("int(3.9)", json!({})), json!(3));
        assert_eq!(eval_text("float('2.5')", json!({})), json!(2.5));
        assert_eq!(eval_text("string(12)", json!({})), json!("12"));
        assert_eq!(eval_text("bool('true')", json!({})), json!(true));
        assert_eq!(eval_text("len('héllo')", json!({})), json!(5));
        assert_eq!(eval_text("len(tags)", json!({"tags": [1, 2]})), json!(2));
        assert_eq!(eval_text("abs(-4)", json!({})), json!(4));
        assert_eq!(eval_text("ceil(1.1)", json!({})), json!(2));
        assert_eq!(eval_text("floor(1.9)", json!({})), json!(1));
        assert_eq!(eval_text("round(2.5)", json!({})), json!(3));
        assert_eq!(eval_text("min(3, 1, 2)", json!({})), json!(1));
        assert_eq!(eval_text("max(a, 10)", json!({"a": 4})), json!(10));
    }

    #[test]
    fn division_by_zero_is_an_error() {
        let program = Program::compile("1 / n").unwrap();
        assert!(matches!(
            program.eval(&record(json!({"n": 0}))),
            Err(ExprError::DivisionByZero)
        ));
    }

    #[test]
    fn predicate_rejects_non_boolean_result() {
        let program = Program::compile("a + 1").unwrap();
        assert!(program.eval_predicate(&record(json!({"a": 1}))).is_err());
    }

    #[test]
    fn field_refs_are_collected_and_deduplicated() {
        let program = Program::compile("a + b > 2 and has(c) or a in (1, d)").unwrap();
        assert_eq!(program.field_refs(), vec!["a", "b", "c", "d"]);
    }

    #[test]
    fn parse_errors_carry_positions() {
        let err = Program::compile("a >").unwrap_err();
        assert!(matches!(err, ExprError::Parse { .. }));
        let err = Program::compile("unknownfn(1)").unwrap_err();
        match err {
            ExprError::Parse { message, .. } => assert!(message.contains("unknown function")),
            other => panic!("unexpected {other}"),
        }
    }

    #[test]
    fn operator_precedence_binds_arithmetic_tighter_than_comparison() {
        assert_eq!(eval_text("1 + 2 * 3 == 7", json!({})), json!(true));
        assert_eq!(eval_text("(1 + 2) * 3 == 9", json!({})), json!(true));
        assert_eq!(eval_text("-2 * 3", json!({})), json!(-6));
    }
}
