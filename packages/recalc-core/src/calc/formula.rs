//! Formula evaluation on a Rhai engine.
//!
//! `{fieldId}` references are rewritten to scope variables holding the
//! referenced cell values. Blank values are bound as `()`; arithmetic with
//! a blank operand yields the other operand.

use std::collections::BTreeMap;
use std::sync::OnceLock;

use regex::Regex;
use rhai::{Array, Dynamic, Engine, EvalAltResult, ImmutableString, Position, Scope, FLOAT, INT};
use serde_json::Value;

use crate::error::{RecalcError, Result};
use crate::table::Field;

fn reference_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"\{([A-Za-z0-9]+)\}").unwrap())
}

fn variable_name(field_id: &str) -> String {
    format!("v_{}", field_id)
}

/// Rewrites `{fieldId}` references into Rhai variable names.
pub fn preprocess(expression: &str) -> String {
    reference_re()
        .replace_all(expression, |caps: &regex::Captures| variable_name(&caps[1]))
        .into_owned()
}

fn truthy(value: &Dynamic) -> bool {
    if value.is_unit() {
        false
    } else if let Ok(b) = value.as_bool() {
        b
    } else if let Ok(i) = value.as_int() {
        i != 0
    } else if let Ok(f) = value.as_float() {
        f != 0.0
    } else if value.is_string() {
        !value.to_string().is_empty()
    } else if value.is_array() {
        value
            .clone()
            .into_array()
            .map(|items| !items.is_empty())
            .unwrap_or(false)
    } else {
        true
    }
}

fn text(value: &Dynamic) -> String {
    if value.is_unit() {
        String::new()
    } else {
        value.to_string()
    }
}

fn sum(items: &Array) -> Dynamic {
    let mut int_total: INT = 0;
    let mut float_total: FLOAT = 0.0;
    let mut any_float = false;
    for item in items {
        if let Ok(i) = item.as_int() {
            int_total = int_total.saturating_add(i);
        } else if let Ok(f) = item.as_float() {
            float_total += f;
            any_float = true;
        }
    }
    if any_float {
        Dynamic::from_float(float_total + int_total as FLOAT)
    } else {
        Dynamic::from_int(int_total)
    }
}

fn round(value: FLOAT, digits: INT) -> FLOAT {
    let factor = 10f64.powi(digits.clamp(-15, 15) as i32);
    (value * factor).round() / factor
}

/// Registers the formula helper functions on `engine`.
fn register_builtins(engine: &mut Engine) {
    engine.register_fn("BLANK", || Dynamic::UNIT);
    engine.register_fn("SUM", |items: Array| sum(&items));
    engine.register_fn("AVERAGE", |items: Array| -> Dynamic {
        let numbers: Vec<FLOAT> = items
            .iter()
            .filter_map(|item| item.as_int().map(|i| i as FLOAT).or_else(|_| item.as_float()).ok())
            .collect();
        if numbers.is_empty() {
            Dynamic::UNIT
        } else {
            Dynamic::from_float(numbers.iter().sum::<FLOAT>() / numbers.len() as FLOAT)
        }
    });
    engine.register_fn("IF", |cond: Dynamic, then: Dynamic, otherwise: Dynamic| {
        if truthy(&cond) {
            then
        } else {
            otherwise
        }
    });
    engine.register_fn("CONCATENATE", |a: Dynamic, b: Dynamic| format!("{}{}", text(&a), text(&b)));
    engine.register_fn("CONCATENATE", |a: Dynamic, b: Dynamic, c: Dynamic| {
        format!("{}{}{}", text(&a), text(&b), text(&c))
    });
    engine.register_fn("ROUND", |x: FLOAT| round(x, 0));
    engine.register_fn("ROUND", |x: FLOAT, digits: INT| round(x, digits));
    engine.register_fn("ROUND", |x: INT| x);
    engine.register_fn("ROUND", |x: INT, _digits: INT| x);
    engine.register_fn("LEN", |s: ImmutableString| s.chars().count() as INT);
    engine.register_fn("LEN", |items: Array| items.len() as INT);
    engine.register_fn("LEN", |_: ()| 0 as INT);
    engine.register_fn("UPPER", |s: ImmutableString| s.to_uppercase());
    engine.register_fn("LOWER", |s: ImmutableString| s.to_lowercase());

    // Blank operands
    for op in ["+", "-"] {
        engine.register_fn(op, |a: INT, _: ()| a);
        engine.register_fn(op, |a: FLOAT, _: ()| a);
    }
    engine.register_fn("+", |_: (), b: INT| b);
    engine.register_fn("+", |_: (), b: FLOAT| b);
    engine.register_fn("-", |_: (), b: INT| -> std::result::Result<INT, Box<EvalAltResult>> {
        b.checked_neg().ok_or_else(|| {
            Box::new(EvalAltResult::ErrorArithmetic(
                format!("Negation overflow: -{}", b),
                Position::NONE,
            ))
        })
    });
    engine.register_fn("-", |_: (), b: FLOAT| -b);
    engine.register_fn("+", |a: ImmutableString, _: ()| a);
    engine.register_fn("+", |_: (), b: ImmutableString| b);
    for op in ["+", "-", "*", "/"] {
        engine.register_fn(op, |_: (), _: ()| Dynamic::UNIT);
    }
    for op in ["*", "/"] {
        engine.register_fn(op, |_: INT, _: ()| Dynamic::UNIT);
        engine.register_fn(op, |_: FLOAT, _: ()| Dynamic::UNIT);
        engine.register_fn(op, |_: (), _: INT| Dynamic::UNIT);
        engine.register_fn(op, |_: (), _: FLOAT| Dynamic::UNIT);
    }
}

/// Evaluates formula expressions.
pub struct FormulaEvaluator {
    engine: Engine,
}

impl std::fmt::Debug for FormulaEvaluator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FormulaEvaluator").finish_non_exhaustive()
    }
}

impl Default for FormulaEvaluator {
    fn default() -> Self {
        Self::new()
    }
}

impl FormulaEvaluator {
    pub fn new() -> Self {
        let mut engine = Engine::new();
        engine.set_max_operations(1_000_000);
        engine.set_max_expr_depths(64, 32);
        register_builtins(&mut engine);
        Self { engine }
    }

    /// Evaluates `expression` against the cell values of one record.
    ///
    /// # Arguments
    /// * `field` - Formula field, used for error reporting
    /// * `expression` - Expression with `{fieldId}` references
    /// * `values` - Cell values keyed by field id
    ///
    /// # Returns
    /// `Result<Value>`; non-finite numbers come back as null.
    pub fn evaluate(
        &self,
        field: &Field,
        expression: &str,
        values: &BTreeMap<String, Value>,
    ) -> Result<Value> {
        let formula_error = |message: String| RecalcError::Formula {
            field: field.id.clone(),
            message,
        };

        static NULL: Value = Value::Null;
        let mut scope = Scope::new();
        for reference in crate::graph::formula_references(expression) {
            let value = values.get(&reference).unwrap_or(&NULL);
            let bound = rhai::serde::to_dynamic(value).map_err(|e| formula_error(e.to_string()))?;
            scope.push_dynamic(variable_name(&reference), bound);
        }

        let script = preprocess(expression);
        let result: Dynamic = self
            .engine
            .eval_with_scope(&mut scope, &script)
            .map_err(|e| formula_error(e.to_string()))?;
        rhai::serde::from_dynamic::<Value>(&result).map_err(|e| formula_error(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::table::FieldKind;
    use crate::types::CellValueType;
    use serde_json::json;

    fn formula_field(expression: &str) -> Field {
        Field {
            id: "fldF".to_string(),
            table_id: "tblA".to_string(),
            name: "F".to_string(),
            db_field_name: "f_fldF".to_string(),
            cell_value_type: CellValueType::Number,
            is_multiple_cell_value: false,
            is_primary: false,
            kind: FieldKind::Formula {
                expression: expression.to_string(),
            },
        }
    }

    fn eval(expression: &str, values: &[(&str, Value)]) -> Result<Value> {
        let values: BTreeMap<String, Value> = values
            .iter()
            .map(|(k, v)| (k.to_string(), v.clone()))
            .collect();
        FormulaEvaluator::new().evaluate(&formula_field(expression), expression, &values)
    }

    #[test]
    fn test_preprocess_rewrites_references() {
        assert_eq!(preprocess("{fldA} + {fldB}"), "v_fldA + v_fldB");
    }

    #[test]
    fn test_arithmetic_over_references() {
        let result = eval("{fldA} * 2 + {fldB}", &[("fldA", json!(3)), ("fldB", json!(1))]).unwrap();
        assert_eq!(result, json!(7));
        let result = eval("{fldA} / 2.0", &[("fldA", json!(3))]).unwrap();
        assert_eq!(result, json!(1.5));
    }

    #[test]
    fn test_blank_operand() {
        let result = eval("{fldA} + 1", &[("fldA", Value::Null)]).unwrap();
        assert_eq!(result, json!(1));
        let result = eval("{fldA} * 2", &[]).unwrap();
        assert_eq!(result, Value::Null);
    }

    #[test]
    fn test_blank_minus_overflow_is_formula_error() {
        let result = eval("{fldA} - {fldB}", &[("fldA", Value::Null), ("fldB", json!(5))]).unwrap();
        assert_eq!(result, json!(-5));
        let err = eval("{fldA} - {fldB}", &[("fldA", Value::Null), ("fldB", json!(i64::MIN))]).unwrap_err();
        assert!(matches!(err, RecalcError::Formula { .. }));
    }

    #[test]
    fn test_helpers() {
        assert_eq!(eval("SUM([1, 2, 3.5])", &[]).unwrap(), json!(6.5));
        assert_eq!(eval("IF({fldA} > 1, \"big\", \"small\")", &[("fldA", json!(2))]).unwrap(), json!("big"));
        assert_eq!(eval("UPPER(CONCATENATE(\"a\", {fldA}))", &[("fldA", json!("b"))]).unwrap(), json!("AB"));
        assert_eq!(eval("ROUND(2.346, 2)", &[]).unwrap(), json!(2.35));
        assert_eq!(eval("LEN({fldA})", &[("fldA", json!("four"))]).unwrap(), json!(4));
        assert_eq!(eval("BLANK()", &[]).unwrap(), Value::Null);
    }

    #[test]
    fn test_list_values_bind_as_arrays() {
        let result = eval("SUM({fldA})", &[("fldA", json!([1, 2, 3]))]).unwrap();
        assert_eq!(result, json!(6));
    }

    #[test]
    fn test_syntax_error_is_formula_error() {
        let err = eval("{fldA} +* 2", &[("fldA", json!(1))]).unwrap_err();
        assert!(matches!(err, RecalcError::Formula { .. }));
    }
}
