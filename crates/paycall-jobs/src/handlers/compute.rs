//! The `compute` endpoint: small arithmetic operations.
//!
//! Args: `operation` (required) and either `value` (`square`, `double`,
//! `sqrt`, `negate`) or `values` (`sum`, `product`). Integer inputs produce
//! integer outputs; overflow is an error.

use crate::{required_str, JobError, JobHandler};
use async_trait::async_trait;
use serde_json::{json, Number, Value};

pub struct Compute;

fn overflow(operation: &str) -> JobError {
	JobError::Execution(format!("{} overflowed", operation))
}

fn number(value: f64) -> Result<Value, JobError> {
	Number::from_f64(value)
		.map(Value::Number)
		.ok_or_else(|| JobError::Execution("result is not a finite number".into()))
}

fn single(args: &Value) -> Result<&Number, JobError> {
	match args.get("value") {
		Some(Value::Number(n)) => Ok(n),
		_ => Err(JobError::InvalidArguments(
			"missing required numeric field 'value'".into(),
		)),
	}
}

fn many(args: &Value) -> Result<Vec<&Number>, JobError> {
	let invalid = || JobError::InvalidArguments("'values' must be an array of numbers".into());
	args.get("values")
		.and_then(Value::as_array)
		.ok_or_else(invalid)?
		.iter()
		.map(|v| v.as_number().ok_or_else(invalid))
		.collect()
}

fn unary(operation: &str, n: &Number) -> Result<Value, JobError> {
	if let Some(i) = n.as_i64() {
		let exact = match operation {
			"square" => Some(i.checked_mul(i)),
			"double" => Some(i.checked_mul(2)),
			"negate" => Some(i.checked_neg()),
			_ => None,
		};
		if let Some(out) = exact {
			return out.map(|v| json!(v)).ok_or_else(|| overflow(operation));
		}
	}

	let x = n.as_f64().unwrap_or(f64::NAN);
	match operation {
		"square" => number(x * x),
		"double" => number(x * 2.0),
		"negate" => number(-x),
		"sqrt" if x < 0.0 => Err(JobError::InvalidArguments(
			"cannot take the square root of a negative number".into(),
		)),
		_ => number(x.sqrt()),
	}
}

fn fold(operation: &str, values: &[&Number]) -> Result<Value, JobError> {
	let (int_start, int_op): (i64, fn(i64, i64) -> Option<i64>) = match operation {
		"sum" => (0, i64::checked_add),
		_ => (1, i64::checked_mul),
	};

	let ints: Option<Vec<i64>> = values.iter().map(|n| n.as_i64()).collect();
	if let Some(ints) = ints {
		return ints
			.into_iter()
			.try_fold(int_start, int_op)
			.map(|v| json!(v))
			.ok_or_else(|| overflow(operation));
	}

	let floats = values.iter().map(|n| n.as_f64().unwrap_or(f64::NAN));
	match operation {
		"sum" => number(floats.sum()),
		_ => number(floats.product()),
	}
}

#[async_trait]
impl JobHandler for Compute {
	async fn execute(&self, args: &Value) -> Result<Value, JobError> {
		let operation = required_str(args, "operation")?;
		tracing::debug!(operation = %operation, "Computing");
		let (input, output) = match operation {
			"square" | "double" | "sqrt" | "negate" => {
				let n = single(args)?;
				(Value::Number(n.clone()), unary(operation, n)?)
			},
			"sum" | "product" => {
				let values = many(args)?;
				let input = Value::Array(values.iter().map(|n| Value::Number((*n).clone())).collect());
				(input, fold(operation, &values)?)
			},
			other => {
				return Err(JobError::InvalidArguments(format!(
					"unsupported operation '{}'",
					other
				)))
			},
		};

		Ok(json!({ "operation": operation, "input": input, "output": output }))
	}
}
