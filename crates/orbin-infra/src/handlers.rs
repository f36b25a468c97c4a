//! Built-in step handlers registered by the local worker.
//!
//! | handler     | step kind   | behavior                                             |
//! |-------------|-------------|------------------------------------------------------|
//! | `echo`      | any         | returns the step input                               |
//! | `set`       | any         | returns `params.value`                               |
//! | `fail`      | any         | fails with `params.message`, retryable per params    |
//! | `compare`   | condition   | `{"result": input[path] == params.equals}`           |
//! | `countdown` | loop        | decrements `remaining`, continues while above zero   |

use orbin_core::worker::{HandlerError, HandlerRegistry, StepHandler};
use orbin_types::event::StepWork;
use serde_json::{Value, json};

/// Register every built-in handler.
pub fn register_builtin_handlers(registry: &HandlerRegistry) {
    registry.register(EchoHandler);
    registry.register(SetHandler);
    registry.register(FailHandler);
    registry.register(CompareHandler);
    registry.register(CountdownHandler);
}

pub struct EchoHandler;

impl StepHandler for EchoHandler {
    fn name(&self) -> &str {
        "echo"
    }

    async fn execute(&self, work: &StepWork) -> Result<Value, HandlerError> {
        Ok(work.input.clone())
    }
}

pub struct SetHandler;

impl StepHandler for SetHandler {
    fn name(&self) -> &str {
        "set"
    }

    async fn execute(&self, work: &StepWork) -> Result<Value, HandlerError> {
        Ok(work.params.get("value").cloned().unwrap_or(Value::Null))
    }
}

/// Fails every attempt. `params.retryable` defaults to `false`; with
/// `params.succeed_on_attempt` the handler succeeds from that attempt on.
pub struct FailHandler;

impl StepHandler for FailHandler {
    fn name(&self) -> &str {
        "fail"
    }

    async fn execute(&self, work: &StepWork) -> Result<Value, HandlerError> {
        let succeed_on = work
            .params
            .get("succeed_on_attempt")
            .and_then(Value::as_u64);
        if succeed_on.is_some_and(|n| u64::from(work.attempt) >= n) {
            return Ok(json!({ "attempt": work.attempt }));
        }

        let message = work
            .params
            .get("message")
            .and_then(Value::as_str)
            .unwrap_or("step failed")
            .to_string();
        let retryable = work
            .params
            .get("retryable")
            .and_then(Value::as_bool)
            .unwrap_or(false);

        Err(if retryable {
            HandlerError::Retryable(message)
        } else {
            HandlerError::Fatal(message)
        })
    }
}

/// Compares the input value at `params.path` (dot-separated) with
/// `params.equals`. Without `equals`, tests the value for truthiness.
pub struct CompareHandler;

impl StepHandler for CompareHandler {
    fn name(&self) -> &str {
        "compare"
    }

    async fn execute(&self, work: &StepWork) -> Result<Value, HandlerError> {
        let path = work.params.get("path").and_then(Value::as_str).unwrap_or("");
        let actual = lookup(&work.input, path);

        let result = match work.params.get("equals") {
            Some(expected) => actual == Some(expected),
            None => actual.is_some_and(truthy),
        };
        Ok(json!({ "result": result }))
    }
}

/// Loop body that counts `remaining` down to zero. The first iteration
/// starts from `input.remaining`, falling back to `params.from` (default 3).
pub struct CountdownHandler;

impl StepHandler for CountdownHandler {
    fn name(&self) -> &str {
        "countdown"
    }

    async fn execute(&self, work: &StepWork) -> Result<Value, HandlerError> {
        let remaining = work
            .input
            .get("remaining")
            .and_then(Value::as_u64)
            .or_else(|| work.params.get("from").and_then(Value::as_u64))
            .unwrap_or(3);
        let next = remaining.saturating_sub(1);
        Ok(json!({ "remaining": next, "continue": next > 0 }))
    }
}

fn lookup<'a>(value: &'a Value, path: &str) -> Option<&'a Value> {
    if path.is_empty() {
        return Some(value);
    }
    path.split('.').try_fold(value, |current, key| match current {
        Value::Object(map) => map.get(key),
        Value::Array(items) => key.parse::<usize>().ok().and_then(|i| items.get(i)),
        _ => None,
    })
}

fn truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().is_some_and(|f| f != 0.0),
        Value::String(s) => !s.is_empty(),
        Value::Array(items) => !items.is_empty(),
        Value::Object(map) => !map.is_empty(),
    }
}
