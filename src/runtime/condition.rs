/// Condition evaluation for gate steps
///
/// Predicate forms:
/// - `true` / `false`: literal
/// - `"ctx.trigger.payload.amount > 100"`: Lua expression, sandboxed
/// - `{ "field": "$.trigger.payload.status", "operator": "eq", "value": "paid" }`:
///   JSONPath comparison
///
/// Anything that cannot be evaluated is treated as `false` (fail-closed) and
/// reported as a warning, never as a fatal run error.

use crate::error::{EngineError, EngineResult};
use mlua::{HookTriggers, Lua, LuaSerdeExt, VmState};
use serde_json::Value;
use std::cmp::Ordering;
use std::sync::atomic::{AtomicU64, Ordering as AtomicOrdering};
use std::sync::Arc;

/// Memory ceiling for one predicate's Lua state
pub const LUA_MEMORY_LIMIT: usize = 8 * 1024 * 1024;

/// VM instructions one predicate may execute before it is aborted
pub const LUA_INSTRUCTION_LIMIT: u64 = 1_000_000;

/// The instruction hook runs once per this many instructions
const INSTRUCTION_HOOK_INTERVAL: u32 = 1_000;

/// Globals removed from the Lua state before a predicate runs
const BLOCKED_GLOBALS: [&str; 8] = [
    "os", "io", "debug", "package", "require", "load", "loadfile", "dofile",
];

#[derive(Debug, Clone)]
pub struct ConditionEvaluator {
    memory_limit: usize,
    instruction_limit: u64,
}

impl Default for ConditionEvaluator {
    fn default() -> Self {
        Self {
            memory_limit: LUA_MEMORY_LIMIT,
            instruction_limit: LUA_INSTRUCTION_LIMIT,
        }
    }
}

impl ConditionEvaluator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Evaluate and swallow problems: anything that is not a clean `true` is `false`.
    pub fn evaluate(&self, predicate: &Value, context: &Value) -> bool {
        match self.try_evaluate(predicate, context) {
            Ok(result) => result,
            Err(e) => {
                tracing::warn!("⚠️ Condition treated as false: {}", e);
                false
            }
        }
    }

    /// Evaluate, returning `ConditionEvaluation` for malformed predicates
    pub fn try_evaluate(&self, predicate: &Value, context: &Value) -> EngineResult<bool> {
        match predicate {
            Value::Bool(literal) => Ok(*literal),
            Value::String(expression) => self.evaluate_lua(expression, context),
            Value::Object(_) => evaluate_comparison(predicate, context),
            other => Err(EngineError::ConditionEvaluation(format!(
                "unsupported predicate: {other}"
            ))),
        }
    }

    fn evaluate_lua(&self, expression: &str, context: &Value) -> EngineResult<bool> {
        let lua = Lua::new();
        lua.set_memory_limit(self.memory_limit).map_err(lua_error)?;

        let limit = self.instruction_limit;
        let executed = Arc::new(AtomicU64::new(0));
        lua.set_hook(
            HookTriggers::new().every_nth_instruction(INSTRUCTION_HOOK_INTERVAL),
            move |_lua, _debug| {
                let total = executed
                    .fetch_add(u64::from(INSTRUCTION_HOOK_INTERVAL), AtomicOrdering::Relaxed)
                    + u64::from(INSTRUCTION_HOOK_INTERVAL);
                if total > limit {
                    return Err(mlua::Error::runtime(format!(
                        "instruction limit of {limit} exceeded"
                    )));
                }
                Ok(VmState::Continue)
            },
        )
        .map_err(lua_error)?;

        let globals = lua.globals();
        for name in BLOCKED_GLOBALS {
            globals.set(name, mlua::Nil).map_err(lua_error)?;
        }
        globals
            .set("ctx", lua.to_value(context).map_err(lua_error)?)
            .map_err(lua_error)?;

        tracing::debug!("🌙 Evaluating Lua condition: {}", expression);
        let result = lua
            .load(format!("return ({expression})"))
            .set_name("condition")
            .eval::<mlua::Value>()
            .map_err(lua_error)?;

        match result {
            mlua::Value::Boolean(value) => Ok(value),
            other => Err(EngineError::ConditionEvaluation(format!(
                "expression '{}' returned {}, expected a boolean",
                expression,
                other.type_name()
            ))),
        }
    }
}

fn lua_error(e: mlua::Error) -> EngineError {
    EngineError::ConditionEvaluation(format!("lua: {e}"))
}

fn evaluate_comparison(predicate: &Value, context: &Value) -> EngineResult<bool> {
    let field = predicate
        .get("field")
        .and_then(Value::as_str)
        .ok_or_else(|| EngineError::ConditionEvaluation("comparison has no 'field'".into()))?;
    let operator = predicate
        .get("operator")
        .and_then(Value::as_str)
        .ok_or_else(|| EngineError::ConditionEvaluation("comparison has no 'operator'".into()))?;
    let expected = predicate.get("value").unwrap_or(&Value::Null);

    let matches = jsonpath_lib::select(context, field).map_err(|e| {
        EngineError::ConditionEvaluation(format!("invalid JSONPath '{field}': {e:?}"))
    })?;
    let actual = matches.first().copied();

    let result = match operator {
        "exists" => actual.is_some(),
        "not_exists" => actual.is_none(),
        "eq" => actual == Some(expected),
        "ne" => actual != Some(expected),
        "gt" => compare(actual, expected) == Some(Ordering::Greater),
        "gte" => matches!(compare(actual, expected), Some(Ordering::Greater | Ordering::Equal)),
        "lt" => compare(actual, expected) == Some(Ordering::Less),
        "lte" => matches!(compare(actual, expected), Some(Ordering::Less | Ordering::Equal)),
        "contains" => actual.is_some_and(|value| contains(value, expected)),
        unknown => {
            return Err(EngineError::ConditionEvaluation(format!(
                "unknown operator '{unknown}'"
            )))
        }
    };

    tracing::debug!("🔎 {} {} {} -> {}", field, operator, expected, result);
    Ok(result)
}

/// Numbers compare numerically, strings lexically; mixed types are unordered.
fn compare(actual: Option<&Value>, expected: &Value) -> Option<Ordering> {
    match (actual?, expected) {
        (Value::Number(a), Value::Number(b)) => a.as_f64()?.partial_cmp(&b.as_f64()?),
        (Value::String(a), Value::String(b)) => Some(a.cmp(b)),
        _ => None,
    }
}

fn contains(haystack: &Value, needle: &Value) -> bool {
    match (haystack, needle) {
        (Value::String(text), Value::String(part)) => text.contains(part.as_str()),
        (Value::Array(items), _) => items.contains(needle),
        (Value::Object(map), Value::String(key)) => map.contains_key(key),
        _ => false,
    }
}
