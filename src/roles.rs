//! Built-in worker roles.

use std::collections::HashSet;
use std::time::Duration;

use serde_json::{Value, json};

use crate::error::Result;
use crate::worker::{Worker, WorkerContext, WorkerRegistry, map_round};

/// Registry with every built-in role.
pub fn builtin_registry() -> WorkerRegistry {
    WorkerRegistry::new()
        .with_role("echo", "Return every item unchanged (setting: delay_ms)", |_| {
            Box::new(Echo::default())
        })
        .with_role("square", "Square numeric items, skip the rest", |_| {
            Box::new(Square)
        })
        .with_role(
            "wordmatch",
            "Keep string items found in the tools word list",
            |_| Box::new(WordMatch::default()),
        )
        .with_role(
            "crash",
            "Echo items, abort the process on the item \"crash\"",
            |_| Box::new(Crash),
        )
}

/// Returns items unchanged, optionally sleeping per item.
#[derive(Debug, Default)]
pub struct Echo {
    delay: Option<Duration>,
}

impl Worker for Echo {
    fn name(&self) -> &str {
        "echo"
    }

    fn process_one_round(&mut self, ctx: &mut WorkerContext) -> Result<bool> {
        if self.delay.is_none() {
            let ms = ctx
                .setting("echo", "delay_ms")
                .and_then(Value::as_u64)
                .unwrap_or(0);
            self.delay = Some(Duration::from_millis(ms));
        }
        let delay = self.delay.unwrap_or_default();
        map_round(ctx, |_, value| {
            if !delay.is_zero() {
                std::thread::sleep(delay);
            }
            Ok(Some(value))
        })
    }
}

/// Squares numbers.
#[derive(Debug, Default)]
pub struct Square;

fn square(value: &Value) -> Option<Value> {
    if let Some(n) = value.as_i64() {
        return n.checked_mul(n).map(Value::from);
    }
    value.as_f64().map(|f| json!(f * f))
}

impl Worker for Square {
    fn name(&self) -> &str {
        "square"
    }

    fn process_one_round(&mut self, ctx: &mut WorkerContext) -> Result<bool> {
        map_round(ctx, |ctx, value| match square(&value) {
            Some(squared) => Ok(Some(squared)),
            None => {
                ctx.print().put(format!("square: skipping {}", value))?;
                Ok(None)
            }
        })
    }
}

/// Keeps strings found in the word list shipped as tools data.
///
/// The list is either the tools value itself or its `words` field.
#[derive(Debug, Default)]
pub struct WordMatch {
    words: Option<HashSet<String>>,
}

fn word_list(tools: &Value) -> HashSet<String> {
    let list = tools.get("words").unwrap_or(tools);
    list.as_array()
        .map(|items| {
            items
                .iter()
                .filter_map(Value::as_str)
                .map(str::to_string)
                .collect()
        })
        .unwrap_or_default()
}

impl Worker for WordMatch {
    fn name(&self) -> &str {
        "wordmatch"
    }

    fn process_one_round(&mut self, ctx: &mut WorkerContext) -> Result<bool> {
        let words = self.words.get_or_insert_with(|| word_list(ctx.tools()));
        map_round(ctx, |_, value| {
            Ok(value
                .as_str()
                .filter(|s| words.contains(*s))
                .map(|_| value.clone()))
        })
    }
}

/// Aborts the whole process when it sees the item `"crash"`.
#[derive(Debug, Default)]
pub struct Crash;

impl Worker for Crash {
    fn name(&self) -> &str {
        "crash"
    }

    fn process_one_round(&mut self, ctx: &mut WorkerContext) -> Result<bool> {
        map_round(ctx, |_, value| {
            if value.as_str() == Some("crash") {
                tracing::error!("Crash item received, aborting");
                std::process::abort();
            }
            Ok(Some(value))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chunk::{ResultChunk, Ticket};
    use crate::protocol::WorkerMessage;
    use crate::worker::testing::{chunk, context};

    fn results(messages: &[WorkerMessage]) -> Vec<ResultChunk> {
        messages
            .iter()
            .filter_map(|m| match m {
                WorkerMessage::Result { result } => Some(result.clone()),
                _ => None,
            })
            .collect()
    }

    #[test]
    fn test_builtin_registry_lists_roles() {
        let registry = builtin_registry();
        let names: Vec<_> = registry.roles().map(|(n, _)| n).collect();
        assert_eq!(names, vec!["crash", "echo", "square", "wordmatch"]);
    }

    #[test]
    fn test_square_skips_non_numbers() {
        let (mut ctx, out) = context(
            &[chunk(4, &[json!(3), json!("x"), json!(1.5)], true)],
            Value::Null,
            Value::Null,
        );
        assert!(!Square.process_one_round(&mut ctx).unwrap());

        let messages = out.messages();
        assert_eq!(
            results(&messages),
            vec![ResultChunk::new(Ticket::new("q", 4), vec![json!(9), json!(2.25)])]
        );
        assert!(messages.contains(&WorkerMessage::print("square: skipping \"x\"")));
    }

    #[test]
    fn test_square_overflow_is_skipped() {
        assert_eq!(square(&json!(i64::MAX)), None);
        assert_eq!(square(&json!(-4)), Some(json!(16)));
    }

    #[test]
    fn test_wordmatch_uses_tools() {
        let (mut ctx, out) = context(
            &[chunk(1, &[json!("apple"), json!("pear"), json!(1)], true)],
            json!({"words": ["apple", "plum"]}),
            Value::Null,
        );
        assert!(!WordMatch::default().process_one_round(&mut ctx).unwrap());
        assert_eq!(results(&out.messages())[0].payload, vec![json!("apple")]);
    }

    #[test]
    fn test_word_list_shapes() {
        assert_eq!(word_list(&json!(["a", "b"])).len(), 2);
        assert_eq!(word_list(&json!({"words": ["a"]})).len(), 1);
        assert!(word_list(&Value::Null).is_empty());
    }

    #[test]
    fn test_echo_keeps_items() {
        let (mut ctx, out) = context(
            &[chunk(1, &[json!({"k": 1}), json!("None")], false)],
            Value::Null,
            json!({"echo": {"delay_ms": 1}}),
        );
        let mut echo = Echo::default();
        assert!(echo.process_one_round(&mut ctx).unwrap());
        assert_eq!(echo.delay, Some(Duration::from_millis(1)));
        assert_eq!(
            results(&out.messages())[0].payload,
            vec![json!({"k": 1}), json!("None")]
        );
    }
}
