//! Services mounted by the bundled server.
use std::{
    sync::Arc,
    time::{Duration, SystemTime, UNIX_EPOCH},
};

use anyhow::{bail, Context};
use futures::stream;
use rpcbridge_core::{
    registry::{Deferred, MethodTable, RpcService, Streamed},
    AnyError, AnyResult,
};
use serde_json::Value;

/// Arithmetic, overloaded on the argument types.
pub struct Calc;

impl Calc {
    fn div(a: i64, b: i64) -> AnyResult<i64> {
        if b == 0 {
            bail!("division by zero");
        }
        Ok(a / b)
    }
}

impl RpcService for Calc {
    fn register(self: Arc<Self>, methods: &mut MethodTable) {
        methods
            .method("add", |a: i64, b: i64| a + b)
            .method("add", |a: f64, b: f64| a + b)
            .method("add", |a: String, b: String| a + &b)
            .method("div", Calc::div)
            .method("sum", |values: Vec<f64>| values.iter().sum::<f64>());
    }
}

/// Time based replies: deferred values and tick streams.
pub struct Clock;

impl Clock {
    fn now() -> AnyResult<u64> {
        let elapsed = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .context("system clock before epoch")?;
        Ok(elapsed.as_millis() as u64)
    }
}

impl RpcService for Clock {
    fn register(self: Arc<Self>, methods: &mut MethodTable) {
        methods
            .method("now", Clock::now)
            .method("delay", |ms: u64, value: Value| {
                Deferred(async move {
                    monoio::time::sleep(Duration::from_millis(ms)).await;
                    Ok::<_, AnyError>(value)
                })
            })
            .method("ticks", |count: u32, interval_ms: u64| {
                Streamed(stream::unfold(0, move |n| async move {
                    if n >= count {
                        return None;
                    }
                    monoio::time::sleep(Duration::from_millis(interval_ms)).await;
                    Some((Ok::<_, AnyError>(n), n + 1))
                }))
            });
    }
}

pub struct Echo;

impl RpcService for Echo {
    fn register(self: Arc<Self>, methods: &mut MethodTable) {
        methods
            .method("echo", |value: Value| value)
            .method("shout", |text: String| text.to_uppercase());
    }
}

#[cfg(test)]
mod tests {
    use rpcbridge_core::{
        config::TieBreak,
        registry::{Registry, Reply, ReturnKind},
    };
    use serde_json::json;

    use super::*;

    fn registry() -> Registry {
        Registry::builder().mount(Calc).mount(Clock).mount(Echo).build()
    }

    fn value(registry: &Registry, target: &str, params: &[Value]) -> Value {
        match registry
            .call(target, None, params, TieBreak::default())
            .unwrap()
            .unwrap()
        {
            Reply::Value(v) => v,
            other => panic!("expected a value, got {other:?}"),
        }
    }

    #[test]
    fn test_calc_overloads() {
        let registry = registry();
        assert_eq!(value(&registry, "calc.add", &[json!(1), json!(2)]), json!(3));
        assert_eq!(
            value(&registry, "calc.add", &[json!(0.5), json!(2)]),
            json!(2.5)
        );
        assert_eq!(
            value(&registry, "calc.add", &[json!("a"), json!("b")]),
            json!("ab")
        );
        assert_eq!(
            value(&registry, "calc.sum", &[json!([1, 2.5])]),
            json!(3.5)
        );
        let err = registry
            .call("calc.div", None, &[json!(1), json!(0)], TieBreak::default())
            .unwrap()
            .unwrap_err();
        assert_eq!(err.to_string(), "division by zero");
    }

    #[test]
    fn test_listing_shows_return_kinds() {
        let listing = registry().listing();
        let names: Vec<_> = listing.iter().map(|s| s.name.as_str()).collect();
        assert_eq!(names, vec!["calc", "clock", "echo"]);
        let clock = &listing[1];
        let kind = |name: &str| {
            clock
                .methods
                .iter()
                .find(|m| m.name == name)
                .map(|m| m.returns)
                .unwrap()
        };
        assert_eq!(kind("now"), ReturnKind::Value);
        assert_eq!(kind("delay"), ReturnKind::Deferred);
        assert_eq!(kind("ticks"), ReturnKind::Stream);
    }

    #[test]
    fn test_echo() {
        let registry = registry();
        assert_eq!(
            value(&registry, "echo.echo", &[json!({"k": [1]})]),
            json!({"k": [1]})
        );
        assert_eq!(value(&registry, "echo.shout", &[json!("hi")]), json!("HI"));
    }
}
