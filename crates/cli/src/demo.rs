//! Method and topic set served by `switchyard serve`.

use std::time::{Duration, SystemTime, UNIX_EPOCH};

use {
    serde_json::{Value, json},
    switchyard_server::{
        Dispatcher, JsonKind, MethodDescriptor, Request, protocol::RpcError,
    },
    tracing::warn,
};

pub const CLOCK: &str = "clock";
pub const TOPICS: [&str; 1] = [CLOCK];

const MAX_SLEEP_SECS: f64 = 60.0;

pub fn methods() -> Vec<MethodDescriptor> {
    vec![
        MethodDescriptor::new("ping", |_req: Request| async { Ok(json!("pong")) }).context_free(),
        MethodDescriptor::new("echo", |req: Request| async move {
            Ok(req.params().get("value").cloned().unwrap_or(Value::Null))
        })
        .param("value")
        .context_free(),
        MethodDescriptor::new("add", |req: Request| async move {
            let (a, b) = (req.params().get("a"), req.params().get("b"));
            match (a, b) {
                (Some(a), Some(b)) => Ok(sum(a, b)),
                _ => Err(RpcError::invalid_params("too few arguments").into()),
            }
        })
        .param("a")
        .param("b")
        .validate("a", JsonKind::Number)
        .validate("b", JsonKind::Number)
        .context_free(),
        MethodDescriptor::new("sleep", |req: Request| async move {
            let secs: f64 = req.param("seconds")?;
            if !(0.0..=MAX_SLEEP_SECS).contains(&secs) {
                return Err(RpcError::invalid_params(format!(
                    "'seconds' must be between 0 and {MAX_SLEEP_SECS}"
                ))
                .into());
            }
            tokio::time::sleep(Duration::from_secs_f64(secs)).await;
            Ok(json!(secs))
        })
        .param_default("seconds", 1)
        .validate("seconds", JsonKind::Number)
        .context_free(),
        MethodDescriptor::new("whoami", |req: Request| async move {
            let credentials = req.ctx()?.credentials();
            Ok(json!({
                "user": credentials.user,
                "permissions": credentials.permissions,
            }))
        }),
    ]
}

/// Integer sum when both operands are integers and it fits, float otherwise.
fn sum(a: &Value, b: &Value) -> Value {
    if let (Some(a), Some(b)) = (a.as_i64(), b.as_i64())
        && let Some(total) = a.checked_add(b)
    {
        return json!(total);
    }
    json!(a.as_f64().unwrap_or_default() + b.as_f64().unwrap_or_default())
}

/// Publish a tick on [`CLOCK`] every `period` until the task is aborted.
pub async fn publish_clock(dispatcher: Dispatcher, period: Duration) {
    let mut ticker = tokio::time::interval(period);
    let mut tick: u64 = 0;
    loop {
        ticker.tick().await;
        let unix = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|elapsed| elapsed.as_secs())
            .unwrap_or_default();
        if let Err(e) = dispatcher
            .notify(CLOCK, json!({"tick": tick, "unix": unix}))
            .await
        {
            warn!(error = %e, "clock publish failed");
        }
        tick += 1;
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use {
        super::*,
        rstest::rstest,
        switchyard_server::{Handler, HandlerError, protocol::ErrorKind},
    };

    fn method(name: &str) -> MethodDescriptor {
        methods().into_iter().find(|m| m.name() == name).unwrap()
    }

    async fn invoke(name: &str, params: Value) -> Result<Value, HandlerError> {
        let method = method(name);
        let params = method.bind(&params)?;
        let Handler::Async(handler) = method.handler() else {
            panic!("demo methods are async");
        };
        handler(Request::new(params, None)).await
    }

    #[rstest]
    #[case(json!([1, 2]), json!(3))]
    #[case(json!({"a": 1.5, "b": 2}), json!(3.5))]
    #[case(json!([i64::MAX, 1]), json!(i64::MAX as f64 + 1.0))]
    #[tokio::test]
    async fn add(#[case] params: Value, #[case] expected: Value) {
        assert_eq!(invoke("add", params).await.unwrap(), expected);
    }

    #[tokio::test]
    async fn add_rejects_strings() {
        let err = invoke("add", json!(["1", 2])).await.unwrap_err();
        let HandlerError::Rpc(err) = err else {
            panic!("expected rpc error");
        };
        assert_eq!(err.kind, ErrorKind::InvalidParams);
        assert_eq!(err.message, "'a' has to be 'number'");
    }

    #[tokio::test]
    async fn ping_and_echo() {
        assert_eq!(invoke("ping", Value::Null).await.unwrap(), json!("pong"));
        assert_eq!(
            invoke("echo", json!([{"nested": [1, 2]}])).await.unwrap(),
            json!({"nested": [1, 2]})
        );
    }

    #[tokio::test(start_paused = true)]
    async fn sleep_uses_default_and_bounds() {
        assert_eq!(invoke("sleep", Value::Null).await.unwrap(), json!(1.0));
        assert!(invoke("sleep", json!([120])).await.is_err());
    }

    #[tokio::test]
    async fn whoami_needs_a_connection() {
        assert!(matches!(
            invoke("whoami", Value::Null).await,
            Err(HandlerError::Internal(_))
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn clock_updates_cached_state() {
        let dispatcher = Dispatcher::builder().add_topics(TOPICS).build();
        let task = tokio::spawn(publish_clock(dispatcher.clone(), Duration::from_secs(1)));
        tokio::time::sleep(Duration::from_millis(1500)).await;
        task.abort();

        let state = dispatcher.pubsub().state(CLOCK).await.unwrap();
        assert_eq!(state["tick"], 1);
    }
}
