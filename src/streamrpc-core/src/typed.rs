use crate::message::Params;
use crate::registry::MethodRegistry;
use crate::session::{CallContext, Completion};
use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::Value;
use std::sync::Arc;

/// Registration helpers for handlers written as futures. The future runs on
/// the tokio runtime and completes the call when it resolves.
impl MethodRegistry {
    pub fn register_async<F, Fut>(&mut self, name: &str, f: F)
    where
        F: Fn(Params, CallContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Value, Value>> + Send + 'static,
    {
        let f = Arc::new(f);
        self.register(name, move |params, ctx, done: Completion| {
            let fut = f(params, ctx);
            tokio::spawn(async move {
                done.complete(fut.await);
            });
            Ok(())
        });
    }

    /// Like [`MethodRegistry::register_async`] with the positional params
    /// deserialized into `Args`, usually a tuple.
    pub fn register_typed<Args, Res, Err, F, Fut>(&mut self, name: &str, f: F)
    where
        Args: DeserializeOwned + Send + 'static,
        Res: Serialize + Send + 'static,
        Err: Serialize + Send + 'static,
        F: Fn(CallContext, Args) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Res, Err>> + Send + 'static,
    {
        let f = Arc::new(f);
        self.register(name, move |params, ctx, done: Completion| {
            let args: Args = match serde_json::from_value(Value::Array(params)) {
                Ok(args) => args,
                Err(e) => {
                    done.err(format!("Invalid params: {}", e));
                    return Ok(());
                }
            };
            let fut = f(ctx, args);
            tokio::spawn(async move {
                let outcome = match fut.await {
                    Ok(res) => serde_json::to_value(res)
                        .map_err(|e| Value::String(format!("Serialization error: {}", e))),
                    Err(err) => Err(serde_json::to_value(err)
                        .unwrap_or_else(|e| Value::String(format!("Serialization error: {}", e)))),
                };
                done.complete(outcome);
            });
            Ok(())
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::{Event, Request, RequestId, Response};
    use crate::session::{DisconnectHook, Exchange, dispatch};
    use serde_json::json;
    use std::sync::Mutex;
    use tokio::sync::mpsc;

    struct ChannelExchange {
        tx: mpsc::UnboundedSender<Response>,
    }

    impl Exchange for ChannelExchange {
        fn respond(&self, response: Response) {
            let _ = self.tx.send(response);
        }
        fn start_stream(&self, _: Option<DisconnectHook>) {}
        fn is_writable(&self) -> bool {
            true
        }
        fn write_event(&self, _: &Event) {}
        fn close(&self) {}
    }

    async fn call(registry: &MethodRegistry, method: &str, params: Params) -> Response {
        let (tx, mut rx) = mpsc::unbounded_channel();
        dispatch(
            registry,
            Request::new(1i64, method, params),
            Arc::new(ChannelExchange { tx }),
        )
        .unwrap();
        rx.recv().await.unwrap()
    }

    #[tokio::test]
    async fn async_handler_completes_when_future_resolves() {
        let mut registry = MethodRegistry::new();
        registry.register_async("delayed.echo", |params, _| async move {
            tokio::time::sleep(std::time::Duration::from_millis(20)).await;
            Ok::<_, Value>(params[0].clone())
        });

        let res = call(&registry, "delayed.echo", vec![json!("Echo.")]).await;
        assert_eq!(res, Response::ok(RequestId::Number(1), json!("Echo.")));
    }

    #[tokio::test]
    async fn typed_handler_decodes_positional_params() {
        let mut registry = MethodRegistry::new();
        registry.register_typed("add", |_, (a, b): (i64, i64)| async move {
            Ok::<_, String>(a + b)
        });

        let res = call(&registry, "add", vec![json!(1), json!(2)]).await;
        assert_eq!(res, Response::ok(RequestId::Number(1), json!(3)));
    }

    #[tokio::test]
    async fn typed_handler_rejects_bad_params() {
        let mut registry = MethodRegistry::new();
        registry.register_typed("add", |_, (a, b): (i64, i64)| async move {
            Ok::<_, String>(a + b)
        });

        let res = call(&registry, "add", vec![json!("one")]).await;
        let error = res.into_result().unwrap_err();
        assert!(error.as_str().unwrap().starts_with("Invalid params"));
    }

    #[tokio::test]
    async fn typed_handler_serializes_errors() {
        #[derive(Serialize)]
        struct Failure {
            code: u32,
        }

        let mut registry = MethodRegistry::new();
        registry.register_typed("fail", |_, _: Vec<Value>| async move {
            Err::<(), _>(Failure { code: 7 })
        });

        let res = call(&registry, "fail", vec![]).await;
        assert_eq!(res, Response::error(RequestId::Number(1), json!({"code": 7})));
    }

    #[tokio::test]
    async fn async_handler_sees_scope() {
        let seen = Arc::new(Mutex::new(None));
        let mut registry = MethodRegistry::new().with_default_scope(Arc::new("shared".to_string()));
        let keep = seen.clone();
        registry.register_async("who", move |_, ctx| {
            let keep = keep.clone();
            async move {
                let scope = ctx.scope_as::<String>().map(|s| s.as_str().to_owned());
                *keep.lock().unwrap() = scope.clone();
                Ok::<_, Value>(json!(scope))
            }
        });

        let res = call(&registry, "who", vec![]).await;
        assert_eq!(res, Response::ok(RequestId::Number(1), json!("shared")));
        assert_eq!(seen.lock().unwrap().as_deref(), Some("shared"));
    }
}
