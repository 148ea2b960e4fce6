//! Name-based dispatch engine.
//!
//! A [`MethodRouter`] maps method names (compared case-insensitively) to
//! typed thunks built at registration time. Dispatching a request decodes
//! its payload as a positional argument tuple against the thunk's declared
//! parameter types, invokes the handler, and shapes the reply envelope:
//!
//! - a value whose JSON serialization is `null` becomes a `Null` reply;
//! - any other value becomes a reply typed like the request;
//! - a notify method produces no reply at all;
//! - a handler error is reified as an `Error` envelope and never
//!   propagates over the wire.
//!
//! # Example
//!
//! ```ignore
//! use pipehub::dispatch::MethodRouter;
//!
//! let mut router = MethodRouter::new();
//! router.handle("add", |(a, b): (i32, i32)| async move { Ok(a + b) });
//! router.handle_notify("reset", |_: ()| async move { Ok(()) });
//! ```

use std::collections::HashMap;
use std::future::Future;
use std::marker::PhantomData;

use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;

use crate::connection::BoxFuture;
use crate::error::{PipehubError, Result};
use crate::protocol::PipeMessage;

/// Positional argument tuple decoded from a JSON array payload.
pub trait FromArgs: Sized + Send {
    /// Number of declared parameters.
    const ARITY: usize;

    /// Decode `values` positionally. The length has already been checked
    /// against [`Self::ARITY`].
    fn from_values(values: Vec<Value>) -> Result<Self>;
}

macro_rules! impl_from_args {
    ($count:expr $(, $ty:ident)*) => {
        impl<$($ty),*> FromArgs for ($($ty,)*)
        where
            $($ty: DeserializeOwned + Send,)*
        {
            const ARITY: usize = $count;

            #[allow(unused_mut, unused_variables)]
            fn from_values(values: Vec<Value>) -> Result<Self> {
                let mut values = values.into_iter();
                Ok(($(
                    serde_json::from_value::<$ty>(values.next().unwrap_or(Value::Null))
                        .map_err(|e| PipehubError::PayloadMalformed(e.to_string()))?,
                )*))
            }
        }
    };
}

impl_from_args!(0);
impl_from_args!(1, A1);
impl_from_args!(2, A1, A2);
impl_from_args!(3, A1, A2, A3);
impl_from_args!(4, A1, A2, A3, A4);
impl_from_args!(5, A1, A2, A3, A4, A5);
impl_from_args!(6, A1, A2, A3, A4, A5, A6);
impl_from_args!(7, A1, A2, A3, A4, A5, A6, A7);
impl_from_args!(8, A1, A2, A3, A4, A5, A6, A7, A8);

/// Outcome of an erased method invocation.
enum Invocation {
    /// Serialized return value.
    Value(Value),
    /// Method completed with nothing owed back.
    NoReply,
}

trait ErasedMethod: Send + Sync {
    fn invoke(&self, values: Vec<Value>) -> BoxFuture<'static, Result<Invocation>>;
}

/// Value-returning method with typed argument decoding.
struct TypedMethod<F, A> {
    handler: F,
    _marker: PhantomData<fn(A)>,
}

impl<F, A, Fut, R> ErasedMethod for TypedMethod<F, A>
where
    F: Fn(A) -> Fut + Send + Sync + 'static,
    A: FromArgs + 'static,
    Fut: Future<Output = Result<R>> + Send + 'static,
    R: Serialize + 'static,
{
    fn invoke(&self, values: Vec<Value>) -> BoxFuture<'static, Result<Invocation>> {
        let args = match A::from_values(values) {
            Ok(args) => args,
            Err(e) => return Box::pin(async move { Err(e) }),
        };
        let fut = (self.handler)(args);
        Box::pin(async move {
            let value = fut.await?;
            Ok(Invocation::Value(serde_json::to_value(&value)?))
        })
    }
}

/// Fire-and-forget method: runs to completion, never replies.
struct NotifyMethod<F, A> {
    handler: F,
    _marker: PhantomData<fn(A)>,
}

impl<F, A, Fut> ErasedMethod for NotifyMethod<F, A>
where
    F: Fn(A) -> Fut + Send + Sync + 'static,
    A: FromArgs + 'static,
    Fut: Future<Output = Result<()>> + Send + 'static,
{
    fn invoke(&self, values: Vec<Value>) -> BoxFuture<'static, Result<Invocation>> {
        let args = match A::from_values(values) {
            Ok(args) => args,
            Err(e) => return Box::pin(async move { Err(e) }),
        };
        let fut = (self.handler)(args);
        Box::pin(async move {
            fut.await?;
            Ok(Invocation::NoReply)
        })
    }
}

struct MethodEntry {
    method: Box<dyn ErasedMethod>,
    arity: usize,
}

/// Registry of named methods, dispatched by request type.
#[derive(Default)]
pub struct MethodRouter {
    // keyed by lower-cased name
    methods: HashMap<String, MethodEntry>,
}

impl MethodRouter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a value-returning method.
    ///
    /// The handler's tuple parameter declares the positional argument
    /// types; its return value is serialized into the reply. A value that
    /// serializes to JSON `null` produces a `Null` reply.
    pub fn handle<A, R, F, Fut>(&mut self, name: &str, handler: F)
    where
        A: FromArgs + 'static,
        R: Serialize + 'static,
        F: Fn(A) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<R>> + Send + 'static,
    {
        self.methods.insert(
            name.to_ascii_lowercase(),
            MethodEntry {
                arity: A::ARITY,
                method: Box::new(TypedMethod {
                    handler,
                    _marker: PhantomData,
                }),
            },
        );
    }

    /// Register a fire-and-forget method. No reply is ever written, not
    /// even on success; callers use a posting proxy for such methods.
    pub fn handle_notify<A, F, Fut>(&mut self, name: &str, handler: F)
    where
        A: FromArgs + 'static,
        F: Fn(A) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        self.methods.insert(
            name.to_ascii_lowercase(),
            MethodEntry {
                arity: A::ARITY,
                method: Box::new(NotifyMethod {
                    handler,
                    _marker: PhantomData,
                }),
            },
        );
    }

    /// True when a method with this name (any casing) is registered.
    pub fn contains(&self, name: &str) -> bool {
        self.methods.contains_key(&name.to_ascii_lowercase())
    }

    pub fn len(&self) -> usize {
        self.methods.len()
    }

    pub fn is_empty(&self) -> bool {
        self.methods.is_empty()
    }

    /// Dispatch `request`, producing the reply envelope if one is owed.
    pub async fn dispatch(&self, request: &PipeMessage) -> Option<PipeMessage> {
        let entry = match self.methods.get(&request.message_type.to_ascii_lowercase()) {
            Some(entry) => entry,
            None => {
                let e = PipehubError::MethodNotFound(request.message_type.clone());
                return Some(PipeMessage::error_reply(request, &e.to_string()));
            }
        };

        let values = match request.payload_args() {
            Ok(values) => values,
            Err(e) => return Some(PipeMessage::error_reply(request, &e.to_string())),
        };
        if values.len() != entry.arity {
            let e = PipehubError::ArityMismatch {
                expected: entry.arity,
                actual: values.len(),
            };
            return Some(PipeMessage::error_reply(request, &e.to_string()));
        }

        match entry.method.invoke(values).await {
            Ok(Invocation::Value(value)) if value.is_null() => {
                Some(PipeMessage::null_reply(request))
            }
            Ok(Invocation::Value(value)) => {
                match PipeMessage::reply_to(request, &request.message_type, &value) {
                    Ok(reply) => Some(reply),
                    Err(e) => Some(PipeMessage::error_reply(request, &e.to_string())),
                }
            }
            Ok(Invocation::NoReply) => None,
            Err(e) => {
                tracing::error!(method = %request.message_type, error = %e, "handler failed");
                Some(PipeMessage::error_reply(request, &e.to_string()))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{message_type, ErrorResponse};
    use serde_json::json;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;

    fn router() -> MethodRouter {
        let mut router = MethodRouter::new();
        router.handle("add", |(a, b): (i32, i32)| async move { Ok(a + b) });
        router.handle("find", |(key,): (String,)| async move {
            Ok(if key == "known" {
                Some("value".to_string())
            } else {
                None
            })
        });
        router.handle("boom", |_: ()| async move {
            Err::<i32, _>(PipehubError::Protocol("kaput".to_string()))
        });
        router
    }

    fn request(method: &str, args: Value) -> PipeMessage {
        PipeMessage::request(method, &args).unwrap()
    }

    #[tokio::test]
    async fn test_dispatch_add() {
        let router = router();
        let req = request("Add", json!([2, 3]));

        let reply = router.dispatch(&req).await.unwrap();
        assert_eq!(reply.message_type, "Add");
        assert_eq!(reply.message_id, req.message_id);
        assert_eq!(reply.payload_as::<i32>().unwrap(), 5);
    }

    #[tokio::test]
    async fn test_dispatch_is_case_insensitive() {
        let router = router();
        let reply = router.dispatch(&request("ADD", json!([4, 6]))).await.unwrap();
        assert_eq!(reply.payload_as::<i32>().unwrap(), 10);
    }

    #[tokio::test]
    async fn test_missing_method_names_the_method() {
        let router = router();
        let reply = router.dispatch(&request("Nope", json!([]))).await.unwrap();

        assert!(reply.is_error());
        let error: ErrorResponse = reply.payload_as().unwrap();
        assert!(error.message.contains("Nope"));
    }

    #[tokio::test]
    async fn test_arity_mismatch_is_error_reply() {
        let router = router();
        let reply = router.dispatch(&request("add", json!([2]))).await.unwrap();

        assert!(reply.is_error());
        let error: ErrorResponse = reply.payload_as().unwrap();
        assert!(error.message.contains("expected 2"));
    }

    #[tokio::test]
    async fn test_non_array_payload_is_error_reply() {
        let router = router();
        let reply = router.dispatch(&request("add", json!(5))).await.unwrap();
        assert!(reply.is_error());
    }

    #[tokio::test]
    async fn test_wrong_element_type_is_error_reply() {
        let router = router();
        let reply = router
            .dispatch(&request("add", json!(["two", 3])))
            .await
            .unwrap();
        assert!(reply.is_error());
    }

    #[tokio::test]
    async fn test_nil_value_becomes_null_reply() {
        let router = router();
        let reply = router
            .dispatch(&request("find", json!(["unknown"])))
            .await
            .unwrap();

        assert_eq!(reply.message_type, message_type::NULL);
        assert_eq!(
            reply.payload_as::<Value>().unwrap(),
            Value::Null
        );
    }

    #[tokio::test]
    async fn test_some_value_is_typed_reply() {
        let router = router();
        let reply = router
            .dispatch(&request("find", json!(["known"])))
            .await
            .unwrap();

        assert_eq!(reply.message_type, "find");
        assert_eq!(reply.payload_as::<String>().unwrap(), "value");
    }

    #[tokio::test]
    async fn test_handler_error_becomes_error_reply() {
        let router = router();
        let reply = router.dispatch(&request("boom", json!([]))).await.unwrap();

        assert!(reply.is_error());
        let error: ErrorResponse = reply.payload_as().unwrap();
        assert!(error.message.contains("kaput"));
    }

    #[tokio::test]
    async fn test_notify_method_yields_no_reply() {
        let mut router = MethodRouter::new();
        let fired = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&fired);
        router.handle_notify("do_work", move |(_tag,): (String,)| {
            let flag = Arc::clone(&flag);
            async move {
                flag.store(true, Ordering::SeqCst);
                Ok(())
            }
        });

        let reply = router.dispatch(&request("do_work", json!(["x"]))).await;
        assert!(reply.is_none());
        assert!(fired.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn test_zero_arity_method() {
        let mut router = MethodRouter::new();
        router.handle("ping", |_: ()| async move { Ok("pong") });

        let reply = router.dispatch(&request("ping", json!([]))).await.unwrap();
        assert_eq!(reply.payload_as::<String>().unwrap(), "pong");
    }
}
