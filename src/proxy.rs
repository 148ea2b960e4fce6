//! Caller-side proxy layer.
//!
//! A [`Caller`] turns a `(method, argument-array)` pair into a request
//! envelope, routes it through the registry, and decodes the typed reply:
//! an `Error` envelope raises [`PipehubError::Remote`], a `Null` envelope
//! yields `None`, anything else decodes as the expected value.
//!
//! Two flavors exist: a unicast caller bound to one worker id, and a
//! broadcast caller that fans each call out to every connected worker with
//! relayed envelopes (fresh `message_id` per hop) and races the replies.
//! The first reply that is not `Null` wins; an `Error` reply aborts the
//! whole call immediately; if every worker replies `Null` the call yields
//! `None`.
//!
//! The [`rpc_proxy!`](crate::rpc_proxy) macro generates one concrete proxy
//! struct per interface description on top of this type.

use std::sync::Arc;
use std::time::Duration;

use serde::de::DeserializeOwned;
use serde_json::Value;
use tokio::sync::mpsc;

use crate::error::{PipehubError, Result};
use crate::protocol::{message_type, ErrorResponse, PipeMessage};
use crate::registry::RegistryServer;

/// Where a [`Caller`] routes each call.
enum CallTarget {
    /// One named worker.
    Worker(String),
    /// Every currently connected worker, racing the replies.
    AllWorkers,
}

/// Call-site for invoking remote methods through the registry.
pub struct Caller {
    registry: Arc<RegistryServer>,
    target: CallTarget,
    timeout: Option<Duration>,
}

impl Caller {
    /// Caller routing every call to the named worker.
    pub fn unicast(registry: Arc<RegistryServer>, worker_id: &str) -> Self {
        Self {
            registry,
            target: CallTarget::Worker(worker_id.to_string()),
            timeout: None,
        }
    }

    /// Caller fanning every call out to all connected workers.
    pub fn broadcast(registry: Arc<RegistryServer>) -> Self {
        Self {
            registry,
            target: CallTarget::AllWorkers,
            timeout: None,
        }
    }

    /// Override the registry's default per-call timeout.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    fn call_timeout(&self) -> Duration {
        self.timeout.unwrap_or_else(|| self.registry.call_timeout())
    }

    /// Invoke `method` with `args` (a JSON argument array) and decode the
    /// reply. `None` means the remote handler explicitly returned nothing.
    pub async fn call<R: DeserializeOwned>(&self, method: &str, args: Value) -> Result<Option<R>> {
        let request = PipeMessage::request(method, &args)?;
        match &self.target {
            CallTarget::Worker(worker_id) => {
                let reply = self
                    .registry
                    .send_to_worker_timeout(worker_id, request, self.call_timeout())
                    .await?;
                decode_reply(reply)
            }
            CallTarget::AllWorkers => self.race(request).await,
        }
    }

    /// Invoke `method` without awaiting any reply.
    ///
    /// For methods registered as notify handlers: the worker never writes a
    /// reply, so no waiter is registered on this side either.
    pub async fn post(&self, method: &str, args: Value) -> Result<()> {
        let request = PipeMessage::request(method, &args)?;
        match &self.target {
            CallTarget::Worker(worker_id) => {
                self.registry.post_to_worker(worker_id, request).await
            }
            CallTarget::AllWorkers => {
                let worker_ids = self.registry.connected_worker_ids();
                if worker_ids.is_empty() {
                    return Err(PipehubError::NoWorkers);
                }
                for worker_id in worker_ids {
                    let relayed = PipeMessage::relay(&request);
                    if let Err(e) = self.registry.post_to_worker(&worker_id, relayed).await {
                        tracing::warn!(worker = %worker_id, error = %e, "broadcast post failed");
                    }
                }
                Ok(())
            }
        }
    }

    /// Fan `request` out to every worker and return the first useful reply.
    async fn race<R: DeserializeOwned>(&self, request: PipeMessage) -> Result<Option<R>> {
        let worker_ids = self.registry.connected_worker_ids();
        if worker_ids.is_empty() {
            return Err(PipehubError::NoWorkers);
        }

        let timeout = self.call_timeout();
        let expected = worker_ids.len();
        let (tx, mut rx) = mpsc::channel(expected);

        for worker_id in worker_ids {
            let relayed = PipeMessage::relay(&request);
            let registry = Arc::clone(&self.registry);
            let tx = tx.clone();
            tokio::spawn(async move {
                let outcome = registry
                    .send_to_worker_timeout(&worker_id, relayed, timeout)
                    .await;
                let _ = tx.send((worker_id, outcome)).await;
            });
        }
        drop(tx);

        for _ in 0..expected {
            match rx.recv().await {
                Some((_, Ok(reply))) if reply.is_null() => continue,
                // a value reply wins the race; an error reply aborts it
                Some((_, Ok(reply))) => return decode_reply(reply),
                Some((worker_id, Err(e))) => {
                    tracing::warn!(worker = %worker_id, error = %e, "broadcast leg failed");
                    continue;
                }
                None => break,
            }
        }
        Ok(None)
    }
}

fn decode_reply<R: DeserializeOwned>(reply: PipeMessage) -> Result<Option<R>> {
    match reply.message_type.as_str() {
        message_type::ERROR => {
            let error: ErrorResponse = reply.payload_as()?;
            Err(PipehubError::Remote(error.message))
        }
        message_type::NULL => Ok(None),
        _ => Ok(Some(reply.payload_as()?)),
    }
}

/// Generate a concrete proxy type for an interface description.
///
/// Each `fn name(arg: Ty, ...) -> Ret;` line becomes an async method that
/// encodes the call as `(name, [args...])` and decodes the typed reply.
/// Lines without a return type become fire-and-forget posts. Method names
/// travel as written; dispatch on the worker side is case-insensitive.
///
/// ```ignore
/// pipehub::rpc_proxy! {
///     pub CalculatorProxy {
///         fn add(a: i32, b: i32) -> i32;
///         fn reset();
///     }
/// }
///
/// let calc = CalculatorProxy::unicast(registry, "w1");
/// assert_eq!(calc.add(2, 3).await?, Some(5));
/// ```
#[macro_export]
macro_rules! rpc_proxy {
    (
        $(#[$meta:meta])*
        $vis:vis $name:ident {
            $(
                fn $method:ident ( $($arg:ident : $arg_ty:ty),* $(,)? ) $(-> $ret:ty)? ;
            )*
        }
    ) => {
        $(#[$meta])*
        $vis struct $name {
            caller: $crate::proxy::Caller,
        }

        impl $name {
            /// Proxy routing every call to the named worker.
            $vis fn unicast(
                registry: ::std::sync::Arc<$crate::registry::RegistryServer>,
                worker_id: &str,
            ) -> Self {
                Self {
                    caller: $crate::proxy::Caller::unicast(registry, worker_id),
                }
            }

            /// Proxy fanning every call out to all connected workers.
            $vis fn broadcast(
                registry: ::std::sync::Arc<$crate::registry::RegistryServer>,
            ) -> Self {
                Self {
                    caller: $crate::proxy::Caller::broadcast(registry),
                }
            }

            $(
                $crate::rpc_proxy!(@method $vis fn $method ( $($arg : $arg_ty),* ) $(-> $ret)?);
            )*
        }
    };

    (@method $vis:vis fn $method:ident ( $($arg:ident : $arg_ty:ty),* ) -> $ret:ty) => {
        $vis async fn $method(
            &self,
            $($arg: $arg_ty),*
        ) -> $crate::Result<::std::option::Option<$ret>> {
            self.caller
                .call(
                    stringify!($method),
                    $crate::__private::serde_json::json!([$($arg),*]),
                )
                .await
        }
    };

    (@method $vis:vis fn $method:ident ( $($arg:ident : $arg_ty:ty),* )) => {
        $vis async fn $method(&self, $($arg: $arg_ty),*) -> $crate::Result<()> {
            self.caller
                .post(
                    stringify!($method),
                    $crate::__private::serde_json::json!([$($arg),*]),
                )
                .await
        }
    };
}
