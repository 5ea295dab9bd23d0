use crate::error::Result;
use crate::idempotency::handler::{IdempotencyHandler, IdempotencyHandlerConfig};
use crate::idempotency::storage::RecordStore;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::future::Future;
use std::sync::Arc;

macro_rules! executor_common {
    ($name:ident) => {
        impl<S: RecordStore, H> $name<S, H> {
            pub fn new(store: S, config: IdempotencyHandlerConfig, operation: H) -> Self {
                Self::from_handler(IdempotencyHandler::new(store, config), operation)
            }

            /// Wraps `operation` around an existing handler, sharing its store and counters.
            pub fn from_handler(handler: IdempotencyHandler<S>, operation: H) -> Self {
                Self {
                    handler,
                    operation: Arc::new(operation),
                }
            }

            pub fn handler(&self) -> &IdempotencyHandler<S> {
                &self.handler
            }
        }

        impl<S, H> Clone for $name<S, H> {
            fn clone(&self) -> Self {
                Self {
                    handler: self.handler.clone(),
                    operation: Arc::clone(&self.operation),
                }
            }
        }
    };
}

/// Operation with neither request nor response, called as `exec(key)`.
///
/// Every call fingerprints the unit value, so all calls under one key count
/// as the same payload. The cached response is `null`.
pub struct Command<S, H> {
    handler: IdempotencyHandler<S>,
    operation: Arc<H>,
}

executor_common!(Command);

impl<S, H> Command<S, H>
where
    S: RecordStore,
{
    pub async fn exec<Fut>(&self, idempotency_key: &str) -> Result<()>
    where
        H: Fn() -> Fut,
        Fut: Future<Output = Result<()>>,
    {
        let operation = &*self.operation;
        self.handler.run(idempotency_key, (), |()| operation()).await
    }
}

/// Operation that produces a response from no request, called as
/// `exec(key) -> Resp`. The request fingerprint is that of the unit value.
pub struct Query<S, H> {
    handler: IdempotencyHandler<S>,
    operation: Arc<H>,
}

executor_common!(Query);

impl<S, H> Query<S, H>
where
    S: RecordStore,
{
    pub async fn exec<Resp, Fut>(&self, idempotency_key: &str) -> Result<Resp>
    where
        H: Fn() -> Fut,
        Resp: Serialize + DeserializeOwned,
        Fut: Future<Output = Result<Resp>>,
    {
        let operation = &*self.operation;
        self.handler.run(idempotency_key, (), |()| operation()).await
    }
}

/// Operation that consumes a request and produces no response, called as
/// `exec(key, req)`. A replay returns `()` decoded from the cached `null`.
pub struct Request<S, H> {
    handler: IdempotencyHandler<S>,
    operation: Arc<H>,
}

executor_common!(Request);

impl<S, H> Request<S, H>
where
    S: RecordStore,
{
    pub async fn exec<Req, Fut>(&self, idempotency_key: &str, request: Req) -> Result<()>
    where
        H: Fn(Req) -> Fut,
        Req: Serialize,
        Fut: Future<Output = Result<()>>,
    {
        let operation = &*self.operation;
        self.handler
            .run(idempotency_key, request, |req| operation(req))
            .await
    }
}

/// Operation that maps a request to a response, called as `exec(key, req) -> Resp`.
pub struct RequestReply<S, H> {
    handler: IdempotencyHandler<S>,
    operation: Arc<H>,
}

executor_common!(RequestReply);

impl<S, H> RequestReply<S, H>
where
    S: RecordStore,
{
    pub async fn exec<Req, Resp, Fut>(&self, idempotency_key: &str, request: Req) -> Result<Resp>
    where
        H: Fn(Req) -> Fut,
        Req: Serialize,
        Resp: Serialize + DeserializeOwned,
        Fut: Future<Output = Result<Resp>>,
    {
        let operation = &*self.operation;
        self.handler
            .run(idempotency_key, request, |req| operation(req))
            .await
    }
}
