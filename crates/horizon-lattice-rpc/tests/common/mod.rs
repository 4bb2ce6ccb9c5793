//! Shared fixtures: a hand-written greeter service and TLS material.

#![allow(dead_code)]

use std::convert::Infallible;
use std::sync::Arc;
use std::task::{Context, Poll};

use futures_util::future::BoxFuture;
use horizon_lattice_rpc::interceptor::{CallContext, InterceptFuture, Interceptor, Next};
use horizon_lattice_rpc::{GrpcChannel, ServiceHost, ServiceHostBuilder};
use parking_lot::Mutex;
use tonic::body::Body;
use tonic::codec::ProstCodec;
use tonic::server::{Grpc, NamedService, UnaryService};
use tonic::{Request, Response, Status};

pub const CA_PEM: &str = include_str!("../data/ca.pem");
pub const SERVER_PEM: &str = include_str!("../data/server.pem");
pub const SERVER_KEY: &str = include_str!("../data/server.key");

/// The fixed reply of the mock greeter.
pub const GREETING: &str = "This is a mocked service test";

const SAY_HELLO: &str = "/helloworld.Greeter/SayHello";

#[derive(Clone, PartialEq, prost::Message)]
pub struct HelloRequest {
    #[prost(string, tag = "1")]
    pub name: String,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct HelloReply {
    #[prost(string, tag = "1")]
    pub message: String,
}

/// Server side of `helloworld.Greeter`, always answering [`GREETING`].
#[derive(Clone, Debug, Default)]
pub struct GreeterServer;

struct SayHello;

impl UnaryService<HelloRequest> for SayHello {
    type Response = HelloReply;
    type Future = BoxFuture<'static, Result<Response<HelloReply>, Status>>;

    fn call(&mut self, _request: Request<HelloRequest>) -> Self::Future {
        Box::pin(async {
            Ok(Response::new(HelloReply {
                message: GREETING.to_string(),
            }))
        })
    }
}

impl tower::Service<http::Request<Body>> for GreeterServer {
    type Response = http::Response<Body>;
    type Error = Infallible;
    type Future = BoxFuture<'static, Result<Self::Response, Self::Error>>;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, req: http::Request<Body>) -> Self::Future {
        match req.uri().path() {
            SAY_HELLO => Box::pin(async move {
                let mut grpc = Grpc::new(ProstCodec::<HelloReply, HelloRequest>::default());
                Ok(grpc.unary(SayHello, req).await)
            }),
            _ => Box::pin(async { Ok(Status::unimplemented("unknown method").into_http()) }),
        }
    }
}

impl NamedService for GreeterServer {
    const NAME: &'static str = "helloworld.Greeter";
}

/// Client side of `helloworld.Greeter` over a [`GrpcChannel`].
#[derive(Clone, Debug)]
pub struct GreeterClient {
    inner: tonic::client::Grpc<GrpcChannel>,
}

impl GreeterClient {
    pub fn new(channel: GrpcChannel) -> Self {
        Self {
            inner: tonic::client::Grpc::new(channel),
        }
    }

    pub async fn say_hello(&mut self, name: &str) -> Result<HelloReply, Status> {
        self.inner
            .ready()
            .await
            .map_err(|e| Status::unknown(format!("Service was not ready: {}", e)))?;
        let codec = ProstCodec::<HelloRequest, HelloReply>::default();
        let path = http::uri::PathAndQuery::from_static(SAY_HELLO);
        let request = Request::new(HelloRequest {
            name: name.to_string(),
        });
        let response = self.inner.unary(request, path, codec).await?;
        Ok(response.into_inner())
    }
}

/// Build a host from `builder` with the greeter registered.
pub fn greeter_host(builder: ServiceHostBuilder) -> ServiceHost {
    let mut host = builder.build().unwrap();
    host.register_service(|routes| {
        routes.add_service(GreeterServer);
    })
    .unwrap();
    host
}

/// Shared, ordered record of interceptor activity.
pub type Trace = Arc<Mutex<Vec<String>>>;

/// Records entry and exit under its label.
pub struct Recorder {
    pub label: &'static str,
    pub trace: Trace,
}

impl Interceptor for Recorder {
    fn intercept<'a>(&'a self, ctx: CallContext, next: Next<'a>) -> InterceptFuture<'a> {
        Box::pin(async move {
            self.trace.lock().push(format!("enter {}", self.label));
            let outcome = next.run(ctx).await;
            self.trace.lock().push(format!("exit {}", self.label));
            outcome
        })
    }

    fn name(&self) -> &'static str {
        self.label
    }
}

/// Holds every call for a fixed time before forwarding it.
pub struct Delay(pub std::time::Duration);

impl Interceptor for Delay {
    fn intercept<'a>(&'a self, ctx: CallContext, next: Next<'a>) -> InterceptFuture<'a> {
        Box::pin(async move {
            tokio::time::sleep(self.0).await;
            next.run(ctx).await
        })
    }
}
