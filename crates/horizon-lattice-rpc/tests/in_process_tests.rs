//! End-to-end tests over the in-process transport.

mod common;

use std::time::Duration;

use common::{Delay, GREETING, GreeterClient, greeter_host};
use horizon_lattice_rpc::{
    CertPool, DialContext, GrpcChannel, GrpcError, Identity, InProcessPipe, ServiceHostBuilder,
    ServiceHostState,
};

#[tokio::test]
async fn test_greeting_without_context() {
    let pipe = InProcessPipe::new();
    let mut host = greeter_host(ServiceHostBuilder::new());
    host.start_in_process(&pipe).unwrap();

    let channel = GrpcChannel::builder()
        .insecure()
        .in_process(&pipe)
        .connect("bufnet")
        .await
        .unwrap();
    assert!(channel.is_in_process());

    let reply = GreeterClient::new(channel).say_hello("lattice").await.unwrap();
    assert_eq!(reply.message, GREETING);

    host.cleanup().await;
}

#[tokio::test]
async fn test_greeting_with_context() {
    let pipe = InProcessPipe::new();
    let mut host = greeter_host(ServiceHostBuilder::new());
    host.start_in_process(&pipe).unwrap();

    let channel = GrpcChannel::builder()
        .insecure()
        .in_process(&pipe)
        .context(DialContext::with_timeout(Duration::from_secs(5)))
        .block()
        .connect("localhost:50051")
        .await
        .unwrap();

    let reply = GreeterClient::new(channel).say_hello("lattice").await.unwrap();
    assert_eq!(reply.message, GREETING);

    host.cleanup().await;
}

#[tokio::test]
async fn test_sequential_channels_share_pipe() {
    let pipe = InProcessPipe::new();
    let mut host = greeter_host(ServiceHostBuilder::new());
    host.start_in_process(&pipe).unwrap();

    for _ in 0..3 {
        let channel = GrpcChannel::builder()
            .insecure()
            .in_process(&pipe)
            .block()
            .connect("bufnet")
            .await
            .unwrap();
        let mut client = GreeterClient::new(channel.clone());
        assert_eq!(client.say_hello("a").await.unwrap().message, GREETING);
        assert_eq!(client.say_hello("b").await.unwrap().message, GREETING);
        channel.close();
    }

    host.cleanup().await;
}

#[tokio::test]
async fn test_concurrent_calls_on_one_channel() {
    let pipe = InProcessPipe::new();
    let mut host = greeter_host(ServiceHostBuilder::new());
    host.start_in_process(&pipe).unwrap();

    let channel = GrpcChannel::builder()
        .insecure()
        .in_process(&pipe)
        .connect("bufnet")
        .await
        .unwrap();

    let calls: Vec<_> = (0..8)
        .map(|i| {
            let mut client = GreeterClient::new(channel.clone());
            tokio::spawn(async move { client.say_hello(&format!("caller-{}", i)).await })
        })
        .collect();
    for call in calls {
        assert_eq!(call.await.unwrap().unwrap().message, GREETING);
    }

    host.cleanup().await;
}

#[tokio::test]
async fn test_tls_over_pipe() {
    let pipe = InProcessPipe::new();
    let mut host = greeter_host(
        ServiceHostBuilder::new().tls_identity(Identity::from_pem(common::SERVER_PEM, common::SERVER_KEY)),
    );
    host.start_in_process(&pipe).unwrap();

    let pool = CertPool::from_pem(common::CA_PEM).unwrap();
    let channel = GrpcChannel::builder()
        .tls(false, Some(pool))
        .in_process(&pipe)
        .block()
        .connect("localhost")
        .await
        .unwrap();
    assert!(channel.is_encrypted());

    let reply = GreeterClient::new(channel).say_hello("lattice").await.unwrap();
    assert_eq!(reply.message, GREETING);

    host.cleanup().await;
}

#[tokio::test]
async fn test_closed_pipe_fails_blocking_dial() {
    let pipe = InProcessPipe::new();
    let mut host = greeter_host(ServiceHostBuilder::new());
    host.start_in_process(&pipe).unwrap();
    host.listener().unwrap().close();

    let started = tokio::time::Instant::now();
    let result = GrpcChannel::builder()
        .insecure()
        .in_process(&pipe)
        .context(DialContext::with_timeout(Duration::from_secs(2)))
        .block()
        .connect("bufnet")
        .await;

    assert!(matches!(result, Err(GrpcError::Dial(_))));
    assert!(started.elapsed() < Duration::from_secs(3));

    host.cleanup().await;
}

#[tokio::test]
async fn test_lazy_channel_surfaces_dial_error_on_call() {
    let pipe = InProcessPipe::new();
    pipe.close();

    let channel = GrpcChannel::builder()
        .insecure()
        .in_process(&pipe)
        .connect("bufnet")
        .await
        .unwrap();

    let status = GreeterClient::new(channel).say_hello("lattice").await.unwrap_err();
    assert_ne!(status.code(), tonic::Code::Ok);
}

#[tokio::test]
async fn test_cleanup_is_idempotent() {
    let pipe = InProcessPipe::new();
    let mut host = greeter_host(ServiceHostBuilder::new());

    host.cleanup().await;
    assert_eq!(host.state(), ServiceHostState::Idle);

    host.start_in_process(&pipe).unwrap();
    assert_eq!(host.state(), ServiceHostState::Serving);

    host.cleanup().await;
    host.cleanup().await;
    assert_eq!(host.state(), ServiceHostState::Stopped);
    assert!(host.listener().is_none());
    assert!(pipe.is_closed());
}

#[tokio::test]
async fn test_cleanup_waits_for_grace_period_only() {
    let pipe = InProcessPipe::new();
    let mut host = greeter_host(ServiceHostBuilder::new().grace_period(Duration::from_millis(200)));
    host.start_in_process(&pipe).unwrap();

    // An idle client connection must not hold cleanup past the grace period.
    let channel = GrpcChannel::builder()
        .insecure()
        .in_process(&pipe)
        .block()
        .connect("bufnet")
        .await
        .unwrap();

    let started = tokio::time::Instant::now();
    host.cleanup().await;
    assert!(started.elapsed() < Duration::from_secs(2));
    assert_eq!(host.state(), ServiceHostState::Stopped);
    drop(channel);
}

#[tokio::test]
async fn test_blocking_dial_without_host_fails() {
    let pipe = InProcessPipe::new();

    let started = tokio::time::Instant::now();
    let result = GrpcChannel::builder()
        .insecure()
        .in_process(&pipe)
        .context(DialContext::with_timeout(Duration::from_millis(500)))
        .block()
        .connect("bufnet")
        .await;

    assert!(matches!(result, Err(GrpcError::Dial(_))));
    assert!(started.elapsed() >= Duration::from_millis(400));
}

#[tokio::test]
async fn test_closing_pipe_fails_waiting_dial() {
    let pipe = InProcessPipe::new();

    let dial = tokio::spawn({
        let builder = GrpcChannel::builder().insecure().in_process(&pipe).block();
        async move { builder.connect("bufnet").await }
    });
    tokio::time::sleep(Duration::from_millis(100)).await;
    pipe.close();

    let result = tokio::time::timeout(Duration::from_secs(2), dial)
        .await
        .expect("dial should end once the pipe closes")
        .unwrap();
    assert!(matches!(result, Err(GrpcError::Dial(_))));
}

#[tokio::test]
async fn test_blocking_dial_waits_for_late_host() {
    let pipe = InProcessPipe::new();

    let dial = tokio::spawn({
        let builder = GrpcChannel::builder()
            .insecure()
            .in_process(&pipe)
            .context(DialContext::with_timeout(Duration::from_secs(5)))
            .block();
        async move { builder.connect("bufnet").await }
    });
    tokio::time::sleep(Duration::from_millis(100)).await;

    let mut host = greeter_host(ServiceHostBuilder::new());
    host.start_in_process(&pipe).unwrap();

    let channel = dial.await.unwrap().unwrap();
    let reply = GreeterClient::new(channel).say_hello("lattice").await.unwrap();
    assert_eq!(reply.message, GREETING);

    host.cleanup().await;
}

#[tokio::test]
async fn test_cleanup_lets_in_flight_call_finish() {
    let pipe = InProcessPipe::new();
    let mut host = greeter_host(ServiceHostBuilder::new().interceptor(Delay(Duration::from_millis(300))));
    host.start_in_process(&pipe).unwrap();

    let channel = GrpcChannel::builder()
        .insecure()
        .in_process(&pipe)
        .block()
        .connect("bufnet")
        .await
        .unwrap();
    let mut client = GreeterClient::new(channel);
    let call = tokio::spawn(async move { client.say_hello("slow").await });
    tokio::time::sleep(Duration::from_millis(50)).await;

    host.cleanup().await;
    assert_eq!(host.state(), ServiceHostState::Stopped);

    let reply = call.await.unwrap().unwrap();
    assert_eq!(reply.message, GREETING);
}

#[tokio::test]
async fn test_cleanup_cuts_off_calls_past_grace_period() {
    let pipe = InProcessPipe::new();
    let mut host = greeter_host(
        ServiceHostBuilder::new()
            .grace_period(Duration::from_millis(50))
            .interceptor(Delay(Duration::from_secs(2))),
    );
    host.start_in_process(&pipe).unwrap();

    let channel = GrpcChannel::builder()
        .insecure()
        .in_process(&pipe)
        .block()
        .connect("bufnet")
        .await
        .unwrap();
    let mut client = GreeterClient::new(channel);
    let call = tokio::spawn(async move { client.say_hello("slow").await });
    tokio::time::sleep(Duration::from_millis(50)).await;

    let started = tokio::time::Instant::now();
    host.cleanup().await;
    assert!(started.elapsed() < Duration::from_secs(1));

    let result = tokio::time::timeout(Duration::from_secs(1), call)
        .await
        .expect("cut-off call should fail before the handler would finish")
        .unwrap();
    assert!(result.is_err());
}
