//! Cross-module scenarios: proxy → invocation → loopback connection →
//! dispatch pipeline → registry and back.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

use errant_wire::{
    BATCH_COUNT_OFFSET, Context, EncodingVersion, Identity, InputStream, InvocationMode,
    OutputStream, REPLY_STATUS_OFFSET, ReplyStatus, RequestHeader, RequestId, begin_batch,
    begin_request, finish_message, read_message_header,
};

use crate::errors::decode_reply;
use crate::invocation::Outcome;
use crate::{
    Connection, Connector, Current, DispatchInterceptor, DispatchOutcome, DispatchPipeline,
    ErrantError, InvocationCompletion, InvocationTimeout, LoopbackConnection, LoopbackConnector,
    OperationSpec, OutgoingRequest, Proxy, ProxyReference, RequestFailedInfo, SendStatus, Servant,
    ServantMap, ServantResult, UserError,
};

// ============================================================================
// Fixtures
// ============================================================================

/// One servant, many operations: the behaviors the scenarios need.
#[derive(Default)]
struct TestServant {
    dispatched: AtomicUsize,
}

impl Servant for TestServant {
    fn dispatch(&self, current: &Current, input: &mut InputStream<'_>) -> ServantResult {
        self.dispatched.fetch_add(1, Ordering::SeqCst);
        match current.operation.as_str() {
            "ping" => ServantResult::ok(Vec::new()),
            "echo" => {
                let text = match input.read_string() {
                    Ok(text) => text,
                    Err(error) => return ServantResult::error(error.into()),
                };
                let mut out = OutputStream::new();
                out.write_string(&text);
                ServantResult::ok(out.into_bytes())
            }
            "fail" => ServantResult::error(ErrantError::User(UserError::new(
                "::demo::Oops",
                b"detail".to_vec(),
            ))),
            "slow" => ServantResult::deferred(async {
                tokio::time::sleep(Duration::from_millis(500)).await;
                Ok(Vec::new())
            }),
            _ => ServantResult::error(ErrantError::operation_not_exist(current.failed_info())),
        }
    }
}

fn init_tracing() {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();
}

struct Fixture {
    servant: Arc<TestServant>,
    pipeline: Arc<DispatchPipeline>,
}

impl Fixture {
    fn new() -> Self {
        Self::with_registry(Arc::new(ServantMap::new()))
    }

    fn with_registry(registry: Arc<ServantMap>) -> Self {
        init_tracing();
        let servant = Arc::new(TestServant::default());
        registry.add(Identity::named("test"), servant.clone());
        let pipeline = Arc::new(DispatchPipeline::new(registry, "TestAdapter"));
        Self { servant, pipeline }
    }

    fn proxy(&self, reference: ProxyReference) -> Proxy {
        Proxy::new(reference, Arc::new(LoopbackConnector::new(self.pipeline.clone())))
    }

    fn dispatched(&self) -> usize {
        self.servant.dispatched.load(Ordering::SeqCst)
    }
}

fn twoway_ref(name: &str) -> ProxyReference {
    ProxyReference::new(Identity::named(name))
}

fn encode_request(
    request_id: RequestId,
    identity: &Identity,
    facet: Option<&str>,
    operation: &str,
    mode: InvocationMode,
    params: &[u8],
) -> Vec<u8> {
    let mut out = OutputStream::new();
    begin_request(&mut out, request_id);
    RequestHeader::write_body(&mut out, identity, facet, operation, mode, &Context::new());
    out.write_encaps(EncodingVersion::V1_0, params);
    finish_message(&mut out);
    out.into_bytes()
}

fn response_bytes(outcome: DispatchOutcome) -> Vec<u8> {
    match outcome {
        DispatchOutcome::Response(bytes) => bytes,
        other => panic!("expected a response, got {other:?}"),
    }
}

async fn wait_for_dispatches(fixture: &Fixture, expected: usize) {
    for _ in 0..200 {
        if fixture.dispatched() == expected {
            return;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!(
        "servant saw {} dispatches, expected {expected}",
        fixture.dispatched()
    );
}

// ============================================================================
// End-to-end request/reply
// ============================================================================

#[tokio::test]
async fn twoway_ping_returns_ok_with_empty_encaps() {
    let fixture = Fixture::new();
    let proxy = fixture.proxy(twoway_ref("test"));

    let payload = proxy
        .invoke(&OperationSpec::new("ping"), &[], None)
        .await
        .unwrap();
    assert!(payload.is_empty());
    assert_eq!(fixture.dispatched(), 1);
}

#[tokio::test]
async fn echo_roundtrips_marshaled_parameters() {
    let fixture = Fixture::new();
    let proxy = fixture.proxy(twoway_ref("test"));

    let mut params = OutputStream::new();
    params.write_string("salutations");

    let payload = proxy
        .invoke(
            &OperationSpec::new("echo").returning(),
            params.as_slice(),
            None,
        )
        .await
        .unwrap();

    let mut reply = InputStream::new(&payload);
    assert_eq!(reply.read_string().unwrap(), "salutations");
}

#[tokio::test]
async fn oneway_ping_completes_on_send_with_no_reply_bytes() {
    let fixture = Fixture::new();

    // At the pipeline level a oneway request yields an explicit no-response.
    let message = encode_request(
        RequestId::NONE,
        &Identity::named("test"),
        None,
        "ping",
        InvocationMode::Oneway,
        &[],
    );
    let outcome = fixture.pipeline.dispatch_message(&message, None).unwrap();
    assert!(matches!(outcome, DispatchOutcome::NoResponse));

    // And the client call returns as soon as the send completes.
    let proxy = fixture.proxy(twoway_ref("test").with_mode(InvocationMode::Oneway));
    let payload = proxy
        .invoke(&OperationSpec::new("ping"), &[], None)
        .await
        .unwrap();
    assert!(payload.is_empty());
    wait_for_dispatches(&fixture, 2).await;
}

#[tokio::test]
async fn reply_status_byte_is_at_the_fixed_offset_for_success_and_failure() {
    let fixture = Fixture::new();

    let ok = response_bytes(
        fixture
            .pipeline
            .dispatch_message(
                &encode_request(
                    RequestId::new(1),
                    &Identity::named("test"),
                    None,
                    "ping",
                    InvocationMode::Twoway,
                    &[],
                ),
                None,
            )
            .unwrap(),
    );
    assert_eq!(ok[REPLY_STATUS_OFFSET], ReplyStatus::Ok.as_u8());

    // Success reply carries an empty encapsulation.
    let mut input = InputStream::new(&ok);
    read_message_header(&mut input).unwrap();
    input.read_i32().unwrap();
    input.read_u8().unwrap();
    let (_, body) = input.read_encaps().unwrap();
    assert!(body.is_empty());

    let failed = response_bytes(
        fixture
            .pipeline
            .dispatch_message(
                &encode_request(
                    RequestId::new(2),
                    &Identity::named("nobody"),
                    None,
                    "ping",
                    InvocationMode::Twoway,
                    &[],
                ),
                None,
            )
            .unwrap(),
    );
    assert_eq!(
        failed[REPLY_STATUS_OFFSET],
        ReplyStatus::ObjectNotExist.as_u8()
    );
}

// ============================================================================
// Call-shape validation
// ============================================================================

#[tokio::test]
async fn result_bearing_operation_on_oneway_reference_fails_before_the_wire() {
    let fixture = Fixture::new();
    let proxy = fixture.proxy(twoway_ref("test").with_mode(InvocationMode::Oneway));

    let error = proxy
        .invoke(&OperationSpec::new("echo").returning(), &[], None)
        .await
        .unwrap_err();
    assert!(matches!(error, ErrantError::TwowayOnly { .. }));

    // Nothing reached the wire: no dispatch, no handler resolved.
    assert_eq!(fixture.dispatched(), 0);
    assert!(proxy.current_handler().is_none());
}

// ============================================================================
// Not-found tie-breaks
// ============================================================================

#[tokio::test]
async fn not_found_tie_breaks_distinguish_object_facet_and_operation() {
    let registry = Arc::new(ServantMap::new());
    registry.add_facet(
        Identity::named("faceted"),
        "admin",
        Arc::new(TestServant::default()),
    );
    let fixture = Fixture::with_registry(registry);

    // Unregistered identity.
    let proxy = fixture.proxy(twoway_ref("ghost"));
    let error = proxy
        .invoke(&OperationSpec::new("ping"), &[], None)
        .await
        .unwrap_err();
    match error {
        ErrantError::ObjectNotExist(info) => {
            assert_eq!(info.identity, Identity::named("ghost"));
            assert_eq!(info.operation, "ping");
        }
        other => panic!("expected ObjectNotExist, got {other}"),
    }

    // Identity registered, but under a different facet.
    let proxy = fixture.proxy(twoway_ref("faceted"));
    let error = proxy
        .invoke(&OperationSpec::new("ping"), &[], None)
        .await
        .unwrap_err();
    assert!(matches!(error, ErrantError::FacetNotExist(_)));

    // Servant and facet match, operation unknown.
    let proxy = fixture.proxy(twoway_ref("test"));
    let error = proxy
        .invoke(&OperationSpec::new("levitate"), &[], None)
        .await
        .unwrap_err();
    match error {
        ErrantError::OperationNotExist(info) => assert_eq!(info.operation, "levitate"),
        other => panic!("expected OperationNotExist, got {other}"),
    }
}

// ============================================================================
// User exceptions
// ============================================================================

#[tokio::test]
async fn declared_user_exception_reaches_the_caller_intact() {
    let fixture = Fixture::new();
    let proxy = fixture.proxy(twoway_ref("test"));

    let error = proxy
        .invoke(
            &OperationSpec::new("fail").with_exception("::demo::Oops"),
            &[],
            None,
        )
        .await
        .unwrap_err();
    assert_eq!(
        error,
        ErrantError::User(UserError::new("::demo::Oops", b"detail".to_vec()))
    );
}

#[tokio::test]
async fn undeclared_user_exception_surfaces_as_unknown_user_with_type_id() {
    let fixture = Fixture::new();
    let proxy = fixture.proxy(twoway_ref("test"));

    let error = proxy
        .invoke(&OperationSpec::new("fail"), &[], None)
        .await
        .unwrap_err();
    match error {
        ErrantError::UnknownUser(message) => assert!(message.contains("::demo::Oops")),
        other => panic!("expected UnknownUser, got {other}"),
    }
}

// ============================================================================
// Retry
// ============================================================================

struct FailingConnection {
    attempts: Arc<AtomicUsize>,
}

impl Connection for FailingConnection {
    fn send_request(&self, _request: OutgoingRequest) -> Result<SendStatus, ErrantError> {
        let attempt = self.attempts.fetch_add(1, Ordering::SeqCst) + 1;
        Err(ErrantError::ConnectionLost(format!("boom #{attempt}")))
    }

    fn cancel(&self, _request_id: RequestId, _reason: ErrantError) {}

    fn timeout(&self) -> Option<Duration> {
        None
    }
}

struct FailingConnector {
    attempts: Arc<AtomicUsize>,
    resolutions: Arc<AtomicUsize>,
}

impl Connector for FailingConnector {
    fn resolve(
        &self,
        _reference: &ProxyReference,
    ) -> std::pin::Pin<
        Box<dyn std::future::Future<Output = Result<Arc<dyn Connection>, ErrantError>> + Send + '_>,
    > {
        self.resolutions.fetch_add(1, Ordering::SeqCst);
        let attempts = self.attempts.clone();
        Box::pin(async move { Ok(Arc::new(FailingConnection { attempts }) as Arc<dyn Connection>) })
    }
}

fn immediate_retries(max_retries: u32) -> crate::RetryPolicy {
    crate::RetryPolicy {
        max_retries,
        initial_backoff: Duration::ZERO,
        ..crate::RetryPolicy::default()
    }
}

#[tokio::test]
async fn transient_failures_yield_n_plus_one_attempts_and_the_last_error() {
    let attempts = Arc::new(AtomicUsize::new(0));
    let resolutions = Arc::new(AtomicUsize::new(0));
    let proxy = Proxy::new(
        twoway_ref("test"),
        Arc::new(FailingConnector {
            attempts: attempts.clone(),
            resolutions: resolutions.clone(),
        }),
    )
    .with_retry_policy(immediate_retries(2));

    let error = proxy
        .invoke(&OperationSpec::new("ping"), &[], None)
        .await
        .unwrap_err();

    assert_eq!(attempts.load(Ordering::SeqCst), 3);
    match error {
        ErrantError::ConnectionLost(message) => assert_eq!(message, "boom #3"),
        other => panic!("expected the last attempt's error, got {other}"),
    }
    // Every attempt cleared the handler and re-resolved.
    assert_eq!(resolutions.load(Ordering::SeqCst), 3);
}

#[tokio::test]
async fn deadline_cuts_the_retry_budget_short() {
    let attempts = Arc::new(AtomicUsize::new(0));
    let proxy = Proxy::new(
        twoway_ref("test").with_invocation_timeout(InvocationTimeout::After(
            Duration::from_millis(120),
        )),
        Arc::new(FailingConnector {
            attempts: attempts.clone(),
            resolutions: Arc::new(AtomicUsize::new(0)),
        }),
    )
    .with_retry_policy(crate::RetryPolicy {
        max_retries: 10,
        initial_backoff: Duration::from_millis(50),
        ..crate::RetryPolicy::default()
    });

    let error = proxy
        .invoke(&OperationSpec::new("ping"), &[], None)
        .await
        .unwrap_err();

    // The final error is the last observed one, not a generic timeout.
    assert!(matches!(error, ErrantError::ConnectionLost(_)));
    let made = attempts.load(Ordering::SeqCst);
    assert!(made >= 1 && made < 11, "made {made} attempts");
}

// ============================================================================
// Handler sharing
// ============================================================================

struct FlakyOnceConnection {
    inner: LoopbackConnection,
    tripped: Arc<AtomicBool>,
}

impl Connection for FlakyOnceConnection {
    fn send_request(&self, request: OutgoingRequest) -> Result<SendStatus, ErrantError> {
        if !self.tripped.swap(true, Ordering::SeqCst) {
            return Err(ErrantError::ConnectionLost("first send fails".to_string()));
        }
        self.inner.send_request(request)
    }

    fn cancel(&self, request_id: RequestId, reason: ErrantError) {
        self.inner.cancel(request_id, reason);
    }

    fn timeout(&self) -> Option<Duration> {
        self.inner.timeout()
    }
}

/// Fails exactly one send across all the connections it produces.
struct FlakyOnceConnector {
    pipeline: Arc<DispatchPipeline>,
    tripped: Arc<AtomicBool>,
    resolutions: Arc<AtomicUsize>,
}

impl Connector for FlakyOnceConnector {
    fn resolve(
        &self,
        _reference: &ProxyReference,
    ) -> std::pin::Pin<
        Box<dyn std::future::Future<Output = Result<Arc<dyn Connection>, ErrantError>> + Send + '_>,
    > {
        self.resolutions.fetch_add(1, Ordering::SeqCst);
        let connection: Arc<dyn Connection> = Arc::new(FlakyOnceConnection {
            inner: LoopbackConnection::new(self.pipeline.clone()),
            tripped: self.tripped.clone(),
        });
        Box::pin(async move { Ok(connection) })
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_failures_settle_on_exactly_one_handler() {
    let fixture = Fixture::new();
    let resolutions = Arc::new(AtomicUsize::new(0));
    let proxy = Arc::new(
        Proxy::new(
            twoway_ref("test"),
            Arc::new(FlakyOnceConnector {
                pipeline: fixture.pipeline.clone(),
                tripped: Arc::new(AtomicBool::new(false)),
                resolutions: resolutions.clone(),
            }),
        )
        .with_retry_policy(immediate_retries(3)),
    );

    let mut calls = Vec::new();
    for _ in 0..2 {
        let proxy = proxy.clone();
        calls.push(tokio::spawn(async move {
            proxy.invoke(&OperationSpec::new("ping"), &[], None).await
        }));
    }
    for call in calls {
        call.await.unwrap().unwrap();
    }

    // Both invocations retried through failures; one handler remains, and a
    // follow-up call reuses it without resolving again.
    let handler = proxy.current_handler().expect("a handler must be installed");
    let resolved_before = resolutions.load(Ordering::SeqCst);
    proxy
        .invoke(&OperationSpec::new("ping"), &[], None)
        .await
        .unwrap();
    assert_eq!(resolutions.load(Ordering::SeqCst), resolved_before);
    assert!(Arc::ptr_eq(
        &proxy.current_handler().expect("handler still installed"),
        &handler
    ));
}

// ============================================================================
// Timeouts and cancellation
// ============================================================================

#[tokio::test]
async fn invocation_deadline_cancels_one_request_and_spares_the_connection() {
    let fixture = Fixture::new();
    let proxy = fixture.proxy(
        twoway_ref("test")
            .with_invocation_timeout(InvocationTimeout::After(Duration::from_millis(50))),
    );

    let error = proxy
        .invoke(&OperationSpec::new("slow").returning(), &[], None)
        .await
        .unwrap_err();
    assert_eq!(error, ErrantError::InvocationTimedOut);

    // The expiry cancelled one request, not the connection: the same proxy
    // keeps its handler and the next call completes over it.
    let handler = proxy.current_handler().expect("handler survives a timeout");
    proxy
        .invoke(&OperationSpec::new("ping"), &[], None)
        .await
        .unwrap();
    assert!(Arc::ptr_eq(
        &proxy.current_handler().expect("handler still installed"),
        &handler
    ));
}

#[tokio::test]
async fn connection_timeout_sentinel_resolves_from_the_connection() {
    let fixture = Fixture::new();
    let connector =
        LoopbackConnector::new(fixture.pipeline.clone()).with_timeout(Duration::from_millis(50));
    let proxy = Proxy::new(
        twoway_ref("test").with_invocation_timeout(InvocationTimeout::UseConnection),
        Arc::new(connector),
    );

    let error = proxy
        .invoke(&OperationSpec::new("slow").returning(), &[], None)
        .await
        .unwrap_err();
    assert_eq!(error, ErrantError::InvocationTimedOut);
}

// ============================================================================
// Batch
// ============================================================================

#[tokio::test]
async fn batched_invocations_stay_queued_until_flush() {
    let fixture = Fixture::new();
    let proxy = fixture.proxy(twoway_ref("test").with_mode(InvocationMode::BatchOneway));

    for _ in 0..3 {
        proxy
            .invoke(&OperationSpec::new("ping"), &[], None)
            .await
            .unwrap();
    }
    assert_eq!(proxy.pending_batch_requests(), 3);
    assert_eq!(fixture.dispatched(), 0);

    proxy.flush_batch_requests().await.unwrap();
    assert_eq!(proxy.pending_batch_requests(), 0);
    wait_for_dispatches(&fixture, 3).await;
}

#[tokio::test]
async fn empty_batch_flush_is_a_no_op() {
    let fixture = Fixture::new();
    let proxy = fixture.proxy(twoway_ref("test").with_mode(InvocationMode::BatchOneway));

    proxy.flush_batch_requests().await.unwrap();
    // Nothing queued, so nothing was resolved or sent.
    assert!(proxy.current_handler().is_none());
    assert_eq!(fixture.dispatched(), 0);
}

#[tokio::test]
async fn batch_stream_continues_past_a_failed_entry() {
    let fixture = Fixture::new();

    let mut out = OutputStream::new();
    begin_batch(&mut out);
    // First entry misses the registry; its parameters must be skipped.
    RequestHeader::write_body(
        &mut out,
        &Identity::named("ghost"),
        None,
        "ping",
        InvocationMode::Oneway,
        &Context::new(),
    );
    out.write_encaps(EncodingVersion::V1_0, b"leftover parameters");
    RequestHeader::write_body(
        &mut out,
        &Identity::named("test"),
        None,
        "ping",
        InvocationMode::Oneway,
        &Context::new(),
    );
    out.write_encaps(EncodingVersion::V1_0, &[]);
    out.rewrite_i32(BATCH_COUNT_OFFSET, 2);
    finish_message(&mut out);

    let outcome = fixture
        .pipeline
        .dispatch_message(&out.into_bytes(), None)
        .unwrap();
    assert!(matches!(outcome, DispatchOutcome::NoResponse));
    assert_eq!(fixture.dispatched(), 1);
}

// ============================================================================
// Interceptors and start_over
// ============================================================================

struct RedoInterceptor {
    redone: AtomicBool,
}

impl DispatchInterceptor for RedoInterceptor {
    fn dispatch(
        &self,
        pipeline: &DispatchPipeline,
        request: &mut crate::IncomingRequest<'_, '_>,
    ) -> Result<(), ErrantError> {
        request.start_over(); // checkpoint
        pipeline.run(request)?;
        if !self.redone.swap(true, Ordering::SeqCst) {
            // Redo once; the doubled call exercises rewind idempotency.
            request.start_over();
            request.start_over();
            pipeline.run(request)?;
        }
        Ok(())
    }
}

#[tokio::test]
async fn interceptor_start_over_redoes_the_dispatch() {
    let servant = Arc::new(TestServant::default());
    let registry = Arc::new(ServantMap::new());
    registry.add(Identity::named("test"), servant.clone());
    let pipeline = Arc::new(
        DispatchPipeline::new(registry, "TestAdapter").with_interceptor(Arc::new(
            RedoInterceptor {
                redone: AtomicBool::new(false),
            },
        )),
    );

    let proxy = Proxy::new(
        twoway_ref("test"),
        Arc::new(LoopbackConnector::new(pipeline)),
    );
    let payload = proxy
        .invoke(&OperationSpec::new("ping"), &[], None)
        .await
        .unwrap();
    assert!(payload.is_empty());
    assert_eq!(servant.dispatched.load(Ordering::SeqCst), 2);
}

// ============================================================================
// Servant locators
// ============================================================================

struct CountingLocator {
    servant: Arc<dyn Servant>,
    located: AtomicUsize,
    finished: AtomicUsize,
    finished_error: Option<ErrantError>,
}

impl crate::ServantLocator for CountingLocator {
    fn locate(
        &self,
        _current: &Current,
    ) -> Result<Option<(Arc<dyn Servant>, Option<crate::LocatorCookie>)>, ErrantError> {
        self.located.fetch_add(1, Ordering::SeqCst);
        Ok(Some((self.servant.clone(), Some(Box::new(42u32)))))
    }

    fn finished(
        &self,
        _current: &Current,
        _servant: &Arc<dyn Servant>,
        cookie: Option<crate::LocatorCookie>,
    ) -> Result<(), ErrantError> {
        let cookie = cookie.and_then(|cookie| cookie.downcast::<u32>().ok());
        assert_eq!(cookie.as_deref(), Some(&42));
        self.finished.fetch_add(1, Ordering::SeqCst);
        match &self.finished_error {
            Some(error) => Err(error.clone()),
            None => Ok(()),
        }
    }
}

struct RaisingLocator {
    error: ErrantError,
}

impl crate::ServantLocator for RaisingLocator {
    fn locate(
        &self,
        _current: &Current,
    ) -> Result<Option<(Arc<dyn Servant>, Option<crate::LocatorCookie>)>, ErrantError> {
        Err(self.error.clone())
    }

    fn finished(
        &self,
        _current: &Current,
        _servant: &Arc<dyn Servant>,
        _cookie: Option<crate::LocatorCookie>,
    ) -> Result<(), ErrantError> {
        Ok(())
    }
}

#[tokio::test]
async fn locator_resolves_categorized_identities_and_finished_always_runs() {
    let registry = Arc::new(ServantMap::new());
    let locator = Arc::new(CountingLocator {
        servant: Arc::new(TestServant::default()),
        located: AtomicUsize::new(0),
        finished: AtomicUsize::new(0),
        finished_error: None,
    });
    registry.add_locator("virtual", locator.clone());
    let pipeline = Arc::new(DispatchPipeline::new(registry, "TestAdapter"));
    let proxy = Proxy::new(
        ProxyReference::new(Identity::new("anything", "virtual")),
        Arc::new(LoopbackConnector::new(pipeline)),
    );

    proxy
        .invoke(&OperationSpec::new("ping"), &[], None)
        .await
        .unwrap();
    assert_eq!(locator.located.load(Ordering::SeqCst), 1);
    assert_eq!(locator.finished.load(Ordering::SeqCst), 1);

    // finished() runs when the operation raises, too.
    let error = proxy
        .invoke(
            &OperationSpec::new("fail").with_exception("::demo::Oops"),
            &[],
            None,
        )
        .await
        .unwrap_err();
    assert!(matches!(error, ErrantError::User(_)));
    assert_eq!(locator.finished.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn locator_raised_user_exception_marshals_as_a_normal_reply() {
    let registry = Arc::new(ServantMap::new());
    registry.set_default_locator(Arc::new(RaisingLocator {
        error: ErrantError::User(UserError::new("::demo::Oops", b"from locate".to_vec())),
    }));
    let pipeline = Arc::new(DispatchPipeline::new(registry, "TestAdapter"));
    let proxy = Proxy::new(
        twoway_ref("anything"),
        Arc::new(LoopbackConnector::new(pipeline)),
    );

    let error = proxy
        .invoke(
            &OperationSpec::new("ping").with_exception("::demo::Oops"),
            &[],
            None,
        )
        .await
        .unwrap_err();
    assert_eq!(
        error,
        ErrantError::User(UserError::new("::demo::Oops", b"from locate".to_vec()))
    );
}

#[tokio::test]
async fn locator_finished_failure_replaces_the_outcome() {
    let registry = Arc::new(ServantMap::new());
    let locator = Arc::new(CountingLocator {
        servant: Arc::new(TestServant::default()),
        located: AtomicUsize::new(0),
        finished: AtomicUsize::new(0),
        finished_error: Some(ErrantError::Unknown("cleanup failed".to_string())),
    });
    registry.set_default_locator(locator);
    let pipeline = Arc::new(DispatchPipeline::new(registry, "TestAdapter"));
    let proxy = Proxy::new(
        twoway_ref("anything"),
        Arc::new(LoopbackConnector::new(pipeline)),
    );

    let error = proxy
        .invoke(&OperationSpec::new("ping"), &[], None)
        .await
        .unwrap_err();
    match error {
        ErrantError::Unknown(message) => assert!(message.contains("cleanup failed")),
        other => panic!("expected Unknown, got {other}"),
    }
}

// ============================================================================
// Protocol failures
// ============================================================================

#[tokio::test]
async fn garbage_message_is_fatal_to_the_loopback_connection() {
    let fixture = Fixture::new();
    let connection = LoopbackConnection::new(fixture.pipeline.clone());

    let completion = Arc::new(InvocationCompletion::new(
        true,
        RequestId::new(9),
        RequestFailedInfo::default(),
        Vec::new(),
    ));
    completion.mark_in_progress();
    connection
        .send_request(OutgoingRequest {
            request_id: RequestId::new(9),
            message: b"not a message".to_vec().into(),
            expects_response: true,
            completion: completion.clone(),
        })
        .unwrap();

    match completion.settled().await {
        Outcome::Error(ErrantError::Marshal(_)) => {}
        _ => panic!("expected a marshal failure"),
    }
    assert!(connection.is_closed());

    // Never retried on the same connection: new sends are refused.
    let retry = connection.send_request(OutgoingRequest {
        request_id: RequestId::new(10),
        message: b"still not a message".to_vec().into(),
        expects_response: true,
        completion: Arc::new(InvocationCompletion::new(
            true,
            RequestId::new(10),
            RequestFailedInfo::default(),
            Vec::new(),
        )),
    });
    assert!(matches!(retry, Err(ErrantError::ConnectionLost(_))));
}

#[tokio::test]
async fn dispatching_a_reply_message_is_rejected() {
    let fixture = Fixture::new();
    let mut out = OutputStream::new();
    errant_wire::begin_reply(&mut out, RequestId::new(1));
    finish_message(&mut out);

    let error = fixture
        .pipeline
        .dispatch_message(&out.into_bytes(), None)
        .unwrap_err();
    assert!(matches!(error, ErrantError::Protocol(_)));
}

// ============================================================================
// Deferred dispatch
// ============================================================================

#[tokio::test]
async fn deferred_servant_reply_reaches_the_caller() {
    let registry = Arc::new(ServantMap::new());

    struct DeferredEcho;
    impl Servant for DeferredEcho {
        fn dispatch(&self, _current: &Current, input: &mut InputStream<'_>) -> ServantResult {
            let text = match input.read_string() {
                Ok(text) => text,
                Err(error) => return ServantResult::error(error.into()),
            };
            ServantResult::deferred(async move {
                tokio::task::yield_now().await;
                let mut out = OutputStream::new();
                out.write_string(&text);
                Ok(out.into_bytes())
            })
        }
    }

    registry.add(Identity::named("deferred"), Arc::new(DeferredEcho));
    let pipeline = Arc::new(DispatchPipeline::new(registry, "TestAdapter"));
    let proxy = Proxy::new(
        twoway_ref("deferred"),
        Arc::new(LoopbackConnector::new(pipeline)),
    );

    let mut params = OutputStream::new();
    params.write_string("later");
    let payload = proxy
        .invoke(
            &OperationSpec::new("echo").returning(),
            params.as_slice(),
            None,
        )
        .await
        .unwrap();
    let mut reply = InputStream::new(&payload);
    assert_eq!(reply.read_string().unwrap(), "later");
}

// ============================================================================
// Reply decoding against the pipeline
// ============================================================================

#[tokio::test]
async fn request_failed_reply_decodes_with_the_full_triple() {
    let fixture = Fixture::new();
    let reply = response_bytes(
        fixture
            .pipeline
            .dispatch_message(
                &encode_request(
                    RequestId::new(5),
                    &Identity::named("ghost"),
                    Some("side"),
                    "vanish",
                    InvocationMode::Twoway,
                    &[],
                ),
                None,
            )
            .unwrap(),
    );

    let error = decode_reply(
        &reply,
        RequestId::new(5),
        &RequestFailedInfo::default(),
        &[],
    )
    .unwrap_err();
    match error {
        ErrantError::ObjectNotExist(info) => {
            assert_eq!(info.identity, Identity::named("ghost"));
            assert_eq!(info.facet.as_deref(), Some("side"));
            assert_eq!(info.operation, "vanish");
        }
        other => panic!("expected ObjectNotExist, got {other}"),
    }
}
