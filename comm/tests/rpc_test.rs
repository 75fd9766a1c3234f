use std::{
    sync::{Arc, Once, Weak},
    time::{Duration, Instant},
};

use mesh_comm::{
    memory_pair, CallError, CarriesInvocationId, InvocationIdGenerator, MessageEndpoint,
    MessageEndpointListener, QueuedMessageEndpoint, RetryPolicy, WaitForResponseEndpoint,
};
use parking_lot::Mutex;
use tracing_subscriber::{
    filter::LevelFilter, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter,
};

static INIT: Once = Once::new();

fn init_test_logging() {
    INIT.call_once(|| {
        let _ = tracing_subscriber::registry()
            .with(tracing_subscriber::fmt::layer())
            .with(
                EnvFilter::builder()
                    .with_default_directive(LevelFilter::INFO.into())
                    .from_env_lossy(),
            )
            .try_init();
    });
}

#[derive(Debug, Clone, Default, PartialEq)]
struct Envelope {
    request_id: Option<u64>,
    response_id: Option<u64>,
    body: String,
}

impl Envelope {
    fn new(body: &str) -> Self {
        Self {
            body: body.to_string(),
            ..Default::default()
        }
    }
}

impl CarriesInvocationId for Envelope {
    fn request_id(&self) -> Option<u64> {
        self.request_id
    }

    fn set_request_id(&mut self, id: u64) {
        self.request_id = Some(id);
    }

    fn response_id(&self) -> Option<u64> {
        self.response_id
    }

    fn set_response_id(&mut self, id: u64) {
        self.response_id = Some(id);
    }
}

/// Answers every request except those whose body is "ignore".
struct Responder {
    endpoint: Weak<QueuedMessageEndpoint<Envelope>>,
}

impl MessageEndpointListener<Envelope> for Responder {
    fn message_received(&self, _endpoint: &str, message: Envelope) {
        let (Some(request_id), Some(endpoint)) = (message.request_id, self.endpoint.upgrade())
        else {
            return;
        };
        if message.body == "ignore" {
            return;
        }
        let mut reply = Envelope::new(&format!("re:{}", message.body));
        reply.set_response_id(request_id);
        endpoint.enqueue_message_for_send(reply).unwrap();
    }
}

struct Harness {
    rpc: Arc<WaitForResponseEndpoint<Envelope>>,
    local: Arc<QueuedMessageEndpoint<Envelope>>,
    partner: Arc<QueuedMessageEndpoint<Envelope>>,
    link: mesh_comm::LinkControl,
}

fn harness(retry: RetryPolicy, respond: bool) -> Harness {
    let (local, partner, link) = memory_pair::<Envelope>("local", "partner", retry);
    if respond {
        partner
            .add_listener(Arc::new(Responder {
                endpoint: Arc::downgrade(&partner),
            }))
            .forget();
    }
    let endpoint: Arc<dyn MessageEndpoint<Envelope>> = local.clone();
    let rpc = WaitForResponseEndpoint::new(
        endpoint,
        Arc::new(InvocationIdGenerator::new()),
        Duration::from_secs(5),
    );
    local.start_communicating();
    partner.start_communicating();
    Harness {
        rpc,
        local,
        partner,
        link,
    }
}

#[tokio::test]
async fn test_call_returns_matching_response() {
    init_test_logging();
    let h = harness(RetryPolicy::default(), true);

    let response = h.rpc.call(Envelope::new("ping")).await.unwrap();
    assert_eq!(response.body, "re:ping");
    assert_eq!(h.rpc.pending_count(), 0);
}

#[tokio::test]
async fn test_concurrent_calls_get_their_own_responses() {
    init_test_logging();
    let h = harness(RetryPolicy::default(), true);

    let handles: Vec<_> = (0..10)
        .map(|i| {
            let rpc = Arc::clone(&h.rpc);
            tokio::spawn(async move { rpc.call(Envelope::new(&format!("q{i}"))).await })
        })
        .collect();
    for (i, handle) in handles.into_iter().enumerate() {
        let response = handle.await.unwrap().unwrap();
        assert_eq!(response.body, format!("re:q{i}"));
    }
    assert_eq!(h.rpc.pending_count(), 0);
}

#[tokio::test]
async fn test_silent_partner_times_out_promptly() {
    init_test_logging();
    let h = harness(RetryPolicy::default(), false);

    let started = Instant::now();
    let first = h
        .rpc
        .call_with_timeout(Envelope::new("hello"), Duration::from_millis(100))
        .await;
    let elapsed = started.elapsed();
    assert!(elapsed >= Duration::from_millis(90), "returned after {elapsed:?}");
    assert!(elapsed < Duration::from_secs(1), "returned after {elapsed:?}");

    let Err(CallError::Timeout {
        invocation_id: first_id,
        result_arrived,
    }) = first
    else {
        panic!("expected timeout, got {first:?}");
    };
    assert!(!result_arrived);
    assert_eq!(h.rpc.pending_count(), 0);

    let second = h
        .rpc
        .call_with_timeout(Envelope::new("again"), Duration::from_millis(20))
        .await;
    let Err(CallError::Timeout {
        invocation_id: second_id,
        ..
    }) = second
    else {
        panic!("expected timeout, got {second:?}");
    };
    assert!(second_id > first_id);
}

#[tokio::test]
async fn test_ignored_request_times_out_while_others_succeed() {
    init_test_logging();
    let h = harness(RetryPolicy::default(), true);

    let ignored = h
        .rpc
        .call_with_timeout(Envelope::new("ignore"), Duration::from_millis(50))
        .await;
    assert!(matches!(ignored, Err(CallError::Timeout { .. })));

    let answered = h.rpc.call(Envelope::new("after")).await.unwrap();
    assert_eq!(answered.body, "re:after");
}

#[tokio::test]
async fn test_disabling_error_fails_pending_calls() {
    init_test_logging();
    let h = harness(RetryPolicy::fixed(1, Duration::from_millis(10)), true);
    h.link.set_reachable(false);

    let started = Instant::now();
    let result = h.rpc.call(Envelope::new("lost")).await;
    assert!(
        matches!(result, Err(CallError::EndpointDisabled { .. })),
        "got {result:?}"
    );
    assert!(started.elapsed() < Duration::from_secs(2));
    assert_eq!(h.rpc.pending_count(), 0);
    assert!(h.local.is_dead());

    let refused = h.rpc.call(Envelope::new("refused")).await;
    assert!(matches!(refused, Err(CallError::Send(_))));
    assert_eq!(h.rpc.pending_count(), 0);
}

#[tokio::test]
async fn test_unsolicited_messages_reach_other_handler() {
    init_test_logging();
    let h = harness(RetryPolicy::default(), false);
    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&seen);
    h.rpc
        .set_other_message_handler(move |_endpoint, message: Envelope| sink.lock().push(message.body));

    h.partner
        .enqueue_message_for_send(Envelope::new("news"))
        .unwrap();
    let mut stale = Envelope::new("stale reply");
    stale.set_response_id(42);
    h.partner.enqueue_message_for_send(stale).unwrap();

    let deadline = Instant::now() + Duration::from_secs(5);
    while seen.lock().len() < 2 {
        assert!(Instant::now() < deadline);
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    assert_eq!(
        *seen.lock(),
        vec!["news".to_string(), "stale reply".to_string()]
    );
}

#[tokio::test]
async fn test_requests_are_not_taken_for_responses() {
    init_test_logging();
    let h = harness(RetryPolicy::default(), false);

    let mut request = Envelope::new("ping");
    request.set_request_id(7);
    assert_eq!(h.rpc.complete(request.clone()), Some(request));
    assert_eq!(h.rpc.complete(Envelope::new("plain")), Some(Envelope::new("plain")));
}

#[tokio::test]
async fn test_abandoned_call_leaves_no_pending_entry() {
    init_test_logging();
    let h = harness(RetryPolicy::default(), false);

    let outer = tokio::time::timeout(
        Duration::from_millis(20),
        h.rpc
            .call_with_timeout(Envelope::new("slow"), Duration::from_secs(10)),
    )
    .await;
    assert!(outer.is_err());
    assert_eq!(h.rpc.pending_count(), 0);
}
