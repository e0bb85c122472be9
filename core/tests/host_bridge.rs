// core/tests/host_bridge.rs
//
// Integration tests for the host facade and the ordered bridge.
//
// Tests cover:
// - Issuance-order execution with out-of-order awaiting
// - Result-to-caller mapping for concurrent callers
// - Engine errors, panics and malformed results rejecting only their own call
// - Event delivery and unsubscription
// - Worker startup failure and shutdown on drop

use async_trait::async_trait;
use bytes::Bytes;
use rimehost_core::{
    Candidate, CandidatePage, Config, DeployStatus, Error, Event, EventKind, InputBuffer,
    InputStatus, MemFs, Notifier, Phase, RimeApi, RimeHost, SchemaSource,
};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

struct NoSource;

#[async_trait]
impl SchemaSource for NoSource {
    fn locate(&self, file: &str) -> String {
        format!("none://{}", file)
    }

    async fn fetch(&self, file: &str) -> rimehost_core::Result<Bytes> {
        Err(Error::Transport {
            url: self.locate(file),
            reason: "no source".into(),
        })
    }
}

/// Echo engine: commits every key sequence it is given, with a few
/// sequences reserved for misbehaviour.
#[derive(Default)]
struct EchoEngine {
    log: Arc<Mutex<Vec<String>>>,
    notifier: Option<Notifier>,
}

impl RimeApi for EchoEngine {
    fn init(&mut self) -> anyhow::Result<bool> {
        Ok(true)
    }

    fn deploy(&mut self) -> anyhow::Result<bool> {
        if let Some(n) = &self.notifier {
            n.notify("deploy", "start");
            n.notify("deploy", "success");
        }
        Ok(true)
    }

    fn process_key(&mut self, input: &str) -> anyhow::Result<String> {
        self.log.lock().unwrap().push(input.to_string());
        match input {
            "{bad-json}" => Ok(r#"{"isComposing":true}"#.to_string()),
            "{throw}" => anyhow::bail!("engine threw"),
            "{panic}" => panic!("engine fault"),
            "{toggle}" => {
                if let Some(n) = &self.notifier {
                    n.notify("option", "!ascii_mode");
                }
                Ok(InputStatus::idle().to_json())
            }
            "{compose}" => {
                let menu = CandidatePage {
                    candidates: vec![Candidate::new("你").with_label("1."), Candidate::new("尼")],
                    page: 0,
                    is_last_page: true,
                    highlighted_index: 0,
                };
                Ok(InputStatus::composing(InputBuffer::new("", "ni", ""), menu).to_json())
            }
            other => Ok(InputStatus::idle().with_committed(other).to_json()),
        }
    }

    fn select_candidate(&mut self, index: usize) -> anyhow::Result<String> {
        Ok(InputStatus::idle().with_committed(format!("#{index}")).to_json())
    }

    fn delete_candidate(&mut self, _index: usize) -> anyhow::Result<String> {
        Ok(InputStatus::idle().to_json())
    }

    fn flip_page(&mut self, _backward: bool) -> anyhow::Result<String> {
        Ok(InputStatus::idle().to_json())
    }

    fn clear_input(&mut self) -> anyhow::Result<String> {
        Ok(InputStatus::idle().to_json())
    }

    fn set_notifier(&mut self, notifier: Notifier) {
        self.notifier = Some(notifier);
    }
}

fn config() -> Config {
    Config {
        cache_path: None,
        ..Config::default()
    }
}

async fn start(log: Arc<Mutex<Vec<String>>>) -> RimeHost {
    RimeHost::initialize(&config(), MemFs::new(), NoSource, move || {
        Ok(EchoEngine {
            log,
            notifier: None,
        })
    })
    .await
    .expect("engine worker should start")
}

#[tokio::test]
async fn calls_run_in_issuance_order() {
    let log = Arc::new(Mutex::new(Vec::new()));
    let host = start(log.clone()).await;

    let keys: Vec<String> = (0..16).map(|i| format!("k{i}")).collect();
    let pending: Vec<_> = keys.iter().map(|k| host.process_key(k.as_str())).collect();

    // Await newest first
    let mut results = Vec::new();
    for p in pending.into_iter().rev() {
        results.push(p.await.unwrap());
    }
    results.reverse();

    for (key, status) in keys.iter().zip(&results) {
        assert_eq!(status.committed(), Some(key.as_str()));
    }
    assert_eq!(*log.lock().unwrap(), keys);
    assert_eq!(host.phase(), Phase::Idle);
}

#[tokio::test]
async fn concurrent_callers_get_their_own_results() {
    let log = Arc::new(Mutex::new(Vec::new()));
    let host = Arc::new(start(log.clone()).await);

    let mut threads = Vec::new();
    for t in 0..4 {
        let host = Arc::clone(&host);
        threads.push(std::thread::spawn(move || {
            (0..10)
                .map(|i| {
                    let key = format!("t{t}-{i}");
                    (key.clone(), host.process_key(key))
                })
                .collect::<Vec<_>>()
        }));
    }

    let mut issued = Vec::new();
    for thread in threads {
        issued.extend(thread.join().unwrap());
    }
    for (key, pending) in issued {
        assert_eq!(pending.await.unwrap().committed(), Some(key.as_str()));
    }

    let log = log.lock().unwrap();
    assert_eq!(log.len(), 40);
    // Each caller's own calls reach the engine in the order it issued them
    for t in 0..4 {
        let prefix = format!("t{t}-");
        let mine: Vec<&String> = log.iter().filter(|k| k.starts_with(&prefix)).collect();
        let expected: Vec<String> = (0..10).map(|i| format!("t{t}-{i}")).collect();
        assert_eq!(mine, expected.iter().collect::<Vec<_>>());
    }
}

#[tokio::test]
async fn failures_reject_only_their_call() {
    let log = Arc::new(Mutex::new(Vec::new()));
    let host = start(log.clone()).await;

    let before = host.process_key("a");
    let malformed = host.process_key("{bad-json}");
    let thrown = host.process_key("{throw}");
    let panicked = host.process_key("{panic}");
    let after = host.process_key("b");

    assert_eq!(before.await.unwrap().committed(), Some("a"));
    assert!(matches!(malformed.await, Err(Error::Decode(_))));
    match thrown.await {
        Err(Error::Engine(message)) => assert!(message.contains("engine threw")),
        other => panic!("expected engine error, got {:?}", other),
    }
    assert!(matches!(panicked.await, Err(Error::Engine(_))));
    assert_eq!(after.await.unwrap().committed(), Some("b"));
    assert_eq!(log.lock().unwrap().len(), 5);
}

#[tokio::test]
async fn composition_results_are_decoded_and_pushed() {
    let host = start(Arc::default()).await;
    let pushed = Arc::new(Mutex::new(Vec::new()));
    let sink = pushed.clone();
    let sub = host.subscribe(EventKind::InputStatusChanged, move |event| {
        if let Event::InputStatusChanged(status) = event {
            sink.lock().unwrap().push(status.clone());
        }
    });

    let status = host.process_key("{compose}").await.unwrap();
    let composing = status.composition.as_ref().expect("composing");
    assert_eq!(composing.input_buffer.active, "ni");
    assert_eq!(composing.menu.len(), 2);
    assert_eq!(composing.menu.candidates[1].display_label(1), "2.");

    let selected = host.select_candidate(1).await.unwrap();
    assert_eq!(selected.committed(), Some("#1"));

    // The push precedes the result on the same channel
    assert_eq!(*pushed.lock().unwrap(), vec![status, selected]);
    assert!(sub.unsubscribe());
    assert!(!host.events().has_entry(EventKind::InputStatusChanged));
}

#[tokio::test]
async fn engine_notifications_reach_subscribers() {
    let host = start(Arc::default()).await;
    let deploys = Arc::new(Mutex::new(Vec::new()));
    let options = Arc::new(AtomicUsize::new(0));

    let sink = deploys.clone();
    let deploy_sub = host.subscribe(EventKind::DeployStatusChanged, move |event| {
        if let Event::DeployStatusChanged(status) = event {
            sink.lock().unwrap().push(*status);
        }
    });
    let counter = options.clone();
    let option_sub = host.subscribe(EventKind::OptionChanged, move |event| {
        assert_eq!(
            event,
            &Event::OptionChanged {
                name: "ascii_mode".into(),
                enabled: false
            }
        );
        counter.fetch_add(1, Ordering::SeqCst);
    });

    assert!(host.deploy().await.unwrap());
    host.process_key("{toggle}").await.unwrap();
    assert_eq!(
        *deploys.lock().unwrap(),
        vec![DeployStatus::Start, DeployStatus::Success]
    );
    assert_eq!(options.load(Ordering::SeqCst), 1);

    assert!(option_sub.unsubscribe());
    host.process_key("{toggle}").await.unwrap();
    assert_eq!(options.load(Ordering::SeqCst), 1);
    assert_eq!(deploy_sub.kind(), EventKind::DeployStatusChanged);
}

#[tokio::test]
async fn factory_failure_fails_initialize() {
    let result = RimeHost::initialize(&config(), MemFs::new(), NoSource, || {
        Err::<EchoEngine, _>(anyhow::anyhow!("wasm module missing"))
    })
    .await;
    match result {
        Err(Error::WorkerStart(reason)) => assert!(reason.contains("wasm module missing")),
        other => panic!("expected worker start failure, got {:?}", other),
    }
}

#[tokio::test]
async fn in_flight_call_completes_after_drop() {
    let host = start(Arc::default()).await;
    let deployed = host.deploy();
    drop(host);
    assert!(deployed.await.unwrap());
}
