#![allow(dead_code)]

use async_trait::async_trait;
use axum::body::Body;
use axum::http::{Request, Response};
use outcall_calls::{create_call, create_module, CreateCallParams, CreateModuleParams, NewQuestion};
use outcall_db::{create_pool, run_migrations, DbRuntimeSettings};
use outcall_dialog::IntentClassifier;
use outcall_server::api_monitor::MonitorHub;
use outcall_server::config::Config;
use outcall_server::dialer::{CallControl, DialError, OutboundCall};
use outcall_server::middleware::RateLimiter;
use outcall_server::registry::TtlRegistry;
use outcall_server::{with_conn, AppState};
use outcall_types::{Call, Customer, VoiceKind};
use outcall_voice::{
    audio_channel, AudioFeed, AudioResolver, LocalAudioCache, RecognitionEvent,
    RecognitionStream, SpeechGateway, SpeechSynthesizer, SqliteArtifactStore, VoiceError,
};
use std::future::Future;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;

pub const MODULE_ID: &str = "refi";
pub const QUESTIONS: [&str; 2] = [
    "How much would you like to borrow?",
    "Is your current rate above five percent?",
];

/// Synthesis is always down, so every line is spoken by the vendor and the
/// rendered documents contain the literal text.
pub struct OfflineSynth;

#[async_trait]
impl SpeechSynthesizer for OfflineSynth {
    async fn synthesize(&self, _text: &str, _voice: VoiceKind) -> Result<Vec<u8>, VoiceError> {
        Err(VoiceError::Synthesis("offline".into()))
    }
}

/// Recognizer whose events are pushed by the test.
#[derive(Default)]
pub struct ScriptedGateway {
    opened: Mutex<Vec<String>>,
    events: Mutex<Option<mpsc::Sender<RecognitionEvent>>>,
    feeds: Mutex<Vec<AudioFeed>>,
}

impl ScriptedGateway {
    pub fn opened(&self) -> Vec<String> {
        self.opened.lock().expect("lock").clone()
    }

    pub fn events(&self) -> Option<mpsc::Sender<RecognitionEvent>> {
        self.events.lock().expect("lock").clone()
    }
}

#[async_trait]
impl SpeechGateway for ScriptedGateway {
    async fn open(&self, call_id: &str) -> Result<RecognitionStream, VoiceError> {
        let (sink, feed) = audio_channel();
        feed.set_open(true);
        let (tx, rx) = mpsc::channel(32);
        self.opened.lock().expect("lock").push(call_id.to_string());
        *self.events.lock().expect("lock") = Some(tx);
        self.feeds.lock().expect("lock").push(feed);
        Ok(RecognitionStream { sink, events: rx })
    }
}

/// Call control that records what it was asked to do.
#[derive(Default)]
pub struct RecordingControl {
    pub placed: Mutex<Vec<OutboundCall>>,
    pub updates: Mutex<Vec<(String, String)>>,
}

impl RecordingControl {
    pub fn updates(&self) -> Vec<(String, String)> {
        self.updates.lock().expect("lock").clone()
    }
}

#[async_trait]
impl CallControl for RecordingControl {
    async fn place_call(&self, call: &OutboundCall) -> Result<String, DialError> {
        let mut placed = self.placed.lock().expect("lock");
        placed.push(call.clone());
        Ok(format!("CA{}", placed.len()))
    }

    async fn update_call(&self, sid: &str, twiml: &str) -> Result<(), DialError> {
        self.updates
            .lock()
            .expect("lock")
            .push((sid.to_string(), twiml.to_string()));
        Ok(())
    }
}

pub struct Harness {
    pub state: AppState,
    pub gateway: Arc<ScriptedGateway>,
    pub control: Arc<RecordingControl>,
    _dir: tempfile::TempDir,
}

impl Harness {
    pub fn router(&self) -> axum::Router {
        outcall_server::app(self.state.clone())
    }

    pub async fn call(&self, call_id: &str) -> Call {
        let call_id = call_id.to_string();
        with_conn(&self.state.pool, move |conn| outcall_calls::get_call(conn, &call_id))
            .await
            .expect("call")
    }

    /// Creates a call for the seeded module.
    pub async fn new_call(&self, name: Option<&str>) -> Call {
        let params = CreateCallParams {
            module_id: MODULE_ID.to_string(),
            customer: Customer {
                id: "cust-1".into(),
                name: name.map(str::to_string),
                phone: Some("+15550100".into()),
            },
            voice: VoiceKind::default(),
        };
        with_conn(&self.state.pool, move |conn| create_call(conn, &params))
            .await
            .expect("create call")
    }

    /// Serves the router on an ephemeral port.
    pub async fn serve(&self) -> SocketAddr {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
            .await
            .expect("bind");
        let addr = listener.local_addr().expect("addr");
        let app = self.router();
        tokio::spawn(async move {
            axum::serve(
                listener,
                app.into_make_service_with_connect_info::<SocketAddr>(),
            )
            .await
            .expect("serve");
        });
        addr
    }
}

pub async fn harness(configure: impl FnOnce(&mut Config)) -> Harness {
    let dir = tempfile::tempdir().expect("tempdir");
    let mut config = Config::default();
    config.server.public_url = "https://calls.example".into();
    config.telephony.validate_signatures = false;
    config.monitor.grace_ms = 50;
    config.audio_cache.dir = dir.path().join("audio");
    configure(&mut config);

    let pool = create_pool(":memory:", DbRuntimeSettings::default()).expect("pool");
    {
        let conn = pool.get().expect("conn");
        run_migrations(&conn).expect("migrations");
        create_module(
            &conn,
            &CreateModuleParams {
                id: MODULE_ID.into(),
                name: "Refinance".into(),
                questions: QUESTIONS
                    .iter()
                    .map(|text| NewQuestion {
                        text: text.to_string(),
                        required: true,
                    })
                    .collect(),
            },
        )
        .expect("module");
    }

    let local = LocalAudioCache::open(&config.audio_cache.dir)
        .await
        .expect("cache");
    let resolver = AudioResolver::new(
        local,
        Arc::new(SqliteArtifactStore::new(pool.clone())),
        Arc::new(OfflineSynth),
        "https://calls.example/audio/",
    );
    let gateway = Arc::new(ScriptedGateway::default());
    let control = Arc::new(RecordingControl::default());

    let config = Arc::new(config);
    let state = AppState {
        pool,
        script: Arc::new(config.dialog.script.clone()),
        resolver: Arc::new(resolver),
        classifier: Arc::new(IntentClassifier::keywords_only()),
        gateway: gateway.clone(),
        call_control: Some(control.clone() as Arc<dyn CallControl>),
        monitor: MonitorHub::new(
            Duration::from_millis(config.monitor.grace_ms),
            config.monitor.observer_buffer,
        ),
        sessions: TtlRegistry::new(Duration::from_secs(config.registry.session_ttl_secs)),
        rate_limiter: RateLimiter::new(),
        config,
    };

    Harness {
        state,
        gateway,
        control,
        _dir: dir,
    }
}

/// Form-encoded vendor webhook request from 127.0.0.1.
pub fn webhook(uri: &str, form: &[(&str, &str)]) -> Request<Body> {
    let mut body = url::form_urlencoded::Serializer::new(String::new());
    for (key, value) in form {
        body.append_pair(key, value);
    }
    Request::builder()
        .method("POST")
        .uri(uri)
        .header("content-type", "application/x-www-form-urlencoded")
        .extension(axum::extract::ConnectInfo(SocketAddr::from((
            [127, 0, 0, 1],
            40000,
        ))))
        .body(Body::from(body.finish()))
        .expect("request")
}

pub fn turn_uri(call_id: &str, step: u32) -> String {
    format!("/voice/turn?step={step}&moduleId={MODULE_ID}&customerId=cust-1&callId={call_id}")
}

pub async fn body_text(resp: Response<Body>) -> String {
    let bytes = axum::body::to_bytes(resp.into_body(), usize::MAX)
        .await
        .expect("body");
    String::from_utf8(bytes.to_vec()).expect("utf8")
}

/// Polls `check` until it returns true or two seconds pass.
pub async fn eventually<F, Fut>(what: &str, mut check: F)
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    for _ in 0..200 {
        if check().await {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("timed out waiting for {what}");
}
