use std::{
    collections::BTreeMap,
    io::ErrorKind,
    net::SocketAddr,
    path::{Path, PathBuf},
    sync::Arc,
    time::Duration,
};

use anyhow::Context;
use axum::{
    body::Bytes,
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        State,
    },
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use tokio::{
    io::{AsyncBufReadExt, BufReader},
    net::TcpListener,
    sync::{broadcast, watch, Mutex},
    time::MissedTickBehavior,
};
use tower_http::services::ServeDir;
use tracing::{debug, info, warn};

use hotwater_common::{
    ApiRequest, BootReport, BootSource, ControllerEvent, ErrorBody, HardwareClock,
    HeatingController, KeyValueStore, MemoryStore, RelayOutputs, RelayPins, RelayState,
    RuntimeConfig, StoreError, StoredValue,
};

use crate::clock::{parse_clock_start, SystemClock};

const RUNTIME_FILE: &str = "runtime.json";
const STATE_FILE: &str = "state.json";
const HOST_DEFAULT_HTTP_PORT: u16 = 8080;
const BROADCAST_CAPACITY: usize = 16;
const SIMULATED_PRESS: Duration = Duration::from_millis(50);

#[derive(Clone)]
struct AppState {
    controller: Arc<Mutex<HeatingController<FileStore>>>,
    updates: broadcast::Sender<String>,
}

pub async fn run() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let data_dir = std::env::var("HOTWATER_DATA_DIR")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("./.hotwater"));

    let mut runtime = load_runtime_config(&data_dir.join(RUNTIME_FILE))
        .await
        .unwrap_or_else(|err| {
            warn!("failed to load runtime config: {err:#}");
            host_runtime_defaults()
        });
    runtime.sanitize();

    let mut clock = SystemClock::new(&runtime.timezone).or_else(|err| {
        warn!("{err:#}; using UTC");
        SystemClock::new("UTC")
    })?;
    if let Ok(raw) = std::env::var("HOTWATER_CLOCK_START") {
        match parse_clock_start(&raw) {
            Ok(start) => {
                clock.set(start);
                info!("clock set to {raw} ({})", clock.timezone());
            }
            Err(err) => warn!("{err:#}"),
        }
    }

    let state_path = data_dir.join(STATE_FILE);
    let store = FileStore::open(state_path.clone()).await.unwrap_or_else(|err| {
        warn!("failed to open state store: {err:#}");
        FileStore::empty(state_path)
    });

    let (controller, report) =
        HeatingController::new(runtime.boost.clone(), store, clock.now().current_time());
    log_boot_report(&report);

    let (updates, _) = broadcast::channel(BROADCAST_CAPACITY);
    let app_state = AppState {
        controller: Arc::new(Mutex::new(controller)),
        updates,
    };

    let button = spawn_simulated_button();
    spawn_button_loop(app_state.clone(), button, runtime.timing.button_tick_ms);
    spawn_relay_loop(app_state.clone(), runtime.timing.relay_tick_ms);
    spawn_schedule_loop(app_state.clone(), clock);

    let web_root = std::env::var("HOTWATER_WEB_ROOT")
        .unwrap_or_else(|_| format!("{}/web", env!("CARGO_MANIFEST_DIR")));
    let app = Router::new()
        .route("/api", post(handle_api))
        .route("/websocket", get(handle_websocket))
        .fallback_service(ServeDir::new(web_root))
        .with_state(app_state);

    let port = std::env::var("CONTROLLER_HTTP_PORT")
        .ok()
        .and_then(|value| value.parse::<u16>().ok())
        .unwrap_or(runtime.http_port);
    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind controller server at {addr}"))?;

    info!("controller listening on http://{addr}");
    axum::serve(listener, app).await?;
    Ok(())
}

fn host_runtime_defaults() -> RuntimeConfig {
    RuntimeConfig {
        http_port: HOST_DEFAULT_HTTP_PORT,
        ..RuntimeConfig::default()
    }
}

async fn load_runtime_config(path: &Path) -> anyhow::Result<RuntimeConfig> {
    match tokio::fs::read(path).await {
        Ok(raw) => serde_json::from_slice::<RuntimeConfig>(&raw)
            .with_context(|| format!("invalid runtime config {}", path.display())),
        Err(err) if err.kind() == ErrorKind::NotFound => Ok(host_runtime_defaults()),
        Err(err) => Err(err.into()),
    }
}

fn log_boot_report(report: &BootReport) {
    match &report.source {
        BootSource::Persisted => info!("loaded persisted schedule"),
        BootSource::Defaults => info!("no persisted schedule, using defaults"),
    }
    for key in &report.gaps {
        warn!("persisted key `{key}` missing, unreadable or out of range, using default");
    }
}

fn log_events<S: KeyValueStore>(controller: &mut HeatingController<S>) {
    for event in controller.drain_events() {
        match event {
            ControllerEvent::BoostStarted {
                source,
                countdown_secs,
            } => info!("boost started from {source:?}: {countdown_secs}s"),
            ControllerEvent::BoostExtended { countdown_secs } => {
                info!("boost extended: {countdown_secs}s")
            }
            ControllerEvent::BoostCancelled { source } => info!("boost cancelled from {source:?}"),
            ControllerEvent::BoostExpired => info!("boost expired"),
            ControllerEvent::HeatingEnabledChanged(enabled) => {
                info!("heating enabled: {enabled}")
            }
            ControllerEvent::IsHeatingChanged(heating) => info!("heating demand: {heating}"),
            ControllerEvent::TimerUpdated { timer_number, slot } => info!(
                "timer {timer_number} set: days {:#04x} {}-{}",
                slot.days.bits(),
                slot.on_minute,
                slot.off_minute
            ),
            ControllerEvent::PersistFailed(err) => warn!("failed to persist heating state: {err}"),
        }
    }
}

/// Reads `b` lines from stdin as button presses. No GPIO on the host.
fn spawn_simulated_button() -> watch::Receiver<bool> {
    let (pressed, receiver) = watch::channel(false);
    tokio::spawn(async move {
        let mut lines = BufReader::new(tokio::io::stdin()).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            if line.trim() != "b" {
                continue;
            }
            debug!("simulated button press");
            let _ = pressed.send(true);
            tokio::time::sleep(SIMULATED_PRESS).await;
            let _ = pressed.send(false);
        }
    });
    receiver
}

fn spawn_button_loop(app_state: AppState, button: watch::Receiver<bool>, period_ms: u64) {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(Duration::from_millis(period_ms));
        interval.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            interval.tick().await;
            // Active low.
            let level = !*button.borrow();

            let mut controller = app_state.controller.lock().await;
            controller.button_tick(level);
            log_events(&mut *controller);
        }
    });
}

fn spawn_relay_loop(app_state: AppState, period_ms: u64) {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(Duration::from_millis(period_ms));
        let mut pins = LoggedRelayPins::default();
        let mut last_state = RelayState::Off;

        loop {
            interval.tick().await;

            let (outputs, state) = {
                let mut controller = app_state.controller.lock().await;
                (controller.relay_tick(), controller.relay_state())
            };

            if state != last_state {
                info!("relay {last_state:?} -> {state:?}");
                last_state = state;
            }
            pins.apply(outputs);
        }
    });
}

fn spawn_schedule_loop(app_state: AppState, clock: SystemClock) {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(Duration::from_secs(1));

        loop {
            interval.tick().await;
            let now = clock.now().current_time();

            let payload = {
                let mut controller = app_state.controller.lock().await;
                controller.schedule_tick(now);
                log_events(&mut *controller);
                controller.take_broadcast()
            };

            let Some(payload) = payload else {
                continue;
            };
            match serde_json::to_string(&payload) {
                // No subscribers is not an error.
                Ok(body) => {
                    let _ = app_state.updates.send(body);
                }
                Err(err) => warn!("status serialization failed: {err}"),
            }
        }
    });
}

async fn handle_api(State(state): State<AppState>, body: Bytes) -> axum::response::Response {
    let mut controller = state.controller.lock().await;
    dispatch(&mut *controller, &body)
}

fn dispatch<S: KeyValueStore>(
    controller: &mut HeatingController<S>,
    body: &[u8],
) -> axum::response::Response {
    let request = match ApiRequest::from_json(body) {
        Ok(request) => request,
        Err(err) => {
            warn!("rejected api request: {err:?}");
            return error_response(StatusCode::BAD_REQUEST, &err.to_string());
        }
    };

    let action = request.action();
    let result = controller.execute(request);
    log_events(controller);

    match result {
        Ok(reply) => Json(reply).into_response(),
        Err(err) => {
            warn!("{action} rejected: {err}");
            let status = StatusCode::from_u16(err.http_status())
                .unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
            error_response(status, &err.to_string())
        }
    }
}

async fn handle_websocket(
    upgrade: WebSocketUpgrade,
    State(state): State<AppState>,
) -> impl IntoResponse {
    upgrade.on_upgrade(move |socket| serve_subscriber(socket, state))
}

async fn serve_subscriber(mut socket: WebSocket, state: AppState) {
    let mut updates = state.updates.subscribe();
    state.controller.lock().await.attach_subscriber();
    info!("websocket subscriber attached");

    loop {
        tokio::select! {
            update = updates.recv() => match update {
                Ok(body) => {
                    if socket.send(Message::Text(body.into())).await.is_err() {
                        break;
                    }
                }
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    debug!("websocket subscriber skipped {skipped} updates");
                    state.controller.lock().await.attach_subscriber();
                }
                Err(broadcast::error::RecvError::Closed) => break,
            },
            incoming = socket.recv() => match incoming {
                Some(Ok(Message::Close(_))) | Some(Err(_)) | None => break,
                Some(Ok(_)) => {}
            },
        }
    }

    info!("websocket subscriber detached");
}

fn error_response(status: StatusCode, message: &str) -> axum::response::Response {
    (status, Json(ErrorBody::new(message))).into_response()
}

/// Relay lines on a machine without GPIO: edges are logged.
#[derive(Debug, Default)]
struct LoggedRelayPins {
    levels: RelayOutputs,
}

impl RelayPins for LoggedRelayPins {
    fn set_trigger(&mut self, level: bool) {
        if self.levels.trigger != level {
            debug!("relay trigger line -> {level}");
            self.levels.trigger = level;
        }
    }

    fn set_hold(&mut self, level: bool) {
        if self.levels.hold != level {
            debug!("relay hold line -> {level}");
            self.levels.hold = level;
        }
    }
}

/// Flash NVS stand-in: one JSON object on disk, replaced whole on commit.
#[derive(Debug)]
struct FileStore {
    path: PathBuf,
    entries: MemoryStore,
}

impl FileStore {
    fn empty(path: PathBuf) -> Self {
        Self {
            path,
            entries: MemoryStore::new(),
        }
    }

    async fn open(path: PathBuf) -> anyhow::Result<Self> {
        let entries = match tokio::fs::read(&path).await {
            Ok(raw) => serde_json::from_slice::<BTreeMap<String, StoredValue>>(&raw)
                .with_context(|| format!("invalid state file {}", path.display()))?,
            Err(err) if err.kind() == ErrorKind::NotFound => BTreeMap::new(),
            Err(err) => return Err(err).with_context(|| format!("failed to read {}", path.display())),
        };

        Ok(Self {
            path,
            entries: MemoryStore::from_entries(entries),
        })
    }

    fn write(&self, entries: &BTreeMap<String, StoredValue>) -> anyhow::Result<()> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let payload = serde_json::to_vec_pretty(entries)?;
        let staging = self.path.with_extension("json.tmp");
        std::fs::write(&staging, payload)?;
        std::fs::rename(&staging, &self.path)?;
        Ok(())
    }
}

impl KeyValueStore for FileStore {
    fn get_u16(&self, key: &str) -> Result<Option<u16>, StoreError> {
        self.entries.get_u16(key)
    }

    fn get_bool(&self, key: &str) -> Result<Option<bool>, StoreError> {
        self.entries.get_bool(key)
    }

    fn set_u16(&mut self, key: &str, value: u16) -> Result<(), StoreError> {
        self.entries.set_u16(key, value)
    }

    fn set_bool(&mut self, key: &str, value: bool) -> Result<(), StoreError> {
        self.entries.set_bool(key, value)
    }

    fn remove(&mut self, key: &str) -> Result<(), StoreError> {
        self.entries.remove(key)
    }

    fn commit(&mut self) -> Result<(), StoreError> {
        self.write(&self.entries.staged_view())
            .map_err(|err| StoreError::Commit(format!("{}: {err:#}", self.path.display())))?;
        self.entries.commit()
    }

    fn discard(&mut self) {
        self.entries.discard();
    }
}
