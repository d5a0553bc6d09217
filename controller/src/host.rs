use std::{
    collections::HashMap,
    io::ErrorKind,
    net::SocketAddr,
    path::{Path, PathBuf},
    sync::{
        atomic::{AtomicBool, Ordering},
        mpsc, Arc, Mutex as StdMutex, PoisonError,
    },
    thread,
    time::{Duration, Instant},
};

use anyhow::Context;
use axum::{
    body::Bytes,
    extract::{Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post, put},
    Json, Router,
};
use rumqttc::{AsyncClient, Event, Incoming, MqttOptions, QoS};
use serde::Serialize;
use tokio::{
    net::TcpListener,
    sync::{Mutex, Notify},
};
use tracing::{debug, info, warn};

use fan_common::{
    config::{NetworkConfig, PresenceConfig},
    presence::{spawn_debounce_worker, PresenceEdge},
    store::{StoredValue, NAMESPACE},
    types::AutoConfigUpdate,
    ActuatorError, ConfigCache, ConfigError, DigitalInput, FanActuator, FanControlApi, FanEngine,
    KvStore, MotionDebouncer, MotionSensor, Polarity, PresenceInput, PresenceKind,
    ProximitySensor, RuntimeConfig, StoreError, TemperatureSensor, TOPIC_CONTROLLER_STATE,
};

use crate::routes::{
    auto_view, local_time_of_day, manual_view, parse_manual_value, parse_slot_body,
    parse_slot_id, slot_view, time_status, validate_timezone, ErrorBody, RequestError,
    TimezoneUpdate,
};

type HostApi = FanControlApi<FileStore, SimFan>;

#[derive(Clone)]
struct AppState {
    api: HostApi,
    engine: Arc<Mutex<FanEngine>>,
    timezone: Arc<Mutex<String>>,
    time_synced: Arc<AtomicBool>,
    thermometer: SimThermometer,
    presence: Arc<PresenceInput<SimPin>>,
    sim_presence: Arc<SimPresence>,
    store: AppStore,
}

/// Runtime settings file, kept next to the fan configuration namespace.
#[derive(Clone)]
struct AppStore {
    runtime_path: Arc<PathBuf>,
    lock: Arc<Mutex<()>>,
}

/// One JSON document per namespace, rewritten whole on every change.
#[derive(Debug)]
struct FileStore {
    path: PathBuf,
    lock: StdMutex<()>,
}

#[derive(Debug, Default)]
struct SimFan {
    duty: u8,
}

#[derive(Debug, Clone, Default)]
struct SimPin(Arc<AtomicBool>);

#[derive(Debug, Clone, Default)]
struct SimThermometer(Arc<StdMutex<Option<f32>>>);

/// Drives the simulated presence pin the way the real module would.
#[derive(Debug)]
struct SimPresence {
    pin: SimPin,
    polarity: Polarity,
    raw_edges: Option<StdMutex<mpsc::Sender<bool>>>,
}

pub async fn run() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let data_dir = std::env::var("FAN_DATA_DIR")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("./.fancontrol"));

    let store = AppStore::new(&data_dir);
    let mut runtime = store.load_runtime_config().await.unwrap_or_else(|err| {
        warn!("failed to load runtime config from store: {err:#}");
        RuntimeConfig::default()
    });
    runtime.sanitize();
    if validate_timezone(&runtime.timezone).is_err() {
        warn!(
            "timezone `{}` is unknown; scheduled mode stays off until it is fixed",
            runtime.timezone
        );
    }

    let cache = Arc::new(ConfigCache::new(FileStore::new(
        data_dir.join(format!("{NAMESPACE}.json")),
    )));
    let api = FanControlApi::new(cache, Arc::new(StdMutex::new(SimFan::default())));
    {
        let api = api.clone();
        tokio::task::spawn_blocking(move || {
            api.cache().ensure_loaded();
            api.apply_boot_duty()
        })
        .await
        .context("boot configuration load panicked")?;
    }

    let (presence, sim_presence, presence_edges) = build_presence(&runtime.hardware.presence)?;
    let wake = Arc::new(Notify::new());
    if let Some(edges) = presence_edges {
        spawn_edge_forwarder(edges, Arc::clone(&wake))
            .context("failed to spawn presence edge forwarder")?;
    }
    info!(
        "presence input: {:?} ({:?})",
        runtime.hardware.presence.kind, runtime.hardware.presence.polarity
    );

    let app_state = AppState {
        api,
        engine: Arc::new(Mutex::new(FanEngine::new())),
        timezone: Arc::new(Mutex::new(runtime.timezone.clone())),
        time_synced: Arc::new(AtomicBool::new(false)),
        thermometer: SimThermometer::default(),
        presence: Arc::new(presence),
        sim_presence: Arc::new(sim_presence),
        store,
    };

    spawn_control_loop(
        app_state.clone(),
        Duration::from_millis(runtime.control.period_ms),
        wake,
    );

    if let Some((mqtt, eventloop)) = create_mqtt_client(&runtime.network) {
        spawn_mqtt_loop(eventloop);
        spawn_state_publish_loop(
            app_state.clone(),
            mqtt,
            Duration::from_millis(runtime.control.state_publish_interval_ms),
        );
    } else {
        info!("mqtt disabled (no broker configured)");
    }

    let app = Router::new()
        .route("/api/status", get(handle_get_status))
        .route(
            "/api/manual",
            get(handle_get_manual).post(handle_post_manual),
        )
        .route("/api/auto", get(handle_get_auto).put(handle_put_auto))
        .route(
            "/api/program",
            get(handle_get_program)
                .put(handle_put_program)
                .delete(handle_delete_program),
        )
        .route("/api/program/summary", get(handle_get_program_summary))
        .route("/api/reset", post(handle_post_reset))
        .route("/api/time", get(handle_get_time))
        .route("/api/timezone", put(handle_put_timezone))
        .route("/api/sim", post(handle_post_sim))
        .with_state(app_state);

    let port = std::env::var("CONTROLLER_HTTP_PORT")
        .ok()
        .and_then(|value| value.parse::<u16>().ok())
        .unwrap_or(8080);
    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind controller server at {addr}"))?;

    info!("controller listening on http://{addr}");
    axum::serve(listener, app).await?;
    Ok(())
}

type PresenceParts = (
    PresenceInput<SimPin>,
    SimPresence,
    Option<mpsc::Receiver<PresenceEdge>>,
);

fn build_presence(config: &PresenceConfig) -> anyhow::Result<PresenceParts> {
    let pin = SimPin::default();
    pin.set(config.polarity.raw_level(false));

    match config.kind {
        PresenceKind::Proximity => Ok((
            PresenceInput::Proximity(ProximitySensor::new(pin.clone(), config.polarity)),
            SimPresence {
                pin,
                polarity: config.polarity,
                raw_edges: None,
            },
            None,
        )),
        PresenceKind::Motion => {
            let sensor = MotionSensor::new();
            let (raw_tx, raw_rx) = mpsc::channel();
            let (edge_tx, edge_rx) = mpsc::channel();
            let debouncer = MotionDebouncer::new(
                config.polarity,
                Duration::from_millis(config.debounce_ms),
                Duration::from_millis(config.warmup_ms),
                Instant::now(),
            );
            spawn_debounce_worker(pin.clone(), raw_rx, debouncer, sensor.clone(), Some(edge_tx))
                .context("failed to spawn presence debounce worker")?;

            Ok((
                PresenceInput::Motion(sensor),
                SimPresence {
                    pin,
                    polarity: config.polarity,
                    raw_edges: Some(StdMutex::new(raw_tx)),
                },
                Some(edge_rx),
            ))
        }
    }
}

fn create_mqtt_client(network: &NetworkConfig) -> Option<(AsyncClient, rumqttc::EventLoop)> {
    let mqtt_host = std::env::var("MQTT_HOST").unwrap_or_else(|_| network.mqtt_host.clone());
    if mqtt_host.trim().is_empty() {
        return None;
    }
    let mqtt_port = std::env::var("MQTT_PORT")
        .ok()
        .and_then(|value| value.parse::<u16>().ok())
        .unwrap_or(network.mqtt_port);

    let mut mqtt_options = MqttOptions::new("fan-controller-rust", mqtt_host, mqtt_port);
    let mqtt_user = std::env::var("MQTT_USER").unwrap_or_else(|_| network.mqtt_user.clone());
    let mqtt_pass = std::env::var("MQTT_PASS").unwrap_or_else(|_| network.mqtt_pass.clone());
    if !mqtt_user.is_empty() {
        mqtt_options.set_credentials(mqtt_user, mqtt_pass);
    }

    Some(AsyncClient::new(mqtt_options, 16))
}

fn spawn_mqtt_loop(mut eventloop: rumqttc::EventLoop) {
    tokio::spawn(async move {
        loop {
            match eventloop.poll().await {
                Ok(Event::Incoming(Incoming::ConnAck(_))) => {
                    info!("mqtt connected");
                }
                Ok(_) => {}
                Err(err) => {
                    warn!("mqtt poll error: {err}");
                    tokio::time::sleep(Duration::from_secs(2)).await;
                }
            }
        }
    });
}

/// Turns debounced presence edges into control loop wake-ups. A permit is
/// kept if the loop is mid-tick, so an edge is never slept through.
fn spawn_edge_forwarder(
    edges: mpsc::Receiver<PresenceEdge>,
    wake: Arc<Notify>,
) -> std::io::Result<()> {
    thread::Builder::new()
        .name("presence-edges".to_string())
        .spawn(move || {
            for edge in edges {
                debug!("presence edge (present={}), waking control loop", edge.present);
                wake.notify_one();
            }
        })
        .map(drop)
}

fn spawn_control_loop(app_state: AppState, period: Duration, wake: Arc<Notify>) {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(period);

        loop {
            tokio::select! {
                _ = interval.tick() => {}
                _ = wake.notified() => {}
            }

            let timezone = { app_state.timezone.lock().await.clone() };
            let now = local_time_of_day(&timezone);
            app_state.time_synced.store(now.is_some(), Ordering::Relaxed);

            let mut engine = Arc::clone(&app_state.engine).lock_owned().await;
            let api = app_state.api.clone();
            let presence = Arc::clone(&app_state.presence);
            let mut thermometer = app_state.thermometer.clone();
            // The snapshot can wait on a cache lock held across a disk write.
            let ticked = tokio::task::spawn_blocking(move || {
                engine.tick(
                    api.cache().as_ref(),
                    &mut thermometer,
                    presence.as_ref(),
                    api.actuator().as_ref(),
                    now,
                )
            })
            .await;
            if let Err(err) = ticked {
                warn!("control tick failed: {err}");
            }
        }
    });
}

fn spawn_state_publish_loop(app_state: AppState, mqtt: AsyncClient, period: Duration) {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(period);
        loop {
            interval.tick().await;

            let status = match build_status(&app_state).await {
                Ok(status) => status,
                Err(err) => {
                    warn!("controller state unavailable: {err}");
                    continue;
                }
            };
            match serde_json::to_vec(&status) {
                Ok(body) => {
                    if let Err(err) = mqtt
                        .publish(TOPIC_CONTROLLER_STATE, QoS::AtLeastOnce, true, body)
                        .await
                    {
                        warn!("controller state publish failed: {err}");
                    }
                }
                Err(err) => warn!("controller state serialization failed: {err}"),
            }
        }
    });
}

async fn build_status(state: &AppState) -> Result<fan_common::ControllerStatus, RequestError> {
    let timezone = state.timezone.lock().await.clone();
    let time_synced = state.time_synced.load(Ordering::Relaxed);
    let mode = with_api(state, |api| api.get_mode()).await?;

    let engine = state.engine.lock().await;
    Ok(engine.status(mode, time_synced, &timezone))
}

/// Runs a call against the API off the async workers. Reads included: the
/// cache holds its locks across store writes, which may hit disk.
async fn with_api<T, F>(state: &AppState, op: F) -> Result<T, RequestError>
where
    T: Send + 'static,
    F: FnOnce(&HostApi) -> T + Send + 'static,
{
    let api = state.api.clone();
    tokio::task::spawn_blocking(move || op(&api))
        .await
        .map_err(|err| {
            warn!("configuration task failed: {err}");
            RequestError::Internal
        })
}

async fn run_blocking<T, F>(state: &AppState, op: F) -> Result<T, RequestError>
where
    T: Send + 'static,
    F: FnOnce(&HostApi) -> Result<T, ConfigError> + Send + 'static,
{
    with_api(state, op).await?.map_err(|err| {
        warn!("configuration change incomplete: {err}");
        RequestError::from(err)
    })
}

fn json_or_error<T: Serialize>(result: Result<T, RequestError>) -> Response {
    match result {
        Ok(body) => Json(body).into_response(),
        Err(err) => error_response(&err),
    }
}

async fn handle_get_status(State(state): State<AppState>) -> Response {
    json_or_error(build_status(&state).await)
}

async fn handle_get_manual(State(state): State<AppState>) -> Response {
    json_or_error(with_api(&state, |api| manual_view(api.get_mode(), api.get_manual_duty())).await)
}

async fn handle_post_manual(
    State(state): State<AppState>,
    Query(params): Query<HashMap<String, String>>,
) -> Response {
    let value = match parse_manual_value(params.get("value").map(String::as_str)) {
        Ok(value) => value,
        Err(err) => return error_response(&err),
    };

    match run_blocking(&state, move |api| api.set_manual_duty(value)).await {
        Ok(_) => handle_get_manual(State(state)).await,
        Err(err) => error_response(&err),
    }
}

async fn handle_get_auto(State(state): State<AppState>) -> Response {
    json_or_error(
        with_api(&state, |api| {
            let thresholds = api.get_auto_thresholds();
            auto_view(api.get_mode(), thresholds.tmin, thresholds.tmax)
        })
        .await,
    )
}

async fn handle_put_auto(
    State(state): State<AppState>,
    Json(update): Json<AutoConfigUpdate>,
) -> Response {
    match run_blocking(&state, move |api| {
        api.set_auto_thresholds(update.tmin, update.tmax)
    })
    .await
    {
        Ok(()) => handle_get_auto(State(state)).await,
        Err(err) => error_response(&err),
    }
}

async fn handle_get_program(
    State(state): State<AppState>,
    Query(params): Query<HashMap<String, String>>,
) -> Response {
    match parse_slot_id(params.get("id").map(String::as_str)) {
        Ok(id) => json_or_error(with_api(&state, move |api| slot_view(id, &api.get_slot(id))).await),
        Err(err) => error_response(&err),
    }
}

async fn handle_put_program(State(state): State<AppState>, body: Bytes) -> Response {
    let (id, slot) = match parse_slot_body(&body) {
        Ok(parsed) => parsed,
        Err(err) => return error_response(&err),
    };

    json_or_error(
        run_blocking(&state, move |api| {
            api.set_slot(id, slot)?;
            Ok(slot_view(id, &api.get_slot(id)))
        })
        .await,
    )
}

async fn handle_delete_program(
    State(state): State<AppState>,
    Query(params): Query<HashMap<String, String>>,
) -> Response {
    let id = match parse_slot_id(params.get("id").map(String::as_str)) {
        Ok(id) => id,
        Err(err) => return error_response(&err),
    };

    json_or_error(
        run_blocking(&state, move |api| {
            api.erase_slot(id)?;
            Ok(slot_view(id, &api.get_slot(id)))
        })
        .await,
    )
}

async fn handle_get_program_summary(State(state): State<AppState>) -> Response {
    json_or_error(with_api(&state, |api| api.slot_summaries()).await)
}

async fn handle_post_reset(State(state): State<AppState>) -> Response {
    match run_blocking(&state, |api| api.reset_all()).await {
        Ok(()) => handle_get_status(State(state)).await,
        Err(err) => error_response(&err),
    }
}

async fn handle_get_time(State(state): State<AppState>) -> impl IntoResponse {
    let timezone = state.timezone.lock().await.clone();
    Json(time_status(&timezone))
}

async fn handle_put_timezone(
    State(state): State<AppState>,
    Json(update): Json<TimezoneUpdate>,
) -> Response {
    if let Err(err) = validate_timezone(&update.timezone) {
        return error_response(&err);
    }

    {
        let mut timezone = state.timezone.lock().await;
        *timezone = update.timezone;
    }

    if let Err(err) = persist_runtime_from_state(&state).await {
        warn!("failed to persist timezone update: {err:#}");
        return error_response(&RequestError::NotPersisted);
    }

    handle_get_time(State(state)).await.into_response()
}

#[derive(Debug, Serialize)]
struct SimView {
    temp: Option<f32>,
    presence: bool,
}

/// `temp=nan` simulates a broken thermistor; either parameter may be omitted.
async fn handle_post_sim(
    State(state): State<AppState>,
    Query(params): Query<HashMap<String, String>>,
) -> Response {
    if let Some(raw) = params.get("temp") {
        let Ok(temp) = raw.trim().parse::<f32>() else {
            return error_response(&RequestError::BadParam("temp"));
        };
        state.thermometer.set(temp.is_finite().then_some(temp));
    }

    if let Some(raw) = params.get("presence") {
        let present = match raw.trim() {
            "1" | "true" | "on" => true,
            "0" | "false" | "off" => false,
            _ => return error_response(&RequestError::BadParam("presence")),
        };
        state.sim_presence.set(present);
    }

    Json(SimView {
        temp: state.thermometer.get(),
        presence: state.sim_presence.raw_present(),
    })
    .into_response()
}

fn error_response(err: &RequestError) -> Response {
    let status = StatusCode::from_u16(err.status()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    (status, Json(ErrorBody::from(err))).into_response()
}

async fn persist_runtime_from_state(state: &AppState) -> anyhow::Result<()> {
    let timezone = state.timezone.lock().await.clone();

    let mut runtime = state.store.load_runtime_config().await?;
    runtime.timezone = timezone;
    state.store.save_runtime_config(&runtime).await
}

impl AppStore {
    fn new(data_dir: &Path) -> Self {
        Self {
            runtime_path: Arc::new(data_dir.join("runtime.json")),
            lock: Arc::new(Mutex::new(())),
        }
    }

    async fn load_runtime_config(&self) -> anyhow::Result<RuntimeConfig> {
        let _guard = self.lock.lock().await;
        match tokio::fs::read(self.runtime_path.as_ref()).await {
            Ok(raw) => Ok(serde_json::from_slice::<RuntimeConfig>(&raw)?),
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(RuntimeConfig::default()),
            Err(err) => Err(err.into()),
        }
    }

    async fn save_runtime_config(&self, runtime: &RuntimeConfig) -> anyhow::Result<()> {
        let _guard = self.lock.lock().await;
        let path = self.runtime_path.as_ref().clone();
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let payload = serde_json::to_vec_pretty(runtime)?;
        tokio::fs::write(path, payload).await?;
        Ok(())
    }
}

impl FileStore {
    fn new(path: PathBuf) -> Self {
        Self {
            path,
            lock: StdMutex::new(()),
        }
    }

    fn read_entries(&self) -> Result<HashMap<String, StoredValue>, StoreError> {
        match std::fs::read(&self.path) {
            Ok(raw) => serde_json::from_slice(&raw).map_err(|err| StoreError::Corrupt {
                key: NAMESPACE.to_string(),
                reason: err.to_string(),
            }),
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(HashMap::new()),
            Err(err) => Err(StoreError::Unavailable(err.to_string())),
        }
    }

    /// Temp file plus rename, so a crash mid-write leaves the old document.
    fn write_entries(&self, entries: &HashMap<String, StoredValue>) -> Result<(), StoreError> {
        let unavailable = |err: std::io::Error| StoreError::Unavailable(err.to_string());

        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent).map_err(unavailable)?;
        }
        let payload = serde_json::to_vec_pretty(entries)
            .map_err(|err| StoreError::Unavailable(err.to_string()))?;
        let staging = self.path.with_extension("json.tmp");
        std::fs::write(&staging, payload).map_err(unavailable)?;
        std::fs::rename(&staging, &self.path).map_err(unavailable)
    }

    fn get(&self, key: &str) -> Result<StoredValue, StoreError> {
        let _guard = self.lock.lock().unwrap_or_else(PoisonError::into_inner);
        self.read_entries()?.remove(key).ok_or(StoreError::NotFound)
    }

    fn put(&self, key: &str, value: StoredValue) -> Result<(), StoreError> {
        let _guard = self.lock.lock().unwrap_or_else(PoisonError::into_inner);
        let mut entries = match self.read_entries() {
            Ok(entries) => entries,
            Err(err @ StoreError::Corrupt { .. }) => {
                warn!("{err}; starting a fresh namespace");
                HashMap::new()
            }
            Err(err) => return Err(err),
        };
        entries.insert(key.to_string(), value);
        self.write_entries(&entries)
    }
}

impl KvStore for FileStore {
    fn get_u8(&self, key: &str) -> Result<u8, StoreError> {
        self.get(key)?.as_u8(key)
    }

    fn set_u8(&self, key: &str, value: u8) -> Result<(), StoreError> {
        self.put(key, StoredValue::U8(value))
    }

    fn get_i32(&self, key: &str) -> Result<i32, StoreError> {
        self.get(key)?.as_i32(key)
    }

    fn set_i32(&self, key: &str, value: i32) -> Result<(), StoreError> {
        self.put(key, StoredValue::I32(value))
    }

    fn get_blob(&self, key: &str) -> Result<Vec<u8>, StoreError> {
        self.get(key)?.as_blob(key)
    }

    fn set_blob(&self, key: &str, value: &[u8]) -> Result<(), StoreError> {
        self.put(key, StoredValue::Blob(value.to_vec()))
    }

    fn erase_all(&self) -> Result<(), StoreError> {
        let _guard = self.lock.lock().unwrap_or_else(PoisonError::into_inner);
        match std::fs::remove_file(&self.path) {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(()),
            Err(err) => Err(StoreError::Unavailable(err.to_string())),
        }
    }
}

impl FanActuator for SimFan {
    fn set_duty(&mut self, percent: u8) -> Result<(), ActuatorError> {
        if self.duty != percent {
            info!("fan duty -> {percent}%");
        }
        self.duty = percent;
        Ok(())
    }
}

impl SimPin {
    fn set(&self, high: bool) {
        self.0.store(high, Ordering::Relaxed);
    }
}

impl DigitalInput for SimPin {
    fn is_high(&self) -> bool {
        self.0.load(Ordering::Relaxed)
    }
}

impl SimThermometer {
    fn set(&self, temp: Option<f32>) {
        *self.0.lock().unwrap_or_else(PoisonError::into_inner) = temp;
    }

    fn get(&self) -> Option<f32> {
        *self.0.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl TemperatureSensor for SimThermometer {
    fn read_temperature(&mut self) -> Option<f32> {
        self.get().filter(|temp| temp.is_finite())
    }
}

impl SimPresence {
    fn set(&self, present: bool) {
        let raw = self.polarity.raw_level(present);
        self.pin.set(raw);
        if let Some(raw_edges) = &self.raw_edges {
            let sender = raw_edges.lock().unwrap_or_else(PoisonError::into_inner);
            if sender.send(raw).is_err() {
                warn!("presence debounce worker is gone; edge dropped");
            }
        }
    }

    fn raw_present(&self) -> bool {
        self.polarity.is_present(self.pin.is_high())
    }
}
