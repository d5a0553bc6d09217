use core::{convert::TryInto, num::NonZeroU32};
use std::{
    sync::{
        atomic::{AtomicBool, Ordering},
        mpsc::{self, RecvTimeoutError},
        Arc, Mutex, PoisonError,
    },
    thread,
    time::{Duration, Instant},
};

use anyhow::{anyhow, Context};
use embedded_svc::{
    http::{Headers, Method},
    io::{Read, Write},
    mqtt::client::{EventPayload, QoS},
    wifi::{AuthMethod, ClientConfiguration, Configuration},
};
use esp_idf_hal::{
    adc::{
        attenuation::DB_11,
        oneshot::{config::AdcChannelConfig, AdcChannelDriver, AdcDriver},
        ADC1,
    },
    delay::BLOCK,
    gpio::{AnyIOPin, AnyOutputPin, Gpio2, Input, InterruptType, PinDriver, Pull},
    ledc::{config::TimerConfig, LedcDriver, LedcTimerDriver, Resolution},
    task::notification::Notification,
    units::Hertz,
};
use esp_idf_svc::{
    eventloop::EspSystemEventLoop,
    hal::{modem::Modem, prelude::Peripherals},
    http::server::{Configuration as HttpConfiguration, EspHttpConnection, EspHttpServer, Request},
    log::EspLogger,
    mqtt::client::{EspMqttClient, EspMqttConnection, MqttClientConfiguration},
    nvs::{EspDefaultNvsPartition, EspNvs},
    sntp::EspSntp,
    sys::EspError,
    wifi::{BlockingWifi, EspWifi},
};
use log::{debug, info, warn};
use serde::Serialize;

use fan_common::{
    config::{HardwareConfig, NetworkConfig, PresenceConfig},
    ntc::{duty_to_ledc, NtcParams},
    presence::{spawn_debounce_worker, PresenceEdge},
    store::{KEY_AUTO_TMAX, KEY_AUTO_TMIN, KEY_MANUAL_DUTY, KEY_MODE, KEY_SLOTS, NAMESPACE},
    types::AutoConfigUpdate,
    ActuatorError, ConfigCache, ControllerStatus, DigitalInput, FanActuator, FanControlApi,
    FanEngine, KvStore, MotionDebouncer, MotionSensor, PresenceInput, PresenceKind,
    ProximitySensor, RuntimeConfig, StoreError, TemperatureSensor, TOPIC_CONTROLLER_STATE,
};

use crate::routes::{
    auto_view, local_time_of_day, manual_view, parse_manual_value, parse_slot_body,
    parse_slot_id, query_param, slot_view, time_status, validate_timezone, ErrorBody,
    RequestError, TimezoneUpdate,
};

const NVS_RUNTIME_NAMESPACE: &str = "fan_runtime";
const NVS_RUNTIME_KEY: &str = "runtime_json";
const MAX_HTTP_BODY: usize = 1024;
const MAX_BLOB_LEN: usize = 256;
const WATCHDOG_TIMEOUT_SEC: u32 = 30;
const WIFI_CONNECT_ATTEMPTS: u32 = 5;
const WIFI_RETRY_DELAY_MS: u64 = 3_000;

type EspApi = FanControlApi<NvsKvStore, LedcFan>;
type HttpRequest<'r, 'c> = Request<&'r mut EspHttpConnection<'c>>;

#[derive(Clone)]
struct SharedState {
    api: EspApi,
    engine: Arc<Mutex<FanEngine>>,
    timezone: Arc<Mutex<String>>,
    time_synced: Arc<AtomicBool>,
}

/// Fan configuration namespace in the default NVS partition. Every call
/// opens its own handle, so the store is shareable across threads.
#[derive(Clone)]
struct NvsKvStore {
    partition: EspDefaultNvsPartition,
    lock: Arc<Mutex<()>>,
}

/// Device settings in their own namespace; a factory reset leaves them alone.
#[derive(Clone)]
struct RuntimeStore {
    partition: EspDefaultNvsPartition,
    lock: Arc<Mutex<()>>,
}

struct LedcFan {
    driver: LedcDriver<'static>,
    resolution_bits: u8,
}

struct NtcThermometer {
    channel: AdcChannelDriver<'static, Gpio2, AdcDriver<'static, ADC1>>,
    params: NtcParams,
}

/// Shared between the interrupt pump, which re-arms it, and whoever reads
/// the level.
#[derive(Clone)]
struct EspPin(Arc<Mutex<PinDriver<'static, AnyIOPin, Input>>>);

pub fn run() -> anyhow::Result<()> {
    esp_idf_svc::sys::link_patches();
    EspLogger::initialize_default();

    let sys_loop = EspSystemEventLoop::take()?;
    let nvs_partition = EspDefaultNvsPartition::take()?;
    let lock = Arc::new(Mutex::new(()));
    let runtime_store = RuntimeStore {
        partition: nvs_partition.clone(),
        lock: lock.clone(),
    };

    let mut runtime = runtime_store.load().unwrap_or_else(|err| {
        warn!("failed to load runtime config from NVS: {err:#}");
        RuntimeConfig::default()
    });
    runtime.sanitize();
    ensure_wifi_defaults(&mut runtime);

    info!(
        "runtime config loaded: ssid=`{}`, mqtt=`{}:{}`, tz=`{}`",
        runtime.network.wifi_ssid,
        runtime.network.mqtt_host,
        runtime.network.mqtt_port,
        runtime.timezone,
    );

    let Peripherals {
        modem,
        ledc,
        adc1,
        pins,
        ..
    } = Peripherals::take()?;

    let fan = init_fan(ledc.timer0, ledc.channel0, &runtime.hardware)
        .context("fan PWM init failed")?;
    info!(
        "fan PWM on GPIO{} @ {}Hz, {} bit",
        runtime.hardware.fan_pin,
        runtime.hardware.pwm_frequency_hz,
        runtime.hardware.pwm_resolution_bits
    );

    let cache = Arc::new(ConfigCache::new(NvsKvStore {
        partition: nvs_partition.clone(),
        lock,
    }));
    let api = FanControlApi::new(cache, Arc::new(Mutex::new(fan)));
    api.apply_boot_duty();

    let thermometer = match init_thermometer(adc1, pins.gpio2, runtime.hardware.thermistor) {
        Ok(thermometer) => Some(thermometer),
        Err(err) => {
            warn!("NTC init failed, auto curves fall back to 0%: {err:#}");
            None
        }
    };
    let (presence, presence_edges) =
        init_presence(&runtime.hardware.presence).context("presence init failed")?;

    let (wifi, wifi_connected) =
        connect_wifi(modem, sys_loop, nvs_partition, &runtime.network)
            .context("wifi startup failed")?;
    let _sntp = if wifi_connected {
        let sntp = EspSntp::new_default().context("failed to start SNTP")?;
        info!("SNTP initialized");
        Some(sntp)
    } else {
        warn!("running offline; scheduled mode waits for a valid clock");
        None
    };

    init_watchdog(WATCHDOG_TIMEOUT_SEC)?;

    let shared_state = SharedState {
        api,
        engine: Arc::new(Mutex::new(FanEngine::new())),
        timezone: Arc::new(Mutex::new(runtime.timezone.clone())),
        time_synced: Arc::new(AtomicBool::new(false)),
    };

    let mqtt = if wifi_connected && runtime.network.mqtt_enabled() {
        let (client, conn) = create_mqtt_client(&runtime.network)?;
        spawn_mqtt_receiver(conn);
        Some(client)
    } else {
        info!("mqtt disabled");
        None
    };

    spawn_control_loop(
        shared_state.clone(),
        thermometer,
        presence,
        presence_edges,
        mqtt,
        &runtime,
    );

    let server = create_http_server(shared_state, runtime_store)?;

    // Keep services alive for the program lifetime.
    let _wifi = wifi;
    let _server = server;

    loop {
        thread::sleep(Duration::from_secs(60));
    }
}

fn ensure_wifi_defaults(runtime: &mut RuntimeConfig) {
    if runtime.network.wifi_ssid.is_empty() {
        if let Some(ssid) = option_env!("WIFI_SSID") {
            runtime.network.wifi_ssid = ssid.to_string();
        }
    }

    if runtime.network.wifi_pass.is_empty() {
        if let Some(pass) = option_env!("WIFI_PASS") {
            runtime.network.wifi_pass = pass.to_string();
        }
    }
}

fn init_fan(
    timer: esp_idf_hal::ledc::TIMER0,
    channel: esp_idf_hal::ledc::CHANNEL0,
    hardware: &HardwareConfig,
) -> anyhow::Result<LedcFan> {
    let resolution = match hardware.pwm_resolution_bits {
        8 => Resolution::Bits8,
        9 => Resolution::Bits9,
        10 => Resolution::Bits10,
        11 => Resolution::Bits11,
        12 => Resolution::Bits12,
        13 => Resolution::Bits13,
        14 => Resolution::Bits14,
        bits => return Err(anyhow!("unsupported PWM resolution: {bits} bit")),
    };
    let timer = LedcTimerDriver::new(
        timer,
        &TimerConfig::new()
            .frequency(Hertz(hardware.pwm_frequency_hz))
            .resolution(resolution),
    )?;
    let pin = unsafe { AnyOutputPin::new(hardware.fan_pin) };
    let mut driver = LedcDriver::new(channel, timer, pin)?;
    driver.set_duty(0)?;

    Ok(LedcFan {
        driver,
        resolution_bits: hardware.pwm_resolution_bits,
    })
}

fn init_thermometer(adc: ADC1, pin: Gpio2, params: NtcParams) -> anyhow::Result<NtcThermometer> {
    let adc = AdcDriver::new(adc)?;
    let config = AdcChannelConfig {
        attenuation: DB_11,
        ..Default::default()
    };
    let channel = AdcChannelDriver::new(adc, pin, &config)?;
    info!("NTC on ADC1 / GPIO2");
    Ok(NtcThermometer { channel, params })
}

type PresenceParts = (PresenceInput<EspPin>, Option<mpsc::Receiver<PresenceEdge>>);

fn init_presence(config: &PresenceConfig) -> anyhow::Result<PresenceParts> {
    let mut pin = PinDriver::input(unsafe { AnyIOPin::new(config.pin) })?;
    pin.set_pull(Pull::Up)?;

    match config.kind {
        PresenceKind::Proximity => {
            info!("proximity sensor on GPIO{} ({:?})", config.pin, config.polarity);
            let pin = EspPin(Arc::new(Mutex::new(pin)));
            Ok((
                PresenceInput::Proximity(ProximitySensor::new(pin, config.polarity)),
                None,
            ))
        }
        PresenceKind::Motion => {
            pin.set_interrupt_type(InterruptType::AnyEdge)?;
            let pin = EspPin(Arc::new(Mutex::new(pin)));

            let sensor = MotionSensor::new();
            let debouncer = MotionDebouncer::new(
                config.polarity,
                Duration::from_millis(config.debounce_ms),
                Duration::from_millis(config.warmup_ms),
                Instant::now(),
            );
            let (raw_tx, raw_rx) = mpsc::channel();
            let (edge_tx, edge_rx) = mpsc::channel();
            spawn_debounce_worker(pin.clone(), raw_rx, debouncer, sensor.clone(), Some(edge_tx))
                .context("failed to spawn presence debounce worker")?;
            spawn_interrupt_pump(pin, raw_tx)?;
            info!(
                "motion sensor on GPIO{} ({:?}), warm-up {}ms",
                config.pin, config.polarity, config.warmup_ms
            );
            Ok((PresenceInput::Motion(sensor), Some(edge_rx)))
        }
    }
}

/// Forwards every pin interrupt as the level read on wake-up. Edges that
/// land before the task runs collapse into one; the debounce worker re-reads
/// the pin after its delay, so the final level is never missed.
fn spawn_interrupt_pump(pin: EspPin, raw_edges: mpsc::Sender<bool>) -> anyhow::Result<()> {
    thread::Builder::new()
        .name("presence-irq".into())
        .stack_size(4 * 1024)
        .spawn(move || {
            let notification = Notification::new();
            let notifier = notification.notifier();
            let armed = {
                let mut driver = lock(&pin.0);
                let subscribed = unsafe {
                    driver.subscribe(move || {
                        notifier.notify_and_yield(NonZeroU32::MIN);
                    })
                };
                subscribed.and_then(|()| driver.enable_interrupt())
            };
            if let Err(err) = armed {
                warn!("presence interrupt unavailable: {err}");
                return;
            }

            loop {
                notification.wait(BLOCK);
                if raw_edges.send(pin.is_high()).is_err() {
                    warn!("presence debounce worker is gone; interrupt pump stopping");
                    return;
                }
                if let Err(err) = lock(&pin.0).enable_interrupt() {
                    warn!("failed to re-arm presence interrupt: {err}");
                }
            }
        })?;

    Ok(())
}

fn connect_wifi(
    modem: Modem,
    sys_loop: EspSystemEventLoop,
    nvs_partition: EspDefaultNvsPartition,
    network: &NetworkConfig,
) -> anyhow::Result<(EspWifi<'static>, bool)> {
    let mut esp_wifi = EspWifi::new(modem, sys_loop.clone(), Some(nvs_partition))?;

    if network.wifi_ssid.is_empty() {
        warn!("wifi credentials missing; staying offline");
        return Ok((esp_wifi, false));
    }

    let mut wifi = BlockingWifi::wrap(&mut esp_wifi, sys_loop)?;
    let auth_method = if network.wifi_pass.is_empty() {
        AuthMethod::None
    } else {
        AuthMethod::WPAWPA2Personal
    };

    wifi.set_configuration(&Configuration::Client(ClientConfiguration {
        ssid: network
            .wifi_ssid
            .as_str()
            .try_into()
            .map_err(|_| anyhow!("wifi ssid too long"))?,
        password: network
            .wifi_pass
            .as_str()
            .try_into()
            .map_err(|_| anyhow!("wifi password too long"))?,
        auth_method,
        ..Default::default()
    }))?;

    wifi.start()?;
    info!("wifi started, connecting to `{}`", network.wifi_ssid);

    for attempt in 1..=WIFI_CONNECT_ATTEMPTS {
        match wifi.connect().and_then(|()| wifi.wait_netif_up()) {
            Ok(()) => {
                info!("wifi connected on attempt {attempt}");
                drop(wifi);
                return Ok((esp_wifi, true));
            }
            Err(err) => warn!("wifi attempt {attempt}/{WIFI_CONNECT_ATTEMPTS} failed: {err:#}"),
        }

        if attempt < WIFI_CONNECT_ATTEMPTS {
            let _ = wifi.disconnect();
            thread::sleep(Duration::from_millis(WIFI_RETRY_DELAY_MS));
        }
    }

    warn!("all {WIFI_CONNECT_ATTEMPTS} wifi attempts failed; staying offline");
    let _ = wifi.stop();
    drop(wifi);
    Ok((esp_wifi, false))
}

fn create_mqtt_client(
    network: &NetworkConfig,
) -> anyhow::Result<(EspMqttClient<'static>, EspMqttConnection)> {
    let url = format!("mqtt://{}:{}", network.mqtt_host, network.mqtt_port);

    let conf = MqttClientConfiguration {
        client_id: Some("fan-controller"),
        username: (!network.mqtt_user.is_empty()).then_some(network.mqtt_user.as_str()),
        password: (!network.mqtt_pass.is_empty()).then_some(network.mqtt_pass.as_str()),
        ..Default::default()
    };

    Ok(EspMqttClient::new(url.as_str(), &conf)?)
}

/// The connection must be drained for the client to make progress.
fn spawn_mqtt_receiver(mut conn: EspMqttConnection) {
    let spawned = thread::Builder::new()
        .name("mqtt-rx".into())
        .stack_size(6 * 1024)
        .spawn(move || loop {
            match conn.next() {
                Ok(event) => match event.payload() {
                    EventPayload::Connected(_) => info!("mqtt connected"),
                    EventPayload::Disconnected => warn!("mqtt disconnected"),
                    _ => {}
                },
                Err(err) => {
                    warn!("mqtt connection closed: {err:?}");
                    break;
                }
            }
        });

    if let Err(err) = spawned {
        warn!("failed to spawn mqtt receiver: {err}");
    }
}

fn spawn_control_loop(
    state: SharedState,
    mut thermometer: Option<NtcThermometer>,
    presence: PresenceInput<EspPin>,
    mut presence_edges: Option<mpsc::Receiver<PresenceEdge>>,
    mut mqtt: Option<EspMqttClient<'static>>,
    runtime: &RuntimeConfig,
) {
    let period = Duration::from_millis(runtime.control.period_ms);
    let publish_every = Duration::from_millis(runtime.control.state_publish_interval_ms);

    let spawned = thread::Builder::new()
        .name("control-loop".into())
        .stack_size(12 * 1024)
        .spawn(move || {
            if let Err(err) = add_current_task_to_watchdog() {
                warn!("failed to register control loop with watchdog: {err:#}");
            }

            let mut last_publish: Option<Instant> = None;
            loop {
                feed_watchdog();

                let timezone = lock(&state.timezone).clone();
                let now = local_time_of_day(&timezone);
                state.time_synced.store(now.is_some(), Ordering::Relaxed);

                {
                    let mut engine = lock(&state.engine);
                    match thermometer.as_mut() {
                        Some(thermometer) => engine.tick(
                            state.api.cache().as_ref(),
                            thermometer,
                            &presence,
                            state.api.actuator().as_ref(),
                            now,
                        ),
                        None => engine.tick(
                            state.api.cache().as_ref(),
                            &mut NoThermometer,
                            &presence,
                            state.api.actuator().as_ref(),
                            now,
                        ),
                    };
                }

                if let Some(client) = mqtt.as_mut() {
                    if last_publish.map_or(true, |at| at.elapsed() >= publish_every) {
                        last_publish = Some(Instant::now());
                        if let Err(err) = publish_state(&state, client) {
                            warn!("state publish failed: {err:#}");
                        }
                    }
                }

                wait_for_tick(&mut presence_edges, period);
            }
        });

    if let Err(err) = spawned {
        warn!("failed to spawn control loop: {err}");
    }
}

/// Sleeps one control period, cut short by a debounced presence edge.
fn wait_for_tick(edges: &mut Option<mpsc::Receiver<PresenceEdge>>, period: Duration) {
    let Some(receiver) = edges.as_ref() else {
        thread::sleep(period);
        return;
    };

    match receiver.recv_timeout(period) {
        Ok(edge) => debug!("presence edge (present={}), ticking early", edge.present),
        Err(RecvTimeoutError::Timeout) => {}
        Err(RecvTimeoutError::Disconnected) => {
            warn!("presence edge source closed; back to fixed-period ticks");
            *edges = None;
            thread::sleep(period);
        }
    }
}

struct NoThermometer;

impl TemperatureSensor for NoThermometer {
    fn read_temperature(&mut self) -> Option<f32> {
        None
    }
}

fn publish_state(state: &SharedState, mqtt: &mut EspMqttClient<'static>) -> anyhow::Result<()> {
    let payload = serde_json::to_vec(&build_status(state))?;
    mqtt.publish(TOPIC_CONTROLLER_STATE, QoS::AtLeastOnce, true, &payload)?;
    Ok(())
}

fn build_status(state: &SharedState) -> ControllerStatus {
    let timezone = lock(&state.timezone).clone();
    let time_synced = state.time_synced.load(Ordering::Relaxed);
    let mode = state.api.get_mode();
    lock(&state.engine).status(mode, time_synced, &timezone)
}

fn create_http_server(
    state: SharedState,
    runtime_store: RuntimeStore,
) -> anyhow::Result<EspHttpServer<'static>> {
    let conf = HttpConfiguration {
        stack_size: 10 * 1024,
        ..Default::default()
    };

    let mut server = EspHttpServer::new(&conf)?;

    {
        let state = state.clone();
        server.fn_handler("/api/status", Method::Get, move |req| {
            write_json(req, &build_status(&state))
        })?;
    }

    {
        let state = state.clone();
        server.fn_handler("/api/manual", Method::Get, move |req| {
            write_json(
                req,
                &manual_view(state.api.get_mode(), state.api.get_manual_duty()),
            )
        })?;
    }

    {
        let state = state.clone();
        server.fn_handler("/api/manual", Method::Post, move |req| {
            let uri = req.uri().to_string();
            let value = match parse_manual_value(query_param(&uri, "value").as_deref()) {
                Ok(value) => value,
                Err(err) => return write_error(req, &err),
            };

            match state.api.set_manual_duty(value) {
                Ok(duty) => write_json(req, &manual_view(state.api.get_mode(), duty)),
                Err(err) => write_error(req, &RequestError::from(err)),
            }
        })?;
    }

    {
        let state = state.clone();
        server.fn_handler("/api/auto", Method::Get, move |req| {
            let thresholds = state.api.get_auto_thresholds();
            write_json(
                req,
                &auto_view(state.api.get_mode(), thresholds.tmin, thresholds.tmax),
            )
        })?;
    }

    {
        let state = state.clone();
        server.fn_handler("/api/auto", Method::Put, move |mut req| {
            let body = read_request_body(&mut req)?;
            let Ok(update) = serde_json::from_slice::<AutoConfigUpdate>(&body) else {
                return write_error(req, &RequestError::BadBody);
            };

            match state.api.set_auto_thresholds(update.tmin, update.tmax) {
                Ok(()) => {
                    let thresholds = state.api.get_auto_thresholds();
                    write_json(
                        req,
                        &auto_view(state.api.get_mode(), thresholds.tmin, thresholds.tmax),
                    )
                }
                Err(err) => write_error(req, &RequestError::from(err)),
            }
        })?;
    }

    {
        let state = state.clone();
        server.fn_handler("/api/program", Method::Get, move |req| {
            let uri = req.uri().to_string();
            match parse_slot_id(query_param(&uri, "id").as_deref()) {
                Ok(id) => write_json(req, &slot_view(id, &state.api.get_slot(id))),
                Err(err) => write_error(req, &err),
            }
        })?;
    }

    {
        let state = state.clone();
        server.fn_handler("/api/program", Method::Put, move |mut req| {
            let body = read_request_body(&mut req)?;
            let (id, slot) = match parse_slot_body(&body) {
                Ok(parsed) => parsed,
                Err(err) => return write_error(req, &err),
            };

            match state.api.set_slot(id, slot) {
                Ok(()) => write_json(req, &slot_view(id, &state.api.get_slot(id))),
                Err(err) => write_error(req, &RequestError::from(err)),
            }
        })?;
    }

    {
        let state = state.clone();
        server.fn_handler("/api/program", Method::Delete, move |req| {
            let uri = req.uri().to_string();
            let id = match parse_slot_id(query_param(&uri, "id").as_deref()) {
                Ok(id) => id,
                Err(err) => return write_error(req, &err),
            };

            match state.api.erase_slot(id) {
                Ok(()) => write_json(req, &slot_view(id, &state.api.get_slot(id))),
                Err(err) => write_error(req, &RequestError::from(err)),
            }
        })?;
    }

    {
        let state = state.clone();
        server.fn_handler("/api/program/summary", Method::Get, move |req| {
            write_json(req, &state.api.slot_summaries())
        })?;
    }

    {
        let state = state.clone();
        server.fn_handler("/api/reset", Method::Post, move |req| {
            match state.api.reset_all() {
                Ok(()) => write_json(req, &build_status(&state)),
                Err(err) => write_error(req, &RequestError::from(err)),
            }
        })?;
    }

    {
        let state = state.clone();
        server.fn_handler("/api/time", Method::Get, move |req| {
            let timezone = lock(&state.timezone).clone();
            write_json(req, &time_status(&timezone))
        })?;
    }

    {
        let state = state.clone();
        server.fn_handler("/api/timezone", Method::Put, move |mut req| {
            let body = read_request_body(&mut req)?;
            let Ok(update) = serde_json::from_slice::<TimezoneUpdate>(&body) else {
                return write_error(req, &RequestError::BadBody);
            };
            if let Err(err) = validate_timezone(&update.timezone) {
                return write_error(req, &err);
            }

            *lock(&state.timezone) = update.timezone.clone();

            let persisted = runtime_store.load().and_then(|mut runtime| {
                runtime.timezone = update.timezone.clone();
                runtime_store.save(&runtime)
            });
            if let Err(err) = persisted {
                warn!("failed to persist timezone update: {err:#}");
                return write_error(req, &RequestError::NotPersisted);
            }

            write_json(req, &time_status(&update.timezone))
        })?;
    }

    Ok(server)
}

fn read_request_body(req: &mut HttpRequest<'_, '_>) -> anyhow::Result<Vec<u8>> {
    let len = req.content_len().unwrap_or(0) as usize;
    if len > MAX_HTTP_BODY {
        return Err(anyhow!("request body too large"));
    }

    let mut body = vec![0_u8; len];
    if len > 0 {
        req.read_exact(&mut body)?;
    }
    Ok(body)
}

fn write_json<T: Serialize>(req: HttpRequest<'_, '_>, payload: &T) -> anyhow::Result<()> {
    let body = serde_json::to_vec(payload)?;
    req.into_response(
        200,
        Some("OK"),
        &[("Content-Type", "application/json; charset=utf-8")],
    )?
    .write_all(&body)?;
    Ok(())
}

fn write_error(req: HttpRequest<'_, '_>, err: &RequestError) -> anyhow::Result<()> {
    let body = serde_json::to_vec(&ErrorBody::from(err))?;
    req.into_response(
        err.status(),
        None,
        &[("Content-Type", "application/json; charset=utf-8")],
    )?
    .write_all(&body)?;
    Ok(())
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl RuntimeStore {
    fn load(&self) -> anyhow::Result<RuntimeConfig> {
        let _guard = lock(&self.lock);
        let nvs = EspNvs::new(self.partition.clone(), NVS_RUNTIME_NAMESPACE, true)?;
        let mut buffer = vec![0_u8; 2048];

        match nvs.get_str(NVS_RUNTIME_KEY, &mut buffer)? {
            Some(value) => Ok(serde_json::from_str::<RuntimeConfig>(value)?),
            None => Ok(RuntimeConfig::default()),
        }
    }

    fn save(&self, runtime: &RuntimeConfig) -> anyhow::Result<()> {
        let _guard = lock(&self.lock);
        let mut nvs = EspNvs::new(self.partition.clone(), NVS_RUNTIME_NAMESPACE, true)?;
        let payload = serde_json::to_string(runtime)?;
        nvs.set_str(NVS_RUNTIME_KEY, &payload)?;
        Ok(())
    }
}

impl NvsKvStore {
    fn with_namespace<T>(
        &self,
        op: impl FnOnce(&mut EspNvs<esp_idf_svc::nvs::NvsDefault>) -> Result<T, EspError>,
        key: &str,
    ) -> Result<T, StoreError> {
        let _guard = lock(&self.lock);
        let mut nvs = EspNvs::new(self.partition.clone(), NAMESPACE, true)
            .map_err(|err| StoreError::Unavailable(err.to_string()))?;
        op(&mut nvs).map_err(|err| store_error(key, err))
    }
}

fn store_error(key: &str, err: EspError) -> StoreError {
    if err.code() == esp_idf_svc::sys::ESP_ERR_NVS_TYPE_MISMATCH as i32 {
        StoreError::TypeMismatch {
            key: key.to_string(),
        }
    } else {
        StoreError::Unavailable(err.to_string())
    }
}

impl KvStore for NvsKvStore {
    fn get_u8(&self, key: &str) -> Result<u8, StoreError> {
        self.with_namespace(|nvs| nvs.get_u8(key), key)?
            .ok_or(StoreError::NotFound)
    }

    fn set_u8(&self, key: &str, value: u8) -> Result<(), StoreError> {
        self.with_namespace(|nvs| nvs.set_u8(key, value), key)
    }

    fn get_i32(&self, key: &str) -> Result<i32, StoreError> {
        self.with_namespace(|nvs| nvs.get_i32(key), key)?
            .ok_or(StoreError::NotFound)
    }

    fn set_i32(&self, key: &str, value: i32) -> Result<(), StoreError> {
        self.with_namespace(|nvs| nvs.set_i32(key, value), key)
    }

    fn get_blob(&self, key: &str) -> Result<Vec<u8>, StoreError> {
        let mut buffer = [0_u8; MAX_BLOB_LEN];
        self.with_namespace(
            |nvs| Ok(nvs.get_blob(key, &mut buffer)?.map(<[u8]>::to_vec)),
            key,
        )?
        .ok_or(StoreError::NotFound)
    }

    fn set_blob(&self, key: &str, value: &[u8]) -> Result<(), StoreError> {
        self.with_namespace(|nvs| nvs.set_blob(key, value), key)
    }

    fn erase_all(&self) -> Result<(), StoreError> {
        for key in [KEY_MODE, KEY_MANUAL_DUTY, KEY_AUTO_TMIN, KEY_AUTO_TMAX, KEY_SLOTS] {
            self.with_namespace(|nvs| nvs.remove(key).map(|_| ()), key)?;
        }
        Ok(())
    }
}

impl FanActuator for LedcFan {
    fn set_duty(&mut self, percent: u8) -> Result<(), ActuatorError> {
        self.driver
            .set_duty(duty_to_ledc(percent, self.resolution_bits))
            .map_err(|err| ActuatorError(err.to_string()))
    }
}

impl TemperatureSensor for NtcThermometer {
    fn read_temperature(&mut self) -> Option<f32> {
        match self.channel.read_raw() {
            Ok(raw) => self.params.celsius_from_raw(raw),
            Err(err) => {
                warn!("NTC read failed: {err}");
                None
            }
        }
    }
}

impl DigitalInput for EspPin {
    fn is_high(&self) -> bool {
        lock(&self.0).is_high()
    }
}

fn init_watchdog(timeout_sec: u32) -> anyhow::Result<()> {
    let config = esp_idf_svc::sys::esp_task_wdt_config_t {
        timeout_ms: timeout_sec.saturating_mul(1000),
        idle_core_mask: 0,
        trigger_panic: true,
    };
    let rc = unsafe { esp_idf_svc::sys::esp_task_wdt_init(&config) };
    if rc == esp_idf_svc::sys::ESP_OK || rc == esp_idf_svc::sys::ESP_ERR_INVALID_STATE {
        return Ok(());
    }
    Err(anyhow!("esp_task_wdt_init failed with code {}", rc))
}

fn add_current_task_to_watchdog() -> anyhow::Result<()> {
    let rc = unsafe { esp_idf_svc::sys::esp_task_wdt_add(core::ptr::null_mut()) };
    if rc == esp_idf_svc::sys::ESP_OK || rc == esp_idf_svc::sys::ESP_ERR_INVALID_STATE {
        return Ok(());
    }
    Err(anyhow!("esp_task_wdt_add failed with code {}", rc))
}

fn feed_watchdog() {
    let _ = unsafe { esp_idf_svc::sys::esp_task_wdt_reset() };
}
