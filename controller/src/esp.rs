use core::convert::TryInto;
use std::{
    collections::BTreeMap,
    sync::mpsc,
    thread,
    time::{Duration, Instant},
};

use anyhow::{anyhow, Context};
use embedded_svc::{
    http::Method,
    io::{Read, Write},
    wifi::{AuthMethod, ClientConfiguration, Configuration},
    ws::FrameType,
};
use esp_idf_hal::gpio::{AnyIOPin, AnyOutputPin, Level, Output, PinDriver, Pull};
use esp_idf_svc::{
    eventloop::EspSystemEventLoop,
    hal::{modem::Modem, prelude::Peripherals},
    http::server::{
        ws::EspHttpWsDetachedSender, Configuration as HttpConfiguration, EspHttpConnection,
        EspHttpServer, Request,
    },
    log::EspLogger,
    nvs::{EspDefaultNvsPartition, EspNvs, NvsDefault},
    sntp::{EspSntp, SyncStatus},
    sys::EspError,
    wifi::{BlockingWifi, EspWifi},
};
use log::{info, warn};
use serde::Serialize;

use hotwater_common::{
    ApiRequest, BootReport, BootSource, ControllerEvent, ErrorBody, HardwareClock,
    HeatingController, KeyValueStore, RelayPins, RelayState, RuntimeConfig, StatusPayload,
    StoreError, StoredValue,
};

use crate::clock::SystemClock;

const NVS_NAMESPACE: &str = "hotwater";
const NVS_RUNTIME_KEY: &str = "runtime_json";
const MAX_HTTP_BODY: usize = 1024;
const API_REPLY_TIMEOUT: Duration = Duration::from_secs(2);
const WATCHDOG_TIMEOUT_SEC: u32 = 30;
const WIFI_CONNECT_ATTEMPTS: u32 = 5;
const WIFI_RETRY_DELAY_MS: u64 = 3_000;

const INDEX_HTML: &str = include_str!("../web/index.html");

/// Work handed from the HTTP server threads to the control loop.
enum LoopCommand {
    Api {
        body: Vec<u8>,
        reply: mpsc::SyncSender<HttpReply>,
    },
    Subscribe {
        session: i32,
        sender: EspHttpWsDetachedSender,
    },
    Unsubscribe {
        session: i32,
    },
}

struct HttpReply {
    status: u16,
    body: Vec<u8>,
}

struct StatusLed {
    pin: PinDriver<'static, AnyOutputPin, Output>,
    lit: bool,
}

struct GpioRelayPins {
    trigger: PinDriver<'static, AnyOutputPin, Output>,
    hold: PinDriver<'static, AnyOutputPin, Output>,
}

/// Timer table and heating flag in the NVS namespace. Writes are staged
/// and only reach flash on `commit`.
struct NvsStore {
    nvs: EspNvs<NvsDefault>,
    staged: BTreeMap<String, Option<StoredValue>>,
}

pub fn run() -> anyhow::Result<()> {
    esp_idf_svc::sys::link_patches();
    EspLogger::initialize_default();

    let sys_loop = EspSystemEventLoop::take()?;
    let nvs_partition = EspDefaultNvsPartition::take()?;

    let mut runtime = load_runtime_config(&nvs_partition).unwrap_or_else(|err| {
        warn!("failed to load runtime config from NVS: {err:#}");
        RuntimeConfig::default()
    });
    runtime.sanitize();
    info!(
        "hardware: button GPIO{}, trigger GPIO{}, hold GPIO{}",
        runtime.hardware.button_pin,
        runtime.hardware.relay_trigger_pin,
        runtime.hardware.relay_hold_pin,
    );

    let clock = SystemClock::new(&runtime.timezone).or_else(|err| {
        warn!("{err:#}; using UTC");
        SystemClock::new("UTC")
    })?;

    let store = NvsStore {
        nvs: EspNvs::new(nvs_partition.clone(), NVS_NAMESPACE, true)
            .context("failed to open NVS namespace")?,
        staged: BTreeMap::new(),
    };
    let (mut controller, report) =
        HeatingController::new(runtime.boost.clone(), store, clock.now().current_time());
    log_boot_report(&report);

    let mut button = unsafe { PinDriver::input(AnyIOPin::new(runtime.hardware.button_pin)) }
        .context("failed to claim button pin")?;
    button.set_pull(Pull::Up)?;
    let mut relay_pins = GpioRelayPins {
        trigger: output_pin(runtime.hardware.relay_trigger_pin)?,
        hold: output_pin(runtime.hardware.relay_hold_pin)?,
    };
    relay_pins.apply(RelayState::Off.outputs());
    let mut status_led = runtime.hardware.status_led_pin.and_then(init_status_led);

    let Peripherals { modem, .. } = Peripherals::take()?;
    let wifi = match connect_wifi(modem, sys_loop, nvs_partition) {
        Ok(wifi) => Some(wifi),
        Err(err) => {
            // The schedule keeps running without a network.
            warn!("wifi unavailable, running offline: {err:#}");
            None
        }
    };

    let sntp = match EspSntp::new_default() {
        Ok(sntp) => Some(sntp),
        Err(err) => {
            warn!("failed to start SNTP: {err}");
            None
        }
    };

    let (commands, inbox) = mpsc::channel();
    let server = match &wifi {
        Some(_) => Some(create_http_server(commands)?),
        None => None,
    };

    init_watchdog(WATCHDOG_TIMEOUT_SEC)?;
    if let Err(err) = add_current_task_to_watchdog() {
        warn!("failed to register control loop with watchdog: {err:#}");
    }

    // Keep services alive for the program lifetime.
    let _wifi = wifi;
    let _server = server;

    let button_period = Duration::from_millis(runtime.timing.button_tick_ms);
    let relay_period = Duration::from_millis(runtime.timing.relay_tick_ms);
    let schedule_period = Duration::from_secs(1);
    let mut next_relay = Instant::now();
    let mut next_schedule = Instant::now();
    let mut subscribers: Vec<(i32, EspHttpWsDetachedSender)> = Vec::new();
    let mut relay_state = RelayState::Off;
    let mut time_synced = false;

    loop {
        feed_watchdog();

        controller.button_tick(button.is_high());
        log_events(&mut controller);

        let now = Instant::now();
        if now >= next_relay {
            next_relay = now + relay_period;
            let outputs = controller.relay_tick();
            if controller.relay_state() != relay_state {
                info!("relay {relay_state:?} -> {:?}", controller.relay_state());
                relay_state = controller.relay_state();
            }
            relay_pins.apply(outputs);
        }

        if now >= next_schedule {
            next_schedule = now + schedule_period;

            if !time_synced
                && sntp
                    .as_ref()
                    .is_some_and(|sntp| sntp.get_sync_status() == SyncStatus::Completed)
            {
                time_synced = true;
                info!("SNTP time sync complete");
            }

            controller.schedule_tick(clock.now().current_time());
            log_events(&mut controller);
            toggle_status_led(&mut status_led);

            if let Some(status) = controller.take_broadcast() {
                broadcast(&mut subscribers, &status);
            }
        }

        while let Ok(command) = inbox.try_recv() {
            match command {
                LoopCommand::Api { body, reply } => {
                    let _ = reply.send(dispatch(&mut controller, &body));
                }
                LoopCommand::Subscribe { session, sender } => {
                    info!("websocket subscriber {session} attached");
                    subscribers.push((session, sender));
                    controller.attach_subscriber();
                }
                LoopCommand::Unsubscribe { session } => {
                    info!("websocket subscriber {session} detached");
                    subscribers.retain(|(id, _)| *id != session);
                }
            }
        }

        thread::sleep(button_period);
    }
}

fn load_runtime_config(partition: &EspDefaultNvsPartition) -> anyhow::Result<RuntimeConfig> {
    let nvs = EspNvs::new(partition.clone(), NVS_NAMESPACE, true)?;
    let mut buffer = vec![0_u8; 1024];

    match nvs.get_str(NVS_RUNTIME_KEY, &mut buffer)? {
        Some(value) => Ok(serde_json::from_str::<RuntimeConfig>(value)?),
        None => Ok(RuntimeConfig::default()),
    }
}

fn log_boot_report(report: &BootReport) {
    match &report.source {
        BootSource::Persisted => info!("loaded persisted schedule from NVS"),
        BootSource::Defaults => info!("no persisted schedule, using defaults"),
    }
    for key in &report.gaps {
        warn!("NVS key `{key}` missing, unreadable or out of range, using default");
    }
}

fn log_events(controller: &mut HeatingController<NvsStore>) {
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
            ControllerEvent::HeatingEnabledChanged(enabled) => info!("heating enabled: {enabled}"),
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

fn dispatch(controller: &mut HeatingController<NvsStore>, body: &[u8]) -> HttpReply {
    let request = match ApiRequest::from_json(body) {
        Ok(request) => request,
        Err(err) => {
            warn!("rejected api request: {err:?}");
            return json_reply(400, &ErrorBody::new(err.to_string()));
        }
    };

    let action = request.action();
    let result = controller.execute(request);
    log_events(controller);

    match result {
        Ok(reply) => json_reply(200, &reply),
        Err(err) => {
            warn!("{action} rejected: {err}");
            json_reply(err.http_status(), &ErrorBody::new(err.to_string()))
        }
    }
}

fn json_reply<T: Serialize>(status: u16, payload: &T) -> HttpReply {
    match serde_json::to_vec(payload) {
        Ok(body) => HttpReply { status, body },
        Err(err) => {
            warn!("reply serialization failed: {err}");
            HttpReply {
                status: 500,
                body: br#"{"status":"ERROR","message":"serialization failed"}"#.to_vec(),
            }
        }
    }
}

fn broadcast(subscribers: &mut Vec<(i32, EspHttpWsDetachedSender)>, status: &StatusPayload) {
    if subscribers.is_empty() {
        return;
    }
    let body = match serde_json::to_vec(status) {
        Ok(body) => body,
        Err(err) => {
            warn!("status serialization failed: {err}");
            return;
        }
    };

    subscribers.retain_mut(|(session, sender)| match sender.send(FrameType::Text(false), &body) {
        Ok(()) => true,
        Err(err) => {
            info!("dropping websocket subscriber {session}: {err}");
            false
        }
    });
}

fn create_http_server(commands: mpsc::Sender<LoopCommand>) -> anyhow::Result<EspHttpServer<'static>> {
    let conf = HttpConfiguration {
        stack_size: 10 * 1024,
        ..Default::default()
    };

    let mut server = EspHttpServer::new(&conf)?;

    server.fn_handler::<anyhow::Error, _>("/", Method::Get, move |req| {
        req.into_response(200, Some("OK"), &[("Content-Type", "text/html; charset=utf-8")])?
            .write_all(INDEX_HTML.as_bytes())?;
        Ok(())
    })?;

    {
        let commands = commands.clone();
        server.fn_handler::<anyhow::Error, _>("/api", Method::Post, move |mut req| {
            let body = match read_request_body(&mut req) {
                Ok(body) => body,
                Err(err) => {
                    let reply = json_reply(400, &ErrorBody::new(err.to_string()));
                    return write_reply(req, reply);
                }
            };

            let (reply, response) = mpsc::sync_channel(1);
            commands
                .send(LoopCommand::Api { body, reply })
                .map_err(|_| anyhow!("control loop stopped"))?;

            let reply = response
                .recv_timeout(API_REPLY_TIMEOUT)
                .unwrap_or_else(|_| json_reply(503, &ErrorBody::new("Controller busy")));
            write_reply(req, reply)
        })?;
    }

    server.ws_handler("/websocket", move |ws| -> Result<(), EspError> {
        if ws.is_new() {
            let sender = ws.create_detached_sender()?;
            let _ = commands.send(LoopCommand::Subscribe {
                session: ws.session(),
                sender,
            });
        } else if ws.is_closed() {
            let _ = commands.send(LoopCommand::Unsubscribe {
                session: ws.session(),
            });
        } else {
            // Clients never send anything meaningful; drain the frame.
            let mut buffer = [0_u8; 256];
            if let Err(err) = ws.recv(&mut buffer) {
                warn!("websocket receive failed: {err}");
            }
        }
        Ok(())
    })?;

    Ok(server)
}

fn read_request_body(req: &mut Request<&mut EspHttpConnection<'_>>) -> anyhow::Result<Vec<u8>> {
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

fn write_reply(req: Request<&mut EspHttpConnection<'_>>, reply: HttpReply) -> anyhow::Result<()> {
    req.into_response(
        reply.status,
        None,
        &[("Content-Type", "application/json; charset=utf-8")],
    )?
    .write_all(&reply.body)?;
    Ok(())
}

fn connect_wifi(
    modem: Modem,
    sys_loop: EspSystemEventLoop,
    nvs_partition: EspDefaultNvsPartition,
) -> anyhow::Result<EspWifi<'static>> {
    let ssid = option_env!("WIFI_SSID").unwrap_or_default();
    let pass = option_env!("WIFI_PASS").unwrap_or_default();
    if ssid.is_empty() {
        return Err(anyhow!("WIFI_SSID was not set at build time"));
    }

    let mut esp_wifi = EspWifi::new(modem, sys_loop.clone(), Some(nvs_partition))?;
    let mut wifi = BlockingWifi::wrap(&mut esp_wifi, sys_loop)?;

    let auth_method = if pass.is_empty() {
        AuthMethod::None
    } else {
        AuthMethod::WPAWPA2Personal
    };
    wifi.set_configuration(&Configuration::Client(ClientConfiguration {
        ssid: ssid.try_into().map_err(|_| anyhow!("wifi ssid too long"))?,
        password: pass.try_into().map_err(|_| anyhow!("wifi password too long"))?,
        auth_method,
        ..Default::default()
    }))?;

    wifi.start()?;
    info!("wifi started, connecting to `{ssid}`");

    let mut last_err = None;
    for attempt in 1..=WIFI_CONNECT_ATTEMPTS {
        match wifi.connect().and_then(|()| wifi.wait_netif_up()) {
            Ok(()) => {
                info!("wifi connected on attempt {attempt}");
                last_err = None;
                break;
            }
            Err(err) => {
                warn!("wifi connect attempt {attempt}/{WIFI_CONNECT_ATTEMPTS} failed: {err}");
                last_err = Some(err);
            }
        }

        if attempt < WIFI_CONNECT_ATTEMPTS {
            let _ = wifi.disconnect();
            thread::sleep(Duration::from_millis(WIFI_RETRY_DELAY_MS));
        }
    }

    match last_err {
        None => Ok(esp_wifi),
        Some(err) => {
            let _ = wifi.stop();
            Err(anyhow!("all {WIFI_CONNECT_ATTEMPTS} wifi connect attempts failed: {err}"))
        }
    }
}

fn output_pin(pin: i32) -> anyhow::Result<PinDriver<'static, AnyOutputPin, Output>> {
    let mut driver = unsafe { PinDriver::output(AnyOutputPin::new(pin)) }
        .with_context(|| format!("failed to claim GPIO{pin} as output"))?;
    driver.set_low()?;
    Ok(driver)
}

impl RelayPins for GpioRelayPins {
    fn set_trigger(&mut self, level: bool) {
        if let Err(err) = self.trigger.set_level(Level::from(level)) {
            warn!("failed to drive relay trigger line: {err}");
        }
    }

    fn set_hold(&mut self, level: bool) {
        if let Err(err) = self.hold.set_level(Level::from(level)) {
            warn!("failed to drive relay hold line: {err}");
        }
    }
}

fn init_status_led(pin: i32) -> Option<StatusLed> {
    match output_pin(pin) {
        Ok(pin) => Some(StatusLed { pin, lit: false }),
        Err(err) => {
            warn!("status LED unavailable: {err:#}");
            None
        }
    }
}

fn toggle_status_led(status_led: &mut Option<StatusLed>) {
    let Some(led) = status_led.as_mut() else {
        return;
    };

    let result = if led.lit {
        led.pin.set_low()
    } else {
        led.pin.set_high()
    };

    if let Err(err) = result {
        warn!("failed to drive status LED: {err}");
    } else {
        led.lit = !led.lit;
    }
}

fn nvs_error(key: &str, err: EspError) -> StoreError {
    StoreError::Read {
        key: key.to_string(),
        reason: err.to_string(),
    }
}

impl KeyValueStore for NvsStore {
    fn get_u16(&self, key: &str) -> Result<Option<u16>, StoreError> {
        self.nvs.get_u16(key).map_err(|err| nvs_error(key, err))
    }

    fn get_bool(&self, key: &str) -> Result<Option<bool>, StoreError> {
        self.nvs
            .get_u8(key)
            .map(|value| value.map(|value| value != 0))
            .map_err(|err| nvs_error(key, err))
    }

    fn set_u16(&mut self, key: &str, value: u16) -> Result<(), StoreError> {
        self.staged
            .insert(key.to_string(), Some(StoredValue::U16(value)));
        Ok(())
    }

    fn set_bool(&mut self, key: &str, value: bool) -> Result<(), StoreError> {
        self.staged
            .insert(key.to_string(), Some(StoredValue::Bool(value)));
        Ok(())
    }

    fn remove(&mut self, key: &str) -> Result<(), StoreError> {
        self.staged.insert(key.to_string(), None);
        Ok(())
    }

    fn commit(&mut self) -> Result<(), StoreError> {
        for (key, value) in std::mem::take(&mut self.staged) {
            let result = match value {
                Some(StoredValue::U16(value)) => self.nvs.set_u16(&key, value),
                Some(StoredValue::Bool(value)) => self.nvs.set_u8(&key, u8::from(value)),
                None => self.nvs.remove(&key).map(|_| ()),
            };
            result.map_err(|err| StoreError::Write {
                key,
                reason: err.to_string(),
            })?;
        }
        Ok(())
    }

    fn discard(&mut self) {
        self.staged.clear();
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
