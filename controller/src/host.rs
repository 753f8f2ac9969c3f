use std::{
    collections::HashMap, io::ErrorKind, net::SocketAddr, path::PathBuf, sync::Arc,
    time::Duration,
};

use anyhow::Context;
use axum::{
    extract::{Query, State},
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use chrono::{Offset, Utc};
use chrono_tz::Tz;
use heater_common::{
    register_auto_off_scripts, restart_stopped_scripts, statistics::kwh, HeaterController,
    HeaterStatus, LocalTime, RelayClient, ReportGate, RuntimeConfig, StepOutcome, StepResponse,
    TOPIC_CMD_RODS, TOPIC_CONTROLLER_STATE,
};
use rumqttc::{AsyncClient, Event, Incoming, MqttOptions, QoS};
use serde::Serialize;
use tokio::{
    net::TcpListener,
    sync::{watch, Mutex},
    task::JoinSet,
    time::{Instant, MissedTickBehavior},
};
use tracing::{debug, info, warn};

use crate::{counters::FileCounterStore, shelly::ShellyPro3};

#[derive(Clone)]
struct AppState {
    heater: Arc<Mutex<HeaterController>>,
    relay: Arc<ShellyPro3>,
    counters: Arc<FileCounterStore>,
    status_tx: Arc<watch::Sender<HeaterStatus>>,
    timezone: Tz,
    shutdown: watch::Receiver<bool>,
}

impl AppState {
    fn now(&self) -> LocalTime {
        local_now(self.timezone)
    }
}

#[derive(Clone)]
struct AppStore {
    runtime_path: Arc<PathBuf>,
    counters_path: Arc<PathBuf>,
}

#[derive(Debug, Serialize)]
struct ErrorBody {
    error: String,
}

pub async fn run() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let store = AppStore::new();
    let mut runtime = store.load_runtime_config().await.unwrap_or_else(|err| {
        warn!("failed to load runtime config from store: {err:#}");
        RuntimeConfig::default()
    });
    apply_env_overrides(&mut runtime, |key| std::env::var(key).ok());
    runtime.sanitize();

    let timezone = parse_timezone(&runtime.timezone);
    let relay = Arc::new(ShellyPro3::new(&runtime.relay)?);
    let counters = Arc::new(FileCounterStore::open(store.counters_path.as_ref().clone()).await);

    info!(
        "{} heating rods of {} W on {}",
        runtime.heater.element_count, runtime.heater.element_power_watts, runtime.relay.address
    );
    let now = local_now(timezone);
    let mut heater =
        HeaterController::new(runtime.heater.clone(), relay.clone(), counters.clone(), now).await;

    let (status_tx, _) = watch::channel(heater.status(now));
    let status_tx = Arc::new(status_tx);
    let listener_tx = status_tx.clone();
    heater.set_listener(move |status| {
        listener_tx.send_replace(status.clone());
    });

    let (shutdown_tx, shutdown) = watch::channel(false);
    let app_state = AppState {
        heater: Arc::new(Mutex::new(heater)),
        relay,
        counters,
        status_tx,
        timezone,
        shutdown,
    };

    let config = runtime.heater.clone();
    let mut tasks = JoinSet::new();
    spawn_reconcile_loop(
        &mut tasks,
        app_state.clone(),
        Duration::from_secs(config.reconcile_interval_secs),
    );
    spawn_statistics_loop(
        &mut tasks,
        app_state.clone(),
        Duration::from_secs(config.statistics_check_interval_secs),
        ReportGate::new(chrono::Duration::hours(i64::from(
            config.statistics_report_interval_hours,
        ))),
    );
    spawn_auto_decrease_loop(
        &mut tasks,
        app_state.clone(),
        Duration::from_secs(config.auto_decrease_check_interval_secs),
    );
    spawn_script_health_loop(
        &mut tasks,
        app_state.clone(),
        config.element_count,
        Duration::from_secs(config.script_health_interval_secs),
    );
    spawn_activity_loop(
        &mut tasks,
        app_state.clone(),
        Duration::from_secs(config.activity_sample_interval_secs),
    );
    spawn_flush_loop(
        &mut tasks,
        app_state.clone(),
        Duration::from_secs(config.counter_flush_interval_secs),
    );

    if runtime.mqtt.is_enabled() {
        let mut mqtt_options =
            MqttOptions::new("heater-controller-rust", runtime.mqtt.host, runtime.mqtt.port);
        if !runtime.mqtt.user.is_empty() {
            mqtt_options.set_credentials(runtime.mqtt.user, runtime.mqtt.pass);
        }
        let (mqtt, eventloop) = AsyncClient::new(mqtt_options, 64);
        mqtt.subscribe(TOPIC_CMD_RODS, QoS::AtMostOnce).await?;
        spawn_mqtt_loop(&mut tasks, app_state.clone(), eventloop);
        spawn_state_publish_loop(&mut tasks, app_state.clone(), mqtt);
    } else {
        info!("mqtt disabled, no broker configured");
    }

    let app = Router::new()
        .route("/api/status", get(handle_get_status))
        .route("/api/rods", post(handle_set_rods))
        .route("/api/power", post(handle_set_power))
        .route("/api/increase", post(handle_increase))
        .route("/api/decrease", post(handle_decrease))
        .with_state(app_state.clone());

    let port = std::env::var("HEATER_HTTP_PORT")
        .ok()
        .and_then(|value| value.parse::<u16>().ok())
        .unwrap_or(8080);
    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind controller server at {addr}"))?;

    info!("controller listening on http://{addr}");
    let served = axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal(shutdown_tx))
        .await;

    drain_and_flush(tasks, &app_state.counters).await?;
    served?;
    info!("controller stopped");
    Ok(())
}

async fn shutdown_signal(shutdown_tx: watch::Sender<bool>) {
    if let Err(err) = tokio::signal::ctrl_c().await {
        warn!("could not listen for shutdown signal: {err}");
        std::future::pending::<()>().await;
    }
    info!("shutdown requested");
    shutdown_tx.send_replace(true);
}

/// Waits for every background loop to finish, then writes the counters, so
/// intervals booked by a loop's last pass are not lost.
async fn drain_and_flush(
    mut tasks: JoinSet<()>,
    counters: &FileCounterStore,
) -> anyhow::Result<()> {
    while let Some(joined) = tasks.join_next().await {
        if let Err(err) = joined {
            warn!("background task ended abnormally: {err}");
        }
    }
    counters
        .flush()
        .await
        .context("failed to flush day counters on shutdown")
}

/// Resolves once shutdown was requested or the signal sender is gone.
async fn stopped(shutdown: &mut watch::Receiver<bool>) {
    // An error means the sender is gone, which only happens on shutdown.
    let _ = shutdown.wait_for(|stop| *stop).await;
}

fn spawn_reconcile_loop(tasks: &mut JoinSet<()>, app_state: AppState, period: Duration) {
    let mut shutdown = app_state.shutdown.clone();
    tasks.spawn(async move {
        let mut interval = tokio::time::interval(period);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = interval.tick() => {}
                _ = stopped(&mut shutdown) => break,
            }
            let now = app_state.now();
            app_state.heater.lock().await.reconcile(now).await;
        }
        debug!("reconcile loop stopped");
    });
}

fn spawn_statistics_loop(
    tasks: &mut JoinSet<()>,
    app_state: AppState,
    period: Duration,
    mut gate: ReportGate,
) {
    let mut shutdown = app_state.shutdown.clone();
    tasks.spawn(async move {
        let mut interval = tokio::time::interval(period);
        loop {
            tokio::select! {
                _ = interval.tick() => {}
                _ = stopped(&mut shutdown) => break,
            }
            let now = app_state.now();
            if !gate.should_report(now) {
                continue;
            }
            let report = app_state.heater.lock().await.consumption_report(now);
            info!(
                "consumption today {:.1} kWh, current year {:.1} kWh, estimated year {:.1} kWh",
                kwh(report.today_wh),
                kwh(report.current_year_wh),
                kwh(report.estimated_year_wh)
            );
        }
        debug!("statistics loop stopped");
    });
}

fn spawn_auto_decrease_loop(tasks: &mut JoinSet<()>, app_state: AppState, period: Duration) {
    let mut shutdown = app_state.shutdown.clone();
    tasks.spawn(async move {
        let mut interval = tokio::time::interval(period);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = interval.tick() => {}
                _ = stopped(&mut shutdown) => break,
            }
            let now = app_state.now();
            let status = {
                let mut heater = app_state.heater.lock().await;
                let outcome = heater.auto_decrease(now).await;
                outcome.changed().then(|| heater.status(now))
            };
            if let Some(status) = status {
                app_state.status_tx.send_replace(status);
            }
        }
        debug!("auto decrease loop stopped");
    });
}

fn spawn_script_health_loop(
    tasks: &mut JoinSet<()>,
    app_state: AppState,
    channels: usize,
    period: Duration,
) {
    let mut shutdown = app_state.shutdown.clone();
    tasks.spawn(async move {
        let relay: &dyn RelayClient = app_state.relay.as_ref();
        tokio::select! {
            failed = register_auto_off_scripts(relay, channels) => {
                if failed == 0 {
                    info!("auto-off scripts registered on {channels} channels");
                }
            }
            _ = stopped(&mut shutdown) => return,
        }

        let mut interval = tokio::time::interval_at(Instant::now() + period, period);
        loop {
            tokio::select! {
                _ = interval.tick() => {}
                _ = stopped(&mut shutdown) => break,
            }
            let failed = restart_stopped_scripts(relay, channels).await;
            debug!("auto-off script check done ({failed} failed)");
        }
        debug!("script health loop stopped");
    });
}

fn spawn_activity_loop(tasks: &mut JoinSet<()>, app_state: AppState, period: Duration) {
    let mut shutdown = app_state.shutdown.clone();
    tasks.spawn(async move {
        let mut interval = tokio::time::interval(period);
        loop {
            tokio::select! {
                _ = interval.tick() => {}
                _ = stopped(&mut shutdown) => break,
            }
            let now = app_state.now();
            app_state.heater.lock().await.sample_activity(now);
        }
        debug!("activity loop stopped");
    });
}

fn spawn_flush_loop(tasks: &mut JoinSet<()>, app_state: AppState, period: Duration) {
    let mut shutdown = app_state.shutdown.clone();
    tasks.spawn(async move {
        let mut interval = tokio::time::interval_at(Instant::now() + period, period);
        loop {
            tokio::select! {
                _ = interval.tick() => {}
                _ = stopped(&mut shutdown) => break,
            }
            if let Err(err) = app_state.counters.flush().await {
                warn!("failed to flush day counters: {err:#}");
            }
        }
        debug!("flush loop stopped");
    });
}

fn spawn_mqtt_loop(
    tasks: &mut JoinSet<()>,
    app_state: AppState,
    mut eventloop: rumqttc::EventLoop,
) {
    let mut shutdown = app_state.shutdown.clone();
    tasks.spawn(async move {
        loop {
            let event = tokio::select! {
                event = eventloop.poll() => event,
                _ = stopped(&mut shutdown) => break,
            };
            match event {
                Ok(Event::Incoming(Incoming::Publish(message))) => {
                    if let Err(err) =
                        handle_mqtt_message(&app_state, &message.topic, &message.payload).await
                    {
                        warn!("mqtt message handling error: {err:#}");
                    }
                }
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
        debug!("mqtt loop stopped");
    });
}

fn spawn_state_publish_loop(tasks: &mut JoinSet<()>, app_state: AppState, mqtt: AsyncClient) {
    let mut shutdown = app_state.shutdown.clone();
    tasks.spawn(async move {
        let mut status_rx = app_state.status_tx.subscribe();
        loop {
            let payload = serde_json::to_vec(&*status_rx.borrow_and_update());
            match payload {
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

            tokio::select! {
                changed = status_rx.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
                _ = stopped(&mut shutdown) => break,
            }
        }
    });
}

async fn handle_mqtt_message(
    app_state: &AppState,
    topic: &str,
    payload: &[u8],
) -> anyhow::Result<()> {
    if topic != TOPIC_CMD_RODS {
        return Ok(());
    }
    let requested = parse_count(payload)
        .with_context(|| format!("invalid payload on {topic}"))?;

    let now = app_state.now();
    let (outcome, status) = {
        let mut heater = app_state.heater.lock().await;
        let target = heater.validate_active_count(requested)?;
        let outcome = heater.set_active_count(target, now).await;
        (outcome, heater.status(now))
    };
    info!("mqtt requested {requested} heating rods: {}", outcome.as_str());
    app_state.status_tx.send_replace(status);
    Ok(())
}

async fn handle_get_status(State(state): State<AppState>) -> impl IntoResponse {
    let now = state.now();
    let status = state.heater.lock().await.status(now);
    Json(status)
}

async fn handle_set_rods(
    State(state): State<AppState>,
    Query(params): Query<HashMap<String, String>>,
) -> impl IntoResponse {
    let Some(value) = params.get("value") else {
        return error_response(StatusCode::BAD_REQUEST, "Missing 'value' parameter");
    };
    let Ok(requested) = value.trim().parse::<i64>() else {
        return error_response(StatusCode::BAD_REQUEST, "Invalid heating rod count");
    };

    let now = state.now();
    let (outcome, status) = {
        let mut heater = state.heater.lock().await;
        let target = match heater.validate_active_count(requested) {
            Ok(target) => target,
            Err(err) => return error_response(StatusCode::BAD_REQUEST, &err.to_string()),
        };
        let outcome = heater.set_active_count(target, now).await;
        (outcome, heater.status(now))
    };

    step_response(&state, outcome, status)
}

async fn handle_set_power(
    State(state): State<AppState>,
    Query(params): Query<HashMap<String, String>>,
) -> impl IntoResponse {
    let Some(value) = params.get("value") else {
        return error_response(StatusCode::BAD_REQUEST, "Missing 'value' parameter");
    };
    let Ok(watts) = value.trim().parse::<i64>() else {
        return error_response(StatusCode::BAD_REQUEST, "Invalid power value");
    };

    let now = state.now();
    let (outcome, status) = {
        let mut heater = state.heater.lock().await;
        let outcome = heater.set_power(watts, now).await;
        (outcome, heater.status(now))
    };

    step_response(&state, outcome, status)
}

async fn handle_increase(State(state): State<AppState>) -> impl IntoResponse {
    let now = state.now();
    let (outcome, status) = {
        let mut heater = state.heater.lock().await;
        let outcome = heater.increase(now).await;
        (outcome, heater.status(now))
    };

    step_response(&state, outcome, status)
}

async fn handle_decrease(State(state): State<AppState>) -> impl IntoResponse {
    let now = state.now();
    let (outcome, status) = {
        let mut heater = state.heater.lock().await;
        let outcome = heater.decrease(Some("requested"), now).await;
        (outcome, heater.status(now))
    };

    step_response(&state, outcome, status)
}

fn step_response(
    state: &AppState,
    outcome: StepOutcome,
    status: HeaterStatus,
) -> axum::response::Response {
    if outcome.changed() {
        state.status_tx.send_replace(status.clone());
    }
    Json(StepResponse {
        outcome: outcome.as_str(),
        status,
    })
    .into_response()
}

impl AppStore {
    fn new() -> Self {
        let data_dir = std::env::var("HEATER_DATA_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("./.heater"));

        Self {
            runtime_path: Arc::new(data_dir.join("runtime.json")),
            counters_path: Arc::new(data_dir.join("counters.json")),
        }
    }

    async fn load_runtime_config(&self) -> anyhow::Result<RuntimeConfig> {
        match tokio::fs::read(self.runtime_path.as_ref()).await {
            Ok(raw) => Ok(serde_json::from_slice::<RuntimeConfig>(&raw)?),
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(RuntimeConfig::default()),
            Err(err) => Err(err.into()),
        }
    }
}

fn apply_env_overrides(runtime: &mut RuntimeConfig, lookup: impl Fn(&str) -> Option<String>) {
    if let Some(address) = lookup("HEATER_RELAY_ADDR") {
        runtime.relay.address = address;
    }
    if let Some(timezone) = lookup("HEATER_TIMEZONE") {
        runtime.timezone = timezone;
    }
    if let Some(host) = lookup("MQTT_HOST") {
        runtime.mqtt.host = host;
    }
    if let Some(port) = lookup("MQTT_PORT").and_then(|value| value.parse::<u16>().ok()) {
        runtime.mqtt.port = port;
    }
    if let Some(user) = lookup("MQTT_USER") {
        runtime.mqtt.user = user;
    }
    if let Some(pass) = lookup("MQTT_PASS") {
        runtime.mqtt.pass = pass;
    }
}

fn parse_timezone(name: &str) -> Tz {
    name.parse::<Tz>().unwrap_or_else(|err| {
        warn!("unknown timezone {name:?} ({err}), falling back to UTC");
        Tz::UTC
    })
}

fn local_now(timezone: Tz) -> LocalTime {
    let local = Utc::now().with_timezone(&timezone);
    local.with_timezone(&local.offset().fix())
}

fn parse_count(payload: &[u8]) -> anyhow::Result<i64> {
    let text = std::str::from_utf8(payload)?;
    Ok(text.trim().parse::<i64>()?)
}

fn error_response(status: StatusCode, message: &str) -> axum::response::Response {
    (
        status,
        Json(ErrorBody {
            error: message.to_string(),
        }),
    )
        .into_response()
}

#[cfg(test)]
mod tests {
    use super::*;
    use heater_common::{DayCounterStore, HeaterConfig, RelayConfig};
    use mockito::{Matcher, Server};

    async fn test_state(
        relay_url: String,
        counters_path: PathBuf,
    ) -> (AppState, watch::Sender<bool>) {
        let relay = Arc::new(
            ShellyPro3::new(&RelayConfig {
                address: relay_url,
                ..RelayConfig::default()
            })
            .unwrap(),
        );
        let counters = Arc::new(FileCounterStore::empty(counters_path));
        let timezone = Tz::Europe__Berlin;
        let now = local_now(timezone);
        let heater =
            HeaterController::new(HeaterConfig::default(), relay.clone(), counters.clone(), now)
                .await;
        let (status_tx, _) = watch::channel(heater.status(now));
        let (shutdown_tx, shutdown) = watch::channel(false);

        let state = AppState {
            heater: Arc::new(Mutex::new(heater)),
            relay,
            counters,
            status_tx: Arc::new(status_tx),
            timezone,
            shutdown,
        };
        (state, shutdown_tx)
    }

    #[tokio::test]
    async fn loops_stop_on_shutdown_before_final_flush() {
        let mut server = Server::new_async().await;
        let _switch = server
            .mock("GET", Matcher::Regex(r"^/rpc/Switch\.".to_string()))
            .with_status(200)
            .with_body(r#"{"id":0,"output":false}"#)
            .expect_at_least(1)
            .create_async()
            .await;
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("counters.json");
        let (state, shutdown_tx) = test_state(server.url(), path.clone()).await;

        let mut tasks = JoinSet::new();
        let hour = Duration::from_secs(60 * 60);
        spawn_reconcile_loop(&mut tasks, state.clone(), hour);
        spawn_auto_decrease_loop(&mut tasks, state.clone(), hour);
        spawn_activity_loop(&mut tasks, state.clone(), hour);
        spawn_flush_loop(&mut tasks, state.clone(), hour);
        state
            .counters
            .put("heater_2:100", 900.0, chrono::Duration::days(1));

        shutdown_tx.send_replace(true);
        tokio::time::timeout(
            Duration::from_secs(10),
            drain_and_flush(tasks, &state.counters),
        )
        .await
        .unwrap()
        .unwrap();

        let reloaded = FileCounterStore::load(path).await.unwrap();
        assert_eq!(reloaded.get("heater_2:100", -1.0), 900.0);
    }

    #[test]
    fn env_overrides_replace_stored_values() {
        let mut runtime = RuntimeConfig::default();
        let env: HashMap<&str, &str> = HashMap::from([
            ("HEATER_RELAY_ADDR", "http://10.0.0.9"),
            ("HEATER_TIMEZONE", "Europe/Vienna"),
            ("MQTT_HOST", "broker.local"),
            ("MQTT_PORT", "not-a-port"),
            ("MQTT_USER", "heater"),
        ]);

        apply_env_overrides(&mut runtime, |key| env.get(key).map(|value| value.to_string()));

        assert_eq!(runtime.relay.address, "http://10.0.0.9");
        assert_eq!(runtime.timezone, "Europe/Vienna");
        assert_eq!(runtime.mqtt.host, "broker.local");
        assert_eq!(runtime.mqtt.port, 1883);
        assert_eq!(runtime.mqtt.user, "heater");
        assert!(runtime.mqtt.pass.is_empty());
    }

    #[test]
    fn unknown_timezone_falls_back_to_utc() {
        assert_eq!(parse_timezone("Europe/Berlin"), Tz::Europe__Berlin);
        assert_eq!(parse_timezone("Mars/Olympus"), Tz::UTC);
    }

    #[test]
    fn local_clock_carries_zone_offset() {
        let now = local_now(Tz::Asia__Kolkata);

        assert_eq!(now.offset().local_minus_utc(), 5 * 3600 + 30 * 60);
    }

    #[test]
    fn rod_count_payload_is_trimmed_integer() {
        assert_eq!(parse_count(b" 2\n").unwrap(), 2);
        assert_eq!(parse_count(b"-1").unwrap(), -1);
        assert!(parse_count(b"two").is_err());
    }
}
