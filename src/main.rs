use anyhow::{bail, Context, Result};
use rave_link::domain::models::{RaveConfiguration, SessionEvent};
use rave_link::domain::settings::SettingsService;
use rave_link::infrastructure::bluetooth::simulated::SimulatedController;
use rave_link::infrastructure::bluetooth::transport::BoxedTransport;
use rave_link::infrastructure::bluetooth::DeviceService;
use rave_link::infrastructure::logging::init_logger;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::timeout;
use tracing::{error, info, warn};

const EVENT_TIMEOUT: Duration = Duration::from_secs(5);

/// Runs a session against the simulated controller: loads its status and
/// effects, then pushes the configuration given on the command line (or the
/// last one used) and saves it on the device.
#[tokio::main]
async fn main() -> Result<()> {
    let mut settings_service = SettingsService::new()?;

    let _logging_guard = init_logger(&settings_service.get().log_settings)
        .map_err(|e| eprintln!("Failed to initialize logging: {}", e))
        .ok();

    info!("Starting RaveLink");

    let config_path = std::env::args()
        .nth(1)
        .map(PathBuf::from)
        .or_else(|| settings_service.get().last_configuration.clone());

    let (notify_tx, notify_rx) = mpsc::unbounded_channel();
    let (event_tx, mut events) = mpsc::unbounded_channel();
    let device = Arc::new(SimulatedController::new(notify_tx));
    let transport: BoxedTransport = device.clone();

    let (handle, task) = DeviceService::spawn(
        transport,
        notify_rx,
        &settings_service.get().protocol,
        event_tx,
    );
    device.connect();

    handle.request_status()?;
    let mut effects_pending = None;
    while effects_pending != Some(0) {
        match next_event(&mut events).await? {
            SessionEvent::StatusReceived { effects, segments } => {
                info!("Device offers {} effects over {} segments", effects, segments);
                effects_pending = Some(effects);
            }
            SessionEvent::EffectUpdated(name) => {
                info!("Loaded effect '{}'", name);
                effects_pending = effects_pending.map(|n| n.saturating_sub(1));
            }
            other => log_event(&other),
        }
    }

    for effect in handle.effects().borrow().iter() {
        let params: Vec<_> = effect.parameters.iter().map(|p| p.name.as_str()).collect();
        info!("  {} [{}]", effect.name, params.join(", "));
    }

    if let Some(path) = config_path {
        let text = std::fs::read_to_string(&path)
            .with_context(|| format!("Failed to read configuration {:?}", path))?;
        let configuration = RaveConfiguration::from_json(&text)
            .with_context(|| format!("Invalid configuration {:?}", path))?;

        info!(
            "Pushing {} segments from {:?}",
            configuration.segments.len(),
            path
        );
        handle.push_configuration(configuration.segments).await?;

        loop {
            match next_event(&mut events).await? {
                SessionEvent::TransferCompleted { segments } => {
                    info!("Configuration push complete ({} segments)", segments);
                    handle.save_config()?;
                    break;
                }
                SessionEvent::TransferAborted => bail!("Configuration push aborted"),
                other => log_event(&other),
            }
        }

        if let Err(e) = settings_service.remember_configuration(path) {
            warn!("Could not remember configuration path: {}", e);
        }
    }

    // Round-trip a request so every queued write has reached the device
    handle.request_led_count()?;
    loop {
        match next_event(&mut events).await? {
            SessionEvent::LedCount(count) => {
                info!("Device drives {} LEDs", count);
                break;
            }
            other => log_event(&other),
        }
    }

    for segment in device.segments() {
        info!(
            "  #{} {} [{}..={}] {} @ {}",
            segment.id,
            segment.name,
            segment.start_led,
            segment.end_led,
            segment.effect,
            segment.brightness
        );
    }

    handle.disconnect()?;
    task.await?;
    while let Ok(event) = events.try_recv() {
        log_event(&event);
    }

    Ok(())
}

async fn next_event(events: &mut mpsc::UnboundedReceiver<SessionEvent>) -> Result<SessionEvent> {
    match timeout(EVENT_TIMEOUT, events.recv()).await {
        Ok(Some(event)) => Ok(event),
        Ok(None) => bail!("Session ended unexpectedly"),
        Err(_) => bail!("Device did not respond within {:?}", EVENT_TIMEOUT),
    }
}

fn log_event(event: &SessionEvent) {
    match event {
        SessionEvent::LogMessage(message) => info!("{:?}: {}", message.severity, message.message),
        SessionEvent::ConnectionStatus(status) => info!("Connection: {:?}", status),
        SessionEvent::TransferAborted => error!("Configuration push aborted"),
        other => info!("{:?}", other),
    }
}
