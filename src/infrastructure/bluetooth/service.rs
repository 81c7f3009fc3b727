//! Device Service
//!
//! Runs one [`ProtocolSession`] per connection on a single tokio task. The
//! task is the only owner of protocol state; the application talks to it
//! through a cloneable [`SessionHandle`] and listens on the event channel.

use crate::domain::models::{
    ConnectionStatus, Effect, MessageSeverity, ParamValue, Segment, SessionEvent, StatusMessage,
};
use crate::domain::settings::ProtocolSettings;
use crate::error::{ProtocolError, TransportError};
use crate::infrastructure::bluetooth::command_queue::CommandSink;
use crate::infrastructure::bluetooth::protocol::Command;
use crate::infrastructure::bluetooth::session::ProtocolSession;
use crate::infrastructure::bluetooth::transfer::TransferState;
use crate::infrastructure::bluetooth::transport::{BoxedTransport, TransportEvent};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::{sleep_until, Instant};
use tracing::{debug, info, warn};

/// Requests accepted by the session task
#[derive(Debug)]
pub enum SessionCommand {
    RequestStatus,
    RequestLedCount,
    SetLedCount(u16),
    RequestAllEffects,
    RequestAllSegments,
    RequestEffectInfo {
        name: String,
        reply: oneshot::Sender<Result<(), ProtocolError>>,
    },
    SetSegment {
        segment: Segment,
        reply: oneshot::Sender<Result<(), ProtocolError>>,
    },
    SetEffectParameter {
        segment_id: u32,
        name: String,
        value: ParamValue,
        reply: oneshot::Sender<Result<(), ProtocolError>>,
    },
    SaveConfig,
    PushConfiguration {
        segments: Vec<Segment>,
        reply: oneshot::Sender<Result<(), ProtocolError>>,
    },
    AbortTransfer,
    Disconnect,
}

struct WriteCompletion {
    write_id: u64,
    result: Result<(), TransportError>,
}

/// Hands each command to the transport on its own task
struct TransportSink {
    transport: BoxedTransport,
    completions: mpsc::UnboundedSender<WriteCompletion>,
    last_write: u64,
}

impl CommandSink for TransportSink {
    fn send(&mut self, command: &Command) {
        self.last_write += 1;
        let write_id = self.last_write;
        let transport = self.transport.clone();
        let completions = self.completions.clone();
        let bytes = command.as_bytes().to_vec();
        debug!("-> {:?}", command);

        tokio::spawn(async move {
            let result = transport.send(&bytes).await;
            let _ = completions.send(WriteCompletion { write_id, result });
        });
    }
}

/// Cloneable front end of a running session
#[derive(Clone)]
pub struct SessionHandle {
    commands: mpsc::UnboundedSender<SessionCommand>,
    effects: watch::Receiver<Vec<Effect>>,
    segments: watch::Receiver<Vec<Segment>>,
}

impl SessionHandle {
    pub fn request_status(&self) -> Result<(), ProtocolError> {
        self.send(SessionCommand::RequestStatus)
    }

    pub fn request_led_count(&self) -> Result<(), ProtocolError> {
        self.send(SessionCommand::RequestLedCount)
    }

    pub fn set_led_count(&self, count: u16) -> Result<(), ProtocolError> {
        self.send(SessionCommand::SetLedCount(count))
    }

    pub fn request_all_effects(&self) -> Result<(), ProtocolError> {
        self.send(SessionCommand::RequestAllEffects)
    }

    pub fn request_all_segments(&self) -> Result<(), ProtocolError> {
        self.send(SessionCommand::RequestAllSegments)
    }

    pub async fn request_effect_info(&self, name: impl Into<String>) -> Result<(), ProtocolError> {
        let (reply, response) = oneshot::channel();
        self.send(SessionCommand::RequestEffectInfo {
            name: name.into(),
            reply,
        })?;
        response.await.map_err(|_| ProtocolError::SessionClosed)?
    }

    pub async fn set_segment(&self, segment: Segment) -> Result<(), ProtocolError> {
        let (reply, response) = oneshot::channel();
        self.send(SessionCommand::SetSegment { segment, reply })?;
        response.await.map_err(|_| ProtocolError::SessionClosed)?
    }

    pub async fn set_effect_parameter(
        &self,
        segment_id: u32,
        name: impl Into<String>,
        value: ParamValue,
    ) -> Result<(), ProtocolError> {
        let (reply, response) = oneshot::channel();
        self.send(SessionCommand::SetEffectParameter {
            segment_id,
            name: name.into(),
            value,
            reply,
        })?;
        response.await.map_err(|_| ProtocolError::SessionClosed)?
    }

    pub fn save_config(&self) -> Result<(), ProtocolError> {
        self.send(SessionCommand::SaveConfig)
    }

    /// Fails when another push is still running or the segment count is out of range
    pub async fn push_configuration(&self, segments: Vec<Segment>) -> Result<(), ProtocolError> {
        let (reply, response) = oneshot::channel();
        self.send(SessionCommand::PushConfiguration { segments, reply })?;
        response.await.map_err(|_| ProtocolError::SessionClosed)?
    }

    pub fn abort_transfer(&self) -> Result<(), ProtocolError> {
        self.send(SessionCommand::AbortTransfer)
    }

    pub fn disconnect(&self) -> Result<(), ProtocolError> {
        self.send(SessionCommand::Disconnect)
    }

    /// Live view of the effects repository
    pub fn effects(&self) -> watch::Receiver<Vec<Effect>> {
        self.effects.clone()
    }

    /// Live view of the segments repository
    pub fn segments(&self) -> watch::Receiver<Vec<Segment>> {
        self.segments.clone()
    }

    pub fn is_closed(&self) -> bool {
        self.commands.is_closed()
    }

    fn send(&self, command: SessionCommand) -> Result<(), ProtocolError> {
        self.commands
            .send(command)
            .map_err(|_| ProtocolError::SessionClosed)
    }
}

/// Event loop owning the protocol state of one connection
pub struct DeviceService {
    session: ProtocolSession<TransportSink>,
    inbound: mpsc::UnboundedReceiver<TransportEvent>,
    completions: mpsc::UnboundedReceiver<WriteCompletion>,
    commands: mpsc::UnboundedReceiver<SessionCommand>,
    event_sender: mpsc::UnboundedSender<SessionEvent>,
    ack_timeout: Option<Duration>,
    ack_deadline: Option<Instant>,
    last_transfer_state: TransferState,
}

impl DeviceService {
    /// Start a session over `transport`; `inbound` carries everything the backend receives
    pub fn spawn(
        transport: BoxedTransport,
        inbound: mpsc::UnboundedReceiver<TransportEvent>,
        settings: &ProtocolSettings,
        event_sender: mpsc::UnboundedSender<SessionEvent>,
    ) -> (SessionHandle, JoinHandle<()>) {
        let mut settings = settings.clone();
        settings.max_payload = settings.max_payload.min(transport.max_payload());

        let (completion_tx, completions) = mpsc::unbounded_channel();
        let (command_tx, commands) = mpsc::unbounded_channel();

        let sink = TransportSink {
            transport,
            completions: completion_tx,
            last_write: 0,
        };
        let session = ProtocolSession::new(sink, &settings, event_sender.clone());

        let handle = SessionHandle {
            commands: command_tx,
            effects: session.effects().subscribe(),
            segments: session.segments().subscribe(),
        };

        let service = Self {
            session,
            inbound,
            completions,
            commands,
            event_sender,
            ack_timeout: settings.ack_timeout_ms.map(Duration::from_millis),
            ack_deadline: None,
            last_transfer_state: TransferState::Idle,
        };

        info!(
            "Device session started (max payload {} bytes)",
            settings.max_payload
        );
        (handle, tokio::spawn(service.run()))
    }

    async fn run(mut self) {
        loop {
            let deadline = self.ack_deadline;

            tokio::select! {
                event = self.inbound.recv() => match event {
                    Some(TransportEvent::Notification(bytes)) => {
                        debug!("<- {:02X?}", bytes);
                        self.session.on_notification(&bytes);
                    }
                    Some(TransportEvent::Connected) => {
                        self.emit(SessionEvent::ConnectionStatus(ConnectionStatus::Connected));
                    }
                    Some(TransportEvent::Disconnected) | None => break,
                },
                Some(completion) = self.completions.recv() => {
                    // Writes abandoned by a reset still complete; only the latest one counts
                    if completion.write_id == self.session.queue().sink().last_write {
                        self.session.on_send_confirmed(completion.result);
                    } else {
                        debug!("Ignoring completion of abandoned write {}", completion.write_id);
                    }
                }
                command = self.commands.recv() => match command {
                    Some(SessionCommand::Disconnect) | None => break,
                    Some(command) => self.handle_command(command),
                },
                _ = sleep_until(deadline.unwrap_or_else(Instant::now)), if deadline.is_some() => {
                    warn!(
                        "No ACK from device for {:?}, aborting configuration push",
                        self.ack_timeout.unwrap_or_default()
                    );
                    self.session.abort_transfer();
                }
            }

            self.track_transfer_progress();
        }

        self.shutdown();
    }

    fn handle_command(&mut self, command: SessionCommand) {
        match command {
            SessionCommand::RequestStatus => self.session.request_status(),
            SessionCommand::RequestLedCount => self.session.request_led_count(),
            SessionCommand::SetLedCount(count) => self.session.set_led_count(count),
            SessionCommand::RequestAllEffects => self.session.request_all_effects(),
            SessionCommand::RequestAllSegments => self.session.request_all_segments(),
            SessionCommand::RequestEffectInfo { name, reply } => {
                let _ = reply.send(self.session.request_effect_info(&name));
            }
            SessionCommand::SetSegment { segment, reply } => {
                let _ = reply.send(self.session.set_segment(&segment));
            }
            SessionCommand::SetEffectParameter {
                segment_id,
                name,
                value,
                reply,
            } => {
                let _ = reply.send(self.session.set_effect_parameter(segment_id, &name, &value));
            }
            SessionCommand::SaveConfig => self.session.save_config(),
            SessionCommand::PushConfiguration { segments, reply } => {
                let _ = reply.send(self.session.push_configuration(segments));
            }
            SessionCommand::AbortTransfer => self.session.abort_transfer(),
            // Handled by the loop
            SessionCommand::Disconnect => {}
        }
    }

    // The ACK timer restarts whenever the transfer moves
    fn track_transfer_progress(&mut self) {
        let state = self.session.transfer_state();
        if state == self.last_transfer_state {
            return;
        }
        self.last_transfer_state = state;
        self.ack_deadline = match (state, self.ack_timeout) {
            (TransferState::Idle, _) | (_, None) => None,
            (_, Some(timeout)) => Some(Instant::now() + timeout),
        };
    }

    fn shutdown(&mut self) {
        self.session.reset();
        info!("Disconnected from device");
        self.emit(SessionEvent::LogMessage(StatusMessage {
            message: "Disconnected from device".to_string(),
            severity: MessageSeverity::Info,
        }));
        self.emit(SessionEvent::ConnectionStatus(ConnectionStatus::Disconnected));
    }

    fn emit(&self, event: SessionEvent) {
        let _ = self.event_sender.send(event);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::models::{OverrideValue, Rgb};
    use crate::domain::settings::WriteFailurePolicy;
    use crate::infrastructure::bluetooth::simulated::SimulatedController;
    use crate::infrastructure::bluetooth::transport::Transport;
    use async_trait::async_trait;
    use std::sync::Arc;
    use tokio::time::timeout;

    struct Harness {
        device: Arc<SimulatedController>,
        handle: SessionHandle,
        task: JoinHandle<()>,
        events: mpsc::UnboundedReceiver<SessionEvent>,
    }

    fn start(settings: ProtocolSettings) -> Harness {
        let (notify_tx, notify_rx) = mpsc::unbounded_channel();
        let (event_tx, events) = mpsc::unbounded_channel();
        let device = Arc::new(SimulatedController::new(notify_tx));
        let transport: BoxedTransport = device.clone();
        let (handle, task) = DeviceService::spawn(transport, notify_rx, &settings, event_tx);
        Harness {
            device,
            handle,
            task,
            events,
        }
    }

    async fn wait_for(
        events: &mut mpsc::UnboundedReceiver<SessionEvent>,
        mut predicate: impl FnMut(&SessionEvent) -> bool,
    ) -> SessionEvent {
        timeout(Duration::from_secs(2), async {
            loop {
                match events.recv().await {
                    Some(event) if predicate(&event) => return event,
                    Some(_) => continue,
                    None => panic!("event channel closed"),
                }
            }
        })
        .await
        .expect("timed out waiting for event")
    }

    /// Status, then every effect's parameters
    async fn load_status(h: &mut Harness) {
        h.handle.request_status().unwrap();
        wait_for(&mut h.events, |e| matches!(e, SessionEvent::StatusReceived { .. })).await;
        for _ in 0..3 {
            wait_for(&mut h.events, |e| matches!(e, SessionEvent::EffectUpdated(_))).await;
        }
    }

    #[tokio::test]
    async fn test_status_pulls_every_effect() {
        let mut h = start(ProtocolSettings::default());
        load_status(&mut h).await;

        let effects = h.handle.effects().borrow().clone();
        let names: Vec<_> = effects.iter().map(|e| e.name.as_str()).collect();
        assert_eq!(names, ["SolidColor", "Rainbow", "Fire"]);
        assert!(effects.iter().all(|e| !e.parameters.is_empty()));
        assert_eq!(h.handle.segments().borrow().len(), 1);
    }

    #[tokio::test]
    async fn test_full_push_reaches_device() {
        let mut h = start(ProtocolSettings::default());
        let mut desk = Segment::new(1, "Desk", 0, 29);
        desk.effect = "Fire".into();
        desk.parameters.insert("cooling".into(), OverrideValue::Number(40.0));
        let segments = vec![desk, Segment::new(2, "Shelf", 30, 59)];

        h.handle.push_configuration(segments.clone()).await.unwrap();
        let done = wait_for(&mut h.events, |e| {
            matches!(e, SessionEvent::TransferCompleted { .. })
        })
        .await;

        assert_eq!(done, SessionEvent::TransferCompleted { segments: 2 });
        assert_eq!(h.device.segments(), segments);
        assert!(h.device.writes().iter().all(|w| w.len() <= 20));
    }

    #[tokio::test]
    async fn test_parameter_update_and_led_count() {
        let mut h = start(ProtocolSettings::default());
        load_status(&mut h).await;

        h.handle
            .set_effect_parameter(1, "color", ParamValue::Color(Rgb::new(0, 0, 255)))
            .await
            .unwrap();
        h.handle.set_led_count(120).unwrap();
        h.handle.save_config().unwrap();
        h.handle.request_led_count().unwrap();

        let count = wait_for(&mut h.events, |e| matches!(e, SessionEvent::LedCount(_))).await;
        assert_eq!(count, SessionEvent::LedCount(120));
        assert_eq!(h.device.save_count(), 1);
        assert_eq!(
            h.device.segments()[0].parameters["color"],
            OverrideValue::Number(255.0)
        );

        let missing = h
            .handle
            .set_effect_parameter(7, "speed", ParamValue::Integer(1))
            .await;
        assert!(matches!(missing, Err(ProtocolError::SegmentNotFound(7))));
    }

    #[tokio::test]
    async fn test_retry_policy_survives_failed_write() {
        let mut h = start(ProtocolSettings {
            write_failure_policy: WriteFailurePolicy::Retry { max_attempts: 3 },
            ..ProtocolSettings::default()
        });
        h.device.fail_next_writes(2);
        h.handle.request_led_count().unwrap();

        let count = wait_for(&mut h.events, |e| matches!(e, SessionEvent::LedCount(_))).await;
        assert_eq!(count, SessionEvent::LedCount(60));
    }

    #[tokio::test]
    async fn test_device_disconnect_ends_session() {
        let mut h = start(ProtocolSettings::default());
        h.device.connect();
        wait_for(&mut h.events, |e| {
            *e == SessionEvent::ConnectionStatus(ConnectionStatus::Connected)
        })
        .await;

        h.device.disconnect();
        wait_for(&mut h.events, |e| {
            *e == SessionEvent::ConnectionStatus(ConnectionStatus::Disconnected)
        })
        .await;
        timeout(Duration::from_secs(2), h.task).await.unwrap().unwrap();
        assert!(matches!(
            h.handle.request_status(),
            Err(ProtocolError::SessionClosed)
        ));
    }

    #[tokio::test]
    async fn test_handle_disconnect() {
        let h = start(ProtocolSettings::default());
        h.handle.disconnect().unwrap();
        timeout(Duration::from_secs(2), h.task).await.unwrap().unwrap();
        assert!(h.handle.is_closed());
    }

    /// Accepts every write and never answers
    struct SilentDevice;

    #[async_trait]
    impl Transport for SilentDevice {
        async fn send(&self, _bytes: &[u8]) -> Result<(), TransportError> {
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_stalled_push_is_aborted() {
        let (_notify_tx, notify_rx) = mpsc::unbounded_channel();
        let (event_tx, mut events) = mpsc::unbounded_channel();
        let settings = ProtocolSettings {
            ack_timeout_ms: Some(50),
            ..ProtocolSettings::default()
        };
        let (handle, _task) =
            DeviceService::spawn(Arc::new(SilentDevice), notify_rx, &settings, event_tx);

        handle
            .push_configuration(vec![Segment::new(1, "Desk", 0, 29)])
            .await
            .unwrap();
        let event = wait_for(&mut events, |e| *e == SessionEvent::TransferAborted).await;
        assert_eq!(event, SessionEvent::TransferAborted);

        // A new push is accepted once the stalled one is gone
        handle
            .push_configuration(vec![Segment::new(1, "Desk", 0, 29)])
            .await
            .unwrap();
    }
}
