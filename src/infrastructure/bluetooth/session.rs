//! Protocol Session
//!
//! All protocol state for one connection: the outbound queue, the inbound
//! framer, the dispatcher with its repositories, and the configuration
//! transfer. Nothing here blocks or locks; the owner feeds it transport
//! events one at a time.

use crate::domain::models::{ParamValue, Segment, SessionEvent};
use crate::domain::repository::{EffectsRepository, SegmentsRepository};
use crate::domain::settings::ProtocolSettings;
use crate::error::{ProtocolError, TransportError};
use crate::infrastructure::bluetooth::command_queue::{CommandQueue, CommandSink};
use crate::infrastructure::bluetooth::dispatcher::{DispatchAction, ResponseDispatcher};
use crate::infrastructure::bluetooth::framer::ResponseFramer;
use crate::infrastructure::bluetooth::protocol::{
    encode_parameter_update, encode_single_segment, Command, ControlFrame,
};
use crate::infrastructure::bluetooth::transfer::{
    ConfigTransferStateMachine, TransferState, TransferStep,
};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

pub struct ProtocolSession<S: CommandSink> {
    queue: CommandQueue<S>,
    framer: ResponseFramer,
    dispatcher: ResponseDispatcher,
    transfer: ConfigTransferStateMachine,
    max_payload: usize,
    event_sender: mpsc::UnboundedSender<SessionEvent>,
}

impl<S: CommandSink> ProtocolSession<S> {
    pub fn new(
        sink: S,
        settings: &ProtocolSettings,
        event_sender: mpsc::UnboundedSender<SessionEvent>,
    ) -> Self {
        Self {
            queue: CommandQueue::new(sink, settings.write_failure_policy),
            framer: ResponseFramer::new(settings.max_frame_len),
            dispatcher: ResponseDispatcher::new(event_sender.clone()),
            transfer: ConfigTransferStateMachine::new(settings.max_payload),
            max_payload: settings.max_payload,
            event_sender,
        }
    }

    /// Handle one raw notification from the device
    pub fn on_notification(&mut self, bytes: &[u8]) {
        // A control byte in the middle of an object is just payload
        if !self.framer.is_mid_object() {
            if let Some(frame) = ControlFrame::parse(bytes) {
                debug!("Control frame: {:?}", frame);
                let action = self.dispatcher.handle_control(frame);
                self.apply(action);
                return;
            }
        }

        for object in self.framer.feed(bytes) {
            let action = self.dispatcher.classify(&object);
            self.apply(action);
        }
    }

    /// The transport finished the outstanding write
    pub fn on_send_confirmed(&mut self, result: Result<(), TransportError>) {
        self.queue.on_send_confirmed(result);
    }

    /// Start pushing a full configuration
    pub fn push_configuration(&mut self, segments: Vec<Segment>) -> Result<(), ProtocolError> {
        let command = self.transfer.begin_full_config_push(segments)?;
        self.queue.enqueue(command);
        Ok(())
    }

    /// Give up on the running push, if any
    pub fn abort_transfer(&mut self) {
        if self.transfer.is_active() {
            self.transfer.abort();
            self.emit(SessionEvent::TransferAborted);
        }
    }

    pub fn request_status(&mut self) {
        self.queue.enqueue(Command::get_status());
    }

    pub fn request_led_count(&mut self) {
        self.queue.enqueue(Command::get_led_count());
    }

    pub fn set_led_count(&mut self, count: u16) {
        info!("Setting LED count to {}", count);
        self.queue.enqueue(Command::set_led_count(count));
    }

    pub fn request_all_effects(&mut self) {
        self.dispatcher.begin_effect_pull();
        self.queue.enqueue(Command::get_all_effects());
    }

    pub fn request_all_segments(&mut self) {
        self.dispatcher.begin_segment_pull();
        self.queue.enqueue(Command::get_all_segment_configs());
    }

    /// Ask for one effect's parameters, addressed by its position in the effect list
    pub fn request_effect_info(&mut self, effect_name: &str) -> Result<(), ProtocolError> {
        let index = self
            .dispatcher
            .effects()
            .index_of(effect_name)
            .and_then(|i| u8::try_from(i).ok())
            .ok_or_else(|| ProtocolError::EffectNotFound(effect_name.to_string()))?;
        self.queue.enqueue(Command::get_effect_info(index));
        Ok(())
    }

    /// Send one segment's full configuration
    pub fn set_segment(&mut self, segment: &Segment) -> Result<(), ProtocolError> {
        let commands = encode_single_segment(segment, self.max_payload)?;
        debug!("Updating segment {} in {} writes", segment.id, commands.len());
        self.queue.enqueue_all(commands);
        Ok(())
    }

    /// Update one parameter of the effect running on a segment
    pub fn set_effect_parameter(
        &mut self,
        segment_id: u32,
        name: &str,
        value: &ParamValue,
    ) -> Result<(), ProtocolError> {
        let index = self
            .dispatcher
            .segments()
            .index_of(segment_id)
            .and_then(|i| u8::try_from(i).ok())
            .ok_or(ProtocolError::SegmentNotFound(segment_id))?;
        let command = encode_parameter_update(index, name, value, self.max_payload)?;
        self.queue.enqueue(command);
        Ok(())
    }

    pub fn save_config(&mut self) {
        self.queue.enqueue(Command::save_config());
    }

    /// Drop all in-progress protocol state; repository contents survive
    pub fn reset(&mut self) {
        if self.transfer.is_active() {
            warn!("Connection reset during configuration push");
        }
        self.queue.clear();
        self.transfer.abort();
        self.framer.reset();
        self.dispatcher.reset();
    }

    pub fn transfer_state(&self) -> TransferState {
        self.transfer.state()
    }

    pub fn effects(&self) -> &EffectsRepository {
        self.dispatcher.effects()
    }

    pub fn segments(&self) -> &SegmentsRepository {
        self.dispatcher.segments()
    }

    pub fn queue(&self) -> &CommandQueue<S> {
        &self.queue
    }

    fn apply(&mut self, action: DispatchAction) {
        match action {
            DispatchAction::Nothing => {}
            DispatchAction::SendAck => self.queue.enqueue(Command::ack()),
            DispatchAction::RequestAllEffects => self.request_all_effects(),
            DispatchAction::AdvanceTransfer => match self.transfer.on_ack() {
                TransferStep::Send(command) => self.queue.enqueue(command),
                TransferStep::Completed { segments } => {
                    self.emit(SessionEvent::TransferCompleted { segments })
                }
                TransferStep::Ignored => {}
            },
        }
    }

    fn emit(&self, event: SessionEvent) {
        let _ = self.event_sender.send(event);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::models::Rgb;
    use crate::infrastructure::bluetooth::command_queue::RecordingSink;

    type TestSession = ProtocolSession<RecordingSink>;

    fn session() -> (TestSession, mpsc::UnboundedReceiver<SessionEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (
            ProtocolSession::new(RecordingSink::default(), &ProtocolSettings::default(), tx),
            rx,
        )
    }

    fn sent(s: &TestSession) -> Vec<Vec<u8>> {
        s.queue()
            .sink()
            .sent
            .iter()
            .map(|c| c.as_bytes().to_vec())
            .collect()
    }

    /// Confirm every outstanding write
    fn flush(s: &mut TestSession) {
        while s.queue().has_in_flight() {
            s.on_send_confirmed(Ok(()));
        }
    }

    fn feed_chunked(s: &mut TestSession, text: &str) {
        for chunk in text.as_bytes().chunks(20) {
            s.on_notification(chunk);
        }
    }

    const STATUS: &str = r#"{"available_effects":["Fire","Ice"],"segments":[{"id":1,"name":"Desk","startLed":0,"endLed":29,"effect":"Fire","brightness":200,"parameters":{}},{"id":2,"name":"Shelf","startLed":30,"endLed":59,"effect":"Ice","brightness":90,"parameters":{}}]}"#;

    #[test]
    fn test_status_triggers_effect_pull() {
        let (mut s, mut rx) = session();
        s.request_status();
        feed_chunked(&mut s, STATUS);
        flush(&mut s);

        assert_eq!(sent(&s), vec![vec![0x08], vec![0x10]]);
        assert_eq!(s.segments().snapshot().len(), 2);
        assert_eq!(
            rx.try_recv().unwrap(),
            SessionEvent::StatusReceived { effects: 2, segments: 2 }
        );
    }

    #[test]
    fn test_large_status_is_delivered_whole() {
        let (mut s, mut rx) = session();
        let segments: Vec<String> = (0..40u32)
            .map(|i| {
                let start = i * 10;
                Segment::new(i + 1, format!("Segment {}", i + 1), start as u16, start as u16 + 9)
                    .to_wire_json()
                    .unwrap()
            })
            .collect();
        let status = format!(
            r#"{{"available_effects":["Fire","Ice"],"segments":[{}]}}"#,
            segments.join(",")
        );
        assert!(status.len() > 4096);

        feed_chunked(&mut s, &status);
        flush(&mut s);

        assert_eq!(s.segments().snapshot().len(), 40);
        assert_eq!(
            rx.try_recv().unwrap(),
            SessionEvent::StatusReceived { effects: 2, segments: 40 }
        );
        assert!(rx.try_recv().is_err());
        // Only the effect pull request; no stray segment ACKs
        assert_eq!(sent(&s), vec![vec![0x10]]);
    }

    #[test]
    fn test_effect_pull_acks_between_objects() {
        let (mut s, _rx) = session();
        s.request_all_effects();
        flush(&mut s);

        s.on_notification(&ControlFrame::EffectCount(2).encode());
        flush(&mut s);
        feed_chunked(&mut s, r#"{"effect":"A","params":[{"name":"speed","type":"integer","value":3}]}"#);
        flush(&mut s);
        feed_chunked(&mut s, r#"{"effect":"B","params":[]}"#);
        flush(&mut s);

        assert_eq!(sent(&s), vec![vec![0x10], vec![0xA0], vec![0xA0]]);
        let effects = s.effects().snapshot();
        assert_eq!(effects.len(), 2);
        assert_eq!(effects[0].parameters.len(), 1);
    }

    #[test]
    fn test_ack_byte_inside_object_is_payload() {
        let (mut s, mut rx) = session();
        s.on_notification(br#"{"effect":"A","#);
        // Would be an ACK on its own
        s.on_notification(&[0xA0]);
        s.on_notification(br#""params":[]}"#);

        assert!(s.effects().snapshot().is_empty());
        assert!(rx.try_recv().is_err());
        assert_eq!(s.transfer_state(), TransferState::Idle);
    }

    #[test]
    fn test_full_push_walks_through_acks() {
        let (mut s, mut rx) = session();
        let segments = vec![Segment::new(1, "Desk", 0, 29), Segment::new(2, "Shelf", 30, 59)];
        let required = ConfigTransferStateMachine::acks_required(&segments, 20);

        s.push_configuration(segments.clone()).unwrap();
        assert!(matches!(
            s.push_configuration(segments.clone()),
            Err(ProtocolError::TransferInProgress)
        ));
        assert_eq!(s.transfer_state(), TransferState::AwaitingStartAck);

        for _ in 0..required {
            flush(&mut s);
            s.on_notification(&[0xA0]);
        }
        flush(&mut s);

        assert_eq!(s.transfer_state(), TransferState::Idle);
        assert_eq!(sent(&s).len(), required);
        assert_eq!(sent(&s)[1], vec![0x00, 0x02]);
        assert_eq!(
            rx.try_recv().unwrap(),
            SessionEvent::TransferCompleted { segments: 2 }
        );
    }

    #[test]
    fn test_set_effect_parameter_uses_segment_index() {
        let (mut s, _rx) = session();
        feed_chunked(&mut s, STATUS);
        flush(&mut s);

        s.set_effect_parameter(2, "color", &ParamValue::Color(Rgb::new(255, 0, 128)))
            .unwrap();
        flush(&mut s);

        let last = sent(&s).pop().unwrap();
        assert_eq!(
            last,
            vec![0x0A, 0x01, 0x02, 0x05, b'c', b'o', b'l', b'o', b'r', 0xFF, 0x00, 0x80]
        );
        assert!(matches!(
            s.set_effect_parameter(9, "speed", &ParamValue::Integer(1)),
            Err(ProtocolError::SegmentNotFound(9))
        ));
    }

    #[test]
    fn test_request_effect_info_by_name() {
        let (mut s, _rx) = session();
        feed_chunked(&mut s, STATUS);
        flush(&mut s);

        s.request_effect_info("Ice").unwrap();
        flush(&mut s);
        assert_eq!(sent(&s).pop().unwrap(), vec![0x0B, 0x00, 0x01]);
        assert!(s.request_effect_info("Plasma").is_err());
    }

    #[test]
    fn test_set_segment_is_chunked() {
        let (mut s, _rx) = session();
        let segment = Segment::new(4, "Window", 60, 119);
        s.set_segment(&segment).unwrap();
        flush(&mut s);

        let writes = sent(&s);
        assert!(writes.iter().all(|w| w.len() <= 20));
        assert_eq!(writes[0][0], 0x11);
        let body: Vec<u8> = writes.concat();
        assert_eq!(&body[1..], segment.to_wire_json().unwrap().as_bytes());
    }

    #[test]
    fn test_led_count_requests_and_events() {
        let (mut s, mut rx) = session();
        s.set_led_count(144);
        s.request_led_count();
        flush(&mut s);
        assert_eq!(sent(&s), vec![vec![0x0C, 0x00, 0x90], vec![0x0D]]);

        s.on_notification(&[0x0D, 0x00, 0x90]);
        assert_eq!(rx.try_recv().unwrap(), SessionEvent::LedCount(144));
    }

    #[test]
    fn test_reset_mid_transfer() {
        let (mut s, mut rx) = session();
        s.push_configuration(vec![Segment::new(1, "Desk", 0, 29)]).unwrap();
        s.request_status();
        s.on_notification(br#"{"id":1,"#);

        s.reset();
        assert_eq!(s.transfer_state(), TransferState::Idle);
        assert!(s.queue().is_idle());

        // A fresh object is framed from scratch after the reset
        s.on_notification(br#"{"id":5,"startLed":0,"endLed":3}"#);
        assert_eq!(s.segments().index_of(5), Some(0));
        assert_eq!(rx.try_recv().unwrap(), SessionEvent::SegmentUpdated(5));
    }

    #[test]
    fn test_abort_transfer_emits_event() {
        let (mut s, mut rx) = session();
        s.abort_transfer();
        assert!(rx.try_recv().is_err());

        s.push_configuration(vec![Segment::new(1, "Desk", 0, 29)]).unwrap();
        s.abort_transfer();
        assert_eq!(rx.try_recv().unwrap(), SessionEvent::TransferAborted);
        assert_eq!(s.transfer_state(), TransferState::Idle);
    }
}
