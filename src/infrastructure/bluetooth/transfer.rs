//! Configuration Transfer
//!
//! Pushing a full configuration is a lock-step handshake, each step released
//! by an ACK from the device:
//!
//! ```text
//! app                                   device
//!  | [SET_ALL_SEGMENT_CONFIGS]  ------>  |
//!  |                            <------  | ACK
//!  | [count hi, count lo]       ------>  |
//!  |                            <------  | ACK
//!  | segment 0, chunk 0 (<=20B) ------>  |
//!  |                            <------  | ACK
//!  | segment 0, chunk 1 ...     ------>  |
//!  |              ...                    |
//!  |                            <------  | ACK (last chunk) -> Idle
//! ```
//!
//! Pulls run the other way: the device announces a count, then sends one
//! JSON object per ACK. [`PullSequence`] tracks how many are still owed.

use crate::domain::models::Segment;
use crate::error::ProtocolError;
use crate::infrastructure::bluetooth::protocol::{chunk_count, Command};
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TransferState {
    #[default]
    Idle,
    AwaitingStartAck,
    AwaitingCountAck,
    SendingSegmentChunk {
        segment_index: usize,
        chunk_offset: usize,
    },
}

/// Outcome of feeding one ACK to the state machine
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransferStep {
    /// Write this and wait for the next ACK
    Send(Command),
    /// Every segment has been delivered
    Completed { segments: usize },
    /// The ACK did not belong to a transfer
    Ignored,
}

pub struct ConfigTransferStateMachine {
    state: TransferState,
    segments: Vec<Segment>,
    segment_count: u16,
    // Wire JSON of the segment currently being sent
    current_payload: Vec<u8>,
    max_payload: usize,
}

impl ConfigTransferStateMachine {
    pub fn new(max_payload: usize) -> Self {
        Self {
            state: TransferState::Idle,
            segments: Vec::new(),
            segment_count: 0,
            current_payload: Vec::new(),
            max_payload: max_payload.max(1),
        }
    }

    pub fn state(&self) -> TransferState {
        self.state
    }

    pub fn is_active(&self) -> bool {
        self.state != TransferState::Idle
    }

    /// Start a push and return its opening command
    ///
    /// Refused while another transfer is running, or when the segment count
    /// does not fit the 2-byte count field.
    pub fn begin_full_config_push(
        &mut self,
        segments: Vec<Segment>,
    ) -> Result<Command, ProtocolError> {
        if self.is_active() {
            warn!("Configuration push already in progress, ignoring request");
            return Err(ProtocolError::TransferInProgress);
        }
        let segment_count = u16::try_from(segments.len())
            .map_err(|_| ProtocolError::TooManySegments(segments.len()))?;

        info!("Starting configuration push of {} segments", segments.len());
        self.segments = segments;
        self.segment_count = segment_count;
        self.current_payload.clear();
        self.state = TransferState::AwaitingStartAck;
        Ok(Command::begin_segment_push())
    }

    pub fn on_ack(&mut self) -> TransferStep {
        match self.state {
            TransferState::Idle => {
                debug!("ACK while idle, ignoring");
                TransferStep::Ignored
            }
            TransferState::AwaitingStartAck => {
                self.state = TransferState::AwaitingCountAck;
                TransferStep::Send(Command::segment_count(self.segment_count))
            }
            TransferState::AwaitingCountAck => self.start_segment(0),
            TransferState::SendingSegmentChunk {
                segment_index,
                chunk_offset,
            } => {
                let next_offset = chunk_offset + self.max_payload;
                if next_offset < self.current_payload.len() {
                    self.send_chunk(segment_index, next_offset)
                } else {
                    self.start_segment(segment_index + 1)
                }
            }
        }
    }

    /// Abandon the running transfer
    pub fn abort(&mut self) {
        if self.is_active() {
            warn!("Aborting configuration push in state {:?}", self.state);
        }
        self.state = TransferState::Idle;
        self.segments.clear();
        self.segment_count = 0;
        self.current_payload.clear();
    }

    /// Total ACKs a push of these segments needs: start, count, then one per chunk
    pub fn acks_required(segments: &[Segment], max_payload: usize) -> usize {
        2 + segments
            .iter()
            .map(|s| {
                let len = s.to_wire_json().map(|j| j.len()).unwrap_or(0);
                chunk_count(len, max_payload)
            })
            .sum::<usize>()
    }

    fn start_segment(&mut self, index: usize) -> TransferStep {
        let Some(segment) = self.segments.get(index) else {
            return self.complete();
        };

        match segment.to_wire_json() {
            Ok(json) => {
                debug!(
                    "Sending segment {} ({} bytes, {} chunks)",
                    segment.id,
                    json.len(),
                    chunk_count(json.len(), self.max_payload)
                );
                self.current_payload = json.into_bytes();
                self.send_chunk(index, 0)
            }
            Err(e) => {
                warn!("Could not serialize segment {}, skipping: {}", segment.id, e);
                self.start_segment(index + 1)
            }
        }
    }

    fn send_chunk(&mut self, segment_index: usize, chunk_offset: usize) -> TransferStep {
        let end = (chunk_offset + self.max_payload).min(self.current_payload.len());
        let chunk = self.current_payload[chunk_offset..end].to_vec();
        self.state = TransferState::SendingSegmentChunk {
            segment_index,
            chunk_offset,
        };
        TransferStep::Send(Command::new(chunk))
    }

    fn complete(&mut self) -> TransferStep {
        let segments = self.segments.len();
        info!("Configuration push complete ({} segments)", segments);
        self.state = TransferState::Idle;
        self.segments.clear();
        self.current_payload.clear();
        TransferStep::Completed { segments }
    }
}

/// Device-driven batch: a count announcement followed by one object per ACK
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PullSequence {
    #[default]
    Inactive,
    /// Request sent, count not yet announced
    AwaitingCount,
    Receiving {
        expected: u16,
        received: u16,
    },
}

impl PullSequence {
    pub fn request(&mut self) {
        *self = Self::AwaitingCount;
    }

    /// The device announced how many items follow. Returns whether to ACK.
    pub fn on_count(&mut self, expected: u16) -> bool {
        if expected == 0 {
            *self = Self::Inactive;
            return false;
        }
        *self = Self::Receiving {
            expected,
            received: 0,
        };
        true
    }

    /// One item arrived. Returns whether to ACK for the next one.
    ///
    /// Items arriving outside of a counted batch are acknowledged as well;
    /// the firmware uses the same ACK to confirm a single unsolicited item.
    pub fn on_item(&mut self) -> bool {
        match *self {
            Self::Receiving { expected, received } => {
                let received = received + 1;
                if received >= expected {
                    *self = Self::Inactive;
                    false
                } else {
                    *self = Self::Receiving { expected, received };
                    true
                }
            }
            Self::Inactive | Self::AwaitingCount => true,
        }
    }

    pub fn is_active(&self) -> bool {
        *self != Self::Inactive
    }

    pub fn reset(&mut self) {
        *self = Self::Inactive;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn segments(n: u32) -> Vec<Segment> {
        (0..n)
            .map(|i| {
                let mut s = Segment::new(i + 1, format!("Segment {}", i + 1), 0, 10 * (i as u16 + 1));
                s.effect = "Fire".into();
                s
            })
            .collect()
    }

    fn drive(sm: &mut ConfigTransferStateMachine, acks: usize) -> Vec<Command> {
        (0..acks)
            .filter_map(|_| match sm.on_ack() {
                TransferStep::Send(c) => Some(c),
                _ => None,
            })
            .collect()
    }

    #[test]
    fn test_ack_count_returns_to_idle() {
        let segs = segments(3);
        let required = ConfigTransferStateMachine::acks_required(&segs, 20);
        let mut sm = ConfigTransferStateMachine::new(20);

        assert_eq!(
            sm.begin_full_config_push(segs.clone()).unwrap(),
            Command::begin_segment_push()
        );
        assert_eq!(sm.state(), TransferState::AwaitingStartAck);

        drive(&mut sm, required - 1);
        assert!(matches!(sm.state(), TransferState::SendingSegmentChunk { segment_index: 2, .. }));

        assert_eq!(sm.on_ack(), TransferStep::Completed { segments: 3 });
        assert_eq!(sm.state(), TransferState::Idle);
    }

    #[test]
    fn test_every_short_ack_count_stays_in_chunks() {
        let segs = segments(3);
        let required = ConfigTransferStateMachine::acks_required(&segs, 20);

        for acks in 2..required {
            let mut sm = ConfigTransferStateMachine::new(20);
            sm.begin_full_config_push(segs.clone()).unwrap();
            drive(&mut sm, acks);
            assert!(
                matches!(sm.state(), TransferState::SendingSegmentChunk { .. }),
                "after {} of {} ACKs: {:?}",
                acks,
                required,
                sm.state()
            );
        }
    }

    #[test]
    fn test_rejects_more_segments_than_count_field_holds() {
        let mut sm = ConfigTransferStateMachine::new(20);
        let too_many = vec![Segment::new(1, "S", 0, 0); usize::from(u16::MAX) + 1];
        assert!(matches!(
            sm.begin_full_config_push(too_many),
            Err(ProtocolError::TooManySegments(65536))
        ));
        assert_eq!(sm.state(), TransferState::Idle);

        let most = vec![Segment::new(1, "S", 0, 0); usize::from(u16::MAX)];
        sm.begin_full_config_push(most).unwrap();
        assert_eq!(sm.on_ack(), TransferStep::Send(Command::segment_count(u16::MAX)));
    }

    #[test]
    fn test_chunks_reassemble_to_segment_json() {
        let segs = segments(2);
        let mut sm = ConfigTransferStateMachine::new(20);
        sm.begin_full_config_push(segs.clone()).unwrap();

        let sent = drive(&mut sm, ConfigTransferStateMachine::acks_required(&segs, 20));
        assert_eq!(sent[0].as_bytes(), &[0x00, 0x02]);
        assert!(sent.iter().all(|c| c.len() <= 20));

        let body: Vec<u8> = sent[1..].iter().flat_map(|c| c.as_bytes().to_vec()).collect();
        let expected = format!(
            "{}{}",
            segs[0].to_wire_json().unwrap(),
            segs[1].to_wire_json().unwrap()
        );
        assert_eq!(String::from_utf8(body).unwrap(), expected);
    }

    #[test]
    fn test_chunk_offsets_advance_by_payload() {
        let segs = segments(1);
        let mut sm = ConfigTransferStateMachine::new(20);
        sm.begin_full_config_push(segs).unwrap();
        sm.on_ack();
        sm.on_ack();
        assert_eq!(
            sm.state(),
            TransferState::SendingSegmentChunk { segment_index: 0, chunk_offset: 0 }
        );
        sm.on_ack();
        assert_eq!(
            sm.state(),
            TransferState::SendingSegmentChunk { segment_index: 0, chunk_offset: 20 }
        );
    }

    #[test]
    fn test_empty_push_finishes_after_count() {
        let mut sm = ConfigTransferStateMachine::new(20);
        sm.begin_full_config_push(Vec::new()).unwrap();
        assert_eq!(sm.on_ack(), TransferStep::Send(Command::segment_count(0)));
        assert_eq!(sm.on_ack(), TransferStep::Completed { segments: 0 });
    }

    #[test]
    fn test_begin_while_active_is_refused() {
        let mut sm = ConfigTransferStateMachine::new(20);
        sm.begin_full_config_push(segments(1)).unwrap();
        assert!(matches!(
            sm.begin_full_config_push(segments(2)),
            Err(ProtocolError::TransferInProgress)
        ));
        assert_eq!(sm.state(), TransferState::AwaitingStartAck);
    }

    #[test]
    fn test_idle_ack_is_ignored_and_abort_resets() {
        let mut sm = ConfigTransferStateMachine::new(20);
        assert_eq!(sm.on_ack(), TransferStep::Ignored);

        sm.begin_full_config_push(segments(2)).unwrap();
        sm.on_ack();
        sm.abort();
        assert_eq!(sm.state(), TransferState::Idle);
        assert_eq!(sm.on_ack(), TransferStep::Ignored);
    }

    #[test]
    fn test_pull_sequence_acks_exactly_count_times() {
        let mut pull = PullSequence::default();
        pull.request();
        let mut acks = usize::from(pull.on_count(4));
        for _ in 0..4 {
            acks += usize::from(pull.on_item());
        }
        assert_eq!(acks, 4);
        assert!(!pull.is_active());

        pull.request();
        assert!(!pull.on_count(0));
        assert!(!pull.is_active());
    }
}
