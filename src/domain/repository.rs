//! Last-known-good device state
//!
//! Each repository is a single writer over a `tokio::sync::watch` channel.
//! The protocol session owns the writer; readers get cheap snapshots or
//! subscribe for change notifications without ever racing the writer.

use crate::domain::models::{Effect, Segment};
use tokio::sync::watch;

/// Effects keyed by name, in the order the device reported them
pub struct EffectsRepository {
    tx: watch::Sender<Vec<Effect>>,
}

impl EffectsRepository {
    pub fn new() -> Self {
        let (tx, _) = watch::channel(Vec::new());
        Self { tx }
    }

    /// Replace the whole collection
    pub fn replace(&self, effects: Vec<Effect>) {
        self.tx.send_replace(effects);
    }

    /// Replace the effect with the same name, or append it
    pub fn upsert(&self, effect: Effect) {
        self.tx.send_modify(|effects| {
            match effects.iter_mut().find(|e| e.name == effect.name) {
                Some(existing) => *existing = effect,
                None => effects.push(effect),
            }
        });
    }

    pub fn snapshot(&self) -> Vec<Effect> {
        self.tx.borrow().clone()
    }

    pub fn index_of(&self, name: &str) -> Option<usize> {
        self.tx.borrow().iter().position(|e| e.name == name)
    }

    pub fn subscribe(&self) -> watch::Receiver<Vec<Effect>> {
        self.tx.subscribe()
    }
}

impl Default for EffectsRepository {
    fn default() -> Self {
        Self::new()
    }
}

/// Segments keyed by id
pub struct SegmentsRepository {
    tx: watch::Sender<Vec<Segment>>,
}

impl SegmentsRepository {
    pub fn new() -> Self {
        let (tx, _) = watch::channel(Vec::new());
        Self { tx }
    }

    pub fn replace(&self, segments: Vec<Segment>) {
        self.tx.send_replace(segments);
    }

    /// Replace the segment with the same id, or append it
    pub fn upsert(&self, segment: Segment) {
        self.tx.send_modify(|segments| {
            match segments.iter_mut().find(|s| s.id == segment.id) {
                Some(existing) => *existing = segment,
                None => segments.push(segment),
            }
        });
    }

    pub fn snapshot(&self) -> Vec<Segment> {
        self.tx.borrow().clone()
    }

    /// Position of a segment as the firmware indexes it
    pub fn index_of(&self, id: u32) -> Option<usize> {
        self.tx.borrow().iter().position(|s| s.id == id)
    }

    pub fn subscribe(&self) -> watch::Receiver<Vec<Segment>> {
        self.tx.subscribe()
    }
}

impl Default for SegmentsRepository {
    fn default() -> Self {
        Self::new()
    }
}
