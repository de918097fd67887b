use crate::device::event_codes::*;
use crate::device::{KeyBits, RawEvent};
use crate::error::HotkeyError;
use crate::HotkeyResult;
use chrono::{DateTime, Utc};
use std::collections::BTreeSet;
use std::path::Path;
use std::sync::Arc;

/// A decoded input event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Event {
    /// The device the event was read from.
    pub device: Arc<Path>,
    /// The event type (`EV_KEY`, `EV_LED`, ...).
    pub ty: u16,
    pub code: u16,
    pub value: i32,
    /// The kernel timestamp of the record.
    pub timestamp: DateTime<Utc>,
}

/// What happened to a key.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyEventCause {
    Press,
    Release,
    /// Autorepeat while the key is held down.
    Repeat,
}

impl Event {
    /// The key code and cause, if this is an `EV_KEY` event.
    pub fn key(&self) -> Option<(u16, KeyEventCause)> {
        if self.ty != EV_KEY {
            return None;
        }

        let cause = match self.value {
            EV_KEY_RELEASE => KeyEventCause::Release,
            EV_KEY_PRESS => KeyEventCause::Press,
            EV_KEY_REPEAT => KeyEventCause::Repeat,
            _ => return None,
        };

        Some((self.code, cause))
    }
}

/// The result of feeding one raw record to the [`Decoder`].
#[derive(Debug, PartialEq)]
pub(crate) enum Decoded {
    Event(Event),
    /// The record carries nothing worth forwarding.
    Skipped,
    /// The kernel dropped records; the decoder is discarding input until the next report
    /// boundary.
    Dropped,
    /// A report boundary was reached after a drop. The caller should reconcile the key
    /// state with [`Decoder::reconcile`].
    Resynced,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Normal,
    Resync,
}

/// Turns the raw records of one device into [`Event`]s.
#[derive(Debug)]
pub(crate) struct Decoder {
    device: Arc<Path>,
    phase: Phase,
    pressed: BTreeSet<u16>,
}

impl Decoder {
    pub(crate) fn new(device: Arc<Path>) -> Self {
        Self {
            device,
            phase: Phase::Normal,
            pressed: BTreeSet::new(),
        }
    }

    pub(crate) fn feed(&mut self, raw: &RawEvent) -> HotkeyResult<Decoded> {
        if self.phase == Phase::Resync {
            if raw.ty == EV_SYN && raw.code == SYN_REPORT {
                self.phase = Phase::Normal;
                return Ok(Decoded::Resynced);
            }

            return Ok(Decoded::Skipped);
        }

        match (raw.ty, raw.code) {
            (EV_SYN, SYN_DROPPED) => {
                self.phase = Phase::Resync;
                Ok(Decoded::Dropped)
            }
            (EV_SYN, _) | (EV_MSC, _) => Ok(Decoded::Skipped),
            _ => {
                let timestamp = micros_to_nanos(raw.usec)
                    .and_then(|nsec| DateTime::<Utc>::from_timestamp(raw.sec, nsec))
                    .ok_or(HotkeyError::InvalidTimestamp(raw.sec, raw.usec))?;

                if raw.ty == EV_KEY {
                    self.track(raw.code, raw.value);
                }

                Ok(Decoded::Event(self.event(raw.ty, raw.code, raw.value, timestamp)))
            }
        }
    }

    /// Bring the tracked key state in line with `held`, returning a synthetic event for every
    /// key whose state differed.
    pub(crate) fn reconcile(&mut self, held: &KeyBits, timestamp: DateTime<Utc>) -> Vec<Event> {
        let released = self
            .pressed
            .iter()
            .copied()
            .filter(|code| !held.contains(*code))
            .collect::<Vec<_>>();
        let pressed = held
            .iter()
            .filter(|code| !self.pressed.contains(code))
            .collect::<Vec<_>>();

        let mut events = Vec::with_capacity(released.len() + pressed.len());

        for code in released {
            self.pressed.remove(&code);
            events.push(self.event(EV_KEY, code, EV_KEY_RELEASE, timestamp));
        }

        for code in pressed {
            self.pressed.insert(code);
            events.push(self.event(EV_KEY, code, EV_KEY_PRESS, timestamp));
        }

        events
    }

    fn track(&mut self, code: u16, value: i32) {
        match value {
            EV_KEY_RELEASE => {
                self.pressed.remove(&code);
            }
            EV_KEY_PRESS | EV_KEY_REPEAT => {
                self.pressed.insert(code);
            }
            _ => {}
        }
    }

    fn event(&self, ty: u16, code: u16, value: i32, timestamp: DateTime<Utc>) -> Event {
        Event {
            device: Arc::clone(&self.device),
            ty,
            code,
            value,
            timestamp,
        }
    }
}

fn micros_to_nanos(usec: i64) -> Option<u32> {
    usec.checked_mul(1000)
        .and_then(|nsec| u32::try_from(nsec).ok())
}
