//! Slot scheduler for the advertising superframe.
//!
//! ## Superframe
//!
//! ```text
//! 0          2000        4000                                   36000 ms
//! | advertise | guard     | slot 0 | slot 1 | ... | slot 319     |
//! ```
//!
//! The superframe starts at the scheduler epoch and repeats every
//! `ADVERTISING_INTERVAL`. Only the slot region is allocatable. Each handler
//! owns a series of recurring events spaced by its period; uplink series also
//! reserve an RX1 and RX2 window after every instance.
//!
//! Allocation is all-or-nothing: the whole series, including reception
//! windows, is checked against the existing events before anything is
//! committed. Events never overlap and `order` is kept sorted by start slot.

use alloc::vec::Vec;
use core::fmt;

use log::{debug, error, trace};

use crate::collections::{Key, Pool};
use crate::time::{Duration, Timestamp};
use crate::types::{
    Error, Result, ADVERTISING_GUARD_TIME, ADVERTISING_INTERVAL, ADVERTISING_RESERVED_TIME,
    AVAILABLE_SLOT_TIME, MAX_ALLOCATION_TRIES, MULTICAST_RESERVED_TIME, NOF_AVAILABLE_SLOTS,
    RECEPTION_RESERVED_TIME, RX1_DELAY, RX2_DELAY, TIME_PER_SLOT, UPLINK_RESERVED_TIME,
};

pub type HandlerKey = Key<EventHandler>;
pub type EventKey = Key<ScheduledEvent>;

/// Offset of slot 0 from the superframe start.
pub const SLOT_REGION_START: Duration = Duration::from_millis(
    ADVERTISING_RESERVED_TIME.as_millis() + ADVERTISING_GUARD_TIME.as_millis(),
);

const RX1_OFFSET: u16 = (RX1_DELAY.as_millis() / TIME_PER_SLOT.as_millis()) as u16;
const RX2_OFFSET: u16 = (RX2_DELAY.as_millis() / TIME_PER_SLOT.as_millis()) as u16;

/// Kind of activity a handler schedules.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum EventType {
    Uplink,
    Multicast,
    SyncRx,
    Rx1Window,
    Rx2Window,
}

impl EventType {
    pub fn duration(self) -> Duration {
        match self {
            EventType::Uplink => UPLINK_RESERVED_TIME,
            EventType::Multicast => MULTICAST_RESERVED_TIME,
            EventType::SyncRx | EventType::Rx1Window | EventType::Rx2Window => {
                RECEPTION_RESERVED_TIME
            }
        }
    }

    /// Duration in whole slots.
    pub fn slots(self) -> u16 {
        self.duration().as_slots_ceil() as u16
    }

    /// Transmissions are allowed inside these reservations.
    pub fn allows_tx(self) -> bool {
        matches!(self, EventType::Uplink | EventType::Multicast)
    }
}

impl fmt::Display for EventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            EventType::Uplink => "UPLINK",
            EventType::Multicast => "MULTICAST",
            EventType::SyncRx => "SYNC_RX",
            EventType::Rx1Window => "RX1",
            EventType::Rx2Window => "RX2",
        };
        f.write_str(name)
    }
}

/// A recurring activity and the head of its event chain.
#[derive(Clone, Debug)]
pub struct EventHandler {
    pub event_type: EventType,
    pub period: Duration,
    /// Opaque value handed back on dispatch (port, group address, ...).
    pub context: u32,
    first: Option<EventKey>,
}

impl EventHandler {
    pub fn first_event(&self) -> Option<EventKey> {
        self.first
    }
}

/// One slot reservation `[start, end)`.
#[derive(Clone, Debug)]
pub struct ScheduledEvent {
    pub handler: HandlerKey,
    pub start: u16,
    pub end: u16,
    next_recurring: Option<EventKey>,
    rx_windows: Option<(EventKey, EventKey)>,
}

impl ScheduledEvent {
    pub fn next_recurring(&self) -> Option<EventKey> {
        self.next_recurring
    }

    pub fn rx_windows(&self) -> Option<(EventKey, EventKey)> {
        self.rx_windows
    }

    fn overlaps(&self, span: Span) -> bool {
        self.start < span.end && span.start < self.end
    }
}

/// Slot reached by the dispatcher.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SlotAction {
    pub handler: HandlerKey,
    pub event_type: EventType,
    pub context: u32,
    pub slot: u16,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
struct Span {
    start: u16,
    end: u16,
}

impl Span {
    fn new(start: u16, len: u16) -> Self {
        Self {
            start,
            end: start + len,
        }
    }

    fn overlaps(&self, other: &Span) -> bool {
        self.start < other.end && other.start < self.end
    }
}

#[derive(Clone, Copy, Debug)]
struct Instance {
    main: Span,
    rx: Option<(Span, Span)>,
}

impl Instance {
    fn at(start: u16, slots: u16, rx_windows: bool) -> Self {
        let rx_slots = EventType::Rx1Window.slots();
        Self {
            main: Span::new(start, slots),
            rx: rx_windows.then(|| {
                (
                    Span::new(start + RX1_OFFSET, rx_slots),
                    Span::new(start + RX2_OFFSET, rx_slots),
                )
            }),
        }
    }

    fn spans(&self) -> impl Iterator<Item = Span> {
        let rx = self.rx;
        core::iter::once(self.main)
            .chain(rx.map(|(a, _)| a))
            .chain(rx.map(|(_, b)| b))
    }

    fn end(&self) -> u16 {
        self.spans().map(|s| s.end).max().unwrap_or(self.main.end)
    }

    fn event_count(&self) -> usize {
        if self.rx.is_some() {
            3
        } else {
            1
        }
    }
}

/// Superframe slot allocator and dispatcher.
pub struct Scheduler {
    handlers: Pool<EventHandler>,
    events: Pool<ScheduledEvent>,
    /// Live events sorted by start slot.
    order: Vec<EventKey>,
    /// Index into `order` of the event the timer is armed for.
    next: usize,
    timer: Option<Timestamp>,
    epoch: Timestamp,
    rx1_handler: HandlerKey,
    rx2_handler: HandlerKey,
}

impl Scheduler {
    /// Create a scheduler whose superframe starts at `epoch`.
    ///
    /// `max_handlers` includes the two fixed reception-window handlers.
    pub fn new(max_events: usize, max_handlers: usize, epoch: Timestamp) -> Result<Self> {
        let mut handlers = Pool::with_capacity(max_handlers);
        let mut window = |event_type| {
            handlers
                .insert(EventHandler {
                    event_type,
                    period: Duration::ZERO,
                    context: 0,
                    first: None,
                })
                .map_err(|_| Error::NotAvail)
        };
        let rx1_handler = window(EventType::Rx1Window)?;
        let rx2_handler = window(EventType::Rx2Window)?;
        Ok(Self {
            handlers,
            events: Pool::with_capacity(max_events),
            order: Vec::with_capacity(max_events),
            next: 0,
            timer: None,
            epoch,
            rx1_handler,
            rx2_handler,
        })
    }

    pub fn epoch(&self) -> Timestamp {
        self.epoch
    }

    /// When the dispatcher next expects to fire.
    pub fn timer(&self) -> Option<Timestamp> {
        self.timer
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }

    pub fn handler(&self, key: HandlerKey) -> Option<&EventHandler> {
        self.handlers.get(key)
    }

    pub fn event(&self, key: EventKey) -> Option<&ScheduledEvent> {
        self.events.get(key)
    }

    pub fn handlers(&self) -> impl Iterator<Item = (HandlerKey, &EventHandler)> {
        self.handlers.iter()
    }

    /// Live events in slot order.
    pub fn events(&self) -> impl Iterator<Item = (EventKey, &ScheduledEvent)> {
        self.order
            .iter()
            .filter_map(|&k| self.events.get(k).map(|e| (k, e)))
    }

    /// Number of recurring instances scheduled for a handler.
    pub fn instances(&self, handler: HandlerKey) -> usize {
        let mut count = 0;
        let mut cursor = self.handlers.get(handler).and_then(|h| h.first);
        while let Some(key) = cursor {
            count += 1;
            cursor = self.events.get(key).and_then(|e| e.next_recurring);
        }
        count
    }

    /// Slot containing `now`, or `None` inside the advertising and guard time.
    pub fn current_slot(&self, now: Timestamp) -> Option<u16> {
        let offset = now.offset_in_period(self.epoch, ADVERTISING_INTERVAL);
        if offset < SLOT_REGION_START {
            return None;
        }
        let slot = (offset - SLOT_REGION_START).as_millis() / TIME_PER_SLOT.as_millis();
        Some(slot as u16)
    }

    /// Time from `now` until the next start of `slot`.
    pub fn time_to_slot(&self, now: Timestamp, slot: u16) -> Duration {
        let t = now.offset_in_period(self.epoch, ADVERTISING_INTERVAL);
        let target = SLOT_REGION_START + Duration::from_slots(slot);
        if target > t {
            target - t
        } else {
            ADVERTISING_INTERVAL - t + target
        }
    }

    /// Register a handler without scheduling it.
    pub fn add_handler(
        &mut self,
        event_type: EventType,
        period: Duration,
        context: u32,
    ) -> Result<HandlerKey> {
        if matches!(event_type, EventType::Rx1Window | EventType::Rx2Window) {
            return Err(Error::Range);
        }
        self.handlers
            .insert(EventHandler {
                event_type,
                period,
                context,
                first: None,
            })
            .map_err(|_| Error::NotAvail)
    }

    /// Add a handler and schedule its series; the handler is released on failure.
    pub fn register(
        &mut self,
        event_type: EventType,
        period: Duration,
        context: u32,
        now: Timestamp,
    ) -> Result<HandlerKey> {
        let handler = self.add_handler(event_type, period, context)?;
        if let Err(e) = self.schedule_event(handler, now) {
            self.handlers.remove(handler);
            return Err(e);
        }
        Ok(handler)
    }

    /// Remove a handler together with all of its events.
    pub fn remove_handler(&mut self, handler: HandlerKey, now: Timestamp) -> Result<()> {
        if handler == self.rx1_handler || handler == self.rx2_handler {
            return Err(Error::Range);
        }
        self.remove_event(handler, now)?;
        self.handlers.remove(handler).ok_or(Error::Failed)?;
        Ok(())
    }

    /// Allocate the recurring series for `handler`.
    pub fn schedule_event(&mut self, handler: HandlerKey, now: Timestamp) -> Result<()> {
        let h = self.handlers.get(handler).ok_or(Error::Failed)?;
        if h.first.is_some() {
            return Err(Error::Failed);
        }
        let event_type = h.event_type;
        let period = h.period;

        let period_slots = period.as_slots_ceil();
        if period_slots == 0 || period_slots > u16::MAX as u64 {
            return Err(Error::Range);
        }
        let period_slots = period_slots as u16;
        let max_instances = AVAILABLE_SLOT_TIME.div_ceil(period) as usize;
        let slots = event_type.slots();
        let rx_windows = event_type == EventType::Uplink;

        if Self::self_collides(period_slots, max_instances, slots, rx_windows) {
            debug!(
                "{} period {}ms collides with itself",
                event_type,
                period.as_millis()
            );
            return Err(Error::Range);
        }

        let mut from = 0u16;
        for _ in 0..MAX_ALLOCATION_TRIES {
            let base = self.first_gap(from, slots).ok_or(Error::NotAvail)?;
            let series = Self::plan_series(base, period_slots, max_instances, slots, rx_windows);
            if series.is_empty() {
                return Err(Error::NotAvail);
            }
            match self.find_conflict(&series) {
                None => return self.commit(handler, event_type, &series, now),
                Some(shift) => {
                    trace!("slot {} blocked, shifting by {}", base, shift);
                    from = base.saturating_add(shift.max(1));
                }
            }
        }
        Err(Error::Failed)
    }

    /// Free every event of `handler`, including paired reception windows.
    pub fn remove_event(&mut self, handler: HandlerKey, now: Timestamp) -> Result<()> {
        let h = self.handlers.get_mut(handler).ok_or(Error::Failed)?;
        let mut cursor = h.first.take();
        while let Some(key) = cursor {
            let Some(event) = self.events.remove(key) else {
                break;
            };
            if let Some((rx1, rx2)) = event.rx_windows {
                self.events.remove(rx1);
                self.events.remove(rx2);
            }
            cursor = event.next_recurring;
        }
        let events = &self.events;
        self.order.retain(|&k| events.contains(k));
        self.rearm(now);
        Ok(())
    }

    /// Point the dispatcher at the first event after the current slot.
    pub fn rearm(&mut self, now: Timestamp) {
        if self.order.is_empty() {
            self.next = 0;
            self.timer = None;
            return;
        }
        self.next = match self.current_slot(now) {
            Some(slot) => self
                .order
                .iter()
                .position(|&k| self.start_of(k) > slot)
                .unwrap_or(0),
            None => 0,
        };
        let start = self.start_of(self.order[self.next]);
        self.timer = Some(now + self.time_to_slot(now, start));
    }

    /// Dispatch the event the timer was armed for, if due.
    ///
    /// A timer that fires outside the expected slot is drift: it is logged,
    /// the cursor is re-aligned to the current time and `Failed` returned.
    pub fn on_timer(&mut self, now: Timestamp) -> Result<Option<SlotAction>> {
        let Some(at) = self.timer else {
            return Ok(None);
        };
        if now < at {
            return Ok(None);
        }
        let Some(&key) = self.order.get(self.next) else {
            self.rearm(now);
            return Ok(None);
        };
        let Some((expected, handler)) = self.events.get(key).map(|e| (e.start, e.handler)) else {
            self.rearm(now);
            return Ok(None);
        };
        let current = self.current_slot(now);
        if current != Some(expected) {
            error!(
                "scheduler drift: expected slot {}, timer fired in {:?}",
                expected, current
            );
            self.rearm(now);
            return Err(Error::Failed);
        }

        let action = self.handlers.get(handler).map(|h| SlotAction {
            handler,
            event_type: h.event_type,
            context: h.context,
            slot: expected,
        });

        self.next = (self.next + 1) % self.order.len();
        let start = self.start_of(self.order[self.next]);
        self.timer = Some(now + self.time_to_slot(now, start));
        Ok(action)
    }

    /// Whether a transmission may start now.
    pub fn check_tx(&self, now: Timestamp) -> Result<()> {
        let Some(slot) = self.current_slot(now) else {
            return Err(Error::Busy);
        };
        let mut next_start = NOF_AVAILABLE_SLOTS;
        for (_, event) in self.events() {
            if event.start <= slot && slot < event.end {
                let allowed = self
                    .handlers
                    .get(event.handler)
                    .is_some_and(|h| h.event_type.allows_tx());
                return if allowed { Ok(()) } else { Err(Error::Busy) };
            }
            if event.start > slot {
                next_start = event.start;
                break;
            }
        }
        let offset = now.offset_in_period(self.epoch, ADVERTISING_INTERVAL) - SLOT_REGION_START;
        let remaining = Duration::from_slots(next_start).saturating_sub(offset);
        if remaining < ADVERTISING_GUARD_TIME {
            Err(Error::Busy)
        } else {
            Ok(())
        }
    }

    fn start_of(&self, key: EventKey) -> u16 {
        self.events.get(key).map_or(u16::MAX, |e| e.start)
    }

    /// The repeating pattern cannot overlap itself; four instances cover
    /// every offset an uplink and its two windows can reach.
    fn self_collides(period: u16, max_instances: usize, slots: u16, rx_windows: bool) -> bool {
        let probe: Vec<Span> = (0..max_instances.min(4) as u16)
            .flat_map(|k| Instance::at(k * period, slots, rx_windows).spans())
            .collect();
        probe
            .iter()
            .enumerate()
            .any(|(i, a)| probe[i + 1..].iter().any(|b| a.overlaps(b)))
    }

    /// First slot at or after `from` with `len` free slots.
    fn first_gap(&self, from: u16, len: u16) -> Option<u16> {
        let mut cursor = from;
        for (_, event) in self.events() {
            if event.end <= cursor {
                continue;
            }
            if event.start >= cursor + len {
                return Some(cursor);
            }
            cursor = cursor.max(event.end);
        }
        (cursor + len <= NOF_AVAILABLE_SLOTS).then_some(cursor)
    }

    /// Instances of a series starting at `base`, cut at the superframe end.
    fn plan_series(
        base: u16,
        period: u16,
        max_instances: usize,
        slots: u16,
        rx_windows: bool,
    ) -> Vec<Instance> {
        let mut series = Vec::new();
        for k in 0..max_instances {
            let Some(start) = (k as u32)
                .checked_mul(period as u32)
                .map(|o| o + base as u32)
                .filter(|&s| s < NOF_AVAILABLE_SLOTS as u32)
            else {
                break;
            };
            let instance = Instance::at(start as u16, slots, rx_windows);
            if instance.end() > NOF_AVAILABLE_SLOTS {
                break;
            }
            series.push(instance);
        }
        series
    }

    /// Shift needed to clear the first blocked span, if any.
    fn find_conflict(&self, series: &[Instance]) -> Option<u16> {
        for instance in series {
            for span in instance.spans() {
                if let Some((_, blocker)) = self.events().find(|(_, e)| e.overlaps(span)) {
                    return Some(blocker.end - span.start);
                }
            }
        }
        None
    }

    fn commit(
        &mut self,
        handler: HandlerKey,
        event_type: EventType,
        series: &[Instance],
        now: Timestamp,
    ) -> Result<()> {
        let needed: usize = series.iter().map(Instance::event_count).sum();
        if needed > self.events.available() {
            debug!(
                "{} needs {} events, {} free",
                event_type,
                needed,
                self.events.available()
            );
            return Err(Error::NotAvail);
        }

        let mut prev: Option<EventKey> = None;
        for instance in series.iter().rev() {
            let rx_windows = match instance.rx {
                Some((rx1, rx2)) => Some((
                    self.insert_event(self.rx1_handler, rx1)?,
                    self.insert_event(self.rx2_handler, rx2)?,
                )),
                None => None,
            };
            let key = self.insert_event(handler, instance.main)?;
            if let Some(event) = self.events.get_mut(key) {
                event.next_recurring = prev;
                event.rx_windows = rx_windows;
            }
            prev = Some(key);
        }
        if let Some(h) = self.handlers.get_mut(handler) {
            h.first = prev;
        }
        debug!(
            "scheduled {} x{} from slot {}",
            event_type,
            series.len(),
            series.first().map_or(0, |i| i.main.start)
        );
        self.rearm(now);
        Ok(())
    }

    fn insert_event(&mut self, handler: HandlerKey, span: Span) -> Result<EventKey> {
        let key = self
            .events
            .insert(ScheduledEvent {
                handler,
                start: span.start,
                end: span.end,
                next_recurring: None,
                rx_windows: None,
            })
            .map_err(|_| Error::NotAvail)?;
        let events = &self.events;
        let pos = self
            .order
            .partition_point(|&k| events.get(k).map_or(0, |e| e.start) < span.start);
        self.order.insert(pos, key);
        Ok(key)
    }
}
