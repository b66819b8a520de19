//!
//! The redundant pseudo-transport
//!
//! Presents a single [`Transport`] facade over any number of dissimilar
//! inferior transports. Transmission broadcasts to every inferior and
//! succeeds as soon as any of them accepts; reception feeds every inferior
//! through a deduplicator so each transfer surfaces exactly once, whichever
//! inferior finishes reassembling it first.
//!

use std::cell::RefCell;
use std::collections::{HashMap, VecDeque};
use std::rc::Rc;
use std::time::Duration;

use bernicla_core::error::{Error, Result};
use bernicla_core::session::TransferIdTracker;
use bernicla_core::time::{MonotonicTime, POLL_QUANTUM};
use bernicla_core::trace::{Capture, CaptureHandler, TraceEvent, Tracer};
use bernicla_core::transfer::{
    DataSpecifier, InputSessionSpecifier, OutputSessionSpecifier, SpoofTransfer, TransferIn,
    TransferOut,
};
use bernicla_core::transport::{ProtocolParameters, Transport, TransportStatistics};
use bernicla_core::NodeId;

/// How long a deduplication window remembers the last accepted transfer ID
/// of a source before assuming the counter restarted
const DEDUP_WINDOW: Duration = Duration::from_secs(2);

/// Per-source deduplication state of one input session
struct DedupEntry {
    tracker: TransferIdTracker,
    last_seen: MonotonicTime,
}

struct InputState {
    extent: usize,
    refs: usize,
    queue: VecDeque<TransferIn>,
    dedup: HashMap<Option<NodeId>, DedupEntry>,
}

/// A single `Transport` over N inferiors
pub struct RedundantTransport {
    inferiors: Vec<Box<dyn Transport>>,
    inputs: HashMap<InputSessionSpecifier, InputState>,
    outputs: HashMap<OutputSessionSpecifier, usize>,
    /// The node identity every inferior must agree on, fixed by the first one
    expected_node: Option<Option<NodeId>>,
    capture: Option<Rc<RefCell<CaptureHandler>>>,
    statistics: TransportStatistics,
    closed: bool,
}

impl RedundantTransport {
    pub fn new() -> Self {
        RedundantTransport {
            inferiors: Vec::new(),
            inputs: HashMap::new(),
            outputs: HashMap::new(),
            expected_node: None,
            capture: None,
            statistics: TransportStatistics::default(),
            closed: false,
        }
    }

    /// Adds an inferior, replaying every open session onto it
    ///
    /// The inferior must agree with the existing ones on the local node
    /// identity. Transfer-ID counters live above the transport, so attaching
    /// does not reset sequence numbers.
    pub fn attach(&mut self, mut inferior: Box<dyn Transport>) -> Result<()> {
        self.check_open()?;
        match self.expected_node {
            None => self.expected_node = Some(inferior.local_node_id()),
            Some(expected) => {
                if inferior.local_node_id() != expected {
                    return Err(Error::InvalidTransportConfiguration(format!(
                        "inferior node identity {:?} differs from the group's {:?}",
                        inferior.local_node_id(),
                        expected
                    )));
                }
            }
        }
        for (spec, state) in &self.inputs {
            inferior.open_input(spec, state.extent)?;
        }
        for spec in self.outputs.keys() {
            inferior.open_output(spec)?;
        }
        if let Some(capture) = &self.capture {
            inferior.begin_capture(forwarding_handler(capture.clone()));
        }
        self.inferiors.push(inferior);
        Ok(())
    }

    /// Removes and closes the inferior at `index`
    pub fn detach(&mut self, index: usize) -> Result<()> {
        if index >= self.inferiors.len() {
            return Err(Error::InvalidValue("inferior index"));
        }
        let mut inferior = self.inferiors.remove(index);
        inferior.close();
        Ok(())
    }

    pub fn inferior_count(&self) -> usize {
        self.inferiors.len()
    }

    fn check_open(&self) -> Result<()> {
        if self.closed {
            Err(Error::ResourceClosed)
        } else {
            Ok(())
        }
    }

    /// The transfer-ID modulo shared by the group: the tightest inferior wins
    fn group_modulo(&self) -> u64 {
        self.inferiors
            .iter()
            .map(|inferior| inferior.protocol_parameters().transfer_id_modulo)
            .filter(|&modulo| modulo != 0)
            .min()
            .unwrap_or(0)
    }

    /// Drains one inferior non-blockingly and dedups whatever it yields
    fn drain_inferior(&mut self, index: usize, spec: &InputSessionSpecifier) {
        let modulo = self.group_modulo();
        let now = MonotonicTime::now();
        loop {
            let received = match self.inferiors[index].receive(spec, now) {
                Ok(received) => received,
                Err(error) => {
                    log::warn!("redundant inferior {} failed on receive: {}", index, error);
                    return;
                }
            };
            let transfer = match received {
                Some(transfer) => transfer,
                None => return,
            };
            let state = match self.inputs.get_mut(spec) {
                Some(state) => state,
                None => return,
            };
            let entry = state
                .dedup
                .entry(transfer.source)
                .or_insert_with(|| DedupEntry {
                    tracker: TransferIdTracker::with_default_tolerance(modulo),
                    last_seen: now,
                });
            if now.saturating_duration_since(entry.last_seen) > DEDUP_WINDOW {
                entry.tracker.reset();
            }
            entry.last_seen = now;
            if entry.tracker.accept_strict(transfer.transfer_id) {
                state.queue.push_back(transfer);
                self.statistics.transfers_received += 1;
            } else {
                // The same transfer already arrived through a faster inferior
                self.statistics.frames_dropped += 1;
            }
        }
    }

    /// Gives every inferior a bounded slice of the wait
    fn pump(&mut self, spec: Option<&InputSessionSpecifier>, deadline: MonotonicTime) {
        if self.inferiors.is_empty() {
            // Nothing to wait on; pace the caller's loop instead of spinning
            std::thread::sleep(POLL_QUANTUM.min(Duration::from_millis(1)));
            return;
        }
        let count = self.inferiors.len() as u32;
        for index in 0..self.inferiors.len() {
            let slice = (MonotonicTime::now() + POLL_QUANTUM / count).min(deadline);
            if let Err(error) = self.inferiors[index].poll(slice) {
                log::warn!("redundant inferior {} failed on poll: {}", index, error);
            }
            if let Some(spec) = spec {
                self.drain_inferior(index, spec);
            }
        }
    }
}

impl Default for RedundantTransport {
    fn default() -> Self {
        Self::new()
    }
}

fn forwarding_handler(shared: Rc<RefCell<CaptureHandler>>) -> CaptureHandler {
    Box::new(move |capture: &Capture| {
        let mut handler = shared.borrow_mut();
        (handler.as_mut())(capture);
    })
}

impl Transport for RedundantTransport {
    fn protocol_parameters(&self) -> ProtocolParameters {
        ProtocolParameters {
            transfer_id_modulo: self.group_modulo(),
            max_node_id: self
                .inferiors
                .iter()
                .map(|inferior| inferior.protocol_parameters().max_node_id)
                .min()
                .unwrap_or(0),
            mtu: self
                .inferiors
                .iter()
                .map(|inferior| inferior.protocol_parameters().mtu)
                .min()
                .unwrap_or(0),
        }
    }

    fn local_node_id(&self) -> Option<NodeId> {
        self.expected_node.flatten()
    }

    fn open_output(&mut self, spec: &OutputSessionSpecifier) -> Result<()> {
        self.check_open()?;
        if !self.outputs.contains_key(spec) {
            for inferior in &mut self.inferiors {
                inferior.open_output(spec)?;
            }
        }
        *self.outputs.entry(*spec).or_insert(0) += 1;
        Ok(())
    }

    fn close_output(&mut self, spec: &OutputSessionSpecifier) {
        let remove = match self.outputs.get_mut(spec) {
            Some(refs) => {
                *refs -= 1;
                *refs == 0
            }
            None => false,
        };
        if remove {
            self.outputs.remove(spec);
            for inferior in &mut self.inferiors {
                inferior.close_output(spec);
            }
        }
    }

    fn send(&mut self, spec: &OutputSessionSpecifier, transfer: TransferOut) -> Result<()> {
        self.check_open()?;
        if self.inferiors.is_empty() {
            return Err(Error::SendFailed("no inferior transports attached".into()));
        }
        // Broadcast; the transfer is delivered if any inferior accepts it.
        // With the reactor model the submissions run back to back, each
        // bounded by the same absolute deadline.
        let mut errors = Vec::new();
        let mut accepted = false;
        for (index, inferior) in self.inferiors.iter_mut().enumerate() {
            match inferior.send(spec, transfer.clone()) {
                Ok(()) => accepted = true,
                Err(error) => {
                    log::warn!("redundant inferior {} failed on send: {}", index, error);
                    errors.push(format!("inferior {}: {}", index, error));
                }
            }
        }
        if accepted {
            self.statistics.transfers_sent += 1;
            Ok(())
        } else {
            Err(Error::SendFailed(errors.join("; ")))
        }
    }

    fn open_input(&mut self, spec: &InputSessionSpecifier, extent: usize) -> Result<()> {
        self.check_open()?;
        if !self.inputs.contains_key(spec) {
            for inferior in &mut self.inferiors {
                inferior.open_input(spec, extent)?;
            }
        }
        let state = self.inputs.entry(*spec).or_insert_with(|| InputState {
            extent,
            refs: 0,
            queue: VecDeque::new(),
            dedup: HashMap::new(),
        });
        state.refs += 1;
        state.extent = state.extent.max(extent);
        Ok(())
    }

    fn close_input(&mut self, spec: &InputSessionSpecifier) {
        let remove = match self.inputs.get_mut(spec) {
            Some(state) => {
                state.refs = state.refs.saturating_sub(1);
                state.refs == 0
            }
            None => false,
        };
        if remove {
            self.inputs.remove(spec);
            for inferior in &mut self.inferiors {
                inferior.close_input(spec);
            }
        }
    }

    fn receive(
        &mut self,
        spec: &InputSessionSpecifier,
        deadline: MonotonicTime,
    ) -> Result<Option<TransferIn>> {
        loop {
            self.check_open()?;
            // Drain whatever the inferiors already hold before waiting
            for index in 0..self.inferiors.len() {
                self.drain_inferior(index, spec);
            }
            if let Some(state) = self.inputs.get_mut(spec) {
                if let Some(transfer) = state.queue.pop_front() {
                    return Ok(Some(transfer));
                }
            } else {
                return Err(Error::InvalidTransportConfiguration(
                    "receive on an input session that was never opened".into(),
                ));
            }
            if MonotonicTime::now() >= deadline {
                return Ok(None);
            }
            self.pump(Some(spec), deadline);
        }
    }

    fn poll(&mut self, deadline: MonotonicTime) -> Result<()> {
        loop {
            self.check_open()?;
            self.pump(None, deadline);
            if MonotonicTime::now() >= deadline {
                return Ok(());
            }
        }
    }

    fn spoof(&mut self, transfer: SpoofTransfer, deadline: MonotonicTime) -> Result<()> {
        self.check_open()?;
        if self.inferiors.is_empty() {
            return Err(Error::SendFailed("no inferior transports attached".into()));
        }
        let mut errors = Vec::new();
        let mut accepted = false;
        for (index, inferior) in self.inferiors.iter_mut().enumerate() {
            match inferior.spoof(transfer.clone(), deadline) {
                Ok(()) => accepted = true,
                Err(error) => errors.push(format!("inferior {}: {}", index, error)),
            }
        }
        if accepted {
            Ok(())
        } else {
            Err(Error::SendFailed(errors.join("; ")))
        }
    }

    fn begin_capture(&mut self, handler: CaptureHandler) {
        let shared = Rc::new(RefCell::new(handler));
        for inferior in &mut self.inferiors {
            inferior.begin_capture(forwarding_handler(shared.clone()));
        }
        self.capture = Some(shared);
    }

    fn make_tracer(&self) -> Box<dyn Tracer> {
        Box::new(RedundantTracer {
            inner: self
                .inferiors
                .iter()
                .map(|inferior| inferior.make_tracer())
                .collect(),
            dedup: HashMap::new(),
            modulo: self.group_modulo(),
        })
    }

    fn statistics(&self) -> TransportStatistics {
        // Aggregate of the group plus the dedup bookkeeping
        let mut total = self.statistics;
        for inferior in &self.inferiors {
            let stats = inferior.statistics();
            total.frames_sent += stats.frames_sent;
            total.frames_received += stats.frames_received;
            total.reassembly_errors += stats.reassembly_errors;
            total.frames_dropped += stats.frames_dropped;
        }
        total
    }

    fn close(&mut self) {
        if !self.closed {
            for inferior in &mut self.inferiors {
                inferior.close();
            }
            self.inputs.clear();
            self.outputs.clear();
            self.closed = true;
        }
    }

    fn is_closed(&self) -> bool {
        self.closed
    }
}

/// Traces a capture stream that mixes all inferiors, deduplicating transfers
struct RedundantTracer {
    inner: Vec<Box<dyn Tracer>>,
    dedup: HashMap<(Option<NodeId>, DataSpecifier), TransferIdTracker>,
    modulo: u64,
}

impl Tracer for RedundantTracer {
    fn update(&mut self, capture: &Capture) -> Option<TraceEvent> {
        for tracer in &mut self.inner {
            match tracer.update(capture) {
                None => continue,
                Some(TraceEvent::Transfer(traced)) => {
                    let key = (traced.transfer.source, traced.data_specifier);
                    let modulo = self.modulo;
                    let tracker = self
                        .dedup
                        .entry(key)
                        .or_insert_with(|| TransferIdTracker::with_default_tolerance(modulo));
                    if tracker.accept_strict(traced.transfer.transfer_id) {
                        return Some(TraceEvent::Transfer(traced));
                    }
                    return None;
                }
                Some(event) => return Some(event),
            }
        }
        None
    }
}
