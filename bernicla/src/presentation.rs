//!
//! The presentation layer: typed ports over an abstract transport
//!
//! Ports share the transport through a single-threaded handle. Output
//! sessions (and their transfer-ID counters) are shared by every port that
//! publishes to the same place; input sessions fan out to every subscriber of
//! a subject. The transport is driven from whichever port is currently
//! waiting, so there is no background task to manage.
//!

use std::cell::{Cell, RefCell};
use std::collections::{HashMap, VecDeque};
use std::marker::PhantomData;
use std::rc::Rc;

use bernicla_core::error::{Error, Result};
use bernicla_core::time::{MonotonicTime, Timestamp, POLL_QUANTUM};
use bernicla_core::trace::{CaptureHandler, Tracer};
use bernicla_core::transfer::{
    DataSpecifier, InputSessionSpecifier, OutputSessionSpecifier, SpoofTransfer, TransferIn,
    TransferOut,
};
use bernicla_core::transport::{Transport, TransportStatistics};
use bernicla_core::{NodeId, Priority, ServiceId, SubjectId, TransferId};

use crate::encoding::{do_serialize, Deserialize, Message, Request, Response, Serialize};

/// Everything about a received transfer except its payload
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransferMetadata {
    pub timestamp: Timestamp,
    pub priority: Priority,
    pub transfer_id: TransferId,
    pub source: Option<NodeId>,
}

impl TransferMetadata {
    fn of(transfer: &TransferIn) -> Self {
        TransferMetadata {
            timestamp: transfer.timestamp,
            priority: transfer.priority,
            transfer_id: transfer.transfer_id,
            source: transfer.source,
        }
    }
}

/// State of one shared output session
struct OutputState {
    refs: usize,
    next_transfer_id: TransferId,
}

/// Fan-out queues of one subscribed subject, keyed by subscriber
#[derive(Default)]
struct SubjectState {
    queues: HashMap<u64, VecDeque<TransferIn>>,
}

/// Shared state of the clients of one `(service, server)` pair
struct ClientShared {
    refs: usize,
    next_transfer_id: TransferId,
    /// One slot per call in flight, keyed by transfer ID; filled when the
    /// matching response arrives
    pending: HashMap<u64, Option<TransferIn>>,
}

struct Core {
    transport: Box<dyn Transport>,
    outputs: HashMap<OutputSessionSpecifier, OutputState>,
    subjects: HashMap<SubjectId, SubjectState>,
    clients: HashMap<(ServiceId, NodeId), ClientShared>,
    next_port_key: u64,
}

impl Core {
    fn allocate_transfer_id(&mut self, spec: &OutputSessionSpecifier) -> TransferId {
        let modulo = self.transport.protocol_parameters().transfer_id_modulo;
        let state = self
            .outputs
            .get_mut(spec)
            .expect("Bug: output session not open");
        let id = state.next_transfer_id;
        state.next_transfer_id = id.next(modulo);
        id
    }

    fn acquire_output(&mut self, spec: OutputSessionSpecifier) -> Result<()> {
        self.transport.open_output(&spec)?;
        let state = self.outputs.entry(spec).or_insert_with(|| OutputState {
            refs: 0,
            next_transfer_id: TransferId::default(),
        });
        state.refs += 1;
        Ok(())
    }

    fn release_output(&mut self, spec: &OutputSessionSpecifier) {
        if let Some(state) = self.outputs.get_mut(spec) {
            state.refs -= 1;
            if state.refs == 0 {
                self.outputs.remove(spec);
            }
        }
        self.transport.close_output(spec);
    }

    /// Waits briefly on the transport for the given subject and fans any
    /// arrival out to every subscriber queue
    fn pump_subject(
        &mut self,
        subject: SubjectId,
        spec: &InputSessionSpecifier,
        deadline: MonotonicTime,
    ) -> Result<()> {
        if let Some(transfer) = self.transport.receive(spec, deadline)? {
            if let Some(state) = self.subjects.get_mut(&subject) {
                for queue in state.queues.values_mut() {
                    queue.push_back(transfer.clone());
                }
            }
        }
        Ok(())
    }

    /// Waits briefly for a response and files it into its pending call slot
    fn pump_responses(
        &mut self,
        service: ServiceId,
        server: NodeId,
        spec: &InputSessionSpecifier,
        deadline: MonotonicTime,
    ) -> Result<()> {
        if let Some(transfer) = self.transport.receive(spec, deadline)? {
            if let Some(shared) = self.clients.get_mut(&(service, server)) {
                match shared.pending.get_mut(&transfer.transfer_id.to_u64()) {
                    Some(slot @ None) => *slot = Some(transfer),
                    Some(Some(_)) => {
                        log::warn!(
                            "duplicate response for service {} transfer {} dropped",
                            service,
                            transfer.transfer_id
                        );
                    }
                    None => {
                        log::warn!(
                            "unmatched response for service {} transfer {} from {:?} dropped",
                            service,
                            transfer.transfer_id,
                            transfer.source
                        );
                    }
                }
            }
        }
        Ok(())
    }
}

/// The entry point: binds typed ports to one transport
///
/// Dropping the last port of a session tears the session down; closing the
/// presentation closes the transport and fails every blocked operation with
/// `ResourceClosed` within one poll quantum.
pub struct Presentation {
    core: Rc<RefCell<Core>>,
}

impl Presentation {
    pub fn new(transport: Box<dyn Transport>) -> Self {
        Presentation {
            core: Rc::new(RefCell::new(Core {
                transport,
                outputs: HashMap::new(),
                subjects: HashMap::new(),
                clients: HashMap::new(),
                next_port_key: 0,
            })),
        }
    }

    pub fn local_node_id(&self) -> Option<NodeId> {
        self.core.borrow().transport.local_node_id()
    }

    /// Creates a publisher on a subject
    ///
    /// Publishers of the same subject share the output session and its
    /// transfer-ID counter.
    pub fn make_publisher<T: Message + Serialize>(
        &self,
        subject: SubjectId,
        priority: Priority,
    ) -> Result<Publisher<T>> {
        let spec = OutputSessionSpecifier::broadcast(subject);
        self.core.borrow_mut().acquire_output(spec)?;
        Ok(Publisher {
            core: self.core.clone(),
            spec,
            priority,
            _message: PhantomData,
        })
    }

    /// Creates a subscriber on a subject
    pub fn make_subscriber<T: Message + Deserialize>(
        &self,
        subject: SubjectId,
    ) -> Result<Subscriber<T>> {
        let spec = InputSessionSpecifier::promiscuous(DataSpecifier::Subject(subject));
        let mut core = self.core.borrow_mut();
        core.transport.open_input(&spec, T::EXTENT_BYTES)?;
        let key = core.next_port_key;
        core.next_port_key += 1;
        core.subjects
            .entry(subject)
            .or_default()
            .queues
            .insert(key, VecDeque::new());
        Ok(Subscriber {
            core: self.core.clone(),
            subject,
            spec,
            key,
            deserialization_failures: Cell::new(0),
            _message: PhantomData,
        })
    }

    /// Creates a client for a service hosted by a specific server node
    pub fn make_client<Req: Request + Serialize, Resp: Response + Deserialize>(
        &self,
        service: ServiceId,
        server: NodeId,
    ) -> Result<Client<Req, Resp>> {
        let out_spec = OutputSessionSpecifier::request(service, server);
        let in_spec = InputSessionSpecifier::selective(
            DataSpecifier::ServiceResponse(service),
            server,
        );
        let mut core = self.core.borrow_mut();
        core.transport.open_input(&in_spec, Resp::EXTENT_BYTES)?;
        if let Err(error) = core.acquire_output(out_spec) {
            core.transport.close_input(&in_spec);
            return Err(error);
        }
        let shared = core
            .clients
            .entry((service, server))
            .or_insert_with(|| ClientShared {
                refs: 0,
                next_transfer_id: TransferId::default(),
                pending: HashMap::new(),
            });
        shared.refs += 1;
        Ok(Client {
            core: self.core.clone(),
            service,
            server,
            out_spec,
            in_spec,
            priority: Cell::new(Priority::Nominal),
            _request: PhantomData,
            _response: PhantomData,
        })
    }

    /// Creates a server handling requests for a service
    pub fn make_server<Req: Request + Deserialize, Resp: Response + Serialize>(
        &self,
        service: ServiceId,
    ) -> Result<Server<Req, Resp>> {
        let spec =
            InputSessionSpecifier::promiscuous(DataSpecifier::ServiceRequest(service));
        self.core
            .borrow_mut()
            .transport
            .open_input(&spec, Req::EXTENT_BYTES)?;
        Ok(Server {
            core: self.core.clone(),
            service,
            spec,
            _request: PhantomData,
            _response: PhantomData,
        })
    }

    /// Drives the transport without a waiting port, e.g. to keep captures
    /// flowing
    pub fn poll(&self, deadline: MonotonicTime) -> Result<()> {
        self.core.borrow_mut().transport.poll(deadline)
    }

    /// Injects a fabricated transfer; see `Transport::spoof`
    pub fn spoof(&self, transfer: SpoofTransfer, deadline: MonotonicTime) -> Result<()> {
        self.core.borrow_mut().transport.spoof(transfer, deadline)
    }

    pub fn begin_capture(&self, handler: CaptureHandler) {
        self.core.borrow_mut().transport.begin_capture(handler);
    }

    pub fn make_tracer(&self) -> Box<dyn Tracer> {
        self.core.borrow().transport.make_tracer()
    }

    pub fn transport_statistics(&self) -> TransportStatistics {
        self.core.borrow().transport.statistics()
    }

    /// Closes the transport and every session; idempotent
    pub fn close(&self) {
        self.core.borrow_mut().transport.close();
    }
}

/// Publishes typed messages on one subject
pub struct Publisher<T> {
    core: Rc<RefCell<Core>>,
    spec: OutputSessionSpecifier,
    priority: Priority,
    _message: PhantomData<fn(&T)>,
}

impl<T: Message + Serialize> Publisher<T> {
    /// Publishes a message; returns `false` if the deadline expired before
    /// the media accepted the frames
    pub fn publish(&self, message: &T, deadline: MonotonicTime) -> Result<bool> {
        let payload = do_serialize(message);
        let mut core = self.core.borrow_mut();
        let transfer_id = core.allocate_transfer_id(&self.spec);
        let transfer = TransferOut {
            deadline,
            priority: self.priority,
            transfer_id,
            payload,
        };
        match core.transport.send(&self.spec, transfer) {
            Ok(()) => Ok(true),
            Err(Error::Timeout) => Ok(false),
            Err(error) => Err(error),
        }
    }

    pub fn priority(&self) -> Priority {
        self.priority
    }
}

impl<T> Drop for Publisher<T> {
    fn drop(&mut self) {
        if let Ok(mut core) = self.core.try_borrow_mut() {
            core.release_output(&self.spec);
        }
    }
}

/// Receives typed messages from one subject
///
/// Every subscriber of a subject sees every transfer; payloads that fail to
/// deserialize are counted, never surfaced, so one misbehaving publisher
/// cannot stall the stream.
pub struct Subscriber<T> {
    core: Rc<RefCell<Core>>,
    subject: SubjectId,
    spec: InputSessionSpecifier,
    key: u64,
    deserialization_failures: Cell<u64>,
    _message: PhantomData<fn() -> T>,
}

impl<T: Message + Deserialize> Subscriber<T> {
    /// Returns the next message, waiting at most until the deadline
    pub fn receive(&self, deadline: MonotonicTime) -> Result<Option<(T, TransferMetadata)>> {
        loop {
            {
                let mut core = self.core.borrow_mut();
                while let Some(transfer) = core
                    .subjects
                    .get_mut(&self.subject)
                    .and_then(|state| state.queues.get_mut(&self.key))
                    .and_then(|queue| queue.pop_front())
                {
                    match T::deserialize(&transfer.payload) {
                        Ok(message) => {
                            return Ok(Some((message, TransferMetadata::of(&transfer))))
                        }
                        Err(error) => {
                            self.deserialization_failures
                                .set(self.deserialization_failures.get() + 1);
                            log::warn!(
                                "subject {}: dropping malformed payload from {:?}: {}",
                                self.subject,
                                transfer.source,
                                error
                            );
                        }
                    }
                }
                let slice = (MonotonicTime::now() + POLL_QUANTUM).min(deadline);
                core.pump_subject(self.subject, &self.spec, slice)?;
            }
            let own_queue_empty = {
                let core = self.core.borrow();
                core.subjects
                    .get(&self.subject)
                    .and_then(|state| state.queues.get(&self.key))
                    .map(|queue| queue.is_empty())
                    .unwrap_or(true)
            };
            if own_queue_empty && MonotonicTime::now() >= deadline {
                return Ok(None);
            }
        }
    }

    /// Callback-mode reception: drives the loop until `until`, invoking the
    /// handler for every message that arrives in the meantime
    pub fn receive_each<F>(&self, mut handler: F, until: MonotonicTime) -> Result<()>
    where
        F: FnMut(T, TransferMetadata),
    {
        while let Some((message, metadata)) = self.receive(until)? {
            handler(message, metadata);
            if MonotonicTime::now() >= until {
                break;
            }
        }
        Ok(())
    }

    /// How many received payloads failed to deserialize
    pub fn deserialization_failure_count(&self) -> u64 {
        self.deserialization_failures.get()
    }
}

impl<T> Drop for Subscriber<T> {
    fn drop(&mut self) {
        if let Ok(mut core) = self.core.try_borrow_mut() {
            if let Some(state) = core.subjects.get_mut(&self.subject) {
                state.queues.remove(&self.key);
                if state.queues.is_empty() {
                    core.subjects.remove(&self.subject);
                }
            }
            core.transport.close_input(&self.spec);
        }
    }
}

/// Calls a service on one server node
pub struct Client<Req, Resp> {
    core: Rc<RefCell<Core>>,
    service: ServiceId,
    server: NodeId,
    out_spec: OutputSessionSpecifier,
    in_spec: InputSessionSpecifier,
    priority: Cell<Priority>,
    _request: PhantomData<fn(&Req)>,
    _response: PhantomData<fn() -> Resp>,
}

impl<Req: Request + Serialize, Resp: Response + Deserialize> Client<Req, Resp> {
    /// Sends a request and waits for the matching response
    ///
    /// The response must carry the same transfer ID and come from the server
    /// node; anything else is logged and dropped. `None` means the deadline
    /// expired; frames already on the wire are not revoked.
    pub fn call(
        &self,
        request: &Req,
        deadline: MonotonicTime,
    ) -> Result<Option<(Resp, TransferMetadata)>> {
        let payload = do_serialize(request);
        let transfer_id = {
            let mut core = self.core.borrow_mut();
            let modulo = core.transport.protocol_parameters().transfer_id_modulo;
            let shared = core
                .clients
                .get_mut(&(self.service, self.server))
                .expect("Bug: client state missing");
            let id = shared.next_transfer_id;
            shared.next_transfer_id = id.next(modulo);
            shared.pending.insert(id.to_u64(), None);
            let transfer = TransferOut {
                deadline,
                priority: self.priority.get(),
                transfer_id: id,
                payload,
            };
            if let Err(error) = core.transport.send(&self.out_spec, transfer) {
                let shared = core
                    .clients
                    .get_mut(&(self.service, self.server))
                    .expect("Bug: client state missing");
                shared.pending.remove(&id.to_u64());
                return match error {
                    Error::Timeout => Ok(None),
                    other => Err(other),
                };
            }
            id
        };

        let result = self.await_response(transfer_id, deadline);
        // The pending slot dies with the call, answered or not
        if let Ok(mut core) = self.core.try_borrow_mut() {
            if let Some(shared) = core.clients.get_mut(&(self.service, self.server)) {
                shared.pending.remove(&transfer_id.to_u64());
            }
        }
        result
    }

    /// The priority used for outgoing requests
    pub fn priority(&self) -> Priority {
        self.priority.get()
    }
    pub fn set_priority(&self, priority: Priority) {
        self.priority.set(priority);
    }

    fn await_response(
        &self,
        transfer_id: TransferId,
        deadline: MonotonicTime,
    ) -> Result<Option<(Resp, TransferMetadata)>> {
        loop {
            {
                let mut core = self.core.borrow_mut();
                let answered = core
                    .clients
                    .get_mut(&(self.service, self.server))
                    .and_then(|shared| {
                        shared
                            .pending
                            .get_mut(&transfer_id.to_u64())
                            .and_then(Option::take)
                    });
                if let Some(transfer) = answered {
                    return match Resp::deserialize(&transfer.payload) {
                        Ok(response) => {
                            Ok(Some((response, TransferMetadata::of(&transfer))))
                        }
                        Err(error) => {
                            log::warn!(
                                "service {}: malformed response from {}: {}",
                                self.service,
                                self.server,
                                error
                            );
                            Ok(None)
                        }
                    };
                }
                let slice = (MonotonicTime::now() + POLL_QUANTUM).min(deadline);
                core.pump_responses(self.service, self.server, &self.in_spec, slice)?;
            }
            let answered = {
                let core = self.core.borrow();
                core.clients
                    .get(&(self.service, self.server))
                    .and_then(|shared| shared.pending.get(&transfer_id.to_u64()))
                    .map(|slot| slot.is_some())
                    .unwrap_or(false)
            };
            if !answered && MonotonicTime::now() >= deadline {
                return Ok(None);
            }
        }
    }
}

impl<Req, Resp> Drop for Client<Req, Resp> {
    fn drop(&mut self) {
        if let Ok(mut core) = self.core.try_borrow_mut() {
            let remove = match core.clients.get_mut(&(self.service, self.server)) {
                Some(shared) => {
                    shared.refs -= 1;
                    shared.refs == 0
                }
                None => false,
            };
            if remove {
                core.clients.remove(&(self.service, self.server));
            }
            core.transport.close_input(&self.in_spec);
            core.release_output(&self.out_spec);
        }
    }
}

/// Everything needed to answer a request: who asked, with what transfer ID,
/// at what priority
#[derive(Debug, Clone, Copy)]
pub struct ResponseToken {
    service: ServiceId,
    client: NodeId,
    transfer_id: TransferId,
    priority: Priority,
}

impl ResponseToken {
    pub fn client(&self) -> NodeId {
        self.client
    }
}

/// Serves requests for one service
pub struct Server<Req, Resp> {
    core: Rc<RefCell<Core>>,
    service: ServiceId,
    spec: InputSessionSpecifier,
    _request: PhantomData<fn() -> Req>,
    _response: PhantomData<fn(&Resp)>,
}

impl<Req: Request + Deserialize, Resp: Response + Serialize> Server<Req, Resp> {
    /// Returns the next request, waiting at most until the deadline
    pub fn next_request(
        &self,
        deadline: MonotonicTime,
    ) -> Result<Option<(Req, TransferMetadata, ResponseToken)>> {
        loop {
            let received = {
                let mut core = self.core.borrow_mut();
                let slice = (MonotonicTime::now() + POLL_QUANTUM).min(deadline);
                core.transport.receive(&self.spec, slice)?
            };
            if let Some(transfer) = received {
                let client = match transfer.source {
                    Some(client) => client,
                    None => {
                        // Anonymous nodes cannot be answered
                        log::warn!(
                            "service {}: request from an anonymous node dropped",
                            self.service
                        );
                        continue;
                    }
                };
                match Req::deserialize(&transfer.payload) {
                    Ok(request) => {
                        let token = ResponseToken {
                            service: self.service,
                            client,
                            transfer_id: transfer.transfer_id,
                            priority: transfer.priority,
                        };
                        return Ok(Some((request, TransferMetadata::of(&transfer), token)));
                    }
                    Err(error) => {
                        log::warn!(
                            "service {}: dropping malformed request from {}: {}",
                            self.service,
                            client,
                            error
                        );
                        continue;
                    }
                }
            }
            if MonotonicTime::now() >= deadline {
                return Ok(None);
            }
        }
    }

    /// Sends a response back to the requester
    ///
    /// The response reuses the request's transfer ID and priority, which is
    /// what lets the client correlate it.
    pub fn send_response(
        &self,
        token: ResponseToken,
        response: &Resp,
        deadline: MonotonicTime,
    ) -> Result<()> {
        let payload = do_serialize(response);
        let spec = OutputSessionSpecifier::response(token.service, token.client);
        let transfer = TransferOut {
            deadline,
            priority: token.priority,
            transfer_id: token.transfer_id,
            payload,
        };
        self.core.borrow_mut().transport.send(&spec, transfer)
    }

    /// Handles at most one request with the given handler
    ///
    /// Returns whether a request was served. The handler may take its time;
    /// the response deadline is measured from the same absolute instant.
    pub fn serve_next<F>(&self, handler: F, deadline: MonotonicTime) -> Result<bool>
    where
        F: FnOnce(Req, &TransferMetadata) -> Resp,
    {
        match self.next_request(deadline)? {
            Some((request, metadata, token)) => {
                let response = handler(request, &metadata);
                self.send_response(token, &response, deadline)?;
                Ok(true)
            }
            None => Ok(false),
        }
    }
}

impl<Req, Resp> Drop for Server<Req, Resp> {
    fn drop(&mut self) {
        if let Ok(mut core) = self.core.try_borrow_mut() {
            core.transport.close_input(&self.spec);
        }
    }
}
