//! In-memory media shared by the integration tests
#![allow(dead_code)]

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use bernicla::can::driver::CanDriver;
use bernicla::can::filter::Filter;
use bernicla::can::{CanFrame, Mtu};
use bernicla::error::Result;
use bernicla::time::{MonotonicTime, Timestamp};
use bernicla::udp::UdpDriver;

/// Routes the stack's log output into the test harness
///
/// Safe to call from every test; only the first call installs the logger.
pub fn init_logging() {
    let _ = simplelog::SimpleLogger::init(
        simplelog::LevelFilter::Debug,
        simplelog::Config::default(),
    );
}

/// A software CAN bus: every frame a node sends appears at every other node
pub struct CanBus {
    state: Arc<Mutex<BusState>>,
}

#[derive(Default)]
struct BusState {
    queues: Vec<Arc<Mutex<VecDeque<CanFrame>>>>,
}

impl CanBus {
    pub fn new() -> Self {
        CanBus {
            state: Arc::new(Mutex::new(BusState::default())),
        }
    }

    /// Attaches a new node to the bus
    pub fn endpoint(&self) -> BusCanDriver {
        let queue = Arc::new(Mutex::new(VecDeque::new()));
        let mut state = self.state.lock().unwrap();
        state.queues.push(queue.clone());
        BusCanDriver {
            state: self.state.clone(),
            queue,
        }
    }
}

pub struct BusCanDriver {
    state: Arc<Mutex<BusState>>,
    queue: Arc<Mutex<VecDeque<CanFrame>>>,
}

impl CanDriver for BusCanDriver {
    fn mtu(&self) -> Mtu {
        Mtu::Can8
    }

    fn send(&mut self, frames: &[CanFrame], _deadline: MonotonicTime) -> Result<()> {
        let state = self.state.lock().unwrap();
        for queue in &state.queues {
            if Arc::ptr_eq(queue, &self.queue) {
                // Nodes do not hear their own transmissions
                continue;
            }
            let mut queue = queue.lock().unwrap();
            for frame in frames {
                queue.push_back(frame.clone());
            }
        }
        Ok(())
    }

    fn receive(&mut self, deadline: MonotonicTime) -> Result<Option<(CanFrame, Timestamp)>> {
        loop {
            if let Some(frame) = self.queue.lock().unwrap().pop_front() {
                return Ok(Some((frame, Timestamp::now())));
            }
            if MonotonicTime::now() >= deadline {
                return Ok(None);
            }
            std::thread::sleep(Duration::from_millis(1));
        }
    }

    fn apply_filters(&mut self, _filters: &[Filter]) -> Result<()> {
        Ok(())
    }

    fn close(&mut self) {}
}

/// A loopback UDP medium: every datagram sent arrives back locally, the way
/// multicast loopback behaves on a single host
pub struct LoopUdpDriver {
    queue: Arc<Mutex<VecDeque<Vec<u8>>>>,
}

impl LoopUdpDriver {
    pub fn new() -> Self {
        LoopUdpDriver {
            queue: Arc::new(Mutex::new(VecDeque::new())),
        }
    }
}

impl UdpDriver for LoopUdpDriver {
    fn send(
        &mut self,
        _destination: std::net::SocketAddrV4,
        datagram: &[u8],
        _deadline: MonotonicTime,
    ) -> Result<()> {
        self.queue.lock().unwrap().push_back(datagram.to_vec());
        Ok(())
    }

    fn receive(&mut self, deadline: MonotonicTime) -> Result<Option<(Vec<u8>, Timestamp)>> {
        loop {
            if let Some(datagram) = self.queue.lock().unwrap().pop_front() {
                return Ok(Some((datagram, Timestamp::now())));
            }
            if MonotonicTime::now() >= deadline {
                return Ok(None);
            }
            std::thread::sleep(Duration::from_millis(1));
        }
    }

    fn join(&mut self, _group: std::net::SocketAddrV4) -> Result<()> {
        Ok(())
    }

    fn leave(&mut self, _group: std::net::SocketAddrV4) {}

    fn close(&mut self) {}
}
