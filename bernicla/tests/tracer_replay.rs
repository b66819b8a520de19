//! Offline analysis: capture, log as candump text, replay, trace

mod common;

use std::cell::RefCell;
use std::convert::TryFrom;
use std::rc::Rc;
use std::time::Duration;

use bernicla::can::{CanTransport, CanTransportOptions};
use bernicla::error::ReassemblyError;
use bernicla::time::MonotonicTime;
use bernicla::trace::{Capture, CapturedFrame, TraceEvent};
use bernicla::transport::Transport;
use bernicla::encoding::RawBytes;
use bernicla::{NodeId, Presentation, Priority, SubjectId};
use bernicla_linux::CandumpReplayDriver;

use common::CanBus;

/// Formats captured CAN frames the way `candump -L` logs them
fn to_candump(captures: &[Capture], start_seconds: u64) -> String {
    captures
        .iter()
        .enumerate()
        .map(|(index, capture)| match &capture.frame {
            CapturedFrame::Can { id, data } => {
                let hex: String = data.iter().map(|byte| format!("{:02X}", byte)).collect();
                format!("({}.{:06}) can0 {:08X}#{}\n", start_seconds + index as u64, 0, id, hex)
            }
            other => panic!("expected CAN captures only, got {:?}", other),
        })
        .collect()
}

#[test]
fn tracer_reconstructs_replayed_log_and_flags_orphans() {
    common::init_logging();
    // Record a two-frame transfer by capturing a live publication
    let bus = CanBus::new();
    let transport = CanTransport::new(
        Box::new(bus.endpoint()),
        Some(NodeId::new(42)),
        CanTransportOptions::default(),
    )
    .unwrap();
    let presentation = Presentation::new(Box::new(transport));

    let captures: Rc<RefCell<Vec<Capture>>> = Rc::new(RefCell::new(Vec::new()));
    {
        let captures = captures.clone();
        presentation.begin_capture(Box::new(move |capture| {
            captures.borrow_mut().push(capture.clone());
        }));
    }

    let subject = SubjectId::try_from(1000).unwrap();
    let publisher = presentation
        .make_publisher::<RawBytes>(subject, Priority::Nominal)
        .unwrap();
    let payload: Vec<u8> = (0..12).collect();
    assert!(publisher
        .publish(
            &RawBytes(payload.clone()),
            MonotonicTime::now() + Duration::from_millis(200)
        )
        .unwrap());

    let captured = captures.borrow().clone();
    assert_eq!(captured.len(), 2, "12 bytes need two classic CAN frames");

    // Append an orphan: the continuation frame again, with start/end cleared
    let mut log = to_candump(&captured, 1_585_931_234);
    if let CapturedFrame::Can { id, data } = &captured[1].frame {
        let mut orphan = data.clone();
        let tail = *orphan.last().unwrap();
        *orphan.last_mut().unwrap() = tail & !0b1100_0000;
        let hex: String = orphan.iter().map(|byte| format!("{:02X}", byte)).collect();
        log.push_str(&format!("(1585931240.000000) can0 {:08X}#{}\n", id, hex));
    }

    // Replay the log through a fresh transport and collect its capture stream
    let log_path = std::env::temp_dir().join(format!(
        "bernicla-candump-{}.log",
        std::process::id()
    ));
    std::fs::write(&log_path, &log).unwrap();

    let driver = CandumpReplayDriver::open(&log_path).unwrap();
    let mut replay = CanTransport::new(
        Box::new(driver),
        Some(NodeId::new(7)),
        CanTransportOptions::default(),
    )
    .unwrap();
    let replay_captures: Rc<RefCell<Vec<Capture>>> = Rc::new(RefCell::new(Vec::new()));
    {
        let replay_captures = replay_captures.clone();
        replay.begin_capture(Box::new(move |capture| {
            replay_captures.borrow_mut().push(capture.clone());
        }));
    }
    let mut tracer = replay.make_tracer();
    replay
        .poll(MonotonicTime::now() + Duration::from_millis(50))
        .unwrap();

    // One reconstructed transfer for the valid pair, one error for the orphan
    let mut transfers = Vec::new();
    let mut errors = Vec::new();
    for capture in replay_captures.borrow().iter() {
        match tracer.update(capture) {
            Some(TraceEvent::Transfer(traced)) => transfers.push(traced),
            Some(TraceEvent::Error { error, .. }) => errors.push(error),
            None => {}
        }
    }
    assert_eq!(transfers.len(), 1);
    assert_eq!(transfers[0].transfer.payload, payload);
    assert_eq!(transfers[0].transfer.source, Some(NodeId::new(42)));
    assert_eq!(errors, vec![ReassemblyError::MissedStart]);

    std::fs::remove_file(&log_path).ok();
}
