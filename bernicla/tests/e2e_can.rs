//! End-to-end message exchange over the CAN transport

mod common;

use std::cell::RefCell;
use std::convert::TryFrom;
use std::rc::Rc;
use std::time::Duration;

use bernicla::can::{CanTransport, CanTransportOptions};
use bernicla::error::Error;
use bernicla::time::MonotonicTime;
use bernicla::trace::{Capture, CapturedFrame, Direction};
use bernicla::encoding::RawBytes;
use bernicla::{NodeId, Presentation, Priority, SubjectId};

use common::CanBus;

fn presentation_on(bus: &CanBus, node: Option<u16>) -> Presentation {
    common::init_logging();
    let transport = CanTransport::new(
        Box::new(bus.endpoint()),
        node.map(NodeId::new),
        CanTransportOptions::default(),
    )
    .unwrap();
    Presentation::new(Box::new(transport))
}

fn deadline_in(duration: Duration) -> MonotonicTime {
    MonotonicTime::now() + duration
}

#[test]
fn single_frame_message_wire_format() {
    let bus = CanBus::new();
    let publisher_side = presentation_on(&bus, Some(42));
    let subscriber_side = presentation_on(&bus, Some(7));

    let captures: Rc<RefCell<Vec<Capture>>> = Rc::new(RefCell::new(Vec::new()));
    {
        let captures = captures.clone();
        publisher_side.begin_capture(Box::new(move |capture| {
            captures.borrow_mut().push(capture.clone());
        }));
    }

    let subject = SubjectId::try_from(1234).unwrap();
    let subscriber = subscriber_side.make_subscriber::<RawBytes>(subject).unwrap();
    let publisher = publisher_side
        .make_publisher::<RawBytes>(subject, Priority::Nominal)
        .unwrap();

    let accepted = publisher
        .publish(&RawBytes(vec![0x01, 0x02, 0x03, 0x04]), deadline_in(Duration::from_millis(200)))
        .unwrap();
    assert!(accepted);

    // Exactly one frame with the expected arbitration ID and tail byte
    let captures = captures.borrow();
    assert_eq!(captures.len(), 1);
    assert_eq!(captures[0].direction, Direction::Tx);
    match &captures[0].frame {
        CapturedFrame::Can { id, data } => {
            // priority 4, bits 22/21 set, subject 1234, source 42
            assert_eq!(*id, (4 << 26) | (3 << 21) | (1234 << 8) | 42);
            assert_eq!(*data, [0x01, 0x02, 0x03, 0x04, 0b1110_0000]);
        }
        other => panic!("expected a CAN capture, got {:?}", other),
    }

    let (message, metadata) = subscriber
        .receive(deadline_in(Duration::from_millis(500)))
        .unwrap()
        .expect("the subscriber should observe the message");
    assert_eq!(message.0, vec![0x01, 0x02, 0x03, 0x04]);
    assert_eq!(metadata.source, Some(NodeId::new(42)));
    assert_eq!(metadata.transfer_id.to_u64(), 0);
    assert_eq!(metadata.priority, Priority::Nominal);
}

#[test]
fn multi_frame_round_trip_with_crc() {
    let bus = CanBus::new();
    let publisher_side = presentation_on(&bus, Some(42));
    let subscriber_side = presentation_on(&bus, Some(7));

    let captures: Rc<RefCell<Vec<Capture>>> = Rc::new(RefCell::new(Vec::new()));
    {
        let captures = captures.clone();
        publisher_side.begin_capture(Box::new(move |capture| {
            captures.borrow_mut().push(capture.clone());
        }));
    }

    let subject = SubjectId::try_from(200).unwrap();
    let subscriber = subscriber_side.make_subscriber::<RawBytes>(subject).unwrap();
    let publisher = publisher_side
        .make_publisher::<RawBytes>(subject, Priority::Nominal)
        .unwrap();

    // 19 payload bytes + 2 CRC bytes fill exactly three CAN 2.0 frames
    let payload: Vec<u8> = (0..19).collect();
    assert!(publisher
        .publish(&RawBytes(payload.clone()), deadline_in(Duration::from_millis(200)))
        .unwrap());

    let captures = captures.borrow();
    assert_eq!(captures.len(), 3);
    let tails: Vec<u8> = captures
        .iter()
        .map(|capture| match &capture.frame {
            CapturedFrame::Can { data, .. } => *data.last().unwrap(),
            other => panic!("expected a CAN capture, got {:?}", other),
        })
        .collect();
    // start only on the first, end only on the last, toggles 1 0 1
    assert_eq!(tails[0] & 0b1110_0000, 0b1010_0000);
    assert_eq!(tails[1] & 0b1110_0000, 0b0000_0000);
    assert_eq!(tails[2] & 0b1110_0000, 0b0110_0000);

    let (message, _) = subscriber
        .receive(deadline_in(Duration::from_millis(500)))
        .unwrap()
        .expect("the reassembled transfer should arrive");
    assert_eq!(message.0, payload);
}

#[test]
fn transfer_ids_increase_monotonically() {
    let bus = CanBus::new();
    let publisher_side = presentation_on(&bus, Some(42));
    let subscriber_side = presentation_on(&bus, Some(7));

    let subject = SubjectId::try_from(300).unwrap();
    let subscriber = subscriber_side.make_subscriber::<RawBytes>(subject).unwrap();
    let publisher = publisher_side
        .make_publisher::<RawBytes>(subject, Priority::Nominal)
        .unwrap();

    for expected in 0..4u64 {
        assert!(publisher
            .publish(&RawBytes(vec![expected as u8]), deadline_in(Duration::from_millis(200)))
            .unwrap());
        let (_, metadata) = subscriber
            .receive(deadline_in(Duration::from_millis(500)))
            .unwrap()
            .expect("each publication should arrive");
        assert_eq!(metadata.transfer_id.to_u64(), expected);
    }
}

#[test]
fn shared_subject_shares_the_transfer_id_counter() {
    let bus = CanBus::new();
    let publisher_side = presentation_on(&bus, Some(42));
    let subscriber_side = presentation_on(&bus, Some(7));

    let subject = SubjectId::try_from(301).unwrap();
    let subscriber = subscriber_side.make_subscriber::<RawBytes>(subject).unwrap();
    let first = publisher_side
        .make_publisher::<RawBytes>(subject, Priority::Nominal)
        .unwrap();
    let second = publisher_side
        .make_publisher::<RawBytes>(subject, Priority::Nominal)
        .unwrap();

    assert!(first
        .publish(&RawBytes(vec![1]), deadline_in(Duration::from_millis(200)))
        .unwrap());
    assert!(second
        .publish(&RawBytes(vec![2]), deadline_in(Duration::from_millis(200)))
        .unwrap());

    let deadline = deadline_in(Duration::from_millis(500));
    let (_, first_meta) = subscriber.receive(deadline).unwrap().unwrap();
    let (_, second_meta) = subscriber.receive(deadline).unwrap().unwrap();
    assert_eq!(first_meta.transfer_id.to_u64(), 0);
    assert_eq!(second_meta.transfer_id.to_u64(), 1);
}

#[test]
fn anonymous_publisher_rejects_multi_frame() {
    let bus = CanBus::new();
    let anonymous_side = presentation_on(&bus, None);
    let subscriber_side = presentation_on(&bus, Some(7));

    let subject = SubjectId::try_from(400).unwrap();
    let subscriber = subscriber_side.make_subscriber::<RawBytes>(subject).unwrap();
    let publisher = anonymous_side
        .make_publisher::<RawBytes>(subject, Priority::Nominal)
        .unwrap();

    // 20 bytes cannot fit into one classic CAN frame
    let result = publisher.publish(
        &RawBytes((0..20).collect()),
        deadline_in(Duration::from_millis(100)),
    );
    assert!(matches!(result, Err(Error::PayloadTooLarge { .. })));

    // No frame was emitted at all
    assert!(subscriber
        .receive(deadline_in(Duration::from_millis(50)))
        .unwrap()
        .is_none());

    // A single-frame anonymous message still goes through
    assert!(publisher
        .publish(&RawBytes(vec![5, 6]), deadline_in(Duration::from_millis(200)))
        .unwrap());
    let (message, metadata) = subscriber
        .receive(deadline_in(Duration::from_millis(500)))
        .unwrap()
        .expect("the anonymous message should arrive");
    assert_eq!(message.0, vec![5, 6]);
    assert_eq!(metadata.source, None);
}

#[test]
fn subscriber_fan_out_delivers_to_all() {
    let bus = CanBus::new();
    let publisher_side = presentation_on(&bus, Some(42));
    let subscriber_side = presentation_on(&bus, Some(7));

    let subject = SubjectId::try_from(500).unwrap();
    let first = subscriber_side.make_subscriber::<RawBytes>(subject).unwrap();
    let second = subscriber_side.make_subscriber::<RawBytes>(subject).unwrap();
    let publisher = publisher_side
        .make_publisher::<RawBytes>(subject, Priority::Nominal)
        .unwrap();

    assert!(publisher
        .publish(&RawBytes(vec![9, 9]), deadline_in(Duration::from_millis(200)))
        .unwrap());

    let deadline = deadline_in(Duration::from_millis(500));
    let (a, _) = first.receive(deadline).unwrap().expect("first subscriber");
    let (b, _) = second.receive(deadline).unwrap().expect("second subscriber");
    assert_eq!(a.0, vec![9, 9]);
    assert_eq!(b.0, vec![9, 9]);
}

#[test]
fn randomized_payloads_round_trip() {
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};

    let bus = CanBus::new();
    let publisher_side = presentation_on(&bus, Some(42));
    let subscriber_side = presentation_on(&bus, Some(7));

    let subject = SubjectId::try_from(550).unwrap();
    let subscriber = subscriber_side.make_subscriber::<RawBytes>(subject).unwrap();
    let publisher = publisher_side
        .make_publisher::<RawBytes>(subject, Priority::Nominal)
        .unwrap();

    // Seeded so a failure replays; lengths straddle the single-frame limit
    let mut rng = StdRng::seed_from_u64(0x1064_d22a);
    for round in 0..25u64 {
        let length: usize = rng.gen_range(0..=60);
        let payload: Vec<u8> = (0..length).map(|_| rng.gen()).collect();
        assert!(publisher
            .publish(&RawBytes(payload.clone()), deadline_in(Duration::from_millis(200)))
            .unwrap());
        let (message, metadata) = subscriber
            .receive(deadline_in(Duration::from_millis(500)))
            .unwrap()
            .expect("every randomized payload should arrive");
        assert_eq!(message.0, payload, "round {}", round);
        assert_eq!(metadata.transfer_id.to_u64(), round % 32);
    }
}

#[test]
fn closing_fails_pending_operations() {
    let bus = CanBus::new();
    let side = presentation_on(&bus, Some(7));
    let subject = SubjectId::try_from(600).unwrap();
    let subscriber = side.make_subscriber::<RawBytes>(subject).unwrap();

    side.close();
    let result = subscriber.receive(deadline_in(Duration::from_millis(100)));
    assert!(matches!(result, Err(Error::ResourceClosed)));
}
