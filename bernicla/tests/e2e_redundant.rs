//! Redundant-transport deduplication and failover behavior

mod common;

use std::convert::TryFrom;
use std::time::Duration;

use bernicla::error::Error;
use bernicla::time::MonotonicTime;
use bernicla::transfer::{
    DataSpecifier, InputSessionSpecifier, OutputSessionSpecifier, TransferOut,
};
use bernicla::transport::Transport;
use bernicla::encoding::RawBytes;
use bernicla::redundant::RedundantTransport;
use bernicla::udp::{UdpTransport, UdpTransportOptions};
use bernicla::{NodeId, Presentation, Priority, SubjectId, TransferId};

use common::LoopUdpDriver;

fn loop_udp(node: u16) -> Box<UdpTransport> {
    common::init_logging();
    Box::new(
        UdpTransport::new(
            Box::new(LoopUdpDriver::new()),
            Some(NodeId::new(node)),
            UdpTransportOptions::default(),
        )
        .unwrap(),
    )
}

fn deadline_in(duration: Duration) -> MonotonicTime {
    MonotonicTime::now() + duration
}

#[test]
fn two_inferiors_deliver_each_transfer_once() {
    let mut redundant = RedundantTransport::new();
    redundant.attach(loop_udp(5)).unwrap();
    redundant.attach(loop_udp(5)).unwrap();

    let subject = SubjectId::try_from(88).unwrap();
    let out_spec = OutputSessionSpecifier::broadcast(subject);
    let in_spec = InputSessionSpecifier::promiscuous(DataSpecifier::Subject(subject));
    redundant.open_output(&out_spec).unwrap();
    redundant.open_input(&in_spec, 64).unwrap();

    redundant
        .send(
            &out_spec,
            TransferOut {
                deadline: deadline_in(Duration::from_millis(200)),
                priority: Priority::Nominal,
                transfer_id: TransferId::new(5),
                payload: vec![1, 2, 3],
            },
        )
        .unwrap();

    // Both loopback inferiors hand the transfer back; exactly one survives
    let transfer = redundant
        .receive(&in_spec, deadline_in(Duration::from_millis(500)))
        .unwrap()
        .expect("the transfer should arrive once");
    assert_eq!(transfer.transfer_id, TransferId::new(5));
    assert_eq!(transfer.payload, vec![1, 2, 3]);

    let duplicate = redundant
        .receive(&in_spec, deadline_in(Duration::from_millis(100)))
        .unwrap();
    assert!(duplicate.is_none(), "the duplicate must be deduplicated");
}

#[test]
fn mismatched_inferior_identity_rejected() {
    let mut redundant = RedundantTransport::new();
    redundant.attach(loop_udp(5)).unwrap();
    let result = redundant.attach(loop_udp(6));
    assert!(matches!(
        result,
        Err(Error::InvalidTransportConfiguration(_))
    ));
    assert_eq!(redundant.inferior_count(), 1);
}

#[test]
fn attach_replays_open_sessions() {
    let mut redundant = RedundantTransport::new();
    redundant.attach(loop_udp(5)).unwrap();

    let subject = SubjectId::try_from(89).unwrap();
    let out_spec = OutputSessionSpecifier::broadcast(subject);
    let in_spec = InputSessionSpecifier::promiscuous(DataSpecifier::Subject(subject));
    redundant.open_output(&out_spec).unwrap();
    redundant.open_input(&in_spec, 64).unwrap();

    // The late inferior inherits the sessions and starts carrying traffic
    redundant.attach(loop_udp(5)).unwrap();
    redundant
        .send(
            &out_spec,
            TransferOut {
                deadline: deadline_in(Duration::from_millis(200)),
                priority: Priority::Nominal,
                transfer_id: TransferId::new(0),
                payload: vec![7],
            },
        )
        .unwrap();
    let transfer = redundant
        .receive(&in_spec, deadline_in(Duration::from_millis(500)))
        .unwrap()
        .expect("the transfer should arrive");
    assert_eq!(transfer.payload, vec![7]);
    assert!(redundant
        .receive(&in_spec, deadline_in(Duration::from_millis(100)))
        .unwrap()
        .is_none());
}

#[test]
fn send_succeeds_while_any_inferior_accepts() {
    let mut redundant = RedundantTransport::new();
    redundant.attach(loop_udp(5)).unwrap();
    let subject = SubjectId::try_from(90).unwrap();
    let out_spec = OutputSessionSpecifier::broadcast(subject);
    redundant.open_output(&out_spec).unwrap();

    // Detaching everything makes transmission impossible
    redundant.detach(0).unwrap();
    let result = redundant.send(
        &out_spec,
        TransferOut {
            deadline: deadline_in(Duration::from_millis(100)),
            priority: Priority::Nominal,
            transfer_id: TransferId::new(0),
            payload: vec![1],
        },
    );
    assert!(matches!(result, Err(Error::SendFailed(_))));
}

#[test]
fn presentation_over_redundant_transport() {
    let mut redundant = RedundantTransport::new();
    redundant.attach(loop_udp(5)).unwrap();
    redundant.attach(loop_udp(5)).unwrap();
    let presentation = Presentation::new(Box::new(redundant));

    let subject = SubjectId::try_from(91).unwrap();
    let subscriber = presentation.make_subscriber::<RawBytes>(subject).unwrap();
    let publisher = presentation
        .make_publisher::<RawBytes>(subject, Priority::Nominal)
        .unwrap();

    for expected in 0..3u64 {
        assert!(publisher
            .publish(&RawBytes(vec![expected as u8]), deadline_in(Duration::from_millis(200)))
            .unwrap());
        let (message, metadata) = subscriber
            .receive(deadline_in(Duration::from_millis(500)))
            .unwrap()
            .expect("each publication should arrive exactly once");
        assert_eq!(message.0, vec![expected as u8]);
        assert_eq!(metadata.transfer_id.to_u64(), expected);
    }
    // Nothing extra is buffered
    assert!(subscriber
        .receive(deadline_in(Duration::from_millis(100)))
        .unwrap()
        .is_none());

    presentation.close();
    let result = subscriber.receive(deadline_in(Duration::from_millis(100)));
    assert!(matches!(result, Err(Error::ResourceClosed)));
}
