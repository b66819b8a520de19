//! End-to-end RPC over the CAN transport

mod common;

use std::convert::TryFrom;
use std::time::Duration;

use bernicla::can::{CanTransport, CanTransportOptions};
use bernicla::time::MonotonicTime;
use bernicla::encoding::{Deserialize, DeserializeError, Request, Response, Serialize};
use bernicla::{NodeId, Presentation, ServiceId};

use common::CanBus;

/// Request: (x, y) sample pairs packed as bytes
#[derive(Debug, Clone, PartialEq, Eq)]
struct LeastSquaresRequest {
    points: Vec<(u8, u8)>,
}

impl Request for LeastSquaresRequest {}

impl Serialize for LeastSquaresRequest {
    fn size_bytes(&self) -> usize {
        self.points.len() * 2
    }
    fn serialize(&self, buffer: &mut [u8]) {
        for (index, (x, y)) in self.points.iter().enumerate() {
            buffer[index * 2] = *x;
            buffer[index * 2 + 1] = *y;
        }
    }
}

impl Deserialize for LeastSquaresRequest {
    const EXTENT_BYTES: usize = 64;

    fn deserialize(bytes: &[u8]) -> Result<Self, DeserializeError> {
        if bytes.len() % 2 != 0 {
            return Err(DeserializeError("odd sample payload"));
        }
        Ok(LeastSquaresRequest {
            points: bytes.chunks(2).map(|pair| (pair[0], pair[1])).collect(),
        })
    }
}

/// Response: the fitted line
#[derive(Debug, Clone, PartialEq)]
struct LeastSquaresResponse {
    slope: f64,
    y_intercept: f64,
}

impl Response for LeastSquaresResponse {}

impl Serialize for LeastSquaresResponse {
    fn size_bytes(&self) -> usize {
        16
    }
    fn serialize(&self, buffer: &mut [u8]) {
        buffer[..8].copy_from_slice(&self.slope.to_le_bytes());
        buffer[8..16].copy_from_slice(&self.y_intercept.to_le_bytes());
    }
}

impl Deserialize for LeastSquaresResponse {
    const EXTENT_BYTES: usize = 64;

    fn deserialize(bytes: &[u8]) -> Result<Self, DeserializeError> {
        if bytes.len() < 16 {
            return Err(DeserializeError("response too short"));
        }
        Ok(LeastSquaresResponse {
            slope: f64::from_le_bytes(bytes[..8].try_into().unwrap()),
            y_intercept: f64::from_le_bytes(bytes[8..16].try_into().unwrap()),
        })
    }
}

/// Ordinary least squares over the sample points
fn fit(points: &[(u8, u8)]) -> LeastSquaresResponse {
    let count = points.len() as f64;
    let sum_x: f64 = points.iter().map(|(x, _)| f64::from(*x)).sum();
    let sum_y: f64 = points.iter().map(|(_, y)| f64::from(*y)).sum();
    let sum_xx: f64 = points.iter().map(|(x, _)| f64::from(*x) * f64::from(*x)).sum();
    let sum_xy: f64 = points
        .iter()
        .map(|(x, y)| f64::from(*x) * f64::from(*y))
        .sum();
    let slope = (count * sum_xy - sum_x * sum_y) / (count * sum_xx - sum_x * sum_x);
    let y_intercept = (sum_y - slope * sum_x) / count;
    LeastSquaresResponse { slope, y_intercept }
}

#[test]
fn client_calls_match_their_responses() {
    common::init_logging();
    let bus = CanBus::new();
    let client_endpoint = bus.endpoint();
    let server_endpoint = bus.endpoint();
    let service = ServiceId::try_from(123).unwrap();

    let server_thread = std::thread::spawn(move || {
        let transport = CanTransport::new(
            Box::new(server_endpoint),
            Some(NodeId::new(42)),
            CanTransportOptions::default(),
        )
        .unwrap();
        let presentation = Presentation::new(Box::new(transport));
        let server = presentation
            .make_server::<LeastSquaresRequest, LeastSquaresResponse>(service)
            .unwrap();
        let mut served = 0;
        let give_up = MonotonicTime::now() + Duration::from_secs(5);
        while served < 2 && MonotonicTime::now() < give_up {
            let deadline = MonotonicTime::now() + Duration::from_millis(50);
            if server
                .serve_next(|request, _| fit(&request.points), deadline)
                .unwrap()
            {
                served += 1;
            }
        }
        served
    });

    let transport = CanTransport::new(
        Box::new(client_endpoint),
        Some(NodeId::new(111)),
        CanTransportOptions::default(),
    )
    .unwrap();
    let presentation = Presentation::new(Box::new(transport));
    let client = presentation
        .make_client::<LeastSquaresRequest, LeastSquaresResponse>(service, NodeId::new(42))
        .unwrap();

    // Points (10, 1) and (20, 2) lie on y = 0.1 x + 0
    let request = LeastSquaresRequest {
        points: vec![(10, 1), (20, 2)],
    };
    let deadline = MonotonicTime::now() + Duration::from_secs(2);
    let (response, metadata) = client
        .call(&request, deadline)
        .unwrap()
        .expect("the response should arrive within the deadline");
    assert!((response.slope - 0.1).abs() < 1e-9);
    assert!(response.y_intercept.abs() < 1e-9);
    assert_eq!(metadata.source, Some(NodeId::new(42)));
    assert_eq!(metadata.transfer_id.to_u64(), 0);

    // The counter advances by one per call
    let deadline = MonotonicTime::now() + Duration::from_secs(2);
    let (_, metadata) = client
        .call(&request, deadline)
        .unwrap()
        .expect("the second response should arrive as well");
    assert_eq!(metadata.transfer_id.to_u64(), 1);

    assert_eq!(server_thread.join().unwrap(), 2);
}

#[test]
fn call_times_out_without_a_server() {
    common::init_logging();
    let bus = CanBus::new();
    let transport = CanTransport::new(
        Box::new(bus.endpoint()),
        Some(NodeId::new(111)),
        CanTransportOptions::default(),
    )
    .unwrap();
    let presentation = Presentation::new(Box::new(transport));
    let service = ServiceId::try_from(77).unwrap();
    let client = presentation
        .make_client::<LeastSquaresRequest, LeastSquaresResponse>(service, NodeId::new(42))
        .unwrap();

    let started = MonotonicTime::now();
    let result = client
        .call(
            &LeastSquaresRequest { points: vec![(1, 1)] },
            started + Duration::from_millis(100),
        )
        .unwrap();
    assert!(result.is_none());
    assert!(started.elapsed() >= Duration::from_millis(100));
}
