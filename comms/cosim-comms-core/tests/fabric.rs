mod common;

use common::{collector, recv_within, text};
use cosim_comms_core::{
    transports::{FabricComms, FabricTransport},
    ConnectionStatus, NetworkBrokerData, RouteId,
};
use std::time::Duration;

const WAIT: Duration = Duration::from_secs(5);

#[tokio::test]
#[tracing_test::traced_test]
async fn pushes_both_ways_after_negotiating_ports() {
    let a = FabricComms::new(FabricTransport::new());
    a.set_name("a");
    a.load_network_info(&NetworkBrokerData {
        port_number: Some(43000),
        local_interface: "127.0.0.1".into(),
        ..Default::default()
    });
    let (callback, mut at_a) = collector();
    a.set_callback(callback);
    assert!(a.connect().await);

    let b = FabricComms::new(FabricTransport::new());
    b.set_name("b");
    b.load_network_info(&NetworkBrokerData {
        broker_address: "127.0.0.1:43000".into(),
        ..Default::default()
    });
    let (callback, mut at_b) = collector();
    b.set_callback(callback);
    assert!(b.connect().await);
    assert_eq!(b.transport().network().port(), Some(43010));
    assert_eq!(b.address(), "localhost:43010");

    b.transmit(RouteId::PARENT, text("pushed up"));
    let message = recv_within(&mut at_a, WAIT).await.unwrap();
    assert_eq!(message.payload_str(), "pushed up");

    a.add_route(RouteId(4), &b.address());
    a.transmit(RouteId(4), text("pushed down"));
    let message = recv_within(&mut at_b, WAIT).await.unwrap();
    assert_eq!(message.payload_str(), "pushed down");

    b.disconnect().await;
    a.disconnect().await;
    assert_eq!(a.tx_status(), ConnectionStatus::Terminated);
    assert_eq!(b.rx_status(), ConnectionStatus::Terminated);
}
