mod common;

use common::{collector, recv_within, text};
use cosim_comms_core::{
    config::ServerMode,
    transports::{UdpComms, UdpTransport},
    ActionMessage, ConnectionStatus, NetworkBrokerData, RouteId,
};
use std::time::Duration;
use tokio::net::UdpSocket;

const WAIT: Duration = Duration::from_secs(5);

fn root(name: &str, port: u16) -> UdpComms {
    let comms = UdpComms::new(UdpTransport::new());
    comms.set_name(name);
    comms.load_network_info(&NetworkBrokerData {
        port_number: Some(port),
        local_interface: "127.0.0.1".into(),
        ..Default::default()
    });
    comms
}

#[tokio::test]
#[tracing_test::traced_test]
async fn sub_broker_gets_port_from_root() {
    let a = root("a", 41000);
    let (callback, mut at_a) = collector();
    a.set_callback(callback);
    assert!(a.connect().await);
    assert_eq!(a.address(), "127.0.0.1:41000");

    let b = UdpComms::new(UdpTransport::new());
    b.set_name("b");
    b.load_network_info(&NetworkBrokerData {
        broker_address: "127.0.0.1:41000".into(),
        server_mode: ServerMode::DefaultDeactivated,
        ..Default::default()
    });
    let (callback, mut at_b) = collector();
    b.set_callback(callback);
    assert!(b.connect().await);
    assert_eq!(b.transport().network().port(), Some(41005));
    assert_eq!(b.address(), "localhost:41005");

    b.transmit(RouteId::PARENT, text("to root"));
    let message = recv_within(&mut at_a, WAIT).await.unwrap();
    assert_eq!(message.payload_str(), "to root");

    a.add_route(RouteId(7), &b.address());
    a.transmit(RouteId(7), text("to leaf"));
    let message = recv_within(&mut at_b, WAIT).await.unwrap();
    assert_eq!(message.payload_str(), "to leaf");

    a.remove_route(RouteId(7));
    a.transmit(RouteId(7), text("lost"));
    assert!(recv_within(&mut at_b, Duration::from_millis(500)).await.is_none());

    b.disconnect().await;
    a.disconnect().await;
    assert_eq!(a.rx_status(), ConnectionStatus::Terminated);
    assert_eq!(b.tx_status(), ConnectionStatus::Terminated);
}

#[tokio::test]
async fn malformed_datagrams_are_skipped() {
    let a = root("a", 41100);
    let (callback, mut at_a) = collector();
    a.set_callback(callback);
    assert!(a.connect().await);

    let sender = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    sender.send_to(&[1, 2, 3], "127.0.0.1:41100").await.unwrap();
    let message: ActionMessage = text("intact");
    sender
        .send_to(&message.to_bytes().unwrap(), "127.0.0.1:41100")
        .await
        .unwrap();

    let received = recv_within(&mut at_a, WAIT).await.unwrap();
    assert_eq!(received, message);
    assert!(a.is_connected());
    a.disconnect().await;
}

#[tokio::test]
async fn silent_broker_exhausts_retries() {
    let b = UdpComms::new(UdpTransport::new());
    b.set_name("b");
    b.load_network_info(&NetworkBrokerData {
        broker_address: "127.0.0.1:41200".into(),
        max_retries: 1,
        connection_timeout_ms: 200,
        ..Default::default()
    });
    b.set_callback(collector().0);
    assert!(!b.connect().await);
    assert_eq!(b.tx_status(), ConnectionStatus::Error);
}
