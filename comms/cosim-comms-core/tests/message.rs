use cosim_comms_core::{
    message::{ExtendedInfo, FramingError, MIN_FRAME_SIZE},
    Action, ActionMessage, ProtocolCommand,
};

#[test]
fn plain_message_survives_the_wire() -> anyhow::Result<()> {
    let mut message = ActionMessage::new(Action::TICK);
    message.message_id = 71;
    message.source_id = 131_072;
    message.source_handle = 4;
    message.dest_id = -3;
    message.dest_handle = 9;
    message.counter = 65_000;
    message.flags = 0b1010;
    message.extra_data = -40;
    message.action_time = 1_500_000_000;
    message.payload = "payload with \0 bytes".into();
    message.set_string_data(["alpha", "", "gamma δ"]);

    let frame = message.to_bytes()?;
    assert_eq!(frame.len(), message.encoded_len());
    assert_eq!(ActionMessage::from_bytes(&frame)?, message);
    Ok(())
}

#[test]
fn extended_info_survives_the_wire() -> anyhow::Result<()> {
    let mut message = ActionMessage::new(Action::SEND_MESSAGE);
    assert!(message.info().is_some());
    *message.info_mut().unwrap() = ExtendedInfo {
        orig_source: 11,
        orig_dest: 12,
        sequence: 13,
        data: "routing detail".into(),
    };
    message.payload = "body".into();

    let decoded = ActionMessage::from_bytes(&message.to_bytes()?)?;
    assert_eq!(decoded.info().map(|info| info.sequence), Some(13));
    assert_eq!(decoded, message);
    Ok(())
}

#[test]
fn priority_query_carries_info() {
    // Large negative codes are both priority and extended
    let message = ActionMessage::new(Action::QUERY);
    assert!(message.is_priority());
    assert!(message.info().is_some());
    let decoded = ActionMessage::from_bytes(&message.to_bytes().unwrap()).unwrap();
    assert_eq!(decoded.action(), Action::QUERY);
}

#[test]
fn protocol_commands_decode() {
    let mut request = ActionMessage::priority_protocol(ProtocolCommand::RequestPorts);
    request.counter = 2;
    request.payload = "localhost".into();
    let decoded = ActionMessage::from_bytes(&request.to_bytes().unwrap()).unwrap();
    assert!(decoded.is_priority());
    assert_eq!(decoded.protocol_command(), Some(ProtocolCommand::RequestPorts));
    assert_eq!(decoded.counter, 2);

    let big = ActionMessage::new(Action::PROTOCOL_BIG);
    assert!(big.is_protocol());
    assert!(big.info().is_some());
}

#[test]
fn short_frames_are_rejected() {
    let frame = ActionMessage::new(Action::TICK).to_bytes().unwrap();
    assert_eq!(frame.len(), MIN_FRAME_SIZE);
    assert_eq!(
        ActionMessage::from_bytes(&frame[..10]),
        Err(FramingError::TooShort {
            needed: MIN_FRAME_SIZE,
            available: 10
        })
    );
}
