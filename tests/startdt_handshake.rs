#[allow(dead_code)]
mod common;

use std::time::Duration;

use common::util;
use tele104::apci;

#[test]
fn startdt_activates_and_data_flows() {
    let slave = util::threadless_slave(20401);
    let mut master = util::TestMaster::connect(20401);

    assert!(util::tick_until(&slave, Duration::from_secs(2), || {
        slave.open_connection_count() == 1
    }));

    master.send_startdt();
    master.expect_apdu(&slave, &apci::STARTDT_CON_MSG);

    let asdu = util::spontaneous_asdu(1, 0x2a);
    slave.enqueue_asdu(&asdu);

    let expected_asdu = util::spontaneous_asdu_bytes(1, 0x2a);
    let expected_frame = util::i_frame(0, 0, &expected_asdu);

    let frame = master
        .read_apdu(&slave, util::DEFAULT_DEADLINE)
        .expect("I frame after activation");

    assert_eq!(frame, expected_frame);
    assert_eq!(frame[..6], [0x68, 0x0e, 0x00, 0x00, 0x00, 0x00]);

    slave.stop_threadless();
}

#[test]
fn backlog_enqueued_before_activation_is_delivered_in_order() {
    let slave = util::threadless_slave(20402);

    for value in 0..3u8 {
        slave.enqueue_asdu(&util::spontaneous_asdu(1, value));
    }

    let mut master = util::TestMaster::connect(20402);
    master.send_startdt();
    master.expect_apdu(&slave, &apci::STARTDT_CON_MSG);

    for value in 0..3u8 {
        let expected = util::i_frame(value as u16, 0, &util::spontaneous_asdu_bytes(1, value));
        master.expect_apdu(&slave, &expected);
    }

    slave.stop_threadless();
}

#[test]
fn i_frames_are_ignored_while_inactive() {
    let slave = util::threadless_slave(20403);
    let mut master = util::TestMaster::connect(20403);

    assert!(util::tick_until(&slave, Duration::from_secs(2), || {
        slave.open_connection_count() == 1
    }));

    // Sequence numbers are tracked, but no dispatch happens and no
    // response is produced (w is not reached).
    master.send_i_frame(0, 0, &util::spontaneous_asdu_bytes(1, 1));
    master.expect_silence(&slave, Duration::from_millis(300));

    // The counter advanced: activation plus a stale N(S) now closes.
    master.send_startdt();
    master.expect_apdu(&slave, &apci::STARTDT_CON_MSG);

    master.send_i_frame(0, 0, &util::spontaneous_asdu_bytes(1, 2));
    assert!(master.is_closed(&slave, Duration::from_secs(2)));

    slave.stop_threadless();
}
