#[allow(dead_code)]
mod common;

use std::time::Duration;

use common::util;
use tele104::asdu::{cot, type_id};
use tele104::{apci, Slave};

fn slave_on(port: u16) -> Slave {
    let slave = Slave::new();
    slave.set_local_address("127.0.0.1");
    slave.set_local_port(port);
    slave
}

fn activated_master(slave: &Slave, port: u16) -> util::TestMaster {
    let mut master = util::TestMaster::connect(port);
    master.send_startdt();
    master.expect_apdu(slave, &apci::STARTDT_CON_MSG);
    master
}

#[test]
fn test_command_is_echoed_with_act_con() {
    let slave = slave_on(20440);
    slave.start_threadless().expect("start slave");

    let mut master = activated_master(&slave, 20440);

    // C_TS_NA_1 activation with the fixed test pattern.
    let command = vec![
        type_id::C_TS_NA_1,
        0x01,
        cot::ACTIVATION,
        0x00,
        0x01,
        0x00,
        0x00,
        0x00,
        0x00,
        0xaa,
        0x55,
    ];
    master.send_i_frame(0, 0, &command);

    let mut echoed = command.clone();
    echoed[2] = cot::ACTIVATION_CON;

    master.expect_apdu(&slave, &util::i_frame(0, 1, &echoed));

    slave.stop_threadless();
}

#[test]
fn test_command_with_wrong_cot_is_negative() {
    let slave = slave_on(20441);
    slave.start_threadless().expect("start slave");

    let mut master = activated_master(&slave, 20441);

    let mut command = vec![
        type_id::C_TS_NA_1,
        0x01,
        cot::SPONTANEOUS,
        0x00,
        0x01,
        0x00,
        0x00,
        0x00,
        0x00,
        0xaa,
        0x55,
    ];
    master.send_i_frame(0, 0, &command);

    command[2] = cot::UNKNOWN_COT | 0x40;

    master.expect_apdu(&slave, &util::i_frame(0, 1, &command));

    slave.stop_threadless();
}

#[test]
fn unknown_type_is_echoed_negative() {
    let slave = slave_on(20442);
    slave.start_threadless().expect("start slave");

    let mut master = activated_master(&slave, 20442);

    let mut asdu = util::spontaneous_asdu_bytes(1, 0x01);
    master.send_i_frame(0, 0, &asdu);

    asdu[2] = cot::UNKNOWN_TYPE_ID | 0x40;

    master.expect_apdu(&slave, &util::i_frame(0, 1, &asdu));

    slave.stop_threadless();
}

#[test]
fn interrogation_handler_drives_act_con_and_term() {
    let slave = slave_on(20443);

    slave.set_interrogation_handler(|connection, asdu, qoi| {
        assert_eq!(qoi, 20);
        connection.send_act_con(asdu, false);
        connection.send_act_term(asdu);
        true
    });

    slave.start_threadless().expect("start slave");

    let mut master = activated_master(&slave, 20443);

    // C_IC_NA_1 activation, QOI 20 (station interrogation).
    let command = vec![
        type_id::C_IC_NA_1,
        0x01,
        cot::ACTIVATION,
        0x00,
        0x01,
        0x00,
        0x00,
        0x00,
        0x00,
        20,
    ];
    master.send_i_frame(0, 0, &command);

    let mut act_con = command.clone();
    act_con[2] = cot::ACTIVATION_CON;
    master.expect_apdu(&slave, &util::i_frame(0, 1, &act_con));

    let mut act_term = command.clone();
    act_term[2] = cot::ACTIVATION_TERMINATION;
    master.expect_apdu(&slave, &util::i_frame(1, 1, &act_term));

    slave.stop_threadless();
}

#[test]
fn clock_sync_confirmation_carries_the_time() {
    let slave = slave_on(20444);
    slave.set_clock_sync_handler(|_, _, time| {
        assert_eq!(time.minute(), 34);
        true
    });
    slave.start_threadless().expect("start slave");

    let mut master = activated_master(&slave, 20444);

    let time_bytes = [0xd5, 0xdd, 0x22, 0x0c, 0x0f, 0x06, 0x18];

    let mut command = vec![
        type_id::C_CS_NA_1,
        0x01,
        cot::ACTIVATION,
        0x00,
        0x01,
        0x00,
        0x00,
        0x00,
        0x00,
    ];
    command.extend_from_slice(&time_bytes);
    master.send_i_frame(0, 0, &command);

    // The positive confirmation echoes the time with COT ACT_CON.
    let mut confirmation = command.clone();
    confirmation[2] = cot::ACTIVATION_CON;

    master.expect_apdu(&slave, &util::i_frame(0, 1, &confirmation));

    slave.stop_threadless();
}

#[test]
fn rejected_clock_sync_is_negative() {
    let slave = slave_on(20445);
    slave.set_clock_sync_handler(|_, _, _| false);
    slave.start_threadless().expect("start slave");

    let mut master = activated_master(&slave, 20445);

    let mut command = vec![
        type_id::C_CS_NA_1,
        0x01,
        cot::ACTIVATION,
        0x00,
        0x01,
        0x00,
        0x00,
        0x00,
        0x00,
    ];
    command.extend_from_slice(&[0xd5, 0xdd, 0x22, 0x0c, 0x0f, 0x06, 0x18]);
    master.send_i_frame(0, 0, &command);

    command[2] = cot::ACTIVATION_CON | 0x40;

    master.expect_apdu(&slave, &util::i_frame(0, 1, &command));

    slave.stop_threadless();
}

#[test]
fn plugins_intercept_before_builtin_dispatch() {
    use tele104::{ConnectionHandle, PluginResult, SlavePlugin};

    struct Swallow;

    impl SlavePlugin for Swallow {
        fn handle_asdu(
            &self,
            _connection: &ConnectionHandle,
            asdu: &mut tele104::Asdu,
        ) -> PluginResult {
            if asdu.type_id() == type_id::C_TS_NA_1 {
                PluginResult::Handled
            } else {
                PluginResult::NotHandled
            }
        }
    }

    let slave = slave_on(20446);
    slave.add_plugin(std::sync::Arc::new(Swallow));
    slave.start_threadless().expect("start slave");

    let mut master = activated_master(&slave, 20446);

    // The plugin consumes the test command; no echo comes back.
    let command = vec![
        type_id::C_TS_NA_1,
        0x01,
        cot::ACTIVATION,
        0x00,
        0x01,
        0x00,
        0x00,
        0x00,
        0x00,
        0xaa,
        0x55,
    ];
    master.send_i_frame(0, 0, &command);

    master.expect_silence(&slave, Duration::from_millis(300));

    slave.stop_threadless();
}
