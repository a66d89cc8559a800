//! A minimal test master: a raw TCP client speaking just enough 104 to
//! drive the slave through the scenarios.

use std::io::{Read, Write};
use std::net::TcpStream;
use std::time::{Duration, Instant};

use tele104::apci;
use tele104::asdu::{cot, Asdu};
use tele104::Slave;

pub const READ_TIMEOUT: Duration = Duration::from_millis(50);
pub const DEFAULT_DEADLINE: Duration = Duration::from_secs(3);

pub struct TestMaster {
    stream: TcpStream,
}

impl TestMaster {
    pub fn connect(port: u16) -> Self {
        let stream = TcpStream::connect(("127.0.0.1", port)).expect("connect to slave");
        stream
            .set_read_timeout(Some(READ_TIMEOUT))
            .expect("set read timeout");
        stream.set_nodelay(true).expect("set nodelay");

        Self { stream }
    }

    pub fn send(&mut self, bytes: &[u8]) {
        self.stream.write_all(bytes).expect("write to slave");
    }

    pub fn send_startdt(&mut self) {
        self.send(&apci::STARTDT_ACT_MSG);
    }

    pub fn send_stopdt(&mut self) {
        self.send(&apci::STOPDT_ACT_MSG);
    }

    pub fn send_i_frame(&mut self, send_seq: u16, recv_seq: u16, asdu_bytes: &[u8]) {
        let frame_size = apci::APCI_LENGTH + asdu_bytes.len();
        let mut frame = vec![0u8; frame_size];

        apci::write_i_header(&mut frame, frame_size, send_seq, recv_seq);
        frame[apci::APCI_LENGTH..].copy_from_slice(asdu_bytes);

        self.send(&frame);
    }

    pub fn send_s_frame(&mut self, recv_seq: u16) {
        self.send(&apci::s_frame(recv_seq));
    }

    pub fn drop_connection(self) {
        drop(self.stream);
    }

    /// Reads one APDU, driving the threadless slave while waiting.
    /// Returns None on timeout or a closed connection.
    pub fn read_apdu(&mut self, slave: &Slave, deadline: Duration) -> Option<Vec<u8>> {
        self.read_apdu_with(|| slave.tick(), deadline)
    }

    /// Reads one APDU from a slave running its own threads.
    pub fn read_apdu_blocking(&mut self, deadline: Duration) -> Option<Vec<u8>> {
        self.read_apdu_with(|| (), deadline)
    }

    fn read_apdu_with(&mut self, mut drive: impl FnMut(), deadline: Duration) -> Option<Vec<u8>> {
        let give_up = Instant::now() + deadline;

        let mut header = [0u8; 2];
        self.read_exact_with(&mut header, &mut drive, give_up)?;

        let mut body = vec![0u8; header[1] as usize];
        self.read_exact_with(&mut body, &mut drive, give_up)?;

        let mut apdu = header.to_vec();
        apdu.extend_from_slice(&body);
        Some(apdu)
    }

    fn read_exact_with(
        &mut self,
        out: &mut [u8],
        drive: &mut impl FnMut(),
        give_up: Instant,
    ) -> Option<()> {
        let mut got = 0;

        while got < out.len() {
            drive();

            match self.stream.read(&mut out[got..]) {
                Ok(0) => return None,
                Ok(n) => got += n,
                Err(err)
                    if err.kind() == std::io::ErrorKind::WouldBlock
                        || err.kind() == std::io::ErrorKind::TimedOut =>
                {
                    if Instant::now() > give_up {
                        return None;
                    }
                }
                Err(_) => return None,
            }
        }

        Some(())
    }

    pub fn expect_apdu(&mut self, slave: &Slave, expected: &[u8]) {
        let apdu = self
            .read_apdu(slave, DEFAULT_DEADLINE)
            .expect("expected an APDU before timeout");
        assert_eq!(apdu, expected);
    }

    /// Asserts the slave stays quiet for `window`.
    pub fn expect_silence(&mut self, slave: &Slave, window: Duration) {
        assert_eq!(self.read_apdu(slave, window), None);
    }

    /// True once the slave has closed the socket.
    pub fn is_closed(&mut self, slave: &Slave, deadline: Duration) -> bool {
        let give_up = Instant::now() + deadline;
        let mut byte = [0u8; 1];

        loop {
            slave.tick();

            match self.stream.read(&mut byte) {
                Ok(0) => return true,
                Ok(_) => continue,
                Err(err)
                    if err.kind() == std::io::ErrorKind::WouldBlock
                        || err.kind() == std::io::ErrorKind::TimedOut =>
                {
                    if Instant::now() > give_up {
                        return false;
                    }
                }
                Err(_) => return true,
            }
        }
    }
}

/// Ticks the slave for roughly `duration`.
pub fn tick_for(slave: &Slave, duration: Duration) {
    let give_up = Instant::now() + duration;

    while Instant::now() < give_up {
        slave.tick();
        std::thread::sleep(Duration::from_millis(1));
    }
}

/// Ticks until `predicate` holds or `deadline` passes; returns whether
/// it held.
pub fn tick_until(slave: &Slave, deadline: Duration, predicate: impl Fn() -> bool) -> bool {
    let give_up = Instant::now() + deadline;

    loop {
        slave.tick();

        if predicate() {
            return true;
        }

        if Instant::now() > give_up {
            return false;
        }

        std::thread::sleep(Duration::from_millis(1));
    }
}

/// A threadless slave listening on 127.0.0.1.
pub fn threadless_slave(port: u16) -> Slave {
    let slave = Slave::new();
    slave.set_local_address("127.0.0.1");
    slave.set_local_port(port);
    slave.start_threadless().expect("start slave");
    slave
}

/// A single-point monitor ASDU (type 1, spontaneous) for backlog tests.
pub fn spontaneous_asdu(common_address: u16, value: u8) -> Asdu {
    let mut asdu = Asdu::new(1, cot::SPONTANEOUS, common_address);
    asdu.add_information_object_raw(&[0x01, 0x00, 0x00, value]);
    asdu
}

/// The wire bytes `spontaneous_asdu` encodes to with default parameters.
pub fn spontaneous_asdu_bytes(common_address: u16, value: u8) -> Vec<u8> {
    vec![
        1,
        0x01,
        cot::SPONTANEOUS,
        0x00,
        common_address as u8,
        (common_address >> 8) as u8,
        0x01,
        0x00,
        0x00,
        value,
    ]
}

/// An I frame as the slave would emit it.
pub fn i_frame(send_seq: u16, recv_seq: u16, asdu_bytes: &[u8]) -> Vec<u8> {
    let frame_size = apci::APCI_LENGTH + asdu_bytes.len();
    let mut frame = vec![0u8; frame_size];

    apci::write_i_header(&mut frame, frame_size, send_seq, recv_seq);
    frame[apci::APCI_LENGTH..].copy_from_slice(asdu_bytes);

    frame
}
