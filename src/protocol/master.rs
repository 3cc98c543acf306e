use std::thread;
use std::time::Duration;

use anyhow::Result;
use log::debug;
use serialport::SerialPort;

use super::v1::{
    decode_status, encode_instruction, Instruction, BROADCAST_ID, MAX_ID, MAX_PACKET, MAX_PARAMS,
};
use super::ProtocolError;
use crate::port;

/// Whether WRITE_DATA waits for the device's status packet.
///
/// Which one is right depends on the status-return-level register of
/// the devices on the bus: with the factory default (2, "respond to
/// everything") `AwaitStatus` is the correct mode and actually detects
/// refused writes; with status returns disabled it would only ever
/// time out, so `FireAndForget` is the one to pick.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteMode {
    AwaitStatus,
    FireAndForget,
}

/// Per-operation retry behavior. Every command makes `retries + 1`
/// attempts, sleeping `backoff` between attempts, and reports the last
/// failure. The default is a single attempt; retry policy belongs to
/// the caller, not hardcoded in this layer.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub retries: usize,
    pub backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            retries: 0,
            backoff: Duration::ZERO,
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct MasterConfig {
    /// Read deadline for one attempt at receiving a status packet.
    pub read_timeout: Duration,
    pub retry: RetryPolicy,
    pub write_mode: WriteMode,
}

impl Default for MasterConfig {
    fn default() -> Self {
        Self {
            read_timeout: Duration::from_millis(100),
            retry: RetryPolicy::default(),
            write_mode: WriteMode::AwaitStatus,
        }
    }
}

/// The actuator command set: ping, read, write and sync write mapped
/// onto v1 frames over one exclusively owned serial port.
///
/// One `Master` per physical port. Exchanges are synchronous and
/// blocking; framing correctness requires that no two instructions
/// interleave their bytes, so sharing a port between masters is not
/// supported. Dropping the `Master` closes the port, which also fails
/// an in-flight read from another thread with an I/O error.
pub struct Master {
    port: Box<dyn SerialPort + Send>,
    config: MasterConfig,
}

impl Master {
    /// Wraps an already open port, applying `config.read_timeout` to it.
    pub fn new(mut port: Box<dyn SerialPort + Send>, config: MasterConfig) -> Result<Self> {
        port.set_timeout(config.read_timeout)?;
        Ok(Self { port, config })
    }

    /// Opens `port_name` at `baudrate` and wraps it.
    pub fn open(port_name: &str, baudrate: u32, config: MasterConfig) -> Result<Self> {
        let port = port::open_port(port_name, baudrate, false)?;
        Self::new(port, config)
    }

    /// Releases the port without closing it.
    pub fn into_port(self) -> Box<dyn SerialPort + Send> {
        self.port
    }

    /// Checks whether the device answers on the bus.
    ///
    /// A read timeout (after all retries) means "not wired" and maps to
    /// `Ok(false)`. A device that answers with a fault bit set is
    /// present but malfunctioning and surfaces as an error, as does a
    /// corrupted reply; the caller reacts differently to those.
    pub fn ping(&mut self, id: u8) -> Result<bool> {
        check_unicast(id)?;

        match self.with_retry(|m| m.ping_once(id)) {
            Ok(()) => Ok(true),
            Err(ProtocolError::Timeout) => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    /// Reads `count` raw register bytes starting at `address`.
    ///
    /// Multi-byte registers arrive little-endian; composing them is the
    /// caller's business (`u16::from_le_bytes` and friends).
    pub fn read(&mut self, id: u8, address: u8, count: u8) -> Result<Vec<u8>> {
        check_unicast(id)?;
        // The status length byte caps the reply at MAX_PARAMS data bytes.
        if usize::from(count) > MAX_PARAMS {
            return Err(ProtocolError::Oversize(count.into()).into());
        }

        self.with_retry(|m| m.read_once(id, address, count))
            .map_err(Into::into)
    }

    /// Writes raw register bytes at `address` on a single device.
    pub fn write(&mut self, id: u8, address: u8, data: &[u8]) -> Result<()> {
        check_unicast(id)?;
        if 1 + data.len() > MAX_PARAMS {
            return Err(ProtocolError::Oversize(1 + data.len()).into());
        }

        self.with_retry(|m| m.write_once(id, address, data))
            .map_err(Into::into)
    }

    /// Writes one register across many devices in a single broadcast
    /// frame; each entry is `(id, value)` with every value exactly
    /// `width` bytes.
    ///
    /// Broadcast instructions receive no reply, so `Ok` only means the
    /// frame was transmitted, not that every device accepted it. That
    /// is a protocol limitation, not a gap in this driver; read the
    /// register back where confirmation matters.
    pub fn sync_write(&mut self, address: u8, width: u8, entries: &[(u8, &[u8])]) -> Result<()> {
        let mut params = Vec::with_capacity(2 + entries.len() * (1 + usize::from(width)));
        params.push(address);
        params.push(width);

        for &(id, value) in entries {
            check_unicast(id)?;
            if value.len() != usize::from(width) {
                return Err(ProtocolError::WidthMismatch {
                    id,
                    want: width.into(),
                    got: value.len(),
                }
                .into());
            }
            params.push(id);
            params.extend_from_slice(value);
        }

        if params.len() > MAX_PARAMS {
            return Err(ProtocolError::Oversize(params.len()).into());
        }

        let mut buffer = [0u8; MAX_PACKET];
        let len_write =
            encode_instruction(&mut buffer, BROADCAST_ID, Instruction::SyncWrite, &params);

        debug!(
            "sync write {:#04X} x{} to {} devices",
            address,
            width,
            entries.len()
        );
        self.send_frame(&buffer[..len_write]).map_err(Into::into)
    }

    fn with_retry<T>(
        &mut self,
        mut op: impl FnMut(&mut Self) -> Result<T, ProtocolError>,
    ) -> Result<T, ProtocolError> {
        let RetryPolicy { retries, backoff } = self.config.retry;
        let mut error = None;

        for attempt in 0..=retries {
            if attempt > 0 && !backoff.is_zero() {
                thread::sleep(backoff);
            }
            match op(self) {
                Ok(v) => return Ok(v),
                Err(e) => error = Some(e),
            }
        }
        Err(error.unwrap())
    }

    fn ping_once(&mut self, id: u8) -> Result<(), ProtocolError> {
        let mut buffer = [0u8; MAX_PACKET];
        let len_write = encode_instruction(&mut buffer, id, Instruction::Ping, &[]);

        debug!("ping {}", id);
        self.send_frame(&buffer[..len_write])?;

        let len_read = 6;
        self.recv_frame(&mut buffer[..len_read])?;
        decode_status(&buffer[..len_read], id, 0).map(|_| ())
    }

    fn read_once(&mut self, id: u8, address: u8, count: u8) -> Result<Vec<u8>, ProtocolError> {
        let mut buffer = [0u8; MAX_PACKET];
        let len_write = encode_instruction(&mut buffer, id, Instruction::ReadData, &[address, count]);

        debug!("read {} {:#04X} x{}", id, address, count);
        self.send_frame(&buffer[..len_write])?;

        let len_read = 6 + usize::from(count);
        self.recv_frame(&mut buffer[..len_read])?;
        decode_status(&buffer[..len_read], id, count.into()).map(|data| data.to_vec())
    }

    fn write_once(&mut self, id: u8, address: u8, data: &[u8]) -> Result<(), ProtocolError> {
        let mut params = [0u8; MAX_PARAMS];
        params[0] = address;
        params[1..=data.len()].copy_from_slice(data);

        let mut buffer = [0u8; MAX_PACKET];
        let len_write =
            encode_instruction(&mut buffer, id, Instruction::WriteData, &params[..=data.len()]);

        debug!("write {} {:#04X} {:02X?}", id, address, data);
        self.send_frame(&buffer[..len_write])?;

        match self.config.write_mode {
            WriteMode::AwaitStatus => {
                let len_read = 6;
                self.recv_frame(&mut buffer[..len_read])?;
                decode_status(&buffer[..len_read], id, 0).map(|_| ())
            }
            WriteMode::FireAndForget => Ok(()),
        }
    }

    fn send_frame(&mut self, frame: &[u8]) -> Result<(), ProtocolError> {
        debug!("send {:02X?}", frame);
        self.port.write_all(frame).map_err(ProtocolError::Transport)
    }

    fn recv_frame(&mut self, buffer: &mut [u8]) -> Result<(), ProtocolError> {
        self.port
            .read_exact(buffer)
            .map_err(ProtocolError::from_read)?;
        debug!("recv {:02X?}", &buffer);
        Ok(())
    }
}

fn check_unicast(id: u8) -> Result<(), ProtocolError> {
    if id > MAX_ID {
        return Err(ProtocolError::InvalidId(id));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::v1::{checksum, DeviceFault};
    use serialport::{ClearBuffer, DataBits, FlowControl, Parity, StopBits};
    use std::collections::VecDeque;
    use std::io::{self, Read, Write};
    use std::sync::{Arc, Mutex};

    /// Byte-level view of the bus as the tests see it: what the master
    /// transmitted and what the scripted device will answer.
    #[derive(Default)]
    struct Wire {
        rx: VecDeque<u8>,
        tx: Vec<u8>,
    }

    struct MockPort {
        wire: Arc<Mutex<Wire>>,
        timeout: Duration,
    }

    fn mock_port(replies: &[u8]) -> (Box<MockPort>, Arc<Mutex<Wire>>) {
        let wire = Arc::new(Mutex::new(Wire {
            rx: replies.iter().copied().collect(),
            tx: Vec::new(),
        }));
        let port = Box::new(MockPort {
            wire: wire.clone(),
            timeout: Duration::ZERO,
        });
        (port, wire)
    }

    fn master_over(replies: &[u8], config: MasterConfig) -> (Master, Arc<Mutex<Wire>>) {
        let (port, wire) = mock_port(replies);
        (Master::new(port, config).unwrap(), wire)
    }

    fn sent(wire: &Arc<Mutex<Wire>>) -> Vec<u8> {
        wire.lock().unwrap().tx.clone()
    }

    impl Read for MockPort {
        fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
            let mut wire = self.wire.lock().unwrap();
            if wire.rx.is_empty() {
                return Err(io::Error::new(io::ErrorKind::TimedOut, "mock rx drained"));
            }
            let n = buf.len().min(wire.rx.len());
            for slot in buf[..n].iter_mut() {
                *slot = wire.rx.pop_front().unwrap();
            }
            Ok(n)
        }
    }

    impl Write for MockPort {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            self.wire.lock().unwrap().tx.extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    impl SerialPort for MockPort {
        fn name(&self) -> Option<String> {
            Some("mock".to_string())
        }

        fn baud_rate(&self) -> serialport::Result<u32> {
            Ok(1_000_000)
        }

        fn data_bits(&self) -> serialport::Result<DataBits> {
            Ok(DataBits::Eight)
        }

        fn flow_control(&self) -> serialport::Result<FlowControl> {
            Ok(FlowControl::None)
        }

        fn parity(&self) -> serialport::Result<Parity> {
            Ok(Parity::None)
        }

        fn stop_bits(&self) -> serialport::Result<StopBits> {
            Ok(StopBits::One)
        }

        fn timeout(&self) -> Duration {
            self.timeout
        }

        fn set_baud_rate(&mut self, _baud_rate: u32) -> serialport::Result<()> {
            Ok(())
        }

        fn set_data_bits(&mut self, _data_bits: DataBits) -> serialport::Result<()> {
            Ok(())
        }

        fn set_flow_control(&mut self, _flow_control: FlowControl) -> serialport::Result<()> {
            Ok(())
        }

        fn set_parity(&mut self, _parity: Parity) -> serialport::Result<()> {
            Ok(())
        }

        fn set_stop_bits(&mut self, _stop_bits: StopBits) -> serialport::Result<()> {
            Ok(())
        }

        fn set_timeout(&mut self, timeout: Duration) -> serialport::Result<()> {
            self.timeout = timeout;
            Ok(())
        }

        fn write_request_to_send(&mut self, _level: bool) -> serialport::Result<()> {
            Ok(())
        }

        fn write_data_terminal_ready(&mut self, _level: bool) -> serialport::Result<()> {
            Ok(())
        }

        fn read_clear_to_send(&mut self) -> serialport::Result<bool> {
            Ok(false)
        }

        fn read_data_set_ready(&mut self) -> serialport::Result<bool> {
            Ok(false)
        }

        fn read_ring_indicator(&mut self) -> serialport::Result<bool> {
            Ok(false)
        }

        fn read_carrier_detect(&mut self) -> serialport::Result<bool> {
            Ok(false)
        }

        fn bytes_to_read(&self) -> serialport::Result<u32> {
            Ok(self.wire.lock().unwrap().rx.len() as u32)
        }

        fn bytes_to_write(&self) -> serialport::Result<u32> {
            Ok(0)
        }

        fn clear(&self, _buffer_to_clear: ClearBuffer) -> serialport::Result<()> {
            Ok(())
        }

        fn try_clone(&self) -> serialport::Result<Box<dyn SerialPort>> {
            Err(serialport::Error::new(
                serialport::ErrorKind::Unknown,
                "mock port cannot be cloned",
            ))
        }

        fn set_break(&self) -> serialport::Result<()> {
            Ok(())
        }

        fn clear_break(&self) -> serialport::Result<()> {
            Ok(())
        }
    }

    fn protocol_error(err: &anyhow::Error) -> &ProtocolError {
        err.downcast_ref().expect("not a protocol error")
    }

    const PING_STATUS: [u8; 6] = [0xFF, 0xFF, 0x01, 0x02, 0x00, 0xFC];

    #[test]
    fn ping_answered() {
        let (mut master, wire) = master_over(&PING_STATUS, MasterConfig::default());

        assert!(master.ping(1).unwrap());
        assert_eq!(sent(&wire), [0xFF, 0xFF, 0x01, 0x02, 0x01, 0xFB]);
    }

    #[test]
    fn ping_silent_bus_is_false() {
        let (mut master, _) = master_over(&[], MasterConfig::default());

        assert!(!master.ping(1).unwrap());
    }

    #[test]
    fn ping_faulted_device_is_an_error() {
        let error = DeviceFault::OVERHEATING;
        let frame = [0xFF, 0xFF, 0x01, 0x02, error, checksum(&[0x01, 0x02, error])];
        let (mut master, _) = master_over(&frame, MasterConfig::default());

        let err = master.ping(1).unwrap_err();
        assert!(matches!(protocol_error(&err), ProtocolError::Device(_)));
    }

    #[test]
    fn read_present_position() {
        // Status carrying 0x01A0 little-endian.
        let frame = [
            0xFF,
            0xFF,
            0x01,
            0x04,
            0x00,
            0xA0,
            0x01,
            checksum(&[0x01, 0x04, 0x00, 0xA0, 0x01]),
        ];
        let (mut master, wire) = master_over(&frame, MasterConfig::default());

        let data = master.read(1, 0x24, 2).unwrap();
        assert_eq!(data, [0xA0, 0x01]);
        assert_eq!(u16::from_le_bytes([data[0], data[1]]), 0x01A0);

        assert_eq!(
            sent(&wire),
            [0xFF, 0xFF, 0x01, 0x04, 0x02, 0x24, 0x02, 0xD2]
        );
    }

    #[test]
    fn read_timeout_is_timeout_not_framing() {
        let (mut master, _) = master_over(&[], MasterConfig::default());

        let err = master.read(1, 0x24, 2).unwrap_err();
        assert!(matches!(protocol_error(&err), ProtocolError::Timeout));
    }

    #[test]
    fn read_corrupted_reply() {
        let mut frame = [0xFF, 0xFF, 0x01, 0x03, 0x00, 0x20, 0xDB];
        frame[5] ^= 0x01;
        let (mut master, _) = master_over(&frame, MasterConfig::default());

        let err = master.read(1, 0x2B, 1).unwrap_err();
        assert!(matches!(
            protocol_error(&err),
            ProtocolError::Checksum { .. }
        ));
    }

    #[test]
    fn write_awaits_status() {
        let (mut master, wire) = master_over(&PING_STATUS, MasterConfig::default());

        master.write(1, 0x1E, &[0x00, 0x02]).unwrap();
        assert_eq!(
            sent(&wire),
            [0xFF, 0xFF, 0x01, 0x05, 0x03, 0x1E, 0x00, 0x02, 0xCF]
        );
    }

    #[test]
    fn write_await_status_times_out_on_silence() {
        let (mut master, _) = master_over(&[], MasterConfig::default());

        let err = master.write(1, 0x1E, &[0x00, 0x02]).unwrap_err();
        assert!(matches!(protocol_error(&err), ProtocolError::Timeout));
    }

    #[test]
    fn write_fire_and_forget_does_not_read() {
        let config = MasterConfig {
            write_mode: WriteMode::FireAndForget,
            ..MasterConfig::default()
        };
        let (mut master, wire) = master_over(&[], config);

        master.write(1, 0x1E, &[0x00, 0x02]).unwrap();
        assert_eq!(
            sent(&wire),
            [0xFF, 0xFF, 0x01, 0x05, 0x03, 0x1E, 0x00, 0x02, 0xCF]
        );
    }

    #[test]
    fn write_broadcast_rejected() {
        let (mut master, wire) = master_over(&[], MasterConfig::default());

        let err = master.write(BROADCAST_ID, 0x1E, &[0x00]).unwrap_err();
        assert!(matches!(protocol_error(&err), ProtocolError::InvalidId(_)));
        assert!(sent(&wire).is_empty());
    }

    #[test]
    fn sync_write_broadcast_frame() {
        let (mut master, wire) = master_over(&[], MasterConfig::default());

        master
            .sync_write(0x1E, 2, &[(1, &[0x00, 0x02]), (2, &[0x00, 0x04])])
            .unwrap();

        assert_eq!(
            sent(&wire),
            [
                0xFF, 0xFF, 0xFE, 0x0A, 0x83, 0x1E, 0x02, 0x01, 0x00, 0x02, 0x02, 0x00, 0x04, 0x4B
            ]
        );
    }

    #[test]
    fn sync_write_width_mismatch_rejected() {
        let (mut master, wire) = master_over(&[], MasterConfig::default());

        let err = master
            .sync_write(0x1E, 2, &[(1, &[0x00, 0x02]), (2, &[0x04])])
            .unwrap_err();
        assert!(matches!(
            protocol_error(&err),
            ProtocolError::WidthMismatch { id: 2, want: 2, got: 1 }
        ));
        assert!(sent(&wire).is_empty());
    }

    #[test]
    fn sync_write_oversize_rejected() {
        let (mut master, wire) = master_over(&[], MasterConfig::default());

        static VALUE: [u8; 2] = [0x00, 0x02];
        let entries: Vec<(u8, &[u8])> = (0..90).map(|id| (id, VALUE.as_slice())).collect();
        let err = master.sync_write(0x1E, 2, &entries).unwrap_err();
        assert!(matches!(protocol_error(&err), ProtocolError::Oversize(_)));
        assert!(sent(&wire).is_empty());
    }

    #[test]
    fn retries_resend_the_request() {
        let config = MasterConfig {
            retry: RetryPolicy {
                retries: 2,
                backoff: Duration::ZERO,
            },
            ..MasterConfig::default()
        };
        let (mut master, wire) = master_over(&[], config);

        assert!(!master.ping(1).unwrap());
        // Three attempts, one ping frame each.
        assert_eq!(sent(&wire).len(), 3 * 6);
    }

    #[test]
    fn retry_succeeds_after_garbage() {
        // First attempt sees a corrupted status, second a valid one.
        let mut replies = PING_STATUS;
        replies[5] ^= 0xFF;
        let mut script = replies.to_vec();
        script.extend_from_slice(&PING_STATUS);

        let config = MasterConfig {
            retry: RetryPolicy {
                retries: 1,
                backoff: Duration::ZERO,
            },
            ..MasterConfig::default()
        };
        let (mut master, _) = master_over(&script, config);

        assert!(master.ping(1).unwrap());
    }
}
