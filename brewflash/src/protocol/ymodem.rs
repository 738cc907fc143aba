//! Minimal YMODEM-1K sender.
//!
//! Only the subset needed to push one firmware image to the controller's
//! bootloader is implemented: 1024-byte `STX` packets, a header packet at
//! sequence 0, `EOT`, and an empty closing header.
//!
//! ```text
//! +-----+-----+------+---------------+-----------+
//! | STX | SEQ | ~SEQ |   DATA (1024) | INTEGRITY |
//! +-----+-----+------+---------------+-----------+
//! | 1   | 1   | 1    |     1024      | 2         |
//! +-----+-----+------+---------------+-----------+
//! ```
//!
//! The bootloader does not check the integrity field, so it is sent as a
//! zero placeholder. A NAK is not retransmitted; it ends the transfer as
//! [`TransferOutcome::Rejected`].

use {
    crate::error::{Error, Result},
    byteorder::{BigEndian, WriteBytesExt},
    log::{debug, trace},
    std::{
        io::{ErrorKind, Read, Write},
        time::{Duration, Instant},
    },
};

/// YMODEM control characters.
pub mod control {
    /// Start of a 1024-byte packet.
    pub const STX: u8 = 0x02;
    /// End of transmission.
    pub const EOT: u8 = 0x04;
    /// Acknowledge.
    pub const ACK: u8 = 0x06;
    /// Not acknowledge.
    pub const NAK: u8 = 0x15;
    /// Cancel (always sent twice).
    pub const CAN: u8 = 0x18;
    /// CRC mode request character.
    pub const C: u8 = b'C';
    /// Abort, upper case variant.
    pub const ABORT1: u8 = b'A';
    /// Abort, lower case variant.
    pub const ABORT2: u8 = b'a';
}

/// Payload bytes per packet.
pub const BLOCK_SIZE: usize = 1024;

/// Total bytes per packet on the wire.
pub const PACKET_LEN: usize = 3 + BLOCK_SIZE + 2;

/// Byte used to pad short blocks.
pub const PAD: u8 = b' ';

const INTEGRITY_PLACEHOLDER: u16 = 0;

/// How a transfer ended without an I/O failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferOutcome {
    /// Every packet was acknowledged.
    Completed,
    /// The receiver cancelled or aborted.
    Aborted,
    /// The receiver answered with something other than ACK.
    Rejected(u8),
}

impl TransferOutcome {
    fn from_reply(byte: u8) -> Self {
        match byte {
            control::CAN | control::ABORT1 | control::ABORT2 => Self::Aborted,
            other => Self::Rejected(other),
        }
    }
}

/// YMODEM configuration options.
#[derive(Debug, Clone)]
pub struct YmodemConfig {
    /// Longest wait for a single reply byte.
    pub reply_timeout: Duration,
}

impl Default for YmodemConfig {
    fn default() -> Self {
        Self {
            reply_timeout: Duration::from_secs(10),
        }
    }
}

/// Build one packet: marker, sequence pair, padded block, integrity field.
///
/// A block longer than [`BLOCK_SIZE`] would produce a packet of the wrong
/// length and is rejected with [`Error::Protocol`].
pub fn encode_packet(seq: u8, block: &[u8]) -> Result<Vec<u8>> {
    if block.len() > BLOCK_SIZE {
        return Err(Error::Protocol(format!(
            "packet {seq} payload is {} bytes, limit is {BLOCK_SIZE}",
            block.len()
        )));
    }

    let mut packet = Vec::with_capacity(PACKET_LEN);
    packet.push(control::STX);
    packet.push(seq);
    packet.push(!seq);
    packet.extend_from_slice(block);
    packet.resize(3 + BLOCK_SIZE, PAD);
    packet.write_u16::<BigEndian>(INTEGRITY_PLACEHOLDER)?;

    validate_packet(&packet)?;
    Ok(packet)
}

/// Check the framing invariants of an encoded packet.
pub fn validate_packet(packet: &[u8]) -> Result<()> {
    if packet.len() != PACKET_LEN {
        return Err(Error::Protocol(format!(
            "packet length is {}, expected {PACKET_LEN}",
            packet.len()
        )));
    }
    if packet[0] != control::STX {
        return Err(Error::Protocol(format!(
            "packet marker is 0x{:02X}",
            packet[0]
        )));
    }
    if packet[1].wrapping_add(packet[2]) != 0xFF {
        return Err(Error::Protocol(format!(
            "sequence pair 0x{:02X}/0x{:02X} does not complement",
            packet[1], packet[2]
        )));
    }
    Ok(())
}

/// Payload of a header packet: name, NUL, decimal size, space.
pub fn header_block(name: &str, size: usize) -> Vec<u8> {
    let mut block = Vec::with_capacity(name.len() + 24);
    block.extend_from_slice(name.as_bytes());
    block.push(0x00);
    block.extend_from_slice(
        size.to_string()
            .as_bytes(),
    );
    block.push(b' ');
    block
}

/// YMODEM transfer handler borrowing an open port for one transfer.
pub struct YmodemTransfer<'a, P: Read + Write + ?Sized> {
    port: &'a mut P,
    config: YmodemConfig,
}

impl<'a, P: Read + Write + ?Sized> YmodemTransfer<'a, P> {
    /// Create a new YMODEM transfer handler.
    pub fn new(port: &'a mut P) -> Self {
        Self {
            port,
            config: YmodemConfig::default(),
        }
    }

    /// Create a new YMODEM transfer handler with custom configuration.
    pub fn with_config(port: &'a mut P, config: YmodemConfig) -> Self {
        Self { port, config }
    }

    /// One read attempt; `None` when the port timed out.
    fn try_read_byte(&mut self) -> Result<Option<u8>> {
        let mut buf = [0u8; 1];
        match self
            .port
            .read(&mut buf)
        {
            Ok(1) => Ok(Some(buf[0])),
            Ok(_) => Ok(None),
            Err(e) if matches!(e.kind(), ErrorKind::TimedOut | ErrorKind::WouldBlock) => Ok(None),
            Err(e) if e.kind() == ErrorKind::Interrupted => Ok(None),
            Err(e) => Err(Error::Io(e)),
        }
    }

    /// Wait for one byte, bounded by the reply timeout.
    fn read_byte(&mut self) -> Result<u8> {
        let deadline = Instant::now() + self.config.reply_timeout;
        loop {
            if let Some(byte) = self.try_read_byte()? {
                return Ok(byte);
            }
            if Instant::now() >= deadline {
                return Err(Error::Timeout(format!(
                    "no reply within {:?}",
                    self.config.reply_timeout
                )));
            }
        }
    }

    /// Read and decode a reply.
    ///
    /// CAN always comes in pairs, so its partner is consumed. An ACK to a
    /// header packet may be followed by a mode byte, which is dropped.
    fn read_reply(&mut self, awaiting_header: bool) -> Result<u8> {
        let reply = self.read_byte()?;
        trace!("Reply 0x{reply:02X}");
        if reply == control::CAN || (reply == control::ACK && awaiting_header) {
            if let Some(extra) = self.try_read_byte()? {
                trace!("Discarded 0x{extra:02X} after 0x{reply:02X}");
            }
        }
        Ok(reply)
    }

    fn send_packet(&mut self, seq: u8, block: &[u8], header: bool) -> Result<u8> {
        let packet = encode_packet(seq, block)?;
        trace!("Sending packet {seq}");
        self.port
            .write_all(&packet)?;
        self.port
            .flush()?;
        self.read_reply(header)
    }

    /// Transfer file data.
    ///
    /// # Arguments
    ///
    /// * `filename` - Name announced in the header packet
    /// * `data` - File data to transfer
    /// * `progress` - Called with (bytes sent, total) after each acknowledged block
    pub fn transfer<F>(&mut self, filename: &str, data: &[u8], mut progress: F) -> Result<TransferOutcome>
    where
        F: FnMut(usize, usize),
    {
        let total = data.len();
        debug!("Starting YMODEM transfer: {filename} ({total} bytes)");

        let reply = self.send_packet(0, &header_block(filename, total), true)?;
        if reply != control::ACK {
            debug!("Header refused with 0x{reply:02X}");
            return Ok(TransferOutcome::from_reply(reply));
        }

        let mut seq: u8 = 1;
        let mut sent = 0;
        for chunk in data.chunks(BLOCK_SIZE) {
            let reply = self.send_packet(seq, chunk, false)?;
            if reply != control::ACK {
                debug!("Packet {seq} refused with 0x{reply:02X}");
                return Ok(TransferOutcome::from_reply(reply));
            }
            sent += chunk.len();
            progress(sent, total);
            seq = seq.wrapping_add(1);
        }

        debug!("Sending EOT");
        self.port
            .write_all(&[control::EOT])?;
        self.port
            .flush()?;
        let reply = self.read_reply(false)?;
        if reply != control::ACK {
            debug!("EOT refused with 0x{reply:02X}");
            return Ok(TransferOutcome::from_reply(reply));
        }

        // The bootloader may already be rebooting into the new image, so the
        // reply to the closing header is informational only.
        match self.send_packet(0, &header_block("", 0), true) {
            Ok(reply) => trace!("Closing header answered with 0x{reply:02X}"),
            Err(Error::Timeout(_)) => trace!("No reply to closing header"),
            Err(e) => return Err(e),
        }

        debug!("YMODEM transfer complete");
        Ok(TransferOutcome::Completed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;

    /// Mock serial port with separate read/write buffers.
    struct MockSerial {
        read_buf: VecDeque<u8>,
        write_buf: Vec<u8>,
    }

    impl MockSerial {
        fn new(response: &[u8]) -> Self {
            Self {
                read_buf: response
                    .iter()
                    .copied()
                    .collect(),
                write_buf: Vec::new(),
            }
        }

        /// Split everything written into packets and single control bytes.
        fn frames(&self) -> Vec<Vec<u8>> {
            let mut frames = Vec::new();
            let mut rest = self
                .write_buf
                .as_slice();
            while let Some(&first) = rest.first() {
                let len = if first == control::STX { PACKET_LEN } else { 1 };
                frames.push(rest[..len].to_vec());
                rest = &rest[len..];
            }
            frames
        }
    }

    impl Read for MockSerial {
        fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
            match self
                .read_buf
                .pop_front()
            {
                Some(byte) if !buf.is_empty() => {
                    buf[0] = byte;
                    Ok(1)
                },
                _ => Err(std::io::Error::new(ErrorKind::TimedOut, "no data")),
            }
        }
    }

    impl Write for MockSerial {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            self.write_buf
                .extend_from_slice(buf);
            Ok(buf.len())
        }
        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    fn config() -> YmodemConfig {
        YmodemConfig {
            reply_timeout: Duration::from_millis(20),
        }
    }

    fn run(response: &[u8], data: &[u8]) -> (Result<TransferOutcome>, MockSerial) {
        let mut port = MockSerial::new(response);
        let result = YmodemTransfer::with_config(&mut port, config()).transfer("binary", data, |_, _| {});
        (result, port)
    }

    fn acks(n: usize) -> Vec<u8> {
        vec![control::ACK; n]
    }

    /// Receiver that accepts the header (with a mode byte), `blocks` data
    /// packets and EOT, leaving the closing header unanswered.
    fn script(blocks: usize) -> Vec<u8> {
        let mut response = vec![control::ACK, control::C];
        response.extend(acks(blocks + 1));
        response
    }

    #[test]
    fn test_encode_packet_layout() {
        let packet = encode_packet(5, &[0xAA; 3]).unwrap();
        assert_eq!(packet.len(), PACKET_LEN);
        assert_eq!(packet[0], control::STX);
        assert_eq!(packet[1], 5);
        assert_eq!(packet[2], 0xFA);
        assert_eq!(&packet[3..6], &[0xAA; 3]);
        assert!(packet[6..3 + BLOCK_SIZE].iter().all(|&b| b == PAD));
        assert_eq!(&packet[PACKET_LEN - 2..], &[0, 0]);
    }

    #[test]
    fn test_encode_packet_rejects_oversized_block() {
        let result = encode_packet(1, &[0u8; BLOCK_SIZE + 1]);
        assert!(matches!(result, Err(Error::Protocol(_))));
    }

    #[test]
    fn test_validate_packet_rejects_bad_framing() {
        assert!(validate_packet(&[control::STX, 1, 0xFE]).is_err());
        let mut packet = encode_packet(1, &[]).unwrap();
        packet[2] = 0;
        assert!(matches!(validate_packet(&packet), Err(Error::Protocol(_))));
    }

    #[test]
    fn test_header_block() {
        assert_eq!(header_block("binary", 2048), b"binary\x002048 ".to_vec());
        assert_eq!(header_block("", 0), b"\x000 ".to_vec());
    }

    #[test]
    fn test_packet_count_and_sequence_order() {
        for size in [1, BLOCK_SIZE - 1, BLOCK_SIZE, BLOCK_SIZE + 1, 3 * BLOCK_SIZE + 7] {
            let data = vec![0x42; size];
            let blocks = size.div_ceil(BLOCK_SIZE);
            let mut response = script(blocks);
            response.push(control::ACK);

            let (result, port) = run(&response, &data);
            assert_eq!(result.unwrap(), TransferOutcome::Completed, "size {size}");

            let frames = port.frames();
            let packets: Vec<_> = frames
                .iter()
                .filter(|f| f.len() == PACKET_LEN)
                .collect();
            assert_eq!(packets.len(), blocks + 2, "size {size}");

            let seqs: Vec<u8> = packets
                .iter()
                .map(|p| p[1])
                .collect();
            let mut expected = vec![0u8];
            expected.extend((1..=blocks).map(|s| s as u8));
            expected.push(0);
            assert_eq!(seqs, expected);

            for p in packets {
                assert_eq!(p[1].wrapping_add(p[2]), 0xFF);
            }
            assert_eq!(frames[frames.len() - 2], vec![control::EOT]);
        }
    }

    #[test]
    fn test_sequence_wraps_after_255() {
        let blocks = 300;
        let data = vec![0u8; blocks * BLOCK_SIZE];
        let (result, port) = run(&script(blocks), &data);
        assert_eq!(result.unwrap(), TransferOutcome::Completed);

        let frames = port.frames();
        assert_eq!(frames[255][1], 255);
        assert_eq!(frames[256][1], 0);
        assert_eq!(frames[257][1], 1);
    }

    #[test]
    fn test_zero_length_file() {
        let (result, port) = run(&script(0), &[]);
        assert_eq!(result.unwrap(), TransferOutcome::Completed);

        let frames = port.frames();
        assert_eq!(frames.len(), 3);
        assert_eq!(&frames[0][3..12], b"binary\x000 ");
        assert_eq!(frames[1], vec![control::EOT]);
        assert_eq!(frames[2][1], 0);
    }

    #[test]
    fn test_final_block_is_blank_padded() {
        let data = vec![0x11; BLOCK_SIZE + 10];
        let (result, port) = run(&script(2), &data);
        assert_eq!(result.unwrap(), TransferOutcome::Completed);

        let last_data = &port.frames()[2];
        assert_eq!(&last_data[3..13], &[0x11; 10]);
        assert!(last_data[13..3 + BLOCK_SIZE].iter().all(|&b| b == b' '));
    }

    #[test]
    fn test_progress_reports_acked_bytes() {
        let data = vec![0xDD; 2 * BLOCK_SIZE + 1];
        let mut port = MockSerial::new(&script(3));
        let mut calls = Vec::new();
        let outcome = YmodemTransfer::with_config(&mut port, config())
            .transfer("binary", &data, |sent, total| calls.push((sent, total)))
            .unwrap();

        assert_eq!(outcome, TransferOutcome::Completed);
        let total = data.len();
        assert_eq!(
            calls,
            vec![(BLOCK_SIZE, total), (2 * BLOCK_SIZE, total), (total, total)]
        );
    }

    #[test]
    fn test_cancel_is_consumed_in_pairs() {
        let response = [control::ACK, control::C, control::CAN, control::CAN, 0x99];
        let mut port = MockSerial::new(&response);
        let outcome = YmodemTransfer::with_config(&mut port, config())
            .transfer("binary", &[1, 2, 3], |_, _| {})
            .unwrap();

        assert_eq!(outcome, TransferOutcome::Aborted);
        assert_eq!(port.read_buf, VecDeque::from(vec![0x99]));
    }

    #[test]
    fn test_abort_bytes() {
        for byte in [control::ABORT1, control::ABORT2] {
            let (result, _) = run(&[control::ACK, control::C, byte], &[1, 2, 3]);
            assert_eq!(result.unwrap(), TransferOutcome::Aborted);
        }
    }

    #[test]
    fn test_nak_is_not_retransmitted() {
        let data = vec![0x33; 2 * BLOCK_SIZE];
        let (result, port) = run(&[control::ACK, control::C, control::NAK, control::ACK], &data);
        assert_eq!(result.unwrap(), TransferOutcome::Rejected(control::NAK));
        // header and first data packet only
        assert_eq!(port.frames().len(), 2);
    }

    #[test]
    fn test_header_refused() {
        let (result, port) = run(&[control::NAK], &[0; 10]);
        assert_eq!(result.unwrap(), TransferOutcome::Rejected(control::NAK));
        assert_eq!(port.frames().len(), 1);
    }

    #[test]
    fn test_silent_receiver_times_out() {
        let (result, _) = run(&[], &[0; 10]);
        assert!(matches!(result, Err(Error::Timeout(_))));
    }

    #[test]
    fn test_missing_closing_reply_still_completes() {
        let (result, _) = run(&script(1), &[0; 10]);
        assert_eq!(result.unwrap(), TransferOutcome::Completed);
    }

    #[test]
    fn test_oversized_header_is_protocol_error() {
        let name = "n".repeat(BLOCK_SIZE);
        let mut port = MockSerial::new(&acks(4));
        let result = YmodemTransfer::with_config(&mut port, config()).transfer(&name, &[0; 10], |_, _| {});
        assert!(matches!(result, Err(Error::Protocol(_))));
        assert!(port.write_buf.is_empty());
    }
}
