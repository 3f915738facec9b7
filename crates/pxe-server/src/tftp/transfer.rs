//! One TFTP read transfer
//!
//! Each RRQ gets its own UDP socket (a fresh transfer id) and task. Option
//! negotiation follows RFC 2347: recognised options are echoed in an OACK
//! that the client acknowledges with block 0 before DATA starts.

use super::packet::{ErrorCode, Options, Packet};
use crate::error::PxeError;
use std::net::SocketAddr;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::net::UdpSocket;
use tokio::time::Instant;
use tracing::debug;

/// RFC 1350 block size
pub const DEFAULT_BLOCK_SIZE: usize = 512;

/// Smallest `blksize` accepted (RFC 2348)
const MIN_BLOCK_SIZE: usize = 8;

/// Receive buffer for ACK and ERROR packets
const CONTROL_PACKET_SIZE: usize = 1024;

/// Server-side transfer limits
#[derive(Debug, Clone, Copy)]
pub struct TransferLimits {
    pub timeout: Duration,
    pub retries: u32,
    pub max_block_size: u16,
}

/// Outcome of option negotiation
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Negotiated {
    pub block_size: usize,
    pub timeout: Duration,
    /// Byte position the transfer starts from
    pub offset: u64,
    /// Options acknowledged in the OACK; empty means no OACK
    pub acknowledged: Options,
}

/// A negotiation failure to report to the client
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Refusal {
    pub code: ErrorCode,
    pub message: String,
}

/// Negotiate request options against a payload of `size` bytes
///
/// Unknown and unparsable options are ignored. `blksize` is clamped to
/// the configured maximum, `tsize` is answered with the bytes that will
/// actually be sent and a negative `offset` refuses the transfer.
pub fn negotiate(options: &Options, size: u64, limits: &TransferLimits) -> Result<Negotiated, Refusal> {
    let mut negotiated = Negotiated {
        block_size: DEFAULT_BLOCK_SIZE,
        timeout: limits.timeout,
        offset: 0,
        acknowledged: Vec::new(),
    };

    // offset first: tsize depends on it
    if let Some((_, value)) = options.iter().find(|(name, _)| name == "offset") {
        match value.trim().parse::<i64>() {
            Ok(offset) if offset < 0 => {
                return Err(Refusal {
                    code: ErrorCode::OptionRefused,
                    message: "The offset must be a positive integer".to_string(),
                });
            }
            Ok(offset) => negotiated.offset = offset.unsigned_abs(),
            Err(_) => debug!("Ignoring unparsable offset {:?}", value),
        }
    }

    for (name, value) in options {
        match name.as_str() {
            "blksize" => {
                if let Ok(requested) = value.trim().parse::<usize>() {
                    let size = requested.clamp(MIN_BLOCK_SIZE, usize::from(limits.max_block_size));
                    negotiated.block_size = size;
                    negotiated.acknowledged.push((name.clone(), size.to_string()));
                }
            }
            "timeout" => {
                if let Ok(secs @ 1..=255) = value.trim().parse::<u64>() {
                    negotiated.timeout = Duration::from_secs(secs);
                    negotiated.acknowledged.push((name.clone(), secs.to_string()));
                }
            }
            "tsize" => {
                let remaining = size.saturating_sub(negotiated.offset);
                negotiated.acknowledged.push((name.clone(), remaining.to_string()));
            }
            "offset" => {
                negotiated.acknowledged.push((name.clone(), negotiated.offset.to_string()));
            }
            _ => debug!("Ignoring TFTP option {}={}", name, value),
        }
    }

    Ok(negotiated)
}

/// Fill `buf` from `reader`, short only at end of stream
async fn read_block<R: AsyncRead + Unpin + ?Sized>(reader: &mut R, buf: &mut [u8]) -> std::io::Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        let n = reader.read(&mut buf[filled..]).await?;
        if n == 0 {
            break;
        }
        filled += n;
    }
    Ok(filled)
}

/// Server end of a single transfer
#[derive(Debug)]
pub struct Transfer {
    socket: UdpSocket,
    peer: SocketAddr,
    timeout: Duration,
    retries: u32,
}

impl Transfer {
    pub fn new(socket: UdpSocket, peer: SocketAddr, retries: u32) -> Self {
        Self {
            socket,
            peer,
            timeout: Duration::from_secs(1),
            retries,
        }
    }

    /// Report a failure to the client; the transfer ends here
    pub async fn send_error(&self, code: ErrorCode, message: &str) {
        let packet = Packet::error(code, message).encode();
        if let Err(e) = self.socket.send_to(&packet, self.peer).await {
            debug!("Failed to send TFTP error to {}: {}", self.peer, e);
        }
    }

    /// Stream `reader` to the client
    ///
    /// # Returns
    ///
    /// Number of payload bytes acknowledged by the client
    pub async fn send<R: AsyncRead + Unpin + ?Sized>(
        &mut self,
        reader: &mut R,
        negotiated: &Negotiated,
    ) -> Result<u64, PxeError> {
        self.timeout = negotiated.timeout;

        if !negotiated.acknowledged.is_empty() {
            let oack = Packet::Oack(negotiated.acknowledged.clone()).encode();
            self.exchange(&oack, 0).await?;
        }

        let mut buf = vec![0u8; negotiated.block_size];
        let mut block: u16 = 1;
        let mut sent: u64 = 0;

        loop {
            let len = match read_block(reader, &mut buf).await {
                Ok(len) => len,
                Err(e) => {
                    self.send_error(ErrorCode::NotDefined, &e.to_string()).await;
                    return Err(PxeError::TransferAborted(format!("read failed: {}", e)));
                }
            };
            let data = Packet::Data {
                block,
                data: buf[..len].to_vec(),
            }
            .encode();
            self.exchange(&data, block).await?;
            sent += len as u64;

            if len < negotiated.block_size {
                return Ok(sent);
            }
            block = block.wrapping_add(1);
        }
    }

    /// Send `packet` until the client acknowledges `block`
    async fn exchange(&self, packet: &[u8], block: u16) -> Result<(), PxeError> {
        let mut buf = [0u8; CONTROL_PACKET_SIZE];

        for attempt in 0..=self.retries {
            if attempt > 0 {
                debug!("Retransmitting block {} to {} (attempt {})", block, self.peer, attempt);
            }
            self.socket.send_to(packet, self.peer).await?;

            let deadline = Instant::now() + self.timeout;
            loop {
                let (len, from) = match tokio::time::timeout_at(deadline, self.socket.recv_from(&mut buf)).await {
                    Ok(received) => received?,
                    Err(_) => break,
                };
                if from != self.peer {
                    let stray = Packet::error(ErrorCode::UnknownTransferId, "Unknown transfer ID").encode();
                    let _ = self.socket.send_to(&stray, from).await;
                    continue;
                }
                match Packet::decode(&buf[..len]) {
                    Ok(Packet::Ack(acked)) if acked == block => return Ok(()),
                    Ok(Packet::Error { code, message }) => {
                        return Err(PxeError::TransferAborted(format!(
                            "client sent error {:?}: {}",
                            code, message
                        )));
                    }
                    // Duplicate ACKs and anything else are ignored
                    _ => {}
                }
            }
        }

        Err(PxeError::TransferAborted(format!(
            "no ACK for block {} after {} retries",
            block, self.retries
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn limits() -> TransferLimits {
        TransferLimits {
            timeout: Duration::from_secs(3),
            retries: 5,
            max_block_size: 1468,
        }
    }

    fn opts(pairs: &[(&str, &str)]) -> Options {
        pairs.iter().map(|(n, v)| (n.to_string(), v.to_string())).collect()
    }

    #[test]
    fn test_no_options_means_plain_transfer() {
        let negotiated = negotiate(&Vec::new(), 1000, &limits()).unwrap();

        assert_eq!(negotiated.block_size, DEFAULT_BLOCK_SIZE);
        assert_eq!(negotiated.offset, 0);
        assert!(negotiated.acknowledged.is_empty());
    }

    #[test]
    fn test_blksize_is_clamped() {
        let negotiated = negotiate(&opts(&[("blksize", "65464")]), 1000, &limits()).unwrap();
        assert_eq!(negotiated.block_size, 1468);
        assert_eq!(negotiated.acknowledged, opts(&[("blksize", "1468")]));

        let negotiated = negotiate(&opts(&[("blksize", "2")]), 1000, &limits()).unwrap();
        assert_eq!(negotiated.block_size, 8);
    }

    #[test]
    fn test_tsize_accounts_for_offset() {
        let negotiated = negotiate(&opts(&[("tsize", "0"), ("offset", "400")]), 1000, &limits()).unwrap();

        assert_eq!(negotiated.offset, 400);
        assert_eq!(negotiated.acknowledged, opts(&[("tsize", "600"), ("offset", "400")]));
    }

    #[test]
    fn test_offset_past_end_declares_zero() {
        let negotiated = negotiate(&opts(&[("offset", "5000"), ("tsize", "0")]), 1000, &limits()).unwrap();
        assert_eq!(negotiated.acknowledged[1], ("tsize".to_string(), "0".to_string()));
    }

    #[test]
    fn test_negative_offset_is_refused() {
        let refusal = negotiate(&opts(&[("offset", "-1")]), 1000, &limits()).unwrap_err();

        assert_eq!(refusal.code, ErrorCode::OptionRefused);
        assert_eq!(refusal.message, "The offset must be a positive integer");
    }

    #[test]
    fn test_timeout_option_bounds() {
        let negotiated = negotiate(&opts(&[("timeout", "7")]), 0, &limits()).unwrap();
        assert_eq!(negotiated.timeout, Duration::from_secs(7));

        let negotiated = negotiate(&opts(&[("timeout", "0")]), 0, &limits()).unwrap();
        assert_eq!(negotiated.timeout, Duration::from_secs(3));
        assert!(negotiated.acknowledged.is_empty());
    }
}
