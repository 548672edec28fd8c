//! # Modbus TCP Client
//!
//! A minimal Modbus TCP master holding one `TcpStream` to one device. Each
//! request carries a fresh transaction id. Replies to earlier requests that
//! timed out may still arrive later; those are read off the stream and
//! discarded until the matching reply shows up or the read timeout expires.

use std::io;
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tracing::{debug, info};

use super::DeviceClient;
use super::error::DeviceError;
use super::mbap::{self, MbapHeader, MAX_READ_REGISTERS, MBAP_HEADER_LEN};

/// Modbus TCP implementation of `DeviceClient`.
pub struct ModbusTcpClient {
    stream: Option<TcpStream>,
    connect_timeout: Duration,
    read_timeout: Duration,
    next_transaction: u16,
}

impl ModbusTcpClient {
    /// Creates a disconnected client. Both timeouts bound every network
    /// operation; the device transport imposes no other limit.
    pub fn new(connect_timeout: Duration, read_timeout: Duration) -> Self {
        Self {
            stream: None,
            connect_timeout,
            read_timeout,
            next_transaction: 0,
        }
    }

    fn next_transaction_id(&mut self) -> u16 {
        self.next_transaction = self.next_transaction.wrapping_add(1);
        self.next_transaction
    }
}

impl DeviceClient for ModbusTcpClient {
    async fn connect(&mut self, host: &str, port: u16) -> Result<(), DeviceError> {
        self.stream = None;
        let endpoint = format!("{host}:{port}");

        let stream = match timeout(self.connect_timeout, TcpStream::connect(&endpoint)).await {
            Ok(Ok(stream)) => stream,
            Ok(Err(source)) => return Err(DeviceError::Connection { endpoint, source }),
            Err(_) => {
                return Err(DeviceError::Connection {
                    endpoint,
                    source: io::Error::new(
                        io::ErrorKind::TimedOut,
                        format!("no answer within {:?}", self.connect_timeout),
                    ),
                });
            }
        };

        if let Err(e) = stream.set_nodelay(true) {
            debug!(error = %e, "could not set TCP_NODELAY on device socket");
        }
        info!(%endpoint, "connected to Modbus device");
        self.stream = Some(stream);
        Ok(())
    }

    async fn read_block(&mut self, start: u16, count: u16, unit_id: u8) -> Result<Vec<u16>, DeviceError> {
        if count == 0 || count > MAX_READ_REGISTERS {
            return Err(DeviceError::Malformed(format!(
                "register count {count} outside 1..={MAX_READ_REGISTERS}"
            )));
        }

        let transaction_id = self.next_transaction_id();
        let read_timeout = self.read_timeout;
        let stream = self.stream.as_mut().ok_or(DeviceError::NotConnected)?;
        let request = mbap::encode_read_input_registers(transaction_id, unit_id, start, count);

        let mut mid_frame = false;
        let outcome = timeout(
            read_timeout,
            exchange(stream, &request, transaction_id, count, &mut mid_frame),
        )
        .await;
        let result = match outcome {
            Ok(result) => result,
            Err(_) => {
                // Part of a reply is already off the wire; the stream can no
                // longer be framed.
                if mid_frame {
                    debug!("read timed out inside a reply frame, dropping device connection");
                    self.stream = None;
                }
                Err(DeviceError::Timeout(read_timeout))
            }
        };

        if let Err(e) = &result {
            if e.requires_reconnect() {
                self.stream = None;
            }
        }
        result
    }

    fn is_connected(&self) -> bool {
        self.stream.is_some()
    }

    fn disconnect(&mut self) {
        self.stream = None;
    }
}

async fn exchange(
    stream: &mut TcpStream,
    request: &[u8],
    transaction_id: u16,
    count: u16,
    mid_frame: &mut bool,
) -> Result<Vec<u16>, DeviceError> {
    stream.write_all(request).await.map_err(DeviceError::ConnectionLost)?;

    loop {
        let mut raw = [0u8; MBAP_HEADER_LEN];
        read_exact(stream, &mut raw, mid_frame).await?;
        let header = MbapHeader::decode(&raw);

        let mut pdu = vec![0u8; header.pdu_len()?];
        read_exact(stream, &mut pdu, mid_frame).await?;
        *mid_frame = false;

        if header.transaction_id != transaction_id {
            debug!(
                expected = transaction_id,
                received = header.transaction_id,
                "discarding stale Modbus response"
            );
            continue;
        }
        if header.protocol_id != 0 {
            return Err(DeviceError::Malformed(format!(
                "unexpected protocol id {}",
                header.protocol_id
            )));
        }
        return mbap::decode_read_input_registers(&pdu, count);
    }
}

/// Fills `buf`, flagging `mid_frame` as soon as any byte has been consumed.
async fn read_exact(stream: &mut TcpStream, buf: &mut [u8], mid_frame: &mut bool) -> Result<(), DeviceError> {
    let mut filled = 0;
    while filled < buf.len() {
        match stream.read(&mut buf[filled..]).await {
            Ok(0) => {
                return Err(DeviceError::lost(
                    io::ErrorKind::UnexpectedEof,
                    "device closed the connection",
                ));
            }
            Ok(n) => {
                filled += n;
                *mid_frame = true;
            }
            Err(e) => return Err(DeviceError::ConnectionLost(e)),
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connections::error::ExceptionCode;
    use tokio::net::TcpListener;

    /// Accepts one connection and answers every request with `respond`.
    async fn fake_device<F>(respond: F) -> (String, u16)
    where
        F: Fn(u16, u16) -> Option<Vec<u8>> + Send + 'static,
    {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut req = [0u8; 12];
            while socket.read_exact(&mut req).await.is_ok() {
                let tid = u16::from_be_bytes([req[0], req[1]]);
                let count = u16::from_be_bytes([req[10], req[11]]);
                match respond(tid, count) {
                    Some(reply) => socket.write_all(&reply).await.unwrap(),
                    None => return,
                }
            }
        });
        (addr.ip().to_string(), addr.port())
    }

    fn reply(tid: u16, pdu: &[u8]) -> Vec<u8> {
        let mut out = Vec::new();
        out.extend_from_slice(&tid.to_be_bytes());
        out.extend_from_slice(&[0, 0]);
        out.extend_from_slice(&((pdu.len() + 1) as u16).to_be_bytes());
        out.push(0xFF);
        out.extend_from_slice(pdu);
        out
    }

    fn registers_pdu(values: &[u16]) -> Vec<u8> {
        let mut pdu = vec![0x04, (values.len() * 2) as u8];
        for v in values {
            pdu.extend_from_slice(&v.to_be_bytes());
        }
        pdu
    }

    fn client() -> ModbusTcpClient {
        ModbusTcpClient::new(Duration::from_millis(500), Duration::from_millis(300))
    }

    #[tokio::test]
    async fn test_reads_register_block() {
        let (host, port) = fake_device(|tid, count| {
            let values: Vec<u16> = (0..count).map(|i| i * 10).collect();
            Some(reply(tid, &registers_pdu(&values)))
        })
        .await;

        let mut client = client();
        client.connect(&host, port).await.unwrap();
        assert_eq!(client.read_block(0, 4, 0xFF).await.unwrap(), vec![0, 10, 20, 30]);
        assert_eq!(client.read_block(0, 2, 0xFF).await.unwrap(), vec![0, 10]);
        assert!(client.is_connected());
    }

    #[tokio::test]
    async fn test_skips_stale_transaction_ids() {
        let (host, port) = fake_device(|tid, count| {
            let mut out = reply(tid.wrapping_sub(1), &registers_pdu(&vec![9; count as usize]));
            out.extend(reply(tid, &registers_pdu(&vec![1; count as usize])));
            Some(out)
        })
        .await;

        let mut client = client();
        client.connect(&host, port).await.unwrap();
        assert_eq!(client.read_block(0, 3, 1).await.unwrap(), vec![1, 1, 1]);
    }

    #[tokio::test]
    async fn test_exception_keeps_connection() {
        let (host, port) = fake_device(|tid, _| Some(reply(tid, &[0x84, 0x02]))).await;

        let mut client = client();
        client.connect(&host, port).await.unwrap();
        let err = client.read_block(100, 1, 1).await.unwrap_err();
        assert!(matches!(err, DeviceError::Exception(ExceptionCode(0x02))));
        assert!(client.is_connected());
    }

    #[tokio::test]
    async fn test_peer_close_is_connection_lost() {
        let (host, port) = fake_device(|_, _| None).await;

        let mut client = client();
        client.connect(&host, port).await.unwrap();
        let err = client.read_block(0, 1, 1).await.unwrap_err();
        assert!(err.requires_reconnect(), "got {err}");
        assert!(!client.is_connected());
    }

    #[tokio::test]
    async fn test_silent_device_times_out() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (_socket, _) = listener.accept().await.unwrap();
            tokio::time::sleep(Duration::from_secs(5)).await;
        });

        let mut client = client();
        client.connect(&addr.ip().to_string(), addr.port()).await.unwrap();
        let err = client.read_block(0, 1, 1).await.unwrap_err();
        assert!(matches!(err, DeviceError::Timeout(_)));
        assert!(client.is_connected());
    }

    #[tokio::test]
    async fn test_timeout_inside_reply_drops_connection() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut req = [0u8; 12];
            socket.read_exact(&mut req).await.unwrap();
            let tid = u16::from_be_bytes([req[0], req[1]]);
            let full = reply(tid, &registers_pdu(&[1, 2, 3]));
            // Header and the first PDU bytes only, then stall.
            socket.write_all(&full[..MBAP_HEADER_LEN + 2]).await.unwrap();
            tokio::time::sleep(Duration::from_secs(5)).await;
        });

        let mut client = client();
        client.connect(&addr.ip().to_string(), addr.port()).await.unwrap();
        let err = client.read_block(0, 3, 1).await.unwrap_err();
        assert!(matches!(err, DeviceError::Timeout(_)));
        assert!(!client.is_connected());
        assert!(matches!(client.read_block(0, 3, 1).await, Err(DeviceError::NotConnected)));
    }

    #[tokio::test]
    async fn test_refused_connect() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let mut client = client();
        let err = client.connect("127.0.0.1", port).await.unwrap_err();
        assert!(matches!(err, DeviceError::Connection { .. }));
        assert!(matches!(client.read_block(0, 1, 1).await, Err(DeviceError::NotConnected)));
    }
}
