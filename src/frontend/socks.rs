//! SOCKS5 CONNECT terminator.
//!
//! Implements the RFC 1928 subset the tunnel needs: version 5, method
//! `NO AUTHENTICATION REQUIRED`, command CONNECT. All reads are sized from
//! declared lengths, never from segment boundaries, so a client may drip
//! the request one byte at a time.

use std::net::{Ipv4Addr, Ipv6Addr};

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::error::{Error, Result};

const SOCKS_VERSION: u8 = 0x05;
const METHOD_NO_AUTH: u8 = 0x00;
const CMD_CONNECT: u8 = 0x01;
const ATYP_IPV4: u8 = 0x01;
const ATYP_DOMAIN: u8 = 0x03;
const ATYP_IPV6: u8 = 0x04;

/// Fixed CONNECT success reply: VER, REP=success, RSV, ATYP=IPv4,
/// BND.ADDR=127.0.0.1, BND.PORT=1080. The bound address is cosmetic;
/// clients connect through the socket they already hold.
pub const SUCCESS_REPLY: [u8; 10] = [0x05, 0x00, 0x00, 0x01, 0x7F, 0x00, 0x00, 0x01, 0x04, 0x38];

/// Read the client greeting (`VER NMETHODS METHODS...`) and discard the
/// offered methods. Rejects anything that is not SOCKS5.
pub async fn read_greeting<R: AsyncRead + Unpin>(reader: &mut R) -> Result<()> {
    let mut head = [0u8; 2];
    reader.read_exact(&mut head).await?;
    if head[0] != SOCKS_VERSION {
        return Err(Error::protocol(format!(
            "unsupported SOCKS version 0x{:02x}",
            head[0]
        )));
    }
    let mut methods = vec![0u8; head[1] as usize];
    reader.read_exact(&mut methods).await?;
    Ok(())
}

/// Read the CONNECT request and synthesize the textual target:
/// `ip:port` for IPv4, `host:port` for domains, `[ip6]:port` for IPv6.
/// This exact form travels to the agent as the init-frame payload.
pub async fn read_connect_target<R: AsyncRead + Unpin>(reader: &mut R) -> Result<String> {
    let mut head = [0u8; 4];
    reader.read_exact(&mut head).await?;
    if head[0] != SOCKS_VERSION {
        return Err(Error::protocol(format!(
            "unsupported SOCKS version 0x{:02x}",
            head[0]
        )));
    }
    if head[1] != CMD_CONNECT {
        return Err(Error::protocol(format!(
            "unsupported SOCKS command 0x{:02x}",
            head[1]
        )));
    }

    match head[3] {
        ATYP_IPV4 => {
            let mut addr = [0u8; 6];
            reader.read_exact(&mut addr).await?;
            let ip = Ipv4Addr::new(addr[0], addr[1], addr[2], addr[3]);
            let port = u16::from_be_bytes([addr[4], addr[5]]);
            Ok(format!("{ip}:{port}"))
        }
        ATYP_DOMAIN => {
            let mut len = [0u8; 1];
            reader.read_exact(&mut len).await?;
            let mut rest = vec![0u8; len[0] as usize + 2];
            reader.read_exact(&mut rest).await?;
            let (host, port_bytes) = rest.split_at(len[0] as usize);
            let host = String::from_utf8_lossy(host);
            let port = u16::from_be_bytes([port_bytes[0], port_bytes[1]]);
            Ok(format!("{host}:{port}"))
        }
        ATYP_IPV6 => {
            let mut addr = [0u8; 18];
            reader.read_exact(&mut addr).await?;
            let octets: [u8; 16] = addr[..16].try_into().expect("fixed slice");
            let ip = Ipv6Addr::from(octets);
            let port = u16::from_be_bytes([addr[16], addr[17]]);
            Ok(format!("[{ip}]:{port}"))
        }
        other => Err(Error::protocol(format!(
            "unsupported address type 0x{other:02x}"
        ))),
    }
}

/// Run the whole terminator exchange: greeting, method selection, CONNECT
/// request, fixed success reply. Returns the synthesized target string.
///
/// The success reply goes out before the agent has dialed anything, so a
/// dial failure later surfaces to the client as EOF, not a SOCKS error.
pub async fn terminate<S: AsyncRead + AsyncWrite + Unpin>(stream: &mut S) -> Result<String> {
    read_greeting(stream).await?;
    stream.write_all(&[SOCKS_VERSION, METHOD_NO_AUTH]).await?;
    let target = read_connect_target(stream).await?;
    stream.write_all(&SUCCESS_REPLY).await?;
    Ok(target)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncWriteExt;

    #[tokio::test]
    async fn test_greeting() {
        let mut input: &[u8] = &[0x05, 0x02, 0x00, 0x01];
        read_greeting(&mut input).await.unwrap();
        assert!(input.is_empty());

        let mut bad: &[u8] = &[0x04, 0x01, 0x00];
        assert!(matches!(
            read_greeting(&mut bad).await,
            Err(Error::Protocol(_))
        ));
    }

    #[tokio::test]
    async fn test_connect_ipv4() {
        let mut input: &[u8] = &[0x05, 0x01, 0x00, 0x01, 93, 184, 216, 34, 0x01, 0xBB];
        let target = read_connect_target(&mut input).await.unwrap();
        assert_eq!(target, "93.184.216.34:443");
    }

    #[tokio::test]
    async fn test_connect_domain() {
        let mut req = vec![0x05, 0x01, 0x00, 0x03, 11];
        req.extend_from_slice(b"example.com");
        req.extend_from_slice(&80u16.to_be_bytes());
        let mut input: &[u8] = &req;
        let target = read_connect_target(&mut input).await.unwrap();
        assert_eq!(target, "example.com:80");
    }

    #[tokio::test]
    async fn test_connect_ipv6_is_bracketed() {
        let mut req = vec![0x05, 0x01, 0x00, 0x04];
        req.extend_from_slice(&Ipv6Addr::LOCALHOST.octets());
        req.extend_from_slice(&8080u16.to_be_bytes());
        let mut input: &[u8] = &req;
        let target = read_connect_target(&mut input).await.unwrap();
        assert_eq!(target, "[::1]:8080");
    }

    #[tokio::test]
    async fn test_rejects_bad_command_and_atyp() {
        // BIND is not supported.
        let mut bind: &[u8] = &[0x05, 0x02, 0x00, 0x01, 127, 0, 0, 1, 0x00, 0x50];
        assert!(matches!(
            read_connect_target(&mut bind).await,
            Err(Error::Protocol(_))
        ));

        // ATYP 0x05 does not exist.
        let mut atyp: &[u8] = &[0x05, 0x01, 0x00, 0x05, 1, 2, 3, 4, 0x00, 0x50];
        assert!(matches!(
            read_connect_target(&mut atyp).await,
            Err(Error::Protocol(_))
        ));
    }

    #[tokio::test]
    async fn test_terminate_full_exchange() {
        let (mut client, mut server) = tokio::io::duplex(256);

        let handler = tokio::spawn(async move { terminate(&mut server).await });

        client.write_all(&[0x05, 0x01, 0x00]).await.unwrap();
        let mut req = vec![0x05, 0x01, 0x00, 0x03, 9];
        req.extend_from_slice(b"test.host");
        req.extend_from_slice(&1234u16.to_be_bytes());
        client.write_all(&req).await.unwrap();

        let mut method = [0u8; 2];
        client.read_exact(&mut method).await.unwrap();
        assert_eq!(method, [0x05, 0x00]);

        let mut reply = [0u8; 10];
        client.read_exact(&mut reply).await.unwrap();
        assert_eq!(reply, SUCCESS_REPLY);

        assert_eq!(handler.await.unwrap().unwrap(), "test.host:1234");
    }
}
