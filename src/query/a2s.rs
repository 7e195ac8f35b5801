// src/query/a2s.rs
//
// Source-engine A2S queries over UDP: A2S_INFO for server state and
// A2S_PLAYER for the roster. Both may answer with a 0x41 challenge that
// has to be echoed back before the real reply arrives. Replies too large
// for one datagram arrive split and are reassembled before parsing.

use async_trait::async_trait;
use byteorder::{LittleEndian, ReadBytesExt};
use log::debug;
use std::collections::BTreeMap;
use std::io::{BufRead, Cursor};
use std::net::SocketAddr;
use std::time::Duration;
use tokio::net::{lookup_host, UdpSocket};
use tokio::time::Instant;

use crate::models::server::{PlayerEntry, ServerSnapshot, SNAPSHOT_SCHEMA_VERSION};
use crate::query::{QueryClient, QueryError};

const SIMPLE_HEADER: [u8; 4] = [0xFF, 0xFF, 0xFF, 0xFF];
const SPLIT_HEADER: [u8; 4] = [0xFE, 0xFF, 0xFF, 0xFF];

const A2S_INFO: u8 = 0x54;
const A2S_PLAYER: u8 = 0x55;
const S2C_CHALLENGE: u8 = 0x41;
const INFO_REPLY: u8 = 0x49;
const PLAYER_REPLY: u8 = 0x44;

const INFO_PAYLOAD: &[u8] = b"Source Engine Query\0";
const MAX_PACKET: usize = 4096;

#[derive(Debug, Clone, Copy, Default)]
pub struct A2sClient;

impl A2sClient {
    pub fn new() -> Self {
        Self
    }
}

pub(crate) fn info_request(challenge: Option<[u8; 4]>) -> Vec<u8> {
    let mut packet = SIMPLE_HEADER.to_vec();
    packet.push(A2S_INFO);
    packet.extend_from_slice(INFO_PAYLOAD);
    if let Some(challenge) = challenge {
        packet.extend_from_slice(&challenge);
    }
    packet
}

pub(crate) fn player_request(challenge: [u8; 4]) -> Vec<u8> {
    let mut packet = SIMPLE_HEADER.to_vec();
    packet.push(A2S_PLAYER);
    packet.extend_from_slice(&challenge);
    packet
}

fn truncated(_: std::io::Error) -> QueryError {
    QueryError::Protocol("truncated reply".to_string())
}

fn read_cstr(cursor: &mut Cursor<&[u8]>) -> Result<String, QueryError> {
    let mut bytes = Vec::new();
    cursor.read_until(0, &mut bytes).map_err(truncated)?;
    if bytes.pop() != Some(0) {
        return Err(QueryError::Protocol("unterminated string".to_string()));
    }
    Ok(String::from_utf8_lossy(&bytes).into_owned())
}

enum Reply<'a> {
    Challenge([u8; 4]),
    Payload(u8, &'a [u8]),
}

fn classify(packet: &[u8]) -> Result<Reply<'_>, QueryError> {
    if packet.len() < 5 {
        return Err(QueryError::Protocol(format!("short packet ({} bytes)", packet.len())));
    }
    if packet[..4] == SPLIT_HEADER {
        return Err(QueryError::Protocol("nested split reply".to_string()));
    }
    if packet[..4] != SIMPLE_HEADER {
        return Err(QueryError::Protocol(format!("bad header {:02X?}", &packet[..4])));
    }

    match packet[4] {
        S2C_CHALLENGE => {
            let challenge: [u8; 4] = packet
                .get(5..9)
                .and_then(|c| c.try_into().ok())
                .ok_or_else(|| QueryError::Protocol("short challenge".to_string()))?;
            Ok(Reply::Challenge(challenge))
        }
        kind => Ok(Reply::Payload(kind, &packet[5..])),
    }
}

/// Parse the body of an A2S_INFO reply (after the 0x49 byte).
pub(crate) fn parse_info(body: &[u8], ping: Duration) -> Result<ServerSnapshot, QueryError> {
    let mut cursor = Cursor::new(body);
    let _protocol = cursor.read_u8().map_err(truncated)?;
    let name = read_cstr(&mut cursor)?;
    let map = read_cstr(&mut cursor)?;
    let _folder = read_cstr(&mut cursor)?;
    let game = read_cstr(&mut cursor)?;
    let _app_id = cursor.read_i16::<LittleEndian>().map_err(truncated)?;
    let players = cursor.read_u8().map_err(truncated)?;
    let max_players = cursor.read_u8().map_err(truncated)?;
    // bots, server type, environment, visibility, vac
    for _ in 0..5 {
        cursor.read_u8().map_err(truncated)?;
    }
    let version = read_cstr(&mut cursor)?;

    Ok(ServerSnapshot {
        schema_version: SNAPSHOT_SCHEMA_VERSION,
        name,
        map,
        game,
        version,
        players,
        max_players,
        ping_ms: ping.as_millis() as u64,
        battle_url: None,
    })
}

/// Parse the body of an A2S_PLAYER reply (after the 0x44 byte).
pub(crate) fn parse_players(body: &[u8]) -> Result<Vec<PlayerEntry>, QueryError> {
    let mut cursor = Cursor::new(body);
    let count = cursor.read_u8().map_err(truncated)?;
    let mut players = Vec::with_capacity(count as usize);
    for _ in 0..count {
        let _index = cursor.read_u8().map_err(truncated)?;
        let name = read_cstr(&mut cursor)?;
        let _score = cursor.read_i32::<LittleEndian>().map_err(truncated)?;
        let duration = cursor.read_f32::<LittleEndian>().map_err(truncated)?;
        players.push(PlayerEntry {
            name,
            session_secs: if duration.is_finite() && duration > 0.0 { duration as u64 } else { 0 },
        });
    }
    Ok(players)
}

async fn open_socket(address: &str) -> Result<UdpSocket, QueryError> {
    let target: SocketAddr = lookup_host(address).await?.next().ok_or_else(|| {
        QueryError::Io(std::io::Error::new(
            std::io::ErrorKind::NotFound,
            format!("could not resolve {}", address),
        ))
    })?;
    let local = if target.is_ipv4() { "0.0.0.0:0" } else { "[::]:0" };
    let socket = UdpSocket::bind(local).await?;
    socket.connect(target).await?;
    Ok(socket)
}

struct Fragment {
    id: i32,
    total: u8,
    number: u8,
    payload: Vec<u8>,
}

/// Parse one packet of a split reply (Source engine layout).
fn parse_fragment(packet: &[u8]) -> Result<Fragment, QueryError> {
    let mut cursor = Cursor::new(&packet[SPLIT_HEADER.len()..]);
    let id = cursor.read_i32::<LittleEndian>().map_err(truncated)?;
    // High bit marks a bzip2-compressed reply.
    if (id as u32) & 0x8000_0000 != 0 {
        return Err(QueryError::Protocol("compressed split replies are not supported".to_string()));
    }
    let total = cursor.read_u8().map_err(truncated)?;
    let number = cursor.read_u8().map_err(truncated)?;
    let _size = cursor.read_u16::<LittleEndian>().map_err(truncated)?;
    if total == 0 || number >= total {
        return Err(QueryError::Protocol(format!(
            "inconsistent split header (packet {} of {})",
            number, total
        )));
    }

    let start = SPLIT_HEADER.len() + cursor.position() as usize;
    Ok(Fragment {
        id,
        total,
        number,
        payload: packet[start..].to_vec(),
    })
}

/// Receive one logical reply, reassembling it if the server split it.
async fn receive(socket: &UdpSocket, timeout: Duration) -> Result<Vec<u8>, QueryError> {
    let deadline = Instant::now() + timeout;
    let mut buffer = vec![0u8; MAX_PACKET];
    let mut fragments: BTreeMap<u8, Vec<u8>> = BTreeMap::new();
    let mut expected: Option<(i32, u8)> = None;

    loop {
        let len = match tokio::time::timeout_at(deadline, socket.recv(&mut buffer)).await {
            Ok(result) => result?,
            Err(_) => return Err(QueryError::Timeout(timeout)),
        };
        let packet = &buffer[..len];
        if packet.len() < SPLIT_HEADER.len() || packet[..SPLIT_HEADER.len()] != SPLIT_HEADER {
            if expected.is_some() {
                return Err(QueryError::Protocol("single packet inside a split reply".to_string()));
            }
            return Ok(packet.to_vec());
        }

        let fragment = parse_fragment(packet)?;
        match expected {
            None => expected = Some((fragment.id, fragment.total)),
            Some((id, total)) if id != fragment.id || total != fragment.total => {
                return Err(QueryError::Protocol(format!(
                    "inconsistent split header (reply {} of {} packets, got {} of {})",
                    id, total, fragment.id, fragment.total
                )));
            }
            Some(_) => {}
        }

        let total = fragment.total as usize;
        fragments.insert(fragment.number, fragment.payload);
        if fragments.len() == total {
            debug!("Reassembled reply from {} packets", total);
            return Ok(fragments.into_values().flatten().collect());
        }
    }
}

async fn round_trip(
    socket: &UdpSocket,
    packet: &[u8],
    timeout: Duration,
) -> Result<(Vec<u8>, Duration), QueryError> {
    let started = Instant::now();
    socket.send(packet).await?;
    let reply = receive(socket, timeout).await?;
    Ok((reply, started.elapsed()))
}

/// Send `first`, answer at most one challenge with `retry`, and return the
/// body of a reply of type `expected` together with the final round-trip time.
async fn challenged_exchange<F>(
    address: &str,
    first: Vec<u8>,
    retry: F,
    expected: u8,
    timeout: Duration,
) -> Result<(Vec<u8>, Duration), QueryError>
where
    F: Fn([u8; 4]) -> Vec<u8>,
{
    let socket = open_socket(address).await?;
    let (mut packet, mut rtt) = round_trip(&socket, &first, timeout).await?;

    let challenge = match classify(&packet)? {
        Reply::Challenge(challenge) => Some(challenge),
        Reply::Payload(..) => None,
    };
    if let Some(challenge) = challenge {
        debug!("{} sent challenge {:02X?}", address, challenge);
        (packet, rtt) = round_trip(&socket, &retry(challenge), timeout).await?;
    }

    match classify(&packet)? {
        Reply::Payload(kind, body) if kind == expected => Ok((body.to_vec(), rtt)),
        Reply::Payload(kind, _) => Err(QueryError::Protocol(format!(
            "expected reply 0x{:02X}, got 0x{:02X}",
            expected, kind
        ))),
        Reply::Challenge(_) => Err(QueryError::Protocol("repeated challenge".to_string())),
    }
}

#[async_trait]
impl QueryClient for A2sClient {
    async fn query_state(&self, address: &str, timeout: Duration) -> Result<ServerSnapshot, QueryError> {
        let (body, rtt) = challenged_exchange(
            address,
            info_request(None),
            |challenge| info_request(Some(challenge)),
            INFO_REPLY,
            timeout,
        )
        .await?;
        parse_info(&body, rtt)
    }

    async fn query_roster(&self, address: &str, timeout: Duration) -> Result<Vec<PlayerEntry>, QueryError> {
        let (body, _) = challenged_exchange(
            address,
            player_request([0xFF; 4]),
            player_request,
            PLAYER_REPLY,
            timeout,
        )
        .await?;
        parse_players(&body)
    }
}
