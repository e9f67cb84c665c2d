use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use std::io::ErrorKind;
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4, UdpSocket};
use std::time::Duration;

use super::config::TriggerConfig;
use super::constants::{
    CONTROL_KEYWORD, CONTROL_PACKET_SIZE, INFO_KEYWORD, INFO_PACKET_SIZE, MAX_PACKET_SIZE,
    MEASURE_FREQUENCY_COMMAND,
};
use super::error::{PacketError, TriggerError};
use super::event::TriggerId;

/// Commands carried by the control channel
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlCommand {
    MeasureFrequency,
    /// Any command this pipeline does not act on
    Other(u8),
}

impl From<u8> for ControlCommand {
    fn from(value: u8) -> Self {
        match value {
            MEASURE_FREQUENCY_COMMAND => ControlCommand::MeasureFrequency,
            other => ControlCommand::Other(other),
        }
    }
}

/// Decode a trigger package: `"TRACK "` | run u32 | record u32. Trailing bytes are ignored.
pub fn parse_info_packet(bytes: &[u8]) -> Result<TriggerId, PacketError> {
    if bytes.len() < INFO_PACKET_SIZE {
        return Err(PacketError::TooShort(bytes.len(), INFO_PACKET_SIZE));
    }
    if &bytes[..INFO_KEYWORD.len()] != INFO_KEYWORD {
        return Err(PacketError::BadKeyword);
    }
    let mut payload = &bytes[INFO_KEYWORD.len()..INFO_PACKET_SIZE];
    // Length was checked above, so these reads cannot run short
    let run = payload.read_u32::<LittleEndian>().unwrap_or_default();
    let record_number = payload.read_u32::<LittleEndian>().unwrap_or_default();
    Ok(TriggerId::new(run as u64, record_number as u64))
}

pub fn encode_info_packet(run: u32, record_number: u32) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(INFO_PACKET_SIZE);
    bytes.extend_from_slice(INFO_KEYWORD);
    let _ = bytes.write_u32::<LittleEndian>(run);
    let _ = bytes.write_u32::<LittleEndian>(record_number);
    bytes
}

/// Decode a control packet: `"NVDDC"` | command u8
pub fn parse_control_packet(bytes: &[u8]) -> Result<ControlCommand, PacketError> {
    if bytes.len() < CONTROL_PACKET_SIZE {
        return Err(PacketError::TooShort(bytes.len(), CONTROL_PACKET_SIZE));
    }
    if &bytes[..CONTROL_KEYWORD.len()] != CONTROL_KEYWORD {
        return Err(PacketError::BadKeyword);
    }
    Ok(ControlCommand::from(bytes[CONTROL_KEYWORD.len()]))
}

pub fn encode_control_packet(command: u8) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(CONTROL_PACKET_SIZE);
    bytes.extend_from_slice(CONTROL_KEYWORD);
    bytes.push(command);
    bytes
}

/// Open a receive socket for one channel.
///
/// A multicast group is joined on the configured interface. Any other address is bound directly,
/// which is how a point-to-point or loopback feed is received.
fn bind_channel(
    interface: Ipv4Addr,
    group: Ipv4Addr,
    port: u16,
    poll_interval: Duration,
) -> std::io::Result<UdpSocket> {
    let socket = if group.is_multicast() {
        let socket = UdpSocket::bind(SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, port))?;
        socket.join_multicast_v4(&group, &interface)?;
        socket
    } else {
        UdpSocket::bind(SocketAddrV4::new(group, port))?
    };
    socket.set_read_timeout(Some(poll_interval))?;
    Ok(socket)
}

/// Blocking receive with the poll timeout mapped to None
fn receive(socket: &UdpSocket, buffer: &mut [u8]) -> Result<Option<usize>, TriggerError> {
    match socket.recv_from(buffer) {
        Ok((n, _)) => Ok(Some(n)),
        Err(e) if matches!(e.kind(), ErrorKind::WouldBlock | ErrorKind::TimedOut) => Ok(None),
        Err(e) if e.kind() == ErrorKind::Interrupted => Ok(None),
        Err(e) => Err(TriggerError::IOError(e)),
    }
}

/// Where a datagram must be sent to reach a socket bound to `addr`
fn loopback_target(addr: SocketAddr) -> SocketAddr {
    match addr {
        SocketAddr::V4(v4) if v4.ip().is_unspecified() => {
            SocketAddr::V4(SocketAddrV4::new(Ipv4Addr::LOCALHOST, v4.port()))
        }
        other => other,
    }
}

/// The external trigger stream: an info channel carrying trigger packages and a control
/// channel carrying operator commands.
///
/// Receive calls block for at most the configured poll interval. `interrupt` wakes both
/// receivers immediately by sending each an empty datagram, which the receivers report as
/// "nothing received". The sockets close when the source is dropped.
#[derive(Debug)]
pub struct TriggerSource {
    info: UdpSocket,
    control: UdpSocket,
}

impl TriggerSource {
    pub fn bind(config: &TriggerConfig) -> Result<Self, TriggerError> {
        let poll = config.poll_interval();
        let info = bind_channel(config.interface, config.info_group, config.info_port, poll)?;
        let control = bind_channel(
            config.interface,
            config.control_group,
            config.control_port,
            poll,
        )?;
        Ok(Self { info, control })
    }

    pub fn info_addr(&self) -> std::io::Result<SocketAddr> {
        self.info.local_addr()
    }

    pub fn control_addr(&self) -> std::io::Result<SocketAddr> {
        self.control.local_addr()
    }

    /// Wait for the next trigger package.
    ///
    /// Ok(None) means nothing arrived within the poll interval (or the receiver was interrupted).
    /// A packet failing the keyword check is reported as BadPacket and leaves no other trace.
    pub fn recv_info(&self) -> Result<Option<TriggerId>, TriggerError> {
        let mut buffer = [0u8; MAX_PACKET_SIZE];
        match receive(&self.info, &mut buffer)? {
            None | Some(0) => Ok(None),
            Some(n) => Ok(Some(parse_info_packet(&buffer[..n])?)),
        }
    }

    /// Wait for the next control command. Same conventions as recv_info
    pub fn recv_control(&self) -> Result<Option<ControlCommand>, TriggerError> {
        let mut buffer = [0u8; MAX_PACKET_SIZE];
        match receive(&self.control, &mut buffer)? {
            None | Some(0) => Ok(None),
            Some(n) => Ok(Some(parse_control_packet(&buffer[..n])?)),
        }
    }

    /// Unblock any thread waiting in recv_info or recv_control
    pub fn interrupt(&self) -> std::io::Result<()> {
        let waker = UdpSocket::bind(SocketAddrV4::new(Ipv4Addr::LOCALHOST, 0))?;
        waker.send_to(&[], loopback_target(self.info.local_addr()?))?;
        waker.send_to(&[], loopback_target(self.control.local_addr()?))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Instant;

    fn loopback_config() -> TriggerConfig {
        TriggerConfig {
            interface: Ipv4Addr::LOCALHOST,
            info_group: Ipv4Addr::LOCALHOST,
            info_port: 0,
            control_group: Ipv4Addr::LOCALHOST,
            control_port: 0,
            poll_interval_ms: 50,
        }
    }

    #[test]
    fn test_info_packet() {
        let mut bytes = encode_info_packet(3, 1234);
        assert_eq!(&bytes[..6], b"TRACK ");
        bytes.extend_from_slice(b"padding");
        assert_eq!(parse_info_packet(&bytes), Ok(TriggerId::new(3, 1234)));
    }

    #[test]
    fn test_bad_info_packets() {
        let mut bytes = encode_info_packet(3, 1234);
        bytes[0] = b'X';
        assert_eq!(parse_info_packet(&bytes), Err(PacketError::BadKeyword));
        assert_eq!(
            parse_info_packet(b"TRACK "),
            Err(PacketError::TooShort(6, INFO_PACKET_SIZE))
        );
    }

    #[test]
    fn test_control_packet() {
        assert_eq!(
            parse_control_packet(&encode_control_packet(6)),
            Ok(ControlCommand::MeasureFrequency)
        );
        assert_eq!(
            parse_control_packet(&encode_control_packet(2)),
            Ok(ControlCommand::Other(2))
        );
        assert_eq!(
            parse_control_packet(b"NVDXC\x06"),
            Err(PacketError::BadKeyword)
        );
        assert_eq!(
            parse_control_packet(b"NVDDC"),
            Err(PacketError::TooShort(5, CONTROL_PACKET_SIZE))
        );
    }

    #[test]
    fn test_receive_over_loopback() {
        let source = TriggerSource::bind(&loopback_config()).unwrap();
        let sender = UdpSocket::bind("127.0.0.1:0").unwrap();

        sender
            .send_to(&encode_info_packet(1, 42), source.info_addr().unwrap())
            .unwrap();
        assert_eq!(source.recv_info().unwrap(), Some(TriggerId::new(1, 42)));

        sender
            .send_to(b"garbage!garbage!", source.info_addr().unwrap())
            .unwrap();
        assert!(matches!(
            source.recv_info(),
            Err(TriggerError::BadPacket(PacketError::BadKeyword))
        ));

        sender
            .send_to(&encode_control_packet(6), source.control_addr().unwrap())
            .unwrap();
        assert_eq!(
            source.recv_control().unwrap(),
            Some(ControlCommand::MeasureFrequency)
        );
    }

    #[test]
    fn test_receive_times_out() {
        let source = TriggerSource::bind(&loopback_config()).unwrap();
        let start = Instant::now();
        assert_eq!(source.recv_info().unwrap(), None);
        assert!(start.elapsed() < Duration::from_secs(5));
    }

    #[test]
    fn test_interrupt_wakes_receivers() {
        let config = TriggerConfig {
            poll_interval_ms: 60_000,
            ..loopback_config()
        };
        let source = std::sync::Arc::new(TriggerSource::bind(&config).unwrap());
        let receiver = source.clone();
        let start = Instant::now();
        let handle = std::thread::spawn(move || receiver.recv_control());
        std::thread::sleep(Duration::from_millis(50));
        source.interrupt().unwrap();
        let result = handle.join().unwrap();
        assert!(matches!(result, Ok(None)));
        assert!(start.elapsed() < Duration::from_secs(30));
    }
}
