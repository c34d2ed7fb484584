use crate::error::ScanError;
use byteorder::{LittleEndian, WriteBytesExt};
use log::{debug, warn};
use std::io::{BufRead, BufReader, ErrorKind, Write};
use std::net::{Shutdown, SocketAddr, TcpStream, ToSocketAddrs};
use std::time::Duration;

/// Default raw-socket SCPI port on Tektronix instruments
pub const DEFAULT_SCPI_PORT: u16 = 4000;

/// Command/response link to an SCPI instrument
pub trait ScpiTransport: Send {
    /// Send one command without waiting for a reply
    fn write(&mut self, command: &str) -> Result<(), ScanError>;

    /// Send one command and read a single-line reply
    fn query(&mut self, command: &str) -> Result<String, ScanError>;

    /// Send `header` followed by `payload` as an IEEE 488.2 definite-length block
    fn write_binary_block(&mut self, header: &str, payload: &[u8]) -> Result<(), ScanError>;

    /// Release the link. Further calls may fail.
    fn close(&mut self) -> Result<(), ScanError> {
        Ok(())
    }
}

/// Timeout settings for an instrument link.
///
/// # Examples
///
/// ```
/// use std::time::Duration;
/// use qm_scan::awg::ConnectionConfig;
///
/// let config = ConnectionConfig {
///     read_timeout: Duration::from_secs(30),
///     ..Default::default()
/// };
/// assert_eq!(config.connect_timeout, Duration::from_secs(5));
/// ```
#[derive(Debug, Clone)]
pub struct ConnectionConfig {
    pub connect_timeout: Duration,
    pub read_timeout: Duration,
    pub write_timeout: Duration,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(5),
            read_timeout: Duration::from_secs(10),
            write_timeout: Duration::from_secs(10),
        }
    }
}

/// Parse an instrument resource string into host and port.
///
/// Accepts VISA raw-socket resources (`TCPIP0::10.0.0.5::4000::SOCKET`), `host:port`
/// and a bare host (port 4000). `INSTR` resources are rejected here; [`ScpiLink`] opens
/// them through VISA when the `visa` feature is enabled.
pub fn parse_resource(resource: &str) -> Result<(String, u16), ScanError> {
    let resource = resource.trim();
    if resource.is_empty() {
        return Err(ScanError::Configuration("empty instrument resource".into()));
    }

    if resource.to_ascii_uppercase().starts_with("TCPIP") {
        let parts: Vec<&str> = resource.split("::").collect();
        return match parts.as_slice() {
            [_, host, port, kind] if kind.eq_ignore_ascii_case("SOCKET") => {
                let port = port.parse::<u16>().map_err(|_| {
                    ScanError::Configuration(format!("invalid port in resource {resource}"))
                })?;
                Ok((host.to_string(), port))
            }
            [_, host, ..] if resource.to_ascii_uppercase().ends_with("INSTR") => {
                Err(ScanError::Configuration(format!(
                    "{resource} is not a socket resource, use TCPIP0::{host}::{DEFAULT_SCPI_PORT}::SOCKET or enable the `visa` feature"
                )))
            }
            _ => Err(ScanError::Configuration(format!(
                "unrecognized resource string {resource}"
            ))),
        };
    }

    match resource.rsplit_once(':') {
        Some((host, port)) => {
            let port = port.parse::<u16>().map_err(|_| {
                ScanError::Configuration(format!("invalid port in resource {resource}"))
            })?;
            Ok((host.to_string(), port))
        }
        None => Ok((resource.to_string(), DEFAULT_SCPI_PORT)),
    }
}

/// Build the `#<digits><length><payload>` block that follows a binary-data header
pub fn definite_length_block(payload: &[u8]) -> Vec<u8> {
    let length = payload.len().to_string();
    let mut block = Vec::with_capacity(payload.len() + length.len() + 2);
    block.push(b'#');
    block.extend_from_slice(length.len().to_string().as_bytes());
    block.extend_from_slice(length.as_bytes());
    block.extend_from_slice(payload);
    block
}

/// Encode samples as little-endian IEEE 754 single precision
pub fn encode_f32_le(samples: &[f32]) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(samples.len() * 4);
    for &s in samples {
        // Writing into a Vec cannot fail
        let _ = bytes.write_f32::<LittleEndian>(s);
    }
    bytes
}

/// Builder for [`TcpScpiTransport`].
///
/// ```no_run
/// use std::time::Duration;
/// use qm_scan::awg::TcpScpiTransport;
///
/// let transport = TcpScpiTransport::builder()
///     .resource("TCPIP0::141.20.45.148::4000::SOCKET")
///     .read_timeout(Duration::from_secs(10))
///     .build()?;
/// # Ok::<(), Box<dyn std::error::Error>>(())
/// ```
#[derive(Default)]
pub struct TcpScpiTransportBuilder {
    resource: Option<String>,
    config: ConnectionConfig,
}

impl TcpScpiTransportBuilder {
    pub fn resource(mut self, resource: &str) -> Self {
        self.resource = Some(resource.to_string());
        self
    }

    pub fn config(mut self, config: ConnectionConfig) -> Self {
        self.config = config;
        self
    }

    pub fn connect_timeout(mut self, timeout: Duration) -> Self {
        self.config.connect_timeout = timeout;
        self
    }

    pub fn read_timeout(mut self, timeout: Duration) -> Self {
        self.config.read_timeout = timeout;
        self
    }

    pub fn write_timeout(mut self, timeout: Duration) -> Self {
        self.config.write_timeout = timeout;
        self
    }

    pub fn build(self) -> Result<TcpScpiTransport, ScanError> {
        let resource = self
            .resource
            .ok_or_else(|| ScanError::Configuration("resource must be specified".into()))?;
        let (host, port) = parse_resource(&resource)?;

        let socket_addr: SocketAddr = (host.as_str(), port)
            .to_socket_addrs()
            .map_err(|e| ScanError::Configuration(format!("cannot resolve {host}: {e}")))?
            .next()
            .ok_or_else(|| ScanError::Configuration(format!("no address for {host}")))?;

        debug!("Connecting to instrument at {socket_addr}");

        let stream = TcpStream::connect_timeout(&socket_addr, self.config.connect_timeout)
            .map_err(|e| {
                warn!("Failed to connect to {socket_addr}: {e}");
                if e.kind() == ErrorKind::TimedOut {
                    ScanError::Timeout
                } else {
                    ScanError::DeviceCommunication(format!(
                        "failed to connect to {socket_addr}: {e}"
                    ))
                }
            })?;
        stream.set_read_timeout(Some(self.config.read_timeout))?;
        stream.set_write_timeout(Some(self.config.write_timeout))?;
        stream.set_nodelay(true)?;

        let reader = BufReader::new(stream.try_clone()?);

        Ok(TcpScpiTransport {
            stream,
            reader,
            peer: socket_addr,
        })
    }
}

/// SCPI over a raw TCP socket, newline-terminated
pub struct TcpScpiTransport {
    stream: TcpStream,
    reader: BufReader<TcpStream>,
    peer: SocketAddr,
}

impl TcpScpiTransport {
    pub fn builder() -> TcpScpiTransportBuilder {
        TcpScpiTransportBuilder::default()
    }

    pub fn peer(&self) -> SocketAddr {
        self.peer
    }

    fn send(&mut self, bytes: &[u8]) -> Result<(), ScanError> {
        self.stream.write_all(bytes).map_err(map_io)?;
        self.stream.flush().map_err(map_io)
    }
}

impl ScpiTransport for TcpScpiTransport {
    fn write(&mut self, command: &str) -> Result<(), ScanError> {
        debug!("SCPI > {command}");
        self.send(format!("{command}\n").as_bytes())
    }

    fn query(&mut self, command: &str) -> Result<String, ScanError> {
        self.write(command)?;
        let mut line = String::new();
        let read = self.reader.read_line(&mut line).map_err(map_io)?;
        if read == 0 {
            return Err(ScanError::DeviceCommunication(format!(
                "{} closed the connection",
                self.peer
            )));
        }
        let reply = line.trim_end().to_string();
        debug!("SCPI < {reply}");
        Ok(reply)
    }

    fn write_binary_block(&mut self, header: &str, payload: &[u8]) -> Result<(), ScanError> {
        debug!("SCPI > {header}<{} bytes>", payload.len());
        let block = definite_length_block(payload);
        let mut message = Vec::with_capacity(header.len() + block.len() + 1);
        message.extend_from_slice(header.as_bytes());
        message.extend_from_slice(&block);
        message.push(b'\n');
        self.send(&message)
    }

    fn close(&mut self) -> Result<(), ScanError> {
        match self.stream.shutdown(Shutdown::Both) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotConnected => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

/// `true` for VISA `INSTR` resources such as `TCPIP0::10.0.0.5::inst0::INSTR`
pub fn is_instr_resource(resource: &str) -> bool {
    resource.trim().to_ascii_uppercase().ends_with("::INSTR")
}

/// Check that `resource` can be opened by [`ScpiLink::open`] in this build
pub fn validate_resource(resource: &str) -> Result<(), ScanError> {
    if is_instr_resource(resource) && cfg!(feature = "visa") {
        return Ok(());
    }
    parse_resource(resource).map(|_| ())
}

/// Instrument link picked from the resource string
pub enum ScpiLink {
    Tcp(TcpScpiTransport),
    #[cfg(feature = "visa")]
    Visa(super::visa::VisaScpiTransport),
}

impl ScpiLink {
    /// `INSTR` resources go through VISA, everything else over a raw socket
    pub fn open(resource: &str, config: ConnectionConfig) -> Result<Self, ScanError> {
        if is_instr_resource(resource) {
            return open_visa(resource, &config);
        }
        TcpScpiTransport::builder()
            .resource(resource)
            .config(config)
            .build()
            .map(Self::Tcp)
    }

    fn transport(&mut self) -> &mut dyn ScpiTransport {
        match self {
            Self::Tcp(t) => t,
            #[cfg(feature = "visa")]
            Self::Visa(t) => t,
        }
    }
}

impl ScpiTransport for ScpiLink {
    fn write(&mut self, command: &str) -> Result<(), ScanError> {
        self.transport().write(command)
    }

    fn query(&mut self, command: &str) -> Result<String, ScanError> {
        self.transport().query(command)
    }

    fn write_binary_block(&mut self, header: &str, payload: &[u8]) -> Result<(), ScanError> {
        self.transport().write_binary_block(header, payload)
    }

    fn close(&mut self) -> Result<(), ScanError> {
        self.transport().close()
    }
}

#[cfg(feature = "visa")]
fn open_visa(resource: &str, config: &ConnectionConfig) -> Result<ScpiLink, ScanError> {
    super::visa::VisaScpiTransport::open(resource, config).map(ScpiLink::Visa)
}

#[cfg(not(feature = "visa"))]
fn open_visa(resource: &str, _config: &ConnectionConfig) -> Result<ScpiLink, ScanError> {
    Err(ScanError::Configuration(format!(
        "{resource} needs the `visa` feature, or use TCPIP0::<host>::{DEFAULT_SCPI_PORT}::SOCKET"
    )))
}

pub(crate) fn map_io(e: std::io::Error) -> ScanError {
    match e.kind() {
        ErrorKind::TimedOut | ErrorKind::WouldBlock => ScanError::Timeout,
        _ => ScanError::Io(e),
    }
}
