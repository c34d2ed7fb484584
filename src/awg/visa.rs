use super::transport::{definite_length_block, map_io, ConnectionConfig, ScpiTransport};
use crate::error::ScanError;
use log::debug;
use std::ffi::CString;
use std::io::{BufRead, BufReader, Write};
use visa_rs::prelude::*;

/// SCPI through a VISA session, for `TCPIP0::<host>::inst0::INSTR` and other resources the
/// raw-socket transport cannot reach.
///
/// Needs a VISA runtime (NI-VISA, Keysight IO Libraries) on the host.
pub struct VisaScpiTransport {
    // Declared before the resource manager so the session closes first
    instrument: Instrument,
    _rm: DefaultRM,
    resource: String,
}

impl VisaScpiTransport {
    pub fn open(resource: &str, config: &ConnectionConfig) -> Result<Self, ScanError> {
        let rm = DefaultRM::new().map_err(map_visa)?;
        let name = CString::new(resource).map_err(|_| {
            ScanError::Configuration(format!("invalid VISA resource {resource}"))
        })?;
        debug!("Opening VISA session to {resource}");
        let instrument = rm
            .open(&name.into(), AccessMode::NO_LOCK, config.connect_timeout)
            .map_err(map_visa)?;
        Ok(Self {
            instrument,
            _rm: rm,
            resource: resource.to_string(),
        })
    }

    pub fn resource(&self) -> &str {
        &self.resource
    }

    fn send(&mut self, bytes: &[u8]) -> Result<(), ScanError> {
        self.instrument.write_all(bytes).map_err(map_io)?;
        self.instrument.flush().map_err(map_io)
    }
}

impl ScpiTransport for VisaScpiTransport {
    fn write(&mut self, command: &str) -> Result<(), ScanError> {
        debug!("VISA > {command}");
        self.send(format!("{command}\n").as_bytes())
    }

    fn query(&mut self, command: &str) -> Result<String, ScanError> {
        self.write(command)?;
        let mut line = String::new();
        let mut reader = BufReader::new(&self.instrument);
        reader.read_line(&mut line).map_err(map_io)?;
        let reply = line.trim_end().to_string();
        debug!("VISA < {reply}");
        Ok(reply)
    }

    fn write_binary_block(&mut self, header: &str, payload: &[u8]) -> Result<(), ScanError> {
        debug!("VISA > {header}<{} bytes>", payload.len());
        let mut message = header.as_bytes().to_vec();
        message.extend_from_slice(&definite_length_block(payload));
        message.push(b'\n');
        self.send(&message)
    }
}

fn map_visa(e: visa_rs::Error) -> ScanError {
    ScanError::DeviceCommunication(format!("VISA: {e}"))
}
