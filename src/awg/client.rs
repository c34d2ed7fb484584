use super::transport::{encode_f32_le, ConnectionConfig, ScpiLink, ScpiTransport};
use crate::error::ScanError;
use crate::interface::DeviceWarning;
use log::{debug, info, warn};

/// Number of analog outputs on the AWG5204
pub const CHANNEL_COUNT: u8 = 4;

/// One waveform slot to upload: samples in [-1, 1] and the matching marker bytes
#[derive(Debug, Clone, Copy)]
pub struct ChannelData<'a> {
    pub name: &'a str,
    pub samples: &'a [f32],
    pub markers: &'a [u8],
}

/// Tektronix AWG5204 driven over SCPI.
///
/// Outputs 1 and 2 carry the control and signal waveforms; outputs 3 and 4 are
/// always switched off when a run is programmed. Call [`Awg::shutdown`] when done;
/// dropping an open client performs the same steps on a best-effort basis.
///
/// ```no_run
/// use qm_scan::awg::{Awg, ConnectionConfig};
///
/// let mut awg = Awg::connect("TCPIP0::141.20.45.148::4000::SOCKET", ConnectionConfig::default())?;
/// awg.set_output(3, false)?;
/// awg.shutdown()?;
/// # Ok::<(), Box<dyn std::error::Error>>(())
/// ```
pub struct Awg<T: ScpiTransport = ScpiLink> {
    transport: T,
    identity: String,
    control_slot: String,
    signal_slot: String,
    closed: bool,
}

impl Awg<ScpiLink> {
    /// Open a link to `resource` and identify the instrument. `INSTR` resources need the
    /// `visa` feature.
    pub fn connect(resource: &str, config: ConnectionConfig) -> Result<Self, ScanError> {
        Self::new(ScpiLink::open(resource, config)?)
    }
}

impl<T: ScpiTransport> Awg<T> {
    pub fn new(mut transport: T) -> Result<Self, ScanError> {
        let identity = transport.query("*IDN?")?;
        info!("Connected to {identity}");
        Ok(Self {
            transport,
            identity,
            control_slot: "control_pulse".to_string(),
            signal_slot: "signal_pulse".to_string(),
            closed: false,
        })
    }

    /// Waveform-list names used for the control and signal uploads
    pub fn with_slots(mut self, control: &str, signal: &str) -> Self {
        self.control_slot = control.to_string();
        self.signal_slot = signal.to_string();
        self
    }

    pub fn identity(&self) -> &str {
        &self.identity
    }

    pub fn slots(&self) -> (&str, &str) {
        (&self.control_slot, &self.signal_slot)
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    /// Remove `name` from the waveform list. A missing waveform only leaves an entry in
    /// the error queue.
    pub fn delete_waveform(&mut self, name: &str) -> Result<(), ScanError> {
        self.transport
            .write(&format!("WLIST:WAVEFORM:DELETE \"{name}\""))
    }

    pub fn new_waveform(&mut self, name: &str, length: usize) -> Result<(), ScanError> {
        self.transport
            .write(&format!("WLIST:WAVEFORM:NEW \"{name}\",{length}"))
    }

    pub fn upload_samples(&mut self, name: &str, samples: &[f32]) -> Result<(), ScanError> {
        let header = format!("WLIST:WAVEFORM:DATA \"{name}\",0,{},", samples.len());
        self.transport
            .write_binary_block(&header, &encode_f32_le(samples))
    }

    pub fn upload_markers(&mut self, name: &str, markers: &[u8]) -> Result<(), ScanError> {
        let header = format!(
            "WLIST:WAVEFORM:MARKER:DATA \"{name}\",0,{},",
            markers.len()
        );
        self.transport.write_binary_block(&header, markers)
    }

    /// Replace waveform `data.name` with new samples and markers
    pub fn send_waveform(&mut self, data: ChannelData<'_>) -> Result<(), ScanError> {
        if data.samples.len() != data.markers.len() {
            return Err(ScanError::InvalidParameter(format!(
                "{}: {} samples but {} marker values",
                data.name,
                data.samples.len(),
                data.markers.len()
            )));
        }
        if data.samples.is_empty() {
            return Err(ScanError::InvalidParameter(format!(
                "{}: empty waveform",
                data.name
            )));
        }
        debug!("Uploading {} ({} samples)", data.name, data.samples.len());
        self.delete_waveform(data.name)?;
        self.new_waveform(data.name, data.samples.len())?;
        self.upload_samples(data.name, data.samples)?;
        self.upload_markers(data.name, data.markers)
    }

    /// Route waveform `name` to analog output `channel`
    pub fn assign(&mut self, channel: u8, name: &str) -> Result<(), ScanError> {
        check_channel(channel)?;
        self.transport
            .write(&format!("SOURCE{channel}:WAVEFORM \"{name}\""))
    }

    pub fn set_output(&mut self, channel: u8, on: bool) -> Result<(), ScanError> {
        check_channel(channel)?;
        let state = if on { "ON" } else { "OFF" };
        self.transport.write(&format!("OUTPUT{channel} {state}"))
    }

    pub fn run(&mut self) -> Result<(), ScanError> {
        self.transport.write("AWGCONTROL:RUN:IMMEDIATE")
    }

    pub fn stop(&mut self) -> Result<(), ScanError> {
        self.transport.write("AWGCONTROL:STOP:IMMEDIATE")
    }

    /// Drain the error queue and log every entry
    pub fn check_errors(&mut self) -> Result<Vec<DeviceWarning>, ScanError> {
        let reply = self.transport.query("SYSTEM:ERROR:ALL?")?;
        let warnings = parse_error_queue(&reply);
        for w in &warnings {
            warn!("AWG reported error {}: {}", w.code, w.message);
        }
        Ok(warnings)
    }

    /// Upload two waveforms, play them on outputs 1 and 2 and switch the rest off.
    ///
    /// On any failure every output is switched off before the error is returned.
    pub fn program_and_run(
        &mut self,
        first: ChannelData<'_>,
        second: ChannelData<'_>,
    ) -> Result<Vec<DeviceWarning>, ScanError> {
        let result = self.try_program_and_run(first, second);
        if let Err(ref e) = result {
            warn!("Programming failed ({e}), switching outputs off");
            let _ = self.all_outputs_off();
        }
        result
    }

    fn try_program_and_run(
        &mut self,
        first: ChannelData<'_>,
        second: ChannelData<'_>,
    ) -> Result<Vec<DeviceWarning>, ScanError> {
        self.send_waveform(first)?;
        self.send_waveform(second)?;
        self.assign(1, first.name)?;
        self.assign(2, second.name)?;

        // Unused outputs keep whatever state they had, so switch them off explicitly
        for channel in 1..=CHANNEL_COUNT {
            self.set_output(channel, channel <= 2)?;
        }
        self.run()?;
        self.check_errors()
    }

    /// Switch every output off. All four channels are always attempted; the first
    /// failure is returned afterwards.
    pub fn all_outputs_off(&mut self) -> Result<(), ScanError> {
        let mut first_error = None;
        for channel in 1..=CHANNEL_COUNT {
            if let Err(e) = self.set_output(channel, false) {
                warn!("Could not switch output {channel} off: {e}");
                first_error.get_or_insert(e);
            }
        }
        first_error.map_or(Ok(()), Err)
    }

    /// Switch outputs off, stop playback and close the link
    pub fn shutdown(&mut self) -> Result<(), ScanError> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;
        let outputs = self.all_outputs_off();
        let stop = self.stop();
        let close = self.transport.close();
        info!("AWG connection closed");
        outputs.and(stop).and(close)
    }
}

impl<T: ScpiTransport> Drop for Awg<T> {
    fn drop(&mut self) {
        if !self.closed {
            if let Err(e) = self.shutdown() {
                warn!("AWG shutdown on drop failed: {e}");
            }
        }
    }
}

fn check_channel(channel: u8) -> Result<(), ScanError> {
    if (1..=CHANNEL_COUNT).contains(&channel) {
        Ok(())
    } else {
        Err(ScanError::InvalidParameter(format!(
            "channel must be 1-{CHANNEL_COUNT}, got {channel}"
        )))
    }
}

/// Split a `SYSTEM:ERROR:ALL?` reply into entries.
///
/// The reply is a comma-separated list of `<code>,"<message>"` pairs; code 0 means the
/// queue is empty.
pub fn parse_error_queue(reply: &str) -> Vec<DeviceWarning> {
    let mut warnings = Vec::new();
    let mut rest = reply.trim();
    while !rest.is_empty() {
        let (code, after_code) = match rest.split_once(',') {
            Some((code, after)) => (code.trim(), after.trim_start()),
            None => (rest, ""),
        };
        let (message, remaining) = if let Some(quoted) = after_code.strip_prefix('"') {
            match quoted.split_once('"') {
                Some((msg, after)) => (msg, after.trim_start_matches(',').trim_start()),
                None => (quoted, ""),
            }
        } else {
            match after_code.split_once(',') {
                Some((msg, after)) => (msg.trim(), after.trim_start()),
                None => (after_code, ""),
            }
        };

        match code.parse::<i32>() {
            Ok(0) => {}
            Ok(code) => warnings.push(DeviceWarning {
                code,
                message: message.to_string(),
            }),
            Err(_) => {
                warnings.push(DeviceWarning {
                    code: -1,
                    message: rest.to_string(),
                });
                break;
            }
        }
        rest = remaining;
    }
    warnings
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use parking_lot::Mutex;
    use std::sync::Arc;

    /// Records every command; optionally fails on the first command containing a pattern
    #[derive(Clone, Default)]
    pub(crate) struct RecordingTransport {
        pub log: Arc<Mutex<Vec<String>>>,
        pub fail_on: Option<String>,
        pub error_reply: String,
    }

    impl RecordingTransport {
        pub fn commands(&self) -> Vec<String> {
            self.log.lock().clone()
        }

        fn record(&mut self, entry: String) -> Result<(), ScanError> {
            let fail = self
                .fail_on
                .as_ref()
                .is_some_and(|pattern| entry.contains(pattern.as_str()));
            self.log.lock().push(entry.clone());
            if fail {
                // Only the first match fails so that cleanup commands still go through
                self.fail_on = None;
                return Err(ScanError::DeviceCommunication(format!("failed on {entry}")));
            }
            Ok(())
        }
    }

    impl ScpiTransport for RecordingTransport {
        fn write(&mut self, command: &str) -> Result<(), ScanError> {
            self.record(command.to_string())
        }

        fn query(&mut self, command: &str) -> Result<String, ScanError> {
            self.record(command.to_string())?;
            Ok(match command {
                "*IDN?" => "TEKTRONIX,AWG5204,B010000,FV:6.0".to_string(),
                "SYSTEM:ERROR:ALL?" if !self.error_reply.is_empty() => self.error_reply.clone(),
                "SYSTEM:ERROR:ALL?" => "0,\"No error\"".to_string(),
                _ => String::new(),
            })
        }

        fn write_binary_block(&mut self, header: &str, payload: &[u8]) -> Result<(), ScanError> {
            self.record(format!("{header}<{}>", payload.len()))
        }
    }

    fn channel<'a>(name: &'a str, samples: &'a [f32], markers: &'a [u8]) -> ChannelData<'a> {
        ChannelData {
            name,
            samples,
            markers,
        }
    }

    #[test]
    fn test_program_and_run_sequence() {
        let transport = RecordingTransport::default();
        let mut awg = Awg::new(transport.clone()).unwrap();
        let samples = [0.0f32; 8];
        let markers = [0x80u8; 8];
        let warnings = awg
            .program_and_run(
                channel("control_pulse", &samples, &markers),
                channel("signal_pulse", &samples, &markers),
            )
            .unwrap();
        assert!(warnings.is_empty());

        let expected = vec![
            "*IDN?",
            "WLIST:WAVEFORM:DELETE \"control_pulse\"",
            "WLIST:WAVEFORM:NEW \"control_pulse\",8",
            "WLIST:WAVEFORM:DATA \"control_pulse\",0,8,<32>",
            "WLIST:WAVEFORM:MARKER:DATA \"control_pulse\",0,8,<8>",
            "WLIST:WAVEFORM:DELETE \"signal_pulse\"",
            "WLIST:WAVEFORM:NEW \"signal_pulse\",8",
            "WLIST:WAVEFORM:DATA \"signal_pulse\",0,8,<32>",
            "WLIST:WAVEFORM:MARKER:DATA \"signal_pulse\",0,8,<8>",
            "SOURCE1:WAVEFORM \"control_pulse\"",
            "SOURCE2:WAVEFORM \"signal_pulse\"",
            "OUTPUT1 ON",
            "OUTPUT2 ON",
            "OUTPUT3 OFF",
            "OUTPUT4 OFF",
            "AWGCONTROL:RUN:IMMEDIATE",
            "SYSTEM:ERROR:ALL?",
        ];
        assert_eq!(transport.commands(), expected);
        awg.shutdown().unwrap();
    }

    #[test]
    fn test_failure_forces_outputs_off() {
        let transport = RecordingTransport {
            fail_on: Some("SOURCE2".to_string()),
            ..Default::default()
        };
        let mut awg = Awg::new(transport.clone()).unwrap();
        let samples = [0.5f32; 4];
        let markers = [0u8; 4];
        let result = awg.program_and_run(
            channel("a", &samples, &markers),
            channel("b", &samples, &markers),
        );
        assert!(matches!(result, Err(ScanError::DeviceCommunication(_))));

        let commands = transport.commands();
        let tail: Vec<&str> = commands.iter().rev().take(4).rev().map(|s| s.as_str()).collect();
        assert_eq!(tail, ["OUTPUT1 OFF", "OUTPUT2 OFF", "OUTPUT3 OFF", "OUTPUT4 OFF"]);
        assert!(!commands.iter().any(|c| c == "AWGCONTROL:RUN:IMMEDIATE"));
    }

    #[test]
    fn test_outputs_off_continues_after_failure() {
        let transport = RecordingTransport {
            fail_on: Some("OUTPUT1 OFF".to_string()),
            ..Default::default()
        };
        let mut awg = Awg::new(transport.clone()).unwrap();
        let result = awg.all_outputs_off();
        assert!(matches!(result, Err(ScanError::DeviceCommunication(_))));
        assert_eq!(
            transport.commands(),
            ["*IDN?", "OUTPUT1 OFF", "OUTPUT2 OFF", "OUTPUT3 OFF", "OUTPUT4 OFF"]
        );
    }

    #[test]
    fn test_length_mismatch_rejected_before_io() {
        let transport = RecordingTransport::default();
        let mut awg = Awg::new(transport.clone()).unwrap();
        let result = awg.send_waveform(channel("a", &[0.0; 4], &[0; 3]));
        assert!(matches!(result, Err(ScanError::InvalidParameter(_))));
        assert_eq!(transport.commands(), vec!["*IDN?"]);
    }

    #[test]
    fn test_invalid_channel() {
        let mut awg = Awg::new(RecordingTransport::default()).unwrap();
        assert!(awg.assign(5, "x").is_err());
        assert!(awg.set_output(0, true).is_err());
    }

    #[test]
    fn test_device_errors_are_warnings() {
        let transport = RecordingTransport {
            error_reply: "-224,\"Illegal parameter value\",-222,\"Data out of range\""
                .to_string(),
            ..Default::default()
        };
        let mut awg = Awg::new(transport).unwrap();
        let warnings = awg
            .program_and_run(
                channel("a", &[0.0; 2], &[0; 2]),
                channel("b", &[0.0; 2], &[0; 2]),
            )
            .unwrap();
        assert_eq!(warnings.len(), 2);
        assert_eq!(warnings[0].code, -224);
        assert_eq!(warnings[1].message, "Data out of range");
    }

    #[test]
    fn test_drop_shuts_down() {
        let transport = RecordingTransport::default();
        {
            let _awg = Awg::new(transport.clone()).unwrap();
        }
        let commands = transport.commands();
        assert_eq!(
            &commands[1..],
            &[
                "OUTPUT1 OFF",
                "OUTPUT2 OFF",
                "OUTPUT3 OFF",
                "OUTPUT4 OFF",
                "AWGCONTROL:STOP:IMMEDIATE"
            ]
        );
    }

    #[test]
    fn test_parse_error_queue() {
        assert!(parse_error_queue("0,\"No error\"").is_empty());
        let w = parse_error_queue("-113,\"Undefined header; WLIST:FOO\"");
        assert_eq!(w.len(), 1);
        assert_eq!(w[0].code, -113);
        assert_eq!(w[0].message, "Undefined header; WLIST:FOO");
        let garbage = parse_error_queue("garbled");
        assert_eq!(garbage.len(), 1);
        assert_eq!(garbage[0].code, -1);
    }
}
