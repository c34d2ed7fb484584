//! PicoQuant MultiHarp in histogramming mode, driven through the vendor `MHLib` shared
//! library.
//!
//! The library is loaded at runtime, so the crate builds without the vendor SDK installed.
//! All calls are blocking and must stay on one thread; [`MultiHarp`] is moved into the
//! sweep worker and never shared.

use std::ffi::{c_char, c_double, c_int, c_uint, CStr};
use std::path::Path;
use std::thread;
use std::time::{Duration, Instant};

use libloading::Library;
use log::{debug, info, warn};

use super::settings::MultiHarpSettings;
use crate::error::ScanError;
use crate::interface::{Histogram, HistogramCounter};

const MODE_HIST: c_int = 0;
const REFSRC_INTERNAL: c_int = 0;
const ACQ_TIME_MAX_MS: u128 = 360_000_000;
/// Extra time allowed on top of the integration window before giving up
const ACQ_GRACE: Duration = Duration::from_secs(5);
const POLL_INTERVAL: Duration = Duration::from_millis(10);

type FnGetLibraryVersion = unsafe extern "C" fn(*mut c_char) -> c_int;
type FnGetErrorString = unsafe extern "C" fn(*mut c_char, c_int) -> c_int;
type FnOpenDevice = unsafe extern "C" fn(c_int, *mut c_char) -> c_int;
type FnDevice = unsafe extern "C" fn(c_int) -> c_int;
type FnInitialize = unsafe extern "C" fn(c_int, c_int, c_int) -> c_int;
type FnGetInt = unsafe extern "C" fn(c_int, *mut c_int) -> c_int;
type FnSetInt = unsafe extern "C" fn(c_int, c_int) -> c_int;
type FnSetTrigger = unsafe extern "C" fn(c_int, c_int, c_int) -> c_int;
type FnSetInputTrigger = unsafe extern "C" fn(c_int, c_int, c_int, c_int) -> c_int;
type FnSetHistoLen = unsafe extern "C" fn(c_int, c_int, *mut c_int) -> c_int;
type FnGetResolution = unsafe extern "C" fn(c_int, *mut c_double) -> c_int;
type FnGetHistogram = unsafe extern "C" fn(c_int, *mut c_uint, c_int) -> c_int;

/// Resolved `MHLib` entry points. The library handle outlives every pointer.
struct MhLib {
    _library: Library,
    get_library_version: FnGetLibraryVersion,
    get_error_string: FnGetErrorString,
    open_device: FnOpenDevice,
    close_device: FnDevice,
    initialize: FnInitialize,
    get_num_input_channels: FnGetInt,
    set_sync_div: FnSetInt,
    set_sync_edge_trg: FnSetTrigger,
    set_input_edge_trg: FnSetInputTrigger,
    set_histo_len: FnSetHistoLen,
    set_binning: FnSetInt,
    set_offset: FnSetInt,
    get_resolution: FnGetResolution,
    clear_hist_mem: FnDevice,
    start_meas: FnSetInt,
    stop_meas: FnDevice,
    ctc_status: FnGetInt,
    get_histogram: FnGetHistogram,
}

fn resolve<T: Copy>(library: &Library, name: &str) -> Result<T, ScanError> {
    // SAFETY: the symbol types above follow the MHLib C header.
    unsafe {
        library
            .get::<T>(name.as_bytes())
            .map(|symbol| *symbol)
            .map_err(|e| {
                ScanError::Configuration(format!("MHLib symbol {name} not found: {e}"))
            })
    }
}

impl MhLib {
    fn load(path: &Path) -> Result<Self, ScanError> {
        // SAFETY: loading the vendor library runs its initializers; the path comes from
        // the operator's settings file.
        let library = unsafe { Library::new(path) }.map_err(|e| {
            ScanError::Configuration(format!("cannot load {}: {e}", path.display()))
        })?;
        info!("Loaded MHLib from {}", path.display());

        Ok(Self {
            get_library_version: resolve(&library, "MH_GetLibraryVersion")?,
            get_error_string: resolve(&library, "MH_GetErrorString")?,
            open_device: resolve(&library, "MH_OpenDevice")?,
            close_device: resolve(&library, "MH_CloseDevice")?,
            initialize: resolve(&library, "MH_Initialize")?,
            get_num_input_channels: resolve(&library, "MH_GetNumOfInputChannels")?,
            set_sync_div: resolve(&library, "MH_SetSyncDiv")?,
            set_sync_edge_trg: resolve(&library, "MH_SetSyncEdgeTrg")?,
            set_input_edge_trg: resolve(&library, "MH_SetInputEdgeTrg")?,
            set_histo_len: resolve(&library, "MH_SetHistoLen")?,
            set_binning: resolve(&library, "MH_SetBinning")?,
            set_offset: resolve(&library, "MH_SetOffset")?,
            get_resolution: resolve(&library, "MH_GetResolution")?,
            clear_hist_mem: resolve(&library, "MH_ClearHistMem")?,
            start_meas: resolve(&library, "MH_StartMeas")?,
            stop_meas: resolve(&library, "MH_StopMeas")?,
            ctc_status: resolve(&library, "MH_CTCStatus")?,
            get_histogram: resolve(&library, "MH_GetHistogram")?,
            _library: library,
        })
    }

    fn error_text(&self, code: c_int) -> String {
        let mut buf = [0 as c_char; 64];
        // SAFETY: MHLib writes at most 40 characters plus terminator.
        let ok = unsafe { (self.get_error_string)(buf.as_mut_ptr(), code) } >= 0;
        if ok {
            // SAFETY: buffer is NUL-terminated by the library and zero-initialized.
            unsafe { CStr::from_ptr(buf.as_ptr()) }
                .to_string_lossy()
                .into_owned()
        } else {
            format!("error code {code}")
        }
    }

    fn check(&self, call: &str, code: c_int) -> Result<(), ScanError> {
        if code < 0 {
            Err(ScanError::DeviceCommunication(format!(
                "{call} failed: {}",
                self.error_text(code)
            )))
        } else {
            Ok(())
        }
    }

    fn version(&self) -> String {
        let mut buf = [0 as c_char; 16];
        // SAFETY: the version string is at most 8 characters.
        if unsafe { (self.get_library_version)(buf.as_mut_ptr()) } < 0 {
            return "unknown".to_string();
        }
        // SAFETY: zero-initialized buffer, NUL-terminated by the library.
        unsafe { CStr::from_ptr(buf.as_ptr()) }
            .to_string_lossy()
            .into_owned()
    }
}

/// An open MultiHarp configured for histogramming
pub struct MultiHarp {
    lib: MhLib,
    device: c_int,
    /// 0-based input channel
    channel: c_int,
    resolution_ps: f64,
    histogram_len: usize,
    serial: String,
    closed: bool,
}

impl MultiHarp {
    /// Load the library, open the device and apply `settings`.
    ///
    /// The device is closed again if any configuration step fails.
    pub fn open(settings: &MultiHarpSettings) -> Result<Self, ScanError> {
        settings.validate()?;
        let lib = MhLib::load(&settings.library_path)?;
        info!("MHLib version {}", lib.version());

        let device = settings.device_index;
        let mut serial = [0 as c_char; 16];
        // SAFETY: serial buffer exceeds the 8 characters MHLib writes.
        lib.check("MH_OpenDevice", unsafe {
            (lib.open_device)(device, serial.as_mut_ptr())
        })?;
        // SAFETY: zero-initialized, NUL-terminated by the library.
        let serial = unsafe { CStr::from_ptr(serial.as_ptr()) }
            .to_string_lossy()
            .into_owned();

        let mut harp = Self {
            lib,
            device,
            channel: settings.channel - 1,
            resolution_ps: 0.0,
            histogram_len: 0,
            serial,
            closed: false,
        };
        // Dropping `harp` on error closes the device
        harp.configure(settings)?;
        info!(
            "MultiHarp {} ready: channel {}, {} bins of {} ps",
            harp.serial, settings.channel, harp.histogram_len, harp.resolution_ps
        );
        Ok(harp)
    }

    fn configure(&mut self, settings: &MultiHarpSettings) -> Result<(), ScanError> {
        let lib = &self.lib;
        let dev = self.device;
        let edge = c_int::from(settings.rising_edge);

        // SAFETY: every call passes the open device index and valid out-pointers.
        unsafe {
            lib.check("MH_Initialize", (lib.initialize)(dev, MODE_HIST, REFSRC_INTERNAL))?;

            let mut inputs: c_int = 0;
            lib.check(
                "MH_GetNumOfInputChannels",
                (lib.get_num_input_channels)(dev, &mut inputs),
            )?;
            if self.channel >= inputs {
                return Err(ScanError::Configuration(format!(
                    "channel {} requested but device has {inputs} inputs",
                    settings.channel
                )));
            }

            lib.check("MH_SetSyncDiv", (lib.set_sync_div)(dev, settings.sync_divider))?;
            lib.check(
                "MH_SetSyncEdgeTrg",
                (lib.set_sync_edge_trg)(dev, settings.sync_trigger_mv, edge),
            )?;
            for input in 0..inputs {
                lib.check(
                    "MH_SetInputEdgeTrg",
                    (lib.set_input_edge_trg)(dev, input, settings.input_trigger_mv, edge),
                )?;
            }

            let mut actual_len: c_int = 0;
            lib.check(
                "MH_SetHistoLen",
                (lib.set_histo_len)(dev, settings.histogram_length_code, &mut actual_len),
            )?;
            lib.check("MH_SetBinning", (lib.set_binning)(dev, settings.binning))?;
            lib.check("MH_SetOffset", (lib.set_offset)(dev, settings.offset_ns))?;

            let mut resolution: c_double = 0.0;
            lib.check(
                "MH_GetResolution",
                (lib.get_resolution)(dev, &mut resolution),
            )?;

            self.histogram_len = usize::try_from(actual_len).map_err(|_| {
                ScanError::DeviceCommunication(format!("invalid histogram length {actual_len}"))
            })?;
            self.resolution_ps = resolution;
        }
        Ok(())
    }

    pub fn serial(&self) -> &str {
        &self.serial
    }

    pub fn resolution_ps(&self) -> f64 {
        self.resolution_ps
    }

    /// Close the device. Called on drop if not called explicitly.
    pub fn close(&mut self) -> Result<(), ScanError> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;
        // SAFETY: device index was opened by `open`.
        let code = unsafe { (self.lib.close_device)(self.device) };
        info!("MultiHarp {} closed", self.serial);
        self.lib.check("MH_CloseDevice", code)
    }

    fn wait_for_completion(&self, deadline: Instant) -> Result<(), ScanError> {
        loop {
            let mut status: c_int = 0;
            // SAFETY: valid out-pointer and open device.
            self.lib.check("MH_CTCStatus", unsafe {
                (self.lib.ctc_status)(self.device, &mut status)
            })?;
            if status != 0 {
                return Ok(());
            }
            if Instant::now() > deadline {
                return Err(ScanError::DeviceCommunication(
                    "histogram acquisition timed out".into(),
                ));
            }
            thread::sleep(POLL_INTERVAL);
        }
    }
}

impl HistogramCounter for MultiHarp {
    fn acquire_histogram(&mut self, integration: Duration) -> Result<Histogram, ScanError> {
        let tacq = integration.as_millis();
        if tacq == 0 || tacq > ACQ_TIME_MAX_MS {
            return Err(ScanError::InvalidParameter(format!(
                "integration time must be 1 ms to {ACQ_TIME_MAX_MS} ms, got {tacq} ms"
            )));
        }
        debug!("Acquiring histogram for {tacq} ms");

        let lib = &self.lib;
        // SAFETY: open device; tacq was range-checked above.
        unsafe {
            lib.check("MH_ClearHistMem", (lib.clear_hist_mem)(self.device))?;
            lib.check("MH_StartMeas", (lib.start_meas)(self.device, tacq as c_int))?;
        }

        let waited = self.wait_for_completion(Instant::now() + integration + ACQ_GRACE);
        // SAFETY: stopping an idle measurement is allowed.
        let stopped = lib.check("MH_StopMeas", unsafe { (lib.stop_meas)(self.device) });
        waited?;
        stopped?;

        let mut counts = vec![0 as c_uint; self.histogram_len];
        // SAFETY: buffer holds the histogram length reported by MH_SetHistoLen.
        lib.check("MH_GetHistogram", unsafe {
            (lib.get_histogram)(self.device, counts.as_mut_ptr(), self.channel)
        })?;

        let bins = (0..counts.len())
            .map(|i| i as f64 * self.resolution_ps)
            .collect();
        Histogram::new(bins, counts)
    }
}

impl Drop for MultiHarp {
    fn drop(&mut self) {
        if let Err(e) = self.close() {
            warn!("MultiHarp close on drop failed: {e}");
        }
    }
}
