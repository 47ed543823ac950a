/* Transport layer: one byte-stream abstraction over serial ports, HID raw
 * nodes, TCP sockets, and an in-memory test device.
 *
 * A `Port` is shared by a framer and the polling loop. All reads and
 * writes go through a single async mutex, so within one port requests
 * and responses are strictly serialized. `reopen_with_backoff` replaces
 * the underlying handle in place; concurrent callers collapse into a
 * single reopen via a generation counter. */

use std::io::{Read as _, Write as _};
use std::str::FromStr;
use std::sync::atomic::{AtomicU8, AtomicU64, Ordering};
use std::time::Duration;

use nix::sys::termios::{self, BaudRate, ControlFlags, FlushArg, SetArg, SpecialCharacterIndices};
use thiserror::Error;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tokio_retry::strategy::ExponentialBackoff;
use tracing::{debug, warn};

/* Ceiling for the reopen backoff schedule. */
pub const MAX_BACKOFF_INTERVAL: Duration = Duration::from_secs(20);

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("error opening '{address}': {source}")]
    Open {
        address: String,
        #[source]
        source: std::io::Error,
    },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("short read: got {got}, want {want} bytes")]
    UnexpectedEof { got: usize, want: usize },

    #[error("invalid device type: {0}")]
    InvalidDeviceType(String),

    #[error("invalid parity: {0}")]
    InvalidParity(String),

    #[error("unsupported baud rate: {0}")]
    InvalidBaudRate(u32),

    #[error("can't open a test device")]
    TestDeviceOpen,

    #[error("port is closed")]
    Closed,

    #[error("port is reopening")]
    Reopening,
}

/* The kind of device behind a port. */
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceType {
    Test,
    Serial,
    HidRaw,
    Tcp,
}

impl FromStr for DeviceType {
    type Err = TransportError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "test" => Ok(DeviceType::Test),
            "serial" => Ok(DeviceType::Serial),
            "hidraw" => Ok(DeviceType::HidRaw),
            "tcp" => Ok(DeviceType::Tcp),
            _ => Err(TransportError::InvalidDeviceType(s.to_string())),
        }
    }
}

impl std::fmt::Display for DeviceType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            DeviceType::Test => "test",
            DeviceType::Serial => "serial",
            DeviceType::HidRaw => "hidraw",
            DeviceType::Tcp => "tcp",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Parity {
    None,
    Even,
    Odd,
}

impl FromStr for Parity {
    type Err = TransportError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "N" => Ok(Parity::None),
            "E" => Ok(Parity::Even),
            "O" => Ok(Parity::Odd),
            _ => Err(TransportError::InvalidParity(s.to_string())),
        }
    }
}

/* Address plus the settings used when opening it. Baud rate, data bits,
 * stop bits and parity only apply to serial devices. */
#[derive(Debug, Clone)]
pub struct PortOptions {
    pub address: String,
    pub device_type: DeviceType,
    pub baud_rate: u32,
    pub data_bits: u8,
    pub stop_bits: u8,
    pub parity: Parity,
}

impl PortOptions {
    pub fn new(address: impl Into<String>, device_type: DeviceType, baud_rate: u32) -> Self {
        PortOptions {
            address: address.into(),
            device_type,
            baud_rate,
            data_bits: 8,
            stop_bits: 1,
            parity: Parity::None,
        }
    }
}

enum PortIo {
    Serial(tokio::fs::File),
    HidRaw(tokio::fs::File),
    Tcp(TcpStream),
    Test {
        reader: std::io::Cursor<Vec<u8>>,
        writer: Vec<u8>,
    },
    Closed,
}

/* Lifecycle of a port: I/O errors degrade it, a reopen brings it back.
 * Reads and writes are rejected outright while a reopen is in flight;
 * `Closed` is terminal and only reached through an explicit `close`. */
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
enum PortState {
    Open = 0,
    Degraded = 1,
    Reopening = 2,
    Closed = 3,
}

impl PortState {
    fn from_u8(v: u8) -> PortState {
        match v {
            1 => PortState::Degraded,
            2 => PortState::Reopening,
            3 => PortState::Closed,
            _ => PortState::Open,
        }
    }
}

pub struct Port {
    opts: PortOptions,
    io: Mutex<PortIo>,
    state: AtomicU8,
    generation: AtomicU64,
}

impl Port {
    /* Open a device once, without retries. */
    pub async fn open(opts: PortOptions) -> Result<Port, TransportError> {
        let io = open_io(&opts).await?;
        Ok(Port::with_io(opts, io))
    }

    /* Keep trying to open a device with exponential backoff, giving up
     * once `max_elapsed` has passed (forever when `None`). */
    pub async fn open_with_backoff(
        opts: PortOptions,
        max_elapsed: Option<Duration>,
    ) -> Result<Port, TransportError> {
        let io = open_io_with_backoff(&opts, max_elapsed).await?;
        Ok(Port::with_io(opts, io))
    }

    /* An in-memory port for tests: reads come from `input`, writes are
     * captured and can be inspected with `written()`. */
    pub fn test(input: Vec<u8>, device_type: DeviceType) -> Port {
        let opts = PortOptions::new("<test>", device_type, 0);
        Port::with_io(
            opts,
            PortIo::Test {
                reader: std::io::Cursor::new(input),
                writer: Vec::new(),
            },
        )
    }

    fn with_io(opts: PortOptions, io: PortIo) -> Port {
        Port {
            opts,
            io: Mutex::new(io),
            state: AtomicU8::new(PortState::Open as u8),
            generation: AtomicU64::new(0),
        }
    }

    pub fn device_type(&self) -> DeviceType {
        self.opts.device_type
    }

    pub fn address(&self) -> &str {
        &self.opts.address
    }

    fn state(&self) -> PortState {
        PortState::from_u8(self.state.load(Ordering::Acquire))
    }

    /* Reject I/O up front instead of queueing behind an in-flight
     * reopen on the same mutex. */
    fn check_io_allowed(&self) -> Result<(), TransportError> {
        match self.state() {
            PortState::Reopening => Err(TransportError::Reopening),
            PortState::Closed => Err(TransportError::Closed),
            PortState::Open | PortState::Degraded => Ok(()),
        }
    }

    fn degrade(&self) {
        let _ = self.state.compare_exchange(
            PortState::Open as u8,
            PortState::Degraded as u8,
            Ordering::AcqRel,
            Ordering::Acquire,
        );
    }

    pub async fn read(&self, buf: &mut [u8]) -> Result<usize, TransportError> {
        self.check_io_allowed()?;
        let mut io = self.io.lock().await;
        let result = match &mut *io {
            PortIo::Serial(f) | PortIo::HidRaw(f) => f.read(buf).await.map_err(TransportError::from),
            PortIo::Tcp(s) => s.read(buf).await.map_err(TransportError::from),
            PortIo::Test { reader, .. } => std::io::Read::read(reader, buf).map_err(TransportError::from),
            PortIo::Closed => Err(TransportError::Closed),
        };
        if result.is_err() {
            self.degrade();
        }
        result
    }

    pub async fn write_all(&self, buf: &[u8]) -> Result<(), TransportError> {
        self.check_io_allowed()?;
        let mut io = self.io.lock().await;
        let result = match &mut *io {
            PortIo::Serial(f) | PortIo::HidRaw(f) => match f.write_all(buf).await {
                Ok(()) => f.flush().await.map_err(TransportError::from),
                Err(e) => Err(e.into()),
            },
            PortIo::Tcp(s) => s.write_all(buf).await.map_err(TransportError::from),
            PortIo::Test { writer, .. } => std::io::Write::write_all(writer, buf).map_err(TransportError::from),
            PortIo::Closed => Err(TransportError::Closed),
        };
        match result {
            Ok(()) => {
                debug!("TX {} bytes: {}", buf.len(), hex::encode(buf));
                Ok(())
            }
            Err(e) => {
                self.degrade();
                Err(e)
            }
        }
    }

    /* Read exactly `buf.len()` bytes. A clean EOF before the buffer is
     * full reports how many bytes actually arrived. */
    pub async fn read_exact(&self, buf: &mut [u8]) -> Result<(), TransportError> {
        let want = buf.len();
        let mut got = 0;
        while got < want {
            let n = self.read(&mut buf[got..]).await?;
            if n == 0 {
                return Err(TransportError::UnexpectedEof { got, want });
            }
            got += n;
        }
        debug!("RX {} bytes: {}", want, hex::encode(&buf[..want]));
        Ok(())
    }

    /* Close the current handle and retry opening until it succeeds.
     *
     * The port enters `Reopening` before the I/O lock is taken, so new
     * reads and writes fail fast instead of queueing behind the retry
     * loop. Callers of this method are still serialized on the mutex; a
     * caller that blocked while another reopen was in flight observes
     * the bumped generation and returns with the fresh handle instead
     * of opening again. */
    pub async fn reopen_with_backoff(&self) -> Result<(), TransportError> {
        if self.opts.device_type == DeviceType::Test {
            return Ok(());
        }
        let observed = self.generation.load(Ordering::Acquire);
        self.begin_reopen()?;
        let mut io = self.io.lock().await;
        if self.state() == PortState::Closed {
            return Err(TransportError::Closed);
        }
        if self.generation.load(Ordering::Acquire) != observed {
            /* Collapsed into the reopen that just finished. */
            self.state
                .store(PortState::Open as u8, Ordering::Release);
            return Ok(());
        }

        *io = PortIo::Closed;
        let start = std::time::Instant::now();
        let mut delays = ExponentialBackoff::from_millis(2)
            .factor(250)
            .max_delay(MAX_BACKOFF_INTERVAL);
        let new_io = loop {
            /* An explicit close aborts the retry loop. */
            if self.state() == PortState::Closed {
                return Err(TransportError::Closed);
            }
            match open_io(&self.opts).await {
                Ok(new_io) => break new_io,
                Err(err) => {
                    let delay = delays.next().unwrap_or(MAX_BACKOFF_INTERVAL);
                    warn!(
                        address = %self.opts.address,
                        error = %err,
                        elapsed = ?start.elapsed(),
                        "backing off after open error"
                    );
                    tokio::time::sleep(delay).await;
                }
            }
        };
        *io = new_io;
        self.generation.fetch_add(1, Ordering::AcqRel);
        self.state.store(PortState::Open as u8, Ordering::Release);
        Ok(())
    }

    /* Open/Degraded -> Reopening, refusing once closed. */
    fn begin_reopen(&self) -> Result<(), TransportError> {
        loop {
            let current = self.state();
            if current == PortState::Closed {
                return Err(TransportError::Closed);
            }
            if self
                .state
                .compare_exchange(
                    current as u8,
                    PortState::Reopening as u8,
                    Ordering::AcqRel,
                    Ordering::Acquire,
                )
                .is_ok()
            {
                return Ok(());
            }
        }
    }

    pub async fn close(&self) {
        /* Flag first so an in-flight reopen loop bails out instead of
         * holding the lock forever on a device that is gone. */
        self.state.store(PortState::Closed as u8, Ordering::Release);
        let mut io = self.io.lock().await;
        self.state.store(PortState::Closed as u8, Ordering::Release);
        *io = PortIo::Closed;
    }

    /* Bytes written so far to an in-memory test port. */
    pub async fn written(&self) -> Vec<u8> {
        let io = self.io.lock().await;
        match &*io {
            PortIo::Test { writer, .. } => writer.clone(),
            _ => Vec::new(),
        }
    }

    #[cfg(test)]
    pub(crate) fn generation(&self) -> u64 {
        self.generation.load(Ordering::Acquire)
    }
}

async fn open_io(opts: &PortOptions) -> Result<PortIo, TransportError> {
    match opts.device_type {
        DeviceType::Test => Err(TransportError::TestDeviceOpen),
        DeviceType::Serial => open_serial(opts),
        DeviceType::HidRaw => {
            debug!("opening file {}", opts.address);
            let file = tokio::fs::OpenOptions::new()
                .read(true)
                .write(true)
                .open(&opts.address)
                .await
                .map_err(|e| TransportError::Open {
                    address: opts.address.clone(),
                    source: e,
                })?;
            Ok(PortIo::HidRaw(file))
        }
        DeviceType::Tcp => {
            debug!("dialing TCP server {}", opts.address);
            let stream =
                TcpStream::connect(&opts.address)
                    .await
                    .map_err(|e| TransportError::Open {
                        address: opts.address.clone(),
                        source: e,
                    })?;
            Ok(PortIo::Tcp(stream))
        }
    }
}

fn open_serial(opts: &PortOptions) -> Result<PortIo, TransportError> {
    let file = std::fs::OpenOptions::new()
        .read(true)
        .write(true)
        .open(&opts.address)
        .map_err(|e| TransportError::Open {
            address: opts.address.clone(),
            source: e,
        })?;

    let mut tio = termios::tcgetattr(&file).map_err(|e| TransportError::Open {
        address: opts.address.clone(),
        source: std::io::Error::from(e),
    })?;
    termios::cfmakeraw(&mut tio);

    let rate = baud_rate_constant(opts.baud_rate)?;
    let _ = termios::cfsetispeed(&mut tio, rate);
    let _ = termios::cfsetospeed(&mut tio, rate);

    tio.control_flags.remove(ControlFlags::CSIZE);
    tio.control_flags.insert(match opts.data_bits {
        5 => ControlFlags::CS5,
        6 => ControlFlags::CS6,
        7 => ControlFlags::CS7,
        _ => ControlFlags::CS8,
    });
    if opts.stop_bits == 2 {
        tio.control_flags.insert(ControlFlags::CSTOPB);
    } else {
        tio.control_flags.remove(ControlFlags::CSTOPB);
    }
    match opts.parity {
        Parity::None => {
            tio.control_flags
                .remove(ControlFlags::PARENB | ControlFlags::PARODD);
        }
        Parity::Even => {
            tio.control_flags.insert(ControlFlags::PARENB);
            tio.control_flags.remove(ControlFlags::PARODD);
        }
        Parity::Odd => {
            tio.control_flags
                .insert(ControlFlags::PARENB | ControlFlags::PARODD);
        }
    }
    tio.control_flags
        .insert(ControlFlags::CREAD | ControlFlags::CLOCAL);

    /* Block each read until at least one byte arrives; timeouts are
     * enforced above the transport. */
    tio.control_chars[SpecialCharacterIndices::VMIN as usize] = 1;
    tio.control_chars[SpecialCharacterIndices::VTIME as usize] = 0;

    termios::tcsetattr(&file, SetArg::TCSANOW, &tio).map_err(|e| TransportError::Open {
        address: opts.address.clone(),
        source: std::io::Error::from(e),
    })?;
    /* Discard anything buffered from a previous session. */
    let _ = termios::tcflush(&file, FlushArg::TCIOFLUSH);

    Ok(PortIo::Serial(tokio::fs::File::from_std(file)))
}

fn baud_rate_constant(rate: u32) -> Result<BaudRate, TransportError> {
    match rate {
        1200 => Ok(BaudRate::B1200),
        2400 => Ok(BaudRate::B2400),
        4800 => Ok(BaudRate::B4800),
        9600 => Ok(BaudRate::B9600),
        19200 => Ok(BaudRate::B19200),
        38400 => Ok(BaudRate::B38400),
        57600 => Ok(BaudRate::B57600),
        115200 => Ok(BaudRate::B115200),
        230400 => Ok(BaudRate::B230400),
        _ => Err(TransportError::InvalidBaudRate(rate)),
    }
}

async fn open_io_with_backoff(
    opts: &PortOptions,
    max_elapsed: Option<Duration>,
) -> Result<PortIo, TransportError> {
    let start = std::time::Instant::now();
    let mut delays = ExponentialBackoff::from_millis(2)
        .factor(250)
        .max_delay(MAX_BACKOFF_INTERVAL);
    loop {
        match open_io(opts).await {
            Ok(io) => return Ok(io),
            Err(err) => {
                let elapsed = start.elapsed();
                if let Some(cap) = max_elapsed {
                    if elapsed >= cap {
                        return Err(err);
                    }
                }
                let delay = delays.next().unwrap_or(MAX_BACKOFF_INTERVAL);
                warn!(
                    address = %opts.address,
                    error = %err,
                    elapsed = ?elapsed,
                    "backing off after open error"
                );
                tokio::time::sleep(delay).await;
            }
        }
    }
}
