//! Drive the MCU of Tuya-based smart door locks via their serial protocol.
//!
//! # Overview
//!
//! The `tuya-lock` crate implements the module side of the Tuya MCU serial protocol,
//! as spoken by the Wi-Fi module sitting next to the lock's main controller.
//! It keeps the MCU initialized, mirrors its datapoints, answers its time
//! and network queries, and verifies offline dynamic passwords.
//!
//! Depending on your needs, you can:
//!
//! - Drive a serial port through the asynchronous [`Link`].
//! - Feed bytes into the sans-I/O [`engine::Engine`] yourself,
//!   e.g. from an interrupt handler or a custom event loop.
//! - Use the building blocks directly: [`frame`] for the wire format,
//!   [`datapoint`] for the typed state entries and [`otp`] for dynamic passwords.
//!
//! # Getting started
//!
//! The MCU exposes a UART that has to be configured as follows:
//!
//! - **Baud rate:** 9600
//! - **Parity:** None
//! - **Data bits:** 8
//! - **Stop bits:** 1
//!
//! If you enable the `native-serial` feature, you can obtain a compatible
//! serial port instance using [`serial::open`]:
//!
//! ```ignore
//! let mut port = tuya_lock::serial::open("/dev/ttyUSB0", 9600)?;
//! ```
//!
//! # Examples
//!
//! ## Running the engine without I/O
//!
//! The [`engine::Engine`] never touches a port. Received bytes go in,
//! frames to transmit come out:
//!
//! ```
//! use tuya_lock::engine::{Config, Engine};
//!
//! let mut engine = Engine::new(Config::default());
//!
//! engine.register_listener(1, |dp| println!("Datapoint 1 is now {}", dp.value));
//! engine.setup();
//!
//! // Product information query
//! assert_eq!(engine.take_transmit(), [0x55, 0xaa, 0x00, 0x01, 0x00, 0x00, 0x00]);
//!
//! engine.handle_bytes(&[0x55, 0xaa, 0x03, 0x01, 0x00, 0x02, b'{', b'}', 0xfd], 20);
//!
//! assert_eq!(engine.product(), "{}");
//! ```
//!
//! ## Driving a serial port with [`Link`]
//!
//! ```no_run
//! use tuya_lock::{
//!     embedded_io_async::{Read, Write},
//!     engine::{Config, Engine},
//! };
//!
//! # async fn example<P: Read + Write>(port: P) -> tuya_lock::Result<(), P::Error> {
//! let mut link = tuya_lock::Link::new(port, Engine::new(Config::default()));
//!
//! link.engine_mut().setup();
//!
//! loop {
//!     # let now = 0;
//!     link.receive(now).await?;
//!     link.tick(now).await?;
//! }
//! # }
//! # fn main() {}
//! ```
//!
//! # Protocol details
//!
//! Every frame starts with the header `55 aa`, followed by a version byte,
//! a command byte, a big-endian payload length, the payload itself and
//! a checksum summing up all preceding bytes.
//!
//! Only a single command is in flight at any time. Commands are spaced at least
//! 10 ms apart and only the product information query waits for a response.
//! Until the MCU answered that query, it is retried up to 5 times.

#![no_std]
#![warn(missing_docs)]
#![cfg_attr(docsrs, feature(doc_cfg))]

extern crate alloc;

pub mod base32;
pub mod datapoint;
pub mod engine;
pub mod frame;
pub mod otp;
pub mod scheduler;
pub mod time;

#[cfg(feature = "native-serial")]
#[cfg_attr(docsrs, doc(cfg(feature = "native-serial")))]
pub mod serial;

pub use embedded_io_async;

use core::fmt::{Debug, Display, Formatter};
use embedded_io_async::{Read, Write};
use engine::Engine;
use log::trace;

/// Size of the buffer used for reading from the port.
const READ_CHUNK_SIZE: usize = 64;

/// A specialized [`Result`] type for [`Link`] operations.
///
/// Uses [`Error<E>`] as the error variant, which can include port-specific errors.
pub type Result<T, E> = core::result::Result<T, Error<E>>;

/// Error type for [`Link`] operations.
///
/// The generic parameter `E` allows the error type to carry a port-specific error.
///
/// Protocol-level problems such as corrupted frames are not errors,
/// the engine logs and discards them.
///
/// This enum is marked `#[non_exhaustive]` to allow for future variants.
#[non_exhaustive]
#[derive(PartialEq, Eq, Debug)]
pub enum Error<E> {
    /// The port encountered an unexpected end-of-file.
    UnexpectedEof,
    /// A port-specific input/output error.
    Io(E),
}

impl<E: core::error::Error> Display for Error<E> {
    fn fmt(&self, f: &mut Formatter) -> core::fmt::Result {
        match self {
            Self::UnexpectedEof => write!(f, "unexpected end-of-file"),
            Self::Io(err) => write!(f, "input/output error: {err}"),
        }
    }
}

impl<E: core::error::Error> core::error::Error for Error<E> {}

impl<E> From<E> for Error<E> {
    fn from(err: E) -> Self {
        Self::Io(err)
    }
}

/// Connects an [`Engine`] to a port.
///
/// The link does not keep time on its own. Every call takes the current
/// value of a monotonic millisecond clock, which is forwarded to the engine.
///
/// # Examples
///
/// ```no_run
/// use tuya_lock::{
///     embedded_io_async::{Read, Write},
///     engine::{Config, Engine},
/// };
///
/// # async fn example<P: Read + Write>(port: P) -> tuya_lock::Result<(), P::Error> {
/// let mut link = tuya_lock::Link::new(port, Engine::new(Config::default()));
///
/// link.engine_mut().setup();
/// link.tick(0).await?;
/// # Ok(())
/// # }
/// # fn main() {}
/// ```
pub struct Link<P> {
    port: P,
    engine: Engine,
}

impl<P: Read + Write> Link<P> {
    /// Constructs a new link.
    pub fn new(port: P, engine: Engine) -> Self {
        Self { port, engine }
    }

    /// Returns the engine.
    pub fn engine(&self) -> &Engine {
        &self.engine
    }

    /// Returns the engine for configuration or writing datapoints.
    ///
    /// Frames queued through it are transmitted by the next
    /// [`Link::tick`], [`Link::receive`] or [`Link::flush`].
    pub fn engine_mut(&mut self) -> &mut Engine {
        &mut self.engine
    }

    /// Waits for data from the port and feeds it into the engine.
    ///
    /// Frames the engine produced in response are only written by the next
    /// [`Link::tick`] or [`Link::flush`], so the returned future can be
    /// dropped safely, e.g. when racing it against a timer.
    pub async fn receive(&mut self, now: u64) -> Result<(), P::Error> {
        let mut buf = [0x00; READ_CHUNK_SIZE];
        let len = self.port.read(&mut buf).await?;

        if len == 0 {
            return Err(Error::UnexpectedEof);
        }

        trace!("Read from port: {:02x?}", &buf[..len]);
        self.engine.handle_bytes(&buf[..len], now);

        Ok(())
    }

    /// Runs the engine's scheduling pass and writes any pending frames.
    pub async fn tick(&mut self, now: u64) -> Result<(), P::Error> {
        self.engine.tick(now);

        self.flush().await
    }

    /// Writes all frames the engine has ready to the port.
    pub async fn flush(&mut self) -> Result<(), P::Error> {
        let data = self.engine.take_transmit();

        if data.is_empty() {
            return Ok(());
        }

        trace!("Write to port: {data:02x?}");
        self.port.write_all(&data).await?;
        self.port.flush().await?;

        Ok(())
    }

    /// Consumes the link, returning the port and the engine.
    pub fn into_parts(self) -> (P, Engine) {
        (self.port, self.engine)
    }
}

impl<P> Debug for Link<P> {
    fn fmt(&self, f: &mut Formatter) -> core::fmt::Result {
        f.debug_struct("Link")
            .field("init_state", &self.engine.init_state())
            .finish_non_exhaustive()
    }
}
