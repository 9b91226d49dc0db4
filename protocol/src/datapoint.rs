//! Typed datapoints and the registry caching their last known values.
//!
//! A datapoint is a single piece of device state addressed by an 8-bit ID,
//! e.g. the lock state or the battery level. The MCU reports datapoints as a
//! sequence of entries, each laid out as follows:
//!
//! | Offset   | Field                        |
//! |----------|------------------------------|
//! | 0        | datapoint ID                 |
//! | 1        | [`DatapointType`]            |
//! | 2..4     | value length (big-endian)    |
//! | 4..4+len | value                        |
//!
//! The same layout is used when the module writes a datapoint.

use alloc::{
    boxed::Box,
    string::{String, ToString},
    vec::Vec,
};
use core::fmt::{Display, Formatter};
use log::{debug, trace, warn};
use strum::FromRepr;

/// Length of the entry header preceding every datapoint value.
pub const ENTRY_HEADER_LEN: usize = 4;

/// Longest value that fits into a single frame together with its entry header.
pub const MAX_VALUE_LEN: usize = u16::MAX as usize - ENTRY_HEADER_LEN;

/// A specialized [`Result`] type for datapoint operations.
pub type Result<T> = core::result::Result<T, Error>;

/// Error type for datapoint parsing and writing.
///
/// This enum is marked `#[non_exhaustive]` to allow for future variants.
#[non_exhaustive]
#[derive(PartialEq, Eq, Debug)]
pub enum Error {
    /// The declared value length exceeds the remaining report.
    Truncated {
        /// Datapoint ID.
        id: u8,
        /// Declared value length.
        len: usize,
        /// Number of bytes left in the report.
        available: usize,
    },
    /// The value length is invalid for the datapoint type.
    InvalidLength {
        /// Datapoint ID.
        id: u8,
        /// Datapoint type.
        kind: DatapointType,
        /// Declared value length.
        len: usize,
    },
    /// The datapoint type tag is unknown.
    UnknownType {
        /// Datapoint ID.
        id: u8,
        /// Raw type tag.
        tag: u8,
    },
    /// A write does not match the type of the cached datapoint.
    TypeMismatch {
        /// Datapoint ID.
        id: u8,
        /// Type of the cached datapoint.
        expected: DatapointType,
        /// Type of the written value.
        actual: DatapointType,
    },
    /// A bitmask width other than 1, 2 or 4 bytes was requested.
    InvalidWidth(u8),
    /// The value does not fit into a single frame.
    TooLong {
        /// Datapoint ID.
        id: u8,
        /// Value length.
        len: usize,
    },
}

impl Display for Error {
    fn fmt(&self, f: &mut Formatter) -> core::fmt::Result {
        match self {
            Self::Truncated { id, len, available } => {
                write!(f, "datapoint {id} is truncated ({len} > {available})")
            }
            Self::InvalidLength { id, kind, len } => {
                write!(f, "datapoint {id} has bad {kind} length {len}")
            }
            Self::UnknownType { id, tag } => {
                write!(f, "datapoint {id} has unknown type {tag:#04x}")
            }
            Self::TypeMismatch {
                id,
                expected,
                actual,
            } => write!(f, "datapoint {id} is {expected}, not {actual}"),
            Self::InvalidWidth(width) => write!(f, "invalid bitmask width {width}"),
            Self::TooLong { id, len } => write!(f, "datapoint {id} is too long ({len} bytes)"),
        }
    }
}

impl core::error::Error for Error {}

/// Datapoint type tag.
#[derive(FromRepr, strum::Display, PartialEq, Eq, Copy, Clone, Debug)]
#[strum(serialize_all = "lowercase")]
#[repr(u8)]
pub enum DatapointType {
    /// Raw bytes of arbitrary length.
    Raw = 0x00,
    /// Boolean, 1 byte.
    Boolean = 0x01,
    /// 32-bit integer, 4 bytes.
    Integer = 0x02,
    /// UTF-8 string of arbitrary length.
    String = 0x03,
    /// Enumeration, 1 byte.
    Enum = 0x04,
    /// Bitmask, 1, 2 or 4 bytes.
    Bitmask = 0x05,
}

/// The value of a datapoint.
///
/// The variant always matches the [`DatapointType`] returned by [`DatapointValue::kind`].
#[derive(PartialEq, Eq, Clone, Debug)]
pub enum DatapointValue {
    /// Raw bytes.
    Raw(Vec<u8>),
    /// Boolean value.
    Boolean(bool),
    /// 32-bit integer, stored unsigned. See [`DatapointValue::as_i32`] for the signed view.
    Integer(u32),
    /// String value.
    ///
    /// Invalid UTF-8 sequences received from the MCU are replaced with
    /// `U+FFFD`, so the cached string may differ from the bytes on the wire.
    /// [`Datapoint::len`] keeps the length declared on the wire.
    String(String),
    /// Enumeration value.
    Enum(u8),
    /// Bitmask value, zero-extended to 32 bits.
    Bitmask(u32),
}

impl DatapointValue {
    /// Returns the type tag matching this value.
    #[must_use]
    pub const fn kind(&self) -> DatapointType {
        match self {
            Self::Raw(_) => DatapointType::Raw,
            Self::Boolean(_) => DatapointType::Boolean,
            Self::Integer(_) => DatapointType::Integer,
            Self::String(_) => DatapointType::String,
            Self::Enum(_) => DatapointType::Enum,
            Self::Bitmask(_) => DatapointType::Bitmask,
        }
    }

    /// Returns the boolean value, if this is a boolean datapoint.
    #[must_use]
    pub const fn as_bool(&self) -> Option<bool> {
        match self {
            Self::Boolean(val) => Some(*val),
            _ => None,
        }
    }

    /// Returns the unsigned value of an integer or bitmask datapoint.
    #[must_use]
    pub const fn as_u32(&self) -> Option<u32> {
        match self {
            Self::Integer(val) | Self::Bitmask(val) => Some(*val),
            _ => None,
        }
    }

    /// Returns the signed value of an integer datapoint.
    #[must_use]
    pub const fn as_i32(&self) -> Option<i32> {
        match self {
            Self::Integer(val) => Some(i32::from_be_bytes(val.to_be_bytes())),
            _ => None,
        }
    }

    /// Returns the enumeration value, if this is an enum datapoint.
    #[must_use]
    pub const fn as_enum(&self) -> Option<u8> {
        match self {
            Self::Enum(val) => Some(*val),
            _ => None,
        }
    }

    /// Returns the string value, if this is a string datapoint.
    #[must_use]
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::String(val) => Some(val),
            _ => None,
        }
    }

    /// Returns the raw bytes, if this is a raw datapoint.
    #[must_use]
    pub fn as_bytes(&self) -> Option<&[u8]> {
        match self {
            Self::Raw(val) => Some(val),
            _ => None,
        }
    }
}

impl Display for DatapointValue {
    fn fmt(&self, f: &mut Formatter) -> core::fmt::Result {
        match self {
            Self::Raw(val) => write!(f, "{val:02x?}"),
            Self::Boolean(val) => write!(f, "{}", if *val { "ON" } else { "OFF" }),
            Self::Integer(_) => write!(f, "{}", self.as_i32().unwrap_or_default()),
            Self::String(val) => write!(f, "{val:?}"),
            Self::Enum(val) => write!(f, "{val}"),
            Self::Bitmask(val) => write!(f, "{val:#010x}"),
        }
    }
}

impl From<bool> for DatapointValue {
    fn from(val: bool) -> Self {
        Self::Boolean(val)
    }
}

impl From<u32> for DatapointValue {
    fn from(val: u32) -> Self {
        Self::Integer(val)
    }
}

impl From<i32> for DatapointValue {
    fn from(val: i32) -> Self {
        Self::Integer(u32::from_be_bytes(val.to_be_bytes()))
    }
}

impl From<&str> for DatapointValue {
    fn from(val: &str) -> Self {
        Self::String(val.to_string())
    }
}

impl From<String> for DatapointValue {
    fn from(val: String) -> Self {
        Self::String(val)
    }
}

impl From<Vec<u8>> for DatapointValue {
    fn from(val: Vec<u8>) -> Self {
        Self::Raw(val)
    }
}

/// A datapoint together with its last known value.
#[derive(PartialEq, Eq, Clone, Debug)]
pub struct Datapoint {
    /// Datapoint ID.
    pub id: u8,
    /// Current value.
    pub value: DatapointValue,
    /// Value length as declared on the wire.
    pub len: usize,
}

impl Datapoint {
    /// Returns the type tag of the datapoint.
    #[must_use]
    pub const fn kind(&self) -> DatapointType {
        self.value.kind()
    }
}

/// Parses a single entry from the front of a report.
///
/// Returns the datapoint and the number of bytes consumed.
pub fn parse_entry(buf: &[u8]) -> Result<(Datapoint, usize)> {
    let [id, tag, len_hi, len_lo, ..] = *buf else {
        return Err(Error::Truncated {
            id: buf.first().copied().unwrap_or_default(),
            len: ENTRY_HEADER_LEN,
            available: buf.len(),
        });
    };
    let len = usize::from(u16::from_be_bytes([len_hi, len_lo]));
    let data = &buf[ENTRY_HEADER_LEN..];

    if len > data.len() {
        return Err(Error::Truncated {
            id,
            len,
            available: data.len(),
        });
    }

    let kind = DatapointType::from_repr(tag).ok_or(Error::UnknownType { id, tag })?;
    let value = decode_value(id, kind, &data[..len])?;

    Ok((Datapoint { id, value, len }, ENTRY_HEADER_LEN + len))
}

/// Decodes a datapoint value of the given type.
pub fn decode_value(id: u8, kind: DatapointType, data: &[u8]) -> Result<DatapointValue> {
    let invalid = || Error::InvalidLength {
        id,
        kind,
        len: data.len(),
    };

    let value = match (kind, data) {
        (DatapointType::Raw, _) => DatapointValue::Raw(data.to_vec()),
        (DatapointType::Boolean, &[val]) => DatapointValue::Boolean(val != 0),
        (DatapointType::Integer, &[a, b, c, d]) => {
            DatapointValue::Integer(u32::from_be_bytes([a, b, c, d]))
        }
        (DatapointType::String, _) => {
            DatapointValue::String(String::from_utf8_lossy(data).into_owned())
        }
        (DatapointType::Enum, &[val]) => DatapointValue::Enum(val),
        (DatapointType::Bitmask, &[a]) => DatapointValue::Bitmask(u32::from(a)),
        (DatapointType::Bitmask, &[a, b]) => {
            DatapointValue::Bitmask(u32::from(u16::from_be_bytes([a, b])))
        }
        (DatapointType::Bitmask, &[a, b, c, d]) => {
            DatapointValue::Bitmask(u32::from_be_bytes([a, b, c, d]))
        }
        _ => return Err(invalid()),
    };

    Ok(value)
}

/// Serializes a datapoint value for transmission.
///
/// Booleans and enums take 1 byte and integers 4 bytes, big-endian.
/// Bitmasks are truncated to `width` bytes, which is ignored for all other types.
///
/// # Errors
///
/// - [`Error::InvalidWidth`] if a bitmask width other than 1, 2 or 4 is requested.
pub fn encode_value(value: &DatapointValue, width: u8) -> Result<Vec<u8>> {
    let data = match value {
        DatapointValue::Raw(val) => val.clone(),
        DatapointValue::Boolean(val) => Vec::from([u8::from(*val)]),
        DatapointValue::Integer(val) => val.to_be_bytes().to_vec(),
        DatapointValue::String(val) => val.as_bytes().to_vec(),
        DatapointValue::Enum(val) => Vec::from([*val]),
        DatapointValue::Bitmask(val) => match width {
            1 | 2 | 4 => val.to_be_bytes()[4 - usize::from(width)..].to_vec(),
            _ => return Err(Error::InvalidWidth(width)),
        },
    };

    Ok(data)
}

/// Serializes a complete datapoint entry.
#[must_use]
pub fn encode_entry(id: u8, kind: DatapointType, data: &[u8]) -> Vec<u8> {
    let len = data.len().min(usize::from(u16::MAX));
    let mut buf = Vec::with_capacity(ENTRY_HEADER_LEN + len);

    buf.extend_from_slice(&[id, kind as u8]);
    buf.extend_from_slice(&(len as u16).to_be_bytes());
    buf.extend_from_slice(&data[..len]);

    buf
}

/// Callback invoked with a datapoint whenever its value changes.
pub type Listener = Box<dyn FnMut(&Datapoint)>;

/// Cache of the last known datapoint values.
///
/// Listeners registered for an ID are invoked synchronously,
/// in registration order, whenever that datapoint is updated.
#[derive(Default)]
pub struct Registry {
    datapoints: Vec<Datapoint>,
    listeners: Vec<(u8, Listener)>,
    ignored: Vec<u8>,
}

impl Registry {
    /// Constructs an empty registry.
    ///
    /// Reports for datapoints in `ignored` are parsed but never applied.
    #[must_use]
    pub fn new(ignored: impl Into<Vec<u8>>) -> Self {
        Self {
            ignored: ignored.into(),
            ..Self::default()
        }
    }

    /// Returns the cached datapoint with the given ID.
    #[must_use]
    pub fn get(&self, id: u8) -> Option<&Datapoint> {
        self.datapoints.iter().find(|dp| dp.id == id)
    }

    /// Returns an iterator over all cached datapoints, in order of first report.
    pub fn iter(&self) -> impl Iterator<Item = &Datapoint> {
        self.datapoints.iter()
    }

    /// Returns the number of cached datapoints.
    #[must_use]
    pub fn len(&self) -> usize {
        self.datapoints.len()
    }

    /// Returns whether no datapoint has been reported yet.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.datapoints.is_empty()
    }

    /// Registers a listener for a datapoint ID.
    ///
    /// If the datapoint already has a value, the listener is invoked immediately.
    pub fn register_listener(&mut self, id: u8, listener: impl FnMut(&Datapoint) + 'static) {
        let mut listener: Listener = Box::new(listener);

        if let Some(dp) = self.get(id) {
            listener(dp);
        }

        self.listeners.push((id, listener));
    }

    /// Applies all entries of a datapoint report.
    ///
    /// Returns the number of datapoints that were updated.
    /// Parsing stops at the first malformed entry, because its length
    /// can no longer be trusted to find the next one. Entries before it
    /// remain applied.
    pub fn handle_report(&mut self, buf: &[u8]) -> Result<usize> {
        let mut rest = buf;
        let mut updated = 0;

        while rest.len() >= ENTRY_HEADER_LEN {
            let (dp, used) = parse_entry(rest)?;

            rest = &rest[used..];

            if self.ignored.contains(&dp.id) {
                trace!("Datapoint {} is ignored, dropping MCU update", dp.id);

                continue;
            }

            debug!("Datapoint {} update to {}", dp.id, dp.value);
            self.update(dp);
            updated += 1;
        }

        Ok(updated)
    }

    /// Checks whether a write of `value` to datapoint `id` should be transmitted.
    ///
    /// Writes to unknown datapoints are allowed. Unless `force` is set,
    /// writing the currently cached value is suppressed and `Ok(false)` is returned.
    ///
    /// # Errors
    ///
    /// - [`Error::TypeMismatch`] if the cached datapoint has a different type.
    pub fn check_write(&self, id: u8, value: &DatapointValue, force: bool) -> Result<bool> {
        let Some(dp) = self.get(id) else {
            warn!("Setting unknown datapoint {id}");

            return Ok(true);
        };

        if dp.kind() != value.kind() {
            return Err(Error::TypeMismatch {
                id,
                expected: dp.kind(),
                actual: value.kind(),
            });
        }

        if !force && dp.value == *value {
            trace!("Not sending unchanged value of datapoint {id}");

            return Ok(false);
        }

        Ok(true)
    }

    /// Stores a datapoint and notifies its listeners.
    pub fn update(&mut self, dp: Datapoint) {
        let idx = match self.datapoints.iter().position(|other| other.id == dp.id) {
            Some(idx) => {
                self.datapoints[idx] = dp;

                idx
            }
            None => {
                self.datapoints.push(dp);

                self.datapoints.len() - 1
            }
        };
        let dp = &self.datapoints[idx];

        for (id, listener) in &mut self.listeners {
            if *id == dp.id {
                listener(dp);
            }
        }
    }

    /// Overwrites the value of an already known datapoint after a local write.
    ///
    /// Unknown datapoints are left alone; they are created by MCU reports only.
    pub fn update_local(&mut self, id: u8, value: DatapointValue, len: usize) {
        if self.get(id).is_some() {
            self.update(Datapoint { id, value, len });
        }
    }
}

impl core::fmt::Debug for Registry {
    fn fmt(&self, f: &mut Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Registry")
            .field("datapoints", &self.datapoints)
            .field("listeners", &self.listeners.len())
            .field("ignored", &self.ignored)
            .finish()
    }
}
