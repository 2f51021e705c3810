//! Device parameter definitions.

use bytes::{BufMut, Bytes, BytesMut};

use crate::error::{Error, Result};

/// Index of a parameter inside its [`DeviceModule`](crate::types::DeviceModule).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ParamId(pub usize);

/// Direction of data flow, seen from the device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Direction {
    /// Written to the device.
    Input,
    /// Read from the device.
    Output,
    /// Written or read depending on the request.
    Bidirectional,
}

/// Lifecycle of a parameter value.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub enum ParamStatus {
    /// Nothing pending.
    #[default]
    Idle,
    /// Changed locally, waiting to be written.
    Modified,
    /// Request sent, response outstanding.
    Transmitting,
    /// Response decoded into the value.
    Received,
    /// Value published to the variable store.
    Updated,
}

/// Encoded size of a parameter payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PayloadSize {
    /// Exactly this many bytes.
    Fixed(usize),
    /// Whatever remains of the response; only allowed for the last member.
    Variable,
}

impl PayloadSize {
    /// Returns the fixed byte count, if any.
    #[must_use]
    pub const fn fixed(self) -> Option<usize> {
        match self {
            Self::Fixed(n) => Some(n),
            Self::Variable => None,
        }
    }
}

/// Wire representation of a parameter value (little-endian).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ValueType {
    U8,
    I8,
    U16,
    I16,
    U32,
    I32,
    F32,
    F64,
    Bool,
    Bytes,
    Text,
}

impl ValueType {
    /// Natural width in bytes for numeric types.
    #[must_use]
    pub const fn natural_width(self) -> Option<usize> {
        match self {
            Self::U8 | Self::I8 | Self::Bool => Some(1),
            Self::U16 | Self::I16 => Some(2),
            Self::U32 | Self::I32 | Self::F32 => Some(4),
            Self::F64 => Some(8),
            Self::Bytes | Self::Text => None,
        }
    }

    /// Zero value of this type.
    #[must_use]
    pub fn default_value(self) -> ParamValue {
        match self {
            Self::U8 => ParamValue::U8(0),
            Self::I8 => ParamValue::I8(0),
            Self::U16 => ParamValue::U16(0),
            Self::I16 => ParamValue::I16(0),
            Self::U32 => ParamValue::U32(0),
            Self::I32 => ParamValue::I32(0),
            Self::F32 => ParamValue::F32(0.0),
            Self::F64 => ParamValue::F64(0.0),
            Self::Bool => ParamValue::Bool(false),
            Self::Bytes => ParamValue::Bytes(Bytes::new()),
            Self::Text => ParamValue::Text(String::new()),
        }
    }

    /// Parses a value of this type from its wire bytes.
    ///
    /// Numeric types require exactly their natural width.
    pub fn parse(self, data: &[u8]) -> Result<ParamValue> {
        if let Some(width) = self.natural_width() {
            if data.len() != width {
                return Err(Error::PayloadSizeMismatch {
                    expected: width,
                    actual: data.len(),
                });
            }
        }
        let value = match self {
            Self::U8 => ParamValue::U8(data[0]),
            Self::I8 => ParamValue::I8(i8::from_le_bytes([data[0]])),
            Self::U16 => ParamValue::U16(u16::from_le_bytes([data[0], data[1]])),
            Self::I16 => ParamValue::I16(i16::from_le_bytes([data[0], data[1]])),
            Self::U32 => ParamValue::U32(u32::from_le_bytes([data[0], data[1], data[2], data[3]])),
            Self::I32 => ParamValue::I32(i32::from_le_bytes([data[0], data[1], data[2], data[3]])),
            Self::F32 => ParamValue::F32(f32::from_le_bytes([data[0], data[1], data[2], data[3]])),
            Self::F64 => {
                let mut raw = [0u8; 8];
                raw.copy_from_slice(data);
                ParamValue::F64(f64::from_le_bytes(raw))
            }
            Self::Bool => ParamValue::Bool(data[0] != 0),
            Self::Bytes => ParamValue::Bytes(Bytes::copy_from_slice(data)),
            Self::Text => ParamValue::Text(std::str::from_utf8(data)?.to_owned()),
        };
        Ok(value)
    }
}

/// A parameter value.
#[derive(Debug, Clone, PartialEq)]
pub enum ParamValue {
    U8(u8),
    I8(i8),
    U16(u16),
    I16(i16),
    U32(u32),
    I32(i32),
    F32(f32),
    F64(f64),
    Bool(bool),
    Bytes(Bytes),
    Text(String),
}

impl ParamValue {
    /// Returns the type of this value.
    #[must_use]
    pub const fn value_type(&self) -> ValueType {
        match self {
            Self::U8(_) => ValueType::U8,
            Self::I8(_) => ValueType::I8,
            Self::U16(_) => ValueType::U16,
            Self::I16(_) => ValueType::I16,
            Self::U32(_) => ValueType::U32,
            Self::I32(_) => ValueType::I32,
            Self::F32(_) => ValueType::F32,
            Self::F64(_) => ValueType::F64,
            Self::Bool(_) => ValueType::Bool,
            Self::Bytes(_) => ValueType::Bytes,
            Self::Text(_) => ValueType::Text,
        }
    }

    /// Appends the wire bytes of this value.
    pub fn write_to(&self, buf: &mut BytesMut) {
        match self {
            Self::U8(v) => buf.put_u8(*v),
            Self::I8(v) => buf.put_i8(*v),
            Self::U16(v) => buf.put_u16_le(*v),
            Self::I16(v) => buf.put_i16_le(*v),
            Self::U32(v) => buf.put_u32_le(*v),
            Self::I32(v) => buf.put_i32_le(*v),
            Self::F32(v) => buf.put_f32_le(*v),
            Self::F64(v) => buf.put_f64_le(*v),
            Self::Bool(v) => buf.put_u8(u8::from(*v)),
            Self::Bytes(v) => buf.put_slice(v),
            Self::Text(v) => buf.put_slice(v.as_bytes()),
        }
    }

    /// Returns the wire bytes of this value.
    #[must_use]
    pub fn to_bytes(&self) -> Bytes {
        let mut buf = BytesMut::new();
        self.write_to(&mut buf);
        buf.freeze()
    }
}

/// Phases in which a parameter is exchanged automatically.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PhaseFlags {
    /// Exchanged while the device initializes.
    pub init: bool,
    /// Exchanged after every acquisition.
    pub post_acquisition: bool,
}

/// Definition and current state of one device parameter.
#[derive(Debug, Clone)]
pub struct ParamSpec {
    /// Unique name inside the module.
    pub name: String,
    /// Data flow direction.
    pub direction: Direction,
    /// Wire type of the value.
    pub value_type: ValueType,
    /// Command bytes identifying the wire command this parameter belongs to.
    pub command: Bytes,
    /// Position inside the command group.
    pub order: u16,
    /// Encoded size.
    pub size: PayloadSize,
    /// Payload sent instead of the value when reading.
    pub inquiry_value: Option<Bytes>,
    /// Phases this parameter takes part in.
    pub phases: PhaseFlags,
    /// Name under which the value is published to the variable store.
    pub variable: Option<String>,
    /// Current value.
    pub value: ParamValue,
    /// Current status.
    pub status: ParamStatus,
}

impl ParamSpec {
    /// Creates a parameter whose size is the natural width of its type.
    ///
    /// `Bytes` and `Text` parameters default to variable width.
    #[must_use]
    pub fn new(
        name: impl Into<String>,
        direction: Direction,
        value_type: ValueType,
        command: impl Into<Bytes>,
    ) -> Self {
        let size = value_type
            .natural_width()
            .map_or(PayloadSize::Variable, PayloadSize::Fixed);
        Self {
            name: name.into(),
            direction,
            value_type,
            command: command.into(),
            order: 0,
            size,
            inquiry_value: None,
            phases: PhaseFlags::default(),
            variable: None,
            value: value_type.default_value(),
            status: ParamStatus::Idle,
        }
    }

    /// Sets the position inside the command group.
    #[must_use]
    pub const fn order(mut self, order: u16) -> Self {
        self.order = order;
        self
    }

    /// Sets the encoded size.
    #[must_use]
    pub const fn size(mut self, size: PayloadSize) -> Self {
        self.size = size;
        self
    }

    /// Sets the inquiry payload.
    #[must_use]
    pub fn inquiry(mut self, value: impl Into<Bytes>) -> Self {
        self.inquiry_value = Some(value.into());
        self
    }

    /// Flags the parameter for the init phase.
    #[must_use]
    pub const fn on_init(mut self) -> Self {
        self.phases.init = true;
        self
    }

    /// Flags the parameter for the post-acquisition phase.
    #[must_use]
    pub const fn on_post_acquisition(mut self) -> Self {
        self.phases.post_acquisition = true;
        self
    }

    /// Maps the parameter to a variable-store name.
    #[must_use]
    pub fn variable(mut self, name: impl Into<String>) -> Self {
        self.variable = Some(name.into());
        self
    }

    /// Sets the initial value.
    #[must_use]
    pub fn initial(mut self, value: ParamValue) -> Self {
        self.value = value;
        self
    }

    /// Returns true if the parameter can be written to the device.
    #[must_use]
    pub const fn is_writable(&self) -> bool {
        matches!(self.direction, Direction::Input | Direction::Bidirectional)
    }

    /// Checks the definition for internal consistency.
    pub fn validate(&self) -> Result<()> {
        let invalid = |reason: String| Error::InvalidParam {
            name: self.name.clone(),
            reason,
        };
        if self.command.is_empty() {
            return Err(invalid("empty command".into()));
        }
        if self.value.value_type() != self.value_type {
            return Err(invalid(format!(
                "value {:?} does not match type {:?}",
                self.value, self.value_type
            )));
        }
        match (self.value_type.natural_width(), self.size) {
            (Some(_), PayloadSize::Variable) => {
                Err(invalid("numeric types need a fixed size".into()))
            }
            (Some(width), PayloadSize::Fixed(n)) if width != n => Err(invalid(format!(
                "declared {n} bytes but {:?} is {width} bytes",
                self.value_type
            ))),
            _ => Ok(()),
        }
    }

    /// Replaces the value, marking the parameter as modified when it changes.
    ///
    /// Returns true if the value changed.
    pub fn set_value(&mut self, value: ParamValue) -> Result<bool> {
        if value.value_type() != self.value_type {
            return Err(Error::InvalidParam {
                name: self.name.clone(),
                reason: format!("cannot assign {:?}", value.value_type()),
            });
        }
        if value == self.value {
            return Ok(false);
        }
        self.value = value;
        self.status = ParamStatus::Modified;
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_numeric_size_defaults_to_natural_width() {
        let p = ParamSpec::new("gain", Direction::Input, ValueType::U16, &b"G"[..]);
        assert_eq!(p.size, PayloadSize::Fixed(2));
        assert!(p.validate().is_ok());

        let t = ParamSpec::new("label", Direction::Output, ValueType::Text, &b"L"[..]);
        assert_eq!(t.size, PayloadSize::Variable);
    }

    #[test]
    fn test_validate_rejects_wrong_width() {
        let p = ParamSpec::new("gain", Direction::Input, ValueType::U16, &b"G"[..])
            .size(PayloadSize::Fixed(3));
        assert!(matches!(p.validate(), Err(Error::InvalidParam { .. })));
    }

    #[test]
    fn test_parse_little_endian() {
        assert_eq!(
            ValueType::U16.parse(&[0x34, 0x12]).unwrap(),
            ParamValue::U16(0x1234)
        );
        assert_eq!(
            ValueType::I32.parse(&(-5i32).to_le_bytes()).unwrap(),
            ParamValue::I32(-5)
        );
        assert!(matches!(
            ValueType::U32.parse(&[1, 2]),
            Err(Error::PayloadSizeMismatch {
                expected: 4,
                actual: 2
            })
        ));
    }

    #[test]
    fn test_parse_text_requires_utf8() {
        assert_eq!(
            ValueType::Text.parse(b"RDR-24").unwrap(),
            ParamValue::Text("RDR-24".into())
        );
        assert!(matches!(
            ValueType::Text.parse(&[b'R', 0xff, 0xfe]),
            Err(Error::InvalidText(_))
        ));
    }

    #[test]
    fn test_set_value_tracks_modification() {
        let mut p = ParamSpec::new("gain", Direction::Input, ValueType::U8, &b"G"[..]);
        assert!(!p.set_value(ParamValue::U8(0)).unwrap());
        assert_eq!(p.status, ParamStatus::Idle);
        assert!(p.set_value(ParamValue::U8(7)).unwrap());
        assert_eq!(p.status, ParamStatus::Modified);
        assert!(p.set_value(ParamValue::Bool(true)).is_err());
    }
}
