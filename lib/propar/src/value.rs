use crate::support::{ProtocolError, ProtocolResult, SizedRead, SizedWrite};
use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};

/// Maximal on-wire footprint of a string value (length byte, characters and
/// the terminator).
pub const MAX_STRING_WIRE: usize = 61;

/// Parameter types understood by the instruments. The wire distinguishes only
/// four width classes (the upper bits of the parameter index byte); the
/// concrete interpretation comes from the parameter database.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
pub enum ParameterType {
    Int8,
    Int16,
    SInt16,
    BSInt16,
    Int32,
    Float,
    String,
}

impl ParameterType {
    /// The type bits carried in the upper part of the parameter index byte.
    #[inline]
    pub fn type_bits(self) -> u8 {
        match self {
            ParameterType::Int8 => 0x00,
            ParameterType::Int16 | ParameterType::SInt16 | ParameterType::BSInt16 => 0x20,
            ParameterType::Int32 | ParameterType::Float => 0x40,
            ParameterType::String => 0x60,
        }
    }

    /// The canonical type for a width class, used when nothing better is
    /// known about the parameter.
    #[inline]
    pub fn from_type_bits(bits: u8) -> ParameterType {
        match bits & 0x60 {
            0x00 => ParameterType::Int8,
            0x20 => ParameterType::Int16,
            0x40 => ParameterType::Int32,
            _ => ParameterType::String,
        }
    }
}

/// A single typed parameter value.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Int8(i8),
    Int16(u16),
    SInt16(i16),
    BSInt16(i16),
    Int32(u32),
    Float(f32),
    String(String),
}

impl Value {
    #[inline]
    pub fn parameter_type(&self) -> ParameterType {
        match self {
            Value::Int8(_) => ParameterType::Int8,
            Value::Int16(_) => ParameterType::Int16,
            Value::SInt16(_) => ParameterType::SInt16,
            Value::BSInt16(_) => ParameterType::BSInt16,
            Value::Int32(_) => ParameterType::Int32,
            Value::Float(_) => ParameterType::Float,
            Value::String(_) => ParameterType::String,
        }
    }

    /// Numeric view of the value, if it has one.
    #[inline]
    pub fn as_f32(&self) -> Option<f32> {
        match self {
            Value::Int8(v) => Some(f32::from(*v)),
            Value::Int16(v) => Some(f32::from(*v)),
            Value::SInt16(v) | Value::BSInt16(v) => Some(f32::from(*v)),
            Value::Int32(v) => Some(*v as f32),
            Value::Float(v) => Some(*v),
            Value::String(_) => None,
        }
    }

    #[inline]
    pub fn as_u16(&self) -> Option<u16> {
        match self {
            Value::Int16(v) => Some(*v),
            Value::Int8(v) if *v >= 0 => Some(*v as u16),
            _ => None,
        }
    }

    #[inline]
    pub fn as_i8(&self) -> Option<i8> {
        match self {
            Value::Int8(v) => Some(*v),
            _ => None,
        }
    }

    #[inline]
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::String(v) => Some(v),
            _ => None,
        }
    }

    /// Number of bytes this value occupies on the wire.
    #[inline]
    pub fn wire_size(&self) -> usize {
        match self {
            Value::Int8(_) => 1,
            Value::Int16(_) | Value::SInt16(_) | Value::BSInt16(_) => 2,
            Value::Int32(_) | Value::Float(_) => 4,
            Value::String(text) => text.len() + 2,
        }
    }

    /// Serialize the value in wire order. Strings go out as a length byte,
    /// the characters and a terminating NUL; anything that would exceed the
    /// wire cap is refused upfront.
    pub fn write<W: SizedWrite>(&self, stream: &mut W) -> ProtocolResult<()> {
        if stream.free_capacity() < self.wire_size() {
            return Err(ProtocolError::ValueTooLarge);
        }

        match self {
            Value::Int8(v) => stream.write_i8(*v)?,
            Value::Int16(v) => stream.write_u16::<BigEndian>(*v)?,
            Value::SInt16(v) | Value::BSInt16(v) => stream.write_i16::<BigEndian>(*v)?,
            Value::Int32(v) => stream.write_u32::<BigEndian>(*v)?,
            Value::Float(v) => stream.write_f32::<BigEndian>(*v)?,
            Value::String(text) => {
                if text.len() + 2 > MAX_STRING_WIRE || !text.is_ascii() {
                    return Err(ProtocolError::ValueTooLarge);
                }
                stream.write_u8(text.len() as u8)?;
                stream.write_all(text.as_bytes())?;
                stream.write_u8(0)?;
            }
        }

        Ok(())
    }

    /// Deserialize one value of the given concrete type. A source that runs
    /// out of bytes mid value reports `TruncatedValue`.
    pub fn read<R: SizedRead>(stream: &mut R, parm_type: ParameterType) -> ProtocolResult<Value> {
        let fixed_size = match parm_type {
            ParameterType::Int8 => 1,
            ParameterType::Int16 | ParameterType::SInt16 | ParameterType::BSInt16 => 2,
            ParameterType::Int32 | ParameterType::Float => 4,
            ParameterType::String => 0,
        };

        if stream.remaining_data() < fixed_size.max(1) {
            return Err(ProtocolError::TruncatedValue);
        }

        let value = match parm_type {
            ParameterType::Int8 => Value::Int8(stream.read_i8()?),
            ParameterType::Int16 => Value::Int16(stream.read_u16::<BigEndian>()?),
            ParameterType::SInt16 => Value::SInt16(stream.read_i16::<BigEndian>()?),
            ParameterType::BSInt16 => Value::BSInt16(stream.read_i16::<BigEndian>()?),
            ParameterType::Int32 => Value::Int32(stream.read_u32::<BigEndian>()?),
            ParameterType::Float => Value::Float(stream.read_f32::<BigEndian>()?),
            ParameterType::String => return Self::read_string(stream),
        };

        Ok(value)
    }

    fn read_string<R: SizedRead>(stream: &mut R) -> ProtocolResult<Value> {
        let declared = stream.read_u8()? as usize;

        let raw = if declared > 0 {
            // Length prefixed: the declared characters plus the terminator.
            if stream.remaining_data() < declared + 1 {
                return Err(ProtocolError::TruncatedValue);
            }

            let mut raw = vec![0u8; declared];
            stream.read_exact(&mut raw)?;

            if stream.read_u8()? != 0 {
                return Err(ProtocolError::MalformedMessage);
            }

            raw
        } else {
            // Unprefixed: scan to the terminator.
            let mut raw = Vec::new();

            loop {
                if stream.remaining_data() == 0 {
                    return Err(ProtocolError::TruncatedValue);
                }

                match stream.read_u8()? {
                    0 => break,
                    byte => raw.push(byte),
                }
            }

            raw
        };

        let text = String::from_utf8(raw).map_err(|_| ProtocolError::MalformedMessage)?;

        if !text.is_ascii() {
            return Err(ProtocolError::MalformedMessage);
        }

        Ok(Value::String(text))
    }
}
