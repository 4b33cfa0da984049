//! Protocol-buffer wire format for expiration metadata.
//!
//! ```text
//! message ExpirationMetaData {
//!   optional SecondsNanos timeout = 1;           // absent: 30 minutes
//!   optional SecondsNanos last_access_time = 2;  // absent: Unix epoch
//! }
//! message SecondsNanos {
//!   sint64 seconds = 1;
//!   uint32 nanos = 2;
//! }
//! ```
//!
//! An infinite timeout is written as seconds `-1`. Unknown fields are skipped
//! so that newer writers stay readable.

use crate::error::MarshalError;
use crate::expiration::metadata::ExpirationMetaData;
use crate::expiration::DEFAULT_TIMEOUT;
use protobuf::wire_format::WireType;
use protobuf::{CodedInputStream, CodedOutputStream};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

const TIMEOUT_FIELD: u32 = 1;
const LAST_ACCESS_TIME_FIELD: u32 = 2;
const SECONDS_FIELD: u32 = 1;
const NANOS_FIELD: u32 = 2;

const NANOS_PER_SECOND: u32 = 1_000_000_000;
const INFINITE_SECONDS: i64 = -1;

/// A type with a protobuf-compatible encoding.
pub trait ProtoMarshaller: Sized {
    /// Write the fields of `self`.
    fn write_to(&self, writer: &mut ProtoWriter<'_>) -> Result<(), MarshalError>;

    /// Read a value, starting from defaults and overwriting present fields.
    fn read_from(reader: &mut ProtoReader<'_>) -> Result<Self, MarshalError>;

    /// Encode to bytes.
    fn to_bytes(&self) -> Result<Vec<u8>, MarshalError> {
        let mut buf = Vec::new();
        {
            let mut writer = ProtoWriter::new(&mut buf);
            self.write_to(&mut writer)?;
            writer.flush()?;
        }
        Ok(buf)
    }

    /// Decode from bytes.
    fn from_bytes(bytes: &[u8]) -> Result<Self, MarshalError> {
        let mut reader = ProtoReader::new(bytes);
        Self::read_from(&mut reader)
    }
}

/// Thin field writer over `CodedOutputStream`.
pub struct ProtoWriter<'a> {
    stream: CodedOutputStream<'a>,
}

impl<'a> ProtoWriter<'a> {
    /// Write into `buf`.
    pub fn new(buf: &'a mut Vec<u8>) -> Self {
        Self {
            stream: CodedOutputStream::vec(buf),
        }
    }

    /// Write a zigzag-encoded signed field.
    pub fn write_sint64(&mut self, field: u32, value: i64) -> Result<(), MarshalError> {
        Ok(self.stream.write_sint64(field, value)?)
    }

    /// Write an unsigned varint field.
    pub fn write_uint32(&mut self, field: u32, value: u32) -> Result<(), MarshalError> {
        Ok(self.stream.write_uint32(field, value)?)
    }

    /// Write a nested message as a length-delimited field.
    pub fn write_message<M: ProtoMarshaller>(&mut self, field: u32, message: &M) -> Result<(), MarshalError> {
        let nested = message.to_bytes()?;
        Ok(self.stream.write_bytes(field, &nested)?)
    }

    /// Flush buffered output.
    pub fn flush(&mut self) -> Result<(), MarshalError> {
        Ok(self.stream.flush()?)
    }
}

/// Thin field reader over `CodedInputStream`.
pub struct ProtoReader<'a> {
    stream: CodedInputStream<'a>,
}

impl<'a> ProtoReader<'a> {
    /// Read from `bytes`.
    pub fn new(bytes: &'a [u8]) -> Self {
        Self {
            stream: CodedInputStream::from_bytes(bytes),
        }
    }

    /// The next field's number and wire type, or None at end of input.
    pub fn read_field(&mut self) -> Result<Option<(u32, WireType)>, MarshalError> {
        if self.stream.eof()? {
            return Ok(None);
        }
        Ok(Some(self.stream.read_tag_unpack()?))
    }

    /// Read a zigzag-encoded signed value.
    pub fn read_sint64(&mut self) -> Result<i64, MarshalError> {
        Ok(self.stream.read_sint64()?)
    }

    /// Read an unsigned varint value.
    pub fn read_uint32(&mut self) -> Result<u32, MarshalError> {
        Ok(self.stream.read_uint32()?)
    }

    /// Read a length-delimited nested message.
    pub fn read_message<M: ProtoMarshaller>(&mut self) -> Result<M, MarshalError> {
        let nested = self.stream.read_bytes()?;
        M::from_bytes(&nested)
    }

    /// Skip the value of a field we do not know.
    pub fn skip(&mut self, wire_type: WireType) -> Result<(), MarshalError> {
        Ok(self.stream.skip_field(wire_type)?)
    }
}

/// `{ seconds, nanos }` pair shared by durations and instants.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
struct SecondsNanos {
    seconds: i64,
    nanos: u32,
}

impl SecondsNanos {
    fn from_timeout(timeout: Option<Duration>) -> Result<Self, MarshalError> {
        match timeout {
            None => Ok(Self {
                seconds: INFINITE_SECONDS,
                nanos: 0,
            }),
            Some(timeout) => Ok(Self {
                seconds: i64::try_from(timeout.as_secs()).map_err(|_| MarshalError::OutOfRange {
                    field: TIMEOUT_FIELD,
                    reason: "timeout seconds exceed i64".to_string(),
                })?,
                nanos: timeout.subsec_nanos(),
            }),
        }
    }

    fn into_timeout(self) -> Result<Option<Duration>, MarshalError> {
        if self.seconds == INFINITE_SECONDS && self.nanos == 0 {
            return Ok(None);
        }
        if self.seconds < 0 {
            return Err(MarshalError::OutOfRange {
                field: TIMEOUT_FIELD,
                reason: format!("negative timeout of {} seconds", self.seconds),
            });
        }
        Ok(Some(Duration::new(self.seconds as u64, self.nanos)))
    }

    /// Instants before the epoch use negative seconds and positive nanos,
    /// as protobuf's well-known Timestamp does.
    fn from_instant(instant: SystemTime) -> Result<Self, MarshalError> {
        let out_of_range = || MarshalError::OutOfRange {
            field: LAST_ACCESS_TIME_FIELD,
            reason: "instant seconds exceed i64".to_string(),
        };

        match instant.duration_since(UNIX_EPOCH) {
            Ok(since) => Ok(Self {
                seconds: i64::try_from(since.as_secs()).map_err(|_| out_of_range())?,
                nanos: since.subsec_nanos(),
            }),
            Err(e) => {
                let before = e.duration();
                let mut seconds = -i64::try_from(before.as_secs()).map_err(|_| out_of_range())?;
                let mut nanos = before.subsec_nanos();
                if nanos > 0 {
                    seconds -= 1;
                    nanos = NANOS_PER_SECOND - nanos;
                }
                Ok(Self { seconds, nanos })
            }
        }
    }

    fn into_instant(self) -> Result<SystemTime, MarshalError> {
        let out_of_range = || MarshalError::OutOfRange {
            field: LAST_ACCESS_TIME_FIELD,
            reason: format!("instant {}s {}ns not representable", self.seconds, self.nanos),
        };

        let instant = if self.seconds >= 0 {
            UNIX_EPOCH.checked_add(Duration::new(self.seconds as u64, self.nanos))
        } else {
            UNIX_EPOCH
                .checked_sub(Duration::from_secs(self.seconds.unsigned_abs()))
                .and_then(|t| t.checked_add(Duration::from_nanos(self.nanos as u64)))
        };
        instant.ok_or_else(out_of_range)
    }
}

impl ProtoMarshaller for SecondsNanos {
    fn write_to(&self, writer: &mut ProtoWriter<'_>) -> Result<(), MarshalError> {
        if self.seconds != 0 {
            writer.write_sint64(SECONDS_FIELD, self.seconds)?;
        }
        if self.nanos != 0 {
            writer.write_uint32(NANOS_FIELD, self.nanos)?;
        }
        Ok(())
    }

    fn read_from(reader: &mut ProtoReader<'_>) -> Result<Self, MarshalError> {
        let mut value = Self::default();
        while let Some((field, wire_type)) = reader.read_field()? {
            match (field, wire_type) {
                (SECONDS_FIELD, WireType::WireTypeVarint) => value.seconds = reader.read_sint64()?,
                (NANOS_FIELD, WireType::WireTypeVarint) => value.nanos = reader.read_uint32()?,
                (_, wire_type) => reader.skip(wire_type)?,
            }
        }

        if value.nanos >= NANOS_PER_SECOND {
            return Err(MarshalError::OutOfRange {
                field: NANOS_FIELD,
                reason: format!("{} nanos is not below one second", value.nanos),
            });
        }
        Ok(value)
    }
}

impl ProtoMarshaller for ExpirationMetaData {
    fn write_to(&self, writer: &mut ProtoWriter<'_>) -> Result<(), MarshalError> {
        if self.timeout() != Some(DEFAULT_TIMEOUT) {
            writer.write_message(TIMEOUT_FIELD, &SecondsNanos::from_timeout(self.timeout())?)?;
        }
        if self.last_access_time() != UNIX_EPOCH {
            writer.write_message(
                LAST_ACCESS_TIME_FIELD,
                &SecondsNanos::from_instant(self.last_access_time())?,
            )?;
        }
        Ok(())
    }

    fn read_from(reader: &mut ProtoReader<'_>) -> Result<Self, MarshalError> {
        let mut metadata = ExpirationMetaData::default();
        while let Some((field, wire_type)) = reader.read_field()? {
            match (field, wire_type) {
                (TIMEOUT_FIELD, WireType::WireTypeLengthDelimited) => {
                    let timeout = reader.read_message::<SecondsNanos>()?.into_timeout()?;
                    metadata = metadata.with_timeout(timeout);
                }
                (LAST_ACCESS_TIME_FIELD, WireType::WireTypeLengthDelimited) => {
                    let instant = reader.read_message::<SecondsNanos>()?.into_instant()?;
                    metadata = metadata.touched(instant);
                }
                (_, wire_type) => reader.skip(wire_type)?,
            }
        }
        Ok(metadata)
    }
}
